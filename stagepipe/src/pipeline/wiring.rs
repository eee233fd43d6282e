//! Channel wiring between consecutive stages.

use super::spec::{StageId, StageSource};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};

/// Number of handoffs that can wait on a link before senders queue up.
///
/// A handoff waiting in the slot has not been delivered yet: `send` only
/// completes once a receiver has taken the item.
pub const LINK_CAPACITY: usize = 1;

/// Where a stage sits in the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StagePosition {
    /// The producer. Also used for a single-stage pipeline.
    Root,
    /// Consumes from upstream and forwards downstream.
    Middle,
    /// Consumes from upstream; its output is discarded.
    Terminal,
}

impl StagePosition {
    /// Returns the position of stage `index` in a chain of `len` stages.
    #[must_use]
    pub const fn of(index: usize, len: usize) -> Self {
        if index == 0 {
            Self::Root
        } else if index + 1 == len {
            Self::Terminal
        } else {
            Self::Middle
        }
    }
}

impl fmt::Display for StagePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Root => write!(f, "root"),
            Self::Middle => write!(f, "middle"),
            Self::Terminal => write!(f, "terminal"),
        }
    }
}

/// Why an item did not reach the downstream stage.
#[derive(Debug, PartialEq, Eq)]
pub enum HandoffError<T> {
    /// No receiver is left; the item is returned.
    Closed(T),
    /// The item was accepted into the slot but dropped before any receiver
    /// took it.
    Dropped,
}

impl<T> fmt::Display for HandoffError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed(_) => write!(f, "link closed"),
            Self::Dropped => write!(f, "item dropped before delivery"),
        }
    }
}

struct Handoff<T> {
    item: T,
    receipt: oneshot::Sender<()>,
}

/// A rendezvous shared by two consecutive stages.
///
/// Every instance of the upstream stage sends through the same sender and
/// every instance of the downstream stage receives through the same
/// receiver. A send completes only when a downstream instance has taken
/// the item, so an upstream stage never runs ahead of its consumer.
pub struct StageLink<T> {
    sender: mpsc::Sender<Handoff<T>>,
    receiver: Mutex<mpsc::Receiver<Handoff<T>>>,
    from: String,
    to: String,
}

impl<T> StageLink<T> {
    fn new(from: &str, to: &str) -> Self {
        let (sender, receiver) = mpsc::channel(LINK_CAPACITY);
        Self {
            sender,
            receiver: Mutex::new(receiver),
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Hands an item to the downstream stage.
    ///
    /// Waits until a receiver has taken the item. Dropping the future while
    /// it waits for the taker leaves the item in the slot.
    ///
    /// # Errors
    ///
    /// Returns [`HandoffError::Closed`] with the item if the link is closed,
    /// [`HandoffError::Dropped`] if the item was discarded undelivered.
    pub async fn send(&self, item: T) -> Result<(), HandoffError<T>> {
        let (receipt, taken) = oneshot::channel();
        self.sender
            .send(Handoff { item, receipt })
            .await
            .map_err(|err| HandoffError::Closed(err.0.item))?;
        taken.await.map_err(|_| HandoffError::Dropped)
    }

    /// Takes the next item and releases its sender.
    ///
    /// Cancel-safe: dropping the future never loses an item.
    pub async fn recv(&self) -> Option<T> {
        let handoff = self.receiver.lock().await.recv().await?;
        let _ = handoff.receipt.send(());
        Some(handoff.item)
    }

    /// Name of the sending stage.
    #[must_use]
    pub fn upstream_name(&self) -> &str {
        &self.from
    }

    /// Name of the receiving stage.
    #[must_use]
    pub fn downstream_name(&self) -> &str {
        &self.to
    }
}

impl<T> fmt::Debug for StageLink<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageLink")
            .field("from", &self.from)
            .field("to", &self.to)
            .field("closed", &self.sender.is_closed())
            .finish()
    }
}

/// A stage after its chain position and links have been resolved.
#[derive(Debug)]
pub struct LinkedStage<T: Send + 'static> {
    pub(crate) id: StageId,
    pub(crate) name: String,
    pub(crate) index: usize,
    pub(crate) position: StagePosition,
    pub(crate) concurrency: usize,
    pub(crate) restart: usize,
    pub(crate) source: Option<StageSource<T>>,
    pub(crate) inbound: Option<Arc<StageLink<T>>>,
    pub(crate) outbound: Option<Arc<StageLink<T>>>,
}

impl<T: Send + 'static> LinkedStage<T> {
    /// Returns the stage identifier.
    #[must_use]
    pub const fn id(&self) -> StageId {
        self.id
    }

    /// Returns the display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the chain index.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Returns the chain position.
    #[must_use]
    pub const fn position(&self) -> StagePosition {
        self.position
    }

    /// Returns the resolved instance count.
    #[must_use]
    pub const fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Returns the resolved restart bound.
    #[must_use]
    pub const fn restart(&self) -> usize {
        self.restart
    }

    /// Returns the inbound link (absent for the root).
    #[must_use]
    pub fn inbound(&self) -> Option<&Arc<StageLink<T>>> {
        self.inbound.as_ref()
    }

    /// Returns the outbound link (absent for the terminal stage).
    #[must_use]
    pub fn outbound(&self) -> Option<&Arc<StageLink<T>>> {
        self.outbound.as_ref()
    }
}

/// Attaches links to an ordered chain.
///
/// Stage `i`'s outbound link is the same object as stage `i + 1`'s inbound
/// link. Returns the number of links created (`len - 1`).
pub fn wire<T: Send + 'static>(stages: &mut [LinkedStage<T>]) -> usize {
    let len = stages.len();
    for (index, stage) in stages.iter_mut().enumerate() {
        stage.position = StagePosition::of(index, len);
        stage.inbound = None;
        stage.outbound = None;
    }

    let mut links = 0;
    for index in 1..len {
        let (head, tail) = stages.split_at_mut(index);
        let upstream = &mut head[index - 1];
        let downstream = &mut tail[0];

        let link = Arc::new(StageLink::new(&upstream.name, &downstream.name));
        upstream.outbound = Some(Arc::clone(&link));
        downstream.inbound = Some(link);
        links += 1;
    }
    links
}
