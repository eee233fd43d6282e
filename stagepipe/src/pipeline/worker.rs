//! Per-instance execution loops.
//!
//! Every stage instance runs one loop whose shape depends on the stage's
//! position: the producer polls its transform, every other stage waits on
//! its inbound link. All shapes exit the same way: on a stop request they
//! run the instance's cleanup and acknowledge.

use super::wiring::{HandoffError, LinkedStage, StageLink, StagePosition};
use crate::config::PipelineConfig;
use crate::errors::StageError;
use crate::stages::{Item, Stage};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, info, warn};

/// Asks one instance to stop; acknowledged once cleanup has run.
#[derive(Debug)]
pub(crate) struct StopRequest {
    ack: oneshot::Sender<()>,
}

impl StopRequest {
    pub(crate) fn new() -> (Self, oneshot::Receiver<()>) {
        let (ack, done) = oneshot::channel();
        (Self { ack }, done)
    }

    fn acknowledge(self) {
        let _ = self.ack.send(());
    }
}

/// Published by a producer that returned the quit signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuitNotice {
    /// Name of the producer stage.
    pub stage: String,
    /// Instance index of the producer.
    pub instance: usize,
}

/// Counts consecutive no-data results and decides when to back off.
#[derive(Debug, Clone)]
pub(crate) struct NoDataThrottle {
    threshold: usize,
    count: usize,
}

impl NoDataThrottle {
    pub(crate) fn new(threshold: usize) -> Self {
        Self {
            threshold: threshold.max(1),
            count: 0,
        }
    }

    /// Records one no-data result. Returns true when the caller should
    /// back off; the counter restarts from zero.
    pub(crate) fn record(&mut self) -> bool {
        self.count += 1;
        if self.count >= self.threshold {
            self.count = 0;
            true
        } else {
            false
        }
    }

    pub(crate) const fn count(&self) -> usize {
        self.count
    }
}

/// State owned by an instance across restarts of its loop.
struct InstanceState<T: Send + 'static> {
    stage: Box<dyn Stage<T>>,
    stop: mpsc::Receiver<StopRequest>,
}

enum Flow {
    Continue,
    Stop(Option<StopRequest>),
}

/// One stage instance and everything its loop needs.
pub(crate) struct Worker<T: Item> {
    stage_name: String,
    instance: usize,
    position: StagePosition,
    inbound: Option<Arc<StageLink<T>>>,
    outbound: Option<Arc<StageLink<T>>>,
    quit: mpsc::UnboundedSender<QuitNotice>,
    no_data_threshold: usize,
    no_data_sleep: Duration,
    state: Mutex<InstanceState<T>>,
}

impl<T: Item> Worker<T> {
    pub(crate) fn new(
        linked: &LinkedStage<T>,
        instance: usize,
        stage: Box<dyn Stage<T>>,
        stop: mpsc::Receiver<StopRequest>,
        quit: mpsc::UnboundedSender<QuitNotice>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            stage_name: linked.name.clone(),
            instance,
            position: linked.position,
            inbound: linked.inbound.clone(),
            outbound: linked.outbound.clone(),
            quit,
            no_data_threshold: config.no_data_threshold,
            no_data_sleep: config.no_data_sleep(),
            state: Mutex::new(InstanceState { stage, stop }),
        }
    }

    /// Name used for supervision and logs, e.g. `parse#2`.
    pub(crate) fn unit_name(&self) -> String {
        format!("{}#{}", self.stage_name, self.instance)
    }

    /// Runs the loop until a stop request arrives.
    ///
    /// A panic inside a transform unwinds out of here; the supervisor calls
    /// `run` again and the loop resumes with the same stage instance.
    pub(crate) async fn run(self: Arc<Self>) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        debug!(
            stage = %self.stage_name,
            instance = self.instance,
            position = %self.position,
            "stage instance running"
        );

        let request = match self.position {
            StagePosition::Root => self.produce(state).await,
            StagePosition::Middle | StagePosition::Terminal => self.consume(state).await,
        };

        self.shut_down(state.stage.as_mut(), request).await;
    }

    async fn produce(&self, state: &mut InstanceState<T>) -> Option<StopRequest> {
        let mut throttle = NoDataThrottle::new(self.no_data_threshold);

        loop {
            match state.stop.try_recv() {
                Ok(request) => return Some(request),
                Err(TryRecvError::Disconnected) => return None,
                Err(TryRecvError::Empty) => {}
            }

            // A producer that never emits must not starve other tasks.
            tokio::task::yield_now().await;

            match state.stage.transform(None).await {
                Ok(Some(item)) => {
                    if let Flow::Stop(request) = self.forward(&mut state.stop, item).await {
                        return request;
                    }
                }
                Ok(None) => {}
                Err(StageError::NoData) => {
                    if throttle.record() {
                        debug!(
                            stage = %self.stage_name,
                            instance = self.instance,
                            sleep_ms = u64::try_from(self.no_data_sleep.as_millis()).unwrap_or(u64::MAX),
                            "no data, backing off"
                        );
                        tokio::select! {
                            biased;
                            request = state.stop.recv() => return request,
                            () = tokio::time::sleep(self.no_data_sleep) => {}
                        }
                    }
                }
                Err(StageError::Quit) => {
                    info!(stage = %self.stage_name, instance = self.instance, "producer quit");
                    let _ = self.quit.send(QuitNotice {
                        stage: self.stage_name.clone(),
                        instance: self.instance,
                    });
                    return state.stop.recv().await;
                }
                Err(StageError::Failed(err)) => {
                    error!(
                        stage = %self.stage_name,
                        instance = self.instance,
                        error = %err,
                        "stage transform failed"
                    );
                }
            }
        }
    }

    async fn consume(&self, state: &mut InstanceState<T>) -> Option<StopRequest> {
        let Some(inbound) = self.inbound.as_deref() else {
            return state.stop.recv().await;
        };

        loop {
            let input = tokio::select! {
                biased;
                request = state.stop.recv() => return request,
                input = inbound.recv() => input,
            };

            let Some(input) = input else {
                debug!(stage = %self.stage_name, instance = self.instance, "inbound link closed");
                return state.stop.recv().await;
            };

            let shown = input.clone();
            match state.stage.transform(Some(input)).await {
                Ok(Some(output)) => {
                    if let Flow::Stop(request) = self.forward(&mut state.stop, output).await {
                        return request;
                    }
                }
                Ok(None) => {}
                Err(StageError::NoData) => {
                    debug!(
                        stage = %self.stage_name,
                        instance = self.instance,
                        input = ?shown,
                        "stage produced no data"
                    );
                }
                Err(err) => {
                    error!(
                        stage = %self.stage_name,
                        instance = self.instance,
                        error = %err,
                        input = ?shown,
                        "stage transform failed"
                    );
                }
            }
        }
    }

    /// Hands `item` downstream unless a stop request arrives before a
    /// downstream instance takes it.
    ///
    /// Without an outbound link (terminal stage) the item is discarded.
    async fn forward(&self, stop: &mut mpsc::Receiver<StopRequest>, item: T) -> Flow {
        let Some(link) = self.outbound.as_deref() else {
            return Flow::Continue;
        };

        tokio::select! {
            biased;
            request = stop.recv() => Flow::Stop(request),
            sent = link.send(item) => {
                match sent {
                    Ok(()) => {}
                    Err(HandoffError::Closed(item)) => {
                        warn!(
                            stage = %self.stage_name,
                            instance = self.instance,
                            item = ?item,
                            "downstream link closed, item dropped"
                        );
                    }
                    Err(HandoffError::Dropped) => {
                        warn!(
                            stage = %self.stage_name,
                            instance = self.instance,
                            "item dropped before delivery"
                        );
                    }
                }
                Flow::Continue
            }
        }
    }

    async fn shut_down(&self, stage: &mut dyn Stage<T>, request: Option<StopRequest>) {
        stage.cleanup().await;

        match request {
            Some(request) => {
                request.acknowledge();
                debug!(stage = %self.stage_name, instance = self.instance, "stage instance stopped");
            }
            None => {
                warn!(
                    stage = %self.stage_name,
                    instance = self.instance,
                    "stop channel closed, exiting without acknowledgment"
                );
            }
        }
    }
}
