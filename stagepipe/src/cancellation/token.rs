//! Cancellation token for stopping a pipeline from the outside.

use parking_lot::Mutex;
use std::fmt;
use tokio::sync::Notify;
use tracing::debug;

/// Requests shutdown of a pipeline run.
///
/// Shared through an `Arc`. Only the first reason is kept; later calls to
/// [`cancel`](Self::cancel) are no-ops.
#[derive(Default)]
pub struct CancellationToken {
    reason: Mutex<Option<String>>,
    notify: Notify,
}

impl CancellationToken {
    /// Creates a token that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    ///
    /// Returns `true` if this call cancelled the token.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        let mut slot = self.reason.lock();
        if slot.is_some() {
            return false;
        }
        let reason = reason.into();
        debug!(%reason, "cancellation requested");
        *slot = Some(reason);
        drop(slot);

        self.notify.notify_waiters();
        true
    }

    /// Returns whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.reason.lock().is_some()
    }

    /// Returns the reason given to the first [`cancel`](Self::cancel).
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }

    /// Completes once cancellation has been requested.
    pub async fn cancelled(&self) {
        loop {
            // Created before the check so a concurrent cancel is not missed.
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("reason", &self.reason())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_first_reason_wins() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert!(token.reason().is_none());

        assert!(token.cancel("deploy"));
        assert!(!token.cancel("second"));

        assert!(token.is_cancelled());
        assert_eq!(token.reason().as_deref(), Some("deploy"));
    }

    #[tokio::test]
    async fn test_cancelled_wakes_every_waiter() {
        let token = Arc::new(CancellationToken::new());
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let token = Arc::clone(&token);
                tokio::spawn(async move { token.cancelled().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(waiters.iter().all(|w| !w.is_finished()));

        token.cancel("stop");
        for waiter in waiters {
            tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .expect("waiter should wake")
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_cancelled_returns_immediately_when_already_cancelled() {
        let token = CancellationToken::new();
        token.cancel("early");
        token.cancelled().await;
    }
}
