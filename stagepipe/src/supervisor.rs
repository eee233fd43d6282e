//! Crash supervision for long-running units of work.
//!
//! A [`Supervisor`] runs a unit on its own task. When the unit panics, the
//! panic is logged and the unit is started again on a fresh task, up to the
//! restart bound. Exceeding the bound reports a [`SupervisionError`] on the
//! unit's own channel; normal completion closes that channel without a value.
//!
//! Panics are logged with the backtrace of the panicking thread. Capture
//! follows the standard `RUST_BACKTRACE` / `RUST_LIB_BACKTRACE` variables;
//! without them the log reads "disabled backtrace".

use crate::errors::SupervisionError;
use futures::FutureExt;
use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Once;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

thread_local! {
    static LAST_BACKTRACE: RefCell<Option<Backtrace>> = const { RefCell::new(None) };
}

static BACKTRACE_HOOK: Once = Once::new();

/// Runs one unit of work under crash recovery.
#[derive(Debug, Clone)]
pub struct Supervisor {
    unit: String,
    max_restart: usize,
}

impl Supervisor {
    /// Creates a supervisor for the named unit.
    ///
    /// `max_restart == 0` makes the first panic terminal.
    #[must_use]
    pub fn new(unit: impl Into<String>, max_restart: usize) -> Self {
        Self {
            unit: unit.into(),
            max_restart,
        }
    }

    /// Returns the supervised unit's name.
    #[must_use]
    pub fn unit(&self) -> &str {
        &self.unit
    }

    /// Returns the restart bound.
    #[must_use]
    pub const fn max_restart(&self) -> usize {
        self.max_restart
    }

    /// Starts supervising `work`.
    ///
    /// `work` is called once per attempt and must produce a fresh future
    /// each time. Must be called from within a tokio runtime.
    pub fn spawn<F, Fut>(self, work: F) -> SupervisionHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (errors, failure) = oneshot::channel();
        let monitor = tokio::spawn(async move {
            if let Err(err) = self.monitor(work).await {
                let _ = errors.send(err);
            }
        });

        SupervisionHandle { failure, monitor }
    }

    async fn monitor<F, Fut>(self, work: F) -> Result<(), SupervisionError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        install_backtrace_hook();
        let mut restarts = 0;

        loop {
            let outcome = match tokio::spawn(attempt(work())).await {
                Ok(outcome) => outcome,
                Err(join_err) if join_err.is_panic() => Err(CaughtPanic {
                    message: panic_message(join_err.into_panic().as_ref()),
                    backtrace: None,
                }),
                Err(_) => {
                    // The runtime is shutting down.
                    debug!(unit = %self.unit, "supervised unit cancelled");
                    return Ok(());
                }
            };

            let Err(panic) = outcome else {
                debug!(unit = %self.unit, "supervised unit finished");
                return Ok(());
            };

            let backtrace = panic
                .backtrace
                .map_or_else(|| "unavailable".to_string(), |trace| trace.to_string());
            error!(
                unit = %self.unit,
                restarts,
                panic = %panic.message,
                backtrace = %backtrace,
                "supervised unit panicked"
            );

            restarts += 1;
            if restarts > self.max_restart {
                return Err(SupervisionError {
                    unit: self.unit,
                    attempts: restarts,
                    max_restart: self.max_restart,
                    last_panic: panic.message,
                });
            }
            info!(unit = %self.unit, restart = restarts, "restarting supervised unit");
        }
    }
}

/// A panic caught from one attempt.
#[derive(Debug)]
struct CaughtPanic {
    message: String,
    backtrace: Option<Backtrace>,
}

/// Polls one attempt, turning a panic into a [`CaughtPanic`].
///
/// The unwind is caught on the thread that panicked, so the backtrace left
/// there by the hook belongs to this panic.
async fn attempt<Fut>(work: Fut) -> Result<(), CaughtPanic>
where
    Fut: Future<Output = ()>,
{
    AssertUnwindSafe(work)
        .catch_unwind()
        .await
        .map_err(|payload| CaughtPanic {
            message: panic_message(payload.as_ref()),
            backtrace: take_backtrace(),
        })
}

/// Chains a panic hook that keeps the panicking thread's backtrace until
/// [`take_backtrace`] collects it. The previous hook still runs.
fn install_backtrace_hook() {
    BACKTRACE_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let _ = LAST_BACKTRACE.try_with(|slot| {
                if let Ok(mut slot) = slot.try_borrow_mut() {
                    *slot = Some(Backtrace::capture());
                }
            });
            previous(info);
        }));
    });
}

fn take_backtrace() -> Option<Backtrace> {
    LAST_BACKTRACE
        .try_with(|slot| slot.try_borrow_mut().ok().and_then(|mut slot| slot.take()))
        .ok()
        .flatten()
}

/// Handle to a running supervisor.
#[derive(Debug)]
pub struct SupervisionHandle {
    failure: oneshot::Receiver<SupervisionError>,
    monitor: JoinHandle<()>,
}

impl SupervisionHandle {
    /// Waits for supervision to end.
    ///
    /// Returns the terminal error, or `None` if the unit completed normally.
    pub async fn outcome(self) -> Option<SupervisionError> {
        self.failure.await.ok()
    }

    /// Returns true once the supervisor has stopped.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.monitor.is_finished()
    }

    /// Splits off the per-unit error channel.
    #[must_use]
    pub fn into_failure(self) -> oneshot::Receiver<SupervisionError> {
        self.failure
    }
}

/// Extracts a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_normal_completion_reports_nothing() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);

        let handle = Supervisor::new("ok", 2).spawn(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        assert!(handle.outcome().await.is_none());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_restarts_until_bound_then_fails() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);

        let handle = Supervisor::new("crashy", 2).spawn(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                panic!("boom");
            }
        });

        let err = handle.outcome().await.expect("supervision should be exhausted");
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(err.unit, "crashy");
        assert_eq!(err.attempts, 3);
        assert_eq!(err.max_restart, 2);
        assert_eq!(err.last_panic, "boom");
    }

    #[tokio::test]
    async fn test_zero_restart_is_immediately_fatal() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);

        let handle = Supervisor::new("fragile", 0).spawn(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                panic!("{}", String::from("owned message"));
            }
        });

        let err = handle.outcome().await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(err.attempts, 1);
        assert_eq!(err.last_panic, "owned message");
    }

    #[tokio::test]
    async fn test_recovers_after_transient_panic() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);

        let handle = Supervisor::new("flaky", 1).spawn(move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("first attempt fails");
                }
            }
        });

        assert!(handle.outcome().await.is_none());
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_units_are_independent() {
        let healthy_runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&healthy_runs);

        let crashing = Supervisor::new("crashing", 0).spawn(|| async { panic!("down") });
        let healthy = Supervisor::new("healthy", 0).spawn(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        assert!(crashing.outcome().await.is_some());
        assert!(healthy.outcome().await.is_none());
        assert_eq!(healthy_runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempt_keeps_backtrace_of_panic() {
        install_backtrace_hook();

        let caught = attempt(async { panic!("traced") }).await.unwrap_err();
        assert_eq!(caught.message, "traced");
        assert!(caught.backtrace.is_some());
        // Collected once, not left behind for the next panic.
        assert!(take_backtrace().is_none());

        assert!(attempt(async {}).await.is_ok());
    }

    #[test]
    fn test_panic_message_unknown_payload() {
        let payload: Box<dyn Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
