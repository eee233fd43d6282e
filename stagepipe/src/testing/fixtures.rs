//! Shared state and configuration for pipeline tests.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use crate::config::PipelineConfig;

#[derive(Debug, Default)]
struct MonitorState {
    calls: usize,
    late_calls: usize,
    cleanups: usize,
}

/// Observes a stage from outside the pipeline.
///
/// Clones share state, so a test keeps one clone while the stage (and its
/// replicas) own the others.
#[derive(Debug, Clone, Default)]
pub struct StageMonitor {
    state: Arc<Mutex<MonitorState>>,
}

impl StageMonitor {
    /// Creates a new monitor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one transform invocation.
    pub fn record_call(&self) {
        let mut state = self.state.lock();
        state.calls += 1;
        if state.cleanups > 0 {
            state.late_calls += 1;
        }
    }

    /// Records one cleanup.
    pub fn record_cleanup(&self) {
        self.state.lock().cleanups += 1;
    }

    /// Number of transform invocations across all instances.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.state.lock().calls
    }

    /// Invocations that happened after some instance was cleaned up.
    #[must_use]
    pub fn late_calls(&self) -> usize {
        self.state.lock().late_calls
    }

    /// Number of cleanups across all instances.
    #[must_use]
    pub fn cleanups(&self) -> usize {
        self.state.lock().cleanups
    }

    /// Polls until at least `calls` invocations were recorded.
    ///
    /// Returns `false` if `timeout` elapsed first.
    pub async fn wait_for_calls(&self, calls: usize, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            while self.calls() < calls {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .is_ok()
    }
}

/// Configuration for tests: no OS signal handling, short no-data backoff.
#[must_use]
pub fn quiet_config() -> PipelineConfig {
    PipelineConfig::new()
        .with_os_signals(false)
        .with_no_data_sleep(Duration::from_millis(10))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monitor_clones_share_state() {
        let monitor = StageMonitor::new();
        let other = monitor.clone();

        monitor.record_call();
        other.record_call();
        assert_eq!(monitor.calls(), 2);
        assert_eq!(monitor.late_calls(), 0);

        other.record_cleanup();
        monitor.record_call();
        assert_eq!(monitor.cleanups(), 1);
        assert_eq!(other.late_calls(), 1);
    }

    #[test]
    fn test_quiet_config() {
        let config = quiet_config();
        assert!(!config.handle_os_signals);
        assert_eq!(config.no_data_sleep_ms, 10);
    }

    #[tokio::test]
    async fn test_wait_for_calls_times_out() {
        let monitor = StageMonitor::new();
        assert!(!monitor.wait_for_calls(1, Duration::from_millis(5)).await);

        monitor.record_call();
        assert!(monitor.wait_for_calls(1, Duration::from_millis(5)).await);
    }
}
