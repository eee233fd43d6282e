//! Pipeline tunables.
//!
//! A process-wide [`PipelineConfig`] supplies the defaults for every run.
//! Restart bound and concurrency can be overridden per descriptor; the
//! no-data throttle can be overridden per run.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default restart bound for each instance.
pub const DEFAULT_RESTART: usize = 1;
/// Default number of instances per stage.
pub const DEFAULT_CONCURRENCY: usize = 1;
/// Consecutive no-data results before the producer backs off.
pub const DEFAULT_NO_DATA_THRESHOLD: usize = 100;
/// Backoff duration once the no-data threshold is reached.
pub const DEFAULT_NO_DATA_SLEEP_MS: u64 = 1000;

/// Configuration for pipeline runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Restart bound used when a descriptor does not set one. `0` disables restart.
    pub default_restart: usize,
    /// Instance count used when a descriptor does not set one.
    pub default_concurrency: usize,
    /// Number of no-data results that triggers a producer backoff.
    pub no_data_threshold: usize,
    /// Producer backoff duration in milliseconds.
    pub no_data_sleep_ms: u64,
    /// Whether a run also stops on SIGINT/SIGTERM/SIGQUIT.
    pub handle_os_signals: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            default_restart: DEFAULT_RESTART,
            default_concurrency: DEFAULT_CONCURRENCY,
            no_data_threshold: DEFAULT_NO_DATA_THRESHOLD,
            no_data_sleep_ms: DEFAULT_NO_DATA_SLEEP_MS,
            handle_os_signals: true,
        }
    }
}

impl PipelineConfig {
    /// Creates a config with the built-in defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the default restart bound.
    #[must_use]
    pub fn with_default_restart(mut self, restart: usize) -> Self {
        self.default_restart = restart;
        self
    }

    /// Sets the default concurrency. Values below 1 are raised to 1.
    #[must_use]
    pub fn with_default_concurrency(mut self, concurrency: usize) -> Self {
        self.default_concurrency = concurrency.max(1);
        self
    }

    /// Sets the no-data threshold. Values below 1 are raised to 1.
    #[must_use]
    pub fn with_no_data_threshold(mut self, threshold: usize) -> Self {
        self.no_data_threshold = threshold.max(1);
        self
    }

    /// Sets the no-data backoff duration.
    #[must_use]
    pub fn with_no_data_sleep(mut self, sleep: Duration) -> Self {
        self.no_data_sleep_ms = u64::try_from(sleep.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Enables or disables OS signal handling.
    #[must_use]
    pub fn with_os_signals(mut self, enabled: bool) -> Self {
        self.handle_os_signals = enabled;
        self
    }

    /// Returns the no-data backoff duration.
    #[must_use]
    pub fn no_data_sleep(&self) -> Duration {
        Duration::from_millis(self.no_data_sleep_ms)
    }

    /// Returns the effective instance count for a descriptor value.
    #[must_use]
    pub fn concurrency_for(&self, requested: Option<usize>) -> usize {
        requested.unwrap_or(self.default_concurrency).max(1)
    }

    /// Returns the effective restart bound for a descriptor value.
    #[must_use]
    pub fn restart_for(&self, requested: Option<usize>) -> usize {
        requested.unwrap_or(self.default_restart)
    }
}

static GLOBAL_CONFIG: RwLock<Option<PipelineConfig>> = RwLock::new(None);

/// Replaces the process-wide defaults used by new pipelines.
pub fn set_global(config: PipelineConfig) {
    *GLOBAL_CONFIG.write() = Some(config);
}

/// Restores the built-in defaults.
pub fn reset_global() {
    *GLOBAL_CONFIG.write() = None;
}

/// Returns a copy of the process-wide defaults.
pub fn global() -> PipelineConfig {
    GLOBAL_CONFIG.read().clone().unwrap_or_default()
}

/// Held by tests that change the process-wide defaults, so parallel tests
/// never observe each other's overrides.
#[cfg(test)]
pub(crate) static GLOBAL_TEST_LOCK: parking_lot::Mutex<()> = parking_lot::Mutex::new(());

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.default_restart, 1);
        assert_eq!(config.default_concurrency, 1);
        assert_eq!(config.no_data_threshold, 100);
        assert_eq!(config.no_data_sleep(), Duration::from_secs(1));
        assert!(config.handle_os_signals);
    }

    #[test]
    fn test_builder_setters() {
        let config = PipelineConfig::new()
            .with_default_restart(0)
            .with_default_concurrency(0)
            .with_no_data_threshold(5)
            .with_no_data_sleep(Duration::from_millis(20))
            .with_os_signals(false);

        assert_eq!(config.default_restart, 0);
        assert_eq!(config.default_concurrency, 1);
        assert_eq!(config.no_data_threshold, 5);
        assert_eq!(config.no_data_sleep_ms, 20);
        assert!(!config.handle_os_signals);
    }

    #[test]
    fn test_effective_values() {
        let config = PipelineConfig::new()
            .with_default_restart(3)
            .with_default_concurrency(2);

        assert_eq!(config.concurrency_for(None), 2);
        assert_eq!(config.concurrency_for(Some(4)), 4);
        assert_eq!(config.restart_for(None), 3);
        assert_eq!(config.restart_for(Some(0)), 0);
    }

    #[test]
    fn test_partial_deserialize_keeps_defaults() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"no_data_threshold": 7}"#).unwrap();

        assert_eq!(config.no_data_threshold, 7);
        assert_eq!(config.default_restart, DEFAULT_RESTART);
        assert_eq!(config.no_data_sleep_ms, DEFAULT_NO_DATA_SLEEP_MS);
    }

    #[test]
    fn test_global_override_and_reset() {
        let _guard = GLOBAL_TEST_LOCK.lock();

        set_global(PipelineConfig::new().with_default_restart(9));
        assert_eq!(global().default_restart, 9);

        reset_global();
        assert_eq!(global(), PipelineConfig::default());
    }
}
