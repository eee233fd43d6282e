//! Log subscriber setup.
//!
//! The library only emits `tracing` events; binaries and tests decide where
//! they go. `RUST_LOG` takes precedence over the level passed in.

use tracing_subscriber::EnvFilter;

/// Output format of the installed subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human readable lines.
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
}

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Installs a global fmt subscriber.
///
/// Returns `false` if a global subscriber was already installed.
pub fn init_with_format(level: &str, format: LogFormat) -> bool {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(level))
        .with_target(false);

    match format {
        LogFormat::Pretty => builder.try_init().is_ok(),
        LogFormat::Json => builder.json().try_init().is_ok(),
    }
}

/// Installs a human readable subscriber at `level`.
pub fn init_logging(level: &str) -> bool {
    init_with_format(level, LogFormat::Pretty)
}

/// Installs a JSON subscriber at `level`.
pub fn init_json_logging(level: &str) -> bool {
    init_with_format(level, LogFormat::Json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_install_is_rejected() {
        // Other tests may have installed one already; the second call
        // must fail either way.
        let _ = init_logging("off");
        assert!(!init_json_logging("off"));
    }

    #[test]
    fn test_default_format() {
        assert_eq!(LogFormat::default(), LogFormat::Pretty);
    }
}
