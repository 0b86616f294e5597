//! Tracing/logging initialization.
//!
//! Filtering follows `RUST_LOG` and defaults to `info`.

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Output format of the log stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per event, for log shippers.
    #[default]
    Json,
    /// Human-readable, for local development.
    Pretty,
}

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false);

    let _ = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_names_are_lowercase() {
        let json: LogFormat = serde_json::from_str("\"json\"").unwrap();
        let pretty: LogFormat = serde_json::from_str("\"pretty\"").unwrap();
        assert_eq!(json, LogFormat::Json);
        assert_eq!(pretty, LogFormat::Pretty);
        assert!(serde_json::from_str::<LogFormat>("\"xml\"").is_err());
    }

    #[test]
    fn repeated_init_is_harmless() {
        init(LogFormat::Pretty);
        init(LogFormat::Json);
    }
}
