//! Logging setup for embedding applications.
//!
//! Library code logs through the `log` macros and opens `tracing` spans
//! around reconcile cycles and waves. [`init_logging`] installs a
//! subscriber that prints both, filtered by `KEEL_LOG` (default `info`).

use std::str::FromStr;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub const ENV_LOG: &str = "KEEL_LOG";
const DEFAULT_FILTER: &str = "info";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "plain" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("Unknown log format: {}", other)),
        }
    }
}

/// Builds the filter from `KEEL_LOG`, falling back to `info`.
pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(ENV_LOG).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Installs the global subscriber. Fails if one is already installed.
pub fn init_logging(format: LogFormat) -> Result<(), String> {
    tracing_log::LogTracer::init().map_err(|e| format!("Failed to bridge log records: {}", e))?;
    let registry = tracing_subscriber::registry().with(env_filter());
    let result = match format {
        LogFormat::Text => {
            tracing::subscriber::set_global_default(registry.with(fmt::layer().with_target(true)))
        }
        LogFormat::Json => tracing::subscriber::set_global_default(
            registry.with(fmt::layer().json().with_current_span(true)),
        ),
    };
    result.map_err(|e| format!("Failed to install tracing subscriber: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_log_format_from_str() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("Text".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    #[serial]
    fn test_env_filter_reads_keel_log() {
        std::env::set_var(ENV_LOG, "keel=debug");
        assert_eq!(env_filter().to_string(), "keel=debug");
        std::env::remove_var(ENV_LOG);
        assert_eq!(env_filter().to_string(), "info");
    }
}
