//! Structured logging infrastructure.
//!
//! Sets up `tracing` / `tracing-subscriber` for the backend with:
//! - environment-based filtering (`RUST_LOG` wins over the config level)
//! - pretty, compact, or JSON output
//! - idempotent initialization, safe to call from tests
//!
//! # Example
//! ```no_run
//! use ded_monitor::{config::Config, telemetry};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load()?;
//! telemetry::init_from_config(&config)?;
//! tracing::info!("monitor starting");
//! # Ok(())
//! # }
//! ```

use crate::config::Config;
use crate::error::{AppResult, MonitorError};
use tracing::Level;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

/// Output format for log lines.
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    /// Pretty-printed with colors (development).
    Pretty,
    /// Compact without colors (production).
    Compact,
    /// JSON for log aggregation.
    Json,
}

/// Telemetry initialization options.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Default log level when `RUST_LOG` is unset.
    pub level: Level,
    /// Output format.
    pub format: OutputFormat,
    /// Include thread names in output.
    pub with_thread_names: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Compact,
            with_thread_names: true,
        }
    }
}

/// Initialize tracing from the application configuration.
pub fn init_from_config(config: &Config) -> AppResult<()> {
    let level = parse_log_level(&config.application.log_level)?;
    init(TelemetryConfig {
        level,
        ..Default::default()
    })
}

/// Initialize tracing with explicit options.
///
/// Idempotent: a second call (common in tests) is a no-op rather than an
/// error.
pub fn init(config: TelemetryConfig) -> AppResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.to_string().to_lowercase()));

    let result = match config.format {
        OutputFormat::Pretty => tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .pretty()
                    .with_thread_names(config.with_thread_names)
                    .with_filter(env_filter),
            )
            .try_init(),
        OutputFormat::Compact => tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .compact()
                    .with_ansi(false)
                    .with_thread_names(config.with_thread_names)
                    .with_filter(env_filter),
            )
            .try_init(),
        OutputFormat::Json => tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .json()
                    .with_thread_names(config.with_thread_names)
                    .with_filter(env_filter),
            )
            .try_init(),
    };

    result.or_else(|e| {
        if e.to_string()
            .contains("a global default trace dispatcher has already been set")
        {
            Ok(())
        } else {
            Err(MonitorError::Configuration(format!(
                "failed to initialize tracing: {e}"
            )))
        }
    })
}

fn parse_log_level(level: &str) -> AppResult<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(MonitorError::Configuration(format!(
            "invalid log level '{level}', must be one of: trace, debug, info, warn, error"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_levels_case_insensitively() {
        assert!(matches!(parse_log_level("trace"), Ok(Level::TRACE)));
        assert!(matches!(parse_log_level("INFO"), Ok(Level::INFO)));
        assert!(matches!(parse_log_level("Warn"), Ok(Level::WARN)));
        assert!(parse_log_level("loud").is_err());
    }

    #[test]
    fn init_is_idempotent() {
        assert!(init(TelemetryConfig::default()).is_ok());
        assert!(init(TelemetryConfig::default()).is_ok());
    }
}
