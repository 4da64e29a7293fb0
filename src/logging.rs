//! Tracing setup for the capture and merge binaries.
//!
//! Wraps `tracing-subscriber` with the small amount of policy this project
//! needs: a level and format picked from configuration, `RUST_LOG` taking
//! precedence when set, and an idempotent `init` so tests and embedding
//! code can call it more than once without error.

use tracing::Level;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::ApplicationConfig;
use crate::error::{Result, SpoolError};

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Multi-line, colored; for development.
    Pretty,
    /// Single-line, no frills; for production.
    Compact,
    /// Structured JSON for log aggregation.
    Json,
}

/// Parse a level name from configuration.
pub fn parse_level(level: &str) -> Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => Err(SpoolError::Configuration(format!(
            "invalid log level '{other}'; must be one of: trace, debug, info, warn, error"
        ))),
    }
}

/// Parse a format name from configuration.
pub fn parse_format(format: &str) -> Result<OutputFormat> {
    match format.to_lowercase().as_str() {
        "pretty" => Ok(OutputFormat::Pretty),
        "compact" => Ok(OutputFormat::Compact),
        "json" => Ok(OutputFormat::Json),
        other => Err(SpoolError::Configuration(format!(
            "invalid log format '{other}'; must be one of: pretty, compact, json"
        ))),
    }
}

/// Initialize tracing from the application section of the configuration.
pub fn init_from_config(app: &ApplicationConfig) -> Result<()> {
    init(parse_level(&app.log_level)?, parse_format(&app.log_format)?)
}

/// Initialize tracing with an explicit level and format.
///
/// `RUST_LOG` overrides the configured level when present. Calling this
/// after a subscriber is already installed is not an error; the existing
/// subscriber wins, which is what tests want.
pub fn init(level: Level, format: OutputFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string().to_lowercase()));

    let result = match format {
        OutputFormat::Pretty => tracing_subscriber::registry()
            .with(fmt::layer().pretty().with_filter(env_filter))
            .try_init(),
        OutputFormat::Compact => tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .compact()
                    .with_ansi(false)
                    .with_filter(env_filter),
            )
            .try_init(),
        OutputFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json().with_filter(env_filter))
            .try_init(),
    };

    match result {
        Ok(()) => Ok(()),
        // A second init is expected in tests; any other failure is real.
        Err(e)
            if e.to_string()
                .contains("a global default trace dispatcher has already been set") =>
        {
            Ok(())
        }
        Err(e) => Err(SpoolError::Configuration(format!(
            "failed to initialize tracing: {e}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_level_case_insensitively() {
        assert_eq!(parse_level("trace").unwrap(), Level::TRACE);
        assert_eq!(parse_level("DEBUG").unwrap(), Level::DEBUG);
        assert_eq!(parse_level("Info").unwrap(), Level::INFO);
        assert_eq!(parse_level("warn").unwrap(), Level::WARN);
        assert_eq!(parse_level("error").unwrap(), Level::ERROR);
        assert!(parse_level("loud").is_err());
    }

    #[test]
    fn parses_formats() {
        assert_eq!(parse_format("pretty").unwrap(), OutputFormat::Pretty);
        assert_eq!(parse_format("compact").unwrap(), OutputFormat::Compact);
        assert_eq!(parse_format("JSON").unwrap(), OutputFormat::Json);
        assert!(parse_format("xml").is_err());
    }

    #[test]
    fn repeated_init_is_tolerated() {
        assert!(init(Level::INFO, OutputFormat::Compact).is_ok());
        assert!(init(Level::DEBUG, OutputFormat::Compact).is_ok());
    }
}
