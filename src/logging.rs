//! Tracing setup for hosts embedding the reduction pipeline.
//!
//! Stages and the chain emit structured `tracing` events (`stage`, `key`,
//! `frames` fields); this module installs a `tracing-subscriber` formatter for
//! them. Failures of a point are logged where they happen: skips at `warn`,
//! stage failures at `error`, per-point progress and area map rebuilds at
//! `debug`.
//!
//! # Example
//! ```no_run
//! use ncd_reduction::config::Settings;
//! use ncd_reduction::logging::{self, OutputFormat, TracingConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Settings::new(Some("beamline"))?;
//! logging::init(TracingConfig::from_settings(&settings)?.with_format(OutputFormat::Json))?;
//! # Ok(())
//! # }
//! ```

use crate::config::Settings;
use crate::error::{AppResult, ReductionError};
use tracing::Level;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Multi-line, colored (interactive use)
    Pretty,
    /// Single line per event
    Compact,
    /// One JSON object per event (log aggregation)
    Json,
}

/// Subscriber options.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Default level when `RUST_LOG` is not set.
    pub level: Level,
    /// Output format.
    pub format: OutputFormat,
    /// Include source file and line.
    pub with_file_and_line: bool,
    /// Include the emitting module path.
    pub with_target: bool,
    /// ANSI colors; only honoured by the pretty format.
    pub with_ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Compact,
            with_file_and_line: false,
            with_target: true,
            with_ansi: true,
        }
    }
}

impl TracingConfig {
    /// Config at `level` with default options.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Config at the level named in the settings file.
    pub fn from_settings(settings: &Settings) -> AppResult<Self> {
        Ok(Self::new(parse_log_level(&settings.log_level)?))
    }

    /// Set output format
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable ANSI colors
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

/// Install a global subscriber.
///
/// `RUST_LOG` overrides `config.level` when set. Calling this again, or after
/// another subscriber was installed, is not an error.
pub fn init(config: TracingConfig) -> AppResult<()> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_lowercase()));

    let base = tracing_subscriber::fmt::layer()
        .with_file(config.with_file_and_line)
        .with_line_number(config.with_file_and_line)
        .with_target(config.with_target);
    let layer = match config.format {
        OutputFormat::Pretty => base.pretty().with_ansi(config.with_ansi).boxed(),
        OutputFormat::Compact => base.compact().with_ansi(false).boxed(),
        OutputFormat::Json => base.json().boxed(),
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(env_filter))
        .try_init()
        .or_else(|e| {
            // Lost a race with another initializer.
            if tracing::dispatcher::has_been_set() {
                Ok(())
            } else {
                Err(ReductionError::Configuration(format!(
                    "failed to initialize tracing: {}",
                    e
                )))
            }
        })
}

/// Parse a log level name, case-insensitively.
pub fn parse_log_level(level: &str) -> AppResult<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(ReductionError::Configuration(format!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("trace"), Ok(Level::TRACE));
        assert_eq!(parse_log_level("warn"), Ok(Level::WARN));
        assert_eq!(parse_log_level("Debug"), Ok(Level::DEBUG));
        assert!(matches!(
            parse_log_level("verbose"),
            Err(ReductionError::Configuration(_))
        ));
    }

    #[test]
    fn test_config_from_settings() {
        let settings =
            Settings::from_toml_str("log_level = \"ERROR\"\n[chain]\nraw_key = \"raw\"\n").unwrap();
        let config = TracingConfig::from_settings(&settings).unwrap();
        assert_eq!(config.level, Level::ERROR);
        assert_eq!(config.format, OutputFormat::Compact);
    }

    // `test_init_is_idempotent` lives in tests/logging_init.rs: it installs a
    // process-global subscriber, which would break `#[traced_test]` tests here.
}
