//! Logging setup
//!
//! The crate logs through `tracing`. Hosts that do not install their own subscriber can
//! call [`setup_logging`]. `RUST_LOG` directives are honoured on top of the configured
//! level.

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{ServiceError, ServiceResult};

/// Output format of the fmt subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Plain,
    /// One JSON object per line
    Json,
}

/// Configuration for the logging system
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: Level,
    pub format: LogFormat,
    /// Include file and line information
    pub file_info: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self::new(Level::INFO)
    }
}

impl LoggingConfig {
    pub fn new(level: Level) -> Self {
        LoggingConfig {
            level,
            format: LogFormat::Plain,
            file_info: false,
        }
    }

    pub fn with_json(mut self) -> Self {
        self.format = LogFormat::Json;
        self
    }

    pub fn with_file_info(mut self) -> Self {
        self.file_info = true;
        self
    }
}

/// Install a global fmt subscriber
///
/// Fails if a global subscriber is already installed.
pub fn setup_logging(config: LoggingConfig) -> ServiceResult<()> {
    let filter = EnvFilter::from_default_env().add_directive(config.level.into());

    let mut subscriber = fmt::Subscriber::builder().with_env_filter(filter);
    if config.file_info {
        subscriber = subscriber.with_file(true).with_line_number(true);
    }

    let installed = if config.format == LogFormat::Json {
        subscriber.with_writer(std::io::stdout).json().try_init()
    } else {
        subscriber.try_init()
    };
    installed.map_err(|e| ServiceError::config(format!("cannot install logger: {}", e)))?;

    tracing::debug!(level = %config.level, "Logging ready (call service v{})", crate::VERSION);
    Ok(())
}

/// Parse a log level from a string
pub fn parse_log_level(level: &str) -> ServiceResult<Level> {
    Level::from_str(level).map_err(|_| ServiceError::config(format!("Invalid log level: {}", level)))
}
