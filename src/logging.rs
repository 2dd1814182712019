//! Logging setup, powered by tracing-subscriber.
//!
//! Output goes to stderr: stdout belongs to the NDJSON protocol when the
//! binary runs as a worker process.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::{LogFormat, LoggingSettings};

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Invalid tracing filter '{filter}': {message}")]
    InvalidFilter { filter: String, message: String },

    #[error("Logging already initialized: {0}")]
    AlreadyInitialized(String),
}

/// Build the `EnvFilter` from the configured level. `RUST_LOG` wins when set.
fn build_env_filter(level: &str) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }

    let filter = format!("{},rusqlite=warn", level);
    EnvFilter::try_new(&filter).map_err(|e| LoggingError::InvalidFilter {
        filter,
        message: e.to_string(),
    })
}

/// Initialize the global subscriber from settings.
pub fn init(settings: &LoggingSettings) -> Result<(), LoggingError> {
    let filter = build_env_filter(&settings.level)?;

    let layer = match settings.format {
        LogFormat::Compact => tracing_subscriber::fmt::layer()
            .compact()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_writer(std::io::stderr)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .try_init()
        .map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))
}
