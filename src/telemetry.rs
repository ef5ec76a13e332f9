//! Tracing subscriber installation

use thiserror::Error;
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::EnvFilter;

/// Errors raised while installing the log subscriber
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The level or filter directive is malformed
    #[error("invalid log filter: {0}")]
    InvalidFilter(#[from] ParseError),

    /// A global subscriber is already installed
    #[error("failed to install tracing subscriber: {0}")]
    Install(String),
}

/// Installs a compact stderr subscriber
///
/// `RUST_LOG` takes precedence over `default_directive` when set.
pub fn init(default_directive: &str) -> Result<(), TelemetryError> {
    let env_filter = filter(std::env::var("RUST_LOG").ok(), default_directive)?;

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .compact()
        .try_init()
        .map_err(|err| TelemetryError::Install(err.to_string()))
}

fn filter(from_env: Option<String>, default_directive: &str) -> Result<EnvFilter, ParseError> {
    match from_env.filter(|directive| !directive.trim().is_empty()) {
        Some(directive) => EnvFilter::try_new(directive),
        None => EnvFilter::try_new(default_directive),
    }
}
