//! Tracing subscriber initialization.
//!
//! The host application usually installs its own subscriber; this helper is
//! for standalone use (demos, harnesses). Respects `RUST_LOG`, defaults to
//! `info`, writes to stderr so backend stdout framing stays clean.

use tracing_subscriber::EnvFilter;

/// Error type for logging initialization failures.
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("tracing subscriber already initialized")]
    SubscriberAlreadySet,
}

/// Install the global subscriber. Call at most once per process.
/// `verbose` lowers the default level to `debug`; `RUST_LOG` still wins.
pub fn init(verbose: bool) -> Result<(), LoggingError> {
    let default_level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init()
        .map_err(|_| LoggingError::SubscriberAlreadySet)
}
