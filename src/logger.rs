//! Diagnostics go to stderr through `tracing-subscriber`; stdout belongs to
//! the chat.
//!
//! `config.log_level` is the default filter and `RUST_LOG` overrides it, so
//! `RUST_LOG=coachbot::export=debug` can trace one noisy export without
//! editing the config file.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::error::AppError;

/// Install the global subscriber. Fails if one is already installed.
pub fn init(level: &str) -> Result<(), AppError> {
    let env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = build_filter(env.as_deref(), level)?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|e| AppError::Logger(format!("failed to set subscriber: {e}")))
}

/// A usable `RUST_LOG` wins; otherwise `level` must parse.
fn build_filter(rust_log: Option<&str>, level: &str) -> Result<EnvFilter, AppError> {
    if let Some(filter) = rust_log.filter(|s| !s.trim().is_empty()).and_then(|s| EnvFilter::try_new(s).ok()) {
        return Ok(filter);
    }
    EnvFilter::try_new(level).map_err(|e| AppError::Logger(format!("invalid log level '{level}': {e}")))
}

/// Validate a bare level name (`error` … `trace`, or `off`).
pub fn parse_level(level: &str) -> Result<LevelFilter, AppError> {
    if level.trim().is_empty() {
        return Err(AppError::Logger("log level must not be empty".into()));
    }
    level
        .parse::<LevelFilter>()
        .map_err(|_| AppError::Logger(format!("unrecognised log level: '{level}'")))
}
