//! Errors that end the process.
//!
//! Only startup and a broken terminal are fatal. Everything a teacher can
//! cause at the prompt (bad nickname, model failure, export failure) is a
//! [`RoomError`](crate::room::RoomError) that the console prints and moves
//! past.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    /// `config/default.toml` is missing, malformed or out of range.
    #[error("config error: {0}")]
    Config(String),

    /// Bad `log_level` / `RUST_LOG`, or a subscriber was already installed.
    #[error("logger error: {0}")]
    Logger(String),

    /// Reading the next line or writing the chat failed.
    #[error("console i/o failed: {0}")]
    Console(#[from] std::io::Error),
}
