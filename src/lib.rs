// Library root: exposes internals for integration tests.
// The binary entry point is src/main.rs.

pub mod config;
pub mod console;
pub mod engine;
pub mod error;
pub mod export;
pub mod knowledge;
pub mod llm;
pub mod logger;
pub mod prompt;
pub mod room;
pub mod session;
