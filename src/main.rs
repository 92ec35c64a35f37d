//! coachbot: console entry point.
//!
//! Startup sequence:
//!   1. Load .env (if present)
//!   2. Load config
//!   3. Init logger at the configured level
//!   4. Spawn Ctrl-C → shutdown signal watcher
//!   5. Run the console until /quit, EOF or shutdown

use coachbot::{config, console, error, logger, room::CoachRoom};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), error::AppError> {
    // Load .env if present: ignore errors (file is optional).
    let _ = dotenvy::dotenv();

    let config = config::load()?;

    logger::init(&config.log_level)?;

    info!(
        app_name = %config.app_name,
        work_dir = %config.work_dir.display(),
        log_level = %config.log_level,
        provider = %config.llm.provider,
        sheets_enabled = config.sheets.enabled,
        "config loaded"
    );

    let shutdown = CancellationToken::new();

    let ctrlc_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received: initiating shutdown");
            ctrlc_token.cancel();
        }
    });

    let mut room = CoachRoom::new(config);
    console::run(&mut room, shutdown).await?;

    info!("shutdown complete");
    Ok(())
}
