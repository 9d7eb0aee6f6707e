//! Discord bot entry point.
//!
//! Reads configuration from the environment (and `.env`), installs logging
//! and runs the bot on a single-threaded runtime until the gateway closes or
//! Ctrl-C is pressed.

use tracing::{error, info};

use masterminds_bot::config::BotConfig;
use masterminds_bot::telemetry;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = BotConfig::from_env();
    let _log = telemetry::init(&config.log)?;

    tokio::select! {
        result = masterminds_bot::run(config) => {
            if let Err(e) = &result {
                error!(error = %e, "bot stopped");
            }
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
        }
    }
    Ok(())
}
