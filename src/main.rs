mod cli;
mod cmd;
mod command;
mod config;
mod engine;
mod fleet;
mod image;
mod logger;
mod spinner;
mod unit;

use anyhow::Result;
use tracing::{error, info};

fn main() -> Result<()> {
    logger::init()?;
    info!(args = ?std::env::args().collect::<Vec<_>>(), "ai-sandbox start");

    match cli::run() {
        Ok(result) => {
            info!("ai-sandbox finished successfully");
            Ok(result)
        }
        Err(err) => {
            error!(error = ?err, "ai-sandbox failed");
            Err(err)
        }
    }
}
