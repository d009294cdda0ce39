pub mod image;
pub mod monitor;
pub mod session;
pub mod unit;

use anyhow::{Result, bail};
use std::sync::Arc;
use tracing::debug;

use crate::config::Config;
use crate::engine::{self, Engine};
use crate::fleet::{FleetManager, FleetSettings, RecordStore};
use crate::logger;

/// Loaded configuration plus the engine it selects.
pub struct Context {
    pub config: Config,
    pub engine: Arc<dyn Engine>,
}

impl Context {
    pub fn load() -> Result<Self> {
        let config = Config::load()?;
        let runtime = config.runtime();
        if !engine::is_available(runtime) {
            bail!(
                "'{}' was not found in PATH. Install it or set `runtime` in .ai-sandbox.yaml.",
                runtime.binary()
            );
        }
        debug!(runtime = runtime.binary(), "command:context loaded");
        Ok(Self {
            engine: engine::create_engine(runtime),
            config,
        })
    }

    pub fn fleet(&self) -> Result<FleetManager> {
        let path = match &self.config.fleet.state_file {
            Some(path) => path.clone(),
            None => logger::state_dir()?.join("sandboxes.json"),
        };
        Ok(FleetManager::new(
            Arc::clone(&self.engine),
            RecordStore::new(path),
            FleetSettings::from_config(&self.config),
        ))
    }
}

/// Shorten a runtime id for display.
pub fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

/// Human age of a UNIX timestamp, e.g. "3m".
pub fn format_age(then: u64, now: u64) -> String {
    let secs = now.saturating_sub(then);
    match secs {
        0..60 => format!("{secs}s"),
        60..3600 => format!("{}m", secs / 60),
        3600..86400 => format!("{}h", secs / 3600),
        _ => format!("{}d", secs / 86400),
    }
}
