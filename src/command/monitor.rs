use anyhow::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::warn;

use super::Context;

pub fn run(interval: Option<u64>, once: bool) -> Result<()> {
    let ctx = Context::load()?;
    let fleet = ctx.fleet()?;

    if once {
        fleet.monitor_pass();
        return Ok(());
    }

    let interval = interval
        .map(Duration::from_secs)
        .unwrap_or_else(|| ctx.config.fleet.monitor_interval());

    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    if let Err(e) = ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst)) {
        warn!(error = %e, "monitor:failed to install ctrl-c handler");
    }

    println!(
        "Monitoring sessions every {}s (ctrl-c to stop)",
        interval.as_secs()
    );
    fleet.monitor(interval, &stop);
    Ok(())
}
