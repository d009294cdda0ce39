use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result, anyhow};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

static INIT: OnceLock<()> = OnceLock::new();
static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

const APP_DIR: &str = "ai-sandbox";

pub fn init() -> Result<()> {
    if INIT.get().is_some() {
        return Ok(());
    }

    init_inner()?;
    let _ = INIT.set(());
    Ok(())
}

fn init_inner() -> Result<()> {
    let log_path = state_dir()?.join("ai-sandbox.log");
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory at {}", parent.display()))?;
    }

    let (directory, file_name) = split_path(&log_path)?;
    let file_appender = rolling::never(directory, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = GUARD.set(guard);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .with_thread_names(true),
        )
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    Ok(())
}

/// Per-user state directory: logs and the session record file live here.
pub fn state_dir() -> Result<PathBuf> {
    // Check XDG_STATE_HOME environment variable first
    if let Ok(state_home) = std::env::var("XDG_STATE_HOME")
        && !state_home.is_empty()
    {
        return Ok(PathBuf::from(state_home).join(APP_DIR));
    }

    // Fall back to XDG default: ~/.local/state/ai-sandbox
    if let Some(home_dir) = home::home_dir() {
        return Ok(home_dir.join(".local").join("state").join(APP_DIR));
    }

    // Fallback to current directory if home cannot be determined
    Ok(std::env::current_dir()?.join(format!(".{APP_DIR}")))
}

fn split_path(path: &Path) -> Result<(PathBuf, &str)> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("Invalid log file name"))?;

    let dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    Ok((dir, file_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_path_parts() {
        let (dir, name) = split_path(Path::new("/var/state/ai-sandbox/ai-sandbox.log")).unwrap();
        assert_eq!(dir, PathBuf::from("/var/state/ai-sandbox"));
        assert_eq!(name, "ai-sandbox.log");
    }

    #[test]
    fn state_dir_ends_with_app_dir() {
        let dir = state_dir().unwrap();
        assert!(dir.to_string_lossy().contains(APP_DIR));
    }
}
