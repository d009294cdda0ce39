//! Container engine abstraction for sandbox units.
//!
//! A unit is a plain container started from the sandbox image. Everything that
//! talks to the container runtime goes through the [`Engine`] trait so that unit
//! lifecycle, image builds and the fleet manager stay runtime-agnostic.

mod cli;
#[cfg(test)]
pub mod fake;

pub use cli::CliEngine;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::debug;
use wait_timeout::ChildExt;

use crate::config::SandboxRuntime;

/// Label attached to every unit this tool creates.
pub const MANAGED_LABEL: (&str, &str) = ("ai-sandbox.managed", "true");

/// Resource bounds applied to a unit at creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory limit in runtime syntax, e.g. "2g".
    pub memory: String,
    pub cpu_period: u64,
    pub cpu_quota: u64,
    pub pids_limit: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory: "2g".to_string(),
            cpu_period: 100_000,
            cpu_quota: 50_000, // 0.5 CPU
            pids_limit: 50,
        }
    }
}

/// A host directory bind-mounted into a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    pub host: PathBuf,
    pub target: String,
    pub read_only: bool,
}

impl VolumeMount {
    fn to_arg(&self) -> String {
        let mut arg = format!("{}:{}", self.host.display(), self.target);
        if self.read_only {
            arg.push_str(":ro");
        }
        arg
    }
}

/// Everything the engine needs to create a unit.
#[derive(Debug, Clone, Default)]
pub struct UnitSpec {
    pub name: String,
    pub image: String,
    /// Directory every attached command runs in.
    pub workdir: String,
    pub labels: BTreeMap<String, String>,
    pub resources: Option<ResourceLimits>,
    pub network: Option<String>,
    pub volumes: Vec<VolumeMount>,
}

/// Runtime-reported state of a unit's foreground process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitStatus {
    Created,
    Running,
    Exited(Option<i64>),
}

impl UnitStatus {
    /// Map a docker/podman `State.Status` string.
    pub fn from_runtime(status: &str, exit_code: Option<i64>) -> Self {
        match status {
            "created" | "configured" | "initialized" => UnitStatus::Created,
            // The foreground process still exists in all of these.
            "running" | "paused" | "restarting" => UnitStatus::Running,
            _ => UnitStatus::Exited(exit_code),
        }
    }
}

/// A unit as seen by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    pub workdir: String,
    pub status: UnitStatus,
    pub labels: BTreeMap<String, String>,
}

/// A command to run inside a unit.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Shell command line, run with `sh -c`.
    pub command: String,
    pub workdir: String,
    pub stdin: Option<Vec<u8>>,
    pub timeout: Duration,
}

impl ExecRequest {
    pub fn new(command: impl Into<String>, workdir: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            workdir: workdir.into(),
            stdin: None,
            timeout,
        }
    }

    pub fn with_stdin(mut self, stdin: Vec<u8>) -> Self {
        self.stdin = Some(stdin);
        self
    }
}

/// Result of a command run inside a unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the command was killed before it reported a status.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    #[cfg(test)]
    pub fn ok(stdout: &str) -> Self {
        Self {
            stdout: stdout.to_string(),
            exit_code: Some(0),
            ..Default::default()
        }
    }
}

/// Signal delivered to a unit's keep-alive process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum Signal {
    /// Immediate, uncatchable termination (default).
    #[default]
    Kill,
    Term,
    Int,
    Hup,
}

impl Signal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::Kill => "KILL",
            Signal::Term => "TERM",
            Signal::Int => "INT",
            Signal::Hup => "HUP",
        }
    }

    /// Exit code a shell reports for a process killed by this signal.
    #[cfg(test)]
    pub fn exit_code(&self) -> i64 {
        let number = match self {
            Signal::Kill => 9,
            Signal::Term => 15,
            Signal::Int => 2,
            Signal::Hup => 1,
        };
        128 + number
    }
}

/// How a [`UnitWaiter`] finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The foreground process exited, with its code when the runtime knows it.
    Exited(Option<i64>),
    Cancelled,
}

/// A blocking wait on a unit's foreground process.
///
/// The wait holds runtime resources (for the CLI backend, a `docker wait`
/// child) until it returns. `cancel` releases them from another thread, and
/// dropping the waiter cancels it.
pub trait UnitWaiter: Send + Sync {
    fn wait(&self) -> Result<WaitOutcome>;

    /// Make a pending or later `wait` return [`WaitOutcome::Cancelled`].
    fn cancel(&self);
}

/// Container runtime backend hosting sandbox units.
///
/// Implementations must be Send + Sync so unit monitors can share them via
/// `Arc<dyn Engine>`.
pub trait Engine: Send + Sync {
    /// Returns the name of the runtime (e.g. "docker", "podman").
    fn name(&self) -> &'static str;

    // === Images ===

    /// Build `tag` from a context directory containing a `Dockerfile`.
    fn build_image(&self, tag: &str, context_dir: &Path) -> Result<()>;

    fn image_exists(&self, tag: &str) -> Result<bool>;

    /// Labels baked into the image at build time.
    fn image_labels(&self, tag: &str) -> Result<BTreeMap<String, String>>;

    fn pull_image(&self, tag: &str) -> Result<()>;

    /// Remove an image. Removing a missing image is not an error.
    fn remove_image(&self, tag: &str) -> Result<()>;

    /// Ensure a user-defined network exists, creating it if needed.
    fn ensure_network(&self, name: &str) -> Result<()>;

    // === Units ===

    /// Create a unit without starting it. Returns the runtime id.
    fn create_unit(&self, spec: &UnitSpec) -> Result<String>;

    fn start_unit(&self, id: &str) -> Result<()>;

    /// Look a unit up by name or id. `Ok(None)` if it does not exist.
    fn inspect_unit(&self, name_or_id: &str) -> Result<Option<UnitInfo>>;

    /// Begin waiting for the unit's foreground process to exit.
    fn watch_unit(&self, id: &str) -> Result<Box<dyn UnitWaiter>>;

    fn exec(&self, id: &str, request: &ExecRequest) -> Result<ExecOutput>;

    /// Deliver a signal to the foreground process. No-op if it already exited.
    fn kill_unit(&self, id: &str, signal: Signal) -> Result<()>;

    /// Remove a unit and its anonymous volumes. No-op if it does not exist.
    fn remove_unit(&self, id: &str) -> Result<()>;

    /// All units (running or not) carrying the given label.
    fn list_units(&self, label: (&str, &str)) -> Result<Vec<UnitInfo>>;
}

/// Create the engine for the configured runtime.
pub fn create_engine(runtime: SandboxRuntime) -> Arc<dyn Engine> {
    Arc::new(CliEngine::new(runtime))
}

/// Check whether the runtime's CLI is installed.
pub fn is_available(runtime: SandboxRuntime) -> bool {
    which::which(runtime.binary()).is_ok()
}

/// Run a prepared command, feeding stdin and draining stdout/stderr on
/// separate threads, and kill it once `timeout` elapses.
pub(crate) fn run_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
) -> Result<ExecOutput> {
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped());

    let mut child = cmd.spawn().context("Failed to spawn command")?;

    // Stdin is written on its own thread so a chatty child can't deadlock us
    // on a full stdout pipe while we are still writing.
    let stdin_thread = match (stdin, child.stdin.take()) {
        (Some(data), Some(mut pipe)) => {
            let data = data.to_vec();
            Some(thread::spawn(move || {
                let _ = pipe.write_all(&data);
            }))
        }
        _ => None,
    };

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not captured"))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not captured"))?;

    let stdout_thread = thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stdout.read_to_end(&mut buf);
        buf
    });
    let stderr_thread = thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stderr.read_to_end(&mut buf);
        buf
    });

    let status = child
        .wait_timeout(timeout)
        .context("Failed to wait for command")?;

    let (exit_code, timed_out) = match status {
        Some(status) => (status.code(), false),
        None => {
            debug!(timeout_ms = timeout.as_millis(), "exec:timeout, killing client");
            let _ = child.kill();
            let _ = child.wait();
            (None, true)
        }
    };

    if let Some(handle) = stdin_thread {
        let _ = handle.join();
    }
    let stdout = stdout_thread
        .join()
        .map_err(|_| anyhow!("stdout reader panicked"))?;
    let stderr = stderr_thread
        .join()
        .map_err(|_| anyhow!("stderr reader panicked"))?;

    Ok(ExecOutput {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        exit_code,
        timed_out,
    })
}
