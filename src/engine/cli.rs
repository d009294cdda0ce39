//! Docker/Podman CLI backend.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::process::{Child, ExitStatus, Stdio};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info};
use wait_timeout::ChildExt;

use super::{
    Engine, ExecOutput, ExecRequest, Signal, UnitInfo, UnitSpec, UnitStatus, UnitWaiter,
    WaitOutcome, run_with_timeout,
};
use crate::cmd::Cmd;
use crate::config::SandboxRuntime;

/// How many trailing lines of build output to keep in error messages.
const BUILD_ERROR_TAIL: usize = 30;

/// Networks the runtime provides out of the box; never created or inspected.
const BUILTIN_NETWORKS: &[&str] = &["", "none", "host", "bridge", "default", "private"];

/// Longest a `cancel` waits for a blocked `wait` to let go of the child.
const WAIT_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectContainer {
    id: String,
    name: String,
    state: InspectState,
    config: InspectConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    status: String,
    #[serde(default)]
    exit_code: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    #[serde(default)]
    image: String,
    #[serde(default)]
    working_dir: String,
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
}

impl From<InspectContainer> for UnitInfo {
    fn from(c: InspectContainer) -> Self {
        let exit_code = c.state.exit_code;
        UnitInfo {
            id: c.id,
            name: c.name.trim_start_matches('/').to_string(),
            image: c.config.image,
            workdir: c.config.working_dir,
            status: UnitStatus::from_runtime(&c.state.status, exit_code),
            labels: c.config.labels.unwrap_or_default(),
        }
    }
}

/// Parse the JSON array printed by `container inspect`.
fn parse_inspect(stdout: &[u8]) -> Result<Option<UnitInfo>> {
    let containers: Vec<InspectContainer> =
        serde_json::from_slice(stdout).context("Failed to parse container inspect output")?;
    Ok(containers.into_iter().next().map(UnitInfo::from))
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

/// A running `<runtime> wait <id>` child. Killed on cancel or drop so it
/// never outlives the handle watching the unit.
struct CliWaiter {
    id: String,
    child: Mutex<Child>,
    cancelled: AtomicBool,
}

impl CliWaiter {
    fn spawn(mut cmd: std::process::Command, id: &str) -> Result<Self> {
        let child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to start waiting for unit {}", id))?;
        Ok(Self {
            id: id.to_string(),
            child: Mutex::new(child),
            cancelled: AtomicBool::new(false),
        })
    }

    fn finish(&self, child: &mut Child, status: ExitStatus) -> Result<WaitOutcome> {
        let mut stdout = String::new();
        if let Some(mut out) = child.stdout.take() {
            out.read_to_string(&mut stdout)?;
        }
        if !status.success() {
            let mut stderr = String::new();
            if let Some(mut err) = child.stderr.take() {
                err.read_to_string(&mut stderr)?;
            }
            bail!("Failed to wait for unit {}: {}", self.id, stderr.trim());
        }
        Ok(WaitOutcome::Exited(
            stdout.lines().last().and_then(|l| l.trim().parse().ok()),
        ))
    }
}

impl UnitWaiter for CliWaiter {
    fn wait(&self) -> Result<WaitOutcome> {
        loop {
            if self.cancelled.load(Ordering::SeqCst) {
                return Ok(WaitOutcome::Cancelled);
            }
            let mut child = self.child.lock().unwrap_or_else(|e| e.into_inner());
            let Some(status) = child
                .wait_timeout(WAIT_POLL)
                .context("Failed to wait for runtime wait")?
            else {
                continue;
            };
            if self.cancelled.load(Ordering::SeqCst) {
                return Ok(WaitOutcome::Cancelled);
            }
            return self.finish(&mut child, status);
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let mut child = self.child.lock().unwrap_or_else(|e| e.into_inner());
        if let Ok(None) = child.try_wait() {
            debug!(unit = %self.id, "engine:cancel wait");
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl Drop for CliWaiter {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Engine that shells out to the `docker` or `podman` binary.
pub struct CliEngine {
    runtime: SandboxRuntime,
}

impl CliEngine {
    pub fn new(runtime: SandboxRuntime) -> Self {
        Self { runtime }
    }

    fn cmd(&self) -> Cmd {
        Cmd::new(self.runtime.binary())
    }

    fn create_args(spec: &UnitSpec) -> Vec<String> {
        let mut args = vec![
            "create".to_string(),
            "--name".to_string(),
            spec.name.clone(),
            "--workdir".to_string(),
            spec.workdir.clone(),
        ];

        for (key, value) in &spec.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }

        if let Some(limits) = &spec.resources {
            args.push("--memory".to_string());
            args.push(limits.memory.clone());
            args.push("--cpu-period".to_string());
            args.push(limits.cpu_period.to_string());
            args.push("--cpu-quota".to_string());
            args.push(limits.cpu_quota.to_string());
            args.push("--pids-limit".to_string());
            args.push(limits.pids_limit.to_string());
        }

        if let Some(network) = &spec.network {
            args.push("--network".to_string());
            args.push(network.clone());
        }

        for volume in &spec.volumes {
            args.push("--volume".to_string());
            args.push(volume.to_arg());
        }

        args.push(spec.image.clone());
        args
    }

    fn exec_args(id: &str, request: &ExecRequest) -> Vec<String> {
        let mut args = vec!["exec".to_string()];
        if request.stdin.is_some() {
            args.push("--interactive".to_string());
        }
        args.push("--workdir".to_string());
        args.push(request.workdir.clone());
        args.push(id.to_string());
        args.push("sh".to_string());
        args.push("-c".to_string());
        args.push(request.command.clone());
        args
    }
}

impl Engine for CliEngine {
    fn name(&self) -> &'static str {
        self.runtime.binary()
    }

    fn build_image(&self, tag: &str, context_dir: &Path) -> Result<()> {
        info!(tag, runtime = self.name(), context = %context_dir.display(), "engine:build");
        let output = self
            .cmd()
            .args(["build", "--tag", tag, "."])
            .workdir(context_dir)
            .into_command()
            .output()
            .with_context(|| format!("Failed to run {} build", self.name()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "{} build exited with {}:\n{}",
                self.name(),
                output.status,
                tail(&stderr, BUILD_ERROR_TAIL)
            );
        }
        Ok(())
    }

    fn image_exists(&self, tag: &str) -> Result<bool> {
        self.cmd().args(["image", "inspect", tag]).run_as_check()
    }

    fn image_labels(&self, tag: &str) -> Result<BTreeMap<String, String>> {
        let json = self
            .cmd()
            .args(["image", "inspect", "--format", "{{json .Config.Labels}}", tag])
            .run_and_capture_stdout()?;
        let labels: Option<BTreeMap<String, String>> =
            serde_json::from_str(&json).context("Failed to parse image labels")?;
        Ok(labels.unwrap_or_default())
    }

    fn pull_image(&self, tag: &str) -> Result<()> {
        info!(tag, "engine:pull");
        self.cmd()
            .args(["pull", tag])
            .run()
            .with_context(|| format!("Failed to pull image {}", tag))?;
        Ok(())
    }

    fn remove_image(&self, tag: &str) -> Result<()> {
        debug!(tag, "engine:remove image");
        self.cmd()
            .args(["image", "rm", "--force", tag])
            .run_tolerating(&["no such image", "image not known"])
    }

    fn ensure_network(&self, name: &str) -> Result<()> {
        if BUILTIN_NETWORKS.contains(&name) {
            return Ok(());
        }
        if self.cmd().args(["network", "inspect", name]).run_as_check()? {
            return Ok(());
        }
        info!(network = name, "engine:create network");
        self.cmd()
            .args(["network", "create", name])
            .run()
            .with_context(|| format!("Failed to create network {}", name))?;
        Ok(())
    }

    fn create_unit(&self, spec: &UnitSpec) -> Result<String> {
        debug!(name = %spec.name, image = %spec.image, "engine:create unit");
        let id = self
            .cmd()
            .args(Self::create_args(spec))
            .run_and_capture_stdout()
            .with_context(|| format!("Failed to create unit {}", spec.name))?;
        // Podman may print pull progress before the id.
        Ok(id.lines().last().unwrap_or_default().trim().to_string())
    }

    fn start_unit(&self, id: &str) -> Result<()> {
        self.cmd()
            .args(["start", id])
            .run()
            .with_context(|| format!("Failed to start unit {}", id))?;
        Ok(())
    }

    fn inspect_unit(&self, name_or_id: &str) -> Result<Option<UnitInfo>> {
        let output = self
            .cmd()
            .args(["container", "inspect", name_or_id])
            .into_command()
            .output()
            .with_context(|| format!("Failed to run {} container inspect", self.name()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_lowercase();
            if stderr.contains("no such") || stderr.contains("not known") {
                return Ok(None);
            }
            bail!("Container inspect failed: {}", stderr.trim());
        }

        parse_inspect(&output.stdout)
    }

    fn watch_unit(&self, id: &str) -> Result<Box<dyn UnitWaiter>> {
        let cmd = self.cmd().args(["wait", id]).into_command();
        Ok(Box::new(CliWaiter::spawn(cmd, id)?))
    }

    fn exec(&self, id: &str, request: &ExecRequest) -> Result<ExecOutput> {
        debug!(unit = id, command = %request.command, "engine:exec");
        let cmd = self.cmd().args(Self::exec_args(id, request)).into_command();
        run_with_timeout(cmd, request.stdin.as_deref(), request.timeout)
            .with_context(|| format!("Failed to exec in unit {}", id))
    }

    fn kill_unit(&self, id: &str, signal: Signal) -> Result<()> {
        info!(unit = id, signal = signal.as_str(), "engine:kill");
        self.cmd()
            .args(["kill", "--signal", signal.as_str(), id])
            .run_tolerating(&["is not running", "no such container", "not running"])
    }

    fn remove_unit(&self, id: &str) -> Result<()> {
        debug!(unit = id, "engine:remove unit");
        self.cmd()
            .args(["rm", "--force", "--volumes", id])
            .run_tolerating(&["no such container", "not known"])
    }

    fn list_units(&self, label: (&str, &str)) -> Result<Vec<UnitInfo>> {
        let ids = self
            .cmd()
            .args(["ps", "--all", "--quiet", "--filter"])
            .arg(format!("label={}={}", label.0, label.1))
            .run_and_capture_stdout()?;

        let mut units = Vec::new();
        for id in ids.lines().map(str::trim).filter(|l| !l.is_empty()) {
            // A unit can disappear between `ps` and `inspect`.
            if let Some(info) = self.inspect_unit(id)? {
                units.push(info);
            }
        }
        Ok(units)
    }
}
