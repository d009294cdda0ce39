//! In-process engine used by tests.
//!
//! Units are host directories under a temp root; commands run with `sh -c`
//! inside them. Absolute in-unit paths are re-rooted under the unit's
//! directory, so tests should stick to paths relative to the workdir.

use anyhow::{Result, anyhow, bail};
use regex::Regex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;
use tempfile::TempDir;

use super::{
    Engine, ExecOutput, ExecRequest, Signal, UnitInfo, UnitSpec, UnitStatus, UnitWaiter,
    WaitOutcome, run_with_timeout,
};

struct FakeUnit {
    info: UnitInfo,
    root: PathBuf,
}

#[derive(Default)]
struct FakeState {
    images: BTreeMap<String, BTreeMap<String, String>>,
    pullable: HashSet<String>,
    networks: HashSet<String>,
    units: BTreeMap<String, FakeUnit>,
    responders: HashMap<String, ExecOutput>,
    unresolvable: HashSet<String>,
    calls: Vec<String>,
    next_id: u64,
    fail_creates: bool,
}

/// State shared with outstanding waiters.
#[derive(Default)]
struct Shared {
    state: Mutex<FakeState>,
    changed: Condvar,
    waiters: AtomicUsize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake engine state poisoned")
    }
}

struct FakeWaiter {
    shared: Arc<Shared>,
    id: String,
    cancelled: AtomicBool,
}

impl UnitWaiter for FakeWaiter {
    fn wait(&self) -> Result<WaitOutcome> {
        let mut state = self.shared.lock();
        loop {
            if self.cancelled.load(Ordering::SeqCst) {
                return Ok(WaitOutcome::Cancelled);
            }
            match state.units.get(&self.id).map(|u| u.info.status) {
                None => bail!("No such container: {}", self.id),
                Some(UnitStatus::Exited(code)) => return Ok(WaitOutcome::Exited(code)),
                Some(_) => {
                    state = self
                        .shared
                        .changed
                        .wait(state)
                        .map_err(|_| anyhow!("fake engine state poisoned"))?;
                }
            }
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let _state = self.shared.lock();
        self.shared.changed.notify_all();
    }
}

impl Drop for FakeWaiter {
    fn drop(&mut self) {
        self.shared.waiters.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct FakeEngine {
    root: TempDir,
    shared: Arc<Shared>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self {
            root: TempDir::new().expect("temp root"),
            shared: Arc::new(Shared::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.shared.lock()
    }

    fn notify(&self) {
        self.shared.changed.notify_all();
    }

    /// Waiters handed out by `watch_unit` and not yet dropped.
    pub fn active_waiters(&self) -> usize {
        self.shared.waiters.load(Ordering::SeqCst)
    }

    /// Register an already-built image.
    pub fn add_image(&self, tag: &str) {
        self.lock().images.insert(tag.to_string(), BTreeMap::new());
    }

    /// Allow `pull_image` to succeed for `tag`.
    pub fn allow_pull(&self, tag: &str) {
        self.lock().pullable.insert(tag.to_string());
    }

    /// Make builds that install `package` fail like apt would.
    pub fn make_unresolvable(&self, package: &str) {
        self.lock().unresolvable.insert(package.to_string());
    }

    /// Answer an exact command line without touching the host.
    pub fn respond(&self, command: &str, output: ExecOutput) {
        self.lock().responders.insert(command.to_string(), output);
    }

    /// Make every `create_unit` fail.
    pub fn fail_creates(&self, fail: bool) {
        self.lock().fail_creates = fail;
    }

    /// Simulate the keep-alive process dying on its own.
    pub fn crash(&self, id: &str, exit_code: i64) {
        let mut state = self.lock();
        if let Some(unit) = state.units.get_mut(id) {
            unit.info.status = UnitStatus::Exited(Some(exit_code));
        }
        self.notify();
    }

    /// Remove a unit behind the caller's back.
    pub fn vanish(&self, id: &str) {
        self.lock().units.remove(id);
        self.notify();
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn unit_count(&self) -> usize {
        self.lock().units.len()
    }

    pub fn unit_root(&self, id: &str) -> Option<PathBuf> {
        self.lock().units.get(id).map(|u| u.root.clone())
    }

    pub fn has_network(&self, name: &str) -> bool {
        self.lock().networks.contains(name)
    }

    fn resolve<'a>(state: &'a FakeState, name_or_id: &str) -> Option<&'a FakeUnit> {
        state
            .units
            .get(name_or_id)
            .or_else(|| state.units.values().find(|u| u.info.name == name_or_id))
    }
}

fn in_unit(root: &Path, path: &str) -> PathBuf {
    root.join(path.trim_start_matches('/'))
}

fn parse_dockerfile(dockerfile: &str) -> (BTreeMap<String, String>, Vec<String>) {
    let label_re = Regex::new(r#"^LABEL\s+([^=\s]+)="([^"]*)""#).expect("valid regex");
    let mut labels = BTreeMap::new();
    let mut packages = Vec::new();
    let mut in_install = false;

    for line in dockerfile.lines() {
        let line = line.trim();
        if let Some(caps) = label_re.captures(line) {
            labels.insert(caps[1].to_string(), caps[2].to_string());
        }
        if line.contains("apt-get install") {
            in_install = true;
        }
        if in_install {
            for token in line.split_whitespace() {
                if token.chars().next().is_some_and(|c| c.is_ascii_lowercase())
                    && !["apt-get", "install", "rm", "update"].contains(&token)
                {
                    packages.push(token.to_string());
                }
            }
            if line.contains("rm -rf") {
                in_install = false;
            }
        }
    }
    (labels, packages)
}

impl Engine for FakeEngine {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn build_image(&self, tag: &str, context_dir: &Path) -> Result<()> {
        let dockerfile = fs::read_to_string(context_dir.join("Dockerfile"))?;
        let (labels, packages) = parse_dockerfile(&dockerfile);
        let mut state = self.lock();
        state.calls.push(format!("build {tag}"));
        if let Some(missing) = packages.iter().find(|p| state.unresolvable.contains(*p)) {
            bail!("E: Unable to locate package {missing}");
        }
        state.images.insert(tag.to_string(), labels);
        Ok(())
    }

    fn image_exists(&self, tag: &str) -> Result<bool> {
        Ok(self.lock().images.contains_key(tag))
    }

    fn image_labels(&self, tag: &str) -> Result<BTreeMap<String, String>> {
        self.lock()
            .images
            .get(tag)
            .cloned()
            .ok_or_else(|| anyhow!("No such image: {tag}"))
    }

    fn pull_image(&self, tag: &str) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(format!("pull {tag}"));
        if !state.pullable.contains(tag) {
            bail!("pull access denied for {tag}");
        }
        state.images.insert(tag.to_string(), BTreeMap::new());
        Ok(())
    }

    fn remove_image(&self, tag: &str) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(format!("rmi {tag}"));
        state.images.remove(tag);
        Ok(())
    }

    fn ensure_network(&self, name: &str) -> Result<()> {
        self.lock().networks.insert(name.to_string());
        Ok(())
    }

    fn create_unit(&self, spec: &UnitSpec) -> Result<String> {
        let mut state = self.lock();
        if state.fail_creates {
            bail!("Error response from daemon: failed to create container");
        }
        let Some(image_labels) = state.images.get(&spec.image).cloned() else {
            bail!("No such image: {}", spec.image);
        };
        if state.units.values().any(|u| u.info.name == spec.name) {
            bail!("Conflict. The container name \"/{}\" is already in use", spec.name);
        }
        state.next_id += 1;
        let id = format!("fake{:08x}", state.next_id);
        let root = self.root.path().join(&id);
        fs::create_dir_all(in_unit(&root, &spec.workdir))?;

        let mut labels = image_labels;
        labels.extend(spec.labels.clone());
        state.calls.push(format!("create {}", spec.name));
        state.units.insert(
            id.clone(),
            FakeUnit {
                info: UnitInfo {
                    id: id.clone(),
                    name: spec.name.clone(),
                    image: spec.image.clone(),
                    workdir: spec.workdir.clone(),
                    status: UnitStatus::Created,
                    labels,
                },
                root,
            },
        );
        Ok(id)
    }

    fn start_unit(&self, id: &str) -> Result<()> {
        let mut state = self.lock();
        let unit = state
            .units
            .get_mut(id)
            .ok_or_else(|| anyhow!("No such container: {id}"))?;
        if unit.info.status == UnitStatus::Created {
            unit.info.status = UnitStatus::Running;
        }
        self.notify();
        Ok(())
    }

    fn inspect_unit(&self, name_or_id: &str) -> Result<Option<UnitInfo>> {
        let state = self.lock();
        Ok(Self::resolve(&state, name_or_id).map(|u| u.info.clone()))
    }

    fn watch_unit(&self, id: &str) -> Result<Box<dyn UnitWaiter>> {
        self.shared.waiters.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeWaiter {
            shared: Arc::clone(&self.shared),
            id: id.to_string(),
            cancelled: AtomicBool::new(false),
        }))
    }

    fn exec(&self, id: &str, request: &ExecRequest) -> Result<ExecOutput> {
        let (root, canned) = {
            let mut state = self.lock();
            state.calls.push(format!("exec {}", request.command));
            let unit = Self::resolve(&state, id).ok_or_else(|| anyhow!("No such container: {id}"))?;
            if unit.info.status != UnitStatus::Running {
                bail!("container {id} is not running");
            }
            let root = unit.root.clone();
            (root, state.responders.get(&request.command).cloned())
        };
        if let Some(output) = canned {
            return Ok(output);
        }

        let dir = in_unit(&root, &request.workdir);
        let mut cmd = Command::new("sh");
        cmd.args(["-c", &request.command]).current_dir(&dir);
        run_with_timeout(cmd, request.stdin.as_deref(), request.timeout)
    }

    fn kill_unit(&self, id: &str, signal: Signal) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(format!("kill {} {id}", signal.as_str()));
        if let Some(unit) = state.units.get_mut(id)
            && unit.info.status == UnitStatus::Running
        {
            unit.info.status = UnitStatus::Exited(Some(signal.exit_code()));
        }
        self.notify();
        Ok(())
    }

    fn remove_unit(&self, id: &str) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(format!("rm {id}"));
        let key = Self::resolve(&state, id).map(|u| u.info.id.clone());
        if let Some(key) = key
            && let Some(unit) = state.units.remove(&key)
        {
            let _ = fs::remove_dir_all(unit.root);
        }
        self.notify();
        Ok(())
    }

    fn list_units(&self, label: (&str, &str)) -> Result<Vec<UnitInfo>> {
        let state = self.lock();
        Ok(state
            .units
            .values()
            .filter(|u| u.info.labels.get(label.0).map(String::as_str) == Some(label.1))
            .map(|u| u.info.clone())
            .collect())
    }
}

/// Short timeout for test commands.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_labels_and_packages() {
        let dockerfile = "FROM debian:12\n\
            LABEL ai-sandbox.capabilities=\"transfer,text-search\"\n\
            RUN apt-get update \\\n    && apt-get install -y --no-install-recommends \\\n        curl \\\n        grep \\\n    && rm -rf /var/lib/apt/lists/*\n";
        let (labels, packages) = parse_dockerfile(dockerfile);
        assert_eq!(
            labels.get("ai-sandbox.capabilities").map(String::as_str),
            Some("transfer,text-search")
        );
        assert!(packages.contains(&"curl".to_string()));
        assert!(packages.contains(&"grep".to_string()));
    }

    #[test]
    fn kill_wakes_waiters() {
        let engine = std::sync::Arc::new(FakeEngine::new());
        engine.add_image("img");
        let id = engine
            .create_unit(&UnitSpec {
                name: "u".into(),
                image: "img".into(),
                workdir: "/workspace".into(),
                ..Default::default()
            })
            .unwrap();
        engine.start_unit(&id).unwrap();

        let waiter = engine.watch_unit(&id).unwrap();
        let blocked = std::thread::spawn(move || waiter.wait().unwrap());
        engine.kill_unit(&id, Signal::Kill).unwrap();
        assert_eq!(blocked.join().unwrap(), WaitOutcome::Exited(Some(137)));
        assert_eq!(engine.active_waiters(), 0);
    }

    #[test]
    fn cancel_releases_waiter() {
        let engine = FakeEngine::new();
        engine.add_image("img");
        let id = engine
            .create_unit(&UnitSpec {
                name: "u".into(),
                image: "img".into(),
                workdir: "/workspace".into(),
                ..Default::default()
            })
            .unwrap();
        engine.start_unit(&id).unwrap();

        let waiter: std::sync::Arc<dyn UnitWaiter> = engine.watch_unit(&id).unwrap().into();
        assert_eq!(engine.active_waiters(), 1);
        let blocked = {
            let waiter = waiter.clone();
            std::thread::spawn(move || waiter.wait().unwrap())
        };
        waiter.cancel();
        assert_eq!(blocked.join().unwrap(), WaitOutcome::Cancelled);
        drop(waiter);
        assert_eq!(engine.active_waiters(), 0);
    }
}
