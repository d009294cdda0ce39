//! Per-agent sandbox sessions.
//!
//! Each agent gets at most one live unit, named `sandbox-<agent>`, which is
//! reused across commands until it dies or is stopped. Session records persist
//! in a [`RecordStore`] so separate invocations (and the monitor loop) agree on
//! what exists.

mod record;
mod store;

pub use record::{CommandRun, SandboxRecord, SandboxStatus};
pub(crate) use record::now_secs;
pub use store::{NewRecord, RecordStore};

use anyhow::{Context, Result, anyhow, bail};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::engine::{Engine, ExecOutput, MANAGED_LABEL, ResourceLimits, UnitSpec, UnitStatus, VolumeMount};
use crate::image::WORKDIR_LABEL;
use crate::unit::Unit;

pub const AGENT_LABEL: &str = "ai-sandbox.agent";
pub const SESSION_LABEL: &str = "ai-sandbox.session";

/// Everything a new session unit is created with.
#[derive(Debug, Clone)]
pub struct FleetSettings {
    pub default_image: String,
    /// Used when the image carries no workdir label.
    pub workdir: String,
    pub resources: ResourceLimits,
    pub network: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub shared_dir: Option<(PathBuf, String)>,
    pub exec_timeout: Duration,
}

impl FleetSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            default_image: config.session_image().to_string(),
            workdir: config.image.workdir(),
            resources: config.units.resources(),
            network: config.units.network().map(str::to_string),
            labels: config.units.labels(),
            shared_dir: Some((
                config.fleet.shared_dir(),
                config.fleet.shared_dir_target().to_string(),
            )),
            exec_timeout: config.units.exec_timeout(),
        }
    }
}

/// A command run inside an agent's session.
#[derive(Debug, Clone)]
pub struct SessionRun {
    pub record: SandboxRecord,
    pub output: ExecOutput,
    /// False when an existing session was reused.
    pub provisioned: bool,
}

#[derive(Debug, Default)]
pub struct RegenerateReport {
    /// Sessions that died since the last pass.
    pub marked_failed: Vec<String>,
    /// `(old record id, new record id)`
    pub regenerated: Vec<(String, String)>,
    /// `(old record id, error)`
    pub failed: Vec<(String, String)>,
}

pub struct FleetManager {
    engine: Arc<dyn Engine>,
    store: RecordStore,
    settings: FleetSettings,
}

/// Unit name for an agent's session.
pub fn container_name(agent_id: &str) -> Result<String> {
    let slug = slug::slugify(agent_id);
    if slug.is_empty() {
        bail!("Agent id '{agent_id}' has no usable characters");
    }
    Ok(format!("sandbox-{slug}"))
}

impl FleetManager {
    pub fn new(engine: Arc<dyn Engine>, store: RecordStore, settings: FleetSettings) -> Self {
        Self {
            engine,
            store,
            settings,
        }
    }

    #[cfg(test)]
    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    /// Run `command` in the agent's session, provisioning one if needed.
    pub fn run_in_session(
        &self,
        agent_id: &str,
        command: &str,
        image: Option<&str>,
    ) -> Result<SessionRun> {
        let image = image.unwrap_or(&self.settings.default_image).to_string();

        let (record, unit, provisioned) = match self.find_live_session(agent_id)? {
            Some((record, unit)) => {
                info!(agent = agent_id, id = %record.id, "fleet:reusing session");
                let record = self
                    .store
                    .update(&record.id, |r| r.last_command = Some(command.to_string()))?;
                (record, unit, false)
            }
            None => {
                info!(agent = agent_id, image = %image, "fleet:provisioning session");
                let (record, unit) = self.provision(agent_id, Some(command), &image)?;
                (record, unit, true)
            }
        };

        debug!(agent = agent_id, id = %record.id, command, "fleet:exec");
        let output = match unit.exec(command, self.settings.exec_timeout) {
            Ok(output) => output,
            Err(e) => {
                // The unit died between the liveness check and the exec.
                let message = format!("{e:#}");
                self.store.update(&record.id, |r| {
                    r.status = SandboxStatus::Failed;
                    r.error = Some(message);
                })?;
                return Err(e);
            }
        };

        let run = CommandRun::from_output(command, &output);
        info!(
            agent = agent_id,
            id = %record.id,
            outcome = %run.outcome,
            exit_code = ?run.exit_code,
            "fleet:command finished"
        );
        let record = self.store.update(&record.id, |r| r.last_run = Some(run))?;
        Ok(SessionRun {
            record,
            output,
            provisioned,
        })
    }

    /// First active session of the agent whose unit is still alive. Stale
    /// sessions found along the way are deactivated and their units removed.
    fn find_live_session(&self, agent_id: &str) -> Result<Option<(SandboxRecord, Unit)>> {
        for record in self.store.active()? {
            if record.agent_id != agent_id {
                continue;
            }
            let unit = match &record.container_id {
                Some(id) => Unit::attach(Arc::clone(&self.engine), id)?,
                None => None,
            };
            match unit {
                Some(unit) if unit.is_alive() => return Ok(Some((record, unit))),
                unit => {
                    info!(
                        agent = agent_id,
                        id = %record.id,
                        state = ?unit.as_ref().map(Unit::state),
                        "fleet:deactivating stale session"
                    );
                    self.store.deactivate(&record.id)?;
                    if let Some(container_id) = &record.container_id {
                        self.remove_container(container_id);
                    }
                }
            }
        }
        Ok(None)
    }

    fn provision(
        &self,
        agent_id: &str,
        command: Option<&str>,
        image: &str,
    ) -> Result<(SandboxRecord, Unit)> {
        let name = container_name(agent_id)?;

        if let Some(existing) = self.engine.inspect_unit(&name)? {
            info!(unit = %name, id = %existing.id, "fleet:removing conflicting unit");
            self.engine
                .remove_unit(&existing.id)
                .with_context(|| format!("Failed to remove existing unit '{name}'"))?;
        }

        self.ensure_image(image)?;

        let record = self.store.create(NewRecord {
            agent_id,
            container_name: &name,
            image,
            resources: &self.settings.resources,
            last_command: command,
        })?;

        match self.start_unit(&record, image) {
            Ok(unit) => {
                let container_id = unit.id().to_string();
                let record = self.store.update(&record.id, |r| {
                    r.status = SandboxStatus::Running;
                    r.container_id = Some(container_id);
                })?;
                Ok((record, unit))
            }
            Err(e) => {
                error!(agent = agent_id, id = %record.id, error = %e, "fleet:provisioning failed");
                let message = format!("Provisioning error: {e:#}");
                self.store.update(&record.id, |r| {
                    r.status = SandboxStatus::Failed;
                    r.error = Some(message);
                })?;
                Err(e)
            }
        }
    }

    fn ensure_image(&self, image: &str) -> Result<()> {
        if self.engine.image_exists(image)? {
            return Ok(());
        }
        info!(image, "fleet:pulling image");
        self.engine
            .pull_image(image)
            .with_context(|| format!("Failed to pull image: {image}"))
    }

    fn start_unit(&self, record: &SandboxRecord, image: &str) -> Result<Unit> {
        let workdir = self
            .engine
            .image_labels(image)
            .ok()
            .and_then(|labels| labels.get(WORKDIR_LABEL).cloned())
            .unwrap_or_else(|| self.settings.workdir.clone());

        if let Some(network) = &self.settings.network {
            self.engine.ensure_network(network)?;
        }

        let mut volumes = Vec::new();
        if let Some((host, target)) = &self.settings.shared_dir {
            fs::create_dir_all(host)
                .with_context(|| format!("Failed to create shared dir {}", host.display()))?;
            volumes.push(VolumeMount {
                host: host.canonicalize()?,
                target: target.clone(),
                read_only: false,
            });
        }

        let mut labels = self.settings.labels.clone();
        labels.insert(MANAGED_LABEL.0.to_string(), MANAGED_LABEL.1.to_string());
        labels.insert(AGENT_LABEL.to_string(), record.agent_id.clone());
        labels.insert(SESSION_LABEL.to_string(), record.id.clone());

        let spec = UnitSpec {
            name: record.container_name.clone(),
            image: image.to_string(),
            workdir,
            labels,
            resources: Some(self.settings.resources.clone()),
            network: self.settings.network.clone(),
            volumes,
        };
        let unit = Unit::create(Arc::clone(&self.engine), &spec)?;
        if let Err(e) = unit.start() {
            if let Err(cleanup) = unit.destroy() {
                warn!(unit = unit.name(), error = %cleanup, "fleet:failed to clean up unit");
            }
            return Err(e);
        }
        Ok(unit)
    }

    fn remove_container(&self, container_id: &str) {
        match self.engine.remove_unit(container_id) {
            Ok(()) => debug!(container_id, "fleet:removed unit"),
            Err(e) => warn!(container_id, error = %e, "fleet:could not remove unit"),
        }
    }

    fn unit_is_running(&self, record: &SandboxRecord) -> bool {
        let Some(container_id) = &record.container_id else {
            return false;
        };
        match self.engine.inspect_unit(container_id) {
            Ok(Some(info)) => info.status == UnitStatus::Running,
            Ok(None) => false,
            Err(e) => {
                // Unknown: leave the session alone.
                warn!(id = %record.id, error = %e, "fleet:liveness check failed");
                true
            }
        }
    }

    pub fn status(&self, id: &str) -> Result<SandboxRecord> {
        self.store
            .get(id)?
            .ok_or_else(|| anyhow!("Sandbox with id '{id}' not found"))
    }

    pub fn list(&self) -> Result<Vec<SandboxRecord>> {
        self.store.all()
    }

    /// Replace broken sessions with fresh ones, replaying their last command.
    pub fn regenerate_broken(&self) -> Result<RegenerateReport> {
        let mut report = RegenerateReport::default();

        for record in self.store.active()? {
            if record.status == SandboxStatus::Running && !self.unit_is_running(&record) {
                info!(id = %record.id, agent = %record.agent_id, "fleet:session unit died");
                self.store.update(&record.id, |r| {
                    r.status = SandboxStatus::Failed;
                    r.error = Some("Unit is no longer alive".to_string());
                })?;
                report.marked_failed.push(record.id);
            }
        }

        for record in self.store.broken()? {
            info!(id = %record.id, agent = %record.agent_id, "fleet:regenerating session");
            self.store
                .update(&record.id, |r| r.status = SandboxStatus::Regenerating)?;
            if let Some(container_id) = &record.container_id {
                self.remove_container(container_id);
            }
            self.store.deactivate(&record.id)?;

            let result = match &record.last_command {
                Some(command) => self
                    .run_in_session(&record.agent_id, command, Some(&record.image))
                    .map(|run| run.record),
                None => self
                    .provision(&record.agent_id, None, &record.image)
                    .map(|(record, _unit)| record),
            };
            match result {
                Ok(new) => {
                    info!(old = %record.id, new = %new.id, "fleet:regenerated session");
                    report.regenerated.push((record.id, new.id));
                }
                Err(e) => {
                    warn!(id = %record.id, error = %e, "fleet:regeneration failed");
                    report.failed.push((record.id, format!("{e:#}")));
                }
            }
        }
        Ok(report)
    }

    /// Delete inactive records and their units. Returns how many were removed.
    pub fn cleanup_inactive(&self) -> Result<usize> {
        let mut removed = 0;
        for record in self.store.all()? {
            if record.is_active {
                continue;
            }
            debug!(id = %record.id, "fleet:deleting inactive record");
            self.store.delete(&record.id)?;
            if let Some(container_id) = &record.container_id {
                self.remove_container(container_id);
            }
            removed += 1;
        }
        Ok(removed)
    }

    /// Terminate and remove every active session of the agent.
    pub fn stop(&self, agent_id: &str) -> Result<Vec<SandboxRecord>> {
        let mut stopped = Vec::new();
        for record in self.store.all()? {
            if record.agent_id != agent_id || !record.is_active {
                continue;
            }
            if let Some(container_id) = &record.container_id
                && let Some(unit) = Unit::attach(Arc::clone(&self.engine), container_id)?
            {
                unit.destroy()?;
            }
            let record = self.store.update(&record.id, |r| {
                r.status = SandboxStatus::Stopped;
                r.is_active = false;
            })?;
            info!(agent = agent_id, id = %record.id, "fleet:stopped session");
            stopped.push(record);
        }
        Ok(stopped)
    }

    /// One regenerate + cleanup pass. Errors are logged, not returned.
    pub fn monitor_pass(&self) {
        match self.regenerate_broken() {
            Ok(report) => debug!(
                marked_failed = report.marked_failed.len(),
                regenerated = report.regenerated.len(),
                failed = report.failed.len(),
                "fleet:regenerate pass"
            ),
            Err(e) => error!(error = %e, "fleet:regenerate pass failed"),
        }
        match self.cleanup_inactive() {
            Ok(removed) => debug!(removed, "fleet:cleanup pass"),
            Err(e) => error!(error = %e, "fleet:cleanup pass failed"),
        }
    }

    /// Run passes every `interval` until `stop` is set.
    pub fn monitor(&self, interval: Duration, stop: &AtomicBool) {
        info!(interval_secs = interval.as_secs(), "fleet:monitor start");
        while !stop.load(Ordering::SeqCst) {
            self.monitor_pass();
            let started = Instant::now();
            while started.elapsed() < interval && !stop.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(200).min(interval));
            }
        }
        info!("fleet:monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::FakeEngine;
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        fake: Arc<FakeEngine>,
        fleet: FleetManager,
    }

    fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let fake = Arc::new(FakeEngine::new());
        fake.add_image("ai-sandbox:latest");
        let engine: Arc<dyn Engine> = fake.clone();
        let settings = FleetSettings {
            default_image: "ai-sandbox:latest".to_string(),
            workdir: "/workspace".to_string(),
            resources: ResourceLimits::default(),
            network: Some("sandbox_network".to_string()),
            labels: BTreeMap::from([("com.example.type".to_string(), "sandbox".to_string())]),
            shared_dir: None,
            exec_timeout: Duration::from_secs(10),
        };
        let store = RecordStore::new(dir.path().join("sandboxes.json"));
        Harness {
            _dir: dir,
            fake,
            fleet: FleetManager::new(engine, store, settings),
        }
    }

    #[test]
    fn container_names_are_slugged() {
        assert_eq!(container_name("agent-1").unwrap(), "sandbox-agent-1");
        assert_eq!(container_name("Agent One").unwrap(), "sandbox-agent-one");
        assert!(container_name("!!!").is_err());
    }

    #[test]
    fn first_run_provisions_a_session() {
        let h = harness();
        let run = h.fleet.run_in_session("agent-1", "echo hi", None).unwrap();

        assert!(run.provisioned);
        assert_eq!(run.output.stdout, "hi\n");
        let record = run.record;
        assert_eq!(record.status, SandboxStatus::Running);
        assert_eq!(record.container_name, "sandbox-agent-1");
        assert_eq!(record.last_command.as_deref(), Some("echo hi"));
        let last = record.last_run.unwrap();
        assert_eq!(last.outcome, SandboxStatus::Success);
        assert_eq!(last.output, "hi\n");

        let info = h.fake.inspect_unit("sandbox-agent-1").unwrap().unwrap();
        assert_eq!(info.labels.get(AGENT_LABEL).map(String::as_str), Some("agent-1"));
        assert_eq!(info.labels.get(SESSION_LABEL), Some(&record.id));
        assert_eq!(
            info.labels.get("com.example.type").map(String::as_str),
            Some("sandbox")
        );
        assert!(h.fake.has_network("sandbox_network"));
    }

    #[test]
    fn session_is_reused_and_keeps_state() {
        let h = harness();
        let first = h
            .fleet
            .run_in_session("agent-1", "echo data > note.txt", None)
            .unwrap();
        let second = h.fleet.run_in_session("agent-1", "cat note.txt", None).unwrap();

        assert!(!second.provisioned);
        assert_eq!(second.record.id, first.record.id);
        assert_eq!(second.record.container_id, first.record.container_id);
        assert_eq!(second.output.stdout, "data\n");
        assert_eq!(h.fake.unit_count(), 1);
    }

    #[test]
    fn failed_command_keeps_session_usable() {
        let h = harness();
        let failed = h
            .fleet
            .run_in_session("agent-1", "echo bad >&2; exit 2", None)
            .unwrap();
        assert_eq!(failed.record.status, SandboxStatus::Running);
        let last = failed.record.last_run.unwrap();
        assert_eq!(last.outcome, SandboxStatus::Failed);
        assert_eq!(last.exit_code, Some(2));
        assert_eq!(last.error.as_deref(), Some("bad\n"));
        assert_eq!(last.output, "No output.");

        let next = h.fleet.run_in_session("agent-1", "echo ok", None).unwrap();
        assert!(!next.provisioned);
        assert!(h.fleet.store().broken().unwrap().is_empty());
    }

    #[test]
    fn dead_session_is_replaced() {
        let h = harness();
        let first = h.fleet.run_in_session("agent-1", "true", None).unwrap();
        let old_container = first.record.container_id.clone().unwrap();
        h.fake.crash(&old_container, 1);

        let second = h.fleet.run_in_session("agent-1", "echo again", None).unwrap();
        assert!(second.provisioned);
        assert_ne!(second.record.id, first.record.id);
        assert!(h.fake.inspect_unit(&old_container).unwrap().is_none());

        let old = h.fleet.status(&first.record.id).unwrap();
        assert!(!old.is_active);
    }

    #[test]
    fn conflicting_unit_is_removed() {
        let h = harness();
        h.fake
            .create_unit(&UnitSpec {
                name: "sandbox-agent-1".to_string(),
                image: "ai-sandbox:latest".to_string(),
                workdir: "/workspace".to_string(),
                ..Default::default()
            })
            .unwrap();

        let run = h.fleet.run_in_session("agent-1", "echo hi", None).unwrap();
        assert!(run.provisioned);
        assert_eq!(h.fake.unit_count(), 1);
    }

    #[test]
    fn missing_image_is_pulled() {
        let h = harness();
        h.fake.allow_pull("python:3.12");
        let run = h
            .fleet
            .run_in_session("agent-1", "echo hi", Some("python:3.12"))
            .unwrap();
        assert_eq!(run.record.image, "python:3.12");
        assert!(h.fake.calls().contains(&"pull python:3.12".to_string()));
    }

    #[test]
    fn unpullable_image_fails_without_record() {
        let h = harness();
        let err = h
            .fleet
            .run_in_session("agent-1", "echo hi", Some("nope:1"))
            .unwrap_err();
        assert!(err.to_string().contains("nope:1"));
        assert!(h.fleet.list().unwrap().is_empty());
    }

    #[test]
    fn provisioning_error_marks_record_failed() {
        let h = harness();
        h.fake.fail_creates(true);
        assert!(h.fleet.run_in_session("agent-1", "echo hi", None).is_err());

        let broken = h.fleet.store().broken().unwrap();
        assert_eq!(broken.len(), 1);
        assert!(broken[0].error.as_deref().unwrap().starts_with("Provisioning error"));
    }

    #[test]
    fn regenerate_replays_last_command() {
        let h = harness();
        let first = h
            .fleet
            .run_in_session("agent-1", "echo replayed", None)
            .unwrap();
        h.fake.crash(first.record.container_id.as_deref().unwrap(), 137);

        let report = h.fleet.regenerate_broken().unwrap();
        assert_eq!(report.marked_failed, vec![first.record.id.clone()]);
        assert_eq!(report.regenerated.len(), 1);
        assert!(report.failed.is_empty());

        let (old_id, new_id) = &report.regenerated[0];
        assert_eq!(old_id, &first.record.id);
        let new = h.fleet.status(new_id).unwrap();
        assert_eq!(new.status, SandboxStatus::Running);
        assert_eq!(new.last_run.unwrap().output, "replayed\n");

        let old = h.fleet.status(old_id).unwrap();
        assert!(!old.is_active);
        assert_eq!(old.status, SandboxStatus::Regenerating);

        assert_eq!(h.fleet.cleanup_inactive().unwrap(), 1);
        assert!(h.fleet.store().get(old_id).unwrap().is_none());
        assert_eq!(h.fleet.list().unwrap().len(), 1);
    }

    #[test]
    fn regenerate_after_provisioning_failure() {
        let h = harness();
        h.fake.fail_creates(true);
        let _ = h.fleet.run_in_session("agent-1", "echo late", None);
        h.fake.fail_creates(false);

        let report = h.fleet.regenerate_broken().unwrap();
        assert_eq!(report.regenerated.len(), 1);
        let new = h.fleet.status(&report.regenerated[0].1).unwrap();
        assert_eq!(new.last_run.unwrap().output, "late\n");
    }

    #[test]
    fn stop_destroys_unit() {
        let h = harness();
        let run = h.fleet.run_in_session("agent-1", "true", None).unwrap();
        let stopped = h.fleet.stop("agent-1").unwrap();

        assert_eq!(stopped.len(), 1);
        assert_eq!(stopped[0].status, SandboxStatus::Stopped);
        assert!(!stopped[0].is_active);
        assert_eq!(h.fake.unit_count(), 0);
        assert!(
            h.fake
                .calls()
                .iter()
                .any(|c| c.starts_with("kill KILL") && c.ends_with(run.record.container_id.as_deref().unwrap()))
        );
        // Nothing to regenerate for a stopped session.
        assert!(h.fleet.regenerate_broken().unwrap().regenerated.is_empty());
    }

    #[test]
    fn monitor_loop_regenerates_and_cleans_up() {
        let h = harness();
        let crashed = h.fleet.run_in_session("agent-1", "echo again", None).unwrap();
        let stopped = h.fleet.run_in_session("agent-2", "true", None).unwrap();
        h.fleet.stop("agent-2").unwrap();
        h.fake.crash(crashed.record.container_id.as_deref().unwrap(), 1);

        let stop = AtomicBool::new(false);
        let settled = thread::scope(|s| {
            let monitor = s.spawn(|| h.fleet.monitor(Duration::from_millis(20), &stop));
            let deadline = Instant::now() + Duration::from_secs(10);
            let mut settled = false;
            while Instant::now() < deadline {
                let records = h.fleet.list().unwrap();
                if records.len() == 1 && records[0].id != crashed.record.id {
                    settled = true;
                    break;
                }
                thread::sleep(Duration::from_millis(10));
            }
            stop.store(true, Ordering::SeqCst);
            monitor.join().unwrap();
            settled
        });
        assert!(settled, "monitor never replaced the crashed session");

        let records = h.fleet.list().unwrap();
        let replacement = &records[0];
        assert_eq!(replacement.agent_id, "agent-1");
        assert!(replacement.is_active);
        assert_eq!(replacement.status, SandboxStatus::Running);
        assert_eq!(replacement.last_run.as_ref().unwrap().output, "again\n");
        assert!(h.fleet.store().get(&crashed.record.id).unwrap().is_none());
        assert!(h.fleet.store().get(&stopped.record.id).unwrap().is_none());
        assert_eq!(h.fake.unit_count(), 1);
    }
}
