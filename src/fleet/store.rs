//! JSON file holding every session record.
//!
//! Each operation reloads the file and writes it back through a temp file and
//! rename, so readers never see a half-written store. Concurrent writers from
//! different processes are last-writer-wins.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, trace};

use super::record::{SandboxRecord, SandboxStatus, now_secs};
use crate::engine::ResourceLimits;
use crate::unit::random_hex;

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    sandboxes: Vec<SandboxRecord>,
}

/// Fields of a record that the caller decides.
#[derive(Debug, Clone)]
pub struct NewRecord<'a> {
    pub agent_id: &'a str,
    pub container_name: &'a str,
    pub image: &'a str,
    pub resources: &'a ResourceLimits,
    pub last_command: Option<&'a str>,
}

pub struct RecordStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl RecordStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    #[cfg(test)]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    fn load(&self) -> Result<StoreFile> {
        if !self.path.exists() {
            return Ok(StoreFile::default());
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        if content.trim().is_empty() {
            return Ok(StoreFile::default());
        }
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", self.path.display()))
    }

    fn save(&self, file: &StoreFile) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(file)?;

        let temp_path = self.path.with_extension("json.tmp");
        let mut temp = fs::File::create(&temp_path)
            .with_context(|| format!("Failed to create {}", temp_path.display()))?;
        temp.write_all(json.as_bytes())?;
        temp.sync_all()?;
        fs::rename(&temp_path, &self.path).with_context(|| {
            format!(
                "Failed to rename {} to {}",
                temp_path.display(),
                self.path.display()
            )
        })?;
        trace!(path = %self.path.display(), records = file.sandboxes.len(), "store:saved");
        Ok(())
    }

    /// Load, let `f` modify, save. Serialized within this process.
    fn modify<T>(&self, f: impl FnOnce(&mut StoreFile) -> Result<T>) -> Result<T> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = self.load()?;
        let result = f(&mut file)?;
        self.save(&file)?;
        Ok(result)
    }

    pub fn create(&self, new: NewRecord<'_>) -> Result<SandboxRecord> {
        let now = now_secs();
        let record = SandboxRecord {
            id: random_hex(16)?,
            agent_id: new.agent_id.to_string(),
            container_id: None,
            container_name: new.container_name.to_string(),
            status: SandboxStatus::Pending,
            created_at: now,
            updated_at: now,
            last_command: new.last_command.map(str::to_string),
            last_run: None,
            image: new.image.to_string(),
            resources: new.resources.clone(),
            error: None,
            is_active: true,
        };
        debug!(id = %record.id, agent = %record.agent_id, "store:create");
        self.modify(|file| {
            file.sandboxes.push(record.clone());
            Ok(record)
        })
    }

    pub fn get(&self, id: &str) -> Result<Option<SandboxRecord>> {
        Ok(self.load()?.sandboxes.into_iter().find(|r| r.id == id))
    }

    /// Apply `f` to the record and bump `updated_at`.
    pub fn update(&self, id: &str, f: impl FnOnce(&mut SandboxRecord)) -> Result<SandboxRecord> {
        self.modify(|file| {
            let record = file
                .sandboxes
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or_else(|| anyhow!("Sandbox with id '{id}' not found"))?;
            f(record);
            record.updated_at = now_secs();
            debug!(id, status = %record.status, active = record.is_active, "store:update");
            Ok(record.clone())
        })
    }

    pub fn deactivate(&self, id: &str) -> Result<SandboxRecord> {
        self.update(id, |r| r.is_active = false)
    }

    /// Active records that may still be reused.
    pub fn active(&self) -> Result<Vec<SandboxRecord>> {
        Ok(self
            .all()?
            .into_iter()
            .filter(|r| r.is_active && r.status.is_usable())
            .collect())
    }

    /// Active records whose session failed.
    pub fn broken(&self) -> Result<Vec<SandboxRecord>> {
        Ok(self
            .all()?
            .into_iter()
            .filter(|r| r.is_active && r.status == SandboxStatus::Failed)
            .collect())
    }

    pub fn all(&self) -> Result<Vec<SandboxRecord>> {
        Ok(self.load()?.sandboxes)
    }

    /// Returns false if no record had that id.
    pub fn delete(&self, id: &str) -> Result<bool> {
        self.modify(|file| {
            let before = file.sandboxes.len();
            file.sandboxes.retain(|r| r.id != id);
            Ok(file.sandboxes.len() != before)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, RecordStore) {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::new(dir.path().join("state/sandboxes.json"));
        (dir, store)
    }

    fn new_record<'a>(agent: &'a str, resources: &'a ResourceLimits) -> NewRecord<'a> {
        NewRecord {
            agent_id: agent,
            container_name: "sandbox-a",
            image: "img",
            resources,
            last_command: Some("echo hi"),
        }
    }

    #[test]
    fn missing_file_is_empty() {
        let (_dir, store) = store();
        assert!(store.all().unwrap().is_empty());
        assert!(store.get("nope").unwrap().is_none());
    }

    #[test]
    fn create_get_update_delete() {
        let (_dir, store) = store();
        let resources = ResourceLimits::default();
        let record = store.create(new_record("a", &resources)).unwrap();
        assert_eq!(record.status, SandboxStatus::Pending);
        assert!(record.is_active);
        assert_eq!(record.id.len(), 32);

        let fetched = store.get(&record.id).unwrap().unwrap();
        assert_eq!(fetched, record);

        let updated = store
            .update(&record.id, |r| {
                r.status = SandboxStatus::Running;
                r.container_id = Some("c1".to_string());
            })
            .unwrap();
        assert_eq!(updated.status, SandboxStatus::Running);
        assert_eq!(store.get(&record.id).unwrap().unwrap(), updated);

        assert!(store.delete(&record.id).unwrap());
        assert!(!store.delete(&record.id).unwrap());
        assert!(store.all().unwrap().is_empty());
    }

    #[test]
    fn update_missing_record_fails() {
        let (_dir, store) = store();
        let err = store.update("ghost", |_| {}).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn active_and_broken_filters() {
        let (_dir, store) = store();
        let resources = ResourceLimits::default();
        let running = store.create(new_record("a", &resources)).unwrap();
        store
            .update(&running.id, |r| r.status = SandboxStatus::Running)
            .unwrap();
        let failed = store.create(new_record("b", &resources)).unwrap();
        store
            .update(&failed.id, |r| r.status = SandboxStatus::Failed)
            .unwrap();
        let gone = store.create(new_record("c", &resources)).unwrap();
        store.deactivate(&gone.id).unwrap();

        let active: Vec<_> = store.active().unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(active, vec![running.id]);
        let broken: Vec<_> = store.broken().unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(broken, vec![failed.id]);
        assert_eq!(store.all().unwrap().len(), 3);
    }

    #[test]
    fn save_leaves_no_temp_file() {
        let (_dir, store) = store();
        let resources = ResourceLimits::default();
        store.create(new_record("a", &resources)).unwrap();
        assert!(store.path().exists());
        assert!(!store.path().with_extension("json.tmp").exists());

        // The file is plain JSON other tools can read.
        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(raw["sandboxes"][0]["status"], "pending");
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let (_dir, store) = store();
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), "{not json").unwrap();
        assert!(store.all().is_err());
    }
}
