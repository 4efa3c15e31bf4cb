//! Sandbox Registry.
//!
//! The catalog of known sandboxes. It is not the source of truth for what
//! exists: [`reconcile`] compares it against the volumes the runtime reports
//! and the snapshots on disk, and mismatches are reported, never raised.

use crate::error::{ShadowError, ShadowResult};
use crate::lock::LockDir;
use crate::runtime::VolumeInfo;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Lifecycle state of a registered sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxState {
    /// Registered; snapshot or copy-in not yet finished.
    Provisioning,
    Running,
    /// Containers down, volumes kept.
    Stopped,
    /// Copy-in failed part way.
    Tainted,
}

impl std::fmt::Display for SandboxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SandboxState::Provisioning => "provisioning",
            SandboxState::Running => "running",
            SandboxState::Stopped => "stopped",
            SandboxState::Tainted => "tainted",
        };
        write!(f, "{}", s)
    }
}

/// One registered sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxRecord {
    pub name: String,
    pub volume: String,
    pub network: String,
    pub git_host_port: u16,
    pub workspace_path: PathBuf,
    pub snapshot_path: PathBuf,
    #[serde(default)]
    pub token_path: Option<PathBuf>,
    #[serde(default)]
    pub admin_user: Option<String>,
    pub created_at: DateTime<Utc>,
    pub state: SandboxState,
}

/// Persistence seam for the registry.
pub trait RegistryStore {
    /// Fails with `SandboxExists` if `record.name` is already registered.
    fn register(&self, record: SandboxRecord) -> ShadowResult<()>;

    /// Replace an existing record; `SandboxNotFound` if absent.
    fn update(&self, record: SandboxRecord) -> ShadowResult<()>;

    fn lookup(&self, name: &str) -> ShadowResult<Option<SandboxRecord>>;

    /// Remove and return the record; absent names are not an error.
    fn unregister(&self, name: &str) -> ShadowResult<Option<SandboxRecord>>;

    /// All records, sorted by name.
    fn list_all(&self) -> ShadowResult<Vec<SandboxRecord>>;

    /// Names that have an entry which could not be read, sorted. These are
    /// still registered as far as orphan detection is concerned.
    fn unreadable(&self) -> ShadowResult<Vec<String>> {
        Ok(Vec::new())
    }
}

/// In-memory registry for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    records: Mutex<BTreeMap<String, SandboxRecord>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> ShadowResult<std::sync::MutexGuard<'_, BTreeMap<String, SandboxRecord>>> {
        self.records
            .lock()
            .map_err(|_| ShadowError::Registry("registry mutex poisoned".into()))
    }
}

impl RegistryStore for MemoryRegistry {
    fn register(&self, record: SandboxRecord) -> ShadowResult<()> {
        let mut records = self.records()?;
        if records.contains_key(&record.name) {
            return Err(ShadowError::SandboxExists(record.name));
        }
        records.insert(record.name.clone(), record);
        Ok(())
    }

    fn update(&self, record: SandboxRecord) -> ShadowResult<()> {
        let mut records = self.records()?;
        match records.get_mut(&record.name) {
            Some(slot) => {
                *slot = record;
                Ok(())
            }
            None => Err(ShadowError::SandboxNotFound(record.name)),
        }
    }

    fn lookup(&self, name: &str) -> ShadowResult<Option<SandboxRecord>> {
        Ok(self.records()?.get(name).cloned())
    }

    fn unregister(&self, name: &str) -> ShadowResult<Option<SandboxRecord>> {
        Ok(self.records()?.remove(name))
    }

    fn list_all(&self) -> ShadowResult<Vec<SandboxRecord>> {
        Ok(self.records()?.values().cloned().collect())
    }
}

/// One JSON file per sandbox under `<home>/registry/`.
///
/// Reads go to disk every time so several processes see each other's
/// changes; mutations take the store lock and write through a temp file.
#[derive(Debug, Clone)]
pub struct JsonRegistry {
    dir: PathBuf,
    locks: LockDir,
}

impl JsonRegistry {
    pub fn open(dir: impl Into<PathBuf>, locks: LockDir) -> ShadowResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, locks })
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }

    fn read(path: &Path) -> ShadowResult<Option<SandboxRecord>> {
        match fs::read_to_string(path) {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Readable records and the names of entries that failed to parse.
    fn scan(&self) -> ShadowResult<(Vec<SandboxRecord>, Vec<String>)> {
        let mut records = Vec::new();
        let mut unreadable = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let name = match path.file_stem().map(|n| n.to_string_lossy().to_string()) {
                Some(name) if !name.starts_with('.') => name,
                _ => continue,
            };
            if path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }
            match Self::read(&path) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(path = ?path, error = %e, "unreadable registry entry");
                    unreadable.push(name);
                }
            }
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));
        unreadable.sort();
        Ok((records, unreadable))
    }

    fn write(&self, record: &SandboxRecord) -> ShadowResult<()> {
        let path = self.path(&record.name);
        let tmp = self.dir.join(format!(".{}.json.tmp", record.name));
        fs::write(&tmp, serde_json::to_string_pretty(record)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

impl RegistryStore for JsonRegistry {
    fn register(&self, record: SandboxRecord) -> ShadowResult<()> {
        let _guard = self.locks.store()?;
        if self.path(&record.name).exists() {
            return Err(ShadowError::SandboxExists(record.name));
        }
        self.write(&record)?;
        tracing::debug!(sandbox = %record.name, "registered");
        Ok(())
    }

    fn update(&self, record: SandboxRecord) -> ShadowResult<()> {
        let _guard = self.locks.store()?;
        if !self.path(&record.name).exists() {
            return Err(ShadowError::SandboxNotFound(record.name));
        }
        self.write(&record)
    }

    fn lookup(&self, name: &str) -> ShadowResult<Option<SandboxRecord>> {
        Self::read(&self.path(name))
    }

    fn unregister(&self, name: &str) -> ShadowResult<Option<SandboxRecord>> {
        let _guard = self.locks.store()?;
        let path = self.path(name);
        let record = Self::read(&path)?;
        if record.is_some() {
            fs::remove_file(&path)?;
            tracing::debug!(sandbox = %name, "unregistered");
        }
        Ok(record)
    }

    fn list_all(&self) -> ShadowResult<Vec<SandboxRecord>> {
        Ok(self.scan()?.0)
    }

    fn unreadable(&self) -> ShadowResult<Vec<String>> {
        Ok(self.scan()?.1)
    }
}

/// Registry cross-checked against what actually exists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Registered and backed by a volume.
    pub healthy: Vec<String>,
    /// Volumes whose sandbox is not registered.
    pub orphaned_volumes: Vec<VolumeInfo>,
    /// Snapshots whose sandbox is not registered.
    pub orphaned_snapshots: Vec<String>,
    /// Registered, but no volume exists any more.
    pub stale: Vec<String>,
    /// Entries that exist but could not be read; their resources are kept.
    pub unreadable: Vec<String>,
}

impl ReconcileReport {
    pub fn has_orphans(&self) -> bool {
        !self.orphaned_volumes.is_empty() || !self.orphaned_snapshots.is_empty()
    }
}

/// Classify registered sandboxes, volumes and snapshots.
///
/// Names in `unreadable` count as registered: their volumes and snapshots
/// are never reported as orphans.
pub fn reconcile(
    records: &[SandboxRecord],
    unreadable: &[String],
    volumes: &[VolumeInfo],
    snapshots: &[String],
) -> ReconcileReport {
    let readable: BTreeSet<&str> = records.iter().map(|r| r.name.as_str()).collect();
    let registered: BTreeSet<&str> = readable
        .iter()
        .copied()
        .chain(unreadable.iter().map(String::as_str))
        .collect();
    let with_volume: BTreeSet<&str> = volumes.iter().map(|v| v.sandbox.as_str()).collect();

    let mut report = ReconcileReport {
        unreadable: unreadable.to_vec(),
        ..Default::default()
    };
    for name in &readable {
        if with_volume.contains(name) {
            report.healthy.push(name.to_string());
        } else {
            tracing::debug!(sandbox = %name, "registered sandbox has no volume");
            report.stale.push(name.to_string());
        }
    }
    for volume in volumes {
        if !registered.contains(volume.sandbox.as_str()) {
            tracing::debug!(volume = %volume.name, "orphaned volume");
            report.orphaned_volumes.push(volume.clone());
        }
    }
    for snapshot in snapshots {
        if !registered.contains(snapshot.as_str()) {
            tracing::debug!(sandbox = %snapshot, "orphaned snapshot");
            report.orphaned_snapshots.push(snapshot.clone());
        }
    }
    report.orphaned_volumes.sort_by(|a, b| a.name.cmp(&b.name));
    report.orphaned_snapshots.sort();
    report
}

#[cfg(test)]
pub(crate) fn sample_record(name: &str) -> SandboxRecord {
    SandboxRecord {
        name: name.to_string(),
        volume: format!("shadow-{}_workspace", name),
        network: format!("shadow-{}_default", name),
        git_host_port: 3000,
        workspace_path: PathBuf::from("/host/project"),
        snapshot_path: PathBuf::from(format!("/state/snapshots/{}", name)),
        token_path: None,
        admin_user: None,
        created_at: Utc::now(),
        state: SandboxState::Running,
    }
}
