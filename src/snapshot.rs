//! Snapshot Store.
//!
//! Immutable point-in-time copies of a workspace, one directory per sandbox
//! under `<home>/snapshots/`. A capture is staged under a hidden name and
//! renamed into place, so a half-written snapshot is never visible under the
//! sandbox's key.

use crate::error::{ShadowError, ShadowResult};
use crate::lock::LockDir;
use crate::tree_index::{copy_tree, IgnoreRules, TreeIndex};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const STAGING_PREFIX: &str = ".staging-";

/// Reference to a captured snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotHandle {
    pub sandbox: String,
    pub path: PathBuf,
}

impl SnapshotHandle {
    /// Read-only content index of the snapshot.
    pub fn index(&self, ignore: &IgnoreRules) -> ShadowResult<TreeIndex> {
        TreeIndex::scan(&self.path, ignore)
    }
}

/// Store of per-sandbox snapshots.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
    ignore: IgnoreRules,
    locks: LockDir,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>, ignore: IgnoreRules, locks: LockDir) -> Self {
        Self {
            root: root.into(),
            ignore,
            locks,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ignore_rules(&self) -> &IgnoreRules {
        &self.ignore
    }

    /// Copy `source` into the store under `sandbox`.
    ///
    /// Fails with `SnapshotConflict` if a snapshot for `sandbox` already
    /// exists; it has to be discarded explicitly first.
    pub fn capture(&self, source: &Path, sandbox: &str) -> ShadowResult<SnapshotHandle> {
        let meta = fs::metadata(source).map_err(|e| ShadowError::snapshot(source, e))?;
        if !meta.is_dir() {
            return Err(ShadowError::snapshot(source, "source is not a directory"));
        }
        fs::read_dir(source).map_err(|e| ShadowError::snapshot(source, e))?;

        let target = self.path_for(sandbox);
        let source = fs::canonicalize(source).map_err(|e| ShadowError::snapshot(source, e))?;
        fs::create_dir_all(&self.root)?;
        let root = fs::canonicalize(&self.root)?;
        if root.starts_with(&source) {
            return Err(ShadowError::snapshot(
                &source,
                "snapshot store lies inside the source tree",
            ));
        }

        let _guard = self.locks.store()?;
        if target.exists() {
            return Err(ShadowError::SnapshotConflict(sandbox.to_string()));
        }

        let staging = self
            .root
            .join(format!("{}{}-{}", STAGING_PREFIX, sandbox, Uuid::new_v4()));

        let stats = match copy_tree(&source, &staging, &self.ignore) {
            Ok(stats) => stats,
            Err(e) => {
                let _ = fs::remove_dir_all(&staging);
                return Err(match e {
                    ShadowError::Snapshot { .. } => e,
                    other => ShadowError::snapshot(&source, other),
                });
            }
        };
        fs::rename(&staging, &target)?;

        tracing::info!(
            sandbox = %sandbox,
            files = stats.files,
            bytes = stats.bytes,
            path = ?target,
            "captured snapshot"
        );

        Ok(SnapshotHandle {
            sandbox: sandbox.to_string(),
            path: target,
        })
    }

    /// Find the snapshot for `sandbox`.
    pub fn locate(&self, sandbox: &str) -> ShadowResult<SnapshotHandle> {
        let path = self.path_for(sandbox);
        if path.is_dir() {
            Ok(SnapshotHandle {
                sandbox: sandbox.to_string(),
                path,
            })
        } else {
            Err(ShadowError::SnapshotNotFound(sandbox.to_string()))
        }
    }

    /// Remove the snapshot for `sandbox`. Absent snapshots are not an error.
    pub fn discard(&self, sandbox: &str) -> ShadowResult<bool> {
        let path = self.path_for(sandbox);
        let _guard = self.locks.store()?;
        match fs::remove_dir_all(&path) {
            Ok(()) => {
                tracing::info!(sandbox = %sandbox, "discarded snapshot");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ShadowError::snapshot(path, e)),
        }
    }

    /// Names of all stored snapshots, sorted. Staging leftovers are skipped.
    pub fn list(&self) -> ShadowResult<Vec<String>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with('.') {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    fn path_for(&self, sandbox: &str) -> PathBuf {
        self.root.join(sandbox)
    }
}
