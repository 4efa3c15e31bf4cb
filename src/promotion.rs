//! Promotion Controller.
//!
//! Pulls a sandbox's current tree, diffs it against the snapshot and applies
//! the result to the host. Application is best-effort per path: a failing
//! path lands in the outcome's skipped list and the rest still go through.
//! Protected paths (the host's `.git` by default) are never written or
//! removed, whatever the diff says.
//!
//! The snapshot is left as it was. A `diff` after `promote` still compares
//! against the pre-sandbox baseline.

use crate::diff_engine::{ChangeKind, ChangeRecord, DiffEngine, DiffResult};
use crate::error::{ShadowError, ShadowResult};
use crate::runtime::{ContainerRuntime, StackConfig};
use crate::snapshot::{SnapshotHandle, SnapshotStore};
use crate::transfer::{TempTree, VolumeTransfer};
use crate::tree_index::{make_symlink, EntryKind, IgnoreRules};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

/// A path that could not be promoted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedPath {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromotionStatus {
    NoChanges,
    Complete,
    Partial,
}

/// Result of applying a diff to the host tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PromotionOutcome {
    pub created: usize,
    pub overwritten: usize,
    pub deleted: usize,
    pub skipped: Vec<SkippedPath>,
}

impl PromotionOutcome {
    pub fn applied(&self) -> usize {
        self.created + self.overwritten + self.deleted
    }

    /// Every record lands in exactly one bucket.
    pub fn total(&self) -> usize {
        self.applied() + self.skipped.len()
    }

    pub fn status(&self) -> PromotionStatus {
        if self.total() == 0 {
            PromotionStatus::NoChanges
        } else if self.skipped.is_empty() {
            PromotionStatus::Complete
        } else {
            PromotionStatus::Partial
        }
    }

    /// `PartialPromotion` if anything was skipped.
    pub fn ensure_complete(&self) -> ShadowResult<()> {
        if self.skipped.is_empty() {
            Ok(())
        } else {
            Err(ShadowError::PartialPromotion {
                skipped: self.skipped.len(),
            })
        }
    }

    pub fn format(&self) -> String {
        format!(
            "{} created, {} overwritten, {} deleted, {} skipped",
            self.created,
            self.overwritten,
            self.deleted,
            self.skipped.len()
        )
    }

    fn skip(&mut self, path: &Path, reason: impl ToString) {
        let reason = reason.to_string();
        tracing::warn!(path = ?path, reason = %reason, "skipped path during promotion");
        self.skipped.push(SkippedPath {
            path: path.to_path_buf(),
            reason,
        });
    }
}

/// Apply `diff` to `host_root`, reading new content from `source_root`.
///
/// Deletions run first, deepest path first, so directories are empty by the
/// time they are removed. Additions and modifications follow in diff order,
/// parents before children.
pub fn apply_changes(
    diff: &DiffResult,
    source_root: &Path,
    host_root: &Path,
    protected: &IgnoreRules,
) -> PromotionOutcome {
    let mut outcome = PromotionOutcome::default();
    let (deletions, writes): (Vec<&ChangeRecord>, Vec<&ChangeRecord>) = diff
        .iter()
        .partition(|r| r.kind == ChangeKind::Deleted);

    for record in deletions.into_iter().rev() {
        if let Some(reason) = refusal(&record.path, protected) {
            outcome.skip(&record.path, reason);
            continue;
        }
        match remove_path(&host_root.join(&record.path)) {
            Ok(()) => outcome.deleted += 1,
            Err(e) => outcome.skip(&record.path, e),
        }
    }

    for record in writes {
        if let Some(reason) = refusal(&record.path, protected) {
            outcome.skip(&record.path, reason);
            continue;
        }
        match write_path(record, source_root, host_root) {
            Ok(()) if record.kind == ChangeKind::Added => outcome.created += 1,
            Ok(()) => outcome.overwritten += 1,
            Err(e) => outcome.skip(&record.path, e),
        }
    }

    tracing::info!(
        created = outcome.created,
        overwritten = outcome.overwritten,
        deleted = outcome.deleted,
        skipped = outcome.skipped.len(),
        "applied changes to host"
    );
    outcome
}

fn refusal(path: &Path, protected: &IgnoreRules) -> Option<&'static str> {
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_)));
    if escapes || path.as_os_str().is_empty() {
        Some("path escapes the workspace")
    } else if protected.matches_path(path) {
        Some("protected path")
    } else {
        None
    }
}

fn remove_path(target: &Path) -> io::Result<()> {
    let meta = match fs::symlink_metadata(target) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if meta.is_dir() {
        // Only empty directories; host-only content below stays.
        fs::remove_dir(target)
    } else {
        fs::remove_file(target)
    }
}

/// Make room for a new entry. Directories are only removed when empty.
fn clear_slot(target: &Path, keep_dir: bool) -> io::Result<()> {
    match fs::symlink_metadata(target) {
        Ok(meta) if meta.is_dir() && keep_dir => Ok(()),
        Ok(meta) if meta.is_dir() => fs::remove_dir(target),
        Ok(_) => fs::remove_file(target),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn write_path(record: &ChangeRecord, source_root: &Path, host_root: &Path) -> io::Result<()> {
    let entry = record
        .after
        .as_ref()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "record has no new content"))?;
    let source = source_root.join(&record.path);
    let target = host_root.join(&record.path);
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }

    match &entry.kind {
        EntryKind::Dir => {
            clear_slot(&target, true)?;
            fs::create_dir_all(&target)
        }
        EntryKind::File => {
            let staged = staging_path(&target);
            fs::copy(&source, &staged)?;
            // rename replaces files and links in place; only a directory needs clearing.
            let placed = match fs::symlink_metadata(&target) {
                Ok(meta) if meta.is_dir() => fs::remove_dir(&target),
                _ => Ok(()),
            }
            .and_then(|_| fs::rename(&staged, &target));
            if placed.is_err() {
                let _ = fs::remove_file(&staged);
            }
            placed
        }
        EntryKind::Symlink { target: link } => {
            clear_slot(&target, false)?;
            make_symlink(link, &target)
        }
        EntryKind::Special { kind } => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("{} entries are not promoted", kind),
        )),
    }
}

fn staging_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    target.with_file_name(format!(".{}.shadow-promote-{}", name, uuid::Uuid::new_v4().simple()))
}

/// A sandbox's tree pulled out next to its snapshot, with the diff between them.
#[derive(Debug)]
pub struct PulledState {
    pub snapshot: SnapshotHandle,
    pub current: TempTree,
    pub diff: DiffResult,
}

impl PulledState {
    /// Unified content diff of every record.
    pub fn patch(&self) -> ShadowResult<String> {
        let mut out = String::new();
        for record in self.diff.iter() {
            out.push_str(&DiffEngine::content_diff(
                record,
                &self.snapshot.path,
                self.current.root(),
            )?);
        }
        Ok(out)
    }
}

/// Diff and promote for one sandbox at a time.
pub struct PromotionController<'a, R: ContainerRuntime> {
    transfer: VolumeTransfer<'a, R>,
    snapshots: &'a SnapshotStore,
    engine: DiffEngine,
    protected: IgnoreRules,
}

impl<'a, R: ContainerRuntime> PromotionController<'a, R> {
    pub fn new(transfer: VolumeTransfer<'a, R>, snapshots: &'a SnapshotStore, protected: IgnoreRules) -> Self {
        Self {
            transfer,
            engine: DiffEngine::new(snapshots.ignore_rules().clone()),
            snapshots,
            protected,
        }
    }

    /// Copy the sandbox out and diff it against its snapshot.
    pub fn pull(&self, stack: &StackConfig) -> ShadowResult<PulledState> {
        let snapshot = self.snapshots.locate(&stack.sandbox)?;
        let current = self.transfer.copy_out(stack)?;
        let diff = self.engine.compare(&snapshot.path, current.root())?;
        Ok(PulledState {
            snapshot,
            current,
            diff,
        })
    }

    pub fn diff(&self, stack: &StackConfig) -> ShadowResult<DiffResult> {
        Ok(self.pull(stack)?.diff)
    }

    /// Apply the sandbox's changes to `host_root`.
    ///
    /// Without `force`, `confirm` sees the diff first and a `false` answer
    /// aborts with `PromotionAborted`. An empty diff returns immediately
    /// without asking.
    pub fn promote<F>(
        &self,
        stack: &StackConfig,
        host_root: &Path,
        force: bool,
        confirm: F,
    ) -> ShadowResult<PromotionOutcome>
    where
        F: FnOnce(&DiffResult) -> bool,
    {
        let pulled = self.pull(stack)?;
        if pulled.diff.is_empty() {
            tracing::info!(sandbox = %stack.sandbox, "nothing to promote");
            return Ok(PromotionOutcome::default());
        }
        if !force && !confirm(&pulled.diff) {
            return Err(ShadowError::PromotionAborted(stack.sandbox.clone()));
        }

        tracing::info!(
            sandbox = %stack.sandbox,
            host = ?host_root,
            changes = pulled.diff.len(),
            "promoting sandbox changes"
        );
        Ok(apply_changes(
            &pulled.diff,
            pulled.current.root(),
            host_root,
            &self.protected,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShadowConfig;
    use crate::lock::LockDir;
    use crate::runtime::fake::FakeRuntime;
    use crate::tree_index::TreeEntry;
    use tempfile::TempDir;

    fn file() -> TreeEntry {
        TreeEntry {
            kind: EntryKind::File,
            size: 1,
            mode: 0o644,
            hash: None,
        }
    }

    fn dir() -> TreeEntry {
        TreeEntry {
            kind: EntryKind::Dir,
            size: 0,
            mode: 0o755,
            hash: None,
        }
    }

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn protected() -> IgnoreRules {
        IgnoreRules::new(&[".git"]).unwrap()
    }

    #[test]
    fn buggy_diff_cannot_touch_git_metadata() {
        let tmp = TempDir::new().unwrap();
        let (source, host) = (tmp.path().join("source"), tmp.path().join("host"));
        write(&source, ".git/HEAD", "evil");
        write(&source, "sub/.git/config", "evil");
        write(&host, ".git/HEAD", "ref: refs/heads/main");
        write(&host, ".git/config", "[core]");
        write(&host, "sub/.git/config", "[core]");

        let diff = DiffResult {
            records: vec![
                ChangeRecord::deleted(".git", dir()),
                ChangeRecord::modified(".git/HEAD", file(), file()),
                ChangeRecord::deleted(".git/config", file()),
                ChangeRecord::modified("sub/.git/config", file(), file()),
            ],
        };
        let outcome = apply_changes(&diff, &source, &host, &protected());

        assert_eq!(outcome.applied(), 0);
        assert_eq!(outcome.skipped.len(), 4);
        assert_eq!(fs::read_to_string(host.join(".git/HEAD")).unwrap(), "ref: refs/heads/main");
        assert_eq!(fs::read_to_string(host.join(".git/config")).unwrap(), "[core]");
        assert_eq!(fs::read_to_string(host.join("sub/.git/config")).unwrap(), "[core]");
    }

    #[test]
    fn paths_escaping_the_host_are_refused() {
        let tmp = TempDir::new().unwrap();
        let host = tmp.path().join("host");
        fs::create_dir_all(&host).unwrap();
        write(tmp.path(), "outside.txt", "keep");

        let diff = DiffResult {
            records: vec![ChangeRecord::deleted("../outside.txt", file())],
        };
        let outcome = apply_changes(&diff, tmp.path(), &host, &protected());

        assert_eq!(outcome.skipped.len(), 1);
        assert!(tmp.path().join("outside.txt").exists());
    }

    #[test]
    fn outcome_counts_match_diff_size() {
        let tmp = TempDir::new().unwrap();
        let (snapshot, current, host) = (
            tmp.path().join("snapshot"),
            tmp.path().join("current"),
            tmp.path().join("host"),
        );
        for root in [&snapshot, &host] {
            write(root, "keep.txt", "same");
            write(root, "edit.txt", "old");
            write(root, "gone/inner.txt", "x");
            write(root, "blocked/child.txt", "x");
        }
        // Host-only content makes `blocked/` impossible to remove.
        write(&host, "blocked/host-only.txt", "mine");
        write(&current, "keep.txt", "same");
        write(&current, "edit.txt", "new");
        write(&current, "fresh/deep/file.txt", "added");

        let diff = DiffEngine::new(IgnoreRules::none())
            .compare(&snapshot, &current)
            .unwrap();
        let outcome = apply_changes(&diff, &current, &host, &protected());

        assert_eq!(outcome.total(), diff.len());
        assert_eq!(outcome.status(), PromotionStatus::Partial);
        assert_eq!(outcome.skipped.len(), 1);
        assert_eq!(outcome.skipped[0].path, PathBuf::from("blocked"));
        assert!(matches!(
            outcome.ensure_complete(),
            Err(ShadowError::PartialPromotion { skipped: 1 })
        ));

        assert_eq!(fs::read_to_string(host.join("edit.txt")).unwrap(), "new");
        assert_eq!(fs::read_to_string(host.join("fresh/deep/file.txt")).unwrap(), "added");
        assert!(!host.join("gone").exists());
        assert!(!host.join("blocked/child.txt").exists());
        assert!(host.join("blocked/host-only.txt").exists());
    }

    #[test]
    fn file_replaced_by_directory_is_promoted() {
        let tmp = TempDir::new().unwrap();
        let (snapshot, current, host) = (
            tmp.path().join("snapshot"),
            tmp.path().join("current"),
            tmp.path().join("host"),
        );
        write(&snapshot, "node", "file");
        write(&host, "node", "file");
        write(&current, "node/child.txt", "now a dir");

        let diff = DiffEngine::new(IgnoreRules::none())
            .compare(&snapshot, &current)
            .unwrap();
        let outcome = apply_changes(&diff, &current, &host, &protected());

        assert_eq!(outcome.status(), PromotionStatus::Complete);
        assert_eq!(
            fs::read_to_string(host.join("node/child.txt")).unwrap(),
            "now a dir"
        );
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_promoted_as_links() {
        let tmp = TempDir::new().unwrap();
        let (snapshot, current, host) = (
            tmp.path().join("snapshot"),
            tmp.path().join("current"),
            tmp.path().join("host"),
        );
        for root in [&snapshot, &current, &host] {
            fs::create_dir_all(root).unwrap();
        }
        std::os::unix::fs::symlink("target.txt", current.join("link")).unwrap();

        let diff = DiffEngine::new(IgnoreRules::none())
            .compare(&snapshot, &current)
            .unwrap();
        apply_changes(&diff, &current, &host, &protected())
            .ensure_complete()
            .unwrap();

        assert_eq!(fs::read_link(host.join("link")).unwrap(), PathBuf::from("target.txt"));
    }

    struct Fixture {
        tmp: TempDir,
        runtime: FakeRuntime,
        stack: StackConfig,
        snapshots: SnapshotStore,
    }

    impl Fixture {
        fn started(host_files: &[(&str, &str)]) -> Self {
            let tmp = TempDir::new().unwrap();
            let config = ShadowConfig::with_home(tmp.path().join("home"));
            let stack = StackConfig::new(&config, "demo", 3000).unwrap();
            let runtime = FakeRuntime::new(tmp.path().join("docker"));
            let snapshots = SnapshotStore::new(
                config.snapshots_dir(),
                IgnoreRules::new(&config.ignore_patterns).unwrap(),
                LockDir::new(config.locks_dir()),
            );
            let host = tmp.path().join("host");
            fs::create_dir_all(host.join(".git")).unwrap();
            for (path, content) in host_files {
                write(&host, path, content);
            }
            snapshots.capture(&host, "demo").unwrap();
            runtime.up(&stack).unwrap();
            VolumeTransfer::new(&runtime, tmp.path().join("transfers"))
                .copy_in(&host, &stack)
                .unwrap();
            Self {
                tmp,
                runtime,
                stack,
                snapshots,
            }
        }

        fn host(&self) -> PathBuf {
            self.tmp.path().join("host")
        }

        fn controller(&self) -> PromotionController<'_, FakeRuntime> {
            PromotionController::new(
                VolumeTransfer::new(&self.runtime, self.tmp.path().join("transfers")),
                &self.snapshots,
                protected(),
            )
        }
    }

    #[test]
    fn declined_confirmation_leaves_host_untouched() {
        let fx = Fixture::started(&[("a.txt", "1")]);
        write(&fx.runtime.volume_dir(&fx.stack), "a.txt", "2");

        let mut seen = 0;
        let err = fx
            .controller()
            .promote(&fx.stack, &fx.host(), false, |diff| {
                seen = diff.len();
                false
            })
            .unwrap_err();

        assert!(matches!(err, ShadowError::PromotionAborted(_)));
        assert_eq!(seen, 1);
        assert_eq!(fs::read_to_string(fx.host().join("a.txt")).unwrap(), "1");
    }

    #[test]
    fn empty_diff_skips_confirmation() {
        let fx = Fixture::started(&[("a.txt", "1")]);
        let outcome = fx
            .controller()
            .promote(&fx.stack, &fx.host(), false, |_| panic!("should not ask"))
            .unwrap();
        assert_eq!(outcome.status(), PromotionStatus::NoChanges);
    }

    #[test]
    fn snapshot_is_not_rebaselined_after_promotion() {
        let fx = Fixture::started(&[("a.txt", "1")]);
        write(&fx.runtime.volume_dir(&fx.stack), "a.txt", "2");

        fx.controller()
            .promote(&fx.stack, &fx.host(), true, |_| false)
            .unwrap();

        let diff = fx.controller().diff(&fx.stack).unwrap();
        assert_eq!(diff.render(), "M  a.txt\n");
    }

    #[test]
    fn patch_shows_content_changes() {
        let fx = Fixture::started(&[("a.txt", "1\n")]);
        write(&fx.runtime.volume_dir(&fx.stack), "a.txt", "2\n");

        let patch = fx.controller().pull(&fx.stack).unwrap().patch().unwrap();
        assert!(patch.contains("-1"));
        assert!(patch.contains("+2"));
    }
}
