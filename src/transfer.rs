//! Volume Transfer Adapter.
//!
//! Moves trees between the host and a sandbox's workspace volume through the
//! runtime's copy primitive. A copy-in first drops a host-side marker and
//! only removes it after the copy completed, so an interrupted or failed
//! copy-in leaves the sandbox visibly tainted rather than silently
//! half-populated.

use crate::error::{ShadowError, ShadowResult};
use crate::runtime::{ContainerRuntime, ExecSpec, StackConfig, WORKSPACE_ROOT};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Empties the workspace volume, dotfiles included.
pub const CLEAR_WORKSPACE_SCRIPT: &str = "find /workspace -mindepth 1 -delete";

/// Scratch copy of a sandbox's tree, removed on drop.
#[derive(Debug)]
pub struct TempTree {
    _dir: TempDir,
    root: PathBuf,
}

impl TempTree {
    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Copies trees in and out of sandbox volumes.
pub struct VolumeTransfer<'a, R: ContainerRuntime> {
    runtime: &'a R,
    markers: PathBuf,
}

impl<'a, R: ContainerRuntime> VolumeTransfer<'a, R> {
    pub fn new(runtime: &'a R, markers: impl Into<PathBuf>) -> Self {
        Self {
            runtime,
            markers: markers.into(),
        }
    }

    /// Replace the sandbox's workspace with a copy of `host_tree`.
    pub fn copy_in(&self, host_tree: &Path, stack: &StackConfig) -> ShadowResult<()> {
        let sandbox = stack.sandbox.as_str();
        if !host_tree.is_dir() {
            return Err(ShadowError::transfer(
                sandbox,
                format!("{} is not a directory", host_tree.display()),
            ));
        }
        self.require_running(stack)?;

        let marker = self.mark_incomplete(sandbox)?;

        let cleared = self
            .runtime
            .exec(stack, &ExecSpec::shell(CLEAR_WORKSPACE_SCRIPT))
            .map_err(|e| ShadowError::transfer(sandbox, e))?;
        if !cleared.success() {
            return Err(ShadowError::transfer(
                sandbox,
                format!("failed to clear workspace: {}", cleared.stderr.trim()),
            ));
        }

        self.runtime
            .copy_to(stack, host_tree, WORKSPACE_ROOT)
            .map_err(|e| {
                tracing::error!(sandbox = %sandbox, error = %e, "copy-in failed, sandbox tainted");
                ShadowError::transfer(sandbox, e)
            })?;

        fs::remove_file(&marker)?;
        tracing::info!(sandbox = %sandbox, source = ?host_tree, "copied workspace into sandbox");
        Ok(())
    }

    /// Copy the sandbox's current workspace to a scratch directory.
    pub fn copy_out(&self, stack: &StackConfig) -> ShadowResult<TempTree> {
        let sandbox = stack.sandbox.as_str();
        self.require_running(stack)?;
        if self.is_tainted(sandbox) {
            return Err(ShadowError::SandboxTainted(sandbox.to_string()));
        }

        let dir = tempfile::Builder::new()
            .prefix(&format!("shadow-{}-", sandbox))
            .tempdir()?;
        let root = dir.path().join("current");
        fs::create_dir_all(&root)?;

        self.runtime
            .copy_from(stack, WORKSPACE_ROOT, &root)
            .map_err(|e| ShadowError::transfer(sandbox, e))?;

        tracing::debug!(sandbox = %sandbox, path = ?root, "copied sandbox workspace out");
        Ok(TempTree { _dir: dir, root })
    }

    /// True if the last copy-in did not complete.
    pub fn is_tainted(&self, sandbox: &str) -> bool {
        self.marker_path(sandbox).exists()
    }

    /// Mark `sandbox` as not holding a complete copy of its workspace.
    /// Only a successful `copy_in` clears the mark.
    pub fn mark_incomplete(&self, sandbox: &str) -> ShadowResult<PathBuf> {
        let marker = self.marker_path(sandbox);
        fs::create_dir_all(&self.markers)?;
        fs::write(&marker, chrono::Utc::now().to_rfc3339())?;
        Ok(marker)
    }

    /// Forget a taint marker; used when the sandbox is torn down.
    pub fn clear_marker(&self, sandbox: &str) -> ShadowResult<()> {
        match fs::remove_file(self.marker_path(sandbox)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn require_running(&self, stack: &StackConfig) -> ShadowResult<()> {
        let running = self
            .runtime
            .is_running(stack)
            .map_err(|e| ShadowError::transfer(&stack.sandbox, e))?;
        if running {
            Ok(())
        } else {
            Err(ShadowError::SandboxNotRunning(stack.sandbox.clone()))
        }
    }

    fn marker_path(&self, sandbox: &str) -> PathBuf {
        self.markers.join(format!("{}.incomplete", sandbox))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShadowConfig;
    use crate::diff_engine::DiffEngine;
    use crate::lock::LockDir;
    use crate::runtime::fake::FakeRuntime;
    use crate::snapshot::SnapshotStore;
    use crate::tree_index::IgnoreRules;
    use tempfile::TempDir;

    struct Fixture {
        tmp: TempDir,
        runtime: FakeRuntime,
        stack: StackConfig,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = TempDir::new().unwrap();
            let config = ShadowConfig::with_home(tmp.path().join("home"));
            let stack = StackConfig::new(&config, "demo", 3000).unwrap();
            let runtime = FakeRuntime::new(tmp.path().join("docker"));
            Self {
                tmp,
                runtime,
                stack,
            }
        }

        fn transfer(&self) -> VolumeTransfer<'_, FakeRuntime> {
            VolumeTransfer::new(&self.runtime, self.tmp.path().join("transfers"))
        }

        fn host(&self) -> PathBuf {
            let host = self.tmp.path().join("host");
            fs::create_dir_all(host.join(".git")).unwrap();
            fs::write(host.join(".git/HEAD"), "ref").unwrap();
            fs::write(host.join("a.txt"), "1").unwrap();
            host
        }
    }

    #[test]
    fn operations_require_a_running_sandbox() {
        let fx = Fixture::new();
        let host = fx.host();

        assert!(matches!(
            fx.transfer().copy_in(&host, &fx.stack),
            Err(ShadowError::SandboxNotRunning(_))
        ));
        assert!(matches!(
            fx.transfer().copy_out(&fx.stack),
            Err(ShadowError::SandboxNotRunning(_))
        ));
    }

    #[test]
    fn copy_in_replaces_previous_contents() {
        let fx = Fixture::new();
        let host = fx.host();
        fx.runtime.up(&fx.stack).unwrap();
        fs::write(fx.runtime.volume_dir(&fx.stack).join("stale.txt"), "old").unwrap();

        fx.transfer().copy_in(&host, &fx.stack).unwrap();

        let volume = fx.runtime.volume_dir(&fx.stack);
        assert!(!volume.join("stale.txt").exists());
        assert_eq!(fs::read_to_string(volume.join("a.txt")).unwrap(), "1");
        assert!(!fx.transfer().is_tainted("demo"));
        assert_eq!(fx.runtime.execs()[0].last().unwrap(), CLEAR_WORKSPACE_SCRIPT);
    }

    #[test]
    fn failed_copy_in_taints_the_sandbox() {
        let fx = Fixture::new();
        let host = fx.host();
        fx.runtime.up(&fx.stack).unwrap();
        fx.runtime.fail_copy_to(true);

        let err = fx.transfer().copy_in(&host, &fx.stack).unwrap_err();
        assert!(matches!(err, ShadowError::Transfer { .. }));
        assert!(fx.transfer().is_tainted("demo"));
        assert!(matches!(
            fx.transfer().copy_out(&fx.stack),
            Err(ShadowError::SandboxTainted(_))
        ));

        fx.runtime.fail_copy_to(false);
        fx.transfer().copy_in(&host, &fx.stack).unwrap();
        assert!(fx.transfer().copy_out(&fx.stack).is_ok());
    }

    #[test]
    fn marked_sandbox_stays_tainted_until_copied_in() {
        let fx = Fixture::new();
        let host = fx.host();
        fx.transfer().mark_incomplete("demo").unwrap();
        fx.runtime.up(&fx.stack).unwrap();

        assert!(matches!(
            fx.transfer().copy_out(&fx.stack),
            Err(ShadowError::SandboxTainted(_))
        ));

        fx.transfer().copy_in(&host, &fx.stack).unwrap();
        assert!(!fx.transfer().is_tainted("demo"));
    }

    #[test]
    fn copy_out_does_not_touch_the_sandbox() {
        let fx = Fixture::new();
        let host = fx.host();
        fx.runtime.up(&fx.stack).unwrap();
        fx.transfer().copy_in(&host, &fx.stack).unwrap();

        let out = fx.transfer().copy_out(&fx.stack).unwrap();
        fs::write(out.root().join("a.txt"), "scribble").unwrap();

        let volume = fx.runtime.volume_dir(&fx.stack);
        assert_eq!(fs::read_to_string(volume.join("a.txt")).unwrap(), "1");
    }

    #[test]
    fn copy_in_then_out_matches_the_snapshot() {
        let fx = Fixture::new();
        let host = fx.host();
        fs::create_dir_all(host.join("src/nested")).unwrap();
        fs::write(host.join("src/nested/lib.rs"), "pub fn x() {}").unwrap();

        let ignore = IgnoreRules::new(&[".git"]).unwrap();
        let snapshots = SnapshotStore::new(
            fx.tmp.path().join("snapshots"),
            ignore.clone(),
            LockDir::new(fx.tmp.path().join("locks")),
        );
        let snapshot = snapshots.capture(&host, "demo").unwrap();
        fx.runtime.up(&fx.stack).unwrap();
        fx.transfer().copy_in(&host, &fx.stack).unwrap();

        let out = fx.transfer().copy_out(&fx.stack).unwrap();
        let diff = DiffEngine::new(ignore).compare(&snapshot.path, out.root()).unwrap();
        assert!(diff.is_empty(), "{}", diff.render());
    }

    #[test]
    fn scratch_tree_is_removed_on_drop() {
        let fx = Fixture::new();
        fx.runtime.up(&fx.stack).unwrap();

        let out = fx.transfer().copy_out(&fx.stack).unwrap();
        let root = out.root().to_path_buf();
        assert!(root.exists());
        drop(out);
        assert!(!root.exists());
    }
}
