//! Shadow environment lifecycle.
//!
//! [`ShadowManager`] is the front door used by the CLI and by automation.
//! It ties the registry, snapshot store, transfer adapter and promotion
//! controller together and holds the per-sandbox lock for the duration of
//! every operation that touches a sandbox's snapshot/volume pair.

use crate::config::ShadowConfig;
use crate::diff_engine::DiffResult;
use crate::error::{ShadowError, ShadowResult};
use crate::git_host::{
    publish_module, wait_for_git_host, AdminUser, GitCredentials, GitHost, GiteaSidecar,
    PublishReport, TokenStore,
};
use crate::lock::LockDir;
use crate::promotion::{PromotionController, PromotionOutcome};
use crate::registry::{reconcile, JsonRegistry, ReconcileReport, RegistryStore, SandboxRecord, SandboxState};
use crate::runtime::{ContainerRuntime, DockerCompose, ExecOutput, ExecSpec, Service, StackConfig, VolumeInfo};
use crate::snapshot::SnapshotStore;
use crate::transfer::VolumeTransfer;
use crate::tree_index::IgnoreRules;
use chrono::Utc;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Live view of one sandbox.
#[derive(Debug, Clone)]
pub struct SandboxStatus {
    pub record: SandboxRecord,
    pub running: bool,
    pub git_host_healthy: bool,
    pub tainted: bool,
    pub initialized: bool,
}

/// Result of `init`.
#[derive(Debug, Clone)]
pub struct InitReport {
    pub git_host_url: String,
    pub organization: String,
    pub admin_user: String,
    pub token_path: PathBuf,
}

/// Result of `sync`: modules pushed and modules that failed, by name.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub published: Vec<PublishReport>,
    pub failed: Vec<(String, String)>,
}

impl SyncReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// What a cleanup would remove.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupPlan {
    /// Registered sandboxes to tear down completely (`--all` only).
    pub sandboxes: Vec<String>,
    pub volumes: Vec<VolumeInfo>,
    pub snapshots: Vec<String>,
}

impl CleanupPlan {
    pub fn is_empty(&self) -> bool {
        self.sandboxes.is_empty() && self.volumes.is_empty() && self.snapshots.is_empty()
    }
}

/// What a cleanup actually removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub sandboxes_removed: usize,
    pub volumes_removed: usize,
    pub snapshots_removed: usize,
    pub failures: Vec<(String, String)>,
}

/// Manages shadow environments.
pub struct ShadowManager<R: ContainerRuntime, S: RegistryStore> {
    config: ShadowConfig,
    runtime: R,
    registry: S,
    snapshots: SnapshotStore,
    locks: LockDir,
    tokens: TokenStore,
    protected: IgnoreRules,
}

impl ShadowManager<DockerCompose, JsonRegistry> {
    /// Docker-backed manager with the registry persisted under the config home.
    pub fn open(config: ShadowConfig) -> ShadowResult<Self> {
        let registry = JsonRegistry::open(config.registry_dir(), LockDir::new(config.locks_dir()))?;
        Self::new(config, DockerCompose::default(), registry)
    }
}

impl<R: ContainerRuntime, S: RegistryStore> ShadowManager<R, S> {
    pub fn new(config: ShadowConfig, runtime: R, registry: S) -> ShadowResult<Self> {
        let locks = LockDir::new(config.locks_dir());
        let snapshots = SnapshotStore::new(
            config.snapshots_dir(),
            IgnoreRules::new(&config.ignore_patterns)?,
            locks.clone(),
        );
        let protected = IgnoreRules::new(&config.protected_paths)?;
        Ok(Self {
            tokens: TokenStore::new(config.tokens_dir()),
            config,
            runtime,
            registry,
            snapshots,
            locks,
            protected,
        })
    }

    pub fn config(&self) -> &ShadowConfig {
        &self.config
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    pub fn registry(&self) -> &S {
        &self.registry
    }

    fn transfer(&self) -> VolumeTransfer<'_, R> {
        VolumeTransfer::new(&self.runtime, self.config.transfers_dir())
    }

    fn controller(&self) -> PromotionController<'_, R> {
        PromotionController::new(self.transfer(), &self.snapshots, self.protected.clone())
    }

    fn stack_for(&self, record: &SandboxRecord) -> ShadowResult<StackConfig> {
        StackConfig::new(&self.config, &record.name, record.git_host_port)
    }

    fn record(&self, name: &str) -> ShadowResult<SandboxRecord> {
        self.registry
            .lookup(name)?
            .ok_or_else(|| ShadowError::SandboxNotFound(name.to_string()))
    }

    fn set_state(&self, record: &mut SandboxRecord, state: SandboxState) -> ShadowResult<()> {
        record.state = state;
        self.registry.update(record.clone())
    }

    /// Create a sandbox from `workspace`, or bring a stopped one back up.
    ///
    /// Order for a new sandbox: register, snapshot, taint mark, `up`, copy-in.
    /// A failed snapshot unregisters again. Anything failing after the
    /// snapshot leaves the sandbox marked, so the next `start` re-syncs it.
    pub fn start(&self, name: &str, workspace: &Path, port: Option<u16>) -> ShadowResult<SandboxRecord> {
        let port = port.unwrap_or(self.config.git_host.default_port);
        let stack = StackConfig::new(&self.config, name, port)?;
        let _guard = self.locks.sandbox(name)?;

        if let Some(record) = self.registry.lookup(name)? {
            return self.resume(record);
        }

        let workspace = fs::canonicalize(workspace).map_err(|e| ShadowError::snapshot(workspace, e))?;
        let mut record = SandboxRecord {
            name: name.to_string(),
            volume: stack.workspace_volume(),
            network: stack.network(),
            git_host_port: port,
            workspace_path: workspace.clone(),
            snapshot_path: self.snapshots.root().join(name),
            token_path: None,
            admin_user: None,
            created_at: Utc::now(),
            state: SandboxState::Provisioning,
        };
        self.registry.register(record.clone())?;
        tracing::info!(sandbox = %name, workspace = ?workspace, port, "starting shadow environment");

        match self.snapshots.capture(&workspace, name) {
            Ok(handle) => record.snapshot_path = handle.path,
            Err(e) => {
                self.registry.unregister(name)?;
                return Err(e);
            }
        }

        self.transfer().mark_incomplete(name)?;
        self.runtime.up(&stack)?;
        if let Err(e) = self.transfer().copy_in(&workspace, &stack) {
            self.set_state(&mut record, SandboxState::Tainted)?;
            return Err(e);
        }

        self.set_state(&mut record, SandboxState::Running)?;
        tracing::info!(sandbox = %name, "shadow environment ready");
        Ok(record)
    }

    fn resume(&self, mut record: SandboxRecord) -> ShadowResult<SandboxRecord> {
        let stack = self.stack_for(&record)?;
        let running = self.runtime.is_running(&stack)?;
        if record.state == SandboxState::Running && running {
            return Err(ShadowError::SandboxExists(record.name));
        }

        let needs_sync = matches!(record.state, SandboxState::Provisioning | SandboxState::Tainted)
            || self.transfer().is_tainted(&record.name);
        if needs_sync {
            if self.snapshots.locate(&record.name).is_err() {
                let handle = self.snapshots.capture(&record.workspace_path, &record.name)?;
                record.snapshot_path = handle.path;
            }
            self.transfer().mark_incomplete(&record.name)?;
        }
        if !running {
            self.runtime.up(&stack)?;
        }
        if needs_sync {
            tracing::info!(sandbox = %record.name, "re-syncing workspace into sandbox");
            if let Err(e) = self.transfer().copy_in(&record.workspace_path, &stack) {
                self.set_state(&mut record, SandboxState::Tainted)?;
                return Err(e);
            }
        } else {
            tracing::info!(sandbox = %record.name, "resuming stopped sandbox");
        }

        self.set_state(&mut record, SandboxState::Running)?;
        Ok(record)
    }

    /// Bring the stack down. With `remove_volumes` the sandbox is destroyed:
    /// volumes, snapshot, token, taint marker and registry entry all go.
    pub fn stop(&self, name: &str, remove_volumes: bool) -> ShadowResult<()> {
        let _guard = self.locks.sandbox(name)?;
        let mut record = self.record(name)?;
        let stack = self.stack_for(&record)?;

        self.runtime.down(&stack, remove_volumes)?;

        if remove_volumes {
            self.snapshots.discard(name)?;
            self.tokens.remove(name)?;
            self.transfer().clear_marker(name)?;
            self.registry.unregister(name)?;
            tracing::info!(sandbox = %name, "destroyed shadow environment");
        } else {
            // Provisioning and Tainted survive a stop so `start` still re-syncs.
            if record.state == SandboxState::Running {
                self.set_state(&mut record, SandboxState::Stopped)?;
            }
            tracing::info!(sandbox = %name, "stopped shadow environment, volumes kept");
        }
        Ok(())
    }

    pub fn status(&self, name: &str) -> ShadowResult<SandboxStatus> {
        let record = self.record(name)?;
        self.status_of(record)
    }

    fn status_of(&self, record: SandboxRecord) -> ShadowResult<SandboxStatus> {
        let stack = self.stack_for(&record)?;
        let running = self.runtime.is_running(&stack)?;
        let git_host_healthy = running && self.runtime.is_healthy(&stack, Service::GitHost)?;
        Ok(SandboxStatus {
            tainted: record.state == SandboxState::Tainted || self.transfer().is_tainted(&record.name),
            initialized: record
                .token_path
                .as_ref()
                .map(|p| p.exists())
                .unwrap_or(false),
            running,
            git_host_healthy,
            record,
        })
    }

    /// Status of every registered sandbox, sorted by name.
    pub fn list(&self) -> ShadowResult<Vec<SandboxStatus>> {
        self.registry
            .list_all()?
            .into_iter()
            .map(|record| self.status_of(record))
            .collect()
    }

    /// Stack of a registered sandbox whose containers are up.
    pub fn running_stack(&self, name: &str) -> ShadowResult<StackConfig> {
        let stack = self.stack_for(&self.record(name)?)?;
        if self.runtime.is_running(&stack)? {
            Ok(stack)
        } else {
            Err(ShadowError::SandboxNotRunning(name.to_string()))
        }
    }

    /// Run a shell command in the workspace container.
    pub fn exec(&self, name: &str, command: &str) -> ShadowResult<ExecOutput> {
        let stack = self.running_stack(name)?;
        let spec = ExecSpec::shell(&format!("cd /workspace && {}", command))
            .timeout(self.config.exec_timeout());
        self.runtime.exec(&stack, &spec)
    }

    pub fn logs(&self, name: &str, service: Service, tail: usize) -> ShadowResult<String> {
        let record = self.record(name)?;
        let stack = self.stack_for(&record)?;
        self.runtime.logs(&stack, service, tail)
    }

    /// Set up the git-hosting sidecar: admin user, API token and organisation.
    pub fn init(&self, name: &str) -> ShadowResult<InitReport> {
        let stack = self.stack_for(&self.record(name)?)?;
        let sidecar = self.sidecar(&stack)?;
        self.init_with(name, &sidecar)
    }

    /// `init` against any [`GitHost`].
    pub fn init_with<G: GitHost + ?Sized>(&self, name: &str, host: &G) -> ShadowResult<InitReport> {
        let _guard = self.locks.sandbox(name)?;
        let stack = self.running_stack(name)?;
        let mut record = self.record(name)?;

        let git = &self.config.git_host;
        wait_for_git_host(host, self.config.health.timeout(), self.config.health.poll_interval())?;

        let admin = AdminUser {
            username: git.admin_user.clone(),
            password: git.admin_password.clone(),
            email: git.admin_email.clone(),
        };
        host.create_admin_user(&admin)?;
        let token = host.issue_token(&admin.username)?;
        let token_path = self.tokens.save(name, &token)?;

        let creds = GitCredentials {
            username: admin.username.clone(),
            token,
        };
        host.create_organization(&creds, &git.organization)?;

        record.token_path = Some(token_path.clone());
        record.admin_user = Some(admin.username.clone());
        self.registry.update(record)?;
        tracing::info!(sandbox = %name, org = %git.organization, "git host initialized");

        Ok(InitReport {
            git_host_url: stack.git_host_url(),
            organization: git.organization.clone(),
            admin_user: admin.username,
            token_path,
        })
    }

    /// Push a local git repository into the sandbox's git host.
    pub fn publish(&self, name: &str, module_path: &Path) -> ShadowResult<PublishReport> {
        let stack = self.running_stack(name)?;
        let sidecar = self.sidecar(&stack)?;
        self.publish_with(name, module_path, &sidecar)
    }

    pub fn publish_with<G: GitHost + ?Sized>(
        &self,
        name: &str,
        module_path: &Path,
        host: &G,
    ) -> ShadowResult<PublishReport> {
        self.running_stack(name)?;
        let creds = self.credentials(name)?;
        publish_module(host, &creds, &self.config.git_host.organization, module_path)
    }

    /// Publish every module repository found directly under `workspace`.
    pub fn sync(&self, name: &str, workspace: &Path) -> ShadowResult<SyncReport> {
        let stack = self.running_stack(name)?;
        let sidecar = self.sidecar(&stack)?;
        self.sync_with(name, workspace, &sidecar)
    }

    /// `sync` against any [`GitHost`]. One module failing does not stop the rest.
    pub fn sync_with<G: GitHost + ?Sized>(
        &self,
        name: &str,
        workspace: &Path,
        host: &G,
    ) -> ShadowResult<SyncReport> {
        self.running_stack(name)?;
        let creds = self.credentials(name)?;
        let modules = self.find_modules(workspace)?;
        if modules.is_empty() {
            return Err(ShadowError::GitHost(format!(
                "no {}* repositories found in {}",
                self.config.git_host.module_prefix,
                workspace.display()
            )));
        }

        let mut report = SyncReport::default();
        for module in modules {
            let module_name = module
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            match publish_module(host, &creds, &self.config.git_host.organization, &module) {
                Ok(published) => report.published.push(published),
                Err(e) => {
                    tracing::warn!(sandbox = %name, module = %module_name, error = %e, "sync failed");
                    report.failed.push((module_name, e.to_string()));
                }
            }
        }
        tracing::info!(
            sandbox = %name,
            published = report.published.len(),
            failed = report.failed.len(),
            "sync finished"
        );
        Ok(report)
    }

    /// Git repositories directly under `workspace` named with the module
    /// prefix, sorted by name.
    pub fn find_modules(&self, workspace: &Path) -> ShadowResult<Vec<PathBuf>> {
        let prefix = &self.config.git_host.module_prefix;
        let mut modules = Vec::new();
        for entry in fs::read_dir(workspace)? {
            let path = entry?.path();
            let named = path
                .file_name()
                .map(|n| n.to_string_lossy().starts_with(prefix.as_str()))
                .unwrap_or(false);
            if named && path.is_dir() && path.join(".git").exists() {
                modules.push(path);
            }
        }
        modules.sort();
        Ok(modules)
    }

    fn sidecar<'s>(&'s self, stack: &'s StackConfig) -> ShadowResult<GiteaSidecar<'s, R>> {
        GiteaSidecar::new(
            &self.runtime,
            stack,
            std::time::Duration::from_secs(self.config.git_host.request_timeout_secs),
        )
    }

    fn credentials(&self, name: &str) -> ShadowResult<GitCredentials> {
        let record = self.record(name)?;
        let token = self
            .tokens
            .load(name)?
            .ok_or_else(|| ShadowError::GitHost(format!("sandbox '{}' is not initialized; run init first", name)))?;
        Ok(GitCredentials {
            username: record
                .admin_user
                .unwrap_or_else(|| self.config.git_host.admin_user.clone()),
            token,
        })
    }

    /// Changes made inside the sandbox since it started.
    pub fn diff(&self, name: &str) -> ShadowResult<DiffResult> {
        let _guard = self.locks.sandbox(name)?;
        let stack = self.stack_for(&self.record(name)?)?;
        self.controller().diff(&stack)
    }

    /// Diff plus unified content patches.
    pub fn diff_patch(&self, name: &str) -> ShadowResult<(DiffResult, String)> {
        let _guard = self.locks.sandbox(name)?;
        let stack = self.stack_for(&self.record(name)?)?;
        let pulled = self.controller().pull(&stack)?;
        let patch = pulled.patch()?;
        Ok((pulled.diff, patch))
    }

    /// Apply the sandbox's changes to the workspace it was started from.
    pub fn promote<F>(&self, name: &str, force: bool, confirm: F) -> ShadowResult<PromotionOutcome>
    where
        F: FnOnce(&DiffResult) -> bool,
    {
        let _guard = self.locks.sandbox(name)?;
        let record = self.record(name)?;
        let stack = self.stack_for(&record)?;
        self.controller()
            .promote(&stack, &record.workspace_path, force, confirm)
    }

    /// Shadow volumes known to the runtime.
    pub fn volumes(&self) -> ShadowResult<Vec<VolumeInfo>> {
        self.runtime.list_volumes(&self.config.project_prefix)
    }

    pub fn reconcile(&self) -> ShadowResult<ReconcileReport> {
        let records = self.registry.list_all()?;
        let unreadable = self.registry.unreadable()?;
        let volumes = self.volumes()?;
        let snapshots = self.snapshots.list()?;
        Ok(reconcile(&records, &unreadable, &volumes, &snapshots))
    }

    /// Orphans only, or with `all` every registered sandbox as well.
    pub fn cleanup_plan(&self, all: bool) -> ShadowResult<CleanupPlan> {
        let report = self.reconcile()?;
        let sandboxes = if all {
            self.registry
                .list_all()?
                .into_iter()
                .map(|r| r.name)
                .collect()
        } else {
            Vec::new()
        };
        Ok(CleanupPlan {
            sandboxes,
            volumes: report.orphaned_volumes,
            snapshots: report.orphaned_snapshots,
        })
    }

    /// Carry out `plan`. Without `force`, `confirm` must approve it first.
    /// Individual failures are collected in the report.
    pub fn cleanup<F>(&self, plan: &CleanupPlan, force: bool, confirm: F) -> ShadowResult<CleanupReport>
    where
        F: FnOnce(&CleanupPlan) -> bool,
    {
        let mut report = CleanupReport::default();
        if plan.is_empty() {
            return Ok(report);
        }
        if !force && !confirm(plan) {
            return Err(ShadowError::CleanupAborted);
        }

        for name in &plan.sandboxes {
            match self.stop(name, true) {
                Ok(()) => report.sandboxes_removed += 1,
                Err(e) => report.failures.push((name.clone(), e.to_string())),
            }
        }

        // Orphaned stacks may still hold their volumes.
        let orphan_sandboxes: BTreeSet<&str> = plan.volumes.iter().map(|v| v.sandbox.as_str()).collect();
        for sandbox in orphan_sandboxes {
            let down = StackConfig::new(&self.config, sandbox, self.config.git_host.default_port)
                .and_then(|stack| self.runtime.down(&stack, true));
            if let Err(e) = down {
                tracing::debug!(sandbox = %sandbox, error = %e, "could not bring orphaned stack down");
            }
        }
        let remaining: BTreeSet<String> = self.volumes()?.into_iter().map(|v| v.name).collect();
        for volume in &plan.volumes {
            if !remaining.contains(&volume.name) {
                report.volumes_removed += 1;
                continue;
            }
            match self.runtime.remove_volume(&volume.name) {
                Ok(()) => report.volumes_removed += 1,
                Err(e) => report.failures.push((volume.name.clone(), e.to_string())),
            }
        }

        for snapshot in &plan.snapshots {
            match self.snapshots.discard(snapshot) {
                Ok(_) => report.snapshots_removed += 1,
                Err(e) => report.failures.push((snapshot.clone(), e.to_string())),
            }
        }

        tracing::info!(
            sandboxes = report.sandboxes_removed,
            volumes = report.volumes_removed,
            snapshots = report.snapshots_removed,
            failures = report.failures.len(),
            "cleanup finished"
        );
        Ok(report)
    }
}
