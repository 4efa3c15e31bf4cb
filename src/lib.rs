//! Shadow Env - isolated development sandboxes with reviewable promotion
//!
//! A shadow environment is a named container stack (a workspace container
//! plus a local Gitea sidecar) that works on a *copy* of a host directory.
//! Nothing is live-mounted: content goes in at start and only comes back
//! through an explicit, diffable promotion step.
//!
//! # Features
//!
//! - **Snapshots**: immutable baseline of the host tree, taken at start
//! - **Volume Transfer**: copy-in/copy-out through the container runtime, with
//!   incomplete copies marked as tainted
//! - **Deterministic Diffs**: lock-step comparison by content hash
//! - **Safe Promotion**: best-effort per path, never touches the host's `.git`
//! - **Orphan Detection**: registry reconciled against volumes and snapshots
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use shadow_env::{ShadowConfig, ShadowManager};
//! use std::path::Path;
//!
//! # fn main() -> Result<(), shadow_env::ShadowError> {
//! let manager = ShadowManager::open(ShadowConfig::load()?)?;
//! manager.start("demo", Path::new("."), None)?;
//!
//! // ... work inside the sandbox ...
//!
//! println!("{}", manager.diff("demo")?.render());
//! let outcome = manager.promote("demo", false, |diff| !diff.is_empty())?;
//! println!("{}", outcome.format());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod diff_engine;
pub mod error;
pub mod git_host;
pub mod health;
pub mod lock;
pub mod platform;
pub mod promotion;
pub mod registry;
pub mod runtime;
pub mod shadow;
pub mod snapshot;
pub mod transfer;
pub mod tree_index;

// Re-export main types
pub use config::ShadowConfig;
pub use diff_engine::{ChangeKind, ChangeRecord, DiffEngine, DiffResult, DiffSummary};
pub use error::{ShadowError, ShadowResult};
pub use git_host::{GitHost, GiteaSidecar, TokenStore};
pub use platform::{detect_platform, Platform, PlatformInfo};
pub use promotion::{PromotionController, PromotionOutcome, PromotionStatus};
pub use registry::{JsonRegistry, MemoryRegistry, RegistryStore, SandboxRecord, SandboxState};
pub use runtime::{ContainerRuntime, DockerCompose, Service, StackConfig};
pub use shadow::{CleanupPlan, CleanupReport, SandboxStatus, ShadowManager, SyncReport};
pub use snapshot::{SnapshotHandle, SnapshotStore};
pub use transfer::VolumeTransfer;
pub use tree_index::{IgnoreRules, TreeIndex};
