use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShadowError {
    #[error("Snapshot error for {path}: {reason}")]
    Snapshot { path: PathBuf, reason: String },

    #[error("Snapshot already exists for sandbox '{0}'; discard it first")]
    SnapshotConflict(String),

    #[error("No snapshot found for sandbox '{0}'")]
    SnapshotNotFound(String),

    #[error("Transfer error for sandbox '{sandbox}': {reason}")]
    Transfer { sandbox: String, reason: String },

    #[error("Sandbox '{0}' is not running")]
    SandboxNotRunning(String),

    #[error("Sandbox '{0}' has an incomplete copy-in and must be re-synced")]
    SandboxTainted(String),

    #[error("Timed out after {seconds:.1}s waiting for {what}")]
    Timeout { what: String, seconds: f64 },

    #[error("Promotion of sandbox '{0}' was declined")]
    PromotionAborted(String),

    #[error("Promotion partially applied: {skipped} path(s) skipped")]
    PartialPromotion { skipped: usize },

    #[error("Cleanup was declined")]
    CleanupAborted,

    #[error("Sandbox not found: {0}")]
    SandboxNotFound(String),

    #[error("Sandbox already exists: {0}")]
    SandboxExists(String),

    #[error("Invalid sandbox name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("Container runtime error: {0}")]
    Runtime(String),

    #[error("Git host error: {0}")]
    GitHost(String),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Walk error: {0}")]
    WalkError(#[from] walkdir::Error),
}

impl ShadowError {
    pub(crate) fn snapshot(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        ShadowError::Snapshot {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn transfer(sandbox: &str, reason: impl ToString) -> Self {
        ShadowError::Transfer {
            sandbox: sandbox.to_string(),
            reason: reason.to_string(),
        }
    }
}

pub type ShadowResult<T> = Result<T, ShadowError>;
