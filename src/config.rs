//! Configuration and on-disk state layout.
//!
//! Everything lives under a single home directory (`$SHADOW_HOME`, or
//! `~/.shadow`). An optional `config.toml` there overrides the defaults.

use crate::error::{ShadowError, ShadowResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the state home directory.
pub const HOME_ENV: &str = "SHADOW_HOME";

const CONFIG_FILE: &str = "config.toml";
const COMPOSE_TEMPLATE: &str = include_str!("../templates/docker-compose.yaml");

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShadowConfig {
    /// State root. Not read from the file; always resolved from the environment.
    #[serde(skip)]
    pub home: PathBuf,
    /// Prefix for compose project names and therefore volume names.
    pub project_prefix: String,
    /// Compose file to use instead of the embedded template.
    pub compose_file: Option<PathBuf>,
    /// Patterns excluded from snapshots and diffs.
    pub ignore_patterns: Vec<String>,
    /// Host paths promotion never writes or removes.
    pub protected_paths: Vec<String>,
    pub exec_timeout_secs: u64,
    pub git_host: GitHostConfig,
    pub health: HealthConfig,
}

/// Settings for the git-hosting sidecar.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitHostConfig {
    pub default_port: u16,
    /// URL of the sidecar as seen from inside the sandbox network.
    pub internal_url: String,
    pub admin_user: String,
    pub admin_password: String,
    pub admin_email: String,
    pub organization: String,
    pub request_timeout_secs: u64,
    /// Directory-name prefix that `sync` publishes from a workspace.
    pub module_prefix: String,
}

/// Health-check polling budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub timeout_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            home: PathBuf::from(".shadow"),
            project_prefix: "shadow-".to_string(),
            compose_file: None,
            ignore_patterns: [
                ".git",
                "__pycache__",
                "*.pyc",
                ".venv",
                "node_modules",
                ".shadow-snapshot-*",
                ".shadow-token-*",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            protected_paths: vec![".git".to_string()],
            exec_timeout_secs: 300,
            git_host: GitHostConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for GitHostConfig {
    fn default() -> Self {
        Self {
            default_port: 3000,
            internal_url: "http://gitea:3000".to_string(),
            admin_user: "shadow-admin".to_string(),
            admin_password: "shadow-admin".to_string(),
            admin_email: "shadow@shadow.local".to_string(),
            organization: "shadow".to_string(),
            request_timeout_secs: 30,
            module_prefix: "amplifier".to_string(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            poll_interval_ms: 2000,
        }
    }
}

impl HealthConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl ShadowConfig {
    /// Load configuration from the resolved home directory.
    pub fn load() -> ShadowResult<Self> {
        Self::load_from(resolve_home()?)
    }

    /// Load configuration rooted at `home`. A missing config file yields defaults.
    pub fn load_from(home: PathBuf) -> ShadowResult<Self> {
        let path = home.join(CONFIG_FILE);
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            toml::from_str::<ShadowConfig>(&raw)?
        } else {
            ShadowConfig::default()
        };
        config.home = home;
        config.validate()?;
        Ok(config)
    }

    /// Defaults rooted at `home`; used by tests and embedders.
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            ..Self::default()
        }
    }

    fn validate(&self) -> ShadowResult<()> {
        if self.project_prefix.is_empty() {
            return Err(ShadowError::Config("project_prefix must not be empty".into()));
        }
        if self.health.poll_interval_ms == 0 {
            return Err(ShadowError::Config("health.poll_interval_ms must be > 0".into()));
        }
        for pattern in &self.ignore_patterns {
            glob::Pattern::new(pattern).map_err(|e| {
                ShadowError::Config(format!("bad ignore pattern '{}': {}", pattern, e))
            })?;
        }
        Ok(())
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.home.join("snapshots")
    }

    pub fn registry_dir(&self) -> PathBuf {
        self.home.join("registry")
    }

    pub fn tokens_dir(&self) -> PathBuf {
        self.home.join("tokens")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.home.join("locks")
    }

    pub fn transfers_dir(&self) -> PathBuf {
        self.home.join("transfers")
    }

    pub fn exec_timeout(&self) -> Duration {
        Duration::from_secs(self.exec_timeout_secs)
    }

    /// Path of the compose file, writing the embedded template on first use.
    pub fn compose_file(&self) -> ShadowResult<PathBuf> {
        if let Some(path) = &self.compose_file {
            if !path.exists() {
                return Err(ShadowError::Config(format!(
                    "compose file does not exist: {}",
                    path.display()
                )));
            }
            return Ok(path.clone());
        }

        let path = self.home.join("compose").join("docker-compose.yaml");
        let current = std::fs::read_to_string(&path).ok();
        if current.as_deref() != Some(COMPOSE_TEMPLATE) {
            write_file(&path, COMPOSE_TEMPLATE)?;
        }
        Ok(path)
    }
}

fn write_file(path: &Path, contents: &str) -> ShadowResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, contents)?;
    Ok(())
}

fn resolve_home() -> ShadowResult<PathBuf> {
    if let Ok(dir) = std::env::var(HOME_ENV) {
        let dir = PathBuf::from(dir);
        if dir.is_absolute() {
            return Ok(dir);
        }
        tracing::warn!(path = ?dir, "ignoring relative {}", HOME_ENV);
    }
    dirs::home_dir()
        .map(|home| home.join(".shadow"))
        .ok_or_else(|| ShadowError::Config("cannot determine home directory".into()))
}
