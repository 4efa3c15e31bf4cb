//! Host platform checks.

use serde::Serialize;
use std::path::Path;
use std::process::{Command, Stdio};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Wsl2,
    Linux,
    Macos,
    Windows,
    Codespaces,
    Unknown,
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Platform::Wsl2 => "wsl2",
            Platform::Linux => "linux",
            Platform::Macos => "macos",
            Platform::Windows => "windows",
            Platform::Codespaces => "codespaces",
            Platform::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// What was found on this host.
#[derive(Debug, Clone, Serialize)]
pub struct PlatformInfo {
    pub platform: Platform,
    pub docker_available: bool,
    pub compose_available: bool,
    pub warnings: Vec<String>,
    pub recommendations: Vec<String>,
}

impl PlatformInfo {
    /// Docker and compose are both usable.
    pub fn ready(&self) -> bool {
        self.docker_available && self.compose_available
    }
}

/// Probe the host for the platform and container tooling.
pub fn detect_platform() -> PlatformInfo {
    let cwd = std::env::current_dir().unwrap_or_default();
    let platform = classify(
        std::env::var("CODESPACES").ok().as_deref() == Some("true"),
        is_wsl(),
    );

    let mut warnings = Vec::new();
    let mut recommendations = Vec::new();
    match platform {
        Platform::Codespaces => recommendations
            .push("Codespaces detected. Docker-in-Docker should be available via features.".to_string()),
        Platform::Wsl2 if is_windows_mount(&cwd) => warnings.push(
            "Working directory is on the Windows filesystem (/mnt/...). Copies will be slow; work from ~/ instead."
                .to_string(),
        ),
        Platform::Macos => recommendations
            .push("macOS detected. Docker Desktop or OrbStack recommended for best performance.".to_string()),
        Platform::Windows => warnings
            .push("Native Windows detected. Running from within WSL2 is strongly recommended.".to_string()),
        _ => {}
    }

    let docker_available = which::which("docker").is_ok();
    let compose_available = docker_available && compose_works();
    if !docker_available {
        warnings.push("Docker not found. Install it from https://docs.docker.com/get-docker/".to_string());
    } else if !compose_available {
        warnings.push(
            "Docker Compose v2 not found. Install it from https://docs.docker.com/compose/install/".to_string(),
        );
    }

    PlatformInfo {
        platform,
        docker_available,
        compose_available,
        warnings,
        recommendations,
    }
}

fn classify(codespaces: bool, wsl: bool) -> Platform {
    if codespaces {
        Platform::Codespaces
    } else if wsl {
        Platform::Wsl2
    } else if cfg!(target_os = "macos") {
        Platform::Macos
    } else if cfg!(target_os = "windows") {
        Platform::Windows
    } else if cfg!(target_os = "linux") {
        Platform::Linux
    } else {
        Platform::Unknown
    }
}

fn is_wsl() -> bool {
    std::fs::read_to_string("/proc/version")
        .map(|v| v.to_lowercase().contains("microsoft"))
        .unwrap_or(false)
}

fn is_windows_mount(path: &Path) -> bool {
    path.starts_with("/mnt/")
}

fn compose_works() -> bool {
    Command::new("docker")
        .args(["compose", "version"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}
