//! Container runtime adapter.
//!
//! The core only needs a narrow capability set from the container runtime:
//! bring a stack up or down, run a command, copy trees in and out, list
//! volumes and check health. [`ContainerRuntime`] is that seam;
//! [`DockerCompose`] implements it by shelling out to `docker compose`.

use crate::config::ShadowConfig;
use crate::error::{ShadowError, ShadowResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::time::{Duration, Instant};

/// Mount point of the workspace volume inside the workspace container.
pub const WORKSPACE_ROOT: &str = "/workspace";

/// Environment contract exposed into the sandbox.
pub const ENV_SANDBOX_NAME: &str = "SHADOW_NAME";
pub const ENV_IN_SANDBOX: &str = "SHADOW_SANDBOX";
pub const ENV_GIT_HOST_URL: &str = "SHADOW_GIT_HOST_URL";
pub const ENV_GIT_HOST_PORT: &str = "GITEA_PORT";

const MAX_NAME_LEN: usize = 63;

/// Services in the shadow stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Service {
    Workspace,
    GitHost,
}

impl Service {
    pub fn compose_name(&self) -> &'static str {
        match self {
            Service::Workspace => "workspace",
            Service::GitHost => "gitea",
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.compose_name())
    }
}

/// Everything needed to address one sandbox's stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackConfig {
    pub sandbox: String,
    pub project: String,
    pub compose_file: PathBuf,
    pub git_host_port: u16,
    pub git_host_internal_url: String,
}

impl StackConfig {
    pub fn new(config: &ShadowConfig, sandbox: &str, git_host_port: u16) -> ShadowResult<Self> {
        validate_name(sandbox)?;
        Ok(Self {
            sandbox: sandbox.to_string(),
            project: format!("{}{}", config.project_prefix, sandbox),
            compose_file: config.compose_file()?,
            git_host_port,
            git_host_internal_url: config.git_host.internal_url.clone(),
        })
    }

    pub fn workspace_volume(&self) -> String {
        format!("{}_workspace", self.project)
    }

    pub fn network(&self) -> String {
        format!("{}_default", self.project)
    }

    /// URL of the git-hosting sidecar as seen from the host.
    pub fn git_host_url(&self) -> String {
        format!("http://localhost:{}", self.git_host_port)
    }

    /// Variables handed to compose and, through the template, into the sandbox.
    pub fn env(&self) -> Vec<(String, String)> {
        vec![
            (ENV_SANDBOX_NAME.to_string(), self.sandbox.clone()),
            (ENV_IN_SANDBOX.to_string(), "1".to_string()),
            (ENV_GIT_HOST_URL.to_string(), self.git_host_internal_url.clone()),
            (ENV_GIT_HOST_PORT.to_string(), self.git_host_port.to_string()),
        ]
    }
}

/// Check a sandbox name is usable as a compose project, volume and file name.
pub fn validate_name(name: &str) -> ShadowResult<()> {
    let invalid = |reason: &str| ShadowError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(invalid("must be 1-63 characters"));
    }
    if !name.starts_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit()) {
        return Err(invalid("must start with a lowercase letter or digit"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
    {
        return Err(invalid("only lowercase letters, digits, '-' and '_' are allowed"));
    }
    Ok(())
}

/// A command to run inside a service container.
#[derive(Debug, Clone)]
pub struct ExecSpec {
    pub service: Service,
    pub argv: Vec<String>,
    pub user: Option<String>,
    pub timeout: Option<Duration>,
}

impl ExecSpec {
    pub fn new<S: AsRef<str>>(service: Service, argv: &[S]) -> Self {
        Self {
            service,
            argv: argv.iter().map(|a| a.as_ref().to_string()).collect(),
            user: None,
            timeout: None,
        }
    }

    /// `bash -c <script>` in the workspace container.
    pub fn shell(script: &str) -> Self {
        Self::new(Service::Workspace, &["bash", "-c", script])
    }

    pub fn user(mut self, user: &str) -> Self {
        self.user = Some(user.to_string());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Captured result of an exec.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A runtime volume belonging to a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub name: String,
    /// Sandbox name parsed from the volume name.
    pub sandbox: String,
    /// Volume role within the stack, e.g. `workspace`.
    pub role: String,
}

impl VolumeInfo {
    /// Parse `<prefix><sandbox>_<role>`. Returns `None` for foreign volumes.
    pub fn parse(name: &str, prefix: &str) -> Option<Self> {
        let rest = name.strip_prefix(prefix)?;
        let (sandbox, role) = match rest.rsplit_once('_') {
            Some((sandbox, role)) => (sandbox, role),
            None => (rest, ""),
        };
        if sandbox.is_empty() {
            return None;
        }
        Some(Self {
            name: name.to_string(),
            sandbox: sandbox.to_string(),
            role: role.to_string(),
        })
    }
}

/// A compose project known to the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackInfo {
    pub sandbox: String,
    pub project: String,
    pub status: String,
}

impl StackInfo {
    pub fn is_running(&self) -> bool {
        self.status.to_lowercase().contains("running")
    }
}

/// Capabilities the core consumes from the container runtime.
pub trait ContainerRuntime {
    fn up(&self, stack: &StackConfig) -> ShadowResult<()>;

    fn down(&self, stack: &StackConfig, remove_volumes: bool) -> ShadowResult<()>;

    fn exec(&self, stack: &StackConfig, spec: &ExecSpec) -> ShadowResult<ExecOutput>;

    /// Copy the contents of `host_dir` into `sandbox_dir` in the workspace container.
    fn copy_to(&self, stack: &StackConfig, host_dir: &Path, sandbox_dir: &str) -> ShadowResult<()>;

    /// Copy the contents of `sandbox_dir` into the existing `host_dir`.
    fn copy_from(&self, stack: &StackConfig, sandbox_dir: &str, host_dir: &Path)
        -> ShadowResult<()>;

    /// Volumes whose name starts with `prefix`.
    fn list_volumes(&self, prefix: &str) -> ShadowResult<Vec<VolumeInfo>>;

    fn remove_volume(&self, name: &str) -> ShadowResult<()>;

    /// Projects whose name starts with `prefix`.
    fn list_stacks(&self, prefix: &str) -> ShadowResult<Vec<StackInfo>>;

    fn is_running(&self, stack: &StackConfig) -> ShadowResult<bool>;

    fn is_healthy(&self, stack: &StackConfig, service: Service) -> ShadowResult<bool>;

    fn logs(&self, stack: &StackConfig, service: Service, tail: usize) -> ShadowResult<String>;
}

/// `docker compose` backed runtime.
#[derive(Debug, Clone)]
pub struct DockerCompose {
    docker: String,
}

impl Default for DockerCompose {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCompose {
    pub fn new(docker: &str) -> Self {
        Self {
            docker: docker.to_string(),
        }
    }

    fn docker(&self) -> Command {
        Command::new(&self.docker)
    }

    fn compose(&self, stack: &StackConfig) -> Command {
        let mut cmd = self.docker();
        cmd.arg("compose")
            .arg("-p")
            .arg(&stack.project)
            .arg("-f")
            .arg(&stack.compose_file)
            .envs(stack.env());
        cmd
    }

    /// Interactive `bash` in the workspace container, with the stack's
    /// environment. The caller decides how to run it; stdio is inherited.
    pub fn shell_command(&self, stack: &StackConfig) -> Command {
        let mut cmd = self.compose(stack);
        cmd.args(["exec", Service::Workspace.compose_name(), "bash"])
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        cmd
    }

    fn run(&self, mut cmd: Command, what: &str) -> ShadowResult<Output> {
        tracing::debug!(command = ?cmd, "running {}", what);
        let output = cmd
            .stdin(Stdio::null())
            .output()
            .map_err(|e| ShadowError::Runtime(format!("{}: failed to launch docker: {}", what, e)))?;
        if !output.status.success() {
            return Err(ShadowError::Runtime(format!(
                "{} failed: {}",
                what,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output)
    }
}

impl ContainerRuntime for DockerCompose {
    fn up(&self, stack: &StackConfig) -> ShadowResult<()> {
        let mut cmd = self.compose(stack);
        cmd.args(["up", "-d"]);
        self.run(cmd, "compose up")?;
        tracing::info!(project = %stack.project, "stack up");
        Ok(())
    }

    fn down(&self, stack: &StackConfig, remove_volumes: bool) -> ShadowResult<()> {
        let mut cmd = self.compose(stack);
        cmd.arg("down");
        if remove_volumes {
            cmd.arg("-v");
        }
        self.run(cmd, "compose down")?;
        tracing::info!(project = %stack.project, remove_volumes, "stack down");
        Ok(())
    }

    fn exec(&self, stack: &StackConfig, spec: &ExecSpec) -> ShadowResult<ExecOutput> {
        let mut cmd = self.compose(stack);
        cmd.args(["exec", "-T"]);
        if let Some(user) = &spec.user {
            cmd.arg("-u").arg(user);
        }
        cmd.arg(spec.service.compose_name()).args(&spec.argv);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let child = cmd
            .spawn()
            .map_err(|e| ShadowError::Runtime(format!("failed to launch docker: {}", e)))?;
        let what = format!("exec in {}", spec.service);
        wait_with_timeout(child, spec.timeout, &what)
    }

    fn copy_to(&self, stack: &StackConfig, host_dir: &Path, sandbox_dir: &str) -> ShadowResult<()> {
        let mut cmd = self.compose(stack);
        cmd.arg("cp")
            .arg(format!("{}/.", host_dir.display()))
            .arg(format!("{}:{}", Service::Workspace.compose_name(), sandbox_dir));
        self.run(cmd, "compose cp (in)")?;
        Ok(())
    }

    fn copy_from(
        &self,
        stack: &StackConfig,
        sandbox_dir: &str,
        host_dir: &Path,
    ) -> ShadowResult<()> {
        let mut cmd = self.compose(stack);
        cmd.arg("cp")
            .arg(format!(
                "{}:{}/.",
                Service::Workspace.compose_name(),
                sandbox_dir.trim_end_matches('/')
            ))
            .arg(host_dir);
        self.run(cmd, "compose cp (out)")?;
        Ok(())
    }

    fn list_volumes(&self, prefix: &str) -> ShadowResult<Vec<VolumeInfo>> {
        let mut cmd = self.docker();
        cmd.args(["volume", "ls", "--format", "{{.Name}}"]);
        let output = self.run(cmd, "volume ls")?;
        let mut volumes: Vec<VolumeInfo> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|line| VolumeInfo::parse(line.trim(), prefix))
            .collect();
        volumes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(volumes)
    }

    fn remove_volume(&self, name: &str) -> ShadowResult<()> {
        let mut cmd = self.docker();
        cmd.args(["volume", "rm", name]);
        self.run(cmd, "volume rm")?;
        Ok(())
    }

    fn list_stacks(&self, prefix: &str) -> ShadowResult<Vec<StackInfo>> {
        let mut cmd = self.docker();
        cmd.args(["compose", "ls", "-a", "--format", "json"]);
        let output = self.run(cmd, "compose ls")?;
        parse_compose_ls(&String::from_utf8_lossy(&output.stdout), prefix)
    }

    fn is_running(&self, stack: &StackConfig) -> ShadowResult<bool> {
        let mut cmd = self.compose(stack);
        cmd.args(["ps", "--status", "running", "-q"]);
        let output = self.run(cmd, "compose ps")?;
        Ok(!String::from_utf8_lossy(&output.stdout).trim().is_empty())
    }

    fn is_healthy(&self, stack: &StackConfig, service: Service) -> ShadowResult<bool> {
        let mut cmd = self.compose(stack);
        cmd.args(["ps", "--format", "json", service.compose_name()]);
        let output = self.run(cmd, "compose ps")?;
        Ok(parse_compose_ps(&String::from_utf8_lossy(&output.stdout))
            .iter()
            .any(ContainerState::healthy))
    }

    fn logs(&self, stack: &StackConfig, service: Service, tail: usize) -> ShadowResult<String> {
        let mut cmd = self.compose(stack);
        cmd.args(["logs", "--no-color", "--tail", &tail.to_string(), service.compose_name()]);
        let output = self.run(cmd, "compose logs")?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[derive(Debug, Deserialize)]
struct ContainerState {
    #[serde(rename = "State", default)]
    state: String,
    #[serde(rename = "Health", default)]
    health: String,
}

impl ContainerState {
    fn healthy(&self) -> bool {
        self.state == "running" && (self.health.is_empty() || self.health == "healthy")
    }
}

/// `compose ps --format json` prints either one array or one object per line.
fn parse_compose_ps(raw: &str) -> Vec<ContainerState> {
    let trimmed = raw.trim();
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed).unwrap_or_default();
    }
    trimmed
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect()
}

#[derive(Debug, Deserialize)]
struct ComposeProject {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Status", default)]
    status: String,
}

fn parse_compose_ls(raw: &str, prefix: &str) -> ShadowResult<Vec<StackInfo>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let projects: Vec<ComposeProject> = serde_json::from_str(trimmed)?;
    let mut stacks: Vec<StackInfo> = projects
        .into_iter()
        .filter_map(|p| {
            let sandbox = p.name.strip_prefix(prefix)?.to_string();
            Some(StackInfo {
                sandbox,
                project: p.name,
                status: p.status,
            })
        })
        .collect();
    stacks.sort_by(|a, b| a.sandbox.cmp(&b.sandbox));
    Ok(stacks)
}

/// Wait for `child`, killing it once `timeout` has elapsed.
fn wait_with_timeout(
    mut child: Child,
    timeout: Option<Duration>,
    what: &str,
) -> ShadowResult<ExecOutput> {
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());
    let started = Instant::now();

    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if let Some(limit) = timeout {
            if started.elapsed() >= limit {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ShadowError::Timeout {
                    what: what.to_string(),
                    seconds: limit.as_secs_f64(),
                });
            }
        }
        std::thread::sleep(Duration::from_millis(25));
    };

    Ok(ExecOutput {
        exit_code: status.code().unwrap_or(-1),
        stdout: stdout.join().unwrap_or_default(),
        stderr: stderr.join().unwrap_or_default(),
    })
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).to_string()
    })
}
