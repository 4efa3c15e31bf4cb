//! Git-hosting sidecar adapter.
//!
//! Each sandbox runs a Gitea sidecar. The core needs only a handful of
//! primitives from it: readiness, an admin user, an API token, and
//! organisation/repository creation. [`GitHost`] is that seam and
//! [`GiteaSidecar`] the real implementation.

use crate::error::{ShadowError, ShadowResult};
use crate::health::wait_until;
use crate::runtime::{ContainerRuntime, ExecSpec, Service, StackConfig};
use reqwest::blocking::Client;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

/// Admin account created in the sidecar.
#[derive(Debug, Clone)]
pub struct AdminUser {
    pub username: String,
    pub password: String,
    pub email: String,
}

/// Credentials for API calls and pushes.
#[derive(Debug, Clone)]
pub struct GitCredentials {
    pub username: String,
    pub token: String,
}

/// A repository on the sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoRef {
    pub org: String,
    pub name: String,
    /// Browser URL from the host.
    pub web_url: String,
    /// Clone URL from inside the sandbox network.
    pub internal_url: String,
    /// Clone URL from the host. Carries no credentials.
    pub clone_url: String,
}

/// Primitives consumed from the git-hosting sidecar.
pub trait GitHost {
    fn is_ready(&self) -> bool;

    /// Create the admin user; an existing user is not an error.
    fn create_admin_user(&self, user: &AdminUser) -> ShadowResult<()>;

    fn issue_token(&self, username: &str) -> ShadowResult<String>;

    /// Create an organisation; an existing one is not an error.
    fn create_organization(&self, creds: &GitCredentials, name: &str) -> ShadowResult<()>;

    /// Create a repository; an existing one is returned as-is.
    fn create_repository(
        &self,
        creds: &GitCredentials,
        org: &str,
        name: &str,
    ) -> ShadowResult<RepoRef>;
}

/// Poll the sidecar until ready, failing with `Timeout` once `budget` is spent.
pub fn wait_for_git_host<G: GitHost + ?Sized>(
    host: &G,
    budget: Duration,
    interval: Duration,
) -> ShadowResult<Duration> {
    wait_until("git host", budget, interval, || host.is_ready())
}

/// Gitea sidecar reached through `gitea admin` (in the container) and the HTTP API.
pub struct GiteaSidecar<'a, R: ContainerRuntime> {
    runtime: &'a R,
    stack: &'a StackConfig,
    base_url: String,
    client: Client,
}

impl<'a, R: ContainerRuntime> GiteaSidecar<'a, R> {
    pub fn new(runtime: &'a R, stack: &'a StackConfig, request_timeout: Duration) -> ShadowResult<Self> {
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            runtime,
            stack,
            base_url: stack.git_host_url(),
            client,
        })
    }

    fn gitea_admin(&self, args: &[&str]) -> ShadowResult<crate::runtime::ExecOutput> {
        let mut argv = vec!["gitea", "admin"];
        argv.extend_from_slice(args);
        self.runtime
            .exec(self.stack, &ExecSpec::new(Service::GitHost, &argv).user("git"))
    }

    fn api(
        &self,
        method: Method,
        endpoint: &str,
        token: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> ShadowResult<(u16, String)> {
        let url = format!("{}/api/v1{}", self.base_url, endpoint);
        let mut request = self.client.request(method, &url);
        if let Some(token) = token {
            request = request.header(reqwest::header::AUTHORIZATION, format!("token {}", token));
        }
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request
            .send()
            .map_err(|e| ShadowError::GitHost(format!("{}: {}", url, e)))?;
        let status = response.status().as_u16();
        let text = response.text().unwrap_or_default();
        tracing::debug!(url = %url, status, "git host api");
        Ok((status, text))
    }

    fn repo_ref(&self, org: &str, name: &str) -> RepoRef {
        RepoRef {
            org: org.to_string(),
            name: name.to_string(),
            web_url: format!("{}/{}/{}", self.base_url, org, name),
            internal_url: format!("{}/{}/{}.git", self.stack.git_host_internal_url, org, name),
            clone_url: format!("{}/{}/{}.git", self.base_url, org, name),
        }
    }
}

impl<R: ContainerRuntime> GitHost for GiteaSidecar<'_, R> {
    fn is_ready(&self) -> bool {
        let url = format!("{}/api/healthz", self.base_url);
        match self.client.get(&url).timeout(Duration::from_secs(5)).send() {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::trace!(url = %url, error = %e, "health probe failed");
                false
            }
        }
    }

    fn create_admin_user(&self, user: &AdminUser) -> ShadowResult<()> {
        let output = self.gitea_admin(&[
            "user",
            "create",
            "--admin",
            "--username",
            &user.username,
            "--password",
            &user.password,
            "--email",
            &user.email,
            "--must-change-password=false",
        ])?;
        if output.success() || already_exists(&output.stdout) || already_exists(&output.stderr) {
            Ok(())
        } else {
            Err(ShadowError::GitHost(format!(
                "failed to create admin user: {}",
                output.stderr.trim()
            )))
        }
    }

    fn issue_token(&self, username: &str) -> ShadowResult<String> {
        let token_name = format!("shadow-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        let output = self.gitea_admin(&[
            "user",
            "generate-access-token",
            "--username",
            username,
            "--token-name",
            &token_name,
            "--scopes",
            "all",
        ])?;
        if !output.success() {
            return Err(ShadowError::GitHost(format!(
                "failed to generate token: {}",
                output.stderr.trim()
            )));
        }
        parse_token(&output.stdout)
            .ok_or_else(|| ShadowError::GitHost("token missing from gitea output".into()))
    }

    fn create_organization(&self, creds: &GitCredentials, name: &str) -> ShadowResult<()> {
        let (status, body) = self.api(
            Method::POST,
            "/orgs",
            Some(&creds.token),
            Some(json!({ "username": name, "visibility": "public", "full_name": name })),
        )?;
        match status {
            201 | 409 | 422 => Ok(()),
            _ => Err(ShadowError::GitHost(format!(
                "failed to create organization: HTTP {} - {}",
                status, body
            ))),
        }
    }

    fn create_repository(
        &self,
        creds: &GitCredentials,
        org: &str,
        name: &str,
    ) -> ShadowResult<RepoRef> {
        let (status, _) = self.api(
            Method::GET,
            &format!("/repos/{}/{}", org, name),
            Some(&creds.token),
            None,
        )?;
        if status == 200 {
            return Ok(self.repo_ref(org, name));
        }

        let (status, body) = self.api(
            Method::POST,
            &format!("/orgs/{}/repos", org),
            Some(&creds.token),
            Some(json!({
                "name": name,
                "description": format!("Shadow copy of {}", name),
                "private": false,
                "auto_init": false,
            })),
        )?;
        match status {
            201 | 409 => Ok(self.repo_ref(org, name)),
            _ => {
                let lower = body.to_lowercase();
                let hint = if lower.contains("token") && lower.contains("invalid") {
                    "; the API token looks invalid, re-run init"
                } else if lower.contains("not found") || lower.contains("does not exist") {
                    "; the organization is missing, re-run init"
                } else {
                    ""
                };
                Err(ShadowError::GitHost(format!(
                    "failed to create repository (HTTP {}): {}{}",
                    status, body, hint
                )))
            }
        }
    }
}

fn already_exists(text: &str) -> bool {
    text.to_lowercase().contains("already exists")
}

/// Pull the token out of `Access token was successfully created: <token>`.
fn parse_token(stdout: &str) -> Option<String> {
    stdout.lines().rev().find_map(|line| {
        let candidate = line.rsplit(':').next()?.trim();
        let looks_like_token =
            candidate.len() > 20 && candidate.chars().all(|c| c.is_ascii_alphanumeric());
        looks_like_token.then(|| candidate.to_string())
    })
}

/// One credential file per sandbox, outside any workspace.
#[derive(Debug, Clone)]
pub struct TokenStore {
    dir: PathBuf,
}

impl TokenStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self, sandbox: &str) -> PathBuf {
        self.dir.join(sandbox)
    }

    pub fn save(&self, sandbox: &str, token: &str) -> ShadowResult<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path(sandbox);
        let mut file = open_private(&path)?;
        file.write_all(format!("{}\n", token).as_bytes())?;
        Ok(path)
    }

    pub fn load(&self, sandbox: &str) -> ShadowResult<Option<String>> {
        match fs::read_to_string(self.path(sandbox)) {
            Ok(raw) => Ok(Some(raw.trim().to_string()).filter(|t| !t.is_empty())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn remove(&self, sandbox: &str) -> ShadowResult<()> {
        match fs::remove_file(self.path(sandbox)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Truncate-or-create `path` readable by the owner only, before any byte is written.
#[cfg(unix)]
fn open_private(path: &Path) -> ShadowResult<fs::File> {
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
    let file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // `mode` only applies on creation.
    file.set_permissions(fs::Permissions::from_mode(0o600))?;
    Ok(file)
}

#[cfg(not(unix))]
fn open_private(path: &Path) -> ShadowResult<fs::File> {
    Ok(fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?)
}

/// Result of publishing a module.
#[derive(Debug, Clone)]
pub struct PublishReport {
    pub repo: RepoRef,
    pub branch: String,
}

/// Create `module_path`'s repository on the sidecar and force-push its
/// current branch to `main`.
pub fn publish_module<G: GitHost + ?Sized>(
    host: &G,
    creds: &GitCredentials,
    org: &str,
    module_path: &Path,
) -> ShadowResult<PublishReport> {
    if !module_path.join(".git").exists() {
        return Err(ShadowError::GitHost(format!(
            "{} is not a git repository",
            module_path.display()
        )));
    }
    let name = module_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| ShadowError::GitHost("module path has no name".into()))?;

    let repo = host.create_repository(creds, org, &name)?;

    let remote = git(module_path, &["remote", "get-url", PUBLISH_REMOTE]);
    if remote.map(|o| o.status.success()).unwrap_or(false) {
        run_git(module_path, &["remote", "set-url", PUBLISH_REMOTE, &repo.clone_url])?;
    } else {
        run_git(module_path, &["remote", "add", PUBLISH_REMOTE, &repo.clone_url])?;
    }

    let branch = run_git(module_path, &["branch", "--show-current"])?;
    let branch = if branch.is_empty() { "main".to_string() } else { branch };

    let refspec = format!("{}:main", branch);
    let mut push = Command::new("git");
    push.current_dir(module_path)
        .args(["-c", "credential.helper=", "-c", CREDENTIAL_HELPER])
        .args(["push", "-f", PUBLISH_REMOTE, refspec.as_str()])
        .env(ENV_PUSH_USER, &creds.username)
        .env(ENV_PUSH_TOKEN, &creds.token)
        .env("GIT_TERMINAL_PROMPT", "0");
    check_git(push.output(), "push")?;
    tracing::info!(module = %name, org = %org, branch = %branch, "published module");

    Ok(PublishReport { repo, branch })
}

const PUBLISH_REMOTE: &str = "shadow";
const ENV_PUSH_USER: &str = "SHADOW_PUSH_USER";
const ENV_PUSH_TOKEN: &str = "SHADOW_PUSH_TOKEN";

/// Answers git's credential prompt from the push's environment; the token
/// is never written to the repository's config. Preceded by an empty helper
/// to clear any configured ones.
const CREDENTIAL_HELPER: &str = "credential.helper=!f() { test \"$1\" = get || exit 0; \
echo \"username=$SHADOW_PUSH_USER\"; echo \"password=$SHADOW_PUSH_TOKEN\"; }; f";

fn git(dir: &Path, args: &[&str]) -> std::io::Result<std::process::Output> {
    Command::new("git").current_dir(dir).args(args).output()
}

fn run_git(dir: &Path, args: &[&str]) -> ShadowResult<String> {
    check_git(git(dir, args), args.first().copied().unwrap_or_default())
}

fn check_git(output: std::io::Result<std::process::Output>, what: &str) -> ShadowResult<String> {
    let output = output.map_err(|e| ShadowError::GitHost(format!("failed to run git: {}", e)))?;
    if !output.status.success() {
        return Err(ShadowError::GitHost(format!(
            "git {} failed: {}",
            what,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-process git host for tests.

    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    pub(crate) struct FakeGitHost {
        /// Number of `is_ready` probes answered false before turning ready.
        pub(crate) not_ready_for: Mutex<u32>,
        pub(crate) never_ready: bool,
        /// Directory holding bare repositories; pushes land here.
        pub(crate) repos_dir: Option<PathBuf>,
        pub(crate) calls: Mutex<Vec<String>>,
    }

    /// Repository on branch `feature` with no commits yet.
    pub(crate) fn init_empty_repo(dir: &Path) {
        fs::create_dir_all(dir).unwrap();
        for args in [
            vec!["init", "-q", "-b", "feature"],
            vec!["config", "user.email", "test@test.com"],
            vec!["config", "user.name", "Test User"],
        ] {
            run_git(dir, &args).unwrap();
        }
    }

    /// Repository on branch `feature` with one commit.
    pub(crate) fn init_repo(dir: &Path) {
        init_empty_repo(dir);
        fs::write(dir.join("README.md"), "# module\n").unwrap();
        run_git(dir, &["add", "."]).unwrap();
        run_git(dir, &["commit", "-q", "-m", "initial"]).unwrap();
    }

    impl FakeGitHost {
        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl GitHost for FakeGitHost {
        fn is_ready(&self) -> bool {
            if self.never_ready {
                return false;
            }
            let mut remaining = self.not_ready_for.lock().unwrap();
            if *remaining == 0 {
                true
            } else {
                *remaining -= 1;
                false
            }
        }

        fn create_admin_user(&self, user: &AdminUser) -> ShadowResult<()> {
            self.record(format!("admin:{}", user.username));
            Ok(())
        }

        fn issue_token(&self, username: &str) -> ShadowResult<String> {
            self.record(format!("token:{}", username));
            Ok("0123456789abcdef0123456789abcdef01234567".to_string())
        }

        fn create_organization(&self, _creds: &GitCredentials, name: &str) -> ShadowResult<()> {
            self.record(format!("org:{}", name));
            Ok(())
        }

        fn create_repository(
            &self,
            _creds: &GitCredentials,
            org: &str,
            name: &str,
        ) -> ShadowResult<RepoRef> {
            self.record(format!("repo:{}/{}", org, name));
            let dir = self
                .repos_dir
                .as_ref()
                .ok_or_else(|| ShadowError::GitHost("no repos dir".into()))?;
            let bare = dir.join(format!("{}.git", name));
            if !bare.exists() {
                fs::create_dir_all(&bare)?;
                run_git(&bare, &["init", "--bare", "-q"])?;
            }
            Ok(RepoRef {
                org: org.to_string(),
                name: name.to_string(),
                web_url: format!("http://localhost/{}/{}", org, name),
                internal_url: format!("http://gitea:3000/{}/{}.git", org, name),
                clone_url: bare.display().to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::{init_repo, FakeGitHost};
    use super::*;
    use crate::config::ShadowConfig;
    use crate::runtime::fake::FakeRuntime;
    use tempfile::TempDir;

    #[test]
    fn token_is_parsed_from_gitea_output() {
        let out = "2024/01/01 ...\nAccess token was successfully created: 8f3a9c1b2d4e5f60718293a4b5c6d7e8f9012345\n";
        assert_eq!(
            parse_token(out).as_deref(),
            Some("8f3a9c1b2d4e5f60718293a4b5c6d7e8f9012345")
        );
        assert_eq!(parse_token("error: user does not exist"), None);
    }

    #[test]
    fn wait_for_git_host_succeeds_after_a_few_probes() {
        let host = FakeGitHost {
            not_ready_for: std::sync::Mutex::new(2),
            ..Default::default()
        };
        wait_for_git_host(&host, Duration::from_secs(5), Duration::from_millis(1)).unwrap();
    }

    #[test]
    fn unreachable_sidecar_times_out() {
        let tmp = TempDir::new().unwrap();
        let config = ShadowConfig::with_home(tmp.path());
        // Port 9 (discard) is not listening on test hosts; connections are refused.
        let stack = StackConfig::new(&config, "demo", 9).unwrap();
        let runtime = FakeRuntime::new(tmp.path().join("docker"));
        let sidecar = GiteaSidecar::new(&runtime, &stack, Duration::from_millis(200)).unwrap();

        let started = std::time::Instant::now();
        let err = wait_for_git_host(&sidecar, Duration::from_millis(300), Duration::from_millis(50))
            .unwrap_err();

        assert!(matches!(err, ShadowError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn token_store_writes_private_per_sandbox_files() {
        let tmp = TempDir::new().unwrap();
        let store = TokenStore::new(tmp.path().join("tokens"));

        let a = store.save("alpha", "tok-a").unwrap();
        let b = store.save("beta", "tok-b").unwrap();
        assert_ne!(a, b);
        assert_eq!(store.load("alpha").unwrap().as_deref(), Some("tok-a"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&a).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o600);
        }

        store.remove("alpha").unwrap();
        store.remove("alpha").unwrap();
        assert_eq!(store.load("alpha").unwrap(), None);
    }

    #[cfg(unix)]
    #[test]
    fn token_store_tightens_an_existing_file() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = TempDir::new().unwrap();
        let store = TokenStore::new(tmp.path().join("tokens"));
        fs::create_dir_all(tmp.path().join("tokens")).unwrap();
        let path = store.path("alpha");
        fs::write(&path, "old-token-that-is-longer\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        store.save("alpha", "new").unwrap();

        assert_eq!(fs::metadata(&path).unwrap().permissions().mode() & 0o777, 0o600);
        assert_eq!(fs::read_to_string(&path).unwrap(), "new\n");
    }

    #[test]
    fn sidecar_clone_urls_carry_no_credentials() {
        let tmp = TempDir::new().unwrap();
        let config = ShadowConfig::with_home(tmp.path());
        let stack = StackConfig::new(&config, "demo", 3100).unwrap();
        let runtime = FakeRuntime::new(tmp.path().join("docker"));
        let sidecar = GiteaSidecar::new(&runtime, &stack, Duration::from_secs(1)).unwrap();

        let repo = sidecar.repo_ref("shadow", "amplifier-core");

        assert_eq!(repo.clone_url, "http://localhost:3100/shadow/amplifier-core.git");
        assert_eq!(repo.internal_url, "http://gitea:3000/shadow/amplifier-core.git");
    }

    #[test]
    fn publish_pushes_current_branch_to_main() {
        let tmp = TempDir::new().unwrap();
        let module = tmp.path().join("my-module");
        init_repo(&module);
        let host = FakeGitHost {
            repos_dir: Some(tmp.path().join("remote")),
            ..Default::default()
        };
        let creds = GitCredentials {
            username: "admin".into(),
            token: "0f1e2d3c4b5a69788796a5b4c3d2e1f0".into(),
        };

        let report = publish_module(&host, &creds, "shadow", &module).unwrap();
        assert_eq!(report.branch, "feature");
        assert_eq!(host.calls(), vec!["repo:shadow/my-module".to_string()]);

        let bare = tmp.path().join("remote/my-module.git");
        let log = run_git(&bare, &["log", "--oneline", "main"]).unwrap();
        assert!(log.contains("initial"));

        let remote = run_git(&module, &["remote", "get-url", "shadow"]).unwrap();
        assert_eq!(remote, bare.display().to_string());
        let git_config = fs::read_to_string(module.join(".git/config")).unwrap();
        assert!(!git_config.contains(&creds.token));

        // Publishing again reuses the remote.
        publish_module(&host, &creds, "shadow", &module).unwrap();
    }

    #[test]
    fn publish_rejects_non_repositories() {
        let tmp = TempDir::new().unwrap();
        let host = FakeGitHost::default();
        let creds = GitCredentials {
            username: "admin".into(),
            token: "t".into(),
        };
        let err = publish_module(&host, &creds, "shadow", tmp.path()).unwrap_err();
        assert!(matches!(err, ShadowError::GitHost(_)));
        assert!(host.calls().is_empty());
    }
}
