use clap::{Parser, Subcommand, ValueEnum};
use shadow_env::promotion::PromotionStatus;
use shadow_env::{
    detect_platform, DockerCompose, JsonRegistry, Service, ShadowConfig, ShadowManager,
};
use std::io::{self, Write};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

type Manager = ShadowManager<DockerCompose, JsonRegistry>;

/// Shadow Env - isolated development sandboxes
///
/// Copies a workspace into a container stack, lets you work on it in
/// isolation, then shows and promotes exactly what changed.
#[derive(Parser)]
#[command(name = "shadow-env")]
#[command(version)]
#[command(about = "Isolated shadow environments with snapshot, diff and promote", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create (or resume) a shadow environment from a workspace
    Start {
        /// Sandbox name
        name: String,
        /// Workspace directory to copy in
        #[arg(short, long, default_value = ".")]
        workspace: PathBuf,
        /// Host port for the Gitea sidecar
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Stop a shadow environment
    Stop {
        name: String,
        /// Also remove volumes, snapshot and token (destroys the sandbox)
        #[arg(long)]
        volumes: bool,
    },
    /// Show sandbox status
    Status { name: String },
    /// List registered sandboxes
    List,
    /// Run a command inside the workspace container
    Exec {
        name: String,
        #[arg(trailing_var_arg = true, required = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Open an interactive shell in the workspace container
    Shell { name: String },
    /// Show container logs
    Logs {
        name: String,
        #[arg(long, value_enum, default_value = "workspace")]
        service: ServiceArg,
        #[arg(short = 'n', long, default_value_t = 100)]
        tail: usize,
    },
    /// Initialize the Gitea sidecar (admin user, token, organization)
    Init { name: String },
    /// Show changes made inside the sandbox
    Diff {
        name: String,
        /// Include unified content diffs
        #[arg(long)]
        patch: bool,
    },
    /// Apply sandbox changes back to the host workspace
    Promote {
        name: String,
        /// Skip the confirmation prompt
        #[arg(short, long)]
        force: bool,
    },
    /// List shadow volumes
    Volumes,
    /// Remove orphaned volumes and snapshots
    Cleanup {
        /// Also tear down every registered sandbox
        #[arg(long)]
        all: bool,
        /// Skip the confirmation prompt
        #[arg(short, long)]
        force: bool,
    },
    /// Publish a local git repository to the sandbox's Gitea
    Publish {
        name: String,
        #[arg(default_value = ".")]
        module: PathBuf,
    },
    /// Publish every module repository in a directory to the sandbox's Gitea
    Sync {
        name: String,
        /// Directory holding the module repositories
        #[arg(short, long, default_value = ".")]
        workspace: PathBuf,
    },
    /// Check platform readiness
    Platform,
}

#[derive(Clone, Copy, ValueEnum)]
enum ServiceArg {
    Workspace,
    Gitea,
}

impl From<ServiceArg> for Service {
    fn from(arg: ServiceArg) -> Self {
        match arg {
            ServiceArg::Workspace => Service::Workspace,
            ServiceArg::Gitea => Service::GitHost,
        }
    }
}

fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install logger: {}", e);
    }

    if let Commands::Platform = cli.command {
        show_platform();
        return;
    }

    let manager = match ShadowConfig::load().and_then(Manager::open) {
        Ok(m) => m,
        Err(e) => {
            error!("Failed to load shadow state: {}", e);
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Start { name, workspace, port } => start(&manager, &name, workspace, port),
        Commands::Stop { name, volumes } => stop(&manager, &name, volumes),
        Commands::Status { name } => show_status(&manager, &name),
        Commands::List => list(&manager),
        Commands::Exec { name, command } => exec(&manager, &name, &command.join(" ")),
        Commands::Shell { name } => shell(&manager, &name),
        Commands::Logs { name, service, tail } => logs(&manager, &name, service.into(), tail),
        Commands::Init { name } => init(&manager, &name),
        Commands::Diff { name, patch } => diff(&manager, &name, patch),
        Commands::Promote { name, force } => promote(&manager, &name, force),
        Commands::Volumes => volumes(&manager),
        Commands::Cleanup { all, force } => cleanup(&manager, all, force),
        Commands::Publish { name, module } => publish(&manager, &name, module),
        Commands::Sync { name, workspace } => sync(&manager, &name, workspace),
        Commands::Platform => Ok(()),
    };

    if let Err(e) = result {
        error!("Error: {}", e);
        std::process::exit(1);
    }
}

fn confirm(prompt: &str) -> bool {
    print!("{} [y/N] ", prompt);
    let _ = io::stdout().flush();
    let mut answer = String::new();
    if io::stdin().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}

fn start(
    manager: &Manager,
    name: &str,
    workspace: PathBuf,
    port: Option<u16>,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("Starting shadow environment: {}", name);

    let record = manager.start(name, &workspace, port)?;

    println!("\n{}", "=".repeat(60));
    println!("Shadow environment '{}' is running", record.name);
    println!("{}", "=".repeat(60));
    println!("Workspace: {}", record.workspace_path.display());
    println!("Volume: {}", record.volume);
    println!("Gitea: http://localhost:{}", record.git_host_port);
    println!("{}", "=".repeat(60));
    println!("\nNext: shadow-env init {}", record.name);

    Ok(())
}

fn stop(manager: &Manager, name: &str, volumes: bool) -> Result<(), Box<dyn std::error::Error>> {
    manager.stop(name, volumes)?;
    if volumes {
        println!("Destroyed '{}' (volumes, snapshot and token removed)", name);
    } else {
        println!("Stopped '{}' (volumes kept; `start` resumes it)", name);
    }
    Ok(())
}

fn show_status(manager: &Manager, name: &str) -> Result<(), Box<dyn std::error::Error>> {
    let status = manager.status(name)?;
    let record = &status.record;

    println!("\n{}", "=".repeat(60));
    println!("Shadow Environment: {}", record.name);
    println!("{}", "=".repeat(60));
    println!("State: {}", record.state);
    println!("Running: {}", status.running);
    println!("Gitea healthy: {}", status.git_host_healthy);
    println!("Initialized: {}", status.initialized);
    println!("Workspace: {}", record.workspace_path.display());
    println!("Snapshot: {}", record.snapshot_path.display());
    println!("Volume: {}", record.volume);
    println!("Network: {}", record.network);
    println!("Gitea port: {}", record.git_host_port);
    println!("Created: {}", record.created_at.to_rfc3339());
    println!("{}", "=".repeat(60));

    if status.tainted {
        println!("\nThe last copy-in did not complete. Run `shadow-env start {}` to re-sync.", name);
    }

    Ok(())
}

fn list(manager: &Manager) -> Result<(), Box<dyn std::error::Error>> {
    let sandboxes = manager.list()?;

    println!("\n{}", "=".repeat(60));
    println!("Shadow Environments");
    println!("{}", "=".repeat(60));

    if sandboxes.is_empty() {
        println!("No shadow environments.");
    } else {
        for status in &sandboxes {
            let record = &status.record;
            println!(
                "{:<24} {:<12} port {:<6} {}",
                record.name,
                if status.running { "running".to_string() } else { record.state.to_string() },
                record.git_host_port,
                record.workspace_path.display()
            );
        }
    }

    println!("{}", "=".repeat(60));
    Ok(())
}

fn exec(manager: &Manager, name: &str, command: &str) -> Result<(), Box<dyn std::error::Error>> {
    let output = manager.exec(name, command)?;
    print!("{}", output.stdout);
    eprint!("{}", output.stderr);
    if !output.success() {
        std::process::exit(output.exit_code);
    }
    Ok(())
}

fn shell(manager: &Manager, name: &str) -> Result<(), Box<dyn std::error::Error>> {
    let stack = manager.running_stack(name)?;
    println!("Opening shell in '{}'. Type 'exit' to return.", name);

    let status = manager.runtime().shell_command(&stack).status()?;
    if !status.success() {
        std::process::exit(status.code().unwrap_or(1));
    }
    Ok(())
}

fn logs(manager: &Manager, name: &str, service: Service, tail: usize) -> Result<(), Box<dyn std::error::Error>> {
    print!("{}", manager.logs(name, service, tail)?);
    Ok(())
}

fn init(manager: &Manager, name: &str) -> Result<(), Box<dyn std::error::Error>> {
    info!("Initializing Gitea for: {}", name);

    let report = manager.init(name)?;

    println!("\n{}", "=".repeat(60));
    println!("Gitea initialized");
    println!("{}", "=".repeat(60));
    println!("URL: {}", report.git_host_url);
    println!("Organization: {}", report.organization);
    println!("Admin user: {}", report.admin_user);
    println!("Token file: {}", report.token_path.display());
    println!("{}", "=".repeat(60));

    Ok(())
}

fn diff(manager: &Manager, name: &str, patch: bool) -> Result<(), Box<dyn std::error::Error>> {
    if patch {
        let (diff, patch) = manager.diff_patch(name)?;
        print!("{}", diff.render());
        if !patch.is_empty() {
            println!();
            print!("{}", patch);
        }
        return Ok(());
    }

    let diff = manager.diff(name)?;
    print!("{}", diff.render());
    if !diff.is_empty() {
        println!("\n{}", diff.summary().format());
    }
    Ok(())
}

fn promote(manager: &Manager, name: &str, force: bool) -> Result<(), Box<dyn std::error::Error>> {
    let outcome = manager.promote(name, force, |diff| {
        println!("\nChanges to promote:");
        print!("{}", diff.render());
        println!("\n{}", diff.summary().format());
        confirm("Apply these changes to the host workspace?")
    })?;

    match outcome.status() {
        PromotionStatus::NoChanges => println!("No changes to promote."),
        PromotionStatus::Complete => println!("Promoted: {}", outcome.format()),
        PromotionStatus::Partial => {
            println!("Partially promoted: {}", outcome.format());
            for skipped in &outcome.skipped {
                println!("  skipped {}: {}", skipped.path.display(), skipped.reason);
            }
        }
    }
    outcome.ensure_complete()?;
    Ok(())
}

fn volumes(manager: &Manager) -> Result<(), Box<dyn std::error::Error>> {
    let volumes = manager.volumes()?;

    println!("\n{}", "=".repeat(60));
    println!("Shadow Volumes");
    println!("{}", "=".repeat(60));
    if volumes.is_empty() {
        println!("No shadow volumes.");
    }
    for volume in &volumes {
        println!("{:<40} {:<16} {}", volume.name, volume.sandbox, volume.role);
    }
    println!("{}", "=".repeat(60));
    Ok(())
}

fn cleanup(manager: &Manager, all: bool, force: bool) -> Result<(), Box<dyn std::error::Error>> {
    let plan = manager.cleanup_plan(all)?;
    if plan.is_empty() {
        println!("Nothing to clean up.");
        return Ok(());
    }

    let report = manager.cleanup(&plan, force, |plan| {
        println!("\nWill remove:");
        for name in &plan.sandboxes {
            println!("  sandbox   {}", name);
        }
        for volume in &plan.volumes {
            println!("  volume    {}", volume.name);
        }
        for snapshot in &plan.snapshots {
            println!("  snapshot  {}", snapshot);
        }
        confirm("Proceed?")
    })?;

    println!(
        "Removed {} sandbox(es), {} volume(s), {} snapshot(s)",
        report.sandboxes_removed, report.volumes_removed, report.snapshots_removed
    );
    for (what, reason) in &report.failures {
        println!("  failed {}: {}", what, reason);
    }
    Ok(())
}

fn publish(manager: &Manager, name: &str, module: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let module = std::fs::canonicalize(&module)?;
    let report = manager.publish(name, &module)?;

    println!("Published {} ({} -> main)", report.repo.name, report.branch);
    println!("  Browse: {}", report.repo.web_url);
    println!("  Inside the sandbox: {}", report.repo.internal_url);
    Ok(())
}

fn sync(manager: &Manager, name: &str, workspace: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let workspace = std::fs::canonicalize(&workspace)?;
    let report = manager.sync(name, &workspace)?;

    println!("\n{}", "=".repeat(60));
    println!("Synced modules");
    println!("{}", "=".repeat(60));
    for published in &report.published {
        println!("  ok      {} ({} -> main)", published.repo.name, published.branch);
    }
    for (module, reason) in &report.failed {
        println!("  failed  {}: {}", module, reason);
    }
    println!("{}", "=".repeat(60));

    if !report.is_complete() {
        let failed: Vec<&str> = report.failed.iter().map(|(m, _)| m.as_str()).collect();
        return Err(format!("failed to sync: {}", failed.join(", ")).into());
    }
    Ok(())
}

fn show_platform() {
    let info = detect_platform();

    println!("\n{}", "=".repeat(60));
    println!("Platform: {}", info.platform);
    println!("Docker: {}", if info.docker_available { "yes" } else { "no" });
    println!("Compose: {}", if info.compose_available { "yes" } else { "no" });
    println!("{}", "=".repeat(60));

    if !info.warnings.is_empty() {
        println!("\nWarnings:");
        for warning in &info.warnings {
            println!("  - {}", warning);
        }
    }
    if !info.recommendations.is_empty() {
        println!("\nRecommendations:");
        for rec in &info.recommendations {
            println!("  - {}", rec);
        }
    }

    if info.ready() {
        println!("\nReady for shadow environments");
    } else {
        println!("\nNot ready for shadow environments");
        std::process::exit(1);
    }
}
