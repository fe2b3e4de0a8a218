mod config;
mod data_dir;
mod engine;
mod git;
mod ledger;
mod lock;
mod model;
mod provider;
mod retry;
mod reviewer;
mod session;
mod signals;
mod status;
mod worker;
mod workspace;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use config::{CliOverrides, ForemanConfig};
use data_dir::DataDir;
use model::IssueStatus;
use provider::ScriptedProvider;
use session::Session;

/// Coordinates autonomous workers over a shared git-backed issue and
/// pull-request ledger: workers claim issues, implement them in isolated
/// workspaces and open pull requests; a reviewer judges each PR and merges
/// accepted changes into the integration workspace, which then propagates
/// to every worker.
#[derive(Parser, Debug)]
#[command(name = "foreman", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "foreman.toml", global = true)]
    config: PathBuf,

    /// Data directory (overrides config)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Extra logging (lock waits, ledger retries, claim races)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Errors and the final summary only
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize the data directory, integration workspace and ledgers
    Init,
    /// Run a collaboration session until the backlog is drained
    Run {
        /// Number of workers (overrides config)
        #[arg(long)]
        workers: Option<u32>,

        /// JSON file of `{title, description}` entries to seed the backlog
        #[arg(long)]
        seed: Option<PathBuf>,
    },
    /// Show issue, pull request and workspace state
    Status,
    /// Create and list issues
    Issue {
        #[command(subcommand)]
        action: IssueAction,
    },
    /// Copy merged integration state into every worker workspace
    Propagate,
    /// Fold one worker's files back into the integration workspace
    Reconcile {
        /// Worker whose workspace to fold back
        worker_id: String,
    },
}

#[derive(Subcommand, Debug)]
enum IssueAction {
    /// Add an issue to the backlog
    New {
        /// One-line summary
        #[arg(long)]
        title: String,

        /// What a worker needs to know to implement it
        #[arg(long, default_value = "")]
        description: String,
    },
    /// List issues, outstanding ones by default
    List {
        /// Include completed issues
        #[arg(long)]
        all: bool,
    },
}

impl Cli {
    /// Extract the override-able fields into a CliOverrides struct.
    fn to_overrides(&self) -> CliOverrides {
        let workers = match &self.command {
            Commands::Run { workers, .. } => *workers,
            _ => None,
        };
        CliOverrides {
            data_dir: self.data_dir.clone(),
            workers,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Log level: --quiet = error only, --verbose = debug+, default = info+
    let level = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(false)
        .with_env_filter(filter)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    // Load config: file > defaults, then CLI > file
    let mut config = match ForemanConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Configuration error: {e}");
            std::process::exit(1);
        }
    };
    config.apply_cli_overrides(&cli.to_overrides());
    if let Err(e) = config.validate() {
        eprintln!("Configuration validation failed: {e}");
        std::process::exit(1);
    }
    tracing::debug!(?config, "resolved configuration");

    let data = DataDir::new(config.data.dir.clone());

    match &cli.command {
        Commands::Init => init(&config, &data).await,
        Commands::Run { seed, .. } => run(config, seed.as_deref()).await,
        Commands::Status => show_status(&config, &data).await,
        Commands::Issue { action } => handle_issue(&config, &data, action).await,
        Commands::Propagate => propagate(&config, &data).await,
        Commands::Reconcile { worker_id } => reconcile(&config, &data, worker_id).await,
    }
}

/// Exit early with a pointer to `init` when the integration workspace is
/// missing. Commands other than `init` and `run` do not create state.
fn require_initialized(data: &DataDir) {
    if !data.integration_dir().join(".git").exists() {
        eprintln!(
            "No integration workspace under {}. Run `foreman init` first.",
            data.root().display()
        );
        std::process::exit(1);
    }
}

async fn init(config: &ForemanConfig, data: &DataDir) {
    if let Err(e) = data.ensure_initialized() {
        eprintln!("Error initializing data directory: {e}");
        std::process::exit(1);
    }
    let engine = session::build_engine(config, data);
    if let Err(e) = engine.workspaces().provision_integration().await {
        eprintln!("Error provisioning integration workspace: {e}");
        std::process::exit(1);
    }
    if let Err(e) = engine.init().await {
        eprintln!("Error creating ledgers: {e}");
        std::process::exit(1);
    }
    println!("Initialized data directory: {}", data.root().display());
    println!("  integration: {}", data.integration_dir().display());
    println!("  workers:     {}", data.workers_dir().display());
}

async fn run(config: ForemanConfig, seed: Option<&Path>) {
    let signals = signals::SignalHandler::install();
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        workers = config.workers.count,
        reviewer = %config.review.reviewer,
        "foreman starting"
    );

    let session = Session::new(config, signals, Arc::new(ScriptedProvider));
    let summary = match session.run(seed).await {
        Ok(summary) => summary,
        Err(e) => {
            tracing::error!("Session failed: {e}");
            std::process::exit(1);
        }
    };

    println!(
        "Session complete: {}/{} issues completed, {}/{} pull requests merged",
        summary.issues_completed, summary.issues_total, summary.prs_merged, summary.prs_total
    );
    for worker in &summary.workers {
        println!(
            "  {}: claimed {}, resubmitted {} ({})",
            worker.worker_id, worker.claimed, worker.resubmitted, worker.exit_reason
        );
    }
    println!(
        "  {}: reviewed {}, merged {}, changes requested {} ({})",
        summary.reviewer.reviewer_id,
        summary.reviewer.reviewed,
        summary.reviewer.merged,
        summary.reviewer.changes_requested,
        summary.reviewer.exit_reason
    );
}

async fn show_status(config: &ForemanConfig, data: &DataDir) {
    require_initialized(data);
    let engine = session::build_engine(config, data);
    match status::collect(&engine).await {
        Ok(report) => print!("{}", report.render()),
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}

async fn handle_issue(config: &ForemanConfig, data: &DataDir, action: &IssueAction) {
    require_initialized(data);
    let engine = session::build_engine(config, data);
    match action {
        IssueAction::New { title, description } => {
            match engine
                .create_issue(title.clone(), description.clone())
                .await
            {
                Ok(issue) => println!("Created issue {}: {}", issue.id, issue.title),
                Err(e) => {
                    eprintln!("Error: {e}");
                    std::process::exit(1);
                }
            }
        }
        IssueAction::List { all } => {
            let issues = match engine.issues().await {
                Ok(issues) => issues,
                Err(e) => {
                    eprintln!("Error: {e}");
                    std::process::exit(1);
                }
            };
            let mut shown = 0;
            for issue in &issues {
                if !all && issue.status == IssueStatus::Completed {
                    continue;
                }
                let assignee = issue
                    .assigned_to
                    .as_deref()
                    .map(|w| format!(" -> {w}"))
                    .unwrap_or_default();
                println!(
                    "[{:<9}] {}  {}{}",
                    issue.status.to_string(),
                    issue.id,
                    issue.title,
                    assignee
                );
                shown += 1;
            }
            if shown == 0 {
                let scope = if *all { "" } else { " outstanding" };
                println!("No{scope} issues.");
            }
        }
    }
}

async fn propagate(config: &ForemanConfig, data: &DataDir) {
    require_initialized(data);
    let engine = session::build_engine(config, data);
    match engine.workspaces().propagate_to_workers().await {
        Ok(report) => println!(
            "Propagated to {} workers: {} files added, {} failures",
            report.workers, report.files_added, report.failures
        ),
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}

async fn reconcile(config: &ForemanConfig, data: &DataDir, worker_id: &str) {
    require_initialized(data);
    let engine = session::build_engine(config, data);
    match engine
        .workspaces()
        .reconcile_to_integration(worker_id, engine.integration())
        .await
    {
        Ok(copied) => println!("Reconciled {copied} files from {worker_id} into integration"),
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}
