use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use skybridge::agent::select_adapter;
use skybridge::config::Config;
use skybridge::events::EventBus;
use skybridge::events::console::ConsoleBroadcaster;
use skybridge::events::metrics::MetricsListener;
use skybridge::kanban::{KanbanDb, KanbanJobEventHandler, TrelloClient, TrelloSyncService};
use skybridge::orchestrator::JobOrchestrator;
use skybridge::queue::{FileBasedJobQueue, JobQueue};
use skybridge::server::{ServerConfig, build_state, start_server};
use skybridge::snapshot::store::SnapshotStore;
use skybridge::snapshot::{SnapshotSubject, capture, compare};
use skybridge::webhook::signature::GitHubSignatureVerifier;
use skybridge::webhook::{WebhookIntake, WebhookSource};
use skybridge::worktree::WorktreeManager;

#[derive(Parser)]
#[command(name = "skybridge")]
#[command(version, about = "Autonomous agent orchestration - webhooks to isolated AI coding jobs")]
pub struct Cli {
    /// Repository the worktrees are carved from (defaults to the cwd).
    #[arg(long, global = true)]
    pub repo: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the webhook server, workers, and listeners
    Serve {
        #[arg(short, long, default_value = "8430")]
        port: u16,
        /// Bind all interfaces and allow permissive CORS
        #[arg(long)]
        dev: bool,
    },
    /// Inspect worktrees
    Worktree {
        #[command(subcommand)]
        command: WorktreeCommands,
    },
    /// Capture, compare, and prune directory snapshots
    Snapshot {
        #[command(subcommand)]
        command: SnapshotCommands,
    },
    /// Inspect the job queue
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },
}

#[derive(Subcommand)]
pub enum WorktreeCommands {
    /// List worktrees of the configured repository
    List,
}

#[derive(Subcommand)]
pub enum SnapshotCommands {
    /// Capture a snapshot of a directory
    Capture {
        #[arg(long)]
        target: PathBuf,
    },
    /// Compare two stored snapshots
    Compare { old_id: String, new_id: String },
    /// Apply the retention policy to snapshots and diffs
    Prune,
}

#[derive(Subcommand)]
pub enum QueueCommands {
    /// Show queue depth and recent jobs
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let repo = match cli.repo.clone() {
        Some(repo) => repo,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let config = Config::from_env(repo)?;

    match cli.command {
        Commands::Serve { port, dev } => serve(config, port, dev).await,
        Commands::Worktree {
            command: WorktreeCommands::List,
        } => worktree_list(config).await,
        Commands::Snapshot { command } => snapshot_command(config, command),
        Commands::Queue {
            command: QueueCommands::Status,
        } => queue_status(config).await,
    }
}

async fn serve(config: Config, port: u16, dev: bool) -> Result<()> {
    config.ensure_directories()?;

    let queue: Arc<dyn JobQueue> =
        Arc::new(FileBasedJobQueue::open(config.queue_dir()).context("Failed to open job queue")?);
    let bus = Arc::new(EventBus::new());
    let console = ConsoleBroadcaster::new(256);
    console.register(&bus);

    let metrics = MetricsListener::new();
    metrics.register(&bus);

    // Kanban projection plus optional Trello reconciliation.
    let kanban_db = Arc::new(Mutex::new(
        KanbanDb::new(&config.kanban_db_path()).context("Failed to open kanban database")?,
    ));
    let mut kanban = KanbanJobEventHandler::new(Arc::clone(&kanban_db), "Skybridge");
    if let (Ok(key), Ok(token)) = (std::env::var("TRELLO_KEY"), std::env::var("TRELLO_TOKEN")) {
        let mut client = TrelloClient::new(key, token);
        // TRELLO_LIST_IDS / TRELLO_LABEL_IDS: "Name=id;Other Name=id".
        for (name, id) in parse_id_map(&std::env::var("TRELLO_LIST_IDS").unwrap_or_default()) {
            client = client.with_list(name, id);
        }
        for (name, id) in parse_id_map(&std::env::var("TRELLO_LABEL_IDS").unwrap_or_default()) {
            client = client.with_label(name, id);
        }
        let sync = TrelloSyncService::start(
            Arc::new(client),
            Arc::clone(&kanban_db),
            Arc::clone(&bus),
            Duration::from_millis(500),
        );
        kanban = kanban.with_sync(sync);
        info!("trello sync enabled");
    }
    Arc::new(kanban).register(&bus);

    // Intake with whichever sources carry a configured secret.
    let mut intake = WebhookIntake::new(Arc::clone(&queue), Arc::clone(&bus));
    match config.webhook_secret("github") {
        Some(secret) => {
            intake = intake.register_source(
                WebhookSource::GitHub,
                Arc::new(GitHubSignatureVerifier),
                secret,
            );
        }
        None => warn!("WEBHOOK_GITHUB_SECRET unset; github webhooks will be rejected"),
    }

    // Retention sweep for snapshots and diffs.
    let snapshots = Arc::new(SnapshotStore::new(config.snapshots_dir(), config.diffs_dir()));
    match (snapshots.prune_snapshots(), snapshots.prune_diffs()) {
        (Ok(removed_snapshots), Ok(removed_diffs)) => {
            if !removed_snapshots.is_empty() || !removed_diffs.is_empty() {
                info!(
                    snapshots = removed_snapshots.len(),
                    diffs = removed_diffs.len(),
                    "retention sweep removed stale files"
                );
            }
        }
        (snapshots_result, diffs_result) => {
            warn!(?snapshots_result, ?diffs_result, "retention sweep failed");
        }
    }

    // Orchestration.
    let agent = select_adapter(&config.flags, console.clone());
    info!(agent_type = agent.agent_type(), "agent adapter selected");
    let orchestrator = Arc::new(JobOrchestrator::new(
        Arc::clone(&queue),
        Arc::clone(&bus),
        Arc::new(WorktreeManager::new(
            &config.worktrees_base,
            &config.repo_path,
            &config.base_branch,
        )),
        agent,
        snapshots,
        &config.base_branch,
    ));
    let workers = orchestrator.start_workers(config.worker_count);
    info!(workers = workers.len(), "worker pool started");

    let state = build_state(&config, intake, queue, metrics, console, !dev);
    start_server(ServerConfig { port, dev_mode: dev }, state).await
}

/// Parse a "Name=id;Other Name=id" mapping from the environment.
fn parse_id_map(raw: &str) -> Vec<(String, String)> {
    raw.split(';')
        .filter_map(|entry| entry.split_once('='))
        .map(|(name, id)| (name.trim().to_string(), id.trim().to_string()))
        .filter(|(name, id)| !name.is_empty() && !id.is_empty())
        .collect()
}

async fn worktree_list(config: Config) -> Result<()> {
    let manager = WorktreeManager::new(
        &config.worktrees_base,
        &config.repo_path,
        &config.base_branch,
    );
    for worktree in manager.list_worktrees().await? {
        let branch = worktree.branch.as_deref().unwrap_or(if worktree.detached {
            "(detached)"
        } else {
            "-"
        });
        println!("{}\t{}", worktree.path, branch);
    }
    Ok(())
}

fn snapshot_command(config: Config, command: SnapshotCommands) -> Result<()> {
    let store = SnapshotStore::new(config.snapshots_dir(), config.diffs_dir());
    match command {
        SnapshotCommands::Capture { target } => {
            let snapshot = capture(&target, SnapshotSubject::Fileops)?;
            let path = store.save_snapshot(&snapshot)?;
            println!("{} -> {}", snapshot.id(), path.display());
        }
        SnapshotCommands::Compare { old_id, new_id } => {
            let old = store.load_snapshot(&old_id, None)?;
            let new = store.load_snapshot(&new_id, None)?;
            let diff = compare(&old, &new);
            println!("{}", serde_json::to_string_pretty(&diff.summary)?);
            let path = store.save_diff(&diff)?;
            println!("diff saved to {}", path.display());
        }
        SnapshotCommands::Prune => {
            let snapshots = store.prune_snapshots()?;
            let diffs = store.prune_diffs()?;
            println!("pruned {} snapshots, {} diffs", snapshots.len(), diffs.len());
        }
    }
    Ok(())
}

async fn queue_status(config: Config) -> Result<()> {
    let queue = FileBasedJobQueue::open(config.queue_dir())?;
    println!("pending: {}", queue.size().await);
    for job in queue.list_jobs(20, None).await? {
        println!(
            "{}\t{}\t{}\t{}",
            job.job_id,
            job.status.as_str(),
            job.event_type,
            job.created_at.to_rfc3339()
        );
    }
    Ok(())
}
