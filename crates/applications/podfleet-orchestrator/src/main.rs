//! podfleet - GPU pod fleet operator
//!
//! ## Usage
//!
//! ```bash
//! # Live state
//! podfleet pods
//! podfleet gpus --sort price
//!
//! # Keep reconciling and log fleet changes (Ctrl+C to exit)
//! podfleet watch
//!
//! # One action over many pods
//! podfleet stop pod-a pod-b
//! podfleet terminate pod-c
//!
//! # Past workflow runs
//! podfleet history --search llama --outcome partial-failure
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use podfleet_core::{GpuSortKey, PodId};
use podfleet_orchestrator::{
    BulkAction, Engine, EngineConfig, HistoryFilter, HistoryLog, RunPodGateway, Snapshot,
    WorkflowStatus,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// PodFleet: lifecycle orchestration for rented GPU pods
#[derive(Parser)]
#[command(name = "podfleet")]
#[command(about = "Lifecycle orchestration for rented GPU pods", long_about = None)]
struct Cli {
    /// RunPod API key
    #[arg(long, global = true, env = "RUNPOD_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// JSON-lines file holding workflow history
    #[arg(long, global = true, env = "PODFLEET_HISTORY_PATH")]
    history_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch pods once and print the snapshot as JSON
    Pods,

    /// Fetch GPU availability once and print it
    Gpus {
        /// Ordering within a stock tier
        #[arg(long, value_enum)]
        sort: Option<SortArg>,
    },

    /// List deployable templates
    Templates {
        /// Include RunPod's public templates
        #[arg(long)]
        public: bool,
    },

    /// Run the reconciler and log fleet changes until Ctrl+C
    Watch,

    /// Query past workflow runs
    History {
        /// Case-insensitive substring
        #[arg(long)]
        search: Option<String>,

        /// Only runs with this outcome
        #[arg(long, value_enum)]
        outcome: Option<OutcomeArg>,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Stop pods
    Stop {
        #[arg(required = true)]
        pod_ids: Vec<String>,
    },

    /// Terminate pods
    Terminate {
        #[arg(required = true)]
        pod_ids: Vec<String>,
    },

    /// Restart (resume) pods
    Restart {
        #[arg(required = true)]
        pod_ids: Vec<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum SortArg {
    Price,
    Memory,
    Available,
    Name,
}

impl From<SortArg> for GpuSortKey {
    fn from(arg: SortArg) -> Self {
        match arg {
            SortArg::Price => Self::Price,
            SortArg::Memory => Self::Memory,
            SortArg::Available => Self::Available,
            SortArg::Name => Self::Name,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum OutcomeArg {
    Succeeded,
    PartialFailure,
    Failed,
    Cancelled,
}

impl From<OutcomeArg> for WorkflowStatus {
    fn from(arg: OutcomeArg) -> Self {
        match arg {
            OutcomeArg::Succeeded => Self::Succeeded,
            OutcomeArg::PartialFailure => Self::PartialFailure,
            OutcomeArg::Failed => Self::Failed,
            OutcomeArg::Cancelled => Self::Cancelled,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "podfleet=info,podfleet_orchestrator=info,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let mut config = EngineConfig::from_env().context("invalid PODFLEET_* configuration")?;
    if let Some(path) = cli.history_path {
        config = config.with_history_path(path);
    }

    let api_key = cli.api_key;
    match cli.command {
        Commands::History {
            search,
            outcome,
            limit,
        } => show_history(&config, search, outcome, limit).await,
        Commands::Pods => show_pods(&connect(api_key, config).await?).await,
        Commands::Gpus { sort } => show_gpus(&connect(api_key, config).await?, sort).await,
        Commands::Templates { public } => {
            show_templates(&connect(api_key, config).await?, public).await
        }
        Commands::Watch => watch(&connect(api_key, config).await?).await,
        Commands::Stop { pod_ids } => {
            bulk(&connect(api_key, config).await?, pod_ids, BulkAction::Stop).await
        }
        Commands::Terminate { pod_ids } => {
            bulk(&connect(api_key, config).await?, pod_ids, BulkAction::Terminate).await
        }
        Commands::Restart { pod_ids } => {
            bulk(&connect(api_key, config).await?, pod_ids, BulkAction::Restart).await
        }
    }
}

async fn connect(api_key: Option<String>, config: EngineConfig) -> anyhow::Result<Engine> {
    let api_key = api_key
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(|| anyhow::anyhow!("RUNPOD_API_KEY (or --api-key) is required"))?;
    let gateway = RunPodGateway::new(api_key).context("failed to build RunPod client")?;
    Engine::new(Arc::new(gateway), config)
        .await
        .context("failed to start engine")
}

async fn show_pods(engine: &Engine) -> anyhow::Result<()> {
    engine
        .force_refresh()
        .await
        .context("failed to fetch pods from RunPod")?;
    let snapshot = engine.snapshot().await;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

async fn show_templates(engine: &Engine, include_public: bool) -> anyhow::Result<()> {
    let templates = engine
        .list_templates(include_public)
        .await
        .context("failed to fetch templates from RunPod")?;
    for template in templates {
        println!(
            "{:<24} {:<32} {:<48} {}",
            template.id,
            template.name,
            template.image,
            if template.is_public { "public" } else { "own" }
        );
    }
    Ok(())
}

async fn show_gpus(engine: &Engine, sort: Option<SortArg>) -> anyhow::Result<()> {
    engine
        .force_refresh()
        .await
        .context("failed to fetch GPU availability from RunPod")?;
    let snapshot = engine.snapshot().await;
    let gpus = match sort {
        Some(key) => snapshot.gpu_availability_sorted(key.into()),
        None => snapshot.gpu_types.clone(),
    };

    println!(
        "{:<28} {:>6} {:>9} {:>10} {:>10}",
        "GPU", "MEM", "AVAIL", "SECURE", "COMMUNITY"
    );
    for gpu in gpus {
        println!(
            "{:<28} {:>4}GB {:>9} {:>10.2} {:>10.2}",
            gpu.display_name,
            gpu.memory_gb,
            format!("{} {:?}", gpu.available_count, gpu.stock_status),
            gpu.secure_price,
            gpu.community_price
        );
    }
    Ok(())
}

fn log_summary(snapshot: &Snapshot) {
    if snapshot.stale {
        warn!(
            error = snapshot.last_error.as_deref().unwrap_or("unknown"),
            "Snapshot is stale"
        );
    }
    info!(
        pods = snapshot.pods.len(),
        running = snapshot.running_count(),
        cost_per_hour = %format!("{:.2}", snapshot.total_cost_per_hour()),
        "Fleet"
    );
}

async fn watch(engine: &Engine) -> anyhow::Result<()> {
    engine.start().await;
    let mut actions = engine.subscribe_actions();
    let mut ticker = tokio::time::interval(engine.config().refresh_interval);
    let mut last_seq = 0;

    info!(provider = engine.provider_name(), "Watching fleet (Ctrl+C to exit)");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let snapshot = engine.snapshot().await;
                if snapshot.sequence != last_seq {
                    last_seq = snapshot.sequence;
                    log_summary(&snapshot);
                }
            }
            event = actions.recv() => {
                if let Ok(event) = event {
                    info!(
                        ticket = %event.ticket.id,
                        kind = %event.ticket.kind,
                        state = ?event.ticket.state,
                        "Action"
                    );
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down");
                break;
            }
        }
    }

    engine.shutdown().await;
    Ok(())
}

async fn bulk(engine: &Engine, pod_ids: Vec<String>, action: BulkAction) -> anyhow::Result<()> {
    engine
        .force_refresh()
        .await
        .context("failed to fetch pods from RunPod")?;

    let ids = pod_ids.into_iter().map(PodId::new).collect();
    let summary = engine
        .submit_bulk_action(ids, action)
        .await
        .with_context(|| format!("bulk {} rejected", action))?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    if !summary.all_succeeded() {
        anyhow::bail!(
            "{} of {} pods failed to {}",
            summary.failed.len(),
            summary.requested,
            action
        );
    }
    Ok(())
}

async fn show_history(
    config: &EngineConfig,
    search: Option<String>,
    outcome: Option<OutcomeArg>,
    limit: usize,
) -> anyhow::Result<()> {
    let path = config
        .history_path
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("no history file configured (set PODFLEET_HISTORY_PATH)"))?;
    let log = HistoryLog::open(path, config.history_max_entries)
        .await
        .with_context(|| format!("failed to open history at {}", path.display()))?;

    let mut filter = HistoryFilter::new().with_limit(limit);
    if let Some(text) = search {
        filter = filter.with_text(text);
    }
    if let Some(outcome) = outcome {
        filter = filter.with_status(outcome.into());
    }

    for run in log.query(&filter).await {
        println!(
            "{}  {:<15} {:<16} ok={} failed={} skipped={}  {}ms",
            run.started_at.format("%Y-%m-%d %H:%M:%S"),
            run.kind.to_string(),
            run.status.to_string(),
            run.succeeded_count(),
            run.failed_count(),
            run.skipped_count(),
            run.duration_ms
        );
    }
    Ok(())
}
