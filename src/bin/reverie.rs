//! reverie: energy-gated pattern and planning engine
//!
//! Usage:
//!   reverie run --feed observations.jsonl   → replay a feed, snapshot on the way out
//!   reverie run --feed -                    → read observations from stdin
//!   reverie status                          → restore and print engine status
//!   reverie plans                           → open plans and next actions
//!   reverie complete --plan <id> --step 0   → record a completed step
//!   reverie dump-config                     → print effective settings as TOML

use anyhow::Context;
use clap::{Parser, Subcommand};
use reverie::feed;
use reverie::settings::{Settings, SETTINGS_FILE};
use reverie_continuity::ContinuityManager;
use reverie_core::{AgentKey, Health};
use reverie_engine::{EngineHandle, EngineRegistry};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Parser)]
#[command(
    name = "reverie",
    about = "Energy-gated temporal pattern recognition and planning",
    version = env!("CARGO_PKG_VERSION")
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// State directory (settings and snapshots)
    #[arg(long, global = true, default_value = ".reverie")]
    state_dir: PathBuf,

    /// Agent whose engine to operate on
    #[arg(long, global = true, default_value = "default")]
    agent: String,

    /// Settings file (default: <state-dir>/reverie.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Write logs to a file (in addition to stderr)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a JSONL observation feed into the engine
    Run {
        /// Feed file, or `-` for stdin
        #[arg(long)]
        feed: String,
        /// Override the starting balance of a fresh engine
        #[arg(long)]
        initial_energy: Option<f64>,
    },
    /// Print engine status
    Status,
    /// List open plans and the next executable steps
    Plans {
        #[arg(long, default_value_t = 10)]
        max_actions: usize,
    },
    /// Mark a plan step complete
    Complete {
        #[arg(long)]
        plan: Uuid,
        #[arg(long)]
        step: usize,
    },
    /// Print the effective settings
    DumpConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _guard = init_tracing(cli.log_file.as_deref(), cli.json_logs)?;

    let settings = match &cli.config {
        Some(path) => Settings::load(path),
        None => Settings::load(&cli.state_dir.join(SETTINGS_FILE)),
    };
    settings.validate().context("invalid settings")?;
    let agent = AgentKey::new(cli.agent.clone());
    let manager = Arc::new(ContinuityManager::in_dir(&agent_dir(&cli.state_dir, &agent), settings.continuity.clone()));

    match cli.command {
        Commands::Run { feed, initial_energy } => run(&settings, manager, agent, &feed, initial_energy).await,
        Commands::Status => status(&settings, &manager).await,
        Commands::Plans { max_actions } => plans(&settings, &manager, max_actions).await,
        Commands::Complete { plan, step } => complete(&settings, &manager, plan, step).await,
        Commands::DumpConfig => {
            print!("{}", settings.to_toml());
            Ok(())
        }
    }
}

/// Tracing to stderr, optionally mirrored to a file. The guard flushes the
/// file writer and must outlive `main`'s work.
fn init_tracing(log_file: Option<&Path>, json: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "reverie=info,reverie_engine=info,reverie_continuity=info".into());

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
            let name = path.file_name().context("--log-file needs a file name")?;
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry().with(filter).with(file_layer);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
    Ok(guard)
}

fn agent_dir(state_dir: &Path, agent: &AgentKey) -> PathBuf {
    state_dir.join(agent.as_str())
}

/// Restore the agent's engine, or start a fresh one when nothing is stored.
async fn open_engine(settings: &Settings, manager: &ContinuityManager) -> anyhow::Result<EngineHandle> {
    let engine = manager
        .restore(settings.engine.clone())
        .await
        .with_context(|| format!("restoring from {}", manager.location()))?;
    Ok(engine.unwrap_or_else(|| EngineHandle::new(settings.engine.clone())))
}

async fn run(
    settings: &Settings,
    manager: Arc<ContinuityManager>,
    agent: AgentKey,
    feed_path: &str,
    initial_energy: Option<f64>,
) -> anyhow::Result<()> {
    let mut engine_config = settings.engine.clone();
    if let Some(energy) = initial_energy {
        engine_config.ledger.initial_balance = energy;
        engine_config.validate().context("invalid --initial-energy")?;
    }
    let engine = match manager.restore(engine_config.clone()).await? {
        Some(engine) => {
            if initial_energy.is_some() {
                warn!("--initial-energy ignored: engine restored from {}", manager.location());
            }
            engine
        }
        None => EngineHandle::new(engine_config.clone()),
    };

    let reader: Box<dyn AsyncBufRead + Unpin + Send> = if feed_path == "-" {
        Box::new(BufReader::new(tokio::io::stdin()))
    } else {
        let file = tokio::fs::File::open(feed_path)
            .await
            .with_context(|| format!("opening feed {}", feed_path))?;
        Box::new(BufReader::new(file))
    };

    let registry = EngineRegistry::new(engine_config);
    let shared = registry.insert(agent.clone(), engine);
    let cancel = CancellationToken::new();
    let cadence = manager.clone().spawn_cadence(shared.clone(), cancel.clone());
    info!("Agent {} running, snapshots to {}", agent, manager.location());

    let stats = feed::replay(reader, &shared).await;

    // The final snapshot is written even when the replay failed part way.
    cancel.cancel();
    cadence.await.context("snapshot task panicked")?;
    let stats = stats?;

    let status = shared.lock().await.status();
    let continuity = manager.status().await;
    let summary = serde_json::json!({
        "agent": agent.as_str(),
        "feed": stats,
        "engine": status,
        "continuity": continuity,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn status(settings: &Settings, manager: &ContinuityManager) -> anyhow::Result<()> {
    match open_engine(settings, manager).await {
        Ok(engine) => {
            println!("{}", serde_json::to_string_pretty(&engine.status())?);
            Ok(())
        }
        Err(e) => {
            let health = Health::Degraded { reason: format!("{:#}", e) };
            println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "health": health }))?);
            Err(e)
        }
    }
}

async fn plans(settings: &Settings, manager: &ContinuityManager, max_actions: usize) -> anyhow::Result<()> {
    let engine = open_engine(settings, manager).await?;
    let view = serde_json::json!({
        "plans": engine.open_plans(),
        "next_actions": engine.next_actions(max_actions),
    });
    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(())
}

async fn complete(settings: &Settings, manager: &ContinuityManager, plan_id: Uuid, step: usize) -> anyhow::Result<()> {
    let mut engine = open_engine(settings, manager).await?;
    let status = engine
        .mark_step_complete(plan_id, step)
        .with_context(|| format!("completing step {} of plan {}", step, plan_id))?;
    manager.persist(&engine).await?;
    println!("plan {} is now {}", plan_id, status.as_str());
    Ok(())
}
