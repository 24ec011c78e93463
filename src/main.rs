//! AgentFleet - multi-stage incident response pipeline
//!
//! Runs one stage per process, or the whole fleet in a single process for
//! local development.
//!
//! # Usage
//!
//! ```bash
//! # Run one stage (its port comes from config, overridable with --addr)
//! agentfleet --stage triage
//!
//! # Run all five stages in one process, chained on localhost
//! agentfleet --all-stages
//!
//! # Point a stage at a non-default downstream
//! agentfleet --stage ingest --downstream http://verifier.internal:8002
//! ```
//!
//! # Environment Variables
//!
//! - `FLEET_CONFIG`: Path to a fleet.toml configuration file
//! - `FLEET_MAX_RETRIES`, `FLEET_INITIAL_DELAY_MS`, `FLEET_BACKOFF_MULTIPLIER`,
//!   `FLEET_MAX_DELAY_MS`: Forwarding retry overrides
//! - `RUST_LOG`: Logging level (default: info)

use agentfleet::config::FleetConfig;
use agentfleet::forward::StageForwarder;
use agentfleet::memory::{FeatureHashEmbedder, MemoryBank};
use agentfleet::stage::{self, StageContext, StageKind};
use agentfleet::store::{JobStore, DEFAULT_DB_NAME};
use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "agentfleet")]
#[command(about = "AgentFleet incident response pipeline")]
#[command(version)]
struct CliArgs {
    /// Stage to run: ingest, verifier, summarizer, triage or dispatcher
    #[arg(long, conflicts_with = "all_stages")]
    stage: Option<String>,

    /// Run all five stages in this process, chained on localhost
    #[arg(long)]
    all_stages: bool,

    /// Override the bind address for a single stage (HOST:PORT)
    #[arg(short, long, requires = "stage")]
    addr: Option<String>,

    /// Override the downstream base URL for a single stage
    #[arg(long, requires = "stage")]
    downstream: Option<String>,

    /// Override the data directory for sled databases
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

// ============================================================================
// Stage Startup
// ============================================================================

fn stage_port(config: &FleetConfig, kind: StageKind) -> u16 {
    match kind {
        StageKind::Ingest => config.stages.ingest_port,
        StageKind::Verifier => config.stages.verifier_port,
        StageKind::Summarizer => config.stages.summarizer_port,
        StageKind::Triage => config.stages.triage_port,
        StageKind::Dispatcher => config.stages.dispatcher_port,
    }
}

fn default_downstream(config: &FleetConfig, kind: StageKind) -> Option<String> {
    kind.next().map(|next| {
        format!(
            "http://{}:{}",
            config.stages.host,
            stage_port(config, next)
        )
    })
}

/// Build one stage's shared state: a handle to the fleet-wide job store, a
/// memory bank, and a forwarder tuned from config.
fn build_context(
    kind: StageKind,
    config: &FleetConfig,
    store: JobStore,
    downstream: Option<String>,
) -> Result<Arc<StageContext>> {
    let memory = MemoryBank::new(Arc::new(FeatureHashEmbedder));
    let forwarder = StageForwarder::new(config.forwarding.retry_policy());
    Ok(Arc::new(StageContext::new(
        kind,
        config.clone(),
        store,
        memory,
        forwarder,
        downstream,
    )))
}

/// Bind the stage's listener and spawn its HTTP server into the JoinSet.
async fn spawn_stage(
    task_set: &mut JoinSet<Result<StageKind>>,
    ctx: Arc<StageContext>,
    addr: String,
    cancel_token: CancellationToken,
) -> Result<()> {
    let kind = ctx.kind;
    let downstream = ctx.downstream.clone();
    let app = stage::router(ctx);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {kind} to {addr}"))?;

    info!(
        stage = %kind,
        addr,
        downstream = downstream.as_deref().unwrap_or("(terminal)"),
        "stage listening"
    );

    task_set.spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                cancel_token.cancelled().await;
                info!(stage = %kind, "received shutdown signal");
            })
            .await
            .with_context(|| format!("{kind} server error"))?;
        Ok(kind)
    });
    Ok(())
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = CliArgs::parse();
    let config = FleetConfig::load();
    let data_dir = args.data_dir.clone().unwrap_or_else(|| config.data_dir.clone());

    let kinds: Vec<StageKind> = if args.all_stages {
        StageKind::ALL.to_vec()
    } else if let Some(ref name) = args.stage {
        vec![name.parse().map_err(anyhow::Error::msg)?]
    } else {
        anyhow::bail!("specify --stage <name> or --all-stages");
    };

    info!("AgentFleet incident pipeline starting");

    // One database for the whole fleet. A job created at triage must be
    // visible when the dispatcher updates it, so every stage shares the
    // store rather than opening its own.
    let db_path = data_dir.join(DEFAULT_DB_NAME);
    let store = JobStore::open(&db_path)
        .with_context(|| format!("opening job store at {}", db_path.display()))?;

    // Graceful shutdown via Ctrl+C
    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received Ctrl+C, initiating shutdown");
        shutdown_token.cancel();
    });

    let mut task_set: JoinSet<Result<StageKind>> = JoinSet::new();
    for kind in kinds {
        let addr = match args.addr {
            Some(ref addr) => addr.clone(),
            None => format!("{}:{}", config.stages.host, stage_port(&config, kind)),
        };
        let downstream = match args.downstream {
            Some(ref url) => Some(url.clone()),
            None => default_downstream(&config, kind),
        };
        let ctx = build_context(kind, &config, store.clone(), downstream)?;
        spawn_stage(&mut task_set, ctx, addr, cancel_token.clone()).await?;
    }

    // Supervisor: any stage exiting with an error takes the fleet down.
    while let Some(joined) = task_set.join_next().await {
        match joined {
            Ok(Ok(kind)) => info!(stage = %kind, "stage exited cleanly"),
            Ok(Err(e)) => {
                error!(error = %e, "stage failed, shutting down fleet");
                cancel_token.cancel();
            }
            Err(e) => {
                error!(error = %e, "stage task panicked, shutting down fleet");
                cancel_token.cancel();
            }
        }
    }

    info!("AgentFleet shutdown complete");
    Ok(())
}
