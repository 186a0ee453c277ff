//! absorbd - capability absorption governance daemon
//!
//! Loads a [`GovernanceConfig`], wires the lifecycle engine to an outcome
//! ledger, the static policy gate, the digest verifier and the cross-cluster
//! aggregator, then drives the control loop until Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;

use absorb_core::{
    init_tracing, ControlLoop, DigestIntegrityVerifier, FederatedAggregator, GovernanceConfig,
    JsonlOutcomeLedger, LifecycleEngine, MemoryOutcomeLedger, OutcomeLedger, ReplicatedStore,
    RouterWeightAdapter, StaticPolicyGate,
};
use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, Level};

#[derive(Parser, Debug)]
#[command(name = "absorbd")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Capability absorption governance daemon", long_about = None)]
struct Cli {
    /// Path to a TOML governance config (defaults apply when omitted)
    #[arg(short, long, env = "ABSORB_CONFIG")]
    config: Option<PathBuf>,

    /// Directory for the JSONL outcome ledger (in-memory when omitted)
    #[arg(long, env = "ABSORB_LEDGER_DIR")]
    ledger_dir: Option<PathBuf>,

    /// Replica id for federation, overriding the config
    #[arg(long, env = "ABSORB_REPLICA_ID")]
    replica_id: Option<String>,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Run a single control cycle, print its report and exit
    #[arg(long)]
    once: bool,
}

fn load_config(cli: &Cli) -> Result<GovernanceConfig> {
    let mut config = match &cli.config {
        Some(path) => GovernanceConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => GovernanceConfig::default(),
    };
    if let Some(replica) = &cli.replica_id {
        config.federation.replica_id = replica.clone();
    }
    if cli.json {
        config.telemetry.json = true;
    }
    config.validate().context("invalid governance config")?;
    Ok(config)
}

async fn build_engine(cli: &Cli, config: GovernanceConfig) -> Result<Arc<LifecycleEngine>> {
    let ledger: Arc<dyn OutcomeLedger> = match &cli.ledger_dir {
        Some(dir) => Arc::new(
            JsonlOutcomeLedger::open(dir)
                .await
                .with_context(|| format!("failed to open ledger at {}", dir.display()))?,
        ),
        None => Arc::new(MemoryOutcomeLedger::new()),
    };
    let store = Arc::new(ReplicatedStore::new(config.federation.replica_id.clone()));
    let router = Arc::new(RouterWeightAdapter::new(config.router.clone()));
    let aggregator = Arc::new(FederatedAggregator::from_config(&config.federation));

    let engine = LifecycleEngine::builder(
        config,
        ledger,
        Arc::new(StaticPolicyGate::standard()),
        Arc::new(DigestIntegrityVerifier::accept_signed()),
    )
    .with_router(router)
    .with_federation(store)
    .with_aggregator(aggregator)
    .build()?;
    Ok(Arc::new(engine))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        config.telemetry.level()
    };
    init_tracing(config.telemetry.format(), level);

    info!(
        replica_id = %config.federation.replica_id,
        interval_secs = config.control_loop.interval_secs,
        max_concurrency = config.control_loop.max_concurrency,
        "absorbd starting"
    );

    let engine = build_engine(&cli, config).await?;
    let control = ControlLoop::new(engine);

    if cli.once {
        let report = control.run_cycle().await;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl-C");
        }
        let _ = shutdown_tx.send(true);
    });

    control.run(shutdown_rx).await;
    info!("absorbd stopped");
    Ok(())
}
