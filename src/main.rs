//! Evaluation pipeline daemon
//!
//! Wires the pipeline over real backends: a sled durable store, the
//! HTTP orchestrator client, and either the in-process or the Redis
//! coordination store.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use evald::config::PipelineConfig;
use evald::infra::{
    CoordinationStore, HttpOrchestratorClient, MemoryEventBus, MemoryTaskStream, SledDurableStore,
};
use evald::pipeline::EvalPipeline;

#[derive(Parser)]
#[command(name = "evald")]
#[command(about = "Distributed code-evaluation pipeline daemon")]
#[command(version)]
struct Cli {
    /// Orchestrator base URL
    #[arg(long, env = "EVALD_ORCHESTRATOR_URL")]
    orchestrator_url: String,

    /// Durable store path
    #[arg(long, env = "EVALD_SLED_PATH", default_value = "./evald_db")]
    sled_path: PathBuf,

    /// Sandbox URL; repeat once per pool slot
    #[arg(long = "sandbox", required = true)]
    sandboxes: Vec<String>,

    /// Dispatcher worker count
    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// Redis coordination store URL; in-process store when omitted
    #[cfg(feature = "redis-store")]
    #[arg(long, env = "EVALD_REDIS_URL")]
    redis_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env().context("invalid configuration")?;

    let coord = build_coordination_store(&cli).await?;
    let durable = Arc::new(
        SledDurableStore::open(&cli.sled_path).context("failed to open durable store")?,
    );
    let orchestrator = Arc::new(
        HttpOrchestratorClient::new(
            cli.orchestrator_url.clone(),
            Duration::from_secs(config.monitor.watch_reconnect_secs),
        )
        .context("failed to build orchestrator client")?,
    );

    let pipeline = EvalPipeline::start(
        config,
        cli.sandboxes.clone(),
        cli.workers,
        Arc::new(MemoryTaskStream::new()),
        Arc::new(MemoryEventBus::new()),
        coord,
        durable,
        orchestrator,
    )
    .await
    .context("failed to start pipeline")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received");
    pipeline.shutdown().await;
    Ok(())
}

#[cfg(feature = "redis-store")]
async fn build_coordination_store(cli: &Cli) -> anyhow::Result<Arc<dyn CoordinationStore>> {
    use evald::infra::RedisCoordinationStore;
    match &cli.redis_url {
        Some(url) => {
            let store = RedisCoordinationStore::connect(url)
                .await
                .context("failed to connect to redis")?;
            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(evald::infra::MemoryCoordinationStore::new())),
    }
}

#[cfg(not(feature = "redis-store"))]
async fn build_coordination_store(_cli: &Cli) -> anyhow::Result<Arc<dyn CoordinationStore>> {
    Ok(Arc::new(evald::infra::MemoryCoordinationStore::new()))
}
