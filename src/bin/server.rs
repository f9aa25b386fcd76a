// apkscope engine server
// Run with: cargo run --bin server

//! # apkscope Server Binary
//!
//! Wires the whole engine together and runs it until interrupted:
//!
//! 1. Connect the message bus (in-memory or NATS)
//! 2. Load module configurations and start the worker containers
//! 3. Relink chain definitions and sweep for stranded executions
//! 4. Spawn the result reconciler and the chain event dispatch loop
//!
//! Everything is wired explicitly in `main`; the components share state
//! only through the `Arc`s handed to them here.

use clap::{Parser, ValueEnum};
use dotenv::dotenv;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use apkscope::{
    ChainOrchestrator, DockerRuntime, InMemoryBus, InMemoryExecutionStore, MessageBus,
    ModuleRegistry, NatsBus, NatsBusConfig, ResultReconciler,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BusBackend {
    /// Single-process in-memory bus, for development
    Memory,
    /// NATS JetStream, for deployments with worker containers
    Nats,
}

#[derive(Debug, Parser)]
#[command(name = "apkscope-server", about = "apkscope analysis engine")]
struct ServerArgs {
    /// Message bus backend
    #[arg(long, env = "BUS_BACKEND", value_enum, default_value_t = BusBackend::Nats)]
    bus: BusBackend,

    /// NATS server URL
    #[arg(long, env = "NATS_URL", default_value = "nats://localhost:4222")]
    nats_url: String,

    /// Directory holding one subdirectory (with module.json) per module
    #[arg(long, env = "MODULES_DIR", default_value = "./modules")]
    modules_dir: String,

    /// Docker network shared by the engine, bus and worker containers
    #[arg(long, env = "DOCKER_NETWORK", default_value = "apkscope")]
    docker_network: String,

    /// Shared upload storage mount, host_path:container_path
    #[arg(long, env = "SHARED_VOLUME")]
    shared_volume: Option<String>,

    /// Result reconciler poll interval in seconds
    #[arg(long, env = "RESULT_POLL_INTERVAL_SECS", default_value_t = 2)]
    poll_interval_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenv() {
        eprintln!("Warning: could not load .env file: {}", e);
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = ServerArgs::parse();

    info!("🚀 Starting apkscope engine server");
    info!("==================================");
    info!(bus = ?args.bus, modules_dir = %args.modules_dir,
          network = %args.docker_network, "configuration loaded");

    let bus: Arc<dyn MessageBus> = match args.bus {
        BusBackend::Memory => {
            warn!("in-memory bus selected: worker containers cannot reach it");
            Arc::new(InMemoryBus::new())
        }
        BusBackend::Nats => {
            let config = NatsBusConfig {
                nats_urls: vec![args.nats_url.clone()],
                ..Default::default()
            };
            info!(url = %args.nats_url, "connecting to NATS");
            Arc::new(NatsBus::new(config).await?)
        }
    };

    let store = Arc::new(InMemoryExecutionStore::new());

    let mut runtime = DockerRuntime::new(&args.modules_dir, args.docker_network.clone());
    if let Some(mount) = &args.shared_volume {
        runtime = runtime.with_shared_volume(mount.clone());
    }
    let runtime = Arc::new(runtime);

    let registry = Arc::new(ModuleRegistry::new(
        bus.clone(),
        store.clone(),
        runtime,
        &args.modules_dir,
    ));

    let loaded = registry.load_configurations().await?;
    info!(loaded, "module configurations loaded");
    let started = registry.start_all().await;
    info!(started, "module workers running");

    let orchestrator = Arc::new(ChainOrchestrator::new(
        bus.clone(),
        store.clone(),
        registry.clone(),
    ));
    orchestrator.relink_definitions().await?;
    let stranded = orchestrator.sweep_stranded_executions().await?;
    if stranded > 0 {
        warn!(stranded, "found stranded chain executions");
    }

    let reconciler = Arc::new(
        ResultReconciler::new(bus.clone(), store.clone())
            .with_poll_interval(Duration::from_secs(args.poll_interval_secs)),
    );
    let reconciler_handle = reconciler.spawn();
    let dispatch_handle = orchestrator.clone().spawn();

    info!("engine running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;

    info!("shutting down");
    reconciler_handle.abort();
    dispatch_handle.abort();
    Ok(())
}
