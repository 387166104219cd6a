//! fleetd — the FleetGrid daemon.
//!
//! Single binary that assembles all FleetGrid subsystems:
//! - Backing store (redb): port registry + entity mirror
//! - Cluster API (in-process)
//! - Collection controller (scale up / soft-unlink)
//! - Instance controller (status sync events)
//! - Drain sweep
//! - REST API
//!
//! # Usage
//!
//! ```text
//! fleetd run --port 8000 --data-dir /var/lib/fleetgrid
//! fleetd run --config /etc/fleetgrid/fleetd.toml --log-format json
//! ```

mod config;

use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use fleetgrid_api::{ApiState, build_router};
use fleetgrid_cluster::{ClusterClient, Collection, InMemoryCluster, Instance, Recorder};
use fleetgrid_controller::{
    CollectionEventHandler, CollectionReconciler, Controller, Informer, InstanceEventHandler,
    InstanceReconciler, Sweeper, WorkQueue, collection, instance,
};
use fleetgrid_state::StateStore;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::{FleetConfig, LogFormat, RunArgs};

const DEFAULT_LOG_FILTER: &str = "info,fleetd=debug,fleetgrid=debug";

#[derive(Parser)]
#[command(name = "fleetd", about = "FleetGrid daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the controllers, drain sweep and API in one process.
    Run(RunArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run(args) => {
            init_tracing(args.log_format);
            let config = FleetConfig::resolve(&args)?;
            run(config).await
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

async fn run(config: FleetConfig) -> anyhow::Result<()> {
    info!("FleetGrid daemon starting");

    // Ensure data directory exists.
    std::fs::create_dir_all(&config.data_dir)?;
    let db_path = config.db_path();

    // ── Initialize subsystems ──────────────────────────────────

    // Backing store.
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    // Cluster API.
    let cluster = Arc::new(InMemoryCluster::new());
    let client: Arc<dyn ClusterClient> = cluster.clone();

    let port_range = config.port_range()?;
    let limiter = config.rate_limiter();
    info!(
        start = port_range.start(),
        end = port_range.end(),
        base_delay = ?limiter.base_delay,
        max_delay = ?limiter.max_delay,
        "allocation and backoff configured"
    );

    // Collection controller.
    let collection_queue = WorkQueue::new(collection::COMPONENT, limiter.build());
    let collection_controller = Controller::new(
        collection_queue.clone(),
        Arc::new(CollectionReconciler::new(
            client.clone(),
            store.clone(),
            port_range,
            Arc::new(Recorder::new(collection::COMPONENT, cluster.clone())),
        )),
    );
    let collection_informer = Informer::<Collection, dyn ClusterClient>::new(
        client.clone(),
        Arc::new(CollectionEventHandler::new(collection_queue)),
    );
    info!(workers = config.workers.collection, "collection controller initialized");

    // Instance controller.
    let instance_queue = WorkQueue::new(instance::COMPONENT, limiter.build());
    let instance_controller = Controller::new(
        instance_queue.clone(),
        Arc::new(InstanceReconciler::new(
            client.clone(),
            Arc::new(Recorder::new(instance::COMPONENT, cluster.clone())),
        )),
    );
    let instance_informer = Informer::<Instance, dyn ClusterClient>::new(
        client.clone(),
        Arc::new(InstanceEventHandler::new(instance_queue)),
    );
    info!(workers = config.workers.instance, "instance controller initialized");

    // Drain sweep. The cluster lives only as long as this process, so
    // whatever the store still holds from a previous run is reclaimed first.
    let sweeper = Sweeper::new(client.clone(), store.clone());
    let pruned = sweeper.reclaim_orphans().await?;
    info!(
        interval = config.sweep_interval_secs,
        rows = pruned.rows,
        ports = pruned.ports,
        "drain sweep initialized"
    );

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let mut handles = Vec::new();

    let rx = shutdown_rx.clone();
    handles.push(tokio::spawn(async move {
        collection_informer.run(rx).await;
    }));

    let rx = shutdown_rx.clone();
    let workers = config.workers.collection;
    handles.push(tokio::spawn(async move {
        collection_controller.run(workers, rx).await;
    }));

    let rx = shutdown_rx.clone();
    handles.push(tokio::spawn(async move {
        instance_informer.run(rx).await;
    }));

    let rx = shutdown_rx.clone();
    let workers = config.workers.instance;
    handles.push(tokio::spawn(async move {
        instance_controller.run(workers, rx).await;
    }));

    let rx = shutdown_rx;
    let interval = config.sweep_interval();
    handles.push(tokio::spawn(async move {
        sweeper.run(interval, rx).await;
    }));

    // ── Start API server ───────────────────────────────────────

    let router = build_router(ApiState {
        cluster: client,
        store,
        defaults: config.collection_defaults(),
    });
    let addr = SocketAddr::from(([0, 0, 0, 0], config.api_port));

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C handler");
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    // Wait for background tasks.
    for handle in handles {
        let _ = handle.await;
    }

    info!("FleetGrid daemon stopped");
    Ok(())
}
