//! Gatekeeper server.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client Request
//!     ──────────────▶ http server ──▶ admission ──────────────▶ protected handler
//!                     (request id,    rate limit (IP, credential)      │
//!                      trace,         quota throttle (reject/delay)    ▼
//!                      timeout)                               ExecutionCoordinator
//!                                                             breaker per resource
//!
//!     Background: usage syncer (counters → quota file), counter and config cache purge
//!     Admin API:  quotas, usage report, breakers (bearer key)
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;

use gatekeeper::admin::setup_admin_router;
use gatekeeper::config::{load_config, GatekeeperConfig};
use gatekeeper::http::{AppState, HttpServer};
use gatekeeper::lifecycle::{join_logged, wait_for_signal, Shutdown};
use gatekeeper::observability::{logging, metrics};
use gatekeeper::quota::{JsonFileRepository, QuotaRepository, UsageSyncer};
use gatekeeper::store::MemoryCounterStore;

const PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "gatekeeper", version, about = "Rate limiting, quota throttling and circuit breaking")]
struct Args {
    /// Path to the TOML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => GatekeeperConfig::default(),
    };

    logging::init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "gatekeeper starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        rate_limit_enabled = config.rate_limit.enabled,
        throttle_enabled = config.throttle.enabled,
        admin_enabled = config.admin.enabled,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let counters = Arc::new(MemoryCounterStore::new());
    let repository: Arc<dyn QuotaRepository> = match &config.throttle.persistence_path {
        Some(path) => Arc::new(JsonFileRepository::open(path)?),
        None => Arc::new(JsonFileRepository::in_memory()),
    };
    let sync_interval = Duration::from_secs(config.throttle.usage_sync_interval_secs);
    let shutdown_timeout = Duration::from_secs(
        config.fault_tolerance.execution.shutdown_timeout_secs,
    );
    let admin_enabled = config.admin.enabled;
    let admin_address = config.admin.bind_address.clone();
    let bind_address = config.listener.bind_address.clone();

    let state = AppState::with_backends(config, counters.clone(), repository);
    let shutdown = Shutdown::new();

    let syncer = UsageSyncer::new(state.throttle.clone(), sync_interval);
    let syncer_task = tokio::spawn(syncer.run(shutdown.subscribe()));

    let mut purge_shutdown = shutdown.subscribe();
    let quota_configs = state.throttle.configs().clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PURGE_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let purged = counters.purge_expired();
                    let evicted = quota_configs.purge_expired();
                    if purged > 0 || evicted > 0 {
                        tracing::debug!(
                            purged,
                            evicted,
                            "Expired counters and cached quota configs purged"
                        );
                    }
                }
                _ = purge_shutdown.recv() => break,
            }
        }
    });

    let admin_task = if admin_enabled {
        let listener = TcpListener::bind(&admin_address).await?;
        tracing::info!(address = %listener.local_addr()?, "Admin API listening");
        let router = setup_admin_router(state.clone());
        let signal = shutdown.signalled();
        Some(tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(signal)
                .await
        }))
    } else {
        None
    };

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        signal_shutdown.trigger();
    });

    let listener = TcpListener::bind(&bind_address).await?;
    let coordinator = state.coordinator.clone();
    HttpServer::new(state).run(listener, shutdown.clone()).await?;

    if let Some(task) = admin_task {
        if let Some(Err(e)) = join_logged("admin", task).await {
            tracing::error!(error = %e, "Admin API stopped with an error");
        }
    }
    if !coordinator.shutdown(shutdown_timeout).await {
        tracing::warn!("In-flight executions did not finish before the shutdown deadline");
    }
    join_logged("usage_syncer", syncer_task).await;

    tracing::info!("Shutdown complete");
    Ok(())
}
