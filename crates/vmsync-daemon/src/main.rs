use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tokio::signal;
use tracing_subscriber::EnvFilter;
use vmsync_collector::{Collector, HttpCollector};
use vmsync_remote::{ApiBackend, Credentials, LegacyBackend, MeterBackend, RemoteClient};
use vmsync_storage::Store;

mod config;
mod scheduler;

use config::{ConfigHandle, RemoteGeneration};

#[allow(clippy::print_stderr)]
fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  vmsync-daemon [config.toml]    Start the synchronization daemon");
}

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|e| anyhow::anyhow!("Failed to install default CryptoProvider: {e:?}"))?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("vmsync=info".parse()?))
        .init();

    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(|s| s.as_str()) {
        Some("--help" | "-h") => {
            print_usage();
            Ok(())
        }
        path => run_daemon(path.unwrap_or("config/vmsync.toml")).await,
    }
}

async fn run_daemon(config_path: &str) -> Result<()> {
    let config_handle = Arc::new(ConfigHandle::load(config_path)?);
    let config = config_handle.current();
    vmsync_common::id::init(config.machine_id, config.node_id);

    let store = Store::connect(&config.database_url).await?;
    tracing::info!(database = %config.database_url, "store connected");

    let collector: Arc<dyn Collector> = Arc::new(HttpCollector::new(
        &config.collector.name,
        &config.collector.endpoint,
        config.collector.timeout_secs,
    )?);

    let client = RemoteClient::new(
        &config.remote.endpoint,
        Credentials {
            client_id: config.remote.client_id.clone(),
            client_secret: config.remote.client_secret.clone(),
        },
        config.remote.timeout_secs,
    )?;
    let backend: Arc<dyn MeterBackend> = match config.remote.generation {
        RemoteGeneration::ApiV2 => Arc::new(ApiBackend::new(client)),
        RemoteGeneration::Legacy => Arc::new(LegacyBackend::new(client)),
    };
    tracing::info!(
        endpoint = %config.remote.endpoint,
        generation = ?config.remote.generation,
        "metering backend ready"
    );

    let registered_at = match config.registered_at {
        Some(at) => at,
        None => {
            let now = Utc::now();
            tracing::warn!(
                registered_at = %now,
                "registered_at not configured, backfill window starts now"
            );
            now
        }
    };

    // SIGHUP re-reads the config file; schedulers pick the new knobs up on
    // their next tick.
    #[cfg(unix)]
    {
        let reload_handle = config_handle.clone();
        tokio::spawn(async move {
            let mut hup =
                match signal::unix::signal(signal::unix::SignalKind::hangup()) {
                    Ok(stream) => stream,
                    Err(e) => {
                        tracing::error!(error = %e, "SIGHUP handler unavailable");
                        return;
                    }
                };
            while hup.recv().await.is_some() {
                match reload_handle.reload() {
                    Ok(()) => tracing::info!("configuration reloaded"),
                    Err(e) => tracing::error!(error = %e, "configuration reload failed"),
                }
            }
        });
    }

    let inventory_handle = if config.inventory.enabled {
        Some(tokio::spawn(scheduler::run_inventory(
            store.clone(),
            collector.clone(),
            config_handle.clone(),
        )))
    } else {
        tracing::info!("inventory scheduler disabled");
        None
    };

    let sync_handle = if config.sync.enabled {
        Some(tokio::spawn(scheduler::run_sync(
            store.clone(),
            backend.clone(),
            config_handle.clone(),
        )))
    } else {
        tracing::info!("synchronization scheduler disabled");
        None
    };

    let metering_handle = if config.metering.enabled {
        Some(tokio::spawn(scheduler::run_metering(
            store.clone(),
            collector.clone(),
            config_handle.clone(),
        )))
    } else {
        tracing::info!("metering scheduler disabled");
        None
    };

    let backfill_handle = if config.backfill.enabled {
        Some(tokio::spawn(scheduler::run_backfill(
            store.clone(),
            collector.clone(),
            config_handle.clone(),
            registered_at,
        )))
    } else {
        tracing::info!("backfill scheduler disabled");
        None
    };

    tracing::info!("daemon started");
    signal::ctrl_c().await?;
    tracing::info!("shutting down gracefully");

    for handle in [
        inventory_handle,
        sync_handle,
        metering_handle,
        backfill_handle,
    ]
    .into_iter()
    .flatten()
    {
        handle.abort();
    }
    Ok(())
}
