//! Tick loops around the engine drivers. Each loop logs and swallows cycle
//! errors so one bad tick never takes the scheduler down, and takes a fresh
//! config snapshot per tick so a reload applies without a restart.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::time::{interval, Duration, MissedTickBehavior};
use vmsync_collector::Collector;
use vmsync_engine::{GapDetector, InventoryRunner, MeteringWorker, Synchronizer};
use vmsync_remote::MeterBackend;
use vmsync_storage::Store;

use crate::config::ConfigHandle;

pub async fn run_inventory(
    store: Store,
    collector: Arc<dyn Collector>,
    config: Arc<ConfigHandle>,
) {
    let tick_secs = config.current().inventory.tick_secs;
    tracing::info!(tick_secs, "inventory scheduler started");
    let mut tick = ticker(tick_secs);
    loop {
        tick.tick().await;
        let options = config.current().inventory.options();
        let runner = InventoryRunner::new(store.clone(), collector.clone(), options);
        if let Err(e) = runner.run_cycle(Utc::now()).await {
            tracing::error!(error = %e, "inventory cycle failed");
        }
    }
}

pub async fn run_sync(store: Store, backend: Arc<dyn MeterBackend>, config: Arc<ConfigHandle>) {
    let tick_secs = config.current().sync.tick_secs;
    tracing::info!(tick_secs, "synchronization scheduler started");
    let mut tick = ticker(tick_secs);
    loop {
        tick.tick().await;
        let options = config.current().sync.options();
        let synchronizer = Synchronizer::new(store.clone(), backend.clone(), options);
        match synchronizer.run().await {
            Ok(report) => {
                if report.creates + report.updates + report.deletes + report.readings_submitted
                    > 0
                {
                    tracing::info!(
                        creates = report.creates,
                        updates = report.updates,
                        deletes = report.deletes,
                        readings = report.readings_submitted,
                        "synchronization pass complete"
                    );
                }
            }
            Err(e) => tracing::error!(error = %e, "synchronization pass failed"),
        }
    }
}

pub async fn run_metering(
    store: Store,
    collector: Arc<dyn Collector>,
    config: Arc<ConfigHandle>,
) {
    let tick_secs = config.current().metering.tick_secs;
    tracing::info!(tick_secs, "metering scheduler started");
    let mut tick = ticker(tick_secs);
    loop {
        tick.tick().await;
        let options = config.current().metering.options();
        let worker = MeteringWorker::new(store.clone(), collector.clone(), options);
        if let Err(e) = worker.run_cycle().await {
            tracing::error!(error = %e, "metering cycle failed");
        }
    }
}

pub async fn run_backfill(
    store: Store,
    collector: Arc<dyn Collector>,
    config: Arc<ConfigHandle>,
    registered_at: DateTime<Utc>,
) {
    let tick_secs = config.current().backfill.tick_secs;
    tracing::info!(tick_secs, "backfill scheduler started");
    let mut tick = ticker(tick_secs);
    loop {
        tick.tick().await;
        let options = config.current().backfill.options(registered_at);
        let detector = GapDetector::new(store.clone(), collector.clone(), options);
        if let Err(e) = detector.run_cycle(Utc::now()).await {
            tracing::error!(error = %e, "backfill cycle failed");
        }
    }
}

/// Slow passes (rate-limit sleeps, backlog drains) can outlast the period;
/// skipping the queued-up ticks keeps them from firing back to back.
fn ticker(tick_secs: u64) -> tokio::time::Interval {
    let mut tick = interval(Duration::from_secs(tick_secs));
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tick
}
