//! Metrics windowing and batching.
//!
//! Each inventoried timestamp is a unit of metering work: sample every live
//! machine over the five minutes ending at that instant and persist one
//! reading per machine. Timestamps are claimed with the cooperative lock so
//! several daemon instances can share a queue, and recent ("current")
//! timestamps are processed separately from old ("backlog") ones so a deep
//! backlog never starves fresh data.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use vmsync_collector::Collector;
use vmsync_model::{Reading, RecordStatus, TimestampStatus};
use vmsync_storage::{InventoriedTimestampRow, Store};

#[derive(Debug, Clone)]
pub struct MeteringOptions {
    /// Machines per collector query.
    pub sample_batch_size: usize,
    /// Sampled interval length; also the inventory cadence.
    pub window_step_secs: i64,
    /// Age at which a timestamp moves from the current to the backlog
    /// window.
    pub current_window_cutoff_secs: i64,
    pub current_timeout_secs: u64,
    pub backlog_timeout_secs: u64,
    pub lock_timeout_secs: i64,
    /// Reading and timestamp row retention.
    pub retention_hours: i64,
    pub worker_id: String,
}

impl Default for MeteringOptions {
    fn default() -> Self {
        Self {
            sample_batch_size: 50,
            window_step_secs: 300,
            current_window_cutoff_secs: 3300,
            current_timeout_secs: 30,
            backlog_timeout_secs: 300,
            lock_timeout_secs: 600,
            retention_hours: 48,
            worker_id: format!("meter-{}", std::process::id()),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MeteringReport {
    pub timestamps_metered: usize,
    pub timestamps_abandoned: usize,
    pub readings_written: usize,
}

pub struct MeteringWorker {
    store: Store,
    collector: Arc<dyn Collector>,
    options: MeteringOptions,
}

impl MeteringWorker {
    pub fn new(store: Store, collector: Arc<dyn Collector>, options: MeteringOptions) -> Self {
        Self {
            store,
            collector,
            options,
        }
    }

    /// Claim and process every eligible timestamp once.
    pub async fn run_cycle(&self) -> anyhow::Result<MeteringReport> {
        let now = Utc::now();

        // Newly inventoried instants enter the metering queue first.
        for row in self
            .store
            .list_timestamps(&[TimestampStatus::Inventoried])
            .await?
        {
            self.store
                .set_timestamp_status(&row.id, TimestampStatus::QueuedForMetering)
                .await?;
        }

        let queued = self
            .store
            .list_timestamps(&[TimestampStatus::QueuedForMetering])
            .await?;
        let cutoff = Duration::seconds(self.options.current_window_cutoff_secs);
        let (current, backlog): (Vec<_>, Vec<_>) = queued
            .into_iter()
            .partition(|row| now - row.inventory_at <= cutoff);

        let current_worker = self.drain(current, self.options.current_timeout_secs, now);
        let backlog_worker = self.drain(backlog, self.options.backlog_timeout_secs, now);
        let (a, b) = tokio::join!(current_worker, backlog_worker);

        let mut report = MeteringReport::default();
        for partial in [a?, b?] {
            report.timestamps_metered += partial.timestamps_metered;
            report.timestamps_abandoned += partial.timestamps_abandoned;
            report.readings_written += partial.readings_written;
        }
        tracing::info!(
            metered = report.timestamps_metered,
            abandoned = report.timestamps_abandoned,
            readings = report.readings_written,
            "metering cycle complete"
        );
        Ok(report)
    }

    async fn drain(
        &self,
        rows: Vec<InventoriedTimestampRow>,
        timeout_secs: u64,
        now: DateTime<Utc>,
    ) -> anyhow::Result<MeteringReport> {
        let mut report = MeteringReport::default();
        let lock_timeout = Duration::seconds(self.options.lock_timeout_secs);
        for row in rows {
            let claimed = self
                .store
                .try_claim_timestamp(&row.id, &self.options.worker_id, now, lock_timeout)
                .await?;
            if !claimed {
                continue;
            }
            self.store
                .set_timestamp_status(&row.id, TimestampStatus::Metering)
                .await?;

            match self.meter_timestamp(&row, timeout_secs).await {
                Ok(written) => {
                    self.store
                        .release_timestamp(&row.id, TimestampStatus::Metered)
                        .await?;
                    report.timestamps_metered += 1;
                    report.readings_written += written;
                }
                Err(e) => {
                    // Abandon this timestamp only; the rest of the queue
                    // still drains and the backfill pass re-drives it.
                    tracing::warn!(
                        timestamp_id = %row.id,
                        inventory_at = %row.inventory_at,
                        error = %e,
                        "metering abandoned for timestamp"
                    );
                    self.store
                        .release_timestamp(&row.id, TimestampStatus::QueuedForMetering)
                        .await?;
                    report.timestamps_abandoned += 1;
                }
            }
        }
        Ok(report)
    }

    /// Sample and persist readings for one timestamp. Machines that already
    /// have a reading at this instant are skipped, which makes a re-driven
    /// timestamp fill exactly the holes.
    async fn meter_timestamp(
        &self,
        row: &InventoriedTimestampRow,
        timeout_secs: u64,
    ) -> anyhow::Result<usize> {
        let window_start = row.inventory_at - Duration::seconds(self.options.window_step_secs);
        let already: HashSet<String> = self
            .store
            .machines_with_reading_at(row.inventory_at)
            .await?
            .into_iter()
            .collect();

        let machines: Vec<_> = self
            .store
            .list_live_machines()
            .await?
            .into_iter()
            .filter(|m| {
                !already.contains(&m.platform_id)
                    && m.record_status != RecordStatus::ToBeDeleted
                    && m.record_status != RecordStatus::Incomplete
            })
            .collect();
        if machines.is_empty() {
            return Ok(0);
        }

        let retention = Duration::hours(self.options.retention_hours);
        let timeout = std::time::Duration::from_secs(timeout_secs);
        let mut written = 0usize;

        for batch in machines.chunks(self.options.sample_batch_size.max(1)) {
            let ids: Vec<String> = batch.iter().map(|m| m.platform_id.clone()).collect();
            let samples = tokio::time::timeout(
                timeout,
                self.collector
                    .sample_metrics(&ids, window_start, row.inventory_at),
            )
            .await
            .map_err(|_| anyhow::anyhow!("collector sampling timed out after {timeout:?}"))??;

            let mut by_machine: HashMap<String, Reading> = samples
                .into_iter()
                .map(|r| (r.machine_platform_id.clone(), r))
                .collect();

            // Every machine gets a reading: sampled when the collector had
            // data, zero-valued otherwise.
            let readings: Vec<Reading> = batch
                .iter()
                .map(|m| {
                    by_machine
                        .remove(&m.platform_id)
                        .unwrap_or_else(|| Reading::zeroed(m, window_start, row.inventory_at))
                })
                .collect();
            written += readings.len();
            self.store.insert_readings(&readings, retention).await?;
        }
        Ok(written)
    }
}
