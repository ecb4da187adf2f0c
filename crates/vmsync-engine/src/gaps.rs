//! Gap detection and backfill.
//!
//! The inventory scheduler should leave one timestamp per five-minute
//! instant. This pass finds the instants that are missing over a rolling
//! window, records placeholder timestamps for them, replays collector
//! lifecycle events that happened inside the holes, re-drives stale metering
//! work and sweeps expired locks and rows.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use vmsync_collector::{Collector, EventKind};
use vmsync_model::{RecordStatus, TimestampStatus};
use vmsync_storage::Store;

#[derive(Debug, Clone)]
pub struct GapOptions {
    /// Rolling detection window; anything older is out of warranty.
    pub window_secs: i64,
    /// Expected timestamp cadence.
    pub step_secs: i64,
    /// Age after which queued or metering timestamps count as stuck.
    pub staleness_secs: i64,
    pub lock_timeout_secs: i64,
    pub retention_hours: i64,
    /// Instant this deployment was registered; no gaps are reported from
    /// before it.
    pub registered_at: DateTime<Utc>,
}

impl Default for GapOptions {
    fn default() -> Self {
        Self {
            window_secs: 84_600, // 23.5 hours
            step_secs: 300,
            staleness_secs: 3_600,
            lock_timeout_secs: 600,
            retention_hours: 48,
            registered_at: Utc::now(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct GapReport {
    pub gaps_recorded: usize,
    pub stuck_requeued: usize,
    pub locks_swept: u64,
    pub rows_expired: u64,
}

pub struct GapDetector {
    store: Store,
    collector: Arc<dyn Collector>,
    options: GapOptions,
}

impl GapDetector {
    pub fn new(store: Store, collector: Arc<dyn Collector>, options: GapOptions) -> Self {
        Self {
            store,
            collector,
            options,
        }
    }

    pub async fn run_cycle(&self, now: DateTime<Utc>) -> anyhow::Result<GapReport> {
        let mut report = GapReport::default();

        report.gaps_recorded = self.detect_missing_inventory(now).await?;
        report.stuck_requeued = self.requeue_stuck_metering(now).await?;
        report.locks_swept = self
            .store
            .sweep_expired_locks(now, Duration::seconds(self.options.lock_timeout_secs))
            .await?;
        report.rows_expired = self.store.cleanup_expired_readings(now).await?
            + self.store.cleanup_expired_timestamps(now).await?;

        tracing::info!(
            gaps = report.gaps_recorded,
            requeued = report.stuck_requeued,
            locks_swept = report.locks_swept,
            expired = report.rows_expired,
            "backfill cycle complete"
        );
        Ok(report)
    }

    /// Expected instants minus present instants, bounded below by both the
    /// rolling window and the registration time.
    async fn detect_missing_inventory(&self, now: DateTime<Utc>) -> anyhow::Result<usize> {
        let step = Duration::seconds(self.options.step_secs);
        let floor = (now - Duration::seconds(self.options.window_secs))
            .max(self.options.registered_at);
        let first = align_up(floor, self.options.step_secs);
        let last = align_down(now, self.options.step_secs);
        if first > last {
            return Ok(0);
        }

        let present: HashSet<DateTime<Utc>> = self
            .store
            .list_timestamps_between(first, last)
            .await?
            .into_iter()
            .map(|row| row.inventory_at)
            .collect();

        let mut gaps = Vec::new();
        let mut at = first;
        while at <= last {
            if !present.contains(&at) {
                gaps.push(at);
            }
            at += step;
        }
        if gaps.is_empty() {
            return Ok(0);
        }

        // Lifecycle events inside the holes explain machines that appeared
        // or vanished while inventory was down; replay them in order so the
        // creations and deletions we would otherwise only learn about from a
        // sweep that never ran still reach the store.
        let earliest = gaps[0] - step;
        match self.collector.events_between(earliest, now).await {
            Ok(events) => {
                let mut synthesized: HashSet<String> = HashSet::new();
                for event in events {
                    match event.kind {
                        EventKind::Created => {
                            if self
                                .store
                                .get_machine(&event.machine_platform_id)
                                .await?
                                .is_some()
                            {
                                continue;
                            }
                            let Some(mut machine) = event.machine else {
                                tracing::warn!(
                                    platform_id = %event.machine_platform_id,
                                    "creation event without machine snapshot, cannot replay"
                                );
                                continue;
                            };
                            machine.remote_id = None;
                            machine.record_status = RecordStatus::Created;
                            self.store
                                .insert_machines(std::slice::from_ref(&machine))
                                .await?;
                            synthesized.insert(machine.platform_id.clone());
                            tracing::info!(
                                platform_id = %event.machine_platform_id,
                                at = %event.occurred_at,
                                "machine creation replayed from event log"
                            );
                        }
                        EventKind::Removed => {
                            // A machine synthesized from this same replay is
                            // left pending-create; the next inventory sweep
                            // finds it absent and retires it through the
                            // ordinary deletion path, after its gap instants
                            // have been metered.
                            if synthesized.contains(&event.machine_platform_id) {
                                continue;
                            }
                            if let Some(machine) =
                                self.store.get_machine(&event.machine_platform_id).await?
                            {
                                if !matches!(
                                    machine.record_status,
                                    RecordStatus::ToBeDeleted
                                        | RecordStatus::VerifiedDelete
                                        | RecordStatus::UnverifiedDelete
                                        | RecordStatus::Deleted
                                ) {
                                    let status = if machine.record_status.remotely_known() {
                                        RecordStatus::ToBeDeleted
                                    } else {
                                        RecordStatus::Deleted
                                    };
                                    self.store
                                        .set_machine_status(&machine.platform_id, status)
                                        .await?;
                                    tracing::info!(
                                        platform_id = %machine.platform_id,
                                        at = %event.occurred_at,
                                        "machine removal replayed from event log"
                                    );
                                }
                            }
                        }
                        EventKind::PoweredOn | EventKind::PoweredOff => {}
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "event replay skipped, collector unavailable");
            }
        }

        let retention = Duration::hours(self.options.retention_hours);
        let count = gaps.len();
        for at in gaps {
            self.store
                .record_timestamp(at, TimestampStatus::QueuedForMetering, retention)
                .await?;
            tracing::debug!(inventory_at = %at, "gap timestamp recorded");
        }
        Ok(count)
    }

    /// Timestamps sitting in `QueuedForMetering`/`Metering` past the
    /// staleness threshold with no live lock go back in the queue. The
    /// metering worker fills only the machines that lack a reading at that
    /// instant, so a partially metered timestamp completes rather than
    /// duplicating.
    async fn requeue_stuck_metering(&self, now: DateTime<Utc>) -> anyhow::Result<usize> {
        let staleness = Duration::seconds(self.options.staleness_secs);
        let rows = self
            .store
            .list_timestamps(&[
                TimestampStatus::QueuedForMetering,
                TimestampStatus::Metering,
            ])
            .await?;
        let mut requeued = 0usize;
        for row in rows {
            if row.locked || now - row.inventory_at < staleness {
                continue;
            }
            if row.status == TimestampStatus::Metering {
                self.store
                    .set_timestamp_status(&row.id, TimestampStatus::QueuedForMetering)
                    .await?;
            }
            requeued += 1;
        }
        Ok(requeued)
    }
}

/// Snap an instant down to the metering grid. Inventory cycles record their
/// timestamp through this so recorded and expected instants always agree.
pub fn align_down(at: DateTime<Utc>, step_secs: i64) -> DateTime<Utc> {
    let secs = at.timestamp() - at.timestamp().rem_euclid(step_secs);
    Utc.timestamp_opt(secs, 0).single().unwrap_or(at)
}

pub fn align_up(at: DateTime<Utc>, step_secs: i64) -> DateTime<Utc> {
    let down = align_down(at, step_secs);
    if down == at {
        down
    } else {
        down + Duration::seconds(step_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_snaps_to_five_minute_grid() {
        let at = Utc.with_ymd_and_hms(2026, 8, 30, 10, 7, 13).unwrap();
        assert_eq!(
            align_down(at, 300),
            Utc.with_ymd_and_hms(2026, 8, 30, 10, 5, 0).unwrap()
        );
        assert_eq!(
            align_up(at, 300),
            Utc.with_ymd_and_hms(2026, 8, 30, 10, 10, 0).unwrap()
        );
        let exact = Utc.with_ymd_and_hms(2026, 8, 30, 10, 5, 0).unwrap();
        assert_eq!(align_up(exact, 300), exact);
    }
}
