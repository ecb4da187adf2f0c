//! One inventory cycle: observe, diff, persist, record the instant.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use vmsync_collector::Collector;
use vmsync_model::TimestampStatus;
use vmsync_storage::{Diff, InventoryCache, Store};

use crate::gaps::align_down;

#[derive(Debug, Clone)]
pub struct InventoryOptions {
    pub step_secs: i64,
    pub retention_hours: i64,
}

impl Default for InventoryOptions {
    fn default() -> Self {
        Self {
            step_secs: 300,
            retention_hours: 48,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct InventoryReport {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub removed: usize,
}

pub struct InventoryRunner {
    store: Store,
    collector: Arc<dyn Collector>,
    options: InventoryOptions,
}

impl InventoryRunner {
    pub fn new(store: Store, collector: Arc<dyn Collector>, options: InventoryOptions) -> Self {
        Self {
            store,
            collector,
            options,
        }
    }

    pub async fn run_cycle(&self, now: DateTime<Utc>) -> anyhow::Result<InventoryReport> {
        let observation = self.collector.observe_inventory().await?;
        let mut cache = InventoryCache::load(&self.store).await?;
        let mut report = InventoryReport::default();
        let mut observed_keys: HashSet<String> = HashSet::new();

        for infra in observation.infrastructures {
            observed_keys.insert(infra.platform_id.clone());
            match cache.put_infrastructure(infra) {
                Diff::Created => report.created += 1,
                Diff::Updated => report.updated += 1,
                Diff::Unchanged => report.unchanged += 1,
            }
        }
        for observed in observation.machines {
            observed_keys.insert(observed.machine.platform_id.clone());
            match cache.put_machine(observed.machine, observed.incomplete) {
                Diff::Created => report.created += 1,
                Diff::Updated => report.updated += 1,
                Diff::Unchanged => report.unchanged += 1,
            }
        }
        report.removed = cache.sync_missing(&observed_keys).len();
        cache.flush(&self.store).await?;

        // Record the cycle on the metering grid so gap detection and this
        // recording always speak the same instants.
        let at = align_down(now, self.options.step_secs);
        self.store
            .record_timestamp(
                at,
                TimestampStatus::Inventoried,
                Duration::hours(self.options.retention_hours),
            )
            .await?;

        tracing::info!(
            created = report.created,
            updated = report.updated,
            unchanged = report.unchanged,
            removed = report.removed,
            inventory_at = %at,
            "inventory cycle complete"
        );
        Ok(report)
    }
}
