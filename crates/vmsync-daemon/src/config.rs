use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vmsync_engine::{GapOptions, InventoryOptions, MeteringOptions, SyncOptions};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_database_url")]
    pub database_url: String,
    /// Snowflake generator coordinates; give every deployment a distinct pair.
    #[serde(default = "default_machine_id")]
    pub machine_id: i32,
    #[serde(default = "default_node_id")]
    pub node_id: i32,
    /// Instant this deployment was registered with the metering service.
    /// Backfill never looks further back than this; defaults to first boot.
    #[serde(default)]
    pub registered_at: Option<DateTime<Utc>>,

    pub collector: CollectorConfig,
    pub remote: RemoteConfig,
    #[serde(default)]
    pub inventory: InventoryConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub metering: MeteringConfig,
    #[serde(default)]
    pub backfill: BackfillConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    #[serde(default = "default_collector_name")]
    pub name: String,
    pub endpoint: String,
    #[serde(default = "default_collector_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RemoteGeneration {
    ApiV2,
    Legacy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub endpoint: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_remote_generation")]
    pub generation: RemoteGeneration,
    #[serde(default = "default_remote_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_inventory_tick_secs")]
    pub tick_secs: u64,
    #[serde(default = "default_step_secs")]
    pub step_secs: i64,
    #[serde(default = "default_retention_hours")]
    pub retention_hours: i64,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            tick_secs: default_inventory_tick_secs(),
            step_secs: default_step_secs(),
            retention_hours: default_retention_hours(),
        }
    }
}

impl InventoryConfig {
    pub fn options(&self) -> InventoryOptions {
        InventoryOptions {
            step_secs: self.step_secs,
            retention_hours: self.retention_hours,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_sync_tick_secs")]
    pub tick_secs: u64,
    #[serde(default = "default_reading_batch_limit")]
    pub reading_batch_limit: usize,
    #[serde(default = "default_reading_workers")]
    pub reading_workers: usize,
    #[serde(default = "default_reading_queue_bound")]
    pub reading_queue_bound: usize,
    #[serde(default = "default_rate_limit_fallback_secs")]
    pub rate_limit_fallback_secs: u64,
    #[serde(default = "default_not_found_pause_secs")]
    pub not_found_pause_secs: u64,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            tick_secs: default_sync_tick_secs(),
            reading_batch_limit: default_reading_batch_limit(),
            reading_workers: default_reading_workers(),
            reading_queue_bound: default_reading_queue_bound(),
            rate_limit_fallback_secs: default_rate_limit_fallback_secs(),
            not_found_pause_secs: default_not_found_pause_secs(),
            max_restarts: default_max_restarts(),
        }
    }
}

impl SyncConfig {
    pub fn options(&self) -> SyncOptions {
        SyncOptions {
            reading_batch_limit: self.reading_batch_limit,
            reading_workers: self.reading_workers,
            reading_queue_bound: self.reading_queue_bound,
            rate_limit_fallback_secs: self.rate_limit_fallback_secs,
            not_found_pause_secs: self.not_found_pause_secs,
            max_restarts: self.max_restarts,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeteringConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metering_tick_secs")]
    pub tick_secs: u64,
    #[serde(default = "default_sample_batch_size")]
    pub sample_batch_size: usize,
    #[serde(default = "default_step_secs")]
    pub window_step_secs: i64,
    #[serde(default = "default_current_window_cutoff_secs")]
    pub current_window_cutoff_secs: i64,
    #[serde(default = "default_current_timeout_secs")]
    pub current_timeout_secs: u64,
    #[serde(default = "default_backlog_timeout_secs")]
    pub backlog_timeout_secs: u64,
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: i64,
    #[serde(default = "default_retention_hours")]
    pub retention_hours: i64,
    /// Lock owner label; defaults to a per-process id.
    #[serde(default)]
    pub worker_id: Option<String>,
}

impl Default for MeteringConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            tick_secs: default_metering_tick_secs(),
            sample_batch_size: default_sample_batch_size(),
            window_step_secs: default_step_secs(),
            current_window_cutoff_secs: default_current_window_cutoff_secs(),
            current_timeout_secs: default_current_timeout_secs(),
            backlog_timeout_secs: default_backlog_timeout_secs(),
            lock_timeout_secs: default_lock_timeout_secs(),
            retention_hours: default_retention_hours(),
            worker_id: None,
        }
    }
}

impl MeteringConfig {
    pub fn options(&self) -> MeteringOptions {
        let defaults = MeteringOptions::default();
        MeteringOptions {
            sample_batch_size: self.sample_batch_size,
            window_step_secs: self.window_step_secs,
            current_window_cutoff_secs: self.current_window_cutoff_secs,
            current_timeout_secs: self.current_timeout_secs,
            backlog_timeout_secs: self.backlog_timeout_secs,
            lock_timeout_secs: self.lock_timeout_secs,
            retention_hours: self.retention_hours,
            worker_id: self.worker_id.clone().unwrap_or(defaults.worker_id),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_backfill_tick_secs")]
    pub tick_secs: u64,
    #[serde(default = "default_backfill_window_secs")]
    pub window_secs: i64,
    #[serde(default = "default_step_secs")]
    pub step_secs: i64,
    #[serde(default = "default_staleness_secs")]
    pub staleness_secs: i64,
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: i64,
    #[serde(default = "default_retention_hours")]
    pub retention_hours: i64,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            tick_secs: default_backfill_tick_secs(),
            window_secs: default_backfill_window_secs(),
            step_secs: default_step_secs(),
            staleness_secs: default_staleness_secs(),
            lock_timeout_secs: default_lock_timeout_secs(),
            retention_hours: default_retention_hours(),
        }
    }
}

impl BackfillConfig {
    pub fn options(&self, registered_at: DateTime<Utc>) -> GapOptions {
        GapOptions {
            window_secs: self.window_secs,
            step_secs: self.step_secs,
            staleness_secs: self.staleness_secs,
            lock_timeout_secs: self.lock_timeout_secs,
            retention_hours: self.retention_hours,
            registered_at,
        }
    }
}

fn default_database_url() -> String {
    "sqlite://data/vmsync.db?mode=rwc".to_string()
}

fn default_machine_id() -> i32 {
    1
}

fn default_node_id() -> i32 {
    1
}

fn default_collector_name() -> String {
    "platform".to_string()
}

fn default_collector_timeout_secs() -> u64 {
    30
}

fn default_remote_generation() -> RemoteGeneration {
    RemoteGeneration::ApiV2
}

fn default_remote_timeout_secs() -> u64 {
    30
}

fn default_enabled() -> bool {
    true
}

fn default_inventory_tick_secs() -> u64 {
    300
}

fn default_sync_tick_secs() -> u64 {
    60
}

fn default_metering_tick_secs() -> u64 {
    60
}

fn default_backfill_tick_secs() -> u64 {
    900
}

fn default_step_secs() -> i64 {
    300
}

fn default_retention_hours() -> i64 {
    48
}

fn default_reading_batch_limit() -> usize {
    500
}

fn default_reading_workers() -> usize {
    4
}

fn default_reading_queue_bound() -> usize {
    16
}

fn default_rate_limit_fallback_secs() -> u64 {
    60
}

fn default_not_found_pause_secs() -> u64 {
    5
}

fn default_max_restarts() -> u32 {
    3
}

fn default_sample_batch_size() -> usize {
    50
}

fn default_current_window_cutoff_secs() -> i64 {
    3300 // 55 minutes; anything older goes through the backlog drain
}

fn default_current_timeout_secs() -> u64 {
    30
}

fn default_backlog_timeout_secs() -> u64 {
    300
}

fn default_lock_timeout_secs() -> i64 {
    600
}

fn default_staleness_secs() -> i64 {
    3600
}

fn default_backfill_window_secs() -> i64 {
    84_600
}

impl DaemonConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }
}

/// Shared view of the config file. Schedulers take a fresh snapshot each
/// tick, so a `reload()` changes batch sizes, timeouts and windows without a
/// restart. Endpoints, credentials and tick periods are read once at
/// startup.
pub struct ConfigHandle {
    path: String,
    inner: RwLock<Arc<DaemonConfig>>,
}

impl ConfigHandle {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let config = DaemonConfig::load(path)?;
        Ok(Self {
            path: path.to_string(),
            inner: RwLock::new(Arc::new(config)),
        })
    }

    pub fn current(&self) -> Arc<DaemonConfig> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn reload(&self) -> anyhow::Result<()> {
        let config = DaemonConfig::load(&self.path)?;
        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(config);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_fills_defaults() {
        let config: DaemonConfig = toml::from_str(
            r#"
            [collector]
            endpoint = "http://hypervisor:8700"

            [remote]
            endpoint = "https://meter.example.com"
            client_id = "deploy-1"
            client_secret = "s3cret"
            "#,
        )
        .unwrap();

        assert_eq!(config.database_url, "sqlite://data/vmsync.db?mode=rwc");
        assert_eq!(config.collector.timeout_secs, 30);
        assert_eq!(config.remote.generation, RemoteGeneration::ApiV2);
        assert!(config.sync.enabled);
        assert_eq!(config.sync.options().reading_workers, 4);
        assert_eq!(config.metering.options().current_window_cutoff_secs, 3300);
        assert_eq!(config.backfill.window_secs, 84_600);
        assert!(config.registered_at.is_none());
    }

    #[test]
    fn reload_swaps_the_snapshot() {
        let minimal = r#"
            [collector]
            endpoint = "http://hypervisor:8700"

            [remote]
            endpoint = "https://meter.example.com"
            client_id = "deploy-1"
            client_secret = "s3cret"
        "#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vmsync.toml");
        std::fs::write(&path, minimal).unwrap();

        let handle = ConfigHandle::load(path.to_str().unwrap()).unwrap();
        assert_eq!(handle.current().sync.max_restarts, 3);

        let updated = format!("{minimal}\n[sync]\nmax_restarts = 7\n");
        std::fs::write(&path, updated).unwrap();
        handle.reload().unwrap();
        assert_eq!(handle.current().sync.max_restarts, 7);
    }

    #[test]
    fn generation_parses_kebab_case() {
        let config: DaemonConfig = toml::from_str(
            r#"
            [collector]
            endpoint = "http://hypervisor:8700"

            [remote]
            endpoint = "https://meter.example.com"
            client_id = "deploy-1"
            client_secret = "s3cret"
            generation = "legacy"

            [sync]
            enabled = false
            max_restarts = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.remote.generation, RemoteGeneration::Legacy);
        assert!(!config.sync.enabled);
        assert_eq!(config.sync.options().max_restarts, 5);
    }
}
