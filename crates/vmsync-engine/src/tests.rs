use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use tempfile::TempDir;
use vmsync_collector::{
    Collector, EventKind, InventoryObservation, MachineEvent, ObservedMachine,
};
use vmsync_model::{
    Disk, Infrastructure, Machine, PlatformPath, Reading, ReadingStatus, RecordStatus,
    TimestampStatus,
};
use vmsync_remote::{MeterBackend, RemoteError, RemoteInfrastructure, RemoteMachine};
use vmsync_storage::Store;

use crate::gaps::{GapDetector, GapOptions};
use crate::inventory::{InventoryOptions, InventoryRunner};
use crate::metering::{MeteringOptions, MeteringWorker};
use crate::pipeline::{SyncOptions, Synchronizer};

async fn setup() -> (TempDir, Store) {
    let dir = TempDir::new().unwrap();
    let url = format!("sqlite://{}/vmsync.db?mode=rwc", dir.path().display());
    let store = Store::connect(&url).await.unwrap();
    (dir, store)
}

fn infrastructure(pid: &str) -> Infrastructure {
    Infrastructure {
        platform_id: pid.to_string(),
        name: format!("dc {pid}"),
        hosts: vec![],
        networks: vec![],
        volumes: vec![],
        remote_id: None,
        record_status: RecordStatus::Created,
    }
}

fn disk(pid: &str) -> Disk {
    Disk {
        platform_id: pid.to_string(),
        name: format!("disk-{pid}"),
        maximum_size_bytes: 10 << 30,
        storage_volume_platform_id: None,
        remote_id: None,
        record_status: RecordStatus::Created,
    }
}

fn machine(pid: &str, infra: &str) -> Machine {
    Machine {
        platform_id: pid.to_string(),
        infrastructure_platform_id: infra.to_string(),
        name: format!("vm-{pid}"),
        cpu_count: 2,
        cpu_speed_hz: 2_400_000_000,
        maximum_memory_bytes: 4 << 30,
        power_state: "poweredOn".to_string(),
        disks: vec![disk("d1")],
        nics: vec![],
        remote_id: None,
        record_status: RecordStatus::Created,
    }
}

// ---- mock collector ----

#[derive(Default)]
struct MockCollector {
    observation: std::sync::Mutex<InventoryObservation>,
    samples: std::sync::Mutex<Vec<Reading>>,
    events: std::sync::Mutex<Vec<MachineEvent>>,
    sample_delay_ms: u64,
}

impl MockCollector {
    fn observe(&self, infras: Vec<Infrastructure>, machines: Vec<(Machine, bool)>) {
        *self.observation.lock().unwrap() = InventoryObservation {
            infrastructures: infras,
            machines: machines
                .into_iter()
                .map(|(machine, incomplete)| ObservedMachine {
                    machine,
                    incomplete,
                })
                .collect(),
        };
    }
}

#[async_trait]
impl Collector for MockCollector {
    fn name(&self) -> &str {
        "mock"
    }

    async fn observe_inventory(&self) -> vmsync_collector::Result<InventoryObservation> {
        Ok(self.observation.lock().unwrap().clone())
    }

    async fn sample_metrics(
        &self,
        machine_platform_ids: &[String],
        _from: DateTime<Utc>,
        _to: DateTime<Utc>,
    ) -> vmsync_collector::Result<Vec<Reading>> {
        if self.sample_delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.sample_delay_ms)).await;
        }
        let wanted: HashSet<&str> = machine_platform_ids.iter().map(String::as_str).collect();
        Ok(self
            .samples
            .lock()
            .unwrap()
            .iter()
            .filter(|r| wanted.contains(r.machine_platform_id.as_str()))
            .cloned()
            .collect())
    }

    async fn events_between(
        &self,
        _from: DateTime<Utc>,
        _to: DateTime<Utc>,
    ) -> vmsync_collector::Result<Vec<MachineEvent>> {
        Ok(self.events.lock().unwrap().clone())
    }
}

// ---- mock backend ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Scripted {
    RateLimited,
    ApiError,
    Unauthorized,
}

#[derive(Default)]
struct MockBackend {
    calls: std::sync::Mutex<Vec<String>>,
    infrastructures: std::sync::Mutex<HashMap<String, String>>,
    machines: std::sync::Mutex<HashMap<String, RemoteMachine>>,
    fail_once: std::sync::Mutex<HashMap<&'static str, Scripted>>,
    next_id: AtomicU64,
}

impl MockBackend {
    fn next(&self) -> String {
        (100 + self.next_id.fetch_add(1, Ordering::SeqCst)).to_string()
    }

    fn log(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn count(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    fn fail_once(&self, op: &'static str, failure: Scripted) {
        self.fail_once.lock().unwrap().insert(op, failure);
    }

    fn take_failure(&self, op: &'static str) -> Option<RemoteError> {
        self.fail_once
            .lock()
            .unwrap()
            .remove(op)
            .map(|scripted| match scripted {
                Scripted::RateLimited => RemoteError::RateLimited {
                    reset_at: Some(Utc::now()),
                },
                Scripted::ApiError => RemoteError::Api {
                    status: 500,
                    body: "boom".to_string(),
                },
                Scripted::Unauthorized => RemoteError::Unauthorized,
            })
    }

    fn seed_infrastructure(&self, platform_id: &str, remote_id: &str) {
        self.infrastructures
            .lock()
            .unwrap()
            .insert(platform_id.to_string(), remote_id.to_string());
    }

    fn remote_machine_for(&self, machine: &Machine) -> RemoteMachine {
        let mut remote = RemoteMachine {
            remote_id: self.next(),
            ..Default::default()
        };
        for d in &machine.disks {
            if !matches!(
                d.record_status,
                RecordStatus::ToBeDeleted
                    | RecordStatus::VerifiedDelete
                    | RecordStatus::UnverifiedDelete
            ) {
                remote
                    .disk_ids
                    .insert(d.platform_id.clone(), self.next());
            }
        }
        for n in &machine.nics {
            if !matches!(
                n.record_status,
                RecordStatus::ToBeDeleted
                    | RecordStatus::VerifiedDelete
                    | RecordStatus::UnverifiedDelete
            ) {
                remote.nic_ids.insert(n.platform_id.clone(), self.next());
            }
        }
        remote
    }
}

#[async_trait]
impl MeterBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn find_infrastructure(
        &self,
        platform_id: &str,
    ) -> vmsync_remote::Result<Option<RemoteInfrastructure>> {
        self.log(format!("find_infrastructure {platform_id}"));
        Ok(self
            .infrastructures
            .lock()
            .unwrap()
            .get(platform_id)
            .map(|id| RemoteInfrastructure {
                remote_id: id.clone(),
            }))
    }

    async fn create_infrastructure(
        &self,
        infra: &Infrastructure,
    ) -> vmsync_remote::Result<RemoteInfrastructure> {
        self.log(format!("create_infrastructure {}", infra.platform_id));
        if let Some(err) = self.take_failure("create_infrastructure") {
            return Err(err);
        }
        let id = self.next();
        self.infrastructures
            .lock()
            .unwrap()
            .insert(infra.platform_id.clone(), id.clone());
        Ok(RemoteInfrastructure { remote_id: id })
    }

    async fn update_infrastructure(
        &self,
        _remote_id: &str,
        infra: &Infrastructure,
    ) -> vmsync_remote::Result<()> {
        self.log(format!("update_infrastructure {}", infra.platform_id));
        Ok(())
    }

    async fn find_machine(
        &self,
        _infrastructure_remote_id: &str,
        platform_id: &str,
    ) -> vmsync_remote::Result<Option<RemoteMachine>> {
        self.log(format!("find_machine {platform_id}"));
        Ok(self.machines.lock().unwrap().get(platform_id).cloned())
    }

    async fn create_machine(
        &self,
        _infrastructure_remote_id: &str,
        machine: &Machine,
    ) -> vmsync_remote::Result<RemoteMachine> {
        self.log(format!("create_machine {}", machine.platform_id));
        if let Some(err) = self.take_failure("create_machine") {
            return Err(err);
        }
        let remote = self.remote_machine_for(machine);
        self.machines
            .lock()
            .unwrap()
            .insert(machine.platform_id.clone(), remote.clone());
        Ok(remote)
    }

    async fn update_machine(
        &self,
        remote_id: &str,
        machine: &Machine,
    ) -> vmsync_remote::Result<RemoteMachine> {
        self.log(format!("update_machine {}", machine.platform_id));
        if let Some(err) = self.take_failure("update_machine") {
            return Err(err);
        }
        let mut remote = self.remote_machine_for(machine);
        remote.remote_id = remote_id.to_string();
        // Children that already had IDs keep them.
        if let Some(prev) = self.machines.lock().unwrap().get(&machine.platform_id) {
            for (pid, id) in &prev.disk_ids {
                remote.disk_ids.insert(pid.clone(), id.clone());
            }
            for (pid, id) in &prev.nic_ids {
                remote.nic_ids.insert(pid.clone(), id.clone());
            }
        }
        self.machines
            .lock()
            .unwrap()
            .insert(machine.platform_id.clone(), remote.clone());
        Ok(remote)
    }

    async fn delete_machine(&self, remote_id: &str) -> vmsync_remote::Result<()> {
        self.log(format!("delete_machine {remote_id}"));
        Ok(())
    }

    async fn delete_disk(
        &self,
        _machine_remote_id: &str,
        disk_remote_id: &str,
    ) -> vmsync_remote::Result<()> {
        self.log(format!("delete_disk {disk_remote_id}"));
        Ok(())
    }

    async fn delete_nic(
        &self,
        _machine_remote_id: &str,
        nic_remote_id: &str,
    ) -> vmsync_remote::Result<()> {
        self.log(format!("delete_nic {nic_remote_id}"));
        Ok(())
    }

    async fn submit_readings(
        &self,
        machine_remote_id: &str,
        readings: &[Reading],
    ) -> vmsync_remote::Result<()> {
        self.log(format!(
            "submit_readings {machine_remote_id} x{}",
            readings.len()
        ));
        if let Some(err) = self.take_failure("submit_readings") {
            return Err(err);
        }
        Ok(())
    }
}

fn fast_sync_options() -> SyncOptions {
    SyncOptions {
        rate_limit_fallback_secs: 0,
        not_found_pause_secs: 0,
        ..SyncOptions::default()
    }
}

// ---- tests ----

#[tokio::test]
async fn end_to_end_create_then_update() {
    let (_dir, store) = setup().await;
    let collector = Arc::new(MockCollector::default());
    let backend = Arc::new(MockBackend::default());

    collector.observe(
        vec![infrastructure("dc-1")],
        vec![(machine("vm-1", "dc-1"), false)],
    );
    let inventory = InventoryRunner::new(
        store.clone(),
        collector.clone(),
        InventoryOptions::default(),
    );
    inventory.run_cycle(Utc::now()).await.unwrap();

    let sync = Synchronizer::new(store.clone(), backend.clone(), fast_sync_options());
    sync.run().await.unwrap();

    let infra = store.get_infrastructure("dc-1").await.unwrap().unwrap();
    assert_eq!(infra.record_status, RecordStatus::VerifiedCreate);
    assert!(infra.remote_id.is_some());
    let m = store.get_machine("vm-1").await.unwrap().unwrap();
    assert_eq!(m.record_status, RecordStatus::VerifiedCreate);
    assert!(m.remote_id.is_some());
    assert!(m.disks[0].remote_id.is_some());
    assert_eq!(m.disks[0].record_status, RecordStatus::VerifiedCreate);

    let machine_key = PlatformPath::machine("dc-1", "vm-1").key();
    assert!(store.get_remote_id(&machine_key).await.unwrap().is_some());

    // Second sweep sees a CPU change; the pipeline turns it into a verified
    // update without another create.
    let mut grown = machine("vm-1", "dc-1");
    grown.cpu_count = 8;
    collector.observe(vec![infrastructure("dc-1")], vec![(grown, false)]);
    inventory.run_cycle(Utc::now()).await.unwrap();

    let staged = store.get_machine("vm-1").await.unwrap().unwrap();
    assert_eq!(staged.record_status, RecordStatus::Updated);

    sync.run().await.unwrap();
    let updated = store.get_machine("vm-1").await.unwrap().unwrap();
    assert_eq!(updated.record_status, RecordStatus::VerifiedUpdate);
    assert_eq!(updated.cpu_count, 8);
    assert_eq!(backend.count("create_machine"), 1);
}

#[tokio::test]
async fn natural_key_hit_skips_the_create_post() {
    let (_dir, store) = setup().await;
    let backend = Arc::new(MockBackend::default());
    backend.seed_infrastructure("dc-1", "777");

    store
        .insert_infrastructures(&[infrastructure("dc-1")])
        .await
        .unwrap();

    let sync = Synchronizer::new(store.clone(), backend.clone(), fast_sync_options());
    sync.run().await.unwrap();

    let infra = store.get_infrastructure("dc-1").await.unwrap().unwrap();
    assert_eq!(infra.record_status, RecordStatus::VerifiedCreate);
    assert_eq!(infra.remote_id.as_deref(), Some("777"));
    assert_eq!(backend.count("create_infrastructure"), 0);
}

#[tokio::test]
async fn machine_waits_for_its_infrastructure_then_succeeds() {
    let (_dir, store) = setup().await;
    let backend = Arc::new(MockBackend::default());
    backend.fail_once("create_infrastructure", Scripted::ApiError);

    store
        .insert_infrastructures(&[infrastructure("dc-1")])
        .await
        .unwrap();
    store
        .insert_machines(&[machine("vm-1", "dc-1")])
        .await
        .unwrap();

    let sync = Synchronizer::new(store.clone(), backend.clone(), fast_sync_options());

    // First pass: infrastructure create fails, the machine must be skipped
    // rather than created against a missing parent.
    sync.run().await.unwrap();
    assert_eq!(backend.count("create_machine"), 0);
    let m = store.get_machine("vm-1").await.unwrap().unwrap();
    assert_eq!(m.record_status, RecordStatus::Created);

    // Second pass: parent lands, then the machine follows.
    sync.run().await.unwrap();
    let m = store.get_machine("vm-1").await.unwrap().unwrap();
    assert_eq!(m.record_status, RecordStatus::VerifiedCreate);
}

#[tokio::test]
async fn rate_limit_restarts_the_pass_from_stage_one() {
    let (_dir, store) = setup().await;
    let backend = Arc::new(MockBackend::default());
    backend.fail_once("create_machine", Scripted::RateLimited);

    store
        .insert_infrastructures(&[infrastructure("dc-1")])
        .await
        .unwrap();
    store
        .insert_machines(&[machine("vm-1", "dc-1")])
        .await
        .unwrap();

    let sync = Synchronizer::new(store.clone(), backend.clone(), fast_sync_options());
    sync.run().await.unwrap();

    // The create was attempted, rate limited, and attempted again after the
    // pass restarted from stage one.
    assert_eq!(backend.count("create_machine"), 2);
    assert_eq!(backend.count("find_machine"), 2);
    let m = store.get_machine("vm-1").await.unwrap().unwrap();
    assert_eq!(m.record_status, RecordStatus::VerifiedCreate);
}

#[tokio::test]
async fn auth_failure_aborts_the_pass_instead_of_retrying() {
    let (_dir, store) = setup().await;
    let backend = Arc::new(MockBackend::default());
    backend.fail_once("create_machine", Scripted::Unauthorized);

    store
        .insert_infrastructures(&[infrastructure("dc-1")])
        .await
        .unwrap();
    store
        .insert_machines(&[machine("vm-1", "dc-1")])
        .await
        .unwrap();

    // The client only refreshes its token once, so a 401 reaching the
    // pipeline means authentication is broken; the run must fail rather
    // than warn and spin per entity.
    let sync = Synchronizer::new(store.clone(), backend.clone(), fast_sync_options());
    assert!(sync.run().await.is_err());
    assert_eq!(backend.count("create_machine"), 1);
    let m = store.get_machine("vm-1").await.unwrap().unwrap();
    assert_eq!(m.record_status, RecordStatus::Created);
}

#[tokio::test]
async fn dropped_disk_is_deleted_remotely_and_its_mapping_removed() {
    let (_dir, store) = setup().await;
    let collector = Arc::new(MockCollector::default());
    let backend = Arc::new(MockBackend::default());
    let inventory = InventoryRunner::new(
        store.clone(),
        collector.clone(),
        InventoryOptions::default(),
    );
    let sync = Synchronizer::new(store.clone(), backend.clone(), fast_sync_options());

    let mut m = machine("vm-1", "dc-1");
    m.disks.push(disk("d2"));
    collector.observe(vec![infrastructure("dc-1")], vec![(m, false)]);
    inventory.run_cycle(Utc::now()).await.unwrap();
    sync.run().await.unwrap();

    let disk_key = PlatformPath::disk("dc-1", "vm-1", "d2").key();
    let d2_remote = store.get_remote_id(&disk_key).await.unwrap().unwrap();

    // d2 vanishes from the next sweep.
    collector.observe(
        vec![infrastructure("dc-1")],
        vec![(machine("vm-1", "dc-1"), false)],
    );
    inventory.run_cycle(Utc::now()).await.unwrap();
    sync.run().await.unwrap();

    assert!(backend
        .calls()
        .contains(&format!("delete_disk {d2_remote}")));
    let m = store.get_machine("vm-1").await.unwrap().unwrap();
    let d2 = m.disks.iter().find(|d| d.platform_id == "d2").unwrap();
    assert_eq!(d2.record_status, RecordStatus::VerifiedDelete);
    assert!(store.get_remote_id(&disk_key).await.unwrap().is_none());
}

#[tokio::test]
async fn vanished_machine_is_deleted_remotely() {
    let (_dir, store) = setup().await;
    let collector = Arc::new(MockCollector::default());
    let backend = Arc::new(MockBackend::default());
    let inventory = InventoryRunner::new(
        store.clone(),
        collector.clone(),
        InventoryOptions::default(),
    );
    let sync = Synchronizer::new(store.clone(), backend.clone(), fast_sync_options());

    collector.observe(
        vec![infrastructure("dc-1")],
        vec![(machine("vm-1", "dc-1"), false)],
    );
    inventory.run_cycle(Utc::now()).await.unwrap();
    sync.run().await.unwrap();
    let remote_id = store
        .get_machine("vm-1")
        .await
        .unwrap()
        .unwrap()
        .remote_id
        .unwrap();

    collector.observe(vec![infrastructure("dc-1")], vec![]);
    inventory.run_cycle(Utc::now()).await.unwrap();
    let m = store.get_machine("vm-1").await.unwrap().unwrap();
    assert_eq!(m.record_status, RecordStatus::ToBeDeleted);

    sync.run().await.unwrap();
    assert!(backend
        .calls()
        .contains(&format!("delete_machine {remote_id}")));
    let m = store.get_machine("vm-1").await.unwrap().unwrap();
    assert_eq!(m.record_status, RecordStatus::VerifiedDelete);
    let machine_key = PlatformPath::machine("dc-1", "vm-1").key();
    assert!(store.get_remote_id(&machine_key).await.unwrap().is_none());
}

#[tokio::test]
async fn readings_for_deleted_machines_are_skipped_not_submitted() {
    let (_dir, store) = setup().await;
    let backend = Arc::new(MockBackend::default());

    let mut gone = machine("vm-1", "dc-1");
    gone.record_status = RecordStatus::VerifiedDelete;
    store.insert_machines(&[gone.clone()]).await.unwrap();
    let now = Utc::now();
    store
        .insert_readings(
            &[Reading::zeroed(&gone, now - Duration::minutes(5), now)],
            Duration::hours(2),
        )
        .await
        .unwrap();

    let sync = Synchronizer::new(store.clone(), backend.clone(), fast_sync_options());
    sync.run().await.unwrap();

    assert_eq!(backend.count("submit_readings"), 0);
    assert!(store.list_pending_readings(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn pending_readings_are_submitted_per_machine() {
    let (_dir, store) = setup().await;
    let collector = Arc::new(MockCollector::default());
    let backend = Arc::new(MockBackend::default());
    let inventory = InventoryRunner::new(
        store.clone(),
        collector.clone(),
        InventoryOptions::default(),
    );
    let sync = Synchronizer::new(store.clone(), backend.clone(), fast_sync_options());

    collector.observe(
        vec![infrastructure("dc-1")],
        vec![(machine("vm-1", "dc-1"), false)],
    );
    inventory.run_cycle(Utc::now()).await.unwrap();
    sync.run().await.unwrap();

    let m = store.get_machine("vm-1").await.unwrap().unwrap();
    let now = Utc::now();
    store
        .insert_readings(
            &[
                Reading::zeroed(&m, now - Duration::minutes(10), now - Duration::minutes(5)),
                Reading::zeroed(&m, now - Duration::minutes(5), now),
            ],
            Duration::hours(2),
        )
        .await
        .unwrap();

    sync.run().await.unwrap();
    assert_eq!(backend.count("submit_readings"), 1);
    assert!(store.list_pending_readings(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn metering_zero_fills_machines_without_samples() {
    let (_dir, store) = setup().await;
    let collector = Arc::new(MockCollector::default());

    let m1 = machine("vm-1", "dc-1");
    let m2 = machine("vm-2", "dc-1");
    store.insert_machines(&[m1.clone(), m2]).await.unwrap();

    let at = Utc.with_ymd_and_hms(2026, 8, 30, 10, 5, 0).unwrap();
    store
        .record_timestamp(at, TimestampStatus::QueuedForMetering, Duration::hours(24))
        .await
        .unwrap();

    // Only vm-1 has data in the window.
    *collector.samples.lock().unwrap() = vec![Reading {
        cpu_usage_percent: 42.0,
        ..Reading::zeroed(&m1, at - Duration::minutes(5), at)
    }];

    let worker = MeteringWorker::new(store.clone(), collector, MeteringOptions::default());
    let report = worker.run_cycle().await.unwrap();
    assert_eq!(report.timestamps_metered, 1);
    assert_eq!(report.readings_written, 2);

    let pending = store.list_pending_readings(10).await.unwrap();
    assert_eq!(pending.len(), 2);
    let vm2 = pending
        .iter()
        .find(|r| r.reading.machine_platform_id == "vm-2")
        .unwrap();
    assert_eq!(vm2.reading.cpu_usage_percent, 0.0);

    let rows = store
        .list_timestamps(&[TimestampStatus::Metered])
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert!(!rows[0].locked);
}

#[tokio::test]
async fn metering_timeout_abandons_only_that_timestamp() {
    let (_dir, store) = setup().await;
    let collector = Arc::new(MockCollector {
        sample_delay_ms: 200,
        ..MockCollector::default()
    });
    store
        .insert_machines(&[machine("vm-1", "dc-1")])
        .await
        .unwrap();
    let at = Utc.with_ymd_and_hms(2026, 8, 30, 10, 5, 0).unwrap();
    store
        .record_timestamp(at, TimestampStatus::QueuedForMetering, Duration::hours(24))
        .await
        .unwrap();

    let options = MeteringOptions {
        current_timeout_secs: 0,
        backlog_timeout_secs: 0,
        ..MeteringOptions::default()
    };
    let worker = MeteringWorker::new(store.clone(), collector, options);
    let report = worker.run_cycle().await.unwrap();
    assert_eq!(report.timestamps_abandoned, 1);
    assert_eq!(report.timestamps_metered, 0);

    let rows = store
        .list_timestamps(&[TimestampStatus::QueuedForMetering])
        .await
        .unwrap();
    assert_eq!(rows.len(), 1, "abandoned timestamp stays queued");
    assert!(!rows[0].locked, "abandoned timestamp is unlocked");
}

#[tokio::test]
async fn gap_detection_records_exactly_the_missing_instant() {
    let (_dir, store) = setup().await;
    let collector = Arc::new(MockCollector::default());

    let t0 = Utc.with_ymd_and_hms(2026, 8, 30, 10, 0, 0).unwrap();
    let t1 = t0 + Duration::minutes(5);
    let t2 = t0 + Duration::minutes(10);
    store
        .record_timestamp(t0, TimestampStatus::Metered, Duration::hours(24))
        .await
        .unwrap();
    // t1 missing.
    store
        .record_timestamp(t2, TimestampStatus::Metered, Duration::hours(24))
        .await
        .unwrap();

    let options = GapOptions {
        registered_at: t0,
        ..GapOptions::default()
    };
    let detector = GapDetector::new(store.clone(), collector, options);
    let report = detector.run_cycle(t2).await.unwrap();
    assert_eq!(report.gaps_recorded, 1);

    let queued = store
        .list_timestamps(&[TimestampStatus::QueuedForMetering])
        .await
        .unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].inventory_at, t1);

    // A second cycle finds nothing new.
    let report = detector.run_cycle(t2).await.unwrap();
    assert_eq!(report.gaps_recorded, 0);
}

#[tokio::test]
async fn removal_events_in_a_gap_are_replayed() {
    let (_dir, store) = setup().await;
    let collector = Arc::new(MockCollector::default());

    let mut known = machine("vm-1", "dc-1");
    known.remote_id = Some("200".to_string());
    known.record_status = RecordStatus::VerifiedCreate;
    store.insert_machines(&[known.clone()]).await.unwrap();
    store.update_machine(&known).await.unwrap();

    let t0 = Utc.with_ymd_and_hms(2026, 8, 30, 10, 0, 0).unwrap();
    let t1 = t0 + Duration::minutes(5);
    store
        .record_timestamp(t0, TimestampStatus::Metered, Duration::hours(24))
        .await
        .unwrap();
    *collector.events.lock().unwrap() = vec![MachineEvent {
        machine_platform_id: "vm-1".to_string(),
        kind: EventKind::Removed,
        occurred_at: t0 + Duration::minutes(2),
        machine: None,
    }];

    let options = GapOptions {
        registered_at: t0,
        ..GapOptions::default()
    };
    let detector = GapDetector::new(store.clone(), collector, options);
    detector.run_cycle(t1).await.unwrap();

    let m = store.get_machine("vm-1").await.unwrap().unwrap();
    assert_eq!(m.record_status, RecordStatus::ToBeDeleted);
}

#[tokio::test]
async fn creation_events_in_a_gap_synthesize_the_machine() {
    let (_dir, store) = setup().await;
    let collector = Arc::new(MockCollector::default());

    let t0 = Utc.with_ymd_and_hms(2026, 8, 30, 10, 0, 0).unwrap();
    let t1 = t0 + Duration::minutes(5);
    store
        .record_timestamp(t0, TimestampStatus::Metered, Duration::hours(24))
        .await
        .unwrap();
    // vm-9 was born and destroyed while inventory was down.
    *collector.events.lock().unwrap() = vec![
        MachineEvent {
            machine_platform_id: "vm-9".to_string(),
            kind: EventKind::Created,
            occurred_at: t0 + Duration::minutes(1),
            machine: Some(machine("vm-9", "dc-1")),
        },
        MachineEvent {
            machine_platform_id: "vm-9".to_string(),
            kind: EventKind::Removed,
            occurred_at: t0 + Duration::minutes(3),
            machine: None,
        },
    ];

    let options = GapOptions {
        registered_at: t0,
        ..GapOptions::default()
    };
    let detector = GapDetector::new(store.clone(), collector, options);
    detector.run_cycle(t1).await.unwrap();

    // The machine exists and stays a pending create so its gap instants are
    // metered and submitted before the next sweep retires it.
    let m = store.get_machine("vm-9").await.unwrap().unwrap();
    assert_eq!(m.record_status, RecordStatus::Created);
    assert!(m.remote_id.is_none());
    assert_eq!(m.cpu_count, 2);
}

#[tokio::test]
async fn stale_metering_timestamps_are_requeued() {
    let (_dir, store) = setup().await;
    let collector = Arc::new(MockCollector::default());

    let now = Utc::now();
    let old = now - Duration::hours(2);
    let id = store
        .record_timestamp(old, TimestampStatus::Metering, Duration::hours(24))
        .await
        .unwrap();

    let options = GapOptions {
        registered_at: now - Duration::minutes(1),
        ..GapOptions::default()
    };
    let detector = GapDetector::new(store.clone(), collector, options);
    let report = detector.run_cycle(now).await.unwrap();
    assert_eq!(report.stuck_requeued, 1);

    let row = store.get_timestamp(&id).await.unwrap().unwrap();
    assert_eq!(row.status, TimestampStatus::QueuedForMetering);
}
