//! The synchronization pipeline.
//!
//! One pass walks a fixed stage order: infrastructure creates, machine
//! failed-create recovery, machine creates, reading submission, disk/NIC
//! deletes, machine deletes, infrastructure updates, machine updates.
//! Deletes run after readings so a machine's final readings are submitted
//! before its remote record goes away; updates run last because they are the
//! cheapest to retry.
//!
//! A 429 anywhere aborts the pass, sleeps until the advertised reset and
//! restarts from stage one. An unexpected 404 pauses briefly and restarts.
//! Everything else is an entity-level failure: logged, status left
//! retryable, pass continues.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use vmsync_model::{Machine, PlatformPath, ReadingStatus, RecordStatus};
use vmsync_remote::{MeterBackend, RemoteError, RemoteMachine};
use vmsync_storage::{ReadingRow, RemoteIdMap, Store};

use crate::pool::WorkerPool;

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Max pending readings pulled per pass.
    pub reading_batch_limit: usize,
    pub reading_workers: usize,
    pub reading_queue_bound: usize,
    /// Sleep when the API rate-limits without advertising a reset.
    pub rate_limit_fallback_secs: u64,
    /// Pause after an unexpected 404 before restarting the pass.
    pub not_found_pause_secs: u64,
    /// Abandon the tick after this many restarts; the next tick retries.
    pub max_restarts: u32,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            reading_batch_limit: 500,
            reading_workers: 4,
            reading_queue_bound: 16,
            rate_limit_fallback_secs: 60,
            not_found_pause_secs: 5,
            max_restarts: 3,
        }
    }
}

/// Counters for one completed pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassReport {
    pub creates: usize,
    pub updates: usize,
    pub deletes: usize,
    pub readings_submitted: usize,
}

enum PassAbort {
    RateLimited { reset_at: Option<DateTime<Utc>> },
    NotFound,
    Fatal(anyhow::Error),
}

impl From<vmsync_storage::StorageError> for PassAbort {
    fn from(e: vmsync_storage::StorageError) -> Self {
        PassAbort::Fatal(e.into())
    }
}

/// What to do with a remote failure scoped to one entity.
enum EntityFailure {
    Timeout,
    Other(RemoteError),
}

/// Split pass-aborting failures from entity-scoped ones.
///
/// `Unauthorized` surfaces here only after the client's single token
/// refresh, so authentication is impossible and retrying per entity would
/// warn forever; it propagates as fatal instead.
fn classify(err: RemoteError) -> Result<EntityFailure, PassAbort> {
    match err {
        RemoteError::RateLimited { reset_at } => Err(PassAbort::RateLimited { reset_at }),
        RemoteError::NotFound => Err(PassAbort::NotFound),
        RemoteError::Unauthorized => Err(PassAbort::Fatal(RemoteError::Unauthorized.into())),
        e if e.is_timeout() => Ok(EntityFailure::Timeout),
        e => Ok(EntityFailure::Other(e)),
    }
}

pub struct Synchronizer {
    store: Store,
    backend: Arc<dyn MeterBackend>,
    options: SyncOptions,
}

impl Synchronizer {
    pub fn new(store: Store, backend: Arc<dyn MeterBackend>, options: SyncOptions) -> Self {
        Self {
            store,
            backend,
            options,
        }
    }

    /// Run passes until one completes, restarting on rate limit or
    /// unexpected 404. Gives up for this tick after `max_restarts`.
    pub async fn run(&self) -> anyhow::Result<PassReport> {
        let mut restarts = 0u32;
        loop {
            match self.run_pass().await {
                Ok(report) => {
                    tracing::info!(
                        creates = report.creates,
                        updates = report.updates,
                        deletes = report.deletes,
                        readings = report.readings_submitted,
                        "sync pass complete"
                    );
                    return Ok(report);
                }
                Err(PassAbort::RateLimited { reset_at }) => {
                    if restarts >= self.options.max_restarts {
                        tracing::warn!("rate limited past restart budget, yielding to next tick");
                        return Ok(PassReport::default());
                    }
                    restarts += 1;
                    let wait = reset_at
                        .and_then(|at| (at - Utc::now()).to_std().ok())
                        .unwrap_or_else(|| {
                            std::time::Duration::from_secs(self.options.rate_limit_fallback_secs)
                        });
                    tracing::warn!(wait_secs = wait.as_secs(), "rate limited, pass restarts after reset");
                    tokio::time::sleep(wait).await;
                }
                Err(PassAbort::NotFound) => {
                    if restarts >= self.options.max_restarts {
                        tracing::warn!("repeated unexpected 404, yielding to next tick");
                        return Ok(PassReport::default());
                    }
                    restarts += 1;
                    tracing::warn!("unexpected 404 from remote API, pausing before restart");
                    tokio::time::sleep(std::time::Duration::from_secs(
                        self.options.not_found_pause_secs,
                    ))
                    .await;
                }
                Err(PassAbort::Fatal(e)) => return Err(e),
            }
        }
    }

    async fn run_pass(&self) -> Result<PassReport, PassAbort> {
        let mut map = RemoteIdMap::load(&self.store).await?;
        let mut report = PassReport::default();

        self.infrastructure_creates(&mut map, &mut report).await?;
        self.machine_creates(&mut map, &mut report, true).await?;
        self.machine_creates(&mut map, &mut report, false).await?;
        report.readings_submitted = self.reading_submission(&map).await?;
        self.child_deletes(&mut map, &mut report).await?;
        self.machine_deletes(&mut map, &mut report).await?;
        self.infrastructure_updates(&mut report).await?;
        self.machine_updates(&mut map, &mut report).await?;

        Ok(report)
    }

    // ---- stage 1 ----

    async fn infrastructure_creates(
        &self,
        map: &mut RemoteIdMap,
        report: &mut PassReport,
    ) -> Result<(), PassAbort> {
        let pending = self
            .store
            .list_infrastructures(&[RecordStatus::Created, RecordStatus::FailedCreate])
            .await?;
        for mut infra in pending {
            let path = PlatformPath::infrastructure(&infra.platform_id);

            // Check-before-create: a crash after a successful POST must not
            // produce a second remote record.
            let existing = match self.backend.find_infrastructure(&infra.platform_id).await {
                Ok(found) => found,
                Err(e) => {
                    classify(e)?;
                    tracing::warn!(platform_id = %infra.platform_id, "infrastructure lookup failed, retrying next pass");
                    continue;
                }
            };

            let remote_id = match existing {
                Some(remote) => remote.remote_id,
                None => match self.backend.create_infrastructure(&infra).await {
                    Ok(remote) => remote.remote_id,
                    Err(RemoteError::Conflict {
                        remote_id: Some(id),
                    }) => id,
                    Err(e) => {
                        match classify(e)? {
                            EntityFailure::Timeout => {
                                // The POST may have landed; recovery re-checks.
                                self.store
                                    .set_infrastructure_status(
                                        &infra.platform_id,
                                        RecordStatus::FailedCreate,
                                    )
                                    .await?;
                                tracing::warn!(platform_id = %infra.platform_id, "infrastructure create timed out");
                            }
                            EntityFailure::Other(e) => {
                                tracing::warn!(platform_id = %infra.platform_id, error = %e, "infrastructure create failed");
                            }
                        }
                        continue;
                    }
                },
            };

            infra.remote_id = Some(remote_id.clone());
            infra.record_status = RecordStatus::VerifiedCreate;
            self.store
                .commit_infrastructure_sync(&infra, &[(path.key(), remote_id.clone())])
                .await?;
            map.insert_synced(&path, remote_id);
            report.creates += 1;
        }
        Ok(())
    }

    // ---- stages 2 and 3 ----

    async fn machine_creates(
        &self,
        map: &mut RemoteIdMap,
        report: &mut PassReport,
        recovery: bool,
    ) -> Result<(), PassAbort> {
        let statuses = if recovery {
            [RecordStatus::FailedCreate]
        } else {
            [RecordStatus::Created]
        };
        let pending = self.store.list_machines(&statuses).await?;
        for mut machine in pending {
            let infra_path = PlatformPath::infrastructure(&machine.infrastructure_platform_id);
            let Some(infra_remote_id) = map.get(&infra_path).map(str::to_string) else {
                // Parent not created yet; a later pass picks this up once
                // stage one has run.
                tracing::debug!(platform_id = %machine.platform_id, "machine create deferred, infrastructure unresolved");
                continue;
            };

            let existing = match self
                .backend
                .find_machine(&infra_remote_id, &machine.platform_id)
                .await
            {
                Ok(found) => found,
                Err(e) => {
                    classify(e)?;
                    tracing::warn!(platform_id = %machine.platform_id, "machine lookup failed, retrying next pass");
                    continue;
                }
            };

            let remote = match existing {
                Some(remote) => remote,
                None => match self.backend.create_machine(&infra_remote_id, &machine).await {
                    Ok(remote) => remote,
                    Err(e) => {
                        match classify(e)? {
                            EntityFailure::Timeout => {
                                self.store
                                    .set_machine_status(
                                        &machine.platform_id,
                                        RecordStatus::FailedCreate,
                                    )
                                    .await?;
                                tracing::warn!(platform_id = %machine.platform_id, "machine create timed out");
                            }
                            EntityFailure::Other(e) => {
                                tracing::warn!(platform_id = %machine.platform_id, error = %e, "machine create failed");
                            }
                        }
                        continue;
                    }
                },
            };

            self.commit_machine_acknowledged(map, &mut machine, remote, RecordStatus::VerifiedCreate)
                .await?;
            report.creates += 1;
        }
        Ok(())
    }

    /// Persist a remote-acknowledged machine: adopt the remote ID, mark the
    /// children whose IDs came back, write the map entries in the same
    /// transaction.
    async fn commit_machine_acknowledged(
        &self,
        map: &mut RemoteIdMap,
        machine: &mut Machine,
        remote: RemoteMachine,
        status: RecordStatus,
    ) -> Result<(), PassAbort> {
        let machine_path = PlatformPath::machine(
            &machine.infrastructure_platform_id,
            &machine.platform_id,
        );
        let mut entries = vec![(machine_path.key(), remote.remote_id.clone())];

        let doomed = |status: RecordStatus| {
            matches!(
                status,
                RecordStatus::ToBeDeleted
                    | RecordStatus::VerifiedDelete
                    | RecordStatus::UnverifiedDelete
            )
        };
        for disk in &mut machine.disks {
            if doomed(disk.record_status) {
                continue;
            }
            if let Some(id) = remote.disk_ids.get(&disk.platform_id) {
                disk.remote_id = Some(id.clone());
                if disk.record_status == RecordStatus::Created
                    || disk.record_status == RecordStatus::FailedCreate
                {
                    disk.record_status = RecordStatus::VerifiedCreate;
                }
                let path = PlatformPath::disk(
                    &machine.infrastructure_platform_id,
                    &machine.platform_id,
                    &disk.platform_id,
                );
                entries.push((path.key(), id.clone()));
            }
        }
        for nic in &mut machine.nics {
            if doomed(nic.record_status) {
                continue;
            }
            if let Some(id) = remote.nic_ids.get(&nic.platform_id) {
                nic.remote_id = Some(id.clone());
                if nic.record_status == RecordStatus::Created
                    || nic.record_status == RecordStatus::FailedCreate
                {
                    nic.record_status = RecordStatus::VerifiedCreate;
                }
                let path = PlatformPath::nic(
                    &machine.infrastructure_platform_id,
                    &machine.platform_id,
                    &nic.platform_id,
                );
                entries.push((path.key(), id.clone()));
            }
        }

        machine.remote_id = Some(remote.remote_id);
        machine.record_status = status;
        self.store.commit_machine_sync(machine, &entries).await?;
        for (key, id) in &entries {
            map.insert_synced(&PlatformPath::from_key(key), id.clone());
        }
        Ok(())
    }

    // ---- stage 4 ----

    async fn reading_submission(&self, map: &RemoteIdMap) -> Result<usize, PassAbort> {
        let rows = self
            .store
            .list_pending_readings(self.options.reading_batch_limit)
            .await?;
        if rows.is_empty() {
            return Ok(0);
        }

        let mut groups: HashMap<String, Vec<ReadingRow>> = HashMap::new();
        for row in rows {
            groups
                .entry(row.reading.machine_platform_id.clone())
                .or_default()
                .push(row);
        }

        let pool = WorkerPool::new(
            self.options.reading_workers,
            self.options.reading_queue_bound,
        );
        let abort: Arc<Mutex<Option<PassAbort>>> = Arc::new(Mutex::new(None));
        let submitted = Arc::new(Mutex::new(0usize));

        for (platform_id, rows) in groups {
            let Some(machine) = self.store.get_machine(&platform_id).await? else {
                tracing::warn!(%platform_id, "pending readings for unknown machine");
                continue;
            };

            if matches!(
                machine.record_status,
                RecordStatus::Deleted
                    | RecordStatus::VerifiedDelete
                    | RecordStatus::UnverifiedDelete
            ) {
                for row in &rows {
                    self.store
                        .set_reading_status(&row.id, ReadingStatus::MachineDeleted)
                        .await?;
                }
                continue;
            }

            let machine_path = PlatformPath::machine(
                &machine.infrastructure_platform_id,
                &machine.platform_id,
            );
            let Some(remote_id) = machine
                .remote_id
                .clone()
                .or_else(|| map.get(&machine_path).map(str::to_string))
            else {
                // Machine not created remotely yet; its readings wait.
                continue;
            };

            let backend = Arc::clone(&self.backend);
            let store = self.store.clone();
            let abort = Arc::clone(&abort);
            let submitted = Arc::clone(&submitted);
            pool.run(async move {
                let readings: Vec<_> = rows.iter().map(|r| r.reading.clone()).collect();
                match backend.submit_readings(&remote_id, &readings).await {
                    Ok(()) => {
                        for row in &rows {
                            if let Err(e) =
                                store.set_reading_status(&row.id, ReadingStatus::Submitted).await
                            {
                                tracing::error!(reading_id = %row.id, error = %e, "failed to mark reading submitted");
                            }
                        }
                        *submitted.lock().await += rows.len();
                    }
                    Err(RemoteError::Conflict { .. }) => {
                        // Already metered remotely for this window.
                        for row in &rows {
                            if let Err(e) = store
                                .set_reading_status(&row.id, ReadingStatus::SubmittedConflict)
                                .await
                            {
                                tracing::error!(reading_id = %row.id, error = %e, "failed to mark reading conflicted");
                            }
                        }
                        *submitted.lock().await += rows.len();
                    }
                    Err(RemoteError::RateLimited { reset_at }) => {
                        *abort.lock().await = Some(PassAbort::RateLimited { reset_at });
                    }
                    Err(RemoteError::NotFound) => {
                        *abort.lock().await = Some(PassAbort::NotFound);
                    }
                    Err(RemoteError::Unauthorized) => {
                        *abort.lock().await =
                            Some(PassAbort::Fatal(RemoteError::Unauthorized.into()));
                    }
                    Err(e) => {
                        tracing::warn!(machine = %rows[0].reading.machine_platform_id, error = %e, "reading submission failed, readings stay pending");
                    }
                }
            })
            .await;
        }

        pool.shutdown().await;
        if let Some(abort) = abort.lock().await.take() {
            return Err(abort);
        }
        let n = *submitted.lock().await;
        Ok(n)
    }

    // ---- stage 5 ----

    async fn child_deletes(
        &self,
        map: &mut RemoteIdMap,
        report: &mut PassReport,
    ) -> Result<(), PassAbort> {
        let machines = self.store.list_live_machines().await?;
        for mut machine in machines {
            let has_doomed_children = machine
                .disks
                .iter()
                .any(|d| d.record_status == RecordStatus::ToBeDeleted)
                || machine
                    .nics
                    .iter()
                    .any(|n| n.record_status == RecordStatus::ToBeDeleted);
            if !has_doomed_children {
                continue;
            }
            let Some(machine_remote_id) = machine.remote_id.clone() else {
                continue;
            };

            let mut dropped_keys = Vec::new();
            let infra_pid = machine.infrastructure_platform_id.clone();
            let machine_pid = machine.platform_id.clone();

            for disk in &mut machine.disks {
                if disk.record_status != RecordStatus::ToBeDeleted {
                    continue;
                }
                let path = PlatformPath::disk(&infra_pid, &machine_pid, &disk.platform_id);
                match &disk.remote_id {
                    None => {
                        // Never created remotely; nothing to tell the API.
                        disk.record_status = RecordStatus::VerifiedDelete;
                    }
                    Some(remote_id) => {
                        match self.backend.delete_disk(&machine_remote_id, remote_id).await {
                            Ok(()) | Err(RemoteError::NotFound) => {
                                disk.record_status = RecordStatus::VerifiedDelete;
                                dropped_keys.push(path.key());
                                report.deletes += 1;
                            }
                            Err(RemoteError::RateLimited { reset_at }) => {
                                return Err(PassAbort::RateLimited { reset_at });
                            }
                            Err(RemoteError::Unauthorized) => {
                                return Err(PassAbort::Fatal(RemoteError::Unauthorized.into()));
                            }
                            Err(e) if e.is_timeout() => {
                                disk.record_status = RecordStatus::UnverifiedDelete;
                                dropped_keys.push(path.key());
                                tracing::warn!(disk = %disk.platform_id, "disk delete timed out, marked unverified");
                            }
                            Err(e) => {
                                tracing::warn!(disk = %disk.platform_id, error = %e, "disk delete failed");
                            }
                        }
                    }
                }
            }
            for nic in &mut machine.nics {
                if nic.record_status != RecordStatus::ToBeDeleted {
                    continue;
                }
                let path = PlatformPath::nic(&infra_pid, &machine_pid, &nic.platform_id);
                match &nic.remote_id {
                    None => {
                        nic.record_status = RecordStatus::VerifiedDelete;
                    }
                    Some(remote_id) => {
                        match self.backend.delete_nic(&machine_remote_id, remote_id).await {
                            Ok(()) | Err(RemoteError::NotFound) => {
                                nic.record_status = RecordStatus::VerifiedDelete;
                                dropped_keys.push(path.key());
                                report.deletes += 1;
                            }
                            Err(RemoteError::RateLimited { reset_at }) => {
                                return Err(PassAbort::RateLimited { reset_at });
                            }
                            Err(RemoteError::Unauthorized) => {
                                return Err(PassAbort::Fatal(RemoteError::Unauthorized.into()));
                            }
                            Err(e) if e.is_timeout() => {
                                nic.record_status = RecordStatus::UnverifiedDelete;
                                dropped_keys.push(path.key());
                                tracing::warn!(nic = %nic.platform_id, "nic delete timed out, marked unverified");
                            }
                            Err(e) => {
                                tracing::warn!(nic = %nic.platform_id, error = %e, "nic delete failed");
                            }
                        }
                    }
                }
            }

            self.store
                .commit_child_delete(&machine, &dropped_keys)
                .await?;
            for key in &dropped_keys {
                map.forget(&PlatformPath::from_key(key));
            }
        }
        Ok(())
    }

    // ---- stage 6 ----

    async fn machine_deletes(
        &self,
        map: &mut RemoteIdMap,
        report: &mut PassReport,
    ) -> Result<(), PassAbort> {
        let doomed = self.store.list_machines(&[RecordStatus::ToBeDeleted]).await?;
        for machine in doomed {
            let machine_path = PlatformPath::machine(
                &machine.infrastructure_platform_id,
                &machine.platform_id,
            );
            let status = match &machine.remote_id {
                None => RecordStatus::Deleted,
                Some(remote_id) => match self.backend.delete_machine(remote_id).await {
                    Ok(()) | Err(RemoteError::NotFound) => RecordStatus::VerifiedDelete,
                    Err(RemoteError::RateLimited { reset_at }) => {
                        return Err(PassAbort::RateLimited { reset_at });
                    }
                    Err(RemoteError::Unauthorized) => {
                        return Err(PassAbort::Fatal(RemoteError::Unauthorized.into()));
                    }
                    Err(e) if e.is_timeout() => {
                        tracing::warn!(platform_id = %machine.platform_id, "machine delete timed out, marked unverified");
                        RecordStatus::UnverifiedDelete
                    }
                    Err(e) => {
                        tracing::warn!(platform_id = %machine.platform_id, error = %e, "machine delete failed");
                        continue;
                    }
                },
            };

            self.store
                .commit_machine_delete(&machine.platform_id, status, &machine_path.key())
                .await?;
            map.forget(&machine_path);
            // The remote delete cascades children; their map rows go too.
            for disk in &machine.disks {
                let path = PlatformPath::disk(
                    &machine.infrastructure_platform_id,
                    &machine.platform_id,
                    &disk.platform_id,
                );
                self.store.remove_remote_id(&path.key()).await?;
                map.forget(&path);
            }
            for nic in &machine.nics {
                let path = PlatformPath::nic(
                    &machine.infrastructure_platform_id,
                    &machine.platform_id,
                    &nic.platform_id,
                );
                self.store.remove_remote_id(&path.key()).await?;
                map.forget(&path);
            }
            report.deletes += 1;
        }
        Ok(())
    }

    // ---- stage 7 ----

    async fn infrastructure_updates(&self, report: &mut PassReport) -> Result<(), PassAbort> {
        let pending = self
            .store
            .list_infrastructures(&[RecordStatus::Updated])
            .await?;
        for mut infra in pending {
            let Some(remote_id) = infra.remote_id.clone() else {
                tracing::warn!(platform_id = %infra.platform_id, "updated infrastructure without remote id");
                continue;
            };
            match self.backend.update_infrastructure(&remote_id, &infra).await {
                Ok(()) => {
                    infra.record_status = RecordStatus::VerifiedUpdate;
                    self.store.commit_infrastructure_sync(&infra, &[]).await?;
                    report.updates += 1;
                }
                Err(e) => match classify(e)? {
                    EntityFailure::Timeout => {
                        tracing::warn!(platform_id = %infra.platform_id, "infrastructure update timed out, retrying next pass");
                    }
                    EntityFailure::Other(e) => {
                        tracing::warn!(platform_id = %infra.platform_id, error = %e, "infrastructure update failed");
                    }
                },
            }
        }
        Ok(())
    }

    // ---- stage 8 ----

    async fn machine_updates(
        &self,
        map: &mut RemoteIdMap,
        report: &mut PassReport,
    ) -> Result<(), PassAbort> {
        let pending = self.store.list_machines(&[RecordStatus::Updated]).await?;
        for mut machine in pending {
            let machine_path = PlatformPath::machine(
                &machine.infrastructure_platform_id,
                &machine.platform_id,
            );
            if !map.resolvable(&machine_path) {
                tracing::debug!(platform_id = %machine.platform_id, "machine update deferred, path unresolved");
                continue;
            }
            let Some(remote_id) = machine.remote_id.clone() else {
                tracing::warn!(platform_id = %machine.platform_id, "updated machine without remote id");
                continue;
            };
            match self.backend.update_machine(&remote_id, &machine).await {
                Ok(remote) => {
                    self.commit_machine_acknowledged(
                        map,
                        &mut machine,
                        remote,
                        RecordStatus::VerifiedUpdate,
                    )
                    .await?;
                    report.updates += 1;
                }
                Err(e) => match classify(e)? {
                    EntityFailure::Timeout => {
                        tracing::warn!(platform_id = %machine.platform_id, "machine update timed out, retrying next pass");
                    }
                    EntityFailure::Other(e) => {
                        tracing::warn!(platform_id = %machine.platform_id, error = %e, "machine update failed");
                    }
                },
            }
        }
        Ok(())
    }
}
