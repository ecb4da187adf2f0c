use std::collections::{HashMap, HashSet};

use vmsync_model::{Infrastructure, Machine, RecordStatus};

use crate::error::Result;
use crate::store::Store;

/// Outcome of assigning a freshly observed entity to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Diff {
    Created,
    Updated,
    Unchanged,
}

/// Diffing cache over the persistent store, keyed by `platform_id`.
///
/// Assignments stage mutations in append-only pending lists; nothing touches
/// the database until [`InventoryCache::flush`]. Repeated identical
/// observations yield `Unchanged` and stage nothing, so an idle
/// infrastructure produces zero write churn.
pub struct InventoryCache {
    infrastructures: HashMap<String, Infrastructure>,
    machines: HashMap<String, Machine>,
    // Logically deleted rows are retained under the same unique
    // platform_id, so a reappearing entity must go through the update
    // path, never a fresh insert.
    deleted_infrastructures: HashMap<String, Infrastructure>,
    deleted_machines: HashMap<String, Machine>,
    staged_new_infrastructures: Vec<String>,
    staged_updated_infrastructures: Vec<String>,
    staged_new_machines: Vec<String>,
    staged_updated_machines: Vec<String>,
}

impl InventoryCache {
    /// Pre-populate from the store's most recent snapshot. Deleted rows go
    /// into a shadow map keyed the same way, consulted only on resurrection.
    pub async fn load(store: &Store) -> Result<Self> {
        let infrastructures = store
            .list_live_infrastructures()
            .await?
            .into_iter()
            .map(|i| (i.platform_id.clone(), i))
            .collect();
        let machines = store
            .list_live_machines()
            .await?
            .into_iter()
            .map(|m| (m.platform_id.clone(), m))
            .collect();
        let deleted_infrastructures = store
            .list_infrastructures(&[RecordStatus::Deleted])
            .await?
            .into_iter()
            .map(|i| (i.platform_id.clone(), i))
            .collect();
        let deleted_machines = store
            .list_machines(&[RecordStatus::Deleted])
            .await?
            .into_iter()
            .map(|m| (m.platform_id.clone(), m))
            .collect();
        Ok(Self {
            infrastructures,
            machines,
            deleted_infrastructures,
            deleted_machines,
            staged_new_infrastructures: Vec::new(),
            staged_updated_infrastructures: Vec::new(),
            staged_new_machines: Vec::new(),
            staged_updated_machines: Vec::new(),
        })
    }

    pub fn infrastructure(&self, platform_id: &str) -> Option<&Infrastructure> {
        self.infrastructures.get(platform_id)
    }

    pub fn machine(&self, platform_id: &str) -> Option<&Machine> {
        self.machines.get(platform_id)
    }

    pub fn machines(&self) -> impl Iterator<Item = &Machine> {
        self.machines.values()
    }

    /// Assign a freshly observed infrastructure.
    pub fn put_infrastructure(&mut self, mut observed: Infrastructure) -> Diff {
        let pid = observed.platform_id.clone();
        match self.infrastructures.get(&pid) {
            None => {
                if let Some(prior) = self.deleted_infrastructures.remove(&pid) {
                    // Reappeared after a deletion sweep; the row still
                    // exists, so resurrect it in place.
                    observed.remote_id = prior.remote_id;
                    observed.record_status = if observed.remote_id.is_none() {
                        RecordStatus::Created
                    } else {
                        RecordStatus::Updated
                    };
                    self.infrastructures.insert(pid.clone(), observed);
                    self.staged_updated_infrastructures.push(pid);
                    return Diff::Created;
                }
                observed.record_status = RecordStatus::Created;
                self.infrastructures.insert(pid.clone(), observed);
                self.staged_new_infrastructures.push(pid);
                Diff::Created
            }
            Some(cached) => {
                observed.remote_id = cached.remote_id.clone();
                if observed.comparable_eq(cached) {
                    return Diff::Unchanged;
                }
                observed.record_status = if cached.remote_id.is_none()
                    && matches!(
                        cached.record_status,
                        RecordStatus::Created | RecordStatus::FailedCreate
                    ) {
                    // Not yet accepted remotely: stay a pending create with
                    // the fresher attributes.
                    RecordStatus::Created
                } else {
                    RecordStatus::Updated
                };
                self.infrastructures.insert(pid.clone(), observed);
                self.staged_updated_infrastructures.push(pid);
                Diff::Updated
            }
        }
    }

    /// Assign a freshly observed machine.
    ///
    /// `incomplete` marks an observation missing required fields; it is
    /// merged with the prior snapshot instead of being treated as a set of
    /// deletions.
    pub fn put_machine(&mut self, mut observed: Machine, incomplete: bool) -> Diff {
        let pid = observed.platform_id.clone();
        match self.machines.get(&pid) {
            None => {
                if let Some(prior) = self.deleted_machines.remove(&pid) {
                    let mut resurrected = if incomplete {
                        observed.merge_incomplete(&prior)
                    } else {
                        observed
                    };
                    resurrected.remote_id = prior.remote_id;
                    resurrected.record_status = if incomplete {
                        RecordStatus::Incomplete
                    } else if resurrected.remote_id.is_none() {
                        RecordStatus::Created
                    } else {
                        RecordStatus::Updated
                    };
                    self.machines.insert(pid.clone(), resurrected);
                    self.staged_updated_machines.push(pid);
                    return Diff::Created;
                }
                observed.record_status = if incomplete {
                    RecordStatus::Incomplete
                } else {
                    RecordStatus::Created
                };
                self.machines.insert(pid.clone(), observed);
                self.staged_new_machines.push(pid);
                Diff::Created
            }
            Some(cached) => {
                if incomplete {
                    let merged = observed.merge_incomplete(cached);
                    self.machines.insert(pid.clone(), merged);
                    self.staged_updated_machines.push(pid);
                    return Diff::Updated;
                }
                observed.remote_id = cached.remote_id.clone();
                let attrs_differ = !observed.comparable_eq(cached);
                let children_changed = observed.reconcile_children(cached);
                if !attrs_differ && !children_changed {
                    if cached.record_status == RecordStatus::Incomplete {
                        // A previously incomplete machine came back whole;
                        // promote it so the pipeline picks it up.
                        observed.record_status = if cached.remote_id.is_none() {
                            RecordStatus::Created
                        } else {
                            RecordStatus::Updated
                        };
                        self.machines.insert(pid.clone(), observed);
                        self.staged_updated_machines.push(pid);
                        return Diff::Updated;
                    }
                    return Diff::Unchanged;
                }
                observed.record_status = if cached.remote_id.is_none()
                    && matches!(
                        cached.record_status,
                        RecordStatus::Created
                            | RecordStatus::FailedCreate
                            | RecordStatus::Incomplete
                    ) {
                    RecordStatus::Created
                } else {
                    RecordStatus::Updated
                };
                self.machines.insert(pid.clone(), observed);
                self.staged_updated_machines.push(pid);
                Diff::Updated
            }
        }
    }

    /// Mark previously-known keys absent from the latest full observation.
    ///
    /// Machines the remote side knows about become `ToBeDeleted` so the
    /// deletion is submitted explicitly; never-created ones go straight to
    /// `Deleted`. Returns the platform IDs that changed.
    pub fn sync_missing(&mut self, observed_keys: &HashSet<String>) -> Vec<String> {
        let mut changed = Vec::new();

        let missing_machines: Vec<String> = self
            .machines
            .values()
            .filter(|m| {
                !observed_keys.contains(&m.platform_id)
                    && !matches!(
                        m.record_status,
                        RecordStatus::ToBeDeleted
                            | RecordStatus::VerifiedDelete
                            | RecordStatus::UnverifiedDelete
                            | RecordStatus::Deleted
                    )
            })
            .map(|m| m.platform_id.clone())
            .collect();
        for pid in missing_machines {
            if let Some(machine) = self.machines.get_mut(&pid) {
                machine.record_status = if machine.remote_id.is_some() {
                    RecordStatus::ToBeDeleted
                } else {
                    RecordStatus::Deleted
                };
                self.staged_updated_machines.push(pid.clone());
                changed.push(pid);
            }
        }

        let missing_infras: Vec<String> = self
            .infrastructures
            .values()
            .filter(|i| {
                !observed_keys.contains(&i.platform_id)
                    && i.record_status != RecordStatus::Deleted
            })
            .map(|i| i.platform_id.clone())
            .collect();
        for pid in missing_infras {
            if let Some(infra) = self.infrastructures.get_mut(&pid) {
                infra.record_status = RecordStatus::Deleted;
                self.staged_updated_infrastructures.push(pid.clone());
                changed.push(pid);
            }
        }

        changed
    }

    pub fn has_staged_mutations(&self) -> bool {
        !self.staged_new_infrastructures.is_empty()
            || !self.staged_updated_infrastructures.is_empty()
            || !self.staged_new_machines.is_empty()
            || !self.staged_updated_machines.is_empty()
    }

    /// Apply staged mutations: one batched insert for new records,
    /// individual updates for existing ones, then reload the cache entries
    /// from the newly-inserted rows.
    pub async fn flush(&mut self, store: &Store) -> Result<()> {
        let new_infras: Vec<Infrastructure> = self
            .staged_new_infrastructures
            .iter()
            .filter_map(|pid| self.infrastructures.get(pid).cloned())
            .collect();
        store.insert_infrastructures(&new_infras).await?;

        let new_machines: Vec<Machine> = self
            .staged_new_machines
            .iter()
            .filter_map(|pid| self.machines.get(pid).cloned())
            .collect();
        store.insert_machines(&new_machines).await?;

        for pid in &self.staged_updated_infrastructures {
            if let Some(infra) = self.infrastructures.get(pid) {
                store.update_infrastructure(infra).await?;
            }
        }
        for pid in &self.staged_updated_machines {
            if let Some(machine) = self.machines.get(pid) {
                store.update_machine(machine).await?;
            }
        }

        for pid in self.staged_new_infrastructures.drain(..) {
            if let Some(infra) = store.get_infrastructure(&pid).await? {
                self.infrastructures.insert(pid, infra);
            }
        }
        for pid in self.staged_new_machines.drain(..) {
            if let Some(machine) = store.get_machine(&pid).await? {
                self.machines.insert(pid, machine);
            }
        }
        self.staged_updated_infrastructures.clear();
        self.staged_updated_machines.clear();
        Ok(())
    }
}
