use crate::status::RecordStatus;
use serde::{Deserialize, Serialize};

/// A datacenter-level container observed by the collector.
///
/// Hosts, networks and volumes are embedded detail used for capacity
/// reporting; they share the infrastructure's lifecycle rather than carrying
/// their own remote identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Infrastructure {
    pub platform_id: String,
    pub name: String,
    #[serde(default)]
    pub hosts: Vec<Host>,
    #[serde(default)]
    pub networks: Vec<Network>,
    #[serde(default)]
    pub volumes: Vec<Volume>,
    pub remote_id: Option<String>,
    pub record_status: RecordStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    pub platform_id: String,
    pub cpu_cores: i64,
    pub cpu_speed_hz: i64,
    pub memory_bytes: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Network {
    pub platform_id: String,
    pub name: String,
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub platform_id: String,
    pub name: String,
    pub maximum_size_bytes: i64,
    /// Free space moves on every observation, so it is persisted but never
    /// part of the comparable attribute set.
    pub free_space_bytes: i64,
}

/// A virtual machine, the central unit of metering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Machine {
    pub platform_id: String,
    pub infrastructure_platform_id: String,
    pub name: String,
    pub cpu_count: i64,
    pub cpu_speed_hz: i64,
    pub maximum_memory_bytes: i64,
    pub power_state: String,
    #[serde(default)]
    pub disks: Vec<Disk>,
    #[serde(default)]
    pub nics: Vec<Nic>,
    pub remote_id: Option<String>,
    pub record_status: RecordStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Disk {
    pub platform_id: String,
    pub name: String,
    pub maximum_size_bytes: i64,
    pub storage_volume_platform_id: Option<String>,
    pub remote_id: Option<String>,
    pub record_status: RecordStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Nic {
    pub platform_id: String,
    pub name: String,
    pub mac_address: String,
    pub kind: String,
    pub remote_id: Option<String>,
    pub record_status: RecordStatus,
}

impl Infrastructure {
    /// Compare the declared comparable attributes, excluding bookkeeping
    /// fields (`remote_id`, `record_status`) and volatile measurements.
    pub fn comparable_eq(&self, other: &Infrastructure) -> bool {
        self.name == other.name
            && self.hosts == other.hosts
            && self.networks == other.networks
            && same_volumes(&self.volumes, &other.volumes)
    }
}

fn same_volumes(a: &[Volume], b: &[Volume]) -> bool {
    a.len() == b.len()
        && a.iter().zip(b).all(|(x, y)| {
            x.platform_id == y.platform_id
                && x.name == y.name
                && x.maximum_size_bytes == y.maximum_size_bytes
        })
}

impl Machine {
    pub fn comparable_eq(&self, other: &Machine) -> bool {
        self.name == other.name
            && self.cpu_count == other.cpu_count
            && self.cpu_speed_hz == other.cpu_speed_hz
            && self.maximum_memory_bytes == other.maximum_memory_bytes
            && self.power_state == other.power_state
    }

    /// Structural comparison of both child collections: size equality plus
    /// per-item attribute comparison, ignoring ordering.
    pub fn children_eq(&self, other: &Machine) -> bool {
        disks_eq(&self.disks, &other.disks) && nics_eq(&self.nics, &other.nics)
    }

    /// Merge an incomplete observation with the prior snapshot.
    ///
    /// Missing scalar fields fall back to the cached values and absent
    /// children are carried over untouched, so an incomplete observation can
    /// never be mistaken for a deletion.
    pub fn merge_incomplete(mut self, prior: &Machine) -> Machine {
        if self.name.is_empty() {
            self.name = prior.name.clone();
        }
        if self.cpu_count == 0 {
            self.cpu_count = prior.cpu_count;
        }
        if self.cpu_speed_hz == 0 {
            self.cpu_speed_hz = prior.cpu_speed_hz;
        }
        if self.maximum_memory_bytes == 0 {
            self.maximum_memory_bytes = prior.maximum_memory_bytes;
        }
        if self.power_state.is_empty() {
            self.power_state = prior.power_state.clone();
        }
        if self.disks.is_empty() {
            self.disks = prior.disks.clone();
        }
        if self.nics.is_empty() {
            self.nics = prior.nics.clone();
        }
        self.remote_id = prior.remote_id.clone();
        self.record_status = RecordStatus::Incomplete;
        self
    }

    /// Reconcile observed children against the cached ones.
    ///
    /// Children present before but absent now are appended back as
    /// `ToBeDeleted` placeholders so the deletion reaches the remote side
    /// explicitly; surviving children inherit their cached remote IDs.
    /// Returns true when anything about the child relations changed.
    pub fn reconcile_children(&mut self, cached: &Machine) -> bool {
        let mut changed = !self.children_eq(cached);

        for disk in &mut self.disks {
            if let Some(prev) = cached.disks.iter().find(|d| d.platform_id == disk.platform_id) {
                disk.remote_id = prev.remote_id.clone();
                disk.record_status = prev.record_status;
            }
        }
        for nic in &mut self.nics {
            if let Some(prev) = cached.nics.iter().find(|n| n.platform_id == nic.platform_id) {
                nic.remote_id = prev.remote_id.clone();
                nic.record_status = prev.record_status;
            }
        }

        for prev in &cached.disks {
            if prev.record_status == RecordStatus::VerifiedDelete
                || prev.record_status == RecordStatus::UnverifiedDelete
            {
                continue;
            }
            if !self.disks.iter().any(|d| d.platform_id == prev.platform_id) {
                let mut gone = prev.clone();
                gone.record_status = RecordStatus::ToBeDeleted;
                self.disks.push(gone);
                changed = true;
            }
        }
        for prev in &cached.nics {
            if prev.record_status == RecordStatus::VerifiedDelete
                || prev.record_status == RecordStatus::UnverifiedDelete
            {
                continue;
            }
            if !self.nics.iter().any(|n| n.platform_id == prev.platform_id) {
                let mut gone = prev.clone();
                gone.record_status = RecordStatus::ToBeDeleted;
                self.nics.push(gone);
                changed = true;
            }
        }

        changed
    }
}

fn disks_eq(a: &[Disk], b: &[Disk]) -> bool {
    let live = |d: &&Disk| {
        !matches!(
            d.record_status,
            RecordStatus::ToBeDeleted
                | RecordStatus::VerifiedDelete
                | RecordStatus::UnverifiedDelete
        )
    };
    let a: Vec<&Disk> = a.iter().filter(live).collect();
    let b: Vec<&Disk> = b.iter().filter(live).collect();
    a.len() == b.len()
        && a.iter().all(|x| {
            b.iter().any(|y| {
                x.platform_id == y.platform_id
                    && x.name == y.name
                    && x.maximum_size_bytes == y.maximum_size_bytes
                    && x.storage_volume_platform_id == y.storage_volume_platform_id
            })
        })
}

fn nics_eq(a: &[Nic], b: &[Nic]) -> bool {
    let live = |n: &&Nic| {
        !matches!(
            n.record_status,
            RecordStatus::ToBeDeleted
                | RecordStatus::VerifiedDelete
                | RecordStatus::UnverifiedDelete
        )
    };
    let a: Vec<&Nic> = a.iter().filter(live).collect();
    let b: Vec<&Nic> = b.iter().filter(live).collect();
    a.len() == b.len()
        && a.iter().all(|x| {
            b.iter().any(|y| {
                x.platform_id == y.platform_id
                    && x.name == y.name
                    && x.mac_address == y.mac_address
                    && x.kind == y.kind
            })
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disk(pid: &str, size: i64) -> Disk {
        Disk {
            platform_id: pid.to_string(),
            name: format!("disk-{pid}"),
            maximum_size_bytes: size,
            storage_volume_platform_id: None,
            remote_id: None,
            record_status: RecordStatus::Created,
        }
    }

    fn machine(pid: &str) -> Machine {
        Machine {
            platform_id: pid.to_string(),
            infrastructure_platform_id: "dc-1".to_string(),
            name: format!("vm-{pid}"),
            cpu_count: 2,
            cpu_speed_hz: 2_400_000_000,
            maximum_memory_bytes: 4 << 30,
            power_state: "poweredOn".to_string(),
            disks: vec![disk("d1", 10 << 30), disk("d2", 20 << 30)],
            nics: vec![],
            remote_id: None,
            record_status: RecordStatus::Created,
        }
    }

    #[test]
    fn identical_machines_compare_equal() {
        let a = machine("m1");
        let b = machine("m1");
        assert!(a.comparable_eq(&b));
        assert!(a.children_eq(&b));
    }

    #[test]
    fn cpu_change_breaks_comparable_eq() {
        let a = machine("m1");
        let mut b = machine("m1");
        b.cpu_count = 4;
        assert!(!a.comparable_eq(&b));
        assert!(a.children_eq(&b));
    }

    #[test]
    fn dropped_disk_becomes_to_be_deleted_placeholder() {
        let mut cached = machine("m1");
        cached.disks[0].remote_id = Some("900".to_string());
        cached.disks[0].record_status = RecordStatus::VerifiedCreate;

        let mut observed = machine("m1");
        observed.disks.remove(0); // d1 vanished from the observation

        let changed = observed.reconcile_children(&cached);
        assert!(changed);
        let placeholder = observed
            .disks
            .iter()
            .find(|d| d.platform_id == "d1")
            .expect("dropped disk must be re-added");
        assert_eq!(placeholder.record_status, RecordStatus::ToBeDeleted);
        assert_eq!(placeholder.remote_id.as_deref(), Some("900"));
    }

    #[test]
    fn surviving_children_inherit_remote_ids() {
        let mut cached = machine("m1");
        cached.disks[1].remote_id = Some("901".to_string());
        cached.disks[1].record_status = RecordStatus::VerifiedCreate;

        let mut observed = machine("m1");
        let changed = observed.reconcile_children(&cached);
        assert!(!changed);
        assert_eq!(observed.disks[1].remote_id.as_deref(), Some("901"));
    }

    #[test]
    fn incomplete_merge_keeps_prior_fields_and_children() {
        let prior = machine("m1");
        let partial = Machine {
            platform_id: "m1".to_string(),
            infrastructure_platform_id: "dc-1".to_string(),
            name: String::new(),
            cpu_count: 0,
            cpu_speed_hz: 0,
            maximum_memory_bytes: 0,
            power_state: String::new(),
            disks: vec![],
            nics: vec![],
            remote_id: None,
            record_status: RecordStatus::Created,
        };
        let merged = partial.merge_incomplete(&prior);
        assert_eq!(merged.name, prior.name);
        assert_eq!(merged.cpu_count, prior.cpu_count);
        assert_eq!(merged.disks.len(), 2);
        assert_eq!(merged.record_status, RecordStatus::Incomplete);
    }
}
