use crate::entity::Machine;
use crate::status::ReadingStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An immutable time-bounded performance sample set for one machine.
///
/// Readings are created once and later marked submitted or skipped; they are
/// never updated in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reading {
    pub machine_platform_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub cpu_usage_percent: f64,
    pub memory_bytes: i64,
    #[serde(default)]
    pub disk_metrics: Vec<DiskMetric>,
    #[serde(default)]
    pub nic_metrics: Vec<NicMetric>,
    pub status: ReadingStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskMetric {
    pub disk_platform_id: String,
    pub usage_bytes: i64,
    pub read_kilobytes: i64,
    pub write_kilobytes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NicMetric {
    pub nic_platform_id: String,
    pub receive_kilobits: i64,
    pub transmit_kilobits: i64,
}

impl Reading {
    /// Synthesize a zero-valued reading so downstream consumers always see a
    /// gap-free series per machine per timestamp, even when the metrics
    /// source returned nothing for this machine.
    pub fn zeroed(machine: &Machine, start_time: DateTime<Utc>, end_time: DateTime<Utc>) -> Self {
        Reading {
            machine_platform_id: machine.platform_id.clone(),
            start_time,
            end_time,
            cpu_usage_percent: 0.0,
            memory_bytes: 0,
            disk_metrics: machine
                .disks
                .iter()
                .map(|d| DiskMetric {
                    disk_platform_id: d.platform_id.clone(),
                    usage_bytes: 0,
                    read_kilobytes: 0,
                    write_kilobytes: 0,
                })
                .collect(),
            nic_metrics: machine
                .nics
                .iter()
                .map(|n| NicMetric {
                    nic_platform_id: n.platform_id.clone(),
                    receive_kilobits: 0,
                    transmit_kilobits: 0,
                })
                .collect(),
            status: ReadingStatus::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Disk, Nic};
    use crate::status::RecordStatus;

    #[test]
    fn zeroed_reading_covers_every_child() {
        let machine = Machine {
            platform_id: "m1".to_string(),
            infrastructure_platform_id: "dc-1".to_string(),
            name: "vm".to_string(),
            cpu_count: 1,
            cpu_speed_hz: 1,
            maximum_memory_bytes: 1,
            power_state: "poweredOn".to_string(),
            disks: vec![Disk {
                platform_id: "d1".to_string(),
                name: "disk".to_string(),
                maximum_size_bytes: 1,
                storage_volume_platform_id: None,
                remote_id: None,
                record_status: RecordStatus::VerifiedCreate,
            }],
            nics: vec![Nic {
                platform_id: "n1".to_string(),
                name: "nic".to_string(),
                mac_address: "00:00:00:00:00:01".to_string(),
                kind: "LAN".to_string(),
                remote_id: None,
                record_status: RecordStatus::VerifiedCreate,
            }],
            remote_id: None,
            record_status: RecordStatus::VerifiedCreate,
        };
        let now = Utc::now();
        let reading = Reading::zeroed(&machine, now - chrono::Duration::minutes(5), now);
        assert_eq!(reading.disk_metrics.len(), 1);
        assert_eq!(reading.nic_metrics.len(), 1);
        assert_eq!(reading.cpu_usage_percent, 0.0);
        assert_eq!(reading.status, ReadingStatus::Pending);
    }
}
