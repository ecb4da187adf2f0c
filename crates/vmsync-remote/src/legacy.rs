//! Legacy-generation backend.
//!
//! The old surface predates reference echoing: child records come back keyed
//! by name only, so the adapter maps names back to platform IDs using the
//! machine it just submitted. Names are unique within a machine on the
//! platforms this generation still serves.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::SecondsFormat;
use reqwest::Method;
use vmsync_model::{Infrastructure, Machine, Reading, RecordStatus};

use crate::client::RemoteClient;
use crate::error::{RemoteError, Result};
use crate::{MeterBackend, RemoteInfrastructure, RemoteMachine};

pub struct LegacyBackend {
    client: RemoteClient,
}

impl LegacyBackend {
    pub fn new(client: RemoteClient) -> Self {
        Self { client }
    }
}

fn live(status: RecordStatus) -> bool {
    !matches!(
        status,
        RecordStatus::ToBeDeleted
            | RecordStatus::VerifiedDelete
            | RecordStatus::UnverifiedDelete
            | RecordStatus::Deleted
    )
}

fn datacenter_payload(infra: &Infrastructure) -> serde_json::Value {
    serde_json::json!({
        "externalKey": infra.platform_id,
        "label": infra.name,
        "hostCount": infra.hosts.len(),
        "totalCpuCores": infra.hosts.iter().map(|h| h.cpu_cores).sum::<i64>(),
        "totalMemoryBytes": infra.hosts.iter().map(|h| h.memory_bytes).sum::<i64>(),
        "storagePools": infra.volumes.iter().map(|v| serde_json::json!({
            "label": v.name,
            "capacityBytes": v.maximum_size_bytes,
        })).collect::<Vec<_>>(),
    })
}

fn vm_payload(datacenter_remote_id: &str, machine: &Machine) -> serde_json::Value {
    serde_json::json!({
        "datacenterId": datacenter_remote_id,
        "externalKey": machine.platform_id,
        "label": machine.name,
        "vcpus": machine.cpu_count,
        "cpuHz": machine.cpu_speed_hz,
        "memoryBytes": machine.maximum_memory_bytes,
        "powerState": machine.power_state,
        "volumes": machine.disks.iter().filter(|d| live(d.record_status)).map(|d| serde_json::json!({
            "label": d.name,
            "capacityBytes": d.maximum_size_bytes,
        })).collect::<Vec<_>>(),
        "interfaces": machine.nics.iter().filter(|n| live(n.record_status)).map(|n| serde_json::json!({
            "label": n.name,
            "mac": n.mac_address,
            "networkKind": n.kind,
        })).collect::<Vec<_>>(),
    })
}

fn usage_payload(machine_remote_id: &str, readings: &[Reading]) -> serde_json::Value {
    serde_json::json!({
        "vmId": machine_remote_id,
        "records": readings.iter().map(|r| serde_json::json!({
            "periodStart": r.start_time.to_rfc3339_opts(SecondsFormat::Secs, true),
            "periodEnd": r.end_time.to_rfc3339_opts(SecondsFormat::Secs, true),
            "cpuPercent": r.cpu_usage_percent,
            "memoryBytes": r.memory_bytes,
            "diskReadKb": r.disk_metrics.iter().map(|d| d.read_kilobytes).sum::<i64>(),
            "diskWriteKb": r.disk_metrics.iter().map(|d| d.write_kilobytes).sum::<i64>(),
            "netRxKbit": r.nic_metrics.iter().map(|n| n.receive_kilobits).sum::<i64>(),
            "netTxKbit": r.nic_metrics.iter().map(|n| n.transmit_kilobits).sum::<i64>(),
        })).collect::<Vec<_>>(),
    })
}

/// Map a legacy VM response back onto platform IDs via child names.
fn parse_vm_response(value: &serde_json::Value, machine: &Machine) -> Result<RemoteMachine> {
    let remote_id = value
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| RemoteError::Api {
            status: 200,
            body: "vm response without id".to_string(),
        })?
        .to_string();

    let name_ids = |field: &str| -> HashMap<String, String> {
        value
            .get(field)
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        let label = item.get("label")?.as_str()?;
                        let id = item.get("id")?.as_str()?;
                        Some((label.to_string(), id.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default()
    };

    let volume_ids = name_ids("volumes");
    let interface_ids = name_ids("interfaces");

    let mut remote = RemoteMachine {
        remote_id,
        ..Default::default()
    };
    for disk in &machine.disks {
        if let Some(id) = volume_ids.get(&disk.name) {
            remote.disk_ids.insert(disk.platform_id.clone(), id.clone());
        }
    }
    for nic in &machine.nics {
        if let Some(id) = interface_ids.get(&nic.name) {
            remote.nic_ids.insert(nic.platform_id.clone(), id.clone());
        }
    }
    Ok(remote)
}

#[async_trait]
impl MeterBackend for LegacyBackend {
    fn name(&self) -> &str {
        "legacy"
    }

    async fn find_infrastructure(&self, platform_id: &str) -> Result<Option<RemoteInfrastructure>> {
        let path = format!("/legacy/datacenters?externalKey={platform_id}");
        let value = self.client.request(Method::GET, &path, None).await?;
        let id = value
            .as_array()
            .and_then(|items| items.first())
            .and_then(|item| item.get("id"))
            .and_then(|id| id.as_str());
        Ok(id.map(|id| RemoteInfrastructure {
            remote_id: id.to_string(),
        }))
    }

    async fn create_infrastructure(&self, infra: &Infrastructure) -> Result<RemoteInfrastructure> {
        let payload = datacenter_payload(infra);
        let value = self
            .client
            .request(Method::POST, "/legacy/datacenters", Some(&payload))
            .await?;
        let remote_id = value
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| RemoteError::Api {
                status: 200,
                body: "datacenter response without id".to_string(),
            })?;
        Ok(RemoteInfrastructure {
            remote_id: remote_id.to_string(),
        })
    }

    async fn update_infrastructure(&self, remote_id: &str, infra: &Infrastructure) -> Result<()> {
        let payload = datacenter_payload(infra);
        let path = format!("/legacy/datacenters/{remote_id}");
        self.client.request(Method::PUT, &path, Some(&payload)).await?;
        Ok(())
    }

    async fn find_machine(
        &self,
        infrastructure_remote_id: &str,
        platform_id: &str,
    ) -> Result<Option<RemoteMachine>> {
        let path = format!(
            "/legacy/vms?datacenterId={infrastructure_remote_id}&externalKey={platform_id}"
        );
        let value = self.client.request(Method::GET, &path, None).await?;
        let id = value
            .as_array()
            .and_then(|items| items.first())
            .and_then(|item| item.get("id"))
            .and_then(|id| id.as_str());
        // The legacy list endpoint returns no child detail; children become
        // resolvable after the first update response.
        Ok(id.map(|id| RemoteMachine {
            remote_id: id.to_string(),
            ..Default::default()
        }))
    }

    async fn create_machine(
        &self,
        infrastructure_remote_id: &str,
        machine: &Machine,
    ) -> Result<RemoteMachine> {
        let payload = vm_payload(infrastructure_remote_id, machine);
        let value = self
            .client
            .request(Method::POST, "/legacy/vms", Some(&payload))
            .await?;
        parse_vm_response(&value, machine)
    }

    async fn update_machine(&self, remote_id: &str, machine: &Machine) -> Result<RemoteMachine> {
        let payload = vm_payload("", machine);
        let path = format!("/legacy/vms/{remote_id}");
        let value = self.client.request(Method::PUT, &path, Some(&payload)).await?;
        parse_vm_response(&value, machine)
    }

    async fn delete_machine(&self, remote_id: &str) -> Result<()> {
        let path = format!("/legacy/vms/{remote_id}");
        self.client.request(Method::DELETE, &path, None).await?;
        Ok(())
    }

    async fn delete_disk(&self, machine_remote_id: &str, disk_remote_id: &str) -> Result<()> {
        let path = format!("/legacy/vms/{machine_remote_id}/volumes/{disk_remote_id}");
        self.client.request(Method::DELETE, &path, None).await?;
        Ok(())
    }

    async fn delete_nic(&self, machine_remote_id: &str, nic_remote_id: &str) -> Result<()> {
        let path = format!("/legacy/vms/{machine_remote_id}/interfaces/{nic_remote_id}");
        self.client.request(Method::DELETE, &path, None).await?;
        Ok(())
    }

    async fn submit_readings(&self, machine_remote_id: &str, readings: &[Reading]) -> Result<()> {
        if readings.is_empty() {
            return Ok(());
        }
        let payload = usage_payload(machine_remote_id, readings);
        self.client
            .request(Method::POST, "/legacy/usage-records", Some(&payload))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmsync_model::Disk;

    fn machine() -> Machine {
        Machine {
            platform_id: "vm-1".to_string(),
            infrastructure_platform_id: "dc-1".to_string(),
            name: "web".to_string(),
            cpu_count: 2,
            cpu_speed_hz: 2_400_000_000,
            maximum_memory_bytes: 4 << 30,
            power_state: "poweredOn".to_string(),
            disks: vec![Disk {
                platform_id: "d1".to_string(),
                name: "root".to_string(),
                maximum_size_bytes: 10 << 30,
                storage_volume_platform_id: None,
                remote_id: None,
                record_status: RecordStatus::Created,
            }],
            nics: vec![],
            remote_id: None,
            record_status: RecordStatus::Created,
        }
    }

    #[test]
    fn vm_response_children_are_rekeyed_by_platform_id() {
        let raw = serde_json::json!({
            "id": "500",
            "volumes": [{"label": "root", "id": "501"}],
        });
        let remote = parse_vm_response(&raw, &machine()).unwrap();
        assert_eq!(remote.remote_id, "500");
        assert_eq!(remote.disk_ids.get("d1").map(String::as_str), Some("501"));
    }

    #[test]
    fn usage_payload_aggregates_child_counters() {
        use chrono::Utc;
        let m = machine();
        let now = Utc::now();
        let mut reading = Reading::zeroed(&m, now - chrono::Duration::minutes(5), now);
        reading.disk_metrics[0].read_kilobytes = 40;
        reading.disk_metrics[0].write_kilobytes = 2;
        let payload = usage_payload("500", &[reading]);
        assert_eq!(payload["records"][0]["diskReadKb"], 40);
        assert_eq!(payload["records"][0]["diskWriteKb"], 2);
        assert_eq!(payload["vmId"], "500");
    }
}
