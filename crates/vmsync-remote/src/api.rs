//! Current-generation (`/v2`) backend.
//!
//! The v2 surface accepts a `reference` field on every record, echoed back
//! in responses, so child remote IDs can be matched to platform IDs
//! directly.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::SecondsFormat;
use reqwest::Method;
use vmsync_model::{Infrastructure, Machine, Reading, RecordStatus};

use crate::client::RemoteClient;
use crate::error::{RemoteError, Result};
use crate::{MeterBackend, RemoteInfrastructure, RemoteMachine};

pub struct ApiBackend {
    client: RemoteClient,
}

impl ApiBackend {
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

fn infrastructure_payload(infra: &Infrastructure) -> serde_json::Value {
    serde_json::json!({
        "reference": infra.platform_id,
        "name": infra.name,
        "hosts": infra.hosts.iter().map(|h| serde_json::json!({
            "reference": h.platform_id,
            "cpu_cores": h.cpu_cores,
            "cpu_speed_hz": h.cpu_speed_hz,
            "memory_bytes": h.memory_bytes,
        })).collect::<Vec<_>>(),
        "networks": infra.networks.iter().map(|n| serde_json::json!({
            "reference": n.platform_id,
            "name": n.name,
            "kind": n.kind,
        })).collect::<Vec<_>>(),
        "volumes": infra.volumes.iter().map(|v| serde_json::json!({
            "reference": v.platform_id,
            "name": v.name,
            "maximum_size_bytes": v.maximum_size_bytes,
            "free_space_bytes": v.free_space_bytes,
        })).collect::<Vec<_>>(),
    })
}

fn machine_payload(infrastructure_remote_id: &str, machine: &Machine) -> serde_json::Value {
    serde_json::json!({
        "infrastructure_id": infrastructure_remote_id,
        "reference": machine.platform_id,
        "name": machine.name,
        "cpu_count": machine.cpu_count,
        "cpu_speed_hz": machine.cpu_speed_hz,
        "maximum_memory_bytes": machine.maximum_memory_bytes,
        "power_state": machine.power_state,
        "disks": machine.disks.iter().filter(|d| live(d.record_status)).map(|d| serde_json::json!({
            "reference": d.platform_id,
            "name": d.name,
            "maximum_size_bytes": d.maximum_size_bytes,
            "volume_reference": d.storage_volume_platform_id,
        })).collect::<Vec<_>>(),
        "nics": machine.nics.iter().filter(|n| live(n.record_status)).map(|n| serde_json::json!({
            "reference": n.platform_id,
            "name": n.name,
            "mac_address": n.mac_address,
            "kind": n.kind,
        })).collect::<Vec<_>>(),
    })
}

fn readings_payload(readings: &[Reading]) -> serde_json::Value {
    serde_json::json!({
        "readings": readings.iter().map(|r| serde_json::json!({
            "start_time": r.start_time.to_rfc3339_opts(SecondsFormat::Secs, true),
            "end_time": r.end_time.to_rfc3339_opts(SecondsFormat::Secs, true),
            "cpu_usage_percent": r.cpu_usage_percent,
            "memory_bytes": r.memory_bytes,
            "disks": r.disk_metrics.iter().map(|d| serde_json::json!({
                "reference": d.disk_platform_id,
                "usage_bytes": d.usage_bytes,
                "read_kilobytes": d.read_kilobytes,
                "write_kilobytes": d.write_kilobytes,
            })).collect::<Vec<_>>(),
            "nics": r.nic_metrics.iter().map(|n| serde_json::json!({
                "reference": n.nic_platform_id,
                "receive_kilobits": n.receive_kilobits,
                "transmit_kilobits": n.transmit_kilobits,
            })).collect::<Vec<_>>(),
        })).collect::<Vec<_>>(),
    })
}

fn parse_machine_response(value: &serde_json::Value) -> Result<RemoteMachine> {
    let remote_id = value
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| RemoteError::Api {
            status: 200,
            body: "machine response without id".to_string(),
        })?
        .to_string();

    let collect_ids = |field: &str| -> HashMap<String, String> {
        value
            .get(field)
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        let reference = item.get("reference")?.as_str()?;
                        let id = item.get("id")?.as_str()?;
                        Some((reference.to_string(), id.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default()
    };

    Ok(RemoteMachine {
        remote_id,
        disk_ids: collect_ids("disks"),
        nic_ids: collect_ids("nics"),
    })
}

#[async_trait]
impl MeterBackend for ApiBackend {
    fn name(&self) -> &str {
        "api-v2"
    }

    async fn find_infrastructure(&self, platform_id: &str) -> Result<Option<RemoteInfrastructure>> {
        let path = format!("/v2/infrastructures?reference={platform_id}");
        let value = self.client.request(Method::GET, &path, None).await?;
        let id = value
            .get("items")
            .and_then(|v| v.as_array())
            .and_then(|items| items.first())
            .and_then(|item| item.get("id"))
            .and_then(|id| id.as_str());
        Ok(id.map(|id| RemoteInfrastructure {
            remote_id: id.to_string(),
        }))
    }

    async fn create_infrastructure(&self, infra: &Infrastructure) -> Result<RemoteInfrastructure> {
        let payload = infrastructure_payload(infra);
        let value = self
            .client
            .request(Method::POST, "/v2/infrastructures", Some(&payload))
            .await?;
        let remote_id = value
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| RemoteError::Api {
                status: 200,
                body: "infrastructure response without id".to_string(),
            })?;
        Ok(RemoteInfrastructure {
            remote_id: remote_id.to_string(),
        })
    }

    async fn update_infrastructure(&self, remote_id: &str, infra: &Infrastructure) -> Result<()> {
        let payload = infrastructure_payload(infra);
        let path = format!("/v2/infrastructures/{remote_id}");
        self.client.request(Method::PUT, &path, Some(&payload)).await?;
        Ok(())
    }

    async fn find_machine(
        &self,
        infrastructure_remote_id: &str,
        platform_id: &str,
    ) -> Result<Option<RemoteMachine>> {
        let path = format!(
            "/v2/machines?infrastructure_id={infrastructure_remote_id}&reference={platform_id}"
        );
        let value = self.client.request(Method::GET, &path, None).await?;
        match value
            .get("items")
            .and_then(|v| v.as_array())
            .and_then(|items| items.first())
        {
            Some(item) => Ok(Some(parse_machine_response(item)?)),
            None => Ok(None),
        }
    }

    async fn create_machine(
        &self,
        infrastructure_remote_id: &str,
        machine: &Machine,
    ) -> Result<RemoteMachine> {
        let payload = machine_payload(infrastructure_remote_id, machine);
        let value = self
            .client
            .request(Method::POST, "/v2/machines", Some(&payload))
            .await?;
        parse_machine_response(&value)
    }

    async fn update_machine(&self, remote_id: &str, machine: &Machine) -> Result<RemoteMachine> {
        let payload = machine_payload("", machine);
        let path = format!("/v2/machines/{remote_id}");
        let value = self.client.request(Method::PUT, &path, Some(&payload)).await?;
        parse_machine_response(&value)
    }

    async fn delete_machine(&self, remote_id: &str) -> Result<()> {
        let path = format!("/v2/machines/{remote_id}");
        self.client.request(Method::DELETE, &path, None).await?;
        Ok(())
    }

    async fn delete_disk(&self, machine_remote_id: &str, disk_remote_id: &str) -> Result<()> {
        let path = format!("/v2/machines/{machine_remote_id}/disks/{disk_remote_id}");
        self.client.request(Method::DELETE, &path, None).await?;
        Ok(())
    }

    async fn delete_nic(&self, machine_remote_id: &str, nic_remote_id: &str) -> Result<()> {
        let path = format!("/v2/machines/{machine_remote_id}/nics/{nic_remote_id}");
        self.client.request(Method::DELETE, &path, None).await?;
        Ok(())
    }

    async fn submit_readings(&self, machine_remote_id: &str, readings: &[Reading]) -> Result<()> {
        if readings.is_empty() {
            return Ok(());
        }
        let payload = readings_payload(readings);
        let path = format!("/v2/machines/{machine_remote_id}/readings");
        self.client.request(Method::POST, &path, Some(&payload)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmsync_model::{Disk, Nic};

    fn machine() -> Machine {
        Machine {
            platform_id: "vm-1".to_string(),
            infrastructure_platform_id: "dc-1".to_string(),
            name: "web".to_string(),
            cpu_count: 2,
            cpu_speed_hz: 2_400_000_000,
            maximum_memory_bytes: 4 << 30,
            power_state: "poweredOn".to_string(),
            disks: vec![
                Disk {
                    platform_id: "d1".to_string(),
                    name: "root".to_string(),
                    maximum_size_bytes: 10 << 30,
                    storage_volume_platform_id: Some("vol1".to_string()),
                    remote_id: None,
                    record_status: RecordStatus::Created,
                },
                Disk {
                    platform_id: "d2".to_string(),
                    name: "scratch".to_string(),
                    maximum_size_bytes: 20 << 30,
                    storage_volume_platform_id: None,
                    remote_id: Some("301".to_string()),
                    record_status: RecordStatus::ToBeDeleted,
                },
            ],
            nics: vec![Nic {
                platform_id: "n1".to_string(),
                name: "eth0".to_string(),
                mac_address: "00:50:56:aa:bb:cc".to_string(),
                kind: "LAN".to_string(),
                remote_id: None,
                record_status: RecordStatus::Created,
            }],
            remote_id: None,
            record_status: RecordStatus::Created,
        }
    }

    #[test]
    fn machine_payload_excludes_children_marked_for_deletion() {
        let payload = machine_payload("100", &machine());
        let disks = payload["disks"].as_array().unwrap();
        assert_eq!(disks.len(), 1, "ToBeDeleted disk must not be re-created");
        assert_eq!(disks[0]["reference"], "d1");
        assert_eq!(payload["infrastructure_id"], "100");
        assert_eq!(payload["reference"], "vm-1");
    }

    #[test]
    fn machine_response_maps_children_by_reference() {
        let raw = serde_json::json!({
            "id": "200",
            "disks": [{"reference": "d1", "id": "300"}],
            "nics": [{"reference": "n1", "id": "400"}],
        });
        let remote = parse_machine_response(&raw).unwrap();
        assert_eq!(remote.remote_id, "200");
        assert_eq!(remote.disk_ids.get("d1").map(String::as_str), Some("300"));
        assert_eq!(remote.nic_ids.get("n1").map(String::as_str), Some("400"));
    }

    #[test]
    fn machine_response_without_id_is_an_api_error() {
        let raw = serde_json::json!({"disks": []});
        assert!(matches!(
            parse_machine_response(&raw),
            Err(RemoteError::Api { .. })
        ));
    }
}
