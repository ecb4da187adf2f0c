//! HTTP implementation of [`Collector`] against the collector sidecar API.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Client;
use serde::Deserialize;
use vmsync_model::{
    Disk, DiskMetric, Host, Infrastructure, Machine, Network, Nic, NicMetric, Reading,
    ReadingStatus, RecordStatus, Volume,
};

use crate::error::{CollectorError, Result};
use crate::{Collector, EventKind, InventoryObservation, MachineEvent, ObservedMachine};

pub struct HttpCollector {
    name: String,
    base_url: String,
    client: Client,
}

impl HttpCollector {
    pub fn new(name: &str, base_url: &str, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .use_rustls_tls()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            name: name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn check(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CollectorError::Http {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl Collector for HttpCollector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn observe_inventory(&self) -> Result<InventoryObservation> {
        let url = format!("{}/api/inventory", self.base_url);
        let response = self.client.get(&url).send().await?;
        let body = self.check(response).await?.text().await?;
        let dto: InventoryDto = serde_json::from_str(&body)?;
        let observation = map_inventory(dto)?;
        tracing::debug!(
            collector = %self.name,
            infrastructures = observation.infrastructures.len(),
            machines = observation.machines.len(),
            "inventory observed"
        );
        Ok(observation)
    }

    async fn sample_metrics(
        &self,
        machine_platform_ids: &[String],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Reading>> {
        if machine_platform_ids.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/api/metrics/query", self.base_url);
        let payload = serde_json::json!({
            "machine_ids": machine_platform_ids,
            "from": from.to_rfc3339_opts(SecondsFormat::Secs, true),
            "to": to.to_rfc3339_opts(SecondsFormat::Secs, true),
        });
        let response = self.client.post(&url).json(&payload).send().await?;
        let body = self.check(response).await?.text().await?;
        let dtos: Vec<SampleDto> = serde_json::from_str(&body)?;
        Ok(dtos.into_iter().map(map_sample).collect())
    }

    async fn events_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<MachineEvent>> {
        let url = format!("{}/api/events", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("from", from.to_rfc3339_opts(SecondsFormat::Secs, true)),
                ("to", to.to_rfc3339_opts(SecondsFormat::Secs, true)),
            ])
            .send()
            .await?;
        let body = self.check(response).await?.text().await?;
        let dtos: Vec<EventDto> = serde_json::from_str(&body)?;
        Ok(dtos.into_iter().map(map_event).collect())
    }
}

#[derive(Debug, Deserialize)]
struct InventoryDto {
    #[serde(default)]
    infrastructures: Vec<InfrastructureDto>,
    #[serde(default)]
    machines: Vec<MachineDto>,
}

#[derive(Debug, Deserialize)]
struct InfrastructureDto {
    id: String,
    name: String,
    #[serde(default)]
    hosts: Vec<HostDto>,
    #[serde(default)]
    networks: Vec<NetworkDto>,
    #[serde(default)]
    volumes: Vec<VolumeDto>,
}

#[derive(Debug, Deserialize)]
struct HostDto {
    id: String,
    cpu_cores: i64,
    cpu_speed_hz: i64,
    memory_bytes: i64,
}

#[derive(Debug, Deserialize)]
struct NetworkDto {
    id: String,
    name: String,
    #[serde(default)]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct VolumeDto {
    id: String,
    name: String,
    maximum_size_bytes: i64,
    #[serde(default)]
    free_space_bytes: i64,
}

#[derive(Debug, Deserialize)]
struct MachineDto {
    id: String,
    infrastructure_id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    cpu_count: i64,
    #[serde(default)]
    cpu_speed_hz: i64,
    #[serde(default)]
    maximum_memory_bytes: i64,
    #[serde(default)]
    power_state: String,
    #[serde(default)]
    disks: Vec<DiskDto>,
    #[serde(default)]
    nics: Vec<NicDto>,
    /// Set by the collector when the platform API could not be fully read
    /// for this machine during the sweep.
    #[serde(default)]
    partial: bool,
}

#[derive(Debug, Deserialize)]
struct DiskDto {
    id: String,
    name: String,
    maximum_size_bytes: i64,
    #[serde(default)]
    volume_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NicDto {
    id: String,
    name: String,
    #[serde(default)]
    mac_address: String,
    #[serde(default)]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct EventDto {
    machine_platform_id: String,
    kind: EventKind,
    occurred_at: DateTime<Utc>,
    /// The sidecar embeds the machine snapshot on creation events.
    #[serde(default)]
    machine: Option<MachineDto>,
}

#[derive(Debug, Deserialize)]
struct SampleDto {
    machine_id: String,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    #[serde(default)]
    cpu_usage_percent: f64,
    #[serde(default)]
    memory_bytes: i64,
    #[serde(default)]
    disks: Vec<DiskSampleDto>,
    #[serde(default)]
    nics: Vec<NicSampleDto>,
}

#[derive(Debug, Deserialize)]
struct DiskSampleDto {
    disk_id: String,
    #[serde(default)]
    usage_bytes: i64,
    #[serde(default)]
    read_kilobytes: i64,
    #[serde(default)]
    write_kilobytes: i64,
}

#[derive(Debug, Deserialize)]
struct NicSampleDto {
    nic_id: String,
    #[serde(default)]
    receive_kilobits: i64,
    #[serde(default)]
    transmit_kilobits: i64,
}

fn map_inventory(dto: InventoryDto) -> Result<InventoryObservation> {
    let mut observation = InventoryObservation::default();
    for infra in dto.infrastructures {
        if infra.id.is_empty() {
            return Err(CollectorError::MissingField("infrastructure id"));
        }
        observation.infrastructures.push(Infrastructure {
            platform_id: infra.id,
            name: infra.name,
            hosts: infra
                .hosts
                .into_iter()
                .map(|h| Host {
                    platform_id: h.id,
                    cpu_cores: h.cpu_cores,
                    cpu_speed_hz: h.cpu_speed_hz,
                    memory_bytes: h.memory_bytes,
                })
                .collect(),
            networks: infra
                .networks
                .into_iter()
                .map(|n| Network {
                    platform_id: n.id,
                    name: n.name,
                    kind: n.kind,
                })
                .collect(),
            volumes: infra
                .volumes
                .into_iter()
                .map(|v| Volume {
                    platform_id: v.id,
                    name: v.name,
                    maximum_size_bytes: v.maximum_size_bytes,
                    free_space_bytes: v.free_space_bytes,
                })
                .collect(),
            remote_id: None,
            record_status: RecordStatus::Created,
        });
    }
    for machine in dto.machines {
        if machine.id.is_empty() {
            return Err(CollectorError::MissingField("machine id"));
        }
        if machine.infrastructure_id.is_empty() {
            return Err(CollectorError::MissingField("machine infrastructure id"));
        }
        let incomplete = machine.partial;
        observation.machines.push(ObservedMachine {
            machine: map_machine(machine),
            incomplete,
        });
    }
    Ok(observation)
}

fn map_machine(dto: MachineDto) -> Machine {
    Machine {
        platform_id: dto.id,
        infrastructure_platform_id: dto.infrastructure_id,
        name: dto.name,
        cpu_count: dto.cpu_count,
        cpu_speed_hz: dto.cpu_speed_hz,
        maximum_memory_bytes: dto.maximum_memory_bytes,
        power_state: dto.power_state,
        disks: dto
            .disks
            .into_iter()
            .map(|d| Disk {
                platform_id: d.id,
                name: d.name,
                maximum_size_bytes: d.maximum_size_bytes,
                storage_volume_platform_id: d.volume_id,
                remote_id: None,
                record_status: RecordStatus::Created,
            })
            .collect(),
        nics: dto
            .nics
            .into_iter()
            .map(|n| Nic {
                platform_id: n.id,
                name: n.name,
                mac_address: n.mac_address,
                kind: n.kind,
                remote_id: None,
                record_status: RecordStatus::Created,
            })
            .collect(),
        remote_id: None,
        record_status: RecordStatus::Created,
    }
}

fn map_event(dto: EventDto) -> MachineEvent {
    MachineEvent {
        machine_platform_id: dto.machine_platform_id,
        kind: dto.kind,
        occurred_at: dto.occurred_at,
        machine: dto.machine.map(map_machine),
    }
}

fn map_sample(dto: SampleDto) -> Reading {
    Reading {
        machine_platform_id: dto.machine_id,
        start_time: dto.start_time,
        end_time: dto.end_time,
        cpu_usage_percent: dto.cpu_usage_percent,
        memory_bytes: dto.memory_bytes,
        disk_metrics: dto
            .disks
            .into_iter()
            .map(|d| DiskMetric {
                disk_platform_id: d.disk_id,
                usage_bytes: d.usage_bytes,
                read_kilobytes: d.read_kilobytes,
                write_kilobytes: d.write_kilobytes,
            })
            .collect(),
        nic_metrics: dto
            .nics
            .into_iter()
            .map(|n| NicMetric {
                nic_platform_id: n.nic_id,
                receive_kilobits: n.receive_kilobits,
                transmit_kilobits: n.transmit_kilobits,
            })
            .collect(),
        status: ReadingStatus::Pending,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inventory_payload_maps_to_entities() {
        let raw = r#"{
            "infrastructures": [{
                "id": "dc-1",
                "name": "east",
                "hosts": [{"id": "h1", "cpu_cores": 16, "cpu_speed_hz": 2400000000, "memory_bytes": 68719476736}],
                "networks": [{"id": "net1", "name": "lan0", "kind": "LAN"}],
                "volumes": [{"id": "vol1", "name": "ssd0", "maximum_size_bytes": 1099511627776, "free_space_bytes": 549755813888}]
            }],
            "machines": [{
                "id": "vm-1",
                "infrastructure_id": "dc-1",
                "name": "web",
                "cpu_count": 2,
                "cpu_speed_hz": 2400000000,
                "maximum_memory_bytes": 4294967296,
                "power_state": "poweredOn",
                "disks": [{"id": "disk-1", "name": "root", "maximum_size_bytes": 10737418240, "volume_id": "vol1"}],
                "nics": [{"id": "nic-1", "name": "eth0", "mac_address": "00:50:56:aa:bb:cc", "kind": "LAN"}]
            }]
        }"#;
        let dto: InventoryDto = serde_json::from_str(raw).unwrap();
        let observation = map_inventory(dto).unwrap();

        assert_eq!(observation.infrastructures.len(), 1);
        let infra = &observation.infrastructures[0];
        assert_eq!(infra.platform_id, "dc-1");
        assert_eq!(infra.hosts[0].cpu_cores, 16);
        assert_eq!(infra.volumes[0].free_space_bytes, 549755813888);

        assert_eq!(observation.machines.len(), 1);
        let observed = &observation.machines[0];
        assert!(!observed.incomplete);
        assert_eq!(observed.machine.platform_id, "vm-1");
        assert_eq!(observed.machine.disks[0].storage_volume_platform_id.as_deref(), Some("vol1"));
        assert_eq!(observed.machine.record_status, RecordStatus::Created);
    }

    #[test]
    fn partial_machine_is_flagged_incomplete() {
        let raw = r#"{
            "machines": [{"id": "vm-2", "infrastructure_id": "dc-1", "partial": true}]
        }"#;
        let dto: InventoryDto = serde_json::from_str(raw).unwrap();
        let observation = map_inventory(dto).unwrap();
        assert!(observation.machines[0].incomplete);
        assert_eq!(observation.machines[0].machine.cpu_count, 0);
    }

    #[test]
    fn missing_machine_id_is_rejected() {
        let raw = r#"{"machines": [{"id": "", "infrastructure_id": "dc-1"}]}"#;
        let dto: InventoryDto = serde_json::from_str(raw).unwrap();
        assert!(matches!(
            map_inventory(dto),
            Err(CollectorError::MissingField("machine id"))
        ));
    }

    #[test]
    fn sample_payload_maps_to_reading() {
        let raw = r#"[{
            "machine_id": "vm-1",
            "start_time": "2026-08-30T10:00:00Z",
            "end_time": "2026-08-30T10:05:00Z",
            "cpu_usage_percent": 12.5,
            "memory_bytes": 2147483648,
            "disks": [{"disk_id": "disk-1", "usage_bytes": 5368709120, "read_kilobytes": 42, "write_kilobytes": 7}],
            "nics": [{"nic_id": "nic-1", "receive_kilobits": 128, "transmit_kilobits": 256}]
        }]"#;
        let dtos: Vec<SampleDto> = serde_json::from_str(raw).unwrap();
        let reading = map_sample(dtos.into_iter().next().unwrap());
        assert_eq!(reading.machine_platform_id, "vm-1");
        assert_eq!(reading.cpu_usage_percent, 12.5);
        assert_eq!(reading.disk_metrics[0].read_kilobytes, 42);
        assert_eq!(reading.nic_metrics[0].transmit_kilobits, 256);
        assert_eq!(reading.status, ReadingStatus::Pending);
    }

    #[test]
    fn event_payload_maps_without_machine() {
        let raw = r#"[{"machine_platform_id": "vm-1", "kind": "powered_off", "occurred_at": "2026-08-30T10:00:00Z"}]"#;
        let dtos: Vec<EventDto> = serde_json::from_str(raw).unwrap();
        let event = map_event(dtos.into_iter().next().unwrap());
        assert_eq!(event.kind, EventKind::PoweredOff);
        assert!(event.machine.is_none());
    }

    #[test]
    fn creation_event_carries_the_machine_snapshot() {
        let raw = r#"[{
            "machine_platform_id": "vm-9",
            "kind": "created",
            "occurred_at": "2026-08-30T10:00:00Z",
            "machine": {
                "id": "vm-9",
                "infrastructure_id": "dc-1",
                "name": "batch",
                "cpu_count": 4,
                "disks": [{"id": "disk-9", "name": "root", "maximum_size_bytes": 10737418240}]
            }
        }]"#;
        let dtos: Vec<EventDto> = serde_json::from_str(raw).unwrap();
        let event = map_event(dtos.into_iter().next().unwrap());
        assert_eq!(event.kind, EventKind::Created);
        let machine = event.machine.unwrap();
        assert_eq!(machine.platform_id, "vm-9");
        assert_eq!(machine.cpu_count, 4);
        assert_eq!(machine.record_status, RecordStatus::Created);
    }
}
