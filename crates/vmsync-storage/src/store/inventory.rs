use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, EntityTrait, QueryFilter,
};
use vmsync_model::{Disk, Host, Infrastructure, Machine, Network, Nic, RecordStatus, Volume};

use crate::entities::infrastructure::{
    self, Column as InfraCol, Entity as InfraEntity,
};
use crate::entities::machine::{self, Column as MachCol, Entity as MachEntity};
use crate::error::{Result, StorageError};
use crate::store::{now_fixed, Store};

fn parse_status(id: &str, value: &str) -> Result<RecordStatus> {
    RecordStatus::parse(value).ok_or_else(|| StorageError::UnknownStatus {
        field: "record_status",
        id: id.to_string(),
        value: value.to_string(),
    })
}

fn model_to_infrastructure(m: infrastructure::Model) -> Result<Infrastructure> {
    let record_status = parse_status(&m.id, &m.record_status)?;
    let hosts: Vec<Host> = serde_json::from_str(&m.hosts_json)?;
    let networks: Vec<Network> = serde_json::from_str(&m.networks_json)?;
    let volumes: Vec<Volume> = serde_json::from_str(&m.volumes_json)?;
    Ok(Infrastructure {
        platform_id: m.platform_id,
        name: m.name,
        hosts,
        networks,
        volumes,
        remote_id: m.remote_id,
        record_status,
    })
}

fn infrastructure_to_active(
    infra: &Infrastructure,
    id: String,
) -> Result<infrastructure::ActiveModel> {
    let now = now_fixed();
    Ok(infrastructure::ActiveModel {
        id: Set(id),
        platform_id: Set(infra.platform_id.clone()),
        name: Set(infra.name.clone()),
        hosts_json: Set(serde_json::to_string(&infra.hosts)?),
        networks_json: Set(serde_json::to_string(&infra.networks)?),
        volumes_json: Set(serde_json::to_string(&infra.volumes)?),
        remote_id: Set(infra.remote_id.clone()),
        record_status: Set(infra.record_status.as_str().to_string()),
        created_at: Set(now),
        updated_at: Set(now),
    })
}

fn model_to_machine(m: machine::Model) -> Result<Machine> {
    let record_status = parse_status(&m.id, &m.record_status)?;
    let disks: Vec<Disk> = serde_json::from_str(&m.disks_json)?;
    let nics: Vec<Nic> = serde_json::from_str(&m.nics_json)?;
    Ok(Machine {
        platform_id: m.platform_id,
        infrastructure_platform_id: m.infrastructure_platform_id,
        name: m.name,
        cpu_count: m.cpu_count,
        cpu_speed_hz: m.cpu_speed_hz,
        maximum_memory_bytes: m.maximum_memory_bytes,
        power_state: m.power_state,
        disks,
        nics,
        remote_id: m.remote_id,
        record_status,
    })
}

fn machine_to_active(mach: &Machine, id: String) -> Result<machine::ActiveModel> {
    let now = now_fixed();
    Ok(machine::ActiveModel {
        id: Set(id),
        platform_id: Set(mach.platform_id.clone()),
        infrastructure_platform_id: Set(mach.infrastructure_platform_id.clone()),
        name: Set(mach.name.clone()),
        cpu_count: Set(mach.cpu_count),
        cpu_speed_hz: Set(mach.cpu_speed_hz),
        maximum_memory_bytes: Set(mach.maximum_memory_bytes),
        power_state: Set(mach.power_state.clone()),
        disks_json: Set(serde_json::to_string(&mach.disks)?),
        nics_json: Set(serde_json::to_string(&mach.nics)?),
        remote_id: Set(mach.remote_id.clone()),
        record_status: Set(mach.record_status.as_str().to_string()),
        created_at: Set(now),
        updated_at: Set(now),
    })
}

impl Store {
    // ---- infrastructures ----

    pub async fn insert_infrastructures(&self, rows: &[Infrastructure]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut models = Vec::with_capacity(rows.len());
        for row in rows {
            models.push(infrastructure_to_active(row, vmsync_common::id::next_id())?);
        }
        InfraEntity::insert_many(models).exec(self.db()).await?;
        Ok(())
    }

    pub async fn update_infrastructure(&self, infra: &Infrastructure) -> Result<()> {
        let model = InfraEntity::find()
            .filter(InfraCol::PlatformId.eq(infra.platform_id.as_str()))
            .one(self.db())
            .await?
            .ok_or_else(|| StorageError::NotFound {
                what: "infrastructure",
                key: infra.platform_id.clone(),
            })?;
        let mut am: infrastructure::ActiveModel = model.into();
        am.name = Set(infra.name.clone());
        am.hosts_json = Set(serde_json::to_string(&infra.hosts)?);
        am.networks_json = Set(serde_json::to_string(&infra.networks)?);
        am.volumes_json = Set(serde_json::to_string(&infra.volumes)?);
        am.remote_id = Set(infra.remote_id.clone());
        am.record_status = Set(infra.record_status.as_str().to_string());
        am.updated_at = Set(now_fixed());
        am.update(self.db()).await?;
        Ok(())
    }

    pub async fn get_infrastructure(&self, platform_id: &str) -> Result<Option<Infrastructure>> {
        let model = InfraEntity::find()
            .filter(InfraCol::PlatformId.eq(platform_id))
            .one(self.db())
            .await?;
        model.map(model_to_infrastructure).transpose()
    }

    pub async fn list_infrastructures(
        &self,
        statuses: &[RecordStatus],
    ) -> Result<Vec<Infrastructure>> {
        let mut q = InfraEntity::find();
        if !statuses.is_empty() {
            q = q.filter(
                InfraCol::RecordStatus.is_in(statuses.iter().map(RecordStatus::as_str)),
            );
        }
        let models = q.all(self.db()).await?;
        models.into_iter().map(model_to_infrastructure).collect()
    }

    /// Latest non-deleted snapshot, the cache pre-population set.
    pub async fn list_live_infrastructures(&self) -> Result<Vec<Infrastructure>> {
        let models = InfraEntity::find()
            .filter(InfraCol::RecordStatus.ne(RecordStatus::Deleted.as_str()))
            .all(self.db())
            .await?;
        models.into_iter().map(model_to_infrastructure).collect()
    }

    pub async fn set_infrastructure_status(
        &self,
        platform_id: &str,
        status: RecordStatus,
    ) -> Result<()> {
        let model = InfraEntity::find()
            .filter(InfraCol::PlatformId.eq(platform_id))
            .one(self.db())
            .await?
            .ok_or_else(|| StorageError::NotFound {
                what: "infrastructure",
                key: platform_id.to_string(),
            })?;
        let mut am: infrastructure::ActiveModel = model.into();
        am.record_status = Set(status.as_str().to_string());
        am.updated_at = Set(now_fixed());
        am.update(self.db()).await?;
        Ok(())
    }

    // ---- machines ----

    pub async fn insert_machines(&self, rows: &[Machine]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut models = Vec::with_capacity(rows.len());
        for row in rows {
            models.push(machine_to_active(row, vmsync_common::id::next_id())?);
        }
        MachEntity::insert_many(models).exec(self.db()).await?;
        Ok(())
    }

    pub async fn update_machine(&self, mach: &Machine) -> Result<()> {
        let model = MachEntity::find()
            .filter(MachCol::PlatformId.eq(mach.platform_id.as_str()))
            .one(self.db())
            .await?
            .ok_or_else(|| StorageError::NotFound {
                what: "machine",
                key: mach.platform_id.clone(),
            })?;
        let mut am: machine::ActiveModel = model.into();
        am.infrastructure_platform_id = Set(mach.infrastructure_platform_id.clone());
        am.name = Set(mach.name.clone());
        am.cpu_count = Set(mach.cpu_count);
        am.cpu_speed_hz = Set(mach.cpu_speed_hz);
        am.maximum_memory_bytes = Set(mach.maximum_memory_bytes);
        am.power_state = Set(mach.power_state.clone());
        am.disks_json = Set(serde_json::to_string(&mach.disks)?);
        am.nics_json = Set(serde_json::to_string(&mach.nics)?);
        am.remote_id = Set(mach.remote_id.clone());
        am.record_status = Set(mach.record_status.as_str().to_string());
        am.updated_at = Set(now_fixed());
        am.update(self.db()).await?;
        Ok(())
    }

    pub async fn get_machine(&self, platform_id: &str) -> Result<Option<Machine>> {
        let model = MachEntity::find()
            .filter(MachCol::PlatformId.eq(platform_id))
            .one(self.db())
            .await?;
        model.map(model_to_machine).transpose()
    }

    pub async fn list_machines(&self, statuses: &[RecordStatus]) -> Result<Vec<Machine>> {
        let mut q = MachEntity::find();
        if !statuses.is_empty() {
            q = q.filter(MachCol::RecordStatus.is_in(statuses.iter().map(RecordStatus::as_str)));
        }
        let models = q.all(self.db()).await?;
        models.into_iter().map(model_to_machine).collect()
    }

    pub async fn list_live_machines(&self) -> Result<Vec<Machine>> {
        let models = MachEntity::find()
            .filter(MachCol::RecordStatus.ne(RecordStatus::Deleted.as_str()))
            .all(self.db())
            .await?;
        models.into_iter().map(model_to_machine).collect()
    }

    pub async fn set_machine_status(
        &self,
        platform_id: &str,
        status: RecordStatus,
    ) -> Result<()> {
        let model = MachEntity::find()
            .filter(MachCol::PlatformId.eq(platform_id))
            .one(self.db())
            .await?
            .ok_or_else(|| StorageError::NotFound {
                what: "machine",
                key: platform_id.to_string(),
            })?;
        let mut am: machine::ActiveModel = model.into();
        am.record_status = Set(status.as_str().to_string());
        am.updated_at = Set(now_fixed());
        am.update(self.db()).await?;
        Ok(())
    }
}
