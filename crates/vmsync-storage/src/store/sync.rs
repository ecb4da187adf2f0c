//! Transactional writes used by the sync pipeline.
//!
//! An entity's status and its remote-ID map entry always change together in
//! one transaction, so a crash mid-cycle can never record a remote ID the
//! map does not know about (worst case is a duplicate create attempt next
//! cycle, resolved by check-before-create).

use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter,
    TransactionTrait,
};
use sea_orm::sea_query::OnConflict;
use vmsync_model::{Infrastructure, Machine, RecordStatus};

use crate::entities::infrastructure::{self, Column as InfraCol, Entity as InfraEntity};
use crate::entities::machine::{self, Column as MachCol, Entity as MachEntity};
use crate::entities::platform_remote_id::{self, Column as MapCol, Entity as MapEntity};
use crate::error::{Result, StorageError};
use crate::store::{now_fixed, Store};

async fn upsert_map_entry<C: ConnectionTrait>(
    conn: &C,
    platform_key: &str,
    remote_id: &str,
) -> Result<()> {
    let am = platform_remote_id::ActiveModel {
        platform_key: Set(platform_key.to_string()),
        remote_id: Set(remote_id.to_string()),
        created_at: Set(now_fixed()),
    };
    MapEntity::insert(am)
        .on_conflict(
            OnConflict::column(MapCol::PlatformKey)
                .update_column(MapCol::RemoteId)
                .to_owned(),
        )
        .exec(conn)
        .await?;
    Ok(())
}

async fn save_infrastructure<C: ConnectionTrait>(conn: &C, infra: &Infrastructure) -> Result<()> {
    let model = InfraEntity::find()
        .filter(InfraCol::PlatformId.eq(infra.platform_id.as_str()))
        .one(conn)
        .await?
        .ok_or_else(|| StorageError::NotFound {
            what: "infrastructure",
            key: infra.platform_id.clone(),
        })?;
    let mut am: infrastructure::ActiveModel = model.into();
    am.remote_id = Set(infra.remote_id.clone());
    am.record_status = Set(infra.record_status.as_str().to_string());
    am.updated_at = Set(now_fixed());
    am.update(conn).await?;
    Ok(())
}

async fn save_machine<C: ConnectionTrait>(conn: &C, mach: &Machine) -> Result<()> {
    let model = MachEntity::find()
        .filter(MachCol::PlatformId.eq(mach.platform_id.as_str()))
        .one(conn)
        .await?
        .ok_or_else(|| StorageError::NotFound {
            what: "machine",
            key: mach.platform_id.clone(),
        })?;
    let mut am: machine::ActiveModel = model.into();
    am.disks_json = Set(serde_json::to_string(&mach.disks)?);
    am.nics_json = Set(serde_json::to_string(&mach.nics)?);
    am.remote_id = Set(mach.remote_id.clone());
    am.record_status = Set(mach.record_status.as_str().to_string());
    am.updated_at = Set(now_fixed());
    am.update(conn).await?;
    Ok(())
}

impl Store {
    /// Persist a remote-acknowledged infrastructure (create or update) and
    /// its map entry atomically.
    pub async fn commit_infrastructure_sync(
        &self,
        infra: &Infrastructure,
        map_entries: &[(String, String)],
    ) -> Result<()> {
        let txn = self.db().begin().await?;
        save_infrastructure(&txn, infra).await?;
        for (key, remote_id) in map_entries {
            upsert_map_entry(&txn, key, remote_id).await?;
        }
        txn.commit().await?;
        Ok(())
    }

    /// Persist a remote-acknowledged machine along with any child map
    /// entries discovered in the same call.
    pub async fn commit_machine_sync(
        &self,
        mach: &Machine,
        map_entries: &[(String, String)],
    ) -> Result<()> {
        let txn = self.db().begin().await?;
        save_machine(&txn, mach).await?;
        for (key, remote_id) in map_entries {
            upsert_map_entry(&txn, key, remote_id).await?;
        }
        txn.commit().await?;
        Ok(())
    }

    /// Persist a verified child deletion and drop its map entry together.
    pub async fn commit_child_delete(
        &self,
        mach: &Machine,
        dropped_keys: &[String],
    ) -> Result<()> {
        let txn = self.db().begin().await?;
        save_machine(&txn, mach).await?;
        for key in dropped_keys {
            MapEntity::delete_by_id(key.as_str()).exec(&txn).await?;
        }
        txn.commit().await?;
        Ok(())
    }

    /// Persist a machine deletion outcome and drop its map entry.
    pub async fn commit_machine_delete(
        &self,
        platform_id: &str,
        status: RecordStatus,
        dropped_key: &str,
    ) -> Result<()> {
        let txn = self.db().begin().await?;
        let model = MachEntity::find()
            .filter(MachCol::PlatformId.eq(platform_id))
            .one(&txn)
            .await?
            .ok_or_else(|| StorageError::NotFound {
                what: "machine",
                key: platform_id.to_string(),
            })?;
        let mut am: machine::ActiveModel = model.into();
        am.record_status = Set(status.as_str().to_string());
        am.updated_at = Set(now_fixed());
        am.update(&txn).await?;
        MapEntity::delete_by_id(dropped_key).exec(&txn).await?;
        txn.commit().await?;
        Ok(())
    }
}
