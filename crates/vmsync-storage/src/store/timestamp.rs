use chrono::{DateTime, Duration, Utc};
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, ConnectionTrait, DbBackend, EntityTrait,
    QueryFilter, QueryOrder, Statement,
};
use vmsync_model::TimestampStatus;

use crate::entities::inventoried_timestamp::{self, Column as TsCol, Entity as TsEntity};
use crate::error::{Result, StorageError};
use crate::store::{now_fixed, to_fixed, to_utc, Store};

/// One observation cycle as a claimable unit of metering work.
#[derive(Debug, Clone)]
pub struct InventoriedTimestampRow {
    pub id: String,
    pub inventory_at: DateTime<Utc>,
    pub status: TimestampStatus,
    pub locked: bool,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
}

fn model_to_row(m: inventoried_timestamp::Model) -> Result<InventoriedTimestampRow> {
    let status = TimestampStatus::parse(&m.record_status).ok_or_else(|| {
        StorageError::UnknownStatus {
            field: "record_status",
            id: m.id.clone(),
            value: m.record_status.clone(),
        }
    })?;
    Ok(InventoriedTimestampRow {
        id: m.id,
        inventory_at: to_utc(m.inventory_at),
        status,
        locked: m.locked,
        locked_by: m.locked_by,
        locked_at: m.locked_at.map(to_utc),
    })
}

impl Store {
    /// Record an observation cycle. Idempotent per instant: a second call
    /// for the same `inventory_at` returns the existing row's ID so gap
    /// backfill cannot double-count a window.
    pub async fn record_timestamp(
        &self,
        inventory_at: DateTime<Utc>,
        status: TimestampStatus,
        retention: Duration,
    ) -> Result<String> {
        if let Some(existing) = TsEntity::find()
            .filter(TsCol::InventoryAt.eq(to_fixed(inventory_at)))
            .one(self.db())
            .await?
        {
            return Ok(existing.id);
        }
        let now = now_fixed();
        let id = vmsync_common::id::next_id();
        let am = inventoried_timestamp::ActiveModel {
            id: Set(id.clone()),
            inventory_at: Set(to_fixed(inventory_at)),
            record_status: Set(status.as_str().to_string()),
            locked: Set(false),
            locked_by: Set(None),
            locked_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
            expires_at: Set(to_fixed(to_utc(now) + retention)),
        };
        am.insert(self.db()).await?;
        Ok(id)
    }

    pub async fn get_timestamp(&self, id: &str) -> Result<Option<InventoriedTimestampRow>> {
        let model = TsEntity::find_by_id(id).one(self.db()).await?;
        model.map(model_to_row).transpose()
    }

    pub async fn list_timestamps(
        &self,
        statuses: &[TimestampStatus],
    ) -> Result<Vec<InventoriedTimestampRow>> {
        let mut q = TsEntity::find();
        if !statuses.is_empty() {
            q = q.filter(TsCol::RecordStatus.is_in(statuses.iter().map(TimestampStatus::as_str)));
        }
        let models = q.order_by_asc(TsCol::InventoryAt).all(self.db()).await?;
        models.into_iter().map(model_to_row).collect()
    }

    pub async fn list_timestamps_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<InventoriedTimestampRow>> {
        let models = TsEntity::find()
            .filter(TsCol::InventoryAt.gte(to_fixed(from)))
            .filter(TsCol::InventoryAt.lte(to_fixed(to)))
            .order_by_asc(TsCol::InventoryAt)
            .all(self.db())
            .await?;
        models.into_iter().map(model_to_row).collect()
    }

    /// Compare-and-set lock claim. Succeeds for an unlocked row or one whose
    /// lock already expired; exactly one caller wins a given row. Never
    /// blocks: losers skip and retry a later tick.
    pub async fn try_claim_timestamp(
        &self,
        id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
        lock_timeout: Duration,
    ) -> Result<bool> {
        let cutoff = to_fixed(now - lock_timeout);
        let res = self
            .db()
            .execute(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "UPDATE inventoried_timestamps \
                 SET locked = 1, locked_by = ?, locked_at = ?, updated_at = ? \
                 WHERE id = ? AND (locked = 0 OR locked_at < ?)",
                [
                    worker_id.into(),
                    to_fixed(now).into(),
                    to_fixed(now).into(),
                    id.into(),
                    cutoff.into(),
                ],
            ))
            .await?;
        Ok(res.rows_affected() == 1)
    }

    /// Release a claimed timestamp, moving it to `status`.
    pub async fn release_timestamp(&self, id: &str, status: TimestampStatus) -> Result<()> {
        let model = TsEntity::find_by_id(id).one(self.db()).await?.ok_or_else(|| {
            StorageError::NotFound {
                what: "inventoried timestamp",
                key: id.to_string(),
            }
        })?;
        let mut am: inventoried_timestamp::ActiveModel = model.into();
        am.record_status = Set(status.as_str().to_string());
        am.locked = Set(false);
        am.locked_by = Set(None);
        am.locked_at = Set(None);
        am.updated_at = Set(now_fixed());
        am.update(self.db()).await?;
        Ok(())
    }

    pub async fn set_timestamp_status(&self, id: &str, status: TimestampStatus) -> Result<()> {
        let model = TsEntity::find_by_id(id).one(self.db()).await?.ok_or_else(|| {
            StorageError::NotFound {
                what: "inventoried timestamp",
                key: id.to_string(),
            }
        })?;
        let mut am: inventoried_timestamp::ActiveModel = model.into();
        am.record_status = Set(status.as_str().to_string());
        am.updated_at = Set(now_fixed());
        am.update(self.db()).await?;
        Ok(())
    }

    /// Clear locks held past the timeout so a crashed worker cannot starve a
    /// timestamp. Returns the number of locks cleared.
    pub async fn sweep_expired_locks(
        &self,
        now: DateTime<Utc>,
        lock_timeout: Duration,
    ) -> Result<u64> {
        let cutoff = to_fixed(now - lock_timeout);
        let res = self
            .db()
            .execute(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "UPDATE inventoried_timestamps \
                 SET locked = 0, locked_by = NULL, locked_at = NULL, updated_at = ? \
                 WHERE locked = 1 AND locked_at < ?",
                [to_fixed(now).into(), cutoff.into()],
            ))
            .await?;
        Ok(res.rows_affected())
    }

    /// Drop a superseded placeholder so it is not counted as a gap twice.
    pub async fn delete_timestamp(&self, id: &str) -> Result<()> {
        TsEntity::delete_by_id(id).exec(self.db()).await?;
        Ok(())
    }

    pub async fn cleanup_expired_timestamps(&self, now: DateTime<Utc>) -> Result<u64> {
        let res = TsEntity::delete_many()
            .filter(TsCol::ExpiresAt.lt(to_fixed(now)))
            .filter(TsCol::RecordStatus.eq(TimestampStatus::Metered.as_str()))
            .exec(self.db())
            .await?;
        Ok(res.rows_affected)
    }
}
