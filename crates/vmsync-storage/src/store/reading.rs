use chrono::{DateTime, Duration, Utc};
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect,
};
use vmsync_model::{Reading, ReadingStatus};

use crate::entities::reading::{self, Column as ReadCol, Entity as ReadEntity};
use crate::error::{Result, StorageError};
use crate::store::{now_fixed, to_fixed, to_utc, Store};

/// A persisted reading plus its row identity, needed to mark the submission
/// outcome later.
#[derive(Debug, Clone)]
pub struct ReadingRow {
    pub id: String,
    pub reading: Reading,
}

fn model_to_row(m: reading::Model) -> Result<ReadingRow> {
    let mut row: Reading = serde_json::from_str(&m.payload_json)?;
    row.status = ReadingStatus::parse(&m.record_status).ok_or_else(|| {
        StorageError::UnknownStatus {
            field: "record_status",
            id: m.id.clone(),
            value: m.record_status.clone(),
        }
    })?;
    row.machine_platform_id = m.machine_platform_id;
    row.start_time = to_utc(m.start_time);
    row.end_time = to_utc(m.end_time);
    Ok(ReadingRow {
        id: m.id,
        reading: row,
    })
}

impl Store {
    /// Insert a batch of freshly collected readings in one statement.
    ///
    /// `retention` bounds how long the row is kept after submission; the
    /// expiry sweep never removes readings still pending.
    pub async fn insert_readings(&self, rows: &[Reading], retention: Duration) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let now = now_fixed();
        let mut models = Vec::with_capacity(rows.len());
        for row in rows {
            models.push(reading::ActiveModel {
                id: Set(vmsync_common::id::next_id()),
                machine_platform_id: Set(row.machine_platform_id.clone()),
                start_time: Set(to_fixed(row.start_time)),
                end_time: Set(to_fixed(row.end_time)),
                payload_json: Set(serde_json::to_string(row)?),
                record_status: Set(row.status.as_str().to_string()),
                created_at: Set(now),
                expires_at: Set(to_fixed(to_utc(now) + retention)),
            });
        }
        ReadEntity::insert_many(models).exec(self.db()).await?;
        Ok(())
    }

    pub async fn list_pending_readings(&self, limit: usize) -> Result<Vec<ReadingRow>> {
        let models = ReadEntity::find()
            .filter(ReadCol::RecordStatus.eq(ReadingStatus::Pending.as_str()))
            .order_by_asc(ReadCol::EndTime)
            .limit(limit as u64)
            .all(self.db())
            .await?;
        models.into_iter().map(model_to_row).collect()
    }

    pub async fn set_reading_status(&self, id: &str, status: ReadingStatus) -> Result<()> {
        let model = ReadEntity::find_by_id(id).one(self.db()).await?.ok_or_else(|| {
            StorageError::NotFound {
                what: "reading",
                key: id.to_string(),
            }
        })?;
        let mut am: reading::ActiveModel = model.into();
        am.record_status = Set(status.as_str().to_string());
        am.update(self.db()).await?;
        Ok(())
    }

    /// Machines that already have a reading ending at `end_time`; the
    /// backfill pass uses this to re-drive only the machines with a hole.
    pub async fn machines_with_reading_at(
        &self,
        end_time: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let models = ReadEntity::find()
            .filter(ReadCol::EndTime.eq(to_fixed(end_time)))
            .all(self.db())
            .await?;
        Ok(models.into_iter().map(|m| m.machine_platform_id).collect())
    }

    /// Remove submitted/skipped readings past their expiry. Returns the
    /// number of rows removed.
    pub async fn cleanup_expired_readings(&self, now: DateTime<Utc>) -> Result<u64> {
        let res = ReadEntity::delete_many()
            .filter(ReadCol::ExpiresAt.lt(to_fixed(now)))
            .filter(ReadCol::RecordStatus.ne(ReadingStatus::Pending.as_str()))
            .exec(self.db())
            .await?;
        Ok(res.rows_affected)
    }
}
