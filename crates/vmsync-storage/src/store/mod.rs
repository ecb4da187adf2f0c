use chrono::{DateTime, Utc};
use migration::{Migrator, MigratorTrait};
use sea_orm::{Database, DatabaseConnection};

use crate::error::Result;

mod inventory;
mod reading;
mod remote_id;
mod sync;
mod timestamp;

pub use reading::ReadingRow;
pub use timestamp::InventoriedTimestampRow;

/// Unified access layer over the vmsync database.
///
/// All methods are `async fn` on SeaORM + SQLite. One `Store` is shared by
/// the inventory, sync, metering and backfill drivers; cross-process
/// coordination happens through status and lock columns, never in-memory
/// state.
#[derive(Clone)]
pub struct Store {
    pub(crate) db: DatabaseConnection,
}

impl Store {
    /// Connect and migrate.
    ///
    /// `db_url` examples: `sqlite:///var/lib/vmsync/vmsync.db?mode=rwc`,
    /// `sqlite::memory:` for tests.
    pub async fn connect(db_url: &str) -> Result<Self> {
        let db = Database::connect(db_url).await?;
        Migrator::up(&db, None).await?;
        tracing::debug!("database connected and migrated");
        Ok(Self { db })
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }
}

pub(crate) fn now_fixed() -> sea_orm::prelude::DateTimeWithTimeZone {
    Utc::now().fixed_offset()
}

pub(crate) fn to_fixed(dt: DateTime<Utc>) -> sea_orm::prelude::DateTimeWithTimeZone {
    dt.fixed_offset()
}

pub(crate) fn to_utc(dt: sea_orm::prelude::DateTimeWithTimeZone) -> DateTime<Utc> {
    dt.with_timezone(&Utc)
}
