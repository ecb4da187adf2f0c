use sea_orm::{ActiveValue::Set, EntityTrait};
use sea_orm::sea_query::OnConflict;

use crate::entities::platform_remote_id::{self, Column as MapCol, Entity as MapEntity};
use crate::error::Result;
use crate::store::{now_fixed, Store};

impl Store {
    pub async fn get_remote_id(&self, platform_key: &str) -> Result<Option<String>> {
        let model = MapEntity::find_by_id(platform_key).one(self.db()).await?;
        Ok(model.map(|m| m.remote_id))
    }

    pub async fn list_remote_ids(&self) -> Result<Vec<(String, String)>> {
        let models = MapEntity::find().all(self.db()).await?;
        Ok(models
            .into_iter()
            .map(|m| (m.platform_key, m.remote_id))
            .collect())
    }

    /// Batched insert of pending map entries. Re-inserting an existing key
    /// overwrites its remote ID, which keeps a map rebuild idempotent.
    pub async fn insert_remote_ids(&self, entries: &[(String, String)]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let now = now_fixed();
        let models: Vec<platform_remote_id::ActiveModel> = entries
            .iter()
            .map(|(key, remote_id)| platform_remote_id::ActiveModel {
                platform_key: Set(key.clone()),
                remote_id: Set(remote_id.clone()),
                created_at: Set(now),
            })
            .collect();
        MapEntity::insert_many(models)
            .on_conflict(
                OnConflict::column(MapCol::PlatformKey)
                    .update_column(MapCol::RemoteId)
                    .to_owned(),
            )
            .exec(self.db())
            .await?;
        Ok(())
    }

    pub async fn remove_remote_id(&self, platform_key: &str) -> Result<()> {
        MapEntity::delete_by_id(platform_key).exec(self.db()).await?;
        Ok(())
    }
}
