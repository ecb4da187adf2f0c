use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "platform_remote_ids")]
pub struct Model {
    /// Hierarchical platform path (`infrastructure[/machine[/disk|nic]]`).
    #[sea_orm(primary_key, auto_increment = false)]
    pub platform_key: String,
    pub remote_id: String,
    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
