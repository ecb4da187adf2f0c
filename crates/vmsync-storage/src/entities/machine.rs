use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "machines")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub platform_id: String,
    pub infrastructure_platform_id: String,
    pub name: String,
    pub cpu_count: i64,
    pub cpu_speed_hz: i64,
    pub maximum_memory_bytes: i64,
    pub power_state: String,
    /// Child disks and NICs travel with the machine as JSON arrays.
    pub disks_json: String,
    pub nics_json: String,
    pub remote_id: Option<String>,
    pub record_status: String,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
