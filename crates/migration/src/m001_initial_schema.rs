use sea_orm_migration::prelude::*;

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m001_initial_schema"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager.get_connection().execute_unprepared(UP_SQL).await?;
        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .get_connection()
            .execute_unprepared(DOWN_SQL)
            .await?;
        Ok(())
    }
}

const UP_SQL: &str = "
PRAGMA journal_mode=WAL;

CREATE TABLE IF NOT EXISTS infrastructures (
    id TEXT PRIMARY KEY NOT NULL,
    platform_id TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    hosts_json TEXT NOT NULL DEFAULT '[]',
    networks_json TEXT NOT NULL DEFAULT '[]',
    volumes_json TEXT NOT NULL DEFAULT '[]',
    remote_id TEXT,
    record_status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_infrastructures_platform_id ON infrastructures(platform_id);
CREATE INDEX IF NOT EXISTS idx_infrastructures_record_status ON infrastructures(record_status);

CREATE TABLE IF NOT EXISTS machines (
    id TEXT PRIMARY KEY NOT NULL,
    platform_id TEXT NOT NULL UNIQUE,
    infrastructure_platform_id TEXT NOT NULL,
    name TEXT NOT NULL,
    cpu_count INTEGER NOT NULL DEFAULT 0,
    cpu_speed_hz INTEGER NOT NULL DEFAULT 0,
    maximum_memory_bytes INTEGER NOT NULL DEFAULT 0,
    power_state TEXT NOT NULL DEFAULT '',
    disks_json TEXT NOT NULL DEFAULT '[]',
    nics_json TEXT NOT NULL DEFAULT '[]',
    remote_id TEXT,
    record_status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_machines_platform_id ON machines(platform_id);
CREATE INDEX IF NOT EXISTS idx_machines_record_status ON machines(record_status);
CREATE INDEX IF NOT EXISTS idx_machines_infrastructure ON machines(infrastructure_platform_id);

CREATE TABLE IF NOT EXISTS readings (
    id TEXT PRIMARY KEY NOT NULL,
    machine_platform_id TEXT NOT NULL,
    start_time TEXT NOT NULL,
    end_time TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    record_status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_readings_record_status ON readings(record_status);
CREATE INDEX IF NOT EXISTS idx_readings_machine_end ON readings(machine_platform_id, end_time);
CREATE INDEX IF NOT EXISTS idx_readings_expires_at ON readings(expires_at);

CREATE TABLE IF NOT EXISTS inventoried_timestamps (
    id TEXT PRIMARY KEY NOT NULL,
    inventory_at TEXT NOT NULL,
    record_status TEXT NOT NULL,
    locked INTEGER NOT NULL DEFAULT 0,
    locked_by TEXT,
    locked_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_inventoried_timestamps_at ON inventoried_timestamps(inventory_at);
CREATE INDEX IF NOT EXISTS idx_inventoried_timestamps_status ON inventoried_timestamps(record_status);
CREATE INDEX IF NOT EXISTS idx_inventoried_timestamps_expires ON inventoried_timestamps(expires_at);

CREATE TABLE IF NOT EXISTS platform_remote_ids (
    platform_key TEXT PRIMARY KEY NOT NULL,
    remote_id TEXT NOT NULL,
    created_at TEXT NOT NULL
);
";

const DOWN_SQL: &str = "
DROP TABLE IF EXISTS platform_remote_ids;
DROP TABLE IF EXISTS inventoried_timestamps;
DROP TABLE IF EXISTS readings;
DROP TABLE IF EXISTS machines;
DROP TABLE IF EXISTS infrastructures;
";
