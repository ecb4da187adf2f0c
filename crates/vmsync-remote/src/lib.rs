//! Client for the remote metering API.
//!
//! Two API generations are in service. Both are driven through the single
//! [`MeterBackend`] trait so the synchronization engine stays generation
//! agnostic: [`ApiBackend`] speaks the current `/v2` surface,
//! [`LegacyBackend`] the older flat one.

pub mod api;
pub mod client;
pub mod error;
pub mod legacy;

use std::collections::HashMap;

use async_trait::async_trait;
use vmsync_model::{Infrastructure, Machine, Reading};

pub use api::ApiBackend;
pub use client::{backoff_with_jitter, Credentials, RemoteClient};
pub use error::{RemoteError, Result};
pub use legacy::LegacyBackend;

/// Remote acknowledgement for an infrastructure.
#[derive(Debug, Clone)]
pub struct RemoteInfrastructure {
    pub remote_id: String,
}

/// Remote acknowledgement for a machine, including the remote IDs assigned
/// to its children, keyed by the child's platform ID.
#[derive(Debug, Clone, Default)]
pub struct RemoteMachine {
    pub remote_id: String,
    pub disk_ids: HashMap<String, String>,
    pub nic_ids: HashMap<String, String>,
}

/// Operations the synchronization engine needs from a metering API
/// generation.
#[async_trait]
pub trait MeterBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Look up an infrastructure by its natural key (the platform ID the
    /// creator attached). `None` means it has never been created.
    async fn find_infrastructure(&self, platform_id: &str) -> Result<Option<RemoteInfrastructure>>;

    async fn create_infrastructure(&self, infra: &Infrastructure) -> Result<RemoteInfrastructure>;

    async fn update_infrastructure(&self, remote_id: &str, infra: &Infrastructure) -> Result<()>;

    /// Look up a machine by natural key within an already-created
    /// infrastructure.
    async fn find_machine(
        &self,
        infrastructure_remote_id: &str,
        platform_id: &str,
    ) -> Result<Option<RemoteMachine>>;

    async fn create_machine(
        &self,
        infrastructure_remote_id: &str,
        machine: &Machine,
    ) -> Result<RemoteMachine>;

    /// Update a machine in place. The response reports child remote IDs so
    /// newly attached disks and NICs become resolvable.
    async fn update_machine(&self, remote_id: &str, machine: &Machine) -> Result<RemoteMachine>;

    async fn delete_machine(&self, remote_id: &str) -> Result<()>;

    async fn delete_disk(&self, machine_remote_id: &str, disk_remote_id: &str) -> Result<()>;

    async fn delete_nic(&self, machine_remote_id: &str, nic_remote_id: &str) -> Result<()>;

    /// Submit a batch of readings for one machine.
    async fn submit_readings(&self, machine_remote_id: &str, readings: &[Reading]) -> Result<()>;
}
