//! Boundary to the platform collector service.
//!
//! The collector is the only component that talks to the virtualization
//! platform directly; everything here consumes its read-only API. The
//! [`Collector`] trait is the seam the engine is written against, with
//! [`HttpCollector`] as the production implementation.

pub mod error;
mod http;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vmsync_model::{Infrastructure, Machine, Reading};

pub use error::{CollectorError, Result};
pub use http::HttpCollector;

/// One full sweep of the platform inventory.
#[derive(Debug, Clone, Default)]
pub struct InventoryObservation {
    pub infrastructures: Vec<Infrastructure>,
    pub machines: Vec<ObservedMachine>,
}

/// A machine as the collector saw it, with a flag for observations the
/// collector could not fully populate (platform API degraded mid-sweep).
#[derive(Debug, Clone)]
pub struct ObservedMachine {
    pub machine: Machine,
    pub incomplete: bool,
}

/// A machine lifecycle event, used to backfill timestamps for machines that
/// appeared or vanished between inventory sweeps.
#[derive(Debug, Clone)]
pub struct MachineEvent {
    pub machine_platform_id: String,
    pub kind: EventKind,
    pub occurred_at: DateTime<Utc>,
    /// On `Created` events, the machine as the collector recorded it; lets
    /// replay synthesize machines that lived entirely inside an outage.
    pub machine: Option<Machine>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Removed,
    PoweredOn,
    PoweredOff,
}

/// Read-only access to the platform collector.
#[async_trait]
pub trait Collector: Send + Sync {
    fn name(&self) -> &str;

    /// Fetch the complete current inventory.
    async fn observe_inventory(&self) -> Result<InventoryObservation>;

    /// Fetch performance samples for the given machines over `[from, to)`.
    ///
    /// Machines with no data in the window are simply absent from the
    /// result; the caller decides whether to zero-fill.
    async fn sample_metrics(
        &self,
        machine_platform_ids: &[String],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Reading>>;

    /// Fetch machine lifecycle events that occurred in `[from, to)`.
    async fn events_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<MachineEvent>>;
}
