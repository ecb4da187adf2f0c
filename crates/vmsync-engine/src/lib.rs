//! Drivers that tie the collector, store and remote API together: the
//! inventory cycle, the synchronization pipeline, metering and backfill.

pub mod gaps;
pub mod inventory;
pub mod metering;
pub mod pipeline;
pub mod pool;

#[cfg(test)]
mod tests;

pub use gaps::{GapDetector, GapOptions, GapReport};
pub use inventory::{InventoryOptions, InventoryReport, InventoryRunner};
pub use metering::{MeteringOptions, MeteringReport, MeteringWorker};
pub use pipeline::{PassReport, SyncOptions, Synchronizer};
pub use pool::WorkerPool;
