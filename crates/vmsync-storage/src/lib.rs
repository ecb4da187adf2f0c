//! Durable local snapshot of observed infrastructure.
//!
//! [`store::Store`] is the unified access layer over SQLite (SeaORM, WAL
//! mode); [`cache::InventoryCache`] layers the diffing semantics on top of
//! it, and [`remote_map::RemoteIdMap`] holds the platform-path to remote-ID
//! index.

pub mod cache;
pub mod entities;
pub mod error;
pub mod remote_map;
pub mod store;


pub use cache::{Diff, InventoryCache};
pub use error::{Result, StorageError};
pub use remote_map::RemoteIdMap;
pub use store::{InventoriedTimestampRow, ReadingRow, Store};
