//! Entity and lifecycle model for vmsync.
//!
//! Every observed object carries an immutable `platform_id` assigned by the
//! collector and, once the remote metering service accepts a create, a
//! `remote_id`. The [`status::RecordStatus`] state machine tracks where each
//! entity stands between local observation and remote acknowledgement.

pub mod entity;
pub mod path;
pub mod reading;
pub mod status;

pub use entity::{Disk, Host, Infrastructure, Machine, Network, Nic, Volume};
pub use path::PlatformPath;
pub use reading::{DiskMetric, NicMetric, Reading};
pub use status::{ReadingStatus, RecordStatus, TimestampStatus};
