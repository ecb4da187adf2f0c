use serde::{Deserialize, Serialize};

/// Lifecycle state of an entity with respect to local/remote synchronization.
///
/// Transitions driven by the inventory diff:
/// `Created` on first observation, `Updated` when comparable attributes or
/// child relations change, `Unchanged` otherwise, `Incomplete` for machine
/// observations missing required fields, `ToBeDeleted` for children that
/// vanished from an observation, `Deleted` for entities absent from a full
/// observation.
///
/// Transitions driven by the sync pipeline:
/// `Created -> VerifiedCreate | FailedCreate`, `Updated -> VerifiedUpdate`,
/// `ToBeDeleted -> VerifiedDelete | UnverifiedDelete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Created,
    VerifiedCreate,
    FailedCreate,
    Updated,
    VerifiedUpdate,
    Unchanged,
    Incomplete,
    ToBeDeleted,
    VerifiedDelete,
    UnverifiedDelete,
    Deleted,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Created => "created",
            RecordStatus::VerifiedCreate => "verified_create",
            RecordStatus::FailedCreate => "failed_create",
            RecordStatus::Updated => "updated",
            RecordStatus::VerifiedUpdate => "verified_update",
            RecordStatus::Unchanged => "unchanged",
            RecordStatus::Incomplete => "incomplete",
            RecordStatus::ToBeDeleted => "to_be_deleted",
            RecordStatus::VerifiedDelete => "verified_delete",
            RecordStatus::UnverifiedDelete => "unverified_delete",
            RecordStatus::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "created" => RecordStatus::Created,
            "verified_create" => RecordStatus::VerifiedCreate,
            "failed_create" => RecordStatus::FailedCreate,
            "updated" => RecordStatus::Updated,
            "verified_update" => RecordStatus::VerifiedUpdate,
            "unchanged" => RecordStatus::Unchanged,
            "incomplete" => RecordStatus::Incomplete,
            "to_be_deleted" => RecordStatus::ToBeDeleted,
            "verified_delete" => RecordStatus::VerifiedDelete,
            "unverified_delete" => RecordStatus::UnverifiedDelete,
            "deleted" => RecordStatus::Deleted,
            _ => return None,
        })
    }

    /// Entity should be submitted as a create this pass.
    pub fn pending_create(&self) -> bool {
        matches!(self, RecordStatus::Created)
    }

    /// A prior create attempt timed out; the resource may or may not exist
    /// remotely, so the next pass must re-run check-before-create.
    pub fn needs_create_recovery(&self) -> bool {
        matches!(self, RecordStatus::FailedCreate)
    }

    pub fn pending_update(&self) -> bool {
        matches!(self, RecordStatus::Updated)
    }

    pub fn pending_delete(&self) -> bool {
        matches!(self, RecordStatus::ToBeDeleted)
    }

    /// The remote side has acknowledged this entity at least once, meaning a
    /// remote ID must be recorded for it.
    pub fn remotely_known(&self) -> bool {
        matches!(
            self,
            RecordStatus::VerifiedCreate
                | RecordStatus::Updated
                | RecordStatus::VerifiedUpdate
                | RecordStatus::Unchanged
        )
    }
}

impl std::fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a performance reading. Readings are immutable once written;
/// only their submission outcome changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadingStatus {
    Pending,
    Submitted,
    SubmittedConflict,
    MachineDeleted,
}

impl ReadingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadingStatus::Pending => "pending",
            ReadingStatus::Submitted => "submitted",
            ReadingStatus::SubmittedConflict => "submitted_conflict",
            ReadingStatus::MachineDeleted => "machine_deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => ReadingStatus::Pending,
            "submitted" => ReadingStatus::Submitted,
            "submitted_conflict" => ReadingStatus::SubmittedConflict,
            "machine_deleted" => ReadingStatus::MachineDeleted,
            _ => return None,
        })
    }
}

/// Progress of one observation cycle through metering.
///
/// A timestamp only advances to `Metered` after readings for every in-scope
/// machine at that instant are durably recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampStatus {
    Inventoried,
    QueuedForMetering,
    Metering,
    Metered,
}

impl TimestampStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimestampStatus::Inventoried => "inventoried",
            TimestampStatus::QueuedForMetering => "queued_for_metering",
            TimestampStatus::Metering => "metering",
            TimestampStatus::Metered => "metered",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "inventoried" => TimestampStatus::Inventoried,
            "queued_for_metering" => TimestampStatus::QueuedForMetering,
            "metering" => TimestampStatus::Metering,
            "metered" => TimestampStatus::Metered,
            _ => return None,
        })
    }
}
