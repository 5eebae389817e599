use std::fmt;

use crate::collection::{PropertyId, SavedCollection};
use crate::database::DatabaseError;
use crate::identity::Identity;

/// Connection state as observed through remote operations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SyncStatus {
    #[default]
    Loading,
    Synced,
    Offline,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Loading => "loading",
            SyncStatus::Synced => "synced",
            SyncStatus::Offline => "offline",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Non-blocking message for the user interface.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncNotice {
    /// The record is saved on this device but the remote write failed.
    SavedLocallyOnly { id: PropertyId },
    /// The record is gone from this device but the remote delete failed.
    DeletedLocallyOnly { id: PropertyId },
    /// The remote partition was removed after a long period of inactivity.
    PartitionExpired { identity: Identity, last_active: i64 },
    IdentitySwitched { from: Identity, to: Identity },
}

impl fmt::Display for SyncNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncNotice::SavedLocallyOnly { id } => {
                write!(f, "Property {id} saved locally, cloud sync failed")
            }
            SyncNotice::DeletedLocallyOnly { id } => {
                write!(f, "Property {id} removed locally, cloud sync failed")
            }
            SyncNotice::PartitionExpired { identity, .. } => {
                write!(f, "Saved properties of {identity} expired after inactivity")
            }
            SyncNotice::IdentitySwitched { from, to } => {
                write!(f, "Switched saved properties from {from} to {to}")
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum SyncEvent {
    CollectionChanged(SavedCollection),
    StatusChanged(SyncStatus),
    Notice(SyncNotice),
}

/// Result of one expiry sweep.
#[derive(Clone, Debug)]
pub enum SweepOutcome {
    /// The partition was active recently, or has no activity record yet.
    Kept { last_active: Option<i64> },
    /// The partition was idle past the threshold and has been removed.
    Swept { last_active: i64 },
    /// The remote store could not be read or written; nothing was removed.
    Failed(DatabaseError),
}

impl SweepOutcome {
    pub fn is_swept(&self) -> bool {
        matches!(self, SweepOutcome::Swept { .. })
    }
}
