//! Replica record, status, and resource hierarchy.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::utils::{ErrorKind, StrataError};

/// Data object identifier assigned by the catalog.
pub type DataId = u64;

/// Replica number, unique within one data object.
pub type ReplicaNumber = u32;

/// Physical resource identifier assigned by the resource registry.
pub type ResourceId = u64;

/// Status of a replica as recorded in the catalog.
#[derive(
    Debug, PartialEq, Eq, Clone, Copy, Hash, Serialize, Deserialize, Default,
)]
pub enum ReplicaStatus {
    /// Content superseded or half-written.
    #[default]
    Stale,
    /// Authoritative content.
    Good,
    /// Currently being written by an open session.
    Intermediate,
    /// Sibling of a replica being read under lock.
    ReadLocked,
    /// Sibling of a replica being written.
    WriteLocked,
}

impl ReplicaStatus {
    /// At rest means not touched by any in-flight session.
    pub fn at_rest(self) -> bool {
        matches!(self, ReplicaStatus::Good | ReplicaStatus::Stale)
    }

    pub fn locked(self) -> bool {
        matches!(self, ReplicaStatus::ReadLocked | ReplicaStatus::WriteLocked)
    }

    /// Returns true if a replica in this status blocks an open of the given
    /// mode: `WriteLocked` always conflicts, `ReadLocked` only with writes.
    pub fn conflicts_with(self, write: bool) -> bool {
        match self {
            ReplicaStatus::WriteLocked => true,
            ReplicaStatus::ReadLocked => write,
            _ => false,
        }
    }

    /// Numeric code as stored in the catalog.
    pub fn code(self) -> u8 {
        match self {
            ReplicaStatus::Stale => 0,
            ReplicaStatus::Good => 1,
            ReplicaStatus::Intermediate => 2,
            ReplicaStatus::ReadLocked => 3,
            ReplicaStatus::WriteLocked => 4,
        }
    }
}

/// Ordered chain of resource names from the coordinating root down to the
/// storage leaf, written `root;mid;leaf`.
#[derive(Debug, PartialEq, Eq, Clone, Hash, Serialize, Deserialize)]
pub struct Hierarchy(Vec<String>);

impl Hierarchy {
    /// Parses a `;`-separated hierarchy string. Empty components are
    /// rejected.
    pub fn parse(hier: &str) -> Result<Self, StrataError> {
        let parts: Vec<String> =
            hier.split(';').map(|s| s.trim().to_string()).collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(StrataError::new(
                ErrorKind::ResourceResolution,
                format!("malformed resource hierarchy '{}'", hier),
            ));
        }
        Ok(Hierarchy(parts))
    }

    /// Single-level hierarchy consisting of just one resource.
    pub fn single(resc: impl ToString) -> Self {
        Hierarchy(vec![resc.to_string()])
    }

    pub fn root(&self) -> &str {
        &self.0[0]
    }

    pub fn leaf(&self) -> &str {
        &self.0[self.0.len() - 1]
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for Hierarchy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0.join(";"))
    }
}

/// One physical copy of a data object's bytes.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct Replica {
    /// Owning data object; 0 until registered as a brand-new object.
    pub data_id: DataId,

    /// Replica number; assigned at registration.
    pub replica_number: ReplicaNumber,

    /// Zone-rooted logical path of the owning data object.
    pub logical_path: String,

    /// Resource hierarchy this replica lives on.
    pub hierarchy: Hierarchy,

    /// Id of the leaf resource.
    pub resource_id: ResourceId,

    /// Path of the physical file inside the resource vault.
    pub physical_path: String,

    /// Size in bytes as recorded in the catalog.
    pub size: u64,

    /// Checksum string in the `sha2:<base64>` form.
    pub checksum: Option<String>,

    pub status: ReplicaStatus,

    /// Modify time in seconds since the epoch.
    pub mtime: u64,

    pub data_type: String,

    pub mode: u32,
}

impl Replica {
    /// Speculative replica record before registration.
    pub fn speculative(
        logical_path: impl ToString,
        hierarchy: Hierarchy,
        resource_id: ResourceId,
        physical_path: impl ToString,
        data_type: impl ToString,
        mode: u32,
    ) -> Self {
        Replica {
            data_id: 0,
            replica_number: 0,
            logical_path: logical_path.to_string(),
            hierarchy,
            resource_id,
            physical_path: physical_path.to_string(),
            size: 0,
            checksum: None,
            status: ReplicaStatus::Intermediate,
            mtime: now_secs(),
            data_type: data_type.to_string(),
            mode,
        }
    }
}

/// Current wall-clock time in seconds since the epoch.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}
