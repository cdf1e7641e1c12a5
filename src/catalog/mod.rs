//! Catalog interface: where replica rows live. The coordinator only talks
//! to the catalog through the `Catalog` trait.

mod backed;
mod memory;

pub use backed::FileCatalog;
pub use memory::InMemoryCatalog;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::model::{DataId, DataObject, Replica, ReplicaNumber, ReplicaStatus};
use crate::utils::StrataError;

/// Row filter for catalog queries.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum CatalogFilter {
    /// All replicas of the object at this logical path.
    LogicalPath(String),
    /// All replicas of the object with this id.
    DataId(DataId),
    /// All replicas of all objects under this collection.
    Collection(String),
}

/// Partial update of one replica's catalog row. `None` leaves a column
/// untouched.
#[derive(Debug, PartialEq, Eq, Clone, Default, Serialize, Deserialize)]
pub struct ReplicaFields {
    pub size: Option<u64>,
    pub checksum: Option<Option<String>>,
    pub status: Option<ReplicaStatus>,
    pub mtime: Option<u64>,
    pub physical_path: Option<String>,
}

impl ReplicaFields {
    pub fn status(status: ReplicaStatus) -> Self {
        ReplicaFields {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.size.is_none()
            && self.checksum.is_none()
            && self.status.is_none()
            && self.mtime.is_none()
            && self.physical_path.is_none()
    }

    /// Writes the present fields into a replica record.
    pub fn apply_to(&self, replica: &mut Replica) {
        if let Some(size) = self.size {
            replica.size = size;
        }
        if let Some(checksum) = &self.checksum {
            replica.checksum.clone_from(checksum);
        }
        if let Some(status) = self.status {
            replica.status = status;
        }
        if let Some(mtime) = self.mtime {
            replica.mtime = mtime;
        }
        if let Some(path) = &self.physical_path {
            replica.physical_path.clone_from(path);
        }
    }

    /// Minimal set of fields turning `before` into `after`.
    pub fn diff(before: &Replica, after: &Replica) -> Self {
        ReplicaFields {
            size: (before.size != after.size).then_some(after.size),
            checksum: (before.checksum != after.checksum)
                .then(|| after.checksum.clone()),
            status: (before.status != after.status).then_some(after.status),
            mtime: (before.mtime != after.mtime).then_some(after.mtime),
            physical_path: (before.physical_path != after.physical_path)
                .then(|| after.physical_path.clone()),
        }
    }
}

/// Attribute-value-unit metadata triple.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct Avu {
    pub attribute: String,
    pub value: String,
    pub unit: String,
}

/// Access level granted by an ACL entry.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum AccessLevel {
    Null,
    Read,
    Write,
    Own,
}

/// ACL entry granting `level` to `user`.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct AclEntry {
    pub user: String,
    pub level: AccessLevel,
}

/// Catalog collaborator. Every call is transactional on its own.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Returns every replica row matching the filter.
    async fn query(
        &self,
        filter: &CatalogFilter,
    ) -> Result<Vec<Replica>, StrataError>;

    /// Applies a batch of partial updates to replicas of one data object;
    /// either all rows change or none do.
    async fn update_replicas(
        &self,
        data_id: DataId,
        updates: &[(ReplicaNumber, ReplicaFields)],
    ) -> Result<(), StrataError>;

    /// Registers a new replica row. A `data_id` of 0 registers a brand-new
    /// data object. Returns the row as stored, with ids filled in.
    async fn register_replica(
        &self,
        replica: Replica,
    ) -> Result<Replica, StrataError>;

    /// Removes one replica row; the object goes away with its last row.
    async fn unregister_replica(
        &self,
        data_id: DataId,
        replica_number: ReplicaNumber,
    ) -> Result<(), StrataError>;

    /// Adds metadata triples to a data object.
    async fn apply_metadata(
        &self,
        data_id: DataId,
        avus: &[Avu],
    ) -> Result<(), StrataError>;

    /// Sets ACL entries on a data object.
    async fn apply_acl(
        &self,
        data_id: DataId,
        acl: &[AclEntry],
    ) -> Result<(), StrataError>;

    /// Single-row convenience over `update_replicas`.
    async fn update_replica(
        &self,
        data_id: DataId,
        replica_number: ReplicaNumber,
        fields: ReplicaFields,
    ) -> Result<(), StrataError> {
        self.update_replicas(data_id, &[(replica_number, fields)])
            .await
    }

    /// Fetches the data object at a logical path, if any.
    async fn fetch_object(
        &self,
        logical_path: &str,
    ) -> Result<Option<DataObject>, StrataError> {
        let rows = self
            .query(&CatalogFilter::LogicalPath(logical_path.into()))
            .await?;
        Ok(DataObject::from_replicas(rows))
    }
}
