//! File-backed catalog: the in-memory catalog plus a MessagePack snapshot
//! rewritten on disk after every successful mutation.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::Mutex;

use crate::catalog::memory::CatalogState;
use crate::catalog::{
    AclEntry, Avu, Catalog, CatalogFilter, InMemoryCatalog, ReplicaFields,
};
use crate::model::{DataId, Replica, ReplicaNumber};
use crate::utils::StrataError;

/// Catalog persisted to a single snapshot file.
#[derive(Debug)]
pub struct FileCatalog {
    /// Live state.
    inner: InMemoryCatalog,

    /// Path of the snapshot file.
    path: PathBuf,

    /// Serializes snapshot writers so that an older snapshot never lands
    /// after a newer one.
    persist_lock: Mutex<()>,
}

impl FileCatalog {
    /// Opens the catalog at `path`, loading the snapshot if the file exists
    /// and starting empty otherwise.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StrataError> {
        let path = path.as_ref().to_path_buf();
        let inner = if fs::try_exists(&path).await? {
            let bytes = fs::read(&path).await?;
            let state: CatalogState = rmp_serde::decode::from_slice(&bytes)?;
            pf_debug!("loaded catalog snapshot {}", path.display());
            InMemoryCatalog::from_state(state)
        } else {
            InMemoryCatalog::new()
        };

        Ok(FileCatalog {
            inner,
            path,
            persist_lock: Mutex::new(()),
        })
    }

    /// Access to the live in-memory state.
    pub fn inner(&self) -> &InMemoryCatalog {
        &self.inner
    }

    async fn persist(&self) -> Result<(), StrataError> {
        let _guard = self.persist_lock.lock().await;
        let bytes = rmp_serde::encode::to_vec(&self.inner.snapshot()?)?;

        // write aside then rename, so a crash never leaves a torn snapshot
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &bytes).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl Catalog for FileCatalog {
    async fn query(
        &self,
        filter: &CatalogFilter,
    ) -> Result<Vec<Replica>, StrataError> {
        self.inner.query(filter).await
    }

    async fn update_replicas(
        &self,
        data_id: DataId,
        updates: &[(ReplicaNumber, ReplicaFields)],
    ) -> Result<(), StrataError> {
        self.inner.update_replicas(data_id, updates).await?;
        self.persist().await
    }

    async fn register_replica(
        &self,
        replica: Replica,
    ) -> Result<Replica, StrataError> {
        let replica = self.inner.register_replica(replica).await?;
        self.persist().await?;
        Ok(replica)
    }

    async fn unregister_replica(
        &self,
        data_id: DataId,
        replica_number: ReplicaNumber,
    ) -> Result<(), StrataError> {
        self.inner.unregister_replica(data_id, replica_number).await?;
        self.persist().await
    }

    async fn apply_metadata(
        &self,
        data_id: DataId,
        avus: &[Avu],
    ) -> Result<(), StrataError> {
        self.inner.apply_metadata(data_id, avus).await?;
        self.persist().await
    }

    async fn apply_acl(
        &self,
        data_id: DataId,
        acl: &[AclEntry],
    ) -> Result<(), StrataError> {
        self.inner.apply_acl(data_id, acl).await?;
        self.persist().await
    }
}
