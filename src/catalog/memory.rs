//! In-memory catalog implementation.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::catalog::{AclEntry, Avu, Catalog, CatalogFilter, ReplicaFields};
use crate::model::{under_collection, DataId, DataObject, Replica, ReplicaNumber};
use crate::utils::{ErrorKind, StrataError};

/// Whole catalog contents; serializable so that `FileCatalog` can persist
/// snapshots of it.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub(crate) struct CatalogState {
    /// Objects keyed by data id.
    objects: BTreeMap<DataId, DataObject>,

    /// Metadata triples per data object.
    metadata: HashMap<DataId, Vec<Avu>>,

    /// ACL entries per data object, one per user.
    acls: HashMap<DataId, Vec<AclEntry>>,

    /// Next data id to hand out; ids start at 10000.
    next_data_id: DataId,
}

impl CatalogState {
    fn find_by_path(&self, path: &str) -> Option<&DataObject> {
        self.objects.values().find(|o| o.logical_path == path)
    }
}

fn write_failure(msg: impl ToString) -> StrataError {
    StrataError::new(ErrorKind::CatalogWrite, msg)
}

/// Catalog kept entirely in process memory.
#[derive(Debug)]
pub struct InMemoryCatalog {
    state: Mutex<CatalogState>,
}

impl Default for InMemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

// InMemoryCatalog state access helpers
impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::from_state(CatalogState {
            next_data_id: 10000,
            ..Default::default()
        })
    }

    pub(crate) fn from_state(state: CatalogState) -> Self {
        InMemoryCatalog {
            state: Mutex::new(state),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, CatalogState>, StrataError> {
        self.state
            .lock()
            .map_err(|_| StrataError::msg("catalog state mutex poisoned"))
    }

    /// Clone of the whole state, for persisting.
    pub(crate) fn snapshot(&self) -> Result<CatalogState, StrataError> {
        Ok(self.state()?.clone())
    }

    /// Metadata triples attached to an object.
    pub fn metadata_of(&self, data_id: DataId) -> Vec<Avu> {
        self.state()
            .map(|s| s.metadata.get(&data_id).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    /// ACL entries attached to an object.
    pub fn acl_of(&self, data_id: DataId) -> Vec<AclEntry> {
        self.state()
            .map(|s| s.acls.get(&data_id).cloned().unwrap_or_default())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Catalog for InMemoryCatalog {
    async fn query(
        &self,
        filter: &CatalogFilter,
    ) -> Result<Vec<Replica>, StrataError> {
        let state = self.state()?;
        let rows = match filter {
            CatalogFilter::LogicalPath(path) => state
                .find_by_path(path)
                .map(|o| o.replicas.clone())
                .unwrap_or_default(),
            CatalogFilter::DataId(data_id) => state
                .objects
                .get(data_id)
                .map(|o| o.replicas.clone())
                .unwrap_or_default(),
            CatalogFilter::Collection(coll) => state
                .objects
                .values()
                .filter(|o| under_collection(&o.logical_path, coll))
                .flat_map(|o| o.replicas.iter().cloned())
                .collect(),
        };
        Ok(rows)
    }

    async fn update_replicas(
        &self,
        data_id: DataId,
        updates: &[(ReplicaNumber, ReplicaFields)],
    ) -> Result<(), StrataError> {
        let mut state = self.state()?;
        let obj = state.objects.get_mut(&data_id).ok_or_else(|| {
            write_failure(format!("no data object {} in catalog", data_id))
        })?;

        // validate the whole batch before touching any row
        if let Some((num, _)) =
            updates.iter().find(|(num, _)| obj.replica(*num).is_none())
        {
            return Err(write_failure(format!(
                "no replica {} of data object {} in catalog",
                num, data_id
            )));
        }

        for (num, fields) in updates {
            if let Some(replica) = obj.replica_mut(*num) {
                fields.apply_to(replica);
            }
        }
        Ok(())
    }

    async fn register_replica(
        &self,
        mut replica: Replica,
    ) -> Result<Replica, StrataError> {
        let mut state = self.state()?;

        if replica.data_id == 0 {
            if state.find_by_path(&replica.logical_path).is_some() {
                return Err(write_failure(format!(
                    "data object '{}' already registered",
                    replica.logical_path
                )));
            }
            let data_id = state.next_data_id;
            state.next_data_id += 1;
            replica.data_id = data_id;
            replica.replica_number = 0;
            let mut obj = DataObject::new(data_id, &replica.logical_path);
            obj.replicas.push(replica.clone());
            state.objects.insert(data_id, obj);
        } else {
            let obj =
                state.objects.get_mut(&replica.data_id).ok_or_else(|| {
                    write_failure(format!(
                        "no data object {} in catalog",
                        replica.data_id
                    ))
                })?;
            if obj.find_replica(&replica.hierarchy).is_some() {
                return Err(write_failure(format!(
                    "replica on '{}' already registered for {}",
                    replica.hierarchy, replica.data_id
                )));
            }
            replica.replica_number = obj.next_replica_number();
            replica.logical_path.clone_from(&obj.logical_path);
            obj.replicas.push(replica.clone());
        }

        Ok(replica)
    }

    async fn unregister_replica(
        &self,
        data_id: DataId,
        replica_number: ReplicaNumber,
    ) -> Result<(), StrataError> {
        let mut state = self.state()?;
        let obj = state.objects.get_mut(&data_id).ok_or_else(|| {
            write_failure(format!("no data object {} in catalog", data_id))
        })?;
        let before = obj.replicas.len();
        obj.replicas.retain(|r| r.replica_number != replica_number);
        if obj.replicas.len() == before {
            return Err(write_failure(format!(
                "no replica {} of data object {} in catalog",
                replica_number, data_id
            )));
        }
        if obj.replicas.is_empty() {
            state.objects.remove(&data_id);
            state.metadata.remove(&data_id);
            state.acls.remove(&data_id);
        }
        Ok(())
    }

    async fn apply_metadata(
        &self,
        data_id: DataId,
        avus: &[Avu],
    ) -> Result<(), StrataError> {
        let mut state = self.state()?;
        if !state.objects.contains_key(&data_id) {
            return Err(write_failure(format!(
                "no data object {} in catalog",
                data_id
            )));
        }
        let entry = state.metadata.entry(data_id).or_default();
        for avu in avus {
            if !entry.contains(avu) {
                entry.push(avu.clone());
            }
        }
        Ok(())
    }

    async fn apply_acl(
        &self,
        data_id: DataId,
        acl: &[AclEntry],
    ) -> Result<(), StrataError> {
        let mut state = self.state()?;
        if !state.objects.contains_key(&data_id) {
            return Err(write_failure(format!(
                "no data object {} in catalog",
                data_id
            )));
        }
        let entry = state.acls.entry(data_id).or_default();
        for grant in acl {
            entry.retain(|e| e.user != grant.user);
            entry.push(grant.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod memory_tests {
    use super::*;
    use crate::catalog::AccessLevel;
    use crate::model::{Hierarchy, ReplicaStatus};

    fn speculative(path: &str, leaf: &str) -> Replica {
        Replica::speculative(
            path,
            Hierarchy::single(leaf),
            1,
            format!("/vault/{}{}", leaf, path),
            "generic",
            0o600,
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn register_and_query() -> Result<(), StrataError> {
        let catalog = InMemoryCatalog::new();
        let r0 = catalog
            .register_replica(speculative("/z/home/u/f", "ufs0"))
            .await?;
        assert_eq!(r0.data_id, 10000);
        assert_eq!(r0.replica_number, 0);

        let mut second = speculative("/z/home/u/f", "ufs1");
        second.data_id = r0.data_id;
        let r1 = catalog.register_replica(second).await?;
        assert_eq!(r1.replica_number, 1);

        let obj = catalog.fetch_object("/z/home/u/f").await?.unwrap();
        assert_eq!(obj.replicas.len(), 2);
        assert!(catalog.fetch_object("/z/home/u/g").await?.is_none());

        // same path twice as a brand-new object
        assert!(catalog
            .register_replica(speculative("/z/home/u/f", "ufs2"))
            .await
            .is_err());

        let rows = catalog
            .query(&CatalogFilter::Collection("/z/home".into()))
            .await?;
        assert_eq!(rows.len(), 2);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn batch_update_all_or_nothing() -> Result<(), StrataError> {
        let catalog = InMemoryCatalog::new();
        let r0 = catalog
            .register_replica(speculative("/z/home/u/f", "ufs0"))
            .await?;

        let res = catalog
            .update_replicas(
                r0.data_id,
                &[
                    (0, ReplicaFields::status(ReplicaStatus::Good)),
                    (5, ReplicaFields::status(ReplicaStatus::Good)),
                ],
            )
            .await;
        assert!(res.is_err_and(|e| e.kind() == ErrorKind::CatalogWrite));
        let obj = catalog.fetch_object("/z/home/u/f").await?.unwrap();
        assert_eq!(obj.replicas[0].status, ReplicaStatus::Intermediate);

        catalog
            .update_replica(r0.data_id, 0, ReplicaFields::status(ReplicaStatus::Good))
            .await?;
        let obj = catalog.fetch_object("/z/home/u/f").await?.unwrap();
        assert_eq!(obj.replicas[0].status, ReplicaStatus::Good);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn unregister_last_row() -> Result<(), StrataError> {
        let catalog = InMemoryCatalog::new();
        let r0 = catalog
            .register_replica(speculative("/z/home/u/f", "ufs0"))
            .await?;
        catalog
            .apply_metadata(
                r0.data_id,
                &[Avu {
                    attribute: "a".into(),
                    value: "1".into(),
                    unit: "".into(),
                }],
            )
            .await?;
        assert_eq!(catalog.metadata_of(r0.data_id).len(), 1);

        catalog.unregister_replica(r0.data_id, 0).await?;
        assert!(catalog.fetch_object("/z/home/u/f").await?.is_none());
        assert!(catalog.metadata_of(r0.data_id).is_empty());
        assert!(catalog.unregister_replica(r0.data_id, 0).await.is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn acl_replaces_per_user() -> Result<(), StrataError> {
        let catalog = InMemoryCatalog::new();
        let r0 = catalog
            .register_replica(speculative("/z/home/u/f", "ufs0"))
            .await?;
        let grant = |level| AclEntry {
            user: "alice".into(),
            level,
        };
        catalog.apply_acl(r0.data_id, &[grant(AccessLevel::Read)]).await?;
        catalog.apply_acl(r0.data_id, &[grant(AccessLevel::Own)]).await?;
        assert_eq!(catalog.acl_of(r0.data_id), vec![grant(AccessLevel::Own)]);
        Ok(())
    }
}
