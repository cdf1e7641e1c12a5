//! Replica state table (RST): in-memory before/after staging of replicas
//! being mutated, committed to the catalog by diffing the two images.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::catalog::{Catalog, ReplicaFields};
use crate::model::{DataId, DataObject, Replica, ReplicaNumber};
use crate::utils::{ErrorKind, StrataError};

/// Staged before/after images of one data object.
#[derive(Debug, Clone)]
struct RstEntry {
    /// Image as last known to the catalog.
    before: DataObject,

    /// Image with all staged changes applied.
    after: DataObject,

    /// Set once the owning session is gone but the after-image could not
    /// be published; such an entry waits for reconciliation.
    parked: bool,
}

/// Process-wide staging table, at most one entry per data id.
#[derive(Debug, Default)]
pub struct ReplicaStateTable {
    entries: Mutex<HashMap<DataId, RstEntry>>,
}

fn not_staged(data_id: DataId) -> StrataError {
    StrataError::new(
        ErrorKind::NotStaged,
        format!("data object {} not staged in RST", data_id),
    )
}

// ReplicaStateTable public API implementation
impl ReplicaStateTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(
        &self,
    ) -> Result<MutexGuard<'_, HashMap<DataId, RstEntry>>, StrataError> {
        self.entries
            .lock()
            .map_err(|_| StrataError::msg("RST mutex poisoned"))
    }

    /// Stages a data object. Fails with `AlreadyStaged` if an entry for its
    /// data id exists.
    pub fn insert(&self, obj: &DataObject) -> Result<(), StrataError> {
        let mut entries = self.entries()?;
        if entries.contains_key(&obj.data_id) {
            return logged_err!(
                AlreadyStaged;
                "data object {} already staged in RST",
                obj.data_id
            );
        }
        entries.insert(
            obj.data_id,
            RstEntry {
                before: obj.clone(),
                after: obj.clone(),
                parked: false,
            },
        );
        pf_trace!("RST insert {}", obj.data_id);
        Ok(())
    }

    /// Adds a freshly registered replica to both images of an existing
    /// entry, at the front of the replica list.
    pub fn insert_replica(&self, replica: &Replica) -> Result<(), StrataError> {
        let mut entries = self.entries()?;
        let entry = entries
            .get_mut(&replica.data_id)
            .ok_or_else(|| not_staged(replica.data_id))?;
        entry.before.push_front(replica.clone());
        entry.after.push_front(replica.clone());
        Ok(())
    }

    pub fn contains(&self, data_id: DataId) -> bool {
        self.entries()
            .map(|entries| entries.contains_key(&data_id))
            .unwrap_or(false)
    }

    /// Removes an entry; no-op if absent.
    pub fn erase(&self, data_id: DataId) {
        if let Ok(mut entries) = self.entries() {
            if entries.remove(&data_id).is_some() {
                pf_trace!("RST erase {}", data_id);
            }
        }
    }

    /// Hands an entry over to reconciliation: it stays in the table, with
    /// its images, after its session ends.
    pub fn park(&self, data_id: DataId) -> Result<(), StrataError> {
        let mut entries = self.entries()?;
        let entry = entries.get_mut(&data_id).ok_or_else(|| not_staged(data_id))?;
        entry.parked = true;
        pf_warn!("RST park {}", data_id);
        Ok(())
    }

    pub fn is_parked(&self, data_id: DataId) -> bool {
        self.entries()
            .map(|entries| entries.get(&data_id).is_some_and(|e| e.parked))
            .unwrap_or(false)
    }

    /// Data ids of parked entries, in ascending order.
    pub fn parked(&self) -> Result<Vec<DataId>, StrataError> {
        let mut ids: Vec<DataId> = self
            .entries()?
            .iter()
            .filter(|(_, e)| e.parked)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    /// Merges field changes into the after-image of one replica.
    pub fn update(
        &self,
        data_id: DataId,
        replica_number: ReplicaNumber,
        fields: &ReplicaFields,
    ) -> Result<(), StrataError> {
        self.update_with(data_id, |after| {
            let replica =
                after.replica_mut(replica_number).ok_or_else(|| {
                    StrataError::new(
                        ErrorKind::ReplicaNotFound,
                        format!(
                            "replica {} of {} not staged",
                            replica_number, data_id
                        ),
                    )
                })?;
            fields.apply_to(replica);
            Ok(())
        })
    }

    /// Runs a closure over the after-image while holding the table lock.
    pub(crate) fn update_with<F, R>(
        &self,
        data_id: DataId,
        f: F,
    ) -> Result<R, StrataError>
    where
        F: FnOnce(&mut DataObject) -> Result<R, StrataError>,
    {
        let mut entries = self.entries()?;
        let entry = entries.get_mut(&data_id).ok_or_else(|| not_staged(data_id))?;
        f(&mut entry.after)
    }

    /// Copy of the after-image.
    pub fn after_image(&self, data_id: DataId) -> Result<DataObject, StrataError> {
        self.entries()?
            .get(&data_id)
            .map(|e| e.after.clone())
            .ok_or_else(|| not_staged(data_id))
    }

    /// Copy of the before-image.
    pub fn before_image(
        &self,
        data_id: DataId,
    ) -> Result<DataObject, StrataError> {
        self.entries()?
            .get(&data_id)
            .map(|e| e.before.clone())
            .ok_or_else(|| not_staged(data_id))
    }

    /// Per-replica minimal updates turning the before-image into the
    /// after-image.
    fn pending_updates(
        entry: &RstEntry,
    ) -> Vec<(ReplicaNumber, ReplicaFields)> {
        entry
            .after
            .replicas
            .iter()
            .filter_map(|after| {
                let before = entry.before.replica(after.replica_number)?;
                let fields = ReplicaFields::diff(before, after);
                (!fields.is_empty()).then_some((after.replica_number, fields))
            })
            .collect()
    }

    /// Commits the differences between the two images to the catalog in a
    /// single batch, after merging `extra` into the after-image of
    /// `replica_number`. On success the before-image catches up with what
    /// was committed; on failure nothing changes in the catalog and the
    /// entry stays as it was.
    pub async fn publish_to_catalog(
        &self,
        catalog: &dyn Catalog,
        data_id: DataId,
        replica_number: ReplicaNumber,
        extra: &ReplicaFields,
    ) -> Result<(), StrataError> {
        let updates = {
            let mut entries = self.entries()?;
            let entry =
                entries.get_mut(&data_id).ok_or_else(|| not_staged(data_id))?;
            if !extra.is_empty() {
                let replica = entry
                    .after
                    .replica_mut(replica_number)
                    .ok_or_else(|| {
                        StrataError::new(
                            ErrorKind::ReplicaNotFound,
                            format!(
                                "replica {} of {} not staged",
                                replica_number, data_id
                            ),
                        )
                    })?;
                extra.apply_to(replica);
            }
            Self::pending_updates(entry)
        };

        if updates.is_empty() {
            return Ok(());
        }
        pf_debug!(
            "RST publish {} ({} replica rows)",
            data_id,
            updates.len()
        );

        if let Err(e) = catalog.update_replicas(data_id, &updates).await {
            pf_error!("RST publish {} failed: {}", data_id, e);
            return Err(StrataError::new(ErrorKind::CatalogWrite, e));
        }

        // only the committed fields move into the before-image, so changes
        // staged concurrently with the catalog call stay pending
        let mut entries = self.entries()?;
        if let Some(entry) = entries.get_mut(&data_id) {
            for (num, fields) in &updates {
                if let Some(before) = entry.before.replica_mut(*num) {
                    fields.apply_to(before);
                }
            }
        }
        Ok(())
    }

    /// Commits staged differences with no extra fields.
    pub async fn publish(
        &self,
        catalog: &dyn Catalog,
        data_id: DataId,
    ) -> Result<(), StrataError> {
        self.publish_to_catalog(
            catalog,
            data_id,
            0,
            &ReplicaFields::default(),
        )
        .await
    }
}

#[cfg(test)]
pub(crate) mod rst_tests {
    use super::*;
    use crate::catalog::{CatalogFilter, InMemoryCatalog};
    use crate::model::{Hierarchy, ReplicaStatus};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Catalog wrapper failing the next `n` batch updates, optionally
    /// after letting a few through.
    #[derive(Debug, Default)]
    pub(crate) struct FaultyCatalog {
        pub(crate) inner: InMemoryCatalog,
        pub(crate) pass_updates: AtomicUsize,
        pub(crate) fail_updates: AtomicUsize,
    }

    impl FaultyCatalog {
        pub(crate) fn fail_next_updates(&self, n: usize) {
            self.fail_updates_after(0, n);
        }

        pub(crate) fn fail_updates_after(&self, pass: usize, n: usize) {
            self.pass_updates.store(pass, Ordering::SeqCst);
            self.fail_updates.store(n, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Catalog for FaultyCatalog {
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
            let pass = self.pass_updates.load(Ordering::SeqCst);
            if pass > 0 {
                self.pass_updates.store(pass - 1, Ordering::SeqCst);
                return self.inner.update_replicas(data_id, updates).await;
            }
            let left = self.fail_updates.load(Ordering::SeqCst);
            if left > 0 {
                self.fail_updates.store(left - 1, Ordering::SeqCst);
                return Err(StrataError::new(
                    ErrorKind::CatalogWrite,
                    "injected catalog failure",
                ));
            }
            self.inner.update_replicas(data_id, updates).await
        }

        async fn register_replica(
            &self,
            replica: Replica,
        ) -> Result<Replica, StrataError> {
            self.inner.register_replica(replica).await
        }

        async fn unregister_replica(
            &self,
            data_id: DataId,
            replica_number: ReplicaNumber,
        ) -> Result<(), StrataError> {
            self.inner.unregister_replica(data_id, replica_number).await
        }

        async fn apply_metadata(
            &self,
            data_id: DataId,
            avus: &[crate::catalog::Avu],
        ) -> Result<(), StrataError> {
            self.inner.apply_metadata(data_id, avus).await
        }

        async fn apply_acl(
            &self,
            data_id: DataId,
            acl: &[crate::catalog::AclEntry],
        ) -> Result<(), StrataError> {
            self.inner.apply_acl(data_id, acl).await
        }
    }

    async fn registered(
        catalog: &dyn Catalog,
        leaves: &[&str],
    ) -> Result<DataObject, StrataError> {
        let mut data_id = 0;
        for leaf in leaves {
            let mut r = Replica::speculative(
                "/z/home/u/f",
                Hierarchy::single(leaf),
                1,
                format!("/vault/{}/f", leaf),
                "generic",
                0o600,
            );
            r.data_id = data_id;
            r.status = ReplicaStatus::Good;
            data_id = catalog.register_replica(r).await?.data_id;
        }
        Ok(catalog.fetch_object("/z/home/u/f").await?.unwrap())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn insert_twice_fails() -> Result<(), StrataError> {
        let catalog = InMemoryCatalog::new();
        let obj = registered(&catalog, &["ufs0"]).await?;
        let rst = ReplicaStateTable::new();
        rst.insert(&obj)?;
        assert!(rst.contains(obj.data_id));
        assert!(rst
            .insert(&obj)
            .is_err_and(|e| e.kind() == ErrorKind::AlreadyStaged));
        rst.erase(obj.data_id);
        rst.erase(obj.data_id);
        assert!(!rst.contains(obj.data_id));
        rst.insert(&obj)?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn sequential_updates_accumulate() -> Result<(), StrataError> {
        let catalog = InMemoryCatalog::new();
        let obj = registered(&catalog, &["ufs0", "ufs1"]).await?;
        let rst = ReplicaStateTable::new();
        rst.insert(&obj)?;

        rst.update(
            obj.data_id,
            0,
            &ReplicaFields {
                size: Some(12),
                ..Default::default()
            },
        )?;
        rst.update(
            obj.data_id,
            0,
            &ReplicaFields {
                checksum: Some(Some("sha2:xyz".into())),
                ..Default::default()
            },
        )?;
        rst.update(obj.data_id, 1, &ReplicaFields::status(ReplicaStatus::Stale))?;
        assert!(rst.update(obj.data_id, 9, &ReplicaFields::default()).is_err());

        // nothing reaches the catalog before publishing
        let row = catalog.fetch_object("/z/home/u/f").await?.unwrap();
        assert_eq!(row.replicas[0].size, 0);

        rst.publish(&catalog, obj.data_id).await?;
        let row = catalog.fetch_object("/z/home/u/f").await?.unwrap();
        assert_eq!(row.replicas[0].size, 12);
        assert_eq!(row.replicas[0].checksum.as_deref(), Some("sha2:xyz"));
        assert_eq!(row.replicas[1].status, ReplicaStatus::Stale);

        // images agree after a publish
        assert_eq!(
            rst.before_image(obj.data_id)?,
            rst.after_image(obj.data_id)?
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn failed_publish_changes_nothing() -> Result<(), StrataError> {
        let catalog = FaultyCatalog::default();
        let obj = registered(&catalog, &["ufs0"]).await?;
        let rst = ReplicaStateTable::new();
        rst.insert(&obj)?;
        rst.update(
            obj.data_id,
            0,
            &ReplicaFields {
                size: Some(99),
                status: Some(ReplicaStatus::Stale),
                ..Default::default()
            },
        )?;

        catalog.fail_next_updates(1);
        let extra = ReplicaFields {
            checksum: Some(Some("sha2:abc".into())),
            ..Default::default()
        };
        let res = rst.publish_to_catalog(&catalog, obj.data_id, 0, &extra).await;
        assert!(res.is_err_and(|e| e.kind() == ErrorKind::CatalogWrite));
        let row = catalog.fetch_object("/z/home/u/f").await?.unwrap();
        assert_eq!(row.replicas[0], obj.replicas[0]);

        // the staged changes are still pending and go through on retry
        rst.publish(&catalog, obj.data_id).await?;
        let row = catalog.fetch_object("/z/home/u/f").await?.unwrap();
        assert_eq!(row.replicas[0].size, 99);
        assert_eq!(row.replicas[0].checksum.as_deref(), Some("sha2:abc"));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn registered_replica_joins_entry() -> Result<(), StrataError> {
        let catalog = InMemoryCatalog::new();
        let obj = registered(&catalog, &["ufs0"]).await?;
        let rst = ReplicaStateTable::new();
        rst.insert(&obj)?;

        let mut r1 = obj.replicas[0].clone();
        r1.replica_number = 1;
        r1.hierarchy = Hierarchy::single("ufs1");
        r1.status = ReplicaStatus::Intermediate;
        rst.insert_replica(&r1)?;
        let after = rst.after_image(obj.data_id)?;
        assert_eq!(after.replicas[0].replica_number, 1);
        assert_eq!(after.replicas.len(), 2);

        r1.data_id = 424242;
        assert!(rst
            .insert_replica(&r1)
            .is_err_and(|e| e.kind() == ErrorKind::NotStaged));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn parked_entry_waits() -> Result<(), StrataError> {
        let catalog = InMemoryCatalog::new();
        let obj = registered(&catalog, &["ufs0"]).await?;
        let rst = ReplicaStateTable::new();
        assert!(rst
            .park(obj.data_id)
            .is_err_and(|e| e.kind() == ErrorKind::NotStaged));

        rst.insert(&obj)?;
        assert!(!rst.is_parked(obj.data_id));
        assert!(rst.parked()?.is_empty());
        rst.park(obj.data_id)?;
        assert!(rst.is_parked(obj.data_id));
        assert_eq!(rst.parked()?, vec![obj.data_id]);

        // still staged: a new session cannot take the object over
        assert!(rst
            .insert(&obj)
            .is_err_and(|e| e.kind() == ErrorKind::AlreadyStaged));
        rst.erase(obj.data_id);
        assert!(rst.parked()?.is_empty());
        Ok(())
    }
}
