//! Creating a new replica: of a brand-new data object, or of an existing
//! object on a resource that does not hold one yet.

use crate::coord::undo::{Undo, UndoStack};
use crate::coord::{
    Connection, Coordinator, L1Fd, OpenDescriptor, OpenRequest, OpenType,
    OprType,
};
use crate::model::{DataObject, Hierarchy, Replica};
use crate::storage::{OpenFlags, Resource};
use crate::utils::StrataError;

// Coordinator create path implementation
impl Coordinator {
    pub(crate) async fn create_replica(
        &self,
        conn: &mut Connection,
        req: OpenRequest,
        opr: OprType,
        hierarchy: Hierarchy,
        object: Option<DataObject>,
    ) -> Result<L1Fd, StrataError> {
        let resource = self.resource(&hierarchy)?;
        let physical_path = resource.driver.vault_path(&req.logical_path)?;
        let speculative = Replica::speculative(
            &req.logical_path,
            hierarchy,
            resource.id,
            physical_path,
            req.data_type
                .as_deref()
                .unwrap_or(&self.config.default_data_type),
            req.mode.unwrap_or(self.config.default_mode),
        );

        if let Some(obj) = &object {
            if obj.locked_against(true, None) {
                return logged_err!(
                    ReplicaLocked;
                    "data object '{}' is locked",
                    obj.logical_path
                );
            }
        }

        let mut undo = UndoStack::new();
        let result = self
            .create_steps(conn, req, opr, resource, speculative, object, &mut undo)
            .await;
        undo.settle(self, result).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn create_steps(
        &self,
        conn: &mut Connection,
        req: OpenRequest,
        opr: OprType,
        resource: Resource,
        mut speculative: Replica,
        object: Option<DataObject>,
        undo: &mut UndoStack,
    ) -> Result<L1Fd, StrataError> {
        let rst = &self.tables.rst;
        let locks = &self.tables.locks;

        let registered = match object {
            Some(obj) => {
                // new replica of an existing object: lock before registering
                // so that concurrent creators cannot both register
                let data_id = obj.data_id;
                self.stage(&obj)?;
                undo.push(Undo::EraseRst(data_id));
                locks.lock_for_write(data_id, None)?;
                undo.push(Undo::Unlock {
                    data_id,
                    target: None,
                });
                rst.publish(self.catalog(), data_id).await?;

                speculative.data_id = data_id;
                let registered =
                    self.catalog().register_replica(speculative).await?;
                undo.push(Undo::Unregister {
                    data_id,
                    replica_number: registered.replica_number,
                });
                rst.insert_replica(&registered)?;
                registered
            }

            None => {
                // a brand-new object has no id to lock before registering;
                // losing the registration race counts as finding it locked
                let registered =
                    match self.catalog().register_replica(speculative).await {
                        Ok(registered) => registered,
                        Err(e) => {
                            if self
                                .catalog()
                                .fetch_object(&req.logical_path)
                                .await?
                                .is_some()
                            {
                                return logged_err!(
                                    ReplicaLocked;
                                    "'{}' created concurrently: {}",
                                    req.logical_path,
                                    e
                                );
                            }
                            return Err(e);
                        }
                    };
                let data_id = registered.data_id;
                undo.push(Undo::Unregister {
                    data_id,
                    replica_number: registered.replica_number,
                });

                let mut obj = DataObject::new(data_id, &registered.logical_path);
                obj.replicas.push(registered.clone());
                self.stage(&obj)?;
                undo.push(Undo::EraseRst(data_id));
                locks.lock_for_write(data_id, Some(registered.replica_number))?;
                undo.push(Undo::Unlock {
                    data_id,
                    target: Some(registered.replica_number),
                });
                registered
            }
        };
        let (data_id, num) = (registered.data_id, registered.replica_number);
        pf_debug!(
            "registered replica {}:{} on '{}'",
            data_id,
            num,
            registered.hierarchy
        );

        let driver = resource.driver.clone();
        let l3 = driver
            .create(&registered.physical_path, registered.mode)
            .await?;
        undo.push(Undo::Unlink {
            driver: driver.clone(),
            path: registered.physical_path.clone(),
        });
        undo.push(Undo::Close { driver, fd: l3 });

        let token = self.tables.rat.create_new_entry(data_id, num, conn.agent)?;
        undo.push(Undo::EraseAgent {
            token: token.clone(),
            agent: conn.agent,
        });

        let flags = OpenFlags {
            read: true,
            write: true,
            create: true,
            truncate: false,
        };
        conn.descriptors.alloc(OpenDescriptor {
            data_id,
            replica_number: num,
            replica: registered,
            resource,
            l3,
            token: Some(token),
            flags,
            open_type: OpenType::Create,
            opr,
            bytes_written: 0,
            holds_lock: true,
            request: req,
            portal: None,
        })
    }
}

#[cfg(test)]
mod create_tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::coord::coord_tests::Fixture;
    use crate::coord::{Intent, Resolution, ResourceResolver};
    use crate::utils::ErrorKind;
    use async_trait::async_trait;
    use std::sync::Arc;

    const PATH: &str = "/z/home/u/f";

    /// Resolver whose catalog view predates any registration, as seen by
    /// a creator that resolved just before a concurrent one registered.
    #[derive(Debug)]
    struct StaleView;

    #[async_trait]
    impl ResourceResolver for StaleView {
        async fn resolve(
            &self,
            _catalog: &dyn Catalog,
            _logical_path: &str,
            _intent: Intent,
            _requested: Option<&str>,
        ) -> Result<Resolution, StrataError> {
            Ok(Resolution {
                hierarchy: Hierarchy::single("ufs0"),
                object: None,
            })
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn racing_creators_see_locked() -> Result<(), StrataError> {
        let fx = Fixture::new(33620)?;
        let (mut winner, mut loser) = (Connection::new(1), Connection::new(2));
        let create = OpenRequest::new(PATH, OpenFlags::WRONLY.with_create());
        let fd = fx.coord.open(&mut winner, create.clone()).await?;
        let data_id = winner.descriptor(fd)?.data_id;
        assert_eq!(winner.descriptor(fd)?.open_type, OpenType::Create);

        let racing = Coordinator::new(
            fx.coord.config().clone(),
            fx.coord.portal_config().clone(),
            fx.catalog.clone(),
            fx.coord.resources.clone(),
            fx.coord.tables().clone(),
        )?
        .with_resolver(Arc::new(StaleView));
        assert!(racing
            .open(&mut loser, create)
            .await
            .is_err_and(|e| e.kind() == ErrorKind::ReplicaLocked));
        assert!(loser.open_fds().is_empty());
        assert_eq!(fx.object(PATH).await?.replicas.len(), 1);

        fx.coord.close(&mut winner, fd).await?;
        assert!(fx.quiescent(data_id));
        Ok(())
    }
}
