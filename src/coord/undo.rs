//! Compensating actions registered right after each acquisition inside a
//! coordinator sequence, run in reverse order if the sequence fails.

use std::sync::Arc;

use crate::coord::{AgentId, Coordinator, ReplicaToken, StatusRestore};
use crate::model::{DataId, ReplicaNumber};
use crate::storage::{L3Fd, StorageDriver};
use crate::utils::StrataError;

/// One compensating action.
#[derive(Debug)]
pub(crate) enum Undo {
    /// Drop the RST entry, unless it was parked.
    EraseRst(DataId),

    /// Restore replica statuses saved by the write lock, publish them, and
    /// release the lock. If the publish fails the entry is parked and the
    /// lock kept.
    Unlock {
        data_id: DataId,
        target: Option<ReplicaNumber>,
    },

    /// Release one read-lock holder.
    ReleaseRead(DataId),

    /// Close a physical descriptor.
    Close {
        driver: Arc<dyn StorageDriver>,
        fd: L3Fd,
    },

    /// Remove a physical file created by the sequence.
    Unlink {
        driver: Arc<dyn StorageDriver>,
        path: String,
    },

    /// Remove a catalog row registered by the sequence.
    Unregister {
        data_id: DataId,
        replica_number: ReplicaNumber,
    },

    /// Detach an agent from an access token.
    EraseAgent {
        token: ReplicaToken,
        agent: AgentId,
    },
}

/// Ordered list of pending compensations. Must end in either `disarm()` or
/// `unwind()`.
#[derive(Debug, Default)]
pub(crate) struct UndoStack {
    actions: Vec<Undo>,
}

impl UndoStack {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, action: Undo) {
        self.actions.push(action);
    }

    /// Success path: nothing to compensate.
    pub(crate) fn disarm(mut self) {
        self.actions.clear();
    }

    /// Disarms on `Ok`, unwinds on `Err`, and passes the result through.
    pub(crate) async fn settle<T>(
        self,
        coord: &Coordinator,
        result: Result<T, StrataError>,
    ) -> Result<T, StrataError> {
        match result {
            Ok(value) => {
                self.disarm();
                Ok(value)
            }
            Err(e) => {
                self.unwind(coord).await;
                Err(e)
            }
        }
    }

    /// Failure path: runs every action in reverse order. Failures here are
    /// logged and never mask the primary error.
    pub(crate) async fn unwind(mut self, coord: &Coordinator) {
        let actions = std::mem::take(&mut self.actions);
        for action in actions.into_iter().rev() {
            pf_warn!("rolling back: {:?}", action);
            match action {
                Undo::EraseRst(data_id) => {
                    if coord.tables.rst.is_parked(data_id) {
                        pf_warn!("keeping parked RST entry {}", data_id);
                    } else {
                        coord.tables.rst.erase(data_id);
                    }
                }

                Undo::Unlock { data_id, target } => {
                    let locks = &coord.tables.locks;
                    if let Err(e) = locks.drive_statuses(
                        data_id,
                        target,
                        StatusRestore::Restore,
                        StatusRestore::Restore,
                    ) {
                        pf_error!("restoring statuses of {} failed: {}", data_id, e);
                        locks.release(data_id);
                    } else if let Err(e) =
                        coord.tables.rst.publish(coord.catalog(), data_id).await
                    {
                        // the catalog may still show the replica
                        // intermediate: keep lock and entry for reconcile
                        pf_error!("publishing restore of {} failed: {}", data_id, e);
                        if let Err(e) = coord.tables.rst.park(data_id) {
                            pf_error!("parking {} failed: {}", data_id, e);
                            locks.release(data_id);
                        }
                    } else {
                        locks.release(data_id);
                    }
                }

                Undo::ReleaseRead(data_id) => coord.tables.locks.release(data_id),

                Undo::Close { driver, fd } => {
                    if let Err(e) = driver.close(fd).await {
                        pf_error!("closing fd {} failed: {}", fd, e);
                    }
                }

                Undo::Unlink { driver, path } => {
                    if let Err(e) = driver.unlink(&path).await {
                        pf_error!("unlinking '{}' failed: {}", path, e);
                    }
                }

                Undo::Unregister {
                    data_id,
                    replica_number,
                } => {
                    if let Err(e) = coord
                        .catalog()
                        .unregister_replica(data_id, replica_number)
                        .await
                    {
                        pf_error!(
                            "unregistering {}:{} failed: {}",
                            data_id,
                            replica_number,
                            e
                        );
                    }
                }

                Undo::EraseAgent { token, agent } => {
                    if let Err(e) = coord.tables.rat.erase_pid(&token, agent) {
                        pf_error!("detaching agent {} failed: {}", agent, e);
                    }
                }
            }
        }
    }
}

impl Drop for UndoStack {
    fn drop(&mut self) {
        if !self.actions.is_empty() {
            pf_error!(
                "undo stack dropped with {} pending actions",
                self.actions.len()
            );
        }
    }
}
