//! Logical lock manager: per data object read/write locks with immediate
//! failure on conflict. Write locks also drive replica statuses in the RST.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::coord::ReplicaStateTable;
use crate::model::{DataId, ReplicaNumber, ReplicaStatus};
use crate::utils::{ErrorKind, StrataError};

/// Kind of logical lock.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum LockKind {
    Read,
    Write,
}

/// Observable lock state of a data object.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum LockState {
    Unlocked,
    ReadLocked(usize),
    WriteLocked,
}

/// What status a replica takes when a write lock goes away.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum StatusRestore {
    /// Back to the status it had before locking.
    Restore,
    /// Forced to given status.
    Set(ReplicaStatus),
}

#[derive(Debug)]
struct LockEntry {
    kind: LockKind,

    /// Number of holders; always 1 for a write lock.
    holders: usize,

    /// Replica statuses captured when the write lock drove them.
    saved: HashMap<ReplicaNumber, ReplicaStatus>,
}

/// Process-wide lock table.
#[derive(Debug)]
pub struct LockManager {
    locks: Mutex<HashMap<DataId, LockEntry>>,

    /// Staging table the write locks drive replica statuses through.
    rst: Arc<ReplicaStateTable>,
}

// LockManager public API implementation
impl LockManager {
    pub fn new(rst: Arc<ReplicaStateTable>) -> Self {
        LockManager {
            locks: Mutex::new(HashMap::new()),
            rst,
        }
    }

    fn locks(
        &self,
    ) -> Result<MutexGuard<'_, HashMap<DataId, LockEntry>>, StrataError> {
        self.locks
            .lock()
            .map_err(|_| StrataError::msg("lock table mutex poisoned"))
    }

    pub fn state(&self, data_id: DataId) -> Result<LockState, StrataError> {
        Ok(match self.locks()?.get(&data_id) {
            None => LockState::Unlocked,
            Some(e) if e.kind == LockKind::Read => LockState::ReadLocked(e.holders),
            Some(_) => LockState::WriteLocked,
        })
    }

    /// Takes a lock without queueing: fails with `ReplicaLocked` if the
    /// request conflicts with current holders. Read locks stack.
    pub fn lock(&self, data_id: DataId, kind: LockKind) -> Result<(), StrataError> {
        let mut locks = self.locks()?;
        match locks.get_mut(&data_id) {
            None => {
                locks.insert(
                    data_id,
                    LockEntry {
                        kind,
                        holders: 1,
                        saved: HashMap::new(),
                    },
                );
            }
            Some(entry)
                if entry.kind == LockKind::Read && kind == LockKind::Read =>
            {
                entry.holders += 1;
            }
            Some(entry) => {
                return Err(StrataError::new(
                    ErrorKind::ReplicaLocked,
                    format!(
                        "data object {} is {:?}-locked, cannot take {:?} lock",
                        data_id, entry.kind, kind
                    ),
                ));
            }
        }
        pf_trace!("locked {} {:?}", data_id, kind);
        Ok(())
    }

    /// Write-locks a staged data object and drives the after-image: the
    /// target replica (if any) becomes `Intermediate` and every other
    /// replica `WriteLocked`. Original statuses are saved for restoring.
    pub fn lock_for_write(
        &self,
        data_id: DataId,
        target: Option<ReplicaNumber>,
    ) -> Result<(), StrataError> {
        self.lock(data_id, LockKind::Write)?;

        let saved = self.rst.update_with(data_id, |after| {
            let mut saved = HashMap::new();
            for replica in after.replicas.iter_mut() {
                saved.insert(replica.replica_number, replica.status);
                replica.status = if Some(replica.replica_number) == target {
                    ReplicaStatus::Intermediate
                } else {
                    ReplicaStatus::WriteLocked
                };
            }
            Ok(saved)
        });

        match saved {
            Ok(saved) => {
                if let Some(entry) = self.locks()?.get_mut(&data_id) {
                    entry.saved = saved;
                }
                Ok(())
            }
            Err(e) => {
                self.release(data_id);
                Err(e)
            }
        }
    }

    /// Sets terminal statuses in the after-image while keeping the lock:
    /// `target` gets `target_status`, every other replica `others`.
    /// Replicas without a saved status (registered after locking) are left
    /// alone under `Restore`.
    pub fn drive_statuses(
        &self,
        data_id: DataId,
        target: Option<ReplicaNumber>,
        target_status: StatusRestore,
        others: StatusRestore,
    ) -> Result<(), StrataError> {
        let locks = self.locks()?;
        match locks.get(&data_id) {
            Some(e) if e.kind == LockKind::Write => {
                self.drive_saved(data_id, &e.saved, target, target_status, others)
            }
            _ => Err(StrataError::new(
                ErrorKind::Internal,
                format!("data object {} not write-locked", data_id),
            )),
        }
    }

    /// Applies status policies to the after-image. Called with the lock
    /// table held, so lock state cannot change underneath.
    fn drive_saved(
        &self,
        data_id: DataId,
        saved: &HashMap<ReplicaNumber, ReplicaStatus>,
        target: Option<ReplicaNumber>,
        target_status: StatusRestore,
        others: StatusRestore,
    ) -> Result<(), StrataError> {
        self.rst.update_with(data_id, |after| {
            for replica in after.replicas.iter_mut() {
                let policy = if Some(replica.replica_number) == target {
                    target_status
                } else {
                    others
                };
                match policy {
                    StatusRestore::Set(status) => replica.status = status,
                    StatusRestore::Restore => {
                        if let Some(status) = saved.get(&replica.replica_number)
                        {
                            replica.status = *status;
                        }
                    }
                }
            }
            Ok(())
        })
    }

    fn release_in(locks: &mut HashMap<DataId, LockEntry>, data_id: DataId) {
        if let Some(entry) = locks.get_mut(&data_id) {
            entry.holders = entry.holders.saturating_sub(1);
            if entry.holders == 0 {
                locks.remove(&data_id);
                pf_trace!("unlocked {}", data_id);
            }
        }
    }

    /// Drops one holder; the entry goes away with its last holder.
    pub fn release(&self, data_id: DataId) {
        match self.locks() {
            Ok(mut locks) => Self::release_in(&mut locks, data_id),
            Err(e) => pf_error!("releasing {} failed: {}", data_id, e),
        }
    }

    /// Releases a lock and, for a write lock, drives replica statuses to
    /// their terminal values under the same table guard.
    pub fn unlock(
        &self,
        data_id: DataId,
        target: Option<ReplicaNumber>,
        target_status: StatusRestore,
        others: StatusRestore,
    ) -> Result<(), StrataError> {
        let mut locks = self.locks()?;
        let res = match locks.get(&data_id) {
            Some(e) if e.kind == LockKind::Write => {
                self.drive_saved(data_id, &e.saved, target, target_status, others)
            }
            _ => Ok(()),
        };
        Self::release_in(&mut locks, data_id);
        res
    }
}

#[cfg(test)]
mod locking_tests {
    use super::*;
    use crate::model::{DataObject, Hierarchy, Replica};

    fn staged(rst: &ReplicaStateTable, statuses: &[ReplicaStatus]) -> DataId {
        let mut obj = DataObject::new(7, "/z/home/u/f");
        for (i, status) in statuses.iter().enumerate() {
            let mut r = Replica::speculative(
                "/z/home/u/f",
                Hierarchy::single(format!("ufs{}", i)),
                i as u64,
                format!("/vault{}/f", i),
                "generic",
                0o600,
            );
            r.data_id = 7;
            r.replica_number = i as ReplicaNumber;
            r.status = *status;
            obj.replicas.push(r);
        }
        rst.insert(&obj).unwrap();
        7
    }

    fn statuses(rst: &ReplicaStateTable, data_id: DataId) -> Vec<ReplicaStatus> {
        rst.after_image(data_id)
            .unwrap()
            .replicas
            .iter()
            .map(|r| r.status)
            .collect()
    }

    #[test]
    fn write_excludes_everyone() {
        let locks = LockManager::new(Arc::new(ReplicaStateTable::new()));
        assert_eq!(locks.state(1).unwrap(), LockState::Unlocked);
        locks.lock(1, LockKind::Write).unwrap();
        assert_eq!(locks.state(1).unwrap(), LockState::WriteLocked);
        assert!(locks
            .lock(1, LockKind::Write)
            .is_err_and(|e| e.kind() == ErrorKind::ReplicaLocked));
        assert!(locks.lock(1, LockKind::Read).is_err());
        locks.lock(2, LockKind::Write).unwrap();
        locks.release(1);
        assert_eq!(locks.state(1).unwrap(), LockState::Unlocked);
        locks.lock(1, LockKind::Read).unwrap();
    }

    #[test]
    fn readers_stack_and_block_writer() {
        let locks = LockManager::new(Arc::new(ReplicaStateTable::new()));
        locks.lock(1, LockKind::Read).unwrap();
        locks.lock(1, LockKind::Read).unwrap();
        assert_eq!(locks.state(1).unwrap(), LockState::ReadLocked(2));
        assert!(locks
            .lock(1, LockKind::Write)
            .is_err_and(|e| e.kind() == ErrorKind::ReplicaLocked));
        locks.release(1);
        assert!(locks.lock(1, LockKind::Write).is_err());
        locks.release(1);
        locks.lock(1, LockKind::Write).unwrap();
    }

    #[test]
    fn write_lock_drives_and_restores() {
        let rst = Arc::new(ReplicaStateTable::new());
        let locks = LockManager::new(rst.clone());
        let data_id = staged(&rst, &[ReplicaStatus::Good, ReplicaStatus::Stale]);

        locks.lock_for_write(data_id, Some(0)).unwrap();
        assert_eq!(
            statuses(&rst, data_id),
            vec![ReplicaStatus::Intermediate, ReplicaStatus::WriteLocked]
        );

        locks
            .unlock(
                data_id,
                Some(0),
                StatusRestore::Restore,
                StatusRestore::Restore,
            )
            .unwrap();
        assert_eq!(
            statuses(&rst, data_id),
            vec![ReplicaStatus::Good, ReplicaStatus::Stale]
        );
        assert_eq!(locks.state(data_id).unwrap(), LockState::Unlocked);
    }

    #[test]
    fn write_lock_terminal_statuses() {
        let rst = Arc::new(ReplicaStateTable::new());
        let locks = LockManager::new(rst.clone());
        let data_id = staged(&rst, &[ReplicaStatus::Good, ReplicaStatus::Good]);

        locks.lock_for_write(data_id, Some(1)).unwrap();
        locks
            .drive_statuses(
                data_id,
                Some(1),
                StatusRestore::Set(ReplicaStatus::Good),
                StatusRestore::Set(ReplicaStatus::Stale),
            )
            .unwrap();
        assert_eq!(locks.state(data_id).unwrap(), LockState::WriteLocked);
        assert_eq!(
            statuses(&rst, data_id),
            vec![ReplicaStatus::Stale, ReplicaStatus::Good]
        );

        // a failure after that can still restore from saved statuses
        locks
            .unlock(
                data_id,
                Some(1),
                StatusRestore::Set(ReplicaStatus::Stale),
                StatusRestore::Restore,
            )
            .unwrap();
        assert_eq!(
            statuses(&rst, data_id),
            vec![ReplicaStatus::Good, ReplicaStatus::Stale]
        );
    }

    #[test]
    fn unstaged_write_lock_rolls_back() {
        let locks = LockManager::new(Arc::new(ReplicaStateTable::new()));
        assert!(locks
            .lock_for_write(5, None)
            .is_err_and(|e| e.kind() == ErrorKind::NotStaged));
        assert_eq!(locks.state(5).unwrap(), LockState::Unlocked);
    }

    #[test]
    fn poisoned_table_fails_loudly() {
        let locks = Arc::new(LockManager::new(Arc::new(ReplicaStateTable::new())));
        locks.lock(1, LockKind::Write).unwrap();
        let holder = locks.clone();
        let died = std::thread::spawn(move || {
            let _guard = holder.locks.lock().unwrap();
            panic!("holder died with the table locked");
        })
        .join();
        assert!(died.is_err());

        assert!(locks.state(1).is_err());
        assert!(locks.lock(2, LockKind::Read).is_err());
        assert!(locks
            .unlock(1, None, StatusRestore::Restore, StatusRestore::Restore)
            .is_err());
    }
}
