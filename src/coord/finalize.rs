//! Closing descriptors and finalizing write sessions: commit on success,
//! stale on failure.

use crate::catalog::ReplicaFields;
use crate::coord::{
    compute_checksum, ChecksumMode, Connection, Coordinator, L1Fd,
    OpenDescriptor, OpenType, OprType, StatusRestore,
};
use crate::model::{now_secs, DataId, Replica, ReplicaStatus};
use crate::utils::{ErrorKind, StrataError};

// Coordinator finalize implementation
impl Coordinator {
    /// Closes a descriptor. Closing the last descriptor of a write session
    /// finalizes the replica.
    pub async fn close(
        &self,
        conn: &mut Connection,
        fd: L1Fd,
    ) -> Result<(), StrataError> {
        self.close_with_status(conn, fd, Ok(())).await.map(|_| ())
    }

    /// Closes a descriptor given the status of the work done through it;
    /// an error status finalizes the session as failed. Returns the
    /// committed replica when this close finalized a session.
    pub async fn close_with_status(
        &self,
        conn: &mut Connection,
        fd: L1Fd,
        status: Result<(), StrataError>,
    ) -> Result<Option<Replica>, StrataError> {
        let desc = conn.descriptors.free(fd)?;
        let closed = desc.resource.driver.close(desc.l3).await;
        let status = status.and(closed);

        if desc.open_type == OpenType::OpenForRead {
            if desc.holds_lock {
                self.tables.locks.release(desc.data_id);
            }
            return status.map(|_| None);
        }

        // only the last agent of a session finalizes
        if let Some(token) = &desc.token {
            match self.tables.rat.erase_pid(token, conn.agent) {
                Ok(0) => {}
                Ok(remaining) => {
                    pf_debug!(
                        "{}:{} still has {} agents attached",
                        desc.data_id,
                        desc.replica_number,
                        remaining
                    );
                    return status.map(|_| None);
                }
                Err(e) => {
                    pf_error!("token of fd {} gone at close: {}", fd, e);
                    return Err(status.err().unwrap_or(e));
                }
            }
        }

        match status {
            Ok(()) => self.finalize_success(&desc).await.map(Some),
            Err(e) => {
                self.finalize_on_failure(&desc).await;
                Err(e)
            }
        }
    }

    /// Runs the failure path for every descriptor a connection left open.
    /// Returns the number of descriptors closed.
    pub async fn close_all(&self, conn: &mut Connection) -> usize {
        let fds = conn.open_fds();
        for fd in &fds {
            let aborted = StrataError::new(
                ErrorKind::PhysicalIo,
                format!("agent {} terminated", conn.agent),
            );
            if let Err(e) = self.close_with_status(conn, *fd, Err(aborted)).await
            {
                pf_debug!("fd {} closed on termination: {}", fd, e);
            }
        }
        if !fds.is_empty() {
            pf_warn!(
                "agent {} terminated with {} open descriptors",
                conn.agent,
                fds.len()
            );
        }
        if let Err(e) = self.reconcile().await {
            pf_warn!("parked sessions left after agent {}: {}", conn.agent, e);
        }
        fds.len()
    }

    /// Publishes the after-image of every parked RST entry, then releases
    /// its write lock and erases it. Entries whose publish fails again stay
    /// parked. Returns the number reconciled, or the first failure.
    pub async fn reconcile(&self) -> Result<usize, StrataError> {
        let rst = &self.tables.rst;
        let mut reconciled = 0;
        let mut first_err = None;
        for data_id in rst.parked()? {
            match rst.publish(self.catalog(), data_id).await {
                Ok(()) => {
                    self.tables.locks.release(data_id);
                    rst.erase(data_id);
                    pf_info!("reconciled parked data object {}", data_id);
                    reconciled += 1;
                }
                Err(e) => {
                    pf_warn!("data object {} stays parked: {}", data_id, e);
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(reconciled),
        }
    }

    async fn finalize_success(
        &self,
        desc: &OpenDescriptor,
    ) -> Result<Replica, StrataError> {
        match self.commit_session(desc).await {
            Ok(replica) => Ok(replica),
            Err(e) => {
                pf_warn!(
                    "finalize of {}:{} failed: {}",
                    desc.data_id,
                    desc.replica_number,
                    e
                );
                self.finalize_on_failure(desc).await;
                Err(e)
            }
        }
    }

    async fn commit_session(
        &self,
        desc: &OpenDescriptor,
    ) -> Result<Replica, StrataError> {
        let (data_id, num) = (desc.data_id, desc.replica_number);
        let driver = &*desc.resource.driver;
        let path = &desc.replica.physical_path;
        let req = &desc.request;
        let rst = &self.tables.rst;

        let size = driver.size_on_disk(path).await?;
        if let Some(expected) = req.data_size {
            if !req.no_check_copy_len && expected != size {
                return logged_err!(
                    LengthMismatch;
                    "replica {}:{} has {} bytes, expected {}",
                    data_id,
                    num,
                    size,
                    expected
                );
            }
        }

        // content changed, so an old checksum no longer holds
        let checksum = match &req.checksum {
            ChecksumMode::None => None,
            ChecksumMode::Register => Some(compute_checksum(driver, path).await?),
            ChecksumMode::Verify(expected) => {
                let computed = compute_checksum(driver, path).await?;
                if &computed != expected {
                    return logged_err!(
                        ChecksumMismatch;
                        "checksum of {}:{} is {}, client sent {}",
                        data_id,
                        num,
                        computed,
                        expected
                    );
                }
                Some(computed)
            }
        };

        if !req.metadata.is_empty() {
            self.catalog().apply_metadata(data_id, &req.metadata).await?;
        }
        if !req.acl.is_empty() {
            self.catalog().apply_acl(data_id, &req.acl).await?;
        }

        rst.update(
            data_id,
            num,
            &ReplicaFields {
                size: Some(size),
                checksum: Some(checksum),
                mtime: Some(now_secs()),
                ..Default::default()
            },
        )?;
        let others = if desc.opr == OprType::Repl {
            StatusRestore::Restore
        } else {
            StatusRestore::Set(ReplicaStatus::Stale)
        };
        self.tables.locks.drive_statuses(
            data_id,
            Some(num),
            StatusRestore::Set(ReplicaStatus::Good),
            others,
        )?;
        rst.publish(self.catalog(), data_id).await?;

        let replica = rst
            .after_image(data_id)?
            .replica(num)
            .cloned()
            .ok_or_else(|| {
                StrataError::msg(format!("replica {}:{} unstaged", data_id, num))
            })?;
        self.end_session(desc);
        pf_info!(
            "{:?} of '{}' committed, {} bytes on '{}'",
            desc.opr,
            replica.logical_path,
            size,
            replica.hierarchy
        );
        Ok(replica)
    }

    /// Marks the replica stale with its size as found in the vault,
    /// restores its siblings, and tears the session down. Nothing here is
    /// returned as an error. If the stale image cannot be published the
    /// catalog may still show the replica intermediate, so the RST entry
    /// and the write lock are parked for `reconcile` instead.
    async fn finalize_on_failure(&self, desc: &OpenDescriptor) {
        let (data_id, num) = (desc.data_id, desc.replica_number);
        let rst = &self.tables.rst;
        pf_warn!("finalizing {}:{} as stale", data_id, num);

        let size = match desc
            .resource
            .driver
            .size_on_disk(&desc.replica.physical_path)
            .await
        {
            Ok(size) => Some(size),
            Err(e) => {
                pf_warn!("size of {}:{} unknown: {}", data_id, num, e);
                None
            }
        };
        let fields = ReplicaFields {
            size,
            ..Default::default()
        };
        if let Err(e) = rst.update(data_id, num, &fields) {
            pf_error!("staging size of {}:{} failed: {}", data_id, num, e);
        }

        if let Err(e) = self.tables.locks.drive_statuses(
            data_id,
            Some(num),
            StatusRestore::Set(ReplicaStatus::Stale),
            StatusRestore::Restore,
        ) {
            pf_error!("driving {}:{} stale failed: {}", data_id, num, e);
        } else if let Err(e) = rst.publish(self.catalog(), data_id).await {
            pf_error!("publishing stale {}:{} failed: {}", data_id, num, e);
            self.park_session(data_id, desc);
            return;
        }
        self.end_session(desc);
    }

    fn end_session(&self, desc: &OpenDescriptor) {
        self.tables.locks.release(desc.data_id);
        self.tables.rst.erase(desc.data_id);
        if let Some(token) = &desc.token {
            self.tables.rat.erase(token);
        }
    }

    /// Ends the session but leaves its lock and staged images behind.
    fn park_session(&self, data_id: DataId, desc: &OpenDescriptor) {
        if let Err(e) = self.tables.rst.park(data_id) {
            pf_error!("parking {} failed: {}", data_id, e);
            self.end_session(desc);
            return;
        }
        if let Some(token) = &desc.token {
            self.tables.rat.erase(token);
        }
    }
}

#[cfg(test)]
mod finalize_tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::coord::coord_tests::Fixture;
    use crate::coord::rst::rst_tests::FaultyCatalog;
    use crate::coord::{HookContext, HookEvent, LockState, OpenRequest, PolicyHooks};
    use crate::storage::OpenFlags;
    use async_trait::async_trait;
    use std::sync::Arc;

    const PATH: &str = "/z/home/u/f";

    fn create_req() -> OpenRequest {
        OpenRequest::new(PATH, OpenFlags::WRONLY.with_create())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn write_new_object() -> Result<(), StrataError> {
        let fx = Fixture::new(33000)?;
        let mut conn = Connection::new(1);
        let fd = fx.coord.open(&mut conn, create_req()).await?;

        let data_id = conn.descriptor(fd)?.data_id;
        assert_eq!(conn.descriptor(fd)?.open_type, OpenType::Create);
        let replica = fx.replica_on(PATH, "ufs0").await?;
        assert_eq!(replica.status, ReplicaStatus::Intermediate);
        assert_eq!(replica.size, 0);
        assert_eq!(fx.coord.tables().locks.state(data_id)?, LockState::WriteLocked);
        assert!(conn.token_of(fd).is_some());

        assert_eq!(fx.coord.write(&mut conn, fd, b"hello world!").await?, 12);
        fx.coord.close(&mut conn, fd).await?;

        let replica = fx.replica_on(PATH, "ufs0").await?;
        assert_eq!(replica.status, ReplicaStatus::Good);
        assert_eq!(replica.size, 12);
        assert_eq!(replica.checksum, None);
        assert!(fx.quiescent(data_id));
        assert!(conn.open_fds().is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn token_shares_session() -> Result<(), StrataError> {
        let fx = Fixture::new(33020)?;
        let (mut conn1, mut conn2) = (Connection::new(1), Connection::new(2));
        let fd1 = fx.coord.open(&mut conn1, create_req()).await?;
        let token = conn1.token_of(fd1).ok_or_else(|| StrataError::msg("no token"))?;
        let data_id = conn1.descriptor(fd1)?.data_id;

        // without the token the intermediate replica is off limits
        let mut req = OpenRequest::new(PATH, OpenFlags::WRONLY);
        assert!(fx
            .coord
            .open(&mut conn2, req.clone())
            .await
            .is_err_and(|e| e.kind() == ErrorKind::IntermediateReplicaAccess));
        req.replica_token = Some("0000".into());
        assert!(fx
            .coord
            .open(&mut conn2, req.clone())
            .await
            .is_err_and(|e| e.kind() == ErrorKind::IntermediateReplicaAccess));

        req.replica_token = Some(token.clone());
        let fd2 = fx.coord.open(&mut conn2, req).await?;
        assert!(!conn2.descriptor(fd2)?.holds_lock);
        assert_eq!(conn2.token_of(fd2), Some(token.clone()));

        fx.coord.write(&mut conn1, fd1, b"0123").await?;
        fx.coord.seek(&mut conn2, fd2, std::io::SeekFrom::Start(4)).await?;
        fx.coord.write(&mut conn2, fd2, b"4567").await?;

        // first close only drops its own descriptor
        fx.coord.close(&mut conn1, fd1).await?;
        assert_eq!(
            fx.replica_on(PATH, "ufs0").await?.status,
            ReplicaStatus::Intermediate
        );
        assert!(fx.coord.tables().rat.contains_token(&token, data_id, 0));

        fx.coord.close(&mut conn2, fd2).await?;
        let replica = fx.replica_on(PATH, "ufs0").await?;
        assert_eq!((replica.status, replica.size), (ReplicaStatus::Good, 8));
        assert!(!fx.coord.tables().rat.contains(data_id, 0));
        assert!(fx.quiescent(data_id));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn readers_and_writers_exclude() -> Result<(), StrataError> {
        let fx = Fixture::new(33040)?;
        let mut conn = Connection::new(1);
        let fd = fx.coord.open(&mut conn, create_req()).await?;
        fx.coord.write(&mut conn, fd, b"abc").await?;
        fx.coord.close(&mut conn, fd).await?;
        let data_id = fx.object(PATH).await?.data_id;

        let read = OpenRequest::new(PATH, OpenFlags::RDONLY);
        let r1 = fx.coord.open(&mut conn, read.clone()).await?;
        let r2 = fx.coord.open(&mut conn, read.clone()).await?;
        assert_eq!(conn.descriptor(r2)?.open_type, OpenType::OpenForRead);
        assert_eq!(fx.coord.tables().locks.state(data_id)?, LockState::ReadLocked(2));
        let mut buf = [0u8; 8];
        assert_eq!(fx.coord.read(&mut conn, r1, &mut buf).await?, 3);
        assert!(fx.coord.write(&mut conn, r1, b"x").await.is_err());

        // write while read-locked fails fast and leaves nothing staged
        let write = OpenRequest::new(PATH, OpenFlags::WRONLY);
        assert!(fx
            .coord
            .open(&mut conn, write.clone())
            .await
            .is_err_and(|e| e.kind() == ErrorKind::ReplicaLocked));
        assert!(!fx.coord.tables().rst.contains(data_id));
        assert_eq!(fx.replica_on(PATH, "ufs0").await?.status, ReplicaStatus::Good);

        fx.coord.close(&mut conn, r1).await?;
        fx.coord.close(&mut conn, r2).await?;
        let w = fx.coord.open(&mut conn, write).await?;
        assert!(fx
            .coord
            .open(&mut conn, read)
            .await
            .is_err_and(|e| e.kind() == ErrorKind::IntermediateReplicaAccess));
        fx.coord.close(&mut conn, w).await?;
        assert!(fx.quiescent(data_id));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn truncating_open_zeroes_size() -> Result<(), StrataError> {
        let fx = Fixture::new(33060)?;
        let mut conn = Connection::new(1);
        let fd = fx.coord.open(&mut conn, create_req()).await?;
        fx.coord.write(&mut conn, fd, b"twelve bytes").await?;
        fx.coord.close(&mut conn, fd).await?;

        let req = OpenRequest::new(PATH, OpenFlags::WRONLY.with_truncate());
        let fd = fx.coord.open(&mut conn, req).await?;
        assert_eq!(conn.descriptor(fd)?.replica.size, 0);
        assert_eq!(fx.replica_on(PATH, "ufs0").await?.size, 0);
        fx.coord.write(&mut conn, fd, b"xyz").await?;
        fx.coord.close(&mut conn, fd).await?;
        assert_eq!(fx.replica_on(PATH, "ufs0").await?.size, 3);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn new_replica_stales_siblings() -> Result<(), StrataError> {
        let fx = Fixture::new(33080)?;
        let mut conn = Connection::new(1);
        let fd = fx.coord.open(&mut conn, create_req()).await?;
        fx.coord.write(&mut conn, fd, b"v1").await?;
        fx.coord.close(&mut conn, fd).await?;

        let mut req = create_req();
        req.dest_resource = Some("ufs1".into());
        let fd = fx.coord.open(&mut conn, req).await?;
        assert_eq!(
            fx.replica_on(PATH, "ufs0").await?.status,
            ReplicaStatus::WriteLocked
        );
        fx.coord.write(&mut conn, fd, b"v2!").await?;
        fx.coord.close(&mut conn, fd).await?;

        let obj = fx.object(PATH).await?;
        assert_eq!(obj.replicas.len(), 2);
        let r0 = fx.replica_on(PATH, "ufs0").await?;
        let r1 = fx.replica_on(PATH, "ufs1").await?;
        assert_eq!((r0.status, r0.size), (ReplicaStatus::Stale, 2));
        assert_eq!((r1.status, r1.size), (ReplicaStatus::Good, 3));
        assert_eq!(r1.replica_number, 1);
        assert!(fx.quiescent(obj.data_id));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_publish_parks_session() -> Result<(), StrataError> {
        let faulty = Arc::new(FaultyCatalog::default());
        let fx = Fixture::with_catalog(faulty.clone(), 33100)?;
        let mut conn = Connection::new(1);
        let tables = fx.coord.tables();

        // both the commit and the stale publish fail: the catalog still
        // says intermediate, so lock and staged images must survive
        let fd = fx.coord.open(&mut conn, create_req()).await?;
        let data_id = conn.descriptor(fd)?.data_id;
        fx.coord.write(&mut conn, fd, b"hello world!").await?;
        faulty.fail_next_updates(2);
        assert!(fx
            .coord
            .close(&mut conn, fd)
            .await
            .is_err_and(|e| e.kind() == ErrorKind::CatalogWrite));
        let replica = fx.replica_on(PATH, "ufs0").await?;
        assert_eq!((replica.status, replica.size), (ReplicaStatus::Intermediate, 0));
        assert_eq!(tables.locks.state(data_id)?, LockState::WriteLocked);
        assert!(tables.rst.is_parked(data_id));
        assert!(!tables.rat.contains(data_id, 0));
        assert!(conn.open_fds().is_empty());
        assert!(fx.drivers.iter().all(|d| d.num_open() == 0));

        // nobody can take the object over while it is parked
        let req = OpenRequest::new(PATH, OpenFlags::WRONLY);
        assert!(fx.coord.open(&mut conn, req.clone()).await.is_err());

        // reconciliation fails again, then lands the stale image
        faulty.fail_next_updates(1);
        assert!(fx
            .coord
            .reconcile()
            .await
            .is_err_and(|e| e.kind() == ErrorKind::CatalogWrite));
        assert!(tables.rst.is_parked(data_id));
        assert_eq!(fx.coord.reconcile().await?, 1);
        let replica = fx.replica_on(PATH, "ufs0").await?;
        assert_eq!((replica.status, replica.size), (ReplicaStatus::Stale, 12));
        assert!(fx.quiescent(data_id));
        assert_eq!(fx.coord.reconcile().await?, 0);

        // only the commit fails: the stale publish lands right away
        let fd = fx.coord.open(&mut conn, req).await?;
        fx.coord.write(&mut conn, fd, b"abc").await?;
        faulty.fail_next_updates(1);
        assert!(fx.coord.close(&mut conn, fd).await.is_err());
        let replica = fx.replica_on(PATH, "ufs0").await?;
        assert_eq!((replica.status, replica.size), (ReplicaStatus::Stale, 12));
        assert!(!tables.rst.is_parked(data_id));
        assert!(fx.quiescent(data_id));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_rollback_parks_session() -> Result<(), StrataError> {
        let faulty = Arc::new(FaultyCatalog::default());
        let fx = Fixture::with_catalog(faulty.clone(), 33600)?;
        let mut conn = Connection::new(1);
        let tables = fx.coord.tables();
        let fd = fx.coord.open(&mut conn, create_req()).await?;
        let data_id = conn.descriptor(fd)?.data_id;
        fx.coord.write(&mut conn, fd, b"twelve bytes").await?;
        fx.coord.close(&mut conn, fd).await?;

        // intermediate publish lands, the truncated size and the restore
        // publishes both fail
        faulty.fail_updates_after(1, 2);
        let req = OpenRequest::new(PATH, OpenFlags::WRONLY.with_truncate());
        assert!(fx
            .coord
            .open(&mut conn, req)
            .await
            .is_err_and(|e| e.kind() == ErrorKind::CatalogWrite));
        assert_eq!(
            fx.replica_on(PATH, "ufs0").await?.status,
            ReplicaStatus::Intermediate
        );
        assert_eq!(tables.locks.state(data_id)?, LockState::WriteLocked);
        assert_eq!(tables.rst.parked()?, vec![data_id]);
        assert!(conn.open_fds().is_empty());

        // a terminating agent sweeps parked sessions as well
        assert_eq!(fx.coord.close_all(&mut conn).await, 0);
        assert_ne!(
            fx.replica_on(PATH, "ufs0").await?.status,
            ReplicaStatus::Intermediate
        );
        assert!(fx.quiescent(data_id));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn length_and_checksum_checks() -> Result<(), StrataError> {
        let fx = Fixture::new(33120)?;
        let mut conn = Connection::new(1);

        let mut req = create_req();
        req.data_size = Some(5);
        let fd = fx.coord.open(&mut conn, req).await?;
        fx.coord.write(&mut conn, fd, b"abc").await?;
        assert!(fx
            .coord
            .close(&mut conn, fd)
            .await
            .is_err_and(|e| e.kind() == ErrorKind::LengthMismatch));
        assert_eq!(fx.replica_on(PATH, "ufs0").await?.status, ReplicaStatus::Stale);

        let mut req = OpenRequest::new(PATH, OpenFlags::WRONLY.with_create());
        req.checksum = ChecksumMode::Register;
        let fd = fx.coord.open(&mut conn, req).await?;
        fx.coord.write(&mut conn, fd, b"abcdefg").await?;
        fx.coord.close(&mut conn, fd).await?;
        let replica = fx.replica_on(PATH, "ufs0").await?;
        assert_eq!(replica.status, ReplicaStatus::Good);
        assert_eq!(replica.checksum, Some(crate::coord::checksum_of(b"abcdefg")));

        // rewriting without a checksum request drops the old one
        let fd = fx
            .coord
            .open(&mut conn, OpenRequest::new(PATH, OpenFlags::WRONLY))
            .await?;
        fx.coord.write(&mut conn, fd, b"A").await?;
        fx.coord.close(&mut conn, fd).await?;
        assert_eq!(fx.replica_on(PATH, "ufs0").await?.checksum, None);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn close_all_fails_open_sessions() -> Result<(), StrataError> {
        let fx = Fixture::new(33140)?;
        let mut conn = Connection::new(9);
        let fd = fx.coord.open(&mut conn, create_req()).await?;
        let data_id = conn.descriptor(fd)?.data_id;
        fx.coord.write(&mut conn, fd, b"partial").await?;

        assert_eq!(fx.coord.close_all(&mut conn).await, 1);
        let replica = fx.replica_on(PATH, "ufs0").await?;
        assert_eq!((replica.status, replica.size), (ReplicaStatus::Stale, 7));
        assert!(fx.quiescent(data_id));
        assert!(conn.open_fds().is_empty());
        Ok(())
    }

    #[derive(Debug)]
    struct DenyCreate;

    #[async_trait]
    impl PolicyHooks for DenyCreate {
        async fn pre(
            &self,
            event: HookEvent,
            ctx: &HookContext,
        ) -> Result<(), StrataError> {
            if event == HookEvent::Create && ctx["logical_path"].ends_with("/f") {
                return Err(StrataError::msg("no new files today"));
            }
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pre_hook_aborts_first() -> Result<(), StrataError> {
        let fx = Fixture::new(33160)?;
        let coord = fx.coord.with_hooks(Arc::new(DenyCreate));
        let mut conn = Connection::new(1);
        assert!(coord
            .open(&mut conn, create_req())
            .await
            .is_err_and(|e| e.kind() == ErrorKind::HookRejected));
        assert!(fx.catalog.fetch_object(PATH).await?.is_none());
        assert!(conn.open_fds().is_empty());
        Ok(())
    }
}
