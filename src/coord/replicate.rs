//! Replication between resources of this server: a chunked parallel copy
//! from a good replica into a new or refreshed one.

use crate::catalog::CatalogFilter;
use crate::coord::{ChecksumMode, Connection, Coordinator, OpenRequest, OprType};
use crate::model::{Replica, ReplicaStatus};
use crate::portal::{negotiate_thread_count, same_host_copy, CopyEnd};
use crate::storage::OpenFlags;
use crate::utils::{ErrorKind, StrataError};

/// Totals of a collection replication.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub struct ReplicationSummary {
    /// Objects replicated.
    pub files: usize,

    /// Objects that already had a good replica on the destination.
    pub skipped: usize,

    pub bytes: u64,
}

// Coordinator replication implementation
impl Coordinator {
    /// Creates or refreshes the replica of `logical_path` on
    /// `dest_resource` from a good replica. Siblings keep their statuses.
    pub async fn replicate(
        &self,
        conn: &mut Connection,
        logical_path: &str,
        dest_resource: &str,
        num_threads: u32,
    ) -> Result<Replica, StrataError> {
        let Some(obj) = self.catalog().fetch_object(logical_path).await? else {
            return logged_err!(
                ReplicaNotFound;
                "no data object at '{}'",
                logical_path
            );
        };
        let Some(source) = obj.first_good().cloned() else {
            return logged_err!(
                ReplicaNotFound;
                "'{}' has no good replica to copy from",
                logical_path
            );
        };
        let dest = self.resources.by_name(dest_resource)?;
        if obj
            .find_replica(&dest.hierarchy)
            .is_some_and(|r| r.status == ReplicaStatus::Good)
        {
            return Err(StrataError::new(
                ErrorKind::AlreadyInResource,
                format!("'{}' already good on '{}'", logical_path, dest.hierarchy),
            ));
        }
        let src_resource = self.resource(&source.hierarchy)?;

        let mut req = OpenRequest::new(
            logical_path,
            OpenFlags::WRONLY.with_create().with_truncate(),
        );
        req.dest_resource = Some(dest_resource.into());
        req.data_size = Some(source.size);
        req.num_threads = num_threads;
        req.data_type = Some(source.data_type.clone());
        req.mode = Some(source.mode);
        if let Some(checksum) = &source.checksum {
            req.checksum = ChecksumMode::Verify(checksum.clone());
        }
        let fd = self.open_with_opr(conn, req, OprType::Repl).await?;

        let desc = conn.descriptors.get_mut(fd)?;
        let src = CopyEnd {
            driver: src_resource.driver,
            path: source.physical_path.clone(),
        };
        let dst = CopyEnd {
            driver: desc.resource.driver.clone(),
            path: desc.replica.physical_path.clone(),
        };
        let threads = negotiate_thread_count(
            &self.portal_config,
            source.size,
            num_threads,
            false,
        );
        let outcome =
            same_host_copy(&self.portal_config, src, dst, source.size, threads)
                .await;
        desc.bytes_written = outcome.bytes();
        let status = outcome.status().map(|bytes| {
            pf_info!(
                "replicated '{}' {} -> {}, {} bytes over {} threads",
                logical_path,
                source.hierarchy,
                desc.replica.hierarchy,
                bytes,
                threads
            );
        });

        self.close_with_status(conn, fd, status).await?.ok_or_else(|| {
            StrataError::msg(format!("replication on fd {} not finalized", fd))
        })
    }

    /// Replicates every data object under collection `coll` onto
    /// `dest_resource`. Objects already good there count as skipped; any
    /// other failure stops the walk.
    pub async fn replicate_collection(
        &self,
        conn: &mut Connection,
        coll: &str,
        dest_resource: &str,
        num_threads: u32,
    ) -> Result<ReplicationSummary, StrataError> {
        let rows = self
            .catalog()
            .query(&CatalogFilter::Collection(coll.into()))
            .await?;
        let mut paths: Vec<String> =
            rows.into_iter().map(|r| r.logical_path).collect();
        paths.sort();
        paths.dedup();

        let mut summary = ReplicationSummary::default();
        for path in paths {
            match self.replicate(conn, &path, dest_resource, num_threads).await {
                Ok(replica) => {
                    summary.files += 1;
                    summary.bytes += replica.size;
                }
                Err(e) if e.is(ErrorKind::AlreadyInResource) => {
                    summary.skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }
        pf_info!(
            "collection '{}' onto '{}': {} replicated, {} skipped, {} bytes",
            coll,
            dest_resource,
            summary.files,
            summary.skipped,
            summary.bytes
        );
        Ok(summary)
    }
}
