//! Put and get paths: single-buffer put, and parallel put/get through a
//! portal the client connects back to.

use std::time::Instant;

use crate::coord::{Connection, Coordinator, HookEvent, L1Fd, OpenRequest, OprType};
use crate::model::{DataObject, Hierarchy, Replica};
use crate::portal::{
    negotiate_thread_count, run_transfer, Direction, LocalEndpoint, Portal,
    PortalOprOut, TransferSpec, NO_CHK_COPY_LEN_FLAG, STREAMING_FLAG,
};
use crate::storage::OpenFlags;
use crate::utils::{ErrorKind, StrataError};

/// Header flags a transfer for this request carries.
fn portal_flags(req: &OpenRequest) -> i32 {
    let mut flags = 0;
    if req.streaming {
        flags |= STREAMING_FLAG;
    }
    if req.no_check_copy_len {
        flags |= NO_CHK_COPY_LEN_FLAG;
    }
    flags
}

// Coordinator put/get implementation
impl Coordinator {
    /// Put-only checks, done before anything is locked or staged.
    pub(crate) fn check_put_flags(
        req: &OpenRequest,
        hierarchy: &Hierarchy,
        object: Option<&DataObject>,
    ) -> Result<(), StrataError> {
        let Some(obj) = object else {
            return Ok(());
        };
        if obj.find_replica(hierarchy).is_some() {
            if !req.force {
                return logged_err!(
                    OverwriteWithoutForceFlag;
                    "'{}' already has a replica on '{}'",
                    obj.logical_path,
                    hierarchy
                );
            }
        } else if req.force && req.dest_resource.is_some() {
            return logged_err!(
                HierarchyError;
                "forced put of '{}' onto '{}' which holds none of its replicas",
                obj.logical_path,
                hierarchy
            );
        }
        Ok(())
    }

    /// Puts a whole buffer as the new content of a data object.
    pub async fn put(
        &self,
        conn: &mut Connection,
        mut req: OpenRequest,
        data: &[u8],
    ) -> Result<Replica, StrataError> {
        req.flags = OpenFlags::WRONLY.with_create().with_truncate();
        req.data_size.get_or_insert(data.len() as u64);
        let fd = self.open_with_opr(conn, req, OprType::Put).await?;

        let status = self.write(conn, fd, data).await.map(|_| ());
        self.close_with_status(conn, fd, status)
            .await?
            .ok_or_else(|| StrataError::msg(format!("put on fd {} not finalized", fd)))
    }

    /// Opens a data object for a parallel put and a portal to feed it.
    /// The transfer itself runs in `serve_portal`.
    pub async fn parallel_put(
        &self,
        conn: &mut Connection,
        mut req: OpenRequest,
    ) -> Result<PortalOprOut, StrataError> {
        let Some(data_size) = req.data_size else {
            return logged_err!(
                InvalidInput;
                "parallel put of '{}' without a data size",
                req.logical_path
            );
        };
        req.flags = OpenFlags::WRONLY.with_create().with_truncate();
        let fd = self.open_with_opr(conn, req, OprType::Put).await?;
        self.open_portal(conn, fd, data_size).await
    }

    /// Opens a data object for a parallel get and a portal to drain it.
    pub async fn parallel_get(
        &self,
        conn: &mut Connection,
        mut req: OpenRequest,
    ) -> Result<PortalOprOut, StrataError> {
        req.flags = OpenFlags::RDONLY;
        let fd = self.open_with_opr(conn, req, OprType::Get).await?;
        let data_size = conn.descriptors.get(fd)?.replica.size;
        self.open_portal(conn, fd, data_size).await
    }

    async fn open_portal(
        &self,
        conn: &mut Connection,
        fd: L1Fd,
        data_size: u64,
    ) -> Result<PortalOprOut, StrataError> {
        let desc = conn.descriptors.get(fd)?;
        let num_threads = negotiate_thread_count(
            &self.portal_config,
            data_size,
            desc.request.num_threads,
            desc.request.streaming,
        );
        let flags = portal_flags(&desc.request);
        let mut ctx = Self::hook_ctx(&desc.request, &desc.replica.hierarchy);
        ctx.insert("num_threads".into(), num_threads.to_string());

        let opened = async {
            self.pre_hook(HookEvent::Portal, &ctx).await?;
            Portal::open(&self.portal_config, num_threads).await
        }
        .await;
        self.post_hook(HookEvent::Portal, &ctx, &opened).await;

        match opened {
            Ok(portal) => {
                let out = portal.opr_out(fd, data_size, flags);
                conn.descriptors.get_mut(fd)?.portal = Some(portal);
                Ok(out)
            }
            Err(e) => {
                if let Err(ce) =
                    self.close_with_status(conn, fd, Err(e.clone())).await
                {
                    pf_debug!("fd {} closed after portal failure: {}", fd, ce);
                }
                Err(e)
            }
        }
    }

    /// Runs the server side of the transfer prepared on `fd`, then closes
    /// the descriptor with the transfer's outcome. Returns the bytes moved.
    pub async fn serve_portal(
        &self,
        conn: &mut Connection,
        fd: L1Fd,
    ) -> Result<u64, StrataError> {
        let crypt = conn.crypt.clone();
        let desc = conn.descriptors.get_mut(fd)?;
        let Some(portal) = desc.portal.take() else {
            return logged_err!(InvalidInput; "no portal open on fd {}", fd);
        };
        let (direction, total_size) = if desc.flags.is_write() {
            (Direction::Put, desc.request.data_size.unwrap_or(0))
        } else {
            (Direction::Get, desc.replica.size)
        };
        let spec = TransferSpec {
            direction,
            offset: 0,
            total_size,
            flags: portal_flags(&desc.request),
            crypt,
        };
        let endpoint = LocalEndpoint {
            driver: desc.resource.driver.clone(),
            path: desc.replica.physical_path.clone(),
            primary_fd: desc.l3,
        };
        let num_threads = portal.num_threads();

        let started = Instant::now();
        let outcome =
            run_transfer(&self.portal_config, portal, spec, endpoint).await;
        let status = outcome.status();
        let elapsed = started.elapsed();
        pf_info!(
            "{:?} of '{}': {} bytes over {} threads in {:.3}s{}",
            direction,
            desc.replica.logical_path,
            outcome.bytes(),
            num_threads,
            elapsed.as_secs_f64(),
            if status.is_ok() { "" } else { ", failed" }
        );
        if direction == Direction::Put {
            desc.bytes_written = outcome.bytes();
        }

        match status {
            Ok(bytes) => {
                self.close_with_status(conn, fd, Ok(())).await?;
                Ok(bytes)
            }
            Err(e) => {
                if let Err(ce) =
                    self.close_with_status(conn, fd, Err(e.clone())).await
                {
                    if ce.kind() != e.kind() {
                        pf_warn!("closing fd {} after transfer: {}", fd, ce);
                    }
                }
                Err(e)
            }
        }
    }
}
