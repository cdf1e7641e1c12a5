//! Open paths: dispatch after resolution, write-open of an existing
//! replica, attaching to an in-flight session by token, read-open, and
//! I/O through an open descriptor.

use std::io::SeekFrom;

use crate::catalog::ReplicaFields;
use crate::coord::undo::{Undo, UndoStack};
use crate::coord::{
    Connection, Coordinator, HookEvent, Intent, L1Fd, LockKind,
    OpenDescriptor, OpenRequest, OpenType, OprType, ReplicaToken, Resolution,
};
use crate::model::{split_logical_path, DataObject, Replica, ReplicaStatus};
use crate::storage::OpenFlags;
use crate::utils::{ErrorKind, StrataError};

// Coordinator open paths implementation
impl Coordinator {
    /// Opens a data object. With the create flag, a missing replica is
    /// created and an existing one is overwritten.
    pub async fn open(
        &self,
        conn: &mut Connection,
        req: OpenRequest,
    ) -> Result<L1Fd, StrataError> {
        self.open_with_opr(conn, req, OprType::Open).await
    }

    pub(crate) async fn open_with_opr(
        &self,
        conn: &mut Connection,
        req: OpenRequest,
        opr: OprType,
    ) -> Result<L1Fd, StrataError> {
        split_logical_path(&req.logical_path)?;

        let intent = if req.flags.create {
            Intent::Create
        } else {
            Intent::Open {
                write: req.flags.is_write(),
            }
        };
        let resolution = self
            .resolver
            .resolve(
                self.catalog(),
                &req.logical_path,
                intent,
                req.dest_resource.as_deref(),
            )
            .await?;

        let event = match opr {
            OprType::Open if req.flags.create => HookEvent::Create,
            OprType::Open => HookEvent::Open,
            OprType::Put => HookEvent::Put,
            OprType::Get => HookEvent::Get,
            OprType::Repl => HookEvent::Replicate,
        };
        let ctx = Self::hook_ctx(&req, &resolution.hierarchy);
        self.pre_hook(event, &ctx).await?;

        let result = self.dispatch_open(conn, req, opr, resolution).await;
        if let Err(e) = &result {
            pf_debug!("{:?} open failed: {}", opr, e);
        }
        self.post_hook(event, &ctx, &result).await;
        result
    }

    async fn dispatch_open(
        &self,
        conn: &mut Connection,
        mut req: OpenRequest,
        opr: OprType,
        resolution: Resolution,
    ) -> Result<L1Fd, StrataError> {
        let Resolution { hierarchy, object } = resolution;
        if opr == OprType::Put {
            Self::check_put_flags(&req, &hierarchy, object.as_ref())?;
        }

        let existing = object
            .as_ref()
            .and_then(|obj| obj.find_replica(&hierarchy))
            .map(|r| r.replica_number);
        match (object, existing) {
            (Some(obj), Some(num)) => {
                if req.flags.create {
                    // replica exists on this hierarchy: overwrite it
                    req.flags = OpenFlags {
                        truncate: req.flags.truncate,
                        ..OpenFlags::RDWR
                    };
                }
                if req.flags.is_write() {
                    self.open_for_write(conn, req, opr, obj, num).await
                } else {
                    self.open_for_read(conn, req, opr, obj, num).await
                }
            }
            (object, None) if req.flags.create => {
                self.create_replica(conn, req, opr, hierarchy, object).await
            }
            (None, _) => logged_err!(
                ReplicaNotFound;
                "no data object at '{}'",
                req.logical_path
            ),
            (Some(_), None) => logged_err!(
                ReplicaNotFound;
                "no replica of '{}' on '{}'",
                req.logical_path,
                hierarchy
            ),
        }
    }

    async fn open_for_write(
        &self,
        conn: &mut Connection,
        req: OpenRequest,
        opr: OprType,
        obj: DataObject,
        replica_number: u32,
    ) -> Result<L1Fd, StrataError> {
        let target = obj.replica(replica_number).cloned().ok_or_else(|| {
            StrataError::msg(format!(
                "replica {} vanished from {}",
                replica_number, obj.data_id
            ))
        })?;

        if target.status == ReplicaStatus::Intermediate {
            return match req.replica_token.clone() {
                Some(token)
                    if self.tables.rat.contains_token(
                        &token,
                        obj.data_id,
                        replica_number,
                    ) =>
                {
                    self.attach_to_session(conn, req, opr, target, token).await
                }
                _ => logged_err!(
                    IntermediateReplicaAccess;
                    "replica {} of '{}' is intermediate, no valid token",
                    replica_number,
                    obj.logical_path
                ),
            };
        }
        if obj.locked_against(true, None) {
            return logged_err!(
                ReplicaLocked;
                "data object '{}' is locked",
                obj.logical_path
            );
        }

        let mut undo = UndoStack::new();
        let result = self
            .write_open_steps(conn, req, opr, &obj, target, &mut undo)
            .await;
        undo.settle(self, result).await
    }

    async fn write_open_steps(
        &self,
        conn: &mut Connection,
        req: OpenRequest,
        opr: OprType,
        obj: &DataObject,
        mut replica: Replica,
        undo: &mut UndoStack,
    ) -> Result<L1Fd, StrataError> {
        let data_id = obj.data_id;
        let num = replica.replica_number;
        let rst = &self.tables.rst;

        self.stage(obj)?;
        undo.push(Undo::EraseRst(data_id));
        self.tables.locks.lock_for_write(data_id, Some(num))?;
        undo.push(Undo::Unlock {
            data_id,
            target: Some(num),
        });
        rst.publish(self.catalog(), data_id).await?;
        pf_debug!("replica {}:{} intermediate", data_id, num);

        let resource = self.resource(&replica.hierarchy)?;
        let flags = OpenFlags {
            create: false,
            ..req.flags
        };
        let mode = req.mode.unwrap_or(self.config.default_mode);
        let l3 = resource
            .driver
            .open(&replica.physical_path, flags, mode)
            .await?;
        undo.push(Undo::Close {
            driver: resource.driver.clone(),
            fd: l3,
        });

        let token = self.tables.rat.create_new_entry(data_id, num, conn.agent)?;
        undo.push(Undo::EraseAgent {
            token: token.clone(),
            agent: conn.agent,
        });

        replica.status = ReplicaStatus::Intermediate;
        if flags.truncate {
            // later size decisions must see the truncated file
            replica.size = 0;
            rst.update(
                data_id,
                num,
                &ReplicaFields {
                    size: Some(0),
                    ..Default::default()
                },
            )?;
            if opr != OprType::Put {
                rst.publish(self.catalog(), data_id).await?;
            }
        }

        conn.descriptors.alloc(OpenDescriptor {
            data_id,
            replica_number: num,
            replica,
            resource,
            l3,
            token: Some(token),
            flags,
            open_type: OpenType::OpenForWrite,
            opr,
            bytes_written: 0,
            holds_lock: true,
            request: req,
            portal: None,
        })
    }

    /// Joins an in-flight write session: no lock, no staging, only the
    /// agent is added to the token.
    async fn attach_to_session(
        &self,
        conn: &mut Connection,
        req: OpenRequest,
        opr: OprType,
        replica: Replica,
        token: ReplicaToken,
    ) -> Result<L1Fd, StrataError> {
        let (data_id, num) = (replica.data_id, replica.replica_number);
        let resource = self.resource(&replica.hierarchy)?;
        let flags = OpenFlags {
            create: false,
            truncate: false,
            ..req.flags
        };

        let mut undo = UndoStack::new();
        let result = async {
            self.tables
                .rat
                .append_pid(&token, data_id, num, conn.agent)?;
            undo.push(Undo::EraseAgent {
                token: token.clone(),
                agent: conn.agent,
            });

            let l3 = resource
                .driver
                .open(&replica.physical_path, flags, 0)
                .await?;
            undo.push(Undo::Close {
                driver: resource.driver.clone(),
                fd: l3,
            });
            pf_debug!("agent {} attached to {}:{}", conn.agent, data_id, num);

            conn.descriptors.alloc(OpenDescriptor {
                data_id,
                replica_number: num,
                replica,
                resource,
                l3,
                token: Some(token),
                flags,
                open_type: OpenType::OpenForWrite,
                opr,
                bytes_written: 0,
                holds_lock: false,
                request: req,
                portal: None,
            })
        }
        .await;
        undo.settle(self, result).await
    }

    async fn open_for_read(
        &self,
        conn: &mut Connection,
        req: OpenRequest,
        opr: OprType,
        obj: DataObject,
        replica_number: u32,
    ) -> Result<L1Fd, StrataError> {
        let replica = obj.replica(replica_number).cloned().ok_or_else(|| {
            StrataError::msg(format!(
                "replica {} vanished from {}",
                replica_number, obj.data_id
            ))
        })?;
        if replica.status == ReplicaStatus::Intermediate {
            return logged_err!(
                IntermediateReplicaAccess;
                "replica {} of '{}' is being written",
                replica_number,
                obj.logical_path
            );
        }
        if obj.locked_against(false, None) {
            return logged_err!(
                ReplicaLocked;
                "data object '{}' is write-locked",
                obj.logical_path
            );
        }

        let data_id = obj.data_id;
        let resource = self.resource(&replica.hierarchy)?;
        let mut undo = UndoStack::new();
        let result = async {
            self.tables.locks.lock(data_id, LockKind::Read)?;
            undo.push(Undo::ReleaseRead(data_id));

            let l3 = resource
                .driver
                .open(&replica.physical_path, OpenFlags::RDONLY, 0)
                .await?;
            undo.push(Undo::Close {
                driver: resource.driver.clone(),
                fd: l3,
            });

            conn.descriptors.alloc(OpenDescriptor {
                data_id,
                replica_number,
                replica,
                resource,
                l3,
                token: None,
                flags: OpenFlags::RDONLY,
                open_type: OpenType::OpenForRead,
                opr,
                bytes_written: 0,
                holds_lock: true,
                request: req,
                portal: None,
            })
        }
        .await;
        undo.settle(self, result).await
    }
}

// Coordinator descriptor I/O implementation
impl Coordinator {
    pub async fn read(
        &self,
        conn: &mut Connection,
        fd: L1Fd,
        buf: &mut [u8],
    ) -> Result<usize, StrataError> {
        let desc = conn.descriptors.get(fd)?;
        if !desc.flags.read {
            return Err(StrataError::new(
                ErrorKind::InvalidInput,
                format!("descriptor {} not open for reading", fd),
            ));
        }
        desc.resource.driver.read(desc.l3, buf).await
    }

    /// Writes the whole buffer through a write descriptor.
    pub async fn write(
        &self,
        conn: &mut Connection,
        fd: L1Fd,
        buf: &[u8],
    ) -> Result<usize, StrataError> {
        let desc = conn.descriptors.get_mut(fd)?;
        if !desc.flags.is_write() {
            return Err(StrataError::new(
                ErrorKind::InvalidInput,
                format!("descriptor {} not open for writing", fd),
            ));
        }
        desc.resource.driver.write_all(desc.l3, buf).await?;
        desc.bytes_written += buf.len() as u64;
        Ok(buf.len())
    }

    pub async fn seek(
        &self,
        conn: &mut Connection,
        fd: L1Fd,
        pos: SeekFrom,
    ) -> Result<u64, StrataError> {
        let desc = conn.descriptors.get(fd)?;
        desc.resource.driver.seek(desc.l3, pos).await
    }
}
