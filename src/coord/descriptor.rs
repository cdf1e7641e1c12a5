//! Per-connection open descriptor (L1) table.

use crate::coord::{OpenRequest, ReplicaToken};
use crate::model::{DataId, Replica, ReplicaNumber};
use crate::portal::Portal;
use crate::storage::{L3Fd, OpenFlags, Resource};
use crate::utils::{ErrorKind, StrataError};

/// Logical (L1) descriptor handed to clients.
pub type L1Fd = usize;

/// Smallest L1 descriptor number handed out.
const MIN_L1_FD: L1Fd = 3;

/// Default cap on simultaneously open L1 descriptors per connection.
const MAX_L1_FDS: usize = 1026;

/// How the replica was reached at open time.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum OpenType {
    /// A new replica was registered.
    Create,
    OpenForWrite,
    OpenForRead,
}

/// Operation the descriptor was opened for.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum OprType {
    Open,
    Put,
    Get,
    Repl,
}

/// One open data-object handle.
#[derive(Debug)]
pub struct OpenDescriptor {
    pub data_id: DataId,
    pub replica_number: ReplicaNumber,

    /// Replica record as of open time.
    pub replica: Replica,

    /// Resource the replica lives on.
    pub resource: Resource,

    /// Physical descriptor from the resource's driver.
    pub l3: L3Fd,

    /// Access token of the write session, if any.
    pub token: Option<ReplicaToken>,

    pub flags: OpenFlags,
    pub open_type: OpenType,
    pub opr: OprType,

    /// Bytes written through this handle.
    pub bytes_written: u64,

    /// True if this handle took a lock it must release at close.
    pub holds_lock: bool,

    /// Request that opened the handle; finalize reads expected size,
    /// checksum mode, and bundled metadata/ACL out of it.
    pub request: OpenRequest,

    /// Portal awaiting `serve_portal`, for parallel put/get.
    pub portal: Option<Portal>,
}

/// L1 descriptor table owned by one connection.
#[derive(Debug)]
pub struct DescriptorTable {
    slots: Vec<Option<OpenDescriptor>>,
    capacity: usize,
}

impl Default for DescriptorTable {
    fn default() -> Self {
        Self::new(MAX_L1_FDS)
    }
}

impl DescriptorTable {
    pub fn new(capacity: usize) -> Self {
        DescriptorTable {
            slots: vec![],
            capacity,
        }
    }

    /// Stores a descriptor in the lowest free slot.
    pub fn alloc(&mut self, desc: OpenDescriptor) -> Result<L1Fd, StrataError> {
        if let Some(idx) = self.slots.iter().position(|s| s.is_none()) {
            self.slots[idx] = Some(desc);
            return Ok(idx + MIN_L1_FD);
        }
        if self.slots.len() >= self.capacity {
            return logged_err!(
                Internal;
                "L1 descriptor table full ({} open)",
                self.slots.len()
            );
        }
        self.slots.push(Some(desc));
        Ok(self.slots.len() - 1 + MIN_L1_FD)
    }

    fn slot(&self, fd: L1Fd) -> Option<usize> {
        fd.checked_sub(MIN_L1_FD).filter(|idx| *idx < self.slots.len())
    }

    fn bad_fd(fd: L1Fd) -> StrataError {
        StrataError::new(
            ErrorKind::Internal,
            format!("invalid L1 descriptor {}", fd),
        )
    }

    pub fn get(&self, fd: L1Fd) -> Result<&OpenDescriptor, StrataError> {
        self.slot(fd)
            .and_then(|idx| self.slots[idx].as_ref())
            .ok_or_else(|| Self::bad_fd(fd))
    }

    pub fn get_mut(
        &mut self,
        fd: L1Fd,
    ) -> Result<&mut OpenDescriptor, StrataError> {
        let idx = self.slot(fd).ok_or_else(|| Self::bad_fd(fd))?;
        self.slots[idx].as_mut().ok_or_else(|| Self::bad_fd(fd))
    }

    /// Takes a descriptor out of the table, freeing its slot.
    pub fn free(&mut self, fd: L1Fd) -> Result<OpenDescriptor, StrataError> {
        let idx = self.slot(fd).ok_or_else(|| Self::bad_fd(fd))?;
        self.slots[idx].take().ok_or_else(|| Self::bad_fd(fd))
    }

    /// Descriptors currently open.
    pub fn open_fds(&self) -> Vec<L1Fd> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .map(|(idx, _)| idx + MIN_L1_FD)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|s| s.is_none())
    }
}
