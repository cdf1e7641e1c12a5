//! Storage driver interface and the resource registry mapping hierarchies
//! onto drivers.

mod localfs;

pub use localfs::LocalFsDriver;

use std::collections::HashMap;
use std::fmt;
use std::io::SeekFrom;
use std::sync::Arc;

use async_trait::async_trait;

use crate::model::{Hierarchy, ResourceId};
use crate::utils::{ErrorKind, StrataError};

/// Physical (L3) file descriptor handed out by a storage driver.
pub type L3Fd = usize;

/// Open mode of a physical file.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub truncate: bool,
}

impl OpenFlags {
    pub const RDONLY: OpenFlags = OpenFlags {
        read: true,
        write: false,
        create: false,
        truncate: false,
    };

    pub const WRONLY: OpenFlags = OpenFlags {
        read: false,
        write: true,
        create: false,
        truncate: false,
    };

    pub const RDWR: OpenFlags = OpenFlags {
        read: true,
        write: true,
        create: false,
        truncate: false,
    };

    pub fn with_create(mut self) -> Self {
        self.create = true;
        self
    }

    pub fn with_truncate(mut self) -> Self {
        self.truncate = true;
        self
    }

    pub fn is_write(&self) -> bool {
        self.write
    }
}

/// Raw file operations on one kind of resource. Descriptors are only
/// meaningful to the driver that issued them.
#[async_trait]
pub trait StorageDriver: fmt::Debug + Send + Sync {
    /// Physical path under which a logical path is stored on this resource.
    fn vault_path(&self, logical_path: &str) -> Result<String, StrataError>;

    /// Creates (or truncates) a physical file opened read-write.
    async fn create(&self, path: &str, mode: u32) -> Result<L3Fd, StrataError>;

    async fn open(
        &self,
        path: &str,
        flags: OpenFlags,
        mode: u32,
    ) -> Result<L3Fd, StrataError>;

    async fn read(
        &self,
        fd: L3Fd,
        buf: &mut [u8],
    ) -> Result<usize, StrataError>;

    async fn write(&self, fd: L3Fd, buf: &[u8]) -> Result<usize, StrataError>;

    async fn seek(&self, fd: L3Fd, pos: SeekFrom) -> Result<u64, StrataError>;

    async fn close(&self, fd: L3Fd) -> Result<(), StrataError>;

    async fn unlink(&self, path: &str) -> Result<(), StrataError>;

    async fn size_on_disk(&self, path: &str) -> Result<u64, StrataError>;

    /// Writes the whole buffer, looping over short writes.
    async fn write_all(
        &self,
        fd: L3Fd,
        mut buf: &[u8],
    ) -> Result<(), StrataError> {
        while !buf.is_empty() {
            let n = self.write(fd, buf).await?;
            if n == 0 {
                return Err(StrataError::new(
                    ErrorKind::PhysicalIo,
                    format!("zero-length write on fd {}", fd),
                ));
            }
            buf = &buf[n..];
        }
        Ok(())
    }

    /// Fills the buffer unless end of file comes first; returns the number
    /// of bytes read.
    async fn read_full(
        &self,
        fd: L3Fd,
        buf: &mut [u8],
    ) -> Result<usize, StrataError> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(fd, &mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }
}

/// A leaf resource with its driver.
#[derive(Debug, Clone)]
pub struct Resource {
    pub id: ResourceId,
    pub hierarchy: Hierarchy,
    pub driver: Arc<dyn StorageDriver>,
}

/// Resources known to this server, keyed by leaf name.
#[derive(Debug, Default)]
pub struct ResourceRegistry {
    by_leaf: HashMap<String, Resource>,
    next_id: ResourceId,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        ResourceRegistry {
            by_leaf: HashMap::new(),
            next_id: 1,
        }
    }

    /// Adds a resource hierarchy served by `driver`; returns its id.
    pub fn add(
        &mut self,
        hierarchy: Hierarchy,
        driver: Arc<dyn StorageDriver>,
    ) -> Result<ResourceId, StrataError> {
        let leaf = hierarchy.leaf().to_string();
        if self.by_leaf.contains_key(&leaf) {
            return Err(StrataError::new(
                ErrorKind::InvalidInput,
                format!("resource '{}' added twice", leaf),
            ));
        }
        let id = self.next_id;
        self.next_id += 1;
        self.by_leaf.insert(
            leaf,
            Resource {
                id,
                hierarchy,
                driver,
            },
        );
        Ok(id)
    }

    /// Looks up a resource by its leaf or root name.
    pub fn by_name(&self, name: &str) -> Result<&Resource, StrataError> {
        self.by_leaf
            .get(name)
            .or_else(|| self.by_leaf.values().find(|r| r.hierarchy.root() == name))
            .ok_or_else(|| {
                StrataError::new(
                    ErrorKind::ResourceResolution,
                    format!("unknown resource '{}'", name),
                )
            })
    }

    pub fn by_hierarchy(
        &self,
        hierarchy: &Hierarchy,
    ) -> Result<&Resource, StrataError> {
        match self.by_leaf.get(hierarchy.leaf()) {
            Some(resc) if &resc.hierarchy == hierarchy => Ok(resc),
            _ => Err(StrataError::new(
                ErrorKind::ResourceResolution,
                format!("unknown resource hierarchy '{}'", hierarchy),
            )),
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.by_leaf.keys().cloned().collect();
        names.sort();
        names
    }
}
