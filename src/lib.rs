//! Strata core: replica lifecycle coordination over a catalog and a set of
//! storage resources, plus the parallel portal transfer engine.

#[macro_use]
mod utils;

pub mod catalog;
pub mod coord;
pub mod model;
pub mod portal;
pub mod storage;

pub use utils::{config_section, logger_init, set_me, ErrorKind, StrataError, ME};

pub use catalog::{Catalog, FileCatalog, InMemoryCatalog};
pub use coord::{
    ChecksumMode, Connection, CoordConfig, Coordinator, OpenRequest,
    ReplicationSummary, SharedTables,
};
pub use model::{DataObject, Hierarchy, Replica, ReplicaStatus};
pub use portal::{PortalConfig, PortalOprOut};
pub use storage::{LocalFsDriver, OpenFlags, ResourceRegistry, StorageDriver};
