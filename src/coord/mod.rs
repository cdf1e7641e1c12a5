//! Replica lifecycle coordination: staging (RST), logical locks, replica
//! access tokens, and the open/create/finalize coordinator driving data
//! objects through them.

mod checksum;
mod create;
mod descriptor;
mod finalize;
mod hooks;
mod locking;
mod open;
mod put;
mod rat;
mod replicate;
mod resolver;
mod rst;
mod undo;

pub use checksum::{checksum_of, compute_checksum, CHECKSUM_SCHEME};
pub use descriptor::{
    DescriptorTable, L1Fd, OpenDescriptor, OpenType, OprType,
};
pub use hooks::{HookContext, HookEvent, NoopHooks, PolicyHooks};
pub use locking::{LockKind, LockManager, LockState, StatusRestore};
pub use rat::{AgentId, ReplicaAccessTable, ReplicaToken};
pub use replicate::ReplicationSummary;
pub use resolver::{DefaultResolver, Intent, Resolution, ResourceResolver};
pub use rst::ReplicaStateTable;

use std::sync::Arc;

use serde::Deserialize;

use crate::catalog::{AclEntry, Avu, Catalog};
use crate::model::{DataObject, Hierarchy};
use crate::portal::{BufferCrypt, PortalConfig};
use crate::storage::{OpenFlags, Resource, ResourceRegistry};
use crate::utils::{ErrorKind, StrataError};

/// Configuration parameters of the coordinator.
#[derive(Debug, Deserialize, Clone)]
pub struct CoordConfig {
    /// Leaf resource used when a request names none.
    pub default_resource: String,

    /// Data type recorded on new replicas.
    pub default_data_type: String,

    /// Permission bits of new physical files.
    pub default_mode: u32,
}

impl Default for CoordConfig {
    fn default() -> Self {
        CoordConfig {
            default_resource: "demoResc".into(),
            default_data_type: "generic".into(),
            default_mode: 0o600,
        }
    }
}

impl CoordConfig {
    pub fn from_toml(config_str: Option<&str>) -> Result<Self, StrataError> {
        parsed_config!(config_str => CoordConfig;
                       default_resource, default_data_type, default_mode)
    }
}

/// The process-wide tables shared by every connection, handed to the
/// coordinator at construction.
#[derive(Debug, Clone)]
pub struct SharedTables {
    pub rst: Arc<ReplicaStateTable>,
    pub locks: Arc<LockManager>,
    pub rat: Arc<ReplicaAccessTable>,
}

impl SharedTables {
    pub fn new() -> Self {
        let rst = Arc::new(ReplicaStateTable::new());
        SharedTables {
            locks: Arc::new(LockManager::new(rst.clone())),
            rst,
            rat: Arc::new(ReplicaAccessTable::new()),
        }
    }
}

impl Default for SharedTables {
    fn default() -> Self {
        Self::new()
    }
}

/// What to do about the replica checksum at finalize.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub enum ChecksumMode {
    #[default]
    None,
    /// Compute and record.
    Register,
    /// Compute, compare with the given value, and record.
    Verify(String),
}

/// An open/put/get request as it reaches the coordinator.
#[derive(Debug, Clone, Default)]
pub struct OpenRequest {
    /// Zone-rooted logical path.
    pub logical_path: String,

    pub flags: OpenFlags,

    /// Permission bits of a created file; config default if `None`.
    pub mode: Option<u32>,

    /// Expected size in bytes, checked at finalize.
    pub data_size: Option<u64>,

    /// Resource the client asked for, if any.
    pub dest_resource: Option<String>,

    /// Token authorizing a write-open of an intermediate replica.
    pub replica_token: Option<ReplicaToken>,

    pub force: bool,
    pub no_check_copy_len: bool,
    pub checksum: ChecksumMode,
    pub data_type: Option<String>,

    /// Metadata and ACL applied at successful finalize.
    pub metadata: Vec<Avu>,
    pub acl: Vec<AclEntry>,

    /// Worker threads the client asks for; 0 lets the server choose.
    pub num_threads: u32,
    pub streaming: bool,
}

impl OpenRequest {
    pub fn new(logical_path: impl ToString, flags: OpenFlags) -> Self {
        OpenRequest {
            logical_path: logical_path.to_string(),
            flags,
            ..Default::default()
        }
    }
}

/// Per-connection state: the agent identity, its L1 descriptor table, and
/// the session cipher if the connection negotiated one.
#[derive(Debug)]
pub struct Connection {
    agent: AgentId,
    descriptors: DescriptorTable,
    crypt: Option<Arc<BufferCrypt>>,
}

impl Connection {
    pub fn new(agent: AgentId) -> Self {
        Connection {
            agent,
            descriptors: DescriptorTable::default(),
            crypt: None,
        }
    }

    pub fn with_crypt(mut self, crypt: BufferCrypt) -> Self {
        self.crypt = Some(Arc::new(crypt));
        self
    }

    pub fn agent(&self) -> AgentId {
        self.agent
    }

    pub fn open_fds(&self) -> Vec<L1Fd> {
        self.descriptors.open_fds()
    }

    pub fn descriptor(&self, fd: L1Fd) -> Result<&OpenDescriptor, StrataError> {
        self.descriptors.get(fd)
    }

    /// Access token of the write session behind a descriptor.
    pub fn token_of(&self, fd: L1Fd) -> Option<ReplicaToken> {
        self.descriptors.get(fd).ok().and_then(|d| d.token.clone())
    }
}

/// The open/create/finalize coordinator. One instance serves every
/// connection of the process.
pub struct Coordinator {
    config: CoordConfig,
    portal_config: PortalConfig,
    catalog: Arc<dyn Catalog>,
    resources: Arc<ResourceRegistry>,
    resolver: Arc<dyn ResourceResolver>,
    hooks: Arc<dyn PolicyHooks>,
    tables: SharedTables,
}

// Coordinator construction and accessors
impl Coordinator {
    pub fn new(
        config: CoordConfig,
        portal_config: PortalConfig,
        catalog: Arc<dyn Catalog>,
        resources: Arc<ResourceRegistry>,
        tables: SharedTables,
    ) -> Result<Self, StrataError> {
        portal_config.validate()?;
        let resolver = Arc::new(DefaultResolver::new(
            resources.clone(),
            &config.default_resource,
        ));
        Ok(Coordinator {
            config,
            portal_config,
            catalog,
            resources,
            resolver,
            hooks: Arc::new(NoopHooks),
            tables,
        })
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ResourceResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn PolicyHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn config(&self) -> &CoordConfig {
        &self.config
    }

    pub fn portal_config(&self) -> &PortalConfig {
        &self.portal_config
    }

    pub fn catalog(&self) -> &dyn Catalog {
        &*self.catalog
    }

    pub fn resources(&self) -> &ResourceRegistry {
        &self.resources
    }

    pub fn tables(&self) -> &SharedTables {
        &self.tables
    }

    fn resource(&self, hierarchy: &Hierarchy) -> Result<Resource, StrataError> {
        self.resources.by_hierarchy(hierarchy).cloned()
    }

    /// Stages an object in the RST. A concurrent session already staging it
    /// holds the object, so this reports `ReplicaLocked`.
    fn stage(&self, obj: &DataObject) -> Result<(), StrataError> {
        self.tables.rst.insert(obj).map_err(|e| {
            if e.is(ErrorKind::AlreadyStaged) {
                StrataError::new(ErrorKind::ReplicaLocked, e)
            } else {
                e
            }
        })
    }

    fn hook_ctx(req: &OpenRequest, hierarchy: &Hierarchy) -> HookContext {
        let mut ctx = HookContext::new();
        ctx.insert("logical_path".into(), req.logical_path.clone());
        ctx.insert("resource_hierarchy".into(), hierarchy.to_string());
        if let Some(size) = req.data_size {
            ctx.insert("data_size".into(), size.to_string());
        }
        ctx
    }

    /// Runs the pre-hook; any refusal surfaces as `HookRejected`.
    async fn pre_hook(
        &self,
        event: HookEvent,
        ctx: &HookContext,
    ) -> Result<(), StrataError> {
        self.hooks.pre(event, ctx).await.map_err(|e| {
            pf_info!("pre-hook {:?} refused: {}", event, e);
            if e.is(ErrorKind::HookRejected) {
                e
            } else {
                StrataError::new(ErrorKind::HookRejected, e)
            }
        })
    }

    async fn post_hook<T>(
        &self,
        event: HookEvent,
        ctx: &HookContext,
        result: &Result<T, StrataError>,
    ) {
        let status = match result {
            Ok(_) => Ok(()),
            Err(e) => Err(e),
        };
        self.hooks.post(event, ctx, status).await;
    }
}
