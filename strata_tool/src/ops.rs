//! Tool operations over an in-process coordinator.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tokio::fs;

use strata::catalog::CatalogFilter;
use strata::coord::AgentId;
use strata::portal::{client_get, client_put, LocalSource};
use strata::{
    pf_debug, ChecksumMode, Connection, CoordConfig, Coordinator, ErrorKind,
    FileCatalog, Hierarchy, LocalFsDriver, OpenFlags, OpenRequest,
    PortalConfig, Replica, ResourceRegistry, SharedTables, StrataError,
};

use crate::{ToolCmd, ToolConfig};

/// A coordinator over one vault directory and the connection the tool
/// acts through.
pub(crate) struct Tool {
    coord: Coordinator,
    num_threads: u32,
}

impl Tool {
    /// Sets up resource directories and the file-backed catalog.
    pub(crate) async fn open(
        vault: &Path,
        coord_config: CoordConfig,
        portal_config: PortalConfig,
        tool_config: &ToolConfig,
        num_threads: u32,
    ) -> Result<Self, StrataError> {
        if !tool_config.resources.contains(&coord_config.default_resource) {
            return Err(StrataError::new(
                ErrorKind::InvalidInput,
                format!(
                    "default resource '{}' not among {:?}",
                    coord_config.default_resource, tool_config.resources
                ),
            ));
        }

        let mut registry = ResourceRegistry::new();
        for name in &tool_config.resources {
            let dir = vault.join(name);
            fs::create_dir_all(&dir).await?;
            registry.add(
                Hierarchy::single(name),
                Arc::new(LocalFsDriver::new(&dir)),
            )?;
        }
        let catalog =
            FileCatalog::open(vault.join(&tool_config.catalog_file)).await?;
        pf_debug!("vault {} with {:?}", vault.display(), registry.names());

        Ok(Tool {
            coord: Coordinator::new(
                coord_config,
                portal_config,
                Arc::new(catalog),
                Arc::new(registry),
                SharedTables::new(),
            )?,
            num_threads,
        })
    }

    pub(crate) async fn run(&self, cmd: ToolCmd) -> Result<(), StrataError> {
        let mut conn = Connection::new(std::process::id() as AgentId);
        let result = match cmd {
            ToolCmd::Put {
                local,
                logical,
                resource,
                force,
                checksum,
            } => {
                self.put(&mut conn, &local, &logical, resource, force, checksum)
                    .await
            }
            ToolCmd::Get {
                logical,
                local,
                resource,
            } => self.get(&mut conn, &logical, &local, resource).await,
            ToolCmd::Repl {
                logical,
                resource,
                recursive,
            } => self.repl(&mut conn, &logical, &resource, recursive).await,
            ToolCmd::Ls { logical } => self.ls(&logical).await,
        };
        self.coord.close_all(&mut conn).await;
        result
    }

    async fn put(
        &self,
        conn: &mut Connection,
        local: &Path,
        logical: &str,
        resource: Option<String>,
        force: bool,
        checksum: bool,
    ) -> Result<(), StrataError> {
        let size = fs::metadata(local).await?.len();
        let mut req = OpenRequest::new(logical, OpenFlags::WRONLY);
        req.dest_resource = resource;
        req.force = force;
        req.data_size = Some(size);
        req.num_threads = self.num_threads;
        if checksum {
            req.checksum = ChecksumMode::Register;
        }

        let started = Instant::now();
        let config = self.coord.portal_config();
        if size < config.parallel_threshold {
            let data = fs::read(local).await?;
            self.coord.put(conn, req, &data).await?;
        } else {
            let out = self.coord.parallel_put(conn, req).await?;
            let source = LocalSource::File(local.to_path_buf());
            let (served, sent) = tokio::join!(
                self.coord.serve_portal(conn, out.l1_fd),
                client_put(&out, source, None, config.buffer_size())
            );
            served?;
            sent?;
        }
        println!(
            "put {} -> {}: {} bytes in {:.3}s",
            local.display(),
            logical,
            size,
            started.elapsed().as_secs_f64()
        );
        self.ls(logical).await
    }

    async fn get(
        &self,
        conn: &mut Connection,
        logical: &str,
        local: &Path,
        resource: Option<String>,
    ) -> Result<(), StrataError> {
        let mut req = OpenRequest::new(logical, OpenFlags::RDONLY);
        req.dest_resource = resource;
        req.num_threads = self.num_threads;

        let started = Instant::now();
        let config = self.coord.portal_config();
        let out = self.coord.parallel_get(conn, req).await?;
        let (served, got) = tokio::join!(
            self.coord.serve_portal(conn, out.l1_fd),
            client_get(&out, local, None, config.buffer_size())
        );
        served?;
        let bytes = got?;
        println!(
            "get {} -> {}: {} bytes over {} threads in {:.3}s",
            logical,
            local.display(),
            bytes,
            out.num_threads,
            started.elapsed().as_secs_f64()
        );
        Ok(())
    }

    async fn repl(
        &self,
        conn: &mut Connection,
        logical: &str,
        resource: &str,
        recursive: bool,
    ) -> Result<(), StrataError> {
        if recursive {
            let summary = self
                .coord
                .replicate_collection(conn, logical, resource, self.num_threads)
                .await?;
            println!(
                "repl {} -> {}: {} objects, {} skipped, {} bytes",
                logical, resource, summary.files, summary.skipped, summary.bytes
            );
            return Ok(());
        }

        match self
            .coord
            .replicate(conn, logical, resource, self.num_threads)
            .await
        {
            Ok(replica) => println!("{}", replica_line(&replica)),
            Err(e) if e.is(ErrorKind::AlreadyInResource) => {
                println!("{} already good on {}", logical, resource)
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    async fn ls(&self, logical: &str) -> Result<(), StrataError> {
        let catalog = self.coord.catalog();
        let mut rows = catalog
            .query(&CatalogFilter::LogicalPath(logical.into()))
            .await?;
        if rows.is_empty() {
            rows = catalog
                .query(&CatalogFilter::Collection(logical.into()))
                .await?;
        }
        if rows.is_empty() {
            return Err(StrataError::new(
                ErrorKind::ReplicaNotFound,
                format!("nothing at '{}'", logical),
            ));
        }
        rows.sort_by(|a, b| {
            (&a.logical_path, a.replica_number)
                .cmp(&(&b.logical_path, b.replica_number))
        });
        for replica in &rows {
            println!("{}", replica_line(replica));
        }
        Ok(())
    }
}

fn replica_line(replica: &Replica) -> String {
    format!(
        "{}  #{} {} {:?} {} {}",
        replica.logical_path,
        replica.replica_number,
        replica.hierarchy,
        replica.status,
        replica.size,
        replica.checksum.as_deref().unwrap_or("-")
    )
}
