//! Strata command line tool: put, get, replicate, and list data objects in
//! a local vault, running the portal over loopback in-process.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde::Deserialize;

use tokio::runtime::Builder;

use strata::model::split_logical_path;
use strata::{
    config_section, logger_init, parsed_config, pf_error, pf_info, set_me,
    CoordConfig, ErrorKind, PortalConfig, StrataError,
};

mod ops;

use crate::ops::Tool;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Vault directory; each resource gets a subdirectory and the catalog
    /// snapshot lives at its top.
    #[arg(short, long)]
    vault: PathBuf,

    /// Optional TOML config file with `[coord]`, `[portal]`, and `[tool]`
    /// tables.
    #[arg(short, long, default_value_t = String::from(""))]
    config: String,

    /// Transfer threads to ask for; 0 lets the server choose.
    #[arg(short, long, default_value_t = 0)]
    num_threads: u32,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 4)]
    threads: usize,

    #[command(subcommand)]
    cmd: ToolCmd,
}

/// Tool subcommands.
#[derive(Subcommand, Debug, PartialEq, Eq, Clone)]
enum ToolCmd {
    /// Upload a local file as a data object.
    Put {
        local: PathBuf,
        logical: String,

        /// Destination resource; config default if absent.
        #[arg(short, long)]
        resource: Option<String>,

        /// Overwrite an existing replica.
        #[arg(short, long)]
        force: bool,

        /// Register a checksum of the uploaded replica.
        #[arg(short = 'k', long)]
        checksum: bool,
    },

    /// Download a data object into a local file.
    Get {
        logical: String,
        local: PathBuf,

        /// Resource to read from; first good replica if absent.
        #[arg(short, long)]
        resource: Option<String>,
    },

    /// Replicate a data object, or a whole collection, onto a resource.
    Repl {
        logical: String,
        resource: String,

        /// Treat `logical` as a collection.
        #[arg(short, long)]
        recursive: bool,
    },

    /// List the replicas of a data object or of a collection.
    Ls { logical: String },
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(())` on success or
    /// `Err(StrataError)` on any error.
    fn sanitize(&self) -> Result<(), StrataError> {
        if self.threads < 2 {
            return Err(StrataError::new(
                ErrorKind::InvalidInput,
                format!("invalid number of threads {}", self.threads),
            ));
        }
        if self.vault.as_os_str().is_empty() {
            return Err(StrataError::new(
                ErrorKind::InvalidInput,
                "vault directory not given",
            ));
        }
        match &self.cmd {
            ToolCmd::Put { logical, .. } | ToolCmd::Get { logical, .. } => {
                split_logical_path(logical)?;
            }
            ToolCmd::Repl {
                logical,
                recursive,
                ..
            } => {
                if !*recursive {
                    split_logical_path(logical)?;
                } else if !logical.starts_with('/') {
                    return Err(StrataError::new(
                        ErrorKind::InvalidInput,
                        format!("invalid collection '{}'", logical),
                    ));
                }
            }
            ToolCmd::Ls { logical } => {
                if !logical.starts_with('/') {
                    return Err(StrataError::new(
                        ErrorKind::InvalidInput,
                        format!("invalid logical path '{}'", logical),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Configuration parameters of the tool itself.
#[derive(Debug, Deserialize, Clone)]
pub struct ToolConfig {
    /// Resource names, one vault subdirectory each.
    pub resources: Vec<String>,

    /// Catalog snapshot file name inside the vault.
    pub catalog_file: String,
}

impl Default for ToolConfig {
    fn default() -> Self {
        ToolConfig {
            resources: vec!["demoResc".into()],
            catalog_file: "catalog.mpk".into(),
        }
    }
}

/// Actual main function of the Strata tool.
fn tool_main() -> Result<(), StrataError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    args.sanitize()?;

    // split the optional config file into per-component tables
    let doc = if args.config.is_empty() {
        None
    } else {
        Some(std::fs::read_to_string(&args.config)?)
    };
    let section = |name: &str| match &doc {
        Some(doc) => config_section(doc, name),
        None => Ok(None),
    };
    let coord_config = CoordConfig::from_toml(section("coord")?.as_deref())?;
    let portal_config = PortalConfig::from_toml(section("portal")?.as_deref())?;
    let tool_section = section("tool")?;
    let tool_config = parsed_config!(tool_section.as_deref() => ToolConfig;
                                     resources, catalog_file)?;

    // create tokio multi-threaded runtime
    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(args.threads)
        .thread_name("tokio-worker-tool")
        .build()?;

    runtime.block_on(async move {
        let tool = Tool::open(
            &args.vault,
            coord_config,
            portal_config,
            &tool_config,
            args.num_threads,
        )
        .await?;
        tool.run(args.cmd).await
    })
}

/// Main function of the Strata tool.
fn main() -> ExitCode {
    logger_init();
    set_me("tool");

    if let Err(ref e) = tool_main() {
        pf_error!("tool_main exitted: {}", e);
        ExitCode::FAILURE
    } else {
        pf_info!("tool_main exitted successfully");
        ExitCode::SUCCESS
    }
}
