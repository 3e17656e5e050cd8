//! CLI command definitions and handlers.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::eyre::Result;
use ploop_common::LayerId;
use ploop_common::paths::PLOOP_HOME;

use crate::driver::Driver;
use crate::image::PloopCli;

/// ploopctl - drive ploop container layers by hand
#[derive(Parser)]
#[command(name = "ploopctl")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Driver home directory
    #[arg(long, global = true, env = "PLOOP_HOME", default_value_os_t = PLOOP_HOME.clone())]
    pub home: PathBuf,

    /// Driver option as key=value (ploop.size, ploop.mode, ploop.clog, ploop.libdebug)
    #[arg(short = 'o', long = "storage-opt", global = true)]
    pub storage_opts: Vec<String>,

    /// ploop binary to run
    #[arg(long, global = true, env = "PLOOP_BIN", default_value = "ploop")]
    pub ploop: PathBuf,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Output format of introspection commands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Aligned key/value lines
    #[default]
    Table,
    /// JSON document
    Json,
}

/// Driver commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Create a layer
    Create {
        /// Layer ID
        id: LayerId,

        /// Clone the new layer from this layer
        #[arg(short, long)]
        parent: Option<LayerId>,
    },

    /// Remove a layer
    Remove {
        /// Layer ID
        id: LayerId,
    },

    /// Mount a layer and print its mount point
    Mount {
        /// Layer ID
        id: LayerId,

        /// Security label for the mounted filesystem
        #[arg(short, long, default_value = "")]
        label: String,
    },

    /// Unmount a layer
    Umount {
        /// Layer ID
        id: LayerId,
    },

    /// Check whether a layer exists
    Exists {
        /// Layer ID
        id: LayerId,
    },

    /// Show driver status
    Status {
        /// Output format
        #[arg(short, long, value_enum, default_value_t)]
        format: OutputFormat,
    },

    /// Show layer details
    Metadata {
        /// Layer ID
        id: LayerId,

        /// Output format
        #[arg(short, long, value_enum, default_value_t)]
        format: OutputFormat,
    },

    /// Drop the master template and release tracked mounts
    Cleanup,
}

impl Cli {
    /// Execute the CLI command.
    ///
    /// Every invocation starts the driver, which recreates the master template.
    pub fn execute(self) -> Result<()> {
        let backend = Arc::new(PloopCli::new(&self.ploop));
        let driver = Driver::with_backend(&self.home, &self.storage_opts, backend)?;

        match self.command {
            Commands::Create { id, parent } => {
                driver.create(id.as_str(), parent.as_ref().map(LayerId::as_str))?;
                println!("Layer {id} created");
            }

            Commands::Remove { id } => {
                driver.remove(id.as_str())?;
                println!("Layer {id} removed");
            }

            Commands::Mount { id, label } => {
                let mount_point = driver.get(id.as_str(), &label)?;
                println!("{}", mount_point.display());
            }

            Commands::Umount { id } => {
                driver.put(id.as_str())?;
                println!("Layer {id} unmounted");
            }

            Commands::Exists { id } => {
                println!("{}", driver.exists(id.as_str()));
            }

            Commands::Status { format } => {
                let status = driver.status();
                match format {
                    OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&status)?),
                    OutputFormat::Table => print_table(status),
                }
            }

            Commands::Metadata { id, format } => {
                let metadata = driver.metadata(id.as_str())?;
                match format {
                    OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&metadata)?),
                    OutputFormat::Table => print_table(metadata),
                }
            }

            Commands::Cleanup => {
                driver.cleanup();
                println!("Driver cleaned up");
            }
        }

        Ok(())
    }
}

fn print_table(rows: impl IntoIterator<Item = (String, String)>) {
    let rows: Vec<_> = rows.into_iter().collect();
    let width = rows.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
    for (key, value) in rows {
        println!("{key:<width$}  {value}");
    }
}
