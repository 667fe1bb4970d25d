//! CLI command definitions and handlers.

use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use strata_common::StrataPaths;

use crate::config::{EngineConfig, FileConfig, Identity};
use crate::instance::InstanceStore;
use crate::rpc::{Server, ServerState};
use crate::starter::Launcher;

/// Strata - session-staged container engine
#[derive(Parser)]
#[command(name = "strata")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Admin configuration file
    #[arg(long, global = true, env = "STRATA_CONF")]
    pub admin_config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Engine commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Create a container and start its process
    Start {
        /// Engine configuration (JSON)
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Start a process in a running instance
    Join {
        /// Engine configuration (JSON) naming an instance:// image
        #[arg(short, long)]
        config: PathBuf,
    },

    /// List the running instances of the caller
    Instances {
        /// Output format (table, json)
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// Serve privileged operations on the socket passed as stdin
    #[command(hide = true)]
    RpcServer,
}

fn load_file_config(path: &Path) -> Result<FileConfig> {
    if path.exists() {
        Ok(FileConfig::load(path)?)
    } else {
        tracing::warn!(path = %path.display(), "admin configuration missing, using defaults");
        Ok(FileConfig::default())
    }
}

impl Cli {
    /// Execute the CLI command and return the process exit code.
    pub async fn execute(self) -> Result<i32> {
        let paths = StrataPaths::new();
        let admin_config = self.admin_config.unwrap_or_else(|| paths.config_file());
        let file_config = load_file_config(&admin_config)?;

        match self.command {
            Commands::Start { config } | Commands::Join { config } => {
                let engine = EngineConfig::load(&config)
                    .map_err(|e| eyre!("unable to load {}: {e}", config.display()))?;
                let identity = Identity::current()?;
                let launcher = Launcher::new(engine, file_config, identity, paths);
                let code = tokio::task::spawn_blocking(move || launcher.run()).await??;
                Ok(code)
            }

            Commands::Instances { format } => {
                let identity = Identity::current()?;
                let store = InstanceStore::for_user(&paths, &identity.name);
                store.cleanup_stale()?;
                let records = store
                    .list()?
                    .iter()
                    .map(|name| store.load(name))
                    .collect::<Result<Vec<_>, _>>()?;

                if format == "json" {
                    println!("{}", serde_json::to_string_pretty(&records)?);
                } else {
                    println!("NAME\tPID\tIMAGE");
                    for record in records {
                        println!("{}\t{}\t{}", record.name, record.pid, record.image);
                    }
                }
                Ok(0)
            }

            Commands::RpcServer => {
                let stream = UnixStream::from(std::io::stdin().as_fd().try_clone_to_owned()?);
                let server = Server::new(ServerState {
                    file_config,
                    disk_gid: None,
                });
                tokio::task::spawn_blocking(move || {
                    server
                        .spawn(stream)?
                        .join()
                        .map_err(|_| eyre!("rpc server thread panicked"))?
                        .map_err(color_eyre::Report::from)
                })
                .await??;
                Ok(0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn start_takes_a_config() {
        let cli = Cli::try_parse_from(["strata", "--debug", "start", "--config", "/tmp/c.json"]).unwrap();
        assert!(cli.debug);
        assert!(matches!(cli.command, Commands::Start { config } if config == Path::new("/tmp/c.json")));
    }

    #[test]
    fn missing_admin_config_uses_defaults() {
        let temp = tempfile::tempdir().unwrap();
        let config = load_file_config(&temp.path().join("strata.toml")).unwrap();
        assert_eq!(config.max_loop_devices, FileConfig::default().max_loop_devices);
    }
}
