//! # Strata
//!
//! Strata creates containers the way HPC runtimes do: the root filesystem is
//! assembled from images inside a temporary session directory, then the
//! container process is switched into it.
//!
//! ## Layout
//!
//! - [`container`]: the creation pass, an ordered set of tagged mount points
//! - [`rpc`]: privileged operations performed by the container process on
//!   behalf of the engine
//! - [`session`]: the session directory and the overlay/underlay layouts
//! - [`starter`]: namespaces, fork and the engine/container handshake
//! - [`exec`]: action scripts, `sinit` and the final exec
//!
//! ## Usage
//!
//! ```no_run
//! use strata::config::{EngineConfig, FileConfig, Identity};
//! use strata::starter::Launcher;
//! use strata_common::StrataPaths;
//!
//! # fn example() -> strata_common::StrataResult<i32> {
//! let paths = StrataPaths::new();
//! let engine = EngineConfig::load(std::path::Path::new("engine.json"))?;
//! let config = FileConfig::load(&paths.config_file())?;
//! let launcher = Launcher::new(engine, config, Identity::current()?, paths);
//! launcher.run()
//! # }
//! ```

#![warn(missing_docs)]

pub mod cgroup;
pub mod cli;
pub mod config;
pub mod container;
pub mod exec;
pub mod image;
pub mod instance;
pub mod mount;
pub mod network;
pub mod rpc;
pub mod security;
pub mod session;
pub mod starter;

pub use container::Container;
