//! Home directory.

use std::path::PathBuf;

use strata_common::{StrataError, StrataResult};

use super::{Container, recoverable};
use crate::mount::{MountFlags, MountTag};
use crate::rpc::Ops;

/// Split a `src[:dst]` home specification.
fn parse_home(spec: &str) -> StrataResult<(PathBuf, PathBuf)> {
    let (source, destination) = spec.split_once(':').unwrap_or((spec, spec));
    let (source, destination) = (PathBuf::from(source), PathBuf::from(destination));
    if !source.is_absolute() || !destination.is_absolute() {
        return Err(StrataError::config(format!(
            "home {spec:?}: paths must be absolute"
        )));
    }
    Ok((source, destination))
}

impl<O: Ops + 'static> Container<O> {
    pub(super) fn add_home(&mut self) -> StrataResult<()> {
        if self.engine.no_home {
            tracing::debug!("Skipping home directory as requested");
            return Ok(());
        }
        let custom = self.engine.home.clone();
        if !self.config.mount_home && custom.is_none() {
            tracing::debug!("Skipping home directory per configuration");
            return Ok(());
        }

        let (source, destination) = match &custom {
            Some(spec) => parse_home(spec).map_err(|e| StrataError::mount("home directory", e))?,
            None => (self.identity.home.clone(), self.identity.home.clone()),
        };
        // A contained container gets an empty home unless one was given.
        let source = if self.engine.contain && custom.is_none() {
            self.contained_dir("home", 0o777)?
        } else {
            source
        };

        tracing::debug!(
            source = %source.display(),
            destination = %destination.display(),
            "Adding home directory"
        );
        self.home_dest = Some(destination.clone());
        recoverable(
            "home directory",
            self.system.points.add_bind(
                MountTag::Home,
                source,
                destination,
                MountFlags::NOSUID | MountFlags::NODEV | MountFlags::REC,
            ),
        )
    }
}
