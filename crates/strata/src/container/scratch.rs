//! Temporary, scratch and current working directories.

use std::path::{Path, PathBuf};

use strata_common::StrataResult;

use super::{Container, recoverable};
use crate::mount::{MountFlags, MountPoint, MountTag};
use crate::rpc::Ops;
use crate::session::relative;

/// Flat name of a container path (`/data/out` becomes `data_out`).
fn flat_name(path: &Path) -> String {
    relative(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("_")
}

/// Returns true if an earlier container-side mount already provides `cwd`.
fn cwd_covered<'a>(cwd: &Path, mut points: impl Iterator<Item = &'a MountPoint>) -> bool {
    points.any(|p| {
        !p.tag.is_session_side()
            && !p.is_remount()
            && !p.is_propagation()
            && cwd.starts_with(&p.destination)
            && p.destination != Path::new("/")
    })
}

impl<O: Ops + 'static> Container<O> {
    pub(super) fn add_tmp(&mut self) -> StrataResult<()> {
        if !self.config.mount_tmp {
            tracing::debug!("Skipping /tmp and /var/tmp per configuration");
            return Ok(());
        }
        for (dest, name) in [("/tmp", "tmp"), ("/var/tmp", "var_tmp")] {
            let source = if self.engine.contain {
                self.contained_dir(name, 0o1777)?
            } else {
                PathBuf::from(dest)
            };
            tracing::debug!(source = %source.display(), destination = dest, "Adding temporary directory");
            recoverable(
                dest,
                self.system.points.add_bind(
                    MountTag::Tmp,
                    source,
                    dest,
                    MountFlags::NOSUID | MountFlags::NODEV | MountFlags::REC,
                ),
            )?;
        }
        Ok(())
    }

    pub(super) fn add_scratch(&mut self) -> StrataResult<()> {
        let scratch = self.engine.scratch_dir.clone();
        for dest in scratch {
            let source = self.contained_dir(&format!("scratch/{}", flat_name(&dest)), 0o1777)?;
            tracing::debug!(source = %source.display(), destination = %dest.display(), "Adding scratch directory");
            recoverable(
                "scratch directory",
                self.system.points.add_bind(
                    MountTag::Scratch,
                    source,
                    &dest,
                    MountFlags::NOSUID | MountFlags::NODEV | MountFlags::REC,
                ),
            )?;
        }
        Ok(())
    }

    pub(super) fn add_cwd(&mut self) -> StrataResult<()> {
        if self.engine.no_cwd || self.engine.contain {
            return Ok(());
        }
        let cwd = self.cwd.clone();
        if cwd == Path::new("/") || !cwd.is_absolute() {
            tracing::debug!(cwd = %cwd.display(), "Not binding the working directory");
            return Ok(());
        }
        if cwd_covered(&cwd, self.system.points.iter()) {
            tracing::debug!(cwd = %cwd.display(), "Working directory already mounted");
            return Ok(());
        }
        recoverable(
            "current working directory",
            self.system.points.add_bind(
                MountTag::Cwd,
                &cwd,
                &cwd,
                self.suid_flag | MountFlags::NODEV | MountFlags::REC,
            ),
        )
    }
}
