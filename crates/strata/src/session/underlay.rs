//! Underlay layering.
//!
//! The final root is a session directory. Every top-level entry of the image
//! is bound into it; directories that must hold a missing destination are
//! recreated in the session instead and their own entries bound one level
//! deeper, so the missing mount point can be created without touching the
//! image.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use strata_common::StrataResult;

use super::Session;
use super::overlay::missing_destinations;
use crate::container::Mounter;
use crate::mount::{MountFlags, MountSystem, MountTag, Points};
use crate::rpc::Ops;

/// Register the underlay mounts and hooks.
pub fn plan<O: Ops + 'static>(
    system: &mut MountSystem<Mounter<O>>,
    session: &Session,
) -> StrataResult<()> {
    let final_path = session.final_path();
    // pivot_root needs the new root to be a mount point.
    system
        .points
        .add_bind(MountTag::Layer, &final_path, &final_path, MountFlags::REC)?;

    let rootfs = session.rootfs_path();
    system.run_after_tag(MountTag::Rootfs, move |mounter: &mut Mounter<O>, points| {
        let missing = missing_destinations(points, &rootfs);
        let mut layer = Underlay {
            session: mounter.session_mut(),
            points,
            rootfs: &rootfs,
            final_path: &final_path,
        };
        layer.layer_dir(Path::new(""), &missing)
    });
    Ok(())
}

struct Underlay<'a> {
    session: &'a mut Session,
    points: &'a mut Points,
    rootfs: &'a Path,
    final_path: &'a Path,
}

/// Group relative paths by their first component.
fn group_by_head(paths: &[(PathBuf, bool)]) -> BTreeMap<OsString, Vec<(PathBuf, bool)>> {
    let mut groups: BTreeMap<OsString, Vec<(PathBuf, bool)>> = BTreeMap::new();
    for (path, is_file) in paths {
        let mut components = path.components();
        let Some(head) = components.next() else {
            continue;
        };
        groups
            .entry(head.as_os_str().to_os_string())
            .or_default()
            .push((components.as_path().to_path_buf(), *is_file));
    }
    groups
}

impl Underlay<'_> {
    fn final_rel(rel: &Path) -> PathBuf {
        Path::new("final").join(rel)
    }

    fn layer_dir(&mut self, rel: &Path, missing: &[(PathBuf, bool)]) -> StrataResult<()> {
        let mut groups = group_by_head(missing);
        let dir = self.rootfs.join(rel);

        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let entry_rel = rel.join(&name);
            let file_type = entry.file_type()?;
            let wanted = groups.remove(&name);

            if file_type.is_symlink() {
                let target = std::fs::read_link(entry.path())?;
                self.session.add_symlink(Self::final_rel(&entry_rel), target)?;
                continue;
            }

            if file_type.is_dir() {
                self.session.add_dir(Self::final_rel(&entry_rel))?;
                match wanted {
                    Some(children) if children.iter().any(|(p, _)| !p.as_os_str().is_empty()) => {
                        self.layer_dir(&entry_rel, &children)?;
                    }
                    _ => self.bind(&entry_rel)?,
                }
                continue;
            }

            self.session
                .add_file(Self::final_rel(&entry_rel), Vec::new())?;
            self.bind(&entry_rel)?;
        }

        for (name, children) in groups {
            let created = rel.join(&name);
            for (child, is_file) in children {
                let path = Self::final_rel(&created.join(&child));
                if is_file {
                    self.session.add_file(path, Vec::new())?;
                } else {
                    self.session.add_dir(path)?;
                }
            }
            tracing::debug!(path = %created.display(), "Created missing underlay entry");
        }
        Ok(())
    }

    fn bind(&mut self, rel: &Path) -> StrataResult<()> {
        self.points.add_bind(
            MountTag::Layer,
            self.rootfs.join(rel),
            self.final_path.join(rel),
            MountFlags::REC,
        )
    }
}
