//! Overlay layering.
//!
//! The final root is a kernel overlay whose lower layers are, top first:
//! read-only overlay images and partitions, the session staging directory
//! holding mount points missing from the image, then the image itself. A
//! writable overlay image, a writable SIF partition or `--writable-tmpfs`
//! provides the upper and work directories.

use std::path::{Path, PathBuf};

use strata_common::StrataResult;

use super::{Session, relative, resolve_in_root};
use crate::config::EngineConfig;
use crate::container::Mounter;
use crate::image::{Image, ImageType};
use crate::mount::{MountFlags, MountSystem, MountTag, Points};
use crate::rpc::Ops;

const STAGING_DIR: &str = "overlay-lowerdir";

/// Lower, upper and work directories of the overlay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OverlayDirs {
    /// Lower directories, top first.
    pub lower: Vec<PathBuf>,
    /// Upper and work directories when the overlay is writable.
    pub upper: Option<(PathBuf, PathBuf)>,
}

impl OverlayDirs {
    fn add_layer(&mut self, dir: &Path, fs_type: ImageType, writable: bool) {
        if writable && self.upper.is_none() {
            self.upper = Some((dir.join("upper"), dir.join("work")));
            return;
        }
        if writable {
            tracing::warn!(overlay = %dir.display(), "only one writable overlay is allowed, using read-only");
        }
        // Overlay images keep their content under `upper/`.
        let lower = match fs_type {
            ImageType::Ext3 => dir.join("upper"),
            _ if dir.join("upper").is_dir() => dir.join("upper"),
            _ => dir.to_path_buf(),
        };
        self.lower.push(lower);
    }

    /// Overlay mount data.
    #[must_use]
    pub fn options(&self) -> Vec<String> {
        let mut options = vec![format!(
            "lowerdir={}",
            self.lower
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(":")
        )];
        if let Some((upper, work)) = &self.upper {
            options.push(format!("upperdir={}", upper.display()));
            options.push(format!("workdir={}", work.display()));
        }
        options
    }
}

/// Container destinations missing from `rootfs`, relative to it, paired with
/// whether the destination is a regular file.
pub(crate) fn missing_destinations(points: &Points, rootfs: &Path) -> Vec<(PathBuf, bool)> {
    let mut missing: Vec<(PathBuf, bool)> = Vec::new();
    for point in points.iter() {
        if point.tag.is_session_side() || point.is_remount() || point.is_propagation() {
            continue;
        }
        let resolved = resolve_in_root(rootfs, &point.destination);
        if resolved.symlink_metadata().is_ok() {
            continue;
        }
        let rel = resolved
            .strip_prefix(rootfs)
            .map_or_else(|_| relative(&point.destination), Path::to_path_buf);
        if !missing.iter().any(|(p, _)| *p == rel) {
            missing.push((rel, point.file || (point.is_bind() && point.source.is_file())));
        }
    }
    missing
}

/// Register the overlay mounts and hooks.
pub fn plan<O: Ops + 'static>(
    system: &mut MountSystem<Mounter<O>>,
    session: &mut Session,
    image: &Image,
    engine: &EngineConfig,
    flags: MountFlags,
) -> StrataResult<OverlayDirs> {
    let mut dirs = OverlayDirs::default();

    let partitions = image.overlay_partitions();
    let upper_partition = if image.writable && !engine.writable_tmpfs {
        partitions.iter().rposition(|p| p.fs_type == ImageType::Ext3)
    } else {
        None
    };
    let mut layers = Vec::new();
    for (index, partition) in partitions.iter().enumerate() {
        let dir = session.add_dir(format!("overlay-images/partition-{index}"))?;
        let writable = Some(index) == upper_partition;
        let mut part_flags = flags;
        if !writable {
            part_flags |= MountFlags::RDONLY;
        }
        system.points.add_image(
            MountTag::PreLayer,
            &image.path,
            &dir,
            partition.fs_type,
            part_flags,
            partition.offset,
            partition.size,
        )?;
        layers.push((dir, partition.fs_type, writable));
    }

    for (index, overlay) in engine.overlay_images.iter().enumerate() {
        match overlay.image_type {
            ImageType::Sandbox => {
                layers.push((overlay.path.clone(), ImageType::Sandbox, overlay.writable));
            }
            ImageType::Ext3 | ImageType::Squashfs => {
                let dir = session.add_dir(format!("overlay-images/image-{index}"))?;
                let writable = overlay.writable && overlay.image_type == ImageType::Ext3;
                let mut image_flags = flags;
                if !writable {
                    image_flags |= MountFlags::RDONLY;
                }
                system.points.add_image(
                    MountTag::PreLayer,
                    &overlay.path,
                    &dir,
                    overlay.image_type,
                    image_flags,
                    overlay.offset,
                    overlay.size,
                )?;
                layers.push((dir, overlay.image_type, writable));
            }
            ImageType::Sif => {
                for (part_index, partition) in overlay.overlay_partitions().into_iter().enumerate() {
                    let dir =
                        session.add_dir(format!("overlay-images/image-{index}-{part_index}"))?;
                    system.points.add_image(
                        MountTag::PreLayer,
                        &overlay.path,
                        &dir,
                        partition.fs_type,
                        flags | MountFlags::RDONLY,
                        partition.offset,
                        partition.size,
                    )?;
                    layers.push((dir, partition.fs_type, false));
                }
            }
        }
    }

    // Writable layers go first so the upper is the one closest to the top.
    layers.sort_by_key(|(_, _, writable)| !*writable);
    for (dir, fs_type, writable) in &layers {
        dirs.add_layer(dir, *fs_type, *writable);
    }

    if engine.writable_tmpfs && dirs.upper.is_none() {
        let upper = session.add_dir("overlay-tmpfs/upper")?;
        let work = session.add_dir("overlay-tmpfs/work")?;
        dirs.upper = Some((upper, work));
    }

    let staging = session.add_dir(STAGING_DIR)?;
    dirs.lower.push(staging);
    dirs.lower.push(session.rootfs_path());

    system.points.add_fs(
        MountTag::Layer,
        session.final_path(),
        "overlay",
        flags,
        &dirs.options(),
    )?;

    let rootfs = session.rootfs_path();
    let upper = dirs.upper.clone();
    system.run_after_tag(MountTag::PreLayer, move |mounter: &mut Mounter<O>, points| {
        if let Some((upper, work)) = upper {
            for dir in [upper, work] {
                if dir.symlink_metadata().is_err() {
                    mounter.ops().mkdir(&dir, 0o755)?;
                }
            }
        }
        let staging = Path::new(STAGING_DIR);
        for (rel, is_file) in missing_destinations(points, &rootfs) {
            tracing::debug!(path = %rel.display(), "Staging missing destination");
            if is_file {
                mounter.session_mut().add_file(staging.join(rel), Vec::new())?;
            } else {
                mounter.session_mut().add_dir(staging.join(rel))?;
            }
        }
        Ok(())
    });

    tracing::debug!(lower = dirs.lower.len(), writable = dirs.upper.is_some(), "Overlay planned");
    Ok(dirs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_put_upper_last() {
        let mut dirs = OverlayDirs::default();
        dirs.add_layer(Path::new("/o/a"), ImageType::Ext3, false);
        dirs.add_layer(Path::new("/o/b"), ImageType::Ext3, true);
        dirs.add_layer(Path::new("/o/c"), ImageType::Ext3, true);
        dirs.lower.push(PathBuf::from("/s/rootfs"));

        assert_eq!(
            dirs.options(),
            vec![
                "lowerdir=/o/a/upper:/o/c/upper:/s/rootfs".to_string(),
                "upperdir=/o/b/upper".to_string(),
                "workdir=/o/b/work".to_string(),
            ]
        );
    }

    #[test]
    fn missing_destinations_skip_existing_and_session_side() {
        let temp = tempfile::tempdir().unwrap();
        let rootfs = temp.path().join("rootfs");
        std::fs::create_dir_all(rootfs.join("etc")).unwrap();
        std::fs::write(rootfs.join("etc/hosts"), "").unwrap();
        let host_file = temp.path().join("resolv.conf");
        std::fs::write(&host_file, "").unwrap();

        let mut points = Points::new();
        points
            .add_bind(MountTag::Rootfs, "/img", &rootfs, MountFlags::empty())
            .unwrap();
        points
            .add_bind(MountTag::Binds, "/etc/hosts", "/etc/hosts", MountFlags::empty())
            .unwrap();
        points
            .add_bind(MountTag::Userbinds, "/data", "/data/in", MountFlags::empty())
            .unwrap();
        points
            .add_bind(MountTag::Files, &host_file, "/etc/resolv.conf", MountFlags::empty())
            .unwrap();

        let missing = missing_destinations(&points, &rootfs);
        assert_eq!(
            missing,
            vec![
                (PathBuf::from("data/in"), false),
                (PathBuf::from("etc/resolv.conf"), true),
            ]
        );
    }

    #[test]
    fn unstaged_file_binds_are_files() {
        let temp = tempfile::tempdir().unwrap();
        let rootfs = temp.path().join("rootfs");
        std::fs::create_dir_all(&rootfs).unwrap();
        let session = temp.path().join("session");

        let mut points = Points::new();
        points
            .add_file_bind(MountTag::Files, session.join("passwd"), "/etc/passwd", MountFlags::NOSUID)
            .unwrap();
        points
            .add_file_bind(MountTag::Files, session.join("group"), "/etc/group", MountFlags::NOSUID)
            .unwrap();
        points
            .add_bind(MountTag::Userbinds, session.join("later"), "/mnt/later", MountFlags::empty())
            .unwrap();

        let missing = missing_destinations(&points, &rootfs);
        assert_eq!(
            missing,
            vec![
                (PathBuf::from("etc/passwd"), true),
                (PathBuf::from("etc/group"), true),
                (PathBuf::from("mnt/later"), false),
            ]
        );
    }
}
