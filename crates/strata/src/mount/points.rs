//! Ordered, tagged list of mount points.

use std::path::{Path, PathBuf};

use strata_common::{StrataError, StrataResult};

use super::{ImageOptions, MountFlags, MountPoint, MountTag};
use crate::image::ImageType;

/// Append-only mount point list grouped by tag.
#[derive(Debug, Clone, Default)]
pub struct Points {
    points: Vec<MountPoint>,
}

impl Points {
    /// Create an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a bind mount.
    pub fn add_bind(
        &mut self,
        tag: MountTag,
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        flags: MountFlags,
    ) -> StrataResult<()> {
        self.add(MountPoint {
            tag,
            source: source.into(),
            destination: destination.into(),
            fstype: None,
            flags: flags | MountFlags::BIND,
            options: Vec::new(),
            image: None,
            file: false,
        })
    }

    /// Add a bind mount of a regular file.
    pub fn add_file_bind(
        &mut self,
        tag: MountTag,
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        flags: MountFlags,
    ) -> StrataResult<()> {
        self.add(MountPoint {
            tag,
            source: source.into(),
            destination: destination.into(),
            fstype: None,
            flags: flags | MountFlags::BIND,
            options: Vec::new(),
            image: None,
            file: true,
        })
    }

    /// Add a filesystem mount with optional data options.
    pub fn add_fs(
        &mut self,
        tag: MountTag,
        destination: impl Into<PathBuf>,
        fstype: &str,
        flags: MountFlags,
        options: &[String],
    ) -> StrataResult<()> {
        self.add(MountPoint {
            tag,
            source: PathBuf::from(fstype),
            destination: destination.into(),
            fstype: Some(fstype.to_string()),
            flags,
            options: options.to_vec(),
            image: None,
            file: false,
        })
    }

    /// Add a loop-backed image mount.
    #[allow(clippy::too_many_arguments)]
    pub fn add_image(
        &mut self,
        tag: MountTag,
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        image_type: ImageType,
        flags: MountFlags,
        offset: u64,
        size: u64,
    ) -> StrataResult<()> {
        let fstype = image_type.fstype().ok_or_else(|| {
            StrataError::config(format!("{image_type:?} images cannot be loop mounted"))
        })?;
        self.add(MountPoint {
            tag,
            source: source.into(),
            destination: destination.into(),
            fstype: Some(fstype.to_string()),
            flags,
            options: Vec::new(),
            image: Some(ImageOptions {
                image_type: Some(image_type),
                offset,
                size,
            }),
            file: false,
        })
    }

    /// Add an overlay mount assembled from lower, upper and work directories.
    pub fn add_overlay(
        &mut self,
        tag: MountTag,
        destination: impl Into<PathBuf>,
        flags: MountFlags,
        lower: &[PathBuf],
        upper_work: Option<(&Path, &Path)>,
    ) -> StrataResult<()> {
        if lower.is_empty() {
            return Err(StrataError::config("overlay requires at least one lower directory"));
        }
        let lowerdir = lower
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(":");
        let mut options = vec![format!("lowerdir={lowerdir}")];
        if let Some((upper, work)) = upper_work {
            options.push(format!("upperdir={}", upper.display()));
            options.push(format!("workdir={}", work.display()));
        }
        self.add_fs(tag, destination, "overlay", flags, &options)
    }

    /// Add a propagation change.
    pub fn add_propagation(
        &mut self,
        tag: MountTag,
        destination: impl Into<PathBuf>,
        flags: MountFlags,
    ) -> StrataResult<()> {
        if !flags.intersects(MountFlags::PROPAGATION) {
            return Err(StrataError::config(format!(
                "{flags:?} carries no propagation flag"
            )));
        }
        let destination = destination.into();
        self.add(MountPoint {
            tag,
            source: PathBuf::new(),
            destination,
            fstype: None,
            flags: flags & (MountFlags::PROPAGATION | MountFlags::REC),
            options: Vec::new(),
            image: None,
            file: false,
        })
    }

    /// Add a remount of an existing destination.
    pub fn add_remount(
        &mut self,
        tag: MountTag,
        destination: impl Into<PathBuf>,
        flags: MountFlags,
    ) -> StrataResult<()> {
        let destination = destination.into();
        self.add(MountPoint {
            tag,
            source: PathBuf::new(),
            destination,
            fstype: None,
            flags: flags | MountFlags::REMOUNT,
            options: Vec::new(),
            image: None,
            file: false,
        })
    }

    /// Append a point, rejecting a second non-remount entry for a destination.
    pub fn add(&mut self, point: MountPoint) -> StrataResult<()> {
        if point.destination.as_os_str().is_empty() {
            return Err(StrataError::config("mount point has an empty destination"));
        }
        if point.is_remount() || point.is_propagation() {
            let mounted_before = self
                .points
                .iter()
                .any(|p| p.destination == point.destination && p.tag <= point.tag);
            if !mounted_before {
                return Err(StrataError::config(format!(
                    "{} is not mounted before its remount",
                    point.destination.display()
                )));
            }
        } else if self
            .points
            .iter()
            .any(|p| p.destination == point.destination && !p.is_remount() && !p.is_propagation())
        {
            return Err(StrataError::MountExists {
                destination: point.destination.display().to_string(),
            });
        }
        tracing::trace!(tag = %point.tag, destination = %point.destination.display(), "mount point added");
        self.points.push(point);
        Ok(())
    }

    /// Remove every point of a tag.
    pub fn remove_by_tag(&mut self, tag: MountTag) {
        self.points.retain(|p| p.tag != tag);
    }

    /// Points of a tag in insertion order.
    pub fn get_by_tag(&self, tag: MountTag) -> impl Iterator<Item = &MountPoint> {
        self.points.iter().filter(move |p| p.tag == tag)
    }

    /// The `index`-th point of a tag.
    #[must_use]
    pub fn nth_by_tag(&self, tag: MountTag, index: usize) -> Option<&MountPoint> {
        self.get_by_tag(tag).nth(index)
    }

    /// The non-remount point for a destination.
    #[must_use]
    pub fn get_by_destination(&self, destination: &Path) -> Option<&MountPoint> {
        self.points
            .iter()
            .find(|p| p.destination == destination && !p.is_remount() && !p.is_propagation())
    }

    /// Every point in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &MountPoint> {
        self.points.iter()
    }

    /// Number of points.
    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Returns true if there are no points.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_bind_is_rejected() {
        let mut points = Points::new();
        points
            .add_bind(MountTag::Userbinds, "/a", "/mnt", MountFlags::empty())
            .unwrap();
        let err = points
            .add_bind(MountTag::Userbinds, "/b", "/mnt", MountFlags::empty())
            .unwrap_err();

        assert!(matches!(err, StrataError::MountExists { .. }));
        assert_eq!(points.len(), 1);
        assert_eq!(
            points.get_by_destination(Path::new("/mnt")).unwrap().source,
            PathBuf::from("/a")
        );
    }

    #[test]
    fn remount_follows_initial_mount() {
        let mut points = Points::new();
        assert!(
            points
                .add_remount(MountTag::Binds, "/opt", MountFlags::RDONLY)
                .is_err()
        );

        points
            .add_bind(MountTag::Binds, "/opt", "/opt", MountFlags::empty())
            .unwrap();
        points
            .add_remount(MountTag::Binds, "/opt", MountFlags::RDONLY)
            .unwrap();

        let tags: Vec<bool> = points.get_by_tag(MountTag::Binds).map(MountPoint::is_remount).collect();
        assert_eq!(tags, vec![false, true]);
    }

    #[test]
    fn propagation_keeps_only_propagation_flags() {
        let mut points = Points::new();
        points
            .add_bind(MountTag::Hostfs, "/data", "/data", MountFlags::empty())
            .unwrap();
        assert!(
            points
                .add_propagation(MountTag::Hostfs, "/data", MountFlags::RDONLY)
                .is_err()
        );
        points
            .add_propagation(MountTag::Hostfs, "/data", MountFlags::SLAVE | MountFlags::REC | MountFlags::RDONLY)
            .unwrap();

        let point = points.nth_by_tag(MountTag::Hostfs, 1).unwrap();
        assert!(point.is_propagation());
        assert_eq!(point.flags, MountFlags::SLAVE | MountFlags::REC);
    }

    #[test]
    fn remove_by_tag_purges_group() {
        let mut points = Points::new();
        points
            .add_fs(MountTag::Dev, "/dev/shm", "tmpfs", MountFlags::NOSUID, &[])
            .unwrap();
        points
            .add_bind(MountTag::Dev, "/dev/null", "/dev/null", MountFlags::empty())
            .unwrap();
        points
            .add_fs(MountTag::Tmp, "/tmp", "tmpfs", MountFlags::empty(), &[])
            .unwrap();

        points.remove_by_tag(MountTag::Dev);
        assert_eq!(points.get_by_tag(MountTag::Dev).count(), 0);
        assert_eq!(points.len(), 1);
    }

    #[test]
    fn overlay_options() {
        let mut points = Points::new();
        points
            .add_overlay(
                MountTag::Layer,
                "/session/final",
                MountFlags::NOSUID,
                &[PathBuf::from("/l1"), PathBuf::from("/l2")],
                Some((Path::new("/up"), Path::new("/work"))),
            )
            .unwrap();
        let point = points.nth_by_tag(MountTag::Layer, 0).unwrap();
        assert_eq!(point.data(), "lowerdir=/l1:/l2,upperdir=/up,workdir=/work");
        assert_eq!(point.fstype.as_deref(), Some("overlay"));
    }

    #[test]
    fn image_mount_requires_loop_format() {
        let mut points = Points::new();
        assert!(
            points
                .add_image(
                    MountTag::Rootfs,
                    "/img",
                    "/session/rootfs",
                    ImageType::Sandbox,
                    MountFlags::RDONLY,
                    0,
                    0
                )
                .is_err()
        );
        points
            .add_image(
                MountTag::Rootfs,
                "/img",
                "/session/rootfs",
                ImageType::Squashfs,
                MountFlags::RDONLY,
                4096,
                1024,
            )
            .unwrap();
        let point = points.nth_by_tag(MountTag::Rootfs, 0).unwrap();
        assert_eq!(point.image.unwrap().offset, 4096);
    }
}
