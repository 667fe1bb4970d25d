//! Mount point set.
//!
//! The container builder appends [`MountPoint`]s to [`Points`], grouped by a
//! [`MountTag`] that fixes execution order. [`MountSystem`] walks the tags in
//! ascending order, hands each point to a [`MountHandler`] and fires the
//! run-after-tag hooks once a tag is complete.

mod points;
mod system;

use std::path::PathBuf;

use crate::image::ImageType;

pub use points::Points;
pub use system::{Hook, MountHandler, MountSystem};

bitflags::bitflags! {
    /// mount(2) flags carried by a mount point.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct MountFlags: u64 {
        /// Read-only.
        const RDONLY = libc::MS_RDONLY as u64;
        /// Ignore set-user-ID bits.
        const NOSUID = libc::MS_NOSUID as u64;
        /// Disallow device files.
        const NODEV = libc::MS_NODEV as u64;
        /// Disallow execution.
        const NOEXEC = libc::MS_NOEXEC as u64;
        /// Change flags of an existing mount.
        const REMOUNT = libc::MS_REMOUNT as u64;
        /// Bind mount.
        const BIND = libc::MS_BIND as u64;
        /// Move an existing mount.
        const MOVE = libc::MS_MOVE as u64;
        /// Apply recursively.
        const REC = libc::MS_REC as u64;
        /// Private propagation.
        const PRIVATE = libc::MS_PRIVATE as u64;
        /// Slave propagation.
        const SLAVE = libc::MS_SLAVE as u64;
        /// Shared propagation.
        const SHARED = libc::MS_SHARED as u64;
        /// Unbindable propagation.
        const UNBINDABLE = libc::MS_UNBINDABLE as u64;
    }
}

impl MountFlags {
    /// Flags that only change propagation.
    pub const PROPAGATION: Self = Self::PRIVATE
        .union(Self::SLAVE)
        .union(Self::SHARED)
        .union(Self::UNBINDABLE);

    /// Flags that must be re-applied with a remount after a bind.
    pub const REMOUNT_SENSITIVE: Self = Self::RDONLY
        .union(Self::NOSUID)
        .union(Self::NODEV)
        .union(Self::NOEXEC);
}

/// Mount point groups in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MountTag {
    /// Session directory backing store.
    Session,
    /// Container root filesystem.
    Rootfs,
    /// Images feeding the layer (overlay partitions and images).
    PreLayer,
    /// Overlay or underlay assembly into the final directory.
    Layer,
    /// `/proc` and `/sys`.
    Kernel,
    /// `/dev`.
    Dev,
    /// Host filesystems.
    Hostfs,
    /// Admin bind paths.
    Binds,
    /// Home directory.
    Home,
    /// User bind paths.
    Userbinds,
    /// `/tmp` and `/var/tmp`.
    Tmp,
    /// Scratch directories.
    Scratch,
    /// Current working directory.
    Cwd,
    /// Extra libraries.
    Libs,
    /// Identity files, resolv.conf, hostname.
    Files,
    /// Anything else.
    Other,
    /// Last mounts (action scripts).
    Final,
}

impl MountTag {
    /// Every tag in execution order.
    pub const ALL: [Self; 17] = [
        Self::Session,
        Self::Rootfs,
        Self::PreLayer,
        Self::Layer,
        Self::Kernel,
        Self::Dev,
        Self::Hostfs,
        Self::Binds,
        Self::Home,
        Self::Userbinds,
        Self::Tmp,
        Self::Scratch,
        Self::Cwd,
        Self::Libs,
        Self::Files,
        Self::Other,
        Self::Final,
    ];

    /// Tags whose failures always abort container creation.
    #[must_use]
    pub const fn is_structural(self) -> bool {
        matches!(
            self,
            Self::Session | Self::Rootfs | Self::PreLayer | Self::Layer | Self::Kernel
        )
    }

    /// Tags whose destinations are host paths in the session rather than
    /// container paths below the final directory.
    #[must_use]
    pub const fn is_session_side(self) -> bool {
        matches!(
            self,
            Self::Session | Self::Rootfs | Self::PreLayer | Self::Layer
        )
    }

    /// Lowercase name used in logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::Rootfs => "rootfs",
            Self::PreLayer => "prelayer",
            Self::Layer => "layer",
            Self::Kernel => "kernel",
            Self::Dev => "dev",
            Self::Hostfs => "hostfs",
            Self::Binds => "binds",
            Self::Home => "home",
            Self::Userbinds => "userbinds",
            Self::Tmp => "tmp",
            Self::Scratch => "scratch",
            Self::Cwd => "cwd",
            Self::Libs => "libs",
            Self::Files => "files",
            Self::Other => "other",
            Self::Final => "final",
        }
    }
}

impl std::fmt::Display for MountTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Loop-backed image parameters, ignored by the generic mount path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImageOptions {
    /// Format of the image.
    pub image_type: Option<ImageType>,
    /// Offset of the filesystem inside the file.
    pub offset: u64,
    /// Size of the filesystem.
    pub size: u64,
}

/// A single mount operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
    /// Execution group.
    pub tag: MountTag,
    /// Mount source.
    pub source: PathBuf,
    /// Mount destination (host path for session-side tags, container path otherwise).
    pub destination: PathBuf,
    /// Filesystem type.
    pub fstype: Option<String>,
    /// mount(2) flags.
    pub flags: MountFlags,
    /// Filesystem data options (`key=value`).
    pub options: Vec<String>,
    /// Image parameters for loop-backed mounts.
    pub image: Option<ImageOptions>,
    /// The destination is a regular file, even if the source does not exist yet.
    pub file: bool,
}

impl MountPoint {
    /// Returns true for remount entries.
    #[must_use]
    pub const fn is_remount(&self) -> bool {
        self.flags.contains(MountFlags::REMOUNT)
    }

    /// Returns true for propagation-only entries.
    #[must_use]
    pub fn is_propagation(&self) -> bool {
        self.flags.intersects(MountFlags::PROPAGATION)
            && !self.flags.intersects(MountFlags::BIND | MountFlags::REMOUNT)
    }

    /// Returns true for bind mounts.
    #[must_use]
    pub const fn is_bind(&self) -> bool {
        self.flags.contains(MountFlags::BIND) && !self.is_remount()
    }

    /// Returns true if a failure to mount this point must abort creation.
    #[must_use]
    pub fn is_fatal_on_failure(&self) -> bool {
        self.tag.is_structural() || self.is_remount() || self.is_propagation()
    }

    /// Comma-separated filesystem data.
    #[must_use]
    pub fn data(&self) -> String {
        self.options.join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_are_ordered() {
        let mut sorted = MountTag::ALL;
        sorted.sort();
        assert_eq!(sorted, MountTag::ALL);
        assert!(MountTag::PreLayer < MountTag::Layer);
        assert!(MountTag::Layer < MountTag::Kernel);
    }

    #[test]
    fn point_classification() {
        let mut point = MountPoint {
            tag: MountTag::Userbinds,
            source: "/data".into(),
            destination: "/data".into(),
            fstype: None,
            flags: MountFlags::BIND | MountFlags::RDONLY,
            options: Vec::new(),
            image: None,
            file: false,
        };
        assert!(point.is_bind());
        assert!(!point.is_fatal_on_failure());

        point.flags |= MountFlags::REMOUNT;
        assert!(point.is_remount());
        assert!(!point.is_bind());
        assert!(point.is_fatal_on_failure());

        point.flags = MountFlags::SLAVE | MountFlags::REC;
        assert!(point.is_propagation());
    }
}
