//! Layering decision.

use std::path::Path;

use crate::config::{EngineConfig, FileConfig, OverlayMode};
use crate::image::Image;

/// How the final root is assembled from the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// Kernel overlay of the image plus staging and overlay layers.
    Overlay,
    /// Bind the image entries into a session directory.
    Underlay,
    /// Bind the image as is.
    None,
}

impl Layout {
    /// Returns true if destinations missing from the image can be created.
    #[must_use]
    pub const fn can_stage(self) -> bool {
        !matches!(self, Self::None)
    }

    /// Name used in diagnostics.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Overlay => "overlay",
            Self::Underlay => "underlay",
            Self::None => "none",
        }
    }
}

/// Host facts that feed the layout decision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostProbe {
    /// The kernel lists `overlay` in `/proc/filesystems`.
    pub overlay_supported: bool,
    /// The engine runs inside a user namespace.
    pub in_userns: bool,
}

impl HostProbe {
    /// Probe the running host.
    #[must_use]
    pub fn detect() -> Self {
        Self {
            overlay_supported: std::fs::read_to_string("/proc/filesystems")
                .is_ok_and(|content| filesystems_list_overlay(&content)),
            in_userns: std::fs::read_to_string("/proc/self/uid_map")
                .is_ok_and(|content| !is_initial_uid_map(&content)),
        }
    }

    /// Probe with explicit file locations.
    #[must_use]
    pub fn from_files(filesystems: &Path, uid_map: &Path) -> Self {
        Self {
            overlay_supported: std::fs::read_to_string(filesystems)
                .is_ok_and(|content| filesystems_list_overlay(&content)),
            in_userns: std::fs::read_to_string(uid_map)
                .is_ok_and(|content| !is_initial_uid_map(&content)),
        }
    }
}

fn filesystems_list_overlay(content: &str) -> bool {
    content
        .lines()
        .any(|line| line.split_whitespace().last() == Some("overlay"))
}

fn is_initial_uid_map(content: &str) -> bool {
    let fields: Vec<&str> = content.split_whitespace().collect();
    fields == ["0", "0", "4294967295"]
}

/// Choose the layout for a creation pass.
#[must_use]
pub fn select_layout(
    image: &Image,
    engine: &EngineConfig,
    config: &FileConfig,
    probe: HostProbe,
) -> Layout {
    if image.writable && !engine.writable_tmpfs {
        if !image.overlay_partitions().is_empty() {
            if probe.overlay_supported {
                return Layout::Overlay;
            }
            tracing::warn!("overlay partitions present but the kernel lacks overlay support");
        }
        return Layout::None;
    }

    if config.enable_overlay.allowed() {
        if probe.overlay_supported && !probe.in_userns {
            return Layout::Overlay;
        }
        if config.enable_overlay == OverlayMode::Yes {
            tracing::warn!(
                overlay_supported = probe.overlay_supported,
                in_userns = probe.in_userns,
                "overlay enabled but not usable"
            );
        }
    }

    if engine.writable_tmpfs {
        tracing::warn!("writable-tmpfs requires overlay, ignoring");
    }
    if !engine.overlay_images.is_empty() {
        tracing::warn!("overlay images require overlay, ignoring");
    }

    if config.enable_underlay {
        return Layout::Underlay;
    }
    Layout::None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{ImageType, Partition, PartitionRole};

    const OVERLAY: HostProbe = HostProbe {
        overlay_supported: true,
        in_userns: false,
    };
    const NO_OVERLAY: HostProbe = HostProbe {
        overlay_supported: false,
        in_userns: false,
    };

    fn squashfs() -> Image {
        Image::new("/img.sqfs", ImageType::Squashfs, 0, 10)
    }

    fn writable_sif() -> Image {
        let mut image = Image::new("/img.sif", ImageType::Sif, 0, 0);
        image.writable = true;
        image.partitions = vec![
            Partition {
                fs_type: ImageType::Squashfs,
                role: PartitionRole::System,
                offset: 0,
                size: 10,
            },
            Partition {
                fs_type: ImageType::Ext3,
                role: PartitionRole::Overlay,
                offset: 10,
                size: 10,
            },
        ];
        image
    }

    #[test]
    fn read_only_with_overlay() {
        let layout = select_layout(
            &squashfs(),
            &EngineConfig::default(),
            &FileConfig::default(),
            OVERLAY,
        );
        assert_eq!(layout, Layout::Overlay);
        assert!(layout.can_stage());
    }

    #[test]
    fn user_namespace_disables_overlay() {
        let probe = HostProbe {
            overlay_supported: true,
            in_userns: true,
        };
        let layout = select_layout(
            &squashfs(),
            &EngineConfig::default(),
            &FileConfig::default(),
            probe,
        );
        assert_eq!(layout, Layout::Underlay);
    }

    #[test]
    fn nothing_enabled_is_none() {
        let config = FileConfig {
            enable_overlay: OverlayMode::No,
            enable_underlay: false,
            ..Default::default()
        };
        let layout = select_layout(&squashfs(), &EngineConfig::default(), &config, OVERLAY);
        assert_eq!(layout, Layout::None);
        assert!(!layout.can_stage());
    }

    #[test]
    fn writable_image_uses_partitions_or_none() {
        let config = FileConfig {
            enable_overlay: OverlayMode::No,
            ..Default::default()
        };
        let engine = EngineConfig::default();
        assert_eq!(select_layout(&writable_sif(), &engine, &config, OVERLAY), Layout::Overlay);
        assert_eq!(select_layout(&writable_sif(), &engine, &config, NO_OVERLAY), Layout::None);

        let mut plain = squashfs();
        plain.writable = true;
        assert_eq!(select_layout(&plain, &engine, &config, OVERLAY), Layout::None);
    }

    #[test]
    fn probe_parses_proc_files() {
        let temp = tempfile::tempdir().unwrap();
        let fs = temp.path().join("filesystems");
        let map = temp.path().join("uid_map");
        std::fs::write(&fs, "nodev\tsysfs\n\text4\nnodev\toverlay\n").unwrap();
        std::fs::write(&map, "         0          0 4294967295\n").unwrap();
        assert_eq!(HostProbe::from_files(&fs, &map), OVERLAY);

        std::fs::write(&fs, "nodev\toverlayfs-not\n").unwrap();
        std::fs::write(&map, "0 1000 1\n").unwrap();
        let probe = HostProbe::from_files(&fs, &map);
        assert!(!probe.overlay_supported);
        assert!(probe.in_userns);
    }
}
