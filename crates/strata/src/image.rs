//! Image descriptors.
//!
//! Images are opened and identified by the image subsystem; the engine only
//! reads the resulting descriptor.

use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use strata_common::{StrataError, StrataResult};

use crate::config::FileConfig;

/// Image or partition format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageType {
    /// Singularity image format container.
    Sif,
    /// Squashfs filesystem.
    Squashfs,
    /// Ext3 filesystem.
    Ext3,
    /// Plain directory.
    Sandbox,
}

impl ImageType {
    /// Kernel filesystem type used to mount this format.
    #[must_use]
    pub const fn fstype(self) -> Option<&'static str> {
        match self {
            Self::Squashfs => Some("squashfs"),
            Self::Ext3 => Some("ext3"),
            Self::Sif | Self::Sandbox => None,
        }
    }
}

/// Role of a SIF partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionRole {
    /// The primary root filesystem.
    #[default]
    System,
    /// An overlay partition.
    Overlay,
    /// Any other data partition.
    Data,
}

/// A partition inside a composite image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    /// Partition filesystem.
    #[serde(rename = "type")]
    pub fs_type: ImageType,
    /// Role of the partition.
    #[serde(default)]
    pub role: PartitionRole,
    /// Byte offset inside the image file.
    pub offset: u64,
    /// Size in bytes.
    pub size: u64,
}

/// An opened image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    /// Resolved path of the image file or directory.
    pub path: PathBuf,
    /// Image name as given by the user.
    #[serde(default)]
    pub name: String,
    /// Image format.
    #[serde(rename = "type")]
    pub image_type: ImageType,
    /// Offset of the root filesystem inside the file.
    #[serde(default)]
    pub offset: u64,
    /// Size of the root filesystem.
    #[serde(default)]
    pub size: u64,
    /// Whether the image was opened read-write.
    #[serde(default)]
    pub writable: bool,
    /// Partitions of composite images.
    #[serde(default)]
    pub partitions: Vec<Partition>,
    /// Descriptor number of the opened file in the engine process.
    #[serde(default)]
    pub fd: Option<i32>,
}

impl Image {
    /// Describe a sandbox directory.
    #[must_use]
    pub fn sandbox(path: impl Into<PathBuf>) -> Self {
        Self::new(path, ImageType::Sandbox, 0, 0)
    }

    /// Describe a single-filesystem image.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, image_type: ImageType, offset: u64, size: u64) -> Self {
        let path = path.into();
        Self {
            name: path.display().to_string(),
            path,
            image_type,
            offset,
            size,
            writable: false,
            partitions: Vec::new(),
            fd: None,
        }
    }

    /// Filesystem type of the root filesystem (SIF images resolve to their
    /// system partition).
    #[must_use]
    pub fn rootfs_type(&self) -> ImageType {
        if self.image_type == ImageType::Sif {
            self.partitions
                .iter()
                .find(|p| p.role == PartitionRole::System)
                .map_or(ImageType::Squashfs, |p| p.fs_type)
        } else {
            self.image_type
        }
    }

    /// Offset and size of the root filesystem.
    #[must_use]
    pub fn rootfs_extent(&self) -> (u64, u64) {
        if self.image_type == ImageType::Sif {
            if let Some(p) = self
                .partitions
                .iter()
                .find(|p| p.role == PartitionRole::System)
            {
                return (p.offset, p.size);
            }
        }
        (self.offset, self.size)
    }

    /// Overlay-capable partitions of a SIF image.
    #[must_use]
    pub fn overlay_partitions(&self) -> Vec<&Partition> {
        if self.image_type != ImageType::Sif {
            return Vec::new();
        }
        self.partitions
            .iter()
            .filter(|p| {
                p.role == PartitionRole::Overlay
                    && matches!(p.fs_type, ImageType::Ext3 | ImageType::Squashfs)
            })
            .collect()
    }

    /// Check `offset + size` against the backing file and downgrade
    /// `writable` when the caller cannot write to it.
    pub fn validate(&mut self) -> StrataResult<()> {
        let meta = std::fs::metadata(&self.path).map_err(|e| {
            StrataError::config(format!("image {} is not accessible: {e}", self.path.display()))
        })?;

        if self.image_type != ImageType::Sandbox {
            let len = meta.len();
            let extents = std::iter::once((self.offset, self.size))
                .chain(self.partitions.iter().map(|p| (p.offset, p.size)));
            for (offset, size) in extents {
                if offset.checked_add(size).is_none_or(|end| end > len) {
                    return Err(StrataError::config(format!(
                        "image {}: extent {offset}+{size} exceeds file size {len}",
                        self.path.display()
                    )));
                }
            }
        }

        if self.writable
            && rustix::fs::access(&self.path, rustix::fs::Access::WRITE_OK).is_err()
        {
            tracing::warn!(image = %self.path.display(), "no write permission, opening read-only");
            self.writable = false;
        }

        Ok(())
    }

    /// Enforce the admin `limit container` directives.
    pub fn check_limits(
        &self,
        config: &FileConfig,
        owners: &dyn Fn(u32) -> Option<String>,
        groups: &dyn Fn(u32) -> Option<String>,
    ) -> StrataResult<()> {
        if !config.limit_container_paths.is_empty()
            && !config
                .limit_container_paths
                .iter()
                .any(|allowed| self.path.starts_with(allowed))
        {
            return Err(StrataError::config(format!(
                "image {} is not in an allowed directory",
                self.path.display()
            )));
        }

        if config.limit_container_owners.is_empty() && config.limit_container_groups.is_empty() {
            return Ok(());
        }

        let meta = std::fs::metadata(&self.path)?;
        if !config.limit_container_owners.is_empty() {
            let owner = owners(meta.uid()).unwrap_or_else(|| meta.uid().to_string());
            if !config.limit_container_owners.contains(&owner) {
                return Err(StrataError::config(format!(
                    "image {} is not owned by an allowed user",
                    self.path.display()
                )));
            }
        }
        if !config.limit_container_groups.is_empty() {
            let group = groups(meta.gid()).unwrap_or_else(|| meta.gid().to_string());
            if !config.limit_container_groups.contains(&group) {
                return Err(StrataError::config(format!(
                    "image {} is not owned by an allowed group",
                    self.path.display()
                )));
            }
        }
        Ok(())
    }

    /// Returns true if the sandbox root resolves to the host root.
    pub fn is_host_root(&self) -> StrataResult<bool> {
        Ok(self.image_type == ImageType::Sandbox
            && std::fs::canonicalize(&self.path)? == Path::new("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sif_with_overlays(path: &Path) -> Image {
        let mut image = Image::new(path, ImageType::Sif, 0, 0);
        image.partitions = vec![
            Partition {
                fs_type: ImageType::Squashfs,
                role: PartitionRole::System,
                offset: 4096,
                size: 1024,
            },
            Partition {
                fs_type: ImageType::Ext3,
                role: PartitionRole::Overlay,
                offset: 8192,
                size: 1024,
            },
            Partition {
                fs_type: ImageType::Ext3,
                role: PartitionRole::Data,
                offset: 9216,
                size: 512,
            },
        ];
        image
    }

    #[test]
    fn sif_rootfs_uses_system_partition() {
        let image = sif_with_overlays(Path::new("/img.sif"));
        assert_eq!(image.rootfs_type(), ImageType::Squashfs);
        assert_eq!(image.rootfs_extent(), (4096, 1024));
        assert_eq!(image.overlay_partitions().len(), 1);
    }

    #[test]
    fn validate_rejects_extent_past_eof() {
        let temp = tempfile::tempdir().unwrap();
        let file = temp.path().join("img.sqfs");
        std::fs::write(&file, vec![0u8; 100]).unwrap();

        let mut image = Image::new(&file, ImageType::Squashfs, 50, 60);
        assert!(image.validate().is_err());

        let mut image = Image::new(&file, ImageType::Squashfs, 40, 60);
        assert!(image.validate().is_ok());
    }

    #[test]
    fn limit_paths_enforced() {
        let temp = tempfile::tempdir().unwrap();
        let image = Image::sandbox(temp.path());
        let config = FileConfig {
            limit_container_paths: vec![PathBuf::from("/opt/containers")],
            ..Default::default()
        };
        let none = |_: u32| None;
        assert!(image.check_limits(&config, &none, &none).is_err());

        let config = FileConfig {
            limit_container_paths: vec![temp.path().to_path_buf()],
            ..Default::default()
        };
        assert!(image.check_limits(&config, &none, &none).is_ok());
    }

    #[test]
    fn host_root_sandbox_detected() {
        assert!(Image::sandbox("/").is_host_root().unwrap());
        let temp = tempfile::tempdir().unwrap();
        assert!(!Image::sandbox(temp.path()).is_host_root().unwrap());
    }
}
