//! Root filesystem and layer assembly.

use std::path::{Path, PathBuf};

use strata_common::{StrataError, StrataResult};

use super::{Container, Mounter, recoverable};
use crate::config::{group_name, user_name};
use crate::image::ImageType;
use crate::mount::{MountFlags, MountTag};
use crate::rpc::{MountArgs, Ops};
use crate::session::{Layout, overlay, underlay};

impl<O: Ops + 'static> Container<O> {
    /// Flags shared by the image and layer mounts.
    pub(super) fn rootfs_flags(&self) -> MountFlags {
        let mut flags = self.suid_flag | MountFlags::NODEV;
        let writable = self.engine.writable && self.engine.image().is_some_and(|i| i.writable);
        if !writable {
            flags |= MountFlags::RDONLY;
        }
        flags
    }

    pub(super) fn add_rootfs(&mut self) -> StrataResult<()> {
        let flags = self.rootfs_flags();
        let image = self
            .engine
            .image()
            .ok_or_else(|| StrataError::config("no image to mount"))?;

        image
            .check_limits(
                &self.config,
                &|uid| user_name(Path::new("/etc/passwd"), uid),
                &|gid| group_name(Path::new("/etc/group"), gid),
            )
            .map_err(|e| StrataError::mount("root filesystem", e))?;
        if image.is_host_root()? {
            return Err(StrataError::mount(
                "root filesystem",
                "the host root filesystem cannot be used as a container image",
            ));
        }

        let session = self.mounter.session_mut();
        let rootfs = session.rootfs_path();
        tracing::debug!(image = %image.path.display(), kind = ?image.image_type, "Adding root filesystem");

        let added = if image.image_type == ImageType::Sandbox {
            self.system
                .points
                .add_bind(MountTag::Rootfs, &image.path, &rootfs, flags | MountFlags::REC)
        } else {
            let (offset, size) = image.rootfs_extent();
            self.system.points.add_image(
                MountTag::Rootfs,
                &image.path,
                &rootfs,
                image.rootfs_type(),
                flags,
                offset,
                size,
            )
        };
        recoverable("root filesystem", added)?;

        match session.layout() {
            Layout::Overlay => {
                overlay::plan(&mut self.system, session, image, &self.engine, flags)
                    .map_err(|e| StrataError::mount("overlay layer", e))?;
            }
            Layout::Underlay => {
                underlay::plan(&mut self.system, session)
                    .map_err(|e| StrataError::mount("underlay layer", e))?;
            }
            Layout::None => {
                let final_path = session.final_path();
                recoverable(
                    "final directory",
                    self.system
                        .points
                        .add_bind(MountTag::Layer, &rootfs, &final_path, MountFlags::REC),
                )?;
            }
        }

        self.add_final_propagation();
        Ok(())
    }

    /// Set the propagation of the assembled root once the layer is mounted.
    fn add_final_propagation(&mut self) {
        let propagation = if self.config.mount_slave {
            MountFlags::SLAVE
        } else {
            MountFlags::PRIVATE
        };
        let final_path = self.mounter.session().final_path();
        self.system
            .run_after_tag(MountTag::Layer, move |mounter: &mut Mounter<O>, _| {
                tracing::debug!(root = %final_path.display(), ?propagation, "Setting root propagation");
                mounter
                    .ops()
                    .mount(MountArgs {
                        source: PathBuf::from("none"),
                        target: final_path,
                        filesystem: None,
                        mountflags: (MountFlags::REC | propagation).bits(),
                        data: String::new(),
                    })
                    .map_err(|e| StrataError::mount("root propagation", e))
            });
    }
}
