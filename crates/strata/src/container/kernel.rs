//! `/proc` and `/sys`.

use strata_common::StrataResult;
use strata_oci::runtime::NamespaceType;

use super::{Container, recoverable};
use crate::mount::{MountFlags, MountTag};
use crate::rpc::Ops;

impl<O: Ops + 'static> Container<O> {
    pub(super) fn add_kernel(&mut self) -> StrataResult<()> {
        let base = MountFlags::NOSUID | MountFlags::NODEV;

        if self.config.mount_proc {
            let added = if self.has_namespace(NamespaceType::Pid) {
                tracing::debug!("Mounting a fresh /proc for the PID namespace");
                self.system.points.add_fs(
                    MountTag::Kernel,
                    "/proc",
                    "proc",
                    base | MountFlags::NOEXEC,
                    &[],
                )
            } else {
                tracing::debug!("Binding host /proc");
                self.system
                    .points
                    .add_bind(MountTag::Kernel, "/proc", "/proc", base | MountFlags::REC)
            };
            recoverable("proc", added)?;
        } else {
            tracing::debug!("Skipping /proc per configuration");
        }

        if self.config.mount_sys {
            // sysfs can't be mounted from an unprivileged user namespace.
            let added = if self.userns {
                self.system
                    .points
                    .add_bind(MountTag::Kernel, "/sys", "/sys", base | MountFlags::REC)
            } else {
                self.system.points.add_fs(
                    MountTag::Kernel,
                    "/sys",
                    "sysfs",
                    base | MountFlags::NOEXEC | MountFlags::RDONLY,
                    &[],
                )
            };
            recoverable("sysfs", added)?;
        } else {
            tracing::debug!("Skipping /sys per configuration");
        }
        Ok(())
    }
}
