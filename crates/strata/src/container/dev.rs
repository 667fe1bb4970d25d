//! `/dev`, either the host's or a minimal one staged in the session.

use std::os::fd::AsFd;
use std::path::{Path, PathBuf};

use strata_common::StrataResult;
use strata_oci::runtime::NamespaceType;

use super::{Container, recoverable};
use crate::config::MountDev;
use crate::mount::{MountFlags, MountTag};
use crate::rpc::Ops;

const DEVICES: [&str; 4] = ["null", "zero", "random", "urandom"];

const LINKS: [(&str, &str); 4] = [
    ("fd", "/proc/self/fd"),
    ("stdin", "/proc/self/fd/0"),
    ("stdout", "/proc/self/fd/1"),
    ("stderr", "/proc/self/fd/2"),
];

/// Terminal attached to the first of stdin, stdout and stderr that is one.
fn controlling_terminal() -> Option<PathBuf> {
    let fds = [
        (0, rustix::termios::isatty(std::io::stdin().as_fd())),
        (1, rustix::termios::isatty(std::io::stdout().as_fd())),
        (2, rustix::termios::isatty(std::io::stderr().as_fd())),
    ];
    fds.into_iter()
        .find(|(_, tty)| *tty)
        .and_then(|(fd, _)| std::fs::read_link(format!("/proc/self/fd/{fd}")).ok())
}

/// NVIDIA device nodes present on the host.
fn nvidia_devices(dev: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dev) else {
        return Vec::new();
    };
    let mut devices: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().starts_with("nvidia"))
        .map(|e| e.path())
        .filter(|p| !p.is_dir())
        .collect();
    devices.sort();
    devices
}

impl<O: Ops + 'static> Container<O> {
    pub(super) fn add_dev(&mut self) -> StrataResult<()> {
        let minimal = self.engine.contain
            || self.engine.dev_minimal
            || self.config.mount_dev == MountDev::Minimal;

        match self.config.mount_dev {
            MountDev::No => {
                tracing::debug!("Not mounting /dev per configuration");
                Ok(())
            }
            _ if minimal => self.add_minimal_dev(),
            _ => {
                tracing::debug!("Binding host /dev");
                recoverable(
                    "/dev",
                    self.system.points.add_bind(
                        MountTag::Dev,
                        "/dev",
                        "/dev",
                        self.suid_flag | MountFlags::REC,
                    ),
                )
            }
        }
    }

    fn add_minimal_dev(&mut self) -> StrataResult<()> {
        tracing::debug!("Building a minimal /dev");
        let dev_dir = self.mounter.session_mut().add_dir("dev")?;
        recoverable(
            "/dev",
            self.system
                .points
                .add_bind(MountTag::Dev, &dev_dir, "/dev", MountFlags::NOSUID),
        )?;

        for name in DEVICES {
            self.bind_device(&Path::new("/dev").join(name))?;
        }

        for (name, target) in LINKS {
            self.mounter
                .session_mut()
                .add_symlink(Path::new("dev").join(name), target)?;
        }

        if self.config.mount_devpts {
            self.mounter.session_mut().add_dir("dev/pts")?;
            let options = ["newinstance", "ptmxmode=0666", "mode=0620"].map(String::from);
            recoverable(
                "devpts",
                self.system.points.add_fs(
                    MountTag::Dev,
                    "/dev/pts",
                    "devpts",
                    MountFlags::NOSUID | MountFlags::NOEXEC,
                    &options,
                ),
            )?;
            self.mounter.session_mut().add_symlink("dev/ptmx", "pts/ptmx")?;
        }

        self.mounter.session_mut().add_dir_mode("dev/shm", 0o1777)?;
        recoverable(
            "/dev/shm",
            self.system.points.add_fs(
                MountTag::Dev,
                "/dev/shm",
                "tmpfs",
                MountFlags::NOSUID | MountFlags::NODEV,
                &["mode=1777".to_string()],
            ),
        )?;

        self.mounter.session_mut().add_dir("dev/mqueue")?;
        let mqueue = if self.has_namespace(NamespaceType::Ipc) {
            self.system.points.add_fs(
                MountTag::Dev,
                "/dev/mqueue",
                "mqueue",
                MountFlags::NOSUID | MountFlags::NODEV | MountFlags::NOEXEC,
                &[],
            )
        } else {
            self.system.points.add_bind(
                MountTag::Dev,
                "/dev/mqueue",
                "/dev/mqueue",
                MountFlags::NOSUID | MountFlags::NODEV | MountFlags::NOEXEC,
            )
        };
        recoverable("/dev/mqueue", mqueue)?;

        if self.engine.nv || self.config.always_use_nv {
            for device in nvidia_devices(Path::new("/dev")) {
                self.bind_device(&device)?;
            }
        }

        if let Some(tty) = controlling_terminal() {
            tracing::debug!(tty = %tty.display(), "Redirecting /dev/console");
            self.mounter.session_mut().add_file("dev/console", Vec::new())?;
            recoverable(
                "/dev/console",
                self.system
                    .points
                    .add_bind(MountTag::Dev, tty, "/dev/console", MountFlags::empty()),
            )?;
        }
        Ok(())
    }

    /// Stage an empty file for a host device and bind the device over it.
    fn bind_device(&mut self, device: &Path) -> StrataResult<()> {
        self.mounter.session_mut().add_file(device, Vec::new())?;
        recoverable(
            &device.display().to_string(),
            self.system
                .points
                .add_bind(MountTag::Dev, device, device, MountFlags::empty()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nvidia_nodes_filtered() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(temp.path().join("nvidia0"), "").unwrap();
        std::fs::write(temp.path().join("nvidiactl"), "").unwrap();
        std::fs::write(temp.path().join("null"), "").unwrap();
        std::fs::create_dir(temp.path().join("nvidia-caps")).unwrap();

        let devices = nvidia_devices(temp.path());
        assert_eq!(
            devices,
            vec![temp.path().join("nvidia0"), temp.path().join("nvidiactl")]
        );
    }
}
