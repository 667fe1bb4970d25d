//! Host filesystems, admin bind paths and user `--bind` requests.

use std::path::{Path, PathBuf};

use strata_common::{StrataError, StrataResult};

use super::{Container, Mounter, recoverable};
use crate::mount::{MountFlags, MountTag};
use crate::rpc::Ops;

/// Host mount points never passed through by `mount hostfs`.
const HOSTFS_EXCLUDED: [&str; 7] = ["/", "/proc", "/sys", "/dev", "/run", "/boot", "/var"];

/// Filesystem types never passed through by `mount hostfs`.
const HOSTFS_EXCLUDED_TYPES: [&str; 8] = [
    "proc", "sysfs", "devpts", "devtmpfs", "cgroup", "cgroup2", "autofs", "mqueue",
];

/// A parsed `src[:dst[:opts]]` bind request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindSpec {
    /// Host path.
    pub source: PathBuf,
    /// Container path.
    pub destination: PathBuf,
    /// Mount read-only.
    pub read_only: bool,
}

impl BindSpec {
    /// Parse one `src[:dst[:opts]]` entry.
    pub fn parse(entry: &str) -> StrataResult<Self> {
        let mut parts = entry.splitn(3, ':');
        let source = parts.next().unwrap_or_default().trim();
        if source.is_empty() {
            return Err(StrataError::config(format!("bind {entry:?}: empty source")));
        }
        let destination = match parts.next().map(str::trim) {
            Some(dst) if !dst.is_empty() => dst,
            _ => source,
        };
        if !Path::new(destination).is_absolute() {
            return Err(StrataError::config(format!(
                "bind {entry:?}: destination {destination} must be absolute"
            )));
        }
        let read_only = match parts.next().map(str::trim) {
            None | Some("" | "rw") => false,
            Some("ro") => true,
            Some(other) => {
                return Err(StrataError::config(format!(
                    "bind {entry:?}: unknown option {other:?}"
                )));
            }
        };
        Ok(Self {
            source: PathBuf::from(source),
            destination: PathBuf::from(destination),
            read_only,
        })
    }
}

/// Parse a list of bind requests, each possibly comma-separated.
pub fn parse_bind_specs(entries: &[String]) -> StrataResult<Vec<BindSpec>> {
    entries
        .iter()
        .flat_map(|e| e.split(','))
        .filter(|e| !e.trim().is_empty())
        .map(BindSpec::parse)
        .collect()
}

/// Decode the octal escapes the kernel uses in mountinfo paths.
fn unescape_mountinfo(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            if let Some(value) = field
                .get(i + 1..i + 4)
                .and_then(|digits| u8::from_str_radix(digits, 8).ok())
            {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Mount points and filesystem types listed in a mountinfo document.
fn parse_mountinfo(content: &str) -> Vec<(PathBuf, String)> {
    content
        .lines()
        .filter_map(|line| {
            let (mount, fs) = line.split_once(" - ")?;
            let mount_point = mount.split_whitespace().nth(4)?;
            let fstype = fs.split_whitespace().next()?;
            Some((PathBuf::from(unescape_mountinfo(mount_point)), fstype.to_string()))
        })
        .collect()
}

/// Host mount points eligible for passthrough.
fn hostfs_candidates(entries: &[(PathBuf, String)], excluded: &[&Path]) -> Vec<PathBuf> {
    let mut candidates: Vec<PathBuf> = Vec::new();
    for (mount_point, fstype) in entries {
        if HOSTFS_EXCLUDED_TYPES.contains(&fstype.as_str()) {
            continue;
        }
        if HOSTFS_EXCLUDED
            .iter()
            .any(|skip| mount_point == Path::new(skip) || (*skip != "/" && mount_point.starts_with(skip)))
        {
            continue;
        }
        if excluded.iter().any(|skip| mount_point.starts_with(skip)) {
            continue;
        }
        if !candidates.contains(mount_point) {
            candidates.push(mount_point.clone());
        }
    }
    candidates
}

impl<O: Ops + 'static> Container<O> {
    pub(super) fn add_hostfs(&mut self) -> StrataResult<()> {
        if !self.config.mount_hostfs || self.engine.contain {
            return Ok(());
        }
        let content = std::fs::read_to_string("/proc/self/mountinfo")
            .map_err(|e| StrataError::mount("host filesystems", e))?;
        let session = self.mounter.session().path().to_path_buf();
        let state = self.paths.state.clone();
        let candidates =
            hostfs_candidates(&parse_mountinfo(&content), &[session.as_path(), state.as_path()]);

        for mount_point in candidates {
            tracing::debug!(path = %mount_point.display(), "Passing through host filesystem");
            recoverable(
                "host filesystem",
                self.system.points.add_bind(
                    MountTag::Hostfs,
                    &mount_point,
                    &mount_point,
                    self.suid_flag | MountFlags::NODEV | MountFlags::REC,
                ),
            )?;
        }
        Ok(())
    }

    pub(super) fn add_admin_binds(&mut self) -> StrataResult<()> {
        if self.engine.contain {
            tracing::debug!("Skipping admin bind paths, container is contained");
            return Ok(());
        }
        let specs = parse_bind_specs(&self.config.bind_path)
            .map_err(|e| StrataError::mount("bind path", e))?;
        for spec in specs {
            tracing::debug!(
                source = %spec.source.display(),
                destination = %spec.destination.display(),
                "Adding admin bind path"
            );
            let mut flags = self.suid_flag | MountFlags::REC;
            if spec.read_only {
                flags |= MountFlags::RDONLY;
            }
            recoverable(
                "bind path",
                self.system
                    .points
                    .add_bind(MountTag::Binds, &spec.source, &spec.destination, flags),
            )?;
        }
        Ok(())
    }

    pub(super) fn add_user_binds(&mut self) -> StrataResult<()> {
        if self.engine.bind_paths().is_empty() {
            return Ok(());
        }
        if !self.config.user_bind_control {
            tracing::warn!("ignoring user bind requests: disabled by the administrator");
            return Ok(());
        }
        let specs = parse_bind_specs(self.engine.bind_paths())
            .map_err(|e| StrataError::mount("user bind path", e))?;
        for spec in specs {
            tracing::debug!(
                source = %spec.source.display(),
                destination = %spec.destination.display(),
                read_only = spec.read_only,
                "Adding user bind"
            );
            if spec.destination == Path::new("/dev") {
                tracing::debug!("User bind replaces /dev");
                self.system.points.remove_by_tag(MountTag::Dev);
            }
            let mut flags = MountFlags::NOSUID | MountFlags::NODEV | MountFlags::REC;
            if spec.read_only {
                flags |= MountFlags::RDONLY;
            }
            recoverable(
                "user bind path",
                self.system
                    .points
                    .add_bind(MountTag::Userbinds, &spec.source, &spec.destination, flags),
            )?;
        }
        Ok(())
    }

    /// In the setuid workflow, home and user binds are mounted with the
    /// caller's filesystem credentials so root squashing and permissions on
    /// the sources apply to the caller.
    pub(super) fn add_fs_id_hooks(&mut self) {
        if self.identity.is_root() || self.userns {
            return;
        }
        let (uid, gid) = (self.identity.uid, self.identity.gid);
        self.system
            .run_after_tag(MountTag::Binds, move |mounter: &mut Mounter<O>, _| {
                tracing::debug!(uid, gid, "Switching to user filesystem credentials");
                mounter.ops().set_fs_id(uid, gid)
            });
        self.system
            .run_after_tag(MountTag::Userbinds, |mounter: &mut Mounter<O>, _| {
                tracing::debug!("Restoring root filesystem credentials");
                mounter.ops().set_fs_id(0, 0)
            });
    }
}
