//! Namespace creation and joining for the container process.

#![allow(unsafe_code)]

use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::PathBuf;

use rustix::thread::UnshareFlags;
use strata_common::{StrataError, StrataResult};
use strata_oci::Spec;
use strata_oci::runtime::{IdMapping, NamespaceType};

/// Namespaces of a launch: new ones to unshare and existing ones to join.
#[derive(Debug)]
pub struct NamespacePlan {
    /// Namespaces created by unshare(2), PID excluded.
    pub unshare: UnshareFlags,
    /// A new PID namespace is requested.
    pub new_pid: bool,
    /// A new user namespace is requested.
    pub new_user: bool,
    /// Namespace files to join, user namespace first.
    pub join: Vec<(NamespaceType, File)>,
}

const fn flag(ns: NamespaceType) -> UnshareFlags {
    match ns {
        NamespaceType::User => UnshareFlags::NEWUSER,
        NamespaceType::Pid => UnshareFlags::NEWPID,
        NamespaceType::Network => UnshareFlags::NEWNET,
        NamespaceType::Mount => UnshareFlags::NEWNS,
        NamespaceType::Uts => UnshareFlags::NEWUTS,
        NamespaceType::Ipc => UnshareFlags::NEWIPC,
        NamespaceType::Cgroup => UnshareFlags::NEWCGROUP,
    }
}

impl Default for NamespacePlan {
    fn default() -> Self {
        Self {
            unshare: UnshareFlags::empty(),
            new_pid: false,
            new_user: false,
            join: Vec::new(),
        }
    }
}

impl NamespacePlan {
    /// Plan the namespaces of `spec`. Join targets are opened right away so
    /// the plan holds them across fork.
    pub fn from_spec(spec: &Spec) -> StrataResult<Self> {
        let mut plan = Self::default();
        let Some(linux) = &spec.linux else {
            return Ok(plan);
        };
        for ns_type in NamespaceType::ALL {
            let Some(ns) = linux.namespaces.iter().find(|n| n.ns_type == ns_type) else {
                continue;
            };
            match &ns.path {
                Some(path) => {
                    let file = File::open(path).map_err(|e| {
                        StrataError::config(format!(
                            "unable to open {} namespace {}: {e}",
                            ns_type.proc_name(),
                            path.display()
                        ))
                    })?;
                    plan.join.push((ns_type, file));
                }
                None if ns_type == NamespaceType::Pid => plan.new_pid = true,
                None => {
                    if ns_type == NamespaceType::User {
                        plan.new_user = true;
                    }
                    plan.unshare |= flag(ns_type);
                }
            }
        }
        Ok(plan)
    }

    /// Plan a creation pass. Mounts always happen in a mount namespace of
    /// the container, so one is added to `spec` unless it already names one.
    pub fn for_creation(spec: &mut Spec) -> StrataResult<Self> {
        if !spec.has_namespace(NamespaceType::Mount) {
            tracing::debug!("Adding a mount namespace");
            spec.add_namespace(NamespaceType::Mount, None);
        }
        Self::from_spec(spec)
    }

    /// Join the opened namespaces, then unshare the new ones (PID aside).
    pub fn enter(&self) -> StrataResult<()> {
        for (ns_type, file) in &self.join {
            // Safety: the descriptor is a valid namespace file owned by the plan.
            if unsafe { libc::setns(file.as_raw_fd(), 0) } != 0 {
                return Err(StrataError::Internal {
                    message: format!(
                        "unable to join {} namespace: {}",
                        ns_type.proc_name(),
                        std::io::Error::last_os_error()
                    ),
                });
            }
            tracing::debug!(namespace = ns_type.proc_name(), "Joined namespace");
        }
        if !self.unshare.is_empty() {
            // Safety: the process is single threaded right after fork, nothing
            // else shares its file table or filesystem state.
            unsafe { rustix::thread::unshare_unsafe(self.unshare) }.map_err(|e| {
                StrataError::Internal {
                    message: format!("unable to unshare namespaces: {e}"),
                }
            })?;
            tracing::debug!(flags = ?self.unshare, "Unshared namespaces");
        }
        Ok(())
    }

    /// Unshare the PID namespace; only children of the caller live in it.
    pub fn unshare_pid(&self) -> StrataResult<()> {
        if self.new_pid {
            // Safety: see enter.
            unsafe { rustix::thread::unshare_unsafe(UnshareFlags::NEWPID) }.map_err(|e| {
                StrataError::Internal {
                    message: format!("unable to unshare PID namespace: {e}"),
                }
            })?;
        }
        Ok(())
    }
}

/// Format mappings for `/proc/<pid>/{uid,gid}_map`.
#[must_use]
pub fn format_id_map(mappings: &[IdMapping]) -> String {
    mappings
        .iter()
        .map(|m| format!("{} {} {}\n", m.container_id, m.host_id, m.size))
        .collect()
}

/// Write the user namespace mappings of `pid`. Without explicit mappings the
/// caller keeps its own ids.
pub fn write_id_maps(pid: i32, spec: &Spec, uid: u32, gid: u32) -> StrataResult<()> {
    let own = |id| {
        vec![IdMapping {
            container_id: id,
            host_id: id,
            size: 1,
        }]
    };
    let (uid_map, gid_map) = match &spec.linux {
        Some(linux) if !linux.uid_mappings.is_empty() => {
            (linux.uid_mappings.clone(), linux.gid_mappings.clone())
        }
        _ => (own(uid), own(gid)),
    };

    let proc_dir = PathBuf::from(format!("/proc/{pid}"));
    let write = |file: &str, content: &str| {
        std::fs::write(proc_dir.join(file), content).map_err(|e| StrataError::Internal {
            message: format!("unable to write {file} of {pid}: {e}"),
        })
    };
    write("setgroups", "deny")?;
    write("uid_map", &format_id_map(&uid_map))?;
    write("gid_map", &format_id_map(&gid_map))?;
    tracing::debug!(pid, "User namespace mappings written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_splits_new_and_joined() {
        let mut spec = Spec::default();
        spec.add_namespace(NamespaceType::Pid, None);
        spec.add_namespace(NamespaceType::Mount, None);
        spec.add_namespace(NamespaceType::Uts, None);
        spec.add_namespace(NamespaceType::Ipc, Some(PathBuf::from("/proc/self/ns/ipc")));

        let plan = NamespacePlan::from_spec(&spec).unwrap();
        assert!(plan.new_pid);
        assert!(!plan.new_user);
        assert_eq!(plan.unshare, UnshareFlags::NEWNS | UnshareFlags::NEWUTS);
        assert_eq!(plan.join.len(), 1);
        assert_eq!(plan.join[0].0, NamespaceType::Ipc);
    }

    #[test]
    fn creation_always_has_a_mount_namespace() {
        let mut spec = Spec::default();
        spec.add_namespace(NamespaceType::Pid, None);

        let plan = NamespacePlan::for_creation(&mut spec).unwrap();
        assert!(plan.new_pid);
        assert_eq!(plan.unshare, UnshareFlags::NEWNS);
        assert!(spec.has_namespace(NamespaceType::Mount));

        let mut joined = Spec::default();
        joined.add_namespace(NamespaceType::Mount, Some(PathBuf::from("/proc/self/ns/mnt")));
        let plan = NamespacePlan::for_creation(&mut joined).unwrap();
        assert!(plan.unshare.is_empty());
        assert_eq!(plan.join.len(), 1);
        assert_eq!(plan.join[0].0, NamespaceType::Mount);
    }

    #[test]
    fn missing_join_target() {
        let mut spec = Spec::default();
        spec.add_namespace(NamespaceType::Network, Some(PathBuf::from("/nonexistent/ns/net")));
        assert!(NamespacePlan::from_spec(&spec).is_err());
    }

    #[test]
    fn id_map_format() {
        let map = format_id_map(&[IdMapping {
            container_id: 0,
            host_id: 1000,
            size: 1,
        }]);
        assert_eq!(map, "0 1000 1\n");
    }
}
