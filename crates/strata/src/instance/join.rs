//! Joining a running instance.
//!
//! Before a caller is attached to the namespaces of an instance the record
//! is checked against the live process. A non-root caller joining an
//! instance that has no user namespace gets the stricter procfs checks,
//! since the record file alone could point at any process on the host.

use std::fs::File;
use std::io::{self, Read};
use std::os::fd::OwnedFd;
use std::path::PathBuf;

use rustix::fs::{AtFlags, Mode, OFlags};
use strata_common::{StrataError, StrataResult};

use super::InstanceRecord;
use crate::config::{EngineConfig, FileConfig, Identity};
use crate::security::{self, CapabilityPolicy, SecurityOptions};

/// Kernel limit on `/proc/<pid>/comm`, without the trailing NUL.
const COMM_LEN: usize = 15;

/// The uid_map of a process living in the initial user namespace.
const IDENTITY_MAP: [&str; 3] = ["0", "0", "4294967295"];

/// How the joining engine was started.
#[derive(Debug, Clone, Copy)]
pub struct JoinWorkflow<'a> {
    /// Running from the setuid starter.
    pub setuid: bool,
    /// Binary name of the starter, as shown in the parent's `comm`.
    pub starter_name: &'a str,
}

/// View on one process.
pub trait ProcessInfo {
    /// Contents of `uid_map`.
    fn uid_map(&self) -> io::Result<String>;
    /// Whether reading the `root` link is refused with `EACCES`.
    fn root_link_denied(&self) -> bool;
    /// Owner (uid, gid) of the `task` directory.
    fn task_owner(&self) -> io::Result<(u32, u32)>;
    /// `PPid:` from `status`.
    fn parent_pid(&self) -> io::Result<i32>;
    /// Contents of `comm`, without the newline.
    fn comm(&self) -> io::Result<String>;
}

/// Opens processes by PID.
pub trait ProcessTable {
    /// Process handle.
    type Process: ProcessInfo;

    /// Open `pid`.
    fn open(&self, pid: i32) -> io::Result<Self::Process>;
}

/// The host procfs.
#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
}

impl Default for ProcFs {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/proc"),
        }
    }
}

impl ProcFs {
    /// procfs mounted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ProcessTable for ProcFs {
    type Process = ProcDir;

    fn open(&self, pid: i32) -> io::Result<ProcDir> {
        let fd = rustix::fs::open(
            self.root.join(pid.to_string()),
            OFlags::RDONLY | OFlags::DIRECTORY | OFlags::CLOEXEC,
            Mode::empty(),
        )?;
        Ok(ProcDir { fd })
    }
}

/// An open `/proc/<pid>` directory. Every lookup is relative to the
/// descriptor, so a recycled PID can't swap the process underneath.
#[derive(Debug)]
pub struct ProcDir {
    fd: OwnedFd,
}

impl ProcDir {
    fn read(&self, name: &str) -> io::Result<String> {
        let fd = rustix::fs::openat(&self.fd, name, OFlags::RDONLY | OFlags::CLOEXEC, Mode::empty())?;
        let mut content = String::new();
        File::from(fd).read_to_string(&mut content)?;
        Ok(content)
    }
}

impl ProcessInfo for ProcDir {
    fn uid_map(&self) -> io::Result<String> {
        self.read("uid_map")
    }

    fn root_link_denied(&self) -> bool {
        matches!(
            rustix::fs::readlinkat(&self.fd, "root", Vec::new()),
            Err(rustix::io::Errno::ACCESS)
        )
    }

    fn task_owner(&self) -> io::Result<(u32, u32)> {
        let stat = rustix::fs::statat(&self.fd, "task", AtFlags::empty())?;
        Ok((stat.st_uid, stat.st_gid))
    }

    fn parent_pid(&self) -> io::Result<i32> {
        parse_ppid(&self.read("status")?)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no PPid in status"))
    }

    fn comm(&self) -> io::Result<String> {
        Ok(self.read("comm")?.trim_end_matches('\n').to_string())
    }
}

fn parse_ppid(status: &str) -> Option<i32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("PPid:"))
        .and_then(|v| v.trim().parse().ok())
}

fn is_identity_map(uid_map: &str) -> bool {
    let lines: Vec<&str> = uid_map.lines().filter(|l| !l.trim().is_empty()).collect();
    matches!(lines.as_slice(), [line] if line.split_whitespace().eq(IDENTITY_MAP))
}

fn refuse(record: &InstanceRecord, reason: impl std::fmt::Display) -> StrataError {
    StrataError::instance(format!("can't join instance {}: {reason}", record.name))
}

/// Check that `caller` may join the instance of `record`.
pub fn validate_join<T: ProcessTable>(
    record: &InstanceRecord,
    caller: &Identity,
    workflow: JoinWorkflow<'_>,
    procs: &T,
) -> StrataResult<()> {
    if workflow.setuid && record.userns {
        return Err(refuse(record, "a user namespace instance can't be joined with the setuid workflow"));
    }
    if !workflow.setuid && !record.userns {
        return Err(refuse(record, "an instance without user namespace requires the setuid workflow"));
    }
    if record.pid <= 1 || record.ppid <= 1 {
        return Err(refuse(record, format!("invalid pid {} / ppid {}", record.pid, record.ppid)));
    }
    if !caller.is_root() && !record.userns {
        inspect_instance(record, caller, procs)?;
    }

    let parent = procs
        .open(record.ppid)
        .map_err(|e| refuse(record, format!("parent process: {e}")))?;
    let comm = parent
        .comm()
        .map_err(|e| refuse(record, format!("comm: {e}")))?;
    let expected: String = workflow.starter_name.chars().take(COMM_LEN).collect();
    if comm != expected {
        return Err(refuse(record, format!("parent process is {comm:?}, not the starter")));
    }

    tracing::debug!(instance = %record.name, pid = record.pid, "Instance process verified");
    Ok(())
}

/// Procfs checks of a non-root caller against an instance without user
/// namespace.
fn inspect_instance<T: ProcessTable>(
    record: &InstanceRecord,
    caller: &Identity,
    procs: &T,
) -> StrataResult<()> {
    let io_err = |what: &str, e: io::Error| refuse(record, format!("{what}: {e}"));

    let process = procs.open(record.pid).map_err(|e| io_err("instance process", e))?;
    let uid_map = process.uid_map().map_err(|e| io_err("uid_map", e))?;
    if !is_identity_map(&uid_map) {
        return Err(refuse(record, "instance process is in a user namespace"));
    }
    check_ownership(record, caller, &process, "instance process")?;
    let ppid = process.parent_pid().map_err(|e| io_err("status", e))?;
    if ppid != record.ppid {
        return Err(refuse(record, format!("parent is {ppid}, recorded {}", record.ppid)));
    }

    let parent = procs.open(record.ppid).map_err(|e| io_err("parent process", e))?;
    check_ownership(record, caller, &parent, "parent process")
}

fn check_ownership(
    record: &InstanceRecord,
    caller: &Identity,
    process: &impl ProcessInfo,
    what: &str,
) -> StrataResult<()> {
    if !process.root_link_denied() {
        return Err(refuse(record, format!("{what} root is readable")));
    }
    let (uid, gid) = process
        .task_owner()
        .map_err(|e| refuse(record, format!("{what} task: {e}")))?;
    if uid != caller.uid || gid != caller.gid {
        return Err(refuse(record, format!("{what} is owned by {uid}:{gid}")));
    }
    Ok(())
}

/// Point `request` at the namespaces of the instance and re-derive its
/// security. Labels missing from the request are taken from the instance.
pub fn prepare_join(
    request: &mut EngineConfig,
    record: &InstanceRecord,
    config: &FileConfig,
    identity: &Identity,
    policy: &CapabilityPolicy,
) -> StrataResult<SecurityOptions> {
    let stored = record.engine_config()?;
    let mut spec = request.oci.clone();

    let namespaces = stored
        .oci
        .linux
        .as_ref()
        .map(|linux| linux.namespaces.clone())
        .unwrap_or_default();
    spec.linux_mut().namespaces = namespaces
        .into_iter()
        .map(|mut ns| {
            ns.path = Some(PathBuf::from(format!(
                "/proc/{}/ns/{}",
                record.pid,
                ns.ns_type.proc_name()
            )));
            ns
        })
        .collect();

    let options = security::prepare(&mut spec, request, config, identity, policy)?;

    if let Some(stored_process) = &stored.oci.process {
        let process = spec.process_mut();
        if process.selinux_label.is_none() {
            process.selinux_label.clone_from(&stored_process.selinux_label);
        }
        if process.apparmor_profile.is_none() {
            process.apparmor_profile.clone_from(&stored_process.apparmor_profile);
        }
    }
    let stored_seccomp = stored.oci.linux.as_ref().and_then(|l| l.seccomp.clone());
    if spec.linux.as_ref().is_none_or(|l| l.seccomp.is_none()) && stored_seccomp.is_some() {
        spec.linux_mut().seccomp = stored_seccomp;
    }

    request.oci = spec;
    request.instance_name = Some(record.name.clone());
    tracing::info!(instance = %record.name, pid = record.pid, "Joining instance");
    Ok(options)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use strata_oci::runtime::{NamespaceType, Seccomp, SeccompAction};

    use super::*;
    use crate::config::Group;

    #[derive(Clone)]
    struct FakeProc {
        uid_map: String,
        root_denied: bool,
        owner: (u32, u32),
        ppid: i32,
        comm: String,
    }

    impl ProcessInfo for FakeProc {
        fn uid_map(&self) -> io::Result<String> {
            Ok(self.uid_map.clone())
        }
        fn root_link_denied(&self) -> bool {
            self.root_denied
        }
        fn task_owner(&self) -> io::Result<(u32, u32)> {
            Ok(self.owner)
        }
        fn parent_pid(&self) -> io::Result<i32> {
            Ok(self.ppid)
        }
        fn comm(&self) -> io::Result<String> {
            Ok(self.comm.clone())
        }
    }

    struct FakeTable(HashMap<i32, FakeProc>);

    impl ProcessTable for FakeTable {
        type Process = FakeProc;
        fn open(&self, pid: i32) -> io::Result<FakeProc> {
            self.0
                .get(&pid)
                .cloned()
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
        }
    }

    fn proc(ppid: i32, comm: &str) -> FakeProc {
        FakeProc {
            uid_map: "         0          0 4294967295\n".to_string(),
            root_denied: true,
            owner: (1000, 1000),
            ppid,
            comm: comm.to_string(),
        }
    }

    fn healthy() -> FakeTable {
        FakeTable(HashMap::from([(200, proc(100, "sinit")), (100, proc(1, "strata"))]))
    }

    fn identity(uid: u32) -> Identity {
        Identity {
            uid,
            gid: uid,
            name: if uid == 0 { "root" } else { "alice" }.to_string(),
            home: PathBuf::from("/home/alice"),
            shell: "/bin/sh".to_string(),
            gecos: String::new(),
            groups: vec![Group {
                gid: uid,
                name: "alice".to_string(),
            }],
        }
    }

    fn record(userns: bool) -> InstanceRecord {
        let mut engine = EngineConfig::default();
        engine.oci.add_namespace(NamespaceType::Pid, None);
        engine.oci.add_namespace(NamespaceType::Mount, None);
        engine.oci.process_mut().apparmor_profile = Some("strata-default".to_string());
        engine.oci.linux_mut().seccomp = Some(Seccomp {
            default_action: SeccompAction::ScmpActErrno,
            default_errno_ret: None,
            architectures: Vec::new(),
            flags: Vec::new(),
            syscalls: Vec::new(),
        });
        InstanceRecord::new("web", "alice", 200, 100, &engine, userns).unwrap()
    }

    const SUID: JoinWorkflow<'static> = JoinWorkflow {
        setuid: true,
        starter_name: "strata",
    };
    const USERNS: JoinWorkflow<'static> = JoinWorkflow {
        setuid: false,
        starter_name: "strata",
    };

    #[test]
    fn workflow_matrix() {
        let procs = healthy();
        let alice = identity(1000);

        assert!(validate_join(&record(true), &alice, SUID, &procs).is_err());
        assert!(validate_join(&record(false), &alice, USERNS, &procs).is_err());
        assert!(validate_join(&record(false), &alice, SUID, &procs).is_ok());
        assert!(validate_join(&record(true), &alice, USERNS, &procs).is_ok());
    }

    #[test]
    fn low_pids_rejected() {
        let mut rec = record(false);
        rec.ppid = 1;
        assert!(validate_join(&rec, &identity(0), SUID, &healthy()).is_err());
    }

    #[test]
    fn procfs_checks() {
        let alice = identity(1000);
        let rec = record(false);

        let mut procs = healthy();
        procs.0.get_mut(&200).unwrap().uid_map = "0 1000 1\n".to_string();
        assert!(validate_join(&rec, &alice, SUID, &procs).is_err());

        let mut procs = healthy();
        procs.0.get_mut(&200).unwrap().root_denied = false;
        assert!(validate_join(&rec, &alice, SUID, &procs).is_err());

        let mut procs = healthy();
        procs.0.get_mut(&100).unwrap().owner = (1001, 1000);
        assert!(validate_join(&rec, &alice, SUID, &procs).is_err());

        let mut procs = healthy();
        procs.0.get_mut(&200).unwrap().owner = (1000, 0);
        assert!(validate_join(&rec, &alice, SUID, &procs).is_err());

        let mut procs = healthy();
        procs.0.get_mut(&200).unwrap().ppid = 99;
        assert!(validate_join(&rec, &alice, SUID, &procs).is_err());

        let mut procs = healthy();
        procs.0.get_mut(&100).unwrap().comm = "bash".to_string();
        assert!(validate_join(&rec, &alice, SUID, &procs).is_err());

        // root skips the ownership inspection
        let mut procs = healthy();
        procs.0.get_mut(&200).unwrap().root_denied = false;
        assert!(validate_join(&rec, &identity(0), SUID, &procs).is_ok());
    }

    #[test]
    fn starter_checked_for_every_caller() {
        let mut spoofed = healthy();
        spoofed.0.get_mut(&100).unwrap().comm = "bash".to_string();

        assert!(validate_join(&record(false), &identity(0), SUID, &spoofed).is_err());
        assert!(validate_join(&record(true), &identity(1000), USERNS, &spoofed).is_err());
        assert!(validate_join(&record(false), &identity(0), SUID, &healthy()).is_ok());

        // a vanished parent means a stale record
        let mut orphan = healthy();
        orphan.0.remove(&100);
        assert!(validate_join(&record(false), &identity(0), SUID, &orphan).is_err());
    }

    #[test]
    fn long_starter_names_truncated() {
        let mut procs = healthy();
        procs.0.get_mut(&100).unwrap().comm = "strata-starter-".to_string();
        let workflow = JoinWorkflow {
            setuid: true,
            starter_name: "strata-starter-suid",
        };
        assert!(validate_join(&record(false), &identity(1000), workflow, &procs).is_ok());
    }

    #[test]
    fn join_rewrites_namespaces() {
        let mut request = EngineConfig::default();
        let options = prepare_join(
            &mut request,
            &record(false),
            &FileConfig::default(),
            &identity(1000),
            &CapabilityPolicy::default(),
        )
        .unwrap();
        assert!(options.apparmor.is_none());

        let linux = request.oci.linux.as_ref().unwrap();
        let paths: Vec<_> = linux.namespaces.iter().filter_map(|ns| ns.path.clone()).collect();
        assert_eq!(
            paths,
            vec![PathBuf::from("/proc/200/ns/pid"), PathBuf::from("/proc/200/ns/mnt")]
        );
        let process = request.oci.process.as_ref().unwrap();
        assert_eq!(process.apparmor_profile.as_deref(), Some("strata-default"));
        let seccomp = linux.seccomp.as_ref().unwrap();
        assert_eq!(seccomp.default_action, SeccompAction::ScmpActErrno);
        assert!(process.no_new_privileges);
        assert_eq!(request.instance_name.as_deref(), Some("web"));
    }

    #[test]
    fn ppid_parsing() {
        assert_eq!(parse_ppid("Name:\tsinit\nPPid:\t4241\n"), Some(4241));
        assert_eq!(parse_ppid("Name:\tsinit\n"), None);
    }
}
