//! Launcher.
//!
//! Forks the process that becomes the container. The child enters its
//! namespaces, starts the privileged RPC [`Server`] on a thread of its own
//! and runs the [`Container`] builder against it, so every mount and every
//! session file lives in the container mount namespace. This process then
//! attaches network and cgroups from the host side and releases the child,
//! which turns into the container process.
//!
//! ```text
//! engine (this process)              container process
//!   fork ───────────────────────────▶ join/unshare namespaces
//!   write id maps  ◀──── unshared ───
//!                  ───── ack ───────▶ [fork again for PID ns / instances]
//!                  ◀──── pids ──────
//!                                     build + mount ═══ RPC ═══▶ Server thread
//!   network, cgroups ◀── root ready ─
//!                  ───── go ────────▶ start_process
//! ```

#![allow(unsafe_code)]

mod namespaces;

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;

use strata_common::{StrataError, StrataPaths, StrataResult};
use strata_oci::runtime::NamespaceType;

use crate::config::{EngineConfig, FileConfig, Identity};
use crate::container::{Container, attach_host_resources};
use crate::exec::{exit_code, start_process};
use crate::instance::{
    InstanceRecord, InstanceStore, JoinWorkflow, ProcFs, prepare_join, validate_join,
    validate_name,
};
use crate::mount::MountFlags;
use crate::rpc::{Client, MountArgs, Ops, Server, ServerState};
use crate::security::{self, CapabilityPolicy};
use crate::session::HostProbe;

pub use namespaces::{NamespacePlan, format_id_map, write_id_maps};

const UNSHARED: u8 = b'U';
const ACK: u8 = b'A';
const ROOT_READY: u8 = b'R';
const GO: u8 = b'G';

/// Exit status of a container side that failed before exec.
const SETUP_FAILURE: i32 = 255;

enum Forked {
    Parent(i32),
    Child,
}

fn fork() -> StrataResult<Forked> {
    // Safety: the child only runs Rust code of this crate before exec or _exit.
    let pid = unsafe { libc::fork() };
    match pid {
        -1 => Err(StrataError::Internal {
            message: format!("fork failed: {}", std::io::Error::last_os_error()),
        }),
        0 => Ok(Forked::Child),
        pid => Ok(Forked::Parent(pid)),
    }
}

fn exit_now(code: i32) -> ! {
    // Safety: terminates the forked child without running the parent's
    // atexit handlers.
    unsafe { libc::_exit(code) }
}

/// Wait for `pid` and return its exit code.
pub fn wait_child(pid: i32) -> StrataResult<i32> {
    loop {
        let mut status: libc::c_int = 0;
        // Safety: status is a valid out pointer.
        let ret = unsafe { libc::waitpid(pid, &raw mut status, 0) };
        if ret == -1 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(StrataError::Internal {
                message: format!("waitpid failed: {err}"),
            });
        }
        return Ok(exit_code(status));
    }
}

fn read_byte(stream: &mut UnixStream) -> StrataResult<u8> {
    let mut byte = [0u8; 1];
    stream.read_exact(&mut byte)?;
    Ok(byte[0])
}

fn read_pid(stream: &mut UnixStream) -> StrataResult<i32> {
    let mut bytes = [0u8; 4];
    stream.read_exact(&mut bytes)?;
    Ok(i32::from_be_bytes(bytes))
}

fn sync_error(step: &str, e: impl std::fmt::Display) -> StrataError {
    StrataError::Internal {
        message: format!("container process sync failed ({step}): {e}"),
    }
}

/// GID of the `disk` group, owner of the loop devices.
fn disk_gid() -> Option<u32> {
    let content = std::fs::read_to_string("/etc/group").ok()?;
    content.lines().find_map(|line| {
        let mut fields = line.split(':');
        (fields.next()? == "disk").then_some(())?;
        fields.nth(1)?.parse().ok()
    })
}

/// Name of this binary as the kernel shows it in `comm`.
fn starter_name() -> String {
    std::fs::read_to_string("/proc/self/comm")
        .map(|comm| comm.trim_end().to_string())
        .unwrap_or_else(|_| "strata".to_string())
}

/// Starts containers and joins instances.
#[derive(Debug)]
pub struct Launcher {
    engine: EngineConfig,
    config: FileConfig,
    identity: Identity,
    paths: StrataPaths,
}

impl Launcher {
    /// Launcher for one invocation.
    pub const fn new(
        engine: EngineConfig,
        config: FileConfig,
        identity: Identity,
        paths: StrataPaths,
    ) -> Self {
        Self {
            engine,
            config,
            identity,
            paths,
        }
    }

    fn policy(&self) -> StrataResult<CapabilityPolicy> {
        CapabilityPolicy::load(&self.paths.capability_file())
    }

    /// Run the invocation: join when the image is an `instance://` URI,
    /// create otherwise. Returns the exit code of the container process, or
    /// 0 once an instance is running.
    pub fn run(self) -> StrataResult<i32> {
        match self.engine.join_instance_name().map(str::to_string) {
            Some(name) => self.join(&name),
            None => self.start(),
        }
    }

    /// Create a container and start its process.
    pub fn start(mut self) -> StrataResult<i32> {
        if self.engine.instance() {
            let name = self
                .engine
                .instance_name
                .as_deref()
                .ok_or_else(|| StrataError::config("instance without a name"))?;
            validate_name(name)?;
        }

        let policy = self.policy()?;
        let mut spec = self.engine.oci.clone();
        security::prepare(&mut spec, &self.engine, &self.config, &self.identity, &policy)?;
        self.engine.oci = spec;

        let plan = NamespacePlan::for_creation(&mut self.engine.oci)?;
        let monitor = plan.new_pid || self.engine.instance();
        let probe = HostProbe::detect();
        let host_pid = rustix::process::Pid::as_raw(Some(rustix::process::getpid()));
        let (parent_sync, child_sync) = UnixStream::pair()?;

        match fork()? {
            Forked::Child => {
                drop(parent_sync);
                let side = ContainerSide {
                    launcher: &self,
                    plan: &plan,
                    monitor,
                    probe,
                    host_pid,
                };
                let code = side.run(child_sync).unwrap_or_else(|e| {
                    tracing::error!(error = %e, "container setup failed");
                    SETUP_FAILURE
                });
                exit_now(code)
            }
            Forked::Parent(child) => {
                drop(child_sync);
                self.engine_side(child, &plan, probe, parent_sync)
            }
        }
    }

    fn engine_side(
        self,
        child: i32,
        plan: &NamespacePlan,
        probe: HostProbe,
        mut sync: UnixStream,
    ) -> StrataResult<i32> {
        if read_byte(&mut sync).map_err(|e| sync_error("unshare", e))? != UNSHARED {
            return Err(sync_error("unshare", "unexpected message"));
        }
        if plan.new_user {
            write_id_maps(child, &self.engine.oci, self.identity.uid, self.identity.gid)?;
        }
        sync.write_all(&[ACK])?;
        let container_pid = read_pid(&mut sync).map_err(|e| sync_error("pids", e))?;
        let monitor_pid = read_pid(&mut sync).map_err(|e| sync_error("pids", e))?;
        tracing::debug!(child, container_pid, monitor_pid, "Container process ready");

        if !matches!(read_byte(&mut sync), Ok(ROOT_READY)) {
            drop(sync);
            let code = wait_child(child)?;
            return Err(StrataError::Internal {
                message: format!("container creation failed (exit code {code})"),
            });
        }

        let userns = plan.new_user || probe.in_userns;
        if let Err(e) = attach_host_resources(
            &self.engine,
            &self.config,
            &self.identity,
            userns,
            container_pid,
        ) {
            drop(sync);
            let _ = wait_child(child);
            return Err(e);
        }
        sync.write_all(&[GO])?;

        if self.engine.instance() {
            let name = self.engine.instance_name.clone().unwrap_or_default();
            let record = InstanceRecord::new(
                name.as_str(),
                self.identity.name.as_str(),
                container_pid,
                monitor_pid,
                &self.engine,
                userns,
            )?;
            let store = InstanceStore::for_user(&self.paths, &self.identity.name);
            store.cleanup_stale()?;
            store.save(&record)?;
            tracing::info!(instance = %name, pid = container_pid, "Instance started");
            return Ok(0);
        }
        wait_child(child)
    }

    /// Join a running instance and start a process in it.
    pub fn join(mut self, name: &str) -> StrataResult<i32> {
        let store = InstanceStore::for_user(&self.paths, &self.identity.name);
        let record = store.load(name)?;
        let starter = starter_name();
        let workflow = JoinWorkflow {
            setuid: rustix::process::geteuid().is_root(),
            starter_name: &starter,
        };
        validate_join(&record, &self.identity, workflow, &ProcFs::default())?;

        let policy = self.policy()?;
        prepare_join(&mut self.engine, &record, &self.config, &self.identity, &policy)?;
        // the instance already runs an init
        self.engine.no_init = true;

        let plan = NamespacePlan::from_spec(&self.engine.oci)?;
        let joins_pid = plan.join.iter().any(|(ns, _)| *ns == NamespaceType::Pid);
        match fork()? {
            Forked::Child => {
                let code = join_side(&self.engine, &plan, joins_pid).unwrap_or_else(|e| {
                    tracing::error!(error = %e, "joining instance failed");
                    SETUP_FAILURE
                });
                exit_now(code)
            }
            Forked::Parent(child) => wait_child(child),
        }
    }
}

/// The forked child of a creation pass.
struct ContainerSide<'a> {
    launcher: &'a Launcher,
    plan: &'a NamespacePlan,
    /// Fork once more behind a monitor (PID namespace or instance).
    monitor: bool,
    probe: HostProbe,
    /// The engine process, outside every new namespace.
    host_pid: i32,
}

impl ContainerSide<'_> {
    fn run(&self, mut sync: UnixStream) -> StrataResult<i32> {
        let Launcher { engine, config, .. } = self.launcher;
        let plan = self.plan;
        plan.enter()?;
        sync.write_all(&[UNSHARED])?;
        if read_byte(&mut sync)? != ACK {
            return Err(sync_error("id maps", "unexpected message"));
        }

        if self.monitor {
            if engine.instance() {
                rustix::process::setsid().map_err(|e| sync_error("setsid", e))?;
            }
            plan.unshare_pid()?;
            if let Forked::Parent(pid) = fork()? {
                sync.write_all(&pid.to_be_bytes())?;
                sync.write_all(&std::process::id().to_be_bytes())?;
                drop(sync);
                return wait_child(pid);
            }
        } else {
            let ppid = rustix::process::Pid::as_raw(rustix::process::getppid());
            sync.write_all(&std::process::id().to_be_bytes())?;
            sync.write_all(&ppid.to_be_bytes())?;
        }

        let mut server = Server::new(ServerState {
            file_config: config.clone(),
            disk_gid: disk_gid(),
        });
        if plan.unshare.contains(rustix::thread::UnshareFlags::NEWNS) {
            // keep host mount events one way
            let propagation = if config.mount_slave {
                MountFlags::SLAVE
            } else {
                MountFlags::PRIVATE
            };
            server.mount(MountArgs {
                source: "none".into(),
                target: "/".into(),
                filesystem: None,
                mountflags: (propagation | MountFlags::REC).bits(),
                data: String::new(),
            })?;
        }

        let (client_sock, server_sock) = UnixStream::pair()?;
        let handle = server.spawn(server_sock)?;
        let created = self.build(client_sock);
        let served = handle.join().map_err(|_| StrataError::Internal {
            message: "rpc server thread panicked".to_string(),
        })?;
        created?;
        served?;

        sync.write_all(&[ROOT_READY])?;
        match read_byte(&mut sync) {
            Ok(GO) => {}
            _ => {
                return Err(StrataError::Internal {
                    message: "host side setup of the container failed".to_string(),
                });
            }
        }
        drop(sync);
        start_process(&engine.oci, engine)
    }

    /// Assemble and enter the root. The RPC channel closes on return, which
    /// stops the server thread.
    fn build(&self, client_sock: UnixStream) -> StrataResult<()> {
        let Launcher {
            engine,
            config,
            identity,
            paths,
        } = self.launcher;
        let mut container = Container::new(
            Client::new(client_sock),
            engine.clone(),
            config.clone(),
            identity.clone(),
            paths.clone(),
            self.probe,
        )?;
        container.create(self.host_pid)
    }
}

/// Body of the forked child of a join.
fn join_side(engine: &EngineConfig, plan: &NamespacePlan, joins_pid: bool) -> StrataResult<i32> {
    plan.enter()?;
    if joins_pid {
        // setns on a PID namespace only applies to children
        if let Forked::Parent(pid) = fork()? {
            return wait_child(pid);
        }
    }
    start_process(&engine.oci, engine)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_exchange() {
        let (mut a, mut b) = UnixStream::pair().unwrap();
        a.write_all(&4242i32.to_be_bytes()).unwrap();
        a.write_all(&[GO]).unwrap();
        assert_eq!(read_pid(&mut b).unwrap(), 4242);
        assert_eq!(read_byte(&mut b).unwrap(), GO);
    }

    #[test]
    fn comm_is_read() {
        assert!(!starter_name().is_empty());
    }
}
