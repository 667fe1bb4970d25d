//! Starting the container process.

#![allow(unsafe_code)]

use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use strata_common::{StrataError, StrataResult};
use strata_oci::Spec;
use strata_oci::runtime::{NamespaceType, Process, User};

use super::actions::{Action, resolve_action};
use super::init::Sinit;
use crate::config::EngineConfig;
use crate::security;

/// The command line of the container process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessCommand {
    /// Program and arguments.
    pub argv: Vec<String>,
    /// Environment, replacing the engine's.
    pub env: Vec<(String, String)>,
    /// Working directory.
    pub cwd: PathBuf,
}

impl ProcessCommand {
    /// Build the command of `process`. A leading action name is replaced
    /// by the matching script of the container tree at `root`.
    pub fn from_spec(process: &Process, root: &Path) -> StrataResult<Self> {
        let Some((first, rest)) = process.args.split_first() else {
            return Err(StrataError::config("no process arguments"));
        };
        let argv = match Action::parse(first) {
            Some(action) => resolve_action(root, action, rest)?,
            None => process.args.clone(),
        };
        let env = process
            .env
            .iter()
            .filter_map(|entry| {
                let parsed = entry.split_once('=');
                if parsed.is_none() {
                    tracing::warn!(entry = %entry, "ignoring malformed environment entry");
                }
                parsed.map(|(k, v)| (k.to_string(), v.to_string()))
            })
            .collect();
        let cwd = if process.cwd.as_os_str().is_empty() {
            PathBuf::from("/")
        } else {
            process.cwd.clone()
        };
        Ok(Self { argv, env, cwd })
    }

    /// A [`Command`] running this process.
    #[must_use]
    pub fn command(&self) -> Command {
        let (program, args) = self
            .argv
            .split_first()
            .map_or(("", &[][..]), |(p, a)| (p.as_str(), a));
        let mut command = Command::new(program);
        command
            .args(args)
            .env_clear()
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .current_dir(&self.cwd);
        command
    }
}

/// Mark every descriptor from `from` up close-on-exec, so image and RPC
/// descriptors don't leak into the container process.
pub fn close_fds(from: u32) -> StrataResult<()> {
    // Safety: close_range only changes descriptor flags.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_close_range,
            from,
            u32::MAX,
            libc::CLOSE_RANGE_CLOEXEC,
        )
    };
    if ret == 0 {
        return Ok(());
    }

    tracing::debug!("close_range unavailable, walking /proc/self/fd");
    let fds: Vec<i32> = std::fs::read_dir("/proc/self/fd")?
        .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse().ok())
        .filter(|fd| u32::try_from(*fd).is_ok_and(|fd| fd >= from))
        .collect();
    for fd in fds {
        // Safety: setting FD_CLOEXEC on a possibly stale descriptor is harmless.
        unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };
    }
    Ok(())
}

/// Switch to the process user, keeping capabilities across the change.
fn switch_user(user: &User) -> StrataResult<()> {
    let euid = rustix::process::geteuid().as_raw();
    let egid = rustix::process::getegid().as_raw();
    if euid == user.uid && egid == user.gid && user.additional_gids.is_empty() {
        return Ok(());
    }
    if euid != 0 {
        return Err(StrataError::PermissionDenied {
            operation: format!("switch to user {}:{}", user.uid, user.gid),
        });
    }

    let groups: Vec<libc::gid_t> = user.additional_gids.clone();
    // Safety: plain credential syscalls, groups outlives the call.
    let failed = unsafe {
        libc::prctl(libc::PR_SET_KEEPCAPS, 1, 0, 0, 0) != 0
            || libc::setgroups(groups.len(), groups.as_ptr()) != 0
            || libc::setresgid(user.gid, user.gid, user.gid) != 0
            || libc::setresuid(user.uid, user.uid, user.uid) != 0
    };
    if failed {
        return Err(StrataError::Security {
            message: format!(
                "failed to switch to user {}:{}: {}",
                user.uid,
                user.gid,
                std::io::Error::last_os_error()
            ),
        });
    }
    tracing::debug!(uid = user.uid, gid = user.gid, "Switched user");
    Ok(())
}

/// Start the container process inside the prepared root.
///
/// With a PID namespace and init enabled this process becomes `sinit` and
/// returns the exit code of the container process. Otherwise it execs the
/// container process and only returns on failure.
pub fn start_process(spec: &Spec, engine: &EngineConfig) -> StrataResult<i32> {
    let process = spec
        .process
        .as_ref()
        .ok_or_else(|| StrataError::config("no process configuration"))?;
    let command = ProcessCommand::from_spec(process, Path::new("/"))?;

    close_fds(3)?;
    switch_user(&process.user)?;
    security::apply(spec)?;

    if spec.has_namespace(NamespaceType::Pid) && !engine.no_init {
        tracing::debug!("Running as sinit");
        return Sinit::spawn(command.command(), engine.instance())?.wait();
    }

    tracing::info!(argv = ?command.argv, "Executing container process");
    let err = command.command().exec();
    Err(StrataError::Internal {
        message: format!("failed to execute {}: {err}", command.argv.join(" ")),
    })
}
