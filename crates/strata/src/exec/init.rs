//! `sinit`: the PID 1 shim of containers with a PID namespace.
//!
//! Spawns the container process, reaps every child that gets reparented to
//! it and forwards the signals it receives. It exits with the status of the
//! container process, or 128 + signal number when that process was killed.

#![allow(unsafe_code)]

use std::os::unix::process::CommandExt;
use std::process::Command;

use strata_common::{StrataError, StrataResult};

/// How long to wait for a signal before checking children anyway.
const WAIT_TIMEOUT_SECS: libc::time_t = 1;

/// Exit code of a wait status.
#[must_use]
pub fn exit_code(status: libc::c_int) -> i32 {
    if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status)
    } else if libc::WIFSIGNALED(status) {
        128 + libc::WTERMSIG(status)
    } else {
        1
    }
}

fn all_signals() -> libc::sigset_t {
    // Safety: sigfillset initializes the set.
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigfillset(&raw mut set);
        set
    }
}

/// Container init process.
pub struct Sinit {
    child: libc::pid_t,
    group: bool,
    mask: libc::sigset_t,
    previous: libc::sigset_t,
}

impl Sinit {
    /// Block signals and spawn `command`. Signals are forwarded to the whole
    /// process group of the child when `group` is set (instances), otherwise
    /// to the child alone.
    pub fn spawn(mut command: Command, group: bool) -> StrataResult<Self> {
        let mask = all_signals();
        // Safety: previous is fully written by pthread_sigmask.
        let mut previous: libc::sigset_t = unsafe { std::mem::zeroed() };
        // Safety: both sets are valid.
        let ret = unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, &raw const mask, &raw mut previous) };
        if ret != 0 {
            return Err(std::io::Error::from_raw_os_error(ret).into());
        }

        if group {
            command.process_group(0);
        }
        // The spawned process starts with an empty signal mask.
        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                restore_mask(&previous);
                return Err(StrataError::Internal {
                    message: format!("failed to spawn container process: {e}"),
                });
            }
        };
        let child = libc::pid_t::try_from(child.id()).map_err(|e| StrataError::Internal {
            message: format!("child pid out of range: {e}"),
        })?;
        tracing::info!(pid = child, "Container process spawned");

        Ok(Self {
            child,
            group,
            mask,
            previous,
        })
    }

    /// PID of the container process.
    #[must_use]
    pub const fn child(&self) -> libc::pid_t {
        self.child
    }

    /// Run until the container process exits and return its exit code.
    pub fn wait(self) -> StrataResult<i32> {
        loop {
            if let Some(code) = self.reap()? {
                tracing::info!(exit_code = code, "Container process exited");
                return Ok(code);
            }
            match self.next_signal() {
                Some(libc::SIGCHLD) | None => {}
                Some(signal) => self.forward(signal),
            }
        }
    }

    /// Reap every exited child; returns the exit code of the container
    /// process once it is gone.
    fn reap(&self) -> StrataResult<Option<i32>> {
        let mut exited = None;
        loop {
            let mut status: libc::c_int = 0;
            // Safety: status is a valid out pointer, rusage may be null.
            let pid = unsafe {
                libc::wait4(-1, &raw mut status, libc::WNOHANG, std::ptr::null_mut())
            };
            if pid == 0 {
                break;
            }
            if pid < 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::ECHILD) {
                    break;
                }
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err.into());
            }
            if pid == self.child {
                exited = Some(exit_code(status));
            } else {
                tracing::debug!(pid, exit_code = exit_code(status), "Reaped orphan");
            }
        }
        Ok(exited)
    }

    fn next_signal(&self) -> Option<libc::c_int> {
        let timeout = libc::timespec {
            tv_sec: WAIT_TIMEOUT_SECS,
            tv_nsec: 0,
        };
        // Safety: info is a valid out pointer and the mask is initialized.
        let signal = unsafe {
            let mut info: libc::siginfo_t = std::mem::zeroed();
            libc::sigtimedwait(&raw const self.mask, &raw mut info, &raw const timeout)
        };
        (signal > 0).then_some(signal)
    }

    fn forward(&self, signal: libc::c_int) {
        let target = if self.group { -self.child } else { self.child };
        // Safety: kill has no memory side effects.
        if unsafe { libc::kill(target, signal) } != 0 {
            tracing::debug!(signal, target, error = %std::io::Error::last_os_error(), "signal not forwarded");
        }
    }
}

fn restore_mask(previous: &libc::sigset_t) {
    // Safety: previous was filled by pthread_sigmask.
    unsafe {
        libc::pthread_sigmask(libc::SIG_SETMASK, previous, std::ptr::null_mut());
    }
}

impl Drop for Sinit {
    fn drop(&mut self) {
        restore_mask(&self.previous);
    }
}
