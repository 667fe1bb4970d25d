//! Filesystem credentials of the RPC thread.
//!
//! setfsuid(2) and setfsgid(2) act on the calling thread only, which is why
//! the server pins itself to one OS thread.

#![allow(unsafe_code)]

use strata_common::{StrataError, StrataResult};

/// Read the current filesystem uid without changing it.
fn current_fsuid() -> u32 {
    // Safety: an invalid id leaves the credentials unchanged and returns the current one.
    unsafe { libc::setfsuid(u32::MAX) as u32 }
}

fn current_fsgid() -> u32 {
    // Safety: see current_fsuid.
    unsafe { libc::setfsgid(u32::MAX) as u32 }
}

/// Set the thread's filesystem credentials.
pub fn set_fs_id(uid: u32, gid: u32) -> StrataResult<()> {
    // Safety: plain syscalls on the calling thread.
    unsafe {
        libc::setfsgid(gid);
        libc::setfsuid(uid);
    }
    if current_fsuid() != uid || current_fsgid() != gid {
        return Err(StrataError::PermissionDenied {
            operation: format!("set filesystem ids to {uid}:{gid}"),
        });
    }
    tracing::debug!(uid, gid, "Filesystem ids changed");
    Ok(())
}

/// Temporary filesystem credential swap, restored on drop.
#[derive(Debug)]
pub struct FsIdGuard {
    uid: u32,
    gid: u32,
}

impl FsIdGuard {
    /// Switch to `uid`/`gid` until the guard is dropped.
    pub fn swap(uid: u32, gid: u32) -> StrataResult<Self> {
        let guard = Self {
            uid: current_fsuid(),
            gid: current_fsgid(),
        };
        set_fs_id(uid, gid)?;
        Ok(guard)
    }
}

impl Drop for FsIdGuard {
    fn drop(&mut self) {
        if let Err(e) = set_fs_id(self.uid, self.gid) {
            tracing::error!(error = %e, "unable to restore filesystem ids");
        }
    }
}
