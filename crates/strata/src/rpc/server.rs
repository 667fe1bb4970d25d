//! Privileged side of the RPC channel.

use std::ffi::CString;
use std::io::{Read, Write};
use std::os::unix::fs::{DirBuilderExt, MetadataExt};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread::JoinHandle;

use strata_common::{StrataError, StrataResult};
use strata_oci::runtime::NamespaceType;

use super::creds::{self, FsIdGuard};
use super::loopdev::{self, LoopDevice};
use super::{ChrootMethod, LoopArgs, MountArgs, Ops, Request, read_frame, write_frame};
use crate::config::FileConfig;
use crate::mount::MountFlags;

/// State shared by every call of a server.
#[derive(Debug, Clone, Default)]
pub struct ServerState {
    /// Admin configuration.
    pub file_config: FileConfig,
    /// Group owning the loop devices, used while attaching.
    pub disk_gid: Option<u32>,
}

/// Executes requests with real syscalls.
#[derive(Debug)]
pub struct Server {
    state: ServerState,
    loop_devices: Vec<LoopDevice>,
}

/// Serve requests from `stream` until the peer closes it.
pub fn serve<S: Read + Write, O: Ops + ?Sized>(mut stream: S, ops: &mut O) -> StrataResult<()> {
    while let Some(request) = read_frame::<_, Request>(&mut stream)? {
        tracing::trace!(method = request.method(), "rpc request");
        let reply = request.dispatch(ops);
        write_frame(&mut stream, &reply)?;
    }
    tracing::debug!("rpc peer closed the connection");
    Ok(())
}

/// Flags of the mount holding `target` that an unprivileged remount may not
/// clear.
fn locked_flags(target: &Path) -> MountFlags {
    use rustix::fs::StatVfsMountFlags as St;

    let locked = St::NOSUID
        | St::NODEV
        | St::NOEXEC
        | St::RDONLY
        | St::NOATIME
        | St::NODIRATIME
        | St::RELATIME;
    rustix::fs::statvfs(target).map_or(MountFlags::empty(), |st| {
        MountFlags::from_bits_retain((st.f_flag & locked).bits())
    })
}

fn sys_mount(
    source: &Path,
    target: &Path,
    fstype: Option<&str>,
    flags: MountFlags,
    data: &str,
) -> StrataResult<()> {
    use rustix::mount::{self, MountFlags as Raw, MountPropagationFlags};

    let raw = |flags: MountFlags| {
        u32::try_from(flags.bits()).map_err(|_| StrataError::Internal {
            message: format!("Invalid mount flags: {flags:?}"),
        })
    };
    let result = if flags.contains(MountFlags::MOVE) {
        mount::mount_move(source, target)
    } else if flags.intersects(MountFlags::PROPAGATION)
        && !flags.intersects(MountFlags::BIND | MountFlags::REMOUNT)
    {
        mount::mount_change(target, MountPropagationFlags::from_bits_retain(raw(flags)?))
    } else if flags.contains(MountFlags::REMOUNT) {
        let mut flags = flags - MountFlags::REMOUNT;
        if flags.contains(MountFlags::BIND) {
            flags |= locked_flags(target);
        }
        mount::mount_remount(target, Raw::from_bits_retain(raw(flags)?), data)
    } else {
        let data = (!data.is_empty())
            .then(|| CString::new(data))
            .transpose()
            .map_err(|e| StrataError::Internal {
                message: format!("Invalid mount data: {e}"),
            })?;
        mount::mount(
            source,
            target,
            fstype.unwrap_or(""),
            Raw::from_bits_retain(raw(flags)?),
            data.as_deref(),
        )
    };
    result.map_err(io)
}

/// Returns true if `pid` lives in another `ns_type` namespace than this process.
pub fn namespace_differs(pid: i32, ns_type: NamespaceType) -> StrataResult<bool> {
    let ours = std::fs::metadata(format!("/proc/self/ns/{}", ns_type.proc_name()))?;
    let theirs = std::fs::metadata(format!("/proc/{pid}/ns/{}", ns_type.proc_name()))?;
    Ok(ours.dev() != theirs.dev() || ours.ino() != theirs.ino())
}

fn io(e: rustix::io::Errno) -> StrataError {
    StrataError::Io(e.into())
}

impl Server {
    /// Create a server.
    #[must_use]
    pub fn new(state: ServerState) -> Self {
        Self {
            state,
            loop_devices: Vec::new(),
        }
    }

    /// Admin configuration this server enforces.
    #[must_use]
    pub const fn state(&self) -> &ServerState {
        &self.state
    }

    /// Serve `stream` on a dedicated OS thread.
    ///
    /// Filesystem credentials are per thread, so the server never migrates.
    pub fn spawn(mut self, stream: UnixStream) -> StrataResult<JoinHandle<StrataResult<()>>> {
        std::thread::Builder::new()
            .name("strata-rpc".to_string())
            .spawn(move || serve(stream, &mut self))
            .map_err(StrataError::Io)
    }

    fn pivot(root: &Path) -> StrataResult<()> {
        use rustix::fs::{Mode, OFlags};

        rustix::process::chdir(root).map_err(io)?;
        let old_root = rustix::fs::open(
            "/",
            OFlags::DIRECTORY | OFlags::RDONLY | OFlags::CLOEXEC,
            Mode::empty(),
        )
        .map_err(io)?;
        rustix::process::pivot_root(".", ".").map_err(io)?;
        rustix::process::fchdir(&old_root).map_err(io)?;
        // The old root is stacked on the new one; keep its events out of the host.
        sys_mount(
            Path::new("none"),
            Path::new("."),
            None,
            MountFlags::SLAVE | MountFlags::REC,
            "",
        )?;
        rustix::mount::unmount(".", rustix::mount::UnmountFlags::DETACH).map_err(io)?;
        rustix::process::chdir("/").map_err(io)?;
        Ok(())
    }

    fn move_root(root: &Path) -> StrataResult<()> {
        rustix::process::chdir(root).map_err(io)?;
        sys_mount(Path::new("."), Path::new("/"), None, MountFlags::MOVE, "")?;
        rustix::process::chroot(".").map_err(io)?;
        rustix::process::chdir("/").map_err(io)?;
        Ok(())
    }

    fn plain_chroot(root: &Path) -> StrataResult<()> {
        rustix::process::chdir(root).map_err(io)?;
        rustix::process::chroot(".").map_err(io)?;
        rustix::process::chdir("/").map_err(io)?;
        Ok(())
    }
}

impl Ops for Server {
    fn mount(&mut self, args: MountArgs) -> StrataResult<()> {
        tracing::debug!(
            source = %args.source.display(),
            target = %args.target.display(),
            fstype = ?args.filesystem,
            flags = args.mountflags,
            "Mounting filesystem"
        );
        sys_mount(
            &args.source,
            &args.target,
            args.filesystem.as_deref(),
            MountFlags::from_bits_retain(args.mountflags),
            &args.data,
        )
    }

    fn mkdir(&mut self, path: &Path, perm: u32) -> StrataResult<()> {
        tracing::debug!(path = %path.display(), perm = %format!("{perm:o}"), "Creating directory");
        std::fs::DirBuilder::new().mode(perm).create(path)?;
        Ok(())
    }

    fn chroot(&mut self, root: &Path, method: ChrootMethod) -> StrataResult<()> {
        tracing::debug!(root = %root.display(), ?method, "Changing root");
        match method {
            ChrootMethod::Pivot => Self::pivot(root),
            ChrootMethod::Move => Self::move_root(root),
            ChrootMethod::Chroot => Self::plain_chroot(root),
        }
    }

    fn loop_device(&mut self, args: LoopArgs) -> StrataResult<u32> {
        let max_devices = args.max_devices.min(self.state.file_config.max_loop_devices);
        let args = LoopArgs {
            max_devices,
            shared: args.shared && self.state.file_config.shared_loop_devices,
            ..args
        };
        let device = {
            let _guard = FsIdGuard::swap(0, self.state.disk_gid.unwrap_or(0))?;
            loopdev::attach(&args)?
        };
        let number = device.number;
        tracing::debug!(device = %device.path().display(), image = %args.image.display(), "Loop device ready");
        self.loop_devices.push(device);
        Ok(number)
    }

    fn set_hostname(&mut self, name: &str) -> StrataResult<()> {
        tracing::debug!(hostname = name, "Setting hostname");
        rustix::system::sethostname(name.as_bytes()).map_err(io)
    }

    fn has_namespace(&mut self, pid: i32, ns_type: NamespaceType) -> StrataResult<bool> {
        namespace_differs(pid, ns_type)
    }

    fn set_fs_id(&mut self, uid: u32, gid: u32) -> StrataResult<()> {
        creds::set_fs_id(uid, gid)
    }
}
