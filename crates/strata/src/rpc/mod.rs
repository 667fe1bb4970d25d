//! Privilege-crossing RPC.
//!
//! The engine never calls mount(2) and friends itself. Every privileged
//! operation is a plain argument struct sent over a private socket pair to a
//! [`server::Server`] that executes it on a dedicated OS thread. [`Ops`] is
//! the seam: the builder talks to an `Ops`, the [`client::Client`] forwards
//! over the wire, the server implements it with real syscalls and tests
//! implement it with recorders.

pub mod client;
mod creds;
mod loopdev;
pub mod server;

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use strata_common::{StrataError, StrataResult};
use strata_oci::runtime::NamespaceType;

pub use client::Client;
pub use creds::FsIdGuard;
pub use loopdev::{LOOP_FLAG_AUTOCLEAR, LOOP_FLAG_READ_ONLY};
pub use server::{Server, ServerState, namespace_differs};

/// Largest frame accepted on the wire.
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Arguments of a mount(2) call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountArgs {
    /// Mount source.
    pub source: PathBuf,
    /// Mount target.
    pub target: PathBuf,
    /// Filesystem type.
    pub filesystem: Option<String>,
    /// Raw mount flags.
    pub mountflags: u64,
    /// Filesystem data.
    pub data: String,
}

/// Arguments of a mkdir(2) call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MkdirArgs {
    /// Directory to create.
    pub path: PathBuf,
    /// Permission bits.
    pub perm: u32,
}

/// How to switch into the new root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChrootMethod {
    /// pivot_root(".", ".") and detach the old root.
    Pivot,
    /// Move the mount onto `/` and chroot.
    Move,
    /// Plain chroot(2).
    Chroot,
}

/// Arguments of a root switch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChrootArgs {
    /// New root directory.
    pub root: PathBuf,
    /// Switch method.
    pub method: ChrootMethod,
}

/// Loop device parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopInfo {
    /// Offset of the filesystem in the backing file.
    pub offset: u64,
    /// Size limit (0 for the whole file).
    pub size_limit: u64,
    /// `LO_FLAGS_*` bits.
    pub flags: u32,
}

/// Arguments of a loop device attach.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopArgs {
    /// Backing image file.
    pub image: PathBuf,
    /// Open mode of the image (`O_RDONLY` or `O_RDWR`).
    pub mode: i32,
    /// Loop parameters.
    pub info: LoopInfo,
    /// Highest loop device number searched.
    pub max_devices: u32,
    /// Reuse an existing device attached to the same image.
    pub shared: bool,
}

/// Arguments of a sethostname(2) call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostnameArgs {
    /// New hostname.
    pub hostname: String,
}

/// Arguments of a namespace comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HasNamespaceArgs {
    /// Process to compare against the server.
    pub pid: i32,
    /// Namespace type.
    pub ns_type: NamespaceType,
}

/// Arguments of a filesystem credential change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetFsIdArgs {
    /// Filesystem user ID.
    pub uid: u32,
    /// Filesystem group ID.
    pub gid: u32,
}

/// A request on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "args")]
pub enum Request {
    /// mount(2).
    Mount(MountArgs),
    /// mkdir(2).
    Mkdir(MkdirArgs),
    /// Root switch.
    Chroot(ChrootArgs),
    /// Loop device attach.
    LoopDevice(LoopArgs),
    /// sethostname(2).
    SetHostname(HostnameArgs),
    /// Namespace comparison.
    HasNamespace(HasNamespaceArgs),
    /// setfsuid(2)/setfsgid(2).
    SetFsId(SetFsIdArgs),
}

impl Request {
    /// Method name used in errors and logs.
    #[must_use]
    pub const fn method(&self) -> &'static str {
        match self {
            Self::Mount(_) => "Mount",
            Self::Mkdir(_) => "Mkdir",
            Self::Chroot(_) => "Chroot",
            Self::LoopDevice(_) => "LoopDevice",
            Self::SetHostname(_) => "SetHostname",
            Self::HasNamespace(_) => "HasNamespace",
            Self::SetFsId(_) => "SetFsID",
        }
    }

    /// Execute the request against an implementation.
    pub fn dispatch<O: Ops + ?Sized>(self, ops: &mut O) -> Reply {
        let method = self.method();
        let result = match self {
            Self::Mount(args) => ops.mount(args).map(|()| Reply::Done),
            Self::Mkdir(args) => ops.mkdir(&args.path, args.perm).map(|()| Reply::Done),
            Self::Chroot(args) => ops.chroot(&args.root, args.method).map(|()| Reply::Done),
            Self::LoopDevice(args) => ops.loop_device(args).map(Reply::Device),
            Self::SetHostname(args) => ops.set_hostname(&args.hostname).map(|()| Reply::Done),
            Self::HasNamespace(args) => ops.has_namespace(args.pid, args.ns_type).map(Reply::Bool),
            Self::SetFsId(args) => ops.set_fs_id(args.uid, args.gid).map(|()| Reply::Done),
        };
        result.unwrap_or_else(|e| {
            tracing::debug!(method, error = %e, "rpc call failed");
            Reply::Error {
                errno: e.errno(),
                message: e.to_string(),
            }
        })
    }
}

/// A reply on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "lowercase")]
pub enum Reply {
    /// The call succeeded without a value.
    Done,
    /// A loop device number.
    Device(u32),
    /// A boolean answer.
    Bool(bool),
    /// The call failed.
    Error {
        /// Error description.
        message: String,
        /// OS error number, if the failure came from a syscall.
        errno: Option<i32>,
    },
}

/// Privileged operations.
pub trait Ops {
    /// mount(2).
    fn mount(&mut self, args: MountArgs) -> StrataResult<()>;

    /// mkdir(2) with the given permission bits.
    fn mkdir(&mut self, path: &Path, perm: u32) -> StrataResult<()>;

    /// Switch the root of the calling mount namespace.
    fn chroot(&mut self, root: &Path, method: ChrootMethod) -> StrataResult<()>;

    /// Attach an image to a loop device and return its number.
    fn loop_device(&mut self, args: LoopArgs) -> StrataResult<u32>;

    /// sethostname(2).
    fn set_hostname(&mut self, name: &str) -> StrataResult<()>;

    /// Returns true if `pid` lives in a different namespace of this type than
    /// the server.
    fn has_namespace(&mut self, pid: i32, ns_type: NamespaceType) -> StrataResult<bool>;

    /// Set the filesystem credentials used by later calls.
    fn set_fs_id(&mut self, uid: u32, gid: u32) -> StrataResult<()>;
}

/// Write one length-prefixed JSON frame.
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, value: &T) -> StrataResult<()> {
    let body = serde_json::to_vec(value)?;
    let len = u32::try_from(body.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_SIZE)
        .ok_or_else(|| StrataError::Serialization(format!("frame of {} bytes", body.len())))?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}

/// Read one length-prefixed JSON frame; `None` on a clean end of stream.
pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> StrataResult<Option<T>> {
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(StrataError::Serialization(
                    "truncated frame header".to_string(),
                ));
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }

    let len = u32::from_be_bytes(header);
    if len > MAX_FRAME_SIZE {
        return Err(StrataError::Serialization(format!(
            "frame of {len} bytes exceeds limit"
        )));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body)?;
    Ok(Some(serde_json::from_slice(&body)?))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn frames_are_length_prefixed() {
        let request = Request::Mkdir(MkdirArgs {
            path: PathBuf::from("/s/final/data"),
            perm: 0o755,
        });
        let mut buf = Vec::new();
        write_frame(&mut buf, &request).unwrap();

        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(len, buf.len() - 4);
        let json: serde_json::Value = serde_json::from_slice(&buf[4..]).unwrap();
        assert_eq!(json["method"], "Mkdir");
        assert_eq!(json["args"]["perm"], 0o755);

        let mut cursor = Cursor::new(buf);
        let decoded: Option<Request> = read_frame(&mut cursor).unwrap();
        assert_eq!(decoded, Some(request));
        let eof: Option<Request> = read_frame(&mut cursor).unwrap();
        assert_eq!(eof, None);
    }

    #[test]
    fn truncated_frame_is_an_error() {
        let mut cursor = Cursor::new(vec![0u8, 0]);
        assert!(read_frame::<_, Reply>(&mut cursor).is_err());

        let mut cursor = Cursor::new(vec![0u8, 0, 0, 10, b'{']);
        assert!(read_frame::<_, Reply>(&mut cursor).is_err());
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut cursor = Cursor::new((MAX_FRAME_SIZE + 1).to_be_bytes().to_vec());
        assert!(read_frame::<_, Reply>(&mut cursor).is_err());
    }
}
