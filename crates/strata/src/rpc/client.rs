//! Engine side of the RPC channel.

use std::io::{Read, Write};
use std::path::Path;

use strata_common::{StrataError, StrataResult};
use strata_oci::runtime::NamespaceType;

use super::{
    ChrootArgs, ChrootMethod, HasNamespaceArgs, HostnameArgs, LoopArgs, MkdirArgs, MountArgs,
    Ops, Reply, Request, SetFsIdArgs, read_frame, write_frame,
};

/// Forwards [`Ops`] calls to a server over a byte stream.
#[derive(Debug)]
pub struct Client<T> {
    stream: T,
}

impl<T: Read + Write> Client<T> {
    /// Wrap a connected stream.
    pub fn new(stream: T) -> Self {
        Self { stream }
    }

    /// Return the underlying stream.
    pub fn into_inner(self) -> T {
        self.stream
    }

    fn call(&mut self, request: Request) -> StrataResult<Reply> {
        let method = request.method();
        write_frame(&mut self.stream, &request).map_err(|e| transport_error(method, &e))?;
        let reply: Option<Reply> =
            read_frame(&mut self.stream).map_err(|e| transport_error(method, &e))?;
        match reply {
            Some(Reply::Error { message, errno }) => Err(StrataError::Rpc {
                method: method.to_string(),
                message,
                errno,
            }),
            Some(reply) => Ok(reply),
            None => Err(StrataError::Rpc {
                method: method.to_string(),
                message: "server closed the connection".to_string(),
                errno: None,
            }),
        }
    }

    fn expect_done(&mut self, request: Request) -> StrataResult<()> {
        let method = request.method();
        match self.call(request)? {
            Reply::Done => Ok(()),
            other => Err(unexpected(method, &other)),
        }
    }
}

fn transport_error(method: &str, err: &StrataError) -> StrataError {
    StrataError::Rpc {
        method: method.to_string(),
        message: err.to_string(),
        errno: err.errno(),
    }
}

fn unexpected(method: &str, reply: &Reply) -> StrataError {
    StrataError::Rpc {
        method: method.to_string(),
        message: format!("unexpected reply {reply:?}"),
        errno: None,
    }
}

impl<T: Read + Write> Ops for Client<T> {
    fn mount(&mut self, args: MountArgs) -> StrataResult<()> {
        self.expect_done(Request::Mount(args))
    }

    fn mkdir(&mut self, path: &Path, perm: u32) -> StrataResult<()> {
        self.expect_done(Request::Mkdir(MkdirArgs {
            path: path.to_path_buf(),
            perm,
        }))
    }

    fn chroot(&mut self, root: &Path, method: ChrootMethod) -> StrataResult<()> {
        self.expect_done(Request::Chroot(ChrootArgs {
            root: root.to_path_buf(),
            method,
        }))
    }

    fn loop_device(&mut self, args: LoopArgs) -> StrataResult<u32> {
        match self.call(Request::LoopDevice(args))? {
            Reply::Device(number) => Ok(number),
            other => Err(unexpected("LoopDevice", &other)),
        }
    }

    fn set_hostname(&mut self, name: &str) -> StrataResult<()> {
        self.expect_done(Request::SetHostname(HostnameArgs {
            hostname: name.to_string(),
        }))
    }

    fn has_namespace(&mut self, pid: i32, ns_type: NamespaceType) -> StrataResult<bool> {
        match self.call(Request::HasNamespace(HasNamespaceArgs { pid, ns_type }))? {
            Reply::Bool(value) => Ok(value),
            other => Err(unexpected("HasNamespace", &other)),
        }
    }

    fn set_fs_id(&mut self, uid: u32, gid: u32) -> StrataResult<()> {
        self.expect_done(Request::SetFsId(SetFsIdArgs { uid, gid }))
    }
}
