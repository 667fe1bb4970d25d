//! Creation through a real RPC server inside a user and mount namespace.
#![allow(unsafe_code)]

mod common;

use std::error::Error;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use common::{Fixture, engine, quiet_config};
use strata::config::{FileConfig, Identity, MountDev};
use strata::container::Container;
use strata::image::Image;
use strata::mount::MountFlags;
use strata::rpc::{Client, MountArgs, Ops, Server, ServerState};
use strata::session::HostProbe;

/// Exit code of a child that could not create its namespaces.
const UNSUPPORTED: i32 = 77;

fn enter_user_namespace() -> bool {
    use rustix::thread::UnshareFlags;

    let uid = rustix::process::getuid().as_raw();
    let gid = rustix::process::getgid().as_raw();
    // Safety: the forked test child is single threaded.
    if unsafe { rustix::thread::unshare_unsafe(UnshareFlags::NEWUSER | UnshareFlags::NEWNS) }
        .is_err()
    {
        return false;
    }
    std::fs::write("/proc/self/setgroups", "deny").is_ok()
        && std::fs::write("/proc/self/uid_map", format!("0 {uid} 1\n")).is_ok()
        && std::fs::write("/proc/self/gid_map", format!("0 {gid} 1\n")).is_ok()
}

fn root() -> Identity {
    Identity {
        uid: 0,
        gid: 0,
        name: "root".to_string(),
        home: PathBuf::from("/root"),
        ..common::alice(Path::new("/"))
    }
}

/// Body of the forked child: build the container against a server thread of
/// its own and look at the result from inside the new root.
fn create_in_namespace(fx: &Fixture, host_pid: i32) -> Result<i32, Box<dyn Error>> {
    if !enter_user_namespace() {
        return Ok(UNSUPPORTED);
    }
    let config = FileConfig {
        mount_proc: false,
        mount_sys: false,
        mount_dev: MountDev::No,
        mount_hostfs: false,
        config_passwd: false,
        config_group: false,
        ..quiet_config()
    };

    let mut server = Server::new(ServerState {
        file_config: config.clone(),
        disk_gid: None,
    });
    server.mount(MountArgs {
        source: "none".into(),
        target: "/".into(),
        filesystem: None,
        mountflags: (MountFlags::PRIVATE | MountFlags::REC).bits(),
        data: String::new(),
    })?;
    let (client_sock, server_sock) = UnixStream::pair()?;
    let handle = server.spawn(server_sock)?;

    let created = Container::new(
        Client::new(client_sock),
        engine(Image::sandbox(&fx.tree)),
        config,
        root(),
        fx.paths.clone(),
        HostProbe {
            overlay_supported: false,
            in_userns: true,
        },
    )
    .and_then(|mut container| container.create(host_pid));
    handle.join().map_err(|_| "rpc server panicked")??;
    created?;

    let hosts = std::fs::read_to_string("/etc/hosts")?;
    if hosts != "127.0.0.1 localhost\n" {
        return Err(format!("unexpected /etc/hosts in the new root: {hosts:?}").into());
    }
    Ok(0)
}

#[test]
fn creation_stays_in_the_container_mount_namespace() -> Result<(), Box<dyn Error>> {
    let fx = Fixture::new();
    let host_pid = rustix::process::Pid::as_raw(Some(rustix::process::getpid()));

    // Safety: the child only runs the creation pass and leaves with _exit.
    let pid = unsafe { libc::fork() };
    assert!(pid >= 0, "fork failed");
    if pid == 0 {
        let code = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            create_in_namespace(&fx, host_pid).unwrap_or_else(|e| {
                eprintln!("creation failed: {e}");
                1
            })
        }))
        .unwrap_or(2);
        // Safety: leaves the child without running the harness.
        unsafe { libc::_exit(code) }
    }

    let mut status = 0;
    // Safety: status is a valid out pointer.
    assert_eq!(unsafe { libc::waitpid(pid, &raw mut status, 0) }, pid);
    assert!(libc::WIFEXITED(status));
    match libc::WEXITSTATUS(status) {
        UNSUPPORTED => {
            eprintln!("user namespaces unavailable, skipping");
            return Ok(());
        }
        code => assert_eq!(code, 0, "creation in the child failed"),
    }

    // the session lived on a tmpfs of the child's mount namespace only
    let leaked: Vec<_> = std::fs::read_dir(fx.paths.session_dir())?
        .filter_map(Result::ok)
        .map(|e| e.file_name())
        .collect();
    assert!(leaked.is_empty(), "session content visible on the host: {leaked:?}");
    Ok(())
}
