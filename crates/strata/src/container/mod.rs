//! Container builder.
//!
//! A [`Container`] turns an [`EngineConfig`] and the admin [`FileConfig`] into
//! an ordered mount point set, executes it through an [`Ops`] peer and
//! switches the peer into the assembled root. [`attach_host_resources`] runs
//! afterwards from the host side.

mod binds;
mod dev;
mod files;
mod home;
mod kernel;
mod mounter;
mod rootfs;
mod scratch;

use std::path::{Path, PathBuf};

use strata_common::{StrataError, StrataPaths, StrataResult};
use strata_oci::runtime::NamespaceType;

use crate::cgroup;
use crate::config::{EngineConfig, FileConfig, Identity};
use crate::mount::{MountFlags, MountSystem, MountTag};
use crate::network;
use crate::rpc::{ChrootMethod, Ops, namespace_differs};
use crate::session::{HostProbe, Layout, Session, select_layout};

pub use binds::{BindSpec, parse_bind_specs};
pub use mounter::Mounter;

/// Builds and enters a container root.
#[derive(Debug)]
pub struct Container<O> {
    engine: EngineConfig,
    config: FileConfig,
    identity: Identity,
    paths: StrataPaths,
    cwd: PathBuf,
    namespaces: Vec<NamespaceType>,
    userns: bool,
    suid_flag: MountFlags,
    home_dest: Option<PathBuf>,
    system: MountSystem<Mounter<O>>,
    mounter: Mounter<O>,
}

/// Downgrade a duplicate destination to a warning; wrap anything else.
fn recoverable(what: &str, result: StrataResult<()>) -> StrataResult<()> {
    match result {
        Ok(()) => Ok(()),
        Err(StrataError::MountExists { destination }) => {
            tracing::warn!(%destination, "{what}: destination already mounted, skipping");
            Ok(())
        }
        Err(e @ StrataError::Mount { .. }) => Err(e),
        Err(e) => Err(StrataError::mount(what, e)),
    }
}

/// Attach host-side resources to a container process whose root is ready:
/// its network namespace, then its cgroup.
pub fn attach_host_resources(
    engine: &EngineConfig,
    config: &FileConfig,
    identity: &Identity,
    userns: bool,
    container_pid: i32,
) -> StrataResult<()> {
    let privileged = identity.is_root() && !userns;

    if engine.oci.has_namespace(NamespaceType::Network) && !engine.network.is_empty() {
        if !privileged {
            tracing::warn!("network setup requires root, skipping");
        } else if namespace_differs(container_pid, NamespaceType::Network)? {
            network::setup(config, engine, container_pid)?;
        } else {
            tracing::warn!(pid = container_pid, "container shares the host network namespace, skipping network setup");
        }
    }

    if let Some(path) = engine.cgroups_path() {
        if privileged {
            let resources = engine
                .oci
                .linux
                .as_ref()
                .and_then(|l| l.resources.clone())
                .unwrap_or_default();
            cgroup::CgroupManager::new(path)?.apply(container_pid, &resources)?;
        } else {
            tracing::warn!(path, "cgroups require root, skipping");
        }
    }
    Ok(())
}

impl<O: Ops + 'static> Container<O> {
    /// Prepare a creation pass: resolve the working directory and namespaces,
    /// pick the layout and describe the session.
    pub fn new(
        ops: O,
        engine: EngineConfig,
        config: FileConfig,
        identity: Identity,
        paths: StrataPaths,
        probe: HostProbe,
    ) -> StrataResult<Self> {
        let cwd = match &engine.cwd {
            Some(cwd) => cwd.clone(),
            None => std::env::current_dir()?,
        };

        let namespaces: Vec<NamespaceType> = NamespaceType::ALL
            .into_iter()
            .filter(|ns| engine.oci.has_namespace(*ns))
            .collect();
        let userns = namespaces.contains(&NamespaceType::User) || probe.in_userns;

        let suid_flag = if config.allow_setuid && !userns {
            MountFlags::empty()
        } else {
            MountFlags::NOSUID
        };

        let image = engine
            .image()
            .ok_or_else(|| StrataError::config("no image to mount"))?;
        let layout = select_layout(image, &engine, &config, probe);
        let size = (!identity.is_root()).then_some(config.sessiondir_max_size);
        let session = Session::new(paths.session_dir(), config.memory_fs_type.clone(), size, layout);

        tracing::info!(
            image = %image.path.display(),
            layout = layout.name(),
            namespaces = ?namespaces,
            "Preparing container"
        );

        let mounter = Mounter::new(ops, session, &config);
        Ok(Self {
            engine,
            config,
            identity,
            paths,
            cwd,
            namespaces,
            userns,
            suid_flag,
            home_dest: None,
            system: MountSystem::new(),
            mounter,
        })
    }

    /// Layout chosen for this pass.
    #[must_use]
    pub const fn layout(&self) -> Layout {
        self.mounter.session().layout()
    }

    /// Mount points gathered so far.
    #[must_use]
    pub const fn system(&self) -> &MountSystem<Mounter<O>> {
        &self.system
    }

    /// The mounter (RPC peer and session).
    #[must_use]
    pub const fn mounter(&self) -> &Mounter<O> {
        &self.mounter
    }

    /// Give back the RPC peer and the session.
    pub fn into_parts(self) -> (O, Session) {
        self.mounter.into_parts()
    }

    fn has_namespace(&self, ns: NamespaceType) -> bool {
        self.namespaces.contains(&ns)
    }

    /// Build the mount point set without executing it.
    pub fn add_mount_points(&mut self) -> StrataResult<()> {
        self.add_session()?;
        self.add_rootfs()?;
        self.add_kernel()?;
        self.add_dev()?;
        self.add_hostfs()?;
        self.add_admin_binds()?;
        self.add_fs_id_hooks();
        self.add_home()?;
        self.add_user_binds()?;
        self.add_tmp()?;
        self.add_scratch()?;
        self.add_cwd()?;
        self.add_libraries()?;
        self.add_identity_files()?;
        self.add_resolv_conf()?;
        self.add_hostname()?;
        self.add_actions()?;
        tracing::debug!(points = self.system.points.len(), "Mount point set ready");
        Ok(())
    }

    /// Run the mount pass and switch the peer into the final root.
    /// `host_pid` is a process outside the container namespaces.
    pub fn create(&mut self, host_pid: i32) -> StrataResult<()> {
        self.check_namespaces(host_pid);
        self.add_mount_points()?;
        self.system.mount_all(&mut self.mounter)?;
        self.enter_root()?;
        tracing::info!(root = %self.mounter.session().final_path().display(), "Container root ready");
        Ok(())
    }

    /// Keep only the requested namespaces the peer actually lives in.
    fn check_namespaces(&mut self, host_pid: i32) {
        let ops = self.mounter.ops();
        self.namespaces.retain(|ns| match ops.has_namespace(host_pid, *ns) {
            Ok(true) => true,
            Ok(false) => {
                tracing::warn!(namespace = ns.proc_name(), "namespace shared with the host, ignoring");
                false
            }
            Err(e) => {
                tracing::debug!(namespace = ns.proc_name(), error = %e, "unable to compare namespace");
                true
            }
        });
    }

    /// Switch the peer into the final root, falling back from pivot to move.
    pub fn enter_root(&mut self) -> StrataResult<()> {
        let root = self.mounter.session().final_path();
        match self.mounter.ops().chroot(&root, ChrootMethod::Pivot) {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::debug!(error = %e, "pivot_root failed, moving the root instead");
                self.mounter
                    .ops()
                    .chroot(&root, ChrootMethod::Move)
                    .map_err(|e| StrataError::mount("root filesystem", e))
            }
        }
    }

    fn add_session(&mut self) -> StrataResult<()> {
        let session = self.mounter.session();
        let options = session.mount_options();
        let fstype = session.fstype().to_string();
        let path = session.path().to_path_buf();
        recoverable(
            "session directory",
            self.system.points.add_fs(
                MountTag::Session,
                &path,
                &fstype,
                MountFlags::NOSUID | MountFlags::NODEV,
                &options,
            ),
        )?;
        self.system
            .run_after_tag(MountTag::Session, |mounter: &mut Mounter<O>, _| {
                mounter.session_mut().create()
            });
        Ok(())
    }

    /// Directory backing contained `/tmp`, `/var/tmp`, home and scratch.
    fn contained_dir(&mut self, name: &str, mode: u32) -> StrataResult<PathBuf> {
        match &self.engine.workdir {
            Some(workdir) => {
                let dir = workdir.join(name);
                std::fs::create_dir_all(&dir).map_err(|e| {
                    StrataError::mount(format!("workdir {}", dir.display()), e)
                })?;
                Ok(dir)
            }
            None => self
                .mounter
                .session_mut()
                .add_dir_mode(Path::new("contain").join(name), mode),
        }
    }
}
