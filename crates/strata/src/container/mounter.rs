//! Executes mount points through the RPC transport.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use strata_common::{StrataError, StrataResult};

use crate::config::FileConfig;
use crate::mount::{MountFlags, MountHandler, MountPoint};
use crate::rpc::{LOOP_FLAG_READ_ONLY, LoopArgs, LoopInfo, MountArgs, Ops};
use crate::session::{Session, resolve_in_root};

/// [`MountHandler`] that owns the RPC peer and the session.
///
/// A failure on a point that [`MountPoint::is_fatal_on_failure`] aborts the
/// pass; any other failure is logged and the destination is remembered as
/// skipped so later remounts of it are skipped too.
#[derive(Debug)]
pub struct Mounter<O> {
    ops: O,
    session: Session,
    max_loop_devices: u32,
    shared_loop_devices: bool,
    binds: HashSet<PathBuf>,
    skipped: HashSet<PathBuf>,
}

impl<O: Ops> Mounter<O> {
    /// Create a mounter.
    pub fn new(ops: O, session: Session, config: &FileConfig) -> Self {
        Self {
            ops,
            session,
            max_loop_devices: config.max_loop_devices,
            shared_loop_devices: config.shared_loop_devices,
            binds: HashSet::new(),
            skipped: HashSet::new(),
        }
    }

    /// The RPC peer.
    pub fn ops(&mut self) -> &mut O {
        &mut self.ops
    }

    /// The session.
    #[must_use]
    pub const fn session(&self) -> &Session {
        &self.session
    }

    /// The session, mutably.
    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    /// Destinations whose mount was skipped.
    #[must_use]
    pub fn skipped(&self) -> &HashSet<PathBuf> {
        &self.skipped
    }

    /// Give back the RPC peer and the session.
    pub fn into_parts(self) -> (O, Session) {
        (self.ops, self.session)
    }

    fn target(&self, point: &MountPoint) -> PathBuf {
        if point.tag.is_session_side() {
            point.destination.clone()
        } else {
            resolve_in_root(&self.session.final_path(), &point.destination)
        }
    }

    fn skip(&mut self, point: &MountPoint, reason: impl std::fmt::Display) {
        tracing::warn!(
            tag = %point.tag,
            source = %point.source.display(),
            destination = %point.destination.display(),
            "skipping mount: {reason}"
        );
        self.skipped.insert(point.destination.clone());
    }

    fn execute(&mut self, point: &MountPoint, target: &Path) -> StrataResult<()> {
        let flags = point.flags;

        if let Some(image) = point.image {
            let read_only = flags.contains(MountFlags::RDONLY);
            let number = self.ops.loop_device(LoopArgs {
                image: point.source.clone(),
                mode: if read_only { libc::O_RDONLY } else { libc::O_RDWR },
                info: LoopInfo {
                    offset: image.offset,
                    size_limit: image.size,
                    flags: if read_only { LOOP_FLAG_READ_ONLY } else { 0 },
                },
                max_devices: self.max_loop_devices,
                shared: self.shared_loop_devices && read_only,
            })?;
            return self.ops.mount(MountArgs {
                source: PathBuf::from(format!("/dev/loop{number}")),
                target: target.to_path_buf(),
                filesystem: point.fstype.clone(),
                mountflags: flags.bits(),
                data: point.data(),
            });
        }

        if point.is_remount() {
            let mut flags = flags;
            if self.binds.contains(&point.destination) {
                flags |= MountFlags::BIND;
            }
            return self.ops.mount(MountArgs {
                source: PathBuf::new(),
                target: target.to_path_buf(),
                filesystem: None,
                mountflags: flags.bits(),
                data: String::new(),
            });
        }

        if point.is_propagation() {
            return self.ops.mount(MountArgs {
                source: PathBuf::from("none"),
                target: target.to_path_buf(),
                filesystem: None,
                mountflags: flags.bits(),
                data: String::new(),
            });
        }

        if point.is_bind() {
            self.ops.mount(MountArgs {
                source: point.source.clone(),
                target: target.to_path_buf(),
                filesystem: None,
                mountflags: (flags - MountFlags::REMOUNT_SENSITIVE).bits(),
                data: String::new(),
            })?;
            self.binds.insert(point.destination.clone());
            return Ok(());
        }

        self.ops.mount(MountArgs {
            source: point.source.clone(),
            target: target.to_path_buf(),
            filesystem: point.fstype.clone(),
            mountflags: flags.bits(),
            data: point.data(),
        })
    }

    /// Bind mounts ignore per-mount flags; apply them with a remount.
    fn remount_bind(&mut self, point: &MountPoint, target: &Path) -> StrataResult<()> {
        let sensitive = point.flags & MountFlags::REMOUNT_SENSITIVE;
        if !point.is_bind() || sensitive.is_empty() {
            return Ok(());
        }
        self.ops
            .mount(MountArgs {
                source: PathBuf::new(),
                target: target.to_path_buf(),
                filesystem: None,
                mountflags: (MountFlags::BIND | MountFlags::REMOUNT | sensitive).bits(),
                data: String::new(),
            })
            .map_err(|e| {
                StrataError::mount(format!("remount of {}", point.destination.display()), e)
            })
    }
}

impl<O: Ops> MountHandler for Mounter<O> {
    fn mount(&mut self, point: &MountPoint) -> StrataResult<()> {
        let fatal = point.is_fatal_on_failure();
        let what = || format!("{} {}", point.tag, point.destination.display());

        if (point.is_remount() || point.is_propagation())
            && self.skipped.contains(&point.destination)
        {
            tracing::debug!(destination = %point.destination.display(), "Skipping remount of skipped mount");
            return Ok(());
        }

        let target = self.target(point);
        if target.symlink_metadata().is_err() {
            if fatal || point.tag.is_session_side() {
                return Err(StrataError::mount(
                    what(),
                    format!("destination {} doesn't exist", target.display()),
                ));
            }
            let layout = self.session.layout().name();
            self.skip(
                point,
                format_args!("destination doesn't exist in container (layout {layout})"),
            );
            return Ok(());
        }

        if point.is_bind() && point.source.symlink_metadata().is_err() {
            if fatal {
                return Err(StrataError::mount(
                    what(),
                    format!("source {} doesn't exist", point.source.display()),
                ));
            }
            self.skip(point, "source doesn't exist on host");
            return Ok(());
        }

        match self.execute(point, &target) {
            Ok(()) => self.remount_bind(point, &target),
            Err(e) if fatal => Err(StrataError::mount(what(), e)),
            Err(e) => {
                self.skip(point, e);
                Ok(())
            }
        }
    }
}
