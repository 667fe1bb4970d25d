//! Shared fixtures: a recording privileged peer and container trees.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use strata::config::{EngineConfig, FileConfig, Group, Identity};
use strata::container::Container;
use strata::image::Image;
use strata::mount::MountFlags;
use strata::rpc::{ChrootMethod, LoopArgs, MountArgs, Ops};
use strata::session::HostProbe;
use strata_common::{StrataError, StrataPaths, StrataResult};
use strata_oci::runtime::NamespaceType;
use tempfile::TempDir;

/// One call received by [`RecordingOps`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Mount {
        source: PathBuf,
        target: PathBuf,
        fstype: Option<String>,
        flags: MountFlags,
        data: String,
    },
    Mkdir(PathBuf),
    Chroot(PathBuf, ChrootMethod),
    Loop(PathBuf, u64),
    Hostname(String),
    FsId(u32, u32),
}

/// Privileged peer that records every call.
///
/// Mounts whose target sits directly in the session (`rootfs`, `final`,
/// overlay partitions) are emulated with symbolic links so later steps see
/// the content of the image tree.
#[derive(Debug, Default)]
pub struct RecordingOps {
    pub calls: Vec<Call>,
    pub session: PathBuf,
    /// Image file and offset to the directory standing in for its content.
    pub images: HashMap<(PathBuf, u64), PathBuf>,
    pub fail_pivot: bool,
    pub fail_move: bool,
    /// Namespaces reported as shared with the host process.
    pub shared_namespaces: Vec<NamespaceType>,
    loops: Vec<(PathBuf, u64)>,
}

impl RecordingOps {
    pub fn new(session: &Path) -> Self {
        Self {
            session: session.to_path_buf(),
            ..Self::default()
        }
    }

    fn emulated(&self, target: &Path) -> bool {
        let parent = target.parent();
        parent == Some(self.session.as_path())
            || parent == Some(self.session.join("overlay-images").as_path())
    }

    fn link(&self, content: &Path, target: &Path) {
        if content == target || !self.emulated(target) || !target.is_dir() {
            return;
        }
        let empty = std::fs::read_dir(target).is_ok_and(|mut d| d.next().is_none());
        if empty {
            std::fs::remove_dir(target).unwrap();
            std::os::unix::fs::symlink(content, target).unwrap();
        }
    }

    pub fn mounts(&self) -> Vec<(PathBuf, PathBuf, MountFlags)> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                Call::Mount {
                    source,
                    target,
                    flags,
                    ..
                } => Some((source.clone(), target.clone(), *flags)),
                _ => None,
            })
            .collect()
    }

    pub fn position(&self, matches: impl Fn(&Call) -> bool) -> Option<usize> {
        self.calls.iter().position(matches)
    }
}

impl Ops for RecordingOps {
    fn mount(&mut self, args: MountArgs) -> StrataResult<()> {
        let flags = MountFlags::from_bits_retain(args.mountflags);
        if !flags.intersects(MountFlags::REMOUNT | MountFlags::PROPAGATION) {
            let loop_image = args
                .source
                .to_str()
                .and_then(|s| s.strip_prefix("/dev/loop"))
                .and_then(|n| n.parse::<usize>().ok())
                .and_then(|n| self.loops.get(n))
                .and_then(|image| self.images.get(image))
                .cloned();
            if let Some(content) = loop_image {
                self.link(&content, &args.target);
            } else if flags.contains(MountFlags::BIND) && args.source.is_dir() {
                self.link(&args.source, &args.target);
            } else if args.filesystem.as_deref() == Some("overlay") {
                let bottom = args
                    .data
                    .split(',')
                    .find_map(|o| o.strip_prefix("lowerdir="))
                    .and_then(|l| l.split(':').next_back())
                    .map(PathBuf::from);
                if let Some(bottom) = bottom {
                    self.link(&bottom, &args.target);
                }
            }
        }
        self.calls.push(Call::Mount {
            source: args.source,
            target: args.target,
            fstype: args.filesystem,
            flags,
            data: args.data,
        });
        Ok(())
    }

    fn mkdir(&mut self, path: &Path, _perm: u32) -> StrataResult<()> {
        std::fs::create_dir_all(path)?;
        self.calls.push(Call::Mkdir(path.to_path_buf()));
        Ok(())
    }

    fn chroot(&mut self, root: &Path, method: ChrootMethod) -> StrataResult<()> {
        self.calls.push(Call::Chroot(root.to_path_buf(), method));
        let failed = match method {
            ChrootMethod::Pivot => self.fail_pivot,
            ChrootMethod::Move => self.fail_move,
            ChrootMethod::Chroot => false,
        };
        if failed {
            return Err(StrataError::Rpc {
                method: "Chroot".to_string(),
                message: "Invalid argument".to_string(),
                errno: Some(libc::EINVAL),
            });
        }
        Ok(())
    }

    fn loop_device(&mut self, args: LoopArgs) -> StrataResult<u32> {
        self.calls.push(Call::Loop(args.image.clone(), args.info.offset));
        self.loops.push((args.image, args.info.offset));
        Ok(u32::try_from(self.loops.len() - 1).unwrap_or(u32::MAX))
    }

    fn set_hostname(&mut self, name: &str) -> StrataResult<()> {
        self.calls.push(Call::Hostname(name.to_string()));
        Ok(())
    }

    fn has_namespace(&mut self, _pid: i32, ns_type: NamespaceType) -> StrataResult<bool> {
        Ok(!self.shared_namespaces.contains(&ns_type))
    }

    fn set_fs_id(&mut self, uid: u32, gid: u32) -> StrataResult<()> {
        self.calls.push(Call::FsId(uid, gid));
        Ok(())
    }
}

/// Temporary host layout for one creation pass.
pub struct Fixture {
    pub temp: TempDir,
    pub paths: StrataPaths,
    /// Directory standing in for the image content.
    pub tree: PathBuf,
}

impl Fixture {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().unwrap();
        let paths = StrataPaths::with_root(temp.path());
        std::fs::create_dir_all(paths.session_dir()).unwrap();

        let tree = temp.path().join("tree");
        for dir in ["proc", "sys", "dev", "tmp", "var/tmp", "etc", "mnt/data", "bin"] {
            std::fs::create_dir_all(tree.join(dir)).unwrap();
        }
        std::fs::write(tree.join("etc/passwd"), "root:x:0:0:root:/root:/bin/sh\n").unwrap();
        std::fs::write(tree.join("etc/group"), "root:x:0:\n").unwrap();
        std::fs::write(tree.join("etc/hosts"), "127.0.0.1 localhost\n").unwrap();

        Self { temp, paths, tree }
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.temp.path().join(rel)
    }

    /// An image file whose content is the fixture tree.
    pub fn image_file(&self, name: &str, len: usize) -> PathBuf {
        let path = self.path(name);
        std::fs::write(&path, vec![0u8; len]).unwrap();
        path
    }

    pub fn ops(&self) -> RecordingOps {
        RecordingOps::new(&self.paths.session_dir())
    }

    pub fn build(
        &self,
        ops: RecordingOps,
        engine: EngineConfig,
        config: FileConfig,
        probe: HostProbe,
    ) -> Container<RecordingOps> {
        Container::new(ops, engine, config, alice(self.temp.path()), self.paths.clone(), probe)
            .unwrap()
    }
}

/// An unprivileged caller.
pub fn alice(root: &Path) -> Identity {
    Identity {
        uid: 1000,
        gid: 1000,
        name: "alice".to_string(),
        home: root.join("home/alice"),
        shell: "/bin/sh".to_string(),
        gecos: "Alice".to_string(),
        groups: vec![Group {
            gid: 1000,
            name: "alice".to_string(),
        }],
    }
}

/// Admin configuration keeping host-dependent sources out of the pass.
pub fn quiet_config() -> FileConfig {
    FileConfig {
        bind_path: Vec::new(),
        config_resolv_conf: false,
        enable_underlay: false,
        mount_tmp: false,
        ..FileConfig::default()
    }
}

pub fn engine(image: Image) -> EngineConfig {
    EngineConfig {
        images: vec![image],
        no_home: true,
        cwd: Some(PathBuf::from("/")),
        ..EngineConfig::default()
    }
}

pub const NO_OVERLAY: HostProbe = HostProbe {
    overlay_supported: false,
    in_userns: false,
};

pub const OVERLAY: HostProbe = HostProbe {
    overlay_supported: true,
    in_userns: false,
};
