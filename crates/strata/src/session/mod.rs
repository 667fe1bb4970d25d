//! Session staging tree.
//!
//! A session is a private directory (normally a tmpfs mounted by the `Session`
//! tag) holding `rootfs/`, `final/` and whatever the layout and builder stage
//! on demand. Entries added before the session is created are materialized by
//! [`Session::create`]; later entries are written immediately.

mod layout;
pub mod overlay;
pub mod underlay;

use std::collections::VecDeque;
use std::ffi::OsString;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};

use strata_common::{StrataError, StrataResult};

pub use layout::{HostProbe, Layout, select_layout};

#[derive(Debug, Clone)]
enum Entry {
    Dir(PathBuf, u32),
    File(PathBuf, Vec<u8>),
    Symlink(PathBuf, PathBuf),
}

/// Private staging directory of one creation pass.
#[derive(Debug)]
pub struct Session {
    root: PathBuf,
    fstype: String,
    size_mib: Option<u64>,
    layout: Layout,
    pending: Vec<Entry>,
    created: bool,
}

/// Strip the root and any `..` from a path so it stays inside the session.
pub(crate) fn relative(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect()
}

/// Resolve `path` below `root`, following symbolic links as if `root` were `/`.
///
/// Absolute link targets restart from `root` and `..` never climbs above it,
/// so the result always stays inside `root`.
pub(crate) fn resolve_in_root(root: &Path, path: &Path) -> PathBuf {
    fn parts(path: &Path) -> VecDeque<OsString> {
        path.components()
            .filter_map(|c| match c {
                Component::Normal(name) => Some(name.to_os_string()),
                Component::ParentDir => Some(OsString::from("..")),
                _ => None,
            })
            .collect()
    }

    let mut resolved = PathBuf::new();
    let mut pending = parts(path);
    let mut links_left = 40;
    while let Some(part) = pending.pop_front() {
        if part == ".." {
            resolved.pop();
            continue;
        }
        let candidate = resolved.join(&part);
        let host = root.join(&candidate);
        let is_link = std::fs::symlink_metadata(&host).is_ok_and(|m| m.file_type().is_symlink());
        match std::fs::read_link(&host) {
            Ok(target) if is_link && links_left > 0 => {
                links_left -= 1;
                if target.is_absolute() {
                    resolved = PathBuf::new();
                }
                let mut next = parts(&target);
                next.append(&mut pending);
                pending = next;
            }
            _ => resolved = candidate,
        }
    }
    root.join(resolved)
}

impl Session {
    /// Describe a session rooted at `root`.
    pub fn new(
        root: impl Into<PathBuf>,
        fstype: impl Into<String>,
        size_mib: Option<u64>,
        layout: Layout,
    ) -> Self {
        let mut session = Self {
            root: root.into(),
            fstype: fstype.into(),
            size_mib,
            layout,
            pending: Vec::new(),
            created: false,
        };
        session.pending.push(Entry::Dir(PathBuf::from("rootfs"), 0o755));
        session.pending.push(Entry::Dir(PathBuf::from("final"), 0o755));
        session
    }

    /// Session directory on the host.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Where the container image is mounted.
    #[must_use]
    pub fn rootfs_path(&self) -> PathBuf {
        self.root.join("rootfs")
    }

    /// The assembled container root.
    #[must_use]
    pub fn final_path(&self) -> PathBuf {
        self.root.join("final")
    }

    /// Host path of a container path inside the final root.
    #[must_use]
    pub fn final_join(&self, container_path: &Path) -> PathBuf {
        self.final_path().join(relative(container_path))
    }

    /// Layering strategy fixed at creation.
    #[must_use]
    pub const fn layout(&self) -> Layout {
        self.layout
    }

    /// Filesystem backing the session.
    #[must_use]
    pub fn fstype(&self) -> &str {
        &self.fstype
    }

    /// Data options for the session filesystem mount.
    #[must_use]
    pub fn mount_options(&self) -> Vec<String> {
        let mut options = vec!["mode=1777".to_string()];
        if let Some(size) = self.size_mib {
            options.push(format!("size={size}m"));
        }
        options
    }

    /// Returns true once the tree exists on disk.
    #[must_use]
    pub const fn is_created(&self) -> bool {
        self.created
    }

    /// Add a directory; returns its host path.
    pub fn add_dir(&mut self, rel: impl AsRef<Path>) -> StrataResult<PathBuf> {
        self.add_dir_mode(rel, 0o755)
    }

    /// Add a directory with explicit permissions.
    pub fn add_dir_mode(&mut self, rel: impl AsRef<Path>, mode: u32) -> StrataResult<PathBuf> {
        let rel = relative(rel.as_ref());
        let path = self.root.join(&rel);
        self.push(Entry::Dir(rel, mode))?;
        Ok(path)
    }

    /// Add a file with its content; returns its host path.
    pub fn add_file(&mut self, rel: impl AsRef<Path>, content: impl Into<Vec<u8>>) -> StrataResult<PathBuf> {
        let rel = relative(rel.as_ref());
        let path = self.root.join(&rel);
        self.push(Entry::File(rel, content.into()))?;
        Ok(path)
    }

    /// Add a symbolic link; returns its host path.
    pub fn add_symlink(
        &mut self,
        rel: impl AsRef<Path>,
        target: impl Into<PathBuf>,
    ) -> StrataResult<PathBuf> {
        let rel = relative(rel.as_ref());
        let path = self.root.join(&rel);
        self.push(Entry::Symlink(rel, target.into()))?;
        Ok(path)
    }

    fn push(&mut self, entry: Entry) -> StrataResult<()> {
        if self.created {
            self.materialize(&entry)
        } else {
            self.pending.push(entry);
            Ok(())
        }
    }

    /// Write every pending entry below the session root.
    pub fn create(&mut self) -> StrataResult<()> {
        if !self.root.is_dir() {
            return Err(StrataError::mount(
                "session directory",
                format!("{} does not exist", self.root.display()),
            ));
        }
        for entry in std::mem::take(&mut self.pending) {
            self.materialize(&entry)?;
        }
        self.created = true;
        tracing::debug!(session = %self.root.display(), layout = self.layout.name(), "Session created");
        Ok(())
    }

    fn materialize(&self, entry: &Entry) -> StrataResult<()> {
        let wrap = |what: &Path, e: std::io::Error| {
            StrataError::mount(format!("session entry {}", what.display()), e)
        };
        match entry {
            Entry::Dir(rel, mode) => {
                let path = self.root.join(rel);
                if !path.is_dir() {
                    std::fs::DirBuilder::new()
                        .recursive(true)
                        .mode(*mode)
                        .create(&path)
                        .map_err(|e| wrap(rel, e))?;
                    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(*mode))
                        .map_err(|e| wrap(rel, e))?;
                }
            }
            Entry::File(rel, content) => {
                let path = self.root.join(rel);
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| wrap(rel, e))?;
                }
                std::fs::write(&path, content).map_err(|e| wrap(rel, e))?;
            }
            Entry::Symlink(rel, target) => {
                let path = self.root.join(rel);
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| wrap(rel, e))?;
                }
                if path.symlink_metadata().is_err() {
                    std::os::unix::fs::symlink(target, &path).map_err(|e| wrap(rel, e))?;
                }
            }
        }
        Ok(())
    }
}
