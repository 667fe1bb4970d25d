//! Instance record persistence.

use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use strata_common::{StrataError, StrataPaths, StrataResult};

use super::{InstanceRecord, validate_name};

/// Records of one user on one host.
#[derive(Debug)]
pub struct InstanceStore {
    dir: PathBuf,
}

impl InstanceStore {
    /// Store rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store of `user` on the current host.
    pub fn for_user(paths: &StrataPaths, user: &str) -> Self {
        let uname = rustix::system::uname();
        let hostname = uname.nodename().to_string_lossy();
        Self::new(paths.instance_dir(user, &hostname))
    }

    /// Directory holding the records.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the record of `name`.
    #[must_use]
    pub fn record_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    /// Save a record, replacing any previous one of the same name.
    pub fn save(&self, record: &InstanceRecord) -> StrataResult<()> {
        validate_name(&record.name)?;
        std::fs::create_dir_all(&self.dir)?;
        let path = self.record_path(&record.name);
        let json = serde_json::to_string_pretty(record)?;

        let tmp = self.dir.join(format!(".{}.json.tmp", record.name));
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&tmp)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        std::fs::rename(&tmp, &path)?;

        tracing::debug!(instance = %record.name, pid = record.pid, path = %path.display(), "Saved instance record");
        Ok(())
    }

    /// Load the record of `name`.
    pub fn load(&self, name: &str) -> StrataResult<InstanceRecord> {
        validate_name(name)?;
        let path = self.record_path(name);
        let json = match std::fs::read_to_string(&path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StrataError::InstanceNotFound {
                    name: name.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        let record: InstanceRecord = serde_json::from_str(&json)?;
        tracing::debug!(instance = %name, path = %path.display(), "Loaded instance record");
        Ok(record)
    }

    /// Delete the record of `name`; a missing record is not an error.
    pub fn delete(&self, name: &str) -> StrataResult<()> {
        validate_name(name)?;
        match std::fs::remove_file(self.record_path(name)) {
            Ok(()) => {
                tracing::debug!(instance = %name, "Deleted instance record");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Names of every stored instance, sorted.
    pub fn list(&self) -> StrataResult<Vec<String>> {
        let mut names = Vec::new();
        if !self.dir.exists() {
            return Ok(names);
        }
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Some(name) = path.file_stem().and_then(|s| s.to_str()) {
                    if !name.starts_with('.') {
                        names.push(name.to_string());
                    }
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Check if a record exists.
    #[must_use]
    pub fn exists(&self, name: &str) -> bool {
        self.record_path(name).exists()
    }

    /// Remove records whose parent process is gone. Returns the removed names.
    pub fn cleanup_stale(&self) -> StrataResult<Vec<String>> {
        self.cleanup_stale_with(|pid| Path::new("/proc").join(pid.to_string()).exists())
    }

    /// [`Self::cleanup_stale`] with a custom liveness check.
    pub fn cleanup_stale_with(&self, alive: impl Fn(i32) -> bool) -> StrataResult<Vec<String>> {
        let mut removed = Vec::new();
        for name in self.list()? {
            let record = match self.load(&name) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(instance = %name, error = %e, "unreadable instance record");
                    continue;
                }
            };
            if !alive(record.ppid) {
                tracing::info!(instance = %name, ppid = record.ppid, "Removing stale instance record");
                self.delete(&name)?;
                removed.push(name);
            }
        }
        Ok(removed)
    }
}
