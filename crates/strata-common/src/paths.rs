//! Standard filesystem paths for Strata.

use std::path::PathBuf;

use once_cell::sync::Lazy;

/// Default directory for persistent engine data.
pub static STRATA_STATE_DIR: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("STRATA_STATE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/strata"))
});

/// Default directory for admin configuration.
pub static STRATA_SYSCONF_DIR: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("STRATA_SYSCONF_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/etc/strata"))
});

/// Default runtime directory (instance records).
pub static STRATA_RUNTIME_DIR: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("STRATA_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/run/strata"))
});

/// Directory inside the container holding the action scripts.
pub const ACTIONS_DIR: &str = "/.singularity.d/actions";

/// Directory inside the container holding the environment scripts.
pub const CONTAINER_META_DIR: &str = "/.singularity.d";

/// Standard paths used by the engine.
#[derive(Debug, Clone)]
pub struct StrataPaths {
    /// Persistent data directory (default: /var/lib/strata).
    pub state: PathBuf,
    /// Admin configuration directory (default: /etc/strata).
    pub sysconf: PathBuf,
    /// Runtime directory (default: /run/strata).
    pub runtime: PathBuf,
}

impl StrataPaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths rooted under a single directory (used by tests).
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            state: root.join("state"),
            sysconf: root.join("etc"),
            runtime: root.join("run"),
        }
    }

    /// Mount point of the session directory.
    #[must_use]
    pub fn session_dir(&self) -> PathBuf {
        self.state.join("mnt").join("session")
    }

    /// Admin configuration file.
    #[must_use]
    pub fn config_file(&self) -> PathBuf {
        self.sysconf.join("strata.toml")
    }

    /// Capability policy file.
    #[must_use]
    pub fn capability_file(&self) -> PathBuf {
        self.sysconf.join("capability.json")
    }

    /// Host-side copy of the action scripts bound read-only into containers.
    #[must_use]
    pub fn actions_dir(&self) -> PathBuf {
        self.sysconf.join("actions")
    }

    /// Base directory for instance records.
    #[must_use]
    pub fn instances(&self) -> PathBuf {
        self.runtime.join("instances")
    }

    /// Directory holding the records of one user on one host.
    #[must_use]
    pub fn instance_dir(&self, user: &str, hostname: &str) -> PathBuf {
        self.instances().join(user).join(hostname)
    }
}

impl Default for StrataPaths {
    fn default() -> Self {
        Self {
            state: STRATA_STATE_DIR.clone(),
            sysconf: STRATA_SYSCONF_DIR.clone(),
            runtime: STRATA_RUNTIME_DIR.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_root() {
        let paths = StrataPaths::with_root("/tmp/strata-test");
        assert_eq!(
            paths.session_dir(),
            PathBuf::from("/tmp/strata-test/state/mnt/session")
        );
        assert_eq!(
            paths.capability_file(),
            PathBuf::from("/tmp/strata-test/etc/capability.json")
        );
    }

    #[test]
    fn instance_dir_is_per_user_and_host() {
        let paths = StrataPaths::with_root("/r");
        assert_eq!(
            paths.instance_dir("alice", "node1"),
            PathBuf::from("/r/run/instances/alice/node1")
        );
    }
}
