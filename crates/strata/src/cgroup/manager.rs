//! Cgroup manager implementation.

use std::path::{Path, PathBuf};

use strata_common::{StrataError, StrataResult};
use strata_oci::runtime::{CpuResources, MemoryResources, PidsResources, Resources};

/// Default cgroup root path.
const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Default CFS period in microseconds.
const DEFAULT_CPU_PERIOD: u64 = 100_000;

/// Manages the cgroup of a container.
#[derive(Debug)]
pub struct CgroupManager {
    /// Cgroup path.
    path: PathBuf,
}

fn limit(value: i64) -> String {
    if value < 0 {
        "max".to_string()
    } else {
        value.to_string()
    }
}

/// cgroup v1 cpu shares (2..262144) to a v2 weight (1..10000).
#[must_use]
pub const fn shares_to_weight(shares: u64) -> u64 {
    if shares == 0 {
        return 100;
    }
    let shares = if shares < 2 {
        2
    } else if shares > 262_144 {
        262_144
    } else {
        shares
    };
    1 + ((shares - 2) * 9999) / 262_142
}

impl CgroupManager {
    /// Cgroup at `path` under the host hierarchy.
    pub fn new(path: &str) -> StrataResult<Self> {
        Self::with_root(Path::new(CGROUP_ROOT), path)
    }

    /// Cgroup at `path` under the hierarchy mounted at `root`.
    pub fn with_root(root: &Path, path: &str) -> StrataResult<Self> {
        let relative = Path::new(path.trim_start_matches('/'));
        if relative.as_os_str().is_empty()
            || relative
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(StrataError::config(format!("invalid cgroups path {path:?}")));
        }
        Ok(Self {
            path: root.join(relative),
        })
    }

    /// Get the cgroup path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, file: &str, value: &str) -> StrataResult<()> {
        std::fs::write(self.path.join(file), value).map_err(|e| {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                StrataError::PermissionDenied {
                    operation: format!("write cgroup {file}"),
                }
            } else {
                StrataError::Io(e)
            }
        })?;
        tracing::debug!(file, value, "Set cgroup limit");
        Ok(())
    }

    /// Create the cgroup, write the limits and move `pid` into it.
    pub fn apply(&self, pid: i32, resources: &Resources) -> StrataResult<()> {
        tracing::debug!(path = %self.path.display(), pid, "Applying cgroup");
        std::fs::create_dir_all(&self.path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                StrataError::PermissionDenied {
                    operation: "create cgroup".to_string(),
                }
            } else {
                StrataError::Io(e)
            }
        })?;

        if let Some(cpu) = &resources.cpu {
            self.apply_cpu(cpu)?;
        }
        if let Some(memory) = &resources.memory {
            self.apply_memory(memory)?;
        }
        if let Some(pids) = &resources.pids {
            self.apply_pids(pids)?;
        }

        self.write("cgroup.procs", &pid.to_string())?;
        tracing::info!(path = %self.path.display(), pid, "Process added to cgroup");
        Ok(())
    }

    fn apply_cpu(&self, cpu: &CpuResources) -> StrataResult<()> {
        // cpu.max format: "$quota $period"
        if cpu.quota.is_some() || cpu.period.is_some() {
            let quota = cpu.quota.filter(|q| *q > 0).map_or_else(|| "max".to_string(), |q| q.to_string());
            let period = cpu.period.unwrap_or(DEFAULT_CPU_PERIOD);
            self.write("cpu.max", &format!("{quota} {period}"))?;
        }
        if let Some(shares) = cpu.shares {
            self.write("cpu.weight", &shares_to_weight(shares).to_string())?;
        }
        if let Some(cpus) = &cpu.cpus {
            self.write("cpuset.cpus", cpus)?;
        }
        Ok(())
    }

    fn apply_memory(&self, memory: &MemoryResources) -> StrataResult<()> {
        if let Some(max) = memory.limit {
            self.write("memory.max", &limit(max))?;
        }
        if let Some(low) = memory.reservation {
            self.write("memory.low", &limit(low))?;
        }
        // OCI swap is memory + swap, v2 only counts swap.
        if let Some(swap) = memory.swap {
            let value = match memory.limit {
                Some(max) if swap >= 0 && max >= 0 => (swap - max).max(0),
                _ => swap,
            };
            self.write("memory.swap.max", &limit(value))?;
        }
        Ok(())
    }

    fn apply_pids(&self, pids: &PidsResources) -> StrataResult<()> {
        let value = if pids.limit > 0 { pids.limit } else { -1 };
        self.write("pids.max", &limit(value))
    }

    /// Remove the cgroup once it is empty.
    pub fn delete(&self) -> StrataResult<()> {
        if self.path.exists() {
            std::fs::remove_dir(&self.path)?;
            tracing::debug!(path = %self.path.display(), "Deleted cgroup");
        }
        Ok(())
    }
}
