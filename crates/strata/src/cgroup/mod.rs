//! Cgroup v2 resource limits.
//!
//! Limits come from the OCI `Linux.resources` of the container and are
//! written to the unified hierarchy before the container process runs.

mod manager;

pub use manager::CgroupManager;
