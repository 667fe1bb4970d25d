//! Instance records.
//!
//! A running instance is described by a JSON record under
//! `<runtime>/instances/<user>/<hostname>/<name>.json` (mode 0600) holding its
//! process ids and the base64 encoded engine configuration it was started
//! with.

mod join;
mod store;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use strata_common::{StrataError, StrataResult};

use crate::config::EngineConfig;

pub use join::{
    JoinWorkflow, ProcDir, ProcFs, ProcessInfo, ProcessTable, prepare_join, validate_join,
};
pub use store::InstanceStore;

/// A running instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// PID of the container process.
    pub pid: i32,
    /// PID of its parent (the starter).
    pub ppid: i32,
    /// Instance name.
    pub name: String,
    /// Owner of the instance.
    pub user: String,
    /// Image the instance runs.
    pub image: String,
    /// Base64 encoded JSON engine configuration.
    pub config: String,
    /// Whether the instance runs in a user namespace.
    pub userns: bool,
}

impl InstanceRecord {
    /// Describe an instance started from `engine`.
    pub fn new(
        name: impl Into<String>,
        user: impl Into<String>,
        pid: i32,
        ppid: i32,
        engine: &EngineConfig,
        userns: bool,
    ) -> StrataResult<Self> {
        let json = serde_json::to_vec(engine)?;
        Ok(Self {
            pid,
            ppid,
            name: name.into(),
            user: user.into(),
            image: engine.image.clone(),
            config: STANDARD.encode(json),
            userns,
        })
    }

    /// Decode the stored engine configuration.
    pub fn engine_config(&self) -> StrataResult<EngineConfig> {
        let json = STANDARD.decode(&self.config).map_err(|e| {
            StrataError::instance(format!("instance {}: corrupt configuration: {e}", self.name))
        })?;
        Ok(serde_json::from_slice(&json)?)
    }
}

/// Instance names are used as file names.
pub fn validate_name(name: &str) -> StrataResult<()> {
    let valid = !name.is_empty()
        && name.len() <= 128
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !name.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(StrataError::config(format!("invalid instance name {name:?}")))
    }
}
