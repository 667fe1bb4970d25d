//! AppArmor exec profiles.

use std::path::Path;

use strata_common::{StrataError, StrataResult};

/// AppArmor profile applied to the container process on exec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppArmorProfile {
    /// Profile name.
    pub name: String,
}

impl AppArmorProfile {
    /// Reference a loaded profile by name.
    pub fn new(name: &str) -> StrataResult<Self> {
        if name.trim().is_empty() {
            return Err(StrataError::Security {
                message: "empty AppArmor profile name".to_string(),
            });
        }
        Ok(Self {
            name: name.trim().to_string(),
        })
    }

    /// Check if AppArmor is enabled on the system.
    #[must_use]
    pub fn is_enabled() -> bool {
        Path::new("/sys/module/apparmor").exists()
            && Path::new("/sys/kernel/security/apparmor").exists()
    }

    /// Confine the next exec of the calling thread. A host without AppArmor
    /// only gets a warning.
    pub fn apply(&self) -> StrataResult<()> {
        if !Self::is_enabled() {
            tracing::warn!(profile = %self.name, "AppArmor is not enabled on the host, ignoring profile");
            return Ok(());
        }
        if self.name == "unconfined" {
            tracing::debug!("Skipping unconfined AppArmor profile");
            return Ok(());
        }

        let exec_path = if Path::new("/proc/self/attr/apparmor/exec").exists() {
            "/proc/self/attr/apparmor/exec"
        } else {
            "/proc/self/attr/exec"
        };
        std::fs::write(exec_path, format!("exec {}", self.name)).map_err(|e| {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                StrataError::PermissionDenied {
                    operation: "apply AppArmor profile".to_string(),
                }
            } else {
                StrataError::Security {
                    message: format!("failed to apply AppArmor profile {}: {e}", self.name),
                }
            }
        })?;
        tracing::debug!(profile = %self.name, "AppArmor exec profile set");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_names() {
        assert_eq!(AppArmorProfile::new(" strata-default ").unwrap().name, "strata-default");
        assert!(AppArmorProfile::new("  ").is_err());
    }
}
