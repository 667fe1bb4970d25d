//! SELinux exec labels.

use std::fmt;
use std::path::Path;

use strata_common::{StrataError, StrataResult};

/// SELinux context applied to the container process on exec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SELinuxContext {
    /// User component.
    pub user: String,
    /// Role component.
    pub role: String,
    /// Type component.
    pub type_: String,
    /// Level component (optional).
    pub level: Option<String>,
}

impl SELinuxContext {
    /// Parse a `user:role:type[:level]` context.
    pub fn parse(context: &str) -> StrataResult<Self> {
        let parts: Vec<&str> = context.splitn(4, ':').collect();
        if parts.len() < 3 || parts[..3].iter().any(|p| p.is_empty()) {
            return Err(StrataError::Security {
                message: format!("invalid SELinux context: {context}"),
            });
        }
        Ok(Self {
            user: parts[0].to_string(),
            role: parts[1].to_string(),
            type_: parts[2].to_string(),
            level: parts.get(3).map(ToString::to_string),
        })
    }

    /// Check if SELinux is enabled.
    #[must_use]
    pub fn is_enabled() -> bool {
        Path::new("/sys/fs/selinux/enforce").exists()
    }

    /// Label the next exec of the calling thread. A host without SELinux only
    /// gets a warning.
    pub fn apply(&self) -> StrataResult<()> {
        if !Self::is_enabled() {
            tracing::warn!(context = %self, "SELinux is not enabled on the host, ignoring label");
            return Ok(());
        }
        std::fs::write("/proc/self/attr/exec", self.to_string()).map_err(|e| {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                StrataError::PermissionDenied {
                    operation: "apply SELinux context".to_string(),
                }
            } else {
                StrataError::Security {
                    message: format!("failed to set SELinux context: {e}"),
                }
            }
        })?;
        tracing::debug!(context = %self, "SELinux exec context set");
        Ok(())
    }
}

impl fmt::Display for SELinuxContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.user, self.role, self.type_)?;
        if let Some(level) = &self.level {
            write!(f, ":{level}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_parse_and_display() {
        let ctx = SELinuxContext::parse("system_u:system_r:container_t:s0:c1,c2").unwrap();
        assert_eq!(ctx.type_, "container_t");
        assert_eq!(ctx.level.as_deref(), Some("s0:c1,c2"));
        assert_eq!(ctx.to_string(), "system_u:system_r:container_t:s0:c1,c2");
    }

    #[test]
    fn context_rejects_short() {
        assert!(SELinuxContext::parse("unconfined_u:unconfined_r").is_err());
        assert!(SELinuxContext::parse("a::c").is_err());
    }
}
