//! Common error types for the Strata engine.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`StrataError`].
pub type StrataResult<T> = Result<T, StrataError>;

/// Errors shared by every Strata crate.
#[derive(Error, Diagnostic, Debug)]
pub enum StrataError {
    /// A non-remount mount point already targets this destination.
    #[error("destination {destination} is already in the mount point list")]
    #[diagnostic(code(strata::mount::exists))]
    MountExists {
        /// The conflicting destination.
        destination: String,
    },

    /// A mount point could not be added or executed.
    #[error("unable to add {what} to mount list: {message}")]
    #[diagnostic(code(strata::mount::failed))]
    Mount {
        /// What was being mounted (e.g. "proc", "home directory").
        what: String,
        /// The underlying cause.
        message: String,
    },

    /// A privileged RPC call failed.
    #[error("rpc {method} failed: {message}")]
    #[diagnostic(code(strata::rpc))]
    Rpc {
        /// The RPC method name.
        method: String,
        /// The error reported by the server or transport.
        message: String,
        /// Raw OS error number reported by the server, if any.
        errno: Option<i32>,
    },

    /// No instance record matched the requested name.
    #[error("no instance found with name {name}")]
    #[diagnostic(
        code(strata::instance::not_found),
        help("List running instances and check the instance:// name")
    )]
    InstanceNotFound {
        /// The instance name.
        name: String,
    },

    /// An instance record failed validation while joining.
    #[error("instance validation failed: {message}")]
    #[diagnostic(code(strata::instance::invalid))]
    Instance {
        /// Why the instance was rejected.
        message: String,
    },

    /// The container has no script for the requested action.
    #[error("no {action} capability in container")]
    #[diagnostic(code(strata::exec::missing_action))]
    MissingAction {
        /// The action (exec, shell, run, start, test).
        action: String,
    },

    /// A security feature could not be prepared or applied.
    #[error("security error: {message}")]
    #[diagnostic(code(strata::security))]
    Security {
        /// The error message.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(strata::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(strata::serialization))]
    Serialization(String),

    /// Permission denied.
    #[error("Permission denied: {operation}")]
    #[diagnostic(code(strata::permission_denied))]
    PermissionDenied {
        /// The operation that was denied.
        operation: String,
    },

    /// Feature not supported on this platform or kernel.
    #[error("Feature not supported: {feature}")]
    #[diagnostic(code(strata::unsupported))]
    Unsupported {
        /// The unsupported feature.
        feature: String,
    },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(strata::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(
        code(strata::internal),
        help("This is a bug, please report it at https://github.com/fishmindlabs360/strata/issues")
    )]
    Internal {
        /// The error message.
        message: String,
    },
}

impl StrataError {
    /// Build a [`StrataError::Mount`] with context.
    pub fn mount(what: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        Self::Mount {
            what: what.into(),
            message: cause.to_string(),
        }
    }

    /// Build a [`StrataError::Config`].
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Build a [`StrataError::Instance`].
    pub fn instance(message: impl Into<String>) -> Self {
        Self::Instance {
            message: message.into(),
        }
    }

    /// Returns the OS errno carried by this error, if any.
    #[must_use]
    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::Io(e) => e.raw_os_error(),
            Self::Rpc { errno, .. } => *errno,
            _ => None,
        }
    }
}

impl From<serde_json::Error> for StrataError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_error_display() {
        let err = StrataError::mount("proc", "EPERM");
        assert_eq!(err.to_string(), "unable to add proc to mount list: EPERM");
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::from_raw_os_error(2);
        let err: StrataError = io_err.into();
        assert!(matches!(err, StrataError::Io(_)));
        assert_eq!(err.errno(), Some(2));
    }

    #[test]
    fn rpc_errno() {
        let err = StrataError::Rpc {
            method: "Chroot".to_string(),
            message: "Invalid argument".to_string(),
            errno: Some(22),
        };
        assert_eq!(err.errno(), Some(22));
        assert!(err.to_string().contains("Chroot"));
    }
}
