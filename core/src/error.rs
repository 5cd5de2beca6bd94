use std::io;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CapstanErr>;

/// Policy-level failures raised by capability objects. These are the errors
/// that code running inside the session observes as raised exceptions.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CapabilityError {
    /// The guard refused the operation outright.
    #[error("{0}")]
    Permission(String),

    #[error("'{capability}' has no method '{method}'. Available: {available}")]
    UnknownMethod {
        capability: String,
        method: String,
        available: String,
    },

    #[error("{0}")]
    InvalidArguments(String),

    /// A derivation asked for more than the parent grants.
    #[error("derivation would broaden the capability: {0}")]
    Broadened(String),

    #[error("this capability does not support derivation")]
    NotDerivable,

    /// Filesystem or process errors passed through unchanged.
    #[error("{0}")]
    Io(String),
}

impl CapabilityError {
    /// Error-type name surfaced to session code, in the interpreter's
    /// exception taxonomy.
    pub fn type_name(&self) -> &'static str {
        match self {
            CapabilityError::Permission(_) | CapabilityError::Broadened(_) => "PermissionError",
            CapabilityError::UnknownMethod { .. } | CapabilityError::NotDerivable => {
                "AttributeError"
            }
            CapabilityError::InvalidArguments(_) => "TypeError",
            CapabilityError::Io(_) => "OSError",
        }
    }
}

impl From<io::Error> for CapabilityError {
    fn from(err: io::Error) -> Self {
        CapabilityError::Io(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum CapstanErr {
    /// Malformed protocol line, unexpected response kind, or relay id
    /// mismatch on one of the wire protocols.
    #[error("protocol failure: {0}")]
    Protocol(String),

    /// The session worker terminated or closed its streams; operations fail
    /// fast until a reset replaces it.
    #[error("session worker is not running")]
    WorkerDied,

    #[error("backend '{0}' is not installed")]
    UnknownBackend(String),

    #[error("tool '{tool}' not found in '{backend}'. Available: {available}")]
    UnknownTool {
        backend: String,
        tool: String,
        available: String,
    },

    /// The backend reported a failure for a call.
    #[error("backend call failed: {0}")]
    Backend(String),

    #[error("timed out after {0:?} waiting for backend '{1}'")]
    BackendTimeout(Duration, String),

    #[error("no saved state named '{0}'")]
    StateNotFound(String),

    #[error("capability '{0}' not found or has no describe()")]
    CapabilityNotFound(String),

    #[error("invalid backend configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Capability(#[from] CapabilityError),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_errors_map_to_exception_types() {
        let denied = CapabilityError::Permission("outside allowed paths".to_string());
        assert_eq!(denied.type_name(), "PermissionError");

        let missing = CapabilityError::UnknownMethod {
            capability: "fs".to_string(),
            method: "chmod".to_string(),
            available: "read, write".to_string(),
        };
        assert_eq!(missing.type_name(), "AttributeError");
        assert_eq!(
            missing.to_string(),
            "'fs' has no method 'chmod'. Available: read, write"
        );
    }
}
