//! Error types for the lifecycle engine.
//!
//! Every failure surfaced to a caller belongs to exactly one [`ErrorKind`].
//! The kind decides the process exit code the CLI reports:
//!
//! | Kind                   | Exit code |
//! |------------------------|-----------|
//! | engine-level failures  | 125       |
//! | command not executable | 126       |
//! | command not found      | 127       |

use std::path::PathBuf;

use crate::constants::{EXIT_CODE_ENGINE_ERROR, EXIT_CODE_NOT_EXECUTABLE, EXIT_CODE_NOT_FOUND};

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Unknown ID or name.
    NotFound,
    /// Duplicate name on create or clone.
    NameConflict,
    /// An ID prefix matches more than one entity.
    AmbiguousReference,
    /// Operation illegal for the current state.
    InvalidState,
    /// Unparsable or unsupported signal.
    InvalidSignal,
    /// Malformed specification (image, resources, names, filters).
    InvalidSpec,
    /// The OCI runtime or CRIU lacks a required capability.
    RuntimeUnsupported,
    /// A deadline expired.
    Timeout,
    /// The process supervisor reported a failure.
    Runtime,
    /// The storage layer reported a failure.
    Storage,
    /// Anything else.
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotFound => "not found",
            Self::NameConflict => "name conflict",
            Self::AmbiguousReference => "ambiguous reference",
            Self::InvalidState => "invalid state",
            Self::InvalidSignal => "invalid signal",
            Self::InvalidSpec => "invalid spec",
            Self::RuntimeUnsupported => "runtime unsupported",
            Self::Timeout => "timeout",
            Self::Runtime => "runtime error",
            Self::Storage => "storage error",
            Self::Internal => "internal error",
        };
        f.write_str(s)
    }
}

/// Errors produced by the lifecycle engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Lookup Errors
    // =========================================================================
    /// No container matches the reference.
    #[error("no such container: {0}")]
    ContainerNotFound(String),

    /// No pod matches the reference.
    #[error("no such pod: {0}")]
    PodNotFound(String),

    /// No image matches the reference.
    #[error("no such image: {0}")]
    ImageNotFound(String),

    /// An ID prefix matched several entities.
    #[error("reference '{reference}' is ambiguous: {matches} entities match")]
    AmbiguousReference { reference: String, matches: usize },

    /// Name already used by another container or pod.
    #[error("name '{0}' is already in use")]
    NameConflict(String),

    // =========================================================================
    // State Machine Errors
    // =========================================================================
    /// Operation is not legal in the entity's current state.
    #[error("{id} is in state '{state}', cannot {operation}")]
    InvalidState {
        id: String,
        state: String,
        operation: String,
    },

    /// Signal could not be parsed.
    #[error("invalid signal: {0}")]
    InvalidSignal(String),

    // =========================================================================
    // Specification Errors
    // =========================================================================
    /// Malformed container, pod, or filter specification.
    #[error("invalid spec: {0}")]
    InvalidSpec(String),

    /// Image reference is syntactically invalid.
    #[error("invalid image reference '{reference}': {reason}")]
    InvalidImageReference { reference: String, reason: String },

    // =========================================================================
    // Runtime Errors
    // =========================================================================
    /// Capability missing in the OCI runtime or CRIU.
    #[error("runtime '{runtime}' unsupported: {reason}")]
    RuntimeUnsupported { runtime: String, reason: String },

    /// Supervisor call failed.
    #[error("runtime {operation} failed for '{id}': {reason}")]
    RuntimeFailed {
        id: String,
        operation: String,
        reason: String,
    },

    /// The container command exists but cannot be executed.
    #[error("{command}: permission denied (container {id})")]
    CommandNotExecutable { id: String, command: String },

    /// The container command does not exist in the root filesystem.
    #[error("{command}: executable file not found (container {id})")]
    CommandNotFound { id: String, command: String },

    /// Operation not supported by this backend.
    #[error("operation not supported: {0}")]
    NotSupported(String),

    /// Operation timed out.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// Storage initialization failed.
    #[error("failed to initialize storage at {path}: {reason}")]
    StorageInitFailed { path: PathBuf, reason: String },

    /// Blob not found in storage.
    #[error("blob not found: {digest}")]
    BlobNotFound { digest: String },

    /// Storage write failed.
    #[error("storage failure: {0}")]
    Storage(String),

    /// Entity database failure.
    #[error("database error: {0}")]
    Database(String),

    /// Removal refused while the root filesystem is still mounted.
    #[error("container {id} has {count} active mount(s)")]
    MountBusy { id: String, count: u32 },

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Builds an [`Error::InvalidState`].
    pub fn invalid_state(
        id: impl Into<String>,
        state: impl std::fmt::Display,
        operation: impl Into<String>,
    ) -> Self {
        Self::InvalidState {
            id: id.into(),
            state: state.to_string(),
            operation: operation.into(),
        }
    }

    /// Builds an [`Error::RuntimeFailed`].
    pub fn runtime(
        id: impl Into<String>,
        operation: impl Into<String>,
        reason: impl std::fmt::Display,
    ) -> Self {
        Self::RuntimeFailed {
            id: id.into(),
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    /// Returns the taxonomy kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ContainerNotFound(_) | Self::PodNotFound(_) | Self::ImageNotFound(_) => {
                ErrorKind::NotFound
            }
            Self::AmbiguousReference { .. } => ErrorKind::AmbiguousReference,
            Self::NameConflict(_) => ErrorKind::NameConflict,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::InvalidSignal(_) => ErrorKind::InvalidSignal,
            Self::InvalidSpec(_) | Self::InvalidImageReference { .. } => ErrorKind::InvalidSpec,
            Self::RuntimeUnsupported { .. } | Self::NotSupported(_) => {
                ErrorKind::RuntimeUnsupported
            }
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::RuntimeFailed { .. }
            | Self::CommandNotExecutable { .. }
            | Self::CommandNotFound { .. } => ErrorKind::Runtime,
            Self::StorageInitFailed { .. }
            | Self::BlobNotFound { .. }
            | Self::Storage(_)
            | Self::Database(_)
            | Self::MountBusy { .. } => ErrorKind::Storage,
            Self::Io(_) | Self::Serialization(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Returns the CLI exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::CommandNotExecutable { .. } => EXIT_CODE_NOT_EXECUTABLE,
            Self::CommandNotFound { .. } => EXIT_CODE_NOT_FOUND,
            _ => EXIT_CODE_ENGINE_ERROR,
        }
    }

    /// Returns true if this error means the target does not exist.
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_exit_code() {
        let err = Error::ContainerNotFound("foobar".to_string());
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.exit_code(), 125);
        assert!(err.to_string().contains("foobar"));
    }

    #[test]
    fn test_command_exit_codes() {
        let not_exec = Error::CommandNotExecutable {
            id: "c1".to_string(),
            command: "/etc".to_string(),
        };
        let missing = Error::CommandNotFound {
            id: "c1".to_string(),
            command: "foobar".to_string(),
        };
        assert_eq!(not_exec.exit_code(), 126);
        assert_eq!(missing.exit_code(), 127);
    }

    #[test]
    fn test_invalid_state_message() {
        let err = Error::invalid_state("abc", "paused", "pause");
        assert_eq!(err.to_string(), "abc is in state 'paused', cannot pause");
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }
}
