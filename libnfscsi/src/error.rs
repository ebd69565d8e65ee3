//! CSI error types.
//!
//! Every controller operation fails with a [`CsiError`].  Each variant maps to
//! exactly one protocol status code via [`CsiError::code`], so the hosting RPC
//! layer can translate errors without inspecting message strings.  Failures of
//! the mount primitive are reported as [`MountError`] and classified into a
//! [`CsiError`] through its `From` impl.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Protocol status codes a [`CsiError`] can map to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidArgument,
    PermissionDenied,
    AlreadyExists,
    Internal,
    Unimplemented,
    DeadlineExceeded,
    Cancelled,
}

/// Unified error type for CSI operations.
#[derive(Debug, Error, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum CsiError {
    /// The caller supplied a malformed or incomplete request.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The backend refused access (e.g. the export denied the mount).
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A volume with the same name but incompatible attributes exists.
    #[error("volume {0} already exists")]
    AlreadyExists(String),

    /// A filesystem or backend I/O failure.
    #[error("internal error: {0}")]
    Internal(String),

    /// The operation is not supported by this driver.
    #[error("unimplemented: {0}")]
    Unimplemented(String),

    /// A backend call did not finish within the configured timeout.
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// The caller cancelled the operation.
    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl CsiError {
    /// Status code this error is reported under.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Self::PermissionDenied(_) => ErrorCode::PermissionDenied,
            Self::AlreadyExists(_) => ErrorCode::AlreadyExists,
            Self::Internal(_) => ErrorCode::Internal,
            Self::Unimplemented(_) => ErrorCode::Unimplemented,
            Self::DeadlineExceeded(_) => ErrorCode::DeadlineExceeded,
            Self::Cancelled(_) => ErrorCode::Cancelled,
        }
    }

    /// Create a [`CsiError::InvalidArgument`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn invalid_argument<E: std::fmt::Display>(e: E) -> Self {
        Self::InvalidArgument(e.to_string())
    }

    /// Create a [`CsiError::Internal`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }
}

/// Classified failure of the backend mount primitive.
#[derive(Debug, Error)]
pub enum MountError {
    /// The backend or the kernel refused the operation.
    #[error("{0}")]
    PermissionDenied(String),

    /// The mount source, target or options were rejected as malformed.
    #[error("{0}")]
    InvalidArgument(String),

    /// Any other failure reported by the mount tooling.
    #[error("{0}")]
    Other(String),

    /// The mount tooling could not be executed at all.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<MountError> for CsiError {
    fn from(e: MountError) -> Self {
        match e {
            MountError::PermissionDenied(msg) => CsiError::PermissionDenied(msg),
            MountError::InvalidArgument(msg) => CsiError::InvalidArgument(msg),
            MountError::Io(io) if io.kind() == std::io::ErrorKind::PermissionDenied => {
                CsiError::PermissionDenied(io.to_string())
            }
            other => CsiError::Internal(other.to_string()),
        }
    }
}
