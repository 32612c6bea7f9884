//! Broker error taxonomy.
//!
//! Every request handled by the broker resolves to `Result<_, BrokerError>`.
//! Registry-level failures (`Busy`, `InvalidHandle`, `Unsupported`) are
//! produced locally; adapter failures arrive here through the `io::Error`
//! and `nix::Error` conversions, which classify errno values.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error types for broker operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// Resource is absent from the board capability table.
    #[error("Resource not supported by this board")]
    Unsupported,

    /// Resource is already held by another handle.
    #[error("Resource busy")]
    Busy,

    /// Handle is unknown or not owned by the caller.
    ///
    /// Both cases deliberately share this variant.
    #[error("Invalid handle")]
    InvalidHandle,

    /// Policy check refused the caller.
    #[error("Permission denied")]
    PermissionDenied,

    /// Allocation failure in the registry or in a device buffer.
    #[error("Out of memory")]
    OutOfMemory,

    /// Underlying device call failed (non-retryable).
    #[error("I/O error: {0}")]
    Io(String),

    /// Underlying device call failed with a transient condition.
    #[error("Resource temporarily unavailable, try again")]
    TryAgain,

    /// Internal invariant violation.
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl BrokerError {
    /// Map an errno value onto the taxonomy.
    pub fn from_errno(errno: nix::errno::Errno) -> Self {
        use nix::errno::Errno;
        match errno {
            Errno::EAGAIN | Errno::EINTR => Self::TryAgain,
            Errno::ENOMEM => Self::OutOfMemory,
            other => Self::Io(other.desc().to_string()),
        }
    }

    /// Wire status for this error.
    pub fn status(&self) -> Status {
        match self {
            Self::Unsupported => Status::Unsupported,
            Self::Busy => Status::Busy,
            Self::InvalidHandle => Status::InvalidHandle,
            Self::PermissionDenied => Status::PermissionDenied,
            Self::OutOfMemory => Status::OutOfMemory,
            Self::Io(_) => Status::IoError,
            Self::TryAgain => Status::TryAgain,
            Self::Unknown(_) => Status::Unknown,
        }
    }
}

impl From<std::io::Error> for BrokerError {
    fn from(err: std::io::Error) -> Self {
        match err.raw_os_error() {
            Some(code) => Self::from_errno(nix::errno::Errno::from_raw(code)),
            None => match err.kind() {
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted => Self::TryAgain,
                std::io::ErrorKind::OutOfMemory => Self::OutOfMemory,
                _ => Self::Io(err.to_string()),
            },
        }
    }
}

impl From<nix::Error> for BrokerError {
    fn from(err: nix::Error) -> Self {
        Self::from_errno(err)
    }
}

/// Wire-level status code carried in every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Ok,
    Unsupported,
    Busy,
    InvalidHandle,
    PermissionDenied,
    OutOfMemory,
    IoError,
    TryAgain,
    Unknown,
}

/// Convenience alias used throughout the broker.
pub type BrokerResult<T> = Result<T, BrokerError>;
