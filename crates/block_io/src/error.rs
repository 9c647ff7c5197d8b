//! Error types for block-file I/O.
//!
//! Every failure a [`TransferRequest`](crate::TransferRequest) or an
//! administrative job can observe is a [`BlockError`]. The type is `Clone`
//! because one device failure is recorded on every request that shared the
//! failing batch.

use std::io;

/// Result type for block-file operations.
pub type BlockResult<T> = Result<T, BlockError>;

/// Errors surfaced by the block-file engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlockError {
    /// An offset, length or buffer address is not a multiple of the block size.
    #[error("misaligned I/O: offsets, lengths and buffers must be block aligned")]
    MisalignedIo,

    /// The file was opened read-only and the operation would modify it.
    #[error("access denied: file is read-only")]
    AccessDenied,

    /// A parameter was rejected, or the extent table does not cover an offset.
    #[error("invalid parameter")]
    InvalidParameter,

    /// A fixed-size resource could not be allocated.
    #[error("insufficient resources")]
    InsufficientResources,

    /// The request was cancelled while it was still queued.
    #[error("operation cancelled")]
    Cancelled,

    /// Storage has been disabled by the engine-wide fault switch.
    #[error("no such device")]
    NoSuchDevice,

    /// The operation is not supported for this file.
    #[error("operation not supported")]
    Unsupported,

    /// The device completed a submission without transferring any bytes.
    #[error("device made no progress on a transfer")]
    ShortTransfer,

    /// Invalid engine configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Failure reported by the storage primitive.
    #[error("device error ({kind:?}): {message}")]
    Device {
        /// Kind of the underlying I/O error.
        kind: io::ErrorKind,
        /// Rendered message of the underlying I/O error.
        message: String,
    },
}

impl BlockError {
    /// Converts an I/O error reported by the storage primitive.
    pub fn from_io(error: &io::Error) -> Self {
        Self::Device {
            kind: error.kind(),
            message: error.to_string(),
        }
    }

    /// Returns `true` for errors detected before a request is queued.
    #[must_use]
    pub const fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::MisalignedIo | Self::AccessDenied | Self::InvalidParameter
        )
    }
}

impl From<io::Error> for BlockError {
    fn from(error: io::Error) -> Self {
        Self::from_io(&error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_error_keeps_kind_and_message() {
        let error = BlockError::from(io::Error::new(io::ErrorKind::BrokenPipe, "pipe gone"));
        match &error {
            BlockError::Device { kind, message } => {
                assert_eq!(*kind, io::ErrorKind::BrokenPipe);
                assert_eq!(message, "pipe gone");
            }
            other => panic!("unexpected variant {other:?}"),
        }
        assert!(format!("{error}").contains("pipe gone"));
    }

    #[test]
    fn caller_errors_are_classified() {
        assert!(BlockError::MisalignedIo.is_caller_error());
        assert!(BlockError::AccessDenied.is_caller_error());
        assert!(!BlockError::Cancelled.is_caller_error());
        assert!(!BlockError::NoSuchDevice.is_caller_error());
    }

    #[test]
    fn invalid_config_display() {
        let error = BlockError::InvalidConfig("queue depth must be positive".into());
        assert!(format!("{error}").contains("queue depth"));
    }
}
