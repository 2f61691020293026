//! Error types for the attach, transfer, and control paths

use thiserror::Error;

/// Transfer-level errors reported by a device port.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortError {
    /// Device did not respond within the transfer timeout
    #[error("transfer timed out")]
    Timeout,

    /// Endpoint stalled
    #[error("endpoint stalled")]
    Pipe,

    /// Device has disconnected
    #[error("device is gone")]
    NoDevice,

    /// Device sent more data than the buffer could hold
    #[error("transfer overflow")]
    Overflow,

    /// Generic I/O failure reported by the host stack
    #[error("I/O error")]
    Io,

    /// Access to the device was denied
    #[error("access denied")]
    Access,

    /// Anything the host stack reports that has no dedicated variant
    #[error("port error: {0}")]
    Other(String),
}

/// Errors surfaced by the synchronous and control gateways.
///
/// Retry policy is the caller's decision: the gateways never retry a failed
/// transfer on their own.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// The session is detaching or destroyed. Never retried; the caller must
    /// reopen once a device is published again.
    #[error("device is gone")]
    DeviceMissing,

    /// The wait for the session lock was cancelled before any device access
    /// took place. Safe to retry immediately; no partial transfer occurred.
    #[error("interrupted while waiting for the session lock")]
    Interrupted,

    /// The device did not respond within the fixed transfer window.
    #[error("transfer timed out")]
    TransferTimeout,

    /// The device reported an error for this attempt.
    #[error("transfer failed: {0}")]
    TransferFailed(PortError),

    /// The control exchange completed but the reply was shorter than the
    /// command's fixed payload.
    #[error("short control reply: expected {expected} bytes, got {got}")]
    ShortControlReply { expected: usize, got: usize },

    /// Staging-buffer allocation failed. No lock was taken.
    #[error("out of resources")]
    OutOfResources,

    /// Unrecognized control command identifier. Distinguishable from a
    /// transfer failure; no device access took place.
    #[error("unsupported command {0:#04x}")]
    UnsupportedCommand(u8),
}

impl From<PortError> for SessionError {
    fn from(err: PortError) -> Self {
        match err {
            PortError::Timeout => SessionError::TransferTimeout,
            PortError::NoDevice => SessionError::DeviceMissing,
            other => SessionError::TransferFailed(other),
        }
    }
}

/// Errors that make an attach attempt fail.
///
/// Fatal to that attempt only; other sessions are unaffected and nothing is
/// published on these paths.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttachError {
    /// No bulk-in endpoint was advertised; the device is unusable.
    #[error("device has no bulk-in endpoint")]
    MissingBulkIn,

    /// No bulk-out endpoint was advertised; the device is unusable.
    #[error("device has no bulk-out endpoint")]
    MissingBulkOut,

    /// A transfer-buffer allocation failed during attach.
    #[error("buffer allocation failed")]
    OutOfResources,
}
