use std::result;

use thiserror::Error;

use crate::{arena::DeviceIndex, volume::VolumeError};

/// Errors returned by core operations.
///
/// Construction-time failures are fatal to the attempted operation and leave
/// nothing half-built behind. Mid-life volume, mute, rewind and latency
/// operations degrade instead of returning these.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Malformed sample spec, channel map or argument
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Malformed volume vector
    #[error("invalid volume: {0}")]
    InvalidVolume(#[from] VolumeError),

    /// Format or resampler negotiation failed, or a passthrough constraint was violated
    #[error("not supported: {0}")]
    NotSupported(String),

    /// The entity is not in a state that permits the operation
    #[error("bad state: {0}")]
    BadState(String),

    /// Passthrough exclusivity or a similar ownership conflict
    #[error("busy: {0}")]
    Busy(String),

    /// Unknown device, stream, port or format
    #[error("no such entity: {0}")]
    NoEntity(String),

    /// Attachment count limit reached
    #[error("too large: {0}")]
    TooLarge(String),

    /// The device does not provide the callback the operation needs
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// The device context stopped answering
    #[error("device thread for {0} is gone")]
    DeviceThreadGone(DeviceIndex),
}

/// A specialized `Result` type for core operations.
pub type Result<T> = result::Result<T, CoreError>;

/// Failure reported by a hardware control callback
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HardwareError {
    /// The hardware does not implement this control
    #[error("operation not implemented by hardware")]
    NotImplemented,

    /// The control exists but the access failed
    #[error("hardware access failed: {0}")]
    Failed(String),
}
