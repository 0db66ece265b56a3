/// Errors raised while building or combining channel volume vectors
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum VolumeError {
    /// A channel carries a value above [`Volume::MAX`](super::Volume::MAX)
    #[error("invalid volume {volume:#x} on channel {channel}")]
    InvalidVolume {
        /// Channel that carried the value
        channel: usize,
        /// Raw fixed-point value
        volume: u32,
    },

    /// Channel index out of range
    #[error("invalid channel {channel}")]
    InvalidChannel {
        /// Requested channel index
        channel: usize,
    },

    /// Channel count is zero or above [`CHANNELS_MAX`](super::CHANNELS_MAX)
    #[error("invalid channel count {channels}")]
    InvalidChannelCount {
        /// Offending channel count
        channels: usize,
    },

    /// Two vectors or a vector and a map disagree on channel count
    #[error("channel count mismatch: expected {expected}, got {actual}")]
    ChannelMismatch {
        /// Channels the operation needed
        expected: usize,
        /// Channels that were supplied
        actual: usize,
    },
}
