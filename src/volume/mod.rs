mod channel_map;
mod error;
mod types;

pub use channel_map::{ChannelMap, ChannelPosition};
pub use error::VolumeError;
pub use types::{ChannelVolumes, Volume};

/// Maximum number of channels a sample spec, channel map or volume vector may carry.
pub const CHANNELS_MAX: usize = 32;
