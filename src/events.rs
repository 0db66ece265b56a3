//! Notifications published by the core.

use crate::{
    arena::{DeviceIndex, StreamIndex},
    device::DeviceState,
    stream::{Stream, StreamState},
    volume::ChannelVolumes,
};

/// Change notification broadcast to subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum CoreEvent {
    /// A device was put and is now linked
    DeviceAdded(DeviceIndex),

    /// A device was unlinked
    DeviceRemoved(DeviceIndex),

    /// Device reference volume changed
    DeviceVolumeChanged {
        /// Device that changed volume
        device: DeviceIndex,
        /// New reference volume
        volume: ChannelVolumes,
    },

    /// Device mute state changed
    DeviceMuteChanged {
        /// Device that changed mute state
        device: DeviceIndex,
        /// New mute state
        muted: bool,
    },

    /// Device state changed
    DeviceStateChanged {
        /// Device that changed state
        device: DeviceIndex,
        /// New state
        state: DeviceState,
    },

    /// Active port changed
    DevicePortChanged {
        /// Device whose port changed
        device: DeviceIndex,
        /// Newly active port
        port: String,
    },

    /// Other device properties changed (sample rate, latency)
    DeviceChanged(DeviceIndex),

    /// A stream was put and is now linked
    StreamAdded(StreamIndex),

    /// A stream was unlinked
    StreamRemoved(StreamIndex),

    /// A stream was killed by the core (device gone, suspend, failed move)
    StreamKilled(StreamIndex),

    /// Stream volume changed
    StreamVolumeChanged {
        /// Stream that changed volume
        stream: StreamIndex,
        /// New user-visible volume
        volume: ChannelVolumes,
    },

    /// Stream mute state changed
    StreamMuteChanged {
        /// Stream that changed mute state
        stream: StreamIndex,
        /// New mute state
        muted: bool,
    },

    /// Stream corked or uncorked
    StreamStateChanged {
        /// Stream that changed state
        stream: StreamIndex,
        /// New state
        state: StreamState,
    },

    /// Other stream properties changed (sample rate, latency)
    StreamChanged(StreamIndex),

    /// A stream left its device to be moved
    StreamMoveStarted(StreamIndex),

    /// A stream arrived at its new device
    StreamMoveFinished {
        /// Stream that moved
        stream: StreamIndex,
        /// Device it now belongs to
        device: DeviceIndex,
    },

    /// A move could not complete
    StreamMoveFailed(StreamIndex),

    /// A passthrough stream cannot be carried by its destination
    FormatLost {
        /// Stream that lost its format
        stream: StreamIndex,
        /// Destination the client may reconnect to with another format
        device_name: String,
    },
}

/// Rescue hook consulted when a move fails.
///
/// Returning a device claims the stream: the core tries to finish the move
/// there instead of killing it.
pub type MoveFailHook = Box<dyn FnMut(&Stream) -> Option<DeviceIndex> + Send>;

/// Veto hook consulted by `may_move_to`; returning `false` refuses the destination.
pub type MayMoveHook = Box<dyn Fn(&Stream, DeviceIndex) -> bool + Send + Sync>;
