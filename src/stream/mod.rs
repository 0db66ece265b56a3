//! Playback and capture streams as seen from the control context.

mod new_data;
pub(crate) mod thread;

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

pub use new_data::NewStreamData;
pub use thread::StreamIo;
pub(crate) use thread::StreamThreadInfo;

use crate::{
    arena::{DeviceIndex, StreamIndex},
    device::DeviceKind,
    resample::ResampleMethod,
    sample::{FormatInfo, SampleSpec},
    volume::{ChannelMap, ChannelVolumes},
};

/// Direction of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamKind {
    /// Feeds an output device
    Playback,
    /// Reads from an input device
    Capture,
}

impl StreamKind {
    /// Kind of device this stream attaches to
    pub fn device_kind(self) -> DeviceKind {
        match self {
            Self::Playback => DeviceKind::Output,
            Self::Capture => DeviceKind::Input,
        }
    }
}

/// Lifecycle state of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamState {
    /// Created, not yet put
    Init,
    /// Linked and flowing
    Running,
    /// Linked and paused
    Corked,
    /// Removed
    Unlinked,
}

impl StreamState {
    /// Whether the stream is visible to clients
    pub fn is_linked(self) -> bool {
        matches!(self, Self::Running | Self::Corked)
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => write!(f, "init"),
            Self::Running => write!(f, "running"),
            Self::Corked => write!(f, "corked"),
            Self::Unlinked => write!(f, "unlinked"),
        }
    }
}

bitflags! {
    /// Behaviour requested when the stream is created.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct StreamFlags: u32 {
        /// Input rate may change at runtime.
        const VARIABLE_RATE = 0x0001;
        /// Never move to another device.
        const DONT_MOVE = 0x0002;
        /// Start corked.
        const START_CORKED = 0x0004;
        /// Do not remap channels by position.
        const NO_REMAP = 0x0008;
        /// Do not up- or down-mix channels.
        const NO_REMIX = 0x0010;
        /// Take the sample format from the device.
        const FIX_FORMAT = 0x0020;
        /// Take the sample rate from the device.
        const FIX_RATE = 0x0040;
        /// Take the channel count and layout from the device.
        const FIX_CHANNELS = 0x0080;
        /// Refuse to attach to a suspended device.
        const NO_CREATE_ON_SUSPEND = 0x0100;
        /// Kill the stream when its device suspends.
        const KILL_ON_SUSPEND = 0x0200;
        /// Compressed data carried unmixed.
        const PASSTHROUGH = 0x0400;
    }
}

/// Synchronization group membership
///
/// The first stream of a group owns the member list; every other member
/// points back to it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) enum SyncGroup {
    #[default]
    None,
    Leader(Vec<StreamIndex>),
    Member(StreamIndex),
}

/// Control-side state of one stream
pub struct Stream {
    pub(crate) index: StreamIndex,
    pub(crate) kind: StreamKind,
    pub(crate) name: String,
    pub(crate) state: StreamState,
    pub(crate) flags: StreamFlags,
    pub(crate) device: Option<DeviceIndex>,
    pub(crate) origin_device: Option<DeviceIndex>,

    pub(crate) spec: SampleSpec,
    pub(crate) map: ChannelMap,
    pub(crate) format: FormatInfo,
    pub(crate) resample_method: ResampleMethod,
    pub(crate) resampler_output: Option<(SampleSpec, ChannelMap)>,

    pub(crate) volume: ChannelVolumes,
    pub(crate) reference_ratio: ChannelVolumes,
    pub(crate) real_ratio: ChannelVolumes,
    pub(crate) soft_volume: ChannelVolumes,
    pub(crate) volume_factor: ChannelVolumes,
    pub(crate) volume_factor_items: BTreeMap<String, ChannelVolumes>,
    pub(crate) volume_factor_device: ChannelVolumes,
    pub(crate) volume_factor_device_items: BTreeMap<String, ChannelVolumes>,
    pub(crate) muted: bool,
    pub(crate) volume_writable: bool,
    pub(crate) save_volume: bool,
    pub(crate) save_muted: bool,
    pub(crate) save_device: bool,

    pub(crate) sync: SyncGroup,
    pub(crate) direct_on_input: Option<StreamIndex>,
    pub(crate) direct_outputs: BTreeSet<StreamIndex>,
    pub(crate) requested_latency: Option<Duration>,
    pub(crate) drained: Arc<AtomicBool>,
    pub(crate) thread: Option<Box<StreamThreadInfo>>,
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("index", &self.index)
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("device", &self.device)
            .field("spec", &self.spec)
            .field("volume", &self.volume)
            .field("muted", &self.muted)
            .finish_non_exhaustive()
    }
}

impl Stream {
    /// Arena index
    pub fn index(&self) -> StreamIndex {
        self.index
    }

    /// Playback or capture
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Client-supplied name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lifecycle state
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Whether a running playback stream has nothing left to play
    pub fn is_drained(&self) -> bool {
        self.drained.load(Ordering::Acquire)
    }

    /// Creation flags
    pub fn flags(&self) -> StreamFlags {
        self.flags
    }

    /// Device the stream is attached to; `None` while moving
    pub fn device(&self) -> Option<DeviceIndex> {
        self.device
    }

    /// Filter device whose audio this stream carries
    pub fn origin_device(&self) -> Option<DeviceIndex> {
        self.origin_device
    }

    /// Sample spec of the stream's data
    pub fn sample_spec(&self) -> SampleSpec {
        self.spec
    }

    /// Channel layout of the stream's data
    pub fn channel_map(&self) -> &ChannelMap {
        &self.map
    }

    /// Negotiated format
    pub fn format(&self) -> &FormatInfo {
        &self.format
    }

    /// Whether the stream carries compressed data unmixed
    pub fn is_passthrough(&self) -> bool {
        self.format.is_passthrough() || self.flags.contains(StreamFlags::PASSTHROUGH)
    }

    /// Conversion algorithm
    pub fn resample_method(&self) -> ResampleMethod {
        self.resample_method
    }

    /// Whether data is converted on its way to or from the device
    pub fn has_resampler(&self) -> bool {
        self.resampler_output.is_some()
    }

    /// Volume as applied to the stream's audio
    pub fn volume(&self) -> &ChannelVolumes {
        &self.volume
    }

    /// Stream volume relative to the device reference volume
    pub fn reference_ratio(&self) -> &ChannelVolumes {
        &self.reference_ratio
    }

    /// Stream volume relative to the device real volume
    pub fn real_ratio(&self) -> &ChannelVolumes {
        &self.real_ratio
    }

    /// Volume applied in software by the device thread
    pub fn soft_volume(&self) -> &ChannelVolumes {
        &self.soft_volume
    }

    /// Product of all volume factors
    pub fn volume_factor(&self) -> &ChannelVolumes {
        &self.volume_factor
    }

    /// Product of all device-domain volume factors
    pub fn volume_factor_device(&self) -> &ChannelVolumes {
        &self.volume_factor_device
    }

    /// Mute state
    pub fn is_muted(&self) -> bool {
        self.muted
    }

    /// Whether clients may change the volume
    pub fn is_volume_writable(&self) -> bool {
        self.volume_writable
    }

    /// Whether the volume should be remembered
    pub fn save_volume(&self) -> bool {
        self.save_volume
    }

    /// Whether the mute state should be remembered
    pub fn save_muted(&self) -> bool {
        self.save_muted
    }

    /// Whether the device choice should be remembered
    pub fn save_device(&self) -> bool {
        self.save_device
    }

    /// Playback stream this capture stream taps
    pub fn direct_on_input(&self) -> Option<StreamIndex> {
        self.direct_on_input
    }

    /// Capture streams tapping this playback stream
    pub fn direct_outputs(&self) -> impl Iterator<Item = StreamIndex> + '_ {
        self.direct_outputs.iter().copied()
    }

    /// Latency last requested for this stream
    pub fn requested_latency(&self) -> Option<Duration> {
        self.requested_latency
    }

    /// First stream of the synchronization group, if any
    pub fn sync_leader(&self) -> Option<StreamIndex> {
        match &self.sync {
            SyncGroup::None => None,
            SyncGroup::Leader(_) => Some(self.index),
            SyncGroup::Member(leader) => Some(*leader),
        }
    }

    /// Whether the stream belongs to a synchronization group
    pub fn is_synchronized(&self) -> bool {
        match &self.sync {
            SyncGroup::None => false,
            SyncGroup::Leader(members) => !members.is_empty(),
            SyncGroup::Member(_) => true,
        }
    }

    pub(crate) fn channels(&self) -> usize {
        self.map.channels()
    }

    /// Recompute the volume factor products from their keyed items
    pub(crate) fn recompute_volume_factors(&mut self, device_channels: usize) {
        self.volume_factor = self
            .volume_factor_items
            .values()
            .fold(ChannelVolumes::norm(self.channels()), |acc, f| acc.multiply(f));
        self.volume_factor_device = self
            .volume_factor_device_items
            .values()
            .fold(ChannelVolumes::norm(device_channels), |acc, f| acc.multiply(f));
    }
}
