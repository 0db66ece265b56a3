//! Messages between the control context and a device thread.

use std::time::Duration;

use tokio::sync::mpsc;

use super::{DeviceState, LatencyRange};
use crate::{
    arena::{DeviceIndex, StreamIndex},
    channel::Reply,
    error::HardwareError,
    resample::Resampler,
    sample::SampleSpec,
    stream::{StreamState, StreamThreadInfo},
    volume::{ChannelMap, ChannelVolumes},
};

/// Software volume of one attached stream
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct StreamVolume {
    pub(crate) stream: StreamIndex,
    pub(crate) soft_volume: ChannelVolumes,
}

/// Volumes the device thread mirrors from the control context
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct VolumeSync {
    pub(crate) soft_volume: ChannelVolumes,
    pub(crate) real_volume: ChannelVolumes,
    pub(crate) streams: Vec<StreamVolume>,
}

/// Volumes read back from deferred hardware
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct HardwareVolume {
    pub(crate) real_volume: ChannelVolumes,
    pub(crate) soft_volume: ChannelVolumes,
}

/// Calls answered by a device thread
pub(crate) enum DeviceCall {
    /// The device was put
    Put {
        state: DeviceState,
        deferred_volume: bool,
        soft_volume: ChannelVolumes,
        real_volume: ChannelVolumes,
        muted: bool,
        reply: Reply<()>,
    },
    SetState {
        state: DeviceState,
        reply: Reply<()>,
    },
    AddStream {
        info: Box<StreamThreadInfo>,
        reply: Reply<()>,
    },
    /// Detach a stream; its thread state travels back to the caller
    RemoveStream {
        stream: StreamIndex,
        reply: Reply<Option<Box<StreamThreadInfo>>>,
    },
    /// Mirror device and stream soft volumes; deferred hardware is written
    /// here. Answers with the device soft volume now in effect.
    SyncVolumes {
        sync: VolumeSync,
        reply: Reply<ChannelVolumes>,
    },
    GetVolume {
        reply: Reply<Option<HardwareVolume>>,
    },
    SetMute {
        muted: bool,
        reply: Reply<()>,
    },
    GetMute {
        reply: Reply<Option<bool>>,
    },
    SetPort {
        port: String,
        reply: Reply<Result<(), HardwareError>>,
    },
    SetStreamState {
        streams: Vec<StreamIndex>,
        state: StreamState,
        reply: Reply<()>,
    },
    SetStreamVolume {
        stream: StreamIndex,
        soft_volume: ChannelVolumes,
        volume_factor_device: ChannelVolumes,
        reply: Reply<()>,
    },
    SetStreamMute {
        stream: StreamIndex,
        muted: bool,
        reply: Reply<()>,
    },
    ReplaceResampler {
        stream: StreamIndex,
        resampler: Option<Box<dyn Resampler>>,
        device_spec: SampleSpec,
        device_map: ChannelMap,
        reply: Reply<()>,
    },
    AttachDirectTap {
        stream: StreamIndex,
        capture: StreamIndex,
        tap: mpsc::UnboundedSender<Vec<u8>>,
        reply: Reply<()>,
    },
    DetachDirectTap {
        stream: StreamIndex,
        capture: StreamIndex,
        reply: Reply<()>,
    },
    SetLatencyRange {
        range: LatencyRange,
        reply: Reply<()>,
    },
    SetFixedLatency {
        latency: Duration,
        reply: Reply<()>,
    },
    SetLatencyOffset {
        offset: i64,
        reply: Reply<()>,
    },
    GetLatency {
        reply: Reply<Duration>,
    },
    GetRequestedLatency {
        reply: Reply<Option<Duration>>,
    },
    /// Answers with the stream's buffered latency and the device latency
    GetStreamLatency {
        stream: StreamIndex,
        reply: Reply<Option<(Duration, Duration)>>,
    },
    SetRequestedLatency {
        stream: StreamIndex,
        latency: Option<Duration>,
        reply: Reply<Option<Duration>>,
    },
}

/// One-way notices to a device thread
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum DeviceNotice {
    /// New input rate of a variable-rate stream
    SetStreamRate { stream: StreamIndex, rate: u32 },
    /// The hardware now runs at a new rate
    RateChanged(u32),
    Shutdown,
}

/// Unsolicited traffic from device threads to the control context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ControlNotice {
    /// Re-read hardware volume and mute
    UpdateVolumeAndMute(DeviceIndex),
}
