use std::{fmt, time::Duration};

use super::{StreamFlags, StreamIo, StreamKind};
use crate::{
    arena::{DeviceIndex, StreamIndex},
    backend::{CaptureSink, PlaybackSource},
    resample::ResampleMethod,
    sample::{FormatInfo, SampleSpec},
    volume::{ChannelMap, ChannelVolumes},
};

/// Everything needed to create a stream
pub struct NewStreamData {
    pub(crate) kind: StreamKind,
    pub(crate) name: String,
    pub(crate) device: Option<DeviceIndex>,
    pub(crate) spec: Option<SampleSpec>,
    pub(crate) map: Option<ChannelMap>,
    pub(crate) formats: Vec<FormatInfo>,
    pub(crate) volume: Option<ChannelVolumes>,
    pub(crate) volume_is_absolute: bool,
    pub(crate) volume_factor: Option<ChannelVolumes>,
    pub(crate) volume_factor_device: Option<ChannelVolumes>,
    pub(crate) muted: bool,
    pub(crate) save_volume: bool,
    pub(crate) save_muted: bool,
    pub(crate) save_device: bool,
    pub(crate) volume_writable: bool,
    pub(crate) flags: StreamFlags,
    pub(crate) resample_method: Option<ResampleMethod>,
    pub(crate) sync_base: Option<StreamIndex>,
    pub(crate) origin_device: Option<DeviceIndex>,
    pub(crate) direct_on_input: Option<StreamIndex>,
    pub(crate) requested_latency: Option<Duration>,
    pub(crate) io: StreamIo,
}

impl fmt::Debug for NewStreamData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewStreamData")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("device", &self.device)
            .field("spec", &self.spec)
            .field("formats", &self.formats)
            .field("volume", &self.volume)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

impl NewStreamData {
    fn new(kind: StreamKind, name: String, io: StreamIo) -> Self {
        Self {
            kind,
            name,
            device: None,
            spec: None,
            map: None,
            formats: Vec::new(),
            volume: None,
            volume_is_absolute: false,
            volume_factor: None,
            volume_factor_device: None,
            muted: false,
            save_volume: false,
            save_muted: false,
            save_device: false,
            volume_writable: true,
            flags: StreamFlags::empty(),
            resample_method: None,
            sync_base: None,
            origin_device: None,
            direct_on_input: None,
            requested_latency: None,
            io,
        }
    }

    /// Playback stream fed by `source`
    pub fn playback(name: impl Into<String>, source: impl PlaybackSource + 'static) -> Self {
        Self::new(StreamKind::Playback, name.into(), StreamIo::Playback(Box::new(source)))
    }

    /// Capture stream feeding `sink`
    pub fn capture(name: impl Into<String>, sink: impl CaptureSink + 'static) -> Self {
        Self::new(StreamKind::Capture, name.into(), StreamIo::Capture(Box::new(sink)))
    }

    /// Attach to `device` instead of the default device
    pub fn with_device(mut self, device: DeviceIndex) -> Self {
        self.device = Some(device);
        self
    }

    /// PCM sample spec of the stream
    pub fn with_sample_spec(mut self, spec: SampleSpec) -> Self {
        self.spec = Some(spec);
        self
    }

    /// Channel layout of the stream
    pub fn with_channel_map(mut self, map: ChannelMap) -> Self {
        self.map = Some(map);
        self
    }

    /// Acceptable formats in order of preference; the first one the device accepts wins
    pub fn with_formats(mut self, formats: Vec<FormatInfo>) -> Self {
        self.formats = formats;
        self
    }

    /// Initial volume, relative to the device under flat volume unless `absolute`
    pub fn with_volume(mut self, volume: ChannelVolumes, absolute: bool) -> Self {
        self.volume = Some(volume);
        self.volume_is_absolute = absolute;
        self
    }

    /// Extra attenuation in the stream's layout, not visible in the stream volume
    pub fn with_volume_factor(mut self, factor: ChannelVolumes) -> Self {
        self.volume_factor = Some(factor);
        self
    }

    /// Extra attenuation in the device's layout
    pub fn with_volume_factor_device(mut self, factor: ChannelVolumes) -> Self {
        self.volume_factor_device = Some(factor);
        self
    }

    /// Initial mute state
    pub fn with_muted(mut self, muted: bool) -> Self {
        self.muted = muted;
        self
    }

    /// Which of volume, mute and device should be remembered
    pub fn with_save(mut self, volume: bool, muted: bool, device: bool) -> Self {
        self.save_volume = volume;
        self.save_muted = muted;
        self.save_device = device;
        self
    }

    /// Whether clients may change the volume
    pub fn with_volume_writable(mut self, writable: bool) -> Self {
        self.volume_writable = writable;
        self
    }

    /// Behaviour flags
    pub fn with_flags(mut self, flags: StreamFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Conversion algorithm instead of the configured one
    pub fn with_resample_method(mut self, method: ResampleMethod) -> Self {
        self.resample_method = Some(method);
        self
    }

    /// Join the synchronization group of `base`
    pub fn synchronized_with(mut self, base: StreamIndex) -> Self {
        self.sync_base = Some(base);
        self
    }

    /// This stream carries the audio of filter device `device`
    pub fn with_origin_device(mut self, device: DeviceIndex) -> Self {
        self.origin_device = Some(device);
        self
    }

    /// Capture only what playback stream `input` renders
    pub fn direct_on_input(mut self, input: StreamIndex) -> Self {
        self.direct_on_input = Some(input);
        self
    }

    /// Latency the stream would like the device to run at
    pub fn with_requested_latency(mut self, latency: Duration) -> Self {
        self.requested_latency = Some(latency);
        self
    }
}
