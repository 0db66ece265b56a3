use std::{fmt, sync::Arc, time::Duration};

use super::{DeviceKind, DevicePolicy, DevicePort, LatencyRange, SuspendCause};
use crate::{
    backend::{DeviceIo, HardwareControl, NullIo},
    sample::SampleSpec,
    volume::{ChannelMap, ChannelVolumes},
};

/// Everything needed to create a device
///
/// Unset fields take defaults when the device is created: the sample spec
/// falls back to the configured default rate, the channel map to the default
/// layout for the channel count, the volume to unity (not saved).
pub struct NewDeviceData {
    pub(crate) kind: DeviceKind,
    pub(crate) name: String,
    pub(crate) description: Option<String>,
    pub(crate) spec: Option<SampleSpec>,
    pub(crate) map: Option<ChannelMap>,
    pub(crate) alternate_rate: Option<u32>,
    pub(crate) volume: Option<ChannelVolumes>,
    pub(crate) muted: bool,
    pub(crate) save_volume: bool,
    pub(crate) save_muted: bool,
    pub(crate) ports: Vec<DevicePort>,
    pub(crate) active_port: Option<String>,
    pub(crate) hardware: Option<Arc<dyn HardwareControl>>,
    pub(crate) io: Box<dyn DeviceIo>,
    pub(crate) policy: DevicePolicy,
    pub(crate) dynamic_latency: bool,
    pub(crate) latency_range: Option<LatencyRange>,
    pub(crate) fixed_latency: Option<Duration>,
    pub(crate) suspend_cause: SuspendCause,
}

impl fmt::Debug for NewDeviceData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewDeviceData")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("spec", &self.spec)
            .field("map", &self.map)
            .field("volume", &self.volume)
            .field("policy", &self.policy)
            .field("hardware", &self.hardware.is_some())
            .finish_non_exhaustive()
    }
}

impl NewDeviceData {
    /// Device of `kind` named `name` with null I/O and no hardware controls
    pub fn new(kind: DeviceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            description: None,
            spec: None,
            map: None,
            alternate_rate: None,
            volume: None,
            muted: false,
            save_volume: false,
            save_muted: false,
            ports: Vec::new(),
            active_port: None,
            hardware: None,
            io: Box::new(NullIo::default()),
            policy: DevicePolicy::default(),
            dynamic_latency: false,
            latency_range: None,
            fixed_latency: None,
            suspend_cause: SuspendCause::empty(),
        }
    }

    /// Output device
    pub fn output(name: impl Into<String>) -> Self {
        Self::new(DeviceKind::Output, name)
    }

    /// Input device
    pub fn input(name: impl Into<String>) -> Self {
        Self::new(DeviceKind::Input, name)
    }

    /// Human readable name
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Sample spec the hardware runs at
    pub fn with_sample_spec(mut self, spec: SampleSpec) -> Self {
        self.spec = Some(spec);
        self
    }

    /// Channel layout
    pub fn with_channel_map(mut self, map: ChannelMap) -> Self {
        self.map = Some(map);
        self
    }

    /// Rate of the other rate family the hardware can switch to
    pub fn with_alternate_rate(mut self, rate: u32) -> Self {
        self.alternate_rate = Some(rate);
        self
    }

    /// Initial volume; `save` marks it as worth remembering
    pub fn with_volume(mut self, volume: ChannelVolumes, save: bool) -> Self {
        self.volume = Some(volume);
        self.save_volume = save;
        self
    }

    /// Initial mute state
    pub fn with_muted(mut self, muted: bool, save: bool) -> Self {
        self.muted = muted;
        self.save_muted = save;
        self
    }

    /// Selectable ports
    pub fn with_ports(mut self, ports: Vec<DevicePort>) -> Self {
        self.ports = ports;
        self
    }

    /// Port to activate instead of the highest-priority one
    pub fn with_active_port(mut self, port: impl Into<String>) -> Self {
        self.active_port = Some(port.into());
        self
    }

    /// Hardware mixer controls
    pub fn with_hardware(mut self, hardware: Arc<dyn HardwareControl>) -> Self {
        self.hardware = Some(hardware);
        self
    }

    /// Audio I/O driven by the device thread
    pub fn with_io(mut self, io: impl DeviceIo + 'static) -> Self {
        self.io = Box::new(io);
        self
    }

    /// Policy flags
    pub fn with_policy(mut self, policy: DevicePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Filter device mirroring the volume of its master
    pub fn sharing_volume_with_master(mut self) -> Self {
        self.policy.share_volume_with_master = true;
        self
    }

    /// Latency adjustable within `range`
    pub fn with_dynamic_latency(mut self, range: LatencyRange) -> Self {
        self.dynamic_latency = true;
        self.latency_range = Some(range);
        self
    }

    /// Latency reported when latency is not dynamic
    pub fn with_fixed_latency(mut self, latency: Duration) -> Self {
        self.fixed_latency = Some(latency);
        self
    }

    /// Start suspended for `cause`
    pub fn suspended(mut self, cause: SuspendCause) -> Self {
        self.suspend_cause = cause;
        self
    }
}
