//! Output and input devices as seen from the control context.
//!
//! A [`Device`] holds the control-side view of a hardware device: volumes,
//! ports, suspend causes and the set of attached streams. Audio processing
//! happens on the device's own thread (see [`thread`]), which the control
//! context reaches through an [`AsyncChannel`].

mod messages;
mod new_data;
pub(crate) mod thread;
mod volume_change;

use std::{
    collections::BTreeSet,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

pub(crate) use messages::{
    ControlNotice, DeviceCall, DeviceNotice, HardwareVolume, StreamVolume, VolumeSync,
};
pub use new_data::NewDeviceData;
pub use volume_change::{VolumeChange, VolumeChangeScheduler};

use crate::{
    arena::{DeviceIndex, StreamIndex},
    backend::{HardwareControl, HardwareFeatures},
    channel::AsyncChannel,
    sample::SampleSpec,
    volume::{ChannelMap, ChannelVolumes, Volume},
};

/// Lowest latency a device may be configured for
pub const ABSOLUTE_MIN_LATENCY: Duration = Duration::from_micros(500);
/// Highest latency a device may be configured for
pub const ABSOLUTE_MAX_LATENCY: Duration = Duration::from_secs(10);
/// Latency of devices without dynamic latency
pub const DEFAULT_FIXED_LATENCY: Duration = Duration::from_millis(250);

/// Direction of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    /// Plays audio; carries playback streams
    Output,
    /// Records audio; carries capture streams
    Input,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Output => write!(f, "output"),
            Self::Input => write!(f, "input"),
        }
    }
}

/// Lifecycle state of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceState {
    /// Created, not yet put
    Init,
    /// Opened, nobody is using it
    Idle,
    /// Opened, at least one uncorked stream
    Running,
    /// Closed for at least one suspend cause
    Suspended,
    /// Removed
    Unlinked,
}

impl DeviceState {
    /// Whether the hardware is open
    pub fn is_opened(self) -> bool {
        matches!(self, Self::Idle | Self::Running)
    }

    /// Whether the device is visible to clients
    pub fn is_linked(self) -> bool {
        matches!(self, Self::Idle | Self::Running | Self::Suspended)
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => write!(f, "init"),
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Suspended => write!(f, "suspended"),
            Self::Unlinked => write!(f, "unlinked"),
        }
    }
}

bitflags! {
    /// Static capabilities, fixed when the device is created.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DeviceCapabilities: u32 {
        /// Volume is controlled in hardware.
        const HW_VOLUME_CTRL = 0x0001;
        /// Mute is controlled in hardware.
        const HW_MUTE_CTRL = 0x0002;
        /// Hardware volume steps are in decibels.
        const DECIBEL_VOLUME = 0x0004;
        /// Hardware volume writes can be timed.
        const DEFERRED_VOLUME = 0x0008;
        /// The device reports latency.
        const LATENCY = 0x0010;
        /// Latency can be reconfigured at runtime.
        const DYNAMIC_LATENCY = 0x0020;
        /// The device has switchable ports.
        const PORTS = 0x0040;
        /// The hardware sample rate can be switched.
        const RATE = 0x0080;
    }
}

impl DeviceCapabilities {
    pub(crate) fn from_hardware(features: HardwareFeatures, has_ports: bool, dynamic_latency: bool) -> Self {
        let mut caps = Self::LATENCY;
        caps.set(Self::HW_VOLUME_CTRL, features.contains(HardwareFeatures::VOLUME));
        caps.set(Self::HW_MUTE_CTRL, features.contains(HardwareFeatures::MUTE));
        caps.set(
            Self::DECIBEL_VOLUME,
            features.contains(HardwareFeatures::VOLUME | HardwareFeatures::DECIBEL_VOLUME),
        );
        caps.set(
            Self::DEFERRED_VOLUME,
            features.contains(HardwareFeatures::VOLUME | HardwareFeatures::DEFERRED_VOLUME),
        );
        caps.set(Self::PORTS, has_ports && features.contains(HardwareFeatures::PORTS));
        caps.set(Self::RATE, features.contains(HardwareFeatures::RATE));
        caps.set(Self::DYNAMIC_LATENCY, dynamic_latency);
        caps
    }
}

/// Policy chosen by whoever creates the device; adjustable until it is put
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevicePolicy {
    /// Filter device whose volume mirrors its master
    pub share_volume_with_master: bool,
    /// Allow flat volume when the configuration enables it
    pub flat_volume: bool,
    /// Allow deferred hardware volume when the hardware supports it
    pub deferred_volume: bool,
}

impl Default for DevicePolicy {
    fn default() -> Self {
        Self {
            share_volume_with_master: false,
            flat_volume: true,
            deferred_volume: true,
        }
    }
}

/// Flags derived from capabilities, policy and configuration at put time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceDerived {
    /// Device volume follows the loudest stream
    pub flat_volume: bool,
    /// Volume is on a decibel scale (hardware or software)
    pub decibel_volume: bool,
    /// Hardware volume writes are timed from the device context
    pub deferred_volume: bool,
}

bitflags! {
    /// Reasons a device is suspended. The device is suspended while any bit is set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SuspendCause: u32 {
        /// Requested by the user
        const USER = 0x0001;
        /// Requested by an application
        const APPLICATION = 0x0002;
        /// Nobody used the device for a while
        const IDLE = 0x0004;
        /// The login session lost access to the hardware
        const SESSION = 0x0008;
        /// A passthrough stream needs exclusive access
        const PASSTHROUGH = 0x0010;
        /// Internal reconfiguration
        const INTERNAL = 0x0020;
    }
}

/// Selectable routing of a device (e.g. speakers, headphones)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevicePort {
    /// Unique name within the device
    pub name: String,
    /// Human readable name
    pub description: String,
    /// Higher wins when no port is requested
    pub priority: u32,
    /// Whether something is plugged in
    pub available: bool,
    /// Latency correction in microseconds applied while this port is active
    pub latency_offset: i64,
}

impl DevicePort {
    /// Port with the given name and priority, available, without latency offset
    pub fn new(name: impl Into<String>, priority: u32) -> Self {
        let name = name.into();
        Self {
            description: name.clone(),
            name,
            priority,
            available: true,
            latency_offset: 0,
        }
    }
}

/// Bounds on the latency a device may be configured for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyRange {
    /// Lowest latency
    pub min: Duration,
    /// Highest latency
    pub max: Duration,
}

impl LatencyRange {
    /// Range clamped to the absolute bounds; `max` never drops below `min`
    pub fn new(min: Duration, max: Duration) -> Self {
        let min = min.clamp(ABSOLUTE_MIN_LATENCY, ABSOLUTE_MAX_LATENCY);
        let max = max.clamp(ABSOLUTE_MIN_LATENCY, ABSOLUTE_MAX_LATENCY).max(min);
        Self { min, max }
    }

    /// Clamp `latency` into the range
    pub fn clamp(&self, latency: Duration) -> Duration {
        latency.clamp(self.min, self.max)
    }
}

impl Default for LatencyRange {
    fn default() -> Self {
        Self {
            min: ABSOLUTE_MIN_LATENCY,
            max: ABSOLUTE_MAX_LATENCY,
        }
    }
}

/// Control-side state of one device
pub struct Device {
    pub(crate) index: DeviceIndex,
    pub(crate) kind: DeviceKind,
    pub(crate) name: String,
    pub(crate) description: Option<String>,
    pub(crate) state: DeviceState,
    pub(crate) capabilities: DeviceCapabilities,
    pub(crate) policy: DevicePolicy,
    pub(crate) derived: DeviceDerived,

    pub(crate) spec: SampleSpec,
    pub(crate) map: ChannelMap,
    pub(crate) default_rate: u32,
    pub(crate) alternate_rate: Option<u32>,

    pub(crate) streams: BTreeSet<StreamIndex>,
    pub(crate) n_corked: usize,

    pub(crate) reference_volume: ChannelVolumes,
    pub(crate) real_volume: ChannelVolumes,
    pub(crate) soft_volume: ChannelVolumes,
    pub(crate) base_volume: Volume,
    pub(crate) muted: bool,
    pub(crate) save_volume: bool,
    pub(crate) save_muted: bool,
    pub(crate) save_port: bool,
    pub(crate) refresh_volume: bool,
    pub(crate) refresh_muted: bool,
    pub(crate) saved_volume: Option<(ChannelVolumes, bool)>,

    pub(crate) suspend_cause: SuspendCause,
    pub(crate) mixer_dirty: Arc<AtomicBool>,

    pub(crate) ports: Vec<DevicePort>,
    pub(crate) active_port: Option<String>,
    pub(crate) latency_offset: i64,
    pub(crate) latency_range: LatencyRange,
    pub(crate) fixed_latency: Duration,

    pub(crate) master_stream: Option<StreamIndex>,
    pub(crate) hardware: Option<Arc<dyn HardwareControl>>,
    pub(crate) channel: AsyncChannel<DeviceCall, DeviceNotice>,
    pub(crate) thread: Option<JoinHandle<()>>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("index", &self.index)
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("spec", &self.spec)
            .field("reference_volume", &self.reference_volume)
            .field("real_volume", &self.real_volume)
            .field("muted", &self.muted)
            .field("streams", &self.streams)
            .finish_non_exhaustive()
    }
}

impl Device {
    /// Arena index
    pub fn index(&self) -> DeviceIndex {
        self.index
    }

    /// Output or input
    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    /// Unique name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Human readable name, if one was given
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Lifecycle state
    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Static capabilities
    pub fn capabilities(&self) -> DeviceCapabilities {
        self.capabilities
    }

    /// Policy flags
    pub fn policy(&self) -> DevicePolicy {
        self.policy
    }

    /// Flags derived when the device was put
    pub fn derived(&self) -> DeviceDerived {
        self.derived
    }

    /// Current sample spec
    pub fn sample_spec(&self) -> SampleSpec {
        self.spec
    }

    /// Channel layout
    pub fn channel_map(&self) -> &ChannelMap {
        &self.map
    }

    /// Rate used unless a stream asks for the alternate family
    pub fn default_rate(&self) -> u32 {
        self.default_rate
    }

    /// Rate of the other 44.1k/48k family, if the device can switch
    pub fn alternate_rate(&self) -> Option<u32> {
        self.alternate_rate
    }

    /// Attached streams
    pub fn streams(&self) -> impl Iterator<Item = StreamIndex> + '_ {
        self.streams.iter().copied()
    }

    /// Number of attached streams that are corked
    pub fn n_corked(&self) -> usize {
        self.n_corked
    }

    /// Streams keeping the device busy: attached minus corked
    pub fn used_by(&self) -> usize {
        self.streams.len().saturating_sub(self.n_corked)
    }

    /// User-visible volume
    pub fn reference_volume(&self) -> &ChannelVolumes {
        &self.reference_volume
    }

    /// Volume actually applied by hardware and software together
    pub fn real_volume(&self) -> &ChannelVolumes {
        &self.real_volume
    }

    /// Part of the real volume applied in software
    pub fn soft_volume(&self) -> &ChannelVolumes {
        &self.soft_volume
    }

    /// Hardware unity point
    pub fn base_volume(&self) -> Volume {
        self.base_volume
    }

    /// Mute state
    pub fn is_muted(&self) -> bool {
        self.muted
    }

    /// Whether the volume should be remembered across restarts
    pub fn save_volume(&self) -> bool {
        self.save_volume
    }

    /// Whether the mute state should be remembered
    pub fn save_muted(&self) -> bool {
        self.save_muted
    }

    /// Whether the active port should be remembered
    pub fn save_port(&self) -> bool {
        self.save_port
    }

    /// Active suspend causes
    pub fn suspend_cause(&self) -> SuspendCause {
        self.suspend_cause
    }

    /// Whether the hardware mixer must be re-applied on the next resume
    pub fn is_mixer_dirty(&self) -> bool {
        self.mixer_dirty.load(Ordering::Acquire)
    }

    /// Available ports
    pub fn ports(&self) -> &[DevicePort] {
        &self.ports
    }

    /// Name of the active port
    pub fn active_port(&self) -> Option<&str> {
        self.active_port.as_deref()
    }

    /// Latency correction in microseconds
    pub fn latency_offset(&self) -> i64 {
        self.latency_offset
    }

    /// Configured latency range
    pub fn latency_range(&self) -> LatencyRange {
        self.latency_range
    }

    /// Latency used when the device has no dynamic latency
    pub fn fixed_latency(&self) -> Duration {
        self.fixed_latency
    }

    /// Stream on the master device feeding this filter device
    pub fn master_stream(&self) -> Option<StreamIndex> {
        self.master_stream
    }

    pub(crate) fn channels(&self) -> usize {
        self.map.channels()
    }

    pub(crate) fn has_hw_volume(&self) -> bool {
        self.capabilities.contains(DeviceCapabilities::HW_VOLUME_CTRL)
    }

    pub(crate) fn has_hw_mute(&self) -> bool {
        self.capabilities.contains(DeviceCapabilities::HW_MUTE_CTRL)
    }

    pub(crate) fn is_dynamic_latency(&self) -> bool {
        self.capabilities.contains(DeviceCapabilities::DYNAMIC_LATENCY)
    }

    pub(crate) fn port(&self, name: &str) -> Option<&DevicePort> {
        self.ports.iter().find(|p| p.name == name)
    }

    pub(crate) fn derive_flags(&self, flat_volumes: bool, deferred_volume: bool) -> DeviceDerived {
        let share = self.policy.share_volume_with_master;
        let decibel_volume = self.capabilities.contains(DeviceCapabilities::DECIBEL_VOLUME)
            || (!self.has_hw_volume() && !share);

        DeviceDerived {
            flat_volume: decibel_volume && !share && flat_volumes && self.policy.flat_volume,
            decibel_volume,
            deferred_volume: deferred_volume
                && self.policy.deferred_volume
                && self.capabilities.contains(DeviceCapabilities::DEFERRED_VOLUME),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_range_is_clamped_to_absolute_bounds() {
        let range = LatencyRange::new(Duration::ZERO, Duration::from_secs(60));
        assert_eq!(range.min, ABSOLUTE_MIN_LATENCY);
        assert_eq!(range.max, ABSOLUTE_MAX_LATENCY);

        let inverted = LatencyRange::new(Duration::from_millis(50), Duration::from_millis(10));
        assert_eq!(inverted.max, Duration::from_millis(50));
        assert_eq!(inverted.clamp(Duration::from_millis(1)), Duration::from_millis(50));
    }

    #[test]
    fn capabilities_follow_hardware_features() {
        let caps = DeviceCapabilities::from_hardware(
            HardwareFeatures::VOLUME | HardwareFeatures::DEFERRED_VOLUME | HardwareFeatures::PORTS,
            false,
            true,
        );
        assert!(caps.contains(DeviceCapabilities::HW_VOLUME_CTRL | DeviceCapabilities::DEFERRED_VOLUME));
        assert!(!caps.contains(DeviceCapabilities::PORTS));
        assert!(!caps.contains(DeviceCapabilities::DECIBEL_VOLUME));
        assert!(caps.contains(DeviceCapabilities::DYNAMIC_LATENCY));

        let deferred_only = DeviceCapabilities::from_hardware(HardwareFeatures::DEFERRED_VOLUME, false, false);
        assert!(!deferred_only.contains(DeviceCapabilities::DEFERRED_VOLUME));
    }

    #[test]
    fn states_report_linkage() {
        assert!(DeviceState::Suspended.is_linked());
        assert!(!DeviceState::Suspended.is_opened());
        assert!(DeviceState::Idle.is_opened());
        assert!(!DeviceState::Init.is_linked());
        assert!(!DeviceState::Unlinked.is_linked());
    }
}
