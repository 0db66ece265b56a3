//! Callback contracts between the core and its external collaborators.
//!
//! Hardware control surfaces are shared between the control context and the
//! device context, so they take `&self` and must be `Send + Sync`. Data
//! producers and device I/O are owned by a single device context at a time.

use std::time::Duration;

use bitflags::bitflags;

use crate::{
    device::DeviceState,
    error::HardwareError,
    sample::FormatInfo,
    volume::{ChannelVolumes, Volume},
};

bitflags! {
    /// Controls a hardware surface actually implements.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct HardwareFeatures: u32 {
        /// `get_volume` and `set_volume` work.
        const VOLUME = 0x0001;
        /// `get_mute` and `set_mute` work.
        const MUTE = 0x0002;
        /// Volume writes can be deferred and timed through `write_volume`.
        const DEFERRED_VOLUME = 0x0004;
        /// Volume steps map onto a decibel scale.
        const DECIBEL_VOLUME = 0x0008;
        /// `set_port` works.
        const PORTS = 0x0010;
        /// `update_rate` works.
        const RATE = 0x0020;
    }
}

/// Mixer controls of one device
pub trait HardwareControl: Send + Sync {
    /// Controls this surface implements
    fn features(&self) -> HardwareFeatures;

    /// Volume at which the hardware passes signal at unity
    fn base_volume(&self) -> Volume {
        Volume::NORM
    }

    /// Read the current hardware volume
    ///
    /// # Errors
    /// Returns error if the control cannot be read.
    fn get_volume(&self) -> Result<ChannelVolumes, HardwareError> {
        Err(HardwareError::NotImplemented)
    }

    /// Move the hardware towards `requested` and report what it can reach.
    ///
    /// When writes are deferred this only computes the reachable value;
    /// the write happens later through [`HardwareControl::write_volume`].
    ///
    /// # Errors
    /// Returns error if the control cannot be set.
    fn set_volume(&self, requested: &ChannelVolumes) -> Result<ChannelVolumes, HardwareError> {
        let _ = requested;
        Err(HardwareError::NotImplemented)
    }

    /// Write a previously computed hardware volume
    ///
    /// # Errors
    /// Returns error if the write fails.
    fn write_volume(&self, volume: &ChannelVolumes) -> Result<(), HardwareError> {
        let _ = volume;
        Err(HardwareError::NotImplemented)
    }

    /// Read the hardware mute switch
    ///
    /// # Errors
    /// Returns error if the switch cannot be read.
    fn get_mute(&self) -> Result<bool, HardwareError> {
        Err(HardwareError::NotImplemented)
    }

    /// Set the hardware mute switch
    ///
    /// # Errors
    /// Returns error if the switch cannot be set.
    fn set_mute(&self, muted: bool) -> Result<(), HardwareError> {
        let _ = muted;
        Err(HardwareError::NotImplemented)
    }

    /// Route through the named port
    ///
    /// # Errors
    /// Returns error if the port cannot be activated.
    fn set_port(&self, port: &str) -> Result<(), HardwareError> {
        let _ = port;
        Err(HardwareError::NotImplemented)
    }

    /// Formats the device can carry, in priority order
    fn get_formats(&self) -> Vec<FormatInfo> {
        vec![FormatInfo::pcm()]
    }

    /// Reconfigure the hardware sample rate
    ///
    /// # Errors
    /// Returns error if the rate cannot be applied.
    fn update_rate(&self, rate: u32) -> Result<(), HardwareError> {
        let _ = rate;
        Err(HardwareError::NotImplemented)
    }
}

/// Audio I/O driven by a device context every processing cycle
pub trait DeviceIo: Send {
    /// Hand a mixed block to an output device
    fn write(&mut self, data: &[u8]) {
        let _ = data;
    }

    /// Take up to `nbytes` captured bytes from an input device
    fn read(&mut self, nbytes: usize) -> Option<Vec<u8>> {
        let _ = nbytes;
        None
    }

    /// Reclaim up to `nbytes` already written but not yet played; returns the amount reclaimed
    fn rewind(&mut self, nbytes: usize) -> usize {
        let _ = nbytes;
        0
    }

    /// Bytes of already written output that `rewind` can take back
    fn max_rewind(&self) -> usize {
        0
    }

    /// Delay between the mix point and the speaker (or microphone and capture point)
    fn latency(&self) -> Duration {
        Duration::ZERO
    }

    /// Whether the hardware mixer reported a change since the last poll
    ///
    /// # Errors
    /// Returns error if polling failed; the device stops polling afterwards.
    fn poll_mixer(&mut self) -> Result<bool, HardwareError> {
        Ok(false)
    }

    /// The device changed state
    fn state_changed(&mut self, state: DeviceState) {
        let _ = state;
    }
}

/// I/O that discards output and never captures
#[derive(Debug, Clone, Copy, Default)]
pub struct NullIo {
    latency: Duration,
}

impl NullIo {
    /// I/O reporting a fixed latency
    pub fn with_latency(latency: Duration) -> Self {
        Self { latency }
    }
}

impl DeviceIo for NullIo {
    fn latency(&self) -> Duration {
        self.latency
    }
}

/// Producer feeding a playback stream
pub trait PlaybackSource: Send {
    /// Produce up to `nbytes` bytes, or `None` when nothing is available
    fn pop(&mut self, nbytes: usize) -> Option<Vec<u8>>;

    /// The last `nbytes` produced bytes will be requested again
    fn process_rewind(&mut self, nbytes: usize) {
        let _ = nbytes;
    }

    /// Called on underrun; return `true` if data will arrive soon
    fn process_underrun(&mut self) -> bool {
        false
    }
}

/// Consumer fed by a capture stream
pub trait CaptureSink: Send {
    /// Deliver a captured chunk
    fn push(&mut self, chunk: &[u8]);

    /// Whether the consumer can take back delivered data
    fn supports_rewind(&self) -> bool {
        false
    }

    /// Take back the last `nbytes` delivered bytes
    fn process_rewind(&mut self, nbytes: usize) {
        let _ = nbytes;
    }
}
