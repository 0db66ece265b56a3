//! Stream volume, volume factors and mute.

use tracing::{debug, instrument, warn};

use super::Core;
use crate::{
    arena::StreamIndex,
    device::DeviceCall,
    error::{CoreError, Result},
    events::CoreEvent,
    volume::{ChannelVolumes, Volume},
};

impl Core {
    /// Set the volume of a stream.
    ///
    /// Under flat volume a non-`absolute` volume is relative to the device
    /// reference volume, and the device volume follows the loudest stream.
    /// Setting the current volume again only updates the save flag.
    ///
    /// # Errors
    /// Returns error if the stream does not exist, its volume is read-only, or
    /// `volume` does not fit its channels.
    #[instrument(skip(self, volume))]
    pub async fn set_stream_volume(
        &mut self,
        stream: StreamIndex,
        volume: &ChannelVolumes,
        save: bool,
        absolute: bool,
    ) -> Result<()> {
        let s = self.stream_ref(stream)?;
        if !s.volume_writable {
            return Err(CoreError::BadState(format!("volume of {stream} is read-only")));
        }
        let channels = s.channels();
        let mut volume = if volume.channels() == 1 {
            ChannelVolumes::uniform(channels, volume.max())
        } else {
            volume.clone()
        };
        if !volume.is_compatible(channels) {
            return Err(CoreError::InvalidArgument(format!(
                "volume {volume} does not fit {channels} channels"
            )));
        }
        if s.is_passthrough() && !volume.is_norm() {
            warn!(%stream, "Cannot change volume of a passthrough stream");
            return Ok(());
        }

        let device = s.device;
        let flat = device.is_some_and(|d| self.flat_volume_enabled(d));

        if flat && !absolute {
            if let Some(d) = device.and_then(|d| self.devices.get(d)) {
                volume = d.reference_volume.remap(&d.map, &s.map).multiply(&volume);
            }
        }

        if volume == s.volume {
            let s = self.stream_mut(stream)?;
            s.save_volume |= save;
            return Ok(());
        }

        self.set_stream_volume_direct(stream, volume.clone());
        let s = self.stream_mut(stream)?;
        s.save_volume = save;

        match device {
            Some(device) if flat => {
                // The device volume follows the streams; ratios are recomputed there.
                self.set_device_volume(device, None, true, save).await?;
            }
            _ => {
                s.reference_ratio = volume.clone();
                s.real_ratio = volume;
                s.soft_volume = s.real_ratio.multiply(&s.volume_factor);
                self.push_stream_soft_volume(stream).await;
            }
        }
        Ok(())
    }

    /// Volume of a stream; relative to the device reference volume under flat
    /// volume unless `absolute`
    ///
    /// # Errors
    /// Returns error if the stream does not exist.
    pub fn stream_volume(&self, stream: StreamIndex, absolute: bool) -> Result<ChannelVolumes> {
        let s = self.stream_ref(stream)?;
        let flat = s.device.is_some_and(|d| self.flat_volume_enabled(d));
        Ok(if absolute || !flat {
            s.volume.clone()
        } else {
            s.reference_ratio.clone()
        })
    }

    /// Add a named attenuation applied on top of the stream volume
    ///
    /// # Errors
    /// Returns error if `key` is already present or `factor` does not fit the stream.
    pub async fn add_volume_factor(&mut self, stream: StreamIndex, key: &str, factor: ChannelVolumes) -> Result<()> {
        let s = self.stream_mut(stream)?;
        if !factor.is_compatible(s.channels()) {
            return Err(CoreError::InvalidArgument(format!("volume factor {factor} does not fit {stream}")));
        }
        if s.volume_factor_items.contains_key(key) {
            return Err(CoreError::InvalidArgument(format!("volume factor {key} already set")));
        }
        s.volume_factor_items.insert(key.to_string(), factor);
        self.refresh_volume_factors(stream).await
    }

    /// Remove a named attenuation
    ///
    /// # Errors
    /// Returns error if `key` is not present.
    pub async fn remove_volume_factor(&mut self, stream: StreamIndex, key: &str) -> Result<()> {
        if self.stream_mut(stream)?.volume_factor_items.remove(key).is_none() {
            return Err(CoreError::NoEntity(format!("volume factor {key}")));
        }
        self.refresh_volume_factors(stream).await
    }

    /// Add a named attenuation laid out in the device's channel map
    ///
    /// # Errors
    /// Returns error if the stream is moving, `key` is already present, or
    /// `factor` does not fit the device.
    pub async fn add_volume_factor_device(
        &mut self,
        stream: StreamIndex,
        key: &str,
        factor: ChannelVolumes,
    ) -> Result<()> {
        let device = self
            .stream_ref(stream)?
            .device
            .ok_or_else(|| CoreError::BadState(format!("{stream} is moving")))?;
        let device_channels = self.device_ref(device)?.channels();
        let s = self.stream_mut(stream)?;
        if !factor.is_compatible(device_channels) {
            return Err(CoreError::InvalidArgument(format!("device volume factor {factor} does not fit {device}")));
        }
        if s.volume_factor_device_items.contains_key(key) {
            return Err(CoreError::InvalidArgument(format!("device volume factor {key} already set")));
        }
        s.volume_factor_device_items.insert(key.to_string(), factor);
        self.refresh_volume_factors(stream).await
    }

    /// Remove a named device-domain attenuation
    ///
    /// # Errors
    /// Returns error if `key` is not present.
    pub async fn remove_volume_factor_device(&mut self, stream: StreamIndex, key: &str) -> Result<()> {
        if self
            .stream_mut(stream)?
            .volume_factor_device_items
            .remove(key)
            .is_none()
        {
            return Err(CoreError::NoEntity(format!("device volume factor {key}")));
        }
        self.refresh_volume_factors(stream).await
    }

    async fn refresh_volume_factors(&mut self, stream: StreamIndex) -> Result<()> {
        let device = self.stream_ref(stream)?.device;
        let device_channels = match device {
            Some(device) => self.device_ref(device)?.channels(),
            None => self.stream_ref(stream)?.volume_factor_device.channels(),
        };
        // Channels the flat device plays at silence stay silent whatever the factor.
        let device_real = device
            .filter(|&d| self.flat_volume_enabled(d) && self.sharing_origin(stream).is_none())
            .and_then(|d| self.devices.get(d))
            .map(|d| (d.real_volume.clone(), d.map.clone()));

        let s = self.stream_mut(stream)?;
        s.recompute_volume_factors(device_channels);
        s.soft_volume = s.real_ratio.multiply(&s.volume_factor);
        if let Some((real, map)) = device_real {
            let remapped = real.remap(&map, &s.map);
            for (c, applied) in s.soft_volume.values_mut().iter_mut().enumerate() {
                if remapped.get(c).unwrap_or(Volume::MUTED) <= Volume::MUTED {
                    *applied = Volume::MUTED;
                }
            }
        }
        debug!(%stream, factor = %s.volume_factor, "Volume factors changed");
        self.push_stream_soft_volume(stream).await;
        Ok(())
    }

    /// Mirror the soft volume of one stream to wherever its render state lives
    pub(crate) async fn push_stream_soft_volume(&mut self, stream: StreamIndex) {
        let Some(s) = self.streams.get_mut(stream) else {
            return;
        };
        let soft_volume = s.soft_volume.clone();
        let volume_factor_device = s.volume_factor_device.clone();

        if let Some(thread) = s.thread.as_mut() {
            thread.soft_volume = soft_volume;
            thread.volume_factor_device = volume_factor_device;
            return;
        }
        let Some(device) = s.device else {
            return;
        };
        self.call_device_best_effort(device, |reply| DeviceCall::SetStreamVolume {
            stream,
            soft_volume,
            volume_factor_device,
            reply,
        })
        .await;
    }

    /// Set the mute state of a stream
    ///
    /// # Errors
    /// Returns error if the stream does not exist.
    #[instrument(skip(self))]
    pub async fn set_stream_mute(&mut self, stream: StreamIndex, muted: bool, save: bool) -> Result<()> {
        let s = self.stream_mut(stream)?;
        if s.muted == muted {
            s.save_muted |= save;
            return Ok(());
        }
        s.muted = muted;
        s.save_muted = save;

        if let Some(thread) = s.thread.as_mut() {
            thread.muted = muted;
        } else if let Some(device) = s.device {
            self.call_device_best_effort(device, |reply| DeviceCall::SetStreamMute {
                stream,
                muted,
                reply,
            })
            .await;
        }

        self.emit(CoreEvent::StreamMuteChanged { stream, muted });
        Ok(())
    }
}
