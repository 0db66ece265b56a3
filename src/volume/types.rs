use std::fmt;

use serde::{Deserialize, Serialize};

use super::{CHANNELS_MAX, ChannelMap, VolumeError};

/// Fixed-point software volume
///
/// # Volume Levels
/// - `0` = Muted
/// - `0x10000` = Normal volume (100%)
/// - `u32::MAX / 2` = Absolute maximum
///
/// Percentages are expressed in the fixed-point domain, linear factors use a
/// cubic mapping so that equal steps sound roughly equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Volume(pub u32);

impl Volume {
    /// Silence
    pub const MUTED: Self = Self(0);
    /// Unity gain (100%)
    pub const NORM: Self = Self(0x10000);
    /// Largest valid value
    pub const MAX: Self = Self(u32::MAX / 2);

    fn clamp_raw(raw: u64) -> Self {
        Self(raw.min(u64::from(Self::MAX.0)) as u32)
    }

    /// Whether the raw value is within range
    pub fn is_valid(self) -> bool {
        self <= Self::MAX
    }

    /// Multiply two volumes in the fixed-point domain, rounding to nearest.
    pub fn sw_multiply(self, other: Self) -> Self {
        let norm = u64::from(Self::NORM.0);
        Self::clamp_raw((u64::from(self.0) * u64::from(other.0) + norm / 2) / norm)
    }

    /// Divide two volumes in the fixed-point domain.
    ///
    /// Dividing by a muted volume yields muted.
    pub fn sw_divide(self, other: Self) -> Self {
        if other <= Self::MUTED {
            return Self::MUTED;
        }
        let norm = u64::from(Self::NORM.0);
        let divisor = u64::from(other.0);
        Self::clamp_raw((u64::from(self.0) * norm + divisor / 2) / divisor)
    }

    /// Volume whose linear amplitude factor is `linear`
    pub fn from_linear(linear: f64) -> Self {
        if linear <= 0.0 {
            return Self::MUTED;
        }
        let raw = (linear.cbrt() * f64::from(Self::NORM.0)).round();
        Self::clamp_raw(raw as u64)
    }

    /// Linear amplitude factor applied to samples
    pub fn to_linear(self) -> f64 {
        if self <= Self::MUTED {
            return 0.0;
        }
        if self == Self::NORM {
            return 1.0;
        }
        let f = f64::from(self.0) / f64::from(Self::NORM.0);
        f * f * f
    }

    /// Volume from a percentage of [`Volume::NORM`]
    pub fn from_percentage(percentage: f64) -> Self {
        if percentage <= 0.0 {
            return Self::MUTED;
        }
        let raw = (percentage / 100.0 * f64::from(Self::NORM.0)).round();
        Self::clamp_raw(raw as u64)
    }

    /// Percentage of [`Volume::NORM`]
    pub fn to_percentage(self) -> f64 {
        f64::from(self.0) * 100.0 / f64::from(Self::NORM.0)
    }
}

impl fmt::Display for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.0}%", self.to_percentage())
    }
}

/// Per-channel volume vector
///
/// Always carries between 1 and [`CHANNELS_MAX`] valid channel values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelVolumes {
    values: Vec<Volume>,
}

impl ChannelVolumes {
    /// Create a vector from explicit channel values
    ///
    /// # Errors
    /// Returns error if the channel count is out of range or any value exceeds
    /// [`Volume::MAX`].
    pub fn new(values: Vec<Volume>) -> Result<Self, VolumeError> {
        if values.is_empty() || values.len() > CHANNELS_MAX {
            return Err(VolumeError::InvalidChannelCount {
                channels: values.len(),
            });
        }
        if let Some((channel, volume)) = values.iter().enumerate().find(|(_, v)| !v.is_valid()) {
            return Err(VolumeError::InvalidVolume {
                channel,
                volume: volume.0,
            });
        }
        Ok(Self { values })
    }

    /// Create a vector from per-channel percentages
    ///
    /// # Errors
    /// Returns error if the channel count is out of range.
    pub fn from_percentages(percentages: &[f64]) -> Result<Self, VolumeError> {
        Self::new(percentages.iter().map(|p| Volume::from_percentage(*p)).collect())
    }

    /// Same value on every channel. The count is clamped into `1..=CHANNELS_MAX`.
    pub fn uniform(channels: usize, volume: Volume) -> Self {
        let channels = channels.clamp(1, CHANNELS_MAX);
        Self {
            values: vec![volume.min(Volume::MAX); channels],
        }
    }

    /// Unity gain on every channel
    pub fn norm(channels: usize) -> Self {
        Self::uniform(channels, Volume::NORM)
    }

    /// Silence on every channel
    pub fn muted(channels: usize) -> Self {
        Self::uniform(channels, Volume::MUTED)
    }

    /// Number of channels
    pub fn channels(&self) -> usize {
        self.values.len()
    }

    /// Value of a single channel
    pub fn get(&self, channel: usize) -> Option<Volume> {
        self.values.get(channel).copied()
    }

    /// Replace a single channel value, clamping to [`Volume::MAX`]
    ///
    /// # Errors
    /// Returns error if channel index is out of bounds.
    pub fn set_channel(&mut self, channel: usize, volume: Volume) -> Result<(), VolumeError> {
        let slot = self
            .values
            .get_mut(channel)
            .ok_or(VolumeError::InvalidChannel { channel })?;
        if !volume.is_valid() {
            tracing::warn!("Volume {:#x} clamped to maximum on channel {channel}", volume.0);
        }
        *slot = volume.min(Volume::MAX);
        Ok(())
    }

    /// All channel values
    pub fn as_slice(&self) -> &[Volume] {
        &self.values
    }

    /// Per-channel access for fixed-point arithmetic that keeps values in range
    pub(crate) fn values_mut(&mut self) -> &mut [Volume] {
        &mut self.values
    }

    /// Loudest channel
    pub fn max(&self) -> Volume {
        self.values.iter().copied().max().unwrap_or(Volume::MUTED)
    }

    /// Quietest channel
    pub fn min(&self) -> Volume {
        self.values.iter().copied().min().unwrap_or(Volume::MUTED)
    }

    /// Integer mean of all channels
    pub fn avg(&self) -> Volume {
        let sum: u64 = self.values.iter().map(|v| u64::from(v.0)).sum();
        Volume((sum / self.values.len().max(1) as u64) as u32)
    }

    /// Whether every channel sits at unity gain
    pub fn is_norm(&self) -> bool {
        self.values.iter().all(|v| *v == Volume::NORM)
    }

    /// Whether every channel is silent
    pub fn is_muted(&self) -> bool {
        self.values.iter().all(|v| *v <= Volume::MUTED)
    }

    /// Whether the vector fits a stream of `channels` channels
    pub fn is_compatible(&self, channels: usize) -> bool {
        self.values.len() == channels
    }

    /// Rescale so that the loudest channel becomes `max`, keeping the balance.
    ///
    /// A fully muted vector is set to `max` on every channel.
    pub fn scale(&mut self, max: Volume) {
        let current = self.max();
        if current <= Volume::MUTED {
            self.values.iter_mut().for_each(|v| *v = max);
            return;
        }
        for v in &mut self.values {
            *v = Volume::clamp_raw(u64::from(v.0) * u64::from(max.0) / u64::from(current.0));
        }
    }

    /// Resize to `channels` channels, all set to `volume`
    pub fn set_uniform(&mut self, channels: usize, volume: Volume) {
        *self = Self::uniform(channels, volume);
    }

    fn zip_with(&self, other: &Self, op: impl Fn(Volume, Volume) -> Volume) -> Self {
        let values = self
            .values
            .iter()
            .enumerate()
            .map(|(i, v)| op(*v, other.get(i).unwrap_or(Volume::NORM)))
            .collect();
        Self { values }
    }

    /// Channel-wise fixed-point multiply. Channels missing from `other` count as unity.
    pub fn multiply(&self, other: &Self) -> Self {
        self.zip_with(other, Volume::sw_multiply)
    }

    /// Multiply every channel by one scalar
    pub fn multiply_scalar(&self, volume: Volume) -> Self {
        Self {
            values: self.values.iter().map(|v| v.sw_multiply(volume)).collect(),
        }
    }

    /// Channel-wise fixed-point divide. Channels missing from `other` count as unity.
    pub fn divide(&self, other: &Self) -> Self {
        self.zip_with(other, Volume::sw_divide)
    }

    /// Pointwise maximum
    pub fn merge(&self, other: &Self) -> Self {
        self.zip_with(other, Volume::max)
    }

    /// Re-express this vector, laid out per `from`, in the layout of `to`.
    ///
    /// Each output channel averages the input channels on the same position,
    /// falling back to channels on the same side, then to the overall average.
    pub fn remap(&self, from: &ChannelMap, to: &ChannelMap) -> Self {
        if from == to {
            return self.clone();
        }

        let values = to
            .positions()
            .iter()
            .map(|target| {
                let mut sum = 0u64;
                let mut n = 0u64;
                for (i, source) in from.positions().iter().enumerate() {
                    if source == target {
                        sum += u64::from(self.get(i).unwrap_or(Volume::MUTED).0);
                        n += 1;
                    }
                }
                if n == 0 {
                    for (i, source) in from.positions().iter().enumerate() {
                        if source.same_side(*target) {
                            sum += u64::from(self.get(i).unwrap_or(Volume::MUTED).0);
                            n += 1;
                        }
                    }
                }
                if n == 0 {
                    self.avg()
                } else {
                    Volume((sum / n) as u32)
                }
            })
            .collect();

        Self { values }
    }

    /// Remap with the least audible change.
    ///
    /// If `template` (already in `to` layout) maps back onto `self`, the
    /// template is reused verbatim; otherwise the loudest channel is applied
    /// uniformly.
    pub fn remap_minimal_impact(&self, template: &Self, from: &ChannelMap, to: &ChannelMap) -> Self {
        if from == to {
            return self.clone();
        }
        if template.remap(to, from) == *self {
            return template.clone();
        }
        Self::uniform(to.channels(), self.max())
    }
}

impl fmt::Display for ChannelVolumes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.values.iter().map(|v| v.to_string()).collect();
        write!(f, "[{}]", parts.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::ChannelPosition;

    fn pct(values: &[f64]) -> ChannelVolumes {
        ChannelVolumes::from_percentages(values).unwrap()
    }

    #[test]
    fn multiply_and_divide_are_fixed_point() {
        let half = Volume::from_percentage(50.0);
        assert_eq!(Volume::NORM.sw_multiply(half), half);
        assert_eq!(half.sw_divide(Volume::NORM), half);
        assert_eq!(half.sw_divide(Volume::MUTED), Volume::MUTED);
        assert_eq!(Volume::from_percentage(50.0).sw_divide(Volume::from_percentage(80.0)), Volume(40960));
    }

    #[test]
    fn linear_mapping_is_cubic() {
        assert_eq!(Volume::from_linear(1.0), Volume::NORM);
        assert_eq!(Volume::from_linear(0.0), Volume::MUTED);
        let half = Volume::from_percentage(50.0);
        assert!((half.to_linear() - 0.125).abs() < 1e-9);
    }

    #[test]
    fn rejects_out_of_range_values() {
        assert!(ChannelVolumes::new(vec![]).is_err());
        assert!(ChannelVolumes::new(vec![Volume(u32::MAX)]).is_err());
        assert!(ChannelVolumes::new(vec![Volume::NORM; CHANNELS_MAX + 1]).is_err());
    }

    #[test]
    fn merge_takes_pointwise_maximum() {
        let merged = pct(&[50.0, 80.0]).merge(&pct(&[70.0, 20.0]));
        assert_eq!(merged, pct(&[70.0, 80.0]));
    }

    #[test]
    fn scale_keeps_balance() {
        let mut v = pct(&[50.0, 100.0]);
        v.scale(Volume::from_percentage(50.0));
        assert_eq!(v, pct(&[25.0, 50.0]));

        let mut muted = ChannelVolumes::muted(2);
        muted.scale(Volume::NORM);
        assert!(muted.is_norm());
    }

    #[test]
    fn remap_stereo_to_mono_averages() {
        let v = pct(&[40.0, 80.0]);
        let mono = v.remap(&ChannelMap::stereo(), &ChannelMap::mono());
        assert_eq!(mono.channels(), 1);
        assert_eq!(mono.get(0), Some(Volume::from_percentage(60.0)));
    }

    #[test]
    fn remap_matches_positions() {
        let surround = ChannelMap::new(vec![
            ChannelPosition::FrontLeft,
            ChannelPosition::FrontRight,
            ChannelPosition::RearLeft,
            ChannelPosition::RearRight,
        ])
        .unwrap();
        let v = pct(&[10.0, 20.0, 30.0, 40.0]);
        let stereo = v.remap(&surround, &ChannelMap::stereo());
        assert_eq!(stereo, pct(&[10.0, 20.0]));
    }

    #[test]
    fn minimal_impact_reuses_template_or_flattens() {
        let stereo = ChannelMap::stereo();
        let mono = ChannelMap::mono();
        let template = pct(&[60.0, 60.0]);

        let v = pct(&[60.0]);
        assert_eq!(v.remap_minimal_impact(&template, &mono, &stereo), template);

        let other = pct(&[90.0]);
        assert_eq!(
            other.remap_minimal_impact(&template, &mono, &stereo),
            pct(&[90.0, 90.0])
        );
    }
}
