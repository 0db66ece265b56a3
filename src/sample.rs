//! Sample specifications and stream encodings.

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};

use crate::volume::{CHANNELS_MAX, ChannelMap};

/// Lowest sample rate a device or stream may run at
pub const RATE_MIN: u32 = 8_000;
/// Highest sample rate a device or stream may run at
pub const RATE_MAX: u32 = 192_000;

/// PCM sample encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    /// Unsigned 8-bit
    U8,
    /// Signed 16-bit little endian
    #[default]
    S16le,
    /// Signed 24-bit little endian, packed
    S24le,
    /// Signed 32-bit little endian
    S32le,
    /// 32-bit IEEE float little endian
    F32le,
}

impl SampleFormat {
    /// Bytes per sample
    pub fn sample_size(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::S16le => 2,
            Self::S24le => 3,
            Self::S32le | Self::F32le => 4,
        }
    }

    /// Byte value that encodes silence
    pub fn silence_byte(self) -> u8 {
        match self {
            Self::U8 => 0x80,
            _ => 0,
        }
    }
}

/// Format, rate and channel count of a PCM stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SampleSpec {
    /// Sample encoding
    pub format: SampleFormat,
    /// Frames per second
    pub rate: u32,
    /// Interleaved channels per frame
    pub channels: u8,
}

impl SampleSpec {
    /// Create a spec
    pub fn new(format: SampleFormat, rate: u32, channels: u8) -> Self {
        Self {
            format,
            rate,
            channels,
        }
    }

    /// Whether rate and channel count are in range
    pub fn is_valid(&self) -> bool {
        (RATE_MIN..=RATE_MAX).contains(&self.rate)
            && self.channels > 0
            && usize::from(self.channels) <= CHANNELS_MAX
    }

    /// Bytes per frame
    pub fn frame_size(&self) -> usize {
        self.format.sample_size() * usize::from(self.channels)
    }

    /// Playback time of `bytes` bytes
    pub fn bytes_to_duration(&self, bytes: usize) -> Duration {
        let frame = self.frame_size().max(1) as u64;
        let frames = bytes as u64 / frame;
        Duration::from_micros(frames * 1_000_000 / u64::from(self.rate.max(1)))
    }

    /// Bytes needed to cover `duration`, rounded down to whole frames
    pub fn duration_to_bytes(&self, duration: Duration) -> usize {
        let frames = duration.as_micros() * u128::from(self.rate) / 1_000_000;
        (frames as usize) * self.frame_size()
    }

    /// Round `bytes` down to a whole number of frames
    pub fn frame_align(&self, bytes: usize) -> usize {
        let frame = self.frame_size().max(1);
        bytes - bytes % frame
    }

    /// Whether `map` fits this spec
    pub fn matches_map(&self, map: &ChannelMap) -> bool {
        map.is_compatible(usize::from(self.channels))
    }
}

impl fmt::Display for SampleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {}ch {}Hz", self.format, self.channels, self.rate)
    }
}

/// Payload encoding carried by a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Encoding {
    /// Uncompressed PCM, mixable
    #[default]
    Pcm,
    /// AC-3 wrapped in IEC 61937
    Ac3Iec61937,
    /// E-AC-3 wrapped in IEC 61937
    Eac3Iec61937,
    /// MPEG audio wrapped in IEC 61937
    MpegIec61937,
    /// DTS wrapped in IEC 61937
    DtsIec61937,
    /// AAC wrapped in IEC 61937
    Mpeg2AacIec61937,
}

impl Encoding {
    /// Whether data in this encoding must bypass mixing and volume
    pub fn is_passthrough(self) -> bool {
        self != Self::Pcm
    }
}

/// Negotiable stream format: encoding plus optional PCM parameters
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FormatInfo {
    /// Payload encoding
    pub encoding: Encoding,
    /// Fixed sample spec, if the format pins one
    pub sample_spec: Option<SampleSpec>,
    /// Fixed channel map, if the format pins one
    pub channel_map: Option<ChannelMap>,
}

impl FormatInfo {
    /// Plain PCM with no fixed parameters
    pub fn pcm() -> Self {
        Self::default()
    }

    /// Format describing an existing sample spec
    pub fn from_sample_spec(spec: SampleSpec, map: Option<ChannelMap>) -> Self {
        Self {
            encoding: Encoding::Pcm,
            sample_spec: Some(spec),
            channel_map: map,
        }
    }

    /// Compressed passthrough format at a fixed rate
    pub fn passthrough(encoding: Encoding, rate: u32) -> Self {
        Self {
            encoding,
            sample_spec: Some(SampleSpec::new(SampleFormat::S16le, rate, 2)),
            channel_map: Some(ChannelMap::stereo()),
        }
    }

    /// Whether this format bypasses mixing
    pub fn is_passthrough(&self) -> bool {
        self.encoding.is_passthrough()
    }

    /// Whether a device offering `self` can carry a stream requesting `other`
    pub fn accepts(&self, other: &FormatInfo) -> bool {
        if self.encoding != other.encoding {
            return false;
        }
        match (&self.sample_spec, &other.sample_spec) {
            (Some(a), Some(b)) if self.is_passthrough() => a.rate == b.rate,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_math() {
        let spec = SampleSpec::new(SampleFormat::S16le, 48_000, 2);
        assert_eq!(spec.frame_size(), 4);
        assert_eq!(spec.duration_to_bytes(Duration::from_millis(10)), 1920);
        assert_eq!(spec.bytes_to_duration(1920), Duration::from_millis(10));
        assert_eq!(spec.frame_align(1923), 1920);
    }

    #[test]
    fn rate_bounds() {
        assert!(!SampleSpec::new(SampleFormat::U8, 4_000, 1).is_valid());
        assert!(!SampleSpec::new(SampleFormat::U8, 44_100, 0).is_valid());
        assert!(SampleSpec::new(SampleFormat::F32le, 192_000, 8).is_valid());
    }

    #[test]
    fn passthrough_formats_match_on_rate() {
        let offered = FormatInfo::passthrough(Encoding::Ac3Iec61937, 48_000);
        assert!(offered.accepts(&FormatInfo::passthrough(Encoding::Ac3Iec61937, 48_000)));
        assert!(!offered.accepts(&FormatInfo::passthrough(Encoding::Ac3Iec61937, 44_100)));
        assert!(!offered.accepts(&FormatInfo::pcm()));
    }
}
