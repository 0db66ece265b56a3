//! Sample-rate, format and channel-layout conversion.
//!
//! The core treats a resampler as an opaque transform with a block-size
//! contract. [`NearestResampler`] is the built-in implementation; hosts with
//! better converters plug in their own [`ResamplerFactory`].

use std::fmt;

use bitflags::bitflags;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{
    mix::{decode, encode},
    sample::SampleSpec,
    volume::ChannelMap,
};

/// Conversion algorithm requested by a stream or the configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum ResampleMethod {
    /// Let the factory choose
    #[default]
    Auto,
    /// Drop or repeat frames
    Trivial,
    /// Interpolating converter, if the factory has one
    Interpolating,
}

impl fmt::Display for ResampleMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Trivial => write!(f, "trivial"),
            Self::Interpolating => write!(f, "interpolating"),
        }
    }
}

bitflags! {
    /// Constraints a stream places on its resampler.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ResamplerFlags: u32 {
        /// Input rate may change while running.
        const VARIABLE_RATE = 0x0001;
        /// Do not remap channels by position.
        const NO_REMAP = 0x0002;
        /// Do not up- or down-mix channels.
        const NO_REMIX = 0x0004;
    }
}

/// Everything a factory needs to build a resampler
#[derive(Debug, Clone, PartialEq)]
pub struct ResamplerParams {
    /// Spec of data fed in
    pub input_spec: SampleSpec,
    /// Layout of data fed in
    pub input_map: ChannelMap,
    /// Spec of data produced
    pub output_spec: SampleSpec,
    /// Layout of data produced
    pub output_map: ChannelMap,
    /// Requested algorithm
    pub method: ResampleMethod,
    /// Stream constraints
    pub flags: ResamplerFlags,
}

/// Converter between two sample specs
///
/// Called only from a device context.
pub trait Resampler: Send {
    /// Convert one chunk
    fn run(&mut self, input: &[u8]) -> Vec<u8>;
    /// Largest input chunk accepted at once
    fn max_block_size(&self) -> usize;
    /// Input bytes needed to produce `out_bytes` output bytes
    fn request(&self, out_bytes: usize) -> usize;
    /// Output bytes produced from `in_bytes` input bytes
    fn result(&self, in_bytes: usize) -> usize;
    /// Drop internal state (after a rewind)
    fn reset(&mut self);
    /// Change the input rate of a variable-rate stream
    fn set_input_rate(&mut self, rate: u32);
    /// Spec produced
    fn output_spec(&self) -> SampleSpec;
    /// Layout produced
    fn output_map(&self) -> &ChannelMap;
}

/// Builds resamplers on behalf of the core
pub trait ResamplerFactory: Send + Sync {
    /// Construct a resampler, or `None` if the conversion is unsupported
    fn create(&self, params: &ResamplerParams) -> Option<Box<dyn Resampler>>;
}

/// Factory for [`NearestResampler`]
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultResamplerFactory;

impl ResamplerFactory for DefaultResamplerFactory {
    fn create(&self, params: &ResamplerParams) -> Option<Box<dyn Resampler>> {
        if params.method == ResampleMethod::Interpolating {
            tracing::debug!("interpolating resampler unavailable, using nearest-frame conversion");
        }
        NearestResampler::new(params).map(|r| Box::new(r) as Box<dyn Resampler>)
    }
}

const BLOCK_FRAMES: usize = 4096;

/// Nearest-frame rate conversion with format conversion and positional channel mapping
pub struct NearestResampler {
    input_spec: SampleSpec,
    output_spec: SampleSpec,
    output_map: ChannelMap,
    channel_sources: Vec<usize>,
    position: u64,
}

impl NearestResampler {
    /// Build a converter; fails when either spec is invalid or layouts cannot be mapped
    pub fn new(params: &ResamplerParams) -> Option<Self> {
        if !params.input_spec.is_valid() || !params.output_spec.is_valid() {
            return None;
        }
        if !params.input_spec.matches_map(&params.input_map)
            || !params.output_spec.matches_map(&params.output_map)
        {
            return None;
        }

        let in_channels = params.input_map.channels();
        let no_remix = params.flags.contains(ResamplerFlags::NO_REMIX);
        let no_remap = params.flags.contains(ResamplerFlags::NO_REMAP);
        if no_remix && in_channels != params.output_map.channels() {
            return None;
        }

        let channel_sources = params
            .output_map
            .positions()
            .iter()
            .enumerate()
            .map(|(out, position)| {
                if no_remap {
                    return out % in_channels;
                }
                params
                    .input_map
                    .positions()
                    .iter()
                    .position(|p| p == position)
                    .or_else(|| {
                        params
                            .input_map
                            .positions()
                            .iter()
                            .position(|p| p.same_side(*position))
                    })
                    .unwrap_or(out % in_channels)
            })
            .collect();

        Some(Self {
            input_spec: params.input_spec,
            output_spec: params.output_spec,
            output_map: params.output_map.clone(),
            channel_sources,
            position: 0,
        })
    }
}

impl Resampler for NearestResampler {
    fn run(&mut self, input: &[u8]) -> Vec<u8> {
        let in_frame = self.input_spec.frame_size();
        let out_frame = self.output_spec.frame_size();
        let in_size = self.input_spec.format.sample_size();
        let out_size = self.output_spec.format.sample_size();
        let in_rate = u64::from(self.input_spec.rate);
        let out_rate = u64::from(self.output_spec.rate);

        let in_frames = (input.len() / in_frame) as u64;
        let mut out = Vec::with_capacity(self.result(input.len()));
        let mut frame = vec![0u8; out_frame];

        // `position` counts output frames scaled by the input rate
        loop {
            let source = self.position / out_rate;
            if source >= in_frames {
                break;
            }
            let base = source as usize * in_frame;
            for (c, src) in self.channel_sources.iter().enumerate() {
                let at = base + src * in_size;
                let value = decode(self.input_spec.format, &input[at..at + in_size]);
                encode(self.output_spec.format, value, &mut frame[c * out_size..]);
            }
            out.extend_from_slice(&frame);
            self.position += in_rate;
        }
        self.position -= in_frames * out_rate;
        out
    }

    fn max_block_size(&self) -> usize {
        BLOCK_FRAMES * self.input_spec.frame_size()
    }

    fn request(&self, out_bytes: usize) -> usize {
        let frames = (out_bytes / self.output_spec.frame_size()) as u64;
        let in_rate = u64::from(self.input_spec.rate);
        let out_rate = u64::from(self.output_spec.rate);
        ((frames * in_rate).div_ceil(out_rate)) as usize * self.input_spec.frame_size()
    }

    fn result(&self, in_bytes: usize) -> usize {
        let frames = (in_bytes / self.input_spec.frame_size()) as u64;
        let in_rate = u64::from(self.input_spec.rate);
        let out_rate = u64::from(self.output_spec.rate);
        (frames * out_rate / in_rate) as usize * self.output_spec.frame_size()
    }

    fn reset(&mut self) {
        self.position = 0;
    }

    fn set_input_rate(&mut self, rate: u32) {
        if rate == self.input_spec.rate {
            return;
        }
        self.input_spec.rate = rate;
        self.position = 0;
    }

    fn output_spec(&self) -> SampleSpec {
        self.output_spec
    }

    fn output_map(&self) -> &ChannelMap {
        &self.output_map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::SampleFormat;

    fn params(in_rate: u32, out_rate: u32) -> ResamplerParams {
        ResamplerParams {
            input_spec: SampleSpec::new(SampleFormat::S16le, in_rate, 2),
            input_map: ChannelMap::stereo(),
            output_spec: SampleSpec::new(SampleFormat::S16le, out_rate, 2),
            output_map: ChannelMap::stereo(),
            method: ResampleMethod::Auto,
            flags: ResamplerFlags::empty(),
        }
    }

    #[test]
    fn doubling_rate_repeats_frames() {
        let mut r = NearestResampler::new(&params(24_000, 48_000)).unwrap();
        let input: Vec<u8> = [100i16, -100, 200, -200]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let out = r.run(&input);
        assert_eq!(out.len(), 16);
        assert_eq!(&out[..4], &out[4..8]);
    }

    #[test]
    fn domain_conversion_helpers() {
        let r = NearestResampler::new(&params(44_100, 48_000)).unwrap();
        assert_eq!(r.result(44_100 * 4), 48_000 * 4);
        assert_eq!(r.request(48_000 * 4), 44_100 * 4);
    }

    #[test]
    fn refuses_invalid_specs() {
        let mut p = params(44_100, 48_000);
        p.output_spec.channels = 0;
        assert!(NearestResampler::new(&p).is_none());
    }

    #[test]
    fn stereo_to_mono_is_supported() {
        let mut p = params(48_000, 48_000);
        p.output_spec.channels = 1;
        p.output_map = ChannelMap::mono();
        let r = NearestResampler::new(&p).unwrap();
        assert_eq!(r.output_map().channels(), 1);
    }
}
