//! Software volume and mixing on interleaved PCM.

use crate::{
    sample::{SampleFormat, SampleSpec},
    volume::{ChannelVolumes, Volume},
};

pub(crate) fn decode(format: SampleFormat, bytes: &[u8]) -> f32 {
    match format {
        SampleFormat::U8 => (f32::from(bytes[0]) - 128.0) / 128.0,
        SampleFormat::S16le => f32::from(i16::from_le_bytes([bytes[0], bytes[1]])) / 32_768.0,
        SampleFormat::S24le => {
            let raw = i32::from_le_bytes([0, bytes[0], bytes[1], bytes[2]]) >> 8;
            raw as f32 / 8_388_608.0
        }
        SampleFormat::S32le => {
            i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f32 / 2_147_483_648.0
        }
        SampleFormat::F32le => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
    }
}

pub(crate) fn encode(format: SampleFormat, value: f32, out: &mut [u8]) {
    let v = value.clamp(-1.0, 1.0);
    match format {
        SampleFormat::U8 => out[0] = (v * 127.0 + 128.0).round() as u8,
        SampleFormat::S16le => {
            out[..2].copy_from_slice(&((v * 32_767.0).round() as i16).to_le_bytes());
        }
        SampleFormat::S24le => {
            let raw = ((v * 8_388_607.0).round() as i32).to_le_bytes();
            out[..3].copy_from_slice(&raw[..3]);
        }
        SampleFormat::S32le => {
            out[..4].copy_from_slice(&((f64::from(v) * 2_147_483_647.0).round() as i32).to_le_bytes());
        }
        SampleFormat::F32le => out[..4].copy_from_slice(&value.to_le_bytes()),
    }
}

fn factors(volume: &ChannelVolumes, channels: usize) -> Vec<f32> {
    (0..channels)
        .map(|c| volume.get(c).unwrap_or(Volume::NORM).to_linear() as f32)
        .collect()
}

/// Fill `data` with the format's silence
pub fn silence(data: &mut [u8], spec: &SampleSpec) {
    data.fill(spec.format.silence_byte());
}

/// Scale interleaved samples in place by a per-channel volume
pub fn apply_volume(data: &mut [u8], spec: &SampleSpec, volume: &ChannelVolumes) {
    if volume.is_norm() {
        return;
    }
    if volume.is_muted() {
        silence(data, spec);
        return;
    }

    let size = spec.format.sample_size();
    let channels = usize::from(spec.channels).max(1);
    let gains = factors(volume, channels);

    for (i, sample) in data.chunks_exact_mut(size).enumerate() {
        let scaled = decode(spec.format, sample) * gains[i % channels];
        encode(spec.format, scaled, sample);
    }
}

/// One contribution to a mix
pub struct MixInput<'a> {
    /// Interleaved samples in the device's spec
    pub data: &'a [u8],
    /// Volume the stream wants applied
    pub volume: &'a ChannelVolumes,
}

/// Mix `length` bytes of every input, then apply the device volume.
///
/// Inputs shorter than `length` contribute silence for the remainder.
pub fn mix(
    inputs: &[MixInput<'_>],
    length: usize,
    spec: &SampleSpec,
    device_volume: &ChannelVolumes,
    muted: bool,
) -> Vec<u8> {
    let length = spec.frame_align(length);
    let mut out = vec![spec.format.silence_byte(); length];
    if muted || inputs.is_empty() {
        return out;
    }

    let size = spec.format.sample_size();
    let channels = usize::from(spec.channels).max(1);
    let device_gains = factors(device_volume, channels);
    let mut acc = vec![0f32; length / size];

    for input in inputs {
        let gains = factors(input.volume, channels);
        for (i, sample) in input.data[..input.data.len().min(length)]
            .chunks_exact(size)
            .enumerate()
        {
            acc[i] += decode(spec.format, sample) * gains[i % channels];
        }
    }

    for (i, sample) in out.chunks_exact_mut(size).enumerate() {
        encode(spec.format, acc[i] * device_gains[i % channels], sample);
    }
    out
}
