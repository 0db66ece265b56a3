//! Stream state owned by a device context.
//!
//! While a stream is attached, its render queue, resampler and rewind
//! bookkeeping live on the device thread and are never touched by the control
//! context. During a move the whole [`StreamThreadInfo`] travels back to the
//! control context and on to the destination device.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::sync::mpsc;
use tracing::{trace, warn};

use super::StreamState;
use crate::{
    arena::StreamIndex,
    backend::{CaptureSink, PlaybackSource},
    mix,
    render_queue::RenderQueue,
    resample::Resampler,
    sample::SampleSpec,
    volume::{ChannelMap, ChannelVolumes},
};

/// Render queue capacity
pub(crate) const MAX_QUEUE_LENGTH: usize = 32 * 1024 * 1024;

const CONVERT_BLOCK: usize = 64 * 1024;

/// Data end of a stream
pub enum StreamIo {
    /// Producer feeding a playback stream
    Playback(Box<dyn PlaybackSource>),
    /// Consumer fed by a capture stream
    Capture(Box<dyn CaptureSink>),
}

impl fmt::Debug for StreamIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Playback(_) => write!(f, "StreamIo::Playback"),
            Self::Capture(_) => write!(f, "StreamIo::Capture"),
        }
    }
}

/// Bytes the producer must render again after the next device rewind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Rewrite {
    /// Rewrite this many bytes (in device domain)
    Bytes(usize),
    /// Throw away everything not yet played
    Discard,
}

/// Stream state owned by the device thread
pub(crate) struct StreamThreadInfo {
    pub(crate) index: StreamIndex,
    pub(crate) state: StreamState,
    pub(crate) spec: SampleSpec,
    pub(crate) map: ChannelMap,
    pub(crate) device_spec: SampleSpec,
    pub(crate) device_map: ChannelMap,
    pub(crate) soft_volume: ChannelVolumes,
    pub(crate) muted: bool,
    pub(crate) volume_factor_device: ChannelVolumes,
    pub(crate) resampler: Option<Box<dyn Resampler>>,
    pub(crate) queue: RenderQueue,
    pub(crate) io: StreamIo,
    pub(crate) requested_latency: Option<Duration>,
    pub(crate) rewrite: Rewrite,
    pub(crate) rewrite_flush: bool,
    pub(crate) dont_rewind_render: bool,
    pub(crate) underrun_for: Option<u64>,
    pub(crate) underrun_for_device: u64,
    pub(crate) playing_for: u64,
    pub(crate) drained: Arc<AtomicBool>,
    pub(crate) direct_taps: Vec<(StreamIndex, mpsc::UnboundedSender<Vec<u8>>)>,
    pub(crate) direct_input: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl fmt::Debug for StreamThreadInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamThreadInfo")
            .field("index", &self.index)
            .field("state", &self.state)
            .field("spec", &self.spec)
            .field("device_spec", &self.device_spec)
            .field("queued", &self.queue.length())
            .field("rewrite", &self.rewrite)
            .field("playing_for", &self.playing_for)
            .finish_non_exhaustive()
    }
}

impl StreamThreadInfo {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        index: StreamIndex,
        spec: SampleSpec,
        map: ChannelMap,
        device_spec: SampleSpec,
        device_map: ChannelMap,
        io: StreamIo,
        resampler: Option<Box<dyn Resampler>>,
        drained: Arc<AtomicBool>,
    ) -> Self {
        let channels = map.channels();
        let device_channels = device_map.channels();
        Self {
            index,
            state: StreamState::Init,
            spec,
            map,
            queue: RenderQueue::new(MAX_QUEUE_LENGTH, 0, device_spec.format.silence_byte()),
            device_spec,
            device_map,
            soft_volume: ChannelVolumes::norm(channels),
            muted: false,
            volume_factor_device: ChannelVolumes::norm(device_channels),
            resampler,
            io,
            requested_latency: None,
            rewrite: Rewrite::Bytes(0),
            rewrite_flush: false,
            dont_rewind_render: false,
            underrun_for: None,
            underrun_for_device: 0,
            playing_for: 0,
            drained,
            direct_taps: Vec::new(),
            direct_input: None,
        }
    }

    pub(crate) fn is_playback(&self) -> bool {
        matches!(self.io, StreamIo::Playback(_))
    }

    /// Stream-domain bytes to device-domain bytes
    fn to_device_bytes(&self, nbytes: usize) -> usize {
        self.resampler.as_ref().map_or(nbytes, |r| r.result(nbytes))
    }

    /// Device-domain bytes to stream-domain bytes
    fn to_stream_bytes(&self, nbytes: usize) -> usize {
        self.resampler.as_ref().map_or(nbytes, |r| r.request(nbytes))
    }

    /// Peek up to `length` device-domain bytes, pulling from the producer as needed.
    ///
    /// Returns the data and the volume the mixer should apply to it. When the
    /// stream's channel layout differs from the device's, the stream volume
    /// has already been applied and the returned volume is unity.
    pub(crate) fn peek(&mut self, length: usize) -> (Vec<u8>, ChannelVolumes) {
        let device_channels = self.device_map.channels();
        let length = self
            .device_spec
            .frame_align(length)
            .max(self.device_spec.frame_size());
        let adjust_here = self.map != self.device_map;
        let volume_is_norm = self.soft_volume.is_norm() && !self.muted;
        let need_factor = !self.volume_factor_device.is_norm();

        let mut ilength = self.to_stream_bytes(length);
        if ilength == 0 {
            ilength = self.spec.frame_align(CONVERT_BLOCK);
        }
        if let Some(resampler) = &self.resampler {
            ilength = ilength.min(resampler.max_block_size().max(self.spec.frame_size()));
        }

        while !self.queue.is_readable() {
            let chunk = match (&mut self.io, self.state) {
                (StreamIo::Playback(source), StreamState::Running) => {
                    source.pop(ilength).filter(|c| !c.is_empty())
                }
                _ => None,
            };

            let Some(mut chunk) = chunk else {
                self.drained.store(true, Ordering::Release);
                self.queue.seek(length as i64);
                self.playing_for = 0;
                if let Some(underrun) = self.underrun_for.as_mut() {
                    *underrun += ilength as u64;
                    self.underrun_for_device += length as u64;
                }
                break;
            };

            self.drained.store(false, Ordering::Release);
            self.underrun_for = Some(0);
            self.underrun_for_device = 0;
            self.playing_for += chunk.len() as u64;

            let mut apply_factor = need_factor;
            if adjust_here && !volume_is_norm {
                if self.muted {
                    mix::silence(&mut chunk, &self.spec);
                    apply_factor = false;
                } else {
                    mix::apply_volume(&mut chunk, &self.spec, &self.soft_volume);
                }
            }

            let mut converted = match self.resampler.as_mut() {
                Some(resampler) => resampler.run(&chunk),
                None => chunk,
            };
            if converted.is_empty() {
                trace!(stream = %self.index, "Resampler produced nothing, rendering silence");
                self.queue.seek(length as i64);
                break;
            }
            if apply_factor {
                mix::apply_volume(&mut converted, &self.device_spec, &self.volume_factor_device);
            }

            if let Err(e) = self.queue.push(&converted) {
                warn!(stream = %self.index, error = %e, "Render queue overflow");
                break;
            }
        }

        let data = self.queue.peek(length).map(<[u8]>::to_vec).unwrap_or_default();
        let volume = if adjust_here {
            ChannelVolumes::norm(device_channels)
        } else if self.muted {
            ChannelVolumes::muted(device_channels)
        } else {
            self.soft_volume.clone()
        };
        (data, volume)
    }

    /// Consume `nbytes` peeked bytes
    pub(crate) fn drop_bytes(&mut self, nbytes: usize) {
        self.queue.drop_bytes(nbytes);
    }

    /// Peek and consume exactly `length` bytes, padding with silence
    pub(crate) fn render(&mut self, length: usize) -> (Vec<u8>, ChannelVolumes) {
        let length = self.device_spec.frame_align(length);
        let mut out = Vec::with_capacity(length);
        let mut volume = ChannelVolumes::norm(self.device_map.channels());

        while out.len() < length {
            let (chunk, chunk_volume) = self.peek(length - out.len());
            if chunk.is_empty() {
                break;
            }
            let take = chunk.len().min(length - out.len());
            out.extend_from_slice(&chunk[..take]);
            self.drop_bytes(take);
            volume = chunk_volume;
        }

        out.resize(length, self.device_spec.format.silence_byte());
        (out, volume)
    }

    /// Ask the device to rewind so this stream's data can be rewritten.
    ///
    /// `nbytes == 0` means as much as possible. Returns the device rewind
    /// needed, or `None` if no new device rewind is required.
    pub(crate) fn request_rewind(
        &mut self,
        nbytes: usize,
        rewrite: bool,
        flush: bool,
        dont_rewind_render: bool,
        device_max_rewind: usize,
    ) -> Option<usize> {
        debug_assert!(rewrite || flush);

        if self.state == StreamState::Corked {
            return None;
        }

        let mut wanted = match self.rewrite {
            Rewrite::Discard => None,
            Rewrite::Bytes(pending) => Some(pending.max(nbytes)),
        };

        let local = if rewrite { self.queue.length() } else { 0 };

        if wanted == Some(0) {
            let max = device_max_rewind + local;
            wanted = Some(self.to_stream_bytes(max));
        }

        if let (Rewrite::Bytes(_), Some(n)) = (self.rewrite, wanted) {
            if rewrite {
                let capped = n.min(usize::try_from(self.playing_for).unwrap_or(usize::MAX));
                self.rewrite = Rewrite::Bytes(capped);
                wanted = Some(capped);
            } else {
                self.rewrite = Rewrite::Discard;
            }
        }

        self.rewrite_flush |= flush;
        self.dont_rewind_render |= dont_rewind_render;

        let n = self.to_device_bytes(wanted?);
        trace!(stream = %self.index, n, local, "Rewind requested");
        Some(n.saturating_sub(local))
    }

    /// The device rewound by `nbytes`; rewrite whatever was requested
    pub(crate) fn process_rewind(&mut self, nbytes: usize) {
        let local = self.queue.length();

        if nbytes > 0 && !self.dont_rewind_render {
            trace!(stream = %self.index, nbytes, "Rewinding render queue");
            self.queue.rewind(nbytes);
        }

        let mut called = false;
        match self.rewrite {
            Rewrite::Discard => self.queue.flush_write(),
            Rewrite::Bytes(pending) if pending > 0 => {
                let max_rewrite = self.to_stream_bytes(nbytes + local);
                let amount = pending.min(max_rewrite);

                if amount > 0 {
                    trace!(stream = %self.index, amount, "Producer rewrites");
                    if let StreamIo::Playback(source) = &mut self.io {
                        source.process_rewind(amount);
                    }
                    called = true;

                    let amount = self.to_device_bytes(amount);
                    self.queue.seek(-(amount as i64));
                    if self.rewrite_flush {
                        self.queue.silence();
                    }
                    if let Some(resampler) = self.resampler.as_mut() {
                        resampler.reset();
                    }
                }
            }
            Rewrite::Bytes(_) => {}
        }

        if !called {
            if let StreamIo::Playback(source) = &mut self.io {
                source.process_rewind(0);
            }
        }

        self.rewrite = Rewrite::Bytes(0);
        self.rewrite_flush = false;
        self.dont_rewind_render = false;
    }

    /// Underrun report from the device; `true` if data will arrive soon
    pub(crate) fn process_underrun(&mut self) -> bool {
        if self.queue.is_readable() {
            return false;
        }
        match &mut self.io {
            StreamIo::Playback(source) => source.process_underrun(),
            StreamIo::Capture(_) => false,
        }
    }

    /// Apply a cork or uncork; returns a device rewind request
    pub(crate) fn set_state(&mut self, state: StreamState, device_max_rewind: usize) -> Option<usize> {
        if state == self.state {
            return None;
        }
        if !self.is_playback() {
            self.state = state;
            return None;
        }

        let corking = state == StreamState::Corked && self.state != StreamState::Corked;
        let uncorking = self.state == StreamState::Corked && state == StreamState::Running;
        let mut rewind = None;

        if corking {
            rewind = self.request_rewind(0, true, true, false, device_max_rewind);
            self.state = state;
        } else if uncorking {
            self.underrun_for = None;
            self.underrun_for_device = 0;
            self.playing_for = 0;
            self.drained.store(true, Ordering::Release);
            self.state = state;
            rewind = self.request_rewind(0, false, true, true, device_max_rewind);
        } else {
            self.state = state;
        }

        rewind
    }

    /// Change the software volume; returns a device rewind request
    pub(crate) fn set_soft_volume(
        &mut self,
        volume: ChannelVolumes,
        factor_device: ChannelVolumes,
        device_max_rewind: usize,
    ) -> Option<usize> {
        if self.soft_volume == volume && self.volume_factor_device == factor_device {
            return None;
        }
        self.soft_volume = volume;
        self.volume_factor_device = factor_device;
        self.rewrite_after_volume_change(device_max_rewind)
    }

    /// Change the software mute; returns a device rewind request
    pub(crate) fn set_soft_mute(&mut self, muted: bool, device_max_rewind: usize) -> Option<usize> {
        if self.muted == muted {
            return None;
        }
        self.muted = muted;
        self.rewrite_after_volume_change(device_max_rewind)
    }

    fn rewrite_after_volume_change(&mut self, device_max_rewind: usize) -> Option<usize> {
        if self.is_playback() {
            self.request_rewind(0, true, false, false, device_max_rewind)
        } else {
            None
        }
    }

    /// Feed a device-domain chunk to a capture stream
    pub(crate) fn push(&mut self, chunk: &[u8], device_max_rewind: usize) {
        if self.state == StreamState::Corked {
            return;
        }
        let StreamIo::Capture(sink) = &mut self.io else {
            return;
        };

        if let Err(e) = self.queue.push(chunk) {
            warn!(stream = %self.index, error = %e, "Capture delay queue overflow");
            self.queue.flush_read();
            return;
        }

        let limit = if sink.supports_rewind() { 0 } else { device_max_rewind };
        while self.queue.length() > limit {
            let want = self.device_spec.frame_align(self.queue.length() - limit);
            let Some(data) = self.queue.peek(want).map(<[u8]>::to_vec) else {
                break;
            };
            if data.is_empty() {
                break;
            }
            self.queue.drop_bytes(data.len());

            let mut block = data;
            if !self.volume_factor_device.is_norm() {
                mix::apply_volume(&mut block, &self.device_spec, &self.volume_factor_device);
            }
            let mut converted = match self.resampler.as_mut() {
                Some(resampler) => resampler.run(&block),
                None => block,
            };
            if converted.is_empty() {
                continue;
            }
            if self.muted {
                mix::silence(&mut converted, &self.spec);
            } else {
                mix::apply_volume(&mut converted, &self.spec, &self.soft_volume);
            }
            sink.push(&converted);
        }
    }

    /// The capture device rewound by `nbytes`
    pub(crate) fn process_capture_rewind(&mut self, nbytes: usize) {
        if nbytes == 0 {
            return;
        }
        let StreamIo::Capture(sink) = &mut self.io else {
            return;
        };
        if sink.supports_rewind() {
            let n = self.resampler.as_ref().map_or(nbytes, |r| r.result(nbytes));
            sink.process_rewind(n);
            if let Some(resampler) = self.resampler.as_mut() {
                resampler.reset();
            }
        } else {
            self.queue.rewind(nbytes);
        }
    }

    /// The device changed how far it can rewind
    pub(crate) fn update_max_rewind(&mut self, nbytes: usize) {
        self.queue.set_max_rewind(nbytes);
    }

    /// Audio buffered by this stream, as playback time
    pub(crate) fn latency(&self) -> Duration {
        self.device_spec.bytes_to_duration(self.queue.length())
    }

    /// Swap the converter after the device or stream spec changed
    pub(crate) fn replace_resampler(
        &mut self,
        resampler: Option<Box<dyn Resampler>>,
        device_spec: SampleSpec,
        device_map: ChannelMap,
    ) {
        self.resampler = resampler;
        self.volume_factor_device = self
            .volume_factor_device
            .remap(&self.device_map, &device_map);
        self.device_spec = device_spec;
        self.device_map = device_map;
        let max_rewind = self.queue.max_rewind();
        self.queue = RenderQueue::new(MAX_QUEUE_LENGTH, max_rewind, device_spec.format.silence_byte());
    }

    /// New input rate of a variable-rate stream
    pub(crate) fn set_rate(&mut self, rate: u32) {
        self.spec.rate = rate;
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.set_input_rate(rate);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{arena::ArenaKey, sample::SampleFormat};

    struct Tone {
        rewound: Arc<Mutex<Vec<usize>>>,
    }

    impl PlaybackSource for Tone {
        fn pop(&mut self, nbytes: usize) -> Option<Vec<u8>> {
            Some(vec![1; nbytes.min(1024)])
        }

        fn process_rewind(&mut self, nbytes: usize) {
            self.rewound.lock().unwrap().push(nbytes);
        }
    }

    struct Collect(Arc<Mutex<Vec<u8>>>);

    impl CaptureSink for Collect {
        fn push(&mut self, chunk: &[u8]) {
            self.0.lock().unwrap().extend_from_slice(chunk);
        }
    }

    fn index() -> StreamIndex {
        StreamIndex::from_parts(0, 0)
    }

    fn spec() -> SampleSpec {
        SampleSpec::new(SampleFormat::S16le, 48_000, 2)
    }

    fn playback(rewound: Arc<Mutex<Vec<usize>>>) -> StreamThreadInfo {
        let mut info = StreamThreadInfo::new(
            index(),
            spec(),
            ChannelMap::stereo(),
            spec(),
            ChannelMap::stereo(),
            StreamIo::Playback(Box::new(Tone { rewound })),
            None,
            Arc::new(AtomicBool::new(true)),
        );
        info.state = StreamState::Running;
        info
    }

    #[test]
    fn peek_pulls_from_producer() {
        let mut info = playback(Arc::default());
        let (data, volume) = info.peek(512);
        assert_eq!(data, vec![1; 512]);
        assert!(volume.is_norm());
        assert!(!info.drained.load(Ordering::Acquire));
        assert_eq!(info.underrun_for, Some(0));
        assert_eq!(info.playing_for, 512);
    }

    /// Swallows everything it is given
    struct Starved {
        map: ChannelMap,
    }

    impl Resampler for Starved {
        fn run(&mut self, _input: &[u8]) -> Vec<u8> {
            Vec::new()
        }

        fn max_block_size(&self) -> usize {
            4096
        }

        fn request(&self, out_bytes: usize) -> usize {
            out_bytes
        }

        fn result(&self, in_bytes: usize) -> usize {
            in_bytes
        }

        fn reset(&mut self) {}

        fn set_input_rate(&mut self, _rate: u32) {}

        fn output_spec(&self) -> SampleSpec {
            spec()
        }

        fn output_map(&self) -> &ChannelMap {
            &self.map
        }
    }

    #[test]
    fn empty_conversion_renders_silence() {
        let mut info = StreamThreadInfo::new(
            index(),
            spec(),
            ChannelMap::stereo(),
            spec(),
            ChannelMap::stereo(),
            StreamIo::Playback(Box::new(Tone { rewound: Arc::default() })),
            Some(Box::new(Starved { map: ChannelMap::stereo() })),
            Arc::new(AtomicBool::new(true)),
        );
        info.state = StreamState::Running;

        let (data, _) = info.peek(256);
        assert_eq!(data, vec![0; 256]);
    }

    #[test]
    fn corked_stream_renders_silence_and_drains() {
        let mut info = playback(Arc::default());
        info.state = StreamState::Corked;
        let (data, _) = info.render(256);
        assert_eq!(data, vec![0; 256]);
        assert!(info.drained.load(Ordering::Acquire));
        assert_eq!(info.playing_for, 0);
    }

    #[test]
    fn muted_stream_reports_muted_volume() {
        let mut info = playback(Arc::default());
        info.muted = true;
        let (_, volume) = info.peek(64);
        assert!(volume.is_muted());
    }

    #[test]
    fn rewrite_never_exceeds_what_was_played() {
        let rewound = Arc::new(Mutex::new(Vec::new()));
        let mut info = playback(rewound.clone());

        info.queue.push(&[1; 4096]).unwrap();
        info.playing_for = 8192;
        let before = info.queue.length();

        let device_rewind = info.request_rewind(2048, true, false, false, 0);
        assert_eq!(device_rewind, Some(0));
        assert_eq!(info.rewrite, Rewrite::Bytes(2048));

        info.process_rewind(0);
        let after = info.queue.length();
        assert!(before - after <= 2048);
        let total: usize = rewound.lock().unwrap().iter().sum();
        assert_eq!(total, 2048);
        assert!(total as u64 <= info.playing_for);
        assert_eq!(info.rewrite, Rewrite::Bytes(0));
    }

    #[test]
    fn rewrite_is_capped_by_playing_for() {
        let mut info = playback(Arc::default());
        info.queue.push(&[1; 4096]).unwrap();
        info.playing_for = 1000;

        info.request_rewind(2048, true, false, false, 0);
        assert_eq!(info.rewrite, Rewrite::Bytes(1000));
    }

    #[test]
    fn flush_only_request_discards() {
        let mut info = playback(Arc::default());
        info.queue.push(&[1; 4096]).unwrap();

        let device_rewind = info.request_rewind(512, false, true, false, 0);
        assert_eq!(device_rewind, Some(512));
        assert_eq!(info.rewrite, Rewrite::Discard);

        info.process_rewind(0);
        assert_eq!(info.queue.length(), 0);
    }

    #[test]
    fn corked_stream_ignores_rewind_requests() {
        let mut info = playback(Arc::default());
        info.state = StreamState::Corked;
        assert_eq!(info.request_rewind(128, true, false, false, 0), None);
        assert_eq!(info.rewrite, Rewrite::Bytes(0));
    }

    #[test]
    fn uncork_resets_underrun_tracking() {
        let mut info = playback(Arc::default());
        info.state = StreamState::Corked;
        info.underrun_for = Some(4);
        info.playing_for = 99;

        info.set_state(StreamState::Running, 0);
        assert_eq!(info.state, StreamState::Running);
        assert_eq!(info.underrun_for, None);
        assert_eq!(info.playing_for, 0);
        assert!(info.dont_rewind_render);
    }

    #[test]
    fn capture_push_applies_soft_volume_and_mute() {
        let collected = Arc::new(Mutex::new(Vec::new()));
        let mut info = StreamThreadInfo::new(
            index(),
            spec(),
            ChannelMap::stereo(),
            spec(),
            ChannelMap::stereo(),
            StreamIo::Capture(Box::new(Collect(collected.clone()))),
            None,
            Arc::new(AtomicBool::new(false)),
        );
        info.state = StreamState::Running;

        info.push(&[0x10, 0x00, 0x10, 0x00], 0);
        assert_eq!(*collected.lock().unwrap(), vec![0x10, 0x00, 0x10, 0x00]);

        info.muted = true;
        info.push(&[0x10, 0x00, 0x10, 0x00], 0);
        assert_eq!(collected.lock().unwrap()[4..], [0, 0, 0, 0]);

        info.state = StreamState::Corked;
        info.push(&[1, 1, 1, 1], 0);
        assert_eq!(collected.lock().unwrap().len(), 8);
    }
}
