//! The per-device processing thread.
//!
//! Each device runs its I/O on a dedicated OS thread driving a single-threaded
//! tokio runtime. The thread owns the attached streams' render state and only
//! talks to the control context through its call/notice channel, so nothing
//! here is shared except the hardware control surface.

use std::{
    collections::BTreeMap,
    sync::Arc,
    thread::JoinHandle,
    time::Duration,
};

use tokio::time::Instant;
use tracing::{debug, instrument, trace, warn};

use super::{
    ControlNotice, DeviceCall, DeviceKind, DeviceNotice, DeviceState, HardwareVolume, LatencyRange,
    VolumeChangeScheduler, VolumeSync,
};
use crate::{
    arena::{DeviceIndex, StreamIndex},
    backend::{DeviceIo, HardwareControl},
    channel::{AsyncReceiver, Incoming, NoticeSender},
    error::HardwareError,
    mix::{self, MixInput},
    sample::SampleSpec,
    stream::StreamThreadInfo,
    volume::{ChannelMap, ChannelVolumes},
};

/// Everything a device thread starts from
pub(crate) struct ThreadSetup {
    pub(crate) index: DeviceIndex,
    pub(crate) name: String,
    pub(crate) kind: DeviceKind,
    pub(crate) spec: SampleSpec,
    pub(crate) map: ChannelMap,
    pub(crate) io: Box<dyn DeviceIo>,
    pub(crate) hardware: Option<Arc<dyn HardwareControl>>,
    pub(crate) latency_range: LatencyRange,
    pub(crate) fixed_latency: Duration,
    pub(crate) dynamic_latency: bool,
    pub(crate) latency_offset: i64,
    pub(crate) cycle: Duration,
    pub(crate) safety_margin_usec: u64,
    pub(crate) extra_delay_usec: u64,
    pub(crate) notices: NoticeSender<ControlNotice>,
}

/// State owned by a device thread
pub(crate) struct DeviceThread {
    index: DeviceIndex,
    name: String,
    kind: DeviceKind,
    state: DeviceState,
    spec: SampleSpec,
    io: Box<dyn DeviceIo>,
    hardware: Option<Arc<dyn HardwareControl>>,
    streams: BTreeMap<StreamIndex, Box<StreamThreadInfo>>,
    soft_volume: ChannelVolumes,
    real_volume: ChannelVolumes,
    soft_muted: bool,
    deferred_volume: bool,
    volume_changes: VolumeChangeScheduler,
    latency_range: LatencyRange,
    fixed_latency: Duration,
    dynamic_latency: bool,
    latency_offset: i64,
    max_rewind: usize,
    rewind_request: Option<usize>,
    cycle: Duration,
    polling_mixer: bool,
    notices: NoticeSender<ControlNotice>,
    epoch: Instant,
}

impl DeviceThread {
    pub(crate) fn new(setup: ThreadSetup) -> Self {
        let channels = setup.map.channels();
        let max_rewind = setup.io.max_rewind();
        Self {
            index: setup.index,
            name: setup.name,
            kind: setup.kind,
            state: DeviceState::Init,
            spec: setup.spec,
            io: setup.io,
            hardware: setup.hardware,
            streams: BTreeMap::new(),
            soft_volume: ChannelVolumes::norm(channels),
            real_volume: ChannelVolumes::norm(channels),
            soft_muted: false,
            deferred_volume: false,
            volume_changes: VolumeChangeScheduler::new(
                ChannelVolumes::norm(channels),
                setup.safety_margin_usec,
                setup.extra_delay_usec,
            ),
            latency_range: setup.latency_range,
            fixed_latency: setup.fixed_latency,
            dynamic_latency: setup.dynamic_latency,
            latency_offset: setup.latency_offset,
            max_rewind,
            rewind_request: None,
            cycle: setup.cycle.max(Duration::from_millis(1)),
            polling_mixer: true,
            notices: setup.notices,
            epoch: Instant::now(),
        }
    }

    /// Start the thread, named after the device
    ///
    /// # Errors
    /// Returns error if the OS refuses to create the thread.
    pub(crate) fn spawn(self, receiver: AsyncReceiver<DeviceCall, DeviceNotice>) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name(format!("mixcore-{}", self.name))
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        warn!(error = %e, "Cannot start device runtime");
                        return;
                    }
                };
                runtime.block_on(self.run(receiver));
            })
    }

    #[instrument(skip_all, fields(device = %self.index, name = %self.name))]
    async fn run(mut self, mut receiver: AsyncReceiver<DeviceCall, DeviceNotice>) {
        debug!("Device thread started");
        let mut next_cycle = Instant::now() + self.cycle;

        loop {
            let deadline = self
                .next_volume_change()
                .map_or(next_cycle, |at| at.min(next_cycle));

            tokio::select! {
                incoming = receiver.recv() => match incoming {
                    Some(Incoming::Call(call)) => self.handle_call(call),
                    Some(Incoming::Notice(DeviceNotice::Shutdown)) | None => break,
                    Some(Incoming::Notice(notice)) => self.handle_notice(notice),
                },
                () = tokio::time::sleep_until(deadline) => {}
            }

            if let Some(nbytes) = self.rewind_request.take() {
                self.process_rewind(nbytes);
            }

            let now = Instant::now();
            if now >= next_cycle {
                self.process_cycle();
                next_cycle = now + self.cycle;
            }

            self.apply_volume_changes();
        }

        self.streams.clear();
        debug!("Device thread stopped");
    }

    fn now_usec(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_micros()).unwrap_or(u64::MAX)
    }

    fn next_volume_change(&self) -> Option<Instant> {
        self.volume_changes
            .pending()
            .next()
            .map(|change| self.epoch + Duration::from_micros(change.at))
    }

    fn handle_call(&mut self, call: DeviceCall) {
        match call {
            DeviceCall::Put {
                state,
                deferred_volume,
                soft_volume,
                real_volume,
                muted,
                reply,
            } => {
                self.deferred_volume = deferred_volume;
                self.volume_changes
                    .set_current_hw_volume(real_volume.divide(&soft_volume));
                self.soft_volume = soft_volume;
                self.real_volume = real_volume;
                self.soft_muted = muted;
                self.set_state(state);
                reply.send(());
            }
            DeviceCall::SetState { state, reply } => {
                self.set_state(state);
                reply.send(());
            }
            DeviceCall::AddStream { mut info, reply } => {
                info.update_max_rewind(self.max_rewind);
                trace!(stream = %info.index, "Stream attached");
                self.streams.insert(info.index, info);
                reply.send(());
            }
            DeviceCall::RemoveStream { stream, reply } => {
                reply.send(self.remove_stream(stream));
            }
            DeviceCall::SyncVolumes { sync, reply } => {
                self.sync_volumes(sync);
                reply.send(self.soft_volume.clone());
            }
            DeviceCall::GetVolume { reply } => {
                reply.send(self.read_hardware_volume());
            }
            DeviceCall::SetMute { muted, reply } => {
                self.set_mute(muted);
                reply.send(());
            }
            DeviceCall::GetMute { reply } => {
                let muted = match (&self.hardware, self.deferred_volume) {
                    (Some(hardware), true) => hardware.get_mute().ok(),
                    _ => None,
                };
                reply.send(muted);
            }
            DeviceCall::SetPort { port, reply } => {
                let result = match &self.hardware {
                    Some(hardware) => hardware.set_port(&port),
                    None => Err(HardwareError::NotImplemented),
                };
                reply.send(result);
            }
            DeviceCall::SetStreamState {
                streams,
                state,
                reply,
            } => {
                for stream in streams {
                    let rewind = self
                        .streams
                        .get_mut(&stream)
                        .and_then(|info| info.set_state(state, self.max_rewind));
                    self.request_rewind(rewind);
                }
                reply.send(());
            }
            DeviceCall::SetStreamVolume {
                stream,
                soft_volume,
                volume_factor_device,
                reply,
            } => {
                let rewind = self.streams.get_mut(&stream).and_then(|info| {
                    info.set_soft_volume(soft_volume, volume_factor_device, self.max_rewind)
                });
                self.request_rewind(rewind);
                reply.send(());
            }
            DeviceCall::SetStreamMute {
                stream,
                muted,
                reply,
            } => {
                let rewind = self
                    .streams
                    .get_mut(&stream)
                    .and_then(|info| info.set_soft_mute(muted, self.max_rewind));
                self.request_rewind(rewind);
                reply.send(());
            }
            DeviceCall::ReplaceResampler {
                stream,
                resampler,
                device_spec,
                device_map,
                reply,
            } => {
                if let Some(info) = self.streams.get_mut(&stream) {
                    info.replace_resampler(resampler, device_spec, device_map);
                    info.update_max_rewind(self.max_rewind);
                }
                reply.send(());
            }
            DeviceCall::AttachDirectTap {
                stream,
                capture,
                tap,
                reply,
            } => {
                if let Some(info) = self.streams.get_mut(&stream) {
                    info.direct_taps.push((capture, tap));
                }
                reply.send(());
            }
            DeviceCall::DetachDirectTap {
                stream,
                capture,
                reply,
            } => {
                if let Some(info) = self.streams.get_mut(&stream) {
                    info.direct_taps.retain(|(index, _)| *index != capture);
                }
                reply.send(());
            }
            DeviceCall::SetLatencyRange { range, reply } => {
                self.latency_range = range;
                reply.send(());
            }
            DeviceCall::SetFixedLatency { latency, reply } => {
                self.fixed_latency = latency;
                reply.send(());
            }
            DeviceCall::SetLatencyOffset { offset, reply } => {
                self.latency_offset = offset;
                reply.send(());
            }
            DeviceCall::GetLatency { reply } => {
                reply.send(self.latency());
            }
            DeviceCall::GetRequestedLatency { reply } => {
                reply.send(self.requested_latency());
            }
            DeviceCall::GetStreamLatency { stream, reply } => {
                let device_latency = self.latency();
                reply.send(
                    self.streams
                        .get(&stream)
                        .map(|info| (info.latency(), device_latency)),
                );
            }
            DeviceCall::SetRequestedLatency {
                stream,
                latency,
                reply,
            } => {
                let latency = self.clamp_requested_latency(latency);
                if let Some(info) = self.streams.get_mut(&stream) {
                    info.requested_latency = latency;
                }
                reply.send(latency);
            }
        }
    }

    fn handle_notice(&mut self, notice: DeviceNotice) {
        match notice {
            DeviceNotice::SetStreamRate { stream, rate } => {
                if let Some(info) = self.streams.get_mut(&stream) {
                    info.set_rate(rate);
                }
            }
            DeviceNotice::RateChanged(rate) => {
                debug!(rate, "Hardware rate changed");
                self.spec.rate = rate;
            }
            DeviceNotice::Shutdown => {}
        }
    }

    fn set_state(&mut self, state: DeviceState) {
        if self.state == state {
            return;
        }
        debug!(from = %self.state, to = %state, "Device state");
        self.state = state;
        self.io.state_changed(state);
    }

    fn remove_stream(&mut self, stream: StreamIndex) -> Option<Box<StreamThreadInfo>> {
        let mut info = self.streams.remove(&stream)?;

        if self.kind == DeviceKind::Output && self.state.is_opened() {
            // Take back what the hardware has not played yet so the remaining
            // streams are re-rendered and the removed one keeps its audio.
            let reclaimed = self.io.rewind(self.max_rewind);
            if reclaimed > 0 {
                for other in self.streams.values_mut() {
                    other.process_rewind(reclaimed);
                }
                info.queue.rewind(reclaimed);
            }
        }

        for other in self.streams.values_mut() {
            other.direct_taps.retain(|(capture, _)| *capture != stream);
        }

        trace!(%stream, "Stream detached");
        Some(info)
    }

    fn sync_volumes(&mut self, sync: VolumeSync) {
        for entry in sync.streams {
            let rewind = self.streams.get_mut(&entry.stream).and_then(|info| {
                let factor = info.volume_factor_device.clone();
                info.set_soft_volume(entry.soft_volume, factor, self.max_rewind)
            });
            self.request_rewind(rewind);
        }

        self.real_volume = sync.real_volume;
        let previous = self.soft_volume.clone();

        match (&self.hardware, self.deferred_volume) {
            (Some(hardware), true) => {
                match hardware.set_volume(&self.real_volume) {
                    Ok(achieved) => {
                        self.soft_volume = self.real_volume.divide(&achieved);
                    }
                    Err(e) => {
                        warn!(error = %e, "Deferred hardware volume failed, using software volume");
                        self.soft_volume = self.real_volume.clone();
                    }
                }
                let hw_volume = self.real_volume.divide(&self.soft_volume);
                let now = self.now_usec();
                let latency = u64::try_from(self.latency().as_micros()).unwrap_or(u64::MAX);
                self.volume_changes.push(hw_volume, now, latency);
            }
            _ => self.soft_volume = sync.soft_volume,
        }

        if previous != self.soft_volume && self.kind == DeviceKind::Output && !self.deferred_volume {
            self.request_rewind(Some(self.max_rewind));
        }
    }

    fn read_hardware_volume(&mut self) -> Option<HardwareVolume> {
        let hardware = self.hardware.as_ref().filter(|_| self.deferred_volume)?;
        match hardware.get_volume() {
            Ok(hw_volume) => {
                if &hw_volume != self.volume_changes.current_hw_volume() {
                    // Changed behind our back; software no longer compensates.
                    self.real_volume = hw_volume.clone();
                    self.soft_volume = ChannelVolumes::norm(hw_volume.channels());
                }
                self.volume_changes.flush();
                self.volume_changes.set_current_hw_volume(hw_volume);
                Some(HardwareVolume {
                    real_volume: self.real_volume.clone(),
                    soft_volume: self.soft_volume.clone(),
                })
            }
            Err(e) => {
                debug!(error = %e, "Hardware volume unreadable");
                None
            }
        }
    }

    fn set_mute(&mut self, muted: bool) {
        let changed = self.soft_muted != muted;
        self.soft_muted = muted;

        if let (Some(hardware), true) = (&self.hardware, self.deferred_volume) {
            if let Err(e) = hardware.set_mute(muted) {
                debug!(error = %e, "Hardware mute failed");
            }
        }

        if changed && self.kind == DeviceKind::Output {
            self.request_rewind(Some(self.max_rewind));
        }
    }

    fn request_rewind(&mut self, nbytes: Option<usize>) {
        let Some(nbytes) = nbytes else {
            return;
        };
        let nbytes = nbytes.min(self.max_rewind);
        match self.rewind_request {
            Some(pending) if nbytes <= pending => {}
            _ => self.rewind_request = Some(nbytes),
        }
    }

    fn process_rewind(&mut self, nbytes: usize) {
        let reclaimed = if nbytes > 0 && self.state.is_opened() {
            self.io.rewind(nbytes)
        } else {
            0
        };
        trace!(requested = nbytes, reclaimed, "Processing rewind");

        for info in self.streams.values_mut() {
            match self.kind {
                DeviceKind::Output => info.process_rewind(reclaimed),
                DeviceKind::Input => info.process_capture_rewind(reclaimed),
            }
        }
    }

    fn process_cycle(&mut self) {
        if !self.state.is_opened() {
            return;
        }

        let length = self
            .spec
            .duration_to_bytes(self.cycle)
            .max(self.spec.frame_size());

        match self.kind {
            DeviceKind::Output => self.render_output(length),
            DeviceKind::Input => {
                self.capture_input(length);
                self.drain_direct_inputs();
            }
        }

        self.poll_mixer();
    }

    fn render_output(&mut self, length: usize) {
        let mut blocks = Vec::with_capacity(self.streams.len());

        for info in self.streams.values_mut() {
            let (data, volume) = info.render(length);

            if info.underrun_for_device > 0 && info.process_underrun() {
                trace!(stream = %info.index, "Producer expects data soon");
            }

            if !info.direct_taps.is_empty() {
                let mut tapped = data.clone();
                mix::apply_volume(&mut tapped, &self.spec, &volume);
                info.direct_taps
                    .retain(|(_, tap)| tap.send(tapped.clone()).is_ok());
            }

            blocks.push((data, volume));
        }

        let inputs: Vec<MixInput<'_>> = blocks
            .iter()
            .map(|(data, volume)| MixInput { data, volume })
            .collect();
        let mixed = mix::mix(&inputs, length, &self.spec, &self.soft_volume, self.soft_muted);
        self.io.write(&mixed);
    }

    fn capture_input(&mut self, length: usize) {
        let Some(mut data) = self.io.read(length) else {
            return;
        };
        self.apply_device_volume(&mut data);

        for info in self.streams.values_mut() {
            if info.direct_input.is_none() {
                info.push(&data, self.max_rewind);
            }
        }
    }

    fn drain_direct_inputs(&mut self) {
        for info in self.streams.values_mut() {
            let Some(direct) = info.direct_input.as_mut() else {
                continue;
            };
            let mut chunks = Vec::new();
            while let Ok(chunk) = direct.try_recv() {
                chunks.push(chunk);
            }
            for mut chunk in chunks {
                if self.soft_muted {
                    mix::silence(&mut chunk, &self.spec);
                } else {
                    mix::apply_volume(&mut chunk, &self.spec, &self.soft_volume);
                }
                info.push(&chunk, self.max_rewind);
            }
        }
    }

    fn apply_device_volume(&self, data: &mut [u8]) {
        if self.soft_muted {
            mix::silence(data, &self.spec);
        } else {
            mix::apply_volume(data, &self.spec, &self.soft_volume);
        }
    }

    fn poll_mixer(&mut self) {
        if !self.polling_mixer {
            return;
        }
        match self.io.poll_mixer() {
            Ok(true) => {
                if !self.notices.post(ControlNotice::UpdateVolumeAndMute(self.index)) {
                    trace!("Control context gone, mixer change dropped");
                }
            }
            Ok(false) => {}
            Err(e) => {
                warn!(error = %e, "Mixer polling failed, giving up on mixer events");
                self.polling_mixer = false;
            }
        }
    }

    fn apply_volume_changes(&mut self) {
        if !self.deferred_volume || self.volume_changes.is_empty() {
            return;
        }
        let now = self.now_usec();
        let hardware = self.hardware.clone();
        let (written, _) = self.volume_changes.apply(now, |volume| {
            if let Some(hardware) = hardware {
                if let Err(e) = hardware.write_volume(volume) {
                    warn!(error = %e, "Hardware volume write failed");
                }
            }
        });
        if written {
            trace!("Deferred volume written");
        }
    }

    fn latency(&self) -> Duration {
        if self.state == DeviceState::Suspended {
            return Duration::ZERO;
        }
        let latency = self.io.latency();
        let offset = Duration::from_micros(self.latency_offset.unsigned_abs());
        if self.latency_offset < 0 {
            latency.saturating_sub(offset)
        } else {
            latency.saturating_add(offset)
        }
    }

    fn clamp_requested_latency(&self, latency: Option<Duration>) -> Option<Duration> {
        let latency = if self.dynamic_latency {
            latency
        } else {
            Some(self.fixed_latency)
        };
        latency.map(|l| self.latency_range.clamp(l))
    }

    fn requested_latency(&self) -> Option<Duration> {
        if !self.dynamic_latency {
            return Some(self.latency_range.clamp(self.fixed_latency));
        }
        self.streams
            .values()
            .filter_map(|info| info.requested_latency)
            .min()
            .map(|l| self.latency_range.clamp(l))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::AtomicBool,
    };

    use super::*;
    use crate::{
        arena::ArenaKey,
        backend::PlaybackSource,
        channel::{async_channel, notice_channel},
        sample::SampleFormat,
        stream::{StreamIo, StreamState},
    };

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<u8>>>);

    impl DeviceIo for Recorder {
        fn write(&mut self, data: &[u8]) {
            self.0.lock().unwrap().extend_from_slice(data);
        }
    }

    struct Constant(u8);

    impl PlaybackSource for Constant {
        fn pop(&mut self, nbytes: usize) -> Option<Vec<u8>> {
            Some(vec![self.0; nbytes])
        }
    }

    fn spec() -> SampleSpec {
        SampleSpec::new(SampleFormat::U8, 8_000, 1)
    }

    fn thread(io: impl DeviceIo + 'static) -> DeviceThread {
        let (notices, _rx) = notice_channel();
        DeviceThread::new(ThreadSetup {
            index: DeviceIndex::from_parts(0, 0),
            name: "test".to_string(),
            kind: DeviceKind::Output,
            spec: spec(),
            map: ChannelMap::mono(),
            io: Box::new(io),
            hardware: None,
            latency_range: LatencyRange::default(),
            fixed_latency: Duration::from_millis(20),
            dynamic_latency: false,
            latency_offset: 0,
            cycle: Duration::from_millis(10),
            safety_margin_usec: 8_000,
            extra_delay_usec: 0,
            notices,
        })
    }

    fn stream(slot: u32, value: u8) -> Box<StreamThreadInfo> {
        let mut info = StreamThreadInfo::new(
            StreamIndex::from_parts(slot, 0),
            spec(),
            ChannelMap::mono(),
            spec(),
            ChannelMap::mono(),
            StreamIo::Playback(Box::new(Constant(value))),
            None,
            Arc::new(AtomicBool::new(true)),
        );
        info.state = StreamState::Running;
        Box::new(info)
    }

    #[test]
    fn running_output_mixes_attached_streams() {
        let recorder = Recorder::default();
        let mut thread = thread(recorder.clone());
        thread.set_state(DeviceState::Running);
        thread.streams.insert(StreamIndex::from_parts(1, 0), stream(1, 0x90));

        thread.process_cycle();

        let written = recorder.0.lock().unwrap();
        assert_eq!(written.len(), 80);
        assert!(written.iter().all(|b| *b == 0x90));
    }

    #[test]
    fn suspended_output_writes_nothing() {
        let recorder = Recorder::default();
        let mut thread = thread(recorder.clone());
        thread.set_state(DeviceState::Suspended);
        thread.streams.insert(StreamIndex::from_parts(1, 0), stream(1, 0x90));

        thread.process_cycle();

        assert!(recorder.0.lock().unwrap().is_empty());
        assert_eq!(thread.latency(), Duration::ZERO);
    }

    #[test]
    fn latency_offset_is_saturating() {
        let mut thread = thread(crate::backend::NullIo::with_latency(Duration::from_millis(5)));
        thread.set_state(DeviceState::Idle);
        thread.latency_offset = -10_000;
        assert_eq!(thread.latency(), Duration::ZERO);
        thread.latency_offset = 2_000;
        assert_eq!(thread.latency(), Duration::from_millis(7));
    }

    #[test]
    fn fixed_latency_devices_ignore_stream_requests() {
        let thread = thread(Recorder::default());
        assert_eq!(
            thread.clamp_requested_latency(Some(Duration::from_millis(1))),
            Some(Duration::from_millis(20))
        );
        assert_eq!(thread.requested_latency(), Some(Duration::from_millis(20)));
    }

    #[test]
    fn dynamic_latency_takes_smallest_request() {
        let mut thread = thread(Recorder::default());
        thread.dynamic_latency = true;
        thread.latency_range = LatencyRange::new(Duration::from_millis(5), Duration::from_millis(100));
        assert_eq!(thread.requested_latency(), None);

        let mut a = stream(1, 0);
        a.requested_latency = Some(Duration::from_millis(40));
        let mut b = stream(2, 0);
        b.requested_latency = Some(Duration::from_millis(1));
        thread.streams.insert(a.index, a);
        thread.streams.insert(b.index, b);

        assert_eq!(thread.requested_latency(), Some(Duration::from_millis(5)));
    }

    #[tokio::test]
    async fn answers_calls_until_shutdown() {
        let (channel, receiver) = async_channel(8);
        let handle = thread(Recorder::default())
            .spawn(receiver)
            .unwrap();

        let latency = channel
            .call(|reply| DeviceCall::GetRequestedLatency { reply })
            .await
            .unwrap();
        assert_eq!(latency, Some(Duration::from_millis(20)));

        assert!(channel.post(DeviceNotice::Shutdown));
        tokio::task::spawn_blocking(move || handle.join())
            .await
            .unwrap()
            .unwrap();
    }
}
