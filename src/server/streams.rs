//! Stream lifecycle: creation, linking, corking, teardown.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, atomic::AtomicBool},
    time::Duration,
};

use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use super::Core;
use crate::{
    arena::{DeviceIndex, StreamIndex},
    device::{DeviceCall, DeviceNotice, DeviceState},
    error::{CoreError, Result},
    events::CoreEvent,
    resample::{ResampleMethod, Resampler, ResamplerFlags, ResamplerParams},
    sample::{FormatInfo, RATE_MAX, RATE_MIN, SampleSpec},
    stream::{NewStreamData, Stream, StreamFlags, StreamKind, StreamState, StreamThreadInfo, SyncGroup},
    volume::{ChannelMap, ChannelVolumes},
};

const INITIAL_FACTOR_KEY: &str = "initial";

impl Core {
    /// Create a stream on the requested device, or the default one.
    ///
    /// The format is the first of `data`'s formats the device accepts. The
    /// stream stays invisible until [`Core::put_stream`].
    ///
    /// # Errors
    /// * `NoEntity` if the device (or sync base, or tapped stream) is missing
    /// * `BadState` if the device is not linked, or suspended and the stream
    ///   asked for `NO_CREATE_ON_SUSPEND`
    /// * `NotSupported` if no format is accepted or no resampler can be built
    /// * `Busy` on a passthrough conflict
    /// * `TooLarge` if the device carries its maximum number of streams
    #[instrument(skip(self, data), fields(name = %data.name))]
    pub async fn create_stream(&mut self, data: NewStreamData) -> Result<StreamIndex> {
        let device_kind = data.kind.device_kind();
        let device = match data.device {
            Some(device) => device,
            None => match data.kind {
                StreamKind::Playback => self.default_output(),
                StreamKind::Capture => self.default_input(),
            }
            .ok_or_else(|| CoreError::NoEntity(format!("no default {device_kind} device")))?,
        };

        let d = self.device_ref(device)?;
        if d.kind != device_kind {
            return Err(CoreError::InvalidArgument(format!(
                "{device} is not an {device_kind} device"
            )));
        }
        if !d.state.is_linked() {
            return Err(CoreError::BadState(format!("{device} is not linked")));
        }
        if d.state == DeviceState::Suspended && data.flags.contains(StreamFlags::NO_CREATE_ON_SUSPEND) {
            return Err(CoreError::BadState(format!("{device} is suspended")));
        }

        let mut spec = data.spec.unwrap_or(d.spec);
        let mut map = match data.map {
            Some(map) => map,
            None if spec.channels == d.spec.channels => d.map.clone(),
            None => ChannelMap::default_for(usize::from(spec.channels))?,
        };

        let candidates = if data.formats.is_empty() {
            vec![FormatInfo::from_sample_spec(spec, Some(map.clone()))]
        } else {
            data.formats
        };
        let format = self
            .check_formats(device, &candidates)?
            .into_iter()
            .next()
            .ok_or_else(|| CoreError::NotSupported(format!("{device} accepts none of the requested formats")))?;

        if let Some(format_spec) = format.sample_spec {
            spec = format_spec;
            map = match &format.channel_map {
                Some(format_map) => format_map.clone(),
                None => ChannelMap::default_for(usize::from(spec.channels))?,
            };
        }

        let mut flags = data.flags;
        let passthrough = format.is_passthrough() || flags.contains(StreamFlags::PASSTHROUGH);
        if passthrough {
            flags |= StreamFlags::PASSTHROUGH;
        } else {
            let d = self.device_ref(device)?;
            if flags.contains(StreamFlags::FIX_FORMAT) {
                spec.format = d.spec.format;
            }
            if flags.contains(StreamFlags::FIX_RATE) {
                spec.rate = d.spec.rate;
            }
            if flags.contains(StreamFlags::FIX_CHANNELS) {
                spec.channels = d.spec.channels;
                map = d.map.clone();
            }
        }

        if !spec.is_valid() {
            return Err(CoreError::InvalidArgument(format!("invalid sample spec {spec}")));
        }
        if !spec.matches_map(&map) {
            return Err(CoreError::InvalidArgument(format!("channel map {map} does not fit {spec}")));
        }

        self.check_passthrough_connection(device, passthrough)?;

        let d = self.device_ref(device)?;
        if d.streams.len() >= self.config().devices.max_streams_per_device {
            warn!(%device, "Too many streams");
            return Err(CoreError::TooLarge(format!("{device} carries too many streams")));
        }

        if spec.rate != d.spec.rate
            && !flags.contains(StreamFlags::VARIABLE_RATE)
            && (passthrough || d.used_by() == 0)
        {
            match self.update_rate(device, spec.rate, passthrough).await {
                Ok(_) => {}
                Err(e) if passthrough => {
                    return Err(CoreError::NotSupported(format!(
                        "{device} cannot run passthrough at {} Hz: {e}",
                        spec.rate
                    )));
                }
                Err(e) => debug!(%device, error = %e, "Keeping device rate"),
            }
        }

        let d = self.device_ref(device)?;
        let (device_spec, device_map) = (d.spec, d.map.clone());

        if let Some(input) = data.direct_on_input {
            let tapped = self.stream_ref(input)?;
            if data.kind != StreamKind::Capture || tapped.kind != StreamKind::Playback {
                return Err(CoreError::InvalidArgument(
                    "direct capture pairs a capture stream with a playback stream".to_string(),
                ));
            }
            let tapped_device = tapped
                .device
                .and_then(|t| self.devices.get(t))
                .ok_or_else(|| CoreError::BadState(format!("{input} is moving")))?;
            if tapped_device.spec != device_spec {
                return Err(CoreError::NotSupported(format!(
                    "{device} does not run at the rate and format of {input}'s device"
                )));
            }
        }

        let method = data
            .resample_method
            .unwrap_or(self.config().resample.method);
        let (resampler, resampler_output) =
            self.build_resampler(data.kind, spec, &map, flags, method, device_spec, &device_map)?;
        if passthrough && resampler.is_some() {
            return Err(CoreError::NotSupported(
                "passthrough streams cannot be resampled".to_string(),
            ));
        }

        let channels = map.channels();
        let (mut volume, mut absolute, mut save_volume) = (
            data.volume.unwrap_or_else(|| ChannelVolumes::norm(channels)),
            data.volume_is_absolute,
            data.save_volume,
        );
        if volume.channels() == 1 && channels > 1 {
            volume = ChannelVolumes::uniform(channels, volume.max());
        }
        if !volume.is_compatible(channels) {
            return Err(CoreError::InvalidArgument(format!(
                "volume {volume} does not fit {channels} channels"
            )));
        }
        if passthrough {
            volume = ChannelVolumes::norm(channels);
            absolute = true;
            save_volume = false;
        }
        if !absolute && self.flat_volume_enabled(device) {
            let d = self.device_ref(device)?;
            volume = d.reference_volume.remap(&d.map, &map).multiply(&volume);
        }

        let mut volume_factor_items = BTreeMap::new();
        if let Some(factor) = data.volume_factor {
            if !factor.is_compatible(channels) {
                return Err(CoreError::InvalidArgument(format!("volume factor {factor} does not fit the stream")));
            }
            volume_factor_items.insert(INITIAL_FACTOR_KEY.to_string(), factor);
        }
        let mut volume_factor_device_items = BTreeMap::new();
        if let Some(factor) = data.volume_factor_device {
            if !factor.is_compatible(device_map.channels()) {
                return Err(CoreError::InvalidArgument(format!("device volume factor {factor} does not fit {device}")));
            }
            volume_factor_device_items.insert(INITIAL_FACTOR_KEY.to_string(), factor);
        }

        let sync_leader = match data.sync_base {
            Some(base) => {
                let b = self.stream_ref(base)?;
                if b.device != Some(device) {
                    return Err(CoreError::InvalidArgument(format!(
                        "{base} is not attached to {device}"
                    )));
                }
                if !b.state.is_linked() && b.state != StreamState::Init {
                    return Err(CoreError::BadState(format!("{base} is unlinked")));
                }
                Some(b.sync_leader().unwrap_or(base))
            }
            None => None,
        };

        let drained = Arc::new(AtomicBool::new(false));
        let io = data.io;
        let kind = data.kind;
        let name = data.name;
        let origin_device = data.origin_device;
        let feeds_sharing_device = origin_device
            .and_then(|o| self.devices.get(o))
            .is_some_and(|o| o.policy.share_volume_with_master);

        let index = self.streams.insert_with(|index| {
            let mut thread = StreamThreadInfo::new(
                index,
                spec,
                map.clone(),
                device_spec,
                device_map.clone(),
                io,
                resampler,
                Arc::clone(&drained),
            );
            thread.requested_latency = data.requested_latency;

            let mut stream = Stream {
                index,
                kind,
                name,
                state: StreamState::Init,
                flags,
                device: Some(device),
                origin_device,
                spec,
                map: map.clone(),
                format,
                resample_method: method,
                resampler_output,
                reference_ratio: volume.clone(),
                real_ratio: volume.clone(),
                soft_volume: volume.clone(),
                volume,
                volume_factor: ChannelVolumes::norm(channels),
                volume_factor_items,
                volume_factor_device: ChannelVolumes::norm(device_map.channels()),
                volume_factor_device_items,
                muted: data.muted,
                volume_writable: data.volume_writable && !passthrough && !feeds_sharing_device,
                save_volume,
                save_muted: data.save_muted,
                save_device: data.save_device,
                sync: sync_leader.map_or(SyncGroup::None, SyncGroup::Member),
                direct_on_input: data.direct_on_input,
                direct_outputs: BTreeSet::new(),
                requested_latency: data.requested_latency,
                drained,
                thread: Some(Box::new(thread)),
            };
            stream.recompute_volume_factors(device_map.channels());
            stream.soft_volume = stream.real_ratio.multiply(&stream.volume_factor);
            stream
        });

        if let Some(leader) = sync_leader {
            if let Some(l) = self.streams.get_mut(leader) {
                match &mut l.sync {
                    SyncGroup::Leader(members) => members.push(index),
                    sync => *sync = SyncGroup::Leader(vec![index]),
                }
            }
        }

        if let Some(origin) = origin_device {
            if let Some(o) = self.devices.get_mut(origin) {
                if o.master_stream.is_none() {
                    o.master_stream = Some(index);
                }
            }
        }

        debug!(stream = %index, %device, %spec, passthrough, "Stream created");
        Ok(index)
    }

    /// Converter between a stream and its device, or `None` when the data
    /// already matches
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn build_resampler(
        &self,
        kind: StreamKind,
        spec: SampleSpec,
        map: &ChannelMap,
        flags: StreamFlags,
        method: ResampleMethod,
        device_spec: SampleSpec,
        device_map: &ChannelMap,
    ) -> Result<(Option<Box<dyn Resampler>>, Option<(SampleSpec, ChannelMap)>)> {
        let variable = flags.contains(StreamFlags::VARIABLE_RATE);
        if spec == device_spec && map == device_map && !variable {
            return Ok((None, None));
        }

        let mut resampler_flags = ResamplerFlags::empty();
        resampler_flags.set(ResamplerFlags::VARIABLE_RATE, variable);
        resampler_flags.set(ResamplerFlags::NO_REMAP, flags.contains(StreamFlags::NO_REMAP));
        resampler_flags.set(ResamplerFlags::NO_REMIX, flags.contains(StreamFlags::NO_REMIX));

        let (input_spec, input_map, output_spec, output_map) = match kind {
            StreamKind::Playback => (spec, map.clone(), device_spec, device_map.clone()),
            StreamKind::Capture => (device_spec, device_map.clone(), spec, map.clone()),
        };
        let params = ResamplerParams {
            input_spec,
            input_map,
            output_spec,
            output_map,
            method,
            flags: resampler_flags,
        };
        let resampler = self.resamplers().create(&params).ok_or_else(|| {
            CoreError::NotSupported(format!("cannot convert {spec} to {device_spec}"))
        })?;
        Ok((Some(resampler), Some((device_spec, device_map.clone()))))
    }

    /// Refuse a stream that would share a device with a passthrough stream
    ///
    /// # Errors
    /// Returns `Busy` if the device already carries a passthrough stream, or
    /// `passthrough` is set and the device carries any stream.
    pub fn check_passthrough_connection(&self, device: DeviceIndex, passthrough: bool) -> Result<()> {
        if self.is_passthrough(device) {
            warn!(%device, "Device is already carrying a passthrough stream");
            return Err(CoreError::Busy(format!("{device} carries a passthrough stream")));
        }
        if passthrough && !self.device_ref(device)?.streams.is_empty() {
            warn!(%device, "Cannot connect a passthrough stream to a device in use");
            return Err(CoreError::Busy(format!("{device} is in use")));
        }
        Ok(())
    }

    /// Link a created stream: attach it to its device and start data flow
    ///
    /// # Errors
    /// Returns error if the stream was already put, or its device thread is gone.
    #[instrument(skip(self))]
    pub async fn put_stream(&mut self, stream: StreamIndex) -> Result<()> {
        let s = self.stream_ref(stream)?;
        if s.state != StreamState::Init {
            return Err(CoreError::BadState(format!("{stream} was already put")));
        }
        let device = s
            .device
            .ok_or_else(|| CoreError::BadState(format!("{stream} has no device")))?;
        let state = if s.flags.contains(StreamFlags::START_CORKED) {
            StreamState::Corked
        } else {
            StreamState::Running
        };
        let direct_on_input = s.direct_on_input;
        let passthrough = s.is_passthrough();
        let save_volume = s.save_volume;

        let d = self.device_mut(device)?;
        d.streams.insert(stream);
        if state == StreamState::Corked {
            d.n_corked += 1;
        }

        let flat = self.flat_volume_enabled(device);
        let s = self.stream_mut(stream)?;
        s.state = state;
        if !flat {
            s.reference_ratio = s.volume.clone();
            s.real_ratio = s.volume.clone();
            s.soft_volume = s.real_ratio.multiply(&s.volume_factor);
        }

        if flat {
            self.set_device_volume(device, None, false, save_volume).await?;
        }

        let s = self.stream_mut(stream)?;
        let mut thread = s
            .thread
            .take()
            .ok_or_else(|| CoreError::BadState(format!("{stream} has no render state")))?;
        thread.state = state;
        thread.soft_volume = s.soft_volume.clone();
        thread.muted = s.muted;
        thread.volume_factor_device = s.volume_factor_device.clone();
        let requested_latency = thread.requested_latency.take();

        let tap = direct_on_input.map(|_| {
            let (tx, rx) = mpsc::unbounded_channel();
            thread.direct_input = Some(rx);
            tx
        });

        self.call_device(device, |reply| DeviceCall::AddStream { info: thread, reply })
            .await?;

        if flat {
            if let Some(root) = self.master_of(device) {
                self.sync_shared_volume(root).await;
            }
        }

        if requested_latency.is_some() {
            self.set_requested_latency(stream, requested_latency).await?;
        }

        if let (Some(input), Some(tap)) = (direct_on_input, tap) {
            if let Some(i) = self.streams.get_mut(input) {
                i.direct_outputs.insert(stream);
                if let Some(input_device) = i.device {
                    self.call_device_best_effort(input_device, |reply| DeviceCall::AttachDirectTap {
                        stream: input,
                        capture: stream,
                        tap,
                        reply,
                    })
                    .await;
                }
            }
        }

        if passthrough {
            self.enter_passthrough(device).await;
        }

        self.update_device_status(device).await;

        info!(%stream, %device, %state, "Stream linked");
        self.emit(CoreEvent::StreamAdded(stream));
        Ok(())
    }

    /// Detach a stream from its device and hide it. The stream stays in the
    /// arena until freed.
    #[instrument(skip(self))]
    pub async fn unlink_stream(&mut self, stream: StreamIndex) {
        let Some(s) = self.streams.get(stream) else {
            return;
        };
        if s.state == StreamState::Unlinked {
            return;
        }
        let linked = s.state.is_linked();
        let corked = s.state == StreamState::Corked;
        let device = s.device;
        let direct_on_input = s.direct_on_input;
        let direct_outputs: Vec<_> = s.direct_outputs.iter().copied().collect();
        let origin_device = s.origin_device;
        let passthrough = s.is_passthrough();
        let sync = s.sync.clone();

        self.leave_sync_group(stream, sync);

        for output in direct_outputs {
            Box::pin(self.kill_stream(output)).await;
        }

        if let Some(input) = direct_on_input {
            if let Some(i) = self.streams.get_mut(input) {
                i.direct_outputs.remove(&stream);
                if let Some(input_device) = i.device {
                    self.call_device_best_effort(input_device, |reply| DeviceCall::DetachDirectTap {
                        stream: input,
                        capture: stream,
                        reply,
                    })
                    .await;
                }
            }
        }

        if let Some(s) = self.streams.get_mut(stream) {
            s.state = StreamState::Unlinked;
        }

        if let Some(device) = device {
            let attached = self
                .devices
                .get_mut(device)
                .is_some_and(|d| {
                    let attached = d.streams.remove(&stream);
                    if attached && corked {
                        d.n_corked = d.n_corked.saturating_sub(1);
                    }
                    attached
                });

            if attached {
                if let Err(e) = self
                    .call_device(device, |reply| DeviceCall::RemoveStream { stream, reply })
                    .await
                {
                    debug!(%stream, error = %e, "Device gone before stream removal");
                }

                if passthrough {
                    self.leave_passthrough(device).await;
                }
                if self.flat_volume_enabled(device) {
                    if let Err(e) = self.set_device_volume(device, None, true, false).await {
                        debug!(%device, error = %e, "Volume resync failed");
                    }
                }
                self.update_device_status(device).await;
            }
        }

        if let Some(origin) = origin_device {
            if let Some(o) = self.devices.get_mut(origin) {
                if o.master_stream == Some(stream) {
                    o.master_stream = None;
                }
            }
        }

        if linked {
            info!(%stream, "Stream unlinked");
            self.emit(CoreEvent::StreamRemoved(stream));
        }
    }

    fn leave_sync_group(&mut self, stream: StreamIndex, sync: SyncGroup) {
        match sync {
            SyncGroup::None => {}
            SyncGroup::Member(leader) => {
                if let Some(SyncGroup::Leader(members)) = self.streams.get_mut(leader).map(|l| &mut l.sync) {
                    members.retain(|m| *m != stream);
                }
            }
            SyncGroup::Leader(members) => {
                if let Some((&successor, rest)) = members.split_first() {
                    for member in rest {
                        if let Some(m) = self.streams.get_mut(*member) {
                            m.sync = SyncGroup::Member(successor);
                        }
                    }
                    if let Some(m) = self.streams.get_mut(successor) {
                        m.sync = SyncGroup::Leader(rest.to_vec());
                    }
                }
            }
        }
        if let Some(s) = self.streams.get_mut(stream) {
            s.sync = SyncGroup::None;
        }
    }

    /// Unlink a stream on the core's own initiative and free it
    #[instrument(skip(self))]
    pub async fn kill_stream(&mut self, stream: StreamIndex) {
        if !self.streams.contains(stream) {
            return;
        }
        self.unlink_stream(stream).await;
        info!(%stream, "Stream killed");
        self.emit(CoreEvent::StreamKilled(stream));
        self.free_stream(stream).await;
    }

    /// Drop a stream, unlinking it first if needed
    pub async fn free_stream(&mut self, stream: StreamIndex) {
        if self
            .streams
            .get(stream)
            .is_some_and(|s| s.state != StreamState::Unlinked)
        {
            self.unlink_stream(stream).await;
        }
        if self.streams.remove(stream).is_some() {
            debug!(%stream, "Stream freed");
        }
    }

    /// Pause or resume a stream together with its synchronization group
    ///
    /// # Errors
    /// Returns error if the stream is not linked or its device is gone.
    #[instrument(skip(self))]
    pub async fn cork_stream(&mut self, stream: StreamIndex, corked: bool) -> Result<()> {
        let s = self.stream_ref(stream)?;
        if !s.state.is_linked() {
            return Err(CoreError::BadState(format!("{stream} is not linked")));
        }
        let device = s
            .device
            .ok_or_else(|| CoreError::BadState(format!("{stream} is moving")))?;

        let group = match s.sync_leader() {
            Some(leader) => {
                let mut group = vec![leader];
                if let Some(SyncGroup::Leader(members)) = self.streams.get(leader).map(|l| &l.sync) {
                    group.extend(members.iter().copied());
                }
                group
            }
            None => vec![stream],
        };

        let state = if corked {
            StreamState::Corked
        } else {
            StreamState::Running
        };
        let mut changed = Vec::new();
        for member in group {
            let Some(m) = self.streams.get_mut(member) else {
                continue;
            };
            if m.state == state || !m.state.is_linked() {
                continue;
            }
            m.state = state;
            changed.push(member);
        }
        if changed.is_empty() {
            return Ok(());
        }

        let d = self.device_mut(device)?;
        if corked {
            d.n_corked += changed.len();
        } else {
            d.n_corked = d.n_corked.saturating_sub(changed.len());
        }

        let streams = changed.clone();
        self.call_device(device, |reply| DeviceCall::SetStreamState {
            streams,
            state,
            reply,
        })
        .await?;

        for member in changed {
            debug!(stream = %member, %state, "Stream state");
            self.emit(CoreEvent::StreamStateChanged {
                stream: member,
                state,
            });
        }

        self.update_device_status(device).await;
        Ok(())
    }

    /// Change the input rate of a `VARIABLE_RATE` stream
    ///
    /// # Errors
    /// Returns error if the stream is not variable-rate or `rate` is out of range.
    pub async fn set_stream_rate(&mut self, stream: StreamIndex, rate: u32) -> Result<()> {
        let s = self.stream_mut(stream)?;
        if !s.flags.contains(StreamFlags::VARIABLE_RATE) {
            return Err(CoreError::BadState(format!("{stream} has a fixed rate")));
        }
        if !(RATE_MIN..=RATE_MAX).contains(&rate) {
            return Err(CoreError::InvalidArgument(format!("invalid rate {rate}")));
        }
        if s.spec.rate == rate {
            return Ok(());
        }
        s.spec.rate = rate;

        if let Some(thread) = s.thread.as_mut() {
            thread.set_rate(rate);
        } else if let Some(device) = s.device {
            let channel = self.device_ref(device)?.channel.clone();
            if !channel.post(DeviceNotice::SetStreamRate { stream, rate }) {
                warn!(%stream, %device, "Rate change lost, device thread gone");
            }
        }

        self.emit(CoreEvent::StreamChanged(stream));
        Ok(())
    }

    /// Queue latency of the stream and latency of its device
    ///
    /// # Errors
    /// Returns error if the stream is not attached or the device thread is gone.
    pub async fn stream_latency(&self, stream: StreamIndex) -> Result<(Duration, Duration)> {
        let device = self
            .stream_ref(stream)?
            .device
            .ok_or_else(|| CoreError::BadState(format!("{stream} is moving")))?;
        if !self.device_ref(device)?.state.is_opened() {
            return Ok((Duration::ZERO, Duration::ZERO));
        }
        Ok(self
            .call_device(device, |reply| DeviceCall::GetStreamLatency { stream, reply })
            .await?
            .unwrap_or((Duration::ZERO, Duration::ZERO)))
    }

    /// Ask the device to run at `latency`; returns the latency granted after clamping
    ///
    /// # Errors
    /// Returns error if the stream does not exist or its device thread is gone.
    pub async fn set_requested_latency(
        &mut self,
        stream: StreamIndex,
        latency: Option<Duration>,
    ) -> Result<Option<Duration>> {
        let s = self.stream_mut(stream)?;
        s.requested_latency = latency;
        if let Some(thread) = s.thread.as_mut() {
            thread.requested_latency = latency;
            return Ok(latency);
        }
        let Some(device) = s.device else {
            return Ok(latency);
        };
        let granted = self
            .call_device(device, |reply| DeviceCall::SetRequestedLatency { stream, latency, reply })
            .await?;
        if let Some(s) = self.streams.get_mut(stream) {
            s.requested_latency = granted;
        }
        Ok(granted)
    }

    /// Rebuild the converter after the stream's or its device's spec changed
    ///
    /// # Errors
    /// Returns error if the stream is not attached or no converter can be built.
    pub(crate) async fn update_stream_resampler(&mut self, stream: StreamIndex) -> Result<()> {
        let s = self.stream_ref(stream)?;
        let device = s
            .device
            .ok_or_else(|| CoreError::BadState(format!("{stream} is moving")))?;
        let d = self.device_ref(device)?;
        let (device_spec, device_map) = (d.spec, d.map.clone());

        let up_to_date = match &s.resampler_output {
            Some((spec, map)) => *spec == device_spec && *map == device_map,
            None => s.spec == device_spec && s.map == device_map,
        };
        if up_to_date {
            return Ok(());
        }
        if s.is_passthrough() {
            return Err(CoreError::NotSupported(format!("{stream} is passthrough and cannot be resampled")));
        }

        let (resampler, output) =
            self.build_resampler(s.kind, s.spec, &s.map, s.flags, s.resample_method, device_spec, &device_map)?;

        let s = self.stream_mut(stream)?;
        s.resampler_output = output;
        if let Some(thread) = s.thread.as_mut() {
            thread.replace_resampler(resampler, device_spec, device_map);
            return Ok(());
        }

        self.call_device(device, |reply| DeviceCall::ReplaceResampler {
            stream,
            resampler,
            device_spec,
            device_map,
            reply,
        })
        .await?;
        debug!(%stream, %device_spec, "Resampler replaced");
        Ok(())
    }
}
