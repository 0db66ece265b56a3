//! Device lifecycle, suspend, rate, ports, volume, mute and latency.

use std::{
    collections::BTreeSet,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tracing::{debug, info, instrument, warn};

use super::Core;
use crate::{
    arena::DeviceIndex,
    backend::HardwareFeatures,
    channel::async_channel,
    device::{
        DEFAULT_FIXED_LATENCY, Device, DeviceCall, DeviceCapabilities, DeviceDerived, DeviceKind,
        DeviceNotice, DeviceState, LatencyRange, NewDeviceData, SuspendCause,
        thread::{DeviceThread, ThreadSetup},
    },
    error::{CoreError, Result},
    events::CoreEvent,
    sample::{FormatInfo, SampleFormat, SampleSpec},
    stream::StreamFlags,
    volume::{ChannelMap, ChannelVolumes, Volume},
};

/// Whether `a` and `b` belong to the same 44.1k or 48k rate family
fn same_rate_family(a: u32, b: u32) -> bool {
    (a % 11_025 == 0 && b % 11_025 == 0) || (a % 4_000 == 0 && b % 4_000 == 0)
}

impl Core {
    /// Create a device and start its thread. The device stays invisible until
    /// [`Core::put_device`].
    ///
    /// # Errors
    /// Returns error if the name is taken, the sample spec, channel map or
    /// volume is malformed, the requested port does not exist, or the device
    /// thread cannot be started.
    #[instrument(skip(self, data), fields(name = %data.name))]
    pub fn create_device(&mut self, data: NewDeviceData) -> Result<DeviceIndex> {
        if data.name.is_empty() {
            return Err(CoreError::InvalidArgument("device name is empty".to_string()));
        }
        if self.device_by_name(&data.name).is_some() {
            return Err(CoreError::Busy(format!("device name {} is taken", data.name)));
        }

        let spec = data.spec.unwrap_or_else(|| {
            let channels = data.map.as_ref().map_or(2, |m| m.channels() as u8);
            SampleSpec::new(
                SampleFormat::S16le,
                self.config().devices.default_sample_rate,
                channels,
            )
        });
        if !spec.is_valid() {
            return Err(CoreError::InvalidArgument(format!("invalid sample spec {spec}")));
        }

        let map = match data.map {
            Some(map) => map,
            None => ChannelMap::default_for(usize::from(spec.channels))?,
        };
        if !spec.matches_map(&map) {
            return Err(CoreError::InvalidArgument(format!(
                "channel map {map} does not fit {spec}"
            )));
        }

        let volume = data
            .volume
            .unwrap_or_else(|| ChannelVolumes::norm(map.channels()));
        if !volume.is_compatible(map.channels()) {
            return Err(CoreError::InvalidArgument(format!(
                "volume {volume} does not fit {} channels",
                map.channels()
            )));
        }

        let active_port = match data.active_port {
            Some(name) => {
                if !data.ports.iter().any(|p| p.name == name) {
                    return Err(CoreError::NoEntity(format!("port {name}")));
                }
                Some(name)
            }
            None => data
                .ports
                .iter()
                .max_by_key(|p| (p.available, p.priority))
                .map(|p| p.name.clone()),
        };
        let latency_offset = active_port
            .as_ref()
            .and_then(|name| data.ports.iter().find(|p| &p.name == name))
            .map_or(0, |p| p.latency_offset);

        let features = data
            .hardware
            .as_ref()
            .map(|hw| hw.features())
            .unwrap_or_default();
        let capabilities =
            DeviceCapabilities::from_hardware(features, !data.ports.is_empty(), data.dynamic_latency);
        let base_volume = match &data.hardware {
            Some(hw) if features.contains(HardwareFeatures::VOLUME) => hw.base_volume(),
            _ => Volume::NORM,
        };

        let alternate_rate = data
            .alternate_rate
            .unwrap_or(self.config().devices.alternate_sample_rate);
        let alternate_rate = (alternate_rate != spec.rate).then_some(alternate_rate);

        let latency_range = data.latency_range.unwrap_or_default();
        let fixed_latency = LatencyRange::default().clamp(data.fixed_latency.unwrap_or(DEFAULT_FIXED_LATENCY));

        let (channel, receiver) = async_channel(self.config().devices.channel_capacity);
        let io = data.io;
        let hardware = data.hardware;
        let kind = data.kind;
        let name = data.name;

        let index = self.devices.insert_with(|index| Device {
            index,
            kind,
            name: name.clone(),
            description: data.description,
            state: DeviceState::Init,
            capabilities,
            policy: data.policy,
            derived: DeviceDerived::default(),
            spec,
            map: map.clone(),
            default_rate: spec.rate,
            alternate_rate,
            streams: BTreeSet::new(),
            n_corked: 0,
            reference_volume: volume.clone(),
            real_volume: volume,
            soft_volume: ChannelVolumes::norm(map.channels()),
            base_volume,
            muted: data.muted,
            save_volume: data.save_volume,
            save_muted: data.save_muted,
            save_port: false,
            refresh_volume: false,
            refresh_muted: false,
            saved_volume: None,
            suspend_cause: data.suspend_cause,
            mixer_dirty: Arc::new(AtomicBool::new(false)),
            ports: data.ports,
            active_port,
            latency_offset,
            latency_range,
            fixed_latency,
            master_stream: None,
            hardware: hardware.clone(),
            channel,
            thread: None,
        });

        let setup = ThreadSetup {
            index,
            name,
            kind,
            spec,
            map,
            io,
            hardware,
            latency_range,
            fixed_latency,
            dynamic_latency: data.dynamic_latency,
            latency_offset,
            cycle: Duration::from_micros(self.config().devices.cycle_usec),
            safety_margin_usec: self.config().volume.deferred_volume_safety_margin_usec,
            extra_delay_usec: self.config().volume.deferred_volume_extra_delay_usec,
            notices: self.notices(),
        };

        match DeviceThread::new(setup).spawn(receiver) {
            Ok(handle) => {
                if let Some(d) = self.devices.get_mut(index) {
                    d.thread = Some(handle);
                }
            }
            Err(e) => {
                self.devices.remove(index);
                return Err(CoreError::BadState(format!("cannot start device thread: {e}")));
            }
        }

        debug!(device = %index, %kind, "Device created");
        Ok(index)
    }

    /// Link a created device: derive its volume flags, hand the initial
    /// volumes to its thread and announce it.
    ///
    /// # Errors
    /// Returns error if the device does not exist or was already put.
    #[instrument(skip(self))]
    pub async fn put_device(&mut self, device: DeviceIndex) -> Result<()> {
        let flat_volumes = self.config().volume.flat_volumes;
        let deferred_volume = self.config().volume.deferred_volume;

        let d = self.device_ref(device)?;
        if d.state != DeviceState::Init {
            return Err(CoreError::BadState(format!("{device} was already put")));
        }
        let derived = d.derive_flags(flat_volumes, deferred_volume);
        let share = d.policy.share_volume_with_master;

        let root = if share { self.master_of(device) } else { None };
        let root_volumes = root
            .filter(|root| *root != device)
            .and_then(|root| self.devices.get(root))
            .map(|r| (r.reference_volume.clone(), r.real_volume.clone(), r.map.clone()));

        let d = self.device_mut(device)?;
        d.derived = derived;
        if !d.has_hw_volume() {
            d.base_volume = Volume::NORM;
        }

        if let Some((reference, real, root_map)) = root_volumes {
            d.reference_volume = reference.remap(&root_map, &d.map);
            d.real_volume = real.remap(&root_map, &d.map);
        } else {
            d.reference_volume = d.real_volume.clone();
        }

        d.soft_volume = if d.has_hw_volume() || share {
            ChannelVolumes::norm(d.channels())
        } else {
            d.real_volume.clone()
        };

        let state = if d.suspend_cause.is_empty() {
            DeviceState::Idle
        } else {
            DeviceState::Suspended
        };
        let soft_volume = d.soft_volume.clone();
        let real_volume = d.real_volume.clone();
        let muted = d.muted;
        let kind = d.kind;

        self.call_device(device, |reply| DeviceCall::Put {
            state,
            deferred_volume: derived.deferred_volume,
            soft_volume,
            real_volume,
            muted,
            reply,
        })
        .await?;

        if let Some(d) = self.devices.get_mut(device) {
            d.state = state;
        }

        if self.device_ref(device)?.has_hw_volume() {
            self.apply_device_volume(device, true).await;
        }

        match kind {
            DeviceKind::Output if self.default_output().is_none() => self.set_default_device(device)?,
            DeviceKind::Input if self.default_input().is_none() => self.set_default_device(device)?,
            _ => {}
        }

        info!(%device, %state, flat = derived.flat_volume, "Device linked");
        self.emit(CoreEvent::DeviceAdded(device));
        Ok(())
    }

    /// Remove a device from view: kill its streams and stop its I/O.
    #[instrument(skip(self))]
    pub async fn unlink_device(&mut self, device: DeviceIndex) {
        let Some(d) = self.devices.get(device) else {
            return;
        };
        if d.state == DeviceState::Unlinked {
            return;
        }
        let linked = d.state.is_linked();
        let master_stream = d.master_stream;

        for stream in d.streams.iter().copied().collect::<Vec<_>>() {
            Box::pin(self.kill_stream(stream)).await;
        }

        if let Some(feed) = master_stream.and_then(|s| self.streams.get_mut(s)) {
            feed.origin_device = None;
        }

        if linked {
            self.set_device_state(device, DeviceState::Unlinked, SuspendCause::empty())
                .await;
        } else if let Some(d) = self.devices.get_mut(device) {
            d.state = DeviceState::Unlinked;
        }

        let kind = self.devices.get(device).map(|d| d.kind);
        if self.default_output == Some(device) || self.default_input == Some(device) {
            let replacement = self
                .devices
                .iter()
                .find(|(_, d)| Some(d.kind) == kind && d.state.is_linked())
                .map(|(index, _)| index);
            match kind {
                Some(DeviceKind::Output) => self.default_output = replacement,
                Some(DeviceKind::Input) => self.default_input = replacement,
                None => {}
            }
        }

        if linked {
            info!(%device, "Device unlinked");
            self.emit(CoreEvent::DeviceRemoved(device));
        }
    }

    /// Drop a device, unlinking it first if needed, and join its thread
    #[instrument(skip(self))]
    pub async fn free_device(&mut self, device: DeviceIndex) {
        if self
            .devices
            .get(device)
            .is_some_and(|d| d.state != DeviceState::Unlinked)
        {
            self.unlink_device(device).await;
        }
        let Some(mut d) = self.devices.remove(device) else {
            return;
        };
        let _ = d.channel.post(DeviceNotice::Shutdown);
        if let Some(handle) = d.thread.take() {
            match tokio::task::spawn_blocking(move || handle.join()).await {
                Ok(Ok(())) => {}
                _ => warn!(%device, "Device thread panicked"),
            }
        }
        debug!(%device, "Device freed");
    }

    pub(crate) async fn set_device_state(
        &mut self,
        device: DeviceIndex,
        state: DeviceState,
        suspend_cause: SuspendCause,
    ) {
        let Some(d) = self.devices.get(device) else {
            return;
        };
        let state_changed = d.state != state;
        if !state_changed && d.suspend_cause == suspend_cause {
            return;
        }
        let suspending = d.state.is_opened() && state == DeviceState::Suspended;
        let resuming = d.state == DeviceState::Suspended && state.is_opened();

        if state_changed {
            self.call_device_best_effort(device, |reply| DeviceCall::SetState { state, reply })
                .await;
        }

        let Some(d) = self.devices.get_mut(device) else {
            return;
        };
        d.suspend_cause = suspend_cause;
        if state_changed {
            debug!(%device, from = %d.state, to = %state, "Device state");
            d.state = state;
            if state != DeviceState::Unlinked {
                self.emit(CoreEvent::DeviceStateChanged { device, state });
            }
        }

        if suspending {
            let doomed: Vec<_> = self
                .devices
                .get(device)
                .map(|d| d.streams.iter().copied().collect())
                .unwrap_or_default();
            for stream in doomed {
                let kill = self
                    .streams
                    .get(stream)
                    .is_some_and(|s| s.flags.contains(StreamFlags::KILL_ON_SUSPEND));
                if kill {
                    Box::pin(self.kill_stream(stream)).await;
                }
            }
        } else if resuming {
            debug!(%device, "Device resumed");
        }
    }

    /// Pick idle or running from the uncorked stream count. Suspended devices stay suspended.
    pub async fn update_device_status(&mut self, device: DeviceIndex) {
        let Some(d) = self.devices.get(device) else {
            return;
        };
        if d.state == DeviceState::Suspended || !d.state.is_linked() {
            return;
        }
        let state = if d.used_by() > 0 {
            DeviceState::Running
        } else {
            DeviceState::Idle
        };
        self.set_device_state(device, state, SuspendCause::empty())
            .await;
    }

    /// Add or clear a suspend cause. The device is suspended while any cause is set.
    ///
    /// Resuming a device whose mixer was marked dirty first re-applies the
    /// active port, or the volume and mute.
    ///
    /// # Errors
    /// Returns error if the device does not exist, is not linked, or `cause` is empty.
    #[instrument(skip(self))]
    pub async fn suspend_device(&mut self, device: DeviceIndex, suspend: bool, cause: SuspendCause) -> Result<()> {
        if cause.is_empty() {
            return Err(CoreError::InvalidArgument("empty suspend cause".to_string()));
        }
        let d = self.device_ref(device)?;
        if !d.state.is_linked() {
            return Err(CoreError::BadState(format!("{device} is not linked")));
        }

        let merged = if suspend {
            d.suspend_cause | cause
        } else {
            d.suspend_cause - cause
        };

        if !merged.contains(SuspendCause::SESSION) && d.mixer_dirty.swap(false, Ordering::AcqRel) {
            debug!(%device, "Re-applying mixer settings");
            match d.active_port.clone() {
                Some(port) if d.capabilities.contains(DeviceCapabilities::PORTS) => {
                    if let Err(e) = self.apply_port(device, &port).await {
                        warn!(%device, %port, error = %e, "Port re-apply failed");
                    }
                }
                _ => {
                    self.apply_device_mute(device).await;
                    self.apply_device_volume(device, true).await;
                }
            }
        }

        let state = if !merged.is_empty() {
            DeviceState::Suspended
        } else if self.device_ref(device)?.used_by() > 0 {
            DeviceState::Running
        } else {
            DeviceState::Idle
        };
        self.set_device_state(device, state, merged).await;
        Ok(())
    }

    /// Suspend or resume every linked device for `cause`
    ///
    /// # Errors
    /// Returns the last failure; every device is still attempted.
    pub async fn suspend_all(&mut self, suspend: bool, cause: SuspendCause) -> Result<()> {
        let mut result = Ok(());
        for device in self.devices.keys() {
            if !self.devices.get(device).is_some_and(|d| d.state.is_linked()) {
                continue;
            }
            if let Err(e) = self.suspend_device(device, suspend, cause).await {
                result = Err(e);
            }
        }
        result
    }

    /// Mark the hardware mixer as possibly out of date, e.g. after the
    /// session lost access to it
    ///
    /// # Errors
    /// Returns error if the device does not exist.
    pub fn set_mixer_dirty(&mut self, device: DeviceIndex, dirty: bool) -> Result<()> {
        self.device_ref(device)?
            .mixer_dirty
            .store(dirty, Ordering::Release);
        Ok(())
    }

    /// Switch the hardware rate towards `rate`.
    ///
    /// Without `passthrough` the device picks whichever of its default and
    /// alternate rate shares `rate`'s family. Returns `false` when no switch
    /// was needed.
    ///
    /// # Errors
    /// Returns error if the device cannot switch rates, is running, is used by
    /// streams, or the hardware refuses.
    #[instrument(skip(self))]
    pub async fn update_rate(&mut self, device: DeviceIndex, rate: u32, passthrough: bool) -> Result<bool> {
        let d = self.device_ref(device)?;
        let Some(hardware) = d
            .hardware
            .clone()
            .filter(|_| d.capabilities.contains(DeviceCapabilities::RATE))
        else {
            return Err(CoreError::NotImplemented(format!("{device} cannot switch rates")));
        };
        if d.state == DeviceState::Running {
            debug!(%device, rate = d.spec.rate, "Cannot update rate while running");
            return Err(CoreError::BadState(format!("{device} is running")));
        }
        if !(crate::sample::RATE_MIN..=crate::sample::RATE_MAX).contains(&rate) {
            return Err(CoreError::InvalidArgument(format!("invalid rate {rate}")));
        }

        let desired = if passthrough {
            rate
        } else {
            let default_usable = same_rate_family(d.default_rate, rate);
            let alternate = d.alternate_rate.filter(|alt| same_rate_family(*alt, rate));
            match (default_usable, alternate) {
                (false, Some(alt)) => alt,
                _ => d.default_rate,
            }
        };

        if desired == d.spec.rate {
            return Ok(false);
        }
        if !passthrough && d.used_by() > 0 {
            return Err(CoreError::Busy(format!("{device} is in use")));
        }

        let was_internal = d.suspend_cause.contains(SuspendCause::INTERNAL);
        debug!(%device, desired, "Suspending to change rate");
        self.suspend_device(device, true, SuspendCause::INTERNAL).await?;

        let result = match hardware.update_rate(desired) {
            Ok(()) => {
                if let Some(d) = self.devices.get_mut(device) {
                    d.spec.rate = desired;
                    let _ = d.channel.post(DeviceNotice::RateChanged(desired));
                }
                let streams: Vec<_> = self
                    .devices
                    .get(device)
                    .map(|d| d.streams.iter().copied().collect())
                    .unwrap_or_default();
                for stream in streams {
                    if let Err(e) = self.update_stream_resampler(stream).await {
                        warn!(%stream, error = %e, "Resampler refresh after rate change failed");
                    }
                }
                info!(%device, rate = desired, "Device rate changed");
                self.emit(CoreEvent::DeviceChanged(device));
                Ok(true)
            }
            Err(e) => {
                warn!(%device, desired, error = %e, "Hardware refused rate");
                Err(CoreError::NotSupported(format!("rate {desired}: {e}")))
            }
        };

        if !was_internal {
            self.suspend_device(device, false, SuspendCause::INTERNAL).await?;
        }
        result
    }

    /// Route `device` through port `name`
    ///
    /// # Errors
    /// Returns error if the device has no port control, the port is unknown,
    /// or the hardware refuses it.
    #[instrument(skip(self))]
    pub async fn set_port(&mut self, device: DeviceIndex, name: &str, save: bool) -> Result<()> {
        let d = self.device_ref(device)?;
        if !d.capabilities.contains(DeviceCapabilities::PORTS) {
            return Err(CoreError::NotImplemented(format!("{device} has no port control")));
        }
        let Some(port) = d.port(name) else {
            return Err(CoreError::NoEntity(format!("port {name}")));
        };
        let latency_offset = port.latency_offset;

        if d.active_port.as_deref() == Some(name) {
            let d = self.device_mut(device)?;
            d.save_port |= save;
            return Ok(());
        }

        self.apply_port(device, name).await?;

        let d = self.device_mut(device)?;
        d.active_port = Some(name.to_string());
        d.save_port = save;
        self.set_latency_offset(device, latency_offset).await?;

        info!(%device, port = name, "Port changed");
        self.emit(CoreEvent::DevicePortChanged {
            device,
            port: name.to_string(),
        });
        Ok(())
    }

    async fn apply_port(&mut self, device: DeviceIndex, name: &str) -> Result<()> {
        let d = self.device_ref(device)?;
        let result = if d.derived.deferred_volume {
            let port = name.to_string();
            self.call_device(device, |reply| DeviceCall::SetPort { port, reply })
                .await?
        } else {
            match &d.hardware {
                Some(hw) => hw.set_port(name),
                None => return Err(CoreError::NotImplemented(format!("{device} has no port control"))),
            }
        };
        result.map_err(|e| {
            warn!(%device, port = name, error = %e, "Hardware refused port");
            CoreError::NoEntity(format!("port {name}: {e}"))
        })
    }

    /// Change the latency offset of a port; applied at once if the port is active
    ///
    /// # Errors
    /// Returns error if the device or port does not exist.
    pub async fn set_port_latency_offset(&mut self, device: DeviceIndex, name: &str, offset: i64) -> Result<()> {
        let d = self.device_mut(device)?;
        let Some(port) = d.ports.iter_mut().find(|p| p.name == name) else {
            return Err(CoreError::NoEntity(format!("port {name}")));
        };
        port.latency_offset = offset;
        if d.active_port.as_deref() == Some(name) {
            self.set_latency_offset(device, offset).await?;
        }
        Ok(())
    }

    /// Set the device volume, or with `None` re-derive it from the streams (flat volume only).
    ///
    /// A one-channel `volume` scales the current reference volume instead of
    /// replacing it. With `send_msg` the new soft volumes are pushed to the
    /// device threads right away.
    ///
    /// # Errors
    /// Returns error if the device does not exist or `volume` does not fit it.
    #[instrument(skip(self, volume))]
    pub async fn set_device_volume(
        &mut self,
        device: DeviceIndex,
        volume: Option<&ChannelVolumes>,
        send_msg: bool,
        save: bool,
    ) -> Result<()> {
        let d = self.device_ref(device)?;
        if let Some(v) = volume {
            if v.channels() != 1 && !v.is_compatible(d.channels()) {
                return Err(CoreError::InvalidArgument(format!(
                    "volume {v} does not fit {} channels",
                    d.channels()
                )));
            }
        }

        if self.is_passthrough(device) && volume.is_none_or(|v| !v.is_norm()) {
            warn!(%device, "Cannot change volume while a passthrough stream is connected");
            return Ok(());
        }

        let Some(root) = self.master_of(device) else {
            return Ok(());
        };
        let d = self.device_ref(device)?;
        let (device_map, device_reference) = (d.map.clone(), d.reference_volume.clone());
        let r = self.device_ref(root)?;
        let root_map = r.map.clone();

        if let Some(volume) = volume {
            let requested = if volume.channels() == 1 {
                let mut scaled = device_reference.clone();
                scaled.scale(volume.max());
                scaled
            } else {
                volume.clone()
            };
            let requested = requested.remap(&device_map, &root_map);

            if self.update_reference_volume(root, &requested, &root_map, save) {
                if self.flat_volume_enabled(root) {
                    self.propagate_reference_volume(root);
                    self.compute_real_volume(root);
                } else {
                    let reference = self.device_ref(root)?.reference_volume.clone();
                    self.update_real_volume(root, &reference, &root_map);
                }
            }
        } else {
            if !self.flat_volume_enabled(root) {
                debug!(%device, "Volume resync without flat volume ignored");
                return Ok(());
            }
            self.compute_real_volume(root);

            let root_real = self.device_ref(root)?.real_volume.clone();
            let merged = device_reference
                .merge(&root_real.remap(&root_map, &device_map))
                .remap(&device_map, &root_map);
            self.update_reference_volume(root, &merged, &root_map, save);
            self.compute_reference_ratios(root);
        }

        self.apply_device_volume(root, send_msg).await;
        Ok(())
    }

    /// Split the root's real volume between hardware and software, then
    /// optionally push everything to the device threads
    async fn apply_device_volume(&mut self, root: DeviceIndex, send_msg: bool) {
        let Some(r) = self.devices.get_mut(root) else {
            return;
        };

        if r.has_hw_volume() {
            r.soft_volume = ChannelVolumes::norm(r.channels());
            if !r.derived.deferred_volume {
                if let Some(hw) = r.hardware.clone() {
                    match hw.set_volume(&r.real_volume) {
                        Ok(achieved) => r.soft_volume = r.real_volume.divide(&achieved),
                        Err(e) => {
                            warn!(device = %root, error = %e, "Hardware volume failed, using software volume");
                            r.soft_volume = r.real_volume.clone();
                        }
                    }
                }
            }
        } else if !r.policy.share_volume_with_master {
            r.soft_volume = r.real_volume.clone();
        }

        if send_msg {
            self.sync_shared_volume(root).await;
        }
    }

    /// Reference volume, re-read from the hardware first if the device asks
    /// for it or `force_refresh` is set
    ///
    /// # Errors
    /// Returns error if the device does not exist.
    #[instrument(skip(self))]
    pub async fn get_device_volume(&mut self, device: DeviceIndex, force_refresh: bool) -> Result<ChannelVolumes> {
        let d = self.device_ref(device)?;
        if (d.refresh_volume || force_refresh) && d.state.is_linked() {
            let old_real = d.real_volume.clone();
            let old_soft = d.soft_volume.clone();

            if d.derived.deferred_volume {
                if let Some(read) = self
                    .call_device(device, |reply| DeviceCall::GetVolume { reply })
                    .await?
                {
                    let d = self.device_mut(device)?;
                    d.real_volume = read.real_volume;
                    d.soft_volume = read.soft_volume;
                }
            } else if let Some(hw) = d.hardware.clone().filter(|_| d.has_hw_volume()) {
                match hw.get_volume() {
                    Ok(hw_volume) => {
                        let d = self.device_mut(device)?;
                        if hw_volume != d.real_volume.divide(&d.soft_volume) {
                            d.soft_volume = ChannelVolumes::norm(hw_volume.channels());
                            d.real_volume = hw_volume;
                        }
                    }
                    Err(e) => debug!(%device, error = %e, "Hardware volume unreadable"),
                }
            }

            let d = self.device_ref(device)?;
            let (real, map) = (d.real_volume.clone(), d.map.clone());
            let soft_changed = d.soft_volume != old_soft;
            self.update_real_volume(device, &real, &map);
            let propagated = self.propagate_real_volume(device, &old_real);

            if (propagated || soft_changed) && !self.device_ref(device)?.derived.deferred_volume {
                self.sync_shared_volume(device).await;
            }
        }
        Ok(self.device_ref(device)?.reference_volume.clone())
    }

    /// The hardware volume changed on its own; adopt `new_real` as the real volume
    ///
    /// # Errors
    /// Returns error if the device does not exist or `new_real` does not fit it.
    pub async fn device_volume_changed(&mut self, device: DeviceIndex, new_real: &ChannelVolumes) -> Result<()> {
        let d = self.device_ref(device)?;
        if !new_real.is_compatible(d.channels()) {
            return Err(CoreError::InvalidArgument(format!("volume {new_real} does not fit {device}")));
        }
        let old_real = d.real_volume.clone();
        let map = d.map.clone();
        self.update_real_volume(device, new_real, &map);
        if self.propagate_real_volume(device, &old_real) {
            self.sync_shared_volume(device).await;
        }
        Ok(())
    }

    /// Set the mute state
    ///
    /// # Errors
    /// Returns error if the device does not exist.
    #[instrument(skip(self))]
    pub async fn set_device_mute(&mut self, device: DeviceIndex, muted: bool, save: bool) -> Result<()> {
        let d = self.device_mut(device)?;
        if d.muted == muted {
            d.save_muted |= save;
            return Ok(());
        }
        d.muted = muted;
        d.save_muted = save;
        let linked = d.state.is_linked();

        self.apply_device_mute(device).await;
        if linked {
            debug!(%device, muted, "Device mute");
            self.emit(CoreEvent::DeviceMuteChanged { device, muted });
        }
        Ok(())
    }

    async fn apply_device_mute(&mut self, device: DeviceIndex) {
        let Some(d) = self.devices.get(device) else {
            return;
        };
        let muted = d.muted;
        if !d.derived.deferred_volume && d.has_hw_mute() {
            if let Some(hw) = &d.hardware {
                if let Err(e) = hw.set_mute(muted) {
                    warn!(%device, error = %e, "Hardware mute failed");
                }
            }
        }
        self.call_device_best_effort(device, |reply| DeviceCall::SetMute { muted, reply })
            .await;
    }

    /// Mute state, re-read from the hardware first if the device asks for it
    /// or `force_refresh` is set
    ///
    /// # Errors
    /// Returns error if the device does not exist.
    pub async fn get_device_mute(&mut self, device: DeviceIndex, force_refresh: bool) -> Result<bool> {
        let d = self.device_ref(device)?;
        if (d.refresh_muted || force_refresh) && d.state.is_linked() {
            let read = if d.derived.deferred_volume {
                self.call_device(device, |reply| DeviceCall::GetMute { reply })
                    .await?
            } else {
                d.hardware
                    .as_ref()
                    .filter(|_| d.has_hw_mute())
                    .and_then(|hw| hw.get_mute().ok())
            };
            if let Some(muted) = read {
                self.device_mute_changed(device, muted)?;
            }
        }
        Ok(self.device_ref(device)?.muted)
    }

    /// The hardware mute switch changed on its own
    ///
    /// # Errors
    /// Returns error if the device does not exist.
    pub fn device_mute_changed(&mut self, device: DeviceIndex, muted: bool) -> Result<()> {
        let d = self.device_mut(device)?;
        if d.muted == muted {
            return Ok(());
        }
        d.muted = muted;
        d.save_muted = true;
        self.emit(CoreEvent::DeviceMuteChanged { device, muted });
        Ok(())
    }

    pub(crate) async fn update_volume_and_mute(&mut self, device: DeviceIndex) {
        if let Err(e) = self.get_device_volume(device, true).await {
            debug!(%device, error = %e, "Volume refresh failed");
        }
        if let Err(e) = self.get_device_mute(device, true).await {
            debug!(%device, error = %e, "Mute refresh failed");
        }
    }

    /// Whether the device carries exactly one stream and it is passthrough
    pub fn is_passthrough(&self, device: DeviceIndex) -> bool {
        let Some(d) = self.devices.get(device) else {
            return false;
        };
        if d.streams.len() != 1 {
            return false;
        }
        d.streams
            .first()
            .and_then(|s| self.streams.get(*s))
            .is_some_and(|s| s.is_passthrough())
    }

    /// Park the volume at unity for a passthrough stream, remembering the old one
    pub(crate) async fn enter_passthrough(&mut self, device: DeviceIndex) {
        let Ok(current) = self.get_device_volume(device, true).await else {
            return;
        };
        let Some(d) = self.devices.get_mut(device) else {
            return;
        };
        d.saved_volume = Some((current, d.save_volume));
        let unity = ChannelVolumes::uniform(d.channels(), d.base_volume.min(Volume::NORM));
        debug!(%device, "Entering passthrough");
        if let Err(e) = self.set_device_volume(device, Some(&unity), true, false).await {
            warn!(%device, error = %e, "Cannot reset volume for passthrough");
        }
    }

    /// Restore the volume saved by [`Core::enter_passthrough`]
    pub(crate) async fn leave_passthrough(&mut self, device: DeviceIndex) {
        let Some((volume, save)) = self.devices.get_mut(device).and_then(|d| d.saved_volume.take()) else {
            return;
        };
        debug!(%device, "Leaving passthrough");
        if let Err(e) = self.set_device_volume(device, Some(&volume), true, save).await {
            warn!(%device, error = %e, "Cannot restore volume after passthrough");
        }
    }

    /// Formats the device can carry, in priority order
    ///
    /// # Errors
    /// Returns error if the device does not exist.
    pub fn device_formats(&self, device: DeviceIndex) -> Result<Vec<FormatInfo>> {
        Ok(self
            .device_ref(device)?
            .hardware
            .as_ref()
            .map_or_else(|| vec![FormatInfo::pcm()], |hw| hw.get_formats()))
    }

    /// The subset of `formats` the device can carry, in the caller's order
    ///
    /// # Errors
    /// Returns error if the device does not exist.
    pub fn check_formats(&self, device: DeviceIndex, formats: &[FormatInfo]) -> Result<Vec<FormatInfo>> {
        let offered = self.device_formats(device)?;
        Ok(formats
            .iter()
            .filter(|f| offered.iter().any(|o| o.accepts(f)))
            .cloned()
            .collect())
    }

    /// Bound the latency of a dynamic-latency device
    ///
    /// # Errors
    /// Returns error if the device does not exist.
    pub async fn set_latency_range(&mut self, device: DeviceIndex, min: Duration, max: Duration) -> Result<()> {
        let range = LatencyRange::new(min, max);
        self.device_mut(device)?.latency_range = range;
        self.call_device(device, |reply| DeviceCall::SetLatencyRange { range, reply })
            .await
    }

    /// Latency of a device without dynamic latency. Ignored for dynamic devices.
    ///
    /// # Errors
    /// Returns error if the device does not exist.
    pub async fn set_fixed_latency(&mut self, device: DeviceIndex, latency: Duration) -> Result<()> {
        let d = self.device_mut(device)?;
        if d.is_dynamic_latency() {
            warn!(%device, "Fixed latency ignored on a dynamic-latency device");
            return Ok(());
        }
        let latency = LatencyRange::default().clamp(latency);
        d.fixed_latency = latency;
        self.call_device(device, |reply| DeviceCall::SetFixedLatency { latency, reply })
            .await
    }

    /// Shift reported latency by `offset` microseconds
    ///
    /// # Errors
    /// Returns error if the device does not exist.
    pub async fn set_latency_offset(&mut self, device: DeviceIndex, offset: i64) -> Result<()> {
        self.device_mut(device)?.latency_offset = offset;
        self.call_device(device, |reply| DeviceCall::SetLatencyOffset { offset, reply })
            .await?;
        self.emit(CoreEvent::DeviceChanged(device));
        Ok(())
    }

    /// Current latency, zero while the device is not opened
    ///
    /// # Errors
    /// Returns error if the device does not exist or its thread is gone.
    pub async fn device_latency(&self, device: DeviceIndex) -> Result<Duration> {
        if !self.device_ref(device)?.state.is_opened() {
            return Ok(Duration::ZERO);
        }
        self.call_device(device, |reply| DeviceCall::GetLatency { reply })
            .await
    }

    /// Latency the device would run at given its streams' requests
    ///
    /// # Errors
    /// Returns error if the device does not exist or its thread is gone.
    pub async fn requested_latency(&self, device: DeviceIndex) -> Result<Option<Duration>> {
        if self.device_ref(device)?.state == DeviceState::Suspended {
            return Ok(None);
        }
        self.call_device(device, |reply| DeviceCall::GetRequestedLatency { reply })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_families() {
        assert!(same_rate_family(44_100, 22_050));
        assert!(same_rate_family(48_000, 96_000));
        assert!(!same_rate_family(44_100, 48_000));
        assert!(same_rate_family(8_000, 48_000));
    }
}
