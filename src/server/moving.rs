//! Moving streams between devices.
//!
//! A move has three phases. [`Core::start_move`] detaches the stream and
//! brings its render state back from the old device thread.
//! [`Core::finish_move`] attaches it to the destination. If that cannot
//! happen, [`Core::fail_move`] offers the stream to the move-failure hooks
//! and kills it when nobody takes it. Between start and finish the stream
//! has no device.

use tracing::{debug, info, instrument, warn};

use super::{Core, flat_volume::MAX_CHAIN_DEPTH};
use crate::{
    arena::{DeviceIndex, StreamIndex},
    device::DeviceCall,
    error::{CoreError, Result},
    events::CoreEvent,
    stream::{StreamFlags, StreamState},
    volume::ChannelVolumes,
};

impl Core {
    /// Whether the stream may leave its device at all
    pub fn may_move(&self, stream: StreamIndex) -> bool {
        let Some(s) = self.streams.get(stream) else {
            return false;
        };
        s.state.is_linked()
            && !s.flags.contains(StreamFlags::DONT_MOVE)
            && !s.is_synchronized()
            && s.direct_on_input.is_none()
    }

    /// Whether the stream may move to `dest`
    pub fn may_move_to(&self, stream: StreamIndex, dest: DeviceIndex) -> bool {
        let Some(s) = self.streams.get(stream) else {
            return false;
        };
        if s.device == Some(dest) {
            return true;
        }
        if !self.may_move(stream) {
            return false;
        }
        let Some(d) = self.devices.get(dest) else {
            return false;
        };
        if !d.state.is_linked() || d.kind != s.kind.device_kind() {
            return false;
        }
        if self.feeds_device(stream, dest) {
            debug!(%stream, %dest, "Move would create a routing loop");
            return false;
        }
        if self.check_passthrough_connection(dest, s.is_passthrough()).is_err() {
            return false;
        }
        self.may_move_hooks.iter().all(|hook| hook(s, dest))
    }

    /// Whether `stream` feeds `device`, directly or through a chain of filter devices
    fn feeds_device(&self, stream: StreamIndex, device: DeviceIndex) -> bool {
        let mut current = device;
        for _ in 0..MAX_CHAIN_DEPTH {
            let Some(master) = self.devices.get(current).and_then(|d| d.master_stream) else {
                return false;
            };
            if master == stream {
                return true;
            }
            let Some(next) = self.streams.get(master).and_then(|s| s.device) else {
                return false;
            };
            current = next;
        }
        warn!(%device, "Filter chain too deep");
        true
    }

    /// Detach a stream from its device in preparation for a move
    ///
    /// # Errors
    /// Returns error if the stream is not linked, may not move, or is already moving.
    #[instrument(skip(self))]
    pub async fn start_move(&mut self, stream: StreamIndex) -> Result<()> {
        let s = self.stream_ref(stream)?;
        if !s.state.is_linked() {
            return Err(CoreError::BadState(format!("{stream} is not linked")));
        }
        let origin = s
            .device
            .ok_or_else(|| CoreError::BadState(format!("{stream} is already moving")))?;
        if !self.may_move(stream) {
            return Err(CoreError::NotSupported(format!("{stream} may not move")));
        }

        let direct_outputs: Vec<_> = s.direct_outputs.iter().copied().collect();
        let corked = s.state == StreamState::Corked;
        let passthrough = s.is_passthrough();

        for output in direct_outputs {
            Box::pin(self.kill_stream(output)).await;
        }

        let thread = self
            .call_device(origin, |reply| DeviceCall::RemoveStream { stream, reply })
            .await?;

        let d = self.device_mut(origin)?;
        d.streams.remove(&stream);
        if corked {
            d.n_corked = d.n_corked.saturating_sub(1);
        }
        let origin_map = d.map.clone();

        let s = self.stream_mut(stream)?;
        s.device = None;
        s.volume_factor_device = s.volume_factor_device.remap(&origin_map, &s.map);
        s.thread = thread;

        if passthrough {
            self.leave_passthrough(origin).await;
        }
        if self.flat_volume_enabled(origin) {
            if let Err(e) = self.set_device_volume(origin, None, true, false).await {
                debug!(device = %origin, error = %e, "Volume resync failed");
            }
        }
        self.update_device_status(origin).await;

        debug!(%stream, from = %origin, "Move started");
        self.emit(CoreEvent::StreamMoveStarted(stream));
        Ok(())
    }

    /// Attach a moving stream to `dest`
    ///
    /// # Errors
    /// Returns error if the stream is not moving, may not go to `dest`, or
    /// `dest` cannot carry its format. The stream stays detached and out of
    /// every device's set; callers follow up with [`Core::fail_move`].
    #[instrument(skip(self))]
    pub async fn finish_move(&mut self, stream: StreamIndex, dest: DeviceIndex, save: bool) -> Result<()> {
        let s = self.stream_ref(stream)?;
        if !s.state.is_linked() || s.device.is_some() {
            return Err(CoreError::BadState(format!("{stream} is not moving")));
        }
        if s.thread.is_none() {
            return Err(CoreError::BadState(format!("{stream} has no render state")));
        }
        if !self.may_move_to(stream, dest) {
            return Err(CoreError::NotSupported(format!("{stream} may not move to {dest}")));
        }

        let format = s.format.clone();
        if format.is_passthrough() && self.check_formats(dest, &[format])?.is_empty() {
            let device_name = self.device_ref(dest)?.name.clone();
            warn!(%stream, %dest, "Destination cannot carry the stream format");
            self.emit(CoreEvent::FormatLost { stream, device_name });
            return Err(CoreError::NotSupported(format!("{dest} cannot carry the format of {stream}")));
        }

        let (rate, passthrough, variable) = (
            s.spec.rate,
            s.is_passthrough(),
            s.flags.contains(StreamFlags::VARIABLE_RATE),
        );
        let d = self.device_ref(dest)?;
        if !variable && rate != d.spec.rate && (passthrough || d.used_by() == 0) {
            if let Err(e) = self.update_rate(dest, rate, passthrough).await {
                debug!(%dest, error = %e, "Keeping destination rate");
            }
        }

        self.stream_mut(stream)?.device = Some(dest);
        if let Err(e) = self.update_stream_resampler(stream).await {
            self.stream_mut(stream)?.device = None;
            return Err(e);
        }

        let dest_map = self.device_ref(dest)?.map.clone();
        let s = self.stream_mut(stream)?;
        s.volume_factor_device = s.volume_factor_device.remap(&s.map, &dest_map);
        let corked = s.state == StreamState::Corked;

        let d = self.device_mut(dest)?;
        d.streams.insert(stream);
        if corked {
            d.n_corked += 1;
        }

        if let Err(e) = self.attach_to_device(stream, dest).await {
            warn!(%stream, %dest, error = %e, "Attaching to destination failed");
            self.detach_after_failed_attach(stream, dest, corked).await;
            return Err(e);
        }
        self.stream_mut(stream)?.save_device = save;

        if let Some(root) = self.master_of(dest) {
            self.sync_shared_volume(root).await;
        }
        if passthrough {
            self.enter_passthrough(dest).await;
        }
        self.update_device_status(dest).await;

        info!(%stream, %dest, "Stream moved");
        self.emit(CoreEvent::StreamMoveFinished { stream, device: dest });
        Ok(())
    }

    /// Settle volumes against `dest` and hand the render state to its thread.
    /// The stream is already in `dest`'s set.
    async fn attach_to_device(&mut self, stream: StreamIndex, dest: DeviceIndex) -> Result<()> {
        self.update_volume_due_to_moving(stream);
        if self.flat_volume_enabled(dest) {
            let save_volume = self.stream_ref(stream)?.save_volume;
            self.set_device_volume(dest, None, false, save_volume).await?;
        }

        let s = self.stream_mut(stream)?;
        let mut thread = s
            .thread
            .take()
            .ok_or_else(|| CoreError::BadState(format!("{stream} has no render state")))?;
        thread.state = s.state;
        thread.soft_volume = s.soft_volume.clone();
        thread.muted = s.muted;
        thread.volume_factor_device = s.volume_factor_device.clone();

        self.call_device(dest, |reply| DeviceCall::AddStream { info: thread, reply })
            .await
    }

    /// Undo the membership taken by [`Core::finish_move`] so the stream is
    /// moving again. Render state lost with a dead device thread stays lost.
    async fn detach_after_failed_attach(&mut self, stream: StreamIndex, dest: DeviceIndex, corked: bool) {
        let dest_map = self.devices.get_mut(dest).map(|d| {
            d.streams.remove(&stream);
            if corked {
                d.n_corked = d.n_corked.saturating_sub(1);
            }
            d.map.clone()
        });
        if let Some(s) = self.streams.get_mut(stream) {
            s.device = None;
            if let Some(dest_map) = dest_map {
                s.volume_factor_device = s.volume_factor_device.remap(&dest_map, &s.map);
            }
        }
        if self.flat_volume_enabled(dest) {
            if let Err(e) = self.set_device_volume(dest, None, true, false).await {
                debug!(device = %dest, error = %e, "Volume resync failed");
            }
        }
    }

    /// Re-derive the volumes of a freshly attached stream and of any filter
    /// device it feeds. The flat-volume recomputation on `dest` follows.
    fn update_volume_due_to_moving(&mut self, stream: StreamIndex) {
        let Some(s) = self.streams.get(stream) else {
            return;
        };
        let Some(device) = s.device.and_then(|d| self.devices.get(d)) else {
            return;
        };
        let flat = self.flat_volume_enabled(device.index);

        if let Some(origin) = self.sharing_origin(stream) {
            let Some(root) = self.master_of(device.index) else {
                return;
            };
            if !flat {
                let Some(o) = self.devices.get(origin) else {
                    return;
                };
                let volume = o.reference_volume.remap(&o.map, &s.map);
                self.set_stream_volume_direct(stream, volume);
                if let Some(s) = self.streams.get_mut(stream) {
                    s.reference_ratio = s.volume.clone();
                    s.real_ratio = s.reference_ratio.clone();
                    s.soft_volume = s.real_ratio.multiply(&s.volume_factor);
                }
            }

            let Some((reference, real, root_map)) = self
                .devices
                .get(root)
                .map(|r| (r.reference_volume.clone(), r.real_volume.clone(), r.map.clone()))
            else {
                return;
            };
            if let Some(o) = self.devices.get_mut(origin) {
                o.reference_volume = reference.remap(&root_map, &o.map);
                o.real_volume = real.remap(&root_map, &o.map);
                o.soft_volume = ChannelVolumes::norm(o.channels());
            }

            let fed: Vec<_> = self
                .devices
                .get(origin)
                .map(|o| o.streams.iter().copied().collect())
                .unwrap_or_default();
            for inner in fed {
                self.update_volume_due_to_moving(inner);
            }
        } else if flat {
            let volume = device
                .reference_volume
                .remap(&device.map, &s.map)
                .multiply(&s.reference_ratio);
            self.set_stream_volume_direct(stream, volume);
        } else {
            let volume = s.reference_ratio.clone();
            self.set_stream_volume_direct(stream, volume);
            if let Some(s) = self.streams.get_mut(stream) {
                s.real_ratio = s.reference_ratio.clone();
                s.soft_volume = s.real_ratio.multiply(&s.volume_factor);
            }
        }
    }

    /// Give up on a move: offer the stream to the move-failure hooks, then
    /// kill it if none of them found it a home
    #[instrument(skip(self))]
    pub async fn fail_move(&mut self, stream: StreamIndex) {
        let Some(s) = self.streams.get(stream) else {
            return;
        };

        let mut rescues = Vec::new();
        for hook in &mut self.move_fail_hooks {
            if let Some(dest) = hook(s) {
                rescues.push(dest);
            }
        }

        for dest in rescues {
            if !self.may_move_to(stream, dest) {
                continue;
            }
            match self.finish_move(stream, dest, false).await {
                Ok(()) => {
                    info!(%stream, %dest, "Stream rescued after failed move");
                    return;
                }
                Err(e) => debug!(%stream, %dest, error = %e, "Rescue failed"),
            }
        }

        warn!(%stream, "Move failed, killing stream");
        self.emit(CoreEvent::StreamMoveFailed(stream));
        self.kill_stream(stream).await;
    }

    /// Move a stream to `dest`. A stream that was detached but could not be
    /// attached goes through [`Core::fail_move`].
    ///
    /// # Errors
    /// Returns error if the move is refused, or attaching to `dest` failed.
    #[instrument(skip(self))]
    pub async fn move_stream(&mut self, stream: StreamIndex, dest: DeviceIndex, save: bool) -> Result<()> {
        if self.stream_ref(stream)?.device == Some(dest) {
            return Ok(());
        }
        if !self.may_move_to(stream, dest) {
            return Err(CoreError::NotSupported(format!("{stream} may not move to {dest}")));
        }
        self.start_move(stream).await?;
        if let Err(e) = self.finish_move(stream, dest, save).await {
            self.fail_move(stream).await;
            return Err(e);
        }
        Ok(())
    }

    /// Start moving every stream off `device`; returns the streams now detached
    ///
    /// # Errors
    /// Returns error if the device does not exist.
    pub async fn move_all_start(&mut self, device: DeviceIndex) -> Result<Vec<StreamIndex>> {
        let streams: Vec<_> = self.device_ref(device)?.streams.iter().copied().collect();
        let mut moving = Vec::with_capacity(streams.len());
        for stream in streams {
            match self.start_move(stream).await {
                Ok(()) => moving.push(stream),
                Err(e) => debug!(%stream, error = %e, "Stream stays"),
            }
        }
        Ok(moving)
    }

    /// Attach streams detached by [`Core::move_all_start`] to `dest`
    pub async fn move_all_finish(&mut self, streams: Vec<StreamIndex>, dest: DeviceIndex, save: bool) {
        for stream in streams {
            if !self.streams.get(stream).is_some_and(|s| s.state.is_linked()) {
                continue;
            }
            if let Err(e) = self.finish_move(stream, dest, save).await {
                debug!(%stream, %dest, error = %e, "Move failed");
                self.fail_move(stream).await;
            }
        }
    }

    /// Fail every move started by [`Core::move_all_start`]
    pub async fn move_all_fail(&mut self, streams: Vec<StreamIndex>) {
        for stream in streams {
            if self.streams.get(stream).is_some_and(|s| s.state.is_linked()) {
                self.fail_move(stream).await;
            }
        }
    }
}
