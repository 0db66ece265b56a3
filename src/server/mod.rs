//! The control context.
//!
//! [`Core`] owns every device and stream and serializes all policy
//! decisions: creation, volume, suspend, moves. Audio processing happens on
//! the device threads; `Core` reaches them only through rendezvous calls and
//! one-way notices.

mod devices;
mod flat_volume;
mod moving;
mod stream_volume;
mod streams;

use std::sync::Arc;

use futures::Stream as FuturesStream;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, trace};

use crate::{
    arena::{Arena, DeviceIndex, StreamIndex},
    channel::{NoticeSender, Reply, notice_channel},
    config::CoreConfig,
    device::{ControlNotice, Device, DeviceCall, DeviceKind, DeviceNotice},
    error::{CoreError, Result},
    events::{CoreEvent, MayMoveHook, MoveFailHook},
    resample::{DefaultResamplerFactory, ResamplerFactory},
    stream::Stream,
};

const EVENTS_BUFFER_SIZE: usize = 100;

/// Routing and volume core
///
/// Single owner of all devices and streams. Every method runs in the
/// control context; none of them is reentrant, so a `Core` is driven from
/// one task.
pub struct Core {
    config: CoreConfig,
    pub(crate) devices: Arena<DeviceIndex, Device>,
    pub(crate) streams: Arena<StreamIndex, Stream>,
    default_output: Option<DeviceIndex>,
    default_input: Option<DeviceIndex>,
    resamplers: Arc<dyn ResamplerFactory>,
    events_tx: broadcast::Sender<CoreEvent>,
    notices_tx: NoticeSender<ControlNotice>,
    notices_rx: mpsc::UnboundedReceiver<ControlNotice>,
    move_fail_hooks: Vec<MoveFailHook>,
    may_move_hooks: Vec<MayMoveHook>,
}

impl Core {
    /// Create an empty core
    pub fn new(config: CoreConfig) -> Self {
        let (events_tx, _) = broadcast::channel(EVENTS_BUFFER_SIZE);
        let (notices_tx, notices_rx) = notice_channel();

        Self {
            config,
            devices: Arena::new(),
            streams: Arena::new(),
            default_output: None,
            default_input: None,
            resamplers: Arc::new(DefaultResamplerFactory),
            events_tx,
            notices_tx,
            notices_rx,
            move_fail_hooks: Vec::new(),
            may_move_hooks: Vec::new(),
        }
    }

    /// Use `factory` for every resampler built from now on
    pub fn with_resampler_factory(mut self, factory: Arc<dyn ResamplerFactory>) -> Self {
        self.resamplers = factory;
        self
    }

    /// Active configuration
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Look up a device
    pub fn device(&self, index: DeviceIndex) -> Option<&Device> {
        self.devices.get(index)
    }

    /// Look up a device by name
    pub fn device_by_name(&self, name: &str) -> Option<&Device> {
        self.devices.iter().map(|(_, d)| d).find(|d| d.name == name)
    }

    /// All devices, in slot order
    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter().map(|(_, d)| d)
    }

    /// Look up a stream
    pub fn stream(&self, index: StreamIndex) -> Option<&Stream> {
        self.streams.get(index)
    }

    /// All streams, in slot order
    pub fn streams(&self) -> impl Iterator<Item = &Stream> {
        self.streams.iter().map(|(_, s)| s)
    }

    /// Device new playback streams attach to when none is named
    pub fn default_output(&self) -> Option<DeviceIndex> {
        self.default_output
    }

    /// Device new capture streams attach to when none is named
    pub fn default_input(&self) -> Option<DeviceIndex> {
        self.default_input
    }

    /// Make `device` the default for its direction
    ///
    /// # Errors
    /// Returns error if the device does not exist or is not linked.
    pub fn set_default_device(&mut self, device: DeviceIndex) -> Result<()> {
        let d = self.device_ref(device)?;
        if !d.state.is_linked() {
            return Err(CoreError::BadState(format!("{device} is not linked")));
        }
        match d.kind {
            DeviceKind::Output => self.default_output = Some(device),
            DeviceKind::Input => self.default_input = Some(device),
        }
        debug!(%device, "Default device changed");
        Ok(())
    }

    /// Receiver for change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.events_tx.subscribe()
    }

    /// Stream of change notifications; lagging subscribers skip ahead
    pub fn events(&self) -> impl FuturesStream<Item = CoreEvent> + Send + 'static {
        let mut rx = self.events_tx.subscribe();
        async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        trace!(skipped, "Event subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    /// Register a hook consulted before a stream is killed after a failed move
    pub fn on_move_fail(&mut self, hook: MoveFailHook) {
        self.move_fail_hooks.push(hook);
    }

    /// Register a hook that may veto move destinations
    pub fn on_may_move(&mut self, hook: MayMoveHook) {
        self.may_move_hooks.push(hook);
    }

    /// Handle every notice device threads have posted so far.
    ///
    /// Returns the number of notices handled. Notices for devices that were
    /// unlinked in the meantime are dropped.
    pub async fn dispatch_notices(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(notice) = self.notices_rx.try_recv() {
            handled += 1;
            match notice {
                ControlNotice::UpdateVolumeAndMute(device) => {
                    let linked = self
                        .devices
                        .get(device)
                        .is_some_and(|d| d.state.is_linked());
                    if !linked {
                        trace!(%device, "Mixer notice for unlinked device ignored");
                        continue;
                    }
                    self.update_volume_and_mute(device).await;
                }
            }
        }
        handled
    }

    /// Unlink and free every device, killing all streams
    pub async fn shutdown(&mut self) {
        for device in self.devices.keys() {
            self.unlink_device(device).await;
            self.free_device(device).await;
        }
        debug!("Core shut down");
    }

    pub(crate) fn emit(&self, event: CoreEvent) {
        let _ = self.events_tx.send(event);
    }

    pub(crate) fn notices(&self) -> NoticeSender<ControlNotice> {
        self.notices_tx.clone()
    }

    pub(crate) fn resamplers(&self) -> Arc<dyn ResamplerFactory> {
        Arc::clone(&self.resamplers)
    }

    pub(crate) fn device_ref(&self, index: DeviceIndex) -> Result<&Device> {
        self.devices
            .get(index)
            .ok_or_else(|| CoreError::NoEntity(index.to_string()))
    }

    pub(crate) fn device_mut(&mut self, index: DeviceIndex) -> Result<&mut Device> {
        self.devices
            .get_mut(index)
            .ok_or_else(|| CoreError::NoEntity(index.to_string()))
    }

    pub(crate) fn stream_ref(&self, index: StreamIndex) -> Result<&Stream> {
        self.streams
            .get(index)
            .ok_or_else(|| CoreError::NoEntity(index.to_string()))
    }

    pub(crate) fn stream_mut(&mut self, index: StreamIndex) -> Result<&mut Stream> {
        self.streams
            .get_mut(index)
            .ok_or_else(|| CoreError::NoEntity(index.to_string()))
    }

    /// Rendezvous with a device thread
    pub(crate) async fn call_device<T>(
        &self,
        device: DeviceIndex,
        build: impl FnOnce(Reply<T>) -> DeviceCall,
    ) -> Result<T> {
        let channel = self.device_ref(device)?.channel.clone();
        channel.call(build).await.map_err(|_| {
            error!(%device, "Device thread stopped answering");
            CoreError::DeviceThreadGone(device)
        })
    }

    /// Rendezvous where a dead device thread only deserves a log line
    pub(crate) async fn call_device_best_effort(
        &self,
        device: DeviceIndex,
        build: impl FnOnce(Reply<()>) -> DeviceCall,
    ) {
        let _ = self.call_device(device, build).await;
    }
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Core")
            .field("devices", &self.devices.len())
            .field("streams", &self.streams.len())
            .field("default_output", &self.default_output)
            .field("default_input", &self.default_input)
            .finish_non_exhaustive()
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        for device in self.devices.keys() {
            if let Some(d) = self.devices.get_mut(device) {
                let _ = d.channel.post(DeviceNotice::Shutdown);
                d.thread.take();
            }
        }
    }
}
