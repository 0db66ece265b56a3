//! Integration tests for device and stream lifecycle.

#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use mixcore::{
    Core, CoreError,
    arena::DeviceIndex,
    backend::{CaptureSink, HardwareControl, HardwareFeatures, PlaybackSource},
    config::CoreConfig,
    device::{DevicePort, DeviceState, NewDeviceData, SuspendCause},
    error::HardwareError,
    events::CoreEvent,
    sample::{Encoding, FormatInfo},
    stream::{NewStreamData, StreamFlags, StreamState},
    volume::{ChannelVolumes, Volume},
};

struct Silence;

impl PlaybackSource for Silence {
    fn pop(&mut self, nbytes: usize) -> Option<Vec<u8>> {
        Some(vec![0; nbytes])
    }
}

struct Discard;

impl CaptureSink for Discard {
    fn push(&mut self, _chunk: &[u8]) {}
}

/// Mixer that cannot go above `ceiling` and records every write
struct ScriptedMixer {
    ceiling: Volume,
    volume: Mutex<Option<ChannelVolumes>>,
    muted: Mutex<bool>,
    ports: Mutex<Vec<String>>,
}

impl ScriptedMixer {
    fn new(ceiling: Volume) -> Arc<Self> {
        Arc::new(Self {
            ceiling,
            volume: Mutex::new(None),
            muted: Mutex::new(false),
            ports: Mutex::new(Vec::new()),
        })
    }
}

impl HardwareControl for ScriptedMixer {
    fn features(&self) -> HardwareFeatures {
        HardwareFeatures::VOLUME | HardwareFeatures::MUTE | HardwareFeatures::PORTS
    }

    fn get_volume(&self) -> Result<ChannelVolumes, HardwareError> {
        self.volume
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| HardwareError::Failed("never written".to_string()))
    }

    fn set_volume(&self, requested: &ChannelVolumes) -> Result<ChannelVolumes, HardwareError> {
        let reached = requested
            .as_slice()
            .iter()
            .map(|v| (*v).min(self.ceiling))
            .collect();
        let reached = ChannelVolumes::new(reached).map_err(|e| HardwareError::Failed(e.to_string()))?;
        *self.volume.lock().unwrap() = Some(reached.clone());
        Ok(reached)
    }

    fn get_mute(&self) -> Result<bool, HardwareError> {
        Ok(*self.muted.lock().unwrap())
    }

    fn set_mute(&self, muted: bool) -> Result<(), HardwareError> {
        *self.muted.lock().unwrap() = muted;
        Ok(())
    }

    fn set_port(&self, port: &str) -> Result<(), HardwareError> {
        if port == "broken" {
            return Err(HardwareError::Failed("jack missing".to_string()));
        }
        self.ports.lock().unwrap().push(port.to_string());
        Ok(())
    }
}

/// Mixer whose writes are timed by the device thread
#[derive(Default)]
struct DeferredMixer {
    writes: Mutex<Vec<ChannelVolumes>>,
}

impl HardwareControl for DeferredMixer {
    fn features(&self) -> HardwareFeatures {
        HardwareFeatures::VOLUME | HardwareFeatures::DEFERRED_VOLUME
    }

    fn get_volume(&self) -> Result<ChannelVolumes, HardwareError> {
        Ok(self
            .writes
            .lock()
            .unwrap()
            .last()
            .cloned()
            .unwrap_or_else(|| ChannelVolumes::norm(2)))
    }

    fn set_volume(&self, requested: &ChannelVolumes) -> Result<ChannelVolumes, HardwareError> {
        Ok(requested.clone())
    }

    fn write_volume(&self, volume: &ChannelVolumes) -> Result<(), HardwareError> {
        self.writes.lock().unwrap().push(volume.clone());
        Ok(())
    }
}

/// Clock that can switch rates, refusing `refused`
struct RateClock {
    refused: u32,
    rates: Mutex<Vec<u32>>,
}

impl RateClock {
    fn new(refused: u32) -> Arc<Self> {
        Arc::new(Self {
            refused,
            rates: Mutex::new(Vec::new()),
        })
    }
}

impl HardwareControl for RateClock {
    fn features(&self) -> HardwareFeatures {
        HardwareFeatures::RATE
    }

    fn update_rate(&self, rate: u32) -> Result<(), HardwareError> {
        if rate == self.refused {
            return Err(HardwareError::Failed(format!("{rate} Hz unsupported")));
        }
        self.rates.lock().unwrap().push(rate);
        Ok(())
    }
}

fn percentages(volume: &ChannelVolumes) -> Vec<f64> {
    volume.as_slice().iter().map(|v| v.to_percentage()).collect()
}

async fn output(core: &mut Core, name: &str) -> DeviceIndex {
    let device = core.create_device(NewDeviceData::output(name)).unwrap();
    core.put_device(device).await.unwrap();
    device
}

mod devices {
    use super::*;

    #[tokio::test]
    async fn put_device_links_and_becomes_default() {
        let mut core = Core::new(CoreConfig::default());
        let mut events = core.subscribe();

        let device = core.create_device(NewDeviceData::output("speakers")).unwrap();
        assert_eq!(core.device(device).unwrap().state(), DeviceState::Init);

        core.put_device(device).await.unwrap();

        let d = core.device(device).unwrap();
        assert_eq!(d.state(), DeviceState::Idle);
        assert_eq!(d.channel_map().channels(), 2);
        assert_eq!(d.default_rate(), 44_100);
        assert_eq!(core.default_output(), Some(device));
        assert_eq!(core.device_by_name("speakers").unwrap().index(), device);

        let mut added = false;
        while let Ok(event) = events.try_recv() {
            added |= matches!(event, CoreEvent::DeviceAdded(x) if x == device);
        }
        assert!(added);

        core.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_name_is_busy() {
        let mut core = Core::new(CoreConfig::default());
        output(&mut core, "speakers").await;

        let err = core.create_device(NewDeviceData::output("speakers")).unwrap_err();
        assert!(matches!(err, CoreError::Busy(_)));

        core.shutdown().await;
    }

    #[tokio::test]
    async fn putting_twice_is_bad_state() {
        let mut core = Core::new(CoreConfig::default());
        let device = output(&mut core, "speakers").await;

        let err = core.put_device(device).await.unwrap_err();
        assert!(matches!(err, CoreError::BadState(_)));

        core.shutdown().await;
    }

    #[tokio::test]
    async fn unlink_kills_streams_and_moves_default() {
        let mut core = Core::new(CoreConfig::default());
        let a = output(&mut core, "a").await;
        let b = output(&mut core, "b").await;
        let s = core
            .create_stream(NewStreamData::playback("music", Silence).with_device(a))
            .await
            .unwrap();
        core.put_stream(s).await.unwrap();

        let mut events = core.subscribe();
        core.unlink_device(a).await;

        assert!(core.stream(s).is_none());
        assert_eq!(core.device(a).unwrap().state(), DeviceState::Unlinked);
        assert_eq!(core.default_output(), Some(b));

        let mut killed = false;
        let mut removed = false;
        while let Ok(event) = events.try_recv() {
            killed |= matches!(event, CoreEvent::StreamKilled(x) if x == s);
            removed |= matches!(event, CoreEvent::DeviceRemoved(x) if x == a);
        }
        assert!(killed);
        assert!(removed);

        core.free_device(a).await;
        assert!(core.device(a).is_none());

        core.shutdown().await;
    }

    #[tokio::test]
    async fn running_while_an_uncorked_stream_is_attached() {
        let mut core = Core::new(CoreConfig::default());
        let device = output(&mut core, "speakers").await;
        let s = core
            .create_stream(NewStreamData::playback("music", Silence).with_device(device))
            .await
            .unwrap();
        core.put_stream(s).await.unwrap();
        assert_eq!(core.device(device).unwrap().state(), DeviceState::Running);

        core.cork_stream(s, true).await.unwrap();
        assert_eq!(core.stream(s).unwrap().state(), StreamState::Corked);
        assert_eq!(core.device(device).unwrap().state(), DeviceState::Idle);
        assert_eq!(core.device(device).unwrap().n_corked(), 1);

        core.cork_stream(s, false).await.unwrap();
        assert_eq!(core.device(device).unwrap().state(), DeviceState::Running);

        core.shutdown().await;
    }
}

mod suspend {
    use super::*;

    #[tokio::test]
    async fn suspended_while_any_cause_remains() {
        let mut core = Core::new(CoreConfig::default());
        let device = output(&mut core, "speakers").await;

        core.suspend_device(device, true, SuspendCause::USER).await.unwrap();
        core.suspend_device(device, true, SuspendCause::IDLE).await.unwrap();
        assert_eq!(core.device(device).unwrap().state(), DeviceState::Suspended);

        core.suspend_device(device, false, SuspendCause::USER).await.unwrap();
        let d = core.device(device).unwrap();
        assert_eq!(d.state(), DeviceState::Suspended);
        assert_eq!(d.suspend_cause(), SuspendCause::IDLE);

        core.suspend_device(device, false, SuspendCause::IDLE).await.unwrap();
        let d = core.device(device).unwrap();
        assert_eq!(d.state(), DeviceState::Idle);
        assert!(d.suspend_cause().is_empty());

        core.shutdown().await;
    }

    #[tokio::test]
    async fn empty_cause_is_rejected() {
        let mut core = Core::new(CoreConfig::default());
        let device = output(&mut core, "speakers").await;

        let err = core
            .suspend_device(device, true, SuspendCause::empty())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument(_)));

        core.shutdown().await;
    }

    #[tokio::test]
    async fn kill_on_suspend_streams_are_killed() {
        let mut core = Core::new(CoreConfig::default());
        let device = output(&mut core, "speakers").await;

        let fragile = core
            .create_stream(
                NewStreamData::playback("fragile", Silence)
                    .with_device(device)
                    .with_flags(StreamFlags::KILL_ON_SUSPEND),
            )
            .await
            .unwrap();
        core.put_stream(fragile).await.unwrap();
        let sturdy = core
            .create_stream(NewStreamData::playback("sturdy", Silence).with_device(device))
            .await
            .unwrap();
        core.put_stream(sturdy).await.unwrap();

        core.suspend_device(device, true, SuspendCause::USER).await.unwrap();

        assert!(core.stream(fragile).is_none());
        assert!(core.stream(sturdy).is_some());

        core.shutdown().await;
    }

    #[tokio::test]
    async fn no_create_on_suspend_is_refused() {
        let mut core = Core::new(CoreConfig::default());
        let device = output(&mut core, "speakers").await;
        core.suspend_device(device, true, SuspendCause::USER).await.unwrap();

        let err = core
            .create_stream(
                NewStreamData::playback("late", Silence)
                    .with_device(device)
                    .with_flags(StreamFlags::NO_CREATE_ON_SUSPEND),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::BadState(_)));

        core.shutdown().await;
    }

    #[tokio::test]
    async fn suspend_all_reaches_every_device() {
        let mut core = Core::new(CoreConfig::default());
        let a = output(&mut core, "a").await;
        let b = output(&mut core, "b").await;

        core.suspend_all(true, SuspendCause::SESSION).await.unwrap();
        assert_eq!(core.device(a).unwrap().state(), DeviceState::Suspended);
        assert_eq!(core.device(b).unwrap().state(), DeviceState::Suspended);

        core.suspend_all(false, SuspendCause::SESSION).await.unwrap();
        assert_eq!(core.device(a).unwrap().state(), DeviceState::Idle);
        assert_eq!(core.device(b).unwrap().state(), DeviceState::Idle);

        core.shutdown().await;
    }
}

mod hardware {
    use super::*;

    async fn mixer_device(core: &mut Core, mixer: Arc<ScriptedMixer>) -> DeviceIndex {
        let data = NewDeviceData::output("card")
            .with_hardware(mixer)
            .with_ports(vec![DevicePort::new("speaker", 10), DevicePort::new("headphones", 5)]);
        let device = core.create_device(data).unwrap();
        core.put_device(device).await.unwrap();
        device
    }

    #[tokio::test]
    async fn software_makes_up_what_hardware_cannot_reach() {
        let mut core = Core::new(CoreConfig::default());
        let mixer = ScriptedMixer::new(Volume::from_percentage(50.0));
        let device = mixer_device(&mut core, mixer.clone()).await;

        let volume = ChannelVolumes::from_percentages(&[80.0, 80.0]).unwrap();
        core.set_device_volume(device, Some(&volume), true, false).await.unwrap();

        let written = mixer.volume.lock().unwrap().clone().unwrap();
        assert_eq!(percentages(&written), vec![50.0, 50.0]);

        let soft = percentages(core.device(device).unwrap().soft_volume());
        assert!(soft.iter().all(|p| (p - 160.0).abs() < 0.1), "{soft:?}");

        core.shutdown().await;
    }

    #[tokio::test]
    async fn mute_reaches_hardware() {
        let mut core = Core::new(CoreConfig::default());
        let mixer = ScriptedMixer::new(Volume::NORM);
        let device = mixer_device(&mut core, mixer.clone()).await;

        core.set_device_mute(device, true, true).await.unwrap();

        assert!(*mixer.muted.lock().unwrap());
        assert!(core.device(device).unwrap().is_muted());
        assert!(core.get_device_mute(device, false).await.unwrap());

        core.shutdown().await;
    }

    #[tokio::test]
    async fn best_port_is_active_and_can_change() {
        let mut core = Core::new(CoreConfig::default());
        let mixer = ScriptedMixer::new(Volume::NORM);
        let device = mixer_device(&mut core, mixer.clone()).await;
        assert_eq!(core.device(device).unwrap().active_port(), Some("speaker"));

        core.set_port(device, "headphones", true).await.unwrap();

        assert_eq!(core.device(device).unwrap().active_port(), Some("headphones"));
        assert!(core.device(device).unwrap().save_port());
        assert_eq!(mixer.ports.lock().unwrap().as_slice(), ["headphones".to_string()]);

        core.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_port_is_no_entity() {
        let mut core = Core::new(CoreConfig::default());
        let device = mixer_device(&mut core, ScriptedMixer::new(Volume::NORM)).await;

        let err = core.set_port(device, "hdmi", false).await.unwrap_err();
        assert!(matches!(err, CoreError::NoEntity(_)));
        assert_eq!(core.device(device).unwrap().active_port(), Some("speaker"));

        core.shutdown().await;
    }

    #[tokio::test]
    async fn deferred_volume_is_written_when_due() {
        let mut config = CoreConfig::default();
        config.volume.deferred_volume_extra_delay_usec = 100_000;
        let mut core = Core::new(config);
        let mixer = Arc::new(DeferredMixer::default());
        let device = core
            .create_device(NewDeviceData::output("card").with_hardware(mixer.clone()))
            .unwrap();
        core.put_device(device).await.unwrap();
        assert!(core.device(device).unwrap().derived().deferred_volume);

        let half = ChannelVolumes::from_percentages(&[50.0, 50.0]).unwrap();
        core.set_device_volume(device, Some(&half), true, false).await.unwrap();

        assert!(!mixer.writes.lock().unwrap().contains(&half));
        assert!(core.device(device).unwrap().soft_volume().is_norm());
        assert_eq!(core.device(device).unwrap().real_volume(), &half);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(mixer.writes.lock().unwrap().last(), Some(&half));

        core.shutdown().await;
    }

    async fn clocked_device(core: &mut Core, clock: Arc<RateClock>) -> DeviceIndex {
        let data = NewDeviceData::output("hdmi")
            .with_hardware(clock)
            .with_alternate_rate(48_000);
        let device = core.create_device(data).unwrap();
        core.put_device(device).await.unwrap();
        device
    }

    #[tokio::test]
    async fn rate_follows_family_of_request() {
        let mut core = Core::new(CoreConfig::default());
        let clock = RateClock::new(0);
        let device = clocked_device(&mut core, clock.clone()).await;
        assert_eq!(core.device(device).unwrap().sample_spec().rate, 44_100);

        assert!(core.update_rate(device, 96_000, false).await.unwrap());
        assert_eq!(core.device(device).unwrap().sample_spec().rate, 48_000);
        assert!(!core.update_rate(device, 48_000, false).await.unwrap());

        assert!(core.update_rate(device, 22_050, false).await.unwrap());
        let d = core.device(device).unwrap();
        assert_eq!(d.sample_spec().rate, 44_100);
        assert_eq!(d.state(), DeviceState::Idle);
        assert!(d.suspend_cause().is_empty());
        assert_eq!(clock.rates.lock().unwrap().as_slice(), [48_000, 44_100]);

        core.shutdown().await;
    }

    #[tokio::test]
    async fn rate_is_kept_while_streams_play() {
        let mut core = Core::new(CoreConfig::default());
        let clock = RateClock::new(0);
        let device = clocked_device(&mut core, clock.clone()).await;
        let s = core
            .create_stream(NewStreamData::playback("music", Silence).with_device(device))
            .await
            .unwrap();
        core.put_stream(s).await.unwrap();
        assert_eq!(core.device(device).unwrap().state(), DeviceState::Running);

        let err = core.update_rate(device, 96_000, false).await.unwrap_err();
        assert!(matches!(err, CoreError::BadState(_)));

        core.suspend_device(device, true, SuspendCause::USER).await.unwrap();
        let err = core.update_rate(device, 96_000, false).await.unwrap_err();
        assert!(matches!(err, CoreError::Busy(_)));

        assert_eq!(core.device(device).unwrap().sample_spec().rate, 44_100);
        assert!(clock.rates.lock().unwrap().is_empty());

        core.shutdown().await;
    }

    #[tokio::test]
    async fn refused_rate_keeps_device_rate() {
        let mut core = Core::new(CoreConfig::default());
        let device = clocked_device(&mut core, RateClock::new(48_000)).await;

        let err = core.update_rate(device, 96_000, false).await.unwrap_err();
        assert!(matches!(err, CoreError::NotSupported(_)));

        let d = core.device(device).unwrap();
        assert_eq!(d.sample_spec().rate, 44_100);
        assert_eq!(d.state(), DeviceState::Idle);

        core.shutdown().await;
    }

    #[tokio::test]
    async fn rate_change_refreshes_attached_resamplers() {
        let mut core = Core::new(CoreConfig::default());
        let device = clocked_device(&mut core, RateClock::new(0)).await;
        let s = core
            .create_stream(
                NewStreamData::playback("paused", Silence)
                    .with_device(device)
                    .with_flags(StreamFlags::START_CORKED),
            )
            .await
            .unwrap();
        core.put_stream(s).await.unwrap();
        assert!(!core.stream(s).unwrap().has_resampler());
        assert_eq!(core.device(device).unwrap().used_by(), 0);

        assert!(core.update_rate(device, 96_000, false).await.unwrap());

        assert_eq!(core.device(device).unwrap().sample_spec().rate, 48_000);
        assert!(core.stream(s).unwrap().has_resampler());

        core.shutdown().await;
    }

    #[tokio::test]
    async fn rate_without_clock_control_is_not_implemented() {
        let mut core = Core::new(CoreConfig::default());
        let device = output(&mut core, "speakers").await;

        let err = core.update_rate(device, 48_000, false).await.unwrap_err();
        assert!(matches!(err, CoreError::NotImplemented(_)));

        core.shutdown().await;
    }

    #[tokio::test]
    async fn port_without_hardware_control_is_not_implemented() {
        let mut core = Core::new(CoreConfig::default());
        let device = output(&mut core, "speakers").await;

        let err = core.set_port(device, "speaker", false).await.unwrap_err();
        assert!(matches!(err, CoreError::NotImplemented(_)));

        core.shutdown().await;
    }
}

mod streams {
    use super::*;

    #[tokio::test]
    async fn stream_without_device_uses_default() {
        let mut core = Core::new(CoreConfig::default());
        let device = output(&mut core, "speakers").await;

        let s = core
            .create_stream(NewStreamData::playback("music", Silence))
            .await
            .unwrap();
        assert_eq!(core.stream(s).unwrap().state(), StreamState::Init);
        core.put_stream(s).await.unwrap();

        let stream = core.stream(s).unwrap();
        assert_eq!(stream.device(), Some(device));
        assert_eq!(stream.state(), StreamState::Running);
        assert_eq!(stream.sample_spec(), core.device(device).unwrap().sample_spec());

        core.shutdown().await;
    }

    #[tokio::test]
    async fn no_default_device_is_no_entity() {
        let mut core = Core::new(CoreConfig::default());

        let err = core
            .create_stream(NewStreamData::capture("recorder", Discard))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NoEntity(_)));

        core.shutdown().await;
    }

    #[tokio::test]
    async fn start_corked_stream_does_not_run_device() {
        let mut core = Core::new(CoreConfig::default());
        let device = output(&mut core, "speakers").await;

        let s = core
            .create_stream(
                NewStreamData::playback("paused", Silence)
                    .with_device(device)
                    .with_flags(StreamFlags::START_CORKED),
            )
            .await
            .unwrap();
        core.put_stream(s).await.unwrap();

        assert_eq!(core.stream(s).unwrap().state(), StreamState::Corked);
        assert_eq!(core.device(device).unwrap().state(), DeviceState::Idle);

        core.shutdown().await;
    }

    #[tokio::test]
    async fn capture_stream_attaches_to_input() {
        let mut core = Core::new(CoreConfig::default());
        let mic = core.create_device(NewDeviceData::input("mic")).unwrap();
        core.put_device(mic).await.unwrap();

        let s = core
            .create_stream(NewStreamData::capture("recorder", Discard))
            .await
            .unwrap();
        core.put_stream(s).await.unwrap();

        assert_eq!(core.stream(s).unwrap().device(), Some(mic));
        assert_eq!(core.default_input(), Some(mic));

        core.shutdown().await;
    }

    #[tokio::test]
    async fn mute_is_reported() {
        let mut core = Core::new(CoreConfig::default());
        let device = output(&mut core, "speakers").await;
        let s = core
            .create_stream(NewStreamData::playback("music", Silence).with_device(device))
            .await
            .unwrap();
        core.put_stream(s).await.unwrap();

        let mut events = core.subscribe();
        core.set_stream_mute(s, true, false).await.unwrap();

        assert!(core.stream(s).unwrap().is_muted());
        assert!(matches!(
            events.try_recv().unwrap(),
            CoreEvent::StreamMuteChanged { stream, muted: true } if stream == s
        ));

        core.shutdown().await;
    }

    #[tokio::test]
    async fn variable_rate_stream_can_change_rate() {
        let mut core = Core::new(CoreConfig::default());
        let device = output(&mut core, "speakers").await;

        let fixed = core
            .create_stream(NewStreamData::playback("fixed", Silence).with_device(device))
            .await
            .unwrap();
        core.put_stream(fixed).await.unwrap();
        assert!(core.set_stream_rate(fixed, 48_000).await.is_err());

        let variable = core
            .create_stream(
                NewStreamData::playback("variable", Silence)
                    .with_device(device)
                    .with_flags(StreamFlags::VARIABLE_RATE),
            )
            .await
            .unwrap();
        core.put_stream(variable).await.unwrap();
        core.set_stream_rate(variable, 48_000).await.unwrap();
        assert_eq!(core.stream(variable).unwrap().sample_spec().rate, 48_000);

        core.shutdown().await;
    }
}

mod passthrough {
    use super::*;

    struct Spdif;

    impl HardwareControl for Spdif {
        fn features(&self) -> HardwareFeatures {
            HardwareFeatures::empty()
        }

        fn get_formats(&self) -> Vec<FormatInfo> {
            vec![FormatInfo::pcm(), FormatInfo::passthrough(Encoding::Ac3Iec61937, 44_100)]
        }
    }

    async fn spdif(core: &mut Core) -> DeviceIndex {
        let device = core
            .create_device(NewDeviceData::output("spdif").with_hardware(Arc::new(Spdif)))
            .unwrap();
        core.put_device(device).await.unwrap();
        device
    }

    fn ac3() -> NewStreamData {
        NewStreamData::playback("movie", Silence)
            .with_formats(vec![FormatInfo::passthrough(Encoding::Ac3Iec61937, 44_100)])
    }

    #[tokio::test]
    async fn passthrough_stream_owns_the_device() {
        let mut core = Core::new(CoreConfig::default());
        let device = spdif(&mut core).await;

        let s = core.create_stream(ac3().with_device(device)).await.unwrap();
        core.put_stream(s).await.unwrap();
        assert!(core.is_passthrough(device));

        let err = core
            .create_stream(NewStreamData::playback("beep", Silence).with_device(device))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Busy(_)));

        core.shutdown().await;
    }

    #[tokio::test]
    async fn passthrough_needs_an_idle_device() {
        let mut core = Core::new(CoreConfig::default());
        let device = spdif(&mut core).await;

        let pcm = core
            .create_stream(NewStreamData::playback("music", Silence).with_device(device))
            .await
            .unwrap();
        core.put_stream(pcm).await.unwrap();

        let err = core.create_stream(ac3().with_device(device)).await.unwrap_err();
        assert!(matches!(err, CoreError::Busy(_)));

        core.shutdown().await;
    }

    #[tokio::test]
    async fn unsupported_format_is_refused() {
        let mut core = Core::new(CoreConfig::default());
        let device = output(&mut core, "analog").await;

        let err = core.create_stream(ac3().with_device(device)).await.unwrap_err();
        assert!(matches!(err, CoreError::NotSupported(_)));

        core.shutdown().await;
    }

    #[tokio::test]
    async fn device_volume_is_locked_during_passthrough() {
        let mut core = Core::new(CoreConfig::default());
        let device = spdif(&mut core).await;

        let s = core.create_stream(ac3().with_device(device)).await.unwrap();
        core.put_stream(s).await.unwrap();

        let before = core.device(device).unwrap().reference_volume().clone();
        let quieter = ChannelVolumes::from_percentages(&[30.0, 30.0]).unwrap();
        core.set_device_volume(device, Some(&quieter), true, false).await.unwrap();
        assert_eq!(core.device(device).unwrap().reference_volume(), &before);

        core.kill_stream(s).await;
        assert!(!core.is_passthrough(device));

        core.shutdown().await;
    }
}
