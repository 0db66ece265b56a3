//! Integration tests for flat volume between devices and their streams.

#![cfg_attr(test, allow(clippy::unwrap_used))]

use mixcore::{
    Core,
    arena::{DeviceIndex, StreamIndex},
    backend::PlaybackSource,
    config::CoreConfig,
    device::NewDeviceData,
    stream::NewStreamData,
    volume::{ChannelVolumes, Volume},
};

struct Silence;

impl PlaybackSource for Silence {
    fn pop(&mut self, nbytes: usize) -> Option<Vec<u8>> {
        Some(vec![0; nbytes])
    }
}

fn percentages(volume: &ChannelVolumes) -> Vec<f64> {
    volume.as_slice().iter().map(|v| v.to_percentage()).collect()
}

fn assert_close(volume: &ChannelVolumes, expected: &[f64]) {
    let actual = percentages(volume);
    assert_eq!(actual.len(), expected.len(), "{volume}");
    for (a, e) in actual.iter().zip(expected) {
        assert!((a - e).abs() < 0.1, "expected {expected:?}, got {actual:?}");
    }
}

async fn speakers(core: &mut Core) -> DeviceIndex {
    let device = core.create_device(NewDeviceData::output("speakers")).unwrap();
    core.put_device(device).await.unwrap();
    device
}

async fn playback(core: &mut Core, device: DeviceIndex, name: &str, volume: &[f64]) -> StreamIndex {
    let data = NewStreamData::playback(name, Silence)
        .with_device(device)
        .with_volume(ChannelVolumes::from_percentages(volume).unwrap(), true);
    let stream = core.create_stream(data).await.unwrap();
    core.put_stream(stream).await.unwrap();
    stream
}

mod device_follows_streams {
    use super::*;

    #[tokio::test]
    async fn real_volume_is_loudest_stream_per_channel() {
        let mut core = Core::new(CoreConfig::default());
        let device = speakers(&mut core).await;

        let x = playback(&mut core, device, "x", &[50.0, 50.0]).await;
        let y = playback(&mut core, device, "y", &[80.0, 30.0]).await;

        let d = core.device(device).unwrap();
        assert_close(d.real_volume(), &[80.0, 50.0]);
        assert_close(d.reference_volume(), &[100.0, 100.0]);

        assert_close(core.stream(y).unwrap().real_ratio(), &[100.0, 60.0]);
        assert_close(core.stream(x).unwrap().real_ratio(), &[62.5, 100.0]);
        assert_close(core.stream(y).unwrap().reference_ratio(), &[80.0, 30.0]);

        core.shutdown().await;
    }

    #[tokio::test]
    async fn soft_volume_is_real_ratio_times_factor() {
        let mut core = Core::new(CoreConfig::default());
        let device = speakers(&mut core).await;

        playback(&mut core, device, "x", &[50.0, 50.0]).await;
        let y = playback(&mut core, device, "y", &[80.0, 30.0]).await;

        core.add_volume_factor(y, "ducking", ChannelVolumes::uniform(2, Volume::from_percentage(50.0)))
            .await
            .unwrap();

        let s = core.stream(y).unwrap();
        assert_close(s.volume_factor(), &[50.0, 50.0]);
        assert_close(s.soft_volume(), &[50.0, 30.0]);

        core.remove_volume_factor(y, "ducking").await.unwrap();
        assert_close(core.stream(y).unwrap().soft_volume(), &[100.0, 60.0]);

        core.shutdown().await;
    }

    #[tokio::test]
    async fn factor_keeps_silent_device_channels_silent() {
        let mut core = Core::new(CoreConfig::default());
        let device = speakers(&mut core).await;

        let s = playback(&mut core, device, "left-only", &[60.0, 0.0]).await;
        assert_close(core.device(device).unwrap().real_volume(), &[60.0, 0.0]);
        assert_close(core.stream(s).unwrap().soft_volume(), &[100.0, 0.0]);

        core.add_volume_factor(s, "ducking", ChannelVolumes::uniform(2, Volume::from_percentage(50.0)))
            .await
            .unwrap();
        assert_close(core.stream(s).unwrap().soft_volume(), &[50.0, 0.0]);

        core.remove_volume_factor(s, "ducking").await.unwrap();
        assert_close(core.stream(s).unwrap().soft_volume(), &[100.0, 0.0]);

        core.shutdown().await;
    }

    #[tokio::test]
    async fn unlinking_loudest_stream_lowers_device() {
        let mut core = Core::new(CoreConfig::default());
        let device = speakers(&mut core).await;

        let x = playback(&mut core, device, "x", &[50.0, 50.0]).await;
        let y = playback(&mut core, device, "y", &[80.0, 30.0]).await;

        core.kill_stream(y).await;

        assert!(core.stream(y).is_none());
        assert_close(core.device(device).unwrap().real_volume(), &[50.0, 50.0]);
        assert_close(core.stream(x).unwrap().real_ratio(), &[100.0, 100.0]);

        core.shutdown().await;
    }
}

mod stream_volume {
    use super::*;

    #[tokio::test]
    async fn setting_same_volume_changes_nothing() {
        let mut core = Core::new(CoreConfig::default());
        let device = speakers(&mut core).await;

        playback(&mut core, device, "x", &[50.0, 50.0]).await;
        let y = playback(&mut core, device, "y", &[80.0, 30.0]).await;

        let before_device = core.device(device).unwrap().real_volume().clone();
        let before_stream = core.stream(y).unwrap().real_ratio().clone();

        let same = ChannelVolumes::from_percentages(&[80.0, 30.0]).unwrap();
        core.set_stream_volume(y, &same, true, true).await.unwrap();
        core.set_stream_volume(y, &same, true, true).await.unwrap();

        assert_eq!(core.device(device).unwrap().real_volume(), &before_device);
        assert_eq!(core.stream(y).unwrap().real_ratio(), &before_stream);
        assert!(core.stream(y).unwrap().save_volume());

        core.shutdown().await;
    }

    #[tokio::test]
    async fn raising_quiet_stream_raises_device() {
        let mut core = Core::new(CoreConfig::default());
        let device = speakers(&mut core).await;

        let x = playback(&mut core, device, "x", &[50.0, 50.0]).await;
        let y = playback(&mut core, device, "y", &[80.0, 30.0]).await;

        let louder = ChannelVolumes::from_percentages(&[90.0, 90.0]).unwrap();
        core.set_stream_volume(x, &louder, false, true).await.unwrap();

        assert_close(core.device(device).unwrap().real_volume(), &[90.0, 90.0]);
        assert_close(core.stream(x).unwrap().real_ratio(), &[100.0, 100.0]);
        assert_close(core.stream(y).unwrap().volume(), &[80.0, 30.0]);

        core.shutdown().await;
    }

    #[tokio::test]
    async fn relative_volume_scales_by_reference() {
        let mut core = Core::new(CoreConfig::default());
        let device = speakers(&mut core).await;
        let x = playback(&mut core, device, "x", &[50.0, 50.0]).await;

        let half = ChannelVolumes::from_percentages(&[50.0, 50.0]).unwrap();
        core.set_device_volume(device, Some(&half), true, false).await.unwrap();

        let full = ChannelVolumes::norm(2);
        core.set_stream_volume(x, &full, false, false).await.unwrap();

        assert_close(core.stream(x).unwrap().volume(), &[50.0, 50.0]);
        assert_close(&core.stream_volume(x, false).unwrap(), &[100.0, 100.0]);

        core.shutdown().await;
    }

    #[tokio::test]
    async fn mono_volume_applies_to_every_channel() {
        let mut core = Core::new(CoreConfig::default());
        let device = speakers(&mut core).await;
        let x = playback(&mut core, device, "x", &[50.0, 50.0]).await;

        let mono = ChannelVolumes::from_percentages(&[70.0]).unwrap();
        core.set_stream_volume(x, &mono, false, true).await.unwrap();

        assert_close(core.stream(x).unwrap().volume(), &[70.0, 70.0]);

        core.shutdown().await;
    }

    #[tokio::test]
    async fn read_only_volume_is_refused() {
        let mut core = Core::new(CoreConfig::default());
        let device = speakers(&mut core).await;

        let data = NewStreamData::playback("fixed", Silence)
            .with_device(device)
            .with_volume_writable(false);
        let stream = core.create_stream(data).await.unwrap();
        core.put_stream(stream).await.unwrap();

        let result = core.set_stream_volume(stream, &ChannelVolumes::norm(2), false, true).await;
        assert!(result.is_err());

        core.shutdown().await;
    }
}

mod device_volume {
    use super::*;

    #[tokio::test]
    async fn new_reference_propagates_to_streams() {
        let mut core = Core::new(CoreConfig::default());
        let device = speakers(&mut core).await;

        let x = playback(&mut core, device, "x", &[50.0, 50.0]).await;
        let y = playback(&mut core, device, "y", &[80.0, 30.0]).await;

        let quieter = ChannelVolumes::from_percentages(&[40.0, 40.0]).unwrap();
        core.set_device_volume(device, Some(&quieter), true, true).await.unwrap();

        let d = core.device(device).unwrap();
        assert_close(d.reference_volume(), &[40.0, 40.0]);
        assert!(d.save_volume());

        assert_close(core.stream(y).unwrap().volume(), &[32.0, 12.0]);
        assert_close(core.stream(x).unwrap().volume(), &[20.0, 20.0]);
        assert_close(core.device(device).unwrap().real_volume(), &[32.0, 20.0]);

        // Relative volumes survive the change.
        assert_close(&core.stream_volume(y, false).unwrap(), &[80.0, 30.0]);

        core.shutdown().await;
    }

    #[tokio::test]
    async fn volume_without_streams_is_taken_as_is() {
        let mut core = Core::new(CoreConfig::default());
        let device = speakers(&mut core).await;

        let volume = ChannelVolumes::from_percentages(&[60.0, 20.0]).unwrap();
        core.set_device_volume(device, Some(&volume), true, false).await.unwrap();

        let d = core.device(device).unwrap();
        assert_close(d.reference_volume(), &[60.0, 20.0]);
        assert_close(d.real_volume(), &[60.0, 20.0]);
        assert_close(d.soft_volume(), &[60.0, 20.0]);

        let read = core.get_device_volume(device, false).await.unwrap();
        assert_close(&read, &[60.0, 20.0]);

        core.shutdown().await;
    }

    #[tokio::test]
    async fn wrong_channel_count_is_rejected() {
        let mut core = Core::new(CoreConfig::default());
        let device = speakers(&mut core).await;

        let volume = ChannelVolumes::from_percentages(&[60.0, 20.0, 10.0]).unwrap();
        let result = core.set_device_volume(device, Some(&volume), true, false).await;
        assert!(result.is_err());

        core.shutdown().await;
    }
}

mod shared_volume {
    use super::*;

    #[tokio::test]
    async fn filter_device_follows_master() {
        let mut core = Core::new(CoreConfig::default());
        let master = speakers(&mut core).await;

        let filter = core
            .create_device(NewDeviceData::output("equalizer").sharing_volume_with_master())
            .unwrap();
        let feed = core
            .create_stream(
                NewStreamData::playback("equalizer feed", Silence)
                    .with_device(master)
                    .with_origin_device(filter),
            )
            .await
            .unwrap();
        core.put_stream(feed).await.unwrap();
        core.put_device(filter).await.unwrap();

        let app = playback(&mut core, filter, "app", &[70.0, 70.0]).await;

        assert_close(core.device(master).unwrap().real_volume(), &[70.0, 70.0]);
        let master_reference = percentages(core.device(master).unwrap().reference_volume());
        assert_close(core.device(filter).unwrap().reference_volume(), &master_reference);
        assert_close(core.stream(app).unwrap().real_ratio(), &[100.0, 100.0]);

        core.shutdown().await;
    }
}
