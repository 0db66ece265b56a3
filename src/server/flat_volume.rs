//! Flat volume bookkeeping.
//!
//! Everything here is synchronous and touches only control-side state.
//! Callers push the results to the device threads afterwards with
//! [`Core::sync_shared_volume`].
//!
//! Devices sharing volume with a master form a tree hanging off a root
//! device: each filter device is fed by a stream (its master stream) on its
//! parent, and that stream carries the filter device as `origin_device`.

use tracing::trace;

use super::Core;
use crate::{
    arena::{DeviceIndex, StreamIndex},
    device::{DeviceCall, StreamVolume, VolumeSync},
    events::CoreEvent,
    volume::{ChannelMap, ChannelVolumes, Volume},
};

/// Longest master chain followed before giving up
pub(crate) const MAX_CHAIN_DEPTH: usize = 100;

impl Core {
    /// Root of the volume sharing tree `device` belongs to.
    ///
    /// `None` for a sharing filter device whose master stream is missing or
    /// currently moving.
    pub(crate) fn master_of(&self, device: DeviceIndex) -> Option<DeviceIndex> {
        let mut current = device;
        for _ in 0..MAX_CHAIN_DEPTH {
            let d = self.devices.get(current)?;
            if !d.policy.share_volume_with_master {
                return Some(current);
            }
            current = self.streams.get(d.master_stream?)?.device?;
        }
        None
    }

    /// Whether the root of `device`'s tree runs flat volume
    pub(crate) fn flat_volume_enabled(&self, device: DeviceIndex) -> bool {
        self.master_of(device)
            .and_then(|root| self.devices.get(root))
            .is_some_and(|d| d.derived.flat_volume)
    }

    /// Filter device fed by `stream` that shares its volume
    pub(crate) fn sharing_origin(&self, stream: StreamIndex) -> Option<DeviceIndex> {
        let origin = self.streams.get(stream)?.origin_device?;
        self.devices
            .get(origin)
            .filter(|d| d.policy.share_volume_with_master)
            .map(|_| origin)
    }

    fn attached(&self, device: DeviceIndex) -> Vec<StreamIndex> {
        self.devices
            .get(device)
            .map(|d| d.streams.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Set a stream volume without touching any ratio
    pub(crate) fn set_stream_volume_direct(&mut self, stream: StreamIndex, volume: ChannelVolumes) {
        let Some(s) = self.streams.get_mut(stream) else {
            return;
        };
        if s.volume == volume {
            return;
        }
        s.volume = volume.clone();
        self.emit(CoreEvent::StreamVolumeChanged { stream, volume });
    }

    /// `reference_ratio = volume / device reference volume`, keeping the old
    /// ratio on silent device channels and where it is still exact
    pub(crate) fn compute_reference_ratio(&mut self, stream: StreamIndex) {
        let Some(s) = self.streams.get(stream) else {
            return;
        };
        let Some(d) = s.device.and_then(|d| self.devices.get(d)) else {
            return;
        };

        let remapped = d.reference_volume.remap(&d.map, &s.map);
        let mut ratio = s.reference_ratio.clone();
        for (c, r) in ratio.values_mut().iter_mut().enumerate() {
            let device_volume = remapped.get(c).unwrap_or(Volume::MUTED);
            let volume = s.volume.get(c).unwrap_or(Volume::MUTED);
            if device_volume <= Volume::MUTED || r.sw_multiply(device_volume) == volume {
                continue;
            }
            *r = volume.sw_divide(device_volume);
        }

        if let Some(s) = self.streams.get_mut(stream) {
            s.reference_ratio = ratio;
        }
    }

    pub(crate) fn compute_reference_ratios(&mut self, device: DeviceIndex) {
        for stream in self.attached(device) {
            self.compute_reference_ratio(stream);
            if let Some(origin) = self.sharing_origin(stream) {
                self.compute_reference_ratios(origin);
            }
        }
    }

    /// `real_ratio = volume / device real volume`, `soft_volume = real_ratio * volume_factor`
    pub(crate) fn compute_real_ratios(&mut self, device: DeviceIndex) {
        let Some(d) = self.devices.get(device) else {
            return;
        };
        let real = d.real_volume.clone();
        let map = d.map.clone();

        for stream in self.attached(device) {
            if let Some(origin) = self.sharing_origin(stream) {
                // The filter device mirrors the root, so its feed passes at unity.
                if let Some(s) = self.streams.get_mut(stream) {
                    s.real_ratio = ChannelVolumes::norm(s.channels());
                    s.soft_volume = s.volume_factor.clone();
                }
                self.compute_real_ratios(origin);
                continue;
            }

            let Some(s) = self.streams.get_mut(stream) else {
                continue;
            };
            let remapped = real.remap(&map, &s.map);
            let mut ratio = s.real_ratio.clone();
            let mut soft = s.soft_volume.clone();

            for (c, (r, applied)) in ratio
                .values_mut()
                .iter_mut()
                .zip(soft.values_mut().iter_mut())
                .enumerate()
            {
                let device_volume = remapped.get(c).unwrap_or(Volume::MUTED);
                if device_volume <= Volume::MUTED {
                    *applied = Volume::MUTED;
                    continue;
                }
                let volume = s.volume.get(c).unwrap_or(Volume::MUTED);
                if r.sw_multiply(device_volume) != volume {
                    *r = volume.sw_divide(device_volume);
                }
                *applied = r.sw_multiply(s.volume_factor.get(c).unwrap_or(Volume::NORM));
            }

            s.real_ratio = ratio;
            s.soft_volume = soft;
        }
    }

    /// Fold the loudest stream volume under `device` into `max`, laid out per `map`
    fn get_maximum_volume(&self, device: DeviceIndex, max: &mut ChannelVolumes, map: &ChannelMap) {
        for stream in self.attached(device) {
            if let Some(origin) = self.sharing_origin(stream) {
                // Mirrors the root; must not drive it.
                self.get_maximum_volume(origin, max, map);
                continue;
            }
            let Some(s) = self.streams.get(stream) else {
                continue;
            };
            let remapped = s.volume.remap_minimal_impact(max, &s.map, map);
            *max = max.merge(&remapped);
        }
    }

    /// Whether any stream in the tree below `device` has a volume of its own
    fn has_streams(&self, device: DeviceIndex) -> bool {
        self.attached(device)
            .into_iter()
            .any(|stream| match self.sharing_origin(stream) {
                Some(origin) => self.has_streams(origin),
                None => true,
            })
    }

    /// Set the real volume of `device` and every filter device sharing it
    pub(crate) fn update_real_volume(
        &mut self,
        device: DeviceIndex,
        new_volume: &ChannelVolumes,
        map: &ChannelMap,
    ) {
        let flat = self.flat_volume_enabled(device);
        let Some(d) = self.devices.get_mut(device) else {
            return;
        };
        d.real_volume = new_volume.remap(map, &d.map);

        for stream in self.attached(device) {
            let Some(origin) = self.sharing_origin(stream) else {
                continue;
            };
            if flat {
                let Some(stream_map) = self.streams.get(stream).map(|s| s.map.clone()) else {
                    continue;
                };
                self.set_stream_volume_direct(stream, new_volume.remap(map, &stream_map));
                self.compute_reference_ratio(stream);
            }
            self.update_real_volume(origin, new_volume, map);
        }
    }

    /// Derive the real volume of a flat root from its streams
    pub(crate) fn compute_real_volume(&mut self, device: DeviceIndex) {
        let Some(d) = self.devices.get(device) else {
            return;
        };
        let map = d.map.clone();

        if !self.has_streams(device) {
            // Nothing to follow; leave the volume where the user put it.
            let reference = d.reference_volume.clone();
            self.update_real_volume(device, &reference, &map);
            return;
        }

        let mut max = ChannelVolumes::muted(map.channels());
        self.get_maximum_volume(device, &mut max, &map);
        trace!(%device, real = %max, "Flat real volume");
        self.update_real_volume(device, &max, &map);
        self.compute_real_ratios(device);
    }

    /// `volume = device reference volume * reference_ratio` for every stream
    pub(crate) fn propagate_reference_volume(&mut self, device: DeviceIndex) {
        let Some(d) = self.devices.get(device) else {
            return;
        };
        let reference = d.reference_volume.clone();
        let map = d.map.clone();

        for stream in self.attached(device) {
            if let Some(origin) = self.sharing_origin(stream) {
                self.propagate_reference_volume(origin);
                continue;
            }
            let Some(s) = self.streams.get(stream) else {
                continue;
            };
            let volume = reference.remap(&map, &s.map).multiply(&s.reference_ratio);
            self.set_stream_volume_direct(stream, volume);
        }
    }

    /// Store a new reference volume; returns whether anything in the tree may have changed
    pub(crate) fn update_reference_volume(
        &mut self,
        device: DeviceIndex,
        volume: &ChannelVolumes,
        map: &ChannelMap,
        save: bool,
    ) -> bool {
        let Some(d) = self.devices.get_mut(device) else {
            return false;
        };
        let remapped = volume.remap(map, &d.map);
        let changed = remapped != d.reference_volume;
        d.reference_volume = remapped.clone();
        d.save_volume = (!changed && d.save_volume) || save;
        let share = d.policy.share_volume_with_master;

        if changed {
            self.emit(CoreEvent::DeviceVolumeChanged {
                device,
                volume: remapped,
            });
        } else if !share {
            // An unchanged root cannot change anything below it.
            return false;
        }

        for stream in self.attached(device) {
            if let Some(origin) = self.sharing_origin(stream) {
                self.update_reference_volume(origin, volume, map, false);
            }
        }
        true
    }

    /// The real volume changed in hardware; make it the new reference.
    ///
    /// Returns whether anything changed.
    pub(crate) fn propagate_real_volume(&mut self, device: DeviceIndex, old_real: &ChannelVolumes) -> bool {
        let Some(d) = self.devices.get(device) else {
            return false;
        };
        if d.real_volume == *old_real {
            return false;
        }
        let real = d.real_volume.clone();
        let map = d.map.clone();

        self.update_reference_volume(device, &real, &map, true);

        if self.flat_volume_enabled(device) {
            let reference = self
                .devices
                .get(device)
                .map(|d| d.reference_volume.clone())
                .unwrap_or(real);

            for stream in self.attached(device) {
                let Some(s) = self.streams.get_mut(stream) else {
                    continue;
                };
                s.reference_ratio = s.real_ratio.clone();
                let volume = reference.remap(&map, &s.map).multiply(&s.reference_ratio);
                self.set_stream_volume_direct(stream, volume);

                if let Some(origin) = self.sharing_origin(stream) {
                    self.propagate_real_volume(origin, old_real);
                }
            }
        }

        if let Some(d) = self.devices.get_mut(device) {
            if !d.policy.share_volume_with_master {
                d.save_volume = true;
            }
        }
        true
    }

    /// Snapshot of the volumes `device`'s thread mirrors
    pub(crate) fn volume_sync(&self, device: DeviceIndex) -> Option<VolumeSync> {
        let d = self.devices.get(device)?;
        let streams = d
            .streams
            .iter()
            .filter_map(|index| self.streams.get(*index))
            .map(|s| StreamVolume {
                stream: s.index,
                soft_volume: s.soft_volume.clone(),
            })
            .collect();
        Some(VolumeSync {
            soft_volume: d.soft_volume.clone(),
            real_volume: d.real_volume.clone(),
            streams,
        })
    }

    /// Push device and stream soft volumes of the whole sharing tree to the device threads
    pub(crate) async fn sync_shared_volume(&mut self, root: DeviceIndex) {
        let mut pending = vec![root];
        let mut visited = 0;

        while let Some(device) = pending.pop() {
            visited += 1;
            if visited > MAX_CHAIN_DEPTH {
                break;
            }
            let Some(sync) = self.volume_sync(device) else {
                continue;
            };
            pending.extend(
                self.attached(device)
                    .into_iter()
                    .filter_map(|stream| self.sharing_origin(stream)),
            );

            let Ok(soft_volume) = self
                .call_device(device, |reply| DeviceCall::SyncVolumes { sync, reply })
                .await
            else {
                continue;
            };
            if let Some(d) = self.devices.get_mut(device) {
                if d.derived.deferred_volume {
                    d.soft_volume = soft_volume;
                }
            }
        }
    }
}
