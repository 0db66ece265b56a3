//! Timed hardware volume writes for devices with deferred volume.
//!
//! A volume change reaches the speaker only after everything already queued
//! in the hardware buffer has played. Writes are therefore scheduled at
//! `now + latency + extra delay` and applied from the device context when due.
//! Raising the volume is delayed by the safety margin and lowering it is
//! brought forward by the same margin, so a transition never produces a
//! momentary peak.

use std::collections::VecDeque;

use tracing::{debug, trace};

use crate::volume::ChannelVolumes;

/// One pending hardware write
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeChange {
    /// Device-context time in microseconds at which the write is due
    pub at: u64,
    /// Hardware volume to write
    pub hw_volume: ChannelVolumes,
}

/// Ordered list of pending hardware writes
#[derive(Debug, Clone)]
pub struct VolumeChangeScheduler {
    pending: VecDeque<VolumeChange>,
    current_hw_volume: ChannelVolumes,
    safety_margin: u64,
    extra_delay: u64,
}

impl VolumeChangeScheduler {
    /// Scheduler starting from `current_hw_volume` with no pending writes
    pub fn new(current_hw_volume: ChannelVolumes, safety_margin_usec: u64, extra_delay_usec: u64) -> Self {
        Self {
            pending: VecDeque::new(),
            current_hw_volume,
            safety_margin: safety_margin_usec,
            extra_delay: extra_delay_usec,
        }
    }

    /// Last volume written to the hardware
    pub fn current_hw_volume(&self) -> &ChannelVolumes {
        &self.current_hw_volume
    }

    /// Record a hardware volume read back from the device
    pub fn set_current_hw_volume(&mut self, volume: ChannelVolumes) {
        self.current_hw_volume = volume;
    }

    /// Pending writes in apply order
    pub fn pending(&self) -> impl Iterator<Item = &VolumeChange> {
        self.pending.iter()
    }

    /// Whether nothing is waiting to be written
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Schedule `hw_volume` to be written once `latency_usec` of queued audio has played.
    ///
    /// Every pending write scheduled after the new one is dropped. Returns
    /// `false` when the request was a no-op.
    pub fn push(&mut self, hw_volume: ChannelVolumes, now: u64, latency_usec: u64) -> bool {
        if self.pending.is_empty() && hw_volume == self.current_hw_volume {
            debug!("Volume not changing");
            return false;
        }

        let mut at = now
            .saturating_add(latency_usec)
            .saturating_add(self.extra_delay);
        let avg = hw_volume.avg();
        let mut insert_after = None;

        for (i, change) in self.pending.iter().enumerate().rev() {
            if avg > change.hw_volume.avg() {
                if at.saturating_add(self.safety_margin) > change.at {
                    at = at.saturating_add(self.safety_margin);
                    insert_after = Some(i);
                    debug!("Volume going up");
                    break;
                }
            } else if at.saturating_sub(self.safety_margin) > change.at {
                at = at.saturating_sub(self.safety_margin);
                insert_after = Some(i);
                debug!("Volume going down");
                break;
            }
        }

        match insert_after {
            Some(i) => self.pending.truncate(i + 1),
            None => {
                if avg > self.current_hw_volume.avg() {
                    at = at.saturating_add(self.safety_margin);
                    debug!("Volume going up");
                } else {
                    at = at.saturating_sub(self.safety_margin);
                    debug!("Volume going down");
                }
                self.pending.clear();
            }
        }

        trace!(at, volume = %hw_volume, "Volume change scheduled");
        self.pending.push_back(VolumeChange { at, hw_volume });
        true
    }

    /// Apply every write due at `now`.
    ///
    /// `write` runs at most once, with the newest due volume. Returns whether
    /// a write happened and how long until the next pending one.
    pub fn apply(&mut self, now: u64, write: impl FnOnce(&ChannelVolumes)) -> (bool, Option<u64>) {
        let mut written = false;

        while self.pending.front().is_some_and(|c| c.at <= now) {
            if let Some(change) = self.pending.pop_front() {
                trace!(at = change.at, now, "Volume change applied");
                self.current_hw_volume = change.hw_volume;
                written = true;
            }
        }

        if written {
            write(&self.current_hw_volume);
        }

        let next = self.pending.front().map(|c| c.at.saturating_sub(now));
        (written, next)
    }

    /// Drop every pending write
    pub fn flush(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MARGIN: u64 = 8_000;

    fn pct(value: f64) -> ChannelVolumes {
        ChannelVolumes::from_percentages(&[value, value]).unwrap()
    }

    fn scheduler() -> VolumeChangeScheduler {
        VolumeChangeScheduler::new(pct(30.0), MARGIN, 0)
    }

    #[test]
    fn unchanged_volume_is_not_scheduled() {
        let mut s = scheduler();
        assert!(!s.push(pct(30.0), 0, 10_000));
        assert!(s.is_empty());
    }

    #[test]
    fn raising_is_delayed_and_lowering_brought_forward() {
        let mut up = scheduler();
        up.push(pct(50.0), 1_000, 20_000);
        assert_eq!(up.pending().next().unwrap().at, 1_000 + 20_000 + MARGIN);

        let mut down = scheduler();
        down.push(pct(10.0), 1_000, 20_000);
        assert_eq!(down.pending().next().unwrap().at, 1_000 + 20_000 - MARGIN);
    }

    #[test]
    fn later_raise_supersedes_pending_one_when_not_later() {
        let mut s = scheduler();
        s.push(pct(50.0), 0, 0);
        let first_at = s.pending().next().unwrap().at;

        s.push(pct(80.0), 0, 0);
        let pending: Vec<_> = s.pending().cloned().collect();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].hw_volume, pct(80.0));
        assert!(pending[0].at >= MARGIN);
        assert!(pending[0].at <= first_at);
    }

    #[test]
    fn later_raise_queues_behind_pending_one() {
        let mut s = scheduler();
        s.push(pct(50.0), 0, 0);
        s.push(pct(80.0), 1_000, 0);

        let pending: Vec<_> = s.pending().cloned().collect();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].hw_volume, pct(50.0));
        assert_eq!(pending[1].at, 1_000 + MARGIN);
    }

    #[test]
    fn apply_writes_newest_due_volume_once() {
        let mut s = scheduler();
        s.push(pct(50.0), 0, 0);
        s.push(pct(80.0), 1_000, 0);

        let mut writes = Vec::new();
        let (written, next) = s.apply(MARGIN, |v| writes.push(v.clone()));
        assert!(written);
        assert_eq!(next, Some(1_000));
        assert_eq!(s.current_hw_volume(), &pct(50.0));

        let (written, next) = s.apply(20_000, |v| writes.push(v.clone()));
        assert!(written);
        assert_eq!(next, None);
        assert_eq!(writes, vec![pct(50.0), pct(80.0)]);
    }

    #[test]
    fn apply_before_due_time_does_nothing() {
        let mut s = scheduler();
        s.push(pct(50.0), 0, 0);
        let (written, next) = s.apply(10, |_| panic!("nothing is due"));
        assert!(!written);
        assert_eq!(next, Some(MARGIN - 10));
    }

    #[test]
    fn flush_discards_pending() {
        let mut s = scheduler();
        s.push(pct(50.0), 0, 0);
        s.flush();
        assert!(s.is_empty());
        assert_eq!(s.current_hw_volume(), &pct(30.0));
    }
}
