//! Plugin delay compensation: the longest chain defines alignment.

use crate::error::{EngineError, Result};
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Immutable compensation table, swapped atomically so schedulers read it
/// lock-free.
#[derive(Debug, Clone, Default)]
pub struct PdcSnapshot {
    latencies: HashMap<u64, usize>,
    compensations: HashMap<u64, usize>,
    max_latency: usize,
}

impl PdcSnapshot {
    fn recalculate(&mut self) {
        self.max_latency = self.latencies.values().copied().max().unwrap_or(0);
        self.compensations = self
            .latencies
            .iter()
            .map(|(&track, &latency)| (track, self.max_latency - latency))
            .collect();
    }

    pub fn max_latency(&self) -> usize {
        self.max_latency
    }

    pub fn latency(&self, track: u64) -> usize {
        self.latencies.get(&track).copied().unwrap_or(0)
    }

    /// `latency + compensation == max_latency` for every known track;
    /// unknown tracks are compensated by the full maximum.
    pub fn compensation(&self, track: u64) -> usize {
        self.compensations
            .get(&track)
            .copied()
            .unwrap_or(self.max_latency)
    }
}

/// Per-track latency registry with atomic snapshot publication.
pub struct DelayCompensator {
    snapshot: ArcSwap<PdcSnapshot>,
    max_allowed: AtomicUsize,
}

impl DelayCompensator {
    /// 10 seconds at 48 kHz; anything larger is a buggy plugin or driver.
    pub const DEFAULT_MAX_LATENCY: usize = 48_000 * 10;

    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(PdcSnapshot::default()),
            max_allowed: AtomicUsize::new(Self::DEFAULT_MAX_LATENCY),
        }
    }

    pub fn set_max_allowed_latency(&self, samples: usize) {
        self.max_allowed.store(samples, Ordering::Release);
    }

    /// Record a track's active (non-bypassed) chain latency and republish.
    pub fn set_track_latency(&self, track: u64, latency_samples: usize) -> Result<usize> {
        let max_allowed = self.max_allowed.load(Ordering::Acquire);
        if latency_samples > max_allowed {
            return Err(EngineError::ExcessiveLatency {
                track,
                samples: latency_samples,
            });
        }

        let mut next = self.snapshot.load().as_ref().clone();
        next.latencies.insert(track, latency_samples);
        next.recalculate();
        let compensation = next.compensation(track);
        self.snapshot.store(Arc::new(next));
        Ok(compensation)
    }

    pub fn remove_track(&self, track: u64) {
        let mut next = self.snapshot.load().as_ref().clone();
        if next.latencies.remove(&track).is_some() {
            next.recalculate();
            self.snapshot.store(Arc::new(next));
        }
    }

    #[inline]
    pub fn compensation_for(&self, track: u64) -> usize {
        self.snapshot.load().compensation(track)
    }

    /// Compensation expressed in seconds at the given playback rate, for
    /// region schedule math.
    #[inline]
    pub fn compensation_seconds(&self, track: u64, sample_rate: f64) -> f64 {
        self.compensation_for(track) as f64 / sample_rate
    }

    #[inline]
    pub fn max_latency(&self) -> usize {
        self.snapshot.load().max_latency()
    }

    pub fn snapshot(&self) -> Arc<PdcSnapshot> {
        self.snapshot.load_full()
    }

    pub fn clear(&self) {
        self.snapshot.store(Arc::new(PdcSnapshot::default()));
    }
}

impl Default for DelayCompensator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_chain_defines_alignment() {
        let pdc = DelayCompensator::new();
        pdc.set_track_latency(1, 0).unwrap();
        pdc.set_track_latency(2, 2_048).unwrap();
        pdc.set_track_latency(3, 512).unwrap();

        assert_eq!(pdc.max_latency(), 2_048);
        assert_eq!(pdc.compensation_for(1), 2_048);
        assert_eq!(pdc.compensation_for(2), 0);
        assert_eq!(pdc.compensation_for(3), 1_536);

        // Sample-exact invariant: latency + compensation == max.
        let snap = pdc.snapshot();
        for track in [1u64, 2, 3] {
            assert_eq!(snap.latency(track) + snap.compensation(track), 2_048);
        }
    }

    #[test]
    fn removal_recomputes_maximum() {
        let pdc = DelayCompensator::new();
        pdc.set_track_latency(1, 100).unwrap();
        pdc.set_track_latency(2, 400).unwrap();
        pdc.remove_track(2);

        assert_eq!(pdc.max_latency(), 100);
        assert_eq!(pdc.compensation_for(1), 0);
    }

    #[test]
    fn excessive_latency_is_an_error() {
        let pdc = DelayCompensator::new();
        let result = pdc.set_track_latency(7, DelayCompensator::DEFAULT_MAX_LATENCY + 1);
        assert!(matches!(
            result,
            Err(EngineError::ExcessiveLatency { track: 7, .. })
        ));
        // Registry is unchanged after the rejection.
        assert_eq!(pdc.max_latency(), 0);
    }

    #[test]
    fn compensation_seconds() {
        let pdc = DelayCompensator::new();
        pdc.set_track_latency(1, 0).unwrap();
        pdc.set_track_latency(2, 24_000).unwrap();
        assert!((pdc.compensation_seconds(1, 48_000.0) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn unknown_track_gets_full_compensation() {
        let pdc = DelayCompensator::new();
        pdc.set_track_latency(1, 1_000).unwrap();
        assert_eq!(pdc.compensation_for(99), 1_000);
    }
}
