//! Audio-callback load tracking.

use crate::lockfree::{AtomicFlag, AtomicFloat};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Snapshot of callback load, in percent of the buffer budget.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuLoad {
    pub current: f32,
    pub average: f32,
    pub peak: f32,
    pub overloads: u64,
}

/// Tracks how much of each buffer period the callback spends processing.
pub struct CpuMeter {
    current: AtomicFloat,
    average: AtomicFloat,
    peak: AtomicFloat,
    overloads: AtomicU64,
    overloaded: AtomicFlag,
    sample_rate: f64,
}

impl CpuMeter {
    /// Smoothing factor for the running average.
    const AVG_ALPHA: f32 = 0.05;

    pub fn new(sample_rate: f64) -> Self {
        Self {
            current: AtomicFloat::default(),
            average: AtomicFloat::default(),
            peak: AtomicFloat::default(),
            overloads: AtomicU64::new(0),
            overloaded: AtomicFlag::default(),
            sample_rate,
        }
    }

    /// Record one callback: `frames` rendered in `elapsed`.
    pub fn record(&self, frames: usize, elapsed: Duration) {
        if frames == 0 {
            return;
        }
        let budget = frames as f64 / self.sample_rate;
        let load = (elapsed.as_secs_f64() / budget) as f32;

        self.current.set(load);
        self.peak.raise_to(load);
        let avg = self.average.get();
        self.average
            .set(avg * (1.0 - Self::AVG_ALPHA) + load * Self::AVG_ALPHA);

        if load > 1.0 {
            self.overloads.fetch_add(1, Ordering::Relaxed);
            self.overloaded.set(true);
        }
    }

    pub fn load(&self) -> CpuLoad {
        CpuLoad {
            current: self.current.get() * 100.0,
            average: self.average.get() * 100.0,
            peak: self.peak.get() * 100.0,
            overloads: self.overloads.load(Ordering::Relaxed),
        }
    }

    /// Overload flag latches until read.
    pub fn take_overloaded(&self) -> bool {
        self.overloaded.swap(false)
    }

    pub fn reset(&self) {
        self.current.set(0.0);
        self.average.set(0.0);
        self.peak.set(0.0);
        self.overloads.store(0, Ordering::Relaxed);
        self.overloaded.set(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_load_fraction() {
        let meter = CpuMeter::new(48_000.0);
        // 480 frames = 10 ms budget; 5 ms spent = 50% load.
        meter.record(480, Duration::from_millis(5));
        let load = meter.load();
        assert!((load.current - 50.0).abs() < 1.0, "got {}", load.current);
        assert_eq!(load.overloads, 0);
        assert!(!meter.take_overloaded());
    }

    #[test]
    fn counts_overloads() {
        let meter = CpuMeter::new(48_000.0);
        meter.record(480, Duration::from_millis(15));
        assert_eq!(meter.load().overloads, 1);
        assert!(meter.take_overloaded());
        assert!(!meter.take_overloaded());
    }
}
