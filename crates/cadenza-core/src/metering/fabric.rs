//! The metering fabric: per-node amplitude cells plus master loudness.

use super::amplitude::{AtomicAmplitude, Levels};
use super::cpu::CpuMeter;
use crate::error::{EngineError, Result};
use dashmap::DashMap;
use ebur128::{EbuR128, Mode};
use parking_lot::Mutex;
use std::sync::Arc;

/// Identifies a metered point in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKey {
    Track(u64),
    Bus(u64),
    Master,
}

/// Master loudness snapshot in LUFS / dBTP.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoudnessSnapshot {
    pub momentary: Option<f64>,
    pub short_term: Option<f64>,
    pub integrated: Option<f64>,
    pub true_peak: Option<f64>,
}

/// Lock-free level storage for every node, registered on the control thread
/// and written by audio taps. Registration is idempotent; reads of
/// unregistered keys return `None` rather than failing.
pub struct MeteringFabric {
    cells: DashMap<NodeKey, Arc<AtomicAmplitude>>,
    loudness: Mutex<EbuR128>,
    cpu: CpuMeter,
    sample_rate: f64,
}

impl MeteringFabric {
    pub fn new(sample_rate: f64) -> Result<Self> {
        let loudness = EbuR128::new(
            2,
            sample_rate as u32,
            Mode::M | Mode::S | Mode::I | Mode::TRUE_PEAK,
        )
        .map_err(|e| EngineError::TransientGraph(format!("loudness meter: {e}")))?;

        Ok(Self {
            cells: DashMap::new(),
            loudness: Mutex::new(loudness),
            cpu: CpuMeter::new(sample_rate),
            sample_rate,
        })
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Register (or fetch) the cell for a node. Idempotent.
    pub fn register(&self, key: NodeKey) -> Arc<AtomicAmplitude> {
        Arc::clone(
            self.cells
                .entry(key)
                .or_insert_with(|| Arc::new(AtomicAmplitude::new()))
                .value(),
        )
    }

    /// No-op when the key was never registered.
    pub fn unregister(&self, key: NodeKey) {
        self.cells.remove(&key);
    }

    pub fn cell(&self, key: NodeKey) -> Option<Arc<AtomicAmplitude>> {
        self.cells.get(&key).map(|c| Arc::clone(c.value()))
    }

    pub fn levels(&self, key: NodeKey) -> Option<Levels> {
        self.cells.get(&key).map(|c| c.get())
    }

    pub fn cpu(&self) -> &CpuMeter {
        &self.cpu
    }

    /// Feed the master buffer into the loudness meter. Called from the audio
    /// callback; skips the update when the meter lock is contended.
    #[inline]
    pub fn update_loudness(&self, left: &[f32], right: &[f32]) {
        if let Some(mut meter) = self.loudness.try_lock() {
            let _ = meter.add_frames_planar_f32(&[left, right]);
        }
    }

    pub fn loudness(&self) -> LoudnessSnapshot {
        let meter = self.loudness.lock();
        LoudnessSnapshot {
            momentary: meter.loudness_momentary().ok(),
            short_term: meter.loudness_shortterm().ok(),
            integrated: meter.loudness_global().ok(),
            true_peak: meter
                .true_peak(0)
                .ok()
                .zip(meter.true_peak(1).ok())
                .map(|(l, r)| l.max(r)),
        }
    }

    /// Restart the integrated measurement.
    pub fn reset_loudness(&self) {
        self.loudness.lock().reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_is_idempotent() {
        let fabric = MeteringFabric::new(48_000.0).unwrap();
        let a = fabric.register(NodeKey::Track(1));
        let b = fabric.register(NodeKey::Track(1));
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn unregistered_reads_return_none() {
        let fabric = MeteringFabric::new(48_000.0).unwrap();
        assert!(fabric.levels(NodeKey::Bus(9)).is_none());
        fabric.unregister(NodeKey::Bus(9)); // no-op
    }

    #[test]
    fn tap_writes_are_visible_through_fabric() {
        let fabric = MeteringFabric::new(48_000.0).unwrap();
        let cell = fabric.register(NodeKey::Master);
        let buf: Vec<f32> = (0..128).flat_map(|_| [0.25f32, 0.5f32]).collect();
        cell.ingest(&buf, 128);

        let levels = fabric.levels(NodeKey::Master).unwrap();
        assert!(levels.peak_right >= 0.5);
        assert!(levels.rms_left > 0.2);
    }

    #[test]
    fn loudness_accepts_frames_and_resets() {
        let fabric = MeteringFabric::new(48_000.0).unwrap();
        let left = vec![0.5f32; 4800];
        let right = vec![0.5f32; 4800];
        for _ in 0..10 {
            fabric.update_loudness(&left, &right);
        }
        // One second of constant signal is enough for a momentary reading.
        let snap = fabric.loudness();
        assert!(snap.momentary.is_some());
        fabric.reset_loudness();
    }
}
