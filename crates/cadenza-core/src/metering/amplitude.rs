//! Lock-free per-node amplitude cell: RMS L/R plus decaying peak L/R.

use crate::lockfree::AtomicFloat;

/// Exponential peak release per callback. At ~21 ms buffers this gives a
/// release of roughly 300 ms.
pub const PEAK_DECAY: f32 = 0.95;

/// Levels snapshot read by the UI thread.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Levels {
    pub rms_left: f32,
    pub rms_right: f32,
    pub peak_left: f32,
    pub peak_right: f32,
}

/// Four 32-bit atomic slots. The audio tap writes once per buffer, readers
/// observe whole written values (no torn reads).
pub struct AtomicAmplitude {
    rms_left: AtomicFloat,
    rms_right: AtomicFloat,
    peak_left: AtomicFloat,
    peak_right: AtomicFloat,
}

impl AtomicAmplitude {
    pub fn new() -> Self {
        Self {
            rms_left: AtomicFloat::default(),
            rms_right: AtomicFloat::default(),
            peak_left: AtomicFloat::default(),
            peak_right: AtomicFloat::default(),
        }
    }

    #[inline]
    pub fn get(&self) -> Levels {
        Levels {
            rms_left: self.rms_left.get(),
            rms_right: self.rms_right.get(),
            peak_left: self.peak_left.get(),
            peak_right: self.peak_right.get(),
        }
    }

    #[inline]
    pub fn set(&self, levels: Levels) {
        self.rms_left.set(levels.rms_left);
        self.rms_right.set(levels.rms_right);
        self.peak_left.set(levels.peak_left);
        self.peak_right.set(levels.peak_right);
    }

    /// Analyse one interleaved stereo buffer and publish levels. The stored
    /// peak decays exponentially and is raised to the buffer peak, so a
    /// reader after a buffer with peak `p` always observes at least `p`.
    #[inline]
    pub fn ingest(&self, buffer: &[f32], frames: usize) {
        if frames == 0 {
            return;
        }

        let mut peak_l: f32 = 0.0;
        let mut peak_r: f32 = 0.0;
        let mut sum_sq_l: f32 = 0.0;
        let mut sum_sq_r: f32 = 0.0;

        for i in 0..frames {
            let l = buffer[i * 2];
            let r = buffer[i * 2 + 1];
            peak_l = peak_l.max(l.abs());
            peak_r = peak_r.max(r.abs());
            sum_sq_l += l * l;
            sum_sq_r += r * r;
        }

        self.rms_left.set((sum_sq_l / frames as f32).sqrt());
        self.rms_right.set((sum_sq_r / frames as f32).sqrt());

        let decayed_l = self.peak_left.get() * PEAK_DECAY;
        let decayed_r = self.peak_right.get() * PEAK_DECAY;
        self.peak_left.set(decayed_l.max(peak_l));
        self.peak_right.set(decayed_r.max(peak_r));
    }

    pub fn reset(&self) {
        self.set(Levels::default());
    }
}

impl Default for AtomicAmplitude {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn ingest_computes_rms_and_peak() {
        let cell = AtomicAmplitude::new();
        // Constant 0.5 left, -0.25 right.
        let buf: Vec<f32> = (0..64).flat_map(|_| [0.5f32, -0.25f32]).collect();
        cell.ingest(&buf, 64);

        let levels = cell.get();
        assert_abs_diff_eq!(levels.rms_left, 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(levels.rms_right, 0.25, epsilon = 1e-6);
        assert_abs_diff_eq!(levels.peak_left, 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(levels.peak_right, 0.25, epsilon = 1e-6);
    }

    #[test]
    fn peak_never_below_buffer_peak() {
        let cell = AtomicAmplitude::new();
        let loud: Vec<f32> = (0..32).flat_map(|_| [0.9f32, 0.9f32]).collect();
        cell.ingest(&loud, 32);
        assert!(cell.get().peak_left >= 0.9);

        // Quiet buffers decay the peak but a loud one raises it again.
        let quiet: Vec<f32> = (0..32).flat_map(|_| [0.1f32, 0.1f32]).collect();
        for _ in 0..8 {
            cell.ingest(&quiet, 32);
        }
        let decayed = cell.get().peak_left;
        assert!(decayed < 0.9 && decayed >= 0.1);

        cell.ingest(&loud, 32);
        assert!(cell.get().peak_left >= 0.9);
    }

    #[test]
    fn empty_buffer_is_ignored() {
        let cell = AtomicAmplitude::new();
        cell.ingest(&[], 0);
        assert_eq!(cell.get(), Levels::default());
    }
}
