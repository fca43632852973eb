//! Per-track DSP stages: three-band EQ, equal-power pan, time/pitch unit.

use cadenza_core::smooth::SmoothedValue;

/// EQ band gain limit in dB.
pub const EQ_GAIN_LIMIT_DB: f32 = 12.0;

pub const EQ_LOW_HZ: f64 = 100.0;
pub const EQ_MID_HZ: f64 = 1_000.0;
pub const EQ_HIGH_HZ: f64 = 10_000.0;
const EQ_MID_Q: f64 = 0.707;

/// Transposed direct form II biquad.
#[derive(Debug, Clone, Copy, Default)]
struct Biquad {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
    z1: f32,
    z2: f32,
}

impl Biquad {
    fn identity() -> Self {
        Self {
            b0: 1.0,
            ..Default::default()
        }
    }

    #[inline]
    fn process(&mut self, x: f32) -> f32 {
        let y = self.b0 * x + self.z1;
        self.z1 = self.b1 * x - self.a1 * y + self.z2;
        self.z2 = self.b2 * x - self.a2 * y;
        y
    }

    fn reset(&mut self) {
        self.z1 = 0.0;
        self.z2 = 0.0;
    }

    fn set_coefficients(&mut self, b0: f64, b1: f64, b2: f64, a0: f64, a1: f64, a2: f64) {
        self.b0 = (b0 / a0) as f32;
        self.b1 = (b1 / a0) as f32;
        self.b2 = (b2 / a0) as f32;
        self.a1 = (a1 / a0) as f32;
        self.a2 = (a2 / a0) as f32;
    }

    /// RBJ low shelf, slope 1.
    fn low_shelf(sample_rate: f64, freq: f64, gain_db: f64) -> Self {
        let mut bq = Self::identity();
        if gain_db.abs() < 1e-6 {
            return bq;
        }
        let a = 10f64.powf(gain_db / 40.0);
        let w0 = core::f64::consts::TAU * freq / sample_rate;
        let (sin, cos) = w0.sin_cos();
        let alpha = sin / 2.0 * 2f64.sqrt();
        let sqrt_a = a.sqrt();

        bq.set_coefficients(
            a * ((a + 1.0) - (a - 1.0) * cos + 2.0 * sqrt_a * alpha),
            2.0 * a * ((a - 1.0) - (a + 1.0) * cos),
            a * ((a + 1.0) - (a - 1.0) * cos - 2.0 * sqrt_a * alpha),
            (a + 1.0) + (a - 1.0) * cos + 2.0 * sqrt_a * alpha,
            -2.0 * ((a - 1.0) + (a + 1.0) * cos),
            (a + 1.0) + (a - 1.0) * cos - 2.0 * sqrt_a * alpha,
        );
        bq
    }

    /// RBJ high shelf, slope 1.
    fn high_shelf(sample_rate: f64, freq: f64, gain_db: f64) -> Self {
        let mut bq = Self::identity();
        if gain_db.abs() < 1e-6 {
            return bq;
        }
        let a = 10f64.powf(gain_db / 40.0);
        let w0 = core::f64::consts::TAU * freq / sample_rate;
        let (sin, cos) = w0.sin_cos();
        let alpha = sin / 2.0 * 2f64.sqrt();
        let sqrt_a = a.sqrt();

        bq.set_coefficients(
            a * ((a + 1.0) + (a - 1.0) * cos + 2.0 * sqrt_a * alpha),
            -2.0 * a * ((a - 1.0) + (a + 1.0) * cos),
            a * ((a + 1.0) + (a - 1.0) * cos - 2.0 * sqrt_a * alpha),
            (a + 1.0) - (a - 1.0) * cos + 2.0 * sqrt_a * alpha,
            2.0 * ((a - 1.0) - (a + 1.0) * cos),
            (a + 1.0) - (a - 1.0) * cos - 2.0 * sqrt_a * alpha,
        );
        bq
    }

    /// RBJ peaking EQ.
    fn peaking(sample_rate: f64, freq: f64, q: f64, gain_db: f64) -> Self {
        let mut bq = Self::identity();
        if gain_db.abs() < 1e-6 {
            return bq;
        }
        let a = 10f64.powf(gain_db / 40.0);
        let w0 = core::f64::consts::TAU * freq / sample_rate;
        let (sin, cos) = w0.sin_cos();
        let alpha = sin / (2.0 * q);

        bq.set_coefficients(
            1.0 + alpha * a,
            -2.0 * cos,
            1.0 - alpha * a,
            1.0 + alpha / a,
            -2.0 * cos,
            1.0 - alpha / a,
        );
        bq
    }
}

/// 3-band EQ: low shelf 100 Hz, mid parametric 1 kHz, high shelf 10 kHz.
/// Gains are clamped to +-12 dB; at 0 dB a band is an exact pass-through.
pub struct ThreeBandEq {
    low: [Biquad; 2],
    mid: [Biquad; 2],
    high: [Biquad; 2],
    low_db: f32,
    mid_db: f32,
    high_db: f32,
    sample_rate: f64,
}

impl ThreeBandEq {
    pub fn new(sample_rate: f64) -> Self {
        let mut eq = Self {
            low: [Biquad::identity(); 2],
            mid: [Biquad::identity(); 2],
            high: [Biquad::identity(); 2],
            low_db: 0.0,
            mid_db: 0.0,
            high_db: 0.0,
            sample_rate,
        };
        eq.rebuild();
        eq
    }

    pub fn set_gains(&mut self, low_db: f32, mid_db: f32, high_db: f32) {
        let clamp = |g: f32| g.clamp(-EQ_GAIN_LIMIT_DB, EQ_GAIN_LIMIT_DB);
        let (low_db, mid_db, high_db) = (clamp(low_db), clamp(mid_db), clamp(high_db));
        if (low_db, mid_db, high_db) == (self.low_db, self.mid_db, self.high_db) {
            return;
        }
        self.low_db = low_db;
        self.mid_db = mid_db;
        self.high_db = high_db;
        self.rebuild();
    }

    pub fn gains(&self) -> (f32, f32, f32) {
        (self.low_db, self.mid_db, self.high_db)
    }

    pub fn set_sample_rate(&mut self, sample_rate: f64) {
        self.sample_rate = sample_rate;
        self.rebuild();
    }

    fn rebuild(&mut self) {
        // Filter state is carried across rebuilds per channel to avoid
        // discontinuities on small gain moves.
        for (bank, make) in [
            (
                &mut self.low,
                Biquad::low_shelf(self.sample_rate, EQ_LOW_HZ, self.low_db as f64),
            ),
            (
                &mut self.mid,
                Biquad::peaking(self.sample_rate, EQ_MID_HZ, EQ_MID_Q, self.mid_db as f64),
            ),
            (
                &mut self.high,
                Biquad::high_shelf(self.sample_rate, EQ_HIGH_HZ, self.high_db as f64),
            ),
        ] {
            for channel in bank.iter_mut() {
                let (z1, z2) = (channel.z1, channel.z2);
                *channel = make;
                channel.z1 = z1;
                channel.z2 = z2;
            }
        }
    }

    /// Process interleaved stereo in place.
    pub fn process(&mut self, buffer: &mut [f32], frames: usize) {
        for i in 0..frames {
            for (ch, slot) in [i * 2, i * 2 + 1].into_iter().enumerate() {
                let mut s = buffer[slot];
                s = self.low[ch].process(s);
                s = self.mid[ch].process(s);
                s = self.high[ch].process(s);
                buffer[slot] = s;
            }
        }
    }

    pub fn reset(&mut self) {
        for bank in [&mut self.low, &mut self.mid, &mut self.high] {
            for channel in bank.iter_mut() {
                channel.reset();
            }
        }
    }
}

/// Equal-power panner over interleaved stereo, with a short ramp on pan
/// moves so sweeps do not step.
pub struct Panner {
    pan: SmoothedValue,
}

impl Panner {
    /// Pan ramp length.
    const SMOOTH_SECONDS: f32 = 0.005;

    pub fn new(pan: f32, sample_rate: f64) -> Self {
        Self {
            pan: SmoothedValue::new(
                pan.clamp(-1.0, 1.0),
                Self::SMOOTH_SECONDS,
                sample_rate as f32,
            ),
        }
    }

    pub fn set_pan(&mut self, pan: f32) {
        self.pan.set_target(pan.clamp(-1.0, 1.0));
    }

    pub fn set_immediate(&mut self, pan: f32) {
        self.pan.set_immediate(pan.clamp(-1.0, 1.0));
    }

    pub fn pan(&self) -> f32 {
        self.pan.target()
    }

    #[inline]
    fn gains(pan: f32) -> (f32, f32) {
        let angle = (pan + 1.0) * core::f32::consts::FRAC_PI_4;
        (angle.cos(), angle.sin())
    }

    pub fn process(&mut self, buffer: &mut [f32], frames: usize) {
        if !self.pan.is_smoothing() {
            let (gl, gr) = Self::gains(self.pan.current());
            for i in 0..frames {
                buffer[i * 2] *= gl;
                buffer[i * 2 + 1] *= gr;
            }
            return;
        }
        for i in 0..frames {
            let (gl, gr) = Self::gains(self.pan.next_sample());
            buffer[i * 2] *= gl;
            buffer[i * 2 + 1] *= gr;
        }
    }
}

/// Time/pitch unit. Rate 1.0 is a bit-exact pass-through; other rates
/// resample the incoming buffer by linear interpolation, carrying the
/// fractional read position across buffers.
pub struct TimePitch {
    rate: f64,
    frac: f64,
    prev_frame: (f32, f32),
    scratch: Vec<f32>,
}

impl TimePitch {
    pub fn new(max_frames: usize) -> Self {
        Self {
            rate: 1.0,
            frac: 0.0,
            prev_frame: (0.0, 0.0),
            scratch: vec![0.0; max_frames * 2],
        }
    }

    pub fn set_rate(&mut self, rate: f64) {
        self.rate = rate.clamp(0.25, 4.0);
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn is_passthrough(&self) -> bool {
        (self.rate - 1.0).abs() < 1e-9
    }

    pub fn reset(&mut self) {
        self.frac = 0.0;
        self.prev_frame = (0.0, 0.0);
    }

    /// Consume `frames` frames in `buffer` at the configured rate, writing
    /// `frames` output frames back in place.
    pub fn process(&mut self, buffer: &mut [f32], frames: usize) {
        if self.is_passthrough() {
            return;
        }

        let input = &mut self.scratch[..frames * 2];
        input.copy_from_slice(&buffer[..frames * 2]);

        let mut pos = self.frac;
        for i in 0..frames {
            let idx = pos.floor() as usize;
            let t = (pos - idx as f64) as f32;

            let (l0, r0) = if idx == 0 {
                self.prev_frame
            } else {
                (input[(idx - 1) * 2], input[(idx - 1) * 2 + 1])
            };
            let (l1, r1) = if idx < frames {
                (input[idx * 2], input[idx * 2 + 1])
            } else {
                (input[(frames - 1) * 2], input[(frames - 1) * 2 + 1])
            };

            buffer[i * 2] = l0 + (l1 - l0) * t;
            buffer[i * 2 + 1] = r0 + (r1 - r0) * t;
            pos += self.rate;
        }

        self.prev_frame = (input[(frames - 1) * 2], input[(frames - 1) * 2 + 1]);
        self.frac = pos - pos.floor();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn sine(freq: f64, rate: f64, frames: usize) -> Vec<f32> {
        (0..frames)
            .flat_map(|i| {
                let s = (core::f64::consts::TAU * freq * i as f64 / rate).sin() as f32;
                [s, s]
            })
            .collect()
    }

    fn rms(buffer: &[f32]) -> f32 {
        (buffer.iter().map(|s| s * s).sum::<f32>() / buffer.len() as f32).sqrt()
    }

    #[test]
    fn flat_eq_is_transparent() {
        let mut eq = ThreeBandEq::new(48_000.0);
        let mut buf = sine(440.0, 48_000.0, 512);
        let original = buf.clone();
        eq.process(&mut buf, 512);
        for (a, b) in buf.iter().zip(original.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-6);
        }
    }

    #[test]
    fn low_boost_raises_low_band_only() {
        let mut eq = ThreeBandEq::new(48_000.0);
        eq.set_gains(12.0, 0.0, 0.0);

        let mut low = sine(50.0, 48_000.0, 4_096);
        let low_before = rms(&low);
        eq.process(&mut low, 4_096);
        assert!(rms(&low) > low_before * 2.0, "low band should gain ~12 dB");

        eq.reset();
        let mut high = sine(8_000.0, 48_000.0, 4_096);
        let high_before = rms(&high);
        eq.process(&mut high, 4_096);
        let ratio = rms(&high) / high_before;
        assert!(
            (0.8..1.2).contains(&ratio),
            "high band should be near unity, got {ratio}"
        );
    }

    #[test]
    fn gains_clamp_to_limit() {
        let mut eq = ThreeBandEq::new(48_000.0);
        eq.set_gains(40.0, -40.0, 0.0);
        assert_eq!(eq.gains(), (12.0, -12.0, 0.0));
    }

    #[test]
    fn pan_is_equal_power() {
        let mut centre = Panner::new(0.0, 48_000.0);
        let mut buf = vec![1.0f32; 8];
        centre.process(&mut buf, 4);
        // Centre attenuates both channels by cos(45 deg).
        assert_abs_diff_eq!(buf[0], core::f32::consts::FRAC_1_SQRT_2, epsilon = 1e-5);
        assert_abs_diff_eq!(buf[1], core::f32::consts::FRAC_1_SQRT_2, epsilon = 1e-5);

        let mut left = Panner::new(-1.0, 48_000.0);
        let mut buf = vec![1.0f32; 8];
        left.process(&mut buf, 4);
        assert_abs_diff_eq!(buf[0], 1.0, epsilon = 1e-5);
        assert_abs_diff_eq!(buf[1], 0.0, epsilon = 1e-5);
    }

    #[test]
    fn pan_moves_are_ramped() {
        let mut panner = Panner::new(-1.0, 48_000.0);
        panner.set_pan(1.0);
        let mut buf = vec![1.0f32; 1_024];
        panner.process(&mut buf, 512);
        // Mid-ramp the left channel is neither full nor silent.
        let mid = buf[100 * 2];
        assert!(mid > 0.0 && mid < 1.0, "expected ramp, got {mid}");
    }

    #[test]
    fn time_pitch_passthrough_is_exact() {
        let mut tp = TimePitch::new(512);
        let mut buf = sine(440.0, 48_000.0, 256);
        let original = buf.clone();
        tp.process(&mut buf, 256);
        assert_eq!(buf, original);
    }

    #[test]
    fn time_pitch_resamples() {
        let mut tp = TimePitch::new(512);
        tp.set_rate(2.0);
        // A ramp 0,1,2,.. read at 2x should advance twice as fast.
        let mut buf: Vec<f32> = (0..256).flat_map(|i| [i as f32, i as f32]).collect();
        tp.process(&mut buf, 256);
        assert_abs_diff_eq!(buf[2], 1.0, epsilon = 1e-3); // output frame 1 reads input ~2... rate applied
        assert!(buf[100 * 2] > 150.0);
    }
}
