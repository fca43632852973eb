//! Parameter smoothing: adaptive one-pole targets, per-sample ramps and the
//! click-free mute multiplier.

/// Linearly ramped parameter value. Call [`next_sample()`](SmoothedValue::next_sample)
/// once per sample in the audio callback.
#[derive(Debug, Clone)]
pub struct SmoothedValue {
    current: f32,
    target: f32,
    step: f32,
    samples_remaining: u32,
    smooth_samples: u32,
}

impl SmoothedValue {
    pub fn new(initial: f32, smooth_time_secs: f32, sample_rate: f32) -> Self {
        let smooth_samples = (smooth_time_secs * sample_rate).max(1.0) as u32;
        Self {
            current: initial,
            target: initial,
            step: 0.0,
            samples_remaining: 0,
            smooth_samples,
        }
    }

    #[inline]
    pub fn set_target(&mut self, target: f32) {
        if (target - self.target).abs() < f32::EPSILON {
            return;
        }
        self.target = target;
        self.samples_remaining = self.smooth_samples;
        self.step = (self.target - self.current) / self.samples_remaining as f32;
    }

    /// Jump to `value` with no ramp.
    #[inline]
    pub fn set_immediate(&mut self, value: f32) {
        self.current = value;
        self.target = value;
        self.step = 0.0;
        self.samples_remaining = 0;
    }

    #[inline]
    pub fn next_sample(&mut self) -> f32 {
        if self.samples_remaining > 0 {
            self.current += self.step;
            self.samples_remaining -= 1;
            if self.samples_remaining == 0 {
                // Snap to avoid floating point drift at the end of the ramp.
                self.current = self.target;
            }
        }
        self.current
    }

    #[inline]
    pub fn current(&self) -> f32 {
        self.current
    }

    #[inline]
    pub fn target(&self) -> f32 {
        self.target
    }

    #[inline]
    pub fn is_smoothing(&self) -> bool {
        self.samples_remaining > 0
    }

    #[inline]
    pub fn skip_to_target(&mut self) {
        self.current = self.target;
        self.step = 0.0;
        self.samples_remaining = 0;
    }

    #[inline]
    pub fn apply_gain(&mut self, buffer: &mut [f32]) {
        for sample in buffer.iter_mut() {
            *sample *= self.next_sample();
        }
    }
}

/// One-pole smoother whose coefficient adapts to the size of each pushed
/// change: a large jump (step automation) passes almost directly, a small
/// drift (drawn curve) is smoothed hard against zipper noise.
///
/// `y = alpha * y + (1 - alpha) * x`, alpha in {0.1, 0.4, 0.7}.
#[derive(Debug, Clone)]
pub struct AdaptiveSmoother {
    value: f32,
    large_delta: f32,
    small_delta: f32,
}

impl AdaptiveSmoother {
    pub fn new(initial: f32, large_delta: f32, small_delta: f32) -> Self {
        Self {
            value: initial,
            large_delta,
            small_delta,
        }
    }

    /// Smoother tuned for normalised volume (0..1).
    pub fn volume(initial: f32) -> Self {
        Self::new(initial, 0.2, 0.05)
    }

    /// Smoother tuned for pan (-1..1).
    pub fn pan(initial: f32) -> Self {
        Self::new(initial, 0.4, 0.1)
    }

    /// Smoother tuned for EQ band gain in dB (+-12).
    pub fn eq_db(initial: f32) -> Self {
        Self::new(initial, 6.0, 2.0)
    }

    /// Push a raw target; returns the smoothed value.
    #[inline]
    pub fn push(&mut self, target: f32) -> f32 {
        let delta = (target - self.value).abs();
        let alpha = if delta > self.large_delta {
            0.1
        } else if delta > self.small_delta {
            0.4
        } else {
            0.7
        };
        self.value = alpha * self.value + (1.0 - alpha) * target;
        self.value
    }

    #[inline]
    pub fn value(&self) -> f32 {
        self.value
    }

    /// Reset without smoothing, used at transport start so playback begins
    /// at the automation value of the start beat.
    #[inline]
    pub fn reset(&mut self, value: f32) {
        self.value = value;
    }
}

/// Per-sample one-pole filter for synthesiser parameters. Defaults to
/// a = 0.996 (about 5 ms at 48 kHz), removing buffer-boundary zippering on
/// fast sweeps.
#[derive(Debug, Clone)]
pub struct OnePole {
    a: f32,
    y: f32,
}

impl OnePole {
    pub const DEFAULT_COEFF: f32 = 0.996;

    pub fn new(initial: f32) -> Self {
        Self {
            a: Self::DEFAULT_COEFF,
            y: initial,
        }
    }

    pub fn with_time_constant(initial: f32, seconds: f32, sample_rate: f32) -> Self {
        let a = (-1.0 / (seconds * sample_rate).max(1.0)).exp();
        Self { a, y: initial }
    }

    #[inline]
    pub fn process(&mut self, x: f32) -> f32 {
        self.y = self.a * self.y + (1.0 - self.a) * x;
        self.y
    }

    /// Fill a pre-allocated scratch region with per-sample smoothed values
    /// approaching `target`.
    #[inline]
    pub fn smooth_into(&mut self, target: f32, scratch: &mut [f32]) {
        for slot in scratch.iter_mut() {
            *slot = self.process(target);
        }
    }

    #[inline]
    pub fn value(&self) -> f32 {
        self.y
    }

    #[inline]
    pub fn reset(&mut self, value: f32) {
        self.y = value;
    }
}

/// Mute multiplier: fades between 0 and 1 with a ~10 ms time constant so
/// mute/solo toggles never click. Multiplied into the volume stage.
#[derive(Debug, Clone)]
pub struct MuteRamp {
    filter: OnePole,
    target: f32,
}

impl MuteRamp {
    pub const FADE_SECONDS: f32 = 0.010;

    pub fn new(muted: bool, sample_rate: f32) -> Self {
        let initial = if muted { 0.0 } else { 1.0 };
        Self {
            filter: OnePole::with_time_constant(initial, Self::FADE_SECONDS, sample_rate),
            target: initial,
        }
    }

    #[inline]
    pub fn set_muted(&mut self, muted: bool) {
        self.target = if muted { 0.0 } else { 1.0 };
    }

    #[inline]
    pub fn next_sample(&mut self) -> f32 {
        self.filter.process(self.target)
    }

    #[inline]
    pub fn current(&self) -> f32 {
        self.filter.value()
    }

    /// True once the fade has effectively finished.
    #[inline]
    pub fn is_settled(&self) -> bool {
        (self.filter.value() - self.target).abs() < 1e-4
    }

    pub fn set_sample_rate(&mut self, sample_rate: f32) {
        let value = self.filter.value();
        self.filter = OnePole::with_time_constant(value, Self::FADE_SECONDS, sample_rate);
    }

    #[inline]
    pub fn reset(&mut self, muted: bool) {
        let v = if muted { 0.0 } else { 1.0 };
        self.filter.reset(v);
        self.target = v;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn smoothed_value_reaches_target() {
        let mut v = SmoothedValue::new(0.0, 0.001, 48_000.0);
        v.set_target(1.0);
        assert!(v.is_smoothing());
        for _ in 0..100 {
            v.next_sample();
        }
        assert!(!v.is_smoothing());
        assert_abs_diff_eq!(v.current(), 1.0);
    }

    #[test]
    fn smoothed_value_retarget_midway() {
        let mut v = SmoothedValue::new(0.0, 0.010, 48_000.0);
        v.set_target(1.0);
        for _ in 0..100 {
            v.next_sample();
        }
        let mid = v.current();
        assert!(mid > 0.0 && mid < 1.0);
        v.set_target(0.0);
        for _ in 0..48_000 {
            v.next_sample();
        }
        assert_abs_diff_eq!(v.current(), 0.0);
    }

    #[test]
    fn adaptive_alpha_depends_on_delta() {
        // Large jump: most of the change lands in one push.
        let mut big = AdaptiveSmoother::volume(0.0);
        let after_big = big.push(1.0);
        assert!(after_big > 0.85, "large delta should pass mostly through, got {after_big}");

        // Small drift: heavily smoothed.
        let mut small = AdaptiveSmoother::volume(0.50);
        let after_small = small.push(0.52);
        assert!(
            (after_small - 0.50).abs() < 0.01,
            "small delta should be smoothed, got {after_small}"
        );
    }

    #[test]
    fn adaptive_converges() {
        let mut s = AdaptiveSmoother::pan(0.0);
        for _ in 0..64 {
            s.push(0.05);
        }
        assert_abs_diff_eq!(s.value(), 0.05, epsilon = 1e-3);
    }

    #[test]
    fn one_pole_time_constant() {
        let mut f = OnePole::with_time_constant(0.0, 0.005, 48_000.0);
        // After one time constant (240 samples) the step response reaches ~63%.
        for _ in 0..240 {
            f.process(1.0);
        }
        assert!((f.value() - 0.632).abs() < 0.02, "got {}", f.value());
    }

    #[test]
    fn mute_ramp_fades_without_jump() {
        let mut ramp = MuteRamp::new(false, 48_000.0);
        assert_abs_diff_eq!(ramp.current(), 1.0);
        ramp.set_muted(true);

        let mut previous = ramp.current();
        let mut max_step: f32 = 0.0;
        for _ in 0..4_800 {
            let v = ramp.next_sample();
            max_step = max_step.max((previous - v).abs());
            previous = v;
        }
        assert!(ramp.current() < 1e-3, "fade incomplete: {}", ramp.current());
        assert!(max_step < 0.01, "fade stepped audibly: {max_step}");
        assert!(ramp.is_settled());
    }
}
