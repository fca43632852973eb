//! Timing anchor: the dual-clock bridge between wall time and musical time.
//!
//! An anchor captures (monotonic instant, wall instant, beat, context). Any
//! later wall time maps to a beat by extrapolating at the anchored tempo.
//! Anchors go stale with age or when the two clocks diverge (system
//! sleep/wake); a stale anchor must be regenerated before it feeds any
//! `beat -> future sample offset` calculation.

use crate::context::SchedulingContext;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

/// Anchors older than this are always stale.
pub const MAX_ANCHOR_AGE: Duration = Duration::from_secs(2);

/// Monotonic/wall divergence ratio beyond which the host slept or the
/// clock jumped.
const CLOCK_DIVERGENCE_RATIO: f64 = 1.5;

#[derive(Debug, Clone)]
pub struct TimingAnchor {
    host_time: Instant,
    wall_time: SystemTime,
    beat: f64,
    context: Arc<SchedulingContext>,
}

impl TimingAnchor {
    /// Anchor the given beat at "now".
    pub fn new(beat: f64, context: Arc<SchedulingContext>) -> Self {
        Self::at(Instant::now(), beat, context)
    }

    /// Anchor the given beat at an explicit instant (tests inject instants).
    pub fn at(host_time: Instant, beat: f64, context: Arc<SchedulingContext>) -> Self {
        Self {
            host_time,
            wall_time: SystemTime::now(),
            beat,
            context,
        }
    }

    #[inline]
    pub fn beat(&self) -> f64 {
        self.beat
    }

    #[inline]
    pub fn host_time(&self) -> Instant {
        self.host_time
    }

    #[inline]
    pub fn context(&self) -> &Arc<SchedulingContext> {
        &self.context
    }

    /// Beat position at monotonic time `t`. Times before the anchor clamp
    /// to the anchored beat.
    pub fn beat_at(&self, t: Instant) -> f64 {
        let elapsed = t.saturating_duration_since(self.host_time).as_secs_f64();
        self.beat + elapsed * self.context.beats_per_second()
    }

    /// Beat position now.
    pub fn current_beat(&self) -> f64 {
        self.beat_at(Instant::now())
    }

    /// True when this anchor may no longer be used for scheduling.
    pub fn is_stale(&self) -> bool {
        self.is_stale_at(Instant::now())
    }

    pub fn is_stale_at(&self, now: Instant) -> bool {
        let monotonic_age = now.saturating_duration_since(self.host_time);
        if monotonic_age > MAX_ANCHOR_AGE {
            return true;
        }

        // Sleep/wake detection: the monotonic clock and the wall clock must
        // agree on how much time passed. A >50% divergence means the sample
        // count implied by the monotonic age is wrong.
        let wall_age = match SystemTime::now().duration_since(self.wall_time) {
            Ok(age) => age.as_secs_f64(),
            Err(_) => return true, // wall clock went backwards
        };
        let mono_age = monotonic_age.as_secs_f64();
        if mono_age < 0.010 && wall_age < 0.010 {
            return false; // both too young to diverge meaningfully
        }
        let (longer, shorter) = if mono_age > wall_age {
            (mono_age, wall_age)
        } else {
            (wall_age, mono_age)
        };
        longer > shorter.max(0.010) * CLOCK_DIVERGENCE_RATIO
    }

    /// Samples from `now` until `beat` at the anchored rate. Past beats and
    /// stale anchors schedule immediately (offset 0).
    pub fn sample_offset_for(&self, beat: f64, now: Instant) -> u64 {
        if self.is_stale_at(now) {
            return 0;
        }
        let delta_beats = beat - self.beat_at(now);
        if delta_beats <= 0.0 {
            return 0;
        }
        (delta_beats * self.context.samples_per_beat()).round() as u64
    }

    /// Seconds from `now` until `beat`; negative when the beat has passed.
    pub fn seconds_until(&self, beat: f64, now: Instant) -> f64 {
        self.context.beats_to_seconds(beat - self.beat_at(now))
    }
}

/// Process-wide anchor slot guarded by a short critical section. Writers are
/// the transport and (on staleness) the MIDI scheduler; readers are the
/// timer domains and the audio callback.
pub struct AnchorCell {
    inner: Mutex<TimingAnchor>,
}

impl AnchorCell {
    pub fn new(anchor: TimingAnchor) -> Self {
        Self {
            inner: Mutex::new(anchor),
        }
    }

    /// Cloned snapshot; the lock is held only for the copy.
    #[inline]
    pub fn get(&self) -> TimingAnchor {
        self.inner.lock().clone()
    }

    #[inline]
    pub fn set(&self, anchor: TimingAnchor) {
        *self.inner.lock() = anchor;
    }

    /// Write a fresh anchor at (now, beat) and return it.
    pub fn rebase(&self, beat: f64, context: Arc<SchedulingContext>) -> TimingAnchor {
        let anchor = TimingAnchor::new(beat, context);
        self.set(anchor.clone());
        anchor
    }
}
