//! Cycle region: boundary detection with retrigger cooldown.

use crate::context::SchedulingContext;
use crate::error::{EngineError, Result};
use crate::lockfree::{AtomicDouble, AtomicFlag};
use crate::project::MIN_CYCLE_BEATS;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Boundary epsilon in beats.
pub const CYCLE_EPSILON: f64 = 0.001;

/// Minimum retrigger cooldown.
const MIN_COOLDOWN: Duration = Duration::from_millis(100);

/// Cycle bounds shared between the control thread (writer) and the position
/// timer (boundary checks).
pub struct CycleRegion {
    enabled: AtomicFlag,
    start_beat: AtomicDouble,
    end_beat: AtomicDouble,
    cooldown: Mutex<Duration>,
    last_jump: Mutex<Option<Instant>>,
}

impl CycleRegion {
    pub fn new() -> Self {
        Self {
            enabled: AtomicFlag::new(false),
            start_beat: AtomicDouble::new(0.0),
            end_beat: AtomicDouble::new(4.0),
            cooldown: Mutex::new(MIN_COOLDOWN),
            last_jump: Mutex::new(None),
        }
    }

    /// Set the cycle bounds, rounded to 1 ms of wall time at the context
    /// tempo. The rounded end must exceed the rounded start by at least a
    /// quarter beat.
    pub fn set(&self, start_beat: f64, end_beat: f64, context: &SchedulingContext) -> Result<()> {
        if !start_beat.is_finite() || !end_beat.is_finite() {
            return Err(EngineError::InvalidCycle {
                start: start_beat,
                end: end_beat,
            });
        }
        let start = round_to_millisecond(start_beat.max(0.0), context);
        let end = round_to_millisecond(end_beat, context);
        if end < start + MIN_CYCLE_BEATS {
            return Err(EngineError::InvalidCycle { start, end });
        }
        self.start_beat.set(start);
        self.end_beat.set(end);
        Ok(())
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.set(enabled);
    }

    pub fn toggle(&self) -> bool {
        !self.enabled.swap(!self.enabled.get())
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled.get()
    }

    /// (start, end) when the cycle is active.
    pub fn range(&self) -> Option<(f64, f64)> {
        self.enabled
            .get()
            .then(|| (self.start_beat.get(), self.end_beat.get()))
    }

    /// Cooldown = clamp(2 * buffer / rate, >= 100 ms); suppresses retrigger
    /// storms when the boundary is crossed repeatedly by jittery updates.
    pub fn set_cooldown_for_buffer(&self, buffer_frames: usize, sample_rate: f64) {
        let two_buffers = Duration::from_secs_f64(2.0 * buffer_frames as f64 / sample_rate);
        *self.cooldown.lock() = two_buffers.max(MIN_COOLDOWN);
    }

    /// True when the playhead has reached the boundary and the cooldown has
    /// expired.
    pub fn should_jump(&self, current_beat: f64, now: Instant) -> bool {
        if !self.enabled.get() {
            return false;
        }
        if current_beat < self.end_beat.get() - CYCLE_EPSILON {
            return false;
        }
        let last = self.last_jump.lock();
        match *last {
            Some(at) => now.duration_since(at) >= *self.cooldown.lock(),
            None => true,
        }
    }

    pub fn note_jump(&self, at: Instant) {
        *self.last_jump.lock() = Some(at);
    }
}

impl Default for CycleRegion {
    fn default() -> Self {
        Self::new()
    }
}

fn round_to_millisecond(beat: f64, context: &SchedulingContext) -> f64 {
    let seconds = context.beats_to_seconds(beat);
    context.seconds_to_beats((seconds * 1_000.0).round() / 1_000.0)
}
