//! Scheduling context: the immutable (sample rate, tempo, time signature)
//! bundle all musical-time conversions derive from.

use crate::error::{EngineError, Result};
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Ticks per quarter note for bar/beat/tick display.
pub const TICKS_PER_BEAT: u32 = 960;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSignature {
    pub numerator: u32,
    pub denominator: u32,
}

impl TimeSignature {
    pub fn new(numerator: u32, denominator: u32) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    /// Beats (quarter notes) per bar.
    pub fn beats_per_bar(&self) -> f64 {
        self.numerator as f64 * 4.0 / self.denominator as f64
    }
}

impl Default for TimeSignature {
    fn default() -> Self {
        Self::new(4, 4)
    }
}

/// Bar/beat/tick position, 1-based bars and beats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BBT {
    pub bar: u32,
    pub beat: u32,
    pub tick: u32,
}

/// Immutable conversion bundle. Replaced wholesale on tempo or sample-rate
/// change and published through a [`ContextCell`]; consumers must not cache
/// derived values across buffers.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulingContext {
    sample_rate: f64,
    tempo: f64,
    time_signature: TimeSignature,
}

impl SchedulingContext {
    pub fn new(sample_rate: f64, tempo: f64, time_signature: TimeSignature) -> Result<Self> {
        if !(sample_rate.is_finite() && sample_rate > 0.0) {
            return Err(EngineError::InvalidSampleRate(sample_rate));
        }
        if !(tempo.is_finite() && tempo > 0.0) {
            return Err(EngineError::InvalidTempo(tempo));
        }
        Ok(Self {
            sample_rate,
            tempo,
            time_signature,
        })
    }

    #[inline]
    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    #[inline]
    pub fn tempo(&self) -> f64 {
        self.tempo
    }

    #[inline]
    pub fn time_signature(&self) -> TimeSignature {
        self.time_signature
    }

    #[inline]
    pub fn beats_per_second(&self) -> f64 {
        self.tempo / 60.0
    }

    #[inline]
    pub fn samples_per_beat(&self) -> f64 {
        (60.0 / self.tempo) * self.sample_rate
    }

    #[inline]
    pub fn beats_to_seconds(&self, beats: f64) -> f64 {
        beats * 60.0 / self.tempo
    }

    #[inline]
    pub fn seconds_to_beats(&self, seconds: f64) -> f64 {
        seconds * self.tempo / 60.0
    }

    #[inline]
    pub fn beats_to_samples(&self, beats: f64) -> f64 {
        beats * self.samples_per_beat()
    }

    #[inline]
    pub fn samples_to_beats(&self, samples: f64) -> f64 {
        samples / self.samples_per_beat()
    }

    pub fn beats_to_bbt(&self, beats: f64) -> BBT {
        let beats = beats.max(0.0);
        let per_bar = self.time_signature.beats_per_bar();
        let bar = (beats / per_bar).floor();
        let within = beats - bar * per_bar;
        let beat = within.floor();
        let tick = ((within - beat) * TICKS_PER_BEAT as f64).round() as u32;
        BBT {
            bar: bar as u32 + 1,
            beat: beat as u32 + 1,
            tick: tick.min(TICKS_PER_BEAT - 1),
        }
    }

    pub fn bbt_to_beats(&self, bbt: BBT) -> f64 {
        let per_bar = self.time_signature.beats_per_bar();
        (bbt.bar.saturating_sub(1)) as f64 * per_bar
            + (bbt.beat.saturating_sub(1)) as f64
            + bbt.tick as f64 / TICKS_PER_BEAT as f64
    }

    /// New context with a different tempo; other fields carry over.
    pub fn with_tempo(&self, tempo: f64) -> Result<Self> {
        Self::new(self.sample_rate, tempo, self.time_signature)
    }

    /// New context with a different sample rate; other fields carry over.
    pub fn with_sample_rate(&self, sample_rate: f64) -> Result<Self> {
        Self::new(sample_rate, self.tempo, self.time_signature)
    }

    pub fn with_time_signature(&self, time_signature: TimeSignature) -> Self {
        Self {
            time_signature,
            ..*self
        }
    }
}

/// Atomically swappable holder for the live context.
pub struct ContextCell {
    inner: ArcSwap<SchedulingContext>,
}

impl ContextCell {
    pub fn new(context: SchedulingContext) -> Self {
        Self {
            inner: ArcSwap::from_pointee(context),
        }
    }

    #[inline]
    pub fn load(&self) -> Arc<SchedulingContext> {
        self.inner.load_full()
    }

    pub fn replace(&self, context: SchedulingContext) {
        self.inner.store(Arc::new(context));
    }

    pub fn set_tempo(&self, tempo: f64) -> Result<Arc<SchedulingContext>> {
        let next = Arc::new(self.load().with_tempo(tempo)?);
        self.inner.store(Arc::clone(&next));
        Ok(next)
    }

    pub fn set_sample_rate(&self, sample_rate: f64) -> Result<Arc<SchedulingContext>> {
        let next = Arc::new(self.load().with_sample_rate(sample_rate)?);
        self.inner.store(Arc::clone(&next));
        Ok(next)
    }

    pub fn set_time_signature(&self, time_signature: TimeSignature) -> Arc<SchedulingContext> {
        let next = Arc::new(self.load().with_time_signature(time_signature));
        self.inner.store(Arc::clone(&next));
        next
    }
}
