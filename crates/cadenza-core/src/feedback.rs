//! Runaway-signal detection on the pre-EQ master buffer.

use crate::lockfree::{AtomicFlag, AtomicFloat};
use crossbeam_channel::{bounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Detector thresholds. Deliberately configuration rather than constants;
/// the defaults sit well above correlated full-scale music.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FeedbackConfig {
    /// Instantaneous RMS above this is runaway signal.
    pub rms_threshold: f32,
    /// Absolute DC offset above this is runaway signal.
    pub dc_threshold: f32,
    /// The condition must hold this long before the guard trips.
    pub window_ms: f32,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            rms_threshold: 4.0,
            dc_threshold: 0.5,
            window_ms: 50.0,
        }
    }
}

/// Watches buffers from the audio callback and latches an emergency mute
/// when the signal runs away. The callback zeroes the master gain on the
/// same buffer; the control domain observes the trip through [`trips()`]
/// and stops the transport.
///
/// [`trips()`]: FeedbackGuard::trips
pub struct FeedbackGuard {
    config: FeedbackConfig,
    window_samples: usize,
    over_samples: AtomicUsize,
    tripped: AtomicFlag,
    prior_gain: AtomicFloat,
    trip_tx: Sender<()>,
    trip_rx: Receiver<()>,
}

impl FeedbackGuard {
    pub fn new(config: FeedbackConfig, sample_rate: f64) -> Self {
        let window_samples = ((config.window_ms as f64 / 1_000.0) * sample_rate).max(1.0) as usize;
        let (trip_tx, trip_rx) = bounded(4);
        Self {
            config,
            window_samples,
            over_samples: AtomicUsize::new(0),
            tripped: AtomicFlag::default(),
            prior_gain: AtomicFloat::new(1.0),
            trip_tx,
            trip_rx,
        }
    }

    pub fn config(&self) -> FeedbackConfig {
        self.config
    }

    /// Control-domain receiver; one message per trip.
    pub fn trips(&self) -> Receiver<()> {
        self.trip_rx.clone()
    }

    #[inline]
    pub fn is_tripped(&self) -> bool {
        self.tripped.get()
    }

    /// Analyse one interleaved stereo buffer. Returns `true` on the buffer
    /// that trips the guard; the caller must mute its output and record the
    /// gain it muted from via [`note_prior_gain`](Self::note_prior_gain).
    ///
    /// Runs in the audio callback: atomics only, no allocation.
    #[inline]
    pub fn analyse(&self, buffer: &[f32], frames: usize) -> bool {
        if frames == 0 || self.tripped.get() {
            return false;
        }

        let mut sum_sq = 0.0f32;
        let mut sum = 0.0f32;
        let count = (frames * 2) as f32;
        for &s in &buffer[..frames * 2] {
            sum_sq += s * s;
            sum += s;
        }
        let rms = (sum_sq / count).sqrt();
        let dc = (sum / count).abs();

        if rms > self.config.rms_threshold || dc > self.config.dc_threshold {
            let over = self.over_samples.fetch_add(frames, Ordering::AcqRel) + frames;
            if over >= self.window_samples {
                self.tripped.set(true);
                let _ = self.trip_tx.try_send(());
                return true;
            }
        } else {
            self.over_samples.store(0, Ordering::Release);
        }
        false
    }

    /// Remember the master gain in effect when the guard tripped.
    pub fn note_prior_gain(&self, gain: f32) {
        self.prior_gain.set(gain);
    }

    /// Explicit user reset. Clears the latch and returns the gain to
    /// restore; `None` when the guard was not tripped.
    pub fn reset(&self) -> Option<f32> {
        if self.tripped.swap(false) {
            self.over_samples.store(0, Ordering::Release);
            Some(self.prior_gain.get())
        } else {
            None
        }
    }
}
