//! Metronome click: settings shared with the UI and a render-side
//! synthesiser mixed into the master output.

use crate::lockfree::{AtomicFlag, AtomicFloat};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Click settings, all atomics so the UI writes without locking.
pub struct ClickSettings {
    enabled: AtomicFlag,
    volume: AtomicFloat,
    accent_every: AtomicU32,
}

impl ClickSettings {
    pub fn new() -> Self {
        Self {
            enabled: AtomicFlag::new(false),
            volume: AtomicFloat::new(0.5),
            accent_every: AtomicU32::new(4),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.set(enabled);
    }

    pub fn enabled(&self) -> bool {
        self.enabled.get()
    }

    pub fn set_volume(&self, volume: f32) {
        self.volume.set(volume.clamp(0.0, 1.0));
    }

    pub fn volume(&self) -> f32 {
        self.volume.get()
    }

    pub fn set_accent_every(&self, beats: u32) {
        self.accent_every.store(beats, Ordering::Release);
    }

    pub fn accent_every(&self) -> u32 {
        self.accent_every.load(Ordering::Acquire)
    }
}

impl Default for ClickSettings {
    fn default() -> Self {
        Self::new()
    }
}

/// Render-side click generator. Pre-renders both click samples at
/// construction; the audio callback only indexes into them.
pub struct ClickSynth {
    settings: Arc<ClickSettings>,
    click_normal: Vec<f32>,
    click_accent: Vec<f32>,
    click_pos: usize,
    is_accent: bool,
    last_click_beat: i64,
}

impl ClickSynth {
    const CLICK_SECONDS: f64 = 0.03;

    pub fn new(settings: Arc<ClickSettings>, sample_rate: f64) -> Self {
        Self {
            settings,
            click_normal: Self::render_click(sample_rate, 1_000.0, 0.7),
            click_accent: Self::render_click(sample_rate, 1_200.0, 1.0),
            click_pos: usize::MAX,
            is_accent: false,
            last_click_beat: i64::MIN,
        }
    }

    fn render_click(sample_rate: f64, freq: f64, level: f64) -> Vec<f32> {
        let samples = (sample_rate * Self::CLICK_SECONDS) as usize;
        (0..samples)
            .map(|i| {
                let t = i as f64 / sample_rate;
                // 1 ms attack, 19 ms hold, 10 ms release.
                let env = if t < 0.001 {
                    t / 0.001
                } else if t < 0.02 {
                    1.0
                } else {
                    (1.0 - (t - 0.02) / 0.01).max(0.0)
                };
                let phase = core::f64::consts::TAU * freq * t;
                (phase.sin() * env * level) as f32
            })
            .collect()
    }

    /// Re-prime after a seek or cycle jump so the next integer beat clicks
    /// even when it equals an already-fired one.
    pub fn reprime(&mut self, beat: f64) {
        self.last_click_beat = beat.ceil() as i64 - 1;
        self.click_pos = usize::MAX;
    }

    pub fn set_sample_rate(&mut self, sample_rate: f64) {
        self.click_normal = Self::render_click(sample_rate, 1_000.0, 0.7);
        self.click_accent = Self::render_click(sample_rate, 1_200.0, 1.0);
        self.click_pos = usize::MAX;
    }

    /// Mix clicks for one buffer into interleaved stereo `out`.
    /// `beat` is the musical position of the first frame.
    pub fn mix_into(&mut self, out: &mut [f32], frames: usize, beat: f64, beats_per_sample: f64) {
        if !self.settings.enabled() {
            self.click_pos = usize::MAX;
            return;
        }
        // Self-prime on first use so a mid-beat start waits for the next
        // whole beat instead of firing a stale click.
        if self.last_click_beat == i64::MIN {
            self.last_click_beat = beat.ceil() as i64 - 1;
        }
        let volume = self.settings.volume();
        let accent_every = self.settings.accent_every();

        for i in 0..frames {
            let sample_beat = beat + i as f64 * beats_per_sample;
            let whole = sample_beat.floor() as i64;
            if whole > self.last_click_beat && whole >= 0 {
                self.last_click_beat = whole;
                self.click_pos = 0;
                self.is_accent = accent_every != 0 && (whole as u64) % accent_every as u64 == 0;
            }

            let table = if self.is_accent {
                &self.click_accent
            } else {
                &self.click_normal
            };
            if self.click_pos < table.len() {
                let s = table[self.click_pos] * volume;
                out[i * 2] += s;
                out[i * 2 + 1] += s;
                self.click_pos += 1;
            }
        }
    }
}
