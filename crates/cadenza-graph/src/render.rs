//! The pull path: tracks -> sends -> buses -> master, executed inside the
//! audio callback under a short try-lock.

use crate::bus::BusNode;
use crate::chain::ThreeBandEq;
use crate::format::{GraphFormat, MAX_FRAMES};
use crate::track::TrackNode;
use cadenza_core::click::{ClickSettings, ClickSynth};
use cadenza_core::error::Component;
use cadenza_core::feedback::FeedbackGuard;
use cadenza_core::lockfree::AtomicFloat;
use cadenza_core::metering::{AtomicAmplitude, MeteringFabric, NodeKey};
use cadenza_core::project::{BusId, TrackId};
use cadenza_core::smooth::SmoothedValue;
use std::sync::Arc;

/// Master mixer controls, written lock-free by the control surface.
pub struct MasterHandle {
    pub volume: AtomicFloat,
    pub eq_low_db: AtomicFloat,
    pub eq_mid_db: AtomicFloat,
    pub eq_high_db: AtomicFloat,
}

impl MasterHandle {
    pub fn new() -> Self {
        Self {
            volume: AtomicFloat::new(1.0),
            eq_low_db: AtomicFloat::new(0.0),
            eq_mid_db: AtomicFloat::new(0.0),
            eq_high_db: AtomicFloat::new(0.0),
        }
    }
}

impl Default for MasterHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-buffer timing handed in by the audio callback.
#[derive(Debug, Clone, Copy)]
pub struct RenderContext {
    /// Musical position of the first frame.
    pub beat: f64,
    pub beats_per_sample: f64,
    pub playing: bool,
}

/// The complete running graph. Single writer (the graph manager, under the
/// lock); the audio callback is the reader and observes the effect of
/// writes between callbacks.
pub struct RenderGraph {
    pub(crate) tracks: Vec<TrackNode>,
    pub(crate) buses: Vec<BusNode>,
    format: GraphFormat,
    master: Arc<MasterHandle>,
    master_eq: ThreeBandEq,
    master_ramp: SmoothedValue,
    click: ClickSynth,
    guard: Arc<FeedbackGuard>,
    fabric: Arc<MeteringFabric>,
    master_meter: Arc<AtomicAmplitude>,
    master_buf: Vec<f32>,
    planar_left: Vec<f32>,
    planar_right: Vec<f32>,
}

impl RenderGraph {
    const MASTER_RAMP_SECONDS: f32 = 0.005;

    pub fn new(
        format: GraphFormat,
        master: Arc<MasterHandle>,
        click_settings: Arc<ClickSettings>,
        guard: Arc<FeedbackGuard>,
        fabric: Arc<MeteringFabric>,
    ) -> Self {
        let master_meter = fabric.register(NodeKey::Master);
        Self {
            tracks: Vec::new(),
            buses: Vec::new(),
            format,
            master,
            master_eq: ThreeBandEq::new(format.sample_rate),
            master_ramp: SmoothedValue::new(
                1.0,
                Self::MASTER_RAMP_SECONDS,
                format.sample_rate as f32,
            ),
            click: ClickSynth::new(click_settings, format.sample_rate),
            guard,
            fabric,
            master_meter,
            master_buf: vec![0.0; MAX_FRAMES * 2],
            planar_left: vec![0.0; MAX_FRAMES],
            planar_right: vec![0.0; MAX_FRAMES],
        }
    }

    pub fn format(&self) -> GraphFormat {
        self.format
    }

    pub fn set_format(&mut self, format: GraphFormat) {
        self.format = format;
        for track in &mut self.tracks {
            track.rebuild(format);
        }
        for bus in &mut self.buses {
            bus.set_sample_rate(format.sample_rate);
        }
        self.master_eq.set_sample_rate(format.sample_rate);
        self.click.set_sample_rate(format.sample_rate);
    }

    pub fn track_mut(&mut self, id: TrackId) -> Option<&mut TrackNode> {
        self.tracks.iter_mut().find(|t| t.id == id)
    }

    pub fn track(&self, id: TrackId) -> Option<&TrackNode> {
        self.tracks.iter().find(|t| t.id == id)
    }

    pub fn bus_mut(&mut self, id: BusId) -> Option<&mut BusNode> {
        self.buses.iter_mut().find(|b| b.id == id)
    }

    pub fn track_ids(&self) -> Vec<TrackId> {
        self.tracks.iter().map(|t| t.id).collect()
    }

    pub fn add_track(&mut self, node: TrackNode) {
        self.tracks.push(node);
    }

    pub fn remove_track(&mut self, id: TrackId) -> Option<TrackNode> {
        let index = self.tracks.iter().position(|t| t.id == id)?;
        let mut node = self.tracks.remove(index);
        node.teardown();
        Some(node)
    }

    pub fn add_bus(&mut self, node: BusNode) {
        self.buses.push(node);
    }

    pub fn remove_bus(&mut self, id: BusId) -> Option<BusNode> {
        let index = self.buses.iter().position(|b| b.id == id)?;
        Some(self.buses.remove(index))
    }

    /// Re-prime the click phase after a seek or cycle jump.
    pub fn reprime_click(&mut self, beat: f64) {
        self.click.reprime(beat);
    }

    pub fn play_all(&mut self) {
        for track in &mut self.tracks {
            if let Some(player) = track.player_mut() {
                player.play();
            }
        }
    }

    pub fn stop_all(&mut self) {
        for track in &mut self.tracks {
            if let Some(player) = track.player_mut() {
                player.stop();
            }
        }
    }

    /// Structural invariants for the health monitor.
    pub fn violations(&self) -> Vec<(Component, String)> {
        let mut out = Vec::new();
        if self.format.validate().is_err() {
            out.push((
                Component::Graph,
                format!("graph format has invalid rate {}", self.format.sample_rate),
            ));
        }
        for track in &self.tracks {
            if !track.is_attached() {
                out.push((Component::Track, format!("track {} not attached", track.id)));
            }
        }
        out
    }

    /// Render one buffer of interleaved stereo into `out` (overwriting).
    pub fn render(&mut self, ctx: RenderContext, out: &mut [f32], frames: usize) {
        let frames = frames.min(MAX_FRAMES).min(out.len() / 2);
        let master_buf = &mut self.master_buf[..frames * 2];
        master_buf.fill(0.0);

        // Tracks feed the master sum and their post-fader sends.
        for track in &mut self.tracks {
            track.render(frames);
            let rendered = track.output(frames);
            for (slot, &s) in master_buf.iter_mut().zip(rendered.iter()) {
                *slot += s;
            }
            for &(bus_id, level) in &track.sends {
                if let Some(bus) = self.buses.iter_mut().find(|b| b.id == bus_id) {
                    bus.accumulate(rendered, frames, level);
                }
            }
        }

        for bus in &mut self.buses {
            bus.render_into(master_buf, frames);
        }

        // Runaway detection on the pre-EQ sum; the same buffer is muted.
        if self.guard.analyse(master_buf, frames) {
            self.guard.note_prior_gain(self.master.volume.get());
        }

        self.master_eq.set_gains(
            self.master.eq_low_db.get(),
            self.master.eq_mid_db.get(),
            self.master.eq_high_db.get(),
        );
        self.master_eq.process(master_buf, frames);

        let target = if self.guard.is_tripped() {
            0.0
        } else {
            self.master.volume.get()
        };
        self.master_ramp.set_target(target);
        if self.guard.is_tripped() {
            // Emergency mute is immediate, not ramped.
            self.master_ramp.set_immediate(0.0);
        }
        for i in 0..frames {
            let gain = self.master_ramp.next_sample();
            master_buf[i * 2] *= gain;
            master_buf[i * 2 + 1] *= gain;
        }

        if ctx.playing {
            self.click
                .mix_into(master_buf, frames, ctx.beat, ctx.beats_per_sample);
        }

        for i in 0..frames {
            self.planar_left[i] = master_buf[i * 2];
            self.planar_right[i] = master_buf[i * 2 + 1];
        }
        self.fabric
            .update_loudness(&self.planar_left[..frames], &self.planar_right[..frames]);
        self.master_meter.ingest(master_buf, frames);

        out[..frames * 2].copy_from_slice(master_buf);
    }
}
