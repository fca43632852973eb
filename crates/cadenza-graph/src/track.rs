//! Per-track signal chain: source -> time/pitch -> plugin chain -> EQ ->
//! volume -> pan.

use crate::chain::{Panner, ThreeBandEq, TimePitch};
use crate::format::{GraphFormat, MAX_FRAMES};
use crate::player::RegionPlayer;
use crate::plugin::PluginChain;
use cadenza_core::automation::{AutomationTarget, AutomationValues};
use cadenza_core::lockfree::{AtomicFlag, AtomicFloat};
use cadenza_core::metering::AtomicAmplitude;
use cadenza_core::project::{MixerSettings, TrackId, TrackKind};
use cadenza_core::smooth::{AdaptiveSmoother, MuteRamp, SmoothedValue};
use cadenza_midi::InstrumentCell;
use std::sync::Arc;

/// Lock-free parameter cells shared with the mixer surface and the
/// automation engine. The render path reads targets once per buffer.
pub struct TrackHandle {
    pub volume: AtomicFloat,
    pub pan: AtomicFloat,
    pub eq_low_db: AtomicFloat,
    pub eq_mid_db: AtomicFloat,
    pub eq_high_db: AtomicFloat,
    pub muted: AtomicFlag,
    pub solo: AtomicFlag,
    /// Derived from the solo policy across all tracks.
    pub audible: AtomicFlag,
    pub record_enabled: AtomicFlag,
    pub input_monitoring: AtomicFlag,
    /// Set when smoothed state must snap to the targets (transport start).
    prime_pending: AtomicFlag,
}

impl TrackHandle {
    pub fn new(mixer: &MixerSettings) -> Self {
        Self {
            volume: AtomicFloat::new(mixer.volume),
            pan: AtomicFloat::new(mixer.pan),
            eq_low_db: AtomicFloat::new(mixer.eq_low_db),
            eq_mid_db: AtomicFloat::new(mixer.eq_mid_db),
            eq_high_db: AtomicFloat::new(mixer.eq_high_db),
            muted: AtomicFlag::new(mixer.muted),
            solo: AtomicFlag::new(mixer.solo),
            audible: AtomicFlag::new(!mixer.muted),
            record_enabled: AtomicFlag::new(mixer.record_enabled),
            input_monitoring: AtomicFlag::new(mixer.input_monitoring),
            prime_pending: AtomicFlag::new(false),
        }
    }

    fn store(&self, values: &AutomationValues) {
        if let Some(v) = values.volume {
            self.volume.set(v.clamp(0.0, 1.0));
        }
        if let Some(p) = values.pan {
            self.pan.set(p.clamp(-1.0, 1.0));
        }
        if let Some(g) = values.eq_low_db {
            self.eq_low_db.set(g);
        }
        if let Some(g) = values.eq_mid_db {
            self.eq_mid_db.set(g);
        }
        if let Some(g) = values.eq_high_db {
            self.eq_high_db.set(g);
        }
    }

    pub fn request_prime(&self) {
        self.prime_pending.set(true);
    }
}

impl AutomationTarget for TrackHandle {
    fn apply(&self, values: &AutomationValues) {
        self.store(values);
    }

    fn prime(&self, values: &AutomationValues) {
        self.store(values);
        self.prime_pending.set(true);
    }
}

/// Audio source at the head of the chain.
pub enum TrackSource {
    Player(RegionPlayer),
    Instrument(Arc<InstrumentCell>),
}

/// Runtime node owned by the graph manager.
pub struct TrackNode {
    pub id: TrackId,
    pub kind: TrackKind,
    pub source: TrackSource,
    pub time_pitch: TimePitch,
    pub chain: PluginChain,
    eq: ThreeBandEq,
    volume_adaptive: AdaptiveSmoother,
    volume_ramp: SmoothedValue,
    mute_ramp: MuteRamp,
    pan_adaptive: AdaptiveSmoother,
    panner: Panner,
    handle: Arc<TrackHandle>,
    meter: Arc<AtomicAmplitude>,
    /// Post-fader send levels; mutated only under the graph lock.
    pub sends: Vec<(u64, f32)>,
    scratch: Vec<f32>,
    attached: bool,
}

impl TrackNode {
    /// Buffer-level parameter ramp length.
    const RAMP_SECONDS: f32 = 0.005;

    pub fn new(
        id: TrackId,
        kind: TrackKind,
        mixer: &MixerSettings,
        format: GraphFormat,
        meter: Arc<AtomicAmplitude>,
    ) -> Self {
        let rate = format.sample_rate;
        let source = match kind {
            TrackKind::Audio => TrackSource::Player(RegionPlayer::new(rate)),
            // Instrument and pure-MIDI tracks render through the registry
            // cell installed by the engine; until then they are silent.
            TrackKind::Midi | TrackKind::Instrument => {
                TrackSource::Player(RegionPlayer::new(rate))
            }
        };

        Self {
            id,
            kind,
            source,
            time_pitch: TimePitch::new(MAX_FRAMES),
            chain: PluginChain::new(rate),
            eq: ThreeBandEq::new(rate),
            volume_adaptive: AdaptiveSmoother::volume(mixer.volume),
            volume_ramp: SmoothedValue::new(mixer.volume, Self::RAMP_SECONDS, rate as f32),
            mute_ramp: MuteRamp::new(mixer.muted, rate as f32),
            pan_adaptive: AdaptiveSmoother::pan(mixer.pan),
            panner: Panner::new(mixer.pan, rate),
            handle: Arc::new(TrackHandle::new(mixer)),
            meter,
            sends: Vec::new(),
            scratch: vec![0.0; MAX_FRAMES * 2],
            attached: false,
        }
    }

    pub fn handle(&self) -> Arc<TrackHandle> {
        Arc::clone(&self.handle)
    }

    pub fn set_instrument(&mut self, cell: Arc<InstrumentCell>) {
        self.source = TrackSource::Instrument(cell);
    }

    pub fn player_mut(&mut self) -> Option<&mut RegionPlayer> {
        match &mut self.source {
            TrackSource::Player(p) => Some(p),
            TrackSource::Instrument(_) => None,
        }
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Rebuild the node for a (possibly new) format. This is the single
    /// source of truth for track wiring: stop the player, take the chain
    /// down downstream-first, realize the plugin chain, then reconnect
    /// upstream-first at the graph format. PDC and solo state are the
    /// caller's follow-ups.
    pub fn rebuild(&mut self, format: GraphFormat) {
        let rate = format.sample_rate;

        // Downstream-first teardown: pan -> volume -> eq -> chain ->
        // time/pitch -> source. Every step tolerates a node that is not
        // currently attached.
        self.attached = false;
        if let TrackSource::Player(player) = &mut self.source {
            player.stop();
        }
        self.eq.reset();
        self.time_pitch.reset();
        self.chain.reset();

        self.chain.realize();

        // Upstream-first reconnect at the single graph format.
        match &mut self.source {
            TrackSource::Player(player) => player.set_sample_rate(rate),
            TrackSource::Instrument(cell) => cell.set_sample_rate(rate),
        }
        self.chain.set_sample_rate(rate);
        self.eq.set_sample_rate(rate);
        self.mute_ramp.set_sample_rate(rate as f32);
        self.volume_ramp = SmoothedValue::new(
            self.volume_ramp.current(),
            Self::RAMP_SECONDS,
            rate as f32,
        );
        self.panner = Panner::new(self.panner.pan(), rate);
        if let TrackSource::Player(player) = &mut self.source {
            player.attach();
        }
        self.attached = true;
    }

    /// Safe teardown: stop player, uninstall the plugin chain, disconnect
    /// outputs before inputs, then detach. Every step is a no-op when the
    /// node is already partially down.
    pub fn teardown(&mut self) {
        if let TrackSource::Player(player) = &mut self.source {
            player.stop();
        }
        self.chain.uninstall();
        self.attached = false;
        if let TrackSource::Player(player) = &mut self.source {
            player.detach();
        }
    }

    /// The last rendered buffer, read after [`render`](Self::render).
    pub fn output(&self, frames: usize) -> &[f32] {
        &self.scratch[..frames.min(MAX_FRAMES) * 2]
    }

    /// Pull one buffer through the chain into the node's scratch.
    pub fn render(&mut self, frames: usize) {
        let frames = frames.min(MAX_FRAMES);
        let buf = &mut self.scratch[..frames * 2];
        buf.fill(0.0);

        if !self.attached {
            return;
        }

        match &mut self.source {
            TrackSource::Player(player) => player.render(buf, frames),
            TrackSource::Instrument(cell) => {
                // Contention here means the scheduler is mid-dispatch;
                // keep silence for this buffer rather than blocking.
                let _ = cell.try_render(buf, frames);
            }
        }

        self.time_pitch.process(buf, frames);
        self.chain.process(buf, frames);

        // Pull parameter targets once per buffer through the adaptive
        // smoothers, snapping first when a prime is pending.
        if self.handle.prime_pending.swap(false) {
            self.volume_adaptive.reset(self.handle.volume.get());
            self.volume_ramp.set_immediate(self.handle.volume.get());
            self.pan_adaptive.reset(self.handle.pan.get());
            self.panner.set_immediate(self.handle.pan.get());
            self.mute_ramp.reset(!self.handle.audible.get());
        }

        let volume = self.volume_adaptive.push(self.handle.volume.get());
        self.volume_ramp.set_target(volume);
        let pan = self.pan_adaptive.push(self.handle.pan.get());
        self.panner.set_pan(pan);
        self.eq.set_gains(
            self.handle.eq_low_db.get(),
            self.handle.eq_mid_db.get(),
            self.handle.eq_high_db.get(),
        );
        // `audible` is the derived solo/mute verdict maintained by the
        // graph manager; the ramp keeps toggles click-free.
        self.mute_ramp.set_muted(!self.handle.audible.get());

        self.eq.process(buf, frames);
        for i in 0..frames {
            let gain = self.volume_ramp.next_sample() * self.mute_ramp.next_sample();
            buf[i * 2] *= gain;
            buf[i * 2 + 1] *= gain;
        }
        self.panner.process(buf, frames);

        self.meter.ingest(buf, frames);
    }
}
