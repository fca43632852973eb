//! Graph manager: the single writer of the running graph.
//!
//! Mutations are tiered: structural (engine paused briefly, graph marked
//! not ready), connection-only (stream continues), and track-scoped
//! hot-swaps (only that track's player pauses). A generation counter
//! invalidates async plugin loads that lose a race with later mutations.

use crate::bus::BusNode;
use crate::format::GraphFormat;
use crate::player::ClipStore;
use crate::plugin::{
    load_async, PluginChain, PluginGreylist, PluginHost, PluginSlot, LOAD_TIMEOUT,
};
use crate::render::{MasterHandle, RenderGraph};
use crate::scheduler::{schedule_track, ScheduleParams};
use crate::track::{TrackHandle, TrackNode};
use cadenza_core::click::ClickSettings;
use cadenza_core::context::SchedulingContext;
use cadenza_core::error::{Component, EngineError, ErrorTracker, Result};
use cadenza_core::feedback::FeedbackGuard;
use cadenza_core::lockfree::AtomicFlag;
use cadenza_core::metering::{MeteringFabric, NodeKey};
use cadenza_core::pdc::DelayCompensator;
use cadenza_core::project::{
    Bus, BusId, PluginDescriptor, PluginId, Project, Track, TrackId,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Structural mutations allowed per rolling second outside batch mode.
const STRUCTURAL_RATE_LIMIT: usize = 32;

/// Readiness gate: while any structural window or plugin install holds it,
/// `is_graph_ready_for_playback` reads false and scheduling no-ops.
struct ReadyGate {
    flag: Arc<AtomicFlag>,
    holds: AtomicUsize,
}

impl ReadyGate {
    fn new() -> Self {
        Self {
            flag: Arc::new(AtomicFlag::new(true)),
            holds: AtomicUsize::new(0),
        }
    }

    fn acquire(&self) {
        self.holds.fetch_add(1, Ordering::AcqRel);
        self.flag.set(false);
    }

    fn release(&self) {
        if self.holds.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.flag.set(true);
        }
    }
}

struct RateLimiter {
    window: VecDeque<Instant>,
}

impl RateLimiter {
    fn new() -> Self {
        Self {
            window: VecDeque::with_capacity(STRUCTURAL_RATE_LIMIT),
        }
    }

    fn check(&mut self, now: Instant) -> Result<()> {
        while let Some(&front) = self.window.front() {
            if now.duration_since(front).as_secs_f64() > 1.0 {
                self.window.pop_front();
            } else {
                break;
            }
        }
        if self.window.len() >= STRUCTURAL_RATE_LIMIT {
            return Err(EngineError::MutationRateLimited);
        }
        self.window.push_back(now);
        Ok(())
    }
}

pub struct GraphManager {
    graph: Arc<Mutex<RenderGraph>>,
    handles: DashMap<TrackId, Arc<TrackHandle>>,
    master: Arc<MasterHandle>,
    generation: Arc<AtomicU64>,
    ready: ReadyGate,
    batch_depth: AtomicUsize,
    limiter: Mutex<RateLimiter>,
    next_plugin_id: AtomicU64,
    host: Arc<dyn PluginHost>,
    greylist: PluginGreylist,
    pdc: Arc<DelayCompensator>,
    fabric: Arc<MeteringFabric>,
    guard: Arc<FeedbackGuard>,
    tracker: Arc<ErrorTracker>,
    format: Mutex<GraphFormat>,
}

impl GraphManager {
    pub fn new(
        format: GraphFormat,
        host: Arc<dyn PluginHost>,
        pdc: Arc<DelayCompensator>,
        fabric: Arc<MeteringFabric>,
        guard: Arc<FeedbackGuard>,
        click_settings: Arc<ClickSettings>,
        tracker: Arc<ErrorTracker>,
    ) -> Self {
        let master = Arc::new(MasterHandle::new());
        let graph = RenderGraph::new(
            format,
            Arc::clone(&master),
            click_settings,
            Arc::clone(&guard),
            Arc::clone(&fabric),
        );
        Self {
            graph: Arc::new(Mutex::new(graph)),
            handles: DashMap::new(),
            master,
            generation: Arc::new(AtomicU64::new(0)),
            ready: ReadyGate::new(),
            batch_depth: AtomicUsize::new(0),
            limiter: Mutex::new(RateLimiter::new()),
            next_plugin_id: AtomicU64::new(1),
            host,
            greylist: PluginGreylist::new(),
            pdc,
            fabric,
            guard,
            tracker,
            format: Mutex::new(format),
        }
    }

    /// Shared with the audio callback.
    pub fn graph_arc(&self) -> Arc<Mutex<RenderGraph>> {
        Arc::clone(&self.graph)
    }

    /// Shared with the transport: play() no-ops while this is false.
    pub fn ready_flag(&self) -> Arc<AtomicFlag> {
        Arc::clone(&self.ready.flag)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.flag.get()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn master(&self) -> &Arc<MasterHandle> {
        &self.master
    }

    pub fn format(&self) -> GraphFormat {
        *self.format.lock()
    }

    pub fn track_handle(&self, track: TrackId) -> Option<Arc<TrackHandle>> {
        self.handles.get(&track).map(|h| Arc::clone(h.value()))
    }

    // --- batch mode ------------------------------------------------------

    /// Wrap many structural mutations in one pause/resume pair.
    pub fn batch<T>(&self, f: impl FnOnce(&Self) -> T) -> T {
        self.begin_batch();
        let result = f(self);
        self.end_batch();
        result
    }

    pub fn begin_batch(&self) {
        self.batch_depth.fetch_add(1, Ordering::AcqRel);
        self.ready.acquire();
    }

    pub fn end_batch(&self) {
        self.ready.release();
        self.batch_depth.fetch_sub(1, Ordering::AcqRel);
    }

    // --- mutation tiers --------------------------------------------------

    /// Tier 1: the engine pauses (graph not ready), the mutation runs under
    /// the graph lock, the generation advances.
    fn structural<T>(&self, f: impl FnOnce(&mut RenderGraph) -> Result<T>) -> Result<T> {
        if self.batch_depth.load(Ordering::Acquire) == 0 {
            if let Err(e) = self.limiter.lock().check(Instant::now()) {
                self.tracker
                    .warn(Component::Graph, "structural mutation rate limited");
                return Err(e);
            }
        }
        self.ready.acquire();
        let result = {
            let mut graph = self.graph.lock();
            f(&mut graph)
        };
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.ready.release();
        if let Err(e) = &result {
            self.tracker
                .error(Component::Graph, format!("structural mutation failed: {e}"));
        }
        result
    }

    /// Tier 2: endpoint swap with the stream continuing.
    fn connection<T>(&self, f: impl FnOnce(&mut RenderGraph) -> Result<T>) -> Result<T> {
        let mut graph = self.graph.lock();
        f(&mut graph)
    }

    /// Tier 3: rebuild inside one track while the rest of the graph keeps
    /// running; only that track's player pauses.
    fn hot_swap<T>(
        &self,
        track: TrackId,
        f: impl FnOnce(&mut TrackNode) -> Result<T>,
    ) -> Result<T> {
        let result = {
            let mut graph = self.graph.lock();
            let node = graph
                .track_mut(track)
                .ok_or(EngineError::UnknownTrack(track))?;
            let was_playing = node
                .player_mut()
                .map(|p| {
                    let playing = p.is_playing();
                    p.pause();
                    playing
                })
                .unwrap_or(false);
            let result = f(node);
            if was_playing {
                if let Some(player) = node.player_mut() {
                    player.resume();
                }
            }
            result
        };
        self.generation.fetch_add(1, Ordering::AcqRel);
        result
    }

    // --- tracks and buses ------------------------------------------------

    pub fn add_track(&self, track: &Track) -> Result<()> {
        let format = self.format();
        let meter = self.fabric.register(NodeKey::Track(track.id));
        let mut node = TrackNode::new(track.id, track.kind, &track.mixer, format, meter);
        node.rebuild(format);
        node.sends = track.sends.iter().map(|(&bus, &level)| (bus, level)).collect();
        let handle = node.handle();

        self.structural(move |graph| {
            if graph.track(track.id).is_some() {
                return Err(EngineError::TransientGraph(format!(
                    "track {} already exists",
                    track.id
                )));
            }
            graph.add_track(node);
            Ok(())
        })?;

        self.handles.insert(track.id, handle);
        self.update_solo_state();
        tracing::info!(track = track.id, "track added");
        Ok(())
    }

    pub fn remove_track(&self, track: TrackId) -> Result<()> {
        self.structural(|graph| {
            graph
                .remove_track(track)
                .map(|_| ())
                .ok_or(EngineError::UnknownTrack(track))
        })?;
        self.handles.remove(&track);
        self.fabric.unregister(NodeKey::Track(track));
        self.pdc.remove_track(track);
        self.update_solo_state();
        tracing::info!(track, "track removed");
        Ok(())
    }

    pub fn add_bus(&self, bus: &Bus) -> Result<()> {
        let format = self.format();
        let meter = self.fabric.register(NodeKey::Bus(bus.id));
        let node = BusNode::new(bus.id, bus.output_level, format, meter);
        self.structural(move |graph| {
            graph.add_bus(node);
            Ok(())
        })
    }

    /// A bus can only be destroyed after every track has dropped its sends
    /// to it.
    pub fn remove_bus(&self, bus: BusId) -> Result<()> {
        self.structural(|graph| {
            let referenced = graph
                .tracks
                .iter()
                .any(|t| t.sends.iter().any(|&(b, _)| b == bus));
            if referenced {
                return Err(EngineError::InvalidConnection(format!(
                    "bus {bus} still has live sends"
                )));
            }
            graph
                .remove_bus(bus)
                .map(|_| ())
                .ok_or(EngineError::UnknownBus(bus))
        })?;
        self.fabric.unregister(NodeKey::Bus(bus));
        Ok(())
    }

    /// Connection-only: rewire one send while the stream continues.
    pub fn set_send(&self, track: TrackId, bus: BusId, level: Option<f32>) -> Result<()> {
        self.connection(|graph| {
            if graph.bus_mut(bus).is_none() {
                return Err(EngineError::UnknownBus(bus));
            }
            let node = graph
                .track_mut(track)
                .ok_or(EngineError::UnknownTrack(track))?;
            node.sends.retain(|&(b, _)| b != bus);
            if let Some(level) = level {
                node.sends.push((bus, level.max(0.0)));
            }
            Ok(())
        })
    }

    // --- plugins ---------------------------------------------------------

    /// Insert a plugin. The load runs on a worker with a 5 s budget; a
    /// structural mutation racing it advances the generation and this call
    /// returns a stale-generation error instead of wiring a dead unit in.
    pub fn insert_plugin(
        &self,
        track: TrackId,
        slot_index: usize,
        descriptor: &PluginDescriptor,
        sandboxed: bool,
        state: Option<Vec<u8>>,
    ) -> Result<PluginId> {
        let captured = self.generation();
        let sandboxed = sandboxed || self.greylist.prefer_sandboxed(descriptor);

        // Hold the gate so play() fails silently during the install.
        self.ready.acquire();
        let rx = load_async(
            Arc::clone(&self.host),
            descriptor.clone(),
            sandboxed,
            state,
        );
        let loaded = rx.recv_timeout(LOAD_TIMEOUT);
        let result = (|| {
            let unit = match loaded {
                Ok(Ok(unit)) => unit,
                Ok(Err(e)) => {
                    self.greylist.note_failure(descriptor);
                    self.tracker
                        .error(Component::PluginHost, format!("load failed: {e}"));
                    return Err(e);
                }
                Err(_) => {
                    self.greylist.note_failure(descriptor);
                    let e = EngineError::PluginLoadTimeout(LOAD_TIMEOUT);
                    self.tracker
                        .error(Component::PluginHost, format!("{e}"));
                    return Err(e);
                }
            };

            // Re-check the captured generation after the suspension point.
            let live = self.generation();
            if live != captured {
                return Err(EngineError::StaleGeneration { captured, live });
            }

            let id = self.next_plugin_id.fetch_add(1, Ordering::AcqRel);
            self.hot_swap(track, |node| {
                node.chain.insert(slot_index, PluginSlot::new(id, unit));
                Ok(())
            })?;
            self.refresh_track_latency(track)?;
            tracing::info!(track, plugin = id, uid = %descriptor.uid, sandboxed, "plugin inserted");
            Ok(id)
        })();
        self.ready.release();
        result
    }

    /// Drop every plugin in a track's chain (project reloads rebuild from
    /// configs afterwards).
    pub fn clear_plugins(&self, track: TrackId) -> Result<()> {
        self.hot_swap(track, |node| {
            node.chain.uninstall();
            Ok(())
        })?;
        self.refresh_track_latency(track)
    }

    pub fn remove_plugin(&self, track: TrackId, plugin: PluginId) -> Result<()> {
        self.hot_swap(track, |node| node.chain.remove(plugin).map(|_| ()))?;
        self.refresh_track_latency(track)
    }

    pub fn move_plugin(&self, track: TrackId, plugin: PluginId, to_index: usize) -> Result<()> {
        self.hot_swap(track, |node| node.chain.move_slot(plugin, to_index))
    }

    pub fn set_bypass(&self, track: TrackId, plugin: PluginId, bypassed: bool) -> Result<()> {
        self.hot_swap(track, |node| node.chain.set_bypass(plugin, bypassed))?;
        self.refresh_track_latency(track)
    }

    pub fn set_sidechain_source(
        &self,
        track: TrackId,
        plugin: PluginId,
        source: Option<TrackId>,
    ) -> Result<()> {
        self.connection(|graph| {
            let node = graph
                .track_mut(track)
                .ok_or(EngineError::UnknownTrack(track))?;
            node.chain.set_sidechain_source(plugin, source)
        })
    }

    /// Re-query a track's active chain latency into the compensator.
    fn refresh_track_latency(&self, track: TrackId) -> Result<()> {
        let latency = {
            let mut graph = self.graph.lock();
            let node = graph
                .track_mut(track)
                .ok_or(EngineError::UnknownTrack(track))?;
            node.chain.active_latency()
        };
        self.pdc.set_track_latency(track, latency)?;
        Ok(())
    }

    // --- mixer surface (lock-free) ---------------------------------------

    pub fn set_volume(&self, track: TrackId, volume: f32) -> Result<()> {
        let handle = self
            .track_handle(track)
            .ok_or(EngineError::UnknownTrack(track))?;
        handle.volume.set(volume.clamp(0.0, 1.0));
        Ok(())
    }

    pub fn set_pan(&self, track: TrackId, pan: f32) -> Result<()> {
        let handle = self
            .track_handle(track)
            .ok_or(EngineError::UnknownTrack(track))?;
        handle.pan.set(pan.clamp(-1.0, 1.0));
        Ok(())
    }

    pub fn set_eq(&self, track: TrackId, low_db: f32, mid_db: f32, high_db: f32) -> Result<()> {
        let handle = self
            .track_handle(track)
            .ok_or(EngineError::UnknownTrack(track))?;
        handle.eq_low_db.set(low_db);
        handle.eq_mid_db.set(mid_db);
        handle.eq_high_db.set(high_db);
        Ok(())
    }

    pub fn set_mute(&self, track: TrackId, muted: bool) -> Result<()> {
        let handle = self
            .track_handle(track)
            .ok_or(EngineError::UnknownTrack(track))?;
        handle.muted.set(muted);
        self.update_solo_state();
        Ok(())
    }

    pub fn set_solo(&self, track: TrackId, solo: bool) -> Result<()> {
        let handle = self
            .track_handle(track)
            .ok_or(EngineError::UnknownTrack(track))?;
        handle.solo.set(solo);
        self.update_solo_state();
        Ok(())
    }

    pub fn set_record_enable(&self, track: TrackId, enabled: bool) -> Result<()> {
        let handle = self
            .track_handle(track)
            .ok_or(EngineError::UnknownTrack(track))?;
        handle.record_enabled.set(enabled);
        Ok(())
    }

    pub fn set_input_monitoring(&self, track: TrackId, enabled: bool) -> Result<()> {
        let handle = self
            .track_handle(track)
            .ok_or(EngineError::UnknownTrack(track))?;
        handle.input_monitoring.set(enabled);
        Ok(())
    }

    pub fn set_master_volume(&self, volume: f32) {
        self.master.volume.set(volume.clamp(0.0, 1.0));
    }

    pub fn set_master_eq(&self, low_db: f32, mid_db: f32, high_db: f32) {
        self.master.eq_low_db.set(low_db);
        self.master.eq_mid_db.set(mid_db);
        self.master.eq_high_db.set(high_db);
    }

    /// Recompute the derived audibility of every track from the solo
    /// policy. Called on any mute/solo change and before each play.
    pub fn update_solo_state(&self) {
        let any_solo = self.handles.iter().any(|h| h.solo.get());
        for handle in self.handles.iter() {
            let audible = if any_solo {
                handle.solo.get()
            } else {
                !handle.muted.get()
            };
            handle.audible.set(audible);
        }
    }

    // --- feedback guard --------------------------------------------------

    /// Explicit user reset after an emergency mute; restores the prior
    /// master gain and leaves the transport stopped.
    pub fn reset_feedback_guard(&self) -> bool {
        match self.guard.reset() {
            Some(prior_gain) => {
                self.master.volume.set(prior_gain);
                tracing::info!("feedback guard reset, master gain restored");
                true
            }
            None => false,
        }
    }

    // --- scheduling ------------------------------------------------------

    /// Schedule every audio track's regions. Track-scoped failures are
    /// recorded and skipped; the rest of the project stays playable.
    #[allow(clippy::too_many_arguments)]
    pub fn schedule_project(
        &self,
        project: &Project,
        clips: &ClipStore,
        context: &SchedulingContext,
        start_beat: f64,
        cycle: Option<(f64, f64)>,
        clock_offset_seconds: f64,
        preserve_playback: bool,
    ) {
        if !self.is_ready() {
            self.tracker
                .warn(Component::Graph, "scheduling skipped: graph not ready");
            return;
        }
        let format = self.format();
        let mut graph = self.graph.lock();
        for track in &project.tracks {
            if track.regions.is_empty() {
                continue;
            }
            let Some(node) = graph.track_mut(track.id) else {
                continue;
            };
            let params = ScheduleParams {
                start_beat,
                context,
                pdc_seconds: self
                    .pdc
                    .compensation_seconds(track.id, format.sample_rate),
                cycle,
                clock_offset_seconds,
                preserve_playback,
            };
            // Per-track isolation: a failed track is skipped, others play.
            let _ = schedule_track(node, track, clips, format, &params, &self.tracker);
        }
    }

    pub fn start_players(&self) {
        self.graph.lock().play_all();
    }

    pub fn stop_players(&self) {
        self.graph.lock().stop_all();
    }

    pub fn reprime_click(&self, beat: f64) {
        self.graph.lock().reprime_click(beat);
    }

    /// Attach an instrument cell as a track's source (engine wiring).
    pub fn set_track_instrument(
        &self,
        track: TrackId,
        cell: Arc<cadenza_midi::InstrumentCell>,
    ) -> Result<()> {
        self.hot_swap(track, |node| {
            node.set_instrument(cell);
            Ok(())
        })
    }

    /// Device route/rate change: republish the format, rebuild every node
    /// at the new rate, PDC follows from the unchanged chain latencies.
    pub fn device_format_changed(&self, sample_rate: f64) -> Result<()> {
        let format = GraphFormat::standard(sample_rate);
        format.validate()?;
        *self.format.lock() = format;
        self.structural(|graph| {
            graph.set_format(format);
            Ok(())
        })?;
        tracing::info!(sample_rate, "graph format republished");
        Ok(())
    }

    /// Structural invariant check for the health probe.
    pub fn violations(&self) -> Vec<(Component, String)> {
        self.graph.lock().violations()
    }

    /// Count of tracks currently in the graph.
    pub fn track_count(&self) -> usize {
        self.graph.lock().tracks.len()
    }
}

impl std::fmt::Debug for GraphManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphManager")
            .field("generation", &self.generation())
            .field("ready", &self.is_ready())
            .finish()
    }
}
