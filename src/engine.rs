//! The engine façade: wires the output device, graph, transport, MIDI and
//! automation engines together and exposes the four public surfaces
//! (transport control, mixer control, graph control, observation).

use crate::output::{AudioOutput, CallbackState};
use cadenza_automation::AutomationEngine;
use cadenza_core::anchor::AnchorCell;
use cadenza_core::automation::AutomationTarget;
use cadenza_core::click::ClickSettings;
use cadenza_core::context::ContextCell;
use cadenza_core::error::{Component, EngineError, ErrorTracker, Result};
use cadenza_core::feedback::FeedbackGuard;
use cadenza_core::health::{EngineProbe, HealthMonitor, HealthStatus};
use cadenza_core::lockfree::AtomicFlag;
use cadenza_core::metering::{CpuLoad, Levels, LoudnessSnapshot, MeteringFabric, NodeKey};
use cadenza_core::pdc::DelayCompensator;
use cadenza_core::project::{self, PluginDescriptor, PluginId, Project, ProjectChange, TrackId};
use cadenza_core::transport::CycleRegion;
use cadenza_core::transport::{Transport, TransportState, TransportUpdate};
use cadenza_graph::{AudioClip, ClipStore, GraphManager};
use cadenza_midi::{Instrument, InstrumentRegistry, MidiScheduler};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Nominal buffer used for the cycle-jump cooldown before the device
/// reports real callback sizes.
const NOMINAL_BUFFER_FRAMES: usize = 512;

#[derive(Default)]
pub(crate) struct CycleRun {
    origin_beat: f64,
    jumps: u64,
}

/// Scheduling glue invoked from transport callbacks. Holds only the
/// subsystems it drives, never the engine façade itself.
pub(crate) struct SchedulerWiring {
    pub graph: Arc<GraphManager>,
    pub clips: Arc<ClipStore>,
    pub project: Arc<Mutex<Arc<Project>>>,
    pub context: Arc<ContextCell>,
    pub cycle: Arc<CycleRegion>,
    pub automation: Arc<AutomationEngine>,
    pub midi: Arc<MidiScheduler>,
    pub cycle_run: Mutex<CycleRun>,
}

impl SchedulerWiring {
    /// Rebuild region schedules and prime smoothing for playback from
    /// `beat` (play, seek, tempo change).
    fn restart_audio(&self, beat: f64) {
        self.graph.update_solo_state();
        *self.cycle_run.lock() = CycleRun {
            origin_beat: beat,
            jumps: 0,
        };
        let project = Arc::clone(&*self.project.lock());
        let context = self.context.load();
        self.graph.schedule_project(
            &project,
            &self.clips,
            &context,
            beat,
            self.cycle.range(),
            0.0,
            false,
        );
        self.graph.start_players();
        self.graph.reprime_click(beat);
        self.automation.prime(beat);
    }

    fn on_play(&self, beat: f64) {
        self.restart_audio(beat);
        self.midi.handle_seek(beat);
    }

    fn on_stop(&self, _beat: f64) {
        self.midi.handle_stop();
        self.graph.stop_players();
    }

    fn on_seek(&self, beat: f64) {
        self.restart_audio(beat);
        self.midi.handle_seek(beat);
    }

    fn on_tempo_change(&self, beat: f64) {
        self.restart_audio(beat);
        self.midi.handle_tempo_change(beat);
    }

    /// Top up pre-scheduled cycle iterations behind the running player
    /// clock; segments land on the same absolute sample grid, so the
    /// handover is seamless.
    fn on_cycle_jump(&self, target: f64) {
        let Some((cycle_start, cycle_end)) = self.cycle.range() else {
            return;
        };
        let context = self.context.load();
        let offset = {
            let mut run = self.cycle_run.lock();
            run.jumps += 1;
            let first_pass =
                context.beats_to_seconds(cycle_end) - context.beats_to_seconds(run.origin_beat);
            let loop_len =
                context.beats_to_seconds(cycle_end) - context.beats_to_seconds(cycle_start);
            first_pass + (run.jumps - 1) as f64 * loop_len
        };
        let project = Arc::clone(&*self.project.lock());
        self.graph.schedule_project(
            &project,
            &self.clips,
            &context,
            cycle_start,
            Some((cycle_start, cycle_end)),
            offset,
            true,
        );
        self.midi.handle_cycle_jump(target);
        self.graph.reprime_click(target);
        self.automation.prime(target);
    }
}

struct OutputProbe {
    output: Arc<Mutex<AudioOutput>>,
    graph: Arc<GraphManager>,
    state: CallbackState,
}

impl EngineProbe for OutputProbe {
    fn is_running(&self) -> bool {
        self.output.lock().is_running()
    }

    fn prepare(&self) -> Result<()> {
        self.output.lock().prepare()
    }

    fn start(&self) -> Result<()> {
        self.output.lock().start(self.state.clone())
    }

    fn violations(&self) -> Vec<(Component, String)> {
        self.graph.violations()
    }
}

/// The real-time engine core. Built once via [`Engine::builder`]; all
/// methods are callable from the control domain while audio flows.
pub struct Engine {
    output: Arc<Mutex<AudioOutput>>,
    context: Arc<ContextCell>,
    #[allow(dead_code)]
    anchor: Arc<AnchorCell>,
    transport: Arc<Transport>,
    graph: Arc<GraphManager>,
    midi: Arc<MidiScheduler>,
    automation: Arc<AutomationEngine>,
    registry: Arc<InstrumentRegistry>,
    fabric: Arc<MeteringFabric>,
    pdc: Arc<DelayCompensator>,
    guard: Arc<FeedbackGuard>,
    click: Arc<ClickSettings>,
    health: HealthMonitor,
    tracker: Arc<ErrorTracker>,
    clips: Arc<ClipStore>,
    project: Arc<Mutex<Arc<Project>>>,
    wiring: Arc<SchedulerWiring>,
    callback_state: CallbackState,
    watcher_shutdown: Arc<AtomicFlag>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    pub fn builder() -> crate::builder::EngineBuilder {
        crate::builder::EngineBuilder::default()
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn assemble(
        output: Arc<Mutex<AudioOutput>>,
        context: Arc<ContextCell>,
        anchor: Arc<AnchorCell>,
        transport: Arc<Transport>,
        graph: Arc<GraphManager>,
        midi: Arc<MidiScheduler>,
        automation: Arc<AutomationEngine>,
        registry: Arc<InstrumentRegistry>,
        fabric: Arc<MeteringFabric>,
        pdc: Arc<DelayCompensator>,
        guard: Arc<FeedbackGuard>,
        click: Arc<ClickSettings>,
        tracker: Arc<ErrorTracker>,
        clips: Arc<ClipStore>,
        project: Arc<Mutex<Arc<Project>>>,
        wiring: Arc<SchedulerWiring>,
        callback_state: CallbackState,
    ) -> Self {
        let probe = Arc::new(OutputProbe {
            output: Arc::clone(&output),
            graph: Arc::clone(&graph),
            state: callback_state.clone(),
        });
        let health = HealthMonitor::start(probe, Arc::clone(&tracker));

        let watcher_shutdown = Arc::new(AtomicFlag::new(false));
        let watcher = Self::spawn_guard_watcher(
            guard.trips(),
            Arc::downgrade(&transport),
            Arc::clone(&tracker),
            Arc::clone(&watcher_shutdown),
        );

        Self {
            output,
            context,
            anchor,
            transport,
            graph,
            midi,
            automation,
            registry,
            fabric,
            pdc,
            guard,
            click,
            health,
            tracker,
            clips,
            project,
            wiring,
            callback_state,
            watcher_shutdown,
            watcher: Mutex::new(Some(watcher)),
        }
    }

    /// The emergency-mute follow-up runs off the audio thread: the guard
    /// already zeroed the master gain; this stops the transport and files
    /// the critical report.
    fn spawn_guard_watcher(
        trips: Receiver<()>,
        transport: Weak<Transport>,
        tracker: Arc<ErrorTracker>,
        shutdown: Arc<AtomicFlag>,
    ) -> JoinHandle<()> {
        thread::Builder::new()
            .name("cadenza-guard".into())
            .spawn(move || loop {
                if shutdown.get() {
                    break;
                }
                match trips.recv_timeout(Duration::from_millis(200)) {
                    Ok(()) => {
                        if let Some(transport) = transport.upgrade() {
                            transport.stop();
                        }
                        tracker.critical(
                            Component::Output,
                            "feedback guard tripped: emergency mute engaged",
                        );
                    }
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .expect("spawn guard watcher thread")
    }

    pub(crate) fn wire_transport_callbacks(transport: &Transport, wiring: &Arc<SchedulerWiring>) {
        use cadenza_core::transport::TransportCallbacks;
        let on_play = Arc::clone(wiring);
        let on_stop = Arc::clone(wiring);
        let on_seek = Arc::clone(wiring);
        let on_jump = Arc::clone(wiring);
        let on_tempo = Arc::clone(wiring);
        transport.set_callbacks(TransportCallbacks {
            on_play: Some(Box::new(move |beat| on_play.on_play(beat))),
            on_stop: Some(Box::new(move |beat| on_stop.on_stop(beat))),
            on_seek: Some(Box::new(move |beat| on_seek.on_seek(beat))),
            on_cycle_jump: Some(Box::new(move |_from, to| on_jump.on_cycle_jump(to))),
            on_tempo_change: Some(Box::new(move |beat| on_tempo.on_tempo_change(beat))),
        });
    }

    // --- engine lifecycle ------------------------------------------------

    pub fn start(&self) -> Result<()> {
        self.output.lock().start(self.callback_state.clone())?;
        self.health.set_expected_running(true);
        self.health.note_running(true);
        Ok(())
    }

    pub fn shutdown(&self) {
        self.health.set_expected_running(false);
        self.output.lock().stop();
        self.health.note_running(false);
    }

    pub fn is_running(&self) -> bool {
        self.output.lock().is_running()
    }

    pub fn sample_rate(&self) -> f64 {
        self.output.lock().sample_rate()
    }

    /// Host-driven rendering for headless builds: pull one interleaved
    /// stereo buffer through the graph.
    pub fn render(&self, out: &mut [f32], frames: usize) {
        self.callback_state.process(out, frames);
    }

    /// Device route or rate change: republish the graph format, re-prime
    /// instruments, refresh PDC-sensitive state.
    pub fn handle_device_change(&self) -> Result<()> {
        let rate = {
            let mut output = self.output.lock();
            output.stop();
            output.prepare()?;
            output.sample_rate()
        };
        self.graph.device_format_changed(rate)?;
        self.transport.set_sample_rate(rate)?;
        self.registry.set_sample_rate(rate);
        self.midi.handle_sample_rate_change();
        self.fabric.reset_loudness();
        self.transport
            .cycle()
            .set_cooldown_for_buffer(NOMINAL_BUFFER_FRAMES, rate);
        self.output.lock().start(self.callback_state.clone())?;
        tracing::info!(rate, "device change handled");
        Ok(())
    }

    // --- transport control -----------------------------------------------

    /// Rejected while health is critical (fatal-graph).
    pub fn play(&self) {
        if self.health.is_critical() {
            self.tracker
                .error(Component::Transport, "play rejected: engine health critical");
            return;
        }
        self.transport.play();
    }

    pub fn pause(&self) {
        self.transport.pause();
    }

    pub fn stop(&self) {
        self.transport.stop();
    }

    pub fn record(&self) {
        if self.health.is_critical() {
            self.tracker
                .error(Component::Transport, "record rejected: engine health critical");
            return;
        }
        self.transport.record();
    }

    pub fn seek_beat(&self, beat: f64) -> Result<()> {
        self.transport.seek(beat)
    }

    pub fn set_cycle(&self, enabled: bool, start_beat: f64, end_beat: f64) -> Result<()> {
        self.transport.set_cycle(enabled, start_beat, end_beat)
    }

    pub fn toggle_cycle(&self) -> bool {
        self.transport.toggle_cycle()
    }

    pub fn set_tempo(&self, tempo_bpm: f64) -> Result<()> {
        self.transport.set_tempo(tempo_bpm)
    }

    pub fn metronome(&self) -> &Arc<ClickSettings> {
        &self.click
    }

    // --- mixer control ---------------------------------------------------

    pub fn set_volume(&self, track: TrackId, volume: f32) -> Result<()> {
        self.graph.set_volume(track, volume)
    }

    pub fn set_pan(&self, track: TrackId, pan: f32) -> Result<()> {
        self.graph.set_pan(track, pan)
    }

    pub fn set_mute(&self, track: TrackId, muted: bool) -> Result<()> {
        self.graph.set_mute(track, muted)
    }

    pub fn set_solo(&self, track: TrackId, solo: bool) -> Result<()> {
        self.graph.set_solo(track, solo)?;
        // MIDI contribution follows the same policy.
        self.refresh_midi_schedule();
        Ok(())
    }

    pub fn set_eq(&self, track: TrackId, low_db: f32, mid_db: f32, high_db: f32) -> Result<()> {
        self.graph.set_eq(track, low_db, mid_db, high_db)
    }

    pub fn set_record_enable(&self, track: TrackId, enabled: bool) -> Result<()> {
        self.graph.set_record_enable(track, enabled)
    }

    pub fn set_input_monitoring(&self, track: TrackId, enabled: bool) -> Result<()> {
        self.graph.set_input_monitoring(track, enabled)
    }

    pub fn set_bus_output_level(&self, bus: u64, level: f32) -> Result<()> {
        let graph = self.graph.graph_arc();
        let mut graph = graph.lock();
        graph
            .bus_mut(bus)
            .map(|b| b.set_output_level(level))
            .ok_or(EngineError::UnknownBus(bus))
    }

    pub fn set_master_volume(&self, volume: f32) {
        self.graph.set_master_volume(volume);
    }

    pub fn set_master_eq(&self, low_db: f32, mid_db: f32, high_db: f32) {
        self.graph.set_master_eq(low_db, mid_db, high_db);
    }

    // --- graph control ---------------------------------------------------

    pub fn insert_plugin(
        &self,
        track: TrackId,
        slot: usize,
        descriptor: &PluginDescriptor,
        sandboxed: bool,
    ) -> Result<PluginId> {
        self.graph
            .insert_plugin(track, slot, descriptor, sandboxed, None)
    }

    pub fn remove_plugin(&self, track: TrackId, plugin: PluginId) -> Result<()> {
        self.graph.remove_plugin(track, plugin)
    }

    pub fn move_plugin(&self, track: TrackId, plugin: PluginId, to_slot: usize) -> Result<()> {
        self.graph.move_plugin(track, plugin, to_slot)
    }

    pub fn set_bypass(&self, track: TrackId, plugin: PluginId, bypassed: bool) -> Result<()> {
        self.graph.set_bypass(track, plugin, bypassed)
    }

    pub fn set_sidechain_source(
        &self,
        track: TrackId,
        plugin: PluginId,
        source: Option<TrackId>,
    ) -> Result<()> {
        self.graph.set_sidechain_source(track, plugin, source)
    }

    // --- project and content ---------------------------------------------

    pub fn load_clip(&self, file_id: u64, clip: Arc<AudioClip>) {
        self.clips.insert(file_id, clip);
    }

    pub fn register_instrument(&self, track: TrackId, instrument: Box<dyn Instrument>) -> Result<()> {
        let cell = self.registry.register(track, instrument);
        self.graph.set_track_instrument(track, cell)
    }

    /// Apply a new immutable project snapshot: diff against the current
    /// one and translate the minimum mutation set into graph operations
    /// under a single batch window.
    pub fn apply_project(&self, new: Project) -> Result<()> {
        new.validate()?;
        let old = Arc::clone(&*self.project.lock());
        let changes = project::diff(&old, &new);

        let mut tempo_change = None;
        let mut cycle_change = None;
        let mut regions_dirty = false;

        self.graph.batch(|graph| -> Result<()> {
            // Buses first so sends have valid endpoints.
            for bus in &new.buses {
                if old.buses.iter().all(|b| b.id != bus.id) {
                    graph.add_bus(bus)?;
                }
            }

            for change in &changes {
                match change {
                    ProjectChange::TrackAdded(track) => {
                        graph.add_track(track)?;
                        self.install_plugins(graph, track.id, &track.plugins);
                        regions_dirty = true;
                    }
                    ProjectChange::TrackRemoved(id) => {
                        graph.remove_track(*id)?;
                        self.registry.unregister(*id);
                        regions_dirty = true;
                    }
                    ProjectChange::RegionAdded { .. }
                    | ProjectChange::RegionRemoved { .. }
                    | ProjectChange::RegionMoved { .. } => regions_dirty = true,
                    ProjectChange::MixerChanged { track, mixer } => {
                        graph.set_volume(*track, mixer.volume)?;
                        graph.set_pan(*track, mixer.pan)?;
                        graph.set_eq(*track, mixer.eq_low_db, mixer.eq_mid_db, mixer.eq_high_db)?;
                        graph.set_mute(*track, mixer.muted)?;
                        graph.set_solo(*track, mixer.solo)?;
                        graph.set_record_enable(*track, mixer.record_enabled)?;
                        graph.set_input_monitoring(*track, mixer.input_monitoring)?;
                    }
                    ProjectChange::PluginsChanged { track } => {
                        graph.clear_plugins(*track)?;
                        if let Some(track_data) = new.track(*track) {
                            self.install_plugins(graph, *track, &track_data.plugins);
                        }
                    }
                    ProjectChange::SendsChanged { track } => {
                        if let Some(before) = old.track(*track) {
                            for bus in before.sends.keys() {
                                let _ = graph.set_send(*track, *bus, None);
                            }
                        }
                        if let Some(after) = new.track(*track) {
                            for (&bus, &level) in &after.sends {
                                graph.set_send(*track, bus, Some(level))?;
                            }
                        }
                    }
                    ProjectChange::MidiChanged { .. }
                    | ProjectChange::AutomationChanged { .. } => {}
                    ProjectChange::TempoChanged(tempo) => tempo_change = Some(*tempo),
                    ProjectChange::CycleChanged(cycle) => cycle_change = Some(*cycle),
                }
            }

            // Buses dropped from the project go last, once sends are gone.
            for bus in &old.buses {
                if new.buses.iter().all(|b| b.id != bus.id) {
                    if let Err(e) = graph.remove_bus(bus.id) {
                        self.tracker
                            .warn(Component::Graph, format!("bus {} kept: {e}", bus.id));
                    }
                }
            }
            Ok(())
        })?;

        if let Some(tempo) = tempo_change {
            self.transport.set_tempo(tempo)?;
        }
        if let Some(cycle) = cycle_change {
            self.transport
                .set_cycle(cycle.enabled, cycle.start_beat, cycle.end_beat)?;
        }

        let new = Arc::new(new);
        *self.project.lock() = Arc::clone(&new);
        self.midi.set_project(&new);
        let graph = Arc::clone(&self.graph);
        self.automation.set_project(&new, move |track| {
            graph
                .track_handle(track)
                .map(|h| h as Arc<dyn AutomationTarget>)
        });

        // Re-prime running playback from the current beat.
        if self.transport.is_playing() && regions_dirty {
            let beat = self.transport.current_beat();
            self.wiring.restart_audio(beat);
            self.midi.handle_seek(beat);
        }

        tracing::info!(changes = changes.len(), "project snapshot applied");
        Ok(())
    }

    fn install_plugins(
        &self,
        graph: &GraphManager,
        track: TrackId,
        configs: &[cadenza_core::project::PluginConfig],
    ) {
        for (slot, config) in configs.iter().enumerate() {
            match graph.insert_plugin(
                track,
                slot,
                &config.descriptor,
                false,
                config.state.clone(),
            ) {
                Ok(id) => {
                    if config.bypassed {
                        let _ = graph.set_bypass(track, id, true);
                    }
                    if config.sidechain_source.is_some() {
                        let _ = graph.set_sidechain_source(track, id, config.sidechain_source);
                    }
                }
                // Per-plugin isolation: the rest of the project loads.
                Err(e) => self.tracker.error(
                    Component::PluginHost,
                    format!("plugin '{}' skipped: {e}", config.descriptor.name),
                ),
            }
        }
    }

    /// Rebuild the MIDI event list from the current snapshot (solo/mute
    /// changes move tracks in and out of the schedule).
    fn refresh_midi_schedule(&self) {
        let mut project = (**self.project.lock()).clone();
        // Solo/mute flags live on the handles once the project is applied;
        // fold them back in before rebuilding the schedule.
        for track in &mut project.tracks {
            if let Some(handle) = self.graph.track_handle(track.id) {
                track.mixer.muted = handle.muted.get();
                track.mixer.solo = handle.solo.get();
            }
        }
        self.midi.set_project(&project);
    }

    // --- observation -----------------------------------------------------

    pub fn beat_position(&self) -> f64 {
        self.transport.current_beat()
    }

    pub fn is_playing(&self) -> bool {
        self.transport.is_playing()
    }

    pub fn transport_state(&self) -> TransportState {
        self.transport.state()
    }

    pub fn subscribe_transport(&self) -> Receiver<TransportUpdate> {
        self.transport.subscribe()
    }

    pub fn track_levels(&self, track: TrackId) -> Option<Levels> {
        self.fabric.levels(NodeKey::Track(track))
    }

    pub fn bus_levels(&self, bus: u64) -> Option<Levels> {
        self.fabric.levels(NodeKey::Bus(bus))
    }

    pub fn master_levels(&self) -> Option<Levels> {
        self.fabric.levels(NodeKey::Master)
    }

    pub fn loudness(&self) -> LoudnessSnapshot {
        self.fabric.loudness()
    }

    pub fn reset_integrated_loudness(&self) {
        self.fabric.reset_loudness();
    }

    pub fn cpu_load(&self) -> CpuLoad {
        self.fabric.cpu().load()
    }

    pub fn health_status(&self) -> HealthStatus {
        self.health.status()
    }

    pub fn diagnostic_report(&self) -> String {
        self.tracker.diagnostic()
    }

    pub fn feedback_muted(&self) -> bool {
        self.guard.is_tripped()
    }

    /// Explicit reset after an emergency mute. Restores the prior master
    /// gain; the transport stays stopped.
    pub fn reset_feedback_mute(&self) -> bool {
        self.graph.reset_feedback_guard()
    }

    pub fn graph_generation(&self) -> u64 {
        self.graph.generation()
    }

    pub fn pdc_max_latency(&self) -> usize {
        self.pdc.max_latency()
    }

    pub fn error_tracker(&self) -> &Arc<ErrorTracker> {
        &self.tracker
    }

    pub fn current_project(&self) -> Arc<Project> {
        Arc::clone(&*self.project.lock())
    }

    pub fn context(&self) -> Arc<cadenza_core::SchedulingContext> {
        self.context.load()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.watcher_shutdown.set(true);
        if let Some(handle) = self.watcher.lock().take() {
            let _ = handle.join();
        }
    }
}
