//! The 500 Hz lookahead MIDI scheduler.
//!
//! A dedicated high-priority timer reads the transport anchor lock-free,
//! selects events inside the lookahead window and hands them to the
//! instrument registry with sample-accurate future offsets. Nothing in the
//! tick allocates; the dispatch buffer is pre-allocated and reused.

use crate::event::{expand_region, MidiMessage, ScheduledMidiEvent};
use crate::registry::InstrumentRegistry;
use cadenza_core::anchor::AnchorCell;
use cadenza_core::context::ContextCell;
use cadenza_core::lockfree::{AtomicDouble, AtomicFlag};
use cadenza_core::pdc::DelayCompensator;
use cadenza_core::project::{Project, TrackId};
use cadenza_core::transport::CycleRegion;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Timer period (~500 Hz).
const TICK_PERIOD: Duration = Duration::from_micros(2_000);

/// Pre-allocated dispatch slots; one tick rarely selects more than this.
const DISPATCH_CAPACITY: usize = 128;

#[derive(Debug, Clone, Copy)]
pub struct MidiSchedulerConfig {
    /// Scheduling horizon. Generous by default so events survive CPU load.
    pub lookahead: Duration,
    /// Hard floor for the horizon.
    pub lookahead_floor: Duration,
    /// Events further than this in the past are dropped, not fired.
    pub late_tolerance: Duration,
}

impl Default for MidiSchedulerConfig {
    fn default() -> Self {
        Self {
            lookahead: Duration::from_millis(150),
            lookahead_floor: Duration::from_millis(50),
            late_tolerance: Duration::from_millis(10),
        }
    }
}

/// Event list plus scheduling cursor state, guarded by one short lock.
struct EventList {
    events: Vec<ScheduledMidiEvent>,
    /// `stamps[i] == pass` marks event i as already scheduled in the
    /// current pass; bumping `pass` clears the whole set at once.
    stamps: Vec<u64>,
    pass: u64,
    cursor: usize,
    /// pitch -> owning track for every sounding note.
    active_notes: [Option<TrackId>; 128],
}

impl EventList {
    fn new() -> Self {
        Self {
            events: Vec::new(),
            stamps: Vec::new(),
            pass: 1,
            cursor: 0,
            active_notes: [None; 128],
        }
    }

    fn clear_scheduled(&mut self) {
        self.pass += 1;
    }

    fn cursor_to(&mut self, beat: f64) {
        self.cursor = self.events.partition_point(|e| e.beat < beat);
    }
}

struct Shared {
    list: Mutex<EventList>,
    dispatch_buf: Mutex<SmallVec<[(ScheduledMidiEvent, u64); DISPATCH_CAPACITY]>>,
    anchor: Arc<AnchorCell>,
    context: Arc<ContextCell>,
    beat_position: Arc<AtomicDouble>,
    playing: Arc<AtomicFlag>,
    graph_ready: Arc<AtomicFlag>,
    registry: Arc<InstrumentRegistry>,
    pdc: Arc<DelayCompensator>,
    cycle: Arc<CycleRegion>,
    config: MidiSchedulerConfig,
    shutdown: AtomicFlag,
}

/// Process-wide MIDI scheduler.
pub struct MidiScheduler {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl MidiScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        anchor: Arc<AnchorCell>,
        context: Arc<ContextCell>,
        beat_position: Arc<AtomicDouble>,
        playing: Arc<AtomicFlag>,
        graph_ready: Arc<AtomicFlag>,
        registry: Arc<InstrumentRegistry>,
        pdc: Arc<DelayCompensator>,
        cycle: Arc<CycleRegion>,
        config: MidiSchedulerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(Shared {
                list: Mutex::new(EventList::new()),
                dispatch_buf: Mutex::new(SmallVec::new()),
                anchor,
                context,
                beat_position,
                playing,
                graph_ready,
                registry,
                pdc,
                cycle,
                config,
                shutdown: AtomicFlag::new(false),
            }),
            handle: Mutex::new(None),
        })
    }

    /// Spawn the 500 Hz timer thread. Idempotent.
    pub fn start(&self) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        *handle = Some(
            thread::Builder::new()
                .name("cadenza-midi".into())
                .spawn(move || {
                    let _ = thread_priority::set_current_thread_priority(
                        thread_priority::ThreadPriority::Max,
                    );
                    loop {
                        let Some(shared) = weak.upgrade() else {
                            break;
                        };
                        if shared.shutdown.get() {
                            break;
                        }
                        Self::process(&shared, Instant::now());
                        drop(shared);
                        thread::sleep(TICK_PERIOD);
                    }
                })
                .expect("spawn midi scheduler thread"),
        );
    }

    /// Rebuild the event list from a project snapshot. Solo policy: when
    /// any track is soloed only soloed tracks contribute; muted regions
    /// never contribute. Runs on the control thread (allocation is fine
    /// here).
    pub fn set_project(&self, project: &Project) {
        let audible = project.audible_tracks();
        let mut events = Vec::new();
        for track in &project.tracks {
            if !audible.contains(&track.id) {
                continue;
            }
            for region in &track.midi_regions {
                if region.muted {
                    continue;
                }
                expand_region(region, track.id, &mut events);
            }
        }
        // Stable sort keeps load order for equal beats.
        events.sort_by(|a, b| a.beat.partial_cmp(&b.beat).unwrap_or(std::cmp::Ordering::Equal));

        let mut list = self.shared.list.lock();
        list.stamps = vec![0; events.len()];
        list.events = events;
        list.pass = 1;
        list.cursor = 0;
        if self.shared.playing.get() {
            let beat = self.shared.beat_position.get();
            list.cursor_to(beat);
        }
        tracing::debug!(events = list.events.len(), "midi schedule rebuilt");
    }

    /// One scheduling pass; also the test entry point.
    pub fn process_window(&self, now: Instant) {
        Self::process(&self.shared, now);
    }

    fn process(shared: &Shared, now: Instant) {
        if !shared.playing.get() || !shared.graph_ready.get() {
            return;
        }

        // Read the anchor lock-free; self-heal staleness before any
        // beat -> sample-offset math.
        let mut anchor = shared.anchor.get();
        if anchor.is_stale_at(now) {
            anchor = shared
                .anchor
                .rebase(shared.beat_position.get(), shared.context.load());
            tracing::debug!("midi scheduler regenerated stale anchor");
        }
        let context = anchor.context().clone();
        let beats_per_second = context.beats_per_second();

        let lookahead = shared.config.lookahead.max(shared.config.lookahead_floor);
        let lookahead_beats = lookahead.as_secs_f64() * beats_per_second;
        let late_beats = shared.config.late_tolerance.as_secs_f64() * beats_per_second;

        let current_beat = anchor.beat_at(now);
        let mut target_beat = current_beat + lookahead_beats;

        // The lookahead never reaches across an enabled cycle boundary:
        // events at or past the end wait for the jump to re-prime them at
        // the cycle start.
        if let Some((_, cycle_end)) = shared.cycle.range() {
            if current_beat < cycle_end && target_beat >= cycle_end {
                target_beat = cycle_end - 1e-9;
            }
        }

        let mut buf = shared.dispatch_buf.lock();
        buf.clear();
        {
            let mut list = shared.list.lock();
            let list = &mut *list;
            let pass = list.pass;

            let mut i = list.cursor;
            while i < list.events.len() && list.events[i].beat <= target_beat {
                if list.stamps[i] != pass {
                    // A full buffer leaves the rest unstamped for the next
                    // tick (2 ms away) instead of dropping them.
                    if buf.len() == DISPATCH_CAPACITY {
                        break;
                    }
                    list.stamps[i] = pass;
                    let event = list.events[i];
                    if event.beat >= current_beat - late_beats {
                        buf.push((event, anchor.sample_offset_for(event.beat, now)));
                        let pitch = event.message.data1 as usize;
                        if event.message.is_note_on() {
                            list.active_notes[pitch] = Some(event.track);
                        } else if event.message.is_note_off() {
                            list.active_notes[pitch] = None;
                        }
                    }
                }
                i += 1;
            }
            while list.cursor < list.events.len() && list.stamps[list.cursor] == pass {
                list.cursor += 1;
            }
        }

        // Dispatch outside the list lock; PDC keeps MIDI phase-aligned with
        // delay-compensated audio.
        for (event, offset) in buf.iter() {
            let compensated = offset + shared.pdc.compensation_for(event.track) as u64;
            shared.registry.route(event.track, event.message, compensated);
        }
    }

    /// Release every sounding note; optionally chase with an all-notes-off
    /// controller for host-side queues.
    fn flush_active_notes(shared: &Shared, with_all_notes_off: bool) {
        let mut list = shared.list.lock();
        let mut notes: SmallVec<[(u8, TrackId); 32]> = SmallVec::new();
        for (pitch, slot) in list.active_notes.iter_mut().enumerate() {
            if let Some(track) = slot.take() {
                notes.push((pitch as u8, track));
            }
        }
        drop(list);

        for (pitch, track) in notes {
            shared.registry.route(track, MidiMessage::note_off(pitch), 0);
        }
        if with_all_notes_off {
            shared.registry.broadcast(MidiMessage::all_notes_off());
        }
    }

    /// Transport stopped: silence everything and rewind the cursor.
    pub fn handle_stop(&self) {
        Self::flush_active_notes(&self.shared, true);
        let mut list = self.shared.list.lock();
        list.clear_scheduled();
        list.cursor = 0;
    }

    /// Seek: flush notes, clear the scheduled set, continue from the first
    /// event at or after the target and refill the window immediately.
    pub fn handle_seek(&self, beat: f64) {
        Self::flush_active_notes(&self.shared, false);
        {
            let mut list = self.shared.list.lock();
            list.clear_scheduled();
            list.cursor_to(beat);
        }
        self.process_window(Instant::now());
    }

    /// Tempo change: previously scheduled events in host queues carry wrong
    /// sample times, so notes are released with an all-notes-off before the
    /// window is rebuilt at the new tempo.
    pub fn handle_tempo_change(&self, beat: f64) {
        Self::flush_active_notes(&self.shared, true);
        {
            let mut list = self.shared.list.lock();
            list.clear_scheduled();
            list.cursor_to(beat);
        }
        self.process_window(Instant::now());
    }

    /// Sample-rate change: the transport already rewrote the anchor; the
    /// schedule itself is beat-based and unaffected.
    pub fn handle_sample_rate_change(&self) {}

    /// Cycle jump: a seek back to the cycle start plus an all-notes-off.
    pub fn handle_cycle_jump(&self, target: f64) {
        Self::flush_active_notes(&self.shared, true);
        {
            let mut list = self.shared.list.lock();
            list.clear_scheduled();
            list.cursor_to(target);
        }
        self.process_window(Instant::now());
    }

    pub fn active_note_count(&self) -> usize {
        self.shared
            .list
            .lock()
            .active_notes
            .iter()
            .filter(|n| n.is_some())
            .count()
    }
}

impl Drop for MidiScheduler {
    fn drop(&mut self) {
        self.shared.shutdown.set(true);
        if let Some(handle) = self.handle.lock().take() {
            drop(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Instrument;
    use cadenza_core::anchor::TimingAnchor;
    use cadenza_core::context::{SchedulingContext, TimeSignature};
    use cadenza_core::project::{MidiNote, MidiRegion, Track, TrackKind};

    struct Recorder {
        events: Arc<Mutex<Vec<(MidiMessage, u64)>>>,
    }

    impl Instrument for Recorder {
        fn handle_event(&mut self, message: MidiMessage, sample_offset: u64) {
            self.events.lock().push((message, sample_offset));
        }

        fn supports_sample_scheduling(&self) -> bool {
            true
        }

        fn render(&mut self, _out: &mut [f32], _frames: usize) {}
        fn all_notes_off(&mut self) {}
        fn set_sample_rate(&mut self, _sample_rate: f64) {}
    }

    struct Rig {
        scheduler: Arc<MidiScheduler>,
        anchor: Arc<AnchorCell>,
        context: Arc<ContextCell>,
        playing: Arc<AtomicFlag>,
        pdc: Arc<DelayCompensator>,
        cycle: Arc<CycleRegion>,
        events: Arc<Mutex<Vec<(MidiMessage, u64)>>>,
    }

    fn rig(tempo: f64) -> Rig {
        let context = Arc::new(ContextCell::new(
            SchedulingContext::new(48_000.0, tempo, TimeSignature::default()).unwrap(),
        ));
        let anchor = Arc::new(AnchorCell::new(TimingAnchor::new(0.0, context.load())));
        let beat_position = Arc::new(AtomicDouble::new(0.0));
        let playing = Arc::new(AtomicFlag::new(true));
        let ready = Arc::new(AtomicFlag::new(true));
        let registry = Arc::new(InstrumentRegistry::new());
        let pdc = Arc::new(DelayCompensator::new());
        let cycle = Arc::new(CycleRegion::new());

        let events = Arc::new(Mutex::new(Vec::new()));
        registry.register(
            1,
            Box::new(Recorder {
                events: Arc::clone(&events),
            }),
        );

        let scheduler = MidiScheduler::new(
            Arc::clone(&anchor),
            Arc::clone(&context),
            beat_position,
            Arc::clone(&playing),
            ready,
            registry,
            Arc::clone(&pdc),
            Arc::clone(&cycle),
            MidiSchedulerConfig::default(),
        );
        Rig {
            scheduler,
            anchor,
            context,
            playing,
            pdc,
            cycle,
            events,
        }
    }

    fn project_with_notes(tempo: f64, beats: &[f64]) -> Project {
        let mut project = Project::empty(tempo, 48_000.0);
        let mut track = Track::new(1, "keys", TrackKind::Midi);
        track.midi_regions.push(MidiRegion {
            start_beat: 0.0,
            duration_beats: 16.0,
            loop_count: 1,
            muted: false,
            notes: beats
                .iter()
                .map(|&b| MidiNote {
                    start_beat: b,
                    duration_beats: 0.5,
                    pitch: 60,
                    velocity: 100,
                })
                .collect(),
            cc_events: Vec::new(),
            pitch_bend_events: Vec::new(),
        });
        project.tracks.push(track);
        project
    }

    /// Note-ons recorded so far, as (pitch, sample_offset).
    fn note_ons(events: &Arc<Mutex<Vec<(MidiMessage, u64)>>>) -> Vec<(u8, u64)> {
        events
            .lock()
            .iter()
            .filter(|(m, _)| m.is_note_on())
            .map(|(m, o)| (m.data1, *o))
            .collect()
    }

    #[test]
    fn dispatches_window_with_future_offsets() {
        let r = rig(120.0);
        r.scheduler.set_project(&project_with_notes(120.0, &[0.1, 0.2, 10.0]));

        // Anchor beat 0 at `now`; lookahead 150 ms = 0.3 beats at 120 bpm.
        let now = Instant::now();
        r.anchor.set(TimingAnchor::at(now, 0.0, r.context.load()));
        r.scheduler.process_window(now);

        let ons = note_ons(&r.events);
        assert_eq!(ons.len(), 2, "only events inside the window fire");
        // Beat 0.1 at 120 bpm is 50 ms = 2400 samples.
        assert!((ons[0].1 as i64 - 2_400).unsigned_abs() < 100, "offset {}", ons[0].1);
        assert!((ons[1].1 as i64 - 4_800).unsigned_abs() < 100, "offset {}", ons[1].1);
    }

    #[test]
    fn events_fire_once_across_ticks() {
        let r = rig(120.0);
        r.scheduler.set_project(&project_with_notes(120.0, &[0.1]));

        let now = Instant::now();
        r.anchor.set(TimingAnchor::at(now, 0.0, r.context.load()));
        r.scheduler.process_window(now);
        r.scheduler.process_window(now + Duration::from_millis(2));
        r.scheduler.process_window(now + Duration::from_millis(4));

        assert_eq!(note_ons(&r.events).len(), 1);
    }

    #[test]
    fn seek_skips_events_before_target() {
        let r = rig(120.0);
        r.scheduler.set_project(&project_with_notes(120.0, &[1.0, 2.0, 6.0]));

        // Playhead re-anchored at beat 6 by the transport, then the seek
        // handler runs.
        r.anchor.rebase(6.0, r.context.load());
        r.scheduler.handle_seek(6.0);

        let ons = note_ons(&r.events);
        assert_eq!(ons.len(), 1, "notes before the seek target must not fire");
        // The beat-6 note sits on the playhead: immediate dispatch.
        assert!(ons[0].1 < 2_400);
    }

    #[test]
    fn stop_releases_active_notes_and_rewinds() {
        let r = rig(120.0);
        // A note whose off lies far outside the lookahead stays active.
        let mut project = project_with_notes(120.0, &[]);
        project.tracks[0].midi_regions[0].notes.push(MidiNote {
            start_beat: 0.05,
            duration_beats: 8.0,
            pitch: 72,
            velocity: 90,
        });
        r.scheduler.set_project(&project);

        let now = Instant::now();
        r.anchor.set(TimingAnchor::at(now, 0.0, r.context.load()));
        r.scheduler.process_window(now);
        assert_eq!(r.scheduler.active_note_count(), 1);

        r.playing.set(false);
        r.scheduler.handle_stop();
        assert_eq!(r.scheduler.active_note_count(), 0);

        let recorded = r.events.lock();
        assert!(recorded.iter().any(|(m, _)| m.is_note_off() && m.data1 == 72));
        assert!(recorded
            .iter()
            .any(|(m, _)| m.data1 == crate::event::CC_ALL_NOTES_OFF));
    }

    #[test]
    fn tempo_change_reprocesses_at_new_rate() {
        let r = rig(120.0);
        r.scheduler.set_project(&project_with_notes(120.0, &[2.05]));

        // Playing at beat 2 when the tempo becomes 140.
        let context = r.context.set_tempo(140.0).unwrap();
        let now = Instant::now();
        r.anchor.set(TimingAnchor::at(now, 2.0, context));
        r.scheduler.handle_tempo_change(2.0);

        let recorded = r.events.lock();
        // All-notes-off went out even with nothing sounding.
        assert!(recorded
            .iter()
            .any(|(m, _)| m.data1 == crate::event::CC_ALL_NOTES_OFF));
        // The upcoming note was rescheduled at the 140 bpm rate:
        // 0.05 beats ahead = 0.05*60/140 s = ~1029 samples at 48 kHz.
        let ons: Vec<(u8, u64)> = recorded
            .iter()
            .filter(|(m, _)| m.is_note_on())
            .map(|(m, o)| (m.data1, *o))
            .collect();
        assert_eq!(ons.len(), 1);
        assert!((ons[0].1 as i64 - 1_029).unsigned_abs() < 150, "offset {}", ons[0].1);
    }

    #[test]
    fn late_events_are_dropped_not_fired() {
        let r = rig(120.0);
        r.scheduler.set_project(&project_with_notes(120.0, &[0.0]));

        // Anchor placed so beat 0 is already 100 ms in the past.
        let now = Instant::now();
        r.anchor
            .set(TimingAnchor::at(now - Duration::from_millis(100), 0.0, r.context.load()));
        r.scheduler.process_window(now);

        assert!(note_ons(&r.events).is_empty());
    }

    #[test]
    fn muted_and_soloed_out_tracks_do_not_contribute() {
        let r = rig(120.0);
        let mut project = project_with_notes(120.0, &[0.1]);
        // A second, soloed track steals the schedule.
        let mut solo_track = Track::new(2, "lead", TrackKind::Midi);
        solo_track.mixer.solo = true;
        solo_track.midi_regions.push(MidiRegion {
            start_beat: 0.0,
            duration_beats: 4.0,
            loop_count: 1,
            muted: false,
            notes: vec![MidiNote {
                start_beat: 0.1,
                duration_beats: 0.5,
                pitch: 65,
                velocity: 100,
            }],
            cc_events: Vec::new(),
            pitch_bend_events: Vec::new(),
        });
        project.tracks.push(solo_track);
        r.scheduler.set_project(&project);

        let now = Instant::now();
        r.anchor.set(TimingAnchor::at(now, 0.0, r.context.load()));
        r.scheduler.process_window(now);

        // Track 1 has no instrument events: it was soloed out.
        assert!(note_ons(&r.events).is_empty());
    }

    #[test]
    fn pdc_offsets_midi_like_audio() {
        let r = rig(120.0);
        r.pdc.set_track_latency(1, 0).unwrap();
        r.pdc.set_track_latency(9, 2_048).unwrap();
        r.scheduler.set_project(&project_with_notes(120.0, &[0.1]));

        let now = Instant::now();
        r.anchor.set(TimingAnchor::at(now, 0.0, r.context.load()));
        r.scheduler.process_window(now);

        let ons = note_ons(&r.events);
        // Track 1 is compensated by max - own = 2048 samples on top of the
        // musical offset (2400).
        assert!((ons[0].1 as i64 - 4_448).unsigned_abs() < 100, "offset {}", ons[0].1);
    }

    #[test]
    fn lookahead_stops_at_the_cycle_boundary() {
        let r = rig(120.0);
        // Notes just inside and exactly on the cycle end.
        r.scheduler.set_project(&project_with_notes(120.0, &[5.9, 6.0]));
        r.cycle.set(2.0, 6.0, &r.context.load()).unwrap();
        r.cycle.set_enabled(true);

        let now = Instant::now();
        r.anchor.set(TimingAnchor::at(now, 5.85, r.context.load()));
        r.scheduler.process_window(now);

        let ons = note_ons(&r.events);
        assert_eq!(ons.len(), 1, "only the pre-boundary note may fire");
        assert_eq!(ons[0].0, 60);

        // After the jump the window re-opens from the cycle start.
        r.anchor.rebase(2.0, r.context.load());
        r.scheduler.handle_cycle_jump(2.0);
        // Nothing new: the region has no events near beat 2, but the
        // boundary note was never emitted.
        let ons = note_ons(&r.events);
        assert_eq!(ons.len(), 1);
    }

    #[test]
    fn paused_scheduler_is_inert() {
        let r = rig(120.0);
        r.scheduler.set_project(&project_with_notes(120.0, &[0.05]));
        r.playing.set(false);
        r.scheduler.process_window(Instant::now());
        assert!(r.events.lock().is_empty());
    }
}
