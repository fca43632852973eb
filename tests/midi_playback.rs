//! End-to-end MIDI scheduling through the engine: dispatch order, seek
//! semantics, tempo-change flush.

use cadenza::{
    Engine, Instrument, MidiMessage, MidiNote, MidiRegion, Project, Track, TrackKind,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Clone)]
struct Recorder {
    events: Arc<Mutex<Vec<(MidiMessage, u64, Instant)>>>,
}

impl Recorder {
    fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn note_ons(&self) -> Vec<(u8, u64, Instant)> {
        self.events
            .lock()
            .iter()
            .filter(|(m, _, _)| m.is_note_on())
            .map(|(m, o, t)| (m.data1, *o, *t))
            .collect()
    }

    fn saw_all_notes_off(&self) -> bool {
        self.events
            .lock()
            .iter()
            .any(|(m, _, _)| m.data1 == cadenza::midi::CC_ALL_NOTES_OFF)
    }
}

impl Instrument for Recorder {
    fn handle_event(&mut self, message: MidiMessage, sample_offset: u64) {
        self.events
            .lock()
            .push((message, sample_offset, Instant::now()));
    }

    fn supports_sample_scheduling(&self) -> bool {
        true
    }

    fn render(&mut self, _out: &mut [f32], _frames: usize) {}
    fn all_notes_off(&mut self) {}
    fn set_sample_rate(&mut self, _sample_rate: f64) {}
}

fn midi_project(note_beats: &[f64]) -> Project {
    let mut project = Project::empty(120.0, 48_000.0);
    let mut track = Track::new(1, "keys", TrackKind::Midi);
    track.midi_regions.push(MidiRegion {
        start_beat: 0.0,
        duration_beats: 64.0,
        loop_count: 1,
        muted: false,
        notes: note_beats
            .iter()
            .enumerate()
            .map(|(i, &beat)| MidiNote {
                start_beat: beat,
                duration_beats: 0.5,
                pitch: 60 + i as u8,
                velocity: 100,
            })
            .collect(),
        cc_events: Vec::new(),
        pitch_bend_events: Vec::new(),
    });
    project.tracks.push(track);
    project
}

fn engine_with_recorder(project: Project) -> (Engine, Recorder) {
    let engine = Engine::builder()
        .headless(48_000.0)
        .tempo(120.0)
        .build()
        .unwrap();
    engine.apply_project(project).unwrap();
    let recorder = Recorder::new();
    engine
        .register_instrument(1, Box::new(recorder.clone()))
        .unwrap();
    (engine, recorder)
}

#[test]
fn notes_dispatch_in_order_with_future_offsets() {
    // Notes at beats 0.25 and 0.5 (125 ms and 250 ms at 120 bpm).
    let (engine, recorder) = engine_with_recorder(midi_project(&[0.25, 0.5]));

    engine.play();
    std::thread::sleep(Duration::from_millis(400));
    engine.stop();

    let ons = recorder.note_ons();
    assert_eq!(ons.len(), 2, "both notes dispatch exactly once");
    assert_eq!(ons[0].0, 60);
    assert_eq!(ons[1].0, 61);
    // Offsets are future sample times within the 150 ms lookahead.
    assert!(ons[0].1 < 48_000 / 4, "offset too large: {}", ons[0].1);
    assert!(ons[1].1 < 48_000 / 2);
}

#[test]
fn no_note_before_seek_target_fires() {
    let (engine, recorder) = engine_with_recorder(midi_project(&[1.0, 2.0, 16.0]));

    engine.play();
    engine.seek_beat(16.0).unwrap();
    std::thread::sleep(Duration::from_millis(250));
    engine.stop();

    let ons = recorder.note_ons();
    // Only the note at the seek target fires; earlier beats are skipped.
    assert_eq!(ons.len(), 1, "expected only the beat-16 note, got {ons:?}");
    assert_eq!(ons[0].0, 62);
}

#[test]
fn tempo_change_emits_all_notes_off_and_reschedules() {
    let (engine, recorder) = engine_with_recorder(midi_project(&[8.0]));

    engine.play();
    std::thread::sleep(Duration::from_millis(100));
    engine.set_tempo(240.0).unwrap();
    std::thread::sleep(Duration::from_millis(100));
    engine.stop();

    assert!(
        recorder.saw_all_notes_off(),
        "tempo change must clear host queues"
    );
}

#[test]
fn stop_emits_note_offs_for_sounding_notes() {
    // One long note that starts immediately and holds.
    let (engine, recorder) = engine_with_recorder(midi_project(&[0.05]));

    engine.play();
    std::thread::sleep(Duration::from_millis(150));
    engine.stop();

    let events = recorder.events.lock();
    let on_count = events.iter().filter(|(m, _, _)| m.is_note_on()).count();
    let off_count = events.iter().filter(|(m, _, _)| m.is_note_off()).count();
    assert_eq!(on_count, 1);
    assert!(off_count >= 1, "stop must release the sounding note");
    assert!(recorder.saw_all_notes_off());
}

#[test]
fn muted_region_contributes_nothing() {
    let mut project = midi_project(&[0.1, 0.2]);
    project.tracks[0].midi_regions[0].muted = true;
    let (engine, recorder) = engine_with_recorder(project);

    engine.play();
    std::thread::sleep(Duration::from_millis(250));
    engine.stop();

    assert!(recorder.note_ons().is_empty());
}
