//! Musical-time transport: playhead ownership, state machine, cycle jumps
//! and the 60 Hz position timer.

mod cycle;
mod state;

pub use cycle::{CycleRegion, CYCLE_EPSILON};
pub use state::TransportState;

use crate::anchor::AnchorCell;
use crate::context::ContextCell;
use crate::error::{Component, EngineError, ErrorTracker, Result};
use crate::lockfree::{AtomicDouble, AtomicFlag};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Position timer period (~60 Hz).
const TIMER_PERIOD: Duration = Duration::from_micros(16_667);

/// Per-subscriber update queue depth; slow consumers skip frames instead of
/// blocking the timer.
const SUBSCRIBER_QUEUE: usize = 64;

/// Snapshot broadcast to observers on every timer tick and transition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransportUpdate {
    pub beat: f64,
    pub state: TransportState,
    /// Jump generation; an observer holding an older value knows its
    /// in-flight update is stale.
    pub generation: u64,
}

type BeatCallback = Box<dyn Fn(f64) + Send + Sync>;
type CycleJumpCallback = Box<dyn Fn(f64, f64) + Send + Sync>;

/// Scheduling hooks invoked on transitions. Wired once by the engine
/// façade; none of them may block.
#[derive(Default)]
pub struct TransportCallbacks {
    /// Playback (re)starts at the given beat.
    pub on_play: Option<BeatCallback>,
    /// Playback stopped; argument is the exact stop beat.
    pub on_stop: Option<BeatCallback>,
    /// Seek while rolling; schedulers flush and re-prime.
    pub on_seek: Option<BeatCallback>,
    /// Safe cycle jump (from, to); MIDI and metronome re-prime.
    pub on_cycle_jump: Option<CycleJumpCallback>,
    /// Tempo changed while rolling; schedulers rebuild their timing.
    pub on_tempo_change: Option<BeatCallback>,
}

/// The transport owns the playhead in beats and converts wall-clock time to
/// musical time through the process-wide timing anchor.
pub struct Transport {
    state: Mutex<TransportState>,
    atomic_state: AtomicU8,
    is_playing: Arc<AtomicFlag>,
    beat_position: Arc<AtomicDouble>,
    anchor: Arc<AnchorCell>,
    context: Arc<ContextCell>,
    cycle: Arc<CycleRegion>,
    generation: Arc<AtomicU64>,
    graph_ready: Arc<AtomicFlag>,
    callbacks: RwLock<TransportCallbacks>,
    subscribers: Mutex<Vec<Sender<TransportUpdate>>>,
    tracker: Arc<ErrorTracker>,
    timer_active: Arc<AtomicFlag>,
    shutdown: Arc<AtomicFlag>,
    timer_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Transport {
    pub fn new(
        anchor: Arc<AnchorCell>,
        context: Arc<ContextCell>,
        graph_ready: Arc<AtomicFlag>,
        tracker: Arc<ErrorTracker>,
    ) -> Arc<Self> {
        let transport = Arc::new(Self {
            state: Mutex::new(TransportState::Stopped),
            atomic_state: AtomicU8::new(TransportState::Stopped.to_u8()),
            is_playing: Arc::new(AtomicFlag::new(false)),
            beat_position: Arc::new(AtomicDouble::new(0.0)),
            anchor,
            context,
            cycle: Arc::new(CycleRegion::new()),
            generation: Arc::new(AtomicU64::new(0)),
            graph_ready,
            callbacks: RwLock::new(TransportCallbacks::default()),
            subscribers: Mutex::new(Vec::new()),
            tracker,
            timer_active: Arc::new(AtomicFlag::new(false)),
            shutdown: Arc::new(AtomicFlag::new(false)),
            timer_handle: Mutex::new(None),
        });

        let handle = Self::spawn_position_timer(Arc::downgrade(&transport));
        *transport.timer_handle.lock() = Some(handle);
        transport
    }

    /// The position timer holds only a weak handle and re-checks it every
    /// tick, so a dropped transport tears the thread down.
    fn spawn_position_timer(weak: Weak<Transport>) -> JoinHandle<()> {
        thread::Builder::new()
            .name("cadenza-position".into())
            .spawn(move || {
                let _ = thread_priority::set_current_thread_priority(
                    thread_priority::ThreadPriority::Max,
                );
                loop {
                    let Some(transport) = weak.upgrade() else {
                        break;
                    };
                    if transport.shutdown.get() {
                        break;
                    }
                    if transport.timer_active.get() {
                        transport.position_tick();
                    }
                    drop(transport);
                    thread::sleep(TIMER_PERIOD);
                }
            })
            .expect("spawn position timer thread")
    }

    /// One 60 Hz tick: capture wall time on this thread first, derive the
    /// beat, publish, then check the cycle boundary.
    fn position_tick(&self) {
        let now = Instant::now();
        let anchor = self.anchor.get();
        let beat = anchor.beat_at(now);
        self.beat_position.set(beat);
        self.publish_update();

        if self.is_playing.get() && self.cycle.should_jump(beat, now) {
            self.cycle_jump(now);
        }
    }

    /// Safe jump to the cycle start: bump the generation (in-flight UI
    /// updates know they are stale), re-anchor, publish, then let the
    /// callback re-prime MIDI and the metronome at the target beat.
    fn cycle_jump(&self, now: Instant) {
        let Some((start, end)) = self.cycle.range() else {
            return;
        };
        self.generation.fetch_add(1, Ordering::AcqRel);
        let context = self.context.load();
        self.anchor.rebase(start, context);
        self.beat_position.set(start);
        self.publish_update();
        if let Some(cb) = &self.callbacks.read().on_cycle_jump {
            cb(end, start);
        }
        self.cycle.note_jump(now);
        tracing::debug!(from = end, to = start, "cycle jump");
    }

    // --- transitions -----------------------------------------------------

    /// Start playback. Fails silently (with a tracked warning) while the
    /// graph is unstable or a plugin install is in flight.
    pub fn play(&self) {
        if !self.graph_ready.get() {
            self.tracker
                .warn(Component::Transport, "play ignored: graph not ready");
            return;
        }
        let mut state = self.state.lock();
        if state.is_rolling() {
            return;
        }
        let start_beat = match *state {
            TransportState::Paused => self.beat_position.get(),
            _ => 0.0,
        };
        self.anchor.rebase(start_beat, self.context.load());
        self.beat_position.set(start_beat);
        self.set_state(&mut *state, TransportState::Playing);
        self.is_playing.set(true);
        self.timer_active.set(true);
        drop(state);

        if let Some(cb) = &self.callbacks.read().on_play {
            cb(start_beat);
        }
        self.publish_update();
        tracing::info!(beat = start_beat, "transport play");
    }

    /// Pause at the exact anchor-derived beat, not the last timer tick.
    pub fn pause(&self) {
        let mut state = self.state.lock();
        if !state.is_rolling() {
            return;
        }
        let beat = self.anchor.get().beat_at(Instant::now());
        self.beat_position.set(beat);
        self.is_playing.set(false);
        self.timer_active.set(false);
        self.set_state(&mut *state, TransportState::Paused);
        drop(state);

        if let Some(cb) = &self.callbacks.read().on_stop {
            cb(beat);
        }
        self.publish_update();
        tracing::info!(beat, "transport pause");
    }

    /// Stop and rewind to beat 0.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        let was_rolling = state.is_rolling();
        let beat = if was_rolling {
            self.anchor.get().beat_at(Instant::now())
        } else {
            self.beat_position.get()
        };
        self.is_playing.set(false);
        self.timer_active.set(false);
        self.beat_position.set(0.0);
        self.set_state(&mut *state, TransportState::Stopped);
        drop(state);

        if was_rolling {
            if let Some(cb) = &self.callbacks.read().on_stop {
                cb(beat);
            }
        }
        self.publish_update();
        tracing::info!("transport stop");
    }

    /// Enter recording from any state, rolling from the current playhead.
    pub fn record(&self) {
        if !self.graph_ready.get() {
            self.tracker
                .warn(Component::Transport, "record ignored: graph not ready");
            return;
        }
        let mut state = self.state.lock();
        if *state == TransportState::Recording {
            return;
        }
        let start_beat = self.beat_position.get();
        self.anchor.rebase(start_beat, self.context.load());
        self.set_state(&mut *state, TransportState::Recording);
        self.is_playing.set(true);
        self.timer_active.set(true);
        drop(state);

        if let Some(cb) = &self.callbacks.read().on_play {
            cb(start_beat);
        }
        self.publish_update();
        tracing::info!(beat = start_beat, "transport record");
    }

    /// Move the playhead. While rolling this re-anchors and re-primes the
    /// schedulers; while stopped it only moves the playhead.
    pub fn seek(&self, beat: f64) -> Result<()> {
        if beat.is_nan() {
            self.tracker
                .warn(Component::Transport, "seek rejected: NaN beat");
            return Err(EngineError::InvalidBeat(beat));
        }
        let beat = beat.max(0.0);
        let state = self.state.lock();
        if state.is_rolling() {
            self.generation.fetch_add(1, Ordering::AcqRel);
            self.anchor.rebase(beat, self.context.load());
            self.beat_position.set(beat);
            drop(state);
            if let Some(cb) = &self.callbacks.read().on_seek {
                cb(beat);
            }
        } else {
            self.beat_position.set(beat);
            drop(state);
        }
        self.publish_update();
        tracing::debug!(beat, "seek");
        Ok(())
    }

    /// Replace the tempo. While rolling, the playhead position is captured
    /// from the old anchor first so the beat is continuous across the
    /// change.
    pub fn set_tempo(&self, tempo_bpm: f64) -> Result<()> {
        let state = self.state.lock();
        let rolling = state.is_rolling();
        let beat = if rolling {
            self.anchor.get().beat_at(Instant::now())
        } else {
            self.beat_position.get()
        };
        let context = self.context.set_tempo(tempo_bpm)?;
        self.anchor.rebase(beat, context);
        self.beat_position.set(beat);
        drop(state);

        if rolling {
            if let Some(cb) = &self.callbacks.read().on_tempo_change {
                cb(beat);
            }
        }
        self.publish_update();
        tracing::info!(tempo_bpm, beat, "tempo change");
        Ok(())
    }

    /// Device sample rate changed; the anchor is rewritten with the new
    /// context, other state is untouched.
    pub fn set_sample_rate(&self, sample_rate: f64) -> Result<()> {
        let beat = self.current_beat();
        let context = self.context.set_sample_rate(sample_rate)?;
        self.anchor.rebase(beat, context);
        Ok(())
    }

    pub fn set_cycle(&self, enabled: bool, start_beat: f64, end_beat: f64) -> Result<()> {
        let context = self.context.load();
        if let Err(e) = self.cycle.set(start_beat, end_beat, &context) {
            self.tracker
                .warn(Component::Transport, format!("cycle rejected: {e}"));
            return Err(e);
        }
        self.cycle.set_enabled(enabled);
        Ok(())
    }

    pub fn toggle_cycle(&self) -> bool {
        self.cycle.toggle()
    }

    // --- observation -----------------------------------------------------

    /// Exact playhead: anchor-derived while rolling, last published
    /// otherwise.
    pub fn current_beat(&self) -> f64 {
        if self.is_playing.get() {
            self.anchor.get().beat_at(Instant::now())
        } else {
            self.beat_position.get()
        }
    }

    pub fn state(&self) -> TransportState {
        TransportState::from_u8(self.atomic_state.load(Ordering::Acquire))
    }

    /// Lock-free playhead cell shared with the timer domains.
    pub fn beat_position(&self) -> &Arc<AtomicDouble> {
        &self.beat_position
    }

    pub fn is_playing_flag(&self) -> &Arc<AtomicFlag> {
        &self.is_playing
    }

    pub fn is_playing(&self) -> bool {
        self.is_playing.get()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn cycle(&self) -> &Arc<CycleRegion> {
        &self.cycle
    }

    pub fn context(&self) -> &Arc<ContextCell> {
        &self.context
    }

    pub fn anchor(&self) -> &Arc<AnchorCell> {
        &self.anchor
    }

    /// Subscribe to position/state updates. Slow consumers drop frames.
    pub fn subscribe(&self) -> Receiver<TransportUpdate> {
        let (tx, rx) = bounded(SUBSCRIBER_QUEUE);
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn set_callbacks(&self, callbacks: TransportCallbacks) {
        *self.callbacks.write() = callbacks;
    }

    // --- internals -------------------------------------------------------

    fn set_state(&self, slot: &mut TransportState, next: TransportState) {
        *slot = next;
        self.atomic_state.store(next.to_u8(), Ordering::Release);
    }

    fn publish_update(&self) {
        let update = TransportUpdate {
            beat: self.beat_position.get(),
            state: self.state(),
            generation: self.generation(),
        };
        self.subscribers.lock().retain(|tx| {
            match tx.try_send(update) {
                Ok(()) => true,
                // A full queue means a slow consumer; skip the frame.
                Err(TrySendError::Full(_)) => true,
                Err(TrySendError::Disconnected(_)) => false,
            }
        });
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.shutdown.set(true);
        // The timer thread exits on its next upgrade failure or shutdown
        // check; it is detached here because self is being dropped.
        if let Some(handle) = self.timer_handle.lock().take() {
            drop(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::TimingAnchor;
    use crate::context::{SchedulingContext, TimeSignature};
    use approx::assert_abs_diff_eq;
    use std::sync::atomic::AtomicUsize;

    fn make_transport() -> Arc<Transport> {
        let context = Arc::new(ContextCell::new(
            SchedulingContext::new(48_000.0, 120.0, TimeSignature::default()).unwrap(),
        ));
        let anchor = Arc::new(AnchorCell::new(TimingAnchor::new(0.0, context.load())));
        Transport::new(
            anchor,
            context,
            Arc::new(AtomicFlag::new(true)),
            Arc::new(ErrorTracker::new()),
        )
    }

    #[test]
    fn play_pause_resume_stop() {
        let t = make_transport();
        assert_eq!(t.state(), TransportState::Stopped);

        t.play();
        assert_eq!(t.state(), TransportState::Playing);
        assert!(t.is_playing());

        thread::sleep(Duration::from_millis(120));
        t.pause();
        let paused_at = t.current_beat();
        assert_eq!(t.state(), TransportState::Paused);
        // ~0.12 s at 120 bpm is ~0.24 beats.
        assert!(paused_at > 0.1 && paused_at < 1.0, "paused at {paused_at}");

        // Resume continues from the pause beat.
        t.play();
        assert_eq!(t.state(), TransportState::Playing);
        assert!(t.current_beat() >= paused_at);

        t.stop();
        assert_eq!(t.state(), TransportState::Stopped);
        assert_abs_diff_eq!(t.current_beat(), 0.0);
    }

    #[test]
    fn play_noop_when_graph_not_ready() {
        let context = Arc::new(ContextCell::new(
            SchedulingContext::new(48_000.0, 120.0, TimeSignature::default()).unwrap(),
        ));
        let anchor = Arc::new(AnchorCell::new(TimingAnchor::new(0.0, context.load())));
        let tracker = Arc::new(ErrorTracker::new());
        let ready = Arc::new(AtomicFlag::new(false));
        let t = Transport::new(anchor, context, ready.clone(), tracker.clone());

        t.play();
        assert_eq!(t.state(), TransportState::Stopped);
        assert_eq!(tracker.len(), 1);

        ready.set(true);
        t.play();
        assert_eq!(t.state(), TransportState::Playing);
    }

    #[test]
    fn seek_while_stopped_moves_playhead_only() {
        let t = make_transport();
        t.seek(6.0).unwrap();
        assert_abs_diff_eq!(t.current_beat(), 6.0);
        assert_eq!(t.state(), TransportState::Stopped);
        assert_eq!(t.generation(), 0);
    }

    #[test]
    fn seek_while_playing_bumps_generation_and_fires_callback() {
        let t = make_transport();
        let seeks = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&seeks);
        t.set_callbacks(TransportCallbacks {
            on_seek: Some(Box::new(move |beat| {
                assert_abs_diff_eq!(beat, 6.0);
                seen.fetch_add(1, Ordering::SeqCst);
            })),
            ..Default::default()
        });

        t.play();
        t.seek(6.0).unwrap();
        assert_eq!(t.generation(), 1);
        assert_eq!(seeks.load(Ordering::SeqCst), 1);
        assert!(t.current_beat() >= 6.0);
    }

    #[test]
    fn seek_rejects_nan_without_state_change() {
        let t = make_transport();
        t.seek(3.0).unwrap();
        assert!(t.seek(f64::NAN).is_err());
        assert_abs_diff_eq!(t.current_beat(), 3.0);
    }

    #[test]
    fn negative_seek_clamps_to_zero() {
        let t = make_transport();
        t.seek(-5.0).unwrap();
        assert_abs_diff_eq!(t.current_beat(), 0.0);
    }

    #[test]
    fn tempo_change_keeps_beat_continuous() {
        let t = make_transport();
        t.play();
        thread::sleep(Duration::from_millis(100));
        let before = t.current_beat();
        t.set_tempo(240.0).unwrap();
        let after = t.current_beat();
        assert!(after >= before, "beat went backwards: {before} -> {after}");
        assert!(after - before < 0.1, "beat jumped: {before} -> {after}");
        assert_abs_diff_eq!(t.context().load().tempo(), 240.0);
    }

    #[test]
    fn cycle_jump_fires_once_and_republishes_position() {
        let t = make_transport();
        let jumps = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&jumps);
        t.set_callbacks(TransportCallbacks {
            on_cycle_jump: Some(Box::new(move |from, to| {
                assert_abs_diff_eq!(from, 0.5, epsilon = 1e-6);
                assert_abs_diff_eq!(to, 0.25, epsilon = 1e-6);
                seen.fetch_add(1, Ordering::SeqCst);
            })),
            ..Default::default()
        });

        // Tight cycle so the boundary arrives quickly at 120 bpm.
        t.set_cycle(true, 0.25, 0.5).unwrap();
        t.play();

        // 0.5 beats is 250 ms; wait for the jump plus cooldown margin.
        thread::sleep(Duration::from_millis(450));
        let count = jumps.load(Ordering::SeqCst);
        assert!(count >= 1, "no cycle jump observed");
        assert_eq!(t.generation() as usize, count);
        // Playhead stays inside the cycle (plus epsilon) once jumping.
        let beat = t.current_beat();
        assert!(beat < 0.5 + 0.25, "beat escaped the cycle: {beat}");
        t.stop();
    }

    #[test]
    fn subscribers_receive_updates_while_playing() {
        let t = make_transport();
        let rx = t.subscribe();
        t.play();
        thread::sleep(Duration::from_millis(100));
        t.stop();

        let mut saw_playing = false;
        while let Ok(update) = rx.try_recv() {
            if update.state == TransportState::Playing {
                saw_playing = true;
            }
        }
        assert!(saw_playing);
    }
}
