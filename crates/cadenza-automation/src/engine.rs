//! 120 Hz automation engine: evaluates lanes at the anchor beat and pushes
//! raw targets into track handles for adaptive smoothing.

use cadenza_core::anchor::AnchorCell;
use cadenza_core::automation::{AutomationTarget, AutomationValues};
use cadenza_core::lockfree::AtomicFlag;
use cadenza_core::project::{AutomationLane, AutomationParameter, Project, TrackId};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Timer period (~120 Hz).
const TICK_PERIOD: Duration = Duration::from_micros(8_333);

struct TrackLanes {
    track: TrackId,
    lanes: Vec<AutomationLane>,
    target: Arc<dyn AutomationTarget>,
}

impl TrackLanes {
    /// Evaluate every lane at `beat` into one value bundle. Plugin-param
    /// lanes are outside this engine's push path and are skipped.
    fn evaluate(&self, beat: f64) -> AutomationValues {
        let mut values = AutomationValues::default();
        for lane in &self.lanes {
            let Some(value) = lane.value_at(beat) else {
                continue;
            };
            match lane.parameter {
                AutomationParameter::Volume => values.volume = Some(value),
                AutomationParameter::Pan => values.pan = Some(value),
                AutomationParameter::EqLow => values.eq_low_db = Some(value),
                AutomationParameter::EqMid => values.eq_mid_db = Some(value),
                AutomationParameter::EqHigh => values.eq_high_db = Some(value),
                AutomationParameter::PluginParam(_) => {}
            }
        }
        values
    }
}

struct Shared {
    entries: Mutex<Vec<TrackLanes>>,
    anchor: Arc<AnchorCell>,
    playing: Arc<AtomicFlag>,
    shutdown: AtomicFlag,
}

impl Shared {
    fn tick(&self) {
        if !self.playing.get() {
            return;
        }
        let beat = self.anchor.get().current_beat();
        let entries = self.entries.lock();
        for entry in entries.iter() {
            let values = entry.evaluate(beat);
            if !values.is_empty() {
                entry.target.apply(&values);
            }
        }
    }
}

/// Periodic automation evaluator. Lanes are replaced wholesale from
/// project snapshots on the control thread; the tick only reads.
pub struct AutomationEngine {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl AutomationEngine {
    pub fn new(anchor: Arc<AnchorCell>, playing: Arc<AtomicFlag>) -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(Shared {
                entries: Mutex::new(Vec::new()),
                anchor,
                playing,
                shutdown: AtomicFlag::new(false),
            }),
            handle: Mutex::new(None),
        })
    }

    /// Spawn the 120 Hz timer thread. Idempotent.
    pub fn start(&self) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        *handle = Some(
            thread::Builder::new()
                .name("cadenza-automation".into())
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
                        shared.tick();
                        drop(shared);
                        thread::sleep(TICK_PERIOD);
                    }
                })
                .expect("spawn automation thread"),
        );
    }

    /// Replace all lanes from a project snapshot, resolving each track to
    /// its target handle.
    pub fn set_project(
        &self,
        project: &Project,
        resolve: impl Fn(TrackId) -> Option<Arc<dyn AutomationTarget>>,
    ) {
        let mut entries = Vec::new();
        for track in &project.tracks {
            if track.automation.is_empty() {
                continue;
            }
            let Some(target) = resolve(track.id) else {
                continue;
            };
            entries.push(TrackLanes {
                track: track.id,
                lanes: track.automation.clone(),
                target,
            });
        }
        let count = entries.len();
        *self.shared.entries.lock() = entries;
        tracing::debug!(tracks = count, "automation lanes rebuilt");
    }

    /// One evaluation pass outside the timer (tests, host-driven ticks).
    pub fn run_once(&self) {
        self.shared.tick();
    }

    /// Initialise smoothed state at the start beat so playback begins at
    /// the correct level immediately, not at the last-frame value.
    pub fn prime(&self, start_beat: f64) {
        let entries = self.shared.entries.lock();
        for entry in entries.iter() {
            let values = entry.evaluate(start_beat);
            if !values.is_empty() {
                entry.target.prime(&values);
            }
        }
    }

    pub fn tracked_tracks(&self) -> Vec<TrackId> {
        self.shared.entries.lock().iter().map(|e| e.track).collect()
    }
}

impl Drop for AutomationEngine {
    fn drop(&mut self) {
        self.shared.shutdown.set(true);
        if let Some(handle) = self.handle.lock().take() {
            drop(handle);
        }
    }
}
