//! Instrument registry: track-id to instrument mapping and event routing.

use crate::event::MidiMessage;
use cadenza_core::project::TrackId;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;

/// A playable instrument (sampler, synth, hosted plugin adapter).
///
/// `handle_event` receives a sample offset measured from "now": 0 means
/// immediate, positive means the event lands that many samples into the
/// future. Instruments that cannot schedule ahead return `false` from
/// [`supports_sample_scheduling`](Self::supports_sample_scheduling) and get
/// every event with offset 0.
pub trait Instrument: Send {
    fn handle_event(&mut self, message: MidiMessage, sample_offset: u64);

    fn supports_sample_scheduling(&self) -> bool {
        false
    }

    /// Render the next `frames` frames of interleaved stereo into `out`,
    /// accumulating.
    fn render(&mut self, out: &mut [f32], frames: usize);

    fn all_notes_off(&mut self);

    fn set_sample_rate(&mut self, sample_rate: f64);
}

/// Shared instrument slot. The scheduler thread dispatches events through a
/// short lock; the audio callback try-locks for rendering and falls back to
/// silence on contention (only during dispatch, a few microseconds).
pub struct InstrumentCell {
    inner: Mutex<Box<dyn Instrument>>,
}

impl InstrumentCell {
    pub fn new(instrument: Box<dyn Instrument>) -> Self {
        Self {
            inner: Mutex::new(instrument),
        }
    }

    /// Route one event, honouring the instrument's scheduling capability.
    pub fn dispatch(&self, message: MidiMessage, sample_offset: u64) {
        let mut instrument = self.inner.lock();
        if instrument.supports_sample_scheduling() {
            instrument.handle_event(message, sample_offset);
        } else {
            instrument.handle_event(message, 0);
        }
    }

    /// Render from the audio callback; false means the slot was contended
    /// and the caller keeps silence.
    #[inline]
    pub fn try_render(&self, out: &mut [f32], frames: usize) -> bool {
        if let Some(mut instrument) = self.inner.try_lock() {
            instrument.render(out, frames);
            true
        } else {
            false
        }
    }

    pub fn all_notes_off(&self) {
        self.inner.lock().all_notes_off();
    }

    pub fn set_sample_rate(&self, sample_rate: f64) {
        self.inner.lock().set_sample_rate(sample_rate);
    }
}

/// Maps track ids to instruments. Instruments are exclusively owned here;
/// the graph and the scheduler hold shared cells.
pub struct InstrumentRegistry {
    instruments: DashMap<TrackId, Arc<InstrumentCell>>,
}

impl InstrumentRegistry {
    pub fn new() -> Self {
        Self {
            instruments: DashMap::new(),
        }
    }

    pub fn register(&self, track: TrackId, instrument: Box<dyn Instrument>) -> Arc<InstrumentCell> {
        let cell = Arc::new(InstrumentCell::new(instrument));
        self.instruments.insert(track, Arc::clone(&cell));
        tracing::debug!(track, "instrument registered");
        cell
    }

    pub fn unregister(&self, track: TrackId) {
        self.instruments.remove(&track);
    }

    pub fn get(&self, track: TrackId) -> Option<Arc<InstrumentCell>> {
        self.instruments.get(&track).map(|c| Arc::clone(c.value()))
    }

    /// Route an event to a track's instrument. Unknown tracks are dropped
    /// silently; a missing instrument is not an error at dispatch time.
    #[inline]
    pub fn route(&self, track: TrackId, message: MidiMessage, sample_offset: u64) {
        if let Some(cell) = self.instruments.get(&track) {
            cell.dispatch(message, sample_offset);
        }
    }

    /// Send one message to every registered instrument immediately. Used
    /// for all-notes-off controllers that must also clear host-side queues.
    pub fn broadcast(&self, message: MidiMessage) {
        for cell in self.instruments.iter() {
            cell.dispatch(message, 0);
        }
    }

    /// Panic stop: silence every instrument.
    pub fn all_notes_off(&self) {
        for cell in self.instruments.iter() {
            cell.all_notes_off();
        }
    }

    /// Re-prime all instruments after a device format change.
    pub fn set_sample_rate(&self, sample_rate: f64) {
        for cell in self.instruments.iter() {
            cell.set_sample_rate(sample_rate);
        }
    }

    pub fn len(&self) -> usize {
        self.instruments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }
}

impl Default for InstrumentRegistry {
    fn default() -> Self {
        Self::new()
    }
}
