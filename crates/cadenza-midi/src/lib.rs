//! Sample-accurate MIDI scheduling for the cadenza engine.
//!
//! - [`MidiScheduler`] - the 500 Hz lookahead scheduler reading the
//!   transport anchor lock-free.
//! - [`InstrumentRegistry`] - track-id to instrument routing.
//! - [`event`] - RT-safe raw event types and region expansion.

pub mod event;
pub mod registry;
pub mod scheduler;

pub use event::{expand_region, MidiMessage, ScheduledMidiEvent, CC_ALL_NOTES_OFF};
pub use registry::{Instrument, InstrumentCell, InstrumentRegistry};
pub use scheduler::{MidiScheduler, MidiSchedulerConfig};
