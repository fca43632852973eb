//! # cadenza - real-time multitrack audio engine core
//!
//! The engine accepts immutable project snapshots (tracks, regions, MIDI,
//! mixer settings, automation, cycle, tempo) and continuously produces a
//! stereo stream on the system output while UI collaborators observe a
//! shared musical-time playhead and issue transport, mixer and graph
//! commands.
//!
//! ## Architecture
//!
//! - **cadenza-core** - scheduling context + timing anchor, transport,
//!   smoothing, metering fabric, PDC, feedback guard, health watchdog,
//!   project model
//! - **cadenza-graph** - tiered graph mutations, track/bus nodes, region
//!   scheduling, plugin chains
//! - **cadenza-midi** - 500 Hz lookahead MIDI scheduler, instrument
//!   registry
//! - **cadenza-automation** - 120 Hz lane evaluation
//!
//! ## Quick start
//!
//! ```ignore
//! use cadenza::Engine;
//!
//! let engine = Engine::builder().tempo(120.0).build()?;
//! engine.apply_project(project)?;
//! engine.play();
//!
//! let beat = engine.beat_position();
//! let levels = engine.track_levels(1);
//! ```

mod builder;
mod engine;
mod output;

pub use builder::EngineBuilder;
pub use engine::Engine;
pub use output::{AudioOutput, CallbackState};

// Re-export the member crates for direct access.
pub use cadenza_automation as automation;
pub use cadenza_core as core;
pub use cadenza_graph as graph;
pub use cadenza_midi as midi;

// Common types at the crate root.
pub use cadenza_core::{
    AutomationTarget, AutomationValues, Component, EngineError, ErrorTracker, FeedbackConfig,
    HealthStatus, Levels, LoudnessSnapshot, Result, SchedulingContext, TimeSignature,
    TransportState, TransportUpdate,
};
pub use cadenza_core::project::{
    AudioFileRef, AudioRegion, AutomationLane, AutomationParameter, AutomationPoint, Bus,
    CycleSettings, Interpolation, MidiNote, MidiRegion, MixerSettings, PluginConfig,
    PluginDescriptor, Project, Track, TrackKind,
};
pub use cadenza_graph::{AudioClip, PluginHost, PluginUnit};
pub use cadenza_midi::{Instrument, MidiMessage, MidiSchedulerConfig};
