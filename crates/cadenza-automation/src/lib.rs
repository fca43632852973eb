//! cadenza-automation: the periodic lane-evaluation engine.
//!
//! Lane data (points, interpolation) lives in the project model; this
//! crate owns the 120 Hz evaluator that turns lanes into smoothed
//! parameter pushes.

mod engine;

pub use engine::AutomationEngine;
