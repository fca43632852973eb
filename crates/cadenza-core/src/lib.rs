//! cadenza-core: the engine kernel.
//!
//! Everything here is shared by the graph, MIDI and automation crates:
//! the scheduling context and timing anchor, the transport, lock-free
//! atomics, parameter smoothing, the metering fabric, plugin delay
//! compensation, the feedback guard, the health watchdog, the error
//! taxonomy and the project snapshot model.

pub mod anchor;
pub mod automation;
pub mod click;
pub mod context;
pub mod error;
pub mod feedback;
pub mod health;
pub mod lockfree;
pub mod metering;
pub mod pdc;
pub mod project;
pub mod smooth;
pub mod transport;

pub use anchor::{AnchorCell, TimingAnchor, MAX_ANCHOR_AGE};
pub use automation::{AutomationTarget, AutomationValues};
pub use click::{ClickSettings, ClickSynth};
pub use context::{ContextCell, SchedulingContext, TimeSignature, BBT, TICKS_PER_BEAT};
pub use error::{Component, EngineError, ErrorTracker, Report, Result, Severity};
pub use feedback::{FeedbackConfig, FeedbackGuard};
pub use health::{EngineProbe, HealthMonitor, HealthStatus};
pub use lockfree::{AtomicDouble, AtomicFlag, AtomicFloat};
pub use metering::{AtomicAmplitude, CpuLoad, CpuMeter, Levels, LoudnessSnapshot, MeteringFabric, NodeKey};
pub use pdc::{DelayCompensator, PdcSnapshot};
pub use smooth::{AdaptiveSmoother, MuteRamp, OnePole, SmoothedValue};
pub use transport::{
    CycleRegion, Transport, TransportCallbacks, TransportState, TransportUpdate, CYCLE_EPSILON,
};
