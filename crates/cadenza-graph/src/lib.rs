//! cadenza-graph: the running audio graph.
//!
//! [`GraphManager`] is the single writer, serialising mutations into three
//! tiers (structural, connection-only, track-scoped hot-swap) over a
//! [`RenderGraph`] the audio callback pulls from. Region scheduling,
//! plugin chains and the per-track DSP stages live here too.

pub mod bus;
pub mod chain;
pub mod format;
pub mod manager;
pub mod player;
pub mod plugin;
pub mod render;
pub mod scheduler;
pub mod track;

pub use bus::BusNode;
pub use chain::{Panner, ThreeBandEq, TimePitch, EQ_GAIN_LIMIT_DB};
pub use format::{GraphFormat, GRAPH_CHANNELS, MAX_FRAMES};
pub use manager::GraphManager;
pub use player::{AudioClip, ClipStore, RegionPlayer, Segment};
pub use plugin::{
    load_async, PluginChain, PluginGreylist, PluginHost, PluginSlot, PluginUnit, LOAD_TIMEOUT,
    MAX_STATE_BYTES,
};
pub use render::{MasterHandle, RenderContext, RenderGraph};
pub use scheduler::{schedule_track, ScheduleParams, CYCLE_PRESCHEDULE_ITERATIONS};
pub use track::{TrackHandle, TrackNode, TrackSource};
