//! Lock-free metering: per-node amplitude cells, master loudness, CPU load.

mod amplitude;
mod cpu;
mod fabric;

pub use amplitude::{AtomicAmplitude, Levels, PEAK_DECAY};
pub use cpu::{CpuLoad, CpuMeter};
pub use fabric::{LoudnessSnapshot, MeteringFabric, NodeKey};
