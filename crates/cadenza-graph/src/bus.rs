//! Aux/group bus node: input mixer -> plugin chain -> output gain.

use crate::format::{GraphFormat, MAX_FRAMES};
use crate::plugin::PluginChain;
use cadenza_core::metering::AtomicAmplitude;
use cadenza_core::project::BusId;
use cadenza_core::smooth::SmoothedValue;
use std::sync::Arc;

pub struct BusNode {
    pub id: BusId,
    pub chain: PluginChain,
    output_gain: SmoothedValue,
    meter: Arc<AtomicAmplitude>,
    input: Vec<f32>,
    has_input: bool,
}

impl BusNode {
    const RAMP_SECONDS: f32 = 0.005;

    pub fn new(id: BusId, output_level: f32, format: GraphFormat, meter: Arc<AtomicAmplitude>) -> Self {
        Self {
            id,
            chain: PluginChain::new(format.sample_rate),
            output_gain: SmoothedValue::new(
                output_level,
                Self::RAMP_SECONDS,
                format.sample_rate as f32,
            ),
            meter,
            input: vec![0.0; MAX_FRAMES * 2],
            has_input: false,
        }
    }

    pub fn set_output_level(&mut self, level: f32) {
        self.output_gain.set_target(level.max(0.0));
    }

    pub fn set_sample_rate(&mut self, sample_rate: f64) {
        self.chain.set_sample_rate(sample_rate);
    }

    /// Mix one track's buffer into the bus input at the given send level.
    pub fn accumulate(&mut self, buffer: &[f32], frames: usize, level: f32) {
        let frames = frames.min(MAX_FRAMES);
        for (slot, &s) in self.input[..frames * 2].iter_mut().zip(buffer.iter()) {
            *slot += s * level;
        }
        self.has_input = true;
    }

    /// Process the accumulated input through the chain and output gain,
    /// add the result into `out`, and clear the input mixer.
    pub fn render_into(&mut self, out: &mut [f32], frames: usize) {
        let frames = frames.min(MAX_FRAMES);
        if !self.has_input {
            return;
        }
        let buf = &mut self.input[..frames * 2];

        self.chain.process(buf, frames);
        for i in 0..frames {
            let gain = self.output_gain.next_sample();
            buf[i * 2] *= gain;
            buf[i * 2 + 1] *= gain;
        }
        self.meter.ingest(buf, frames);

        for (o, &s) in out[..frames * 2].iter_mut().zip(buf.iter()) {
            *o += s;
        }
        buf.fill(0.0);
        self.has_input = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadenza_core::metering::AtomicAmplitude;

    fn bus(level: f32) -> BusNode {
        BusNode::new(
            1,
            level,
            GraphFormat::standard(48_000.0),
            Arc::new(AtomicAmplitude::new()),
        )
    }

    #[test]
    fn sums_sends_and_applies_output_gain() {
        let mut bus = bus(1.0);
        let track_a = vec![1.0f32; 8];
        let track_b = vec![1.0f32; 8];
        bus.accumulate(&track_a, 4, 0.5);
        bus.accumulate(&track_b, 4, 0.25);

        let mut out = vec![0.0f32; 8];
        bus.render_into(&mut out, 4);
        assert!((out[0] - 0.75).abs() < 1e-6);
    }

    #[test]
    fn idle_bus_contributes_nothing() {
        let mut bus = bus(1.0);
        let mut out = vec![0.5f32; 8];
        bus.render_into(&mut out, 4);
        assert!(out.iter().all(|&s| (s - 0.5).abs() < 1e-9));
    }

    #[test]
    fn input_clears_between_buffers() {
        let mut bus = bus(1.0);
        bus.accumulate(&vec![1.0f32; 8], 4, 1.0);
        let mut out = vec![0.0f32; 8];
        bus.render_into(&mut out, 4);

        // Second buffer without new sends stays silent.
        let mut out2 = vec![0.0f32; 8];
        bus.render_into(&mut out2, 4);
        assert!(out2.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn output_level_ramps() {
        let mut bus = bus(1.0);
        bus.set_output_level(0.0);
        bus.accumulate(&vec![1.0f32; 1024], 512, 1.0);
        let mut out = vec![0.0f32; 1024];
        bus.render_into(&mut out, 512);
        // Early samples are still audible, late samples near zero.
        assert!(out[0] > 0.5);
        assert!(out[1022].abs() < 0.05);
    }
}
