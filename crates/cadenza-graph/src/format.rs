//! The single graph format: 32-bit float, stereo, hardware sample rate.

use cadenza_core::error::{EngineError, Result};

pub const GRAPH_CHANNELS: usize = 2;

/// Largest buffer the render path pre-allocates for.
pub const MAX_FRAMES: usize = 8_192;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GraphFormat {
    pub sample_rate: f64,
    pub channels: usize,
}

impl GraphFormat {
    pub fn standard(sample_rate: f64) -> Self {
        Self {
            sample_rate,
            channels: GRAPH_CHANNELS,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.sample_rate.is_finite() && self.sample_rate > 0.0) {
            return Err(EngineError::InvalidSampleRate(self.sample_rate));
        }
        Ok(())
    }

    /// Player and hardware rates must sit within half to double of each
    /// other for schedule math to stay sane.
    pub fn rate_compatible_with(&self, other_rate: f64) -> bool {
        if !(other_rate.is_finite() && other_rate > 0.0) {
            return false;
        }
        let ratio = other_rate / self.sample_rate;
        (0.5..=2.0).contains(&ratio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_window() {
        let format = GraphFormat::standard(48_000.0);
        assert!(format.rate_compatible_with(44_100.0));
        assert!(format.rate_compatible_with(96_000.0));
        assert!(format.rate_compatible_with(24_000.0));
        assert!(!format.rate_compatible_with(22_050.0));
        assert!(!format.rate_compatible_with(192_000.0));
        assert!(!format.rate_compatible_with(0.0));
    }

    #[test]
    fn validation() {
        assert!(GraphFormat::standard(48_000.0).validate().is_ok());
        assert!(GraphFormat::standard(0.0).validate().is_err());
    }
}
