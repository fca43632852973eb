//! CPAL output wrapper and the audio-callback state bundle.

use cadenza_core::context::ContextCell;
use cadenza_core::error::{EngineError, Result};
use cadenza_core::lockfree::{AtomicDouble, AtomicFlag};
use cadenza_core::metering::MeteringFabric;
use cadenza_graph::{RenderContext, RenderGraph, MAX_FRAMES};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

/// Everything the audio callback touches: the graph behind a try-lock and
/// lock-free transport mirrors. Cloning shares the same underlying state.
#[derive(Clone)]
pub struct CallbackState {
    pub graph: Arc<Mutex<RenderGraph>>,
    pub fabric: Arc<MeteringFabric>,
    pub beat_position: Arc<AtomicDouble>,
    pub is_playing: Arc<AtomicFlag>,
    pub context: Arc<ContextCell>,
}

impl CallbackState {
    /// Render one interleaved stereo buffer. Contention on the graph lock
    /// (tier-1 mutation windows) yields silence, never a block.
    pub fn process(&self, out: &mut [f32], frames: usize) {
        let started = Instant::now();
        let context = self.context.load();
        let render_ctx = RenderContext {
            beat: self.beat_position.get(),
            beats_per_sample: context.beats_per_second() / context.sample_rate(),
            playing: self.is_playing.get(),
        };

        match self.graph.try_lock() {
            Some(mut graph) => graph.render(render_ctx, out, frames),
            None => out[..frames * 2].fill(0.0),
        }

        self.fabric.cpu().record(frames, started.elapsed());
    }
}

/// Wrapper to hold a `cpal::Stream` in a `Send` context. The stream only
/// lives behind the engine's output mutex and never migrates threads.
struct StreamHandle(#[allow(dead_code)] cpal::Stream);

// SAFETY: the stream is only touched under Mutex<AudioOutput>, so it is
// never accessed concurrently; it stays alive on its creation thread until
// the output is dropped.
unsafe impl Send for StreamHandle {}

/// System output device, or a headless stand-in whose buffers the host
/// pulls through [`CallbackState::process`].
pub struct AudioOutput {
    sample_rate: f64,
    channels: usize,
    device_index: Option<usize>,
    headless: bool,
    running: bool,
    stream: Option<StreamHandle>,
}

impl AudioOutput {
    pub fn new(device_index: Option<usize>) -> Result<Self> {
        let device = Self::device(device_index)?;
        let config = device
            .default_output_config()
            .map_err(|e| EngineError::Device(format!("no default output config: {e}")))?;
        Ok(Self {
            sample_rate: config.sample_rate().0 as f64,
            channels: config.channels() as usize,
            device_index,
            headless: false,
            running: false,
            stream: None,
        })
    }

    /// No device: the embedding host drives rendering itself.
    pub fn headless(sample_rate: f64) -> Self {
        Self {
            sample_rate,
            channels: 2,
            device_index: None,
            headless: true,
            running: false,
            stream: None,
        }
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Re-probe the device before a (re)start attempt.
    pub fn prepare(&mut self) -> Result<()> {
        if self.headless {
            return Ok(());
        }
        let device = Self::device(self.device_index)?;
        let config = device
            .default_output_config()
            .map_err(|e| EngineError::Device(format!("no default output config: {e}")))?;
        self.sample_rate = config.sample_rate().0 as f64;
        self.channels = config.channels() as usize;
        Ok(())
    }

    pub fn start(&mut self, state: CallbackState) -> Result<()> {
        if self.running {
            return Ok(());
        }
        if self.headless {
            self.running = true;
            return Ok(());
        }

        let device = Self::device(self.device_index)?;
        let config = device
            .default_output_config()
            .map_err(|e| EngineError::Device(format!("no default output config: {e}")))?;

        let stream = match config.sample_format() {
            cpal::SampleFormat::F32 => self.build_stream::<f32>(&device, &config.into(), state)?,
            cpal::SampleFormat::I16 => self.build_stream::<i16>(&device, &config.into(), state)?,
            cpal::SampleFormat::U16 => self.build_stream::<u16>(&device, &config.into(), state)?,
            format => {
                return Err(EngineError::Device(format!(
                    "unsupported sample format: {format:?}"
                )))
            }
        };
        stream
            .play()
            .map_err(|e| EngineError::Device(format!("stream start: {e}")))?;

        self.stream = Some(StreamHandle(stream));
        self.running = true;
        tracing::info!(
            sample_rate = self.sample_rate,
            channels = self.channels,
            "output stream running"
        );
        Ok(())
    }

    pub fn stop(&mut self) {
        self.stream = None;
        self.running = false;
    }

    fn device(index: Option<usize>) -> Result<cpal::Device> {
        let host = cpal::default_host();
        match index {
            Some(idx) => {
                let devices: Vec<_> = host
                    .output_devices()
                    .map_err(|e| EngineError::Device(format!("device enumeration: {e}")))?
                    .collect();
                let count = devices.len();
                devices.into_iter().nth(idx).ok_or_else(|| {
                    EngineError::Device(format!(
                        "output device index {idx} out of range (available: {count})"
                    ))
                })
            }
            None => host
                .default_output_device()
                .ok_or_else(|| EngineError::Device("no output device available".into())),
        }
    }

    fn build_stream<T>(
        &self,
        device: &cpal::Device,
        config: &cpal::StreamConfig,
        state: CallbackState,
    ) -> Result<cpal::Stream>
    where
        T: cpal::SizedSample + cpal::FromSample<f32>,
    {
        let channels = config.channels as usize;
        // Pre-allocated stereo scratch; the callback itself never allocates.
        let mut scratch = vec![0.0f32; MAX_FRAMES * 2];

        let stream = device
            .build_output_stream(
                config,
                move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                    let guarded = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        let frames = (data.len() / channels).min(MAX_FRAMES);
                        state.process(&mut scratch, frames);

                        for (i, sample) in data.iter_mut().enumerate() {
                            let channel = i % channels;
                            let frame = i / channels;
                            let value = if channel < 2 && frame < frames {
                                scratch[frame * 2 + channel]
                            } else {
                                0.0
                            };
                            *sample = T::from_sample(value);
                        }
                    }));
                    if guarded.is_err() {
                        // A panicking callback must still emit silence.
                        for sample in data.iter_mut() {
                            *sample = T::from_sample(0.0);
                        }
                    }
                },
                |_err| {
                    // Stream errors cannot be logged from this thread
                    // safely; the health monitor notices the stall.
                },
                None,
            )
            .map_err(|e| EngineError::Device(format!("build stream: {e}")))?;
        Ok(stream)
    }
}
