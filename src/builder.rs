//! Engine builder: device selection, initial musical context, plugin host
//! wiring, and subsystem assembly.

use crate::engine::{CycleRun, Engine, SchedulerWiring};
use crate::output::{AudioOutput, CallbackState};
use cadenza_automation::AutomationEngine;
use cadenza_core::anchor::{AnchorCell, TimingAnchor};
use cadenza_core::click::ClickSettings;
use cadenza_core::context::{ContextCell, SchedulingContext, TimeSignature};
use cadenza_core::error::{EngineError, ErrorTracker, Result};
use cadenza_core::feedback::{FeedbackConfig, FeedbackGuard};
use cadenza_core::metering::MeteringFabric;
use cadenza_core::pdc::DelayCompensator;
use cadenza_core::project::{PluginDescriptor, Project};
use cadenza_core::transport::Transport;
use cadenza_graph::{ClipStore, GraphFormat, GraphManager, PluginHost, PluginUnit};
use cadenza_midi::{InstrumentRegistry, MidiScheduler, MidiSchedulerConfig};
use parking_lot::Mutex;
use std::sync::Arc;

/// Default host: every load fails until the embedder wires a real one.
struct NoPluginHost;

impl PluginHost for NoPluginHost {
    fn load(&self, descriptor: &PluginDescriptor, _sandboxed: bool) -> Result<Box<dyn PluginUnit>> {
        Err(EngineError::PluginLoadFailed {
            name: descriptor.name.clone(),
            reason: "no plugin host configured".into(),
        })
    }
}

/// Cycle-jump cooldown seed before real callback sizes are known.
const NOMINAL_BUFFER_FRAMES: usize = 512;

pub struct EngineBuilder {
    device_index: Option<usize>,
    headless_sample_rate: Option<f64>,
    tempo: f64,
    time_signature: TimeSignature,
    plugin_host: Option<Arc<dyn PluginHost>>,
    feedback: FeedbackConfig,
    midi: MidiSchedulerConfig,
    autostart: bool,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            device_index: None,
            headless_sample_rate: None,
            tempo: 120.0,
            time_signature: TimeSignature::default(),
            plugin_host: None,
            feedback: FeedbackConfig::default(),
            midi: MidiSchedulerConfig::default(),
            autostart: true,
        }
    }
}

impl EngineBuilder {
    /// Pick a specific output device by index.
    pub fn output_device(mut self, index: usize) -> Self {
        self.device_index = Some(index);
        self
    }

    /// No device: the embedding host drives rendering via
    /// [`Engine::render`].
    pub fn headless(mut self, sample_rate: f64) -> Self {
        self.headless_sample_rate = Some(sample_rate);
        self
    }

    pub fn tempo(mut self, bpm: f64) -> Self {
        self.tempo = bpm;
        self
    }

    pub fn time_signature(mut self, numerator: u32, denominator: u32) -> Self {
        self.time_signature = TimeSignature::new(numerator, denominator);
        self
    }

    pub fn plugin_host(mut self, host: Arc<dyn PluginHost>) -> Self {
        self.plugin_host = Some(host);
        self
    }

    pub fn feedback_config(mut self, config: FeedbackConfig) -> Self {
        self.feedback = config;
        self
    }

    pub fn midi_config(mut self, config: MidiSchedulerConfig) -> Self {
        self.midi = config;
        self
    }

    /// Build without starting the output stream.
    pub fn manual_start(mut self) -> Self {
        self.autostart = false;
        self
    }

    pub fn build(self) -> Result<Engine> {
        let output = match self.headless_sample_rate {
            Some(rate) => AudioOutput::headless(rate),
            None => AudioOutput::new(self.device_index)?,
        };
        let sample_rate = output.sample_rate();

        let tracker = Arc::new(ErrorTracker::new());
        let context = Arc::new(ContextCell::new(SchedulingContext::new(
            sample_rate,
            self.tempo,
            self.time_signature,
        )?));
        let anchor = Arc::new(AnchorCell::new(TimingAnchor::new(0.0, context.load())));
        let fabric = Arc::new(MeteringFabric::new(sample_rate)?);
        let pdc = Arc::new(DelayCompensator::new());
        let guard = Arc::new(FeedbackGuard::new(self.feedback, sample_rate));
        let click = Arc::new(ClickSettings::new());
        let host = self
            .plugin_host
            .unwrap_or_else(|| Arc::new(NoPluginHost) as Arc<dyn PluginHost>);

        let graph = Arc::new(GraphManager::new(
            GraphFormat::standard(sample_rate),
            host,
            Arc::clone(&pdc),
            Arc::clone(&fabric),
            Arc::clone(&guard),
            Arc::clone(&click),
            Arc::clone(&tracker),
        ));

        let transport = Transport::new(
            Arc::clone(&anchor),
            Arc::clone(&context),
            graph.ready_flag(),
            Arc::clone(&tracker),
        );
        transport
            .cycle()
            .set_cooldown_for_buffer(NOMINAL_BUFFER_FRAMES, sample_rate);

        let registry = Arc::new(InstrumentRegistry::new());
        let midi = MidiScheduler::new(
            Arc::clone(&anchor),
            Arc::clone(&context),
            Arc::clone(transport.beat_position()),
            Arc::clone(transport.is_playing_flag()),
            graph.ready_flag(),
            Arc::clone(&registry),
            Arc::clone(&pdc),
            Arc::clone(transport.cycle()),
            self.midi,
        );
        let automation = AutomationEngine::new(
            Arc::clone(&anchor),
            Arc::clone(transport.is_playing_flag()),
        );

        let clips = Arc::new(ClipStore::new());
        let project = Arc::new(Mutex::new(Arc::new(Project::empty(
            self.tempo,
            sample_rate,
        ))));

        let wiring = Arc::new(SchedulerWiring {
            graph: Arc::clone(&graph),
            clips: Arc::clone(&clips),
            project: Arc::clone(&project),
            context: Arc::clone(&context),
            cycle: Arc::clone(transport.cycle()),
            automation: Arc::clone(&automation),
            midi: Arc::clone(&midi),
            cycle_run: Mutex::new(CycleRun::default()),
        });
        Engine::wire_transport_callbacks(&transport, &wiring);

        midi.start();
        automation.start();

        let callback_state = CallbackState {
            graph: graph.graph_arc(),
            fabric: Arc::clone(&fabric),
            beat_position: Arc::clone(transport.beat_position()),
            is_playing: Arc::clone(transport.is_playing_flag()),
            context: Arc::clone(&context),
        };

        let engine = Engine::assemble(
            Arc::new(Mutex::new(output)),
            context,
            anchor,
            transport,
            graph,
            midi,
            automation,
            registry,
            fabric,
            pdc,
            guard,
            click,
            tracker,
            clips,
            project,
            wiring,
            callback_state,
        );

        if self.autostart {
            engine.start()?;
        }
        Ok(engine)
    }
}
