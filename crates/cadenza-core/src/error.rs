//! Error taxonomy and the diagnostic error tracker.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Error type for engine operations.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("engine could not be started after {attempts} attempts: {last}")]
    FatalGraph { attempts: u32, last: String },

    #[error("graph mutation failed: {0}")]
    TransientGraph(String),

    #[error("graph generation advanced (captured {captured}, live {live})")]
    StaleGeneration { captured: u64, live: u64 },

    #[error("plugin load failed for '{name}': {reason}")]
    PluginLoadFailed { name: String, reason: String },

    #[error("plugin load timed out after {0:?}")]
    PluginLoadTimeout(Duration),

    #[error("plugin state blob is {size} bytes, limit is {limit}")]
    PluginStateTooLarge { size: usize, limit: usize },

    #[error("format mismatch on track {track}: {detail}")]
    FormatMismatch { track: u64, detail: String },

    #[error("node not attached: {0}")]
    NodeNotAttached(String),

    #[error("invalid connection: {0}")]
    InvalidConnection(String),

    #[error("timing anchor is stale")]
    StaleAnchor,

    #[error("invalid beat position: {0}")]
    InvalidBeat(f64),

    #[error("invalid cycle range: start={start}, end={end}")]
    InvalidCycle { start: f64, end: f64 },

    #[error("invalid tempo: {0} bpm")]
    InvalidTempo(f64),

    #[error("invalid sample rate: {0} Hz")]
    InvalidSampleRate(f64),

    #[error("unknown track id: {0}")]
    UnknownTrack(u64),

    #[error("unknown bus id: {0}")]
    UnknownBus(u64),

    #[error("unknown plugin id: {0}")]
    UnknownPlugin(u64),

    #[error("excessive plugin latency on track {track}: {samples} samples")]
    ExcessiveLatency { track: u64, samples: usize },

    #[error("structural mutation rate limit exceeded")]
    MutationRateLimited,

    #[error("audio device: {0}")]
    Device(String),
}

/// Result type alias.
pub type Result<T> = core::result::Result<T, EngineError>;

/// Severity of a tracked report. Ordering is ascending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }
}

/// Component tag attached to every tracked report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    Transport,
    Graph,
    Track,
    Midi,
    Automation,
    Metering,
    PluginHost,
    Health,
    Output,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Transport => "transport",
            Component::Graph => "graph",
            Component::Track => "track",
            Component::Midi => "midi",
            Component::Automation => "automation",
            Component::Metering => "metering",
            Component::PluginHost => "plugin-host",
            Component::Health => "health",
            Component::Output => "output",
        }
    }
}

/// One tracked issue.
#[derive(Debug, Clone)]
pub struct Report {
    pub component: Component,
    pub severity: Severity,
    pub message: String,
    pub at: Instant,
}

/// Bounded ring of reports shared across the engine.
///
/// Per-region and per-plugin failures land here instead of aborting the
/// project; the diagnostic view enumerates them by severity for the UI.
pub struct ErrorTracker {
    reports: Mutex<VecDeque<Report>>,
    capacity: usize,
    saw_critical: AtomicBool,
}

impl ErrorTracker {
    pub const DEFAULT_CAPACITY: usize = 256;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            reports: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            saw_critical: AtomicBool::new(false),
        }
    }

    pub fn record(&self, component: Component, severity: Severity, message: impl Into<String>) {
        let message = message.into();
        match severity {
            Severity::Warning => {
                tracing::warn!(component = component.as_str(), "{message}")
            }
            Severity::Error | Severity::Critical => {
                tracing::error!(component = component.as_str(), "{message}")
            }
        }
        if severity == Severity::Critical {
            self.saw_critical.store(true, Ordering::Release);
        }

        let mut reports = self.reports.lock();
        if reports.len() == self.capacity {
            reports.pop_front();
        }
        reports.push_back(Report {
            component,
            severity,
            message,
            at: Instant::now(),
        });
    }

    pub fn warn(&self, component: Component, message: impl Into<String>) {
        self.record(component, Severity::Warning, message);
    }

    pub fn error(&self, component: Component, message: impl Into<String>) {
        self.record(component, Severity::Error, message);
    }

    pub fn critical(&self, component: Component, message: impl Into<String>) {
        self.record(component, Severity::Critical, message);
    }

    pub fn has_critical(&self) -> bool {
        self.saw_critical.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.reports.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.lock().is_empty()
    }

    pub fn clear(&self) {
        self.reports.lock().clear();
        self.saw_critical.store(false, Ordering::Release);
    }

    /// Snapshot of all reports in arrival order.
    pub fn reports(&self) -> Vec<Report> {
        self.reports.lock().iter().cloned().collect()
    }

    /// Human-readable report, most severe issues first.
    pub fn diagnostic(&self) -> String {
        let mut reports = self.reports();
        reports.sort_by(|a, b| b.severity.cmp(&a.severity));

        let mut out = String::new();
        for report in &reports {
            out.push_str(&format!(
                "[{}] {}: {}\n",
                report.severity.as_str(),
                report.component.as_str(),
                report.message
            ));
        }
        out
    }
}

impl Default for ErrorTracker {
    fn default() -> Self {
        Self::new()
    }
}
