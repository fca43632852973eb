//! Low-priority watchdog: verifies the engine is running and attempts
//! bounded recovery.

use crate::error::{Component, ErrorTracker, Result, Severity};
use crate::lockfree::AtomicFlag;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Hooks the watchdog uses to observe and recover the engine. Implemented
/// by the engine façade's output/graph pair; the monitor itself never holds
/// a strong reference back to the façade.
pub trait EngineProbe: Send + Sync + 'static {
    fn is_running(&self) -> bool;
    fn prepare(&self) -> Result<()>;
    fn start(&self) -> Result<()>;
    /// Structural invariant violations, each tagged with the component at
    /// fault. Empty when the graph is sound.
    fn violations(&self) -> Vec<(Component, String)>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Ok,
    Recovering,
    Critical,
}

impl HealthStatus {
    fn to_u8(self) -> u8 {
        match self {
            HealthStatus::Ok => 0,
            HealthStatus::Recovering => 1,
            HealthStatus::Critical => 2,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => HealthStatus::Recovering,
            2 => HealthStatus::Critical,
            _ => HealthStatus::Ok,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Ok => "ok",
            HealthStatus::Recovering => "recovering",
            HealthStatus::Critical => "critical",
        }
    }
}

const TICK_INTERVAL: Duration = Duration::from_secs(2);
const BACKOFF_BASE: Duration = Duration::from_millis(100);
const MAX_ATTEMPTS: u32 = 5;

/// 0.5 Hz watchdog thread. Keeps two atomic mirrors (expected-to-run,
/// last-known-running) so the common tick touches nothing but atomics.
pub struct HealthMonitor {
    expected_running: Arc<AtomicFlag>,
    last_known_running: Arc<AtomicFlag>,
    status: Arc<AtomicU8>,
    shutdown: Arc<AtomicFlag>,
    handle: Option<JoinHandle<()>>,
}

impl HealthMonitor {
    pub fn start(probe: Arc<dyn EngineProbe>, tracker: Arc<ErrorTracker>) -> Self {
        let expected_running = Arc::new(AtomicFlag::new(false));
        let last_known_running = Arc::new(AtomicFlag::new(false));
        let status = Arc::new(AtomicU8::new(HealthStatus::Ok.to_u8()));
        let shutdown = Arc::new(AtomicFlag::new(false));

        let handle = {
            let expected = Arc::clone(&expected_running);
            let known = Arc::clone(&last_known_running);
            let status = Arc::clone(&status);
            let shutdown = Arc::clone(&shutdown);
            thread::Builder::new()
                .name("cadenza-health".into())
                .spawn(move || {
                    let _ = thread_priority::set_current_thread_priority(
                        thread_priority::ThreadPriority::Min,
                    );
                    while !shutdown.get() {
                        Self::tick(&probe, &tracker, &expected, &known, &status);
                        thread::sleep(TICK_INTERVAL);
                    }
                })
                .expect("spawn health monitor thread")
        };

        Self {
            expected_running,
            last_known_running,
            status,
            shutdown,
            handle: Some(handle),
        }
    }

    fn tick(
        probe: &Arc<dyn EngineProbe>,
        tracker: &Arc<ErrorTracker>,
        expected: &AtomicFlag,
        known: &AtomicFlag,
        status: &AtomicU8,
    ) {
        let running = probe.is_running();
        known.set(running);

        if expected.get() && !running {
            status.store(HealthStatus::Recovering.to_u8(), Ordering::Release);
            if Self::recover(probe, tracker) {
                known.set(true);
                status.store(HealthStatus::Ok.to_u8(), Ordering::Release);
            } else {
                status.store(HealthStatus::Critical.to_u8(), Ordering::Release);
                tracker.critical(
                    Component::Health,
                    format!("engine could not be restarted after {MAX_ATTEMPTS} attempts"),
                );
            }
        }

        for (component, violation) in probe.violations() {
            tracker.error(component, violation);
        }
    }

    /// prepare -> start with exponential backoff. Severity escalates to
    /// critical from the third attempt on.
    fn recover(probe: &Arc<dyn EngineProbe>, tracker: &Arc<ErrorTracker>) -> bool {
        for attempt in 0..MAX_ATTEMPTS {
            match probe.prepare().and_then(|_| probe.start()) {
                Ok(()) => {
                    tracing::info!(attempt, "engine recovered");
                    return true;
                }
                Err(e) => {
                    let severity = if attempt >= 2 {
                        Severity::Critical
                    } else {
                        Severity::Error
                    };
                    tracker.record(
                        Component::Health,
                        severity,
                        format!("restart attempt {} failed: {e}", attempt + 1),
                    );
                    thread::sleep(BACKOFF_BASE * 2u32.pow(attempt));
                }
            }
        }
        false
    }

    /// Tell the watchdog the engine should currently be streaming.
    pub fn set_expected_running(&self, expected: bool) {
        self.expected_running.set(expected);
    }

    /// Fast-path mirror update from the engine itself.
    pub fn note_running(&self, running: bool) {
        self.last_known_running.set(running);
    }

    pub fn status(&self) -> HealthStatus {
        HealthStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn is_critical(&self) -> bool {
        self.status() == HealthStatus::Critical
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.shutdown.set(true);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
