//! Plugin hosting seam: the consumed host interface, per-track chains and
//! the failure greylist.
//!
//! Format discovery and sandbox process plumbing live outside the core; the
//! graph only sees [`PluginUnit`] trait objects.

use cadenza_core::error::{EngineError, Result};
use cadenza_core::project::{PluginDescriptor, PluginId, TrackId};
use cadenza_midi::MidiMessage;
use crossbeam_channel::{bounded, Receiver};
use dashmap::DashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Plugin state blobs are bounded to 10 MB.
pub const MAX_STATE_BYTES: usize = 10 * 1024 * 1024;

/// Load (and state restore) budget.
pub const LOAD_TIMEOUT: Duration = Duration::from_secs(5);

/// A loaded plugin instance processing the graph format in place.
pub trait PluginUnit: Send {
    fn descriptor(&self) -> &PluginDescriptor;

    /// Reported processing latency; the delay compensator consumes this.
    fn latency_samples(&self) -> usize;

    /// Process interleaved stereo in place.
    fn process(&mut self, buffer: &mut [f32], frames: usize);

    fn set_sample_rate(&mut self, sample_rate: f64);

    /// Sample-time MIDI scheduling. Returns false when the format has no
    /// such interface; callers then dispatch immediately.
    fn schedule_midi(&mut self, _message: MidiMessage, _sample_offset: u64) -> bool {
        false
    }

    fn save_state(&mut self) -> Result<Vec<u8>>;

    fn restore_state(&mut self, data: &[u8]) -> Result<()>;

    fn reset(&mut self);
}

/// The consumed plugin-host interface: load instances from descriptors.
pub trait PluginHost: Send + Sync + 'static {
    fn load(&self, descriptor: &PluginDescriptor, sandboxed: bool) -> Result<Box<dyn PluginUnit>>;
}

/// Descriptors that failed to load; the next attempt defaults to sandboxed.
pub struct PluginGreylist {
    failures: DashMap<String, u32>,
}

impl PluginGreylist {
    pub fn new() -> Self {
        Self {
            failures: DashMap::new(),
        }
    }

    pub fn note_failure(&self, descriptor: &PluginDescriptor) {
        *self.failures.entry(descriptor.uid.clone()).or_insert(0) += 1;
        tracing::warn!(uid = %descriptor.uid, name = %descriptor.name, "plugin greylisted");
    }

    pub fn prefer_sandboxed(&self, descriptor: &PluginDescriptor) -> bool {
        self.failures.get(&descriptor.uid).is_some()
    }

    pub fn failure_count(&self, uid: &str) -> u32 {
        self.failures.get(uid).map(|c| *c).unwrap_or(0)
    }
}

impl Default for PluginGreylist {
    fn default() -> Self {
        Self::new()
    }
}

/// Kick off a load on a worker thread. The caller joins with
/// `recv_timeout(LOAD_TIMEOUT)` and re-checks its captured graph generation
/// before wiring the result in; an abandoned load is dropped by the worker.
pub fn load_async(
    host: Arc<dyn PluginHost>,
    descriptor: PluginDescriptor,
    sandboxed: bool,
    state: Option<Vec<u8>>,
) -> Receiver<Result<Box<dyn PluginUnit>>> {
    let (tx, rx) = bounded(1);
    thread::Builder::new()
        .name("cadenza-plugin-load".into())
        .spawn(move || {
            let result = host.load(&descriptor, sandboxed).and_then(|mut unit| {
                if let Some(blob) = state {
                    if blob.len() > MAX_STATE_BYTES {
                        return Err(EngineError::PluginStateTooLarge {
                            size: blob.len(),
                            limit: MAX_STATE_BYTES,
                        });
                    }
                    unit.restore_state(&blob)?;
                }
                Ok(unit)
            });
            let _ = tx.send(result);
        })
        .expect("spawn plugin load thread");
    rx
}

/// One slot in a chain.
pub struct PluginSlot {
    pub id: PluginId,
    pub bypassed: bool,
    pub sidechain_source: Option<TrackId>,
    unit: Box<dyn PluginUnit>,
}

impl PluginSlot {
    pub fn new(id: PluginId, unit: Box<dyn PluginUnit>) -> Self {
        Self {
            id,
            bypassed: false,
            sidechain_source: None,
            unit,
        }
    }

    pub fn descriptor(&self) -> &PluginDescriptor {
        self.unit.descriptor()
    }

    /// Zero when bypassed.
    pub fn effective_latency(&self) -> usize {
        if self.bypassed {
            0
        } else {
            self.unit.latency_samples()
        }
    }
}

/// A track's ordered plugin chain. "Realized" mirrors whether any
/// non-bypassed plugin exists; an unrealized chain is skipped entirely by
/// the render path.
pub struct PluginChain {
    slots: Vec<PluginSlot>,
    realized: bool,
    sample_rate: f64,
}

impl PluginChain {
    pub fn new(sample_rate: f64) -> Self {
        Self {
            slots: Vec::new(),
            realized: false,
            sample_rate,
        }
    }

    pub fn is_realized(&self) -> bool {
        self.realized
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slot_ids(&self) -> Vec<PluginId> {
        self.slots.iter().map(|s| s.id).collect()
    }

    pub fn insert(&mut self, index: usize, mut slot: PluginSlot) {
        slot.unit.set_sample_rate(self.sample_rate);
        let index = index.min(self.slots.len());
        self.slots.insert(index, slot);
        self.realize();
    }

    pub fn remove(&mut self, id: PluginId) -> Result<PluginSlot> {
        let index = self
            .slots
            .iter()
            .position(|s| s.id == id)
            .ok_or(EngineError::UnknownPlugin(id))?;
        let slot = self.slots.remove(index);
        self.realize();
        Ok(slot)
    }

    pub fn move_slot(&mut self, id: PluginId, to_index: usize) -> Result<()> {
        let from = self
            .slots
            .iter()
            .position(|s| s.id == id)
            .ok_or(EngineError::UnknownPlugin(id))?;
        let slot = self.slots.remove(from);
        self.slots.insert(to_index.min(self.slots.len()), slot);
        Ok(())
    }

    pub fn set_bypass(&mut self, id: PluginId, bypassed: bool) -> Result<()> {
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(EngineError::UnknownPlugin(id))?;
        slot.bypassed = bypassed;
        if !bypassed {
            slot.unit.reset();
        }
        self.realize();
        Ok(())
    }

    pub fn set_sidechain_source(&mut self, id: PluginId, source: Option<TrackId>) -> Result<()> {
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(EngineError::UnknownPlugin(id))?;
        slot.sidechain_source = source;
        Ok(())
    }

    /// Sum of non-bypassed latencies; what PDC sees.
    pub fn active_latency(&self) -> usize {
        self.slots.iter().map(|s| s.effective_latency()).sum()
    }

    /// Re-derive the realized flag from bypass state.
    pub fn realize(&mut self) {
        self.realized = self.slots.iter().any(|s| !s.bypassed);
    }

    pub fn set_sample_rate(&mut self, sample_rate: f64) {
        self.sample_rate = sample_rate;
        for slot in &mut self.slots {
            slot.unit.set_sample_rate(sample_rate);
        }
    }

    /// Schedule a MIDI message on the first plugin exposing the sample-time
    /// interface. Returns false when no plugin accepted it.
    pub fn schedule_midi(&mut self, message: MidiMessage, sample_offset: u64) -> bool {
        for slot in &mut self.slots {
            if !slot.bypassed && slot.unit.schedule_midi(message, sample_offset) {
                return true;
            }
        }
        false
    }

    pub fn process(&mut self, buffer: &mut [f32], frames: usize) {
        if !self.realized {
            return;
        }
        for slot in &mut self.slots {
            if !slot.bypassed {
                slot.unit.process(buffer, frames);
            }
        }
    }

    pub fn reset(&mut self) {
        for slot in &mut self.slots {
            slot.unit.reset();
        }
    }

    /// Collect per-slot state blobs, enforcing the size bound.
    pub fn save_states(&mut self) -> Result<Vec<(PluginId, Vec<u8>)>> {
        let mut states = Vec::with_capacity(self.slots.len());
        for slot in &mut self.slots {
            let blob = slot.unit.save_state()?;
            if blob.len() > MAX_STATE_BYTES {
                return Err(EngineError::PluginStateTooLarge {
                    size: blob.len(),
                    limit: MAX_STATE_BYTES,
                });
            }
            states.push((slot.id, blob));
        }
        Ok(states)
    }

    /// Drop every slot; part of safe node teardown.
    pub fn uninstall(&mut self) {
        self.slots.clear();
        self.realized = false;
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Gain plugin test double with configurable latency.
    pub struct FakePlugin {
        descriptor: PluginDescriptor,
        pub gain: f32,
        pub latency: usize,
        pub state: Vec<u8>,
        pub processed: Arc<AtomicUsize>,
    }

    impl FakePlugin {
        pub fn new(uid: &str, gain: f32, latency: usize) -> Self {
            Self {
                descriptor: PluginDescriptor {
                    uid: uid.into(),
                    name: uid.into(),
                    vendor: "test".into(),
                },
                gain,
                latency,
                state: Vec::new(),
                processed: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl PluginUnit for FakePlugin {
        fn descriptor(&self) -> &PluginDescriptor {
            &self.descriptor
        }

        fn latency_samples(&self) -> usize {
            self.latency
        }

        fn process(&mut self, buffer: &mut [f32], frames: usize) {
            self.processed.fetch_add(1, Ordering::Relaxed);
            for s in &mut buffer[..frames * 2] {
                *s *= self.gain;
            }
        }

        fn set_sample_rate(&mut self, _sample_rate: f64) {}

        fn save_state(&mut self) -> Result<Vec<u8>> {
            Ok(self.state.clone())
        }

        fn restore_state(&mut self, data: &[u8]) -> Result<()> {
            self.state = data.to_vec();
            Ok(())
        }

        fn reset(&mut self) {}
    }

    /// Host double: optionally slow, optionally failing.
    pub struct FakeHost {
        pub fail: bool,
        pub delay: Duration,
        pub latency: usize,
    }

    impl PluginHost for FakeHost {
        fn load(
            &self,
            descriptor: &PluginDescriptor,
            _sandboxed: bool,
        ) -> Result<Box<dyn PluginUnit>> {
            if !self.delay.is_zero() {
                thread::sleep(self.delay);
            }
            if self.fail {
                return Err(EngineError::PluginLoadFailed {
                    name: descriptor.name.clone(),
                    reason: "load refused".into(),
                });
            }
            Ok(Box::new(FakePlugin::new(&descriptor.uid, 1.0, self.latency)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{FakeHost, FakePlugin};
    use super::*;

    fn descriptor(uid: &str) -> PluginDescriptor {
        PluginDescriptor {
            uid: uid.into(),
            name: uid.into(),
            vendor: "test".into(),
        }
    }

    #[test]
    fn chain_realizes_only_with_active_plugins() {
        let mut chain = PluginChain::new(48_000.0);
        assert!(!chain.is_realized());

        chain.insert(0, PluginSlot::new(1, Box::new(FakePlugin::new("a", 0.5, 0))));
        assert!(chain.is_realized());

        chain.set_bypass(1, true).unwrap();
        assert!(!chain.is_realized());
        assert_eq!(chain.active_latency(), 0);
    }

    #[test]
    fn chain_processes_in_slot_order() {
        let mut chain = PluginChain::new(48_000.0);
        chain.insert(0, PluginSlot::new(1, Box::new(FakePlugin::new("a", 0.5, 0))));
        chain.insert(1, PluginSlot::new(2, Box::new(FakePlugin::new("b", 0.5, 0))));

        let mut buf = vec![1.0f32; 8];
        chain.process(&mut buf, 4);
        assert!((buf[0] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn bypassed_slots_are_skipped_and_latency_free() {
        let mut chain = PluginChain::new(48_000.0);
        chain.insert(0, PluginSlot::new(1, Box::new(FakePlugin::new("a", 0.5, 512))));
        chain.insert(1, PluginSlot::new(2, Box::new(FakePlugin::new("b", 0.5, 256))));
        assert_eq!(chain.active_latency(), 768);

        chain.set_bypass(1, true).unwrap();
        assert_eq!(chain.active_latency(), 256);

        let mut buf = vec![1.0f32; 8];
        chain.process(&mut buf, 4);
        assert!((buf[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn move_and_remove() {
        let mut chain = PluginChain::new(48_000.0);
        chain.insert(0, PluginSlot::new(1, Box::new(FakePlugin::new("a", 1.0, 0))));
        chain.insert(1, PluginSlot::new(2, Box::new(FakePlugin::new("b", 1.0, 0))));

        chain.move_slot(2, 0).unwrap();
        assert_eq!(chain.slot_ids(), vec![2, 1]);

        chain.remove(2).unwrap();
        assert_eq!(chain.slot_ids(), vec![1]);
        assert!(matches!(
            chain.remove(99),
            Err(EngineError::UnknownPlugin(99))
        ));
    }

    #[test]
    fn async_load_completes_within_timeout() {
        let host: Arc<dyn PluginHost> = Arc::new(FakeHost {
            fail: false,
            delay: Duration::from_millis(10),
            latency: 64,
        });
        let rx = load_async(host, descriptor("x"), false, None);
        let unit = rx.recv_timeout(LOAD_TIMEOUT).unwrap().unwrap();
        assert_eq!(unit.latency_samples(), 64);
    }

    #[test]
    fn async_load_failure_propagates() {
        let host: Arc<dyn PluginHost> = Arc::new(FakeHost {
            fail: true,
            delay: Duration::ZERO,
            latency: 0,
        });
        let rx = load_async(host, descriptor("x"), false, None);
        assert!(matches!(
            rx.recv_timeout(LOAD_TIMEOUT).unwrap(),
            Err(EngineError::PluginLoadFailed { .. })
        ));
    }

    #[test]
    fn oversized_state_is_rejected() {
        let host: Arc<dyn PluginHost> = Arc::new(FakeHost {
            fail: false,
            delay: Duration::ZERO,
            latency: 0,
        });
        let blob = vec![0u8; MAX_STATE_BYTES + 1];
        let rx = load_async(host, descriptor("x"), false, Some(blob));
        assert!(matches!(
            rx.recv_timeout(LOAD_TIMEOUT).unwrap(),
            Err(EngineError::PluginStateTooLarge { .. })
        ));
    }

    #[test]
    fn greylist_prefers_sandboxed_after_failure() {
        let greylist = PluginGreylist::new();
        let d = descriptor("shady");
        assert!(!greylist.prefer_sandboxed(&d));
        greylist.note_failure(&d);
        assert!(greylist.prefer_sandboxed(&d));
        assert_eq!(greylist.failure_count("shady"), 1);
    }

    #[test]
    fn state_round_trip_through_chain() {
        let mut chain = PluginChain::new(48_000.0);
        let mut plugin = FakePlugin::new("a", 1.0, 0);
        plugin.state = vec![1, 2, 3];
        chain.insert(0, PluginSlot::new(1, Box::new(plugin)));

        let states = chain.save_states().unwrap();
        assert_eq!(states, vec![(1, vec![1, 2, 3])]);
    }
}
