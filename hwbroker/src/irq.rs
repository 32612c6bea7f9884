//! GPIO interrupt engine.
//!
//! Per GPIO handle: `Unregistered -> Armed -> Unregistered`. Each
//! registration owns a separate read-only descriptor on the pin's value
//! node, watched by the reactor for `POLLPRI`. Wakes are handled
//! synchronously on the loop: read, parse, filter by edge mode, emit.

use crate::adapter::{GpioDevice, gpio, sysfs};
use hwbroker_common::error::BrokerResult;
use hwbroker_common::types::{ClientId, EdgeMode, GpioEvent, HandleId};
use std::collections::HashMap;
use std::fs::File;
use std::os::fd::{AsFd, BorrowedFd};
use tracing::{debug, warn};

/// Identity of one reactor watch. A wake carrying an id that is no
/// longer registered for its handle is stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(pub u64);

/// Event-loop seam: watch a descriptor for priority readiness.
pub trait IrqReactor {
    fn arm(&mut self, handle: HandleId, fd: BorrowedFd<'_>) -> BrokerResult<WatchId>;
    fn disarm(&mut self, watch: WatchId);
}

/// Notification seam towards the client transport.
pub trait EventSink {
    fn emit(&mut self, owner: ClientId, handle: HandleId, event: GpioEvent);
}

/// Transition filter over successive value reads.
///
/// A read only counts as a transition when it differs from the previous
/// one; the first read after registration sets the baseline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EdgeFilter {
    last: Option<u8>,
}

impl EdgeFilter {
    pub fn new(baseline: Option<u8>) -> Self {
        Self { last: baseline }
    }

    /// Feed one value; `true` if it is a qualifying edge under `mode`.
    pub fn observe(&mut self, mode: EdgeMode, value: u8) -> bool {
        let changed = self.last.is_some_and(|last| last != value);
        self.last = Some(value);
        match mode {
            EdgeMode::None => false,
            EdgeMode::Rising => changed && value == 1,
            EdgeMode::Falling => changed && value == 0,
            EdgeMode::Both => changed,
        }
    }
}

#[derive(Debug)]
struct GpioInterruptState {
    value: File,
    watch: WatchId,
    filter: EdgeFilter,
    armed: bool,
}

pub struct GpioInterruptEngine {
    reactor: Box<dyn IrqReactor>,
    sink: Box<dyn EventSink>,
    states: HashMap<HandleId, GpioInterruptState>,
}

impl GpioInterruptEngine {
    pub fn new(reactor: Box<dyn IrqReactor>, sink: Box<dyn EventSink>) -> Self {
        Self {
            reactor,
            sink,
            states: HashMap::new(),
        }
    }

    pub fn is_registered(&self, handle: HandleId) -> bool {
        self.states.contains_key(&handle)
    }

    pub fn is_armed(&self, handle: HandleId) -> bool {
        self.states.get(&handle).is_some_and(|s| s.armed)
    }

    /// Start interrupt delivery for `handle`. Registering twice is a no-op.
    pub fn register(&mut self, handle: HandleId, device: &GpioDevice) -> BrokerResult<()> {
        if self.states.contains_key(&handle) {
            return Ok(());
        }

        let value = device.open_value_watch()?;
        // Discard read: clears the pending edge and seeds the filter.
        let baseline = gpio::parse_value(&sysfs::read_at_start(&value)?).ok();
        let watch = self.reactor.arm(handle, value.as_fd())?;

        debug!(%handle, pin = device.pin(), ?baseline, "gpio irq armed");
        self.states.insert(
            handle,
            GpioInterruptState {
                value,
                watch,
                filter: EdgeFilter::new(baseline),
                armed: true,
            },
        );
        Ok(())
    }

    /// Stop interrupt delivery. No-op when not registered.
    pub fn unregister(&mut self, handle: HandleId) {
        if let Some(state) = self.states.remove(&handle) {
            if state.armed {
                self.reactor.disarm(state.watch);
            }
            debug!(%handle, "gpio irq unregistered");
        }
    }

    /// Handle one reactor wake for `handle`.
    ///
    /// Errors are reported to the caller for logging; they never reach a
    /// client. A read failure disarms the watch.
    pub fn on_wake(
        &mut self,
        handle: HandleId,
        watch: WatchId,
        timestamp_us: u64,
        device: &GpioDevice,
        owner: ClientId,
    ) -> BrokerResult<()> {
        let Some(state) = self.states.get_mut(&handle) else {
            debug!(%handle, "wake for unregistered handle");
            return Ok(());
        };
        if state.watch != watch {
            debug!(%handle, ?watch, "stale gpio wake");
            return Ok(());
        }
        if !state.armed {
            return Ok(());
        }
        if !device.direction().is_input() {
            return Ok(());
        }

        let text = match sysfs::read_at_start(&state.value) {
            Ok(text) => text,
            Err(err) => {
                warn!(%handle, error = %err, "gpio value read failed, disarming");
                self.reactor.disarm(state.watch);
                state.armed = false;
                return Err(err);
            }
        };
        let value = gpio::parse_value(&text)?;

        if state.filter.observe(device.edge(), value) {
            let event = GpioEvent {
                pin: device.pin(),
                value,
                timestamp_us,
            };
            self.sink.emit(owner, handle, event);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockReactor, RecordingSink};
    use hwbroker_common::types::GpioDirection;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    const OWNER: ClientId = ClientId(1);
    const HANDLE: HandleId = HandleId(1);

    fn count(mode: EdgeMode, stream: &[u8]) -> usize {
        let mut filter = EdgeFilter::default();
        stream.iter().filter(|&&v| filter.observe(mode, v)).count()
    }

    #[test]
    fn test_edge_filter_streams() {
        let stream = [0, 1, 0, 1, 1, 0];
        assert_eq!(count(EdgeMode::Rising, &stream), 2);
        assert_eq!(count(EdgeMode::Falling, &stream), 2);
        assert_eq!(count(EdgeMode::None, &stream), 0);
        assert_eq!(count(EdgeMode::Both, &stream), 4);
    }

    #[test]
    fn test_edge_filter_baseline() {
        let mut filter = EdgeFilter::new(Some(0));
        assert!(filter.observe(EdgeMode::Rising, 1));
        assert!(!filter.observe(EdgeMode::Rising, 1));
    }

    struct Fixture {
        _dir: TempDir,
        value_path: std::path::PathBuf,
        device: GpioDevice,
        reactor: MockReactor,
        sink: RecordingSink,
        engine: GpioInterruptEngine,
    }

    fn fixture(direction: GpioDirection, edge: EdgeMode) -> Fixture {
        let dir = TempDir::new().unwrap();
        let pin_dir = dir.path().join("gpio5");
        fs::create_dir_all(&pin_dir).unwrap();
        let value_path = pin_dir.join("value");
        fs::write(&value_path, "0\n").unwrap();
        let value = sysfs::open_rw(&value_path).unwrap();
        let device = GpioDevice::from_parts(5, pin_dir, value, direction, edge);

        let reactor = MockReactor::default();
        let sink = RecordingSink::default();
        let engine = GpioInterruptEngine::new(Box::new(reactor.clone()), Box::new(sink.clone()));
        Fixture {
            _dir: dir,
            value_path,
            device,
            reactor,
            sink,
            engine,
        }
    }

    fn drive(f: &mut Fixture, path: &Path, values: &[u8]) {
        let watch = f.reactor.watch_for(HANDLE).unwrap();
        for (i, v) in values.iter().enumerate() {
            fs::write(path, format!("{v}\n")).unwrap();
            f.engine
                .on_wake(HANDLE, watch, i as u64, &f.device, OWNER)
                .unwrap();
        }
    }

    #[test]
    fn test_register_wake_emits_rising_edges() {
        let mut f = fixture(GpioDirection::In, EdgeMode::Rising);
        f.engine.register(HANDLE, &f.device).unwrap();
        assert!(f.engine.is_armed(HANDLE));

        // Baseline 0 comes from the discard read.
        let path = f.value_path.clone();
        drive(&mut f, &path, &[1, 0, 1, 1, 0]);

        let events = f.sink.events();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|(owner, handle, e)| {
            *owner == OWNER && *handle == HANDLE && e.pin == 5 && e.value == 1
        }));
        assert_eq!(events[0].2.timestamp_us, 0);
        assert_eq!(events[1].2.timestamp_us, 2);
    }

    #[test]
    fn test_output_pin_wakes_ignored() {
        let mut f = fixture(GpioDirection::Out, EdgeMode::Both);
        f.engine.register(HANDLE, &f.device).unwrap();
        let path = f.value_path.clone();
        drive(&mut f, &path, &[1, 0, 1]);
        assert!(f.sink.events().is_empty());
    }

    #[test]
    fn test_garbage_value_is_error_not_event() {
        let mut f = fixture(GpioDirection::In, EdgeMode::Both);
        f.engine.register(HANDLE, &f.device).unwrap();
        let watch = f.reactor.watch_for(HANDLE).unwrap();

        fs::write(&f.value_path, "x\n").unwrap();
        assert!(
            f.engine
                .on_wake(HANDLE, watch, 0, &f.device, OWNER)
                .is_err()
        );
        assert!(f.sink.events().is_empty());
        assert!(f.engine.is_armed(HANDLE));
    }

    #[test]
    fn test_output_pin_garbage_value_ignored() {
        let mut f = fixture(GpioDirection::Out, EdgeMode::Both);
        f.engine.register(HANDLE, &f.device).unwrap();
        let watch = f.reactor.watch_for(HANDLE).unwrap();

        fs::write(&f.value_path, "x\n").unwrap();
        f.engine
            .on_wake(HANDLE, watch, 0, &f.device, OWNER)
            .unwrap();
        assert!(f.sink.events().is_empty());
    }

    #[test]
    fn test_read_failure_disarms_and_later_wakes_ignored() {
        let mut f = fixture(GpioDirection::In, EdgeMode::Both);
        f.engine.register(HANDLE, &f.device).unwrap();
        let watch = f.reactor.watch_for(HANDLE).unwrap();

        // Write-only descriptor: every read fails.
        let write_only = fs::OpenOptions::new()
            .write(true)
            .open(&f.value_path)
            .unwrap();
        f.engine.states.get_mut(&HANDLE).unwrap().value = write_only;

        fs::write(&f.value_path, "1\n").unwrap();
        assert!(
            f.engine
                .on_wake(HANDLE, watch, 0, &f.device, OWNER)
                .is_err()
        );
        assert!(!f.engine.is_armed(HANDLE));
        assert_eq!(f.reactor.armed_count(), 0);

        f.engine
            .on_wake(HANDLE, watch, 1, &f.device, OWNER)
            .unwrap();
        assert!(f.sink.events().is_empty());
        assert!(!f.engine.is_armed(HANDLE));
    }

    #[test]
    fn test_stale_watch_ignored() {
        let mut f = fixture(GpioDirection::In, EdgeMode::Both);
        f.engine.register(HANDLE, &f.device).unwrap();
        let first = f.reactor.watch_for(HANDLE).unwrap();
        f.engine.unregister(HANDLE);
        f.engine.register(HANDLE, &f.device).unwrap();
        let second = f.reactor.watch_for(HANDLE).unwrap();
        assert_ne!(first, second);

        fs::write(&f.value_path, "1\n").unwrap();
        f.engine
            .on_wake(HANDLE, first, 0, &f.device, OWNER)
            .unwrap();
        assert!(f.sink.events().is_empty());

        f.engine
            .on_wake(HANDLE, second, 1, &f.device, OWNER)
            .unwrap();
        assert_eq!(f.sink.events().len(), 1);
    }

    #[test]
    fn test_register_idempotent_and_unregister_disarms() {
        let mut f = fixture(GpioDirection::In, EdgeMode::Both);
        f.engine.register(HANDLE, &f.device).unwrap();
        f.engine.register(HANDLE, &f.device).unwrap();
        assert_eq!(f.reactor.armed_count(), 1);

        f.engine.unregister(HANDLE);
        assert!(!f.engine.is_registered(HANDLE));
        assert_eq!(f.reactor.armed_count(), 0);
        // Already unregistered.
        f.engine.unregister(HANDLE);
    }

    #[test]
    fn test_arm_failure_leaves_nothing_registered() {
        let mut f = fixture(GpioDirection::In, EdgeMode::Both);
        f.reactor.fail_next_arm();
        assert!(f.engine.register(HANDLE, &f.device).is_err());
        assert!(!f.engine.is_registered(HANDLE));
    }

    #[test]
    fn test_register_fails_when_value_node_gone() {
        let mut f = fixture(GpioDirection::In, EdgeMode::Both);
        fs::remove_file(&f.value_path).unwrap();
        assert!(f.engine.register(HANDLE, &f.device).is_err());
        assert_eq!(f.reactor.armed_count(), 0);
    }
}
