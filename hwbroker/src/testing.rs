//! Test doubles for the broker seams.

use crate::adapter::{
    AdcDevice, Device, DeviceAdapter, GpioDevice, I2cDevice, Opening, PwmDevice, ReadinessProbe,
    SpiDevice, UartDevice, adc, gpio, pwm,
};
use crate::irq::{EventSink, IrqReactor, WatchId};
use crate::lifecycle::{LivenessWatcher, WatchToken};
use crate::policy::{AccessPolicy, Decision};
use hwbroker_common::catalog::BoardCatalog;
use hwbroker_common::error::{BrokerError, BrokerResult};
use hwbroker_common::types::{Caller, ClientId, GpioEvent, HandleId, ResourceKey};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::os::fd::BorrowedFd;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tempfile::TempDir;

pub const BOARD: &str = r#"
model = "Test Board"

[gpio]
gpio5 = "29"
gpio6 = "31"

[i2c]
i2c-1 = "3, 5"

[pwm]
pwm0-0 = "12"

[adc]
adc0-0 = ""

[uart]
uart0 = "8 10"

[spi]
spi0-0 = "19 21 23 24"
"#;

pub fn catalog() -> BoardCatalog {
    BoardCatalog::from_descriptor(BOARD).unwrap()
}

pub fn caller(id: u64) -> Caller {
    Caller::new(
        ClientId(id),
        Some(hwbroker_common::types::Credentials {
            pid: 1000 + id as i32,
            uid: 1000,
            gid: 1000,
        }),
    )
}

// ─── Adapter ────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct AdapterLog {
    pub opens: Vec<ResourceKey>,
    pub finishes: Vec<ResourceKey>,
    pub cancels: Vec<ResourceKey>,
    pub closes: Vec<ResourceKey>,
    pub defer_gpio: bool,
    pub fail_open: Option<BrokerError>,
    pub fail_finish: Option<BrokerError>,
    pub fail_close: Option<BrokerError>,
}

/// Adapter that builds real devices over files in a temporary tree and
/// records every call.
#[derive(Clone)]
pub struct RecordingAdapter {
    dir: Rc<TempDir>,
    pub log: Rc<RefCell<AdapterLog>>,
}

impl Default for RecordingAdapter {
    fn default() -> Self {
        Self {
            dir: Rc::new(TempDir::new().unwrap()),
            log: Rc::default(),
        }
    }
}

impl RecordingAdapter {
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn gpio_root(&self) -> PathBuf {
        self.root().join("gpio")
    }

    pub fn opens(&self) -> usize {
        self.log.borrow().opens.len()
    }

    pub fn closes(&self) -> Vec<ResourceKey> {
        self.log.borrow().closes.clone()
    }

    pub fn cancels(&self) -> Vec<ResourceKey> {
        self.log.borrow().cancels.clone()
    }

    /// Overwrite the value node of an opened pin.
    pub fn set_gpio_value(&self, pin: u32, value: &str) {
        fs::write(gpio::value_path(&self.gpio_root(), pin), value).unwrap();
    }

    fn scratch(&self, name: &str) -> File {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.root().join(name))
            .unwrap()
    }

    fn gpio(&self, pin: u32) -> BrokerResult<Device> {
        let root = self.gpio_root();
        let dir = gpio::pin_dir(&root, pin);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("value"), "0\n").unwrap();
        fs::write(dir.join("direction"), "in\n").unwrap();
        fs::write(dir.join("edge"), "none\n").unwrap();
        Ok(Device::Gpio(GpioDevice::open(&root, pin)?))
    }

    fn build(&self, key: &ResourceKey) -> BrokerResult<Device> {
        let root = self.root();
        let device = match *key {
            ResourceKey::Gpio { pin } => return self.gpio(pin),
            ResourceKey::I2c { bus, address } => {
                Device::I2c(I2cDevice::from_file(bus, address, self.scratch("i2c")))
            }
            ResourceKey::Pwm { chip, pin } => {
                let pwm_root = root.join("pwm");
                let dir = pwm::channel_dir(&pwm_root, chip, pin);
                fs::create_dir_all(&dir).unwrap();
                for attr in ["period", "duty_cycle", "polarity", "enable"] {
                    fs::write(dir.join(attr), "0\n").unwrap();
                }
                Device::Pwm(PwmDevice::open(&pwm_root, chip, pin)?)
            }
            ResourceKey::Adc { device, channel } => {
                let iio_root = root.join("iio");
                let path = adc::raw_path(&iio_root, device, channel);
                fs::create_dir_all(path.parent().unwrap()).unwrap();
                fs::write(&path, "1234\n").unwrap();
                Device::Adc(AdcDevice::open(&iio_root, device, channel)?)
            }
            ResourceKey::Uart { port } => {
                Device::Uart(UartDevice::from_file(port, self.scratch("uart")))
            }
            ResourceKey::Spi { bus, cs } => {
                Device::Spi(SpiDevice::from_file(bus, cs, self.scratch("spi")))
            }
        };
        Ok(device)
    }
}

impl DeviceAdapter for RecordingAdapter {
    fn open(&mut self, key: &ResourceKey) -> BrokerResult<Opening> {
        self.log.borrow_mut().opens.push(*key);
        if let Some(err) = self.log.borrow_mut().fail_open.take() {
            return Err(err);
        }
        if let ResourceKey::Gpio { pin } = *key {
            if self.log.borrow().defer_gpio {
                return Ok(Opening::Deferred(ReadinessProbe {
                    path: gpio::value_path(&self.gpio_root(), pin),
                }));
            }
        }
        Ok(Opening::Ready(self.build(key)?))
    }

    fn finish_open(&mut self, key: &ResourceKey) -> BrokerResult<Device> {
        self.log.borrow_mut().finishes.push(*key);
        if let Some(err) = self.log.borrow_mut().fail_finish.take() {
            return Err(err);
        }
        self.build(key)
    }

    fn cancel_open(&mut self, key: &ResourceKey) {
        self.log.borrow_mut().cancels.push(*key);
    }

    fn close(&mut self, device: Device) -> BrokerResult<()> {
        let mut log = self.log.borrow_mut();
        log.closes.push(device.key());
        drop(device);
        match log.fail_close.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

// ─── Reactor ────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct ReactorState {
    next: u64,
    armed: HashMap<WatchId, HandleId>,
    disarmed: Vec<WatchId>,
    fail_next: bool,
}

#[derive(Clone, Default)]
pub struct MockReactor {
    state: Rc<RefCell<ReactorState>>,
}

impl MockReactor {
    pub fn watch_for(&self, handle: HandleId) -> Option<WatchId> {
        self.state
            .borrow()
            .armed
            .iter()
            .find(|(_, h)| **h == handle)
            .map(|(w, _)| *w)
    }

    pub fn armed_count(&self) -> usize {
        self.state.borrow().armed.len()
    }

    pub fn disarmed(&self) -> Vec<WatchId> {
        self.state.borrow().disarmed.clone()
    }

    pub fn fail_next_arm(&self) {
        self.state.borrow_mut().fail_next = true;
    }
}

impl IrqReactor for MockReactor {
    fn arm(&mut self, handle: HandleId, _fd: BorrowedFd<'_>) -> BrokerResult<WatchId> {
        let mut state = self.state.borrow_mut();
        if std::mem::take(&mut state.fail_next) {
            return Err(BrokerError::Io("arm failed".into()));
        }
        state.next += 1;
        let watch = WatchId(state.next);
        state.armed.insert(watch, handle);
        Ok(watch)
    }

    fn disarm(&mut self, watch: WatchId) {
        let mut state = self.state.borrow_mut();
        state.armed.remove(&watch);
        state.disarmed.push(watch);
    }
}

// ─── Event sink ─────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct RecordingSink {
    events: Rc<RefCell<Vec<(ClientId, HandleId, GpioEvent)>>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<(ClientId, HandleId, GpioEvent)> {
        self.events.borrow().clone()
    }
}

impl EventSink for RecordingSink {
    fn emit(&mut self, owner: ClientId, handle: HandleId, event: GpioEvent) {
        self.events.borrow_mut().push((owner, handle, event));
    }
}

// ─── Liveness ───────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct WatcherState {
    next: u64,
    active: BTreeMap<u64, ClientId>,
    fail_next: bool,
}

#[derive(Clone, Default)]
pub struct MockWatcher {
    state: Rc<RefCell<WatcherState>>,
}

impl MockWatcher {
    /// Watched clients, in watch order.
    pub fn active(&self) -> Vec<ClientId> {
        self.state.borrow().active.values().copied().collect()
    }

    pub fn fail_next(&self) {
        self.state.borrow_mut().fail_next = true;
    }
}

impl LivenessWatcher for MockWatcher {
    fn watch(&mut self, client: ClientId) -> BrokerResult<WatchToken> {
        let mut state = self.state.borrow_mut();
        if std::mem::take(&mut state.fail_next) {
            return Err(BrokerError::Io("client not connected".into()));
        }
        state.next += 1;
        let token = state.next;
        state.active.insert(token, client);
        Ok(WatchToken(token))
    }

    fn unwatch(&mut self, token: WatchToken) {
        self.state.borrow_mut().active.remove(&token.0);
    }
}

// ─── Policy ─────────────────────────────────────────────────────────

#[derive(Debug)]
struct PolicyState {
    decision: Decision,
    checks: usize,
    forgotten: Vec<ClientId>,
}

#[derive(Clone)]
pub struct FixedPolicy {
    state: Rc<RefCell<PolicyState>>,
}

impl FixedPolicy {
    pub fn new(decision: Decision) -> Self {
        Self {
            state: Rc::new(RefCell::new(PolicyState {
                decision,
                checks: 0,
                forgotten: Vec::new(),
            })),
        }
    }

    pub fn set(&self, decision: Decision) {
        self.state.borrow_mut().decision = decision;
    }

    pub fn checks(&self) -> usize {
        self.state.borrow().checks
    }

    pub fn forgotten(&self) -> Vec<ClientId> {
        self.state.borrow().forgotten.clone()
    }
}

impl AccessPolicy for FixedPolicy {
    fn check(&mut self, caller: &Caller) -> BrokerResult<Decision> {
        let mut state = self.state.borrow_mut();
        state.checks += 1;
        if caller.credentials.is_none() {
            return Err(BrokerError::Unknown("no credentials".into()));
        }
        Ok(state.decision)
    }

    fn forget(&mut self, client: ClientId) {
        self.state.borrow_mut().forgotten.push(client);
    }
}
