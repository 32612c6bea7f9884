//! Device adapters.
//!
//! Thin wrappers over the kernel interfaces of each device family. The
//! registry only talks to them through [`DeviceAdapter`]; everything past
//! open/close goes through the [`Device`] the adapter returns.

pub mod adc;
pub mod gpio;
pub mod i2c;
pub mod pwm;
pub mod spi;
pub mod sysfs;
pub mod uart;

use hwbroker_common::config::SysfsConfig;
use hwbroker_common::error::{BrokerError, BrokerResult};
use hwbroker_common::types::{DeviceFamily, ResourceKey};
use std::os::fd::BorrowedFd;
use std::path::PathBuf;
use tracing::{debug, warn};

pub use adc::AdcDevice;
pub use gpio::GpioDevice;
pub use i2c::I2cDevice;
pub use pwm::PwmDevice;
pub use spi::SpiDevice;
pub use uart::UartDevice;

/// An opened device, one variant per family.
#[derive(Debug)]
pub enum Device {
    Gpio(GpioDevice),
    I2c(I2cDevice),
    Pwm(PwmDevice),
    Adc(AdcDevice),
    Uart(UartDevice),
    Spi(SpiDevice),
}

impl Device {
    pub fn family(&self) -> DeviceFamily {
        match self {
            Self::Gpio(_) => DeviceFamily::Gpio,
            Self::I2c(_) => DeviceFamily::I2c,
            Self::Pwm(_) => DeviceFamily::Pwm,
            Self::Adc(_) => DeviceFamily::Adc,
            Self::Uart(_) => DeviceFamily::Uart,
            Self::Spi(_) => DeviceFamily::Spi,
        }
    }

    pub fn key(&self) -> ResourceKey {
        match self {
            Self::Gpio(d) => ResourceKey::Gpio { pin: d.pin() },
            Self::I2c(d) => ResourceKey::I2c {
                bus: d.bus(),
                address: d.address(),
            },
            Self::Pwm(d) => ResourceKey::Pwm {
                chip: d.chip(),
                pin: d.pin(),
            },
            Self::Adc(d) => ResourceKey::Adc {
                device: d.device(),
                channel: d.channel(),
            },
            Self::Uart(d) => ResourceKey::Uart { port: d.port() },
            Self::Spi(d) => ResourceKey::Spi {
                bus: d.bus(),
                cs: d.cs(),
            },
        }
    }

    /// Descriptors passed back to the client on open. I2C is driven
    /// through the broker only.
    pub fn client_fds(&self) -> Vec<BorrowedFd<'_>> {
        match self {
            Self::Gpio(d) => vec![d.value_fd()],
            Self::I2c(_) => Vec::new(),
            Self::Pwm(d) => d.fds().to_vec(),
            Self::Adc(d) => vec![d.fd()],
            Self::Uart(d) => vec![d.fd()],
            Self::Spi(d) => vec![d.fd()],
        }
    }
}

/// Node that must become accessible before a deferred open can finish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessProbe {
    pub path: PathBuf,
}

/// Result of the first open step.
#[derive(Debug)]
pub enum Opening {
    Ready(Device),
    /// Exported but not yet usable; call `finish_open` once the probe
    /// path is accessible, or `cancel_open` to give up.
    Deferred(ReadinessProbe),
}

/// Open/close seam between the registry and the hardware.
pub trait DeviceAdapter {
    fn open(&mut self, key: &ResourceKey) -> BrokerResult<Opening>;

    /// Complete an open that returned `Opening::Deferred`.
    fn finish_open(&mut self, key: &ResourceKey) -> BrokerResult<Device>;

    /// Undo the side effects of a deferred open.
    fn cancel_open(&mut self, key: &ResourceKey);

    /// Tear the device down. The descriptors are closed even on error.
    fn close(&mut self, device: Device) -> BrokerResult<()>;
}

/// Production adapter over sysfs and `/dev` nodes.
#[derive(Debug, Clone)]
pub struct SysfsAdapter {
    roots: SysfsConfig,
}

impl SysfsAdapter {
    pub fn new(roots: SysfsConfig) -> Self {
        Self { roots }
    }

    fn open_gpio(&self, pin: u32) -> BrokerResult<Device> {
        let root = &self.roots.gpio_root;
        match GpioDevice::open(root, pin) {
            Ok(device) => Ok(Device::Gpio(device)),
            Err(err) => {
                if let Err(unexport_err) = gpio::unexport(root, pin) {
                    warn!(pin, error = %unexport_err, "gpio unexport after failed open");
                }
                Err(err)
            }
        }
    }
}

impl DeviceAdapter for SysfsAdapter {
    fn open(&mut self, key: &ResourceKey) -> BrokerResult<Opening> {
        let roots = &self.roots;
        let device = match *key {
            ResourceKey::Gpio { pin } => {
                gpio::export(&roots.gpio_root, pin)?;
                let path = gpio::value_path(&roots.gpio_root, pin);
                if !sysfs::is_accessible(&path) {
                    debug!(pin, path = %path.display(), "gpio value node not ready");
                    return Ok(Opening::Deferred(ReadinessProbe { path }));
                }
                self.open_gpio(pin)?
            }
            ResourceKey::I2c { bus, address } => {
                Device::I2c(I2cDevice::open(&roots.dev_root, bus, address)?)
            }
            ResourceKey::Pwm { chip, pin } => {
                Device::Pwm(PwmDevice::open(&roots.pwm_root, chip, pin)?)
            }
            ResourceKey::Adc { device, channel } => {
                Device::Adc(AdcDevice::open(&roots.iio_root, device, channel)?)
            }
            ResourceKey::Uart { port } => Device::Uart(UartDevice::open(&roots.dev_root, port)?),
            ResourceKey::Spi { bus, cs } => Device::Spi(SpiDevice::open(&roots.dev_root, bus, cs)?),
        };
        Ok(Opening::Ready(device))
    }

    fn finish_open(&mut self, key: &ResourceKey) -> BrokerResult<Device> {
        match *key {
            ResourceKey::Gpio { pin } => self.open_gpio(pin),
            other => Err(BrokerError::Unknown(format!("no deferred open for {other}"))),
        }
    }

    fn cancel_open(&mut self, key: &ResourceKey) {
        if let ResourceKey::Gpio { pin } = *key {
            if let Err(err) = gpio::unexport(&self.roots.gpio_root, pin) {
                warn!(pin, error = %err, "gpio unexport after cancelled open");
            }
        }
    }

    fn close(&mut self, device: Device) -> BrokerResult<()> {
        match device {
            Device::Gpio(gpio) => {
                let pin = gpio.pin();
                drop(gpio);
                gpio::unexport(&self.roots.gpio_root, pin)
            }
            Device::Pwm(pwm) => {
                let (chip, pin) = (pwm.chip(), pwm.pin());
                drop(pwm);
                pwm::unexport(&self.roots.pwm_root, chip, pin)
            }
            // Dropping closes the descriptor.
            Device::I2c(_) | Device::Adc(_) | Device::Uart(_) | Device::Spi(_) => Ok(()),
        }
    }
}
