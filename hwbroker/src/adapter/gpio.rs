//! GPIO adapter over the sysfs GPIO interface.
//!
//! ```text
//! <root>/export            <- "<pin>"
//! <root>/gpio<pin>/direction  in | out | high | low
//! <root>/gpio<pin>/edge       none | rising | falling | both
//! <root>/gpio<pin>/value      0 | 1
//! <root>/unexport          <- "<pin>"
//! ```
//!
//! The value node appears asynchronously after export (udev fixes its
//! permissions), so opening is split into `export` and `GpioDevice::open`
//! with a readiness probe in between.

use super::sysfs;
use hwbroker_common::error::{BrokerError, BrokerResult};
use hwbroker_common::types::{EdgeMode, GpioDirection};
use std::fs::{File, OpenOptions};
use std::os::fd::{AsFd, BorrowedFd};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Directory of an exported pin.
pub fn pin_dir(root: &Path, pin: u32) -> PathBuf {
    root.join(format!("gpio{pin}"))
}

/// Value node of an exported pin.
pub fn value_path(root: &Path, pin: u32) -> PathBuf {
    pin_dir(root, pin).join("value")
}

/// Export `pin` unless it is already exported.
pub fn export(root: &Path, pin: u32) -> BrokerResult<()> {
    if pin_dir(root, pin).exists() {
        debug!(pin, "gpio already exported");
        return Ok(());
    }
    sysfs::write_attr(&root.join("export"), &pin.to_string())
}

/// Unexport `pin`.
pub fn unexport(root: &Path, pin: u32) -> BrokerResult<()> {
    sysfs::write_attr(&root.join("unexport"), &pin.to_string())
}

/// Parse the textual content of a value node.
///
/// Anything other than `0` or `1` (after trimming whitespace) is an
/// error, never a value.
pub fn parse_value(text: &str) -> BrokerResult<u8> {
    match text.trim() {
        "0" => Ok(0),
        "1" => Ok(1),
        other => Err(BrokerError::Io(format!("unexpected gpio value {other:?}"))),
    }
}

fn parse_direction(text: &str) -> GpioDirection {
    match text {
        "out" => GpioDirection::Out,
        "high" => GpioDirection::OutHigh,
        "low" => GpioDirection::OutLow,
        _ => GpioDirection::In,
    }
}

fn parse_edge(text: &str) -> EdgeMode {
    match text {
        "rising" => EdgeMode::Rising,
        "falling" => EdgeMode::Falling,
        "both" => EdgeMode::Both,
        _ => EdgeMode::None,
    }
}

/// An exported, opened GPIO pin.
#[derive(Debug)]
pub struct GpioDevice {
    pin: u32,
    dir: PathBuf,
    value: File,
    direction: GpioDirection,
    edge: EdgeMode,
}

impl GpioDevice {
    /// Open an exported pin, picking up its current direction and edge.
    pub fn open(root: &Path, pin: u32) -> BrokerResult<Self> {
        let dir = pin_dir(root, pin);
        let value = sysfs::open_rw(&dir.join("value"))?;
        let direction = parse_direction(&sysfs::read_attr(&dir.join("direction"))?);
        let edge = parse_edge(&sysfs::read_attr(&dir.join("edge"))?);
        Ok(Self::from_parts(pin, dir, value, direction, edge))
    }

    /// Assemble a device from an already opened value node.
    pub fn from_parts(
        pin: u32,
        dir: PathBuf,
        value: File,
        direction: GpioDirection,
        edge: EdgeMode,
    ) -> Self {
        Self {
            pin,
            dir,
            value,
            direction,
            edge,
        }
    }

    pub fn pin(&self) -> u32 {
        self.pin
    }

    pub fn direction(&self) -> GpioDirection {
        self.direction
    }

    pub fn edge(&self) -> EdgeMode {
        self.edge
    }

    pub fn set_direction(&mut self, direction: GpioDirection) -> BrokerResult<()> {
        sysfs::write_attr(&self.dir.join("direction"), direction.sysfs_value())?;
        self.direction = direction;
        Ok(())
    }

    /// Record the edge mode. The kernel is asked for both edges whenever
    /// any edge is wanted, so every transition wakes the interrupt watch
    /// and the requested mode is applied by the transition filter.
    pub fn set_edge(&mut self, edge: EdgeMode) -> BrokerResult<()> {
        let kernel_edge = match edge {
            EdgeMode::None => EdgeMode::None,
            _ => EdgeMode::Both,
        };
        sysfs::write_attr(&self.dir.join("edge"), kernel_edge.sysfs_value())?;
        self.edge = edge;
        Ok(())
    }

    pub fn read(&self) -> BrokerResult<u8> {
        parse_value(&sysfs::read_at_start(&self.value)?)
    }

    pub fn write(&self, value: u8) -> BrokerResult<()> {
        let text = match value {
            0 => "0",
            1 => "1",
            _ => return Err(BrokerError::from_errno(nix::errno::Errno::EINVAL)),
        };
        sysfs::write_at_start(&self.value, text)
    }

    /// Open a second, read-only descriptor on the value node for
    /// interrupt watching.
    pub fn open_value_watch(&self) -> BrokerResult<File> {
        Ok(OpenOptions::new().read(true).open(self.dir.join("value"))?)
    }

    /// Descriptor handed back to the client.
    pub fn value_fd(&self) -> BorrowedFd<'_> {
        self.value.as_fd()
    }
}
