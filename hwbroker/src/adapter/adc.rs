//! ADC adapter over IIO sysfs: `<root>/iio:device<D>/in_voltage<C>_raw`.

use super::sysfs;
use hwbroker_common::error::{BrokerError, BrokerResult};
use std::fs::{File, OpenOptions};
use std::os::fd::{AsFd, BorrowedFd};
use std::path::{Path, PathBuf};

pub fn raw_path(root: &Path, device: u32, channel: u32) -> PathBuf {
    root.join(format!("iio:device{device}"))
        .join(format!("in_voltage{channel}_raw"))
}

#[derive(Debug)]
pub struct AdcDevice {
    device: u32,
    channel: u32,
    raw: File,
}

impl AdcDevice {
    pub fn open(root: &Path, device: u32, channel: u32) -> BrokerResult<Self> {
        let raw = OpenOptions::new()
            .read(true)
            .open(raw_path(root, device, channel))?;
        Ok(Self {
            device,
            channel,
            raw,
        })
    }

    pub fn device(&self) -> u32 {
        self.device
    }

    pub fn channel(&self) -> u32 {
        self.channel
    }

    /// Sample the channel.
    pub fn read(&self) -> BrokerResult<u32> {
        let text = sysfs::read_at_start(&self.raw)?;
        text.trim()
            .parse()
            .map_err(|_| BrokerError::Io(format!("unexpected adc sample {:?}", text.trim())))
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.raw.as_fd()
    }
}
