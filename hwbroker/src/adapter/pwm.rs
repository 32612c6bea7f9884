//! PWM adapter over the sysfs PWM interface.
//!
//! ```text
//! <root>/pwmchip<chip>/export          <- "<pin>"
//! <root>/pwmchip<chip>/pwm<pin>/period       ns
//! <root>/pwmchip<chip>/pwm<pin>/duty_cycle   ns
//! <root>/pwmchip<chip>/pwm<pin>/polarity     normal | inversed
//! <root>/pwmchip<chip>/pwm<pin>/enable       0 | 1
//! <root>/pwmchip<chip>/unexport        <- "<pin>"
//! ```

use super::sysfs;
use hwbroker_common::error::BrokerResult;
use hwbroker_common::types::PwmPolarity;
use std::fs::File;
use std::os::fd::{AsFd, BorrowedFd};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub fn chip_dir(root: &Path, chip: u32) -> PathBuf {
    root.join(format!("pwmchip{chip}"))
}

pub fn channel_dir(root: &Path, chip: u32, pin: u32) -> PathBuf {
    chip_dir(root, chip).join(format!("pwm{pin}"))
}

/// Export channel `pin` of `chip` unless it is already exported.
pub fn export(root: &Path, chip: u32, pin: u32) -> BrokerResult<()> {
    if channel_dir(root, chip, pin).exists() {
        debug!(chip, pin, "pwm already exported");
        return Ok(());
    }
    sysfs::write_attr(&chip_dir(root, chip).join("export"), &pin.to_string())
}

pub fn unexport(root: &Path, chip: u32, pin: u32) -> BrokerResult<()> {
    sysfs::write_attr(&chip_dir(root, chip).join("unexport"), &pin.to_string())
}

/// An exported PWM channel with its four control attributes held open.
#[derive(Debug)]
pub struct PwmDevice {
    chip: u32,
    pin: u32,
    period: File,
    duty_cycle: File,
    polarity: File,
    enable: File,
}

impl PwmDevice {
    /// Export the channel and open its attributes. On failure the
    /// channel is unexported again.
    pub fn open(root: &Path, chip: u32, pin: u32) -> BrokerResult<Self> {
        export(root, chip, pin)?;
        match Self::open_exported(root, chip, pin) {
            Ok(device) => Ok(device),
            Err(err) => {
                if let Err(unexport_err) = unexport(root, chip, pin) {
                    warn!(chip, pin, error = %unexport_err, "pwm unexport after failed open");
                }
                Err(err)
            }
        }
    }

    fn open_exported(root: &Path, chip: u32, pin: u32) -> BrokerResult<Self> {
        let dir = channel_dir(root, chip, pin);
        Ok(Self {
            chip,
            pin,
            period: sysfs::open_rw(&dir.join("period"))?,
            duty_cycle: sysfs::open_rw(&dir.join("duty_cycle"))?,
            polarity: sysfs::open_rw(&dir.join("polarity"))?,
            enable: sysfs::open_rw(&dir.join("enable"))?,
        })
    }

    pub fn chip(&self) -> u32 {
        self.chip
    }

    pub fn pin(&self) -> u32 {
        self.pin
    }

    pub fn set_period(&self, period_ns: u64) -> BrokerResult<()> {
        sysfs::write_at_start(&self.period, &period_ns.to_string())
    }

    pub fn set_duty_cycle(&self, duty_cycle_ns: u64) -> BrokerResult<()> {
        sysfs::write_at_start(&self.duty_cycle, &duty_cycle_ns.to_string())
    }

    pub fn set_polarity(&self, polarity: PwmPolarity) -> BrokerResult<()> {
        sysfs::write_at_start(&self.polarity, polarity.sysfs_value())
    }

    pub fn set_enabled(&self, enabled: bool) -> BrokerResult<()> {
        sysfs::write_at_start(&self.enable, if enabled { "1" } else { "0" })
    }

    pub fn period(&self) -> BrokerResult<u64> {
        sysfs::parse_u64(&sysfs::read_at_start(&self.period)?)
    }

    /// Descriptors handed to the client: period, duty_cycle, polarity, enable.
    pub fn fds(&self) -> [BorrowedFd<'_>; 4] {
        [
            self.period.as_fd(),
            self.duty_cycle.as_fd(),
            self.polarity.as_fd(),
            self.enable.as_fd(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    /// A chip directory whose channel already exists.
    fn fake_channel(root: &Path, chip: u32, pin: u32) {
        let dir = channel_dir(root, chip, pin);
        fs::create_dir_all(&dir).unwrap();
        for attr in ["period", "duty_cycle", "polarity", "enable"] {
            fs::write(dir.join(attr), "0\n").unwrap();
        }
        fs::write(chip_dir(root, chip).join("unexport"), "").unwrap();
    }

    #[test]
    fn test_open_and_configure() {
        let root = TempDir::new().unwrap();
        fake_channel(root.path(), 0, 1);

        let pwm = PwmDevice::open(root.path(), 0, 1).unwrap();
        pwm.set_period(20_000_000).unwrap();
        pwm.set_enabled(true).unwrap();
        assert_eq!(pwm.period().unwrap(), 20_000_000);

        let enable = channel_dir(root.path(), 0, 1).join("enable");
        assert_eq!(fs::read_to_string(enable).unwrap().trim(), "1");
        assert_eq!(pwm.fds().len(), 4);
    }

    #[test]
    fn test_failed_open_unexports() {
        let root = TempDir::new().unwrap();
        let chip = chip_dir(root.path(), 2);
        fs::create_dir_all(&chip).unwrap();
        fs::write(chip.join("export"), "").unwrap();
        fs::write(chip.join("unexport"), "").unwrap();

        // Export succeeds but the channel directory never appears.
        assert!(PwmDevice::open(root.path(), 2, 0).is_err());
        assert_eq!(fs::read_to_string(chip.join("unexport")).unwrap(), "0");
    }

    #[test]
    fn test_failed_unexport_keeps_open_error() {
        let root = TempDir::new().unwrap();
        let dir = channel_dir(root.path(), 3, 0);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("period"), "0\n").unwrap();
        // Writes to a directory fail, so the rollback cannot succeed.
        fs::create_dir_all(chip_dir(root.path(), 3).join("unexport")).unwrap();

        let expected = sysfs::open_rw(&dir.join("duty_cycle")).unwrap_err();
        let err = PwmDevice::open(root.path(), 3, 0).unwrap_err();
        assert_eq!(err, expected);
    }
}
