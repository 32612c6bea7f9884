//! I2C adapter over `/dev/i2c-<bus>` character devices.

use hwbroker_common::error::{BrokerError, BrokerResult};
use hwbroker_common::proto::{SmbusSize, SmbusTransaction};
use nix::errno::Errno;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::path::Path;

const I2C_SMBUS_READ: u8 = 1;
const I2C_SMBUS_WRITE: u8 = 0;
/// Kernel `I2C_SMBUS_BLOCK_MAX`.
const I2C_SMBUS_BLOCK_MAX: usize = 32;

// I2C_SLAVE binds the descriptor to a 7-bit target address.
nix::ioctl_write_int_bad!(i2c_set_slave, 0x0703);
// I2C_SMBUS performs one SMBus transaction.
nix::ioctl_write_ptr_bad!(i2c_smbus, 0x0720, I2cSmbusIoctlData);

/// Mirror of `union i2c_smbus_data`: byte, word or length-prefixed block.
#[repr(C)]
struct I2cSmbusData {
    block: [u8; I2C_SMBUS_BLOCK_MAX + 2],
}

/// Mirror of `struct i2c_smbus_ioctl_data`.
#[repr(C)]
struct I2cSmbusIoctlData {
    read_write: u8,
    command: u8,
    size: u32,
    data: *mut I2cSmbusData,
}

/// An opened I2C bus bound to one target address.
#[derive(Debug)]
pub struct I2cDevice {
    bus: u32,
    address: u16,
    file: File,
}

impl I2cDevice {
    /// Open the bus and bind it to `address`.
    pub fn open(dev_root: &Path, bus: u32, address: u16) -> BrokerResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(dev_root.join(format!("i2c-{bus}")))?;
        let target = libc::c_int::from(address);
        // SAFETY: fd is valid for the lifetime of `file`; I2C_SLAVE takes
        // the address by value.
        unsafe { i2c_set_slave(file.as_raw_fd(), target) }?;
        Ok(Self::from_file(bus, address, file))
    }

    /// Wrap an already bound descriptor.
    pub fn from_file(bus: u32, address: u16, file: File) -> Self {
        Self { bus, address, file }
    }

    pub fn bus(&self) -> u32 {
        self.bus
    }

    pub fn address(&self) -> u16 {
        self.address
    }

    pub fn read(&mut self, buf: &mut [u8]) -> BrokerResult<usize> {
        Ok(self.file.read(buf)?)
    }

    pub fn write(&mut self, data: &[u8]) -> BrokerResult<()> {
        self.file.write_all(data)?;
        Ok(())
    }

    /// Run one SMBus transaction; returns the bytes read (empty for writes).
    pub fn smbus(&mut self, tx: &SmbusTransaction) -> BrokerResult<Vec<u8>> {
        let mut data = I2cSmbusData {
            block: [0; I2C_SMBUS_BLOCK_MAX + 2],
        };
        if !tx.read {
            encode_smbus_data(tx, &mut data.block)?;
        }

        let args = I2cSmbusIoctlData {
            read_write: if tx.read { I2C_SMBUS_READ } else { I2C_SMBUS_WRITE },
            command: tx.command,
            size: tx.size as u32,
            data: &mut data,
        };
        // SAFETY: `args.data` points at a live, correctly sized union for
        // the duration of the call.
        unsafe { i2c_smbus(self.file.as_raw_fd(), &args) }?;

        if !tx.read {
            return Ok(Vec::new());
        }
        Ok(decode_smbus_data(tx.size, &data.block))
    }
}

fn encode_smbus_data(tx: &SmbusTransaction, block: &mut [u8]) -> BrokerResult<()> {
    let invalid = || BrokerError::from_errno(Errno::EINVAL);
    match tx.size {
        SmbusSize::Quick => {}
        SmbusSize::Byte | SmbusSize::ByteData => {
            block[0] = *tx.data.first().ok_or_else(invalid)?;
        }
        SmbusSize::WordData => {
            if tx.data.len() < 2 {
                return Err(invalid());
            }
            let word = u16::from_le_bytes([tx.data[0], tx.data[1]]);
            block[..2].copy_from_slice(&word.to_ne_bytes());
        }
        SmbusSize::BlockData => {
            let len = tx.data.len();
            if len == 0 || len > I2C_SMBUS_BLOCK_MAX {
                return Err(invalid());
            }
            block[0] = len as u8;
            block[1..=len].copy_from_slice(&tx.data);
        }
    }
    Ok(())
}

fn decode_smbus_data(size: SmbusSize, block: &[u8]) -> Vec<u8> {
    match size {
        SmbusSize::Quick => Vec::new(),
        SmbusSize::Byte | SmbusSize::ByteData => vec![block[0]],
        SmbusSize::WordData => {
            let word = u16::from_ne_bytes([block[0], block[1]]);
            word.to_le_bytes().to_vec()
        }
        SmbusSize::BlockData => {
            let len = usize::from(block[0]).min(I2C_SMBUS_BLOCK_MAX);
            block[1..=len].to_vec()
        }
    }
}
