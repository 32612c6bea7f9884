//! SPI adapter over `/dev/spidev<bus>.<cs>`.

use hwbroker_common::error::{BrokerError, BrokerResult};
use hwbroker_common::types::SpiBitOrder;
use nix::errno::Errno;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::path::Path;

const SPI_IOC_MAGIC: u8 = b'k';

nix::ioctl_write_ptr!(spi_set_mode, SPI_IOC_MAGIC, 1, u8);
nix::ioctl_write_ptr!(spi_set_lsb_first, SPI_IOC_MAGIC, 2, u8);
nix::ioctl_write_ptr!(spi_set_bits_per_word, SPI_IOC_MAGIC, 3, u8);
nix::ioctl_write_ptr!(spi_set_max_speed_hz, SPI_IOC_MAGIC, 4, u32);
nix::ioctl_write_buf!(spi_message, SPI_IOC_MAGIC, 0, SpiIocTransfer);

/// Mirror of `struct spi_ioc_transfer`.
#[repr(C)]
#[derive(Debug, Default)]
struct SpiIocTransfer {
    tx_buf: u64,
    rx_buf: u64,
    len: u32,
    speed_hz: u32,
    delay_usecs: u16,
    bits_per_word: u8,
    cs_change: u8,
    tx_nbits: u8,
    rx_nbits: u8,
    word_delay_usecs: u8,
    pad: u8,
}

/// Highest SPI clock mode (CPOL|CPHA).
const MAX_SPI_MODE: u8 = 3;

#[derive(Debug)]
pub struct SpiDevice {
    bus: u32,
    cs: u32,
    file: File,
}

impl SpiDevice {
    pub fn open(dev_root: &Path, bus: u32, cs: u32) -> BrokerResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(dev_root.join(format!("spidev{bus}.{cs}")))?;
        Ok(Self::from_file(bus, cs, file))
    }

    pub fn from_file(bus: u32, cs: u32, file: File) -> Self {
        Self { bus, cs, file }
    }

    pub fn bus(&self) -> u32 {
        self.bus
    }

    pub fn cs(&self) -> u32 {
        self.cs
    }

    pub fn set_mode(&self, mode: u8) -> BrokerResult<()> {
        if mode > MAX_SPI_MODE {
            return Err(BrokerError::from_errno(Errno::EINVAL));
        }
        // SAFETY: the pointer refers to a local for the duration of the call.
        unsafe { spi_set_mode(self.file.as_raw_fd(), &mode) }?;
        Ok(())
    }

    pub fn set_bit_order(&self, order: SpiBitOrder) -> BrokerResult<()> {
        let lsb = u8::from(order == SpiBitOrder::Lsb);
        // SAFETY: as above.
        unsafe { spi_set_lsb_first(self.file.as_raw_fd(), &lsb) }?;
        Ok(())
    }

    pub fn set_bits_per_word(&self, bits: u8) -> BrokerResult<()> {
        // SAFETY: as above.
        unsafe { spi_set_bits_per_word(self.file.as_raw_fd(), &bits) }?;
        Ok(())
    }

    pub fn set_frequency(&self, hz: u32) -> BrokerResult<()> {
        // SAFETY: as above.
        unsafe { spi_set_max_speed_hz(self.file.as_raw_fd(), &hz) }?;
        Ok(())
    }

    pub fn read(&mut self, buf: &mut [u8]) -> BrokerResult<usize> {
        Ok(self.file.read(buf)?)
    }

    pub fn write(&mut self, data: &[u8]) -> BrokerResult<()> {
        self.file.write_all(data)?;
        Ok(())
    }

    /// Full-duplex transfer: `rx` receives as many bytes as `tx` sends.
    pub fn transfer(&self, tx: &[u8], rx: &mut [u8]) -> BrokerResult<()> {
        if tx.len() != rx.len() {
            return Err(BrokerError::from_errno(Errno::EINVAL));
        }
        let len = u32::try_from(tx.len()).map_err(|_| BrokerError::from_errno(Errno::EINVAL))?;
        let message = [SpiIocTransfer {
            tx_buf: tx.as_ptr() as u64,
            rx_buf: rx.as_mut_ptr() as u64,
            len,
            ..SpiIocTransfer::default()
        }];
        // SAFETY: both buffers outlive the call and are `len` bytes long.
        unsafe { spi_message(self.file.as_raw_fd(), &message) }?;
        Ok(())
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}
