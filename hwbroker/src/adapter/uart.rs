//! UART adapter over `/dev/ttyS<port>`.
//!
//! The line is put in raw mode at open. Reads are non-blocking, so an
//! empty receive buffer surfaces as `TryAgain`.

use hwbroker_common::error::{BrokerError, BrokerResult};
use hwbroker_common::types::{UartFlowControl, UartMode, UartParity};
use nix::errno::Errno;
use nix::sys::termios::{
    self, BaudRate, ControlFlags, FlushArg, InputFlags, SetArg, Termios,
};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

/// Map a numeric baud rate to the termios constant.
pub fn baud_rate(baud: u32) -> BrokerResult<BaudRate> {
    let rate = match baud {
        0 => BaudRate::B0,
        50 => BaudRate::B50,
        75 => BaudRate::B75,
        110 => BaudRate::B110,
        134 => BaudRate::B134,
        150 => BaudRate::B150,
        200 => BaudRate::B200,
        300 => BaudRate::B300,
        600 => BaudRate::B600,
        1200 => BaudRate::B1200,
        1800 => BaudRate::B1800,
        2400 => BaudRate::B2400,
        4800 => BaudRate::B4800,
        9600 => BaudRate::B9600,
        19200 => BaudRate::B19200,
        38400 => BaudRate::B38400,
        57600 => BaudRate::B57600,
        115200 => BaudRate::B115200,
        230400 => BaudRate::B230400,
        _ => return Err(BrokerError::from_errno(Errno::EINVAL)),
    };
    Ok(rate)
}

/// Apply byte size, parity and stop bits to a termios snapshot.
pub fn apply_mode(tio: &mut Termios, mode: UartMode) -> BrokerResult<()> {
    let size = match mode.byte_size {
        5 => ControlFlags::CS5,
        6 => ControlFlags::CS6,
        7 => ControlFlags::CS7,
        8 => ControlFlags::CS8,
        _ => return Err(BrokerError::from_errno(Errno::EINVAL)),
    };
    let two_stop = match mode.stop_bits {
        1 => false,
        2 => true,
        _ => return Err(BrokerError::from_errno(Errno::EINVAL)),
    };

    let flags = &mut tio.control_flags;
    flags.remove(ControlFlags::CSIZE);
    flags.insert(size);

    match mode.parity {
        UartParity::None => flags.remove(ControlFlags::PARENB | ControlFlags::PARODD),
        UartParity::Even => {
            flags.insert(ControlFlags::PARENB);
            flags.remove(ControlFlags::PARODD);
        }
        UartParity::Odd => flags.insert(ControlFlags::PARENB | ControlFlags::PARODD),
    }
    flags.set(ControlFlags::CSTOPB, two_stop);
    Ok(())
}

pub fn apply_flow_control(tio: &mut Termios, flow: UartFlowControl) {
    tio.control_flags.set(ControlFlags::CRTSCTS, flow.rtscts);
    tio.input_flags
        .set(InputFlags::IXON | InputFlags::IXOFF, flow.xonxoff);
}

#[derive(Debug)]
pub struct UartDevice {
    port: u32,
    file: File,
}

impl UartDevice {
    pub fn open(dev_root: &Path, port: u32) -> BrokerResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK)
            .open(dev_root.join(format!("ttyS{port}")))?;

        let mut tio = termios::tcgetattr(&file)?;
        termios::cfmakeraw(&mut tio);
        tio.control_flags
            .insert(ControlFlags::CLOCAL | ControlFlags::CREAD);
        termios::tcsetattr(&file, SetArg::TCSANOW, &tio)?;
        Ok(Self::from_file(port, file))
    }

    /// Wrap an already configured descriptor.
    pub fn from_file(port: u32, file: File) -> Self {
        Self { port, file }
    }

    pub fn port(&self) -> u32 {
        self.port
    }

    pub fn flush(&self) -> BrokerResult<()> {
        termios::tcflush(&self.file, FlushArg::TCIOFLUSH)?;
        Ok(())
    }

    pub fn set_baud_rate(&self, baud: u32) -> BrokerResult<()> {
        let rate = baud_rate(baud)?;
        self.update(|tio| Ok(termios::cfsetspeed(tio, rate)?))
    }

    pub fn set_mode(&self, mode: UartMode) -> BrokerResult<()> {
        self.update(|tio| apply_mode(tio, mode))
    }

    pub fn set_flow_control(&self, flow: UartFlowControl) -> BrokerResult<()> {
        self.update(|tio| {
            apply_flow_control(tio, flow);
            Ok(())
        })
    }

    pub fn read(&mut self, buf: &mut [u8]) -> BrokerResult<usize> {
        Ok(self.file.read(buf)?)
    }

    pub fn write(&mut self, data: &[u8]) -> BrokerResult<()> {
        self.file.write_all(data)?;
        Ok(())
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }

    fn update(&self, f: impl FnOnce(&mut Termios) -> BrokerResult<()>) -> BrokerResult<()> {
        let mut tio = termios::tcgetattr(&self.file)?;
        f(&mut tio)?;
        termios::tcsetattr(&self.file, SetArg::TCSANOW, &tio)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::pty::openpty;

    fn pty_termios() -> Termios {
        let pty = openpty(None, None).unwrap();
        termios::tcgetattr(&pty.slave).unwrap()
    }

    #[test]
    fn test_baud_rate_table() {
        assert_eq!(baud_rate(115200).unwrap(), BaudRate::B115200);
        assert_eq!(baud_rate(9600).unwrap(), BaudRate::B9600);
        assert!(matches!(baud_rate(12345), Err(BrokerError::Io(_))));
    }

    #[test]
    fn test_apply_mode_sets_framing() {
        let mut tio = pty_termios();
        apply_mode(
            &mut tio,
            UartMode {
                byte_size: 7,
                parity: UartParity::Odd,
                stop_bits: 2,
            },
        )
        .unwrap();
        let flags = tio.control_flags;
        assert!(flags.contains(ControlFlags::CS7));
        assert!(flags.contains(ControlFlags::PARENB | ControlFlags::PARODD));
        assert!(flags.contains(ControlFlags::CSTOPB));

        apply_mode(
            &mut tio,
            UartMode {
                byte_size: 8,
                parity: UartParity::None,
                stop_bits: 1,
            },
        )
        .unwrap();
        assert!(!tio.control_flags.contains(ControlFlags::PARENB));
        assert!(!tio.control_flags.contains(ControlFlags::CSTOPB));
    }

    #[test]
    fn test_apply_mode_rejects_bad_framing() {
        let mut tio = pty_termios();
        let bad = UartMode {
            byte_size: 9,
            parity: UartParity::None,
            stop_bits: 1,
        };
        assert!(apply_mode(&mut tio, bad).is_err());
    }

    #[test]
    fn test_flow_control_flags() {
        let mut tio = pty_termios();
        apply_flow_control(
            &mut tio,
            UartFlowControl {
                xonxoff: true,
                rtscts: false,
            },
        );
        assert!(tio.input_flags.contains(InputFlags::IXON | InputFlags::IXOFF));
        assert!(!tio.control_flags.contains(ControlFlags::CRTSCTS));
    }
}
