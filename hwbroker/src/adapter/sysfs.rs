//! Attribute-file helpers shared by the sysfs-backed adapters.

use hwbroker_common::error::{BrokerError, BrokerResult};
use nix::unistd::{AccessFlags, access};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::Path;

/// Largest attribute we ever read back (values are short decimal text).
const ATTR_BUF_LEN: usize = 64;

/// Write `value` to an attribute file in one `write(2)`, the way
/// `echo value > attr` does.
pub fn write_attr(path: &Path, value: &str) -> BrokerResult<()> {
    let mut file = OpenOptions::new().write(true).truncate(true).open(path)?;
    file.write_all(value.as_bytes())?;
    Ok(())
}

/// Read an attribute file, trimmed.
pub fn read_attr(path: &Path) -> BrokerResult<String> {
    let text = std::fs::read_to_string(path)?;
    Ok(text.trim().to_string())
}

/// Read an open attribute from offset 0.
///
/// Rewinding is what re-arms `POLLPRI` on sysfs value files, so value
/// reads always go through here.
pub fn read_at_start(file: &File) -> BrokerResult<String> {
    let mut buf = [0u8; ATTR_BUF_LEN];
    let n = file.read_at(&mut buf, 0)?;
    Ok(String::from_utf8_lossy(&buf[..n]).into_owned())
}

/// Overwrite an open attribute from offset 0.
pub fn write_at_start(file: &File, value: &str) -> BrokerResult<()> {
    let n = file.write_at(value.as_bytes(), 0)?;
    if n != value.len() {
        return Err(BrokerError::Io(format!(
            "short attribute write ({n}/{} bytes)",
            value.len()
        )));
    }
    Ok(())
}

/// Open an attribute for reading and writing.
pub fn open_rw(path: &Path) -> BrokerResult<File> {
    Ok(OpenOptions::new().read(true).write(true).open(path)?)
}

/// `true` once the node exists and the broker may read and write it.
pub fn is_accessible(path: &Path) -> bool {
    access(path, AccessFlags::R_OK | AccessFlags::W_OK).is_ok()
}

/// Parse a decimal attribute value.
pub fn parse_u64(text: &str) -> BrokerResult<u64> {
    text.trim()
        .parse()
        .map_err(|_| BrokerError::Io(format!("unexpected attribute value {text:?}")))
}
