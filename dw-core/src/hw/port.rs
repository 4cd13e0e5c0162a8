//! Privileged port I/O
//!
//! The SMBus host controller lives in x86 I/O port space. Everything above this
//! module talks to it through [`PortIo`], so the protocol engine can run against
//! `/dev/port`, a mock, or the software controller in [`crate::sim`].

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use tracing::{trace, warn};

use crate::constants::{paths, smbus};
use crate::error::{DimmwatchError, Result};

/// Byte-wide access to I/O ports.
///
/// Implementations must be usable from every polling thread; serialization of
/// multi-register sequences is the job of [`crate::hw::arbiter::BusArbiter`].
#[cfg_attr(test, mockall::automock)]
pub trait PortIo: Send + Sync {
    /// Read one byte from an I/O port
    fn read_port(&self, port: u16) -> u8;

    /// Write one byte to an I/O port
    fn write_port(&self, port: u16, value: u8);
}

/// Port access through the Linux `/dev/port` character device.
///
/// The file offset is the port number, so a positional one-byte read or write
/// becomes a single `inb`/`outb` in the kernel.
#[derive(Debug)]
pub struct DevPort {
    file: File,
    path: PathBuf,
}

impl DevPort {
    /// Open the default `/dev/port` device (requires root)
    pub fn open() -> Result<Self> {
        Self::open_path(paths::DEV_PORT)
    }

    /// Open a port device at an explicit path
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| DimmwatchError::PortAccess {
                path: path.clone(),
                source,
            })?;
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PortIo for DevPort {
    fn read_port(&self, port: u16) -> u8 {
        let mut buf = [0u8; 1];
        match self.file.read_exact_at(&mut buf, u64::from(port)) {
            Ok(()) => {
                trace!("inb 0x{:04X} -> 0x{:02X}", port, buf[0]);
                buf[0]
            }
            Err(e) => {
                // An unreadable port floats high, same as an absent device.
                warn!("Port read 0x{:04X} via {} failed: {}", port, self.path.display(), e);
                smbus::BYTE_SENTINEL
            }
        }
    }

    fn write_port(&self, port: u16, value: u8) {
        trace!("outb 0x{:04X} <- 0x{:02X}", port, value);
        if let Err(e) = self.file.write_all_at(&[value], u64::from(port)) {
            warn!("Port write 0x{:04X} via {} failed: {}", port, self.path.display(), e);
        }
    }
}
