//! SPD5 hub protocol (JEDEC SPD5118 / SPD5108)
//!
//! Each DDR5 module carries a hub at SMBus address `0x50 | hid`. The hub exposes
//! a small register file (MR0..MR127), a thermal sensor on SPD5118 parts, and
//! 1 KiB of SPD EEPROM that is read through 128 byte pages selected in MR11.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, trace};

use crate::constants::{smbus, spd5, timeouts};
use crate::error::{DimmwatchError, Result};
use crate::hw::arbiter::{BusArbiter, BusGuard};
use crate::hw::port::PortIo;
use crate::hw::smbus::SmbusDevice;

/// Hub registers used by this crate
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Register {
    /// Device type, low byte (MR1 holds the high byte)
    DeviceType = 0,
    /// Legacy mode device configuration: EEPROM page pointer
    LegacyConfig = 11,
    /// Thermal sensor configuration
    ThermalConfig = 26,
    /// Device status
    DeviceStatus = 48,
    /// Current temperature, low byte (MR50 holds the high byte)
    Temperature = 49,
}

/// Hub variants that answer with a recognized MR0/MR1 code
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub enum DeviceType {
    /// Hub with integrated thermal sensor
    Spd5118,
    /// Hub without thermal sensor
    Spd5108,
}

impl DeviceType {
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            spd5::DEVICE_TYPE_SPD5118 => Some(Self::Spd5118),
            spd5::DEVICE_TYPE_SPD5108 => Some(Self::Spd5108),
            _ => None,
        }
    }

    pub fn code(self) -> u16 {
        match self {
            Self::Spd5118 => spd5::DEVICE_TYPE_SPD5118,
            Self::Spd5108 => spd5::DEVICE_TYPE_SPD5108,
        }
    }

    pub fn has_thermal_sensor(self) -> bool {
        matches!(self, Self::Spd5118)
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spd5118 => write!(f, "SPD5118"),
            Self::Spd5108 => write!(f, "SPD5108"),
        }
    }
}

/// Outcome of a configuration write that may already be in effect
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConfigChange {
    /// The register already held the requested state; nothing was written
    Unchanged,
    /// The register was written and read back with the new value
    Changed,
}

impl ConfigChange {
    pub fn is_changed(self) -> bool {
        self == Self::Changed
    }
}

/// Identity strings stored in the module's SPD EEPROM
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct HubIdentity {
    pub serial_number: String,
    pub part_number: String,
}

/// Convert the MR49/MR50 word to degrees Celsius.
///
/// Bits 12:2 hold an 11 bit two's complement value in quarter degrees.
pub fn decode_temperature(raw: u16) -> f32 {
    sign_extend(i32::from(raw >> 2), 10) as f32 * spd5::TEMPERATURE_RESOLUTION
}

/// Sign-extend `value` whose sign bit sits at `index`.
fn sign_extend(value: i32, index: u32) -> i32 {
    let shift = 31 - index;
    (value << shift) >> shift
}

/// MR11 accepts page numbers 0-7 only.
pub fn is_valid_page(page: u8) -> bool {
    (page >> 4) & 0x0F == 0 && page & 0x08 == 0
}

/// A hub that acknowledged its address and reported a recognized device type.
///
/// Only [`Spd5Hub::detect`] creates one, so holding a value is proof of presence.
pub struct Spd5Hub {
    device: SmbusDevice,
    arbiter: Arc<BusArbiter>,
    hid: u8,
    device_type: DeviceType,
}

impl fmt::Debug for Spd5Hub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Spd5Hub")
            .field("hid", &self.hid)
            .field("device_type", &self.device_type)
            .field("device", &self.device)
            .finish()
    }
}

impl Spd5Hub {
    /// Look for a hub in slot `hid` (0-7) on the bus at `smbus_base`.
    pub fn detect(
        port: Arc<dyn PortIo>,
        arbiter: Arc<BusArbiter>,
        smbus_base: u16,
        hid: u8,
    ) -> Result<Self> {
        Self::detect_with_poll_limit(port, arbiter, smbus_base, hid, smbus::MAX_POLL_ITERATIONS)
    }

    /// [`Spd5Hub::detect`] with an explicit transaction poll limit
    pub fn detect_with_poll_limit(
        port: Arc<dyn PortIo>,
        arbiter: Arc<BusArbiter>,
        smbus_base: u16,
        hid: u8,
        poll_limit: u32,
    ) -> Result<Self> {
        if hid >= spd5::MAX_HUBS {
            return Err(DimmwatchError::InvalidSlot(hid));
        }
        let address = spd5::BASE_ADDRESS | hid;
        let device = SmbusDevice::new(port, smbus_base, address).with_poll_limit(poll_limit);

        let code = {
            let _guard = arbiter.acquire(timeouts::DETECT)?;
            device.probe()?;
            device.read_word(Register::DeviceType as u8)?
        };

        let device_type = DeviceType::from_code(code).ok_or_else(|| {
            debug!("Address 0x{:02X} answered with unknown device type 0x{:04X}", address, code);
            DimmwatchError::DeviceAbsent { address }
        })?;

        info!("Found {} hub at 0x{:02X} (hid {})", device_type, address, hid);
        Ok(Self {
            device,
            arbiter,
            hid,
            device_type,
        })
    }

    /// Probe all eight hub IDs and return the hubs that answered
    pub fn detect_all(
        port: Arc<dyn PortIo>,
        arbiter: Arc<BusArbiter>,
        smbus_base: u16,
    ) -> Vec<Self> {
        (0..spd5::MAX_HUBS)
            .filter_map(|hid| {
                Self::detect(port.clone(), arbiter.clone(), smbus_base, hid)
                    .map_err(|e| trace!("hid {}: {}", hid, e))
                    .ok()
            })
            .collect()
    }

    pub fn hid(&self) -> u8 {
        self.hid
    }

    pub fn address(&self) -> u8 {
        self.device.address()
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    fn require_thermal_sensor(&self) -> Result<()> {
        if self.device_type.has_thermal_sensor() {
            Ok(())
        } else {
            Err(DimmwatchError::UnsupportedDevice(format!(
                "{} has no thermal sensor",
                self.device_type
            )))
        }
    }

    /// Current module temperature in degrees Celsius
    pub fn read_temperature(&self) -> Result<f32> {
        self.require_thermal_sensor()?;
        let _guard = self.arbiter.acquire(timeouts::TEMPERATURE)?;
        let raw = self.device.read_word(Register::Temperature as u8)?;
        Ok(decode_temperature(raw))
    }

    /// Whether the thermal sensor is running (MR26 disable bit clear)
    pub fn thermal_sensor_enabled(&self) -> Result<bool> {
        self.require_thermal_sensor()?;
        let _guard = self.arbiter.acquire(timeouts::CONFIGURE)?;
        let config = self.device.read_byte(Register::ThermalConfig as u8)?;
        Ok(config & spd5::TS_DISABLE == 0)
    }

    /// Turn the thermal sensor on or off, verifying the write by reading it back.
    pub fn set_thermal_sensor_enabled(&self, enabled: bool) -> Result<ConfigChange> {
        self.require_thermal_sensor()?;
        let _guard = self.arbiter.acquire(timeouts::CONFIGURE)?;

        let register = Register::ThermalConfig as u8;
        let current = self.device.read_byte(register)?;
        let disabled = current & spd5::TS_DISABLE != 0;
        if disabled != enabled {
            return Ok(ConfigChange::Unchanged);
        }

        let wanted = if enabled {
            current & !spd5::TS_DISABLE
        } else {
            current | spd5::TS_DISABLE
        };
        self.device.write_byte(register, wanted)?;

        let actual = self.device.read_byte(register)?;
        if actual != wanted {
            return Err(DimmwatchError::VerifyFailed {
                register,
                expected: wanted,
                actual,
            });
        }
        debug!(
            "hid {} thermal sensor {}",
            self.hid,
            if enabled { "enabled" } else { "disabled" }
        );
        Ok(ConfigChange::Changed)
    }

    /// Raw MR48 device status
    pub fn device_status(&self) -> Result<u8> {
        let _guard = self.arbiter.acquire(timeouts::CONFIGURE)?;
        self.device.read_byte(Register::DeviceStatus as u8)
    }

    /// Point MR11 at an EEPROM page. Invalid pages are refused without a write.
    fn eeprom_set_page(&self, _guard: &BusGuard<'_>, page: u8) -> Result<()> {
        if !is_valid_page(page) {
            return Err(DimmwatchError::PageInvalid { page });
        }
        self.device.write_byte(Register::LegacyConfig as u8, page)
    }

    /// Read one byte of EEPROM at an absolute address.
    ///
    /// A refused page pointer is not fatal: the read goes to whichever page the
    /// hub last had selected.
    fn eeprom_read_byte(&self, guard: &BusGuard<'_>, address: u16) -> Result<u8> {
        // Pages past 0xFF saturate and stay invalid
        let page = u8::try_from(address / spd5::EEPROM_PAGE_SIZE).unwrap_or(u8::MAX);
        match self.eeprom_set_page(guard, page) {
            Ok(()) => {}
            Err(DimmwatchError::PageInvalid { page }) => {
                trace!(
                    "EEPROM address 0x{:03X}: page {} refused, reading current page",
                    address,
                    page
                );
            }
            Err(e) => return Err(e),
        }
        let offset = (address & spd5::EEPROM_OFFSET_MASK) as u8 | spd5::EEPROM_READ_SELECT;
        self.device.read_byte(offset)
    }

    /// Read an inclusive EEPROM range under one bus acquisition
    pub fn read_eeprom(&self, start: u16, end: u16) -> Result<Vec<u8>> {
        let guard = self.arbiter.acquire(timeouts::IDENTITY)?;
        (start..=end)
            .map(|address| self.eeprom_read_byte(&guard, address))
            .collect()
    }

    /// Module part number (ASCII, stops at the first nul)
    pub fn module_part_number(&self) -> Result<String> {
        let guard = self.arbiter.acquire(timeouts::IDENTITY)?;
        let mut part = String::new();
        for address in spd5::PART_NUMBER_START..=spd5::PART_NUMBER_END {
            let byte = self.eeprom_read_byte(&guard, address)?;
            if byte == 0 {
                break;
            }
            part.push(if byte.is_ascii() { byte as char } else { '?' });
        }
        Ok(part)
    }

    /// Module serial number as eight upper-case hex digits
    pub fn module_serial_number(&self) -> Result<String> {
        let guard = self.arbiter.acquire(timeouts::IDENTITY)?;
        let mut bytes = [0u8; 4];
        for (slot, address) in bytes
            .iter_mut()
            .zip(spd5::SERIAL_NUMBER_START..=spd5::SERIAL_NUMBER_END)
        {
            *slot = self.eeprom_read_byte(&guard, address)?;
        }
        Ok(format!("{:08X}", u32::from_be_bytes(bytes)))
    }

    /// Both identity strings; a failed read leaves that field empty.
    pub fn identity(&self) -> HubIdentity {
        let serial_number = self.module_serial_number().unwrap_or_else(|e| {
            debug!("hid {} serial number unavailable: {}", self.hid, e);
            String::new()
        });
        let part_number = self.module_part_number().unwrap_or_else(|e| {
            debug!("hid {} part number unavailable: {}", self.hid, e);
            String::new()
        });
        HubIdentity {
            serial_number,
            part_number,
        }
    }
}
