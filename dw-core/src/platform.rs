//! Platform memory topology from SMBIOS
//!
//! Discovery needs two facts from firmware: the processor vendor (which tells us
//! where the chipset SMBus controller lives) and the list of memory devices.
//! On Linux the kernel exports each SMBIOS structure as
//! `/sys/firmware/dmi/entries/<type>-<n>/raw`; a JSON dump of the same data can
//! stand in for it.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::constants::{paths, platform, smbus};
use crate::error::{DimmwatchError, Result};

/// Memory technology reported by SMBIOS type 17
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryType {
    Ddr4,
    Ddr5,
    #[serde(untagged)]
    Other(u8),
}

impl MemoryType {
    pub fn from_smbios(code: u8) -> Self {
        match code {
            platform::MEMORY_TYPE_DDR5 => Self::Ddr5,
            platform::MEMORY_TYPE_DDR4 => Self::Ddr4,
            other => Self::Other(other),
        }
    }
}

/// One populated or empty memory socket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryDevice {
    pub memory_type: MemoryType,
    #[serde(default)]
    pub part_number: String,
    #[serde(default)]
    pub bank_locator: String,
    #[serde(default)]
    pub device_locator: String,
    #[serde(default)]
    pub serial_number: String,
    /// Configured speed in MT/s
    #[serde(default)]
    pub configured_speed_mts: u32,
    #[serde(default)]
    pub size_mb: u64,
}

impl MemoryDevice {
    pub fn is_ddr5(&self) -> bool {
        self.memory_type == MemoryType::Ddr5
    }

    /// Part number and both locators are present
    pub fn has_identity(&self) -> bool {
        !self.part_number.is_empty()
            && !self.bank_locator.is_empty()
            && !self.device_locator.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorInfo {
    pub manufacturer: String,
}

/// The subset of SMBIOS that discovery consumes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlatformTables {
    #[serde(default)]
    pub processors: Vec<ProcessorInfo>,
    #[serde(default)]
    pub memory_devices: Vec<MemoryDevice>,
}

impl PlatformTables {
    /// Read from the kernel's SMBIOS export
    pub fn from_sysfs() -> Result<Self> {
        Self::from_dmi_entries(paths::DMI_ENTRIES)
    }

    /// Read from a directory laid out like `/sys/firmware/dmi/entries`
    pub fn from_dmi_entries(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let mut entries: Vec<(u8, u32, Vec<u8>)> = Vec::new();

        for entry in fs::read_dir(root).map_err(|e| {
            DimmwatchError::firmware(format!("cannot read {}: {}", root.display(), e))
        })? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some((kind, index)) = parse_entry_name(&name) else {
                continue;
            };
            if kind != platform::SMBIOS_PROCESSOR && kind != platform::SMBIOS_MEMORY_DEVICE {
                continue;
            }
            match fs::read(entry.path().join("raw")) {
                Ok(raw) => entries.push((kind, index, raw)),
                Err(e) => debug!("Skipping DMI entry {}: {}", name, e),
            }
        }
        // Firmware order, not directory order.
        entries.sort_by_key(|(kind, index, _)| (*kind, *index));

        let mut tables = PlatformTables::default();
        for (kind, _, raw) in &entries {
            let Some(structure) = Structure::parse(raw) else {
                continue;
            };
            match *kind {
                platform::SMBIOS_PROCESSOR => tables.processors.push(structure.processor()),
                platform::SMBIOS_MEMORY_DEVICE => {
                    tables.memory_devices.push(structure.memory_device())
                }
                _ => {}
            }
        }
        info!(
            "SMBIOS: {} processor(s), {} memory device(s)",
            tables.processors.len(),
            tables.memory_devices.len()
        );
        Ok(tables)
    }

    /// Load a JSON dump
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&data)?)
    }

    pub fn ddr5_count(&self) -> usize {
        self.memory_devices.iter().filter(|d| d.is_ddr5()).count()
    }
}

/// SMBus host controller base for this platform, or 0 when there is none.
///
/// Only AMD platforms with DDR5 are known to expose the SPD5 hubs on the FCH
/// controller at its fixed base.
pub fn detect_smbus_base(tables: &PlatformTables) -> u16 {
    let Some(cpu) = tables.processors.first() else {
        return 0;
    };
    if cpu.manufacturer == platform::AMD_MANUFACTURER && tables.ddr5_count() > 0 {
        smbus::AMD_FCH_BASE
    } else {
        0
    }
}

fn parse_entry_name(name: &str) -> Option<(u8, u32)> {
    let (kind, index) = name.split_once('-')?;
    Some((kind.parse().ok()?, index.parse().ok()?))
}

/// One raw SMBIOS structure: formatted area plus string set
struct Structure<'a> {
    formatted: &'a [u8],
    strings: Vec<&'a [u8]>,
}

impl<'a> Structure<'a> {
    fn parse(raw: &'a [u8]) -> Option<Self> {
        let length = usize::from(*raw.get(1)?);
        if length < 4 || raw.len() < length {
            return None;
        }
        let formatted = &raw[..length];
        let mut strings = Vec::new();
        let mut rest = &raw[length..];
        while let Some(end) = rest.iter().position(|b| *b == 0) {
            if end == 0 {
                break;
            }
            strings.push(&rest[..end]);
            rest = &rest[end + 1..];
        }
        Some(Self { formatted, strings })
    }

    fn byte(&self, offset: usize) -> Option<u8> {
        self.formatted.get(offset).copied()
    }

    fn word(&self, offset: usize) -> Option<u16> {
        let bytes = self.formatted.get(offset..offset + 2)?;
        Some(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn dword(&self, offset: usize) -> Option<u32> {
        let bytes = self.formatted.get(offset..offset + 4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// String referenced by the index byte at `offset`; empty when absent
    fn string(&self, offset: usize) -> String {
        let index = match self.byte(offset) {
            Some(0) | None => return String::new(),
            Some(i) => usize::from(i),
        };
        self.strings
            .get(index - 1)
            .map(|s| String::from_utf8_lossy(s).trim().to_string())
            .unwrap_or_default()
    }

    fn processor(&self) -> ProcessorInfo {
        ProcessorInfo {
            manufacturer: self.string(0x07),
        }
    }

    fn memory_device(&self) -> MemoryDevice {
        MemoryDevice {
            memory_type: MemoryType::from_smbios(self.byte(0x12).unwrap_or(0)),
            device_locator: self.string(0x10),
            bank_locator: self.string(0x11),
            serial_number: self.string(0x18),
            part_number: self.string(0x1A),
            configured_speed_mts: self.configured_speed(),
            size_mb: self.size_mb(),
        }
    }

    fn size_mb(&self) -> u64 {
        match self.word(0x0C) {
            None | Some(0) | Some(0xFFFF) => 0,
            // Size lives in the extended field
            Some(0x7FFF) => u64::from(self.dword(0x1C).unwrap_or(0) & 0x7FFF_FFFF),
            // Bit 15 set: kilobyte granularity
            Some(size) if size & 0x8000 != 0 => u64::from(size & 0x7FFF) / 1024,
            Some(size) => u64::from(size),
        }
    }

    fn configured_speed(&self) -> u32 {
        match self.word(0x20) {
            None | Some(0) => 0,
            Some(0xFFFF) => self.dword(0x58).unwrap_or(0),
            Some(speed) => u32::from(speed),
        }
    }
}
