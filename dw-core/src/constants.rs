//! Constants and configuration values for Dimmwatch
//!
//! Centralizes register offsets, protocol limits, paths, and timeouts.
//! Never use magic numbers in other files - add them here first.

/// System paths
pub mod paths {
    /// Linux port I/O device (requires root)
    pub const DEV_PORT: &str = "/dev/port";

    /// Raw SMBIOS structures exported by the kernel, one directory per structure
    pub const DMI_ENTRIES: &str = "/sys/firmware/dmi/entries";

    /// Whole-system memory counters
    pub const PROC_MEMINFO: &str = "/proc/meminfo";

    /// Lock file shared with every other process that pokes the SMBus host controller
    pub const SMBUS_LOCK_FILE: &str = "/run/lock/dimmwatch-smbus.lock";
}

/// SMBus host controller register layout (AMD FCH, i801-compatible)
pub mod smbus {
    use std::time::Duration;

    /// Host controller I/O base on AMD FCH chipsets
    pub const AMD_FCH_BASE: u16 = 0x0B00;

    /// Register offsets relative to the host controller base
    pub const HOST_STATUS: u16 = 0;
    pub const HOST_CONTROL: u16 = 2;
    pub const HOST_COMMAND: u16 = 3;
    pub const TARGET_ADDRESS: u16 = 4;
    pub const HOST_DATA0: u16 = 5;
    pub const HOST_DATA1: u16 = 6;
    pub const AUX_CONTROL: u16 = 13;

    /// Direction bit appended to the 7-bit target address
    pub const READ: u8 = 0x01;
    pub const WRITE: u8 = 0x00;

    /// Default number of status polls before a transaction is declared hung
    pub const MAX_POLL_ITERATIONS: u32 = 1000;

    /// Values returned by reads on an absent bus
    pub const BYTE_SENTINEL: u8 = 0xFF;
    pub const WORD_SENTINEL: u16 = 0xFFFF;

    /// How long the kill bit is held after a hung transaction
    pub const KILL_HOLD: Duration = Duration::from_millis(1);
}

/// SPD5 hub (JEDEC SPD5118 / SPD5108) protocol values
pub mod spd5 {
    /// Hubs answer at 0x50 | hid
    pub const BASE_ADDRESS: u8 = 0x50;

    /// Maximum number of hub IDs on one bus
    pub const MAX_HUBS: u8 = 8;

    /// Device type codes reported in MR0/MR1
    pub const DEVICE_TYPE_SPD5118: u16 = 0x1851;
    pub const DEVICE_TYPE_SPD5108: u16 = 0x0851;

    /// MR26 bit 0: thermal sensor disable
    pub const TS_DISABLE: u8 = 0x01;

    /// EEPROM is addressed in 128 byte pages selected through MR11
    pub const EEPROM_PAGE_SIZE: u16 = 128;
    /// Byte offset mask within a page
    pub const EEPROM_OFFSET_MASK: u16 = 0x7F;
    /// Register bit selecting the paged NVM read instead of a hub register
    pub const EEPROM_READ_SELECT: u8 = 0x80;

    /// Module serial number, 4 bytes, most significant first
    pub const SERIAL_NUMBER_START: u16 = 0x205;
    pub const SERIAL_NUMBER_END: u16 = 0x208;

    /// Module part number, ASCII, nul terminated or space padded
    pub const PART_NUMBER_START: u16 = 0x209;
    pub const PART_NUMBER_END: u16 = 0x226;

    /// Temperature LSB in degrees Celsius
    pub const TEMPERATURE_RESOLUTION: f32 = 0.25;
}

/// Arbiter wait bounds per operation
pub mod timeouts {
    use std::time::Duration;

    /// Presence probe plus identity read
    pub const DETECT: Duration = Duration::from_millis(100);
    /// One temperature poll
    pub const TEMPERATURE: Duration = Duration::from_millis(50);
    /// Thermal sensor configuration read-modify-verify
    pub const CONFIGURE: Duration = Duration::from_millis(100);
    /// One full identity string
    pub const IDENTITY: Duration = Duration::from_millis(100);
    /// Step between non-blocking attempts on the cross-process lock
    pub const LOCK_POLL_STEP: Duration = Duration::from_millis(1);
}

/// Platform identification
pub mod platform {
    /// SMBIOS processor manufacturer string that implies an FCH SMBus controller
    pub const AMD_MANUFACTURER: &str = "Advanced Micro Devices, Inc.";

    /// SMBIOS structure types
    pub const SMBIOS_PROCESSOR: u8 = 4;
    pub const SMBIOS_MEMORY_DEVICE: u8 = 17;

    /// SMBIOS type 17 memory type code for DDR5
    pub const MEMORY_TYPE_DDR5: u8 = 0x22;
    pub const MEMORY_TYPE_DDR4: u8 = 0x1A;

    /// Upper bound on enumerated module slots handed to hub detection
    pub const MAX_HUB_SLOTS: usize = 8;
}

/// Service and polling defaults
pub mod service {
    /// Default sensor poll interval
    pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
    pub const MIN_POLL_INTERVAL_MS: u64 = 100;
    pub const MAX_POLL_INTERVAL_MS: u64 = 60_000;

    /// Bounds for the configurable transaction poll limit
    pub const MIN_POLL_ITERATIONS: u32 = 1;
    pub const MAX_POLL_ITERATIONS: u32 = 100_000;
}
