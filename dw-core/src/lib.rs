//! Dimmwatch Core Library
//!
//! DDR5 memory module monitoring through the SPD5 hubs on the SMBus.
//!
//! # Features
//!
//! - **SMBus Transactions**: Quick, byte and word transactions on an i801-style host controller
//! - **Bus Arbitration**: In-process and cross-process exclusion with bounded waits
//! - **SPD5 Hubs**: Device detection, thermal sensor, EEPROM identity
//! - **Discovery**: One sensor source per DDR5 module from the SMBIOS tables
//!
//! # Module Structure
//!
//! - `hw/` - Hardware interaction (port I/O, SMBus, arbiter, SPD5 hub)
//! - `platform` - Firmware tables and controller base selection
//! - `sensor` / `discovery` - Sensor sources and the memory group
//!
//! # Example
//!
//! ```no_run
//! use dw_core::{DiscoveryContext, MemoryGroup, PlatformTables};
//!
//! let tables = PlatformTables::from_sysfs().ok();
//! let mut group = MemoryGroup::discover(tables.as_ref(), &DiscoveryContext::bus_less());
//! group.update_all();
//! println!("{}", group.report());
//! ```

// Grouped modules
pub mod hw;

// Standalone modules
pub mod constants;
pub mod discovery;
pub mod error;
pub mod platform;
pub mod sensor;
pub mod sim;
pub mod system;

// Re-export error types
pub use error::{DimmwatchError, Result};

// Re-export hardware types from hw/
pub use hw::{
    decode_temperature, BusArbiter, BusGuard, ConfigChange, DevPort, DeviceType, HostStatus,
    HubIdentity, PortIo, SmbusDevice, Spd5Hub, Transaction,
};

pub use discovery::{DiscoveryContext, GroupSnapshot, MemoryGroup};
pub use platform::{detect_smbus_base, MemoryDevice, MemoryType, PlatformTables, ProcessorInfo};
pub use sensor::{
    GenericMemorySource, HubModuleSource, ModuleSource, Sensor, SensorKind, SensorSource,
    SourceSnapshot,
};
pub use sim::{SimulatedController, SimulatedHub};
pub use system::{is_root, read_memory_status, MemoryStatus};
