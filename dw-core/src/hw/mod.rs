//! Hardware interaction modules
//!
//! Everything below the sensor layer: raw port access, the SMBus host
//! controller, bus arbitration and the SPD5 hub protocol.

pub mod arbiter;
pub mod port;
pub mod smbus;
pub mod spd5;

pub use arbiter::{BusArbiter, BusGuard};
pub use port::{DevPort, PortIo};
pub use smbus::{HostStatus, SmbusDevice, Transaction};
pub use spd5::{decode_temperature, ConfigChange, DeviceType, HubIdentity, Spd5Hub};
