//! Memory sensor sources
//!
//! Discovery picks one variant of [`SensorSource`] per memory module (or one
//! generic source for the whole system) and never changes it afterwards.

use std::fmt::Write as _;
use std::path::PathBuf;

use serde::Serialize;
use tracing::{debug, warn};

use crate::constants::paths;
use crate::hw::spd5::{HubIdentity, Spd5Hub};
use crate::platform::MemoryDevice;
use crate::system::{self, MemoryStatus};

/// What a sensor measures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SensorKind {
    Clock,
    Data,
    Temperature,
    Load,
}

impl SensorKind {
    pub fn unit(self) -> &'static str {
        match self {
            Self::Clock => "MHz",
            Self::Data => "MB",
            Self::Temperature => "°C",
            Self::Load => "%",
        }
    }
}

/// A named value; `None` until the first successful reading
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sensor {
    pub name: String,
    pub kind: SensorKind,
    pub value: Option<f32>,
}

impl Sensor {
    pub fn new(name: impl Into<String>, kind: SensorKind) -> Self {
        Self {
            name: name.into(),
            kind,
            value: None,
        }
    }

    pub fn with_value(mut self, value: f32) -> Self {
        self.value = Some(value);
        self
    }

    /// Value with unit, or "-" when never read
    pub fn display_value(&self) -> String {
        match self.value {
            Some(v) if self.kind == SensorKind::Temperature => {
                format!("{:.2} {}", v, self.kind.unit())
            }
            Some(v) if self.kind == SensorKind::Load => format!("{:.1} {}", v, self.kind.unit()),
            Some(v) => format!("{:.0} {}", v, self.kind.unit()),
            None => "-".to_string(),
        }
    }
}

/// A DDR5 module described by the firmware table, without bus access
#[derive(Debug, Clone)]
pub struct ModuleSource {
    index: usize,
    name: String,
    device: MemoryDevice,
    configured_speed: Sensor,
    size: Sensor,
}

impl ModuleSource {
    pub fn new(index: usize, device: MemoryDevice) -> Self {
        let name = format!(
            "{} (#{} {} {})",
            device.part_number.trim(),
            index,
            device.bank_locator,
            device.device_locator
        );
        let configured_speed = Sensor::new("Configured Speed", SensorKind::Clock)
            .with_value(device.configured_speed_mts as f32);
        let size = Sensor::new("Size", SensorKind::Data).with_value(device.size_mb as f32);
        Self {
            index,
            name,
            device,
            configured_speed,
            size,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn device(&self) -> &MemoryDevice {
        &self.device
    }

    fn report(&self, r: &mut String) {
        let _ = writeln!(r, "Part Number: {}", self.device.part_number.trim());
        let _ = writeln!(r, "Bank Locator: {}", self.device.bank_locator);
        let _ = writeln!(r, "Device Locator: {}", self.device.device_locator);
        let _ = writeln!(r, "Memory Device Module Serial Number: {}", self.device.serial_number);
    }
}

/// A DDR5 module whose SPD5 hub answered on the bus
#[derive(Debug)]
pub struct HubModuleSource {
    module: ModuleSource,
    hub: Spd5Hub,
    identity: HubIdentity,
    temperature: Sensor,
}

impl HubModuleSource {
    /// Reads the hub identity once. With `enable_thermal_sensor` the hub is asked
    /// to start its thermal sensor first.
    pub fn new(module: ModuleSource, hub: Spd5Hub, enable_thermal_sensor: bool) -> Self {
        if enable_thermal_sensor && hub.device_type().has_thermal_sensor() {
            match hub.set_thermal_sensor_enabled(true) {
                Ok(change) => debug!("hid {} thermal sensor enable: {:?}", hub.hid(), change),
                Err(e) => warn!("hid {} thermal sensor enable failed: {}", hub.hid(), e),
            }
        }
        let identity = hub.identity();
        Self {
            module,
            hub,
            identity,
            temperature: Sensor::new("SPD5 Hub Temperature", SensorKind::Temperature),
        }
    }

    pub fn hub(&self) -> &Spd5Hub {
        &self.hub
    }

    pub fn identity(&self) -> &HubIdentity {
        &self.identity
    }

    pub fn temperature(&self) -> Option<f32> {
        self.temperature.value
    }

    /// Poll the hub. A failed read keeps the previous value.
    pub fn update(&mut self) {
        if !self.hub.device_type().has_thermal_sensor() {
            return;
        }
        match self.hub.read_temperature() {
            Ok(celsius) => self.temperature.value = Some(celsius),
            Err(e) => debug!("hid {} temperature unavailable: {}", self.hub.hid(), e),
        }
    }

    fn report(&self, r: &mut String) {
        self.module.report(r);
        let _ = writeln!(
            r,
            "SPD5 Hub: {} at 0x{:02X} (hid {})",
            self.hub.device_type(),
            self.hub.address(),
            self.hub.hid()
        );
        let _ = writeln!(r, "SPD5 Hub Module Serial Number: {}", self.identity.serial_number);
        let _ = writeln!(r, "SPD5 Hub Module Part Number: {}", self.identity.part_number.trim());
    }
}

/// Whole-system memory when no module could be described
#[derive(Debug, Clone)]
pub struct GenericMemorySource {
    meminfo: Option<PathBuf>,
    used: Sensor,
    available: Sensor,
    total: Sensor,
    load: Sensor,
}

impl Default for GenericMemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl GenericMemorySource {
    pub fn new() -> Self {
        Self::with_meminfo(None)
    }

    /// Read counters from a meminfo-formatted file instead of the live system
    pub fn with_meminfo(meminfo: Option<PathBuf>) -> Self {
        Self {
            meminfo,
            used: Sensor::new("Memory Used", SensorKind::Data),
            available: Sensor::new("Memory Available", SensorKind::Data),
            total: Sensor::new("Memory Total", SensorKind::Data),
            load: Sensor::new("Memory", SensorKind::Load),
        }
    }

    pub fn update(&mut self) {
        let status = match &self.meminfo {
            Some(path) => system::read_memory_status_from(path),
            None => system::read_memory_status(),
        };
        let Some(status) = status else {
            debug!("No memory counters at {}", paths::PROC_MEMINFO);
            return;
        };
        self.apply(status);
    }

    fn apply(&mut self, status: MemoryStatus) {
        self.used.value = Some(status.used_mb() as f32);
        self.available.value = Some(status.available_mb as f32);
        self.total.value = Some(status.total_mb as f32);
        self.load.value = Some(status.load_percent());
    }
}

/// One entry in the memory group, tagged by how much we could learn about it
#[derive(Debug)]
pub enum SensorSource {
    BusLess(ModuleSource),
    HubBacked(HubModuleSource),
    Generic(GenericMemorySource),
}

/// Serializable view of one source
#[derive(Debug, Clone, Serialize)]
pub struct SourceSnapshot {
    pub identifier: String,
    pub name: String,
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<HubIdentity>,
    pub sensors: Vec<Sensor>,
}

impl SensorSource {
    pub fn name(&self) -> &str {
        match self {
            Self::BusLess(m) => &m.name,
            Self::HubBacked(h) => &h.module.name,
            Self::Generic(_) => "Generic Memory",
        }
    }

    pub fn identifier(&self) -> String {
        match self {
            Self::BusLess(m) => format!("ram#{}", m.index),
            Self::HubBacked(h) => format!("ram#{}", h.module.index),
            Self::Generic(_) => "ram-generic".to_string(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::BusLess(_) => "module",
            Self::HubBacked(_) => "module+spd5",
            Self::Generic(_) => "generic",
        }
    }

    pub fn sensors(&self) -> Vec<&Sensor> {
        match self {
            Self::BusLess(m) => vec![&m.configured_speed, &m.size],
            Self::HubBacked(h) => vec![&h.module.configured_speed, &h.module.size, &h.temperature],
            Self::Generic(g) => vec![&g.used, &g.available, &g.total, &g.load],
        }
    }

    /// Refresh live values. Firmware-table values never change.
    pub fn update(&mut self) {
        match self {
            Self::BusLess(_) => {}
            Self::HubBacked(h) => h.update(),
            Self::Generic(g) => g.update(),
        }
    }

    /// Human-readable report section
    pub fn report(&self) -> String {
        let mut r = String::new();
        let _ = writeln!(r, "{} [{}]", self.name(), self.identifier());
        match self {
            Self::BusLess(m) => m.report(&mut r),
            Self::HubBacked(h) => h.report(&mut r),
            Self::Generic(_) => {}
        }
        for sensor in self.sensors() {
            let _ = writeln!(r, "  {}: {}", sensor.name, sensor.display_value());
        }
        r
    }

    pub fn snapshot(&self) -> SourceSnapshot {
        SourceSnapshot {
            identifier: self.identifier(),
            name: self.name().to_string(),
            kind: self.kind(),
            identity: match self {
                Self::HubBacked(h) => Some(h.identity.clone()),
                _ => None,
            },
            sensors: self.sensors().into_iter().cloned().collect(),
        }
    }
}
