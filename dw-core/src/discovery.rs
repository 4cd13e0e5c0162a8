//! Memory module discovery
//!
//! Walks the firmware memory-device table, probes the SPD5 hub slot for each
//! DDR5 module and builds one sensor source per module. When nothing usable
//! is found the group holds a single generic source instead.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::constants::{platform, smbus};
use crate::hw::arbiter::BusArbiter;
use crate::hw::port::PortIo;
use crate::hw::spd5::Spd5Hub;
use crate::platform::{detect_smbus_base, PlatformTables};
use crate::sensor::{
    GenericMemorySource, HubModuleSource, ModuleSource, SensorSource, SourceSnapshot,
};

/// Everything discovery needs besides the firmware tables
#[derive(Clone)]
pub struct DiscoveryContext {
    /// Port driver; `None` when port I/O is unavailable
    pub port: Option<Arc<dyn PortIo>>,
    pub arbiter: Arc<BusArbiter>,
    /// Use this base instead of the platform default
    pub smbus_base: Option<u16>,
    pub poll_limit: u32,
    pub enable_thermal_sensor: bool,
}

impl std::fmt::Debug for DiscoveryContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryContext")
            .field("port", &self.port.is_some())
            .field("smbus_base", &self.smbus_base)
            .field("poll_limit", &self.poll_limit)
            .field("enable_thermal_sensor", &self.enable_thermal_sensor)
            .finish()
    }
}

impl DiscoveryContext {
    pub fn new(port: Option<Arc<dyn PortIo>>, arbiter: Arc<BusArbiter>) -> Self {
        Self {
            port,
            arbiter,
            smbus_base: None,
            poll_limit: smbus::MAX_POLL_ITERATIONS,
            enable_thermal_sensor: false,
        }
    }

    /// Context with no bus access at all
    pub fn bus_less() -> Self {
        Self::new(None, Arc::new(BusArbiter::new()))
    }

    fn resolve_base(&self, tables: &PlatformTables) -> u16 {
        if self.port.is_none() {
            return 0;
        }
        self.smbus_base.unwrap_or_else(|| detect_smbus_base(tables))
    }
}

/// Serializable view of the whole group
#[derive(Debug, Clone, Serialize)]
pub struct GroupSnapshot {
    pub smbus_base: u16,
    pub sources: Vec<SourceSnapshot>,
}

/// The set of memory sensor sources for this machine
#[derive(Debug)]
pub struct MemoryGroup {
    smbus_base: u16,
    sources: Vec<SensorSource>,
}

impl MemoryGroup {
    /// Build the group from the firmware tables.
    ///
    /// Without tables the group is one generic source. Otherwise every DDR5
    /// entry with a part number and both locators becomes a module source,
    /// backed by its SPD5 hub when slot `index & 7` answers.
    pub fn discover(tables: Option<&PlatformTables>, ctx: &DiscoveryContext) -> Self {
        let Some(tables) = tables else {
            debug!("No platform tables, using generic memory source");
            return Self::generic(0);
        };

        let smbus_base = ctx.resolve_base(tables);
        if smbus_base == 0 {
            debug!("No SMBus controller, modules will be bus-less");
        } else {
            info!("Using SMBus controller at 0x{:04X}", smbus_base);
        }

        let mut sources = Vec::new();
        for (index, device) in tables.memory_devices.iter().enumerate() {
            if !device.is_ddr5() {
                debug!("Slot {} is {:?}, skipping", index, device.memory_type);
                continue;
            }
            if !device.has_identity() {
                debug!("Slot {} has no part number or locator, skipping", index);
                continue;
            }

            let module = ModuleSource::new(index, device.clone());
            let hub = match (&ctx.port, smbus_base) {
                (Some(port), base) if base != 0 && index < platform::MAX_HUB_SLOTS => {
                    let hid = (index & 7) as u8;
                    match Spd5Hub::detect_with_poll_limit(
                        port.clone(),
                        ctx.arbiter.clone(),
                        base,
                        hid,
                        ctx.poll_limit,
                    ) {
                        Ok(hub) => Some(hub),
                        Err(e) => {
                            debug!("No SPD5 hub for slot {}: {}", index, e);
                            None
                        }
                    }
                }
                _ => None,
            };

            sources.push(match hub {
                Some(hub) => SensorSource::HubBacked(HubModuleSource::new(
                    module,
                    hub,
                    ctx.enable_thermal_sensor,
                )),
                None => SensorSource::BusLess(module),
            });
        }

        if sources.is_empty() {
            warn!("No DDR5 modules described by firmware, using generic memory source");
            return Self::generic(smbus_base);
        }

        info!("Discovered {} memory module(s)", sources.len());
        Self { smbus_base, sources }
    }

    fn generic(smbus_base: u16) -> Self {
        Self {
            smbus_base,
            sources: vec![SensorSource::Generic(GenericMemorySource::new())],
        }
    }

    pub fn smbus_base(&self) -> u16 {
        self.smbus_base
    }

    pub fn sources(&self) -> &[SensorSource] {
        &self.sources
    }

    pub fn sources_mut(&mut self) -> &mut [SensorSource] {
        &mut self.sources
    }

    pub fn hub_count(&self) -> usize {
        self.sources
            .iter()
            .filter(|s| matches!(s, SensorSource::HubBacked(_)))
            .count()
    }

    pub fn update_all(&mut self) {
        for source in &mut self.sources {
            source.update();
        }
    }

    /// Text report for every source
    pub fn report(&self) -> String {
        let mut r = String::from("Memory Report\n\n");
        if self.smbus_base != 0 {
            r.push_str(&format!("SMBus base: 0x{:04X}\n\n", self.smbus_base));
        }
        for source in &self.sources {
            r.push_str(&source.report());
            r.push('\n');
        }
        r
    }

    pub fn snapshot(&self) -> GroupSnapshot {
        GroupSnapshot {
            smbus_base: self.smbus_base,
            sources: self.sources.iter().map(SensorSource::snapshot).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::spd5;
    use crate::platform::{MemoryDevice, MemoryType, ProcessorInfo};
    use crate::sim::{SimulatedController, SimulatedHub};

    fn ddr5(locator: &str) -> MemoryDevice {
        MemoryDevice {
            memory_type: MemoryType::Ddr5,
            part_number: "KF560C36-16".to_string(),
            bank_locator: "P0 CHANNEL A".to_string(),
            device_locator: locator.to_string(),
            serial_number: "1A2B3C4D".to_string(),
            configured_speed_mts: 5600,
            size_mb: 16384,
        }
    }

    fn amd_tables(devices: Vec<MemoryDevice>) -> PlatformTables {
        PlatformTables {
            processors: vec![ProcessorInfo {
                manufacturer: "Advanced Micro Devices, Inc.".to_string(),
            }],
            memory_devices: devices,
        }
    }

    fn sim_context(sim: &Arc<SimulatedController>) -> DiscoveryContext {
        let port: Arc<dyn PortIo> = sim.clone();
        DiscoveryContext::new(Some(port), Arc::new(BusArbiter::new()))
    }

    #[test]
    fn test_no_tables_gives_generic_source() {
        let group = MemoryGroup::discover(None, &DiscoveryContext::bus_less());
        assert_eq!(group.sources().len(), 1);
        assert_eq!(group.sources()[0].identifier(), "ram-generic");
    }

    #[test]
    fn test_no_ddr5_gives_generic_source() {
        let mut ddr4 = ddr5("DIMM 0");
        ddr4.memory_type = MemoryType::Ddr4;
        let tables = amd_tables(vec![ddr4]);
        let group = MemoryGroup::discover(Some(&tables), &DiscoveryContext::bus_less());
        assert_eq!(group.sources().len(), 1);
        assert!(matches!(group.sources()[0], SensorSource::Generic(_)));
    }

    #[test]
    fn test_entries_without_identity_are_skipped() {
        let mut no_bank = ddr5("DIMM 1");
        no_bank.bank_locator.clear();
        let no_device = ddr5("");
        let mut no_part = ddr5("DIMM 3");
        no_part.part_number.clear();
        let tables = amd_tables(vec![ddr5("DIMM 0"), no_bank, no_device, no_part]);
        let group = MemoryGroup::discover(Some(&tables), &DiscoveryContext::bus_less());
        assert_eq!(group.sources().len(), 1);
        assert_eq!(group.sources()[0].identifier(), "ram#0");
    }

    #[test]
    fn test_blank_serial_number_is_kept() {
        let mut no_serial = ddr5("DIMM 1");
        no_serial.serial_number.clear();
        let tables = amd_tables(vec![ddr5("DIMM 0"), no_serial]);
        let group = MemoryGroup::discover(Some(&tables), &DiscoveryContext::bus_less());
        assert_eq!(group.sources().len(), 2);
        assert_eq!(group.sources()[1].identifier(), "ram#1");
    }

    #[test]
    fn test_bus_less_without_port() {
        let tables = amd_tables(vec![ddr5("DIMM 0"), ddr5("DIMM 1")]);
        let group = MemoryGroup::discover(Some(&tables), &DiscoveryContext::bus_less());
        assert_eq!(group.smbus_base(), 0);
        assert_eq!(group.sources().len(), 2);
        assert_eq!(group.hub_count(), 0);
    }

    #[test]
    fn test_hub_backed_where_hub_answers() {
        let sim = Arc::new(SimulatedController::new(smbus::AMD_FCH_BASE));
        let mut hub = SimulatedHub::spd5118();
        hub.set_temperature(36.5);
        sim.attach(spd5::BASE_ADDRESS, hub);

        let tables = amd_tables(vec![ddr5("DIMM 0"), ddr5("DIMM 1")]);
        let mut group = MemoryGroup::discover(Some(&tables), &sim_context(&sim));
        assert_eq!(group.smbus_base(), smbus::AMD_FCH_BASE);
        assert_eq!(group.sources().len(), 2);
        assert_eq!(group.hub_count(), 1);
        assert!(matches!(group.sources()[0], SensorSource::HubBacked(_)));
        assert!(matches!(group.sources()[1], SensorSource::BusLess(_)));

        group.update_all();
        let SensorSource::HubBacked(source) = &group.sources()[0] else {
            panic!("expected hub-backed source");
        };
        assert_eq!(source.temperature(), Some(36.5));
    }

    #[test]
    fn test_non_amd_platform_is_bus_less() {
        let sim = Arc::new(SimulatedController::new(smbus::AMD_FCH_BASE));
        sim.attach(spd5::BASE_ADDRESS, SimulatedHub::spd5118());
        let mut tables = amd_tables(vec![ddr5("DIMM 0")]);
        tables.processors[0].manufacturer = "GenuineIntel".to_string();

        let group = MemoryGroup::discover(Some(&tables), &sim_context(&sim));
        assert_eq!(group.smbus_base(), 0);
        assert_eq!(group.hub_count(), 0);
        assert_eq!(sim.transactions_started(), 0);
    }

    #[test]
    fn test_base_override() {
        let sim = Arc::new(SimulatedController::new(0x0F00));
        sim.attach(spd5::BASE_ADDRESS | 1, SimulatedHub::spd5108());
        let mut ctx = sim_context(&sim);
        ctx.smbus_base = Some(0x0F00);

        let tables = amd_tables(vec![ddr5("DIMM 0"), ddr5("DIMM 1")]);
        let group = MemoryGroup::discover(Some(&tables), &ctx);
        assert_eq!(group.smbus_base(), 0x0F00);
        assert!(matches!(group.sources()[1], SensorSource::HubBacked(_)));
    }

    #[test]
    fn test_slots_past_eight_are_never_probed() {
        let sim = Arc::new(SimulatedController::new(smbus::AMD_FCH_BASE));
        for hid in 0..spd5::MAX_HUBS {
            sim.attach(spd5::BASE_ADDRESS | hid, SimulatedHub::spd5118());
        }
        let devices = (0..10).map(|i| ddr5(&format!("DIMM {}", i))).collect();
        let tables = amd_tables(devices);

        let group = MemoryGroup::discover(Some(&tables), &sim_context(&sim));
        assert_eq!(group.sources().len(), 10);
        assert_eq!(group.hub_count(), 8);
        assert!(matches!(group.sources()[8], SensorSource::BusLess(_)));
        assert!(matches!(group.sources()[9], SensorSource::BusLess(_)));
    }

    #[test]
    fn test_thermal_sensor_enabled_on_request() {
        let sim = Arc::new(SimulatedController::new(smbus::AMD_FCH_BASE));
        let mut hub = SimulatedHub::spd5118();
        hub.set_register(26, 0x01);
        sim.attach(spd5::BASE_ADDRESS, hub);
        let mut ctx = sim_context(&sim);
        ctx.enable_thermal_sensor = true;

        let tables = amd_tables(vec![ddr5("DIMM 0")]);
        let group = MemoryGroup::discover(Some(&tables), &ctx);
        assert_eq!(group.hub_count(), 1);
        assert_eq!(sim.hub_register(spd5::BASE_ADDRESS, 26), Some(0x00));
    }

    #[test]
    fn test_report_and_snapshot() {
        let tables = amd_tables(vec![ddr5("DIMM 0")]);
        let group = MemoryGroup::discover(Some(&tables), &DiscoveryContext::bus_less());
        let report = group.report();
        assert!(report.starts_with("Memory Report"));
        assert!(report.contains("KF560C36-16 (#0 P0 CHANNEL A DIMM 0) [ram#0]"));

        let json = serde_json::to_value(group.snapshot()).unwrap();
        assert_eq!(json["sources"][0]["identifier"], "ram#0");
    }
}
