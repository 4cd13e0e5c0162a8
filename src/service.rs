/*
 * This file is part of Dimmwatch.
 *
 * Copyright (C) 2025 Dimmwatch contributors
 *
 * Dimmwatch is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Dimmwatch is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Dimmwatch. If not, see <https://www.gnu.org/licenses/>.
 */

//! Runtime assembly and the polling loop
//!
//! Turns a [`Config`] into port access, a bus arbiter and firmware tables,
//! then hands them to discovery. Also builds the `--simulate` system.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use dw_core::constants::{paths, smbus, spd5};
use dw_core::{
    detect_smbus_base, BusArbiter, DevPort, DiscoveryContext, MemoryDevice, MemoryGroup, MemoryType,
    PlatformTables, PortIo, ProcessorInfo, SimulatedController, SimulatedHub, Spd5Hub,
};

use crate::config::Config;

/// Set by the Ctrl-C handler; the watch loop exits at the next tick
pub static SHUTDOWN: AtomicBool = AtomicBool::new(false);

const SLEEP_STEP: Duration = Duration::from_millis(50);

/// Where the SMBus traffic goes
pub enum Backend {
    /// /dev/port on real hardware
    Hardware(Arc<DevPort>),
    Simulated(Arc<SimulatedController>),
    /// No port access; modules are bus-less
    None,
}

impl Backend {
    /// Open /dev/port when running as root. Anything else leaves the bus off.
    pub fn open(running_as_root: bool) -> Self {
        if !running_as_root {
            return Backend::None;
        }
        match DevPort::open() {
            Ok(port) => Backend::Hardware(Arc::new(port)),
            Err(e) => {
                warn!("Port access unavailable ({}), continuing without SMBus", e);
                Backend::None
            }
        }
    }

    pub fn port(&self) -> Option<Arc<dyn PortIo>> {
        match self {
            Backend::Hardware(port) => Some(port.clone() as Arc<dyn PortIo>),
            Backend::Simulated(sim) => Some(sim.clone() as Arc<dyn PortIo>),
            Backend::None => None,
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Backend::Hardware(_) => paths::DEV_PORT,
            Backend::Simulated(_) => "simulated controller",
            Backend::None => "none",
        }
    }
}

/// Arbiter for this configuration. The default lock file shares the process-wide arbiter.
pub fn build_arbiter(cfg: &Config) -> Arc<BusArbiter> {
    match &cfg.lock_file {
        None => Arc::new(BusArbiter::new()),
        Some(path) if path == Path::new(paths::SMBUS_LOCK_FILE) => BusArbiter::global(),
        Some(path) => Arc::new(BusArbiter::with_lock_file(path)),
    }
}

/// Firmware tables from the configured JSON dump, else from sysfs.
/// `None` when neither is available.
pub fn load_platform_tables(cfg: &Config) -> Option<PlatformTables> {
    let result = match &cfg.platform_tables {
        Some(path) => PlatformTables::from_json_file(path),
        None => PlatformTables::from_sysfs(),
    };
    match result {
        Ok(tables) => {
            debug!(
                "Platform tables: {} processor(s), {} memory device(s)",
                tables.processors.len(),
                tables.memory_devices.len()
            );
            Some(tables)
        }
        Err(e) => {
            warn!("No platform tables: {}", e);
            None
        }
    }
}

pub fn discovery_context(
    cfg: &Config,
    backend: &Backend,
    arbiter: Arc<BusArbiter>,
) -> DiscoveryContext {
    let mut ctx = DiscoveryContext::new(backend.port(), arbiter);
    ctx.smbus_base = cfg.smbus_base;
    ctx.poll_limit = cfg.poll_iterations;
    ctx.enable_thermal_sensor = cfg.enable_thermal_sensor;
    ctx
}

fn simulated_module(locator: &str, part: &str, serial: &str) -> MemoryDevice {
    MemoryDevice {
        memory_type: MemoryType::Ddr5,
        part_number: part.to_string(),
        bank_locator: format!("P0 CHANNEL {}", locator),
        device_locator: format!("DIMM {}1", locator),
        serial_number: serial.to_string(),
        configured_speed_mts: 6000,
        size_mb: 32768,
    }
}

fn simulated_hub(part: &str, serial: u32, celsius: f32) -> SimulatedHub {
    let mut hub = SimulatedHub::spd5118();
    hub.set_temperature(celsius);
    hub.write_eeprom(spd5::SERIAL_NUMBER_START, &serial.to_be_bytes());
    hub.write_eeprom(spd5::PART_NUMBER_START, part.as_bytes());
    hub
}

/// An AMD DDR5 machine with two populated slots, each with an SPD5118 hub
pub fn simulated_system() -> (Arc<SimulatedController>, PlatformTables) {
    let sim = Arc::new(SimulatedController::new(smbus::AMD_FCH_BASE));
    sim.attach(spd5::BASE_ADDRESS, simulated_hub("SIM5-6000C30-32G", 0x0123_4567, 38.25));
    sim.attach(spd5::BASE_ADDRESS | 1, simulated_hub("SIM5-6000C30-32G", 0x89AB_CDEF, 41.5));

    let tables = PlatformTables {
        processors: vec![ProcessorInfo {
            manufacturer: dw_core::constants::platform::AMD_MANUFACTURER.to_string(),
        }],
        memory_devices: vec![
            simulated_module("A", "SIM5-6000C30-32G", "01234567"),
            simulated_module("B", "SIM5-6000C30-32G", "89ABCDEF"),
        ],
    };
    (sim, tables)
}

/// Probe every hub slot on the configured or detected bus
pub fn scan(
    cfg: &Config,
    backend: &Backend,
    arbiter: Arc<BusArbiter>,
    tables: Option<&PlatformTables>,
) -> Result<Vec<Spd5Hub>> {
    let port = backend.port().context("no port access; run as root or use --simulate")?;
    let base = cfg
        .smbus_base
        .or_else(|| tables.map(detect_smbus_base))
        .unwrap_or(0);
    if base == 0 {
        anyhow::bail!("no SMBus controller known for this platform; set smbus_base in the config");
    }
    info!("Scanning SPD5 hubs on 0x{:04X}", base);
    Ok(Spd5Hub::detect_all(port, arbiter, base))
}

/// Update the group every `interval` until `shutdown` is set.
/// `on_update` runs after each refresh; `max_updates` bounds the loop for tests.
pub fn run_watch(
    group: &mut MemoryGroup,
    interval: Duration,
    shutdown: &AtomicBool,
    max_updates: Option<u64>,
    mut on_update: impl FnMut(&MemoryGroup),
) -> u64 {
    let mut updates = 0;
    let mut last: Option<Instant> = None;

    while !shutdown.load(Ordering::SeqCst) {
        if let Some(last) = last {
            if last.elapsed() < interval {
                thread::sleep(SLEEP_STEP.min(interval));
                continue;
            }
        }
        last = Some(Instant::now());

        group.update_all();
        on_update(group);
        updates += 1;
        if max_updates.is_some_and(|max| updates >= max) {
            break;
        }
    }
    debug!("Watch loop stopped after {} update(s)", updates);
    updates
}
