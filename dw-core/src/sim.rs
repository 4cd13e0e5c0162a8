//! Software model of the SMBus host controller and SPD5 hubs
//!
//! [`SimulatedController`] implements [`PortIo`] and reacts to register writes
//! the way an i801-style controller does: write-1-to-clear status, a START bit
//! that launches the programmed transaction, and a KILL bit that aborts it.
//! Attached [`SimulatedHub`]s answer quick, byte and word transactions.
//!
//! Used by the test suites and by `dimmwatch --simulate`.

use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::constants::{smbus, spd5};
use crate::hw::port::PortIo;
use crate::hw::smbus::{HostControl, HostStatus, Transaction};

const REGISTER_COUNT: usize = 128;
const EEPROM_SIZE: usize = 1024;

/// An SPD5 hub with its register file and paged EEPROM
#[derive(Clone, Debug)]
pub struct SimulatedHub {
    registers: [u8; REGISTER_COUNT],
    eeprom: [u8; EEPROM_SIZE],
    read_only: Vec<u8>,
    writes: usize,
}

impl SimulatedHub {
    fn with_device_type(code: u16) -> Self {
        let mut hub = Self {
            registers: [0; REGISTER_COUNT],
            eeprom: [0; EEPROM_SIZE],
            read_only: Vec::new(),
            writes: 0,
        };
        let [lo, hi] = code.to_le_bytes();
        hub.registers[0] = lo;
        hub.registers[1] = hi;
        hub
    }

    /// Hub with thermal sensor
    pub fn spd5118() -> Self {
        Self::with_device_type(spd5::DEVICE_TYPE_SPD5118)
    }

    /// Hub without thermal sensor
    pub fn spd5108() -> Self {
        Self::with_device_type(spd5::DEVICE_TYPE_SPD5108)
    }

    pub fn set_register(&mut self, register: u8, value: u8) {
        self.registers[usize::from(register & 0x7F)] = value;
    }

    pub fn register(&self, register: u8) -> u8 {
        self.registers[usize::from(register & 0x7F)]
    }

    /// Ignore host writes to `register`
    pub fn set_read_only(&mut self, register: u8) {
        self.read_only.push(register & 0x7F);
    }

    /// Store a temperature in MR49/MR50, rounded to the sensor resolution
    pub fn set_temperature(&mut self, celsius: f32) {
        let quarters = (celsius / spd5::TEMPERATURE_RESOLUTION).round() as i16;
        let raw = ((quarters as u16) & 0x07FF) << 2;
        let [lo, hi] = raw.to_le_bytes();
        self.registers[49] = lo;
        self.registers[50] = hi;
    }

    /// Fill EEPROM starting at an absolute address
    pub fn write_eeprom(&mut self, address: u16, bytes: &[u8]) {
        let start = usize::from(address);
        let end = (start + bytes.len()).min(EEPROM_SIZE);
        self.eeprom[start..end].copy_from_slice(&bytes[..end - start]);
    }

    /// Number of data writes the hub has accepted or refused
    pub fn writes(&self) -> usize {
        self.writes
    }

    fn page(&self) -> usize {
        usize::from(self.registers[11] & 0x07)
    }

    fn read(&self, command: u8) -> u8 {
        if command & spd5::EEPROM_READ_SELECT != 0 {
            let offset = usize::from(command & 0x7F);
            self.eeprom[self.page() * usize::from(spd5::EEPROM_PAGE_SIZE) + offset]
        } else {
            self.registers[usize::from(command)]
        }
    }

    fn write(&mut self, command: u8, value: u8) {
        self.writes += 1;
        let register = command & 0x7F;
        if command & spd5::EEPROM_READ_SELECT != 0 || self.read_only.contains(&register) {
            return;
        }
        self.registers[usize::from(register)] = value;
    }
}

#[derive(Debug, Default)]
struct ControllerState {
    status: u8,
    control: u8,
    command: u8,
    address: u8,
    data0: u8,
    data1: u8,
    aux: u8,
    hubs: BTreeMap<u8, SimulatedHub>,
    busy_polls: u32,
    busy_remaining: u32,
    pending: Option<u8>,
    hang: bool,
    stuck_busy: bool,
    sticky_status: u8,
    accesses: usize,
    status_reads: usize,
    started: usize,
    kills: usize,
}

impl ControllerState {
    fn complete(&mut self, kind: u8) {
        let target = self.address >> 1;
        let read = self.address & smbus::READ != 0;
        self.status &= !HostStatus::HOST_BUSY.bits();

        let Some(hub) = self.hubs.get_mut(&target) else {
            self.status |= HostStatus::DEV_ERR.bits();
            return;
        };

        match kind {
            k if k == Transaction::ByteData as u8 => {
                if read {
                    self.data0 = hub.read(self.command);
                } else {
                    hub.write(self.command, self.data0);
                }
            }
            k if k == Transaction::WordData as u8 => {
                if read {
                    self.data0 = hub.read(self.command);
                    self.data1 = hub.read(self.command.wrapping_add(1));
                } else {
                    hub.write(self.command, self.data0);
                    hub.write(self.command.wrapping_add(1), self.data1);
                }
            }
            _ => {}
        }
        self.status |= HostStatus::INTR.bits();
    }

    fn start(&mut self, kind: u8) {
        self.started += 1;
        self.status |= HostStatus::HOST_BUSY.bits();
        if self.hang {
            self.pending = None;
            return;
        }
        if self.busy_polls == 0 {
            self.complete(kind);
        } else {
            self.busy_remaining = self.busy_polls;
            self.pending = Some(kind);
        }
    }

    fn kill(&mut self) {
        self.kills += 1;
        self.pending = None;
        self.status &= !HostStatus::HOST_BUSY.bits();
        self.status |= HostStatus::FAILED.bits();
    }

    fn read_status(&mut self) -> u8 {
        self.status_reads += 1;
        if let Some(kind) = self.pending {
            if self.busy_remaining == 0 {
                self.pending = None;
                self.complete(kind);
            } else {
                self.busy_remaining -= 1;
            }
        }
        let mut status = self.status | self.sticky_status;
        if self.stuck_busy {
            status |= HostStatus::HOST_BUSY.bits();
        }
        status
    }
}

/// A host controller at a fixed I/O base
#[derive(Debug)]
pub struct SimulatedController {
    base: u16,
    state: Mutex<ControllerState>,
}

impl SimulatedController {
    pub fn new(base: u16) -> Self {
        Self {
            base,
            state: Mutex::new(ControllerState::default()),
        }
    }

    pub fn base(&self) -> u16 {
        self.base
    }

    /// Put a hub on the bus at a 7-bit address
    pub fn attach(&self, address: u8, hub: SimulatedHub) {
        self.state.lock().hubs.insert(address & 0x7F, hub);
    }

    /// Remove the hub at `address`, returning it
    pub fn detach(&self, address: u8) -> Option<SimulatedHub> {
        self.state.lock().hubs.remove(&(address & 0x7F))
    }

    /// Mutate an attached hub in place
    pub fn with_hub<R>(&self, address: u8, f: impl FnOnce(&mut SimulatedHub) -> R) -> Option<R> {
        self.state.lock().hubs.get_mut(&(address & 0x7F)).map(f)
    }

    pub fn hub_register(&self, address: u8, register: u8) -> Option<u8> {
        self.state
            .lock()
            .hubs
            .get(&(address & 0x7F))
            .map(|hub| hub.register(register))
    }

    pub fn hub_writes(&self, address: u8) -> usize {
        self.state
            .lock()
            .hubs
            .get(&(address & 0x7F))
            .map_or(0, SimulatedHub::writes)
    }

    /// Report HOST_BUSY for this many status reads after each START
    pub fn set_busy_polls(&self, polls: u32) {
        self.state.lock().busy_polls = polls;
    }

    /// Transactions never complete until killed
    pub fn set_hang(&self, hang: bool) {
        self.state.lock().hang = hang;
    }

    /// HOST_BUSY reads as set no matter what
    pub fn set_stuck_busy(&self, stuck: bool) {
        self.state.lock().stuck_busy = stuck;
    }

    /// Status bits that cannot be cleared
    pub fn set_sticky_status(&self, bits: u8) {
        self.state.lock().sticky_status = bits;
    }

    /// Overwrite the status register
    pub fn force_status(&self, bits: u8) {
        self.state.lock().status = bits;
    }

    pub fn set_control(&self, bits: u8) {
        self.state.lock().control = bits;
    }

    pub fn set_aux(&self, bits: u8) {
        self.state.lock().aux = bits;
    }

    /// Status register without the side effects of a port read
    pub fn status(&self) -> u8 {
        self.state.lock().status
    }

    pub fn control(&self) -> u8 {
        self.state.lock().control
    }

    pub fn aux(&self) -> u8 {
        self.state.lock().aux
    }

    /// Port reads and writes seen so far
    pub fn port_accesses(&self) -> usize {
        self.state.lock().accesses
    }

    pub fn status_reads(&self) -> usize {
        self.state.lock().status_reads
    }

    pub fn transactions_started(&self) -> usize {
        self.state.lock().started
    }

    pub fn kills(&self) -> usize {
        self.state.lock().kills
    }

    fn offset(&self, port: u16) -> Option<u16> {
        port.checked_sub(self.base).filter(|offset| *offset <= smbus::AUX_CONTROL)
    }
}

impl PortIo for SimulatedController {
    fn read_port(&self, port: u16) -> u8 {
        let mut state = self.state.lock();
        state.accesses += 1;
        match self.offset(port) {
            Some(smbus::HOST_STATUS) => state.read_status(),
            Some(smbus::HOST_CONTROL) => state.control,
            Some(smbus::HOST_COMMAND) => state.command,
            Some(smbus::TARGET_ADDRESS) => state.address,
            Some(smbus::HOST_DATA0) => state.data0,
            Some(smbus::HOST_DATA1) => state.data1,
            Some(smbus::AUX_CONTROL) => state.aux,
            _ => smbus::BYTE_SENTINEL,
        }
    }

    fn write_port(&self, port: u16, value: u8) {
        let mut state = self.state.lock();
        state.accesses += 1;
        match self.offset(port) {
            Some(smbus::HOST_STATUS) => {
                // Write-1-to-clear; HOST_BUSY is read-only.
                let clearable = value & !HostStatus::HOST_BUSY.bits();
                state.status &= !clearable;
            }
            Some(smbus::HOST_CONTROL) => {
                let control = HostControl::from_bits_retain(value);
                if control.contains(HostControl::KILL) {
                    state.kill();
                }
                state.control = (control - HostControl::START).bits();
                if control.contains(HostControl::START) {
                    state.start(value & 0x1C);
                }
            }
            Some(smbus::HOST_COMMAND) => state.command = value,
            Some(smbus::TARGET_ADDRESS) => state.address = value,
            Some(smbus::HOST_DATA0) => state.data0 = value,
            Some(smbus::HOST_DATA1) => state.data1 = value,
            Some(smbus::AUX_CONTROL) => state.aux = value,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_is_write_one_to_clear() {
        let ctrl = SimulatedController::new(0x0B00);
        ctrl.force_status(0x97);
        ctrl.write_port(0x0B00, 0x06);
        assert_eq!(ctrl.status(), 0x91);
    }

    #[test]
    fn test_unmapped_ports_float_high() {
        let ctrl = SimulatedController::new(0x0B00);
        assert_eq!(ctrl.read_port(0x0A00), 0xFF);
        assert_eq!(ctrl.read_port(0x0B20), 0xFF);
        assert_eq!(ctrl.port_accesses(), 2);
    }

    #[test]
    fn test_hub_temperature_encoding() {
        let mut hub = SimulatedHub::spd5118();
        hub.set_temperature(-0.25);
        assert_eq!(u16::from_le_bytes([hub.register(49), hub.register(50)]), 0x1FFC);
        hub.set_temperature(25.0);
        assert_eq!(u16::from_le_bytes([hub.register(49), hub.register(50)]), 0x0190);
    }

    #[test]
    fn test_eeprom_reads_follow_page_pointer() {
        let mut hub = SimulatedHub::spd5118();
        hub.write_eeprom(0x181, &[0x42]);
        hub.set_register(11, 3);
        assert_eq!(hub.read(0x81), 0x42);
    }
}
