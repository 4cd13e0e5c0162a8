//! SMBus host controller transactions
//!
//! Drives an i801-style host controller (as found in AMD FCH chipsets) through
//! one quick/byte/word transaction at a time: pre-check, start, bounded poll,
//! then post-check with kill-and-reset recovery when the device never answers.
//!
//! Nothing here serializes access. Callers hold a
//! [`BusGuard`](crate::hw::arbiter::BusGuard) for the whole register sequence.

use std::fmt;
use std::sync::Arc;
use std::thread;

use bitflags::bitflags;
use tracing::{debug, trace, warn};

use crate::constants::smbus;
use crate::error::{DimmwatchError, Result};
use crate::hw::port::PortIo;

bitflags! {
    /// Host status register (base + 0)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HostStatus: u8 {
        const HOST_BUSY = 1 << 0;
        const INTR = 1 << 1;
        const DEV_ERR = 1 << 2;
        const BUS_ERR = 1 << 3;
        const FAILED = 1 << 4;
        const BYTE_DONE = 1 << 7;

        const ERRORS = Self::FAILED.bits() | Self::BUS_ERR.bits() | Self::DEV_ERR.bits();
        const CLEARABLE = Self::BYTE_DONE.bits() | Self::INTR.bits() | Self::ERRORS.bits();
    }
}

bitflags! {
    /// Host control register (base + 2)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HostControl: u8 {
        const INTREN = 1 << 0;
        const KILL = 1 << 1;
        const START = 1 << 6;
    }
}

bitflags! {
    /// Auxiliary control register (base + 13)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AuxControl: u8 {
        const CRC = 1 << 0;
        const E32B = 1 << 1;
    }
}

/// Transaction kinds, encoded as the host control command field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Transaction {
    Quick = 0x00,
    ByteData = 0x08,
    WordData = 0x0C,
}

/// One target device behind one host controller
pub struct SmbusDevice {
    port: Arc<dyn PortIo>,
    base: u16,
    address: u8,
    poll_limit: u32,
}

impl fmt::Debug for SmbusDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmbusDevice")
            .field("base", &format_args!("0x{:04X}", self.base))
            .field("address", &format_args!("0x{:02X}", self.address))
            .field("poll_limit", &self.poll_limit)
            .finish()
    }
}

impl SmbusDevice {
    /// A base or address of zero means "no bus": every access becomes a no-op.
    pub fn new(port: Arc<dyn PortIo>, base: u16, address: u8) -> Self {
        Self {
            port,
            base,
            address: address & 0x7F,
            poll_limit: smbus::MAX_POLL_ITERATIONS,
        }
    }

    /// Override the number of status polls before a transaction times out
    pub fn with_poll_limit(mut self, poll_limit: u32) -> Self {
        self.poll_limit = poll_limit;
        self
    }

    pub fn base(&self) -> u16 {
        self.base
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn poll_limit(&self) -> u32 {
        self.poll_limit
    }

    /// No bus at base 0, no target at address 0, and no controller whose
    /// register block would run past the end of the port space.
    pub fn is_bus_absent(&self) -> bool {
        self.base == 0 || self.address == 0 || self.base.checked_add(smbus::AUX_CONTROL).is_none()
    }

    fn reg(&self, offset: u16) -> u16 {
        self.base + offset
    }

    fn read_status(&self) -> HostStatus {
        HostStatus::from_bits_retain(self.port.read_port(self.reg(smbus::HOST_STATUS)))
    }

    fn write_status(&self, status: HostStatus) {
        self.port.write_port(self.reg(smbus::HOST_STATUS), status.bits());
    }

    fn read_control(&self) -> HostControl {
        HostControl::from_bits_retain(self.port.read_port(self.reg(smbus::HOST_CONTROL)))
    }

    fn write_control(&self, control: HostControl) {
        self.port.write_port(self.reg(smbus::HOST_CONTROL), control.bits());
    }

    fn update_aux(&self, clear: AuxControl) {
        let reg = self.reg(smbus::AUX_CONTROL);
        let aux = AuxControl::from_bits_retain(self.port.read_port(reg));
        self.port.write_port(reg, (aux - clear).bits());
    }

    fn select(&self, direction: u8, command: Option<u8>) {
        self.port.write_port(
            self.reg(smbus::TARGET_ADDRESS),
            (self.address << 1) | (direction & 0x01),
        );
        if let Some(command) = command {
            self.port.write_port(self.reg(smbus::HOST_COMMAND), command);
        }
        self.update_aux(AuxControl::CRC);
    }

    fn check_pre(&self) -> Result<()> {
        let status = self.read_status();
        if status.contains(HostStatus::HOST_BUSY) {
            debug!("SMBus 0x{:04X} busy before transaction: {:?}", self.base, status);
            return Err(DimmwatchError::BusBusy { status: status.bits() });
        }

        let stale = status & HostStatus::CLEARABLE;
        if !stale.is_empty() {
            self.write_status(stale);
            let stale = self.read_status() & HostStatus::CLEARABLE;
            if !stale.is_empty() {
                debug!("SMBus 0x{:04X} status stuck at {:?}", self.base, stale);
                return Err(DimmwatchError::StaleStatus { status: stale.bits() });
            }
        }
        Ok(())
    }

    /// Spin on the status register until the host is idle and reports completion
    /// or an error. `None` means the poll limit ran out.
    fn wait_for_completion(&self) -> Option<HostStatus> {
        let done = HostStatus::ERRORS | HostStatus::INTR;
        let mut polls = 0;
        loop {
            let status = self.read_status();
            if !status.contains(HostStatus::HOST_BUSY) && status.intersects(done) {
                return Some(status & done);
            }
            if polls >= self.poll_limit {
                return None;
            }
            polls += 1;
        }
    }

    fn check_post(&self, outcome: Option<HostStatus>) -> Result<HostStatus> {
        let Some(status) = outcome else {
            warn!(
                "SMBus 0x{:04X} target 0x{:02X} timed out after {} polls, killing transaction",
                self.base, self.address, self.poll_limit
            );
            self.write_control(self.read_control() | HostControl::KILL);
            thread::sleep(smbus::KILL_HOLD);
            self.write_control(self.read_control() - HostControl::KILL);
            self.write_status(HostStatus::CLEARABLE);
            return Err(DimmwatchError::TransactionTimeout {
                iterations: self.poll_limit,
            });
        };

        self.write_status(status);
        if status.intersects(HostStatus::ERRORS) {
            trace!("SMBus target 0x{:02X} error status {:?}", self.address, status);
            return Err(DimmwatchError::Protocol { status: status.bits() });
        }
        Ok(status)
    }

    /// Run one transaction against the currently programmed address/command/data.
    pub fn transaction(&self, kind: Transaction) -> Result<HostStatus> {
        if self.is_bus_absent() {
            return Err(DimmwatchError::BusAbsent);
        }
        self.check_pre()?;

        self.write_control(self.read_control() - HostControl::INTREN);
        self.write_control(HostControl::from_bits_retain(kind as u8) | HostControl::START);

        let outcome = self.wait_for_completion();
        self.check_post(outcome)
    }

    fn finish(&self, result: Result<HostStatus>) -> Result<HostStatus> {
        self.update_aux(AuxControl::CRC | AuxControl::E32B);
        result
    }

    /// Quick-command presence probe. Succeeds when the target acknowledged.
    pub fn probe(&self) -> Result<()> {
        if self.is_bus_absent() {
            return Err(DimmwatchError::BusAbsent);
        }
        self.select(smbus::WRITE, None);
        let result = self.transaction(Transaction::Quick);
        self.finish(result).map(|_| ())
    }

    /// Read one register byte. An absent bus reads as 0xFF without touching ports.
    pub fn read_byte(&self, register: u8) -> Result<u8> {
        if self.is_bus_absent() {
            return Ok(smbus::BYTE_SENTINEL);
        }
        self.select(smbus::READ, Some(register));
        let result = self.transaction(Transaction::ByteData);
        self.finish(result)?;
        Ok(self.port.read_port(self.reg(smbus::HOST_DATA0)))
    }

    /// Read a little-endian register word. An absent bus reads as 0xFFFF.
    pub fn read_word(&self, register: u8) -> Result<u16> {
        if self.is_bus_absent() {
            return Ok(smbus::WORD_SENTINEL);
        }
        self.select(smbus::READ, Some(register));
        let result = self.transaction(Transaction::WordData);
        self.finish(result)?;
        let lo = self.port.read_port(self.reg(smbus::HOST_DATA0));
        let hi = self.port.read_port(self.reg(smbus::HOST_DATA1));
        Ok(u16::from_le_bytes([lo, hi]))
    }

    /// Write one register byte. No-op on an absent bus.
    pub fn write_byte(&self, register: u8, value: u8) -> Result<()> {
        if self.is_bus_absent() {
            return Ok(());
        }
        self.port.write_port(
            self.reg(smbus::TARGET_ADDRESS),
            (self.address << 1) | smbus::WRITE,
        );
        self.port.write_port(self.reg(smbus::HOST_COMMAND), register);
        self.port.write_port(self.reg(smbus::HOST_DATA0), value);
        self.update_aux(AuxControl::CRC);
        let result = self.transaction(Transaction::ByteData);
        self.finish(result).map(|_| ())
    }

    /// Write a little-endian register word. No-op on an absent bus.
    pub fn write_word(&self, register: u8, value: u16) -> Result<()> {
        if self.is_bus_absent() {
            return Ok(());
        }
        let [lo, hi] = value.to_le_bytes();
        self.port.write_port(
            self.reg(smbus::TARGET_ADDRESS),
            (self.address << 1) | smbus::WRITE,
        );
        self.port.write_port(self.reg(smbus::HOST_COMMAND), register);
        self.port.write_port(self.reg(smbus::HOST_DATA0), lo);
        self.port.write_port(self.reg(smbus::HOST_DATA1), hi);
        self.update_aux(AuxControl::CRC);
        let result = self.transaction(Transaction::WordData);
        self.finish(result).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::port::MockPortIo;
    use crate::sim::{SimulatedController, SimulatedHub};

    const BASE: u16 = smbus::AMD_FCH_BASE;

    fn controller_with_hub(address: u8) -> Arc<SimulatedController> {
        let ctrl = Arc::new(SimulatedController::new(BASE));
        ctrl.attach(address, SimulatedHub::spd5118());
        ctrl
    }

    fn untouched_port() -> Arc<MockPortIo> {
        let mut mock = MockPortIo::new();
        mock.expect_read_port().never();
        mock.expect_write_port().never();
        Arc::new(mock)
    }

    #[test]
    fn test_zero_base_returns_sentinels_without_port_access() {
        let dev = SmbusDevice::new(untouched_port(), 0, 0x50);
        assert!(dev.is_bus_absent());
        assert_eq!(dev.read_byte(0x00).unwrap(), 0xFF);
        assert_eq!(dev.read_word(0x00).unwrap(), 0xFFFF);
        assert!(dev.write_byte(0x0B, 0x01).is_ok());
        assert!(dev.write_word(0x0B, 0x0102).is_ok());
        assert!(matches!(dev.probe(), Err(DimmwatchError::BusAbsent)));
    }

    #[test]
    fn test_base_at_top_of_port_space_is_absent() {
        let dev = SmbusDevice::new(untouched_port(), 0xFFFF, 0x50);
        assert!(dev.is_bus_absent());
        assert_eq!(dev.read_byte(0x00).unwrap(), 0xFF);
        assert_eq!(dev.read_word(0x00).unwrap(), 0xFFFF);
        assert!(dev.write_byte(0x0B, 0x01).is_ok());
        assert!(matches!(dev.probe(), Err(DimmwatchError::BusAbsent)));
        assert!(matches!(dev.transaction(Transaction::Quick), Err(DimmwatchError::BusAbsent)));

        let last = SmbusDevice::new(untouched_port(), u16::MAX - smbus::AUX_CONTROL, 0x50);
        assert!(!last.is_bus_absent());
    }

    #[test]
    fn test_zero_target_returns_sentinels_without_port_access() {
        let dev = SmbusDevice::new(untouched_port(), BASE, 0);
        assert_eq!(dev.read_byte(0x31).unwrap(), 0xFF);
        assert_eq!(dev.read_word(0x31).unwrap(), 0xFFFF);
        assert!(matches!(dev.probe(), Err(DimmwatchError::BusAbsent)));
    }

    #[test]
    fn test_probe_present_and_absent_devices() {
        let ctrl = controller_with_hub(0x51);
        assert!(SmbusDevice::new(ctrl.clone(), BASE, 0x51).probe().is_ok());

        let err = SmbusDevice::new(ctrl, BASE, 0x52).probe().unwrap_err();
        assert!(matches!(
            err,
            DimmwatchError::Protocol { status } if status & HostStatus::DEV_ERR.bits() != 0
        ));
    }

    #[test]
    fn test_read_word_is_little_endian() {
        let ctrl = controller_with_hub(0x50);
        let dev = SmbusDevice::new(ctrl, BASE, 0x50);
        // MR0 = 0x51, MR1 = 0x18 on an SPD5118
        assert_eq!(dev.read_word(0x00).unwrap(), 0x1851);
        assert_eq!(dev.read_byte(0x01).unwrap(), 0x18);
    }

    #[test]
    fn test_write_then_read_byte() {
        let ctrl = controller_with_hub(0x50);
        let dev = SmbusDevice::new(ctrl.clone(), BASE, 0x50);
        dev.write_byte(26, 0x01).unwrap();
        assert_eq!(dev.read_byte(26).unwrap(), 0x01);
        assert_eq!(ctrl.hub_register(0x50, 26), Some(0x01));
    }

    #[test]
    fn test_write_word_writes_both_bytes() {
        let ctrl = controller_with_hub(0x50);
        let dev = SmbusDevice::new(ctrl.clone(), BASE, 0x50);
        dev.write_word(0x1C, 0xBEEF).unwrap();
        assert_eq!(ctrl.hub_register(0x50, 0x1C), Some(0xEF));
        assert_eq!(ctrl.hub_register(0x50, 0x1D), Some(0xBE));
    }

    #[test]
    fn test_busy_host_fails_precheck() {
        let ctrl = controller_with_hub(0x50);
        ctrl.set_stuck_busy(true);
        let dev = SmbusDevice::new(ctrl.clone(), BASE, 0x50);
        assert!(matches!(dev.read_byte(0), Err(DimmwatchError::BusBusy { .. })));
        // Never started: the control register saw no START write.
        assert_eq!(ctrl.transactions_started(), 0);
    }

    #[test]
    fn test_stale_flags_are_cleared_before_start() {
        let ctrl = controller_with_hub(0x50);
        ctrl.force_status(HostStatus::INTR.bits() | HostStatus::DEV_ERR.bits());
        let dev = SmbusDevice::new(ctrl.clone(), BASE, 0x50);
        assert_eq!(dev.read_word(0).unwrap(), 0x1851);
    }

    #[test]
    fn test_sticky_flags_fail_precheck() {
        let ctrl = controller_with_hub(0x50);
        ctrl.set_sticky_status(HostStatus::BUS_ERR.bits());
        let dev = SmbusDevice::new(ctrl, BASE, 0x50);
        let err = dev.read_byte(0).unwrap_err();
        assert!(matches!(
            err,
            DimmwatchError::StaleStatus { status } if status == HostStatus::BUS_ERR.bits()
        ));
    }

    #[test]
    fn test_hung_transaction_times_out_and_kills() {
        let ctrl = controller_with_hub(0x50);
        ctrl.set_hang(true);
        let dev = SmbusDevice::new(ctrl.clone(), BASE, 0x50).with_poll_limit(5);

        let err = dev.read_byte(0).unwrap_err();
        assert!(matches!(err, DimmwatchError::TransactionTimeout { iterations: 5 }));
        assert_eq!(ctrl.kills(), 1);
        // Recovery leaves the controller idle with clean status.
        assert_eq!(ctrl.status() & HostStatus::CLEARABLE.bits(), 0);
        assert_eq!(ctrl.status() & HostStatus::HOST_BUSY.bits(), 0);
        assert_eq!(ctrl.control() & HostControl::KILL.bits(), 0);

        // The next transaction on a healthy device works again.
        ctrl.set_hang(false);
        assert_eq!(dev.read_word(0).unwrap(), 0x1851);
    }

    #[test]
    fn test_poll_limit_bounds_status_reads() {
        let ctrl = controller_with_hub(0x50);
        ctrl.set_hang(true);
        let dev = SmbusDevice::new(ctrl.clone(), BASE, 0x50).with_poll_limit(10);
        let before = ctrl.status_reads();
        let _ = dev.read_byte(0);
        // pre-check read + (limit + 1) polls
        assert_eq!(ctrl.status_reads() - before, 1 + 11);
    }

    #[test]
    fn test_short_busy_period_completes() {
        let ctrl = controller_with_hub(0x50);
        ctrl.set_busy_polls(20);
        let dev = SmbusDevice::new(ctrl, BASE, 0x50).with_poll_limit(100);
        assert_eq!(dev.read_word(0).unwrap(), 0x1851);
    }

    #[test]
    fn test_crc_and_block_mode_cleared() {
        let ctrl = controller_with_hub(0x50);
        ctrl.set_aux(AuxControl::CRC.bits() | AuxControl::E32B.bits() | 0x40);
        let dev = SmbusDevice::new(ctrl.clone(), BASE, 0x50);
        dev.read_byte(0).unwrap();
        assert_eq!(ctrl.aux(), 0x40);
    }

    #[test]
    fn test_interrupts_disabled_before_start() {
        let ctrl = controller_with_hub(0x50);
        ctrl.set_control(HostControl::INTREN.bits());
        let dev = SmbusDevice::new(ctrl.clone(), BASE, 0x50);
        dev.read_byte(0).unwrap();
        assert_eq!(ctrl.control() & HostControl::INTREN.bits(), 0);
    }
}
