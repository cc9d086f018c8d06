//! Register sequences shared by the blocking and async drivers.
//!
//! Nothing here waits on the busy flag: callers put the waits in between,
//! blocking or async, which is the only thing the two drivers do
//! differently.

use crate::error::Error;
use crate::keys::KeyLock;
use crate::latency::ProgramSize;
use crate::protection::ProtectionState;
use crate::registers::{
    Control, FlashRegisters, OptionControl, ProgramUnit, Register, Status, ACR_LATENCY,
};
use crate::sector::{in_flash, Sector};

#[derive(Debug)]
pub struct FlashController<R> {
    regs: R,
}

impl<R> FlashController<R>
where
    R: FlashRegisters,
{
    pub fn new(regs: R) -> Self {
        Self { regs }
    }

    pub fn release(self) -> R {
        self.regs
    }

    #[cfg(test)]
    pub fn regs_mut(&mut self) -> &mut R {
        &mut self.regs
    }

    pub fn status(&mut self) -> Status {
        Status::from_bits_retain(self.regs.read(Register::Sr))
    }

    pub fn is_busy(&mut self) -> bool {
        self.status().contains(Status::BSY)
    }

    /// Raw test of one status register bit; positions past 31 read as clear.
    pub fn is_status_bit_set(&mut self, position: u8) -> bool {
        match 1u32.checked_shl(position as u32) {
            Some(bit) => self.regs.read(Register::Sr) & bit != 0,
            None => false,
        }
    }

    /// Clears the error and end-of-operation flags.
    pub fn clear_status(&mut self) {
        self.regs.write(Register::Sr, (Status::ERRORS | Status::EOP).bits());
    }

    /// Fails with the raised error flags, clearing them on the way.
    pub fn take_errors(&mut self) -> Result<(), Error> {
        let errors = self.status() & Status::ERRORS;
        if errors.is_empty() {
            return Ok(());
        }
        self.regs.write(Register::Sr, errors.bits());
        Err(Error::Hardware(errors))
    }

    pub fn is_locked(&mut self, key: KeyLock) -> bool {
        self.regs.read(key.locked_register()) & key.lock_bit() != 0
    }

    pub fn write_keys(&mut self, key: KeyLock) {
        for value in key.keys() {
            self.regs.write(key.key_register(), value);
        }
    }

    pub fn lock(&mut self, key: KeyLock) {
        self.regs.modify(key.locked_register(), |value| value | key.lock_bit());
    }

    pub fn latency(&mut self) -> u8 {
        (self.regs.read(Register::Acr) & ACR_LATENCY) as u8
    }

    pub fn set_latency(&mut self, wait_states: u8) {
        let field = u32::from(wait_states) & ACR_LATENCY;
        self.regs.modify(Register::Acr, |acr| (acr & !ACR_LATENCY) | field);
    }

    #[cfg(test)]
    pub fn control(&mut self) -> Control {
        Control::from_bits_retain(self.regs.read(Register::Cr))
    }

    /// Requires the control register to be unlocked.
    pub fn set_program_size(&mut self, size: ProgramSize) {
        self.regs.modify(Register::Cr, |cr| {
            (cr & !Control::PSIZE.bits()) | Control::program_size(size).bits()
        });
    }

    /// Clears program/erase mode and the sector number.
    pub fn clear_mode(&mut self) {
        self.regs.modify(Register::Cr, |cr| cr & !Control::MODE.bits());
    }

    pub fn select_sector_erase(&mut self, sector: Sector) {
        self.clear_mode();
        self.regs.modify(Register::Cr, |cr| {
            cr | (Control::SER | Control::sector(sector.index())).bits()
        });
    }

    pub fn select_mass_erase(&mut self) {
        self.clear_mode();
        self.regs.modify(Register::Cr, |cr| cr | Control::MER.bits());
    }

    pub fn select_program(&mut self) {
        self.clear_mode();
        self.regs.modify(Register::Cr, |cr| cr | Control::PG.bits());
    }

    /// Starts the selected erase.
    pub fn start(&mut self) {
        self.regs.modify(Register::Cr, |cr| cr | Control::STRT.bits());
    }

    pub fn program_unit(&mut self, address: u32, unit: ProgramUnit) {
        self.regs.program_unit(address, unit);
    }

    /// Bounds-checked copy out of the flash array. Never gated by the lock.
    pub fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), Error> {
        if !in_flash(address, buf.len()) {
            return Err(Error::OutOfRange {
                address,
                length: buf.len(),
            });
        }
        if !buf.is_empty() {
            self.regs.read_memory(address, buf);
        }
        Ok(())
    }

    pub fn option_control(&mut self) -> OptionControl {
        OptionControl::from_bits_retain(self.regs.read(Register::Optcr))
    }

    pub fn protection(&mut self) -> ProtectionState {
        ProtectionState::from_option_control(self.option_control())
    }

    /// Stages `state` in OPTCR. Requires the option register to be unlocked;
    /// nothing changes until [`Self::start_option_update`].
    pub fn stage_protection(&mut self, state: ProtectionState) {
        let optcr = state.apply_to(self.option_control());
        self.regs.write(Register::Optcr, optcr.bits());
    }

    pub fn start_option_update(&mut self) {
        self.regs.modify(Register::Optcr, |optcr| {
            optcr | OptionControl::OPTSTRT.bits()
        });
    }
}

/// Validates a program request and returns the number of units it takes.
///
/// The range checked is the one actually stored: the data length rounded
/// up to whole units.
pub fn check_write(address: u32, length: usize, size: ProgramSize) -> Result<usize, Error> {
    let unit = size.bytes();
    if address as usize % unit != 0 {
        return Err(Error::NotAligned { address });
    }
    let units = length.div_ceil(unit);
    match units.checked_mul(unit) {
        Some(stored) if in_flash(address, stored) => Ok(units),
        _ => Err(Error::OutOfRange { address, length }),
    }
}
