//! Simulated STM32F446 flash interface for host tests.

use core::future::Future;
use core::pin::pin;
use core::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use crate::keys::KeyLock;
use crate::registers::{Control, FlashRegisters, OptionControl, ProgramUnit, Register, Status};
use crate::sector::{Sector, ERASED_BYTE, FLASH_BASE, FLASH_SIZE};

/// OPTCR reset value from the reference manual.
pub const OPTCR_RESET: u32 = 0x0FFF_AAED;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyStage {
    Idle,
    FirstKey,
}

/// Flash interface with an in-memory array.
///
/// Models the parts of the hardware the driver relies on: key sequences,
/// lock bits ignoring writes, program gating by PG and PSIZE, programming
/// that can only clear bits, sector and mass erase on STRT, option apply on
/// OPTSTRT, and a busy flag that stays up for a configurable number of
/// status reads after each operation.
pub struct MockFlash {
    acr: u32,
    sr: u32,
    cr: u32,
    optcr: u32,
    applied_optcr: u32,
    control_keys: KeyStage,
    option_keys: KeyStage,
    memory: Vec<u8>,
    busy_reads: u32,
    busy_remaining: u32,
    stuck_busy: bool,
    reject_keys: bool,
    next_errors: Status,
    /// Values written to either key register.
    pub key_writes: usize,
    /// Key writes the hardware would answer with a bus fault.
    pub bus_faults: usize,
    /// Every program store accepted by the array.
    pub programmed: Vec<(u32, ProgramUnit)>,
    /// Number of erases started with STRT.
    pub erases: usize,
}

impl MockFlash {
    /// Reset state: both registers locked, array erased.
    pub fn new() -> Self {
        Self {
            acr: 0,
            sr: 0,
            cr: Control::LOCK.bits(),
            optcr: OPTCR_RESET,
            applied_optcr: OPTCR_RESET,
            control_keys: KeyStage::Idle,
            option_keys: KeyStage::Idle,
            memory: vec![ERASED_BYTE; FLASH_SIZE],
            busy_reads: 0,
            busy_remaining: 0,
            stuck_busy: false,
            reject_keys: false,
            next_errors: Status::empty(),
            key_writes: 0,
            bus_faults: 0,
            programmed: Vec::new(),
            erases: 0,
        }
    }

    /// Reset state with both lock bits already cleared.
    pub fn unlocked() -> Self {
        let mut mock = Self::new();
        mock.cr &= !Control::LOCK.bits();
        mock.optcr &= !OptionControl::OPTLOCK.bits();
        mock
    }

    /// Keeps BSY set for `reads` status reads after each operation.
    pub fn with_busy_reads(mut self, reads: u32) -> Self {
        self.busy_reads = reads;
        self
    }

    pub fn set_stuck_busy(&mut self, stuck: bool) {
        self.stuck_busy = stuck;
    }

    /// Accepts the key sequences without ever clearing a lock bit.
    pub fn reject_keys(&mut self) {
        self.reject_keys = true;
    }

    /// Sets status flags right away.
    pub fn raise(&mut self, status: Status) {
        self.sr |= status.bits();
    }

    /// The next erase, program or option update fails with `errors`.
    pub fn fail_next_operation(&mut self, errors: Status) {
        self.next_errors = errors;
    }

    pub fn seed(&mut self, address: u32, data: &[u8]) {
        let offset = (address - FLASH_BASE) as usize;
        self.memory[offset..offset + data.len()].copy_from_slice(data);
    }

    pub fn memory(&self, address: u32, length: usize) -> &[u8] {
        let offset = (address - FLASH_BASE) as usize;
        &self.memory[offset..offset + length]
    }

    pub fn acr(&self) -> u32 {
        self.acr
    }

    pub fn cr(&self) -> u32 {
        self.cr
    }

    pub fn optcr(&self) -> u32 {
        self.optcr
    }

    /// Option bytes as of the last OPTSTRT.
    pub fn applied_optcr(&self) -> u32 {
        self.applied_optcr
    }

    fn complete(&mut self) -> bool {
        self.busy_remaining = self.busy_reads;
        if self.next_errors.is_empty() {
            self.sr |= Status::EOP.bits();
            true
        } else {
            self.sr |= self.next_errors.bits();
            self.next_errors = Status::empty();
            false
        }
    }

    fn enter_key(&mut self, key: KeyLock, value: u32) {
        self.key_writes += 1;
        let (stage, locked) = match key {
            KeyLock::Control => (self.control_keys, self.cr & Control::LOCK.bits() != 0),
            KeyLock::Options => (self.option_keys, self.optcr & OptionControl::OPTLOCK.bits() != 0),
        };
        let [key1, key2] = key.keys();
        let next = match (locked, stage) {
            (true, KeyStage::Idle) if value == key1 => KeyStage::FirstKey,
            (true, KeyStage::FirstKey) if value == key2 => {
                if !self.reject_keys {
                    match key {
                        KeyLock::Control => self.cr &= !Control::LOCK.bits(),
                        KeyLock::Options => self.optcr &= !OptionControl::OPTLOCK.bits(),
                    }
                }
                KeyStage::Idle
            }
            _ => {
                self.bus_faults += 1;
                KeyStage::Idle
            }
        };
        match key {
            KeyLock::Control => self.control_keys = next,
            KeyLock::Options => self.option_keys = next,
        }
    }

    fn write_control(&mut self, value: u32) {
        if self.cr & Control::LOCK.bits() != 0 {
            return;
        }
        let requested = Control::from_bits_retain(value);
        self.cr = requested.difference(Control::STRT).bits();
        if !requested.contains(Control::STRT) {
            return;
        }
        self.erases += 1;
        if !self.complete() {
            return;
        }
        if requested.contains(Control::MER) {
            self.memory.fill(ERASED_BYTE);
        } else if requested.contains(Control::SER) {
            match Sector::new(requested.sector_number()) {
                Some(sector) => {
                    let start = (sector.base() - FLASH_BASE) as usize;
                    let end = (sector.end() - FLASH_BASE) as usize;
                    self.memory[start..end].fill(ERASED_BYTE);
                }
                None => self.sr |= Status::OPERR.bits(),
            }
        } else {
            self.sr |= Status::PGSERR.bits();
        }
    }

    fn write_option_control(&mut self, value: u32) {
        if self.optcr & OptionControl::OPTLOCK.bits() != 0 {
            return;
        }
        let requested = OptionControl::from_bits_retain(value);
        self.optcr = requested.difference(OptionControl::OPTSTRT).bits();
        if requested.contains(OptionControl::OPTSTRT) && self.complete() {
            self.applied_optcr = self.optcr;
        }
    }
}

impl Default for MockFlash {
    fn default() -> Self {
        Self::new()
    }
}

impl FlashRegisters for MockFlash {
    fn read(&mut self, register: Register) -> u32 {
        match register {
            Register::Acr => self.acr,
            Register::Keyr | Register::Optkeyr => 0,
            Register::Sr => {
                if self.stuck_busy {
                    self.sr | Status::BSY.bits()
                } else if self.busy_remaining > 0 {
                    self.busy_remaining -= 1;
                    self.sr | Status::BSY.bits()
                } else {
                    self.sr
                }
            }
            Register::Cr => self.cr,
            Register::Optcr => self.optcr,
        }
    }

    fn write(&mut self, register: Register, value: u32) {
        match register {
            Register::Acr => self.acr = value,
            Register::Keyr => self.enter_key(KeyLock::Control, value),
            Register::Optkeyr => self.enter_key(KeyLock::Options, value),
            Register::Sr => self.sr &= !(value & (Status::ERRORS | Status::EOP).bits()),
            Register::Cr => self.write_control(value),
            Register::Optcr => self.write_option_control(value),
        }
    }

    fn read_memory(&mut self, address: u32, buf: &mut [u8]) {
        buf.copy_from_slice(self.memory(address, buf.len()));
    }

    fn program_unit(&mut self, address: u32, unit: ProgramUnit) {
        let cr = Control::from_bits_retain(self.cr);
        if cr.contains(Control::LOCK) || !cr.contains(Control::PG) {
            self.sr |= Status::PGSERR.bits();
            return;
        }
        if unit.len() != cr.psize().bytes() {
            self.sr |= Status::PGPERR.bits();
            return;
        }
        if address as usize % unit.len() != 0 {
            self.sr |= Status::PGAERR.bits();
            return;
        }
        if !self.complete() {
            return;
        }
        let offset = (address - FLASH_BASE) as usize;
        let bytes = unit.to_le_bytes();
        for (cell, byte) in self.memory[offset..offset + unit.len()]
            .iter_mut()
            .zip(bytes)
        {
            *cell &= byte;
        }
        self.programmed.push((address, unit));
    }
}

/// Delay provider that only records how long it was asked to wait.
#[derive(Debug, Default)]
pub struct MockDelay {
    pub elapsed_ns: u64,
    pub calls: usize,
}

impl embedded_hal::delay::DelayNs for MockDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.elapsed_ns += u64::from(ns);
        self.calls += 1;
    }
}

impl embedded_hal_async::delay::DelayNs for MockDelay {
    async fn delay_ns(&mut self, ns: u32) {
        self.elapsed_ns += u64::from(ns);
        self.calls += 1;
    }
}

/// Polls `future` to completion on the current thread.
pub fn block_on<F: Future>(future: F) -> F::Output {
    fn raw_waker() -> RawWaker {
        fn clone(_: *const ()) -> RawWaker {
            raw_waker()
        }
        fn noop(_: *const ()) {}
        static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, noop, noop, noop);
        RawWaker::new(core::ptr::null(), &VTABLE)
    }

    // SAFETY: the vtable functions ignore the data pointer.
    let waker = unsafe { Waker::from_raw(raw_waker()) };
    let mut cx = Context::from_waker(&waker);
    let mut future = pin!(future);
    loop {
        if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
            return output;
        }
    }
}
