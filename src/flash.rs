//! Blocking driver for the STM32F446 embedded flash.
//!
//! Refer to reference manual:
//! RM0390, section 3 (Embedded Flash memory interface)
//!
//! Every mutating call runs unlock, mutate, wait until idle, lock. The
//! driver owns the register handle, so two callers inside one program
//! cannot interleave those sequences; sharing it across interrupt contexts
//! still needs an external mutex.

use core::fmt::Debug;

use embedded_hal::delay::DelayNs;
use embedded_storage::nor_flash::{ErrorType, NorFlash, ReadNorFlash};
use hardware_traits::HardwareFlashDevice;

use crate::config::Config;
use crate::controller::{check_write, FlashController};
use crate::error::Error;
use crate::keys::KeyLock;
use crate::latency::wait_states;
use crate::protection::{ProtectionLevel, ProtectionState, SectorMask};
use crate::registers::{FlashRegisters, ProgramUnit};
use crate::sector::{sectors_spanning, Sector, FLASH_BASE, FLASH_SIZE, SECTOR_COUNT};

/// Blocking flash driver.
///
/// Also usable as an `embedded-storage` [`NorFlash`]. Its erase only
/// accepts ranges on real sector boundaries: sectors 4 to 7 are 64 KiB and
/// 128 KiB, so a range aligned to `ERASE_SIZE` (16 KiB) that starts or ends
/// inside one of them fails with [`Error::NotAligned`].
pub struct Flash<R, D> {
    controller: FlashController<R>,
    delay: D,
    config: Config,
}

impl<R, D> Debug for Flash<R, D> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Flash")
            .field("config", &self.config)
            .finish()
    }
}

impl<R, D> Flash<R, D>
where
    R: FlashRegisters,
    D: DelayNs,
{
    /// Takes ownership of the flash interface and configures it for
    /// `core_clock_hz`.
    ///
    /// Must run before any program or erase, and again whenever the core
    /// clock changes.
    pub fn init(regs: R, delay: D, core_clock_hz: u32, config: Config) -> Result<Self, Error> {
        let mut this = Self {
            controller: FlashController::new(regs),
            delay,
            config,
        };
        this.wait_until_idle()?;
        this.configure_access_latency(core_clock_hz)?;
        debug!(
            "Flash ready: {=u8} wait states, {}",
            this.controller.latency(),
            this.config.supply.program_size()
        );
        Ok(this)
    }

    /// Gives back the register handle and the delay provider.
    pub fn release(self) -> (R, D) {
        (self.controller.release(), self.delay)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Programs the wait states for `core_clock_hz` and the program
    /// parallelism of the configured supply range.
    pub fn configure_access_latency(&mut self, core_clock_hz: u32) -> Result<(), Error> {
        let supply = self.config.supply;
        self.controller.set_latency(wait_states(core_clock_hz, supply));
        self.with_unlocked(KeyLock::Control, |flash| {
            flash.controller.set_program_size(supply.program_size());
            Ok(())
        })
    }

    /// Reads flash contents into `buf`, starting at `address`.
    ///
    /// Reads are never gated by the lock. On error `buf` is left untouched.
    pub fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), Error> {
        self.controller.read(address, buf)
    }

    /// Programs `data` at `address`.
    ///
    /// `address` must be aligned to the program parallelism. A trailing
    /// partial unit is padded with `0xFF`, which leaves the padded bytes in
    /// their current state. The target must have been erased: programming
    /// can only clear bits, and the driver does not check.
    pub fn write(&mut self, address: u32, data: &[u8]) -> Result<(), Error> {
        let size = self.config.supply.program_size();
        let units = check_write(address, data.len(), size)?;
        if units == 0 {
            return Ok(());
        }
        trace!("Programming {=usize} bytes at {=u32:#010x}", data.len(), address);
        self.with_unlocked(KeyLock::Control, |flash| {
            flash.controller.clear_status();
            flash.controller.select_program();
            let result = flash.program_units(address, data);
            flash.controller.clear_mode();
            result
        })
    }

    fn program_units(&mut self, address: u32, data: &[u8]) -> Result<(), Error> {
        let size = self.config.supply.program_size();
        let mut target = address;
        for chunk in data.chunks(size.bytes()) {
            self.controller.program_unit(target, ProgramUnit::from_chunk(size, chunk));
            self.wait_until_idle()?;
            self.controller.take_errors().inspect_err(|e| {
                error!("Program failed at {=u32:#010x}: {}", target, e);
            })?;
            target += size.bytes() as u32;
        }
        Ok(())
    }

    /// Sets every byte of sector `index` to `0xFF`.
    pub fn erase_sector(&mut self, index: u8) -> Result<(), Error> {
        let sector = Sector::new(index).ok_or(Error::InvalidSector(index))?;
        debug!("Erasing sector {=u8}", index);
        self.with_unlocked(KeyLock::Control, |flash| {
            flash.controller.clear_status();
            flash.controller.select_sector_erase(sector);
            flash.controller.start();
            flash.finish_erase()
        })
    }

    /// Sets every byte of the main flash array to `0xFF`.
    pub fn erase_all(&mut self) -> Result<(), Error> {
        info!("Mass erase");
        self.with_unlocked(KeyLock::Control, |flash| {
            flash.controller.clear_status();
            flash.controller.select_mass_erase();
            flash.controller.start();
            flash.finish_erase()
        })
    }

    fn finish_erase(&mut self) -> Result<(), Error> {
        let result = self
            .wait_until_idle()
            .and_then(|()| self.controller.take_errors());
        self.controller.clear_mode();
        if let Err(e) = result {
            error!("Erase failed: {}", e);
        }
        result
    }

    /// Current protection configuration.
    pub fn protection(&mut self) -> ProtectionState {
        self.controller.protection()
    }

    /// Effective protection level of every sector, indexed by sector number.
    pub fn protection_levels(&mut self) -> [ProtectionLevel; SECTOR_COUNT] {
        self.protection().levels()
    }

    /// Applies `level` to `sectors`.
    ///
    /// `Write` and `ReadWrite` make exactly `sectors` protected at that
    /// level and every other sector unprotected. `None` unprotects
    /// `sectors` and leaves the others as they are.
    pub fn set_protection_levels(
        &mut self,
        level: ProtectionLevel,
        sectors: SectorMask,
    ) -> Result<(), Error> {
        self.with_unlocked(KeyLock::Options, |flash| {
            let state = flash.controller.protection().with_level(level, sectors);
            info!("Applying protection {}", state);
            flash.controller.clear_status();
            flash.controller.stage_protection(state);
            flash.controller.start_option_update();
            flash.wait_until_idle()?;
            flash.controller.take_errors()
        })
    }

    /// Raw test of one bit of the status register.
    pub fn is_status_bit_set(&mut self, position: u8) -> bool {
        self.controller.is_status_bit_set(position)
    }

    /// Writes the key sequence for `key` if it is locked, then waits until
    /// the controller is idle.
    pub fn unlock(&mut self, key: KeyLock) -> Result<(), Error> {
        if self.controller.is_locked(key) {
            self.controller.write_keys(key);
        }
        self.wait_until_idle()?;
        if self.controller.is_locked(key) {
            warn!("{} still locked after key sequence", key);
            return Err(Error::Locked);
        }
        Ok(())
    }

    pub fn lock(&mut self, key: KeyLock) {
        self.controller.lock(key);
    }

    /// Runs `op` with `key` unlocked and locks again on every exit path.
    fn with_unlocked<T>(
        &mut self,
        key: KeyLock,
        op: impl FnOnce(&mut Self) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let result = match self.unlock(key) {
            Ok(()) => op(self),
            Err(e) => Err(e),
        };
        self.controller.lock(key);
        result
    }

    /// Block until the busy flag clears, or fail with [`Error::Timeout`].
    pub fn wait_until_idle(&mut self) -> Result<(), Error> {
        let interval = self.config.poll_interval_us.max(1);
        let mut waited_us: u32 = 0;
        while self.controller.is_busy() {
            if waited_us >= self.config.busy_timeout_us {
                error!("Flash still busy after {=u32} us", waited_us);
                return Err(Error::Timeout);
            }
            self.delay.delay_us(interval);
            waited_us = waited_us.saturating_add(interval);
        }
        Ok(())
    }
}

impl<R, D> HardwareFlashDevice for Flash<R, D>
where
    R: FlashRegisters,
    D: DelayNs,
{
    type Error = Error;

    /// Reads flash contents into `buf`, starting at the absolute address `addr`.
    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), Error> {
        self.controller.read(addr, buf)
    }

    /// Erases the sector holding the absolute address `addr`.
    fn sector_erase(&mut self, addr: u32) -> Result<(), Error> {
        let sector = Sector::containing(addr).ok_or(Error::OutOfRange {
            address: addr,
            length: 0,
        })?;
        self.erase_sector(sector.index())
    }

    fn page_program(&mut self, addr: u32, data: &[u8]) -> Result<(), Error> {
        self.write(addr, data)
    }

    fn chip_erase(&mut self) -> Result<(), Error> {
        self.erase_all()
    }
}

impl<R, D> ErrorType for Flash<R, D> {
    type Error = Error;
}

/// Offsets are relative to the start of the main flash array.
impl<R, D> ReadNorFlash for Flash<R, D>
where
    R: FlashRegisters,
    D: DelayNs,
{
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Error> {
        let address = FLASH_BASE.checked_add(offset).ok_or(Error::OutOfRange {
            address: offset,
            length: bytes.len(),
        })?;
        self.controller.read(address, bytes)
    }

    fn capacity(&self) -> usize {
        FLASH_SIZE
    }
}

/// Sectors are not uniform, so `ERASE_SIZE` is the smallest one and an
/// erase range must start and end on sector boundaries.
///
/// `WRITE_SIZE` is the widest program parallelism, which every supply range
/// divides.
impl<R, D> NorFlash for Flash<R, D>
where
    R: FlashRegisters,
    D: DelayNs,
{
    const WRITE_SIZE: usize = 8;
    const ERASE_SIZE: usize = 16 * 1024;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Error> {
        for sector in sectors_spanning(from, to)? {
            self.erase_sector(sector.index())?;
        }
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Error> {
        let address = FLASH_BASE.checked_add(offset).ok_or(Error::OutOfRange {
            address: offset,
            length: bytes.len(),
        })?;
        Flash::write(self, address, bytes)
    }
}
