//! Async driver for the STM32F446 embedded flash.
//!
//! Same register sequences as [`Flash`](crate::Flash); every busy wait
//! yields to the executor through the delay provider instead of spinning.

use core::fmt::Debug;

use embedded_hal_async::delay::DelayNs;
use hardware_traits::AsyncHardwareFlashDevice;

use crate::config::Config;
use crate::controller::{check_write, FlashController};
use crate::error::Error;
use crate::keys::KeyLock;
use crate::latency::wait_states;
use crate::protection::{ProtectionLevel, ProtectionState, SectorMask};
use crate::registers::{FlashRegisters, ProgramUnit};
use crate::sector::{sectors_spanning, Sector, SECTOR_COUNT};

pub struct AsyncFlash<R, D> {
    controller: FlashController<R>,
    delay: D,
    config: Config,
}

impl<R, D> Debug for AsyncFlash<R, D> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AsyncFlash")
            .field("config", &self.config)
            .finish()
    }
}

impl<R, D> AsyncFlash<R, D>
where
    R: FlashRegisters,
    D: DelayNs,
{
    pub async fn init(
        regs: R,
        delay: D,
        core_clock_hz: u32,
        config: Config,
    ) -> Result<Self, Error> {
        let mut this = Self {
            controller: FlashController::new(regs),
            delay,
            config,
        };
        this.wait_until_idle().await?;
        this.configure_access_latency(core_clock_hz).await?;
        debug!(
            "Flash ready: {=u8} wait states, {}",
            this.controller.latency(),
            this.config.supply.program_size()
        );
        Ok(this)
    }

    pub fn release(self) -> (R, D) {
        (self.controller.release(), self.delay)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn configure_access_latency(&mut self, core_clock_hz: u32) -> Result<(), Error> {
        let supply = self.config.supply;
        self.controller.set_latency(wait_states(core_clock_hz, supply));
        let result = self.unlock(KeyLock::Control).await;
        if result.is_ok() {
            self.controller.set_program_size(supply.program_size());
        }
        self.controller.lock(KeyLock::Control);
        result
    }

    pub fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), Error> {
        self.controller.read(address, buf)
    }

    /// Programs `data` at `address`; see [`Flash::write`](crate::Flash::write).
    pub async fn write(&mut self, address: u32, data: &[u8]) -> Result<(), Error> {
        let units = check_write(address, data.len(), self.config.supply.program_size())?;
        if units == 0 {
            return Ok(());
        }
        trace!("Programming {=usize} bytes at {=u32:#010x}", data.len(), address);
        let mut result = self.unlock(KeyLock::Control).await;
        if result.is_ok() {
            self.controller.clear_status();
            self.controller.select_program();
            result = self.program_units(address, data).await;
            self.controller.clear_mode();
        }
        self.controller.lock(KeyLock::Control);
        result
    }

    async fn program_units(&mut self, address: u32, data: &[u8]) -> Result<(), Error> {
        let size = self.config.supply.program_size();
        let mut target = address;
        for chunk in data.chunks(size.bytes()) {
            self.controller.program_unit(target, ProgramUnit::from_chunk(size, chunk));
            self.wait_until_idle().await?;
            if let Err(e) = self.controller.take_errors() {
                error!("Program failed at {=u32:#010x}: {}", target, e);
                return Err(e);
            }
            target += size.bytes() as u32;
        }
        Ok(())
    }

    pub async fn erase_sector(&mut self, index: u8) -> Result<(), Error> {
        let sector = Sector::new(index).ok_or(Error::InvalidSector(index))?;
        debug!("Erasing sector {=u8}", index);
        let mut result = self.unlock(KeyLock::Control).await;
        if result.is_ok() {
            self.controller.clear_status();
            self.controller.select_sector_erase(sector);
            self.controller.start();
            result = self.finish_erase().await;
        }
        self.controller.lock(KeyLock::Control);
        result
    }

    pub async fn erase_all(&mut self) -> Result<(), Error> {
        info!("Mass erase");
        let mut result = self.unlock(KeyLock::Control).await;
        if result.is_ok() {
            self.controller.clear_status();
            self.controller.select_mass_erase();
            self.controller.start();
            result = self.finish_erase().await;
        }
        self.controller.lock(KeyLock::Control);
        result
    }

    /// Erases every sector in the offset range `[from, to)`, which must
    /// start and end on sector boundaries.
    pub async fn erase_range(&mut self, from: u32, to: u32) -> Result<(), Error> {
        for sector in sectors_spanning(from, to)? {
            self.erase_sector(sector.index()).await?;
        }
        Ok(())
    }

    async fn finish_erase(&mut self) -> Result<(), Error> {
        let mut result = self.wait_until_idle().await;
        if result.is_ok() {
            result = self.controller.take_errors();
        }
        self.controller.clear_mode();
        if let Err(e) = result {
            error!("Erase failed: {}", e);
        }
        result
    }

    pub fn protection(&mut self) -> ProtectionState {
        self.controller.protection()
    }

    pub fn protection_levels(&mut self) -> [ProtectionLevel; SECTOR_COUNT] {
        self.protection().levels()
    }

    pub async fn set_protection_levels(
        &mut self,
        level: ProtectionLevel,
        sectors: SectorMask,
    ) -> Result<(), Error> {
        let mut result = self.unlock(KeyLock::Options).await;
        if result.is_ok() {
            let state = self.controller.protection().with_level(level, sectors);
            info!("Applying protection {}", state);
            self.controller.clear_status();
            self.controller.stage_protection(state);
            self.controller.start_option_update();
            result = self.wait_until_idle().await;
            if result.is_ok() {
                result = self.controller.take_errors();
            }
        }
        self.controller.lock(KeyLock::Options);
        result
    }

    pub fn is_status_bit_set(&mut self, position: u8) -> bool {
        self.controller.is_status_bit_set(position)
    }

    pub async fn unlock(&mut self, key: KeyLock) -> Result<(), Error> {
        if self.controller.is_locked(key) {
            self.controller.write_keys(key);
        }
        self.wait_until_idle().await?;
        if self.controller.is_locked(key) {
            warn!("{} still locked after key sequence", key);
            return Err(Error::Locked);
        }
        Ok(())
    }

    pub fn lock(&mut self, key: KeyLock) {
        self.controller.lock(key);
    }

    pub async fn wait_until_idle(&mut self) -> Result<(), Error> {
        let interval = self.config.poll_interval_us.max(1);
        let mut waited_us: u32 = 0;
        while self.controller.is_busy() {
            if waited_us >= self.config.busy_timeout_us {
                error!("Flash still busy after {=u32} us", waited_us);
                return Err(Error::Timeout);
            }
            self.delay.delay_us(interval).await;
            waited_us = waited_us.saturating_add(interval);
        }
        Ok(())
    }
}

impl<R, D> AsyncHardwareFlashDevice for AsyncFlash<R, D>
where
    R: FlashRegisters,
    D: DelayNs,
{
    type Error = Error;

    async fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), Error> {
        self.controller.read(addr, buf)
    }

    async fn sector_erase(&mut self, addr: u32) -> Result<(), Error> {
        let sector = Sector::containing(addr).ok_or(Error::OutOfRange {
            address: addr,
            length: 0,
        })?;
        self.erase_sector(sector.index()).await
    }

    async fn page_program(&mut self, addr: u32, data: &[u8]) -> Result<(), Error> {
        self.write(addr, data).await
    }

    async fn chip_erase(&mut self) -> Result<(), Error> {
        self.erase_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{block_on, MockDelay, MockFlash};
    use crate::registers::{Control, Status};
    use crate::sector::FLASH_BASE;

    fn flash_with(mock: MockFlash) -> AsyncFlash<MockFlash, MockDelay> {
        block_on(AsyncFlash::init(
            mock,
            MockDelay::default(),
            168_000_000,
            Config::default(),
        ))
        .unwrap()
    }

    #[test]
    fn init_sets_latency() {
        let flash = flash_with(MockFlash::new());
        let (mock, _) = flash.release();
        assert_eq!(mock.acr() & 0xF, 5);
        assert!(Control::from_bits_retain(mock.cr()).contains(Control::LOCK));
    }

    #[test]
    fn erase_then_program() {
        let mut mock = MockFlash::new().with_busy_reads(3);
        mock.seed(0x0800_8000, &[0; 8]);
        let mut flash = flash_with(mock);

        block_on(flash.erase_sector(2)).unwrap();
        block_on(flash.write(0x0800_8000, &[0xAA, 0xBB, 0xCC])).unwrap();

        let mut buf = [0u8; 8];
        flash.read(0x0800_8000, &mut buf).unwrap();
        assert_eq!(buf, [0xAA, 0xBB, 0xCC, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);

        let (mock, delay) = flash.release();
        assert!(delay.calls >= 6);
        assert!(Control::from_bits_retain(mock.cr()).contains(Control::LOCK));
    }

    #[test]
    fn hardware_trait_round_trip() {
        let mut flash = flash_with(MockFlash::new());
        let address = 0x0804_0010;
        block_on(AsyncHardwareFlashDevice::sector_erase(&mut flash, address)).unwrap();
        let data = [1, 2, 3, 4];
        block_on(AsyncHardwareFlashDevice::page_program(&mut flash, address, &data)).unwrap();
        let mut buf = [0u8; 4];
        block_on(AsyncHardwareFlashDevice::read(&mut flash, address, &mut buf)).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn timeout_relocks() {
        let mut flash = flash_with(MockFlash::new());
        flash.config = Config::default().with_busy_timeout_us(50);
        flash.controller.regs_mut().set_stuck_busy(true);
        assert_eq!(block_on(flash.erase_all()), Err(Error::Timeout));
        let (mock, delay) = flash.release();
        assert_eq!(delay.elapsed_ns, 50_000);
        assert!(Control::from_bits_retain(mock.cr()).contains(Control::LOCK));
    }

    #[test]
    fn failed_erase_reports_status() {
        let mut flash = flash_with(MockFlash::new());
        flash.controller.regs_mut().fail_next_operation(Status::WRPERR);
        assert_eq!(
            block_on(flash.erase_sector(0)),
            Err(Error::Hardware(Status::WRPERR))
        );
        assert!(!flash.is_status_bit_set(4));
    }

    #[test]
    fn erase_range_walks_sectors() {
        let mut flash = flash_with(MockFlash::new());
        block_on(flash.erase_range(0x2_0000, 0x6_0000)).unwrap();
        assert_eq!(
            block_on(flash.erase_range(0x2_0000, 0x2_1000)),
            Err(Error::NotAligned { address: 0x2_0000 })
        );
        let (mock, _) = flash.release();
        assert_eq!(mock.erases, 2);
    }

    #[test]
    fn protection_round_trip() {
        let mut flash = flash_with(MockFlash::new());
        let sector = SectorMask::SECTOR_5;
        block_on(flash.set_protection_levels(ProtectionLevel::Write, sector)).unwrap();
        assert_eq!(flash.protection_levels()[5], ProtectionLevel::Write);
        block_on(flash.set_protection_levels(ProtectionLevel::None, sector)).unwrap();
        assert_eq!(flash.protection(), ProtectionState::default());
        let (mock, _) = flash.release();
        assert_eq!(mock.bus_faults, 0);
        assert_eq!(mock.optcr() & 1, 1);
    }

    #[test]
    fn read_outside_array_is_rejected() {
        let mut flash = flash_with(MockFlash::new());
        let mut buf = [0u8; 2];
        assert!(flash.read(FLASH_BASE - 1, &mut buf).is_err());
    }
}
