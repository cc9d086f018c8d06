//! Refer to reference manual:
//! RM0390, STM32F446xx advanced Arm-based 32-bit MCUs, section 3.8 (Flash interface registers)

use core::ptr::{read_volatile, write_volatile};
use core::sync::atomic::{compiler_fence, Ordering};

use bitflags::bitflags;

use crate::latency::ProgramSize;
use crate::sector::ERASED_BYTE;

/// Base address of the flash interface register block.
pub const FLASH_REGISTERS_BASE: u32 = 0x4002_3C00;

/// Registers of the flash interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Register {
    /// Access control register (wait states, caches).
    Acr,
    /// Key register, unlocks `Cr`.
    Keyr,
    /// Option key register, unlocks `Optcr`.
    Optkeyr,
    /// Status register.
    Sr,
    /// Control register.
    Cr,
    /// Option control register.
    Optcr,
}

impl Register {
    pub const fn offset(self) -> u32 {
        match self {
            Register::Acr => 0x00,
            Register::Keyr => 0x04,
            Register::Optkeyr => 0x08,
            Register::Sr => 0x0C,
            Register::Cr => 0x10,
            Register::Optcr => 0x14,
        }
    }
}

/// Mask of the wait-state field in `Acr`.
pub const ACR_LATENCY: u32 = 0xF;

bitflags! {
    /// Status register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Status: u32 {
        /// End of operation.
        const EOP = 1 << 0;
        /// Operation error.
        const OPERR = 1 << 1;
        /// Write protection error.
        const WRPERR = 1 << 4;
        /// Programming alignment error.
        const PGAERR = 1 << 5;
        /// Programming parallelism error.
        const PGPERR = 1 << 6;
        /// Programming sequence error.
        const PGSERR = 1 << 7;
        /// Proprietary readout protection (PCROP) error.
        const RDERR = 1 << 8;
        /// Erase, program or option update in progress.
        const BSY = 1 << 16;

        /// Every error flag, all write-1-to-clear.
        const ERRORS = Self::OPERR.bits()
            | Self::WRPERR.bits()
            | Self::PGAERR.bits()
            | Self::PGPERR.bits()
            | Self::PGSERR.bits()
            | Self::RDERR.bits();
    }
}

bitflags! {
    /// Control register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Control: u32 {
        /// Programming mode.
        const PG = 1 << 0;
        /// Sector erase mode.
        const SER = 1 << 1;
        /// Mass erase mode.
        const MER = 1 << 2;
        /// The 4 sector number bits.
        const SNB = 0xF << 3;
        /// The 2 program size bits.
        const PSIZE = 0x3 << 8;
        /// Start erase, self-clearing.
        const STRT = 1 << 16;
        /// End of operation interrupt enable.
        const EOPIE = 1 << 24;
        /// Error interrupt enable.
        const ERRIE = 1 << 25;
        /// Control register lock.
        const LOCK = 1 << 31;

        /// Operation mode together with the target sector.
        const MODE = Self::PG.bits() | Self::SER.bits() | Self::MER.bits() | Self::SNB.bits();
    }
}

impl Control {
    const SNB_SHIFT: u32 = 3;
    const PSIZE_SHIFT: u32 = 8;

    /// Sector number field set to `index`.
    pub const fn sector(index: u8) -> Self {
        Self::from_bits_retain(((index as u32) << Self::SNB_SHIFT) & Self::SNB.bits())
    }

    /// Sector number currently selected.
    pub const fn sector_number(self) -> u8 {
        ((self.bits() & Self::SNB.bits()) >> Self::SNB_SHIFT) as u8
    }

    /// Program size field set to `size`.
    pub const fn program_size(size: ProgramSize) -> Self {
        Self::from_bits_retain((size as u32) << Self::PSIZE_SHIFT)
    }

    /// Program size currently configured.
    pub const fn psize(self) -> ProgramSize {
        ProgramSize::from_bits((self.bits() & Self::PSIZE.bits()) >> Self::PSIZE_SHIFT)
    }
}

bitflags! {
    /// Option control register bits consumed by this driver.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OptionControl: u32 {
        /// Option control register lock.
        const OPTLOCK = 1 << 0;
        /// Apply the staged option bytes.
        const OPTSTRT = 1 << 1;
        /// The 8 per-sector write protection bits.
        const NWRP = 0xFF << 16;
        /// Selects PCROP interpretation of `NWRP`.
        const SPRMOD = 1 << 31;
    }
}

impl OptionControl {
    const NWRP_SHIFT: u32 = 16;

    /// Raw nWRP bitmap.
    pub const fn nwrp(self) -> u8 {
        ((self.bits() & Self::NWRP.bits()) >> Self::NWRP_SHIFT) as u8
    }

    /// nWRP field set to `bitmap`.
    pub const fn with_nwrp(bitmap: u8) -> Self {
        Self::from_bits_retain((bitmap as u32) << Self::NWRP_SHIFT)
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Status {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "Status({=u32:#x})", self.bits())
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Control {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "Control({=u32:#x})", self.bits())
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for OptionControl {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "OptionControl({=u32:#x})", self.bits())
    }
}

/// One program cycle worth of data, sized by the program parallelism.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProgramUnit {
    Byte(u8),
    HalfWord(u16),
    Word(u32),
    DoubleWord(u64),
}

impl ProgramUnit {
    /// Builds a unit from at most `size.bytes()` bytes of `chunk`.
    ///
    /// A short chunk is padded with the erased value, so the bytes past the
    /// end of the caller's data are programmed as `0xFF` and keep whatever
    /// erased state they had.
    pub fn from_chunk(size: ProgramSize, chunk: &[u8]) -> Self {
        let mut bytes = [ERASED_BYTE; 8];
        let len = chunk.len().min(size.bytes());
        bytes[..len].copy_from_slice(&chunk[..len]);
        match size {
            ProgramSize::X8 => ProgramUnit::Byte(bytes[0]),
            ProgramSize::X16 => ProgramUnit::HalfWord(u16::from_le_bytes([bytes[0], bytes[1]])),
            ProgramSize::X32 => {
                ProgramUnit::Word(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
            }
            ProgramSize::X64 => ProgramUnit::DoubleWord(u64::from_le_bytes(bytes)),
        }
    }

    /// Number of bytes stored by this unit.
    pub const fn len(self) -> usize {
        match self {
            ProgramUnit::Byte(_) => 1,
            ProgramUnit::HalfWord(_) => 2,
            ProgramUnit::Word(_) => 4,
            ProgramUnit::DoubleWord(_) => 8,
        }
    }

    /// Little-endian byte image of the unit, valid up to `len()`.
    pub fn to_le_bytes(self) -> [u8; 8] {
        let mut out = [0u8; 8];
        match self {
            ProgramUnit::Byte(b) => out[0] = b,
            ProgramUnit::HalfWord(h) => out[..2].copy_from_slice(&h.to_le_bytes()),
            ProgramUnit::Word(w) => out[..4].copy_from_slice(&w.to_le_bytes()),
            ProgramUnit::DoubleWord(d) => out.copy_from_slice(&d.to_le_bytes()),
        }
        out
    }
}

/// Access to the flash interface registers and the flash array behind it.
///
/// The driver owns exactly one implementor, so every access goes through
/// `&mut self` even for reads: reading `Sr` is how the hardware state is
/// observed and a simulated block needs to advance on it.
pub trait FlashRegisters {
    /// Reads a 32-bit register.
    fn read(&mut self, register: Register) -> u32;

    /// Writes a 32-bit register.
    fn write(&mut self, register: Register, value: u32);

    /// Read-modify-write of a register.
    fn modify<F: FnOnce(u32) -> u32>(&mut self, register: Register, f: F) {
        let value = self.read(register);
        self.write(register, f(value));
    }

    /// Copies `buf.len()` bytes of the flash array starting at `address`.
    fn read_memory(&mut self, address: u32, buf: &mut [u8]);

    /// Performs a single program store of `unit` at `address`.
    fn program_unit(&mut self, address: u32, unit: ProgramUnit);
}

/// The memory-mapped flash interface of the running device.
#[derive(Debug)]
pub struct FlashPeripheral {
    _private: (),
}

impl FlashPeripheral {
    /// # Safety
    ///
    /// Only one `FlashPeripheral` may exist at a time and nothing else may
    /// touch the flash interface registers while it does.
    pub unsafe fn steal() -> Self {
        Self { _private: () }
    }

    #[inline]
    fn address(register: Register) -> usize {
        (FLASH_REGISTERS_BASE + register.offset()) as usize
    }
}

impl FlashRegisters for FlashPeripheral {
    #[inline]
    fn read(&mut self, register: Register) -> u32 {
        // SAFETY: aligned register inside the flash interface block, which
        // this handle owns exclusively.
        unsafe { read_volatile(Self::address(register) as *const u32) }
    }

    #[inline]
    fn write(&mut self, register: Register, value: u32) {
        // SAFETY: see `read`.
        unsafe { write_volatile(Self::address(register) as *mut u32, value) }
        compiler_fence(Ordering::SeqCst);
    }

    fn read_memory(&mut self, address: u32, buf: &mut [u8]) {
        let base = address as usize as *const u8;
        for (i, byte) in buf.iter_mut().enumerate() {
            // SAFETY: the caller checked the range lies inside the flash array.
            *byte = unsafe { read_volatile(base.add(i)) };
        }
    }

    fn program_unit(&mut self, address: u32, unit: ProgramUnit) {
        compiler_fence(Ordering::SeqCst);
        // SAFETY: the caller checked range and alignment; the store width
        // matches the PSIZE programmed into the control register.
        unsafe {
            match unit {
                ProgramUnit::Byte(b) => write_volatile(address as usize as *mut u8, b),
                ProgramUnit::HalfWord(h) => write_volatile(address as usize as *mut u16, h),
                ProgramUnit::Word(w) => write_volatile(address as usize as *mut u32, w),
                ProgramUnit::DoubleWord(d) => write_volatile(address as usize as *mut u64, d),
            }
        }
        compiler_fence(Ordering::SeqCst);
    }
}
