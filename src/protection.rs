//! Sector write protection and proprietary code readout protection (PCROP).
//!
//! The option control register carries one nWRP bit per sector plus the
//! SPRMOD flag, and SPRMOD flips what a bit means:
//!
//! | SPRMOD | nWRP bit | level        |
//! |--------|----------|--------------|
//! | 0      | 0        | write        |
//! | 0      | 1        | none         |
//! | 1      | 0        | none         |
//! | 1      | 1        | read + write |
//!
//! [`ProtectionState`] is the only place that knows this table.

use bitflags::bitflags;

use crate::registers::OptionControl;
use crate::sector::{Sector, SECTOR_COUNT};

bitflags! {
    /// A set of sectors.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SectorMask: u8 {
        const SECTOR_0 = 1 << 0;
        const SECTOR_1 = 1 << 1;
        const SECTOR_2 = 1 << 2;
        const SECTOR_3 = 1 << 3;
        const SECTOR_4 = 1 << 4;
        const SECTOR_5 = 1 << 5;
        const SECTOR_6 = 1 << 6;
        const SECTOR_7 = 1 << 7;
    }
}

impl SectorMask {
    pub fn contains_sector(self, sector: Sector) -> bool {
        self.contains(SectorMask::from(sector))
    }
}

impl From<Sector> for SectorMask {
    fn from(sector: Sector) -> Self {
        SectorMask::from_bits_retain(1 << sector.index())
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for SectorMask {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "SectorMask({=u8:#010b})", self.bits())
    }
}

/// Effective protection of one sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProtectionLevel {
    None,
    /// Erase and program are rejected.
    Write,
    /// Erase and program are rejected and only instruction fetches may read.
    ReadWrite,
}

/// Protection configuration as held by the option bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProtectionState {
    /// SPRMOD clear: the listed sectors are write protected.
    WriteProtect(SectorMask),
    /// SPRMOD set: the listed sectors are read and write protected.
    ReadWriteProtect(SectorMask),
}

impl Default for ProtectionState {
    /// Factory state: PCROP off, every nWRP bit set.
    fn default() -> Self {
        ProtectionState::WriteProtect(SectorMask::empty())
    }
}

impl ProtectionState {
    /// Decodes the SPRMOD flag and nWRP bitmap of an `OPTCR` value.
    pub fn from_option_control(optcr: OptionControl) -> Self {
        let nwrp = optcr.nwrp();
        if optcr.contains(OptionControl::SPRMOD) {
            ProtectionState::ReadWriteProtect(SectorMask::from_bits_retain(nwrp))
        } else {
            ProtectionState::WriteProtect(SectorMask::from_bits_retain(!nwrp))
        }
    }

    /// Encodes the state into the SPRMOD and nWRP bits of `optcr`, leaving
    /// every other bit as it was.
    pub fn apply_to(self, optcr: OptionControl) -> OptionControl {
        let kept = optcr.difference(OptionControl::SPRMOD | OptionControl::NWRP);
        match self {
            ProtectionState::WriteProtect(mask) => kept | OptionControl::with_nwrp(!mask.bits()),
            ProtectionState::ReadWriteProtect(mask) => {
                kept | OptionControl::SPRMOD | OptionControl::with_nwrp(mask.bits())
            }
        }
    }

    /// Sectors carrying protection in this state.
    pub const fn protected(self) -> SectorMask {
        match self {
            ProtectionState::WriteProtect(mask) | ProtectionState::ReadWriteProtect(mask) => mask,
        }
    }

    pub fn level(self, sector: Sector) -> ProtectionLevel {
        match self {
            ProtectionState::WriteProtect(mask) if mask.contains_sector(sector) => {
                ProtectionLevel::Write
            }
            ProtectionState::ReadWriteProtect(mask) if mask.contains_sector(sector) => {
                ProtectionLevel::ReadWrite
            }
            _ => ProtectionLevel::None,
        }
    }

    /// Level of every sector, indexed by sector number.
    pub fn levels(self) -> [ProtectionLevel; SECTOR_COUNT] {
        let mut levels = [ProtectionLevel::None; SECTOR_COUNT];
        for sector in Sector::all() {
            levels[sector.index() as usize] = self.level(sector);
        }
        levels
    }

    /// The state after applying `level` to `sectors`.
    ///
    /// `Write` and `ReadWrite` replace the whole configuration: exactly
    /// `sectors` end up protected. `None` keeps the current mode and only
    /// drops `sectors` from the protected set, so other sectors keep their
    /// level.
    pub fn with_level(self, level: ProtectionLevel, sectors: SectorMask) -> Self {
        match (level, self) {
            (ProtectionLevel::ReadWrite, _) => ProtectionState::ReadWriteProtect(sectors),
            (ProtectionLevel::Write, _) => ProtectionState::WriteProtect(sectors),
            (ProtectionLevel::None, ProtectionState::WriteProtect(mask)) => {
                ProtectionState::WriteProtect(mask.difference(sectors))
            }
            (ProtectionLevel::None, ProtectionState::ReadWriteProtect(mask)) => {
                ProtectionState::ReadWriteProtect(mask.difference(sectors))
            }
        }
    }
}
