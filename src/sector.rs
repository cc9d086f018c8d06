//! Main flash array layout.

use crate::error::Error;

/// First byte of the main flash array.
pub const FLASH_BASE: u32 = 0x0800_0000;

/// One past the last byte of the main flash array.
pub const FLASH_END: u32 = 0x0808_0000;

/// Size of the main flash array in bytes.
pub const FLASH_SIZE: usize = (FLASH_END - FLASH_BASE) as usize;

/// Number of sectors addressable for erase and protection.
pub const SECTOR_COUNT: usize = 8;

/// Value every byte reads back as after an erase.
pub const ERASED_BYTE: u8 = 0xFF;

const KIB: u32 = 1024;

// (base, size) per sector index.
const LAYOUT: [(u32, u32); SECTOR_COUNT] = [
    (0x0800_0000, 16 * KIB),
    (0x0800_4000, 16 * KIB),
    (0x0800_8000, 16 * KIB),
    (0x0800_C000, 16 * KIB),
    (0x0801_0000, 64 * KIB),
    (0x0802_0000, 128 * KIB),
    (0x0804_0000, 128 * KIB),
    (0x0806_0000, 128 * KIB),
];

/// A hardware sector of the main flash array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Sector(u8);

impl Sector {
    /// Returns the sector with the given index, if the device has one.
    pub const fn new(index: u8) -> Option<Self> {
        if (index as usize) < SECTOR_COUNT {
            Some(Sector(index))
        } else {
            None
        }
    }

    /// Returns the sector holding `address`.
    pub fn containing(address: u32) -> Option<Self> {
        Self::all().find(|sector| sector.contains(address))
    }

    /// All sectors in index order.
    pub fn all() -> impl Iterator<Item = Sector> {
        (0..SECTOR_COUNT as u8).map(Sector)
    }

    pub const fn index(self) -> u8 {
        self.0
    }

    /// First address of the sector.
    pub const fn base(self) -> u32 {
        LAYOUT[self.0 as usize].0
    }

    /// Size in bytes.
    pub const fn size(self) -> u32 {
        LAYOUT[self.0 as usize].1
    }

    /// One past the last address of the sector.
    pub const fn end(self) -> u32 {
        self.base() + self.size()
    }

    pub const fn contains(self, address: u32) -> bool {
        address >= self.base() && address < self.end()
    }
}

/// Checks that `[address, address + length)` lies inside the flash array.
///
/// An empty range is accepted anywhere inside the array, including at its
/// end bound.
pub const fn in_flash(address: u32, length: usize) -> bool {
    if address < FLASH_BASE || address > FLASH_END {
        return false;
    }
    length <= (FLASH_END - address) as usize
}

/// Sectors exactly covering the range `[from, to)` of offsets into the
/// array.
///
/// Both ends must fall on a sector boundary, the end of the array counting
/// as one.
pub fn sectors_spanning(from: u32, to: u32) -> Result<impl Iterator<Item = Sector>, Error> {
    if from > to || to as usize > FLASH_SIZE {
        return Err(Error::OutOfRange {
            address: from,
            length: to.saturating_sub(from) as usize,
        });
    }
    let start = FLASH_BASE + from;
    let end = FLASH_BASE + to;
    let on_boundary = |address: u32| {
        address == FLASH_END
            || Sector::containing(address).is_some_and(|sector| sector.base() == address)
    };
    if !on_boundary(start) || !on_boundary(end) {
        return Err(Error::NotAligned { address: from });
    }
    Ok(Sector::all().filter(move |sector| sector.base() >= start && sector.end() <= end))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sectors_tile_the_array() {
        let mut expected_base = FLASH_BASE;
        for sector in Sector::all() {
            assert_eq!(sector.base(), expected_base);
            expected_base = sector.end();
        }
        assert_eq!(expected_base, FLASH_END);
        assert_eq!(FLASH_SIZE, 512 * 1024);
    }

    #[test]
    fn sector_lookup() {
        assert_eq!(Sector::containing(0x0800_0000), Sector::new(0));
        assert_eq!(Sector::containing(0x0800_7FFF), Sector::new(1));
        assert_eq!(Sector::containing(0x0801_FFFF), Sector::new(4));
        assert_eq!(Sector::containing(0x0807_FFFF), Sector::new(7));
        assert_eq!(Sector::containing(0x0808_0000), None);
        assert_eq!(Sector::containing(0x0000_0000), None);
    }

    #[test]
    fn invalid_sector_index() {
        assert!(Sector::new(7).is_some());
        assert!(Sector::new(8).is_none());
        assert!(Sector::new(0xFF).is_none());
    }

    #[test]
    fn flash_bounds() {
        assert!(in_flash(FLASH_BASE, FLASH_SIZE));
        assert!(in_flash(FLASH_END - 4, 4));
        assert!(in_flash(FLASH_END, 0));
        assert!(!in_flash(FLASH_END - 4, 5));
        assert!(!in_flash(FLASH_BASE - 1, 1));
        assert!(!in_flash(FLASH_END + 1, 0));
        assert!(!in_flash(FLASH_BASE, usize::MAX));
    }

    #[test]
    fn spanning_sector_boundaries() {
        assert_eq!(
            sectors_spanning(0, FLASH_SIZE as u32).unwrap().count(),
            SECTOR_COUNT
        );
        let spanned: Vec<_> = sectors_spanning(0x4000, 0x2_0000)
            .unwrap()
            .map(Sector::index)
            .collect();
        assert_eq!(spanned, [1, 2, 3, 4]);
        assert_eq!(sectors_spanning(0x4000, 0x4000).unwrap().count(), 0);
        assert!(matches!(
            sectors_spanning(0, 0x1000),
            Err(Error::NotAligned { address: 0 })
        ));
        assert!(matches!(
            sectors_spanning(0x4000, 0),
            Err(Error::OutOfRange { .. })
        ));
    }
}
