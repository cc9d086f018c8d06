use core::fmt::{self, Debug};

use embedded_storage::nor_flash::{NorFlashError, NorFlashErrorKind};

use crate::registers::Status;

/// The error type used by this library.
///
/// Every mutating operation reports one of these instead of failing
/// silently; the flash is locked again before any of them is returned.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The byte range is not fully inside the main flash array.
    OutOfRange { address: u32, length: usize },
    /// The address is not aligned to the program parallelism.
    NotAligned { address: u32 },
    /// There is no sector with this index.
    InvalidSector(u8),
    /// The key sequence did not clear the lock bit.
    Locked,
    /// The busy flag did not clear within the configured timeout.
    Timeout,
    /// The controller raised error flags in the status register.
    Hardware(Status),
}

#[cfg(feature = "defmt")]
impl defmt::Format for Error {
    fn format(&self, fmt: defmt::Formatter) {
        match self {
            Error::OutOfRange { address, length } => defmt::write!(
                fmt,
                "Error::OutOfRange {{ address: {=u32:#010x}, length: {=usize} }}",
                address,
                length
            ),
            Error::NotAligned { address } => {
                defmt::write!(fmt, "Error::NotAligned {{ address: {=u32:#010x} }}", address)
            }
            Error::InvalidSector(index) => defmt::write!(fmt, "Error::InvalidSector({=u8})", index),
            Error::Locked => defmt::write!(fmt, "Error::Locked"),
            Error::Timeout => defmt::write!(fmt, "Error::Timeout"),
            Error::Hardware(status) => defmt::write!(fmt, "Error::Hardware({})", status),
        }
    }
}

impl Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::OutOfRange { address, length } => write!(
                f,
                "Error::OutOfRange {{ address: {:#010x}, length: {} }}",
                address, length
            ),
            Error::NotAligned { address } => {
                write!(f, "Error::NotAligned {{ address: {:#010x} }}", address)
            }
            Error::InvalidSector(index) => write!(f, "Error::InvalidSector({})", index),
            Error::Locked => write!(f, "Error::Locked"),
            Error::Timeout => write!(f, "Error::Timeout"),
            Error::Hardware(status) => write!(f, "Error::Hardware({:#x})", status.bits()),
        }
    }
}

impl NorFlashError for Error {
    fn kind(&self) -> NorFlashErrorKind {
        match self {
            Error::OutOfRange { .. } => NorFlashErrorKind::OutOfBounds,
            Error::NotAligned { .. } => NorFlashErrorKind::NotAligned,
            Error::InvalidSector(_) | Error::Locked | Error::Timeout | Error::Hardware(_) => {
                NorFlashErrorKind::Other
            }
        }
    }
}
