use crate::registers::{Control, OptionControl, Register};

const FLASH_KEY1: u32 = 0x4567_0123;
const FLASH_KEY2: u32 = 0xCDEF_89AB;

const FLASH_OPT_KEY1: u32 = 0x0819_2A3B;
const FLASH_OPT_KEY2: u32 = 0x4C5D_6E7F;

/// One of the two independently locked registers.
///
/// Each is unlocked by writing its key pair, in order, to its key register
/// and locked again by setting its lock bit. A wrong or repeated key
/// sequence faults the bus and keeps the register locked until reset, so
/// keys must only be written while the lock bit is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum KeyLock {
    /// `CR`: program and erase.
    Control,
    /// `OPTCR`: option bytes, including sector protection.
    Options,
}

impl KeyLock {
    pub const fn keys(self) -> [u32; 2] {
        match self {
            KeyLock::Control => [FLASH_KEY1, FLASH_KEY2],
            KeyLock::Options => [FLASH_OPT_KEY1, FLASH_OPT_KEY2],
        }
    }

    pub const fn key_register(self) -> Register {
        match self {
            KeyLock::Control => Register::Keyr,
            KeyLock::Options => Register::Optkeyr,
        }
    }

    /// Register holding the lock bit.
    pub const fn locked_register(self) -> Register {
        match self {
            KeyLock::Control => Register::Cr,
            KeyLock::Options => Register::Optcr,
        }
    }

    pub const fn lock_bit(self) -> u32 {
        match self {
            KeyLock::Control => Control::LOCK.bits(),
            KeyLock::Options => OptionControl::OPTLOCK.bits(),
        }
    }
}
