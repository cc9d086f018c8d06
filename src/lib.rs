//! Driver for the embedded flash interface of the STM32F446.
//!
//! [`Flash`] and [`AsyncFlash`] program, erase and protect the 512 KiB main
//! flash array through the flash interface registers. Both implement the
//! `hardware-traits` flash device traits; the blocking one also implements
//! `embedded-storage`'s NOR flash traits. [`gpio`] drives the GPIO ports.
#![cfg_attr(not(test), no_std)]

// Must come first so the logging macros are visible in every module.
mod fmt;

mod async_flash;
mod config;
mod controller;
mod error;
mod flash;
pub mod gpio;
mod keys;
pub mod latency;
#[cfg(test)]
mod mock;
pub mod protection;
pub mod registers;
pub mod sector;

pub use async_flash::AsyncFlash;
pub use config::Config;
pub use error::Error;
pub use flash::Flash;
pub use keys::KeyLock;
pub use latency::{ProgramSize, SupplyVoltage};
pub use protection::{ProtectionLevel, ProtectionState, SectorMask};
pub use registers::{FlashPeripheral, FlashRegisters};
pub use sector::Sector;
