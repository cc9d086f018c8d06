//! Wait-state and program parallelism selection.
//!
//! Both depend on the supply voltage range the device runs in (RM0390,
//! tables 5 and 7). A board on a 3.3 V rail uses
//! [`SupplyVoltage::Range2V7To3V6`], which is also the default.

/// Device supply voltage range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SupplyVoltage {
    /// 1.8 V to 2.1 V.
    Range1V8To2V1,
    /// 2.1 V to 2.4 V.
    Range2V1To2V4,
    /// 2.4 V to 2.7 V.
    Range2V4To2V7,
    /// 2.7 V to 3.6 V.
    #[default]
    Range2V7To3V6,
    /// 2.7 V to 3.6 V with an external programming voltage on VPP.
    ExternalVpp,
}

impl SupplyVoltage {
    /// Core clock span covered by each additional wait state, in MHz.
    pub const fn wait_state_step_mhz(self) -> u32 {
        match self {
            SupplyVoltage::Range1V8To2V1 => 20,
            SupplyVoltage::Range2V1To2V4 => 22,
            SupplyVoltage::Range2V4To2V7 => 24,
            SupplyVoltage::Range2V7To3V6 | SupplyVoltage::ExternalVpp => 30,
        }
    }

    /// Widest program parallelism allowed in this range.
    pub const fn program_size(self) -> ProgramSize {
        match self {
            SupplyVoltage::Range1V8To2V1 => ProgramSize::X8,
            SupplyVoltage::Range2V1To2V4 | SupplyVoltage::Range2V4To2V7 => ProgramSize::X16,
            SupplyVoltage::Range2V7To3V6 => ProgramSize::X32,
            SupplyVoltage::ExternalVpp => ProgramSize::X64,
        }
    }
}

/// Program parallelism, as encoded in the PSIZE field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ProgramSize {
    X8 = 0b00,
    X16 = 0b01,
    X32 = 0b10,
    X64 = 0b11,
}

impl ProgramSize {
    /// Decodes the two PSIZE bits; higher bits are ignored.
    pub const fn from_bits(bits: u32) -> Self {
        match bits & 0b11 {
            0b00 => ProgramSize::X8,
            0b01 => ProgramSize::X16,
            0b10 => ProgramSize::X32,
            _ => ProgramSize::X64,
        }
    }

    /// Bytes written per program cycle.
    pub const fn bytes(self) -> usize {
        1 << (self as usize)
    }
}

/// Largest value the 4-bit LATENCY field can hold.
pub const MAX_WAIT_STATES: u8 = 0xF;

/// Wait states needed to read flash at `core_clock_hz` in the given range.
///
/// Clocks below 1 MHz give 0. The result is truncated to the 4-bit field,
/// so a clock far above the device maximum wraps rather than saturates.
pub const fn wait_states(core_clock_hz: u32, supply: SupplyVoltage) -> u8 {
    let mhz = core_clock_hz / 1_000_000;
    let ws = mhz.saturating_sub(1) / supply.wait_state_step_mhz();
    (ws as u8) & MAX_WAIT_STATES
}

#[cfg(test)]
mod tests {
    use super::*;

    const HSI_FREQUENCY_HZ: u32 = 16_000_000;

    #[test]
    fn wait_states_at_3v3() {
        let supply = SupplyVoltage::default();
        assert_eq!(wait_states(HSI_FREQUENCY_HZ, supply), 0);
        assert_eq!(wait_states(30_000_000, supply), 0);
        assert_eq!(wait_states(31_000_000, supply), 1);
        assert_eq!(wait_states(90_000_000, supply), 2);
        assert_eq!(wait_states(168_000_000, supply), 5);
        // Maximum CPU frequency with overdrive
        assert_eq!(wait_states(180_000_000, supply), 5);
    }

    #[test]
    fn wait_states_follow_supply_range() {
        assert_eq!(wait_states(84_000_000, SupplyVoltage::Range1V8To2V1), 4);
        assert_eq!(wait_states(84_000_000, SupplyVoltage::Range2V1To2V4), 3);
        assert_eq!(wait_states(84_000_000, SupplyVoltage::Range2V4To2V7), 3);
        assert_eq!(wait_states(84_000_000, SupplyVoltage::Range2V7To3V6), 2);
    }

    #[test]
    fn sub_megahertz_clock_gives_zero_wait_states() {
        assert_eq!(wait_states(0, SupplyVoltage::default()), 0);
        assert_eq!(wait_states(999_999, SupplyVoltage::default()), 0);
    }

    #[test]
    fn wait_states_are_masked_to_field_width() {
        // 999 / 30 = 33 = 0b10_0001
        assert_eq!(wait_states(1_000_000_000, SupplyVoltage::default()), 1);
    }

    #[test]
    fn program_size_widths() {
        assert_eq!(SupplyVoltage::default().program_size(), ProgramSize::X32);
        assert_eq!(ProgramSize::X8.bytes(), 1);
        assert_eq!(ProgramSize::X16.bytes(), 2);
        assert_eq!(ProgramSize::X32.bytes(), 4);
        assert_eq!(ProgramSize::X64.bytes(), 8);
        assert_eq!(ProgramSize::from_bits(0b110), ProgramSize::X32);
    }
}
