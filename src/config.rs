use crate::latency::SupplyVoltage;

/// Driver configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub struct Config {
    /// Supply voltage range; selects wait-state step and program parallelism.
    pub supply: SupplyVoltage,
    /// How long a single busy wait may last before it fails with
    /// [`Error::Timeout`](crate::Error::Timeout).
    pub busy_timeout_us: u32,
    /// Sleep between two reads of the busy flag.
    pub poll_interval_us: u32,
}

impl Config {
    /// Covers the worst-case x8 mass erase time of 32 s.
    pub const DEFAULT_BUSY_TIMEOUT_US: u32 = 32_000_000;
    pub const DEFAULT_POLL_INTERVAL_US: u32 = 10;

    pub const fn new(supply: SupplyVoltage) -> Self {
        Self {
            supply,
            busy_timeout_us: Self::DEFAULT_BUSY_TIMEOUT_US,
            poll_interval_us: Self::DEFAULT_POLL_INTERVAL_US,
        }
    }

    pub const fn with_busy_timeout_us(mut self, busy_timeout_us: u32) -> Self {
        self.busy_timeout_us = busy_timeout_us;
        self
    }

    /// A zero interval is raised to 1 us so the timeout always advances.
    pub const fn with_poll_interval_us(mut self, poll_interval_us: u32) -> Self {
        self.poll_interval_us = if poll_interval_us == 0 { 1 } else { poll_interval_us };
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(SupplyVoltage::default())
    }
}
