//! GPIO ports of the STM32F446, with EXTI line routing for edge interrupts.
//!
//! Refer to reference manual:
//! RM0390, section 7 (GPIO), section 10 (EXTI) and section 8 (SYSCFG)
//!
//! Independent of the flash driver. Pin interrupts are configured up to the
//! EXTI line; enabling the matching NVIC vector is left to the application.

use core::fmt::Debug;

use embedded_hal::digital::{self, ErrorKind, InputPin, OutputPin, PinState, StatefulOutputPin};

const GPIO_BASE: u32 = 0x4002_0000;
const GPIO_PORT_STRIDE: u32 = 0x400;

const MODER: u32 = 0x00;
const OTYPER: u32 = 0x04;
const OSPEEDR: u32 = 0x08;
const PUPDR: u32 = 0x0C;
const IDR: u32 = 0x10;
const ODR: u32 = 0x14;
const BSRR: u32 = 0x18;
const AFRL: u32 = 0x20;

const RCC_AHB1ENR: u32 = 0x4002_3800 + 0x30;
const RCC_APB2ENR: u32 = 0x4002_3800 + 0x44;
const RCC_APB2ENR_SYSCFGEN: u32 = 1 << 14;

const SYSCFG_EXTICR1: u32 = 0x4001_3800 + 0x08;

const EXTI_BASE: u32 = 0x4001_3C00;
const EXTI_IMR: u32 = EXTI_BASE;
const EXTI_RTSR: u32 = EXTI_BASE + 0x08;
const EXTI_FTSR: u32 = EXTI_BASE + 0x0C;
const EXTI_PR: u32 = EXTI_BASE + 0x14;

pub const PINS_PER_PORT: u8 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Port {
    A = 0,
    B,
    C,
    D,
    E,
    F,
    G,
    H,
}

impl Port {
    pub const fn base(self) -> u32 {
        GPIO_BASE + self as u32 * GPIO_PORT_STRIDE
    }

    const fn register(self, offset: u32) -> u32 {
        self.base() + offset
    }

    const fn clock_enable_bit(self) -> u32 {
        1 << self as u32
    }
}

/// Signal edge that triggers an EXTI line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Edge {
    Rising,
    Falling,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Mode {
    #[default]
    Input,
    Output,
    /// Alternate function number 0..=15.
    AlternateFunction(u8),
    Analog,
    /// Input routed to the EXTI line of the same number.
    Interrupt(Edge),
}

impl Mode {
    const fn moder_bits(self) -> u32 {
        match self {
            Mode::Input | Mode::Interrupt(_) => 0b00,
            Mode::Output => 0b01,
            Mode::AlternateFunction(_) => 0b10,
            Mode::Analog => 0b11,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum OutputType {
    #[default]
    PushPull = 0,
    OpenDrain = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Speed {
    #[default]
    Low = 0b00,
    Medium = 0b01,
    Fast = 0b10,
    High = 0b11,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Pull {
    #[default]
    None = 0b00,
    Up = 0b01,
    Down = 0b10,
}

/// Full configuration of one pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PinConfig {
    pub mode: Mode,
    pub output_type: OutputType,
    pub speed: Speed,
    pub pull: Pull,
}

impl PinConfig {
    pub const fn new(mode: Mode) -> Self {
        Self {
            mode,
            output_type: OutputType::PushPull,
            speed: Speed::Low,
            pull: Pull::None,
        }
    }

    pub const fn output_type(mut self, output_type: OutputType) -> Self {
        self.output_type = output_type;
        self
    }

    pub const fn speed(mut self, speed: Speed) -> Self {
        self.speed = speed;
        self
    }

    pub const fn pull(mut self, pull: Pull) -> Self {
        self.pull = pull;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum GpioError {
    /// Pin or EXTI line number above 15.
    InvalidPin(u8),
    /// Alternate function number above 15.
    InvalidAlternateFunction(u8),
}

impl digital::Error for GpioError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Other
    }
}

/// 32-bit register access at absolute addresses.
pub trait GpioBus {
    fn read(&mut self, address: u32) -> u32;
    fn write(&mut self, address: u32, value: u32);

    fn modify<F>(&mut self, address: u32, f: F)
    where
        F: FnOnce(u32) -> u32,
    {
        let value = self.read(address);
        self.write(address, f(value));
    }
}

/// Memory-mapped GPIO, EXTI, SYSCFG and RCC registers.
#[derive(Debug)]
pub struct GpioPeripherals {
    _private: (),
}

impl GpioPeripherals {
    /// # Safety
    ///
    /// Only one instance may exist, and nothing else may touch the GPIO
    /// mode/output registers, EXTI or SYSCFG_EXTICR through another path.
    pub unsafe fn steal() -> Self {
        Self { _private: () }
    }
}

impl GpioBus for GpioPeripherals {
    fn read(&mut self, address: u32) -> u32 {
        // SAFETY: only addresses of the register blocks above are produced.
        unsafe { core::ptr::read_volatile(address as *const u32) }
    }

    fn write(&mut self, address: u32, value: u32) {
        // SAFETY: only addresses of the register blocks above are produced.
        unsafe { core::ptr::write_volatile(address as *mut u32, value) }
    }
}

const fn check_pin(pin: u8) -> Result<u32, GpioError> {
    if pin < PINS_PER_PORT {
        Ok(pin as u32)
    } else {
        Err(GpioError::InvalidPin(pin))
    }
}

/// SYSCFG_EXTICRx register holding the port selection of EXTI `line`.
const fn exticr_address(line: u32) -> u32 {
    SYSCFG_EXTICR1 + (line / 4) * 4
}

/// Replaces the `width`-bit field of pin `pin` in a register value.
const fn set_field(value: u32, pin: u32, width: u32, field: u32) -> u32 {
    let shift = pin * width;
    let mask = ((1 << width) - 1) << shift;
    (value & !mask) | ((field << shift) & mask)
}

pub struct Gpio<B> {
    bus: B,
}

impl<B> Debug for Gpio<B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Gpio").finish()
    }
}

impl<B> Gpio<B>
where
    B: GpioBus,
{
    pub fn new(bus: B) -> Self {
        Self { bus }
    }

    pub fn release(self) -> B {
        self.bus
    }

    /// Enables the port clock and applies `config` to the pin.
    ///
    /// The mode is written last, so an output never drives with a stale
    /// output type or speed.
    pub fn configure(&mut self, port: Port, pin: u8, config: PinConfig) -> Result<(), GpioError> {
        let n = check_pin(pin)?;
        if let Mode::AlternateFunction(af) = config.mode {
            if af > 15 {
                return Err(GpioError::InvalidAlternateFunction(af));
            }
        }
        trace!("Configuring P{}{=u8}: {}", port, pin, config);

        self.bus.modify(RCC_AHB1ENR, |v| v | port.clock_enable_bit());

        self.bus.modify(port.register(OTYPER), |v| {
            set_field(v, n, 1, config.output_type as u32)
        });
        self.bus.modify(port.register(OSPEEDR), |v| {
            set_field(v, n, 2, config.speed as u32)
        });
        self.bus.modify(port.register(PUPDR), |v| {
            set_field(v, n, 2, config.pull as u32)
        });

        if let Mode::AlternateFunction(af) = config.mode {
            let afr = port.register(AFRL + (n / 8) * 4);
            self.bus.modify(afr, |v| set_field(v, n % 8, 4, u32::from(af)));
        }
        match config.mode {
            Mode::Interrupt(edge) => self.route_interrupt(port, n, edge),
            _ => self.release_interrupt(port, n),
        }

        self.bus.modify(port.register(MODER), |v| {
            set_field(v, n, 2, config.mode.moder_bits())
        });
        Ok(())
    }

    fn route_interrupt(&mut self, port: Port, line: u32, edge: Edge) {
        let bit = 1 << line;
        let (rising, falling) = match edge {
            Edge::Rising => (true, false),
            Edge::Falling => (false, true),
            Edge::Both => (true, true),
        };
        self.bus.modify(EXTI_RTSR, |v| if rising { v | bit } else { v & !bit });
        self.bus.modify(EXTI_FTSR, |v| if falling { v | bit } else { v & !bit });

        self.bus.modify(RCC_APB2ENR, |v| v | RCC_APB2ENR_SYSCFGEN);
        self.bus.modify(exticr_address(line), |v| {
            set_field(v, line % 4, 4, port as u32)
        });

        self.bus.modify(EXTI_IMR, |v| v | bit);
    }

    /// Masks EXTI `line` and clears its edge triggers if the line is routed
    /// to `port`. A line routed to another port is left alone.
    fn release_interrupt(&mut self, port: Port, line: u32) {
        let bit = 1 << line;
        if self.bus.read(EXTI_IMR) & bit == 0 {
            return;
        }
        let routed = (self.bus.read(exticr_address(line)) >> ((line % 4) * 4)) & 0xF;
        if routed != port as u32 {
            return;
        }
        self.bus.modify(EXTI_IMR, |v| v & !bit);
        self.bus.modify(EXTI_RTSR, |v| v & !bit);
        self.bus.modify(EXTI_FTSR, |v| v & !bit);
    }

    pub fn read_pin(&mut self, port: Port, pin: u8) -> Result<PinState, GpioError> {
        let n = check_pin(pin)?;
        let idr = self.bus.read(port.register(IDR));
        Ok(PinState::from(idr & (1 << n) != 0))
    }

    pub fn read_port(&mut self, port: Port) -> u16 {
        self.bus.read(port.register(IDR)) as u16
    }

    /// Drives one pin through BSRR, leaving the other pins of the port alone.
    pub fn write_pin(&mut self, port: Port, pin: u8, state: PinState) -> Result<(), GpioError> {
        let n = check_pin(pin)?;
        let bit = match state {
            PinState::High => 1 << n,
            PinState::Low => 1 << (n + 16),
        };
        self.bus.write(port.register(BSRR), bit);
        Ok(())
    }

    pub fn write_port(&mut self, port: Port, value: u16) {
        self.bus.write(port.register(ODR), u32::from(value));
    }

    pub fn toggle_pin(&mut self, port: Port, pin: u8) -> Result<(), GpioError> {
        let state = self.output_state(port, pin)?;
        self.write_pin(port, pin, !state)
    }

    /// Level currently driven by the output data register.
    pub fn output_state(&mut self, port: Port, pin: u8) -> Result<PinState, GpioError> {
        let n = check_pin(pin)?;
        let odr = self.bus.read(port.register(ODR));
        Ok(PinState::from(odr & (1 << n) != 0))
    }

    /// Clears the pending flag of EXTI `line`; returns whether it was set.
    pub fn acknowledge_interrupt(&mut self, line: u8) -> Result<bool, GpioError> {
        let bit = 1 << check_pin(line)?;
        let pending = self.bus.read(EXTI_PR) & bit != 0;
        if pending {
            // Write 1 to clear.
            self.bus.write(EXTI_PR, bit);
        }
        Ok(pending)
    }

    /// Borrows a single pin as an `embedded-hal` digital pin.
    pub fn pin(&mut self, port: Port, pin: u8) -> Result<Pin<'_, B>, GpioError> {
        check_pin(pin)?;
        Ok(Pin {
            gpio: self,
            port,
            pin,
        })
    }
}

/// One pin of a [`Gpio`], valid for as long as the borrow.
pub struct Pin<'a, B> {
    gpio: &'a mut Gpio<B>,
    port: Port,
    pin: u8,
}

impl<B> Debug for Pin<'_, B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Pin")
            .field("port", &self.port)
            .field("pin", &self.pin)
            .finish()
    }
}

impl<B> digital::ErrorType for Pin<'_, B> {
    type Error = GpioError;
}

impl<B: GpioBus> InputPin for Pin<'_, B> {
    fn is_high(&mut self) -> Result<bool, GpioError> {
        Ok(self.gpio.read_pin(self.port, self.pin)? == PinState::High)
    }

    fn is_low(&mut self) -> Result<bool, GpioError> {
        Ok(self.gpio.read_pin(self.port, self.pin)? == PinState::Low)
    }
}

impl<B: GpioBus> OutputPin for Pin<'_, B> {
    fn set_low(&mut self) -> Result<(), GpioError> {
        self.gpio.write_pin(self.port, self.pin, PinState::Low)
    }

    fn set_high(&mut self) -> Result<(), GpioError> {
        self.gpio.write_pin(self.port, self.pin, PinState::High)
    }
}

impl<B: GpioBus> StatefulOutputPin for Pin<'_, B> {
    fn is_set_high(&mut self) -> Result<bool, GpioError> {
        Ok(self.gpio.output_state(self.port, self.pin)? == PinState::High)
    }

    fn is_set_low(&mut self) -> Result<bool, GpioError> {
        Ok(self.gpio.output_state(self.port, self.pin)? == PinState::Low)
    }
}
