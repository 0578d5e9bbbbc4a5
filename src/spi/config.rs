//! Bus and device configuration

use core::future::Future;

use bitflags::bitflags;
use embassy_time::{with_timeout, Duration, Instant};
pub use embedded_hal_1::spi::{Mode, Phase, Polarity, MODE_0, MODE_1, MODE_2, MODE_3};

use super::engine::{Capabilities, ClockTiming, DeviceSettings, DmaWorkaround, TransferHooks};
use super::{Error, Result};

/// Chip-select slots tracked by the bus lock.
pub const MAX_DEVICES: usize = 6;

/// Largest per-device submission/result queue.
pub const MAX_QUEUE_DEPTH: usize = 8;

/// How long a bus operation may wait.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Wait {
    /// Wait as long as it takes.
    Forever,
    /// Give up with [`Error::Timeout`] after this long.
    For(Duration),
}

impl Wait {
    /// Try once, don't wait.
    pub const NONE: Self = Self::For(Duration::from_ticks(0));

    /// Run `fut` within this bound.
    pub(crate) async fn run<T>(self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match self {
            Self::Forever => fut.await,
            Self::For(d) => with_timeout(d, fut).await.map_err(|_| Error::Timeout)?,
        }
    }

    /// Point in time a spin loop gives up, `None` for never.
    pub(crate) fn deadline(self) -> Option<Instant> {
        match self {
            Self::Forever => None,
            Self::For(d) => Some(Instant::now() + d),
        }
    }
}

impl From<Duration> for Wait {
    fn from(d: Duration) -> Self {
        Self::For(d)
    }
}

bitflags! {
    /// Device options.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DeviceFlags: u32 {
        /// Transmit command/address/data LSB first
        const TXBIT_LSBFIRST = 1 << 0;
        /// Receive data LSB first
        const RXBIT_LSBFIRST = 1 << 1;
        /// Transmit and receive LSB first
        const BIT_LSBFIRST = Self::TXBIT_LSBFIRST.bits() | Self::RXBIT_LSBFIRST.bits();
        /// Use MOSI for both sending and receiving
        const THREEWIRE = 1 << 2;
        /// CS is active high
        const POSITIVE_CS = 1 << 3;
        /// Transmit then receive instead of both at once
        const HALFDUPLEX = 1 << 4;
        /// Output the clock on the CS line while CS is active
        const CLK_AS_CS = 1 << 5;
        /// Don't insert dummy cycles to compensate input delay; reads above the safe frequency are unreliable
        const NO_DUMMY = 1 << 6;
        /// Double data rate clocking
        const DDRCLK = 1 << 7;
        /// Don't keep results, `get_result` is unavailable
        const NO_RETURN_RESULT = 1 << 8;
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for DeviceFlags {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "DeviceFlags({=u32:#x})", self.bits())
    }
}

/// Bus configuration.
#[non_exhaustive]
#[derive(Clone, Copy)]
pub struct BusConfig<'d> {
    /// Largest transfer in bytes.
    pub max_transfer_sz: usize,
    /// Move data through DMA.
    pub dma: bool,
    /// Chip-specific DMA coordination.
    pub workaround: Option<&'d dyn DmaWorkaround>,
}

impl<'d> Default for BusConfig<'d> {
    fn default() -> Self {
        Self {
            max_transfer_sz: 4092,
            dma: true,
            workaround: None,
        }
    }
}

impl<'d> BusConfig<'d> {
    /// Bus without DMA, transfers limited to the controller FIFO.
    pub fn without_dma() -> Self {
        Self {
            dma: false,
            ..Self::default()
        }
    }

    /// Set the largest transfer in bytes.
    pub fn with_max_transfer_sz(mut self, max_transfer_sz: usize) -> Self {
        self.max_transfer_sz = max_transfer_sz;
        self
    }

    /// Install a DMA workaround strategy.
    pub fn with_workaround(mut self, workaround: &'d dyn DmaWorkaround) -> Self {
        self.workaround = Some(workaround);
        self
    }
}

/// Device configuration.
#[non_exhaustive]
#[derive(Clone, Copy)]
pub struct DeviceConfig<'d> {
    /// Clock polarity and phase.
    pub mode: Mode,
    /// Clock frequency in Hz.
    pub clock_speed_hz: u32,
    /// Duty cycle of the positive clock, in 1/256th. 0 means 128 (50%).
    pub duty_cycle_pos: u16,
    /// Default command length, 0..=16.
    pub command_bits: u8,
    /// Default address length, 0..=64.
    pub address_bits: u8,
    /// Dummy bits between address and data phase.
    pub dummy_bits: u8,
    /// Clock cycles CS is asserted before the transfer (half duplex only).
    pub cs_ena_pretrans: u8,
    /// Clock cycles CS stays asserted after the transfer.
    pub cs_ena_posttrans: u8,
    /// Slave output delay in ns, used to compensate the sampling point.
    pub input_delay_ns: i32,
    /// CS pin, `None` when CS is driven by someone else.
    pub cs: Option<u8>,
    /// Depth of the submission and result queues.
    pub queue_size: usize,
    /// Device options.
    pub flags: DeviceFlags,
    /// Callbacks around each transfer.
    pub hooks: Option<&'d dyn TransferHooks>,
}

impl<'d> Default for DeviceConfig<'d> {
    fn default() -> Self {
        Self {
            mode: MODE_0,
            clock_speed_hz: 1_000_000,
            duty_cycle_pos: 0,
            command_bits: 0,
            address_bits: 0,
            dummy_bits: 0,
            cs_ena_pretrans: 0,
            cs_ena_posttrans: 0,
            input_delay_ns: 0,
            cs: None,
            queue_size: 1,
            flags: DeviceFlags::empty(),
            hooks: None,
        }
    }
}

impl<'d> DeviceConfig<'d> {
    /// Set the SPI mode.
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the clock frequency in Hz.
    pub fn with_clock_speed_hz(mut self, hz: u32) -> Self {
        self.clock_speed_hz = hz;
        self
    }

    /// Set the default command and address lengths.
    pub fn with_cmd_addr_bits(mut self, command_bits: u8, address_bits: u8) -> Self {
        self.command_bits = command_bits;
        self.address_bits = address_bits;
        self
    }

    /// Set the dummy length.
    pub fn with_dummy_bits(mut self, dummy_bits: u8) -> Self {
        self.dummy_bits = dummy_bits;
        self
    }

    /// Set the CS pin.
    pub fn with_cs(mut self, pin: u8) -> Self {
        self.cs = Some(pin);
        self
    }

    /// Set the queue depth.
    pub fn with_queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size;
        self
    }

    /// Set the device flags.
    pub fn with_flags(mut self, flags: DeviceFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Set the transfer callbacks.
    pub fn with_hooks(mut self, hooks: &'d dyn TransferHooks) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub(crate) fn is_half_duplex(&self) -> bool {
        self.flags.contains(DeviceFlags::HALFDUPLEX)
    }

    pub(crate) fn returns_results(&self) -> bool {
        !self.flags.contains(DeviceFlags::NO_RETURN_RESULT)
    }

    /// Check the configuration against the controller and compute the register snapshot.
    pub(crate) fn resolve(
        &self,
        cs: usize,
        caps: &Capabilities,
        timing: impl FnOnce(u32, u16, i32) -> Option<ClockTiming>,
    ) -> Result<DeviceSettings> {
        if self.clock_speed_hz == 0 || self.duty_cycle_pos > 256 {
            return Err(Error::InvalidArg);
        }
        if self.queue_size == 0 || self.queue_size > MAX_QUEUE_DEPTH {
            return Err(Error::InvalidArg);
        }
        if self.command_bits > 16 || self.address_bits > 64 {
            return Err(Error::InvalidArg);
        }
        if cs >= caps.cs_count.min(MAX_DEVICES) {
            return Err(Error::NotFound);
        }
        // Full duplex can only hold CS early when there is no command/address phase.
        if !self.is_half_duplex() && self.cs_ena_pretrans > 1 && (self.command_bits != 0 || self.address_bits != 0) {
            return Err(Error::InvalidArg);
        }
        if self.cs_ena_pretrans > 16 || self.cs_ena_posttrans > 16 {
            return Err(Error::InvalidArg);
        }

        let duty = if self.duty_cycle_pos == 0 { 128 } else { self.duty_cycle_pos };
        let timing = timing(self.clock_speed_hz, duty, self.input_delay_ns).ok_or(Error::InvalidArg)?;

        // In full duplex the MISO sampling can't be pushed back with dummy cycles.
        if timing.timing_dummy != 0 && !self.is_half_duplex() && !self.flags.contains(DeviceFlags::NO_DUMMY) {
            warn!(
                "{} Hz needs {} dummy cycles, not possible in full duplex",
                self.clock_speed_hz,
                timing.timing_dummy
            );
            return Err(Error::InvalidArg);
        }

        Ok(DeviceSettings {
            cs,
            mode: self.mode,
            timing,
            command_bits: self.command_bits,
            address_bits: self.address_bits,
            dummy_bits: self.dummy_bits,
            cs_setup: self.cs_ena_pretrans,
            cs_hold: self.cs_ena_posttrans,
            flags: self.flags,
        })
    }
}
