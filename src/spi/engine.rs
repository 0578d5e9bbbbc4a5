//! Hardware collaborators of the bus engine
//!
//! The engine itself never touches registers. A chip support crate implements
//! [`TransferEngine`] for its SPI controller (register programming, DMA
//! descriptor chains, clock dividers, pin routing) and [`InterruptControl`]
//! for the controller's interrupt line.

use embedded_hal_1::spi::Mode;

use super::config::DeviceFlags;
use super::transaction::{TransFlags, Transaction};
use crate::dma::DmaHeap;

/// How the controller's DMA copes with half-duplex transfers that have both a MOSI and a MISO phase.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HalfDuplexDma {
    /// Both phases may use DMA in one transfer.
    Unrestricted,
    /// Only one phase of a half-duplex transfer may be present when DMA is on.
    SinglePhase,
}

/// Static properties of one SPI controller.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Capabilities {
    /// Number of hardware chip-select lines.
    pub cs_count: usize,
    /// 8-line data mode available.
    pub octal: bool,
    /// Half-duplex DMA restriction.
    pub half_duplex_dma: HalfDuplexDma,
    /// Bytes one transfer can carry when DMA is off (the data FIFO size).
    pub fifo_len: usize,
}

/// Clock settings computed by the controller's timing service.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ClockTiming {
    /// Frequency actually produced, in Hz.
    pub actual_freq: u32,
    /// Raw clock register value.
    pub clock_reg: u32,
    /// Extra dummy cycles needed to sample MISO at this frequency.
    pub timing_dummy: u8,
    /// MISO sampling delay in half clocks.
    pub timing_miso_delay: i8,
}

/// Configuration snapshot of one device, written to the controller before the device's
/// first transfer after another device used the bus.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceSettings {
    /// Chip-select slot.
    pub cs: usize,
    /// Clock polarity and phase.
    pub mode: Mode,
    /// Clock settings.
    pub timing: ClockTiming,
    /// Default command length.
    pub command_bits: u8,
    /// Default address length.
    pub address_bits: u8,
    /// Default dummy length.
    pub dummy_bits: u8,
    /// CS setup time in clock cycles.
    pub cs_setup: u8,
    /// CS hold time in clock cycles.
    pub cs_hold: u8,
    /// Device flags.
    pub flags: DeviceFlags,
}

/// Number of lines used in each phase.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LineMode {
    /// Lines for the command phase.
    pub cmd_lines: u8,
    /// Lines for the address phase.
    pub addr_lines: u8,
    /// Lines for the data phases.
    pub data_lines: u8,
}

impl LineMode {
    pub(crate) fn from_flags(flags: TransFlags) -> Self {
        let data_lines = flags.data_lines();
        Self {
            cmd_lines: if flags.contains(TransFlags::MULTILINE_CMD) {
                data_lines
            } else {
                1
            },
            addr_lines: if flags.contains(TransFlags::MULTILINE_ADDR) {
                data_lines
            } else {
                1
            },
            data_lines,
        }
    }
}

/// One transfer, resolved for the hardware.
///
/// `tx` and `rx` are DMA-usable when `dma` is set and stay valid until
/// [`TransferEngine::fetch_result`] returns. Either may be null when the phase is absent.
#[derive(Debug)]
pub struct Transfer {
    /// Chip-select slot to assert.
    pub cs: usize,
    /// Transaction flags.
    pub flags: TransFlags,
    /// Command value.
    pub cmd: u32,
    /// Command length.
    pub cmd_bits: u8,
    /// Address value.
    pub addr: u64,
    /// Address length.
    pub addr_bits: u8,
    /// Dummy length, including timing compensation.
    pub dummy_bits: u8,
    /// MOSI data.
    pub tx: *const u8,
    /// Bits to send.
    pub tx_bits: usize,
    /// MISO data.
    pub rx: *mut u8,
    /// Bits to receive.
    pub rx_bits: usize,
    /// Lines per phase.
    pub lines: LineMode,
    /// Leave CS asserted after the transfer.
    pub cs_keep_active: bool,
    /// Data moves through DMA.
    pub dma: bool,
}

/// Low-level transfer kickoff for one SPI controller.
///
/// All methods are called with the bus state locked, from task or interrupt context.
/// They must not block.
pub trait TransferEngine: Send {
    /// Memory the controller's DMA can reach.
    type Dma: DmaHeap;

    /// Controller properties.
    fn capabilities(&self) -> Capabilities;

    /// Bring the controller up, called when the first device is registered.
    fn init(&mut self) {}

    /// Shut the controller down, called when the last device is removed.
    fn deinit(&mut self) {}

    /// Compute clock settings for `freq_hz` at `duty_cycle`/256, or `None` if not reachable.
    fn clock_timing(&self, freq_hz: u32, duty_cycle: u16, input_delay_ns: i32) -> Option<ClockTiming>;

    /// Route chip-select slot `cs` to `pin`, if any.
    fn route_cs(&mut self, cs: usize, pin: Option<u8>, active_high: bool);

    /// Undo [`TransferEngine::route_cs`].
    fn release_cs(&mut self, cs: usize, pin: Option<u8>);

    /// Write a device's configuration snapshot.
    fn configure(&mut self, settings: &DeviceSettings);

    /// Program registers and DMA descriptors for `xfer`.
    fn program(&mut self, xfer: &Transfer);

    /// Start the programmed transfer.
    fn start(&mut self);

    /// Whether the last started transfer has finished.
    fn is_done(&self) -> bool;

    /// Move received data out of the controller (FIFO to rx buffer when DMA is off).
    fn fetch_result(&mut self);
}

/// Enable/disable pair for the controller's interrupt.
///
/// Enabling while the controller is idle must make [`SpiBus::on_interrupt`](super::SpiBus::on_interrupt) run.
pub trait InterruptControl {
    /// Unmask the interrupt.
    fn enable(&self);
    /// Mask the interrupt.
    fn disable(&self);
}

/// Chip-specific coordination around DMA transfers, e.g. channels shared with another controller.
pub trait DmaWorkaround: Sync {
    /// A DMA transfer is about to start.
    fn before_transfer(&self) {}
    /// The DMA transfer finished.
    fn after_transfer(&self) {}
}

/// Callbacks around each transfer of one device.
///
/// They run in interrupt context for queued transactions: no blocking, no allocation.
pub trait TransferHooks: Sync {
    /// Called right before the transfer starts.
    fn pre_transfer(&self, _trans: &Transaction<'_>) {}
    /// Called when the transfer has finished.
    fn post_transfer(&self, _trans: &Transaction<'_>) {}
}
