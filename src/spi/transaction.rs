//! Transaction descriptors

use bitflags::bitflags;

bitflags! {
    /// Per-transaction flags.
    ///
    /// The bit positions are the ones handed to the transfer engine. `USE_TXDATA` and
    /// `USE_RXDATA` are derived from the buffer variants of the [`Transaction`] and
    /// cannot be set by hand.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TransFlags: u32 {
        /// Transmit/receive data in 2-bit mode
        const MODE_DIO = 1 << 0;
        /// Transmit/receive data in 4-bit mode
        const MODE_QIO = 1 << 1;
        /// Receive into the inline data area
        const USE_RXDATA = 1 << 2;
        /// Transmit from the inline data area
        const USE_TXDATA = 1 << 3;
        /// Also transmit the address in the mode selected by `MODE_DIO`/`MODE_QIO`/`MODE_OCT`
        const MULTILINE_ADDR = 1 << 4;
        /// Use the command length stored in the transaction instead of the device default
        const VARIABLE_CMD = 1 << 5;
        /// Use the address length stored in the transaction instead of the device default
        const VARIABLE_ADDR = 1 << 6;
        /// Use the dummy length stored in the transaction instead of the device default
        const VARIABLE_DUMMY = 1 << 7;
        /// Keep CS asserted after the data phase
        const CS_KEEP_ACTIVE = 1 << 8;
        /// Also transmit the command in the mode selected by `MODE_DIO`/`MODE_QIO`/`MODE_OCT`
        const MULTILINE_CMD = 1 << 9;
        /// Transmit/receive data in 8-bit mode
        const MODE_OCT = 1 << 10;
    }
}

impl TransFlags {
    /// Flags selecting a multi-line data phase.
    pub const LINE_MODES: Self = Self::MODE_DIO.union(Self::MODE_QIO).union(Self::MODE_OCT);
    const BUFFER_FLAGS: Self = Self::USE_RXDATA.union(Self::USE_TXDATA);

    /// Number of data lines selected by these flags.
    pub(crate) fn data_lines(self) -> u8 {
        if self.contains(Self::MODE_OCT) {
            8
        } else if self.contains(Self::MODE_QIO) {
            4
        } else if self.contains(Self::MODE_DIO) {
            2
        } else {
            1
        }
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for TransFlags {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "TransFlags({=u32:#x})", self.bits())
    }
}

/// Inline storage for transfers of up to 32 bits.
#[repr(C, align(4))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InlineData(pub [u8; 4]);

/// Source of the data sent in the MOSI phase.
#[derive(Debug, Default)]
pub enum TxBuffer<'d> {
    /// No MOSI phase (half duplex) or don't-care output (full duplex).
    #[default]
    None,
    /// Up to 32 bits stored inside the transaction.
    Inline(InlineData),
    /// Caller-owned buffer.
    Buffer(&'d [u8]),
}

/// Sink for the data received in the MISO phase.
#[derive(Debug, Default)]
pub enum RxBuffer<'d> {
    /// Received data is discarded.
    #[default]
    None,
    /// Up to 32 bits stored inside the transaction.
    Inline(InlineData),
    /// Caller-owned buffer.
    Buffer(&'d mut [u8]),
}

/// One SPI transfer.
///
/// Lengths are in bits. Ownership of the transaction (and the buffers it borrows) moves
/// into the bus when it is queued and comes back from
/// [`SpiDevice::get_result`](super::SpiDevice::get_result) or
/// [`SpiDevice::polling_end`](super::SpiDevice::polling_end).
#[derive(Debug, Default)]
pub struct Transaction<'d> {
    flags: TransFlags,
    /// Command value, sent in the command phase.
    pub cmd: u32,
    /// Address value, sent in the address phase.
    pub addr: u64,
    /// Total data length in bits. In full duplex this is also the length clocked for receive.
    pub length: usize,
    /// Receive length in bits. In full duplex, zero means "same as `length`".
    pub rx_length: usize,
    /// Opaque caller tag, not touched by the bus.
    pub user: usize,
    /// Command length when [`TransFlags::VARIABLE_CMD`] is set.
    pub command_bits: u8,
    /// Address length when [`TransFlags::VARIABLE_ADDR`] is set.
    pub address_bits: u8,
    /// Dummy length when [`TransFlags::VARIABLE_DUMMY`] is set.
    pub dummy_bits: u8,
    tx: TxBuffer<'d>,
    rx: RxBuffer<'d>,
}

impl<'d> Transaction<'d> {
    /// Empty transaction, no data phase.
    pub const fn new() -> Self {
        Self {
            flags: TransFlags::empty(),
            cmd: 0,
            addr: 0,
            length: 0,
            rx_length: 0,
            user: 0,
            command_bits: 0,
            address_bits: 0,
            dummy_bits: 0,
            tx: TxBuffer::None,
            rx: RxBuffer::None,
        }
    }

    /// Send `data`, ignore anything received.
    pub fn write(data: &'d [u8]) -> Self {
        let mut t = Self::new();
        t.length = data.len() * 8;
        t.tx = TxBuffer::Buffer(data);
        t
    }

    /// Receive into `buf`.
    pub fn read(buf: &'d mut [u8]) -> Self {
        let mut t = Self::new();
        t.length = buf.len() * 8;
        t.rx_length = buf.len() * 8;
        t.rx = RxBuffer::Buffer(buf);
        t
    }

    /// Send `write` while receiving into `read`.
    pub fn transfer(write: &'d [u8], read: &'d mut [u8]) -> Self {
        let mut t = Self::new();
        t.length = write.len() * 8;
        t.rx_length = read.len() * 8;
        t.tx = TxBuffer::Buffer(write);
        t.rx = RxBuffer::Buffer(read);
        t
    }

    /// Send up to 32 bits from the inline data area.
    pub fn with_tx_data(mut self, data: [u8; 4], bits: usize) -> Self {
        self.tx = TxBuffer::Inline(InlineData(data));
        self.length = bits;
        self
    }

    /// Receive up to 32 bits into the inline data area.
    pub fn with_rx_data(mut self, bits: usize) -> Self {
        self.rx = RxBuffer::Inline(InlineData::default());
        self.rx_length = bits;
        self
    }

    /// Set the MOSI source.
    pub fn with_tx(mut self, tx: TxBuffer<'d>) -> Self {
        self.tx = tx;
        self
    }

    /// Set the MISO sink.
    pub fn with_rx(mut self, rx: RxBuffer<'d>) -> Self {
        self.rx = rx;
        self
    }

    /// Set the command value.
    pub fn with_cmd(mut self, cmd: u32) -> Self {
        self.cmd = cmd;
        self
    }

    /// Set the address value.
    pub fn with_addr(mut self, addr: u64) -> Self {
        self.addr = addr;
        self
    }

    /// Set the caller tag.
    pub fn with_user(mut self, user: usize) -> Self {
        self.user = user;
        self
    }

    /// Add flags. The buffer flags are ignored, they follow the buffer variants.
    pub fn with_flags(mut self, flags: TransFlags) -> Self {
        self.flags |= flags.difference(TransFlags::BUFFER_FLAGS);
        self
    }

    /// Override the device command length for this transaction.
    pub fn with_command_bits(mut self, bits: u8) -> Self {
        self.command_bits = bits;
        self.flags |= TransFlags::VARIABLE_CMD;
        self
    }

    /// Override the device address length for this transaction.
    pub fn with_address_bits(mut self, bits: u8) -> Self {
        self.address_bits = bits;
        self.flags |= TransFlags::VARIABLE_ADDR;
        self
    }

    /// Override the device dummy length for this transaction.
    pub fn with_dummy_bits(mut self, bits: u8) -> Self {
        self.dummy_bits = bits;
        self.flags |= TransFlags::VARIABLE_DUMMY;
        self
    }

    /// Flags as seen by the transfer engine.
    pub fn flags(&self) -> TransFlags {
        let mut flags = self.flags;
        flags.set(TransFlags::USE_TXDATA, matches!(self.tx, TxBuffer::Inline(_)));
        flags.set(TransFlags::USE_RXDATA, matches!(self.rx, RxBuffer::Inline(_)));
        flags
    }

    /// MOSI source.
    pub fn tx(&self) -> &TxBuffer<'d> {
        &self.tx
    }

    /// MISO sink.
    pub fn rx(&self) -> &RxBuffer<'d> {
        &self.rx
    }

    /// Data received, trimmed to `rx_length`.
    pub fn rx_data(&self) -> Option<&[u8]> {
        let len = bits_to_bytes(self.rx_length);
        match &self.rx {
            RxBuffer::None => None,
            RxBuffer::Inline(data) => Some(&data.0[..len.min(4)]),
            RxBuffer::Buffer(buf) => Some(&buf[..len.min(buf.len())]),
        }
    }

    /// Give back the caller's receive buffer.
    pub fn into_rx_buffer(self) -> Option<&'d mut [u8]> {
        match self.rx {
            RxBuffer::Buffer(buf) => Some(buf),
            _ => None,
        }
    }

    pub(crate) fn has_tx(&self) -> bool {
        !matches!(self.tx, TxBuffer::None)
    }

    pub(crate) fn has_rx(&self) -> bool {
        !matches!(self.rx, RxBuffer::None)
    }

    pub(crate) fn rx_mut(&mut self) -> &mut RxBuffer<'d> {
        &mut self.rx
    }

    /// Bytes that hold `length` bits of MOSI data.
    pub(crate) fn tx_bytes(&self) -> usize {
        bits_to_bytes(self.length)
    }

    /// Bytes that hold `rx_length` bits of MISO data.
    pub(crate) fn rx_bytes(&self) -> usize {
        bits_to_bytes(self.rx_length)
    }
}

pub(crate) const fn bits_to_bytes(bits: usize) -> usize {
    bits.div_ceil(8)
}
