/// Bus engine errors.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// Malformed transaction or configuration, nothing was changed.
    InvalidArg,
    /// Well-formed request that the current bus state doesn't allow.
    InvalidState,
    /// No free chip-select slot.
    NotFound,
    /// DMA-capable memory exhausted.
    NoMem,
    /// The wait bound expired.
    Timeout,
    /// The device was registered without a result queue.
    NotSupported,
}

/// shorthand for -> Result<T>
pub type Result<T> = core::result::Result<T, Error>;

impl embedded_hal_1::spi::Error for Error {
    fn kind(&self) -> embedded_hal_1::spi::ErrorKind {
        match *self {
            Self::InvalidArg
            | Self::InvalidState
            | Self::NotFound
            | Self::NoMem
            | Self::Timeout
            | Self::NotSupported => embedded_hal_1::spi::ErrorKind::Other,
        }
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            Self::InvalidArg => "invalid argument",
            Self::InvalidState => "invalid state",
            Self::NotFound => "no free chip-select slot",
            Self::NoMem => "out of DMA memory",
            Self::Timeout => "timed out",
            Self::NotSupported => "not supported",
        };
        f.write_str(msg)
    }
}
