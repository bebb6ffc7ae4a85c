//! Error types for the xvcd-ftdi bridge daemon.

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, XvcdError>;

/// Taxonomy of everything that can go wrong in this crate.
#[derive(Error, Debug)]
pub enum XvcdError {
    /// A USB transport error reported by the operating system.
    #[error("USB error: {0}")]
    Usb(#[from] nusb::Error),

    /// A USB transfer failed in flight (short write, stalled endpoint, ...).
    #[error("USB transfer error: {0}")]
    Transfer(#[from] nusb::transfer::TransferError),

    /// TCP I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No device matched the requested vendor/product/serial.
    #[error("No matching USB device found")]
    NoDevice,

    /// The matched device's configuration exposed more than one bulk IN or
    /// bulk OUT endpoint on the requested interface.
    #[error("Interface exposes more than one bulk {0} endpoint")]
    AmbiguousEndpoints(&'static str),

    /// The device was found but could not be opened.
    #[error("Could not open device: {0}")]
    OpenRefused(String),

    /// The interface could not be claimed (in use, no permission, ...).
    #[error("Could not claim interface: {0}")]
    ClaimFailed(String),

    /// A vendor control transfer failed.
    #[error("Control transfer failed: {0}")]
    ControlFailed(String),

    /// A bulk OUT transfer failed.
    #[error("Bulk write failed: {0}")]
    WriteFailed(String),

    /// A bulk IN transfer failed.
    #[error("Bulk read failed: {0}")]
    ReadFailed(String),

    /// A `shift:` payload exceeded the XVC buffer size.
    #[error("shift payload of {requested} bytes exceeds the {max}-byte limit")]
    PayloadTooLarge { requested: usize, max: usize },

    /// The read stream hit EOF mid-command.
    #[error("Unexpected EOF")]
    UnexpectedEof,

    /// A byte on the wire did not match any known command prefix.
    #[error("Unexpected character {0:#04x}")]
    UnexpectedChar(u8),

    /// A literal match (e.g. `ttck:`) failed partway through.
    #[error("Expected {expected:#04x}, got {got:#04x}")]
    LiteralMismatch { expected: u8, got: u8 },

    /// A bad CLI argument.
    #[error("Bad argument: {0}")]
    BadArgument(String),

    /// A programmer-error invariant was violated; the caller should treat
    /// this as fatal.
    #[error("Invariant violated: {0}")]
    Invariant(String),
}
