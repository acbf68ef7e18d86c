//! Error types for ms2flash.

use std::io;
use thiserror::Error;

/// Result type for ms2flash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for ms2flash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// No SLCAN adapter found.
    #[error("No SLCAN adapter found")]
    DeviceNotFound,

    /// The adapter answered a command with a BEL (NAK).
    #[error("Adapter rejected command {0:?}")]
    AdapterNak(String),

    /// The device answered a bootloader block with a NAK code.
    #[error("Device aborted the transfer (NAK code {0:#04x})")]
    PeerAbort(u8),

    /// Communication timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Invalid firmware or data file contents.
    #[error("Invalid image: {0}")]
    InvalidImage(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Unsupported device class or operation.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// The embedding application asked the run to stop.
    #[error("Operation interrupted")]
    Interrupted,

    /// Configuration error (unknown device class, missing firmware directory or file).
    #[error("Configuration error: {0}")]
    Config(String),
}
