//! Error types for a33boot.

use {
    crate::{device::FlashError, protocol::frame::Status},
    std::io,
    thiserror::Error,
};

/// Result type for a33boot operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for a33boot operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Flash device error.
    #[error("Flash error: {0}")]
    Flash(#[from] FlashError),

    /// CRC checksum mismatch.
    #[error("CRC mismatch: expected {expected:#06x}, got {actual:#06x}")]
    CrcMismatch {
        /// Expected CRC value.
        expected: u16,
        /// Actual CRC value.
        actual: u16,
    },

    /// Communication timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The bootloader answered with a failure status.
    #[error("Command {opcode:#04x} failed: {status}")]
    Command {
        /// Opcode of the failing request.
        opcode: u8,
        /// Status code from the reply.
        status: Status,
    },

    /// Malformed or unexpected reply.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid argument or configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation interrupted by the embedding application.
    #[error("Interrupted")]
    Interrupted,
}
