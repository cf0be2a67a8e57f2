//! External collaborator contracts.
//!
//! The bootloader core never touches hardware registers; it talks to
//! two traits instead:
//!
//! - [`FlashDevice`] — sector erase, word program, memory-mapped read.
//!   On the target this is the FMC register driver; here the
//!   [`ram::RamFlash`] simulator stands in for it.
//! - [`Transport`] — non-blocking buffered byte I/O over one serial
//!   channel. On the target this is the interrupt-fed UART driver;
//!   [`pipe`] provides an in-memory stand-in wired to the updater
//!   client.

pub mod pipe;
pub mod ram;

use thiserror::Error;

/// Errors reported by a flash device.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FlashError {
    /// Sector erase failed; the sector contents are undefined.
    #[error("sector erase failed at {addr:#010x}")]
    Erase {
        /// Base address of the failing sector.
        addr: u32,
    },

    /// Word program failed; the word contents are undefined.
    #[error("word program failed at {addr:#010x}")]
    Program {
        /// Address of the failing word.
        addr: u32,
    },

    /// Address range falls outside the device.
    #[error("range {addr:#010x}+{len:#x} outside flash")]
    OutOfRange {
        /// Start of the offending range.
        addr: u32,
        /// Length of the offending range.
        len: u32,
    },
}

/// Raw flash primitives.
///
/// Addresses are absolute byte addresses. `erase_sector` expects a
/// sector-aligned address and `program_word` a 4-byte-aligned one;
/// both are caller contracts enforced by the dispatcher before any
/// call reaches the device.
pub trait FlashDevice {
    /// Erase one whole sector to the blank (0xFF) state.
    fn erase_sector(&mut self, addr: u32) -> Result<(), FlashError>;

    /// Program one 32-bit word (little-endian byte order in memory).
    fn program_word(&mut self, addr: u32, word: u32) -> Result<(), FlashError>;

    /// Memory-mapped read; fills `buf` from `addr`.
    fn read_bytes(&self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError>;
}

/// Buffered, non-blocking byte transport.
///
/// The receive side has at-least-available semantics: `available()`
/// may under-report bytes queued by the interrupt side, never
/// over-report them.
pub trait Transport {
    /// Number of received bytes ready to read.
    fn available(&self) -> usize;

    /// Pop one received byte, `None` when the buffer is empty.
    fn read_one(&mut self) -> Option<u8>;

    /// Queue bytes for transmission; returns how many were accepted.
    fn write(&mut self, buf: &[u8]) -> usize;
}
