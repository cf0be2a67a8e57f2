//! # a33boot
//!
//! Serial bootloader core and host updater for ABOV A33G52x boards.
//!
//! The crate covers both halves of the firmware-update protocol:
//!
//! - The **device core**: the frame reader, command dispatcher and
//!   boot decision engine the resident bootloader runs, written
//!   against the [`device::FlashDevice`] and [`device::Transport`]
//!   traits so it can run on the part or against the in-memory
//!   simulators shipped here.
//! - The **host updater**: a protocol client that streams a firmware
//!   image over a serial port, verifies it and hands control to it.
//!
//! ## Wire protocol
//!
//! Frames are `[opcode][length: u16 LE][payload][CRC-16/XMODEM: LE]`,
//! payload at most 1024 bytes; see [`protocol::frame`]. The flash map
//! and boot-tag semantics live in [`layout`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use a33boot::{Updater, port::{self, SerialConfig}};
//!
//! fn main() -> a33boot::Result<()> {
//!     let port = port::open(&SerialConfig::new("/dev/ttyUSB0", 115200))?;
//!     let mut updater = Updater::new(port);
//!
//!     let info = updater.query()?;
//!     println!("loader {} on {}", info.version, info.board);
//!
//!     let image = std::fs::read("firmware.bin")?;
//!     updater.flash_image(&image, "V230115R1", &mut |sent, total| {
//!         println!("{sent}/{total}");
//!     })?;
//!     updater.reboot()?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod boot;
pub mod device;
pub mod error;
pub mod layout;
pub mod protocol;
pub mod ring;
pub mod updater;

#[cfg(feature = "native")]
pub mod port;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by long-running library
/// loops (the updater checks it between firmware chunks).
///
/// The checker should return `true` when the current operation should
/// stop (for example after receiving Ctrl-C in CLI applications).
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding
/// application.
#[must_use]
pub fn is_interrupt_requested() -> bool {
    INTERRUPT_CHECKER.get().is_some_and(|checker| checker())
}

// Re-exports for convenience
pub use {
    boot::{BootPath, Bootloader, PollEvent, StayReason, decide},
    device::{
        FlashDevice, FlashError, Transport,
        pipe::{DeviceEnd, HostEnd, pipe},
        ram::RamFlash,
    },
    error::{Error, Result},
    layout::{FlashLayout, TAG_BOOT_REQUEST, TAG_RUN_APP, VersionRecord},
    protocol::{Frame, FrameReader, MAX_PAYLOAD, Opcode, Reply, Status},
    updater::{LoaderInfo, Updater},
};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_interrupt_checker_roundtrip() {
        static FLAG: AtomicBool = AtomicBool::new(false);
        set_interrupt_checker(|| FLAG.load(Ordering::Relaxed));

        FLAG.store(false, Ordering::Relaxed);
        assert!(!is_interrupt_requested());

        FLAG.store(true, Ordering::Relaxed);
        assert!(is_interrupt_requested());

        FLAG.store(false, Ordering::Relaxed);
        assert!(!is_interrupt_requested());
    }
}
