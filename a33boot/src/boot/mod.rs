//! Device-side bootloader core: boot decision and command dispatch.

pub mod decision;
pub mod dispatch;

// Re-export common types
pub use {
    decision::{BootPath, StayReason, decide, firmware_crc},
    dispatch::{BOARD_NAME, Bootloader, LOADER_VERSION, PollEvent, WRITE_CHUNK},
};
