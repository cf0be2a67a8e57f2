//! Wire protocol implementation.

pub mod crc;
pub mod frame;

// Re-export common types
pub use frame::{Frame, FrameReader, Opcode, Reply, Status, MAX_PAYLOAD};
