//! Bootloader command framing.
//!
//! Every message exchanged between the updater and the resident
//! bootloader uses the same frame layout:
//!
//! ```text
//! +--------+----------+---------------+--------+
//! | Opcode |  Length  |    Payload    | CRC16  |
//! +--------+----------+---------------+--------+
//! | 1 byte | 2 bytes  | Length bytes  | 2 bytes|
//! +--------+----------+---------------+--------+
//! |  cmd   |  LE u16  |   payload     |  LE    |
//! +--------+----------+---------------+--------+
//! ```
//!
//! The CRC-16/XMODEM trailer covers the opcode, the length field and the
//! payload. Replies reuse the layout with bit 7 set in the opcode and a
//! one-byte status code prepended to the payload.
//!
//! [`FrameReader`] turns the raw receive byte stream back into frames.
//! It is a non-blocking state machine meant to be polled from the
//! bootloader main loop; a frame with a bad checksum or an oversized
//! declared length is discarded without a reply and the reader returns
//! to idle, so the stream can always resynchronize on the next frame.

use {
    crate::{device::Transport, protocol::crc::crc16_xmodem},
    byteorder::{ByteOrder, LittleEndian},
    log::{debug, trace},
    std::fmt,
};

/// Maximum payload length accepted in a single frame.
pub const MAX_PAYLOAD: usize = 1024;

/// Frame header length: opcode (1) + payload length (2).
pub const HEADER_LEN: usize = 3;

/// Frame trailer length (CRC-16, little-endian).
pub const CRC_LEN: usize = 2;

/// Maximum encoded frame length.
///
/// The receive ring buffer must be sized above this, otherwise a full
/// frame could overwrite itself before the main loop drains it.
pub const MAX_FRAME_LEN: usize = HEADER_LEN + MAX_PAYLOAD + CRC_LEN;

/// Opcode bit marking a reply frame.
pub const REPLY_FLAG: u8 = 0x80;

/// Bootloader command opcodes.
///
/// The values are part of the wire contract shared with the updater
/// tool and must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Report loader version and board name (0x00).
    Query = 0x00,
    /// Erase every sector overlapping an address range (0x01).
    Erase = 0x01,
    /// Program a data chunk at a word-aligned address (0x02).
    Write = 0x02,
    /// Check the firmware CRC and mark the image bootable (0x03).
    Verify = 0x03,
    /// Leave the bootloader and start the application (0x04).
    Reboot = 0x04,
}

impl Opcode {
    /// Decode a raw opcode byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Query),
            0x01 => Some(Self::Erase),
            0x02 => Some(Self::Write),
            0x03 => Some(Self::Verify),
            0x04 => Some(Self::Reboot),
            _ => None,
        }
    }

    /// The opcode byte used by the matching reply frame.
    pub fn reply_opcode(self) -> u8 {
        self as u8 | REPLY_FLAG
    }
}

/// Status codes carried in the first payload byte of a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    /// Operation completed.
    Ok = 0,
    /// Opcode not in the command set.
    UnknownOpcode = 1,
    /// Payload length does not match the operation.
    BadLength = 2,
    /// Write address not 4-byte aligned.
    BadAlignment = 3,
    /// Address range outside the updatable flash window.
    OutOfBounds = 4,
    /// Flash device reported an erase failure; some covered sectors may
    /// already be blank, none are restored.
    EraseFailed = 5,
    /// Flash device reported a program failure; earlier words of the
    /// chunk stay written.
    ProgramFailed = 6,
    /// Reboot requested without a verified image in flash.
    NotVerified = 7,
    /// Firmware CRC did not match the expected value.
    CrcMismatch = 8,
}

impl Status {
    /// Decode a raw status byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Ok),
            1 => Some(Self::UnknownOpcode),
            2 => Some(Self::BadLength),
            3 => Some(Self::BadAlignment),
            4 => Some(Self::OutOfBounds),
            5 => Some(Self::EraseFailed),
            6 => Some(Self::ProgramFailed),
            7 => Some(Self::NotVerified),
            8 => Some(Self::CrcMismatch),
            _ => None,
        }
    }

    /// Whether this status reports success.
    pub fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Ok => "ok",
            Self::UnknownOpcode => "unknown opcode",
            Self::BadLength => "bad payload length",
            Self::BadAlignment => "address not word aligned",
            Self::OutOfBounds => "address range out of bounds",
            Self::EraseFailed => "flash erase failed",
            Self::ProgramFailed => "flash program failed",
            Self::NotVerified => "image not verified",
            Self::CrcMismatch => "firmware CRC mismatch",
        };
        f.write_str(text)
    }
}

/// One complete, checksum-validated frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Raw opcode byte. Kept raw so the dispatcher can answer unknown
    /// opcodes with a failure reply instead of dropping them.
    pub opcode: u8,
    /// Opaque payload, at most [`MAX_PAYLOAD`] bytes.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Build a request frame.
    pub fn request(opcode: Opcode, payload: Vec<u8>) -> Self {
        Self {
            opcode: opcode as u8,
            payload,
        }
    }

    /// The decoded opcode, if this frame carries a known command.
    pub fn command(&self) -> Option<Opcode> {
        Opcode::from_u8(self.opcode)
    }

    /// Encode the frame with length field and CRC trailer.
    #[allow(clippy::cast_possible_truncation)] // payload is capped at MAX_PAYLOAD
    pub fn encode(&self) -> Vec<u8> {
        debug_assert!(self.payload.len() <= MAX_PAYLOAD);

        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len() + CRC_LEN);
        buf.push(self.opcode);
        let mut len = [0u8; 2];
        LittleEndian::write_u16(&mut len, self.payload.len() as u16);
        buf.extend_from_slice(&len);
        buf.extend_from_slice(&self.payload);

        let crc = crc16_xmodem(&buf);
        let mut trailer = [0u8; 2];
        LittleEndian::write_u16(&mut trailer, crc);
        buf.extend_from_slice(&trailer);
        buf
    }
}

/// Decoded reply frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Opcode of the request being answered.
    pub request: u8,
    /// Result of the operation.
    pub status: Status,
    /// Operation-specific reply data (empty on most failures).
    pub data: Vec<u8>,
}

impl Reply {
    /// Build a reply to the given raw request opcode.
    pub fn to_request(request: u8, status: Status, data: Vec<u8>) -> Self {
        Self {
            request,
            status,
            data,
        }
    }

    /// Encode as a wire frame: reply opcode, then `[status][data…]`.
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(1 + self.data.len());
        payload.push(self.status as u8);
        payload.extend_from_slice(&self.data);
        Frame {
            opcode: self.request | REPLY_FLAG,
            payload,
        }
        .encode()
    }

    /// Interpret a received frame as a reply.
    ///
    /// Returns `None` if the frame is not a reply, carries no status
    /// byte, or carries a status byte outside the known set.
    pub fn parse(frame: &Frame) -> Option<Self> {
        if frame.opcode & REPLY_FLAG == 0 {
            return None;
        }
        let status = Status::from_u8(*frame.payload.first()?)?;
        Some(Self {
            request: frame.opcode & !REPLY_FLAG,
            status,
            data: frame.payload[1..].to_vec(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Header,
    Payload,
    Checksum,
}

/// Incremental frame decoder.
///
/// Feed it bytes as they arrive, in any chunking; it emits each
/// complete frame exactly once. Both ends of the link use it: the
/// bootloader polls it against its receive [`Transport`], the updater
/// pushes bytes read from the serial port.
#[derive(Debug)]
pub struct FrameReader {
    state: State,
    // Opcode + length + payload accumulated so far; the CRC trailer is
    // computed over exactly these bytes.
    raw: Vec<u8>,
    payload_len: usize,
    trailer: [u8; CRC_LEN],
    trailer_len: usize,
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameReader {
    /// Create a reader in the idle state.
    pub fn new() -> Self {
        Self {
            state: State::Idle,
            raw: Vec::with_capacity(HEADER_LEN + MAX_PAYLOAD),
            payload_len: 0,
            trailer: [0; CRC_LEN],
            trailer_len: 0,
        }
    }

    /// Drop any partially accumulated frame and return to idle.
    pub fn reset(&mut self) {
        self.state = State::Idle;
        self.raw.clear();
        self.payload_len = 0;
        self.trailer_len = 0;
    }

    /// Consume one byte; returns a frame when it completes one.
    pub fn push(&mut self, byte: u8) -> Option<Frame> {
        match self.state {
            State::Idle => {
                self.raw.push(byte);
                self.state = State::Header;
                None
            },
            State::Header => {
                self.raw.push(byte);
                if self.raw.len() == HEADER_LEN {
                    self.payload_len = usize::from(LittleEndian::read_u16(&self.raw[1..3]));
                    if self.payload_len > MAX_PAYLOAD {
                        debug!(
                            "declared payload length {} exceeds {MAX_PAYLOAD}, discarding frame",
                            self.payload_len
                        );
                        self.reset();
                    } else if self.payload_len == 0 {
                        self.state = State::Checksum;
                    } else {
                        self.state = State::Payload;
                    }
                }
                None
            },
            State::Payload => {
                self.raw.push(byte);
                if self.raw.len() == HEADER_LEN + self.payload_len {
                    self.state = State::Checksum;
                }
                None
            },
            State::Checksum => {
                self.trailer[self.trailer_len] = byte;
                self.trailer_len += 1;
                if self.trailer_len < CRC_LEN {
                    return None;
                }

                let received = LittleEndian::read_u16(&self.trailer);
                let computed = crc16_xmodem(&self.raw);
                if received != computed {
                    debug!("frame CRC mismatch: received {received:#06x}, computed {computed:#06x}");
                    self.reset();
                    return None;
                }

                let frame = Frame {
                    opcode: self.raw[0],
                    payload: self.raw[HEADER_LEN..].to_vec(),
                };
                trace!(
                    "frame complete: opcode {:#04x}, {} payload bytes",
                    frame.opcode,
                    frame.payload.len()
                );
                self.reset();
                Some(frame)
            },
        }
    }

    /// Consume the bytes currently available from `transport`.
    ///
    /// Never blocks; stops at the first complete frame so any following
    /// bytes stay queued for the next poll.
    pub fn poll<T: Transport>(&mut self, transport: &mut T) -> Option<Frame> {
        while transport.available() > 0 {
            let byte = transport.read_one()?;
            if let Some(frame) = self.push(byte) {
                return Some(frame);
            }
        }
        None
    }
}
