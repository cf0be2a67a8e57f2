//! Host-side updater client.
//!
//! Drives the bootloader wire protocol over anything that implements
//! `Read + Write`: a real serial port on the host, or the in-memory
//! [`crate::device::pipe`] link in tests. One request is always
//! answered by exactly one reply (or by silence when the frame was
//! corrupted in transit), so the client is a plain
//! send/collect-with-deadline loop around [`FrameReader`].

use {
    crate::{
        boot::dispatch::WRITE_CHUNK,
        error::{Error, Result},
        is_interrupt_requested,
        layout::{FlashLayout, VersionRecord},
        protocol::{
            crc::crc16_xmodem,
            frame::{Frame, FrameReader, Opcode, Reply},
        },
    },
    byteorder::{ByteOrder, LittleEndian},
    log::{debug, info, trace},
    std::{
        io::{ErrorKind, Read, Write},
        thread,
        time::{Duration, Instant},
    },
};

/// Default reply deadline per request.
const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);

/// Attempts per chunk before a transfer is abandoned. A frame that was
/// corrupted on the wire gets no reply at all, so retrying on timeout
/// is the normal recovery path, not an edge case.
const MAX_RETRIES: usize = 3;

/// Loader identity reported by the query operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderInfo {
    /// Loader version string.
    pub version: String,
    /// Board name string.
    pub board: String,
}

/// Updater protocol client.
pub struct Updater<P: Read + Write> {
    port: P,
    layout: FlashLayout,
    timeout: Duration,
    reader: FrameReader,
}

impl<P: Read + Write> Updater<P> {
    /// Create a client over an open port, with the default A33G52x
    /// layout.
    pub fn new(port: P) -> Self {
        Self {
            port,
            layout: FlashLayout::default(),
            timeout: DEFAULT_TIMEOUT,
            reader: FrameReader::new(),
        }
    }

    /// Set the per-request reply deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the flash layout to address.
    #[must_use]
    pub fn with_layout(mut self, layout: FlashLayout) -> Self {
        self.layout = layout;
        self
    }

    /// The flash layout in use.
    pub fn layout(&self) -> &FlashLayout {
        &self.layout
    }

    /// Consume the client and return the underlying port.
    pub fn into_port(self) -> P {
        self.port
    }

    /// Query loader version and board name.
    pub fn query(&mut self) -> Result<LoaderInfo> {
        let reply = self.transact(Opcode::Query, Vec::new())?;
        if reply.data.len() < 64 {
            return Err(Error::Protocol(format!(
                "query reply too short: {} bytes",
                reply.data.len()
            )));
        }
        Ok(LoaderInfo {
            version: trim_field(&reply.data[..32]),
            board: trim_field(&reply.data[32..64]),
        })
    }

    /// Erase every sector overlapping `[addr, addr + len)`.
    pub fn erase(&mut self, addr: u32, len: u32) -> Result<()> {
        info!("erasing {addr:#010x}+{len:#x}");
        let mut payload = vec![0u8; 8];
        LittleEndian::write_u32(&mut payload[0..4], addr);
        LittleEndian::write_u32(&mut payload[4..8], len);
        self.transact(Opcode::Erase, payload).map(|_| ())
    }

    /// Program one chunk at a word-aligned address. The covering
    /// sectors must have been erased first.
    pub fn write_chunk(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        let mut payload = vec![0u8; 4];
        LittleEndian::write_u32(&mut payload, addr);
        payload.extend_from_slice(data);
        self.transact(Opcode::Write, payload).map(|_| ())
    }

    /// Ask the loader to verify `expected_crc` over `fw_length` bytes
    /// of the firmware region and mark the image bootable.
    pub fn verify(&mut self, fw_length: u32, expected_crc: u16, version: &str) -> Result<()> {
        if version.len() > VersionRecord::VERSION_LEN {
            return Err(Error::Config(format!(
                "version string longer than {} bytes",
                VersionRecord::VERSION_LEN
            )));
        }
        let mut payload = vec![0u8; 6];
        LittleEndian::write_u32(&mut payload[0..4], fw_length);
        LittleEndian::write_u16(&mut payload[4..6], expected_crc);
        payload.extend_from_slice(version.as_bytes());
        self.transact(Opcode::Verify, payload).map(|_| ())
    }

    /// Leave the bootloader and start the application. Valid only
    /// after a successful verify.
    pub fn reboot(&mut self) -> Result<()> {
        self.transact(Opcode::Reboot, Vec::new()).map(|_| ())
    }

    /// Full update flow: erase the firmware range, stream the image in
    /// [`WRITE_CHUNK`]-byte chunks, then verify and tag it.
    ///
    /// `progress` is called with (bytes sent, total bytes) after every
    /// chunk.
    pub fn flash_image(
        &mut self,
        image: &[u8],
        version: &str,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<()> {
        if image.is_empty() {
            return Err(Error::Config("empty firmware image".into()));
        }
        if image.len() as u32 > self.layout.fw_max_len() {
            return Err(Error::Config(format!(
                "image of {} bytes exceeds firmware region ({} bytes)",
                image.len(),
                self.layout.fw_max_len()
            )));
        }

        let base = self.layout.fw_addr;
        self.erase(base, image.len() as u32)?;

        let mut sent = 0usize;
        for chunk in image.chunks(WRITE_CHUNK) {
            if is_interrupt_requested() {
                return Err(Error::Interrupted);
            }
            self.write_with_retry(base + sent as u32, chunk)?;
            sent += chunk.len();
            progress(sent, image.len());
        }

        let crc = crc16_xmodem(image);
        info!("image streamed, verifying CRC {crc:#06x}");
        self.verify(image.len() as u32, crc, version)
    }

    fn write_with_retry(&mut self, addr: u32, chunk: &[u8]) -> Result<()> {
        let mut last = None;
        for attempt in 1..=MAX_RETRIES {
            match self.write_chunk(addr, chunk) {
                Ok(()) => return Ok(()),
                Err(Error::Timeout(msg)) => {
                    debug!("chunk at {addr:#010x} timed out (attempt {attempt}/{MAX_RETRIES})");
                    last = Some(Error::Timeout(msg));
                },
                Err(err) => return Err(err),
            }
        }
        Err(last.unwrap_or(Error::Timeout("write retries exhausted".into())))
    }

    /// Send one request and collect its reply.
    fn transact(&mut self, opcode: Opcode, payload: Vec<u8>) -> Result<Reply> {
        let request = Frame::request(opcode, payload);
        trace!(
            "request {opcode:?}, {} payload bytes",
            request.payload.len()
        );
        self.reader.reset();
        self.port.write_all(&request.encode())?;
        self.port.flush()?;

        let reply = self.collect_reply()?;
        if reply.request != opcode as u8 {
            return Err(Error::Protocol(format!(
                "reply opcode {:#04x} does not match request {:#04x}",
                reply.request, opcode as u8
            )));
        }
        if !reply.status.is_ok() {
            return Err(Error::Command {
                opcode: opcode as u8,
                status: reply.status,
            });
        }
        Ok(reply)
    }

    fn collect_reply(&mut self) -> Result<Reply> {
        let deadline = Instant::now() + self.timeout;
        let mut buf = [0u8; 256];
        loop {
            match self.port.read(&mut buf) {
                Ok(0) => {
                    // Nothing queued yet (non-blocking transports).
                    if Instant::now() >= deadline {
                        return Err(Error::Timeout("no reply from bootloader".into()));
                    }
                    thread::sleep(Duration::from_millis(1));
                },
                Ok(n) => {
                    for &byte in &buf[..n] {
                        if let Some(frame) = self.reader.push(byte) {
                            return Reply::parse(&frame)
                                .ok_or_else(|| Error::Protocol("malformed reply frame".into()));
                        }
                    }
                    if Instant::now() >= deadline {
                        return Err(Error::Timeout("incomplete reply".into()));
                    }
                },
                Err(err)
                    if err.kind() == ErrorKind::TimedOut
                        || err.kind() == ErrorKind::WouldBlock =>
                {
                    if Instant::now() >= deadline {
                        return Err(Error::Timeout("no reply from bootloader".into()));
                    }
                },
                Err(err) => return Err(err.into()),
            }
        }
    }
}

fn trim_field(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trim_field() {
        assert_eq!(trim_field(b"ABC\0\0\0"), "ABC");
        assert_eq!(trim_field(b"ABC"), "ABC");
        assert_eq!(trim_field(b"\0\0"), "");
    }

    #[test]
    fn test_version_length_checked() {
        // A port that is never used: verify() must fail before I/O.
        let cursor = std::io::Cursor::new(Vec::new());
        let mut updater = Updater::new(cursor);
        let long = "X".repeat(VersionRecord::VERSION_LEN + 1);
        assert!(matches!(
            updater.verify(16, 0, &long),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_flash_image_rejects_oversized_image() {
        let cursor = std::io::Cursor::new(Vec::new());
        let mut updater = Updater::new(cursor);
        let too_big = vec![0u8; (updater.layout().fw_max_len() + 1) as usize];
        assert!(matches!(
            updater.flash_image(&too_big, "V1", &mut |_, _| {}),
            Err(Error::Config(_))
        ));
    }
}
