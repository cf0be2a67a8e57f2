//! Command dispatcher and resident bootloader service.
//!
//! [`Bootloader`] is what the firmware main loop runs while resident:
//! one [`Bootloader::poll`] per iteration feeds the frame reader from
//! the transport, dispatches at most one complete frame and writes
//! exactly one reply for it. Frames that never complete (bad checksum,
//! oversized length) get no reply at all; the updater times out and
//! retries.
//!
//! Only this module mutates flash, and only in response to a fully
//! validated frame. There is no cross-frame session state: every
//! operation reads what it needs from flash, so the dispatcher can be
//! power-cycled between any two frames without leaving the protocol
//! wedged.

use {
    crate::{
        boot::decision::firmware_crc,
        device::{FlashDevice, FlashError, Transport},
        layout::{FlashLayout, TAG_RUN_APP, VersionRecord},
        protocol::frame::{Frame, FrameReader, Opcode, Reply, Status},
    },
    byteorder::{ByteOrder, LittleEndian},
    log::{debug, info, warn},
    std::time::{Duration, Instant},
};

/// Loader version string reported by the query operation.
pub const LOADER_VERSION: &str = "B210801R1";

/// Board name reported by the query operation.
pub const BOARD_NAME: &str = "A33G526_BOOT";

/// Chunk size used when streaming firmware over the wire.
pub const WRITE_CHUNK: usize = 256;

/// Result of one main-loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvent {
    /// No complete frame this iteration.
    Idle,
    /// A frame was dispatched and its reply queued.
    Replied,
    /// A reboot command was accepted; the caller must reset the part
    /// after draining the transmit path.
    RebootRequested,
}

/// The resident bootloader service.
pub struct Bootloader<F: FlashDevice, T: Transport> {
    flash: F,
    transport: T,
    reader: FrameReader,
    layout: FlashLayout,
}

impl<F: FlashDevice, T: Transport> Bootloader<F, T> {
    /// Create a service over the given collaborators with the default
    /// A33G52x layout.
    pub fn new(flash: F, transport: T) -> Self {
        Self::with_layout(flash, transport, FlashLayout::default())
    }

    /// Create a service with an explicit flash layout.
    pub fn with_layout(flash: F, transport: T, layout: FlashLayout) -> Self {
        Self {
            flash,
            transport,
            reader: FrameReader::new(),
            layout,
        }
    }

    /// The flash layout in use.
    pub fn layout(&self) -> &FlashLayout {
        &self.layout
    }

    /// Shared access to the flash device.
    pub fn flash(&self) -> &F {
        &self.flash
    }

    /// Tear down the service and hand back its collaborators.
    pub fn into_parts(self) -> (F, T) {
        (self.flash, self.transport)
    }

    /// Drain stale receive bytes for at most `budget`.
    ///
    /// Called once before entering the command loop so a frame is never
    /// assembled from bytes that predate the reset. This is the only
    /// time-bounded wait in the core; it returns as soon as the input
    /// goes quiet or the budget elapses.
    pub fn flush_input(&mut self, budget: Duration) {
        let deadline = Instant::now() + budget;
        let mut drained = 0usize;
        while Instant::now() < deadline {
            match self.transport.read_one() {
                Some(_) => drained += 1,
                None => break,
            }
        }
        if drained > 0 {
            debug!("flushed {drained} stale input bytes");
        }
        self.reader.reset();
    }

    /// Run one iteration of the command loop.
    pub fn poll(&mut self) -> PollEvent {
        let Some(frame) = self.reader.poll(&mut self.transport) else {
            return PollEvent::Idle;
        };

        let (reply, reboot) = self.dispatch(&frame);
        let encoded = reply.encode();
        self.transport.write(&encoded);

        if reboot {
            info!("reboot accepted, handing off to the application");
            PollEvent::RebootRequested
        } else {
            PollEvent::Replied
        }
    }

    /// Execute one validated frame. Returns the reply and whether the
    /// caller should reset after sending it.
    fn dispatch(&mut self, frame: &Frame) -> (Reply, bool) {
        let Some(opcode) = frame.command() else {
            warn!("unknown opcode {:#04x}", frame.opcode);
            return (
                Reply::to_request(frame.opcode, Status::UnknownOpcode, Vec::new()),
                false,
            );
        };

        match opcode {
            Opcode::Query => (self.op_query(frame), false),
            Opcode::Erase => (self.op_erase(frame), false),
            Opcode::Write => (self.op_write(frame), false),
            Opcode::Verify => (self.op_verify(frame), false),
            Opcode::Reboot => self.op_reboot(frame),
        }
    }

    /// QUERY: loader identity, no side effects, cannot fail.
    ///
    /// Reply data: version (32 bytes, NUL padded) + board name (32
    /// bytes, NUL padded).
    fn op_query(&self, frame: &Frame) -> Reply {
        let mut data = vec![0u8; 64];
        let version = LOADER_VERSION.as_bytes();
        let board = BOARD_NAME.as_bytes();
        data[..version.len().min(32)].copy_from_slice(&version[..version.len().min(32)]);
        data[32..32 + board.len().min(32)].copy_from_slice(&board[..board.len().min(32)]);
        Reply::to_request(frame.opcode, Status::Ok, data)
    }

    /// ERASE: payload `[addr: u32 LE][len: u32 LE]`.
    ///
    /// Erases every sector overlapping the range, in order. A hardware
    /// failure stops the sweep and is reported; sectors already erased
    /// stay erased, there is no rollback.
    fn op_erase(&mut self, frame: &Frame) -> Reply {
        if frame.payload.len() != 8 {
            return Reply::to_request(frame.opcode, Status::BadLength, Vec::new());
        }
        let addr = LittleEndian::read_u32(&frame.payload[0..4]);
        let len = LittleEndian::read_u32(&frame.payload[4..8]);

        if !self.layout.in_update_window(addr, len) {
            warn!("erase {addr:#010x}+{len:#x} out of bounds");
            return Reply::to_request(frame.opcode, Status::OutOfBounds, Vec::new());
        }

        let sectors: Vec<u32> = self.layout.covered_sectors(addr, len).collect();
        info!(
            "erasing {} sector(s) for {addr:#010x}+{len:#x}",
            sectors.len()
        );
        for sector in sectors {
            if let Err(err) = self.flash.erase_sector(sector) {
                warn!("erase failed: {err}");
                return Reply::to_request(frame.opcode, Status::EraseFailed, Vec::new());
            }
        }
        Reply::to_request(frame.opcode, Status::Ok, Vec::new())
    }

    /// WRITE: payload `[addr: u32 LE][data…]`.
    ///
    /// The address must be word aligned and the range erased
    /// beforehand; the dispatcher never erases implicitly. A trailing
    /// partial word is padded with 0xFF so the padding leaves those
    /// cells blank.
    fn op_write(&mut self, frame: &Frame) -> Reply {
        if frame.payload.len() < 5 {
            return Reply::to_request(frame.opcode, Status::BadLength, Vec::new());
        }
        let addr = LittleEndian::read_u32(&frame.payload[0..4]);
        let data = &frame.payload[4..];

        if addr % 4 != 0 {
            warn!("write to unaligned address {addr:#010x}");
            return Reply::to_request(frame.opcode, Status::BadAlignment, Vec::new());
        }
        if !self.layout.in_update_window(addr, data.len() as u32) {
            warn!("write {addr:#010x}+{:#x} out of bounds", data.len());
            return Reply::to_request(frame.opcode, Status::OutOfBounds, Vec::new());
        }

        for (i, chunk) in data.chunks(4).enumerate() {
            let mut word = [0xFFu8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            let word_addr = addr + (i as u32) * 4;
            if let Err(err) = self
                .flash
                .program_word(word_addr, LittleEndian::read_u32(&word))
            {
                warn!("program failed: {err}");
                return Reply::to_request(frame.opcode, Status::ProgramFailed, Vec::new());
            }
        }
        Reply::to_request(frame.opcode, Status::Ok, Vec::new())
    }

    /// VERIFY: payload `[fw_length: u32 LE][fw_crc: u16 LE][version…]`.
    ///
    /// Recomputes the CRC over `fw_length` bytes of the firmware
    /// region. On a match the version record and then the run-app tag
    /// are written, in that order, so a power loss in between leaves
    /// the tag unset and the loader resident. On a mismatch nothing is
    /// written and the reply carries the computed CRC (2 bytes LE) for
    /// diagnosis.
    fn op_verify(&mut self, frame: &Frame) -> Reply {
        if frame.payload.len() < 6
            || frame.payload.len() > 6 + VersionRecord::VERSION_LEN
        {
            return Reply::to_request(frame.opcode, Status::BadLength, Vec::new());
        }
        let fw_length = LittleEndian::read_u32(&frame.payload[0..4]);
        let expected_crc = LittleEndian::read_u16(&frame.payload[4..6]);
        let version = String::from_utf8_lossy(&frame.payload[6..]).into_owned();

        if fw_length == 0 || fw_length > self.layout.fw_max_len() {
            return Reply::to_request(frame.opcode, Status::OutOfBounds, Vec::new());
        }

        let computed = match firmware_crc(&self.flash, &self.layout, fw_length) {
            Ok(crc) => crc,
            Err(err) => {
                warn!("firmware readback failed: {err}");
                return Reply::to_request(frame.opcode, Status::CrcMismatch, Vec::new());
            },
        };
        if computed != expected_crc {
            warn!("verify failed: expected {expected_crc:#06x}, computed {computed:#06x}");
            let mut data = vec![0u8; 2];
            LittleEndian::write_u16(&mut data, computed);
            return Reply::to_request(frame.opcode, Status::CrcMismatch, data);
        }

        let record = VersionRecord {
            version,
            fw_length,
            fw_crc: computed,
        };
        if let Err(err) = self.commit_verified(&record) {
            warn!("commit failed: {err}");
            let status = match err {
                FlashError::Erase { .. } => Status::EraseFailed,
                _ => Status::ProgramFailed,
            };
            return Reply::to_request(frame.opcode, status, Vec::new());
        }

        info!(
            "firmware {} verified ({fw_length} bytes, CRC {computed:#06x})",
            record.version
        );
        Reply::to_request(frame.opcode, Status::Ok, Vec::new())
    }

    /// Persist the version record, then the run-app tag.
    fn commit_verified(&mut self, record: &VersionRecord) -> Result<(), FlashError> {
        self.flash.erase_sector(self.layout.version_addr)?;
        let encoded = record.encode();
        for (i, chunk) in encoded.chunks(4).enumerate() {
            let mut word = [0xFFu8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            self.flash.program_word(
                self.layout.version_addr + (i as u32) * 4,
                LittleEndian::read_u32(&word),
            )?;
        }

        self.flash.erase_sector(self.layout.tag_addr)?;
        self.flash.program_word(self.layout.tag_addr, TAG_RUN_APP)
    }

    /// REBOOT: no payload.
    ///
    /// Accepted only when flash already holds a verified image (tag set
    /// and version record valid); the CRC itself is re-checked by the
    /// decision engine after the reset.
    fn op_reboot(&mut self, frame: &Frame) -> (Reply, bool) {
        if !frame.payload.is_empty() {
            return (
                Reply::to_request(frame.opcode, Status::BadLength, Vec::new()),
                false,
            );
        }

        let mut tag_bytes = [0u8; 4];
        let tag_ok = self
            .flash
            .read_bytes(self.layout.tag_addr, &mut tag_bytes)
            .is_ok()
            && LittleEndian::read_u32(&tag_bytes) == TAG_RUN_APP;

        let mut record_bytes = [0u8; VersionRecord::SIZE];
        let record_ok = self
            .flash
            .read_bytes(self.layout.version_addr, &mut record_bytes)
            .is_ok()
            && VersionRecord::decode(&record_bytes).is_some();

        if tag_ok && record_ok {
            (Reply::to_request(frame.opcode, Status::Ok, Vec::new()), true)
        } else {
            warn!("reboot refused: no verified image");
            (
                Reply::to_request(frame.opcode, Status::NotVerified, Vec::new()),
                false,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            device::{pipe, ram::RamFlash},
            layout::A33G52X,
            protocol::crc::crc16_xmodem,
        },
        std::io::{Read, Write},
    };

    struct Harness {
        bootloader: Bootloader<RamFlash, pipe::DeviceEnd>,
        host: pipe::HostEnd,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_flash(RamFlash::a33g52x())
        }

        fn with_flash(flash: RamFlash) -> Self {
            let (host, device) = pipe::pipe();
            Self {
                bootloader: Bootloader::new(flash, device),
                host,
            }
        }

        /// Send a frame, run the loop, return the parsed reply.
        fn transact(&mut self, opcode: Opcode, payload: Vec<u8>) -> Reply {
            self.host
                .write_all(&Frame::request(opcode, payload).encode())
                .unwrap();
            let event = self.bootloader.poll();
            assert_ne!(event, PollEvent::Idle);

            let mut reader = FrameReader::new();
            let mut buf = [0u8; 64];
            loop {
                let n = self.host.read(&mut buf).unwrap();
                assert!(n > 0, "no reply bytes");
                for &byte in &buf[..n] {
                    if let Some(frame) = reader.push(byte) {
                        return Reply::parse(&frame).expect("malformed reply");
                    }
                }
            }
        }

        fn erase(&mut self, addr: u32, len: u32) -> Status {
            let mut payload = vec![0u8; 8];
            LittleEndian::write_u32(&mut payload[0..4], addr);
            LittleEndian::write_u32(&mut payload[4..8], len);
            self.transact(Opcode::Erase, payload).status
        }

        fn write(&mut self, addr: u32, data: &[u8]) -> Status {
            let mut offset = 0usize;
            for chunk in data.chunks(WRITE_CHUNK) {
                let mut payload = vec![0u8; 4];
                LittleEndian::write_u32(&mut payload, addr + offset as u32);
                payload.extend_from_slice(chunk);
                let status = self.transact(Opcode::Write, payload).status;
                if status != Status::Ok {
                    return status;
                }
                offset += chunk.len();
            }
            Status::Ok
        }

        fn verify(&mut self, fw_length: u32, fw_crc: u16, version: &str) -> Reply {
            let mut payload = vec![0u8; 6];
            LittleEndian::write_u32(&mut payload[0..4], fw_length);
            LittleEndian::write_u16(&mut payload[4..6], fw_crc);
            payload.extend_from_slice(version.as_bytes());
            self.transact(Opcode::Verify, payload)
        }

        fn read_flash(&self, addr: u32, len: usize) -> Vec<u8> {
            let mut buf = vec![0u8; len];
            self.bootloader.flash().read_bytes(addr, &mut buf).unwrap();
            buf
        }
    }

    #[test]
    fn test_query_reports_identity() {
        let mut h = Harness::new();
        let reply = h.transact(Opcode::Query, Vec::new());
        assert_eq!(reply.status, Status::Ok);
        assert_eq!(reply.data.len(), 64);
        assert!(reply.data.starts_with(LOADER_VERSION.as_bytes()));
        assert!(reply.data[32..].starts_with(BOARD_NAME.as_bytes()));
    }

    #[test]
    fn test_unknown_opcode_gets_failure_reply() {
        let mut h = Harness::new();
        h.host
            .write_all(&Frame { opcode: 0x7F, payload: Vec::new() }.encode())
            .unwrap();
        assert_eq!(h.bootloader.poll(), PollEvent::Replied);

        let mut reader = FrameReader::new();
        let mut buf = [0u8; 64];
        let n = h.host.read(&mut buf).unwrap();
        let frame = buf[..n]
            .iter()
            .find_map(|&b| reader.push(b))
            .expect("reply frame");
        let reply = Reply::parse(&frame).unwrap();
        assert_eq!(reply.status, Status::UnknownOpcode);
        assert_eq!(reply.request, 0x7F);
    }

    #[test]
    fn test_corrupt_frame_gets_no_reply() {
        let mut h = Harness::new();
        let mut wire = Frame::request(Opcode::Query, Vec::new()).encode();
        let last = wire.len() - 1;
        wire[last] ^= 0xFF;
        h.host.write_all(&wire).unwrap();

        assert_eq!(h.bootloader.poll(), PollEvent::Idle);
        let mut buf = [0u8; 16];
        assert_eq!(h.host.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_erase_is_idempotent() {
        let mut h = Harness::new();
        assert_eq!(h.write(0x8400, &[0u8; 64]), Status::Ok);

        assert_eq!(h.erase(0x8400, 1024), Status::Ok);
        let first = h.read_flash(0x8400, 1024);
        assert_eq!(h.erase(0x8400, 1024), Status::Ok);
        assert_eq!(h.read_flash(0x8400, 1024), first);
        assert!(first.iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_erase_rejects_bootloader_area() {
        let mut h = Harness::new();
        assert_eq!(h.erase(0x0000, 1024), Status::OutOfBounds);
        assert_eq!(h.erase(0x7C00, 2048), Status::OutOfBounds);
        assert_eq!(h.erase(0x8400, 0), Status::OutOfBounds);
    }

    #[test]
    fn test_erase_reports_hardware_failure() {
        let flash = RamFlash::a33g52x().fail_erase_at(0x8800);
        let mut h = Harness::with_flash(flash);
        // Range covers 0x8400 and 0x8800; the second sector fails.
        assert_eq!(h.erase(0x8400, 2048), Status::EraseFailed);
    }

    #[test]
    fn test_unaligned_write_fails_without_mutation() {
        let mut h = Harness::new();
        let before = h.bootloader.flash().snapshot();
        assert_eq!(h.write(0x8401, &[1, 2, 3, 4]), Status::BadAlignment);
        assert_eq!(h.bootloader.flash().snapshot(), before);
    }

    #[test]
    fn test_write_read_roundtrip() {
        let mut h = Harness::new();
        let data: Vec<u8> = (0..200u8).collect();
        assert_eq!(h.erase(0x8400, data.len() as u32), Status::Ok);
        assert_eq!(h.write(0x8400, &data), Status::Ok);
        assert_eq!(h.read_flash(0x8400, data.len()), data);
    }

    #[test]
    fn test_write_rejects_out_of_bounds() {
        let mut h = Harness::new();
        let end = A33G52X.update_end;
        assert_eq!(h.write(end - 4, &[0u8; 8]), Status::OutOfBounds);
    }

    #[test]
    fn test_verify_mismatch_leaves_tag_unset() {
        let mut h = Harness::new();
        h.erase(0x8400, 1024);
        h.write(0x8400, &[0xA5; 1024]);

        let reply = h.verify(1024, 0x0BAD, "V1");
        assert_eq!(reply.status, Status::CrcMismatch);
        // Diagnostic data carries the CRC the loader computed.
        assert_eq!(
            LittleEndian::read_u16(&reply.data),
            crc16_xmodem(&[0xA5; 1024])
        );

        // Tag sector must still be blank.
        assert_eq!(h.read_flash(A33G52X.tag_addr, 4), vec![0xFF; 4]);
    }

    #[test]
    fn test_verify_match_sets_tag_and_record() {
        let mut h = Harness::new();
        let image = [0x3Cu8; 512];
        h.erase(0x8400, image.len() as u32);
        h.write(0x8400, &image);

        let reply = h.verify(image.len() as u32, crc16_xmodem(&image), "V230115");
        assert_eq!(reply.status, Status::Ok);

        let tag = h.read_flash(A33G52X.tag_addr, 4);
        assert_eq!(LittleEndian::read_u32(&tag), crate::layout::TAG_RUN_APP);

        let record_bytes = h.read_flash(A33G52X.version_addr, VersionRecord::SIZE);
        let record = VersionRecord::decode(&record_bytes).unwrap();
        assert_eq!(record.version, "V230115");
        assert_eq!(record.fw_length, image.len() as u32);
        assert_eq!(record.fw_crc, crc16_xmodem(&image));
    }

    #[test]
    fn test_reboot_refused_before_verify() {
        let mut h = Harness::new();
        let reply = h.transact(Opcode::Reboot, Vec::new());
        assert_eq!(reply.status, Status::NotVerified);
    }

    #[test]
    fn test_reboot_accepted_after_verify() {
        let mut h = Harness::new();
        let image = [0x11u8; 256];
        h.erase(0x8400, image.len() as u32);
        h.write(0x8400, &image);
        assert_eq!(
            h.verify(image.len() as u32, crc16_xmodem(&image), "V1").status,
            Status::Ok
        );

        h.host
            .write_all(&Frame::request(Opcode::Reboot, Vec::new()).encode())
            .unwrap();
        assert_eq!(h.bootloader.poll(), PollEvent::RebootRequested);
    }

    #[test]
    fn test_flush_input_discards_stale_bytes() {
        let mut h = Harness::new();
        // Half a frame of stale garbage.
        h.host.write_all(&[0x00, 0x04]).unwrap();
        h.bootloader.flush_input(Duration::from_millis(20));

        // A fresh query must still work.
        let reply = h.transact(Opcode::Query, Vec::new());
        assert_eq!(reply.status, Status::Ok);
    }
}
