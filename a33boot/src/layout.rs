//! Flash image layout for the A33G52x bootloader.
//!
//! The on-chip flash is split into a fixed map shared by the
//! bootloader, the application and the updater tool:
//!
//! ```text
//! 0x0000_0000 +--------------------+
//!             |  bootloader code   |  never touchable over the wire
//! 0x0000_8000 +--------------------+
//!             |  TAG_REGION        |  1 sector, boot-tag word
//! 0x0000_8400 +--------------------+
//!             |  FIRMWARE_REGION   |  application image, vectors first
//! 0x0003_FC00 +--------------------+
//!             |  VERSION_REGION    |  1 sector, version record
//! 0x0004_0000 +--------------------+
//! ```
//!
//! The version record is written once, as the last step of a successful
//! update, and lives outside the firmware CRC window so writing it can
//! never invalidate the CRC it stores.

use {
    crate::protocol::crc::crc16_xmodem,
    byteorder::{ByteOrder, LittleEndian},
};

/// Minimum erasable flash granule.
pub const SECTOR_SIZE: u32 = 1024;

/// Total number of flash sectors on the part.
pub const SECTOR_COUNT: u32 = 256;

/// Boot tag meaning "image verified, jump to the application".
pub const TAG_RUN_APP: u32 = 0x5555_AAAA;

/// Boot tag meaning "stay in the bootloader".
///
/// All bits clear, so the application can program it over any previous
/// tag value without an erase (flash programming only clears bits).
pub const TAG_BOOT_REQUEST: u32 = 0x0000_0000;

/// Static flash map.
///
/// All addresses are absolute byte addresses into the flash device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashLayout {
    /// Erase granule in bytes. Must be a power of two.
    pub sector_size: u32,
    /// Base of the boot-tag sector.
    pub tag_addr: u32,
    /// Base of the application image; its vector table comes first.
    pub fw_addr: u32,
    /// Base of the version-record sector.
    pub version_addr: u32,
    /// First address past the updatable window.
    pub update_end: u32,
}

/// Layout of the A33G526 target: 256 KiB flash, 1 KiB sectors, with
/// the first 32 KiB reserved for the bootloader itself.
pub const A33G52X: FlashLayout = FlashLayout {
    sector_size: SECTOR_SIZE,
    tag_addr: 0x0000_8000,
    fw_addr: 0x0000_8400,
    version_addr: 0x0003_FC00,
    update_end: 0x0004_0000,
};

impl Default for FlashLayout {
    fn default() -> Self {
        A33G52X
    }
}

impl FlashLayout {
    /// Largest firmware image the map can hold.
    pub fn fw_max_len(&self) -> u32 {
        self.version_addr - self.fw_addr
    }

    /// Base address of the sector containing `addr`.
    pub fn sector_base(&self, addr: u32) -> u32 {
        addr & !(self.sector_size - 1)
    }

    /// Whether `[addr, addr + len)` lies entirely inside the updatable
    /// window. Rejects `len == 0` and ranges that wrap the address
    /// space.
    pub fn in_update_window(&self, addr: u32, len: u32) -> bool {
        if len == 0 || addr < self.tag_addr {
            return false;
        }
        match addr.checked_add(len) {
            Some(end) => end <= self.update_end,
            None => false,
        }
    }

    /// Base addresses of every sector overlapping `[addr, addr + len)`.
    ///
    /// Any overlap at all covers the whole sector; the erase operation
    /// built on this always wipes full sectors. Returns an empty
    /// iterator for `len == 0`.
    pub fn covered_sectors(&self, addr: u32, len: u32) -> impl Iterator<Item = u32> + use<> {
        let sector_size = self.sector_size;
        let range = if len == 0 {
            1..0 // empty
        } else {
            let first = addr / sector_size;
            let last = (addr + len - 1) / sector_size;
            first..last + 1
        };
        range.map(move |index| index * sector_size)
    }
}

/// Version record persisted in `VERSION_REGION`.
///
/// Wire/flash layout, 48 bytes little-endian:
///
/// ```text
/// offset  0: magic        u32   "A3FV"
/// offset  4: version      [u8; 32], NUL padded
/// offset 36: fw_length    u32
/// offset 40: fw_crc       u16   CRC-16/XMODEM over the firmware
/// offset 42: reserved     u16
/// offset 44: record_crc   u16   CRC-16/XMODEM over offsets 0..44
/// offset 46: padding      u16   keeps the record word aligned
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRecord {
    /// Human-readable firmware version, at most 32 bytes.
    pub version: String,
    /// Length in bytes of the verified firmware image.
    pub fw_length: u32,
    /// CRC-16/XMODEM over the first `fw_length` bytes of the firmware
    /// region.
    pub fw_crc: u16,
}

impl VersionRecord {
    /// Record magic, "A3FV" as little-endian bytes.
    pub const MAGIC: u32 = 0x5646_3341;

    /// Encoded record size in bytes. A multiple of the program word
    /// size so the record can be written without read-modify-write.
    pub const SIZE: usize = 48;

    /// Maximum version string length.
    pub const VERSION_LEN: usize = 32;

    /// Encode the record for flash programming.
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        LittleEndian::write_u32(&mut buf[0..4], Self::MAGIC);

        let version = self.version.as_bytes();
        let copy = version.len().min(Self::VERSION_LEN);
        buf[4..4 + copy].copy_from_slice(&version[..copy]);

        LittleEndian::write_u32(&mut buf[36..40], self.fw_length);
        LittleEndian::write_u16(&mut buf[40..42], self.fw_crc);
        // reserved stays zero
        let record_crc = crc16_xmodem(&buf[0..44]);
        LittleEndian::write_u16(&mut buf[44..46], record_crc);
        buf
    }

    /// Decode a record read back from flash.
    ///
    /// Returns `None` when the magic or the record CRC does not match;
    /// a record that fails here means the image is unverified no matter
    /// what the boot tag says.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        if LittleEndian::read_u32(&buf[0..4]) != Self::MAGIC {
            return None;
        }
        if LittleEndian::read_u16(&buf[44..46]) != crc16_xmodem(&buf[0..44]) {
            return None;
        }

        let version_bytes = &buf[4..36];
        let end = version_bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(Self::VERSION_LEN);
        let version = String::from_utf8_lossy(&version_bytes[..end]).into_owned();

        Some(Self {
            version,
            fw_length: LittleEndian::read_u32(&buf[36..40]),
            fw_crc: LittleEndian::read_u16(&buf[40..42]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_a33g52x_map_is_consistent() {
        let layout = A33G52X;
        assert_eq!(layout.fw_addr, layout.tag_addr + layout.sector_size);
        assert_eq!(layout.version_addr + layout.sector_size, layout.update_end);
        assert_eq!(layout.fw_max_len(), 0x0003_7800);
        assert_eq!(layout.update_end, SECTOR_COUNT * SECTOR_SIZE);
    }

    #[test]
    fn test_sector_base() {
        let layout = A33G52X;
        assert_eq!(layout.sector_base(0x8000), 0x8000);
        assert_eq!(layout.sector_base(0x83FF), 0x8000);
        assert_eq!(layout.sector_base(0x8400), 0x8400);
    }

    #[test]
    fn test_covered_sectors_any_overlap_counts() {
        let layout = A33G52X;

        // Exactly one sector.
        let one: Vec<u32> = layout.covered_sectors(0x8400, 1024).collect();
        assert_eq!(one, vec![0x8400]);

        // One byte into the next sector covers it whole.
        let two: Vec<u32> = layout.covered_sectors(0x8400, 1025).collect();
        assert_eq!(two, vec![0x8400, 0x8800]);

        // A one-byte range in the middle of a sector covers it.
        let mid: Vec<u32> = layout.covered_sectors(0x8601, 1).collect();
        assert_eq!(mid, vec![0x8400]);

        // Straddling a boundary covers both neighbors.
        let straddle: Vec<u32> = layout.covered_sectors(0x87FF, 2).collect();
        assert_eq!(straddle, vec![0x8400, 0x8800]);

        // Zero length covers nothing.
        assert_eq!(layout.covered_sectors(0x8400, 0).count(), 0);
    }

    #[test]
    fn test_update_window_bounds() {
        let layout = A33G52X;
        assert!(layout.in_update_window(0x8000, 4));
        assert!(layout.in_update_window(0x8400, layout.fw_max_len()));
        assert!(layout.in_update_window(layout.update_end - 4, 4));

        assert!(!layout.in_update_window(0x7FFF, 4)); // bootloader area
        assert!(!layout.in_update_window(0x0000, 16));
        assert!(!layout.in_update_window(layout.update_end - 4, 8));
        assert!(!layout.in_update_window(0x8400, 0));
        assert!(!layout.in_update_window(u32::MAX - 2, 8)); // wraparound
    }

    #[test]
    fn test_version_record_roundtrip() {
        let record = VersionRecord {
            version: "V230115R2".to_string(),
            fw_length: 0x1234,
            fw_crc: 0xBEEF,
        };
        let encoded = record.encode();
        assert_eq!(VersionRecord::decode(&encoded), Some(record));
    }

    #[test]
    fn test_version_record_rejects_bad_magic() {
        let mut encoded = VersionRecord {
            version: "V1".into(),
            fw_length: 64,
            fw_crc: 1,
        }
        .encode();
        encoded[0] ^= 0xFF;
        assert_eq!(VersionRecord::decode(&encoded), None);
    }

    #[test]
    fn test_version_record_rejects_corruption() {
        let mut encoded = VersionRecord {
            version: "V1".into(),
            fw_length: 64,
            fw_crc: 1,
        }
        .encode();
        encoded[38] ^= 0x01; // flip a bit inside fw_length
        assert_eq!(VersionRecord::decode(&encoded), None);
    }

    #[test]
    fn test_version_record_rejects_erased_flash() {
        assert_eq!(VersionRecord::decode(&[0xFF; VersionRecord::SIZE]), None);
        assert_eq!(VersionRecord::decode(&[0xFF; 10]), None);
    }

    #[test]
    fn test_version_string_truncated_to_field() {
        let record = VersionRecord {
            version: "X".repeat(100),
            fw_length: 4,
            fw_crc: 0,
        };
        let decoded = VersionRecord::decode(&record.encode()).unwrap();
        assert_eq!(decoded.version.len(), VersionRecord::VERSION_LEN);
    }
}
