//! CRC-16/XMODEM checksum.
//!
//! Polynomial 0x1021, initial value 0x0000, no reflection, no final XOR.
//! This is the checksum used for both frame trailers and firmware image
//! CRCs, on the bootloader and the updater side alike.

/// Compute the CRC-16/XMODEM checksum of `data`.
#[must_use]
pub fn crc16_xmodem(data: &[u8]) -> u16 {
    crc16_xmodem_update(0, data)
}

/// Continue a CRC-16/XMODEM computation from a previous value.
///
/// Lets callers checksum a large flash region in small read chunks
/// without buffering the whole region.
#[must_use]
pub fn crc16_xmodem_update(mut crc: u16, data: &[u8]) -> u16 {
    for &byte in data {
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}
