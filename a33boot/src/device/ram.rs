//! In-memory NOR flash simulator.
//!
//! Faithful to the properties the dispatcher depends on: erase fills a
//! whole sector with 0xFF, and programming can only clear bits. A
//! write over unerased cells therefore corrupts data here exactly as it
//! would on the part, which is what the erase-before-write tests lean
//! on. Hardware failures can be injected per address to exercise the
//! error replies.

use crate::device::{FlashDevice, FlashError};

/// Simulated NOR flash.
#[derive(Debug, Clone)]
pub struct RamFlash {
    mem: Vec<u8>,
    sector_size: u32,
    fail_erase_at: Option<u32>,
    fail_program_at: Option<u32>,
}

impl RamFlash {
    /// Create a blank (all 0xFF) device.
    pub fn new(size: usize, sector_size: u32) -> Self {
        assert!(sector_size.is_power_of_two());
        assert_eq!(size % sector_size as usize, 0);
        Self {
            mem: vec![0xFF; size],
            sector_size,
            fail_erase_at: None,
            fail_program_at: None,
        }
    }

    /// Blank device with the A33G52x geometry: 256 KiB, 1 KiB sectors.
    pub fn a33g52x() -> Self {
        Self::new(
            (crate::layout::SECTOR_COUNT * crate::layout::SECTOR_SIZE) as usize,
            crate::layout::SECTOR_SIZE,
        )
    }

    /// Make the next erase of the sector at `addr` report a hardware
    /// failure (and leave the sector unchanged).
    #[must_use]
    pub fn fail_erase_at(mut self, addr: u32) -> Self {
        self.fail_erase_at = Some(addr);
        self
    }

    /// Make any program of the word at `addr` report a hardware
    /// failure.
    #[must_use]
    pub fn fail_program_at(mut self, addr: u32) -> Self {
        self.fail_program_at = Some(addr);
        self
    }

    /// Device size in bytes.
    pub fn size(&self) -> usize {
        self.mem.len()
    }

    /// Copy of the full flash contents, for pre/post comparisons in
    /// tests.
    pub fn snapshot(&self) -> Vec<u8> {
        self.mem.clone()
    }

    fn check_range(&self, addr: u32, len: u32) -> Result<(), FlashError> {
        let end = addr
            .checked_add(len)
            .ok_or(FlashError::OutOfRange { addr, len })?;
        if end as usize > self.mem.len() {
            return Err(FlashError::OutOfRange { addr, len });
        }
        Ok(())
    }
}

impl FlashDevice for RamFlash {
    fn erase_sector(&mut self, addr: u32) -> Result<(), FlashError> {
        debug_assert_eq!(addr % self.sector_size, 0, "unaligned sector erase");
        self.check_range(addr, self.sector_size)
            .map_err(|_| FlashError::Erase { addr })?;
        if self.fail_erase_at == Some(addr) {
            return Err(FlashError::Erase { addr });
        }
        let start = addr as usize;
        self.mem[start..start + self.sector_size as usize].fill(0xFF);
        Ok(())
    }

    fn program_word(&mut self, addr: u32, word: u32) -> Result<(), FlashError> {
        debug_assert_eq!(addr % 4, 0, "unaligned word program");
        self.check_range(addr, 4)
            .map_err(|_| FlashError::Program { addr })?;
        if self.fail_program_at == Some(addr) {
            return Err(FlashError::Program { addr });
        }
        // NOR programming clears bits and never sets them.
        let bytes = word.to_le_bytes();
        let start = addr as usize;
        for (cell, byte) in self.mem[start..start + 4].iter_mut().zip(bytes) {
            *cell &= byte;
        }
        Ok(())
    }

    fn read_bytes(&self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        self.check_range(addr, buf.len() as u32)?;
        let start = addr as usize;
        buf.copy_from_slice(&self.mem[start..start + buf.len()]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_blank() {
        let flash = RamFlash::a33g52x();
        let mut buf = [0u8; 16];
        flash.read_bytes(0x8000, &mut buf).unwrap();
        assert_eq!(buf, [0xFF; 16]);
    }

    #[test]
    fn test_program_and_read_back() {
        let mut flash = RamFlash::a33g52x();
        flash.program_word(0x8400, 0x4433_2211).unwrap();
        let mut buf = [0u8; 4];
        flash.read_bytes(0x8400, &mut buf).unwrap();
        assert_eq!(buf, [0x11, 0x22, 0x33, 0x44]);
    }

    #[test]
    fn test_program_only_clears_bits() {
        let mut flash = RamFlash::a33g52x();
        flash.program_word(0x8400, 0x0000_00F0).unwrap();
        // Second program without erase cannot set bits back.
        flash.program_word(0x8400, 0x0000_000F).unwrap();
        let mut buf = [0u8; 4];
        flash.read_bytes(0x8400, &mut buf).unwrap();
        assert_eq!(buf[0], 0x00);
    }

    #[test]
    fn test_erase_restores_blank_state() {
        let mut flash = RamFlash::a33g52x();
        flash.program_word(0x8400, 0).unwrap();
        flash.erase_sector(0x8400).unwrap();
        let mut buf = [0u8; 4];
        flash.read_bytes(0x8400, &mut buf).unwrap();
        assert_eq!(buf, [0xFF; 4]);
    }

    #[test]
    fn test_out_of_range_rejected() {
        let mut flash = RamFlash::new(4096, 1024);
        assert!(matches!(
            flash.program_word(4096, 0),
            Err(FlashError::Program { .. })
        ));
        let mut buf = [0u8; 8];
        assert!(matches!(
            flash.read_bytes(4092, &mut buf),
            Err(FlashError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_injected_failures() {
        let mut flash = RamFlash::a33g52x()
            .fail_erase_at(0x8800)
            .fail_program_at(0x8404);
        assert!(flash.erase_sector(0x8400).is_ok());
        assert_eq!(
            flash.erase_sector(0x8800),
            Err(FlashError::Erase { addr: 0x8800 })
        );
        assert_eq!(
            flash.program_word(0x8404, 0),
            Err(FlashError::Program { addr: 0x8404 })
        );
    }
}
