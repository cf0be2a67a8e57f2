//! Boot decision engine.
//!
//! Runs once per reset, before any peripheral beyond the flash readout
//! is touched, and decides between jumping to the application and
//! staying resident for an update. Every check that cannot positively
//! prove a valid image resolves to staying resident; nothing in here
//! ever errors toward "jump anyway".
//!
//! The decision is a pure function of the override input and the flash
//! contents. It is recomputed in full on every call and never cached,
//! so a decision taken after an update always sees the updated flash.

use {
    crate::{
        device::{FlashDevice, FlashError},
        layout::{FlashLayout, TAG_BOOT_REQUEST, TAG_RUN_APP, VersionRecord},
        protocol::crc::crc16_xmodem_update,
    },
    byteorder::{ByteOrder, LittleEndian},
    log::{debug, info},
};

/// Outcome of the boot decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootPath {
    /// Relocate the vector table to `vector_base`, load the stack
    /// pointer from the application's vector table and transfer control
    /// to its reset handler. Irreversible within this power cycle.
    Jump {
        /// Base of the application vector table.
        vector_base: u32,
    },
    /// Stay in the bootloader command loop until the next reset.
    StayResident(StayReason),
}

/// Why the engine chose to stay resident.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StayReason {
    /// The operator override input was asserted at reset.
    Override,
    /// The boot tag was programmed to the explicit stay-resident value.
    BootRequested,
    /// The boot tag is erased, unreadable or holds an unknown value.
    TagNotSet,
    /// No valid version record in flash; the image is unverified.
    NoVersionRecord,
    /// The recorded firmware length is zero or exceeds the firmware
    /// region.
    BadLength,
    /// The recomputed firmware CRC does not match the recorded one.
    CrcMismatch,
}

/// Recompute the CRC-16/XMODEM of the first `len` bytes of the
/// firmware region, reading the flash in small chunks.
pub fn firmware_crc<F: FlashDevice>(
    flash: &F,
    layout: &FlashLayout,
    len: u32,
) -> Result<u16, FlashError> {
    let mut crc = 0u16;
    let mut buf = [0u8; 256];
    let mut offset = 0u32;
    while offset < len {
        let chunk = (len - offset).min(buf.len() as u32) as usize;
        flash.read_bytes(layout.fw_addr + offset, &mut buf[..chunk])?;
        crc = crc16_xmodem_update(crc, &buf[..chunk]);
        offset += chunk as u32;
    }
    Ok(crc)
}

/// Decide the boot path.
///
/// Check order: override input, boot tag, version record, recomputed
/// firmware CRC. The first failing check wins.
pub fn decide<F: FlashDevice>(
    flash: &F,
    layout: &FlashLayout,
    override_asserted: bool,
) -> BootPath {
    if override_asserted {
        info!("override input asserted, staying resident");
        return BootPath::StayResident(StayReason::Override);
    }

    let mut tag_bytes = [0u8; 4];
    if flash.read_bytes(layout.tag_addr, &mut tag_bytes).is_err() {
        return BootPath::StayResident(StayReason::TagNotSet);
    }
    match LittleEndian::read_u32(&tag_bytes) {
        TAG_RUN_APP => {},
        TAG_BOOT_REQUEST => {
            info!("boot tag requests the bootloader, staying resident");
            return BootPath::StayResident(StayReason::BootRequested);
        },
        other => {
            debug!("boot tag {other:#010x} not set, staying resident");
            return BootPath::StayResident(StayReason::TagNotSet);
        },
    }

    let mut record_bytes = [0u8; VersionRecord::SIZE];
    if flash
        .read_bytes(layout.version_addr, &mut record_bytes)
        .is_err()
    {
        return BootPath::StayResident(StayReason::NoVersionRecord);
    }
    let Some(record) = VersionRecord::decode(&record_bytes) else {
        debug!("version record invalid, staying resident");
        return BootPath::StayResident(StayReason::NoVersionRecord);
    };

    if record.fw_length == 0 || record.fw_length > layout.fw_max_len() {
        debug!(
            "recorded firmware length {:#x} out of range, staying resident",
            record.fw_length
        );
        return BootPath::StayResident(StayReason::BadLength);
    }

    match firmware_crc(flash, layout, record.fw_length) {
        Ok(crc) if crc == record.fw_crc => {
            info!(
                "firmware {} valid ({} bytes, CRC {crc:#06x}), jumping",
                record.version, record.fw_length
            );
            BootPath::Jump {
                vector_base: layout.fw_addr,
            }
        },
        Ok(crc) => {
            debug!(
                "firmware CRC mismatch: recorded {:#06x}, computed {crc:#06x}",
                record.fw_crc
            );
            BootPath::StayResident(StayReason::CrcMismatch)
        },
        Err(_) => BootPath::StayResident(StayReason::CrcMismatch),
    }
}
