//! In-memory duplex link between the updater client and a simulated
//! bootloader.
//!
//! Two SPSC rings back to back: the host end implements
//! `io::Read + io::Write` so [`crate::updater::Updater`] can drive it
//! like a serial port, the device end implements [`Transport`] for the
//! bootloader service. Both ends are `Send`, so tests can run the
//! bootloader loop on its own thread the way it runs alone on the
//! target.

use {
    crate::{
        device::Transport,
        ring::{self, Consumer, Producer},
    },
    std::{io, thread},
};

/// Ring capacity per direction. Must exceed one maximum frame; see
/// [`crate::ring`].
pub const PIPE_CAPACITY: usize = 2048;

/// Create a connected host/device pair.
pub fn pipe() -> (HostEnd, DeviceEnd) {
    let (host_tx, device_rx) = ring::channel::<PIPE_CAPACITY>();
    let (device_tx, host_rx) = ring::channel::<PIPE_CAPACITY>();
    (
        HostEnd {
            tx: host_tx,
            rx: host_rx,
        },
        DeviceEnd {
            tx: device_tx,
            rx: device_rx,
        },
    )
}

fn push_all(tx: &mut Producer<PIPE_CAPACITY>, buf: &[u8]) {
    for &byte in buf {
        let mut pending = byte;
        // The peer drains continuously; yield until a slot frees up.
        while let Err(b) = tx.push(pending) {
            pending = b;
            thread::yield_now();
        }
    }
}

/// Updater-facing end of the link.
pub struct HostEnd {
    tx: Producer<PIPE_CAPACITY>,
    rx: Consumer<PIPE_CAPACITY>,
}

impl io::Read for HostEnd {
    /// Non-blocking: returns `Ok(0)` when nothing is queued yet.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut n = 0;
        while n < buf.len() {
            match self.rx.pop() {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                },
                None => break,
            }
        }
        Ok(n)
    }
}

impl io::Write for HostEnd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        push_all(&mut self.tx, buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Bootloader-facing end of the link.
pub struct DeviceEnd {
    tx: Producer<PIPE_CAPACITY>,
    rx: Consumer<PIPE_CAPACITY>,
}

impl Transport for DeviceEnd {
    fn available(&self) -> usize {
        self.rx.len()
    }

    fn read_one(&mut self) -> Option<u8> {
        self.rx.pop()
    }

    fn write(&mut self, buf: &[u8]) -> usize {
        push_all(&mut self.tx, buf);
        buf.len()
    }
}
