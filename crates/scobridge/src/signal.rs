// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 scobridge contributors

//! Pipe-backed transport signal channel.
//!
//! The control plane (PCM open/close/drain/drop) and the dispatcher talk to
//! a transport I/O thread through this channel. It is a non-blocking pipe
//! carrying one byte per message, which gives the three properties the loop
//! relies on: FIFO delivery, the read end wakes `poll(2)`, and the loop can
//! consume exactly one message per iteration so a backlog drains over
//! successive wake-ups.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;

/// Messages understood by the transport I/O loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadSignal {
    /// No-op wake: forces reevaluation of the poll descriptor set.
    Ping = 0,
    /// A PCM client connected.
    PcmOpen = 1,
    /// A paused PCM client resumed.
    PcmResume = 2,
    /// A PCM client went away.
    PcmClose = 3,
    /// The speaker client asked to drain buffered playback.
    PcmSync = 4,
    /// The speaker client asked to drop buffered playback.
    PcmDrop = 5,
    /// Tear the I/O thread down. Delivered only while the loop is parked
    /// in poll, so mid-iteration work always runs to completion.
    Quit = 6,
}

impl ThreadSignal {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Ping),
            1 => Some(Self::PcmOpen),
            2 => Some(Self::PcmResume),
            3 => Some(Self::PcmClose),
            4 => Some(Self::PcmSync),
            5 => Some(Self::PcmDrop),
            6 => Some(Self::Quit),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct Pipe {
    rx: RawFd,
    tx: RawFd,
}

impl Drop for Pipe {
    fn drop(&mut self) {
        // SAFETY: both descriptors come from pipe2 and are closed once.
        unsafe {
            libc::close(self.rx);
            libc::close(self.tx);
        }
    }
}

/// Receiving half owned by the transport I/O thread.
#[derive(Debug)]
pub struct SignalChannel {
    pipe: Arc<Pipe>,
}

/// Cloneable sending half handed to PCM endpoints and the dispatcher.
#[derive(Debug, Clone)]
pub struct SignalSender {
    pipe: Arc<Pipe>,
}

impl SignalChannel {
    /// Create a channel. Both ends are non-blocking; a full pipe surfaces
    /// as an error to the sender instead of stalling the control plane.
    pub fn new() -> io::Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: fds points to a 2-element array as pipe2 requires.
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            pipe: Arc::new(Pipe {
                rx: fds[0],
                tx: fds[1],
            }),
        })
    }

    /// A new sending handle for this channel.
    #[must_use]
    pub fn sender(&self) -> SignalSender {
        SignalSender {
            pipe: Arc::clone(&self.pipe),
        }
    }

    /// Descriptor for the poll set (readable when a message is pending).
    #[must_use]
    pub fn as_raw_fd(&self) -> RawFd {
        self.pipe.rx
    }

    /// Consume one pending message, if any.
    pub fn recv(&self) -> Option<ThreadSignal> {
        let mut byte = 0u8;
        loop {
            // SAFETY: byte is a valid 1-byte destination for read.
            let ret = unsafe { libc::read(self.pipe.rx, std::ptr::addr_of_mut!(byte).cast(), 1) };
            if ret == 1 {
                let sig = ThreadSignal::from_byte(byte);
                if sig.is_none() {
                    log::warn!("[signal] dropping unknown signal byte {:#04x}", byte);
                }
                return sig;
            }
            if ret == 0 {
                return None;
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => return None,
                _ => {
                    log::error!("[signal] recv failed: {}", err);
                    return None;
                }
            }
        }
    }
}

impl SignalSender {
    /// Enqueue one message. Wakes the owning loop's poll.
    pub fn send(&self, signal: ThreadSignal) -> io::Result<()> {
        let byte = signal as u8;
        loop {
            // SAFETY: byte is a valid 1-byte source for write.
            let ret = unsafe { libc::write(self.pipe.tx, std::ptr::addr_of!(byte).cast(), 1) };
            if ret == 1 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
    }
}
