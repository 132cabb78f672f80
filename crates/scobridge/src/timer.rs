// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 scobridge contributors

//! One-shot monotonic timer.
//!
//! Thin wrapper around a Linux `timerfd`, pollable alongside the transport
//! descriptors. One timer per transport drives the drain, linger and close
//! windows of the lifecycle state machine; arming replaces any pending
//! expiry, so the state machine never has to track more than one deadline.

use std::io;
use std::os::unix::io::RawFd;

/// Pollable one-shot timer backed by `CLOCK_MONOTONIC`.
#[derive(Debug)]
pub struct OneShotTimer {
    fd: RawFd,
}

impl OneShotTimer {
    /// Create a disarmed timer.
    pub fn new() -> io::Result<Self> {
        // SAFETY: timerfd_create is invoked with valid clock and flag
        // arguments and no shared state.
        let fd = unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd })
    }

    /// Arm the timer to expire once, `ms` milliseconds from now. Replaces
    /// any pending expiry. `ms` must be non-zero (zero disarms a timerfd).
    pub fn start(&self, ms: u64) -> io::Result<()> {
        debug_assert!(ms > 0, "zero would disarm the timer");
        // Seconds and nanoseconds are split separately; folding the whole
        // value into tv_nsec would wrap for expiries of one second or more.
        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: (ms / 1000) as libc::time_t,
                tv_nsec: ((ms % 1000) * 1_000_000) as libc::c_long,
            },
        };
        self.settime(&spec)
    }

    /// Disarm the timer, discarding any pending expiry.
    pub fn cancel(&self) -> io::Result<()> {
        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
        };
        self.settime(&spec)
    }

    /// Consume an expiry after poll reported the descriptor readable.
    /// Returns the expiration count (always 1 for a one-shot timer).
    pub fn acknowledge(&self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        loop {
            // SAFETY: buf is a stack buffer sized to the 8-byte expiration
            // counter the kernel delivers.
            let ret = unsafe { libc::read(self.fd, buf.as_mut_ptr().cast(), buf.len()) };
            if ret == 8 {
                return Ok(u64::from_ne_bytes(buf));
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
    }

    /// Raw descriptor for the poll set.
    #[must_use]
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }

    fn settime(&self, spec: &libc::itimerspec) -> io::Result<()> {
        // SAFETY: fd is a live timerfd owned by self; spec points to a
        // stack-allocated itimerspec.
        let ret = unsafe { libc::timerfd_settime(self.fd, 0, spec, std::ptr::null_mut()) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for OneShotTimer {
    fn drop(&mut self) {
        // SAFETY: fd was obtained from timerfd_create and is closed once.
        unsafe {
            libc::close(self.fd);
        }
    }
}
