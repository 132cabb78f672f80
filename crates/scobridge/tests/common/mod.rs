// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 scobridge contributors

//! Shared plumbing for the transport loop scenarios: socketpairs standing
//! in for SCO links, pipes standing in for PCM FIFOs, and deadline-bounded
//! readers so a broken loop fails the test instead of hanging it.

use std::io;
use std::os::unix::io::{FromRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

/// A connected stream socketpair; one end plays the SCO link, the other
/// the remote device.
pub fn socketpair() -> (OwnedFd, OwnedFd) {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: fds points to a 2-element array as socketpair requires.
    let ret = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        )
    };
    assert_eq!(ret, 0, "socketpair failed: {}", io::Error::last_os_error());
    // SAFETY: both descriptors are fresh and owned by us.
    unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
}

/// A pipe standing in for a client PCM FIFO.
pub fn pipe() -> (OwnedFd, OwnedFd) {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: fds points to a 2-element array as pipe2 requires.
    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    assert_eq!(ret, 0, "pipe2 failed: {}", io::Error::last_os_error());
    // SAFETY: both descriptors are fresh and owned by us.
    unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
}

/// Write the whole buffer, panicking on failure.
pub fn write_all(fd: RawFd, mut data: &[u8]) {
    while !data.is_empty() {
        // SAFETY: data is a live source of the given length.
        let ret = unsafe { libc::write(fd, data.as_ptr().cast(), data.len()) };
        assert!(ret > 0, "write failed: {}", io::Error::last_os_error());
        data = &data[ret as usize..];
    }
}

/// Read until `expected` bytes arrived, end-of-stream, or the deadline.
pub fn read_up_to(fd: RawFd, expected: usize, timeout: Duration) -> Vec<u8> {
    let deadline = Instant::now() + timeout;
    let mut collected = Vec::with_capacity(expected);
    let mut buf = [0u8; 4096];

    while collected.len() < expected {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: pfd points to a stack-allocated pollfd.
        let ready = unsafe { libc::poll(&mut pfd, 1, remaining.as_millis() as i32) };
        if ready <= 0 {
            continue;
        }
        // SAFETY: buf is a live destination of the given length.
        let ret = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if ret == 0 {
            break; // end of stream
        }
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            panic!("read failed: {}", err);
        }
        collected.extend_from_slice(&buf[..ret as usize]);
    }
    collected
}

/// Wait until `predicate` holds, polling every few milliseconds.
pub fn wait_for(timeout: Duration, predicate: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    predicate()
}
