// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 scobridge contributors

//! SCO socket layer.
//!
//! Wraps the BlueZ kernel ABI for synchronous connection-oriented links:
//! listening socket setup (with deferred link setup for wideband builds),
//! accept with peer address extraction, the transparent-voice option and
//! the MTU query. Everything here is plain blocking socket plumbing; the
//! dispatcher gates `accept` behind `poll`.

use crate::config;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// A Bluetooth device address, stored in display order
/// (`AA:BB:CC:DD:EE:FF` keeps byte `AA` first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BdAddr(pub [u8; 6]);

impl BdAddr {
    /// The any-adapter wildcard address.
    pub const ANY: BdAddr = BdAddr([0; 6]);

    /// Kernel byte order (reversed) for `sockaddr` structures.
    fn to_kernel(self) -> [u8; 6] {
        let mut b = self.0;
        b.reverse();
        b
    }

    fn from_kernel(bytes: [u8; 6]) -> Self {
        let mut b = bytes;
        b.reverse();
        BdAddr(b)
    }
}

impl std::fmt::Display for BdAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let a = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            a[0], a[1], a[2], a[3], a[4], a[5]
        )
    }
}

/// `struct sockaddr_sco` from the BlueZ kernel headers. Written for the
/// kernel, read back only on accept.
#[repr(C)]
#[allow(dead_code)]
struct SockaddrSco {
    sco_family: libc::sa_family_t,
    sco_bdaddr: [u8; 6],
}

fn sco_sockaddr(addr: BdAddr) -> SockAddr {
    // SAFETY: sockaddr_storage is plain data; all-zero is a valid value.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    // SAFETY: SockaddrSco fits inside sockaddr_storage and has no padding
    // requirements beyond what zeroing satisfies.
    unsafe {
        let sa = std::ptr::addr_of_mut!(storage).cast::<SockaddrSco>();
        (*sa).sco_family = libc::AF_BLUETOOTH as libc::sa_family_t;
        (*sa).sco_bdaddr = addr.to_kernel();
    }
    // SAFETY: storage was populated above with a valid sockaddr_sco at the
    // given length.
    unsafe { SockAddr::new(storage, mem::size_of::<SockaddrSco>() as libc::socklen_t) }
}

/// Listening SCO socket bound to one adapter.
#[derive(Debug)]
pub struct ScoListener {
    socket: Socket,
}

impl ScoListener {
    /// Open a SCO socket and bind it to the adapter address.
    pub fn bind(adapter: BdAddr) -> io::Result<Self> {
        let socket = Socket::new(
            Domain::from(libc::AF_BLUETOOTH),
            Type::SEQPACKET,
            Some(Protocol::from(config::BTPROTO_SCO)),
        )?;
        socket.bind(&sco_sockaddr(adapter))?;
        Ok(Self { socket })
    }

    /// Ask the kernel to defer link setup until voice parameters are
    /// configured on the accepted socket.
    pub fn enable_deferred_setup(&self) -> io::Result<()> {
        let defer: u32 = 1;
        setsockopt(
            self.socket.as_raw_fd(),
            config::SOL_BLUETOOTH,
            config::BT_DEFER_SETUP,
            &defer,
        )
    }

    /// Start listening for inbound links.
    pub fn listen(&self) -> io::Result<()> {
        self.socket.listen(config::SCO_LISTEN_BACKLOG)
    }

    /// Descriptor for the dispatcher poll.
    #[must_use]
    pub fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    /// Accept one inbound link, returning the connected socket and the
    /// remote device address. Call only after poll reported readability.
    pub fn accept(&self) -> io::Result<(OwnedFd, BdAddr)> {
        // SAFETY: sockaddr_sco is plain data; all-zero is a valid value.
        let mut addr: SockaddrSco = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<SockaddrSco>() as libc::socklen_t;
        loop {
            // SAFETY: addr/len describe a valid sockaddr_sco destination.
            let fd = unsafe {
                libc::accept(
                    self.socket.as_raw_fd(),
                    std::ptr::addr_of_mut!(addr).cast(),
                    &mut len,
                )
            };
            if fd >= 0 {
                // SAFETY: fd is a fresh descriptor we now own.
                let owned = unsafe { OwnedFd::from_raw_fd(fd) };
                return Ok((owned, BdAddr::from_kernel(addr.sco_bdaddr)));
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
    }
}

/// Route the link payload transparently (no in-chip voice processing).
/// Required before completing deferred setup of an mSBC link.
pub fn set_transparent_voice(fd: RawFd) -> io::Result<()> {
    let setting: u16 = config::BT_VOICE_TRANSPARENT;
    setsockopt(fd, config::SOL_BLUETOOTH, config::BT_VOICE, &setting)
}

/// Complete deferred setup by reading a single byte from the accepted
/// socket; the kernel establishes the link as a side effect. Both a
/// zero-length and a one-byte result indicate success.
pub fn complete_deferred_setup(fd: RawFd) -> io::Result<()> {
    let mut byte = 0u8;
    loop {
        // SAFETY: byte is a valid 1-byte read destination.
        let ret = unsafe { libc::read(fd, std::ptr::addr_of_mut!(byte).cast(), 1) };
        if ret >= 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            continue;
        }
        return Err(err);
    }
}

/// `struct sco_options` from the BlueZ kernel headers.
#[repr(C)]
struct ScoOptions {
    mtu: u16,
}

/// SCO MTU of a connected socket. Honors the `SCOBRIDGE_SCO_MTU`
/// override for adapters that misreport; falls back to 48 bytes (the
/// USB default alternate setting) when the kernel query fails.
#[must_use]
pub fn mtu(fd: RawFd) -> usize {
    if let Ok(value) = std::env::var(config::ENV_SCO_MTU) {
        if let Ok(mtu) = value.parse::<usize>() {
            if mtu > 0 {
                return mtu;
            }
        }
        log::warn!("[sco] ignoring unparsable {}", config::ENV_SCO_MTU);
    }

    let mut opts = ScoOptions { mtu: 0 };
    let mut len = mem::size_of::<ScoOptions>() as libc::socklen_t;
    // SAFETY: opts/len describe a valid sco_options destination.
    let ret = unsafe {
        libc::getsockopt(
            fd,
            config::SOL_SCO,
            config::SCO_OPTIONS,
            std::ptr::addr_of_mut!(opts).cast(),
            &mut len,
        )
    };
    if ret < 0 || opts.mtu == 0 {
        log::debug!(
            "[sco] MTU query failed ({}), assuming {}",
            io::Error::last_os_error(),
            config::SCO_MTU_FALLBACK
        );
        return config::SCO_MTU_FALLBACK;
    }
    usize::from(opts.mtu)
}

fn setsockopt<T>(fd: RawFd, level: libc::c_int, option: libc::c_int, value: &T) -> io::Result<()> {
    // SAFETY: value points to a live T for the duration of the call and
    // the length matches.
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            option,
            std::ptr::from_ref(value).cast(),
            mem::size_of::<T>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
