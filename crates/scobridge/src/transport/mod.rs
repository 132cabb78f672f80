// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 scobridge contributors

//! Transport and PCM endpoint model.
//!
//! A [`Transport`] is one bidirectional audio endpoint to a remote device.
//! It owns the SCO descriptor (moved in by the dispatcher through
//! [`Transport::attach`], cleared by [`Transport::release`]), the two
//! client-facing [`PcmEndpoint`]s, the lifecycle state, the signal channel
//! into its I/O thread and the one-shot lifecycle timer.
//!
//! Locking is deliberately narrow: one mutex serializes `attach`/`release`
//! (the only two mutators of the SCO descriptor) and is never held across
//! poll or blocking I/O. Everything the I/O loop reads per iteration
//! (descriptor, MTU, codec, state) is atomic, so the loop tolerates the
//! link being released underneath it mid-iteration.

pub mod io_loop;

pub use io_loop::ScoIoHandle;

use crate::codec::CodecKind;
use crate::sco;
use crate::signal::{SignalChannel, SignalSender, ThreadSignal};
use crate::timer::OneShotTimer;
use parking_lot::{Condvar, Mutex};
use std::io;
use std::os::unix::io::{IntoRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Profile membership bitmask of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportProfile(pub u16);

impl TransportProfile {
    /// Hands-Free unit side of HFP.
    pub const HFP_HF: TransportProfile = TransportProfile(0x01);
    /// Audio Gateway side of HFP.
    pub const HFP_AG: TransportProfile = TransportProfile(0x02);
    /// Headset side of HSP.
    pub const HSP_HS: TransportProfile = TransportProfile(0x04);
    /// Audio Gateway side of HSP.
    pub const HSP_AG: TransportProfile = TransportProfile(0x08);

    /// Whether this transport plays the audio gateway role. Gateways
    /// release idle SCO links to free Bluetooth bandwidth; the remote
    /// headset keeps streaming its microphone even when nobody listens.
    #[must_use]
    pub fn is_gateway(self) -> bool {
        self.0 & (Self::HFP_AG.0 | Self::HSP_AG.0) != 0
    }
}

/// Lifecycle state of the SCO side of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ScoState {
    /// No activity; no timer armed.
    Idle = 0,
    /// Audio is (potentially) moving.
    Running = 1,
    /// A drain was requested; the drain timer is armed.
    Draining = 2,
    /// All PCM clients left an audio gateway; the linger timer is armed.
    Linger = 3,
    /// The link was just released; the close timer is armed.
    Closing = 4,
}

impl ScoState {
    fn from_u8(v: u8) -> ScoState {
        match v {
            1 => ScoState::Running,
            2 => ScoState::Draining,
            3 => ScoState::Linger,
            4 => ScoState::Closing,
            _ => ScoState::Idle,
        }
    }
}

/// Client-facing PCM FIFO, speaker or microphone side.
///
/// The descriptor is owned here (-1 when no client is connected) and
/// exchanged atomically; the transport I/O thread is the only reader and
/// writer of audio data, the control plane connects and disconnects.
#[derive(Debug)]
pub struct PcmEndpoint {
    fd: AtomicI32,
    sampling: AtomicU32,
    /// Reported processing delay, in 100-microsecond units.
    delay: AtomicU32,
    signal: SignalSender,
    /// Drain generation counter; bumped each time a drain completes.
    synced: Mutex<u64>,
    synced_cond: Condvar,
}

impl PcmEndpoint {
    fn new(signal: SignalSender) -> Self {
        Self {
            fd: AtomicI32::new(-1),
            sampling: AtomicU32::new(0),
            delay: AtomicU32::new(0),
            signal,
            synced: Mutex::new(0),
            synced_cond: Condvar::new(),
        }
    }

    /// Connect a client FIFO at the given sampling rate. The descriptor
    /// is switched to non-blocking and any previous client is dropped.
    /// Wakes the I/O loop with `PcmOpen`.
    pub fn connect(&self, fd: OwnedFd, sampling: u32) -> io::Result<()> {
        let raw = fd.into_raw_fd();
        // SAFETY: raw is a live descriptor we own; O_NONBLOCK via fcntl.
        unsafe {
            let flags = libc::fcntl(raw, libc::F_GETFL);
            if flags < 0 || libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
                let err = io::Error::last_os_error();
                libc::close(raw);
                return Err(err);
            }
        }
        self.sampling.store(sampling, Ordering::Relaxed);
        let prev = self.fd.swap(raw, Ordering::AcqRel);
        if prev >= 0 {
            // SAFETY: prev was owned by this endpoint.
            unsafe { libc::close(prev) };
        }
        self.signal.send(ThreadSignal::PcmOpen)
    }

    /// Wake the I/O loop after a client pause.
    pub fn resume(&self) -> io::Result<()> {
        self.signal.send(ThreadSignal::PcmResume)
    }

    /// Close the client descriptor, if any. Does not signal on its own;
    /// callers pair this with `PcmClose` (see [`disconnect`]).
    ///
    /// [`disconnect`]: PcmEndpoint::disconnect
    pub fn release(&self) {
        let fd = self.fd.swap(-1, Ordering::AcqRel);
        if fd >= 0 {
            // SAFETY: fd was owned by this endpoint.
            unsafe { libc::close(fd) };
        }
    }

    /// Control-plane disconnect: close the descriptor and notify the
    /// I/O loop.
    pub fn disconnect(&self) {
        self.release();
        if let Err(err) = self.signal.send(ThreadSignal::PcmClose) {
            log::error!("[sco] close notification failed: {}", err);
        }
    }

    /// Whether no client is connected.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.fd.load(Ordering::Acquire) < 0
    }

    /// Client sampling rate in Hz (0 before the first connect).
    #[must_use]
    pub fn sampling(&self) -> u32 {
        self.sampling.load(Ordering::Relaxed)
    }

    /// Reported processing delay, in 100-microsecond units.
    #[must_use]
    pub fn delay(&self) -> u32 {
        self.delay.load(Ordering::Relaxed)
    }

    /// Request a drain and wait for the I/O loop to confirm it. Returns
    /// false when the confirmation did not arrive within `timeout`.
    pub fn drain(&self, timeout: Duration) -> io::Result<bool> {
        let mut generation = self.synced.lock();
        let observed = *generation;
        self.signal.send(ThreadSignal::PcmSync)?;
        let deadline = std::time::Instant::now() + timeout;
        while *generation == observed {
            if self
                .synced_cond
                .wait_until(&mut generation, deadline)
                .timed_out()
            {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Ask the I/O loop to throw away buffered playback.
    pub fn drop_pending(&self) -> io::Result<()> {
        self.signal.send(ThreadSignal::PcmDrop)
    }

    /// Read and discard everything currently buffered in the FIFO.
    pub fn flush(&self) {
        let fd = self.fd.load(Ordering::Acquire);
        if fd < 0 {
            return;
        }
        let mut scratch = [0u8; 512];
        loop {
            // SAFETY: scratch is a live destination of the given length.
            let ret = unsafe { libc::read(fd, scratch.as_mut_ptr().cast(), scratch.len()) };
            if ret <= 0 {
                let err = io::Error::last_os_error();
                if ret < 0 && err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return;
            }
        }
    }

    pub(crate) fn set_delay(&self, delay: u32) {
        self.delay.store(delay, Ordering::Relaxed);
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.fd.load(Ordering::Acquire)
    }

    pub(crate) fn send_signal(&self, signal: ThreadSignal) -> io::Result<()> {
        self.signal.send(signal)
    }

    /// Bump the drain generation and wake waiters. Called by the I/O
    /// loop when the drain window elapses.
    pub(crate) fn signal_synced(&self) {
        let mut generation = self.synced.lock();
        *generation += 1;
        self.synced_cond.notify_all();
    }

    /// Read up to `buf.len()` bytes of 16-bit PCM from the client FIFO.
    /// The length is capped to whole samples. `Ok(0)` is client
    /// end-of-stream.
    pub(crate) fn read_bytes(&self, buf: &mut [u8]) -> io::Result<usize> {
        let fd = self.fd.load(Ordering::Acquire);
        if fd < 0 {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        }
        let len = buf.len() & !1;
        if len == 0 {
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }
        loop {
            // SAFETY: buf is a live destination of the given length.
            let ret = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), len) };
            if ret >= 0 {
                return Ok(ret as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
    }

    /// Write up to `buf.len()` bytes of 16-bit PCM to the client FIFO.
    /// `Ok(0)` is client end-of-stream.
    pub(crate) fn write_bytes(&self, buf: &[u8]) -> io::Result<usize> {
        let fd = self.fd.load(Ordering::Acquire);
        if fd < 0 {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        }
        let len = buf.len() & !1;
        if len == 0 {
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }
        loop {
            // SAFETY: buf is a live source of the given length.
            let ret = unsafe { libc::write(fd, buf.as_ptr().cast(), len) };
            if ret >= 0 {
                return Ok(ret as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
    }
}

impl Drop for PcmEndpoint {
    fn drop(&mut self) {
        self.release();
    }
}

/// One bidirectional audio endpoint to a remote device.
pub struct Transport {
    profile: TransportProfile,
    codec: AtomicU8,
    /// SCO descriptor; -1 exactly when no link is live.
    bt_fd: AtomicI32,
    /// SCO MTU (read and write are equal), refreshed on every attach.
    mtu: AtomicUsize,
    state: AtomicU8,
    /// Serializes `attach` and `release`, the only mutators of `bt_fd`.
    link_lock: Mutex<()>,
    /// Control-plane detach hook, run once per released link.
    on_release: Box<dyn Fn() + Send + Sync>,
    signal: SignalChannel,
    timer: OneShotTimer,
    /// Playback side: remote hears this.
    pub spk_pcm: PcmEndpoint,
    /// Capture side: remote microphone lands here.
    pub mic_pcm: PcmEndpoint,
}

impl Transport {
    /// Create a transport with a no-op detach hook.
    pub fn new(profile: TransportProfile, codec: CodecKind) -> crate::Result<Arc<Self>> {
        Self::with_release_hook(profile, codec, || {})
    }

    /// Create a transport whose `hook` runs each time a live SCO link is
    /// released (the control plane uses this to detach the link through
    /// its RPC layer and emit property updates).
    pub fn with_release_hook(
        profile: TransportProfile,
        codec: CodecKind,
        hook: impl Fn() + Send + Sync + 'static,
    ) -> crate::Result<Arc<Self>> {
        let signal = SignalChannel::new().map_err(crate::Error::Signal)?;
        let timer = OneShotTimer::new().map_err(crate::Error::Timer)?;
        let spk_pcm = PcmEndpoint::new(signal.sender());
        let mic_pcm = PcmEndpoint::new(signal.sender());
        Ok(Arc::new(Self {
            profile,
            codec: AtomicU8::new(codec as u8),
            bt_fd: AtomicI32::new(-1),
            mtu: AtomicUsize::new(0),
            state: AtomicU8::new(ScoState::Idle as u8),
            link_lock: Mutex::new(()),
            on_release: Box::new(hook),
            signal,
            timer,
            spk_pcm,
            mic_pcm,
        }))
    }

    /// Take ownership of an accepted SCO socket. Any previous link is
    /// released first; the MTU is refreshed from the new socket. Returns
    /// the MTU.
    pub fn attach(&self, fd: OwnedFd) -> usize {
        let _guard = self.link_lock.lock();
        self.release_locked();

        let raw = fd.into_raw_fd();
        let mtu = sco::mtu(raw);
        self.mtu.store(mtu, Ordering::Release);
        self.bt_fd.store(raw, Ordering::Release);
        log::debug!("[sco] link attached: fd={} mtu={}", raw, mtu);
        mtu
    }

    /// Release the SCO link, if one is live, and run the detach hook.
    pub fn release(&self) {
        let _guard = self.link_lock.lock();
        self.release_locked();
    }

    fn release_locked(&self) {
        let fd = self.bt_fd.swap(-1, Ordering::AcqRel);
        if fd >= 0 {
            // SAFETY: fd was owned by this transport.
            unsafe { libc::close(fd) };
            log::debug!("[sco] link released: fd={}", fd);
            (self.on_release)();
        }
    }

    /// Current SCO descriptor (-1 without a live link).
    #[must_use]
    pub fn bt_fd(&self) -> RawFd {
        self.bt_fd.load(Ordering::Acquire)
    }

    /// SCO MTU of the most recent link. Retains its value after release
    /// so pacing stays smooth across short re-attaches.
    #[must_use]
    pub fn mtu(&self) -> usize {
        self.mtu.load(Ordering::Acquire)
    }

    /// Negotiated voice codec.
    #[must_use]
    pub fn codec(&self) -> CodecKind {
        CodecKind::from_id(self.codec.load(Ordering::Acquire)).unwrap_or(CodecKind::Cvsd)
    }

    /// Renegotiate the voice codec. The I/O loop reads the tag once per
    /// iteration, so a change takes effect on the next wake-up.
    pub fn set_codec(&self, codec: CodecKind) {
        self.codec.store(codec as u8, Ordering::Release);
    }

    /// Profile membership of this transport.
    #[must_use]
    pub fn profile(&self) -> TransportProfile {
        self.profile
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ScoState {
        ScoState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ScoState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn recv_signal(&self) -> Option<ThreadSignal> {
        self.signal.recv()
    }

    pub(crate) fn signal_fd(&self) -> RawFd {
        self.signal.as_raw_fd()
    }

    /// A sender into this transport's I/O loop.
    #[must_use]
    pub fn sender(&self) -> SignalSender {
        self.signal.sender()
    }

    pub(crate) fn timer(&self) -> &OneShotTimer {
        &self.timer
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        // Close without running the hook; the control plane is already
        // tearing this transport down.
        let fd = self.bt_fd.swap(-1, Ordering::AcqRel);
        if fd >= 0 {
            // SAFETY: fd was owned by this transport.
            unsafe { libc::close(fd) };
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("profile", &self.profile)
            .field("codec", &self.codec())
            .field("bt_fd", &self.bt_fd())
            .field("mtu", &self.mtu())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
