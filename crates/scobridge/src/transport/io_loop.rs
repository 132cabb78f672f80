// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 scobridge contributors

//! Per-transport audio I/O loop.
//!
//! One thread per transport multiplexes six descriptors in a single
//! `poll(2)` with infinite timeout:
//!
//! ```text
//! index 0  signal pipe     POLLIN   always
//! index 1  SCO socket      POLLIN   input buffer has room for one MTU
//! index 2  SCO socket      POLLOUT  output buffer holds one full MTU
//! index 3  speaker FIFO    POLLIN   link live and encoder input has room
//! index 4  microphone FIFO POLLOUT  decoded capture data is pending
//! index 5  lifecycle timer POLLIN   always
//! ```
//!
//! Within an iteration, ordering is fixed: signals, then timer expiry,
//! then SCO I/O, then PCM I/O, then bit-rate pacing - state transitions
//! always take effect before data moves. The descriptor set is rebuilt
//! from buffer levels every iteration, so a released link (descriptor -1)
//! simply drops out of the poll.
//!
//! The loop consumes at most one signal per wake-up; a backlog drains
//! over successive iterations in FIFO order.

#[cfg(feature = "msbc")]
use crate::codec::msbc::MsbcPipeline;
#[cfg(feature = "msbc")]
use crate::codec::sbc;
use crate::buffer::FlipBuffer;
#[cfg(feature = "msbc")]
use crate::codec::CodecKind;
use crate::config;
use crate::pacing::RateSync;
use crate::signal::{SignalSender, ThreadSignal};
use crate::transport::{ScoState, Transport};
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

// Poll set layout; the order is part of the loop's contract.
const IDX_SIGNAL: usize = 0;
const IDX_SCO_IN: usize = 1;
const IDX_SCO_OUT: usize = 2;
const IDX_SPK: usize = 3;
const IDX_MIC: usize = 4;
const IDX_TIMER: usize = 5;

/// Handle to a running transport I/O thread.
pub struct ScoIoHandle {
    thread: Option<JoinHandle<()>>,
    waker: SignalSender,
}

impl ScoIoHandle {
    /// Stop the I/O thread and wait for it to exit. The quit message is
    /// consumed while the loop is parked in poll, so any mid-iteration
    /// work has already run to completion.
    pub fn stop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.waker.send(ThreadSignal::Quit);
            let _ = thread.join();
        }
    }

    /// Whether the thread is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.thread
            .as_ref()
            .is_some_and(|thread| !thread.is_finished())
    }
}

impl Drop for ScoIoHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Spawn the I/O thread for `transport`.
pub fn spawn(transport: Arc<Transport>) -> crate::Result<ScoIoHandle> {
    let waker = transport.sender();
    let thread = thread::Builder::new()
        .name("sb-sco-io".to_string())
        .spawn(move || IoLoop::new(transport).run())
        .map_err(crate::Error::Thread)?;
    Ok(ScoIoHandle {
        thread: Some(thread),
        waker,
    })
}

struct IoLoop {
    t: Arc<Transport>,
    /// Raw capture bytes, SCO socket to microphone FIFO (CVSD path).
    bt_in: FlipBuffer,
    /// Raw playback bytes, speaker FIFO to SCO socket (CVSD path).
    bt_out: FlipBuffer,
    asrs: RateSync,
    waker: SignalSender,
    #[cfg(feature = "msbc")]
    msbc: MsbcPipeline,
    #[cfg(feature = "msbc")]
    initialize_msbc: bool,
}

impl IoLoop {
    fn new(t: Arc<Transport>) -> Self {
        let waker = t.sender();
        Self {
            t,
            bt_in: FlipBuffer::new(config::TRANSFER_BUFFER_SIZE),
            bt_out: FlipBuffer::new(config::TRANSFER_BUFFER_SIZE),
            asrs: RateSync::idle(),
            waker,
            #[cfg(feature = "msbc")]
            msbc: MsbcPipeline::new(),
            #[cfg(feature = "msbc")]
            initialize_msbc: true,
        }
    }

    fn run(mut self) {
        log::debug!("[sco] starting transport loop: {:?}", self.t.profile());

        'outer: loop {
            // Read the codec tag once so a mid-iteration renegotiation
            // cannot split the iteration between two codecs.
            let codec = self.t.codec();
            let mtu = self.t.mtu();

            #[cfg(feature = "msbc")]
            if codec == CodecKind::Msbc && self.initialize_msbc {
                self.initialize_msbc = false;
                self.msbc.init();
            }

            let mut pfds = [libc::pollfd {
                fd: -1,
                events: 0,
                revents: 0,
            }; 6];
            pfds[IDX_SIGNAL] = libc::pollfd {
                fd: self.t.signal_fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            pfds[IDX_SCO_IN].events = libc::POLLIN;
            pfds[IDX_SCO_OUT].events = libc::POLLOUT;
            pfds[IDX_SPK].events = libc::POLLIN;
            pfds[IDX_MIC].events = libc::POLLOUT;
            pfds[IDX_TIMER] = libc::pollfd {
                fd: self.t.timer().as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };

            match codec {
                #[cfg(feature = "msbc")]
                CodecKind::Msbc => {
                    // Advance the codec before descriptor selection so the
                    // buffer levels below reflect this iteration's work.
                    self.msbc.encode();
                    self.msbc.decode();
                    if self.msbc.dec_data.len_in() >= mtu {
                        pfds[IDX_SCO_IN].fd = self.t.bt_fd();
                    }
                    if self.msbc.enc_data.len_out() >= mtu {
                        pfds[IDX_SCO_OUT].fd = self.t.bt_fd();
                    }
                    if self.t.bt_fd() != -1 && self.msbc.enc_pcm.len_in() >= mtu {
                        pfds[IDX_SPK].fd = self.t.spk_pcm.raw_fd();
                    }
                    if self.msbc.dec_pcm.len_out() > 0 {
                        pfds[IDX_MIC].fd = self.t.mic_pcm.raw_fd();
                    }
                    // With the link down or no PCM client left, the codec
                    // restarts from a clean slate on the next activity.
                    if (self.t.spk_pcm.is_closed() && self.t.mic_pcm.is_closed())
                        || self.t.bt_fd() == -1
                    {
                        self.initialize_msbc = true;
                    }
                }
                _ => {
                    if self.bt_in.len_in() >= mtu {
                        pfds[IDX_SCO_IN].fd = self.t.bt_fd();
                    }
                    if self.bt_out.len_out() >= mtu {
                        pfds[IDX_SCO_OUT].fd = self.t.bt_fd();
                    }
                    if self.t.bt_fd() != -1 && self.bt_out.len_in() >= mtu {
                        pfds[IDX_SPK].fd = self.t.spk_pcm.raw_fd();
                    }
                    if self.bt_in.len_out() > 0 {
                        pfds[IDX_MIC].fd = self.t.mic_pcm.raw_fd();
                    }
                }
            }

            // SAFETY: pfds is a stack array of six pollfds.
            let ret = unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, -1) };
            if ret <= 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                log::error!("[sco] poll error: {}", err);
                break;
            }

            // ---- signal pipe -------------------------------------------
            if pfds[IDX_SIGNAL].revents & libc::POLLIN != 0 {
                match self.t.recv_signal() {
                    Some(ThreadSignal::Quit) => break 'outer,
                    Some(ThreadSignal::Ping) | None => continue 'outer,
                    Some(ThreadSignal::PcmOpen | ThreadSignal::PcmResume) => {
                        self.cancel_timer();
                        self.t.set_state(ScoState::Running);
                        self.asrs.reset();
                        continue 'outer;
                    }
                    Some(ThreadSignal::PcmClose) => {
                        // An audio gateway releases the idle link: the
                        // headset keeps sending microphone data even when
                        // nobody reads it, wasting Bluetooth bandwidth.
                        if self.t.profile().is_gateway()
                            && self.t.spk_pcm.is_closed()
                            && self.t.mic_pcm.is_closed()
                            && self.t.state() != ScoState::Linger
                        {
                            self.t.set_state(ScoState::Linger);
                            self.start_timer(config::SCO_LINGER_TIMEOUT_MS);
                        }
                        continue 'outer;
                    }
                    Some(ThreadSignal::PcmSync) => {
                        // No continue: draining must keep in-flight data
                        // moving within this same iteration.
                        self.t.set_state(ScoState::Draining);
                        self.start_timer(config::SCO_DRAIN_TIMEOUT_MS);
                    }
                    Some(ThreadSignal::PcmDrop) => {
                        self.cancel_timer();
                        self.t.spk_pcm.flush();
                        continue 'outer;
                    }
                }
            }

            // ---- lifecycle timer ---------------------------------------
            if pfds[IDX_TIMER].revents & libc::POLLIN != 0 {
                match self.t.timer().acknowledge() {
                    Ok(_) => {}
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        // rearmed between poll and read: the expiry this
                        // wake-up saw no longer exists
                        continue 'outer;
                    }
                    Err(err) => {
                        self.cancel_timer();
                        log::debug!("[sco] lifecycle timer failed: {}", err);
                        break;
                    }
                }
                match self.t.state() {
                    ScoState::Draining => {
                        self.t.set_state(ScoState::Running);
                        self.t.spk_pcm.signal_synced();
                        continue 'outer;
                    }
                    ScoState::Linger => {
                        if self.t.profile().is_gateway()
                            && self.t.spk_pcm.is_closed()
                            && self.t.mic_pcm.is_closed()
                        {
                            log::debug!("[sco] releasing link after PCM inactivity");
                            self.t.set_state(ScoState::Closing);
                            self.t.release();
                            self.start_timer(config::SCO_CLOSE_TIMEOUT_MS);
                        }
                        continue 'outer;
                    }
                    ScoState::Closing => {
                        self.t.set_state(ScoState::Idle);
                    }
                    _ => {}
                }
            }

            if self.asrs.frames() == 0 {
                self.asrs.init(self.t.spk_pcm.sampling());
            }

            // ---- SCO socket read ---------------------------------------
            if pfds[IDX_SCO_IN].revents & libc::POLLIN != 0 {
                let mic_open = !self.t.mic_pcm.is_closed();
                let buf = match codec {
                    #[cfg(feature = "msbc")]
                    CodecKind::Msbc => &mut self.msbc.dec_data,
                    _ => &mut self.bt_in,
                };
                // Without a capture client, drop stale input first so
                // microphone latency cannot build up while nobody reads.
                if !mic_open {
                    buf.rewind();
                }

                let len = loop {
                    let dst = buf.tail_mut();
                    // SAFETY: dst is a live destination of the given length.
                    let ret =
                        unsafe { libc::read(pfds[IDX_SCO_IN].fd, dst.as_mut_ptr().cast(), dst.len()) };
                    if ret > 0 {
                        break ret as usize;
                    }
                    if ret == 0 {
                        self.t.release();
                        continue 'outer;
                    }
                    let err = io::Error::last_os_error();
                    match err.raw_os_error() {
                        Some(libc::EINTR) => continue,
                        Some(libc::ECONNABORTED | libc::ECONNRESET) => {
                            self.t.release();
                            continue 'outer;
                        }
                        _ => {
                            log::error!("[sco] read error: {}", err);
                            continue 'outer;
                        }
                    }
                };
                if mic_open {
                    buf.seek(len);
                }
            } else if pfds[IDX_SCO_IN].revents & (libc::POLLERR | libc::POLLHUP) != 0 {
                log::debug!("[sco] link poll error status: {:#x}", pfds[IDX_SCO_IN].revents);
                self.t.release();
            }

            // ---- SCO socket write --------------------------------------
            if pfds[IDX_SCO_OUT].revents & libc::POLLOUT != 0 {
                let buf = match codec {
                    #[cfg(feature = "msbc")]
                    CodecKind::Msbc => &mut self.msbc.enc_data,
                    _ => &mut self.bt_out,
                };

                let len = loop {
                    // One MTU-sized packet per write; the kernel rejects
                    // anything else on a SEQPACKET socket.
                    let src = &buf.data()[..mtu];
                    // SAFETY: src is a live source of the given length.
                    let ret =
                        unsafe { libc::write(pfds[IDX_SCO_OUT].fd, src.as_ptr().cast(), src.len()) };
                    if ret > 0 {
                        break ret as usize;
                    }
                    if ret == 0 {
                        self.t.release();
                        continue 'outer;
                    }
                    let err = io::Error::last_os_error();
                    match err.raw_os_error() {
                        Some(libc::EINTR) => continue,
                        Some(libc::ECONNABORTED | libc::ECONNRESET) => {
                            self.t.release();
                            continue 'outer;
                        }
                        _ => {
                            log::error!("[sco] write error: {}", err);
                            continue 'outer;
                        }
                    }
                };
                buf.shift(len);
            }

            // ---- speaker PCM read --------------------------------------
            if pfds[IDX_SPK].revents & libc::POLLIN != 0 {
                let buf = match codec {
                    #[cfg(feature = "msbc")]
                    CodecKind::Msbc => &mut self.msbc.enc_pcm,
                    _ => &mut self.bt_out,
                };
                match self.t.spk_pcm.read_bytes(buf.tail_mut()) {
                    Ok(0) => {
                        // client end-of-stream
                        self.t.spk_pcm.release();
                        self.send_signal(ThreadSignal::PcmClose);
                        continue 'outer;
                    }
                    Ok(n) => buf.seek(n),
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue 'outer,
                    Err(err) => {
                        log::error!("[sco] PCM read error: {}", err);
                        continue 'outer;
                    }
                }
            } else if pfds[IDX_SPK].revents & (libc::POLLERR | libc::POLLHUP) != 0 {
                log::debug!("[sco] PCM poll error status: {:#x}", pfds[IDX_SPK].revents);
                self.t.spk_pcm.release();
                self.send_signal(ThreadSignal::PcmClose);
            }

            // ---- microphone PCM write ----------------------------------
            if pfds[IDX_MIC].revents & libc::POLLOUT != 0 {
                let buf = match codec {
                    #[cfg(feature = "msbc")]
                    CodecKind::Msbc => &mut self.msbc.dec_pcm,
                    _ => &mut self.bt_in,
                };
                match self.t.mic_pcm.write_bytes(buf.data()) {
                    Ok(0) => {
                        self.t.mic_pcm.release();
                        self.send_signal(ThreadSignal::PcmClose);
                    }
                    Ok(n) => buf.shift(n),
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                    Err(err) => log::error!("[sco] FIFO write error: {}", err),
                }
            } else if pfds[IDX_MIC].revents & (libc::POLLERR | libc::POLLHUP) != 0 {
                log::debug!("[sco] PCM poll error status: {:#x}", pfds[IDX_MIC].revents);
                self.t.mic_pcm.release();
                self.send_signal(ThreadSignal::PcmClose);
            }

            // ---- constant bit-rate pacing ------------------------------
            match codec {
                #[cfg(feature = "msbc")]
                CodecKind::Msbc => {
                    let frames = self.msbc.take_enc_frames();
                    if frames > 0 {
                        self.asrs.sync(frames * sbc::FRAME_SAMPLES as u32);
                    }
                }
                _ => {
                    self.asrs.sync((mtu / 2) as u32);
                }
            }

            // publish encoding overhead as client-visible delay
            let delay = (self.asrs.busy_usec() / 100) as u32;
            self.t.spk_pcm.set_delay(delay);
            self.t.mic_pcm.set_delay(delay);
        }

        #[cfg(feature = "msbc")]
        self.msbc.finish();
        log::debug!("[sco] transport loop terminated");
    }

    fn send_signal(&self, signal: ThreadSignal) {
        if let Err(err) = self.waker.send(signal) {
            log::error!("[sco] self-signal failed: {}", err);
        }
    }

    fn start_timer(&self, ms: u64) {
        if let Err(err) = self.t.timer().start(ms) {
            log::error!("[sco] timer arm failed: {}", err);
        }
    }

    fn cancel_timer(&self) {
        if let Err(err) = self.t.timer().cancel() {
            log::debug!("[sco] timer cancel failed: {}", err);
        }
    }
}
