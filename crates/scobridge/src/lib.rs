// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 scobridge contributors

//! # scobridge - Bluetooth SCO audio transport engine
//!
//! Bridges Bluetooth hands-free audio (HFP/HSP) between a local adapter and
//! userspace audio clients: 16-bit linear PCM is shuttled between a
//! client-facing FIFO and the SCO kernel socket, optionally through the mSBC
//! codec for wideband speech, at a constant bit rate.
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                        Bridge (registry)                           |
//! |   adapters -> dispatcher threads | transports -> I/O threads       |
//! +--------------------------------------------------------------------+
//! |                     Dispatcher (per adapter)                       |
//! |   listen on SCO socket -> accept -> lookup transport -> attach     |
//! +--------------------------------------------------------------------+
//! |                     I/O loop (per transport)                       |
//! |   poll: signal pipe | SCO in/out | PCM in/out | timer              |
//! |   state machine: IDLE/RUNNING/DRAINING/LINGER/CLOSING              |
//! +--------------------------------------------------------------------+
//! |                          Codec path                                |
//! |   CVSD: identity (raw 8 kHz PCM)   mSBC: SBC wideband + H2 framing |
//! +--------------------------------------------------------------------+
//! ```
//!
//! Data flow (playback): client FIFO -> PCM read -> encoder input ->
//! encode -> SCO output buffer -> SCO socket. Capture mirrors it.
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Bridge`] | Process-wide registry of adapters, devices and transports |
//! | [`Transport`] | One bidirectional audio endpoint to a remote device |
//! | [`PcmEndpoint`] | Client-facing PCM FIFO (speaker or microphone side) |
//! | [`CodecKind`] | Negotiated voice codec tag (CVSD or mSBC) |
//!
//! Linux only: SCO sockets, `timerfd` and HCI vendor commands are part of
//! the BlueZ kernel ABI.

#[cfg(not(target_os = "linux"))]
compile_error!("scobridge talks to the Linux BlueZ kernel ABI and builds only on Linux");

/// Flip-flop transfer buffer (two-cursor byte arena).
pub mod buffer;
/// Voice codec capability set: CVSD identity and the mSBC pipeline.
pub mod codec;
/// Engine constants - single source of truth.
pub mod config;
/// Per-adapter SCO connection dispatcher.
pub mod dispatcher;
/// Raw HCI channel and the Broadcom SCO routing probe.
pub mod hci;
/// Wall-clock rate synchronizer for constant bit-rate pacing.
pub mod pacing;
/// Process-wide adapter/device/transport registry.
pub mod registry;
/// SCO socket layer (open, listen, accept, socket options).
pub mod sco;
/// Pipe-backed transport signal channel.
pub mod signal;
/// One-shot monotonic timer (timerfd).
pub mod timer;
/// Transport, PCM endpoints and the per-transport I/O loop.
pub mod transport;

pub use codec::CodecKind;
pub use registry::{Adapter, Bridge, Device};
pub use sco::BdAddr;
pub use signal::ThreadSignal;
pub use transport::{PcmEndpoint, ScoState, Transport, TransportProfile};

use std::io;

/// Errors returned by scobridge operations.
#[derive(Debug)]
pub enum Error {
    // ========================================================================
    // Adapter / socket setup
    // ========================================================================
    /// Opening, binding or listening on the adapter SCO socket failed.
    ScoSocket(io::Error),
    /// Enabling deferred connection setup failed.
    DeferredSetup(io::Error),

    // ========================================================================
    // Link establishment
    // ========================================================================
    /// Configuring an accepted link (transparent voice, probe read) failed.
    LinkSetup(io::Error),
    /// The operation requires a live SCO link but none is attached.
    NoLink,

    // ========================================================================
    // Lookup
    // ========================================================================
    /// No device registered for the given Bluetooth address.
    UnknownDevice(String),
    /// No transport registered under the given owner path.
    UnknownTransport(String),

    // ========================================================================
    // Runtime
    // ========================================================================
    /// Spawning a dispatcher or I/O thread failed.
    Thread(io::Error),
    /// Arming or reading the lifecycle timer failed.
    Timer(io::Error),
    /// The signal channel broke (pipe closed or full beyond recovery).
    Signal(io::Error),
    /// Codec initialization failed.
    Codec(&'static str),
    /// Other I/O error.
    Io(io::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::ScoSocket(e) => write!(f, "SCO socket setup failed: {}", e),
            Error::DeferredSetup(e) => write!(f, "deferred connection setup failed: {}", e),
            Error::LinkSetup(e) => write!(f, "SCO link configuration failed: {}", e),
            Error::NoLink => write!(f, "no SCO link attached"),
            Error::UnknownDevice(addr) => write!(f, "unknown device: {}", addr),
            Error::UnknownTransport(path) => write!(f, "unknown transport: {}", path),
            Error::Thread(e) => write!(f, "thread spawn failed: {}", e),
            Error::Timer(e) => write!(f, "timer failed: {}", e),
            Error::Signal(e) => write!(f, "signal channel failed: {}", e),
            Error::Codec(what) => write!(f, "codec failure: {}", what),
            Error::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::ScoSocket(e)
            | Error::DeferredSetup(e)
            | Error::LinkSetup(e)
            | Error::Thread(e)
            | Error::Timer(e)
            | Error::Signal(e)
            | Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

/// Convenient alias for results using the crate [`Error`] type.
pub type Result<T> = core::result::Result<T, Error>;
