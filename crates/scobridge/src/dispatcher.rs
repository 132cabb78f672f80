// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 scobridge contributors

//! Per-adapter SCO connection dispatcher.
//!
//! One long-lived thread per adapter listens on the adapter's SCO socket
//! and, for every inbound link, finds the transport registered for the
//! remote device and moves the accepted descriptor into it. For wideband
//! builds the listening socket uses deferred setup, so the dispatcher
//! also configures transparent voice (mSBC links) and completes the link
//! with the one-byte probe read before handing it over.
//!
//! Setup failures are fatal to the dispatcher only; transport I/O threads
//! keep running and simply never see a new link.

#[cfg(feature = "msbc")]
use crate::codec::CodecKind;
use crate::config;
use crate::hci;
use crate::registry::{Adapter, Directory};
#[cfg(feature = "msbc")]
use crate::sco;
use crate::sco::{BdAddr, ScoListener};
use crate::signal::{SignalChannel, SignalSender, ThreadSignal};
use std::io;
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Handle to a running dispatcher thread.
pub struct DispatcherHandle {
    thread: Option<JoinHandle<()>>,
    waker: SignalSender,
}

impl DispatcherHandle {
    /// Stop the dispatcher and wait for it to exit. The quit message is
    /// consumed while the thread is parked in poll; the listening socket
    /// closes on the way out.
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

impl Drop for DispatcherHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Spawn the dispatcher thread for `adapter`.
pub(crate) fn spawn(adapter: Adapter, directory: Arc<Directory>) -> crate::Result<DispatcherHandle> {
    let quit = SignalChannel::new().map_err(crate::Error::Signal)?;
    let waker = quit.sender();
    let name = adapter.name.clone();
    let thread = thread::Builder::new()
        .name("sb-sco-dispatch".to_string())
        .spawn(move || run(&adapter, &directory, &quit))
        .map_err(crate::Error::Thread)?;
    log::debug!("[dispatch] created SCO dispatcher: {}", name);
    Ok(DispatcherHandle {
        thread: Some(thread),
        waker,
    })
}

fn run(adapter: &Adapter, directory: &Directory, quit: &SignalChannel) {
    // Broadcom chips route SCO through their PCM pins by default, while
    // this loop expects payload on the transport interface. Advisory:
    // a failed probe leaves routing as-is and the dispatcher carries on.
    if adapter.manufacturer == config::COMPANY_BROADCOM {
        if let Err(err) = hci::bcm::align_sco_routing(adapter.dev_id) {
            log::error!("[hci] couldn't align SCO routing params: {}", err);
        }
    }

    let listener = match ScoListener::bind(adapter.address) {
        Ok(listener) => listener,
        Err(err) => {
            log::error!("[dispatch] couldn't open SCO socket: {}", err);
            return;
        }
    };

    #[cfg(feature = "msbc")]
    if let Err(err) = listener.enable_deferred_setup() {
        log::error!("[dispatch] couldn't set deferred connection setup: {}", err);
        return;
    }

    if let Err(err) = listener.listen() {
        log::error!("[dispatch] couldn't listen on SCO socket: {}", err);
        return;
    }

    log::debug!("[dispatch] starting dispatcher loop: {}", adapter.name);
    loop {
        let mut pfds = [
            libc::pollfd {
                fd: quit.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: listener.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
        ];

        // SAFETY: pfds is a stack array of two pollfds.
        let ret = unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, -1) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            log::error!("[dispatch] poll error: {}", err);
            break;
        }

        if pfds[0].revents & libc::POLLIN != 0 {
            match quit.recv() {
                Some(ThreadSignal::Quit) => break,
                _ => continue,
            }
        }

        if pfds[1].revents & libc::POLLIN != 0 {
            accept_link(&listener, directory);
        }
    }

    log::debug!("[dispatch] dispatcher cleanup: {}", adapter.name);
}

/// Accept one inbound link and hand it over. Failures return to the
/// accept loop; [`dispatch_link`] closes the fresh descriptor on its way
/// out.
fn accept_link(listener: &ScoListener, directory: &Directory) {
    let (fd, address) = match listener.accept() {
        Ok(accepted) => accepted,
        Err(err) => {
            log::error!("[dispatch] couldn't accept incoming SCO link: {}", err);
            return;
        }
    };
    log::debug!(
        "[dispatch] new incoming SCO link: {}: {}",
        address,
        fd.as_raw_fd()
    );

    if let Err(err) = dispatch_link(fd, address, directory) {
        log::error!("[dispatch] couldn't dispatch SCO link: {}", err);
    }
}

/// Hand an accepted link to the transport registered for the remote
/// device: resolve device and transport, configure the link (transparent
/// voice for mSBC, the deferred-setup probe read), move the descriptor
/// into the transport and wake both sides of its I/O loop. The
/// descriptor is consumed; on any failure it is closed and the link
/// never reaches a transport.
pub fn dispatch_link(fd: OwnedFd, address: BdAddr, directory: &Directory) -> crate::Result<()> {
    let Some(device) = directory.device_lookup(address) else {
        return Err(crate::Error::UnknownDevice(address.to_string()));
    };
    let Some(transport) = device.transport_lookup(device.owner_path()) else {
        return Err(crate::Error::UnknownTransport(device.owner_path().to_string()));
    };

    #[cfg(feature = "msbc")]
    {
        if transport.codec() == CodecKind::Msbc {
            sco::set_transparent_voice(fd.as_raw_fd()).map_err(crate::Error::LinkSetup)?;
        }
        // Deferred setup is enabled on the listener, so every accepted
        // link needs the probe read to actually establish.
        sco::complete_deferred_setup(fd.as_raw_fd()).map_err(crate::Error::LinkSetup)?;
    }

    transport.attach(fd);

    let _ = transport.spk_pcm.send_signal(ThreadSignal::Ping);
    let _ = transport.mic_pcm.send_signal(ThreadSignal::Ping);
    Ok(())
}
