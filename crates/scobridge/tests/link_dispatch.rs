// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 scobridge contributors

//! Link handoff scenarios: an accepted descriptor travels through the
//! dispatcher's resolution and configuration path into a transport, with
//! a socketpair standing in for the accepted SCO socket.

mod common;

use common::{pipe, read_up_to, socketpair, wait_for, write_all};
use scobridge::transport::io_loop;
use scobridge::{dispatcher, BdAddr, Bridge, CodecKind, Device, Transport, TransportProfile};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

fn gateway(codec: CodecKind) -> (Bridge, BdAddr, Arc<Transport>) {
    let bridge = Bridge::new();
    let address = BdAddr([0x00, 0x1B, 0xDC, 0x07, 0x32, 0xBB]);
    let device = Device::new(address, "/org/bluez/hci0/dev_00_1B_DC_07_32_BB");
    let transport = Transport::new(TransportProfile::HFP_AG, codec).unwrap();
    device.insert_transport(device.owner_path().to_string(), Arc::clone(&transport));
    bridge.register_device(device);
    (bridge, address, transport)
}

/// A dispatched CVSD link is attached, both loop sides are woken, and the
/// deferred-setup probe byte never leaks into the capture stream.
#[test]
fn test_dispatched_link_reaches_cvsd_transport() {
    let (bridge, address, t) = gateway(CodecKind::Cvsd);
    let (local, remote) = socketpair();

    if cfg!(feature = "msbc") {
        // deferred setup: the dispatcher must consume exactly this byte
        write_all(remote.as_raw_fd(), &[0x00]);
    }

    dispatcher::dispatch_link(local, address, bridge.directory()).unwrap();
    assert!(wait_for(Duration::from_secs(1), || t.bt_fd() != -1));
    assert_eq!(t.mtu(), 48);

    // the queued wake-ups bring a freshly spawned loop straight into service
    let _io = io_loop::spawn(Arc::clone(&t)).unwrap();
    let (mic_r, mic_w) = pipe();
    t.mic_pcm.connect(mic_w, 8000).unwrap();

    let marker = [0x6Bu8; 96];
    write_all(remote.as_raw_fd(), &marker);
    let received = read_up_to(mic_r.as_raw_fd(), marker.len(), Duration::from_secs(5));
    assert_eq!(received.len(), marker.len());
    assert!(
        received.iter().all(|&b| b == 0x6B),
        "probe byte leaked into the capture stream"
    );
}

/// Wideband links need transparent voice, which only a real SCO socket
/// supports: the handoff must refuse the link, close it and leave the
/// transport untouched.
#[cfg(feature = "msbc")]
#[test]
fn test_wideband_dispatch_refuses_plain_socket() {
    let (bridge, address, t) = gateway(CodecKind::Msbc);
    let (local, remote) = socketpair();

    let err = dispatcher::dispatch_link(local, address, bridge.directory()).unwrap_err();
    assert!(matches!(err, scobridge::Error::LinkSetup(_)));
    assert_eq!(t.bt_fd(), -1);

    // refused link: the remote sees end-of-stream
    let eof = read_up_to(remote.as_raw_fd(), 1, Duration::from_secs(1));
    assert!(eof.is_empty());
}
