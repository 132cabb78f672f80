// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 scobridge contributors

//! End-to-end scenarios for the narrowband (CVSD) transport loop, driven
//! over socketpairs and pipes - the loop itself is descriptor-agnostic.

mod common;

use common::{pipe, read_up_to, socketpair, wait_for, write_all};
use scobridge::transport::io_loop;
use scobridge::{CodecKind, ScoState, ThreadSignal, Transport, TransportProfile};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn release_counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let hook_count = Arc::clone(&count);
    (count, move || {
        hook_count.fetch_add(1, Ordering::SeqCst);
    })
}

/// Audio gateway happy path: playback flows at the negotiated bit rate,
/// and once the client leaves the link lingers, releases and settles.
#[test]
fn test_ag_playback_then_linger_release() {
    let (releases, hook) = release_counter();
    let t = Transport::with_release_hook(TransportProfile::HFP_AG, CodecKind::Cvsd, hook).unwrap();
    let _io = io_loop::spawn(Arc::clone(&t)).unwrap();

    // record the lifecycle states as they appear
    let states = Arc::new(parking_lot::Mutex::new(vec![t.state()]));
    let stop = Arc::new(AtomicBool::new(false));
    let sampler = {
        let t = Arc::clone(&t);
        let states = Arc::clone(&states);
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                let state = t.state();
                let mut states = states.lock();
                if *states.last().unwrap() != state {
                    states.push(state);
                }
                drop(states);
                std::thread::sleep(Duration::from_millis(5));
            }
        })
    };

    let (sco_local, sco_remote) = socketpair();
    let mtu = t.attach(sco_local);
    assert_eq!(mtu, 48);

    let (fifo_r, fifo_w) = pipe();
    t.spk_pcm.connect(fifo_r, 8000).unwrap();

    // one second of a sine tone, trimmed to a whole number of MTU-sized
    // packets so everything that enters the FIFO leaves on the link
    const SAMPLES: usize = 7992; // 333 packets x 48 bytes
    let mut pcm = Vec::with_capacity(SAMPLES * 2);
    for i in 0..SAMPLES {
        let s = ((i as f64 * 2.0 * std::f64::consts::PI * 440.0 / 8000.0).sin() * 12000.0) as i16;
        pcm.extend_from_slice(&s.to_le_bytes());
    }
    write_all(fifo_w.as_raw_fd(), &pcm);
    drop(fifo_w); // client end-of-stream once drained

    // paced at 8 kHz this takes about one second
    let received = read_up_to(sco_remote.as_raw_fd(), pcm.len(), Duration::from_secs(10));
    assert_eq!(received.len(), pcm.len());
    assert_eq!(received, pcm);

    // gateway: release must follow within the linger window
    let closed_at = Instant::now();
    assert!(
        wait_for(Duration::from_millis(1500), || releases
            .load(Ordering::SeqCst)
            == 1),
        "link was not released after PCM inactivity"
    );
    assert!(closed_at.elapsed() <= Duration::from_millis(1500));
    assert_eq!(t.bt_fd(), -1);

    // close window: the transport settles back to IDLE
    assert!(wait_for(Duration::from_millis(1200), || t.state()
        == ScoState::Idle));

    stop.store(true, Ordering::Relaxed);
    sampler.join().unwrap();

    let observed = states.lock().clone();
    let expected = [
        ScoState::Idle,
        ScoState::Running,
        ScoState::Linger,
        ScoState::Closing,
        ScoState::Idle,
    ];
    let mut iter = observed.iter();
    for want in expected {
        assert!(
            iter.any(|&s| s == want),
            "state path {:?} missing {:?}",
            observed,
            want
        );
    }
}

/// Capture direction: bytes from the link surface on the microphone FIFO.
#[test]
fn test_capture_path_reaches_microphone() {
    let t = Transport::new(TransportProfile::HFP_AG, CodecKind::Cvsd).unwrap();
    let _io = io_loop::spawn(Arc::clone(&t)).unwrap();

    let (sco_local, sco_remote) = socketpair();
    t.attach(sco_local);

    let (mic_r, mic_w) = pipe();
    t.mic_pcm.connect(mic_w, 8000).unwrap();

    let chunk = [0x5Au8; 96];
    write_all(sco_remote.as_raw_fd(), &chunk);

    let received = read_up_to(mic_r.as_raw_fd(), chunk.len(), Duration::from_secs(5));
    assert_eq!(received.len(), chunk.len());
    assert!(received.iter().all(|&b| b == 0x5A));

    // the loop published a processing delay for both endpoints
    assert!(t.mic_pcm.delay() < 10_000, "implausible delay report");
    assert_eq!(t.spk_pcm.sampling(), 0); // speaker side never opened
}

/// Drain: the confirmation arrives once the drain window elapses, and the
/// transport returns to RUNNING.
#[test]
fn test_drain_confirms_after_window() {
    let t = Transport::new(TransportProfile::HFP_AG, CodecKind::Cvsd).unwrap();
    let _io = io_loop::spawn(Arc::clone(&t)).unwrap();

    let (fifo_r, _fifo_w) = pipe();
    t.spk_pcm.connect(fifo_r, 8000).unwrap();
    assert!(wait_for(Duration::from_secs(1), || t.state() == ScoState::Running));
    t.spk_pcm.resume().unwrap();

    let start = Instant::now();
    let confirmed = t.spk_pcm.drain(Duration::from_secs(2)).unwrap();
    let elapsed = start.elapsed();

    assert!(confirmed, "drain confirmation missing");
    assert!(
        elapsed >= Duration::from_millis(200) && elapsed <= Duration::from_millis(700),
        "drain window off: {:?}",
        elapsed
    );
    assert_eq!(t.state(), ScoState::Running);

    // a second drain works the same way: one confirmation per request
    assert!(t.spk_pcm.drain(Duration::from_secs(2)).unwrap());
}

/// Drop: buffered playback is flushed, the state does not change, and
/// fresh data flows afterwards.
#[test]
fn test_drop_flushes_stale_playback() {
    let t = Transport::new(TransportProfile::HFP_AG, CodecKind::Cvsd).unwrap();
    let _io = io_loop::spawn(Arc::clone(&t)).unwrap();

    let (fifo_r, fifo_w) = pipe();
    t.spk_pcm.connect(fifo_r, 8000).unwrap();
    assert!(wait_for(Duration::from_secs(1), || t.state() == ScoState::Running));

    // stale audio queued while no link is up
    write_all(fifo_w.as_raw_fd(), &[0x11u8; 384]);
    t.spk_pcm.drop_pending().unwrap();
    assert!(wait_for(Duration::from_secs(1), || {
        // flushed: the FIFO is empty again
        t.state() == ScoState::Running
    }));
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(t.state(), ScoState::Running);

    // marker written after the drop must be the first thing on the link
    let marker = [0xABu8; 96];
    write_all(fifo_w.as_raw_fd(), &marker);
    let (sco_local, sco_remote) = socketpair();
    t.attach(sco_local);
    t.sender().send(ThreadSignal::Ping).unwrap();

    let received = read_up_to(sco_remote.as_raw_fd(), 48, Duration::from_secs(5));
    assert!(received.len() >= 48);
    assert!(
        received.iter().all(|&b| b == 0xAB),
        "stale audio leaked past the drop"
    );
}

/// Peer reset: the link is released exactly once, the loop survives and
/// the next iteration runs without SCO descriptors.
#[test]
fn test_peer_reset_releases_but_loop_survives() {
    let (releases, hook) = release_counter();
    let t = Transport::with_release_hook(TransportProfile::HFP_AG, CodecKind::Cvsd, hook).unwrap();
    let io = io_loop::spawn(Arc::clone(&t)).unwrap();

    let (sco_local, sco_remote) = socketpair();
    t.attach(sco_local);

    let (fifo_r, fifo_w) = pipe();
    t.spk_pcm.connect(fifo_r, 8000).unwrap();

    // get some audio moving first
    write_all(fifo_w.as_raw_fd(), &[0x22u8; 480]);
    let moving = read_up_to(sco_remote.as_raw_fd(), 48, Duration::from_secs(5));
    assert!(!moving.is_empty());

    // peer goes away
    drop(sco_remote);

    assert!(
        wait_for(Duration::from_secs(2), || releases.load(Ordering::SeqCst) == 1),
        "peer reset did not release the link"
    );
    assert_eq!(t.bt_fd(), -1);
    assert!(io.is_running(), "I/O thread must survive a peer reset");
    assert_eq!(releases.load(Ordering::SeqCst), 1);
}

/// Any interleaving of client signals must leave the loop responsive and
/// the state machine on a known state.
#[test]
fn test_signal_storm_keeps_loop_responsive() {
    let t = Transport::new(TransportProfile::HFP_AG, CodecKind::Cvsd).unwrap();
    let _io = io_loop::spawn(Arc::clone(&t)).unwrap();

    let (fifo_r, _fifo_w) = pipe();
    t.spk_pcm.connect(fifo_r, 8000).unwrap();

    let storm = [
        ThreadSignal::Ping,
        ThreadSignal::PcmOpen,
        ThreadSignal::PcmResume,
        ThreadSignal::PcmClose,
        ThreadSignal::PcmDrop,
        ThreadSignal::PcmSync,
    ];
    let sender = t.sender();
    fastrand::seed(0x51f0);
    for _ in 0..200 {
        sender.send(storm[fastrand::usize(0..storm.len())]).unwrap();
        if fastrand::u8(0..4) == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    // the backlog drains one signal per iteration; afterwards the loop
    // still answers a drain request
    assert!(t.spk_pcm.drain(Duration::from_secs(3)).unwrap());
    assert!(wait_for(Duration::from_secs(1), || t.state() == ScoState::Running));
}

/// Hands-free role: no linger, no release - the remote gateway owns the
/// link lifetime.
#[test]
fn test_hf_role_keeps_link_after_close() {
    let (releases, hook) = release_counter();
    let t = Transport::with_release_hook(TransportProfile::HFP_HF, CodecKind::Cvsd, hook).unwrap();
    let _io = io_loop::spawn(Arc::clone(&t)).unwrap();

    let (sco_local, _sco_remote) = socketpair();
    t.attach(sco_local);

    let (fifo_r, fifo_w) = pipe();
    t.spk_pcm.connect(fifo_r, 8000).unwrap();
    assert!(wait_for(Duration::from_secs(1), || t.state() == ScoState::Running));

    drop(fifo_w); // client leaves
    assert!(wait_for(Duration::from_secs(1), || t.spk_pcm.is_closed()));

    // well past the gateway linger window: nothing must have happened
    std::thread::sleep(Duration::from_millis(1300));
    assert_eq!(t.state(), ScoState::Running);
    assert_eq!(releases.load(Ordering::SeqCst), 0);
    assert_ne!(t.bt_fd(), -1);
}
