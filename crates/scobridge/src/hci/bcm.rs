// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 scobridge contributors

//! Broadcom SCO routing probe.
//!
//! Broadcom chips route SCO payload through their PCM pins by default,
//! while this engine expects it on the transport (HCI) interface. The
//! probe reads the five SCO-PCM interface parameters via the vendor
//! command and, when routing is not set to transport, writes the same
//! record back with only the routing byte corrected. Everything here is
//! advisory: a failure is logged by the caller and startup continues.

use super::HciSocket;
use crate::config;
use std::io;

/// The five Broadcom SCO-PCM interface parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoPcmParams {
    pub routing: u8,
    pub clock_rate: u8,
    pub frame_type: u8,
    pub sync_mode: u8,
    pub clock_mode: u8,
}

/// Read the SCO-PCM parameters from the chip.
pub fn read_sco_pcm_params(sock: &HciSocket) -> io::Result<ScoPcmParams> {
    let rp = sock.request(
        config::OGF_VENDOR,
        config::OCF_BCM_READ_SCO_PCM_PARAMS,
        &[],
        config::HCI_REQUEST_TIMEOUT_MS,
    )?;
    if rp.len() < 5 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "short SCO-PCM parameter record",
        ));
    }
    Ok(ScoPcmParams {
        routing: rp[0],
        clock_rate: rp[1],
        frame_type: rp[2],
        sync_mode: rp[3],
        clock_mode: rp[4],
    })
}

/// Write the SCO-PCM parameters back to the chip.
pub fn write_sco_pcm_params(sock: &HciSocket, params: ScoPcmParams) -> io::Result<()> {
    sock.request(
        config::OGF_VENDOR,
        config::OCF_BCM_WRITE_SCO_PCM_PARAMS,
        &[
            params.routing,
            params.clock_rate,
            params.frame_type,
            params.sync_mode,
            params.clock_mode,
        ],
        config::HCI_REQUEST_TIMEOUT_MS,
    )?;
    Ok(())
}

/// Make sure the chip routes SCO via the transport interface, rewriting
/// the parameter record when it does not.
pub fn align_sco_routing(dev_id: u16) -> io::Result<()> {
    log::debug!("[hci] checking Broadcom internal SCO routing on hci{}", dev_id);

    let sock = HciSocket::open(dev_id)?;
    let params = read_sco_pcm_params(&sock)?;
    log::debug!(
        "[hci] current SCO interface setup: {} {} {} {} {}",
        params.routing,
        params.clock_rate,
        params.frame_type,
        params.sync_mode,
        params.clock_mode
    );

    if params.routing != config::BCM_SCO_ROUTING_TRANSPORT {
        log::debug!("[hci] rerouting SCO via the transport interface");
        write_sco_pcm_params(
            &sock,
            ScoPcmParams {
                routing: config::BCM_SCO_ROUTING_TRANSPORT,
                ..params
            },
        )?;
    }
    Ok(())
}
