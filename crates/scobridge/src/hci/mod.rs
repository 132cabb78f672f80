// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 scobridge contributors

//! Raw HCI channel for vendor commands.
//!
//! The engine only talks HCI for one purpose: the Broadcom SCO routing
//! probe in [`bcm`]. This module provides the minimum request/response
//! plumbing for that - a raw HCI socket bound to one adapter, an event
//! filter and a synchronous command round-trip with timeout.

pub mod bcm;

use crate::config;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::time::Instant;

/// HCI packet indicators.
const HCI_COMMAND_PKT: u8 = 0x01;
const HCI_EVENT_PKT: u8 = 0x04;

/// Events the probe cares about.
const EVT_CMD_COMPLETE: u8 = 0x0e;
const EVT_CMD_STATUS: u8 = 0x0f;

/// `struct sockaddr_hci` from the BlueZ kernel headers. Written for the
/// kernel only.
#[repr(C)]
#[allow(dead_code)]
struct SockaddrHci {
    hci_family: libc::sa_family_t,
    hci_dev: u16,
    hci_channel: u16,
}

/// `struct hci_filter` from the BlueZ kernel headers. Written for the
/// kernel only.
#[repr(C)]
#[allow(dead_code)]
struct HciFilter {
    type_mask: u32,
    event_mask: [u32; 2],
    opcode: u16,
}

/// Raw HCI channel to one adapter.
#[derive(Debug)]
pub struct HciSocket {
    fd: RawFd,
}

impl HciSocket {
    /// Open a raw HCI socket bound to device `dev_id`.
    pub fn open(dev_id: u16) -> io::Result<Self> {
        // SAFETY: socket() with constant arguments, no shared state.
        let fd = unsafe {
            libc::socket(
                libc::AF_BLUETOOTH,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                config::BTPROTO_HCI,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let addr = SockaddrHci {
            hci_family: libc::AF_BLUETOOTH as libc::sa_family_t,
            hci_dev: dev_id,
            hci_channel: 0, // raw channel
        };
        // SAFETY: addr is a live sockaddr_hci and the length matches.
        let ret = unsafe {
            libc::bind(
                fd,
                std::ptr::addr_of!(addr).cast(),
                mem::size_of::<SockaddrHci>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: closing the descriptor we just created.
            unsafe { libc::close(fd) };
            return Err(err);
        }

        Ok(Self { fd })
    }

    /// Issue one HCI command and wait for its Command Complete return
    /// parameters (status byte stripped). A Command Status event with a
    /// non-zero status fails the request; `timeout_ms` bounds the wait.
    pub fn request(
        &self,
        ogf: u16,
        ocf: u16,
        params: &[u8],
        timeout_ms: i32,
    ) -> io::Result<Vec<u8>> {
        let opcode = (ogf << 10) | ocf;
        self.install_filter(opcode)?;
        self.send_command(opcode, params)?;
        self.await_complete(opcode, timeout_ms)
    }

    fn install_filter(&self, opcode: u16) -> io::Result<()> {
        let mut filter = HciFilter {
            type_mask: 1 << u32::from(HCI_EVENT_PKT),
            event_mask: [0; 2],
            opcode,
        };
        filter.event_mask[usize::from(EVT_CMD_COMPLETE / 32)] |=
            1 << u32::from(EVT_CMD_COMPLETE % 32);
        filter.event_mask[usize::from(EVT_CMD_STATUS / 32)] |=
            1 << u32::from(EVT_CMD_STATUS % 32);

        // SAFETY: filter is a live hci_filter and the length matches.
        let ret = unsafe {
            libc::setsockopt(
                self.fd,
                config::SOL_HCI,
                config::HCI_FILTER,
                std::ptr::addr_of!(filter).cast(),
                mem::size_of::<HciFilter>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn send_command(&self, opcode: u16, params: &[u8]) -> io::Result<()> {
        let mut packet = Vec::with_capacity(4 + params.len());
        packet.push(HCI_COMMAND_PKT);
        packet.extend_from_slice(&opcode.to_le_bytes());
        packet.push(params.len() as u8);
        packet.extend_from_slice(params);

        loop {
            // SAFETY: packet is a live buffer of the given length.
            let ret = unsafe { libc::write(self.fd, packet.as_ptr().cast(), packet.len()) };
            if ret == packet.len() as isize {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
    }

    fn await_complete(&self, opcode: u16, timeout_ms: i32) -> io::Result<Vec<u8>> {
        let deadline = Instant::now() + std::time::Duration::from_millis(timeout_ms.max(0) as u64);

        loop {
            let remaining = deadline
                .saturating_duration_since(Instant::now())
                .as_millis() as i32;
            if remaining == 0 {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "HCI request timed out"));
            }

            let mut pfd = libc::pollfd {
                fd: self.fd,
                events: libc::POLLIN,
                revents: 0,
            };
            // SAFETY: pfd points to a stack-allocated pollfd.
            let ret = unsafe { libc::poll(&mut pfd, 1, remaining) };
            if ret == 0 {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "HCI request timed out"));
            }
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }

            let mut buf = [0u8; 260];
            // SAFETY: buf is a live destination of the given length.
            let len = unsafe { libc::read(self.fd, buf.as_mut_ptr().cast(), buf.len()) };
            if len < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }

            match parse_event(&buf[..len as usize], opcode) {
                EventReply::Ignored => {}
                EventReply::Complete(params) => return Ok(params),
                EventReply::Failed(status) => {
                    return Err(io::Error::other(format!(
                        "HCI command failed with status {:#04x}",
                        status
                    )));
                }
            }
        }
    }
}

/// Outcome of matching one raw HCI packet against a pending command.
#[derive(Debug, PartialEq, Eq)]
enum EventReply {
    /// Not an answer to this command; keep waiting.
    Ignored,
    /// Command Complete for this opcode with status zero; carries the
    /// return parameters (status byte stripped).
    Complete(Vec<u8>),
    /// The controller reported a non-zero status for this opcode.
    Failed(u8),
}

/// Match a raw packet from the HCI socket against the command `opcode`.
/// Anything that is not a well-formed Command Complete / Command Status
/// event for that opcode is ignored; the event length field is clamped
/// to the bytes actually received.
fn parse_event(packet: &[u8], opcode: u16) -> EventReply {
    if packet.len() < 3 || packet[0] != HCI_EVENT_PKT {
        return EventReply::Ignored;
    }
    let payload = &packet[3..3 + usize::from(packet[2]).min(packet.len() - 3)];

    match packet[1] {
        EVT_CMD_COMPLETE if payload.len() >= 4 => {
            // num_hci_command_packets, opcode, status, return parameters
            let evt_opcode = u16::from_le_bytes([payload[1], payload[2]]);
            if evt_opcode != opcode {
                return EventReply::Ignored;
            }
            let status = payload[3];
            if status != 0 {
                return EventReply::Failed(status);
            }
            EventReply::Complete(payload[4..].to_vec())
        }
        EVT_CMD_STATUS if payload.len() >= 4 => {
            // status, num_hci_command_packets, opcode
            let evt_opcode = u16::from_le_bytes([payload[2], payload[3]]);
            if evt_opcode == opcode && payload[0] != 0 {
                EventReply::Failed(payload[0])
            } else {
                EventReply::Ignored
            }
        }
        _ => EventReply::Ignored,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;

    const OPCODE: u16 = (config::OGF_VENDOR << 10) | config::OCF_BCM_READ_SCO_PCM_PARAMS;

    fn cmd_complete(opcode: u16, status: u8, params: &[u8]) -> Vec<u8> {
        let mut packet = vec![HCI_EVENT_PKT, EVT_CMD_COMPLETE, 4 + params.len() as u8];
        packet.push(1); // num_hci_command_packets
        packet.extend_from_slice(&opcode.to_le_bytes());
        packet.push(status);
        packet.extend_from_slice(params);
        packet
    }

    fn cmd_status(opcode: u16, status: u8) -> Vec<u8> {
        let mut packet = vec![HCI_EVENT_PKT, EVT_CMD_STATUS, 4, status, 1];
        packet.extend_from_slice(&opcode.to_le_bytes());
        packet
    }

    #[test]
    fn test_command_complete_returns_parameters() {
        let packet = cmd_complete(OPCODE, 0x00, &[0x00, 0x01, 0x00, 0x00, 0x00]);
        assert_eq!(
            parse_event(&packet, OPCODE),
            EventReply::Complete(vec![0x00, 0x01, 0x00, 0x00, 0x00])
        );
    }

    #[test]
    fn test_command_complete_for_other_opcode_is_ignored() {
        let packet = cmd_complete(OPCODE ^ 0x0001, 0x00, &[0x00]);
        assert_eq!(parse_event(&packet, OPCODE), EventReply::Ignored);
    }

    #[test]
    fn test_command_complete_with_error_status() {
        // 0x0c: Command Disallowed
        let packet = cmd_complete(OPCODE, 0x0c, &[]);
        assert_eq!(parse_event(&packet, OPCODE), EventReply::Failed(0x0c));
    }

    #[test]
    fn test_command_status_rejection() {
        // 0x01: Unknown HCI Command
        let packet = cmd_status(OPCODE, 0x01);
        assert_eq!(parse_event(&packet, OPCODE), EventReply::Failed(0x01));

        // a pending Command Status (zero) just means "keep waiting"
        let packet = cmd_status(OPCODE, 0x00);
        assert_eq!(parse_event(&packet, OPCODE), EventReply::Ignored);

        // rejections of other commands are not ours
        let packet = cmd_status(OPCODE ^ 0x0001, 0x01);
        assert_eq!(parse_event(&packet, OPCODE), EventReply::Ignored);
    }

    #[test]
    fn test_short_and_foreign_packets_are_ignored() {
        // too short to carry an event header
        assert_eq!(parse_event(&[HCI_EVENT_PKT], OPCODE), EventReply::Ignored);
        // not an event packet at all
        assert_eq!(
            parse_event(&[0x02, 0x00, 0x00, 0x00, 0x00], OPCODE),
            EventReply::Ignored
        );
        // event with a payload shorter than a command answer
        assert_eq!(
            parse_event(&[HCI_EVENT_PKT, EVT_CMD_COMPLETE, 2, 1, 0x1d], OPCODE),
            EventReply::Ignored
        );
        // some unrelated event
        assert_eq!(
            parse_event(&[HCI_EVENT_PKT, 0x13, 1, 0x00], OPCODE),
            EventReply::Ignored
        );
    }

    #[test]
    fn test_truncated_length_field_is_clamped() {
        // the length byte claims more payload than was received
        let mut packet = cmd_complete(OPCODE, 0x00, &[0x01, 0x02]);
        packet[2] = 0xff;
        assert_eq!(
            parse_event(&packet, OPCODE),
            EventReply::Complete(vec![0x01, 0x02])
        );
    }
}

impl Drop for HciSocket {
    fn drop(&mut self) {
        // SAFETY: fd was obtained from socket() and is closed once.
        unsafe {
            libc::close(self.fd);
        }
    }
}
