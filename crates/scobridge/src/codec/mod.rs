// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 scobridge contributors

//! Voice codec capability set.
//!
//! The transport carries one of two negotiated codecs. CVSD is the identity
//! codec at this layer: the chip does the modulation, so the engine moves
//! raw 8 kHz 16-bit PCM straight between the FIFO buffers and the socket.
//! mSBC is the wideband pipeline in [`msbc`], fed by the same loop.

#[cfg(feature = "msbc")]
pub mod msbc;
#[cfg(feature = "msbc")]
pub mod sbc;

/// Negotiated voice codec, tagged with the HFP codec identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CodecKind {
    /// Narrowband: continuously variable slope delta, handled in-chip.
    Cvsd = 0x01,
    /// Wideband: modified SBC over a transparent link.
    Msbc = 0x02,
}

impl CodecKind {
    /// Decode the HFP codec identifier.
    #[must_use]
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0x01 => Some(Self::Cvsd),
            0x02 => Some(Self::Msbc),
            _ => None,
        }
    }

    /// PCM sampling rate of this codec, in Hz.
    #[must_use]
    pub fn sampling(self) -> u32 {
        match self {
            Self::Cvsd => 8000,
            Self::Msbc => 16_000,
        }
    }
}

impl std::fmt::Display for CodecKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cvsd => f.write_str("CVSD"),
            Self::Msbc => f.write_str("mSBC"),
        }
    }
}
