// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 scobridge contributors

//! SBC wideband core for mSBC speech frames.
//!
//! mSBC pins every SBC knob: 16 kHz mono, 8 subbands, 15 blocks, loudness
//! allocation, bitpool 26. One frame turns 120 PCM samples into a 57-byte
//! payload: a 4-byte header (syncword, two fixed parameter bytes, FCS), four
//! scale-factor bytes and 49 bytes of quantized subband samples.
//!
//! The polyphase window and the modulation matrices are derived once at
//! construction and shared between analysis and synthesis, so the encoder
//! and decoder are exact mirrors of each other.

use std::f64::consts::PI;

/// Subbands per frame (fixed for wideband speech).
pub const SUBBANDS: usize = 8;
/// Blocks per frame.
pub const BLOCKS: usize = 15;
/// Bits available per block for subband samples.
pub const BITPOOL: usize = 26;
/// PCM samples consumed/produced per frame.
pub const FRAME_SAMPLES: usize = BLOCKS * SUBBANDS;
/// Encoded payload length in bytes.
pub const FRAME_LEN: usize = 57;

const SYNCWORD: u8 = 0xAD;
/// FCS generator polynomial, x^8 + x^4 + x^3 + x^2 + 1.
const CRC_POLY: u8 = 0x1D;
const CRC_INIT: u8 = 0x0F;

/// Loudness offsets for the 16 kHz, 8-subband configuration.
const LOUDNESS_OFFSET: [i32; SUBBANDS] = [-4, 0, 0, 0, 0, 0, 1, 2];

/// Reasons a frame fails to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Payload does not start with the SBC syncword.
    BadSync,
    /// FCS mismatch over header and scale factors.
    BadCrc,
}

// =======================================================================
// Shared filterbank tables
// =======================================================================

/// 80-tap lowpass prototype: Hamming-windowed sinc with cutoff pi/8.
fn proto_window() -> [f64; 80] {
    let mut c = [0.0f64; 80];
    for (i, v) in c.iter_mut().enumerate() {
        let n = i as f64 - 39.5;
        let arg = PI * n / SUBBANDS as f64;
        let sinc = arg.sin() / arg;
        let hamming = 0.54 - 0.46 * (2.0 * PI * i as f64 / 79.0).cos();
        *v = sinc * hamming / SUBBANDS as f64;
    }
    c
}

fn crc8<'a>(bytes: impl Iterator<Item = &'a u8>) -> u8 {
    let mut crc = CRC_INIT;
    for byte in bytes {
        for bit in (0..8).rev() {
            let inbit = (byte >> bit) & 1;
            let feedback = (crc >> 7) ^ inbit;
            crc <<= 1;
            if feedback == 1 {
                crc ^= CRC_POLY;
            }
        }
    }
    crc
}

// =======================================================================
// Bit allocation (loudness, mono)
// =======================================================================

/// Derive per-subband bit widths from the transmitted scale factors.
/// Deterministic on both sides of the link: the decoder reruns this on the
/// received scale factors and obtains the identical layout.
fn bit_allocation(scale_factors: &[u8; SUBBANDS]) -> [u8; SUBBANDS] {
    let bitpool = BITPOOL as i32;

    let mut bitneed = [0i32; SUBBANDS];
    for sb in 0..SUBBANDS {
        if scale_factors[sb] == 0 {
            bitneed[sb] = -5;
        } else {
            let mut loudness = i32::from(scale_factors[sb]) - LOUDNESS_OFFSET[sb];
            if loudness > 0 {
                loudness /= 2;
            }
            bitneed[sb] = loudness;
        }
    }

    // Find the bit slice level at which the pool is exhausted.
    let max_bitneed = bitneed.iter().copied().max().unwrap_or(0);
    let mut bitcount = 0;
    let mut slicecount = 0;
    let mut bitslice = max_bitneed + 1;
    loop {
        bitslice -= 1;
        bitcount += slicecount;
        slicecount = 0;
        for need in bitneed {
            if need > bitslice + 1 && need < bitslice + 16 {
                slicecount += 1;
            } else if need == bitslice + 1 {
                slicecount += 2;
            }
        }
        if bitcount + slicecount >= bitpool {
            break;
        }
    }
    if bitcount + slicecount == bitpool {
        bitslice -= 1;
    }

    let mut bits = [0u8; SUBBANDS];
    for sb in 0..SUBBANDS {
        if bitneed[sb] >= bitslice + 2 {
            bits[sb] = (bitneed[sb] - bitslice).min(16) as u8;
        }
    }

    // Hand out whatever the slicing left over, low subbands first.
    let mut bitcount: i32 = bits.iter().map(|&b| i32::from(b)).sum();
    let mut sb = 0;
    while bitcount < bitpool && sb < SUBBANDS {
        if bits[sb] >= 2 && bits[sb] < 16 {
            bits[sb] += 1;
            bitcount += 1;
        } else if bitneed[sb] == bitslice + 1 && bitpool > bitcount + 1 {
            bits[sb] = 2;
            bitcount += 2;
        }
        sb += 1;
    }
    let mut sb = 0;
    while bitcount < bitpool && sb < SUBBANDS {
        if bits[sb] < 16 {
            bits[sb] += 1;
            bitcount += 1;
        }
        sb += 1;
    }
    // The slicing over-approximates in corner cases; trim from the top so
    // the sample bits always fit the frame.
    while bitcount > bitpool {
        let sb = (0..SUBBANDS)
            .max_by_key(|&sb| bits[sb])
            .unwrap_or(0);
        bits[sb] -= 1;
        bitcount -= 1;
    }

    bits
}

// =======================================================================
// Bit-level packing
// =======================================================================

struct BitWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> BitWriter<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn put(&mut self, value: u32, width: u8) {
        for shift in (0..width).rev() {
            let bit = (value >> shift) & 1;
            let byte = self.pos / 8;
            let offset = 7 - (self.pos % 8);
            if bit == 1 {
                self.buf[byte] |= 1 << offset;
            } else {
                self.buf[byte] &= !(1 << offset);
            }
            self.pos += 1;
        }
    }
}

struct BitReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn get(&mut self, width: u8) -> u32 {
        let mut value = 0u32;
        for _ in 0..width {
            let byte = self.pos / 8;
            let offset = 7 - (self.pos % 8);
            value = (value << 1) | u32::from((self.buf[byte] >> offset) & 1);
            self.pos += 1;
        }
        value
    }
}

// =======================================================================
// Encoder
// =======================================================================

/// Streaming wideband SBC encoder. Filterbank history carries across
/// frames; call [`SbcEncoder::reset`] when the stream restarts.
pub struct SbcEncoder {
    window: [f64; 80],
    /// Analysis modulation matrix, `[subband][phase]`.
    matrix: [[f64; 16]; SUBBANDS],
    /// Input history, newest sample at index 0.
    x: [f64; 80],
}

impl SbcEncoder {
    #[must_use]
    pub fn new() -> Self {
        let mut matrix = [[0.0f64; 16]; SUBBANDS];
        for (sb, row) in matrix.iter_mut().enumerate() {
            for (i, v) in row.iter_mut().enumerate() {
                *v = ((i as f64 + 4.0) * (2.0 * sb as f64 + 1.0) * PI / 16.0).cos();
            }
        }
        Self {
            window: proto_window(),
            matrix,
            x: [0.0; 80],
        }
    }

    /// Drop the filterbank history (stream restart).
    pub fn reset(&mut self) {
        self.x = [0.0; 80];
    }

    /// Encode one frame of 120 samples into a 57-byte payload.
    pub fn encode(&mut self, pcm: &[i16], out: &mut [u8]) {
        debug_assert_eq!(pcm.len(), FRAME_SAMPLES);
        debug_assert_eq!(out.len(), FRAME_LEN);

        let mut sb_samples = [[0.0f64; SUBBANDS]; BLOCKS];
        for (block, chunk) in pcm.chunks_exact(SUBBANDS).enumerate() {
            self.analyze(chunk, &mut sb_samples[block]);
        }

        // Scale factor of a subband: smallest sf with max |sample| < 2^(sf+1).
        let mut scale_factors = [0u8; SUBBANDS];
        for sb in 0..SUBBANDS {
            let max_abs = sb_samples
                .iter()
                .map(|block| block[sb].abs())
                .fold(0.0f64, f64::max);
            let mut sf = 0u8;
            while sf < 15 && max_abs >= f64::from(1u32 << (sf + 1)) {
                sf += 1;
            }
            scale_factors[sb] = sf;
        }

        let bits = bit_allocation(&scale_factors);

        out.fill(0);
        out[0] = SYNCWORD;
        out[1] = 0x00;
        out[2] = 0x00;

        {
            let mut writer = BitWriter::new(&mut out[4..]);
            for sf in scale_factors {
                writer.put(u32::from(sf), 4);
            }
            for block in &sb_samples {
                for sb in 0..SUBBANDS {
                    if bits[sb] == 0 {
                        continue;
                    }
                    let levels = (1u32 << bits[sb]) - 1;
                    let norm = f64::from(1u32 << (scale_factors[sb] + 1));
                    let x = (block[sb] / norm).clamp(-1.0, 1.0);
                    let q = (((x + 1.0) * f64::from(levels)) / 2.0).floor() as u32;
                    writer.put(q.min(levels), bits[sb]);
                }
            }
        }

        out[3] = crc8(out[1..3].iter().chain(out[4..8].iter()));
    }

    /// Polyphase analysis: 8 new samples in, 8 subband samples out.
    fn analyze(&mut self, input: &[i16], s: &mut [f64; SUBBANDS]) {
        self.x.copy_within(0..72, SUBBANDS);
        for (i, &sample) in input.iter().enumerate() {
            // newest sample lands at index 0
            self.x[SUBBANDS - 1 - i] = f64::from(sample);
        }

        let mut y = [0.0f64; 16];
        for (i, yv) in y.iter_mut().enumerate() {
            let mut acc = 0.0;
            for k in 0..5 {
                let idx = i + 16 * k;
                acc += self.x[idx] * self.window[idx];
            }
            *yv = acc;
        }

        for sb in 0..SUBBANDS {
            s[sb] = y
                .iter()
                .zip(self.matrix[sb].iter())
                .map(|(yv, m)| yv * m)
                .sum();
        }
    }
}

impl Default for SbcEncoder {
    fn default() -> Self {
        Self::new()
    }
}

// =======================================================================
// Decoder
// =======================================================================

/// Streaming wideband SBC decoder, mirror of [`SbcEncoder`].
pub struct SbcDecoder {
    window: [f64; 80],
    /// Synthesis modulation matrix, `[phase][subband]`.
    matrix: [[f64; SUBBANDS]; 16],
    /// Synthesis history.
    v: [f64; 160],
}

impl SbcDecoder {
    #[must_use]
    pub fn new() -> Self {
        let mut matrix = [[0.0f64; SUBBANDS]; 16];
        for (k, row) in matrix.iter_mut().enumerate() {
            for (sb, v) in row.iter_mut().enumerate() {
                *v = ((k as f64 + 4.0) * (2.0 * sb as f64 + 1.0) * PI / 16.0).cos();
            }
        }
        Self {
            window: proto_window(),
            matrix,
            v: [0.0; 160],
        }
    }

    /// Drop the filterbank history (stream restart).
    pub fn reset(&mut self) {
        self.v = [0.0; 160];
    }

    /// Decode a 57-byte payload into 120 samples.
    pub fn decode(&mut self, frame: &[u8], out: &mut [i16]) -> Result<(), FrameError> {
        debug_assert_eq!(frame.len(), FRAME_LEN);
        debug_assert_eq!(out.len(), FRAME_SAMPLES);

        if frame[0] != SYNCWORD {
            return Err(FrameError::BadSync);
        }
        if frame[3] != crc8(frame[1..3].iter().chain(frame[4..8].iter())) {
            return Err(FrameError::BadCrc);
        }

        let mut reader = BitReader::new(&frame[4..]);
        let mut scale_factors = [0u8; SUBBANDS];
        for sf in &mut scale_factors {
            *sf = reader.get(4) as u8;
        }
        let bits = bit_allocation(&scale_factors);

        for block in 0..BLOCKS {
            let mut s = [0.0f64; SUBBANDS];
            for sb in 0..SUBBANDS {
                if bits[sb] == 0 {
                    continue;
                }
                let levels = (1u32 << bits[sb]) - 1;
                let q = reader.get(bits[sb]);
                let norm = f64::from(1u32 << (scale_factors[sb] + 1));
                s[sb] = norm * ((2.0 * f64::from(q) + 1.0) / f64::from(levels) - 1.0);
            }
            let base = block * SUBBANDS;
            self.synthesize(&s, &mut out[base..base + SUBBANDS]);
        }
        Ok(())
    }

    /// Polyphase synthesis: 8 subband samples in, 8 PCM samples out.
    fn synthesize(&mut self, s: &[f64; SUBBANDS], out: &mut [i16]) {
        self.v.copy_within(0..144, 16);
        for k in 0..16 {
            self.v[k] = self.matrix[k]
                .iter()
                .zip(s.iter())
                .map(|(m, sv)| m * sv)
                .sum();
        }

        let mut u = [0.0f64; 80];
        for i in 0..5 {
            for j in 0..SUBBANDS {
                u[i * 16 + j] = self.v[i * 32 + j];
                u[i * 16 + j + 8] = self.v[i * 32 + j + 24];
            }
        }

        for (j, o) in out.iter_mut().enumerate() {
            let mut acc = 0.0;
            for i in 0..10 {
                let idx = j + SUBBANDS * i;
                acc += u[idx] * self.window[idx] * SUBBANDS as f64;
            }
            *o = acc.clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16;
        }
    }
}

impl Default for SbcDecoder {
    fn default() -> Self {
        Self::new()
    }
}
