// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 scobridge contributors

//! mSBC codec pipeline.
//!
//! Sits between the PCM FIFOs and the SCO socket when the transport
//! negotiated wideband speech. Four flip-flop buffers form the pipeline:
//!
//! ```text
//! speaker FIFO -> enc_pcm -> encode() -> enc_data -> SCO socket
//! SCO socket  -> dec_data -> decode() -> dec_pcm  -> microphone FIFO
//! ```
//!
//! Each 120-sample block becomes one 60-byte radio frame: a 2-byte H2
//! synchronization header, the 57-byte SBC payload and one padding byte.
//! The H2 sequence number walks 0x08, 0x38, 0xC8, 0xF8; a gap in the
//! sequence or a corrupt payload is replaced by one frame of silence so
//! capture timing never slips.

use crate::buffer::FlipBuffer;
use crate::codec::sbc::{self, SbcDecoder, SbcEncoder};

/// Radio frame length on the wire.
pub const RADIO_FRAME_LEN: usize = 60;
/// PCM bytes per frame (120 samples of 16-bit audio).
pub const FRAME_PCM_BYTES: usize = sbc::FRAME_SAMPLES * 2;

/// H2 header: fixed first octet.
const H2_MARKER: u8 = 0x01;
/// H2 header: second octet per 2-bit sequence number.
const H2_SEQUENCE: [u8; 4] = [0x08, 0x38, 0xC8, 0xF8];

/// Pipeline buffer depth, in frames.
const PIPELINE_FRAMES: usize = 3;

/// Wideband codec pipeline state.
pub struct MsbcPipeline {
    initialized: bool,
    encoder: SbcEncoder,
    decoder: SbcDecoder,
    /// PCM waiting to be encoded (speaker direction).
    pub enc_pcm: FlipBuffer,
    /// Radio frames ready for the SCO socket.
    pub enc_data: FlipBuffer,
    /// Radio bytes read from the SCO socket.
    pub dec_data: FlipBuffer,
    /// Decoded PCM waiting for the microphone FIFO.
    pub dec_pcm: FlipBuffer,
    /// Frames emitted since the pacing loop last collected them.
    enc_frames: u32,
    /// Next outgoing H2 sequence index.
    seq_out: u8,
    /// Last accepted incoming H2 sequence index.
    seq_in: Option<u8>,
}

impl MsbcPipeline {
    /// A finished (deallocated) pipeline. Call [`init`] before use.
    ///
    /// [`init`]: MsbcPipeline::init
    #[must_use]
    pub fn new() -> Self {
        Self {
            initialized: false,
            encoder: SbcEncoder::new(),
            decoder: SbcDecoder::new(),
            enc_pcm: FlipBuffer::new(0),
            enc_data: FlipBuffer::new(0),
            dec_data: FlipBuffer::new(0),
            dec_pcm: FlipBuffer::new(0),
            enc_frames: 0,
            seq_out: 0,
            seq_in: None,
        }
    }

    /// Allocate the four pipeline buffers and reset codec state. Calling
    /// `init` on a live pipeline restarts it (buffers rewound, sequence
    /// numbers and filterbank history dropped).
    pub fn init(&mut self) {
        if self.initialized {
            self.enc_pcm.rewind();
            self.enc_data.rewind();
            self.dec_data.rewind();
            self.dec_pcm.rewind();
        } else {
            self.enc_pcm = FlipBuffer::new(FRAME_PCM_BYTES * PIPELINE_FRAMES);
            self.enc_data = FlipBuffer::new(RADIO_FRAME_LEN * PIPELINE_FRAMES);
            self.dec_data = FlipBuffer::new(RADIO_FRAME_LEN * PIPELINE_FRAMES);
            self.dec_pcm = FlipBuffer::new(FRAME_PCM_BYTES * PIPELINE_FRAMES);
            self.initialized = true;
        }
        self.encoder.reset();
        self.decoder.reset();
        self.enc_frames = 0;
        self.seq_out = 0;
        self.seq_in = None;
    }

    /// Release the pipeline buffers. Idempotent.
    pub fn finish(&mut self) {
        if !self.initialized {
            return;
        }
        self.enc_pcm = FlipBuffer::new(0);
        self.enc_data = FlipBuffer::new(0);
        self.dec_data = FlipBuffer::new(0);
        self.dec_pcm = FlipBuffer::new(0);
        self.initialized = false;
    }

    /// Whether [`init`] has been called since construction/[`finish`].
    ///
    /// [`init`]: MsbcPipeline::init
    /// [`finish`]: MsbcPipeline::finish
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Frames emitted since the last call, for bit-rate pacing.
    pub fn take_enc_frames(&mut self) -> u32 {
        std::mem::take(&mut self.enc_frames)
    }

    /// Encode as many whole frames as input and output space allow.
    pub fn encode(&mut self) {
        if !self.initialized {
            return;
        }
        while self.enc_pcm.len_out() >= FRAME_PCM_BYTES
            && self.enc_data.len_in() >= RADIO_FRAME_LEN
        {
            let mut pcm = [0i16; sbc::FRAME_SAMPLES];
            for (sample, bytes) in pcm
                .iter_mut()
                .zip(self.enc_pcm.data()[..FRAME_PCM_BYTES].chunks_exact(2))
            {
                *sample = i16::from_le_bytes([bytes[0], bytes[1]]);
            }

            let mut frame = [0u8; RADIO_FRAME_LEN];
            frame[0] = H2_MARKER;
            frame[1] = H2_SEQUENCE[usize::from(self.seq_out)];
            self.encoder.encode(&pcm, &mut frame[2..2 + sbc::FRAME_LEN]);
            // frame[59] stays zero: padding

            self.enc_pcm.shift(FRAME_PCM_BYTES);
            self.enc_data.append(&frame);
            self.seq_out = (self.seq_out + 1) % 4;
            self.enc_frames += 1;
        }
    }

    /// Decode as many whole frames as input and output space allow.
    /// Sequence gaps, lost synchronization and corrupt payloads are
    /// replaced with silence.
    pub fn decode(&mut self) {
        if !self.initialized {
            return;
        }
        while self.dec_data.len_out() >= RADIO_FRAME_LEN
            && self.dec_pcm.len_in() >= FRAME_PCM_BYTES
        {
            let Some(offset) = find_h2(self.dec_data.data()) else {
                // No header anywhere in view: drop all but the last byte,
                // which may begin the next header, and mark the loss.
                let stale = self.dec_data.len_out() - 1;
                self.dec_data.shift(stale);
                log::warn!("[msbc] lost H2 synchronization, dropping {} bytes", stale);
                self.emit_silence();
                break;
            };
            if offset > 0 {
                log::warn!("[msbc] resynchronized, skipping {} bytes", offset);
                self.dec_data.shift(offset);
                self.emit_silence();
                continue;
            }

            let seq_index = H2_SEQUENCE
                .iter()
                .position(|&s| s == self.dec_data.data()[1])
                .unwrap_or(0) as u8;

            if let Some(last) = self.seq_in {
                let expected = (last + 1) % 4;
                if seq_index != expected && self.dec_pcm.len_in() >= 2 * FRAME_PCM_BYTES {
                    log::debug!(
                        "[msbc] sequence gap: expected {}, got {}",
                        expected,
                        seq_index
                    );
                    self.emit_silence();
                }
            }

            let mut pcm = [0i16; sbc::FRAME_SAMPLES];
            let result = {
                let payload = &self.dec_data.data()[2..2 + sbc::FRAME_LEN];
                self.decoder.decode(payload, &mut pcm)
            };
            match result {
                Ok(()) => {
                    let mut bytes = [0u8; FRAME_PCM_BYTES];
                    for (chunk, sample) in bytes.chunks_exact_mut(2).zip(pcm.iter()) {
                        chunk.copy_from_slice(&sample.to_le_bytes());
                    }
                    self.dec_pcm.append(&bytes);
                }
                Err(err) => {
                    log::warn!("[msbc] frame rejected ({:?}), substituting silence", err);
                    self.emit_silence();
                }
            }
            self.seq_in = Some(seq_index);
            self.dec_data.shift(RADIO_FRAME_LEN);
        }
    }

    fn emit_silence(&mut self) {
        if self.dec_pcm.len_in() >= FRAME_PCM_BYTES {
            self.dec_pcm.append(&[0u8; FRAME_PCM_BYTES]);
        }
    }
}

impl Default for MsbcPipeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Locate an H2 header (marker, sequence octet, SBC syncword) in `data`.
fn find_h2(data: &[u8]) -> Option<usize> {
    data.windows(3).position(|w| {
        w[0] == H2_MARKER && H2_SEQUENCE.contains(&w[1]) && w[2] == 0xAD
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm_frame(value: i16) -> [u8; FRAME_PCM_BYTES] {
        let mut bytes = [0u8; FRAME_PCM_BYTES];
        for chunk in bytes.chunks_exact_mut(2) {
            chunk.copy_from_slice(&value.to_le_bytes());
        }
        bytes
    }

    #[test]
    fn test_uninitialized_pipeline_is_inert() {
        let mut p = MsbcPipeline::new();
        assert!(!p.is_initialized());
        p.encode();
        p.decode();
        assert_eq!(p.take_enc_frames(), 0);
    }

    #[test]
    fn test_one_block_one_frame() {
        let mut p = MsbcPipeline::new();
        p.init();

        p.enc_pcm.append(&pcm_frame(0));
        p.encode();
        assert_eq!(p.enc_data.len_out(), RADIO_FRAME_LEN);
        assert_eq!(p.take_enc_frames(), 1);
        assert_eq!(p.enc_pcm.len_out(), 0);

        // partial input produces nothing
        p.enc_pcm.append(&pcm_frame(0)[..FRAME_PCM_BYTES - 2]);
        p.encode();
        assert_eq!(p.enc_data.len_out(), RADIO_FRAME_LEN);
        assert_eq!(p.take_enc_frames(), 0);
    }

    #[test]
    fn test_h2_sequence_cycles() {
        let mut p = MsbcPipeline::new();
        p.init();

        let mut seen = Vec::new();
        for _ in 0..6 {
            p.enc_pcm.append(&pcm_frame(0));
            p.encode();
            let frame = &p.enc_data.data()[..RADIO_FRAME_LEN];
            assert_eq!(frame[0], 0x01);
            seen.push(frame[1]);
            p.enc_data.shift(RADIO_FRAME_LEN);
        }
        assert_eq!(seen, [0x08, 0x38, 0xC8, 0xF8, 0x08, 0x38]);
    }

    #[test]
    fn test_samples_in_equals_samples_out() {
        // Each 120-sample block becomes exactly one 60-byte frame and
        // decodes back to exactly 120 samples.
        let mut p = MsbcPipeline::new();
        p.init();

        let mut frames = 0usize;
        let mut pcm_out = 0usize;
        for _ in 0..8 {
            p.enc_pcm.append(&pcm_frame(1000));
            p.encode();
            while p.enc_data.len_out() >= RADIO_FRAME_LEN {
                let frame: Vec<u8> = p.enc_data.data()[..RADIO_FRAME_LEN].to_vec();
                p.enc_data.shift(RADIO_FRAME_LEN);
                p.dec_data.append(&frame);
                frames += 1;
            }
            p.decode();
            pcm_out += p.dec_pcm.len_out();
            let drained = p.dec_pcm.len_out();
            p.dec_pcm.shift(drained);
        }
        assert_eq!(frames, 8);
        assert_eq!(pcm_out, 8 * FRAME_PCM_BYTES);
    }

    #[test]
    fn test_corrupt_frame_becomes_silence() {
        let mut p = MsbcPipeline::new();
        p.init();

        p.enc_pcm.append(&pcm_frame(4000));
        p.encode();
        let mut frame: Vec<u8> = p.enc_data.data()[..RADIO_FRAME_LEN].to_vec();
        p.enc_data.shift(RADIO_FRAME_LEN);
        frame[6] ^= 0xFF; // corrupt a scale-factor byte, CRC must catch it

        p.dec_data.append(&frame);
        p.decode();
        assert_eq!(p.dec_pcm.len_out(), FRAME_PCM_BYTES);
        assert!(p.dec_pcm.data().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_resync_after_garbage() {
        let mut p = MsbcPipeline::new();
        p.init();

        p.enc_pcm.append(&pcm_frame(0));
        p.encode();
        let frame: Vec<u8> = p.enc_data.data()[..RADIO_FRAME_LEN].to_vec();
        p.enc_data.shift(RADIO_FRAME_LEN);

        // leading garbage shorter than a frame
        p.dec_data.append(&[0u8; 7]);
        p.dec_data.append(&frame);
        p.decode();

        // one silence frame for the lost span, one decoded frame
        assert_eq!(p.dec_pcm.len_out(), 2 * FRAME_PCM_BYTES);
    }

    #[test]
    fn test_finish_is_idempotent() {
        let mut p = MsbcPipeline::new();
        p.init();
        assert!(p.is_initialized());
        p.finish();
        p.finish();
        assert!(!p.is_initialized());
        assert_eq!(p.enc_pcm.capacity(), 0);
    }
}
