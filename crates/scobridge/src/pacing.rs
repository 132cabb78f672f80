// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 scobridge contributors

//! Wall-clock rate synchronizer.
//!
//! Keeps the transfer loop at a constant bit rate: after processing a batch
//! of audio frames the loop calls [`RateSync::sync`], which sleeps until the
//! cumulative frame count catches up with real time. The synchronizer also
//! measures how much of each period was spent working (not sleeping), which
//! the transport publishes as client-visible processing delay.

use std::time::{Duration, Instant};

/// Constant-rate pacing primitive for one audio stream.
#[derive(Debug)]
pub struct RateSync {
    /// Frames per second this stream is paced at.
    rate: u32,
    /// Cumulative frames emitted since [`RateSync::init`].
    frames: u64,
    /// Pacing origin; `frames / rate` seconds after this is the deadline.
    origin: Instant,
    /// End of the previous `sync` call, for busy-time measurement.
    last: Instant,
    /// Work time of the most recent period.
    busy: Duration,
}

impl RateSync {
    /// A synchronizer that has not been started yet ([`frames`] == 0).
    ///
    /// [`frames`]: RateSync::frames
    #[must_use]
    pub fn idle() -> Self {
        let now = Instant::now();
        Self {
            rate: 0,
            frames: 0,
            origin: now,
            last: now,
            busy: Duration::ZERO,
        }
    }

    /// (Re)start pacing at `rate` frames per second from the current
    /// instant.
    pub fn init(&mut self, rate: u32) {
        let now = Instant::now();
        self.rate = rate;
        self.frames = 0;
        self.origin = now;
        self.last = now;
        self.busy = Duration::ZERO;
    }

    /// Cumulative frames emitted since the last [`init`]. Zero means the
    /// synchronizer wants (re)initialization.
    ///
    /// [`init`]: RateSync::init
    #[must_use]
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Forget pacing progress so the next loop iteration reinitializes.
    pub fn reset(&mut self) {
        self.frames = 0;
    }

    /// Account `frames` emitted frames and sleep until wall-clock time has
    /// caught up with the cumulative frame count.
    pub fn sync(&mut self, frames: u32) {
        let now = Instant::now();
        self.busy = now - self.last;

        self.frames += u64::from(frames);
        if self.rate > 0 {
            let nanos = self
                .frames
                .saturating_mul(1_000_000_000)
                .checked_div(u64::from(self.rate))
                .unwrap_or(0);
            let deadline = self.origin + Duration::from_nanos(nanos);
            if let Some(remaining) = deadline.checked_duration_since(now) {
                std::thread::sleep(remaining);
            }
        }

        self.last = Instant::now();
    }

    /// Work time of the most recent period, in microseconds. This is the
    /// time between the previous `sync` returning and the next one being
    /// called, i.e. everything except the pacing sleep.
    #[must_use]
    pub fn busy_usec(&self) -> u64 {
        self.busy.as_micros() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_wants_init() {
        let rs = RateSync::idle();
        assert_eq!(rs.frames(), 0);
        assert_eq!(rs.busy_usec(), 0);
    }

    #[test]
    fn test_sync_accumulates_frames() {
        let mut rs = RateSync::idle();
        rs.init(48_000);
        rs.sync(480);
        rs.sync(480);
        assert_eq!(rs.frames(), 960);
    }

    #[test]
    fn test_sync_paces_to_real_time() {
        let mut rs = RateSync::idle();
        rs.init(8000);
        let start = Instant::now();
        // 800 frames at 8 kHz is 100 ms of audio; with no work in between
        // the synchronizer must sleep roughly that long.
        rs.sync(800);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(90), "paced too fast: {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(400), "paced too slow: {:?}", elapsed);
    }

    #[test]
    fn test_zero_work_reports_negligible_busy_time() {
        let mut rs = RateSync::idle();
        rs.init(8000);
        let start = Instant::now();
        rs.sync(160); // 20 ms
        rs.sync(160); // 20 ms, no work in between
        let elapsed = start.elapsed().as_micros() as u64;
        // busy/elapsed stays below a small epsilon when the loop does no work
        assert!(rs.busy_usec() * 100 < elapsed.max(1) * 5);
    }

    #[test]
    fn test_reset_requests_reinit() {
        let mut rs = RateSync::idle();
        rs.init(16_000);
        rs.sync(120);
        assert!(rs.frames() > 0);
        rs.reset();
        assert_eq!(rs.frames(), 0);
    }
}
