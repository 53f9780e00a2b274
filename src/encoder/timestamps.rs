// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decode timestamp reconstruction.
//!
//! Pictures are output in encode order, which differs from the display order the presentation
//! timestamps were given in. The decode timestamp of the n-th output picture is the presentation
//! timestamp of the (n - decode_delay)-th input frame, so the ring keeps enough input timestamps
//! around to cover the reorder delay and the pictures in flight.

use log::trace;

use crate::encoder::picture::MAX_ASYNC_DEPTH;
use crate::encoder::picture::MAX_REORDER_DELAY;

pub struct TimestampRing {
    ring: Vec<i64>,
    output_delay: u64,
    decode_delay: u64,
    first_pts: i64,
    /// Offset between the first presentation and decode timestamps
    dts_pts_diff: i64,
    last_dts: Option<i64>,
}

impl TimestampRing {
    pub fn new(output_delay: u64, decode_delay: u64, async_depth: u32) -> Self {
        let len = (3 * output_delay as usize + async_depth as usize)
            .clamp(1, 3 * MAX_REORDER_DELAY + MAX_ASYNC_DEPTH);

        Self {
            ring: vec![0; len],
            output_delay,
            decode_delay,
            first_pts: 0,
            dts_pts_diff: 0,
            last_dts: None,
        }
    }

    fn slot(&self, order: u64) -> usize {
        (order % self.ring.len() as u64) as usize
    }

    /// Records the presentation timestamp of the `input_order`-th frame.
    pub fn record_input(&mut self, input_order: u64, pts: i64) {
        if input_order == 0 {
            self.first_pts = pts;
        }

        if input_order == self.decode_delay {
            self.dts_pts_diff = pts.saturating_sub(self.first_pts);
        }

        if self.output_delay > 0 {
            let slot = self.slot(input_order);
            self.ring[slot] = pts;
        }
    }

    /// The stream ended after `input_order` frames, the last one at `tail_pts`. If the decode
    /// delay never elapsed the offset is taken from the frames that did arrive.
    pub fn end_of_stream(&mut self, input_order: u64, tail_pts: i64) {
        if input_order <= self.decode_delay {
            self.dts_pts_diff = tail_pts.saturating_sub(self.first_pts);
            trace!("stream ended early, dts offset {}", self.dts_pts_diff);
        }
    }

    /// Decode timestamp of the picture with encode order `encode_order`. Never lower than the
    /// previously returned one.
    pub fn dts(&mut self, encode_order: u64, pts: i64, no_delay: bool) -> i64 {
        let dts = if no_delay || self.output_delay == 0 {
            pts
        } else if encode_order < self.decode_delay {
            let slot = self.slot(encode_order);
            self.ring[slot]
                .checked_sub(self.dts_pts_diff)
                .unwrap_or(i64::MIN)
        } else {
            let slot = self.slot(encode_order - self.decode_delay);
            self.ring[slot]
        };

        let dts = match self.last_dts {
            Some(last) if dts < last => {
                log::warn!("decode timestamp {} went backwards, clamping to {}", dts, last);
                last
            }
            _ => dts,
        };

        self.last_dts = Some(dts);
        dts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::tests::PTS_30FPS_MS;

    #[test]
    fn test_dts_lags_by_decode_delay() {
        let mut ring = TimestampRing::new(1, 1, 2);
        let mut recorded = 0;

        // Display orders in encode order with one B-picture per P-picture. The n-th picture is
        // output once the frame following it in display order was admitted.
        let display = [0usize, 2, 1, 4, 3, 6, 5, 7];
        let dts: Vec<i64> = display
            .iter()
            .enumerate()
            .map(|(n, d)| {
                while recorded <= (n + 1).min(PTS_30FPS_MS.len() - 1) {
                    ring.record_input(recorded as u64, PTS_30FPS_MS[recorded]);
                    recorded += 1;
                }
                ring.dts(n as u64, PTS_30FPS_MS[*d], false)
            })
            .collect();

        assert_eq!(dts, [-33, 0, 33, 67, 100, 133, 167, 200]);
    }

    #[test]
    fn test_no_reordering_uses_pts() {
        let mut ring = TimestampRing::new(0, 0, 4);
        ring.record_input(0, 10);
        ring.record_input(1, 20);
        assert_eq!(ring.dts(0, 10, false), 10);
        assert_eq!(ring.dts(1, 20, false), 20);

        let mut ring = TimestampRing::new(2, 1, 4);
        ring.record_input(0, 10);
        assert_eq!(ring.dts(0, 10, true), 10);
    }

    #[test]
    fn test_dts_never_decreases() {
        let mut ring = TimestampRing::new(1, 1, 1);
        ring.record_input(0, 100);
        ring.record_input(1, 50);
        ring.record_input(2, 10);

        let first = ring.dts(0, 100, false);
        assert_eq!(first, 150);
        // ring[0] = 100 < 150
        assert_eq!(ring.dts(1, 10, false), 150);
    }

    #[test]
    fn test_end_of_stream_before_decode_delay() {
        let mut ring = TimestampRing::new(2, 2, 2);
        ring.record_input(0, 1000);
        ring.end_of_stream(1, 1000);
        assert_eq!(ring.dts(0, 1000, false), 1000);
    }

    #[test]
    fn test_dts_saturates() {
        let mut ring = TimestampRing::new(1, 1, 1);
        ring.record_input(0, i64::MIN + 5);
        ring.record_input(1, 100);
        assert_eq!(ring.dts(0, 0, false), i64::MIN);
    }
}
