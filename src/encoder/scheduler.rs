// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Selection of the next picture to encode.
//!
//! Pictures arrive in display order. B-pictures are coded after the top layer picture following
//! them, so the scheduler holds frames back until it knows which picture ends the current group
//! of B-pictures, then lays out the group and hands the pictures out in encode order.

use log::debug;

use crate::encoder::gop::GopStructure;
use crate::encoder::picture::PicHandle;
use crate::encoder::picture::PictureType;
use crate::encoder::references::ReferenceBuilder;
use crate::encoder::window::Window;
use crate::encoder::EncodeError;
use crate::encoder::EncodeResult;

/// Observable state of the scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerState {
    /// No picture is waiting to be encoded.
    Idle,
    /// Frames are buffered until the GOP structure or the timestamps allow to pick one.
    Accumulating,
    Scheduling,
    /// End of stream was signalled, the remaining pictures are flushed.
    Draining,
}

/// Outcome of [`Scheduler::pick_next`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pick {
    /// The picture to issue next. Its type and references are set.
    Picture(PicHandle),
    /// More input frames are required before a picture can be picked.
    NeedMoreInput,
    /// Every picture has been picked but some are still in flight.
    Pending,
    /// Every picture has been encoded.
    EndOfStream,
}

pub struct Scheduler {
    gop: GopStructure,
    references: ReferenceBuilder,

    /// Number of frames admitted so far
    input_order: u64,
    /// Encode order of the next picture leaving the pipeline
    encode_order: u64,
    /// Encode order of the last output picture
    output_order: Option<u64>,
    end_of_stream: bool,
}

impl Scheduler {
    pub fn new(gop: GopStructure) -> Self {
        let references = ReferenceBuilder::new(gop.multi_reference);

        Self {
            gop,
            references,
            input_order: 0,
            encode_order: 0,
            output_order: None,
            end_of_stream: false,
        }
    }

    pub fn gop(&self) -> &GopStructure {
        &self.gop
    }

    pub fn input_order(&self) -> u64 {
        self.input_order
    }

    pub fn output_order(&self) -> Option<u64> {
        self.output_order
    }

    pub fn end_of_stream(&self) -> bool {
        self.end_of_stream
    }

    /// Takes the display order of a newly admitted frame.
    pub(crate) fn next_input(&mut self) -> u64 {
        let input_order = self.input_order;
        self.input_order += 1;
        input_order
    }

    pub(crate) fn signal_end_of_stream(&mut self) {
        debug!("end of stream after {} frames", self.input_order);
        self.end_of_stream = true;
    }

    /// Encode order of a picture issued while `queued` pictures wait in the pipeline.
    pub(crate) fn encode_order_for(&self, queued: usize) -> u64 {
        self.encode_order + queued as u64
    }

    /// Called once the picture with `encode_order` left the pipeline, either because it was
    /// output or because it was issued to a backend without pipelining.
    pub(crate) fn advance(&mut self, encode_order: u64) {
        self.encode_order = encode_order + 1;
    }

    pub(crate) fn output_done(&mut self, encode_order: u64) {
        self.output_order = Some(encode_order);
    }

    pub fn state<P>(&self, window: &Window<P>) -> SchedulerState {
        if self.end_of_stream {
            SchedulerState::Draining
        } else if !window.iter().any(|(_, pic)| !pic.encode_issued) {
            SchedulerState::Idle
        } else if self.input_order <= self.gop.decode_delay() {
            SchedulerState::Accumulating
        } else {
            SchedulerState::Scheduling
        }
    }

    /// Picks the next picture to issue, deciding its type and building its references.
    pub fn pick_next<P>(&mut self, window: &mut Window<P>) -> EncodeResult<Pick> {
        if let Some(pic) = Self::ready_b_picture(window)? {
            debug!(
                "pick B-picture at depth {} to encode next",
                window.get(pic)?.b_depth
            );
            return Ok(Pick::Picture(pic));
        }

        let handles: Vec<PicHandle> = window.handles().collect();

        // Find the b_per_p-th available picture to become the next top layer picture.
        let closed_gop_end = self.gop.closed_gop_end();
        let mut start = None;
        let mut picked = None;
        let mut b_counter = 0;
        for (i, &h) in handles.iter().enumerate() {
            let pic = window.get(h)?;
            if pic.encode_issued {
                start = Some(i);
                continue;
            }

            // Start a new GOP right away on a forced IDR picture.
            if pic.force_idr
                || b_counter == self.gop.b_per_p
                || self.gop.reaches_gop_end(b_counter, closed_gop_end)
            {
                picked = Some(i);
                break;
            }

            // The picture preceding a forced IDR picture closes the group.
            if let Some(next) = handles.get(i + 1) {
                if window.get(*next)?.force_idr {
                    picked = Some(i);
                    break;
                }
            }

            b_counter += 1;
        }

        if picked.is_none() && self.end_of_stream {
            // The last picture of the stream has to be in the top layer.
            let Some(tail) = handles.len().checked_sub(1) else {
                return Ok(Pick::EndOfStream);
            };
            let pic = window.get(handles[tail])?;
            if pic.encode_complete {
                return Ok(Pick::EndOfStream);
            } else if pic.encode_issued {
                return Ok(Pick::Pending);
            }

            b_counter -= 1;
            picked = Some(tail);
        }

        let Some(picked) = picked else {
            debug!("pick nothing to encode next, need more input for reference pictures");
            return Ok(Pick::NeedMoreInput);
        };

        if self.input_order <= self.gop.decode_delay() && !self.end_of_stream {
            debug!("pick nothing to encode next, need more input for timestamps");
            return Ok(Pick::NeedMoreInput);
        }

        let pic = handles[picked];
        let force_idr = window.get(pic)?.force_idr;
        let pic_type = self.gop.decide(force_idr, b_counter);
        {
            let picture = window.get_mut(pic)?;
            picture.pic_type = pic_type;
            picture.is_reference = true;
            picture.b_depth = 0;
        }

        if pic_type != PictureType::Idr && start.is_none() {
            log::error!(
                "no picture to predict picture {} from",
                window.get(pic)?.display_order
            );
            return Err(EncodeError::InvalidInternalState);
        }

        self.references
            .build_anchor(window, pic, start.map(|i| handles[i]), b_counter)?;

        let last = match start {
            Some(start) if b_counter > 0 => ReferenceBuilder::set_b_pictures(
                window,
                &handles[..=picked],
                start,
                picked,
                pic,
                1,
                self.gop.max_b_depth,
            )?,
            _ => pic,
        };
        self.references.add_next_prev(window, last)?;

        Ok(Pick::Picture(pic))
    }

    /// Earliest B-picture not issued yet whose references all are.
    fn ready_b_picture<P>(window: &Window<P>) -> EncodeResult<Option<PicHandle>> {
        for (h, pic) in window.iter() {
            if pic.encode_issued || pic.pic_type != PictureType::B {
                continue;
            }

            let mut refs = pic.refs[0].iter().chain(pic.refs[1].iter());
            let ready = refs.try_fold(true, |ready, r| {
                Ok::<_, EncodeError>(ready && window.get(*r)?.encode_issued)
            })?;

            if ready {
                return Ok(Some(h));
            }
        }

        Ok(None)
    }

    /// Drops the top layer pictures kept as future references. Called once no picture will be
    /// picked anymore.
    pub(crate) fn release_references<P>(&mut self, window: &mut Window<P>) -> EncodeResult<()> {
        self.references.release_next_prev(window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::lifecycle;
    use crate::encoder::picture::Picture;
    use crate::encoder::references::ReferenceSet;
    use crate::encoder::stateless::BackendCapabilities;
    use crate::encoder::EncoderConfig;

    struct Harness {
        scheduler: Scheduler,
        window: Window<()>,
        /// Display orders in the order they were picked
        picked: Vec<u64>,
    }

    impl Harness {
        fn new(config: EncoderConfig, caps: BackendCapabilities) -> Self {
            let gop = GopStructure::new(&config, &caps).unwrap();
            Self {
                scheduler: Scheduler::new(gop),
                window: Window::new(),
                picked: Vec::new(),
            }
        }

        fn admit(&mut self, force_idr: bool) {
            let order = self.scheduler.next_input();
            self.window.admit(Picture::new(order, Default::default(), order == 0 || force_idr, ()));
        }

        /// Picks and immediately completes everything that can be picked.
        fn run(&mut self) -> Pick {
            loop {
                match self.scheduler.pick_next(&mut self.window).unwrap() {
                    Pick::Picture(h) => {
                        let pic = self.window.get_mut(h).unwrap();
                        pic.encode_order = Some(self.picked.len() as u64);
                        pic.encode_issued = true;
                        pic.encode_complete = true;
                        self.picked.push(pic.display_order());
                        lifecycle::clear_old(&mut self.window, false).unwrap();
                    }
                    other => return other,
                }
            }
        }

        fn pic(&self, display_order: u64) -> PicHandle {
            self.window
                .iter()
                .find(|(_, pic)| pic.display_order() == display_order)
                .map(|(h, _)| h)
                .unwrap()
        }
    }

    fn config(gop_size: u32, max_b_frames: u32, b_depth: u32) -> EncoderConfig {
        EncoderConfig {
            gop_size,
            max_b_frames,
            b_depth,
            ..Default::default()
        }
    }

    #[test]
    fn test_waits_for_decode_delay() {
        let mut h = Harness::new(config(30, 1, 1), Default::default());

        h.admit(false);
        assert_eq!(h.scheduler.state(&h.window), SchedulerState::Accumulating);
        // The IDR picture could be picked, but the timestamps need one more frame
        assert_eq!(h.run(), Pick::NeedMoreInput);
        assert!(h.picked.is_empty());

        h.admit(false);
        assert_eq!(h.run(), Pick::NeedMoreInput);
        assert_eq!(h.picked, [0]);
    }

    #[test]
    fn test_one_b_per_p() {
        let mut h = Harness::new(config(8, 1, 1), Default::default());

        for _ in 0..8 {
            h.admit(false);
            h.run();
        }
        h.scheduler.signal_end_of_stream();
        assert_eq!(h.scheduler.state(&h.window), SchedulerState::Draining);
        assert_eq!(h.run(), Pick::EndOfStream);

        assert_eq!(h.picked, [0, 2, 1, 4, 3, 6, 5, 7]);
    }

    #[test]
    fn test_gop_boundary_is_top_layer() {
        let mut h = Harness::new(config(4, 1, 1), Default::default());

        for _ in 0..8 {
            h.admit(false);
            h.run();
        }
        h.scheduler.signal_end_of_stream();
        h.run();

        assert_eq!(h.picked, [0, 2, 1, 3, 4, 6, 5, 7]);
    }

    #[test]
    fn test_hierarchical_group() {
        let mut h = Harness::new(config(30, 3, 2), Default::default());

        for _ in 0..5 {
            h.admit(false);
        }
        // Keep the top layer picture referenced so the group can be inspected
        let pick = h.scheduler.pick_next(&mut h.window).unwrap();
        let Pick::Picture(idr) = pick else {
            panic!("unexpected pick {pick:?}");
        };
        h.window.get_mut(idr).unwrap().encode_issued = true;

        let Pick::Picture(p) = h.scheduler.pick_next(&mut h.window).unwrap() else {
            panic!("no anchor picked");
        };
        assert_eq!(h.window.get(p).unwrap().display_order(), 4);
        assert_eq!(h.window.get(p).unwrap().pic_type(), PictureType::P);
        h.window.get_mut(p).unwrap().encode_issued = true;

        let mid = h.pic(2);
        assert_eq!(h.window.get(mid).unwrap().b_depth(), 1);
        assert!(h.window.get(mid).unwrap().is_reference());
        assert_eq!(
            ReferenceBuilder::references(&h.window, mid).unwrap(),
            ReferenceSet {
                past: vec![0],
                future: vec![4],
                dpb: vec![2, 0, 4],
            }
        );

        let mut order = Vec::new();
        while let Pick::Picture(b) = h.scheduler.pick_next(&mut h.window).unwrap() {
            let pic = h.window.get_mut(b).unwrap();
            pic.encode_issued = true;
            order.push((pic.display_order(), pic.b_depth()));
        }
        assert_eq!(order, [(2, 1), (1, 2), (3, 2)]);
    }

    #[test]
    fn test_forced_idr_closes_group() {
        let mut h = Harness::new(config(30, 2, 1), Default::default());

        for i in 0..6 {
            h.admit(i == 3);
            h.run();
        }
        h.scheduler.signal_end_of_stream();
        h.run();

        // Picture 2 precedes the forced IDR picture and closes the group early
        assert_eq!(h.picked, [0, 2, 1, 3, 5, 4]);
        let idr = h.window.iter().find(|(_, pic)| pic.display_order() == 3);
        assert!(idr.map_or(true, |(_, pic)| pic.pic_type() == PictureType::Idr));
    }

    #[test]
    fn test_end_of_stream_flushes_tail() {
        let mut h = Harness::new(config(30, 2, 1), Default::default());

        for _ in 0..3 {
            h.admit(false);
        }
        assert_eq!(h.run(), Pick::NeedMoreInput);
        assert_eq!(h.picked, [0]);

        h.scheduler.signal_end_of_stream();
        assert_eq!(h.run(), Pick::EndOfStream);
        // The tail becomes a P-picture with a single B-picture before it
        assert_eq!(h.picked, [0, 2, 1]);
    }

    #[test]
    fn test_pending_tail_at_end_of_stream() {
        let mut h = Harness::new(config(30, 0, 1), Default::default());

        h.admit(false);
        h.scheduler.signal_end_of_stream();
        let Pick::Picture(pic) = h.scheduler.pick_next(&mut h.window).unwrap() else {
            panic!("nothing picked");
        };
        h.window.get_mut(pic).unwrap().encode_issued = true;

        assert_eq!(h.scheduler.pick_next(&mut h.window).unwrap(), Pick::Pending);
        h.window.get_mut(pic).unwrap().encode_complete = true;
        assert_eq!(h.scheduler.pick_next(&mut h.window).unwrap(), Pick::EndOfStream);
    }

    #[test]
    fn test_multi_reference_uses_two_past_pictures() {
        let caps = BackendCapabilities {
            max_l0_refs: 2,
            ..Default::default()
        };
        let mut h = Harness::new(config(30, 0, 1), caps);

        for _ in 0..3 {
            h.admit(false);
        }
        let mut picks = Vec::new();
        for _ in 0..3 {
            let Pick::Picture(pic) = h.scheduler.pick_next(&mut h.window).unwrap() else {
                panic!("nothing picked");
            };
            h.window.get_mut(pic).unwrap().encode_issued = true;
            picks.push(pic);
        }

        let refs = ReferenceBuilder::references(&h.window, picks[2]).unwrap();
        assert_eq!(refs.past, [1, 0]);
        assert!(refs.future.is_empty());
    }
}
