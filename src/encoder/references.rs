// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Reference picture lists and DPB construction.
//!
//! Every role a picture takes in another picture's lists (reference, DPB entry, previous picture
//! in encode order) retains it once on both [`RefLevel`]s. The references are released by the
//! [`lifecycle`](crate::encoder::lifecycle) module.

use log::trace;

use crate::encoder::picture::PicHandle;
use crate::encoder::picture::PictureType;
use crate::encoder::picture::RefLevel;
use crate::encoder::picture::MAX_DPB_SIZE;
use crate::encoder::picture::MAX_PICTURE_REFERENCES;
use crate::encoder::window::Window;
use crate::encoder::EncodeError;
use crate::encoder::EncodeResult;

/// Roles in which a picture is added to another picture's lists.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct RefUsage {
    /// Used for prediction, in list 0 or list 1 depending on the display order
    pub reference: bool,
    /// Kept in the DPB after the picture is decoded
    pub dpb: bool,
    /// Previous reference picture in encode order
    pub prev: bool,
}

impl RefUsage {
    const REFERENCE_AND_DPB: Self = Self {
        reference: true,
        dpb: true,
        prev: false,
    };
    const DPB: Self = Self {
        reference: false,
        dpb: true,
        prev: false,
    };
    const PREV: Self = Self {
        reference: false,
        dpb: false,
        prev: true,
    };
}

/// Reference lists and DPB of a picture, as display orders.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReferenceSet {
    pub past: Vec<u64>,
    pub future: Vec<u64>,
    pub dpb: Vec<u64>,
}

/// Builds the reference lists of newly picked pictures and tracks the most recent top layer
/// pictures available as references.
#[derive(Debug, Default)]
pub struct ReferenceBuilder {
    /// Pictures to use as previous references, oldest first
    next_prev: Vec<PicHandle>,
    /// Use every picture in `next_prev` as a past reference instead of only the closest one
    multi_reference: bool,
}

impl ReferenceBuilder {
    pub fn new(multi_reference: bool) -> Self {
        Self {
            next_prev: Vec::with_capacity(MAX_PICTURE_REFERENCES),
            multi_reference,
        }
    }

    /// Adds `target` to the lists of `pic` in the roles given by `usage`.
    pub(crate) fn add_ref<P>(
        window: &mut Window<P>,
        pic: PicHandle,
        target: PicHandle,
        usage: RefUsage,
    ) -> EncodeResult<()> {
        let target_display_order = window.get(target)?.display_order;
        let picture = window.get_mut(pic)?;
        let mut refs = 0;

        if usage.reference {
            if pic == target
                || picture.refs[0].len() >= MAX_PICTURE_REFERENCES
                || picture.refs[1].len() >= MAX_PICTURE_REFERENCES
            {
                log::error!(
                    "cannot add picture {} as reference of {}",
                    target_display_order,
                    picture.display_order
                );
                return Err(EncodeError::InvalidReferenceState);
            }

            let list = if target_display_order < picture.display_order {
                0
            } else {
                1
            };
            picture.refs[list].push(target);
            refs += 1;
        }

        if usage.dpb {
            if picture.dpb.len() >= MAX_DPB_SIZE {
                log::error!("DPB of picture {} is full", picture.display_order);
                return Err(EncodeError::InvalidReferenceState);
            }

            picture.dpb.push(target);
            refs += 1;
        }

        if usage.prev {
            if picture.prev.is_some() {
                return Err(EncodeError::InvalidReferenceState);
            }

            picture.prev = Some(target);
            refs += 1;
        }

        window.get_mut(target)?.retain(refs);
        Ok(())
    }

    /// Fills the lists of a newly picked top layer picture. `start` is the last issued picture
    /// preceding it in display order and `b_counter` the number of B-pictures in between.
    pub(crate) fn build_anchor<P>(
        &self,
        window: &mut Window<P>,
        pic: PicHandle,
        start: Option<PicHandle>,
        b_counter: u32,
    ) -> EncodeResult<()> {
        Self::add_ref(window, pic, pic, RefUsage::DPB)?;

        let pic_type = window.get(pic)?.pic_type;
        if pic_type == PictureType::Idr {
            return Ok(());
        }

        let usage = RefUsage {
            reference: !pic_type.is_key(),
            dpb: b_counter > 0,
            prev: false,
        };

        if self.multi_reference {
            for target in self.nearest_first(window, pic)? {
                Self::add_ref(window, pic, target, usage)?;
            }
        } else {
            let start = start.ok_or_else(|| {
                log::error!("no issued picture to predict from");
                EncodeError::InvalidReferenceState
            })?;
            Self::add_ref(window, pic, start, usage)?;
        }

        let prev = *self
            .next_prev
            .last()
            .ok_or(EncodeError::InvalidReferenceState)?;
        Self::add_ref(window, pic, prev, RefUsage::PREV)
    }

    /// The retained previous pictures ordered by temporal distance to `pic`, ties going to the
    /// earlier picture.
    fn nearest_first<P>(&self, window: &Window<P>, pic: PicHandle) -> EncodeResult<Vec<PicHandle>> {
        let display_order = window.get(pic)?.display_order;

        let mut candidates = self
            .next_prev
            .iter()
            .map(|h| Ok((*h, window.get(*h)?.display_order)))
            .collect::<EncodeResult<Vec<_>>>()?;
        candidates.sort_by_key(|(_, order)| (display_order.abs_diff(*order), *order));

        Ok(candidates.into_iter().map(|(h, _)| h).collect())
    }

    /// Lays out the pictures strictly between `order[start]` and `order[end]` as a hierarchy of
    /// B-pictures starting at `depth`. `prev` is the last reference picture in encode order.
    /// Returns the last reference picture in encode order once the layout is done.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn set_b_pictures<P>(
        window: &mut Window<P>,
        order: &[PicHandle],
        start: usize,
        end: usize,
        prev: PicHandle,
        depth: u32,
        max_b_depth: u32,
    ) -> EncodeResult<PicHandle> {
        if start + 1 >= end || end >= order.len() {
            return Err(EncodeError::InvalidInternalState);
        }

        // At the maximum depth, or with a single picture left, nothing would reference further
        // B-pictures.
        if depth >= max_b_depth || start + 2 == end {
            for &pic in &order[start + 1..end] {
                Self::mark_b(window, pic, depth, false)?;
                Self::add_ref(window, pic, order[start], RefUsage::REFERENCE_AND_DPB)?;
                Self::add_ref(window, pic, order[end], RefUsage::REFERENCE_AND_DPB)?;
                Self::add_ref(window, pic, prev, RefUsage::PREV)?;
                Self::add_future_chain(window, pic, order[end])?;
            }

            return Ok(prev);
        }

        // Split at the midpoint with a referenced B-picture and descend into each side.
        let len = end - start - 1;
        let mut i = 1;
        while 2 * i < len {
            i += 1;
        }
        let mid = start + i;
        let pic = order[mid];

        Self::mark_b(window, pic, depth, true)?;
        Self::add_ref(window, pic, pic, RefUsage::DPB)?;
        Self::add_ref(window, pic, order[start], RefUsage::REFERENCE_AND_DPB)?;
        Self::add_ref(window, pic, order[end], RefUsage::REFERENCE_AND_DPB)?;
        Self::add_ref(window, pic, prev, RefUsage::PREV)?;
        Self::add_future_chain(window, pic, order[end])?;

        let next = if i > 1 {
            Self::set_b_pictures(window, order, start, mid, pic, depth + 1, max_b_depth)?
        } else {
            pic
        };

        Self::set_b_pictures(window, order, mid, end, next, depth + 1, max_b_depth)
    }

    fn mark_b<P>(
        window: &mut Window<P>,
        pic: PicHandle,
        depth: u32,
        is_reference: bool,
    ) -> EncodeResult<()> {
        let picture = window.get_mut(pic)?;
        picture.pic_type = PictureType::B;
        picture.b_depth = depth;
        picture.is_reference = is_reference;
        trace!(
            "picture {} is B at depth {} (reference: {})",
            picture.display_order,
            depth,
            is_reference
        );
        Ok(())
    }

    /// Keeps the future references of `end`, and theirs, in the DPB of `pic`.
    fn add_future_chain<P>(
        window: &mut Window<P>,
        pic: PicHandle,
        end: PicHandle,
    ) -> EncodeResult<()> {
        let mut next = window.get(end)?.refs[1].first().copied();
        while let Some(target) = next {
            Self::add_ref(window, pic, target, RefUsage::DPB)?;
            next = window.get(target)?.refs[1].first().copied();
        }

        Ok(())
    }

    /// Records `pic` as the most recent top layer reference. An IDR picture drops every
    /// previously recorded picture.
    pub(crate) fn add_next_prev<P>(
        &mut self,
        window: &mut Window<P>,
        pic: PicHandle,
    ) -> EncodeResult<()> {
        if window.get(pic)?.pic_type == PictureType::Idr {
            self.release_next_prev(window)?;
        } else if self.next_prev.len() >= MAX_PICTURE_REFERENCES {
            let oldest = self.next_prev.remove(0);
            window.get_mut(oldest)?.release(RefLevel::Direct)?;
        }

        self.next_prev.push(pic);
        window.get_mut(pic)?.ref_count[RefLevel::Direct.index()] += 1;
        Ok(())
    }

    /// Drops every picture recorded as a previous reference.
    pub(crate) fn release_next_prev<P>(&mut self, window: &mut Window<P>) -> EncodeResult<()> {
        for pic in self.next_prev.drain(..) {
            window.get_mut(pic)?.release(RefLevel::Direct)?;
        }

        Ok(())
    }

    /// Reference lists and DPB of `pic`, as built so far.
    pub fn references<P>(window: &Window<P>, pic: PicHandle) -> EncodeResult<ReferenceSet> {
        let picture = window.get(pic)?;
        let display_orders = |handles: &[PicHandle]| -> EncodeResult<Vec<u64>> {
            handles
                .iter()
                .map(|h| Ok(window.get(*h)?.display_order))
                .collect()
        };

        Ok(ReferenceSet {
            past: display_orders(&picture.refs[0])?,
            future: display_orders(&picture.refs[1])?,
            dpb: display_orders(&picture.dpb)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::picture::Picture;

    fn window_with(count: u64) -> (Window<()>, Vec<PicHandle>) {
        let mut window = Window::new();
        let handles = (0..count)
            .map(|i| window.admit(Picture::new(i, Default::default(), i == 0, ())))
            .collect();
        (window, handles)
    }

    fn set_type(window: &mut Window<()>, pic: PicHandle, pic_type: PictureType) {
        let picture = window.get_mut(pic).unwrap();
        picture.pic_type = pic_type;
        picture.is_reference = true;
    }

    #[test]
    fn test_add_ref_lists_and_counts() {
        let (mut window, h) = window_with(3);

        ReferenceBuilder::add_ref(&mut window, h[1], h[0], RefUsage::REFERENCE_AND_DPB).unwrap();
        ReferenceBuilder::add_ref(&mut window, h[1], h[2], RefUsage::REFERENCE_AND_DPB).unwrap();
        ReferenceBuilder::add_ref(&mut window, h[1], h[2], RefUsage::PREV).unwrap();

        let refs = ReferenceBuilder::references(&window, h[1]).unwrap();
        assert_eq!(refs.past, [0]);
        assert_eq!(refs.future, [2]);
        assert_eq!(refs.dpb, [0, 2]);

        assert_eq!(window.get(h[0]).unwrap().ref_count(RefLevel::Direct), 2);
        assert_eq!(window.get(h[2]).unwrap().ref_count(RefLevel::Indirect), 3);

        // Only one previous picture is allowed
        assert!(matches!(
            ReferenceBuilder::add_ref(&mut window, h[1], h[0], RefUsage::PREV),
            Err(EncodeError::InvalidReferenceState)
        ));
        // A picture cannot predict from itself
        assert!(matches!(
            ReferenceBuilder::add_ref(&mut window, h[1], h[1], RefUsage::REFERENCE_AND_DPB),
            Err(EncodeError::InvalidReferenceState)
        ));
    }

    #[test]
    fn test_reference_list_is_capped() {
        let (mut window, h) = window_with(4);

        for target in &h[..2] {
            ReferenceBuilder::add_ref(&mut window, h[3], *target, RefUsage::REFERENCE_AND_DPB)
                .unwrap();
        }
        assert!(matches!(
            ReferenceBuilder::add_ref(&mut window, h[3], h[2], RefUsage::REFERENCE_AND_DPB),
            Err(EncodeError::InvalidReferenceState)
        ));
    }

    #[test]
    fn test_dpb_is_capped() {
        let (mut window, h) = window_with(MAX_DPB_SIZE as u64 + 2);
        let pic = h[MAX_DPB_SIZE + 1];

        for target in &h[..MAX_DPB_SIZE] {
            ReferenceBuilder::add_ref(&mut window, pic, *target, RefUsage::DPB).unwrap();
        }
        assert!(matches!(
            ReferenceBuilder::add_ref(&mut window, pic, h[MAX_DPB_SIZE], RefUsage::DPB),
            Err(EncodeError::InvalidReferenceState)
        ));
    }

    #[test]
    fn test_hierarchical_b_pictures() {
        let (mut window, h) = window_with(5);
        set_type(&mut window, h[0], PictureType::Idr);
        set_type(&mut window, h[4], PictureType::P);

        let last = ReferenceBuilder::set_b_pictures(&mut window, &h, 0, 4, h[4], 1, 2).unwrap();

        // The midpoint is a referenced B-picture one layer above the others
        let mid = window.get(h[2]).unwrap();
        assert_eq!(mid.pic_type(), PictureType::B);
        assert_eq!(mid.b_depth(), 1);
        assert!(mid.is_reference());
        assert_eq!(last, h[2]);

        for i in [1, 3] {
            let pic = window.get(h[i]).unwrap();
            assert_eq!(pic.pic_type(), PictureType::B);
            assert_eq!(pic.b_depth(), 2);
            assert!(!pic.is_reference());
            assert_eq!(pic.prev, Some(h[2]));
        }

        let refs = ReferenceBuilder::references(&window, h[1]).unwrap();
        assert_eq!(refs.past, [0]);
        assert_eq!(refs.future, [2]);
        // The future reference of the midpoint stays in the DPB
        assert_eq!(refs.dpb, [0, 2, 4]);

        let refs = ReferenceBuilder::references(&window, h[3]).unwrap();
        assert_eq!(refs.past, [2]);
        assert_eq!(refs.future, [4]);
        assert_eq!(refs.dpb, [2, 4]);

        let refs = ReferenceBuilder::references(&window, h[2]).unwrap();
        assert_eq!(refs.past, [0]);
        assert_eq!(refs.future, [4]);
        assert_eq!(refs.dpb, [2, 0, 4]);
    }

    #[test]
    fn test_flat_b_pictures_at_max_depth() {
        let (mut window, h) = window_with(4);
        set_type(&mut window, h[0], PictureType::Idr);
        set_type(&mut window, h[3], PictureType::P);

        let last = ReferenceBuilder::set_b_pictures(&mut window, &h, 0, 3, h[3], 1, 1).unwrap();
        assert_eq!(last, h[3]);

        for i in [1, 2] {
            let pic = window.get(h[i]).unwrap();
            assert_eq!(pic.b_depth(), 1);
            assert!(!pic.is_reference());
            let refs = ReferenceBuilder::references(&window, h[i]).unwrap();
            assert_eq!(refs.past, [0]);
            assert_eq!(refs.future, [3]);
        }
    }

    #[test]
    fn test_next_prev_keeps_two_most_recent() {
        let (mut window, h) = window_with(4);
        set_type(&mut window, h[0], PictureType::Idr);
        let mut builder = ReferenceBuilder::new(true);

        for pic in &h[..3] {
            builder.add_next_prev(&mut window, *pic).unwrap();
        }
        assert_eq!(builder.next_prev, [h[1], h[2]]);
        assert_eq!(window.get(h[0]).unwrap().ref_count(RefLevel::Direct), 0);

        // Nearest picture first
        assert_eq!(builder.nearest_first(&window, h[3]).unwrap(), [h[2], h[1]]);

        set_type(&mut window, h[3], PictureType::Idr);
        builder.add_next_prev(&mut window, h[3]).unwrap();
        assert_eq!(builder.next_prev, [h[3]]);
        assert_eq!(window.get(h[1]).unwrap().ref_count(RefLevel::Direct), 0);
        assert_eq!(window.get(h[2]).unwrap().ref_count(RefLevel::Direct), 0);
    }

    #[test]
    fn test_idr_anchor_only_holds_itself() {
        let (mut window, h) = window_with(1);
        set_type(&mut window, h[0], PictureType::Idr);
        let builder = ReferenceBuilder::new(false);

        builder.build_anchor(&mut window, h[0], None, 0).unwrap();
        let refs = ReferenceBuilder::references(&window, h[0]).unwrap();
        assert_eq!(refs, ReferenceSet { dpb: vec![0], ..Default::default() });
    }
}
