// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Admission window: every live picture of the session, in display order.
//!
//! Pictures are stored in an arena of slots and addressed through generation-checked
//! [`PicHandle`]s, so the reference lists and DPB of a picture can name other pictures without
//! owning them.

use std::collections::VecDeque;

use crate::encoder::picture::PicHandle;
use crate::encoder::picture::Picture;
use crate::encoder::EncodeError;
use crate::encoder::EncodeResult;

struct Slot<P> {
    generation: u32,
    picture: Option<Picture<P>>,
}

pub struct Window<P> {
    slots: Vec<Slot<P>>,
    /// Indices of the vacant slots
    vacant: Vec<u32>,
    /// Live pictures in display order
    order: VecDeque<PicHandle>,
}

impl<P> Default for Window<P> {
    fn default() -> Self {
        Self {
            slots: Default::default(),
            vacant: Default::default(),
            order: Default::default(),
        }
    }
}

impl<P> Window<P> {
    pub fn new() -> Self {
        Default::default()
    }

    /// Makes sure the next [`Window::admit`] will not need to allocate.
    pub fn reserve(&mut self) -> EncodeResult<()> {
        if self.vacant.is_empty() {
            self.slots
                .try_reserve(1)
                .map_err(|_| EncodeError::AllocationFailure)?;
        }

        self.order
            .try_reserve(1)
            .map_err(|_| EncodeError::AllocationFailure)
    }

    /// Appends `picture` at the tail of the window.
    pub fn admit(&mut self, picture: Picture<P>) -> PicHandle {
        let handle = match self.vacant.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.picture = Some(picture);
                PicHandle {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    picture: Some(picture),
                });
                PicHandle {
                    index: (self.slots.len() - 1) as u32,
                    generation: 0,
                }
            }
        };

        self.order.push_back(handle);
        handle
    }

    /// Oldest picture of the window.
    pub fn peek_head(&self) -> Option<PicHandle> {
        self.order.front().copied()
    }

    /// Most recently admitted picture of the window.
    pub fn peek_tail(&self) -> Option<PicHandle> {
        self.order.back().copied()
    }

    /// Unlinks the picture from the window and returns it. The handle stops resolving.
    pub fn remove(&mut self, handle: PicHandle) -> EncodeResult<Picture<P>> {
        let position = self
            .order
            .iter()
            .position(|h| *h == handle)
            .ok_or(EncodeError::InvalidReferenceState)?;

        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .ok_or(EncodeError::InvalidReferenceState)?;
        let picture = slot.picture.take().ok_or(EncodeError::InvalidReferenceState)?;

        slot.generation = slot.generation.wrapping_add(1);
        self.vacant.push(handle.index);
        self.order.remove(position);

        Ok(picture)
    }

    pub fn get(&self, handle: PicHandle) -> EncodeResult<&Picture<P>> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.picture.as_ref())
            .ok_or(EncodeError::InvalidReferenceState)
    }

    pub fn get_mut(&mut self, handle: PicHandle) -> EncodeResult<&mut Picture<P>> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.picture.as_mut())
            .ok_or(EncodeError::InvalidReferenceState)
    }

    pub fn contains(&self, handle: PicHandle) -> bool {
        self.get(handle).is_ok()
    }

    /// Handles of the live pictures, in display order.
    pub fn handles(&self) -> impl Iterator<Item = PicHandle> + '_ {
        self.order.iter().copied()
    }

    /// Live pictures, in display order.
    pub fn iter(&self) -> impl Iterator<Item = (PicHandle, &Picture<P>)> + '_ {
        self.order.iter().filter_map(|h| self.get(*h).ok().map(|pic| (*h, pic)))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn picture(display_order: u64) -> Picture<u64> {
        Picture::new(display_order, Default::default(), false, display_order)
    }

    #[test]
    fn test_admit_keeps_display_order() {
        let mut window = Window::new();
        let handles: Vec<_> = (0..4).map(|i| window.admit(picture(i))).collect();

        assert_eq!(window.len(), 4);
        assert_eq!(window.peek_head(), Some(handles[0]));
        assert_eq!(window.peek_tail(), Some(handles[3]));

        let orders: Vec<u64> = window.iter().map(|(_, pic)| pic.display_order()).collect();
        assert_eq!(orders, [0, 1, 2, 3]);
    }

    #[test]
    fn test_remove_from_the_middle() {
        let mut window = Window::new();
        let handles: Vec<_> = (0..3).map(|i| window.admit(picture(i))).collect();

        let removed = window.remove(handles[1]).unwrap();
        assert_eq!(removed.display_order(), 1);

        let orders: Vec<u64> = window.iter().map(|(_, pic)| pic.display_order()).collect();
        assert_eq!(orders, [0, 2]);

        // Removing twice is a bookkeeping error
        assert!(matches!(
            window.remove(handles[1]),
            Err(EncodeError::InvalidReferenceState)
        ));
    }

    #[test]
    fn test_stale_handle_does_not_resolve() {
        let mut window = Window::new();
        let old = window.admit(picture(0));
        window.remove(old).unwrap();

        // The slot is reused, the old handle must not alias the new picture
        let new = window.admit(picture(1));
        assert_eq!(old.index, new.index);
        assert!(window.get(old).is_err());
        assert!(!window.contains(old));
        assert_eq!(window.get(new).unwrap().display_order(), 1);
    }

    #[test]
    fn test_empty_window() {
        let mut window = Window::<()>::new();
        assert!(window.is_empty());
        assert_eq!(window.peek_head(), None);
        assert!(window.reserve().is_ok());
    }
}
