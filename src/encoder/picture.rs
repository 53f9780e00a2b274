// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use enumn::N;

use crate::encoder::EncodeError;
use crate::encoder::EncodeResult;
use crate::encoder::FrameMetadata;

pub const MAX_DPB_SIZE: usize = 16;
pub const MAX_PICTURE_REFERENCES: usize = 2;
pub const MAX_REORDER_DELAY: usize = 16;
pub const MAX_ASYNC_DEPTH: usize = 64;
pub const MAX_REFERENCE_LIST_NUM: usize = 2;

/// User payload travelling with a frame from input to coded output.
pub type Opaque = Arc<dyn Any + Send + Sync>;

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum PictureType {
    Idr = 0,
    I = 1,
    #[default]
    P = 2,
    B = 3,
}

impl PictureType {
    /// Whether the picture is intra coded (I or IDR).
    pub fn is_key(&self) -> bool {
        matches!(self, PictureType::Idr | PictureType::I)
    }
}

impl fmt::Display for PictureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PictureType::Idr => "IDR",
            PictureType::I => "I",
            PictureType::P => "P",
            PictureType::B => "B",
        };

        f.write_str(name)
    }
}

/// Non-owning handle to a [`Picture`] living in the
/// [`Window`](crate::encoder::window::Window). A handle whose picture was retired no longer
/// resolves, even if its slot was reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PicHandle {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

/// The two independent reasons a picture is kept alive by others.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefLevel {
    /// Held directly by pictures that are not complete yet.
    Direct = 0,
    /// Held through completed pictures that are themselves still referenced.
    Indirect = 1,
}

impl RefLevel {
    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// Copyable summary of a picture's scheduling state, handed to backends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PictureInfo {
    pub display_order: u64,
    pub encode_order: u64,
    pub pts: i64,
    pub duration: i64,
    pub pic_type: PictureType,
    pub b_depth: u32,
    pub is_reference: bool,
}

/// One source frame together with its encoding state.
pub struct Picture<P> {
    pub(crate) display_order: u64,
    pub(crate) encode_order: Option<u64>,
    pub(crate) pts: i64,
    pub(crate) duration: i64,
    pub(crate) force_idr: bool,

    pub(crate) opaque: Option<Opaque>,

    pub(crate) pic_type: PictureType,
    pub(crate) b_depth: u32,
    pub(crate) encode_issued: bool,
    pub(crate) encode_complete: bool,
    /// Set when the backend failed to encode this picture
    pub(crate) encode_failed: bool,

    /// Backend-private data. Owns the input and reconstructed images.
    pub(crate) private: Option<P>,

    /// Whether this picture is a reference picture.
    pub(crate) is_reference: bool,

    /// The contents of the DPB after this picture has been decoded. Contains the picture itself if
    /// it is a reference picture.
    pub(crate) dpb: Vec<PicHandle>,
    /// Reference pictures used to decode this picture. `refs[0]` holds past pictures, `refs[1]`
    /// future ones.
    pub(crate) refs: [Vec<PicHandle>; MAX_REFERENCE_LIST_NUM],
    /// The previous reference picture in encode order.
    pub(crate) prev: Option<PicHandle>,

    /// Number of references held on this picture, per [`RefLevel`].
    pub(crate) ref_count: [u32; 2],
    /// Whether this picture released its own references, per [`RefLevel`].
    pub(crate) ref_removed: [bool; 2],
}

impl<P> Picture<P> {
    pub(crate) fn new(display_order: u64, meta: FrameMetadata, force_idr: bool, private: P) -> Self {
        Self {
            display_order,
            encode_order: None,
            pts: meta.pts,
            duration: meta.duration,
            force_idr,
            opaque: meta.opaque,
            pic_type: Default::default(),
            b_depth: 0,
            encode_issued: false,
            encode_complete: false,
            encode_failed: false,
            private: Some(private),
            is_reference: false,
            dpb: Vec::with_capacity(MAX_DPB_SIZE),
            refs: Default::default(),
            prev: None,
            ref_count: [0; 2],
            ref_removed: [false; 2],
        }
    }

    pub fn display_order(&self) -> u64 {
        self.display_order
    }

    pub fn encode_order(&self) -> Option<u64> {
        self.encode_order
    }

    pub fn pic_type(&self) -> PictureType {
        self.pic_type
    }

    pub fn b_depth(&self) -> u32 {
        self.b_depth
    }

    pub fn pts(&self) -> i64 {
        self.pts
    }

    pub fn is_reference(&self) -> bool {
        self.is_reference
    }

    pub fn ref_count(&self, level: RefLevel) -> u32 {
        self.ref_count[level.index()]
    }

    pub fn info(&self) -> PictureInfo {
        PictureInfo {
            display_order: self.display_order,
            encode_order: self.encode_order.unwrap_or_default(),
            pts: self.pts,
            duration: self.duration,
            pic_type: self.pic_type,
            b_depth: self.b_depth,
            is_reference: self.is_reference,
        }
    }

    /// Every handle this picture holds a reference through, once per role.
    pub(crate) fn held_references(&self) -> impl Iterator<Item = PicHandle> + '_ {
        self.refs[0]
            .iter()
            .chain(self.refs[1].iter())
            .chain(self.dpb.iter())
            .chain(self.prev.iter())
            .copied()
    }

    pub(crate) fn retain(&mut self, count: u32) {
        self.ref_count[RefLevel::Direct.index()] += count;
        self.ref_count[RefLevel::Indirect.index()] += count;
    }

    pub(crate) fn release(&mut self, level: RefLevel) -> EncodeResult<()> {
        let count = &mut self.ref_count[level.index()];
        *count = count.checked_sub(1).ok_or_else(|| {
            log::error!(
                "refcount underflow on picture {} at level {:?}",
                self.display_order,
                level
            );
            EncodeError::InvalidReferenceState
        })?;

        Ok(())
    }
}
