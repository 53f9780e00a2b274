// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

pub mod gop;
pub mod lifecycle;
pub mod picture;
pub mod references;
pub mod scheduler;
pub mod stateless;
pub mod timestamps;
pub mod window;

use thiserror::Error;

use crate::encoder::picture::Opaque;
use crate::encoder::picture::PictureType;
use crate::encoder::picture::MAX_ASYNC_DEPTH;
use crate::encoder::picture::MAX_REORDER_DELAY;
use crate::encoder::stateless::StatelessBackendError;

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("unsupported")]
    Unsupported,
    #[error("invalid encoder configuration: {0}")]
    InvalidConfig(String),
    #[error("failed to allocate a picture record")]
    AllocationFailure,
    #[error("inconsistent reference or DPB bookkeeping. This is likely a bug.")]
    InvalidReferenceState,
    #[error("invalid internal state. This is likely a bug.")]
    InvalidInternalState,
    #[error("failed to issue picture {display_order}: {source}")]
    BackendIssueFailure {
        display_order: u64,
        #[source]
        source: StatelessBackendError,
    },
    #[error("failed to output picture {display_order}: {source}")]
    BackendOutputFailure {
        display_order: u64,
        #[source]
        source: StatelessBackendError,
    },
    #[error("frame submitted after end of stream was signalled")]
    EndOfStreamSignalled,
    #[error("the encode session failed earlier and cannot continue")]
    SessionFailed,
}

impl EncodeError {
    /// Returns true if the session cannot continue after this error.
    pub fn is_fatal(&self) -> bool {
        match self {
            EncodeError::BackendIssueFailure { source, .. }
            | EncodeError::BackendOutputFailure { source, .. } => source.is_fatal(),
            EncodeError::InvalidConfig(_) | EncodeError::EndOfStreamSignalled => false,
            _ => true,
        }
    }
}

pub type EncodeResult<T> = Result<T, EncodeError>;

/// Structural parameters of the encoded stream. These cannot change during an encoding session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderConfig {
    /// Number of frames in a GOP, ie. distance between two key pictures.
    pub gop_size: u32,
    /// Maximum number of consecutive B-pictures between two top layer pictures.
    pub max_b_frames: u32,
    /// Number of non-IDR key pictures between two IDR pictures.
    pub idr_interval: u32,
    /// Desired B-picture reference depth.
    pub b_depth: u32,
    /// Maximum number of pictures issued to the backend but not yet output.
    pub async_depth: u32,
    /// If set, no B-picture references pictures across a GOP boundary.
    pub closed_gop: bool,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            gop_size: 120,
            max_b_frames: 2,
            idr_interval: 0,
            b_depth: 1,
            async_depth: 2,
            closed_gop: false,
        }
    }
}

impl EncoderConfig {
    pub fn validate(&self) -> EncodeResult<()> {
        if self.b_depth < 1 {
            return Err(EncodeError::InvalidConfig("b_depth must be at least 1".into()));
        }

        if self.async_depth < 1 || self.async_depth as usize > MAX_ASYNC_DEPTH {
            return Err(EncodeError::InvalidConfig(format!(
                "async_depth must be within 1..={MAX_ASYNC_DEPTH}, got {}",
                self.async_depth
            )));
        }

        if self.max_b_frames as usize > MAX_REORDER_DELAY {
            return Err(EncodeError::InvalidConfig(format!(
                "max_b_frames must not exceed {MAX_REORDER_DELAY}, got {}",
                self.max_b_frames
            )));
        }

        Ok(())
    }
}

/// Cropping rectangle of the input frame, in pixels from each edge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Crop {
    pub top: u32,
    pub bottom: u32,
    pub left: u32,
    pub right: u32,
}

impl Crop {
    pub fn is_empty(&self) -> bool {
        *self == Default::default()
    }
}

/// Encoder's input metadata
#[derive(Clone, Default)]
pub struct FrameMetadata {
    /// Presentation timestamp, in stream time base units
    pub pts: i64,
    pub duration: i64,
    /// Request the frame to be coded as an IDR picture
    pub force_keyframe: bool,
    pub crop: Crop,
    /// True if the frame carries regions of interest side data
    pub roi: bool,
    /// User data carried over to the coded output of this frame
    pub opaque: Option<Opaque>,
}

/// Metadata of a coded picture, as returned to the client.
#[derive(Clone, Default)]
pub struct PacketMetadata {
    pub pts: i64,
    /// Decode timestamp, reconstructed from the input presentation timestamps
    pub dts: i64,
    pub duration: i64,
    pub key_frame: bool,
    pub pic_type: PictureType,
    pub display_order: u64,
    pub encode_order: u64,
    pub opaque: Option<Opaque>,
}

/// Encoder's coded output with contained frame.
pub struct CodedBitstreamBuffer {
    /// [`PacketMetadata`] of the picture that is compressed in [`Self::bitstream`]
    pub metadata: PacketMetadata,

    /// Bitstream with compressed picture
    pub bitstream: Vec<u8>,
}

impl CodedBitstreamBuffer {
    pub fn new(metadata: PacketMetadata, bitstream: Vec<u8>) -> Self {
        Self {
            metadata,
            bitstream,
        }
    }
}

impl From<CodedBitstreamBuffer> for Vec<u8> {
    fn from(value: CodedBitstreamBuffer) -> Self {
        value.bitstream
    }
}
