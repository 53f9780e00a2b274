// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use log::debug;

use crate::encoder::picture::PictureType;
use crate::encoder::stateless::BackendCapabilities;
use crate::encoder::EncodeError;
use crate::encoder::EncodeResult;
use crate::encoder::EncoderConfig;

/// GOP structure of the stream and the counters deciding the type of each top layer picture.
#[derive(Debug, Clone)]
pub struct GopStructure {
    /// Number of pictures in a GOP
    pub(crate) gop_size: u32,
    pub(crate) closed_gop: bool,
    /// Number of GOPs between IDR pictures
    pub(crate) gop_per_idr: u32,
    /// Number of B-pictures between two top layer pictures
    pub(crate) b_per_p: u32,
    pub(crate) max_b_depth: u32,
    /// Top layer non-key pictures are coded as generalized B-pictures
    pub(crate) p_to_gpb: bool,
    /// The backend accepts more than one past reference
    pub(crate) multi_reference: bool,

    idr_counter: u32,
    gop_counter: u32,
}

impl GopStructure {
    pub fn new(config: &EncoderConfig, caps: &BackendCapabilities) -> EncodeResult<Self> {
        let mut gop = Self {
            gop_size: config.gop_size,
            closed_gop: true,
            gop_per_idr: 1,
            b_per_p: 0,
            max_b_depth: 0,
            p_to_gpb: caps.p_to_gpb,
            multi_reference: caps.max_l0_refs as usize > 1,
            idr_counter: 0,
            gop_counter: 0,
        };

        if caps.intra_only || config.gop_size <= 1 {
            debug!("using intra pictures only");
            gop.gop_size = 1;
        } else if caps.max_l0_refs < 1 {
            log::error!("backend does not support any reference pictures");
            return Err(EncodeError::Unsupported);
        } else if !caps.b_pictures
            || caps.max_l1_refs < 1
            || config.max_b_frames < 1
            || caps.prediction_pre_only
        {
            debug!(
                "using intra and {} pictures (supported references: {} / {})",
                if gop.p_to_gpb { "generalized B" } else { "P" },
                caps.max_l0_refs,
                caps.max_l1_refs
            );
        } else {
            debug!(
                "using intra, {} and B pictures (supported references: {} / {})",
                if gop.p_to_gpb { "generalized B" } else { "P" },
                caps.max_l0_refs,
                caps.max_l1_refs
            );
            gop.b_per_p = config.max_b_frames;
            gop.max_b_depth = if caps.b_picture_references {
                config.b_depth.min(gop.b_per_p.ilog2() + 1)
            } else {
                1
            };
        }

        if caps.non_idr_key_pictures {
            gop.closed_gop = config.closed_gop;
            gop.gop_per_idr = config.idr_interval.saturating_add(1);
        }

        Ok(gop)
    }

    /// Number of frames the output lags behind the input.
    pub fn output_delay(&self) -> u64 {
        self.b_per_p as u64
    }

    /// Number of frames the decode timestamps lag behind the presentation timestamps.
    pub fn decode_delay(&self) -> u64 {
        self.max_b_depth as u64
    }

    pub fn b_per_p(&self) -> u32 {
        self.b_per_p
    }

    pub fn max_b_depth(&self) -> u32 {
        self.max_b_depth
    }

    /// Whether the next key picture has to be preceded by a top layer picture, so that no
    /// B-picture references across the GOP boundary.
    pub(crate) fn closed_gop_end(&self) -> bool {
        self.closed_gop || self.idr_counter == self.gop_per_idr
    }

    /// Whether the picture following `b_counter` B-pictures has to end up in the top layer
    /// because of the GOP boundary.
    pub(crate) fn reaches_gop_end(&self, b_counter: u32, closed_gop_end: bool) -> bool {
        self.gop_counter + b_counter + closed_gop_end as u32 >= self.gop_size
    }

    /// Decides the type of the next top layer picture, which follows `b_counter` B-pictures in
    /// display order.
    pub(crate) fn decide(&mut self, force_idr: bool, b_counter: u32) -> PictureType {
        if force_idr {
            debug!("pick forced IDR picture to encode next");
            self.idr_counter = 1;
            self.gop_counter = 1;
            return PictureType::Idr;
        }

        if self.gop_counter + b_counter >= self.gop_size {
            let pic_type = if self.idr_counter == self.gop_per_idr {
                debug!("pick new GOP IDR picture to encode next");
                self.idr_counter = 1;
                PictureType::Idr
            } else {
                debug!("pick new GOP I picture to encode next");
                self.idr_counter += 1;
                PictureType::I
            };
            self.gop_counter = 1;
            return pic_type;
        }

        if self.gop_counter + b_counter + self.closed_gop_end() as u32 == self.gop_size {
            debug!("pick group-end P picture to encode next");
        } else {
            debug!("pick normal P picture to encode next");
        }
        self.gop_counter += 1 + b_counter;

        if self.p_to_gpb {
            PictureType::B
        } else {
            PictureType::P
        }
    }
}
