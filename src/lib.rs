// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Picture scheduling engine for hardware video encoders.
//!
//! The [`encoder`] module turns frames submitted in display order into pictures issued to a
//! hardware backend in encode order, with their types, reference lists, DPB and timestamps
//! decided by the engine. Backends only implement
//! [`StatelessEncoderBackend`](encoder::stateless::StatelessEncoderBackend).

pub mod backend;
pub mod encoder;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BlockingMode {
    Blocking,
    NonBlocking,
}

impl Default for BlockingMode {
    fn default() -> Self {
        Self::Blocking
    }
}
