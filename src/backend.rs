// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Shared code for encoder backends.
//!
//! A backend is a provider of encoding, most likely hardware-accelerated. This module contains
//! backend-related code that is not tied to any particular hardware.

pub mod dummy;
pub mod worker;
