// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Release of picture references and retirement of pictures from the window.
//!
//! A picture holds its references at two levels. The direct level is dropped as soon as the
//! picture is complete, the indirect one once no incomplete picture depends on it anymore. A
//! picture is retired when it is complete and nobody holds an indirect reference on it.

use log::trace;

use crate::encoder::picture::PicHandle;
use crate::encoder::picture::Picture;
use crate::encoder::picture::PictureType;
use crate::encoder::picture::RefLevel;
use crate::encoder::window::Window;
use crate::encoder::EncodeError;
use crate::encoder::EncodeResult;

/// Drops the `level` references `pic` holds on other pictures. Does nothing if they were already
/// dropped.
pub fn release_reference<P>(
    window: &mut Window<P>,
    pic: PicHandle,
    level: RefLevel,
) -> EncodeResult<()> {
    let picture = window.get(pic)?;
    if picture.ref_removed[level.index()] {
        return Ok(());
    }

    if picture.prev.is_none() && picture.pic_type != PictureType::Idr {
        log::error!(
            "picture {} has no previous picture and is not IDR",
            picture.display_order
        );
        return Err(EncodeError::InvalidReferenceState);
    }

    let targets: Vec<PicHandle> = picture.held_references().collect();
    for target in targets {
        window.get_mut(target)?.release(level)?;
    }

    window.get_mut(pic)?.ref_removed[level.index()] = true;
    Ok(())
}

/// Unlinks `pic` from the window and hands it back for freeing. The picture must be complete and
/// have no references left on either side.
pub fn release_from_window<P>(window: &mut Window<P>, pic: PicHandle) -> EncodeResult<Picture<P>> {
    let picture = window.get(pic)?;
    if !picture.encode_complete
        || !picture.ref_removed.iter().all(|removed| *removed)
        || picture.ref_count(RefLevel::Indirect) != 0
    {
        log::error!(
            "picture {} is still in use and cannot be retired",
            picture.display_order
        );
        return Err(EncodeError::InvalidReferenceState);
    }

    trace!("retiring picture {}", picture.display_order);
    window.remove(pic)
}

/// Releases what completed pictures no longer need and retires the pictures nobody references
/// anymore. The window tail keeps its direct references unless `final_pass` is set, since the
/// next picture may still be predicted from its lists.
pub fn clear_old<P>(window: &mut Window<P>, final_pass: bool) -> EncodeResult<Vec<Picture<P>>> {
    let tail = window.peek_tail();
    let handles: Vec<PicHandle> = window.handles().collect();

    for &pic in &handles {
        if window.get(pic)?.encode_complete && (final_pass || Some(pic) != tail) {
            release_reference(window, pic, RefLevel::Direct)?;
        }
    }

    for &pic in &handles {
        let picture = window.get(pic)?;
        if picture.encode_complete && picture.ref_count(RefLevel::Direct) == 0 {
            release_reference(window, pic, RefLevel::Indirect)?;
        }
    }

    let mut retired = Vec::new();
    for &pic in &handles {
        let picture = window.get(pic)?;
        if picture.encode_complete && picture.ref_count(RefLevel::Indirect) == 0 {
            retired.push(release_from_window(window, pic)?);
        }
    }

    Ok(retired)
}

/// Unlinks every remaining picture, whatever its state.
pub fn release_all<P>(window: &mut Window<P>) -> Vec<Picture<P>> {
    let handles: Vec<PicHandle> = window.handles().collect();

    handles
        .into_iter()
        .filter_map(|pic| {
            let picture = window.remove(pic).ok()?;
            if !picture.encode_complete {
                log::warn!(
                    "dropping picture {} that was never encoded",
                    picture.display_order
                );
            }
            Some(picture)
        })
        .collect()
}
