// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Prints the picture schedule the encoder produces for a synthetic stream, using the dummy
//! backend in place of hardware.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;

use argh::FromArgs;

use cros_hwenc::backend::dummy::Completion;
use cros_hwenc::backend::dummy::DummyBackend;
use cros_hwenc::backend::dummy::DummyPacket;
use cros_hwenc::encoder::stateless::simple_encode_loop;
use cros_hwenc::encoder::stateless::BackendCapabilities;
use cros_hwenc::encoder::stateless::StatelessEncoder;
use cros_hwenc::encoder::CodedBitstreamBuffer;
use cros_hwenc::encoder::EncoderConfig;
use cros_hwenc::encoder::FrameMetadata;
use cros_hwenc::BlockingMode;

#[derive(Debug, PartialEq, Eq, Copy, Clone, Default)]
enum Mode {
    /// Every issued picture is output right away
    #[default]
    Sync,
    /// Issued pictures are buffered up to the async depth
    Async,
    /// Pictures complete on a worker thread
    Threaded,
}

impl FromStr for Mode {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sync" => Ok(Self::Sync),
            "async" => Ok(Self::Async),
            "threaded" => Ok(Self::Threaded),
            _ => Err("unrecognized mode. Valid values: sync, async, threaded"),
        }
    }
}

/// Encode schedule tracer
#[derive(Debug, FromArgs)]
struct Args {
    /// number of frames to encode
    #[argh(option, default = "16")]
    frames: u64,

    /// number of frames in a GOP
    #[argh(option, default = "8")]
    gop_size: u32,

    /// maximum number of consecutive B-pictures
    #[argh(option, default = "1")]
    b_frames: u32,

    /// number of non-IDR key pictures between two IDR pictures
    #[argh(option, default = "0")]
    idr_interval: u32,

    /// reference depth of B-pictures
    #[argh(option, default = "1")]
    b_depth: u32,

    /// maximum number of pictures in flight
    #[argh(option, default = "2")]
    async_depth: u32,

    /// framerate of the synthetic stream
    #[argh(option, default = "30")]
    framerate: u32,

    /// backend completion mode: sync, async or threaded
    #[argh(option, default = "Mode::Sync")]
    mode: Mode,

    /// force an IDR picture at this display order, may be repeated
    #[argh(option)]
    force_idr: Vec<u64>,

    /// forbid B-pictures to reference across GOP boundaries
    #[argh(switch)]
    closed_gop: bool,

    /// output file to write the dummy bitstream to
    #[argh(option)]
    output: Option<PathBuf>,
}

fn print_packet(coded: &CodedBitstreamBuffer) {
    let meta = &coded.metadata;
    let packet = match DummyPacket::parse(&coded.bitstream) {
        Ok(packet) => packet,
        Err(e) => {
            log::error!("invalid packet for picture {}: {:#}", meta.display_order, e);
            return;
        }
    };

    println!(
        "{:>6} {:>6} {:>4} {:>5} {:>3} {:>8} {:>8}  L0={:?} L1={:?} DPB={:?}",
        meta.encode_order,
        meta.display_order,
        meta.pic_type.to_string(),
        packet.b_depth,
        if packet.is_reference { "R" } else { "-" },
        meta.pts,
        meta.dts,
        packet.refs[0],
        packet.refs[1],
        packet.dpb,
    );
}

fn main() {
    env_logger::init();

    let args: Args = argh::from_env();

    let config = EncoderConfig {
        gop_size: args.gop_size,
        max_b_frames: args.b_frames,
        idr_interval: args.idr_interval,
        b_depth: args.b_depth,
        async_depth: args.async_depth,
        closed_gop: args.closed_gop,
    };

    let backend = match args.mode {
        Mode::Sync => DummyBackend::new(Completion::Immediate),
        Mode::Async => DummyBackend::new(Completion::Immediate).map(|backend| {
            backend.with_capabilities(BackendCapabilities {
                async_encode: true,
                ..Default::default()
            })
        }),
        Mode::Threaded => DummyBackend::new(Completion::Threaded),
    }
    .expect("failed to create dummy backend");
    let log = backend.log();

    let mut encoder = StatelessEncoder::new(backend, config, BlockingMode::Blocking)
        .expect("failed to create encoder");

    let framerate = args.framerate.max(1) as i64;
    let mut frames = (0..args.frames).map(|i| {
        let pts = i as i64 * 1000 / framerate;
        let meta = FrameMetadata {
            pts,
            duration: 1000 / framerate,
            force_keyframe: args.force_idr.contains(&i),
            ..Default::default()
        };
        (meta, ())
    });

    let mut output = args
        .output
        .as_ref()
        .map(|path| File::create(path).expect("error creating output file"));
    let mut hasher = crc32fast::Hasher::new();

    println!("encode  order type depth ref      pts      dts  references");
    simple_encode_loop(&mut encoder, &mut frames, |coded| {
        print_packet(&coded);
        hasher.update(&coded.bitstream);
        if let Some(output) = &mut output {
            output
                .write_all(&coded.bitstream)
                .expect("error writing output file");
        }
    })
    .expect("encoding failed");

    drop(encoder);

    let log = log.borrow();
    println!(
        "{} pictures issued, {} freed, at most {} in flight, stream crc32 {:08x}",
        log.issued.len(),
        log.freed.len(),
        log.max_in_flight,
        hasher.finalize()
    );
}
