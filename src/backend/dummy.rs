// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This file contains a dummy backend whose only purpose is to let the encoder
//! run so we can test it in isolation.
//!
//! Instead of a real bitstream, every output packet describes the picture it was produced from:
//! its type, orders and the display orders of its references and DPB. [`DummyPacket::parse`]
//! reads it back.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::io::Cursor;
use std::io::Read;
use std::rc::Rc;

use anyhow::anyhow;
use anyhow::Context;
use byteorder::LittleEndian;
use byteorder::ReadBytesExt;
use byteorder::WriteBytesExt;

use crate::backend::worker::EncodeWorker;
use crate::backend::worker::WorkerPromise;
use crate::encoder::picture::PictureType;
use crate::encoder::stateless::BackendCapabilities;
use crate::encoder::stateless::BackendPromise;
use crate::encoder::stateless::IssueRequest;
use crate::encoder::stateless::ReadyPromise;
use crate::encoder::stateless::ReferencePicture;
use crate::encoder::stateless::StatelessBackendError;
use crate::encoder::stateless::StatelessBackendResult;
use crate::encoder::stateless::StatelessEncoderBackend;
use crate::encoder::FrameMetadata;

const MAGIC: &[u8; 4] = b"DUMY";

/// How issued pictures complete.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Completion {
    /// Pictures are complete as soon as they are issued.
    Immediate,
    /// Pictures complete when [`DummyLog::complete`] is called, or when waited on.
    Manual,
    /// Pictures complete on a worker thread.
    Threaded,
}

/// Description of an issued picture, as carried by the output packets.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DummyPacket {
    pub display_order: u64,
    pub encode_order: u64,
    pub pic_type: PictureType,
    pub b_depth: u32,
    pub is_reference: bool,
    /// Display orders of the past and future references
    pub refs: [Vec<u64>; 2],
    /// Display orders of the other DPB pictures
    pub dpb: Vec<u64>,
}

impl DummyPacket {
    fn from_request<P>(request: &IssueRequest<'_, P>) -> Self {
        Self {
            display_order: request.picture.display_order,
            encode_order: request.picture.encode_order,
            pic_type: request.picture.pic_type,
            b_depth: request.picture.b_depth,
            is_reference: request.picture.is_reference,
            refs: [
                display_orders(&request.refs[0]),
                display_orders(&request.refs[1]),
            ],
            dpb: display_orders(&request.dpb),
        }
    }

    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        let mut data = Vec::new();
        data.extend_from_slice(MAGIC);
        data.write_u8(self.pic_type as u8)?;
        data.write_u8(u8::try_from(self.b_depth)?)?;
        data.write_u8(self.is_reference as u8)?;
        data.write_u8(u8::try_from(self.refs[0].len())?)?;
        data.write_u8(u8::try_from(self.refs[1].len())?)?;
        data.write_u8(u8::try_from(self.dpb.len())?)?;
        data.write_u64::<LittleEndian>(self.display_order)?;
        data.write_u64::<LittleEndian>(self.encode_order)?;

        for order in self.refs.iter().flatten().chain(self.dpb.iter()) {
            data.write_u64::<LittleEndian>(*order)?;
        }

        let crc = crc32fast::hash(&data);
        data.write_u32::<LittleEndian>(crc)?;

        Ok(data)
    }

    pub fn parse(data: &[u8]) -> anyhow::Result<Self> {
        if data.len() < MAGIC.len() + 4 {
            return Err(anyhow!("packet too short: {} bytes", data.len()));
        }

        let (payload, crc) = data.split_at(data.len() - 4);
        let expected = Cursor::new(crc).read_u32::<LittleEndian>()?;
        if crc32fast::hash(payload) != expected {
            return Err(anyhow!("packet checksum mismatch"));
        }

        let mut reader = Cursor::new(payload);
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(anyhow!("invalid packet magic {:?}", magic));
        }

        let pic_type = reader.read_u8()?;
        let pic_type =
            PictureType::n(pic_type).with_context(|| format!("invalid picture type {pic_type}"))?;
        let b_depth = reader.read_u8()? as u32;
        let is_reference = reader.read_u8()? != 0;
        let counts = [reader.read_u8()?, reader.read_u8()?, reader.read_u8()?];
        let display_order = reader.read_u64::<LittleEndian>()?;
        let encode_order = reader.read_u64::<LittleEndian>()?;

        let mut read_orders = |count: u8| {
            (0..count)
                .map(|_| reader.read_u64::<LittleEndian>())
                .collect::<std::io::Result<Vec<u64>>>()
        };
        let refs = [read_orders(counts[0])?, read_orders(counts[1])?];
        let dpb = read_orders(counts[2])?;

        Ok(Self {
            display_order,
            encode_order,
            pic_type,
            b_depth,
            is_reference,
            refs,
            dpb,
        })
    }
}

fn display_orders<P>(pics: &[ReferencePicture<'_, P>]) -> Vec<u64> {
    pics.iter().map(|r| r.info.display_order).collect()
}

/// Everything the dummy backend did, shared with the test or tool driving it.
#[derive(Debug, Default)]
pub struct DummyLog {
    /// Issued pictures, in issue order
    pub issued: Vec<DummyPacket>,
    /// Allocation indices of the freed pictures, in free order
    pub freed: Vec<u64>,
    pub allocated: u64,
    pub in_flight: usize,
    pub max_in_flight: usize,

    /// Display orders of the pictures completed under [`Completion::Manual`]
    completed: BTreeSet<u64>,

    /// Fail the allocation with this index
    pub fail_alloc: Option<u64>,
    /// Fail the issue of the picture with this display order, fatally if set
    pub fail_issue: Option<(u64, bool)>,
    /// Fail the output of the picture with this display order
    pub fail_output: Option<u64>,
    /// Produce an empty bitstream for the picture with this display order
    pub empty_output: Option<u64>,
}

impl DummyLog {
    /// Completes the picture with `display_order` under [`Completion::Manual`].
    pub fn complete(&mut self, display_order: u64) {
        self.completed.insert(display_order);
    }

    /// Display orders of the issued pictures, in issue order.
    pub fn issue_order(&self) -> Vec<u64> {
        self.issued.iter().map(|p| p.display_order).collect()
    }
}

pub struct DummyPicture {
    index: u64,
    pub pts: i64,
}

pub enum DummyPromise {
    Ready(ReadyPromise<DummyPacket>),
    Manual {
        log: Rc<RefCell<DummyLog>>,
        packet: DummyPacket,
    },
    Threaded(WorkerPromise<DummyPacket>),
}

impl BackendPromise for DummyPromise {
    type Output = DummyPacket;

    fn sync(self) -> StatelessBackendResult<Self::Output> {
        match self {
            DummyPromise::Ready(promise) => promise.sync(),
            DummyPromise::Manual { log, packet } => {
                // Waiting on the hardware completes the picture.
                log.borrow_mut().complete(packet.display_order);
                Ok(packet)
            }
            DummyPromise::Threaded(promise) => promise.sync(),
        }
    }

    fn is_ready(&self) -> bool {
        match self {
            DummyPromise::Ready(promise) => promise.is_ready(),
            DummyPromise::Manual { log, packet } => {
                log.borrow().completed.contains(&packet.display_order)
            }
            DummyPromise::Threaded(promise) => promise.is_ready(),
        }
    }
}

/// Dummy backend that can be driven by any handle type.
pub struct DummyBackend {
    caps: BackendCapabilities,
    completion: Completion,
    log: Rc<RefCell<DummyLog>>,
    worker: Option<EncodeWorker>,
}

impl DummyBackend {
    pub fn new(completion: Completion) -> anyhow::Result<Self> {
        let worker = match completion {
            Completion::Threaded => Some(EncodeWorker::new("dummy-encode")?),
            Completion::Immediate | Completion::Manual => None,
        };

        Ok(Self {
            caps: BackendCapabilities {
                async_encode: completion != Completion::Immediate,
                ..Default::default()
            },
            completion,
            log: Default::default(),
            worker,
        })
    }

    pub fn with_capabilities(mut self, caps: BackendCapabilities) -> Self {
        self.caps = caps;
        self
    }

    pub fn log(&self) -> Rc<RefCell<DummyLog>> {
        Rc::clone(&self.log)
    }
}

impl<Handle> StatelessEncoderBackend<Handle> for DummyBackend {
    type Picture = DummyPicture;
    type CodedPromise = DummyPromise;

    fn capabilities(&self) -> BackendCapabilities {
        self.caps.clone()
    }

    fn alloc(
        &mut self,
        meta: &FrameMetadata,
        _handle: Handle,
    ) -> StatelessBackendResult<Self::Picture> {
        let mut log = self.log.borrow_mut();
        if log.fail_alloc == Some(log.allocated) {
            return Err(StatelessBackendError::OutOfResources);
        }

        let index = log.allocated;
        log.allocated += 1;

        Ok(DummyPicture {
            index,
            pts: meta.pts,
        })
    }

    fn issue(
        &mut self,
        request: IssueRequest<'_, Self::Picture>,
    ) -> StatelessBackendResult<Self::CodedPromise> {
        let packet = DummyPacket::from_request(&request);
        let mut log = self.log.borrow_mut();

        if request.refs[0].len() > self.caps.max_l0_refs as usize
            || request.refs[1].len() > self.caps.max_l1_refs as usize
        {
            return Err(StatelessBackendError::Other(anyhow!(
                "too many references for picture {}",
                packet.display_order
            )));
        }

        if let Some((display_order, fatal)) = log.fail_issue {
            if display_order == packet.display_order {
                let error = anyhow!("injected issue failure");
                return Err(if fatal {
                    StatelessBackendError::Fatal(error)
                } else {
                    StatelessBackendError::Other(error)
                });
            }
        }

        log.issued.push(packet.clone());
        log.in_flight += 1;
        log.max_in_flight = log.max_in_flight.max(log.in_flight);

        Ok(match self.completion {
            Completion::Immediate => DummyPromise::Ready(packet.into()),
            Completion::Manual => DummyPromise::Manual {
                log: Rc::clone(&self.log),
                packet,
            },
            Completion::Threaded => match &self.worker {
                Some(worker) => DummyPromise::Threaded(worker.submit(move || Ok(packet))),
                None => return Err(StatelessBackendError::Unsupported),
            },
        })
    }

    fn output(
        &mut self,
        _picture: &mut Self::Picture,
        completed: DummyPacket,
    ) -> StatelessBackendResult<Vec<u8>> {
        let mut log = self.log.borrow_mut();
        log.in_flight = log.in_flight.saturating_sub(1);

        if log.fail_output == Some(completed.display_order) {
            return Err(StatelessBackendError::OutOfResources);
        }

        if log.empty_output == Some(completed.display_order) {
            return Ok(Vec::new());
        }

        Ok(completed.to_bytes()?)
    }

    fn free(&mut self, picture: Self::Picture) {
        self.log.borrow_mut().freed.push(picture.index);
    }
}
