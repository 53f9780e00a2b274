// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::VecDeque;

use log::debug;
use log::trace;
use thiserror::Error;

use crate::encoder::gop::GopStructure;
use crate::encoder::lifecycle;
use crate::encoder::picture::PicHandle;
use crate::encoder::picture::Picture;
use crate::encoder::picture::PictureInfo;
use crate::encoder::picture::PictureType;
use crate::encoder::picture::MAX_REFERENCE_LIST_NUM;
use crate::encoder::scheduler::Pick;
use crate::encoder::scheduler::Scheduler;
use crate::encoder::scheduler::SchedulerState;
use crate::encoder::timestamps::TimestampRing;
use crate::encoder::window::Window;
use crate::encoder::CodedBitstreamBuffer;
use crate::encoder::EncodeError;
use crate::encoder::EncodeResult;
use crate::encoder::EncoderConfig;
use crate::encoder::FrameMetadata;
use crate::encoder::PacketMetadata;
use crate::BlockingMode;

#[derive(Error, Debug)]
pub enum StatelessBackendError {
    #[error("unsupported")]
    Unsupported,
    #[error("not enough resources to proceed with the operation now")]
    OutOfResources,
    #[error("fatal backend error: {0}")]
    Fatal(anyhow::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StatelessBackendError {
    /// Returns true if the backend cannot be used anymore.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StatelessBackendError::Fatal(_))
    }
}

pub type StatelessBackendResult<T> = Result<T, StatelessBackendError>;

/// Trait for representing pending encoder output.
pub trait BackendPromise {
    type Output;

    /// Return coded result of the processing. Blocks if processing is not finished yet.
    fn sync(self) -> StatelessBackendResult<Self::Output>;

    /// Return true whenever the underlaying processing is done
    fn is_ready(&self) -> bool;
}

pub struct ReadyPromise<T>(T);

impl<T> From<T> for ReadyPromise<T> {
    fn from(value: T) -> Self {
        ReadyPromise(value)
    }
}

impl<T> BackendPromise for ReadyPromise<T> {
    type Output = T;

    fn sync(self) -> StatelessBackendResult<Self::Output> {
        Ok(self.0)
    }

    fn is_ready(&self) -> bool {
        true
    }
}

/// Wrapper of a backend [`BackendPromise`] keeping track of the picture it encodes. Syncing it
/// never fails, the result of the backend promise is handed back together with the picture.
pub(crate) struct IssuedPicture<O>
where
    O: BackendPromise,
{
    handle: PicHandle,
    promise: O,
}

impl<O> BackendPromise for IssuedPicture<O>
where
    O: BackendPromise,
{
    type Output = (PicHandle, StatelessBackendResult<O::Output>);

    fn sync(self) -> StatelessBackendResult<Self::Output> {
        let result = self.promise.sync();
        trace!("synced issued picture, success={}", result.is_ok());

        Ok((self.handle, result))
    }

    fn is_ready(&self) -> bool {
        self.promise.is_ready()
    }
}

/// Internal structure representing all current processing represented using promises and allowing
/// polling for finished promises. Holds at most `capacity` promises.
pub(crate) struct OutputQueue<O>
where
    O: BackendPromise,
{
    /// True if the every single polling call shall be blocking
    blocking: BlockingMode,

    capacity: usize,

    /// Queue of currently pending [`BackendPromise`]
    promises: VecDeque<O>,
}

impl<O> OutputQueue<O>
where
    O: BackendPromise,
{
    pub(crate) fn new(blocking: BlockingMode, capacity: usize) -> Self {
        Self {
            blocking,
            capacity,
            promises: VecDeque::with_capacity(capacity),
        }
    }

    /// Add new pending job to the queue. Which will be returned to client if it is done.
    pub(crate) fn add_promise(&mut self, pending: O) -> EncodeResult<()> {
        if self.is_full() {
            log::error!("output queue overflow, {} promises pending", self.len());
            return Err(EncodeError::InvalidInternalState);
        }

        self.promises.push_back(pending);
        Ok(())
    }

    /// Returns the result of an oldest [`BackendPromise`] if it is done processing. If `mode` is
    /// blocking, then the function will block till processing of the oldest [`BackendPromise`] is
    /// finished and return it's result.
    pub(crate) fn poll(&mut self, mode: BlockingMode) -> StatelessBackendResult<Option<O::Output>> {
        let block = self.blocking == BlockingMode::Blocking || mode == BlockingMode::Blocking;

        match self.promises.pop_front() {
            Some(o) if block || o.is_ready() => Ok(Some(o.sync()?)),
            Some(o) => {
                self.promises.push_front(o);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Returns true if the oldest [`BackendPromise`] is done processing.
    pub(crate) fn front_is_ready(&self) -> bool {
        self.promises.front().is_some_and(|o| o.is_ready())
    }

    /// Returns true if queue is empty ie. no [`BackendPromise`] is pending.
    pub(crate) fn is_empty(&self) -> bool {
        self.promises.is_empty()
    }

    pub(crate) fn is_full(&self) -> bool {
        self.promises.len() >= self.capacity
    }

    pub(crate) fn len(&self) -> usize {
        self.promises.len()
    }
}

/// What a backend is able to encode. Used to derive the GOP structure of the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendCapabilities {
    /// Only intra pictures can be encoded
    pub intra_only: bool,
    pub b_pictures: bool,
    /// B-pictures may be used as references
    pub b_picture_references: bool,
    /// Key pictures that are not IDR can be encoded
    pub non_idr_key_pictures: bool,
    /// Maximum number of past references
    pub max_l0_refs: u32,
    /// Maximum number of future references
    pub max_l1_refs: u32,
    /// Only past pictures can be referenced
    pub prediction_pre_only: bool,
    /// Top layer non-key pictures are encoded as generalized B-pictures
    pub p_to_gpb: bool,
    /// Issued pictures complete asynchronously, up to `async_depth` may be in flight
    pub async_encode: bool,
    /// Decode timestamps are equal to presentation timestamps
    pub timestamp_no_delay: bool,
    /// Regions of interest are supported
    pub roi: bool,
}

impl Default for BackendCapabilities {
    fn default() -> Self {
        Self {
            intra_only: false,
            b_pictures: true,
            b_picture_references: true,
            non_idr_key_pictures: true,
            max_l0_refs: 1,
            max_l1_refs: 1,
            prediction_pre_only: false,
            p_to_gpb: false,
            async_encode: false,
            timestamp_no_delay: false,
            roi: false,
        }
    }
}

/// A picture used as a reference by the picture being issued.
pub struct ReferencePicture<'a, P> {
    pub info: PictureInfo,
    pub private: &'a P,
}

/// Everything a backend needs to encode one picture.
pub struct IssueRequest<'a, P> {
    pub picture: PictureInfo,
    /// Backend data of the picture to encode
    pub private: &'a mut P,
    /// Past (`[0]`) and future (`[1]`) reference pictures
    pub refs: [Vec<ReferencePicture<'a, P>>; MAX_REFERENCE_LIST_NUM],
    /// Other pictures the DPB holds after this picture is decoded
    pub dpb: Vec<ReferencePicture<'a, P>>,
}

/// Hardware specific part of the encoder. The engine decides what is encoded and when, the
/// backend only allocates, encodes, collects and frees pictures.
pub trait StatelessEncoderBackend<Handle> {
    /// Backend's representation of a picture, owning the input and reconstructed images.
    type Picture;

    /// Backend's specific [`BackendPromise`] for an issued picture.
    type CodedPromise: BackendPromise;

    fn capabilities(&self) -> BackendCapabilities;

    /// Imports the input [`Handle`] from client and transforms into [`Self::Picture`]
    fn alloc(
        &mut self,
        meta: &FrameMetadata,
        handle: Handle,
    ) -> StatelessBackendResult<Self::Picture>;

    /// Starts encoding of a picture.
    fn issue(
        &mut self,
        request: IssueRequest<'_, Self::Picture>,
    ) -> StatelessBackendResult<Self::CodedPromise>;

    /// Collects the bitstream of a completed picture.
    fn output(
        &mut self,
        picture: &mut Self::Picture,
        completed: <Self::CodedPromise as BackendPromise>::Output,
    ) -> StatelessBackendResult<Vec<u8>>;

    fn free(&mut self, picture: Self::Picture);
}

/// Stateless video encoder interface.
pub trait StatelessVideoEncoder<Handle> {
    /// Enqueues the frame for encoding. The implementation will drop the handle after it is no
    /// longer be needed. The encoder is not required to immediately start processing the frame
    /// and yield output bitstream. It is allowed to hold frames until certain conditions are met
    /// eg. for specified prediction structures or referencing in order to further optimize
    /// the compression rate of the bitstream.
    fn encode(&mut self, meta: FrameMetadata, handle: Handle) -> Result<(), EncodeError>;

    /// Drains the encoder. This means that encoder is required to finish processing of all the
    /// frames in the internal queue and yield output bitstream by the end of the call. The output
    /// bitstream then can be polled using [`poll`] function.
    ///
    /// Draining ends the stream, no frame can be encoded afterwards.
    ///
    /// [`poll`]: StatelessVideoEncoder::poll
    fn drain(&mut self) -> EncodeResult<()>;

    /// Polls on the encoder for the available output bitstream with compressed frames that where
    /// submitted with [`encode`].
    ///
    /// The call may also trigger a further processing aside of returning output. Therefore it
    /// *recommended* that this function is called frequently.
    ///
    /// [`encode`]: StatelessVideoEncoder::encode
    fn poll(&mut self) -> EncodeResult<Option<CodedBitstreamBuffer>>;
}

pub fn simple_encode_loop<E, H, P>(
    encoder: &mut E,
    frame_producer: &mut P,
    mut coded_consumer: impl FnMut(CodedBitstreamBuffer),
) -> EncodeResult<()>
where
    E: StatelessVideoEncoder<H>,
    P: Iterator<Item = (FrameMetadata, H)>,
{
    for (meta, handle) in frame_producer.by_ref() {
        encoder.encode(meta, handle)?;
        while let Some(coded) = encoder.poll()? {
            coded_consumer(coded);
        }
    }

    encoder.drain()?;
    while let Some(coded) = encoder.poll()? {
        coded_consumer(coded);
    }

    Ok(())
}

/// Result of [`StatelessEncoder::receive_packet`].
pub enum ReceivedPacket {
    Packet(CodedBitstreamBuffer),
    /// No packet is available now. More frames have to be submitted or the backend has to make
    /// progress before trying again.
    WouldBlock,
    /// Every picture of the stream has been output.
    EndOfStream,
}

/// Outcome of a single scheduling step.
enum Step {
    Packet(CodedBitstreamBuffer),
    /// A picture was output with an empty bitstream.
    Empty,
    NeedInput,
    /// The pipeline is full and its oldest picture is still being encoded.
    Busy,
    EndOfStream,
}

/// Helper aliases for backend specific types
type BackendPicture<H, B> = <B as StatelessEncoderBackend<H>>::Picture;

type CodedPromise<H, B> = <B as StatelessEncoderBackend<H>>::CodedPromise;

type Completed<H, B> = <CodedPromise<H, B> as BackendPromise>::Output;

pub struct StatelessEncoder<Handle, Backend>
where
    Backend: StatelessEncoderBackend<Handle>,
{
    /// Backend instance to delegate allocation, encoding and output to
    backend: Backend,
    caps: BackendCapabilities,

    /// Every live picture, in display order
    window: Window<BackendPicture<Handle, Backend>>,
    scheduler: Scheduler,
    timestamps: TimestampRing,

    /// Issued pictures waiting to be output, in encode order
    output_queue: OutputQueue<IssuedPicture<CodedPromise<Handle, Backend>>>,

    /// Frames submitted with [`StatelessVideoEncoder::encode`] and not admitted yet
    input_queue: VecDeque<(FrameMetadata, Handle)>,

    coded_queue: VecDeque<CodedBitstreamBuffer>,

    blocking: BlockingMode,

    /// End of stream was requested by the client
    draining: bool,
    /// A fatal error occurred, the session cannot continue
    failed: bool,

    /// Pictures the backend failed to encode or output
    failed_pictures: usize,

    crop_warned: bool,
    roi_warned: bool,
}

impl<Handle, Backend> StatelessEncoder<Handle, Backend>
where
    Backend: StatelessEncoderBackend<Handle>,
{
    /// Creates the encoder session. The structure of the stream is derived from `config` and the
    /// capabilities of `backend`.
    pub fn new(backend: Backend, config: EncoderConfig, blocking: BlockingMode) -> EncodeResult<Self> {
        config.validate()?;

        let caps = backend.capabilities();
        let gop = GopStructure::new(&config, &caps)?;

        debug!(
            "new encoder: gop_size={} b_per_p={} max_b_depth={} async={} async_depth={}",
            gop.gop_size,
            gop.b_per_p(),
            gop.max_b_depth(),
            caps.async_encode,
            config.async_depth
        );

        let timestamps =
            TimestampRing::new(gop.output_delay(), gop.decode_delay(), config.async_depth);

        Ok(Self {
            backend,
            caps,
            window: Window::new(),
            scheduler: Scheduler::new(gop),
            timestamps,
            output_queue: OutputQueue::new(blocking, config.async_depth as usize),
            input_queue: Default::default(),
            coded_queue: Default::default(),
            blocking,
            draining: false,
            failed: false,
            failed_pictures: 0,
            crop_warned: false,
            roi_warned: false,
        })
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn state(&self) -> SchedulerState {
        self.scheduler.state(&self.window)
    }

    /// Number of pictures issued to the backend and not output yet.
    pub fn in_flight(&self) -> usize {
        self.output_queue.len()
    }

    /// Number of live pictures.
    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    /// Number of retired pictures that produced no packet because the backend failed.
    pub fn failed_pictures(&self) -> usize {
        self.failed_pictures
    }

    /// Returns the next coded picture, in encode order.
    pub fn receive_packet(&mut self) -> EncodeResult<ReceivedPacket> {
        self.next_packet(self.blocking)
    }

    /// Fills the client visible properties of the packet coding `pic`: key flag, timestamps and
    /// user payload. With `no_delay` the decode timestamp equals the presentation timestamp.
    pub fn set_output_property(
        &mut self,
        pic: PicHandle,
        packet: &mut PacketMetadata,
        no_delay: bool,
    ) -> EncodeResult<()> {
        let picture = self.window.get_mut(pic)?;
        let encode_order = picture.encode_order.ok_or(EncodeError::InvalidInternalState)?;

        packet.key_frame = picture.pic_type == PictureType::Idr;
        packet.pts = picture.pts;
        packet.duration = picture.duration;
        packet.pic_type = picture.pic_type;
        packet.display_order = picture.display_order;
        packet.encode_order = encode_order;
        packet.opaque = picture.opaque.take();
        packet.dts = self.timestamps.dts(encode_order, picture.pts, no_delay);

        Ok(())
    }

    /// Ends the stream and releases every picture. Packets produced while draining remain
    /// available through [`StatelessVideoEncoder::poll`].
    pub fn close(&mut self) -> EncodeResult<()> {
        let result = if self.failed || (self.scheduler.end_of_stream() && self.window.is_empty()) {
            Ok(())
        } else {
            self.drain()
        };

        self.release_everything();
        result
    }

    fn next_packet(&mut self, mode: BlockingMode) -> EncodeResult<ReceivedPacket> {
        if let Some(coded) = self.coded_queue.pop_front() {
            return Ok(ReceivedPacket::Packet(coded));
        }

        loop {
            match self.step(mode)? {
                Step::Packet(coded) => return Ok(ReceivedPacket::Packet(coded)),
                Step::EndOfStream => return Ok(ReceivedPacket::EndOfStream),
                Step::NeedInput | Step::Empty if self.can_progress() => continue,
                Step::Empty if self.scheduler.end_of_stream() => continue,
                Step::NeedInput | Step::Empty | Step::Busy => return Ok(ReceivedPacket::WouldBlock),
            }
        }
    }

    /// Whether another step may make progress without new input.
    fn can_progress(&self) -> bool {
        !self.input_queue.is_empty() || (self.draining && !self.scheduler.end_of_stream())
    }

    fn step(&mut self, mode: BlockingMode) -> EncodeResult<Step> {
        if self.failed {
            return Err(EncodeError::SessionFailed);
        }

        let result = self.try_step(mode);
        if let Err(e) = &result {
            if e.is_fatal() {
                log::error!("encode session failed: {}", e);
                self.failed = true;
            }
        }

        result
    }

    fn try_step(&mut self, mode: BlockingMode) -> EncodeResult<Step> {
        let block = self.blocking == BlockingMode::Blocking || mode == BlockingMode::Blocking;

        // Backpressure: do not take more input while the pipeline is stalled.
        if self.caps.async_encode
            && self.output_queue.is_full()
            && !block
            && !self.output_queue.front_is_ready()
        {
            trace!("pipeline full, {} pictures in flight", self.output_queue.len());
            return Ok(Step::Busy);
        }

        self.admit_next()?;

        if self.window.is_empty() {
            return Ok(if self.scheduler.end_of_stream() {
                Step::EndOfStream
            } else {
                Step::NeedInput
            });
        }

        let (pic, completed) = if self.caps.async_encode {
            let mut pick = None;
            if !self.output_queue.is_full() {
                match self.scheduler.pick_next(&mut self.window)? {
                    Pick::Picture(pic) => {
                        let encode_order =
                            self.scheduler.encode_order_for(self.output_queue.len());
                        let promise = self.issue(pic, encode_order)?;
                        self.output_queue.add_promise(IssuedPicture {
                            handle: pic,
                            promise,
                        })?;
                    }
                    other => pick = Some(other),
                }
            }

            if self.output_queue.is_empty() {
                if pick == Some(Pick::EndOfStream) {
                    self.finish_stream()?;
                    return Ok(Step::EndOfStream);
                }

                return Ok(Step::NeedInput);
            }

            // More pictures can be buffered
            if !self.output_queue.is_full() && !self.scheduler.end_of_stream() {
                return Ok(Step::NeedInput);
            }

            let polled = self.output_queue.poll(mode).map_err(|e| {
                log::error!("failed to poll issued pictures: {}", e);
                EncodeError::InvalidInternalState
            })?;
            match polled {
                Some((pic, completed)) => {
                    let encode_order = self
                        .window
                        .get(pic)?
                        .encode_order
                        .ok_or(EncodeError::InvalidInternalState)?;
                    self.scheduler.advance(encode_order);
                    (pic, completed)
                }
                None => return Ok(Step::Busy),
            }
        } else {
            match self.scheduler.pick_next(&mut self.window)? {
                Pick::Picture(pic) => {
                    let encode_order = self.scheduler.encode_order_for(0);
                    let promise = self.issue(pic, encode_order)?;
                    self.scheduler.advance(encode_order);
                    (pic, promise.sync())
                }
                Pick::EndOfStream => {
                    self.finish_stream()?;
                    return Ok(Step::EndOfStream);
                }
                Pick::NeedMoreInput | Pick::Pending => return Ok(Step::NeedInput),
            }
        };

        self.output_picture(pic, completed)
    }

    /// Admits the oldest submitted frame, or signals the end of stream once every frame has been
    /// admitted while draining.
    fn admit_next(&mut self) -> EncodeResult<()> {
        if let Some((meta, handle)) = self.input_queue.pop_front() {
            self.admit(meta, handle)
        } else {
            if self.draining && !self.scheduler.end_of_stream() {
                self.scheduler.signal_end_of_stream();
                if let Some(tail) = self.window.peek_tail() {
                    let tail_pts = self.window.get(tail)?.pts;
                    self.timestamps
                        .end_of_stream(self.scheduler.input_order(), tail_pts);
                }
            }

            Ok(())
        }
    }

    fn admit(&mut self, meta: FrameMetadata, handle: Handle) -> EncodeResult<()> {
        if !meta.crop.is_empty() && !self.crop_warned {
            log::warn!("cropping information on input frames ignored due to lack of support");
            self.crop_warned = true;
        }

        if meta.roi && !self.caps.roi && !self.roi_warned {
            log::warn!("regions of interest on input frames ignored, not supported by backend");
            self.roi_warned = true;
        }

        self.window.reserve()?;
        let private = self.backend.alloc(&meta, handle).map_err(|e| {
            log::error!(
                "failed to allocate picture {}: {}",
                self.scheduler.input_order(),
                e
            );
            EncodeError::AllocationFailure
        })?;

        let input_order = self.scheduler.next_input();
        let force_idr = input_order == 0 || meta.force_keyframe;
        self.timestamps.record_input(input_order, meta.pts);

        trace!(
            "admit picture {}: pts={} force_idr={}",
            input_order,
            meta.pts,
            force_idr
        );
        self.window
            .admit(Picture::new(input_order, meta, force_idr, private));

        Ok(())
    }

    fn issue(
        &mut self,
        pic: PicHandle,
        encode_order: u64,
    ) -> EncodeResult<CodedPromise<Handle, Backend>> {
        let picture = self.window.get_mut(pic)?;
        picture.encode_order = Some(encode_order);
        let display_order = picture.display_order;

        trace!(
            "issue picture {} as {} with encode order {}",
            display_order,
            picture.pic_type,
            encode_order
        );

        let mut private = picture
            .private
            .take()
            .ok_or(EncodeError::InvalidInternalState)?;
        let result = Self::issue_request(&mut self.backend, &self.window, pic, &mut private);

        let picture = self.window.get_mut(pic)?;
        picture.private = Some(private);
        picture.encode_issued = true;

        match result? {
            Ok(promise) => Ok(promise),
            Err(source) => {
                log::error!("failed to issue picture {}: {}", display_order, source);

                // The picture will not be output, retire it right away.
                picture.encode_complete = true;
                picture.encode_failed = true;
                self.retire_completed()?;

                Err(EncodeError::BackendIssueFailure {
                    display_order,
                    source,
                })
            }
        }
    }

    fn issue_request(
        backend: &mut Backend,
        window: &Window<BackendPicture<Handle, Backend>>,
        pic: PicHandle,
        private: &mut BackendPicture<Handle, Backend>,
    ) -> EncodeResult<StatelessBackendResult<CodedPromise<Handle, Backend>>> {
        let picture = window.get(pic)?;

        let references = |handles: &[PicHandle]| {
            handles
                .iter()
                .filter(|h| **h != pic)
                .map(|h| reference_picture(window, *h))
                .collect::<EncodeResult<Vec<_>>>()
        };

        let request = IssueRequest {
            picture: picture.info(),
            private,
            refs: [references(&picture.refs[0])?, references(&picture.refs[1])?],
            dpb: references(&picture.dpb)?,
        };

        Ok(backend.issue(request))
    }

    fn output_picture(
        &mut self,
        pic: PicHandle,
        completed: StatelessBackendResult<Completed<Handle, Backend>>,
    ) -> EncodeResult<Step> {
        let picture = self.window.get_mut(pic)?;
        picture.encode_complete = true;
        let display_order = picture.display_order;

        let bitstream = match completed {
            Ok(completed) => {
                let private = picture
                    .private
                    .as_mut()
                    .ok_or(EncodeError::InvalidInternalState)?;
                self.backend.output(private, completed).map_err(|source| {
                    EncodeError::BackendOutputFailure {
                        display_order,
                        source,
                    }
                })
            }
            Err(source) => Err(EncodeError::BackendIssueFailure {
                display_order,
                source,
            }),
        };

        let bitstream = match bitstream {
            Ok(bitstream) => bitstream,
            Err(e) => {
                log::error!("output failed: {}", e);
                self.window.get_mut(pic)?.encode_failed = true;
                self.retire_completed()?;
                return Err(e);
            }
        };

        let mut metadata = PacketMetadata::default();
        self.set_output_property(pic, &mut metadata, self.caps.timestamp_no_delay)?;
        self.scheduler.output_done(metadata.encode_order);

        trace!(
            "output picture {} ({}): encode_order={} pts={} dts={} size={}",
            metadata.display_order,
            metadata.pic_type,
            metadata.encode_order,
            metadata.pts,
            metadata.dts,
            bitstream.len()
        );

        self.retire_completed()?;

        if bitstream.is_empty() {
            return Ok(Step::Empty);
        }

        Ok(Step::Packet(CodedBitstreamBuffer::new(metadata, bitstream)))
    }

    /// Retires the completed pictures nobody references anymore.
    fn retire_completed(&mut self) -> EncodeResult<()> {
        for picture in lifecycle::clear_old(&mut self.window, false)? {
            self.free_picture(picture);
        }

        Ok(())
    }

    /// Releases every picture once all of them are complete.
    fn finish_stream(&mut self) -> EncodeResult<()> {
        self.scheduler.release_references(&mut self.window)?;

        for picture in lifecycle::clear_old(&mut self.window, true)? {
            self.free_picture(picture);
        }

        for picture in lifecycle::release_all(&mut self.window) {
            self.free_picture(picture);
        }

        debug!(
            "end of stream, {} pictures admitted, {} failed",
            self.scheduler.input_order(),
            self.failed_pictures
        );
        Ok(())
    }

    /// Waits for the pictures in flight and frees every remaining picture.
    fn release_everything(&mut self) {
        while let Ok(Some((pic, _))) = self.output_queue.poll(BlockingMode::Blocking) {
            if let Ok(picture) = self.window.get_mut(pic) {
                picture.encode_complete = true;
            }
        }

        for picture in lifecycle::release_all(&mut self.window) {
            self.free_picture(picture);
        }

        self.input_queue.clear();
    }

    fn free_picture(&mut self, mut picture: Picture<BackendPicture<Handle, Backend>>) {
        if picture.encode_failed {
            self.failed_pictures += 1;
        }

        if let Some(private) = picture.private.take() {
            self.backend.free(private);
        }
    }
}

fn reference_picture<P>(window: &Window<P>, pic: PicHandle) -> EncodeResult<ReferencePicture<'_, P>> {
    let picture = window.get(pic)?;
    let private = picture
        .private
        .as_ref()
        .ok_or(EncodeError::InvalidReferenceState)?;

    Ok(ReferencePicture {
        info: picture.info(),
        private,
    })
}

impl<Handle, Backend> StatelessVideoEncoder<Handle> for StatelessEncoder<Handle, Backend>
where
    Backend: StatelessEncoderBackend<Handle>,
{
    fn encode(&mut self, meta: FrameMetadata, handle: Handle) -> EncodeResult<()> {
        log::trace!("encode: pts={} force_keyframe={}", meta.pts, meta.force_keyframe);

        if self.failed {
            return Err(EncodeError::SessionFailed);
        }

        if self.draining {
            return Err(EncodeError::EndOfStreamSignalled);
        }

        self.input_queue.push_back((meta, handle));
        Ok(())
    }

    fn drain(&mut self) -> EncodeResult<()> {
        log::trace!(
            "draining, {} frames queued, {} pictures live",
            self.input_queue.len(),
            self.window.len()
        );

        self.draining = true;

        // Failures of single pictures are reported once every picture went through the backend.
        let mut first_error = None;
        loop {
            let step = match self.step(BlockingMode::Blocking) {
                Ok(step) => step,
                Err(e) if !e.is_fatal() => {
                    first_error.get_or_insert(e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            match step {
                Step::Packet(coded) => self.coded_queue.push_back(coded),
                Step::EndOfStream => break,
                Step::Empty | Step::Busy => (),
                Step::NeedInput if self.can_progress() => (),
                Step::NeedInput => {
                    log::error!("failed to drain encoder, no picture was returned");
                    return Err(EncodeError::InvalidInternalState);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn poll(&mut self) -> EncodeResult<Option<CodedBitstreamBuffer>> {
        // Try to make progress without blocking and dequeue from coded queue
        match self.next_packet(BlockingMode::NonBlocking)? {
            ReceivedPacket::Packet(coded) => Ok(Some(coded)),
            ReceivedPacket::WouldBlock | ReceivedPacket::EndOfStream => Ok(None),
        }
    }
}

impl<Handle, Backend> Drop for StatelessEncoder<Handle, Backend>
where
    Backend: StatelessEncoderBackend<Handle>,
{
    fn drop(&mut self) {
        self.release_everything();
    }
}
