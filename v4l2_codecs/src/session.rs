// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Glue shared by every stateless codec: format negotiation, buffer allocation, bitstream
//! accumulation, request submission and picture output.
//!
//! A codec implements [`StatelessCodec`] and drives a [`DecodeSession`]. The session owns the
//! bitstream allocator, the picture allocator and the picture pool, and hands requests to the
//! [`Decoder`].

use std::cmp::max;
use std::sync::Arc;

use log::debug;
use log::error;
use log::warn;
use v4l2_sys::V4L2_BUF_FLAG_M2M_HOLD_CAPTURE_BUF;

use crate::allocator::CodecAllocator;
use crate::allocator::CodecMemory;
use crate::config::DecoderConfig;
use crate::decoder::Decoder;
use crate::device::Control;
use crate::device::DecoderDevice;
use crate::error::Error;
use crate::error::Result;
use crate::format::CodedFormat;
use crate::format::DecodedFormat;
use crate::format::Direction;
use crate::format::VideoInfo;
use crate::pool::CodecPool;
use crate::pool::PictureBuffer;
use crate::request::Request;

const START_CODE: [u8; 3] = [0, 0, 1];

/// Stream parameters a codec negotiates with the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamParams {
    pub coded_format: CodedFormat,
    pub width: u32,
    pub height: u32,
    pub bit_depth: u32,
    /// Acceptable decoded formats, in order of preference. Empty accepts any known format.
    pub preferred: Vec<DecodedFormat>,
}

/// Decode state of one coded frame, from `start_picture` to `output_picture`.
pub struct DecodeFrame<D: DecoderDevice> {
    frame_num: u32,
    /// Most recently submitted request of the frame.
    request: Option<Request<D>>,
}

impl<D: DecoderDevice> DecodeFrame<D> {
    pub fn new(frame_num: u32) -> Self {
        DecodeFrame {
            frame_num,
            request: None,
        }
    }

    pub fn frame_num(&self) -> u32 {
        self.frame_num
    }

    pub fn request(&self) -> Option<&Request<D>> {
        self.request.as_ref()
    }
}

pub struct DecodeSession<D: DecoderDevice> {
    decoder: Arc<Decoder<D>>,
    sink_allocator: Option<CodecAllocator<D>>,
    src_allocator: Option<CodecAllocator<D>>,
    pool: Option<CodecPool<D>>,
    video_info: Option<VideoInfo>,
    bitstream: Option<CodecMemory>,
    streaming: bool,
}

impl<D: DecoderDevice> DecodeSession<D> {
    pub fn new(decoder: Arc<Decoder<D>>) -> Self {
        DecodeSession {
            decoder,
            sink_allocator: None,
            src_allocator: None,
            pool: None,
            video_info: None,
            bitstream: None,
            streaming: false,
        }
    }

    /// Opens the device pair named in `config`.
    pub fn open(config: DecoderConfig) -> Result<Self> {
        let decoder = Decoder::new(config);
        decoder.open()?;
        Ok(Self::new(decoder))
    }

    pub fn decoder(&self) -> &Arc<Decoder<D>> {
        &self.decoder
    }

    pub fn video_info(&self) -> Option<&VideoInfo> {
        self.video_info.as_ref()
    }

    pub fn pool(&self) -> Option<&CodecPool<D>> {
        self.pool.as_ref()
    }

    pub fn sink_allocator(&self) -> Option<&CodecAllocator<D>> {
        self.sink_allocator.as_ref()
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Live streams decode with no render delay, others keep one frame in flight.
    pub fn set_preferred_output_delay(&self, live: bool) -> u32 {
        let delay = if live { 0 } else { 1 };
        self.decoder.set_render_delay(delay);
        delay
    }

    fn streamoff(&mut self) {
        if !self.streaming {
            return;
        }
        for direction in [Direction::Input, Direction::Output] {
            if let Err(e) = self.decoder.streamoff(direction) {
                warn!("{}", e);
            }
        }
        self.streaming = false;
    }

    fn reset_allocation(&mut self) {
        self.bitstream = None;
        if let Some(allocator) = self.sink_allocator.take() {
            allocator.detach();
        }
        self.pool = None;
        if let Some(allocator) = self.src_allocator.take() {
            allocator.detach();
        }
    }

    /// Stops streaming, releases all buffers and configures the driver for a new stream.
    ///
    /// `sequence_controls` are set on the device outside of any request.
    pub fn negotiate(
        &mut self,
        params: &StreamParams,
        sequence_controls: &[Control<'_>],
    ) -> Result<VideoInfo> {
        self.streamoff();
        self.reset_allocation();

        self.decoder.set_sink_format(
            params.coded_format.fourcc(),
            params.width,
            params.height,
            params.bit_depth,
        )?;
        if !sequence_controls.is_empty() {
            self.decoder
                .set_controls(None, sequence_controls)
                .map_err(|e| {
                    error!("Driver does not support the selected stream: {}", e);
                    e
                })?;
        }
        let info = self.decoder.select_src_format(&params.preferred)?;
        debug!(
            "negotiated {} {}x{} to {} {}x{}",
            params.coded_format, params.width, params.height, info.format, info.width, info.height
        );
        self.video_info = Some(info.clone());
        Ok(info)
    }

    /// Creates the allocators and the picture pool.
    ///
    /// The bitstream side gets one buffer more than the number of requests that can be in
    /// flight. The picture side gets `min_pool_size` (the reference frames of the codec) plus
    /// what downstream keeps, at least two. Nothing changes while streaming.
    pub fn decide_allocation(&mut self, min_pool_size: u32, downstream_min: u32) -> Result<()> {
        if self.streaming {
            return Ok(());
        }
        let info = self.video_info.clone().ok_or(Error::UnsupportedFormat)?;
        self.reset_allocation();

        let num_bitstream = 1 + max(1, self.decoder.render_delay());
        let num_pictures = min_pool_size + max(2, downstream_min);
        let sink = CodecAllocator::new(&self.decoder, Direction::Input, num_bitstream)?;
        let src = CodecAllocator::new(&self.decoder, Direction::Output, num_pictures)?;
        self.pool = Some(CodecPool::new(&src, info));
        self.sink_allocator = Some(sink);
        self.src_allocator = Some(src);
        debug!(
            "allocated {} bitstream and {} picture buffers",
            num_bitstream, num_pictures
        );
        Ok(())
    }

    pub fn start_streaming(&mut self) -> Result<()> {
        if self.streaming {
            return Ok(());
        }
        self.decoder.streamon(Direction::Input)?;
        self.decoder.streamon(Direction::Output)?;
        self.streaming = true;
        Ok(())
    }

    /// Makes sure a bitstream buffer is bound and empties it.
    ///
    /// Waits up to the request timeout when every bitstream buffer is in flight.
    pub fn ensure_bitstream(&mut self) -> Result<()> {
        if let Some(bitstream) = self.bitstream.as_mut() {
            bitstream.set_size(0);
            return Ok(());
        }
        let allocator = self.sink_allocator.as_ref().ok_or(Error::NoBitstream)?;
        let bitstream = match allocator.alloc() {
            Some(memory) => memory,
            None => {
                allocator.wait_for_buffer(Some(self.decoder.request_timeout()))?;
                allocator.alloc().ok_or_else(|| {
                    error!("Not enough memory to decode the stream.");
                    Error::NoBitstream
                })?
            }
        };
        self.bitstream = Some(bitstream);
        Ok(())
    }

    /// Bytes accumulated in the bound bitstream buffer.
    pub fn bitstream_size(&self) -> usize {
        self.bitstream.as_ref().map_or(0, |b| b.size())
    }

    /// Appends one unit of coded data, prefixed with a start code if asked to.
    pub fn append_bitstream(&mut self, data: &[u8], start_code: bool) -> Result<()> {
        let bitstream = self.bitstream.as_mut().ok_or(Error::NoBitstream)?;
        let prefix: &[u8] = if start_code { &START_CODE } else { &[] };
        if bitstream.size() + prefix.len() + data.len() > bitstream.capacity() {
            error!("Not enough space to send all slices of a frame.");
            return Err(Error::BitstreamOverflow);
        }
        bitstream.append(prefix)?;
        bitstream.append(data)
    }

    /// Submits the accumulated bitstream of `frame` with the given per-frame controls.
    ///
    /// The first submission of a frame takes a picture from the pool. Later submissions
    /// continue the same picture through a sub-request.
    pub fn submit(
        &mut self,
        frame: &mut DecodeFrame<D>,
        controls: &[Control<'_>],
        flags: u32,
    ) -> Result<()> {
        let bitstream = self.bitstream.take().ok_or(Error::NoBitstream)?;

        let request = match frame.request.as_ref() {
            Some(prev) => self.decoder.alloc_sub_request(prev, bitstream),
            None => {
                let picture = self.acquire_picture()?;
                self.decoder
                    .alloc_request(frame.frame_num, bitstream, picture)
            }
        }
        .map_err(|e| {
            error!("Failed to allocate a media request object: {}", e);
            e
        })?;

        request.set_controls(controls).map_err(|e| {
            error!("Driver did not accept the bitstream parameters: {}", e);
            e
        })?;
        request.queue(flags).map_err(|e| {
            error!("Driver did not accept the decode request: {}", e);
            e
        })?;
        frame.request = Some(request);
        Ok(())
    }

    /// For slice based decoders: submits the slices accumulated so far, asking the driver to
    /// hold the picture, and binds a fresh bitstream buffer for the next slice.
    pub fn submit_pending_slices(
        &mut self,
        frame: &mut DecodeFrame<D>,
        controls: &[Control<'_>],
    ) -> Result<()> {
        if self.bitstream_size() == 0 {
            return Ok(());
        }
        self.submit(frame, controls, V4L2_BUF_FLAG_M2M_HOLD_CAPTURE_BUF)?;
        self.ensure_bitstream()
    }

    fn acquire_picture(&self) -> Result<PictureBuffer> {
        let pool = self.pool.as_ref().ok_or(Error::PoolExhausted)?;
        pool.acquire().map_err(|e| {
            match e {
                Error::Flushing => debug!("Frame decoding aborted, we are flushing."),
                _ => error!("No more picture buffer available: {}", e),
            }
            e
        })
    }

    /// Waits for `frame` to be decoded and returns its picture.
    pub fn finish(&mut self, frame: DecodeFrame<D>) -> Result<PictureBuffer> {
        let frame_num = frame.frame_num;
        let Some(request) = frame.request else {
            error!("Frame {} was never submitted", frame_num);
            return Err(Error::FrameFailed(frame_num));
        };
        request.set_done().map_err(|e| {
            match e {
                Error::RequestTimeout { .. } => {
                    error!("Decoding frame {} took too long", frame_num)
                }
                _ => error!("Decoding request failed: {}", e),
            }
            e
        })?;
        if request.failed() {
            error!("Failed to decode frame {}", frame_num);
            return Err(Error::FrameFailed(frame_num));
        }
        Ok(request.dup_pic_buf())
    }

    /// Interrupts, or stops interrupting, threads waiting for buffers.
    pub fn set_flushing(&self, flushing: bool) {
        for allocator in [&self.sink_allocator, &self.src_allocator]
            .into_iter()
            .flatten()
        {
            allocator.set_flushing(flushing);
        }
    }

    /// Drops everything queued to the driver and resumes decoding.
    pub fn flush(&mut self) -> Result<()> {
        debug!("Flushing decoder state.");
        self.bitstream = None;
        let result = self.decoder.flush();
        self.set_flushing(false);
        result
    }

    /// Stops streaming and releases every buffer.
    pub fn stop(&mut self) {
        self.streamoff();
        self.reset_allocation();
        self.video_info = None;
    }

    pub fn close(mut self) {
        self.stop();
        self.decoder.close();
    }
}

/// Codec specific part of a stateless decoder.
///
/// Implementations parse the bitstream, translate syntax into driver controls and call into
/// the [`DecodeSession`] for everything else.
pub trait StatelessCodec<D: DecoderDevice> {
    /// Parsed header of one picture.
    type Picture;

    /// A new sequence starts. Usually negotiates and allocates.
    fn new_sequence(&mut self, session: &mut DecodeSession<D>) -> Result<()>;

    fn start_picture(
        &mut self,
        session: &mut DecodeSession<D>,
        frame: &mut DecodeFrame<D>,
        picture: &Self::Picture,
    ) -> Result<()>;

    fn decode_slice(
        &mut self,
        session: &mut DecodeSession<D>,
        frame: &mut DecodeFrame<D>,
        slice: &[u8],
    ) -> Result<()>;

    fn end_picture(
        &mut self,
        session: &mut DecodeSession<D>,
        frame: &mut DecodeFrame<D>,
    ) -> Result<()>;

    fn output_picture(
        &mut self,
        session: &mut DecodeSession<D>,
        frame: DecodeFrame<D>,
    ) -> Result<PictureBuffer> {
        session.finish(frame)
    }
}

#[cfg(test)]
mod tests {
    use v4l2_sys::V4L2_CID_STATELESS_VP8_FRAME;

    use super::*;
    use crate::fake::FakeDevice;
    use crate::fake::FakeOptions;

    fn session(options: FakeOptions) -> DecodeSession<FakeDevice> {
        DecodeSession::new(Decoder::with_device(
            Default::default(),
            FakeDevice::new(options),
        ))
    }

    fn vp8() -> StreamParams {
        StreamParams {
            coded_format: CodedFormat::VP8,
            width: 176,
            height: 144,
            bit_depth: 8,
            preferred: vec![DecodedFormat::NV12],
        }
    }

    #[test]
    fn allocation_sizing() {
        let mut session = session(FakeOptions::default());
        session.negotiate(&vp8(), &[]).unwrap();
        session.set_preferred_output_delay(false);
        session.decide_allocation(4, 0).unwrap();
        assert_eq!(session.sink_allocator().unwrap().pool_size(), 2);
        assert_eq!(session.pool().unwrap().free_containers(), 6);

        session.set_preferred_output_delay(true);
        session.decide_allocation(4, 5).unwrap();
        assert_eq!(session.sink_allocator().unwrap().pool_size(), 2);
        assert_eq!(session.pool().unwrap().free_containers(), 9);

        session.decoder().set_render_delay(3);
        session.decide_allocation(1, 0).unwrap();
        assert_eq!(session.sink_allocator().unwrap().pool_size(), 4);
    }

    #[test]
    fn allocation_needs_negotiation() {
        let mut session = session(FakeOptions::default());
        assert!(matches!(
            session.decide_allocation(1, 2),
            Err(Error::UnsupportedFormat)
        ));
    }

    #[test]
    fn decodes_one_frame() {
        let mut session = session(FakeOptions::default());
        session.negotiate(&vp8(), &[]).unwrap();
        session.decide_allocation(2, 2).unwrap();
        session.start_streaming().unwrap();

        let mut frame = DecodeFrame::new(1);
        session.ensure_bitstream().unwrap();
        session.append_bitstream(&[0x9d, 0x01, 0x2a], false).unwrap();
        assert_eq!(session.bitstream_size(), 3);
        let params = [0u8; 16];
        session
            .submit(
                &mut frame,
                &[Control::compound(V4L2_CID_STATELESS_VP8_FRAME, &params)],
                0,
            )
            .unwrap();
        assert_eq!(session.bitstream_size(), 0);
        let picture = session.finish(frame).unwrap();
        assert_eq!(picture.video_info().format, DecodedFormat::NV12);
    }

    #[test]
    fn overflow_is_reported() {
        let mut session = session(FakeOptions::default());
        session.negotiate(&vp8(), &[]).unwrap();
        session.decide_allocation(1, 0).unwrap();
        session.ensure_bitstream().unwrap();
        let capacity = session.bitstream.as_ref().unwrap().capacity();
        let data = vec![0u8; capacity - 2];
        assert!(matches!(
            session.append_bitstream(&data, true),
            Err(Error::BitstreamOverflow)
        ));
        session.append_bitstream(&data, false).unwrap();
    }

    #[test]
    fn unsubmitted_frame_fails() {
        let mut session = session(FakeOptions::default());
        assert!(matches!(
            session.finish(DecodeFrame::new(3)),
            Err(Error::FrameFailed(3))
        ));
    }

    #[test]
    fn renegotiation_releases_buffers() {
        let mut session = session(FakeOptions::default());
        session.negotiate(&vp8(), &[]).unwrap();
        session.decide_allocation(2, 2).unwrap();
        session.start_streaming().unwrap();
        let fake = session.decoder().device().unwrap();
        assert!(fake.reserved(Direction::Output) > 0);

        let mut bigger = vp8();
        bigger.width = 640;
        bigger.height = 480;
        let info = session.negotiate(&bigger, &[]).unwrap();
        assert_eq!(info.width, 640);
        assert!(!session.is_streaming());
        assert_eq!(fake.reserved(Direction::Input), 0);
        assert_eq!(fake.reserved(Direction::Output), 0);
    }
}
