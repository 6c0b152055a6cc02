// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Drives complete decode sessions through a toy codec on the fake device.

use std::collections::VecDeque;
use std::sync::Arc;

use v4l2_codecs::device::Control;
use v4l2_codecs::fake::FakeDevice;
use v4l2_codecs::fake::FakeOptions;
use v4l2_codecs::CodedFormat;
use v4l2_codecs::DecodeFrame;
use v4l2_codecs::DecodeSession;
use v4l2_codecs::DecodedFormat;
use v4l2_codecs::Decoder;
use v4l2_codecs::DecoderConfig;
use v4l2_codecs::Direction;
use v4l2_codecs::Error;
use v4l2_codecs::ErrorClass;
use v4l2_codecs::PictureBuffer;
use v4l2_codecs::StatelessCodec;
use v4l2_codecs::StreamParams;
use v4l2_codecs::VideoInfo;
use v4l2_sys::V4L2_CID_STATELESS_HEVC_DECODE_PARAMS;
use v4l2_sys::V4L2_CID_STATELESS_HEVC_SLICE_PARAMS;
use v4l2_sys::V4L2_CID_STATELESS_HEVC_SPS;
use v4l2_sys::V4L2_CID_STATELESS_VP8_FRAME;

/// Header of one toy picture.
struct ToyHeader {
    slices: usize,
}

/// Minimal codec: fixed controls, every slice prefixed with a start code when slice based.
struct ToyCodec {
    format: CodedFormat,
    width: u32,
    height: u32,
    min_pool_size: u32,
    /// Requests submitted so far, counting sub-requests.
    submissions: usize,
    slice_params: [u8; 8],
}

impl ToyCodec {
    fn new(format: CodedFormat) -> Self {
        ToyCodec {
            format,
            width: 320,
            height: 240,
            min_pool_size: 2,
            submissions: 0,
            slice_params: [0; 8],
        }
    }

    fn frame_controls(&self) -> Vec<Control<'_>> {
        match self.format {
            CodedFormat::Hevc => vec![
                Control::compound(V4L2_CID_STATELESS_HEVC_SLICE_PARAMS, &self.slice_params),
                Control::compound(V4L2_CID_STATELESS_HEVC_DECODE_PARAMS, &self.slice_params),
            ],
            _ => vec![Control::compound(
                V4L2_CID_STATELESS_VP8_FRAME,
                &self.slice_params,
            )],
        }
    }
}

impl StatelessCodec<FakeDevice> for ToyCodec {
    type Picture = ToyHeader;

    fn new_sequence(&mut self, session: &mut DecodeSession<FakeDevice>) -> v4l2_codecs::Result<()> {
        let sps = [1u8; 16];
        let sequence = match self.format {
            CodedFormat::Hevc => vec![Control::compound(V4L2_CID_STATELESS_HEVC_SPS, &sps)],
            _ => Vec::new(),
        };
        let params = StreamParams {
            coded_format: self.format,
            width: self.width,
            height: self.height,
            bit_depth: 8,
            preferred: vec![DecodedFormat::NV12],
        };
        session.negotiate(&params, &sequence)?;
        session.decide_allocation(self.min_pool_size, 2)?;
        session.start_streaming()
    }

    fn start_picture(
        &mut self,
        session: &mut DecodeSession<FakeDevice>,
        _frame: &mut DecodeFrame<FakeDevice>,
        _picture: &ToyHeader,
    ) -> v4l2_codecs::Result<()> {
        session.ensure_bitstream()
    }

    fn decode_slice(
        &mut self,
        session: &mut DecodeSession<FakeDevice>,
        frame: &mut DecodeFrame<FakeDevice>,
        slice: &[u8],
    ) -> v4l2_codecs::Result<()> {
        let slice_based = self.format.is_slice_based();
        if slice_based && session.bitstream_size() > 0 {
            let controls = self.frame_controls();
            session.submit_pending_slices(frame, &controls)?;
            self.submissions += 1;
        }
        session.append_bitstream(slice, slice_based)
    }

    fn end_picture(
        &mut self,
        session: &mut DecodeSession<FakeDevice>,
        frame: &mut DecodeFrame<FakeDevice>,
    ) -> v4l2_codecs::Result<()> {
        let controls = self.frame_controls();
        session.submit(frame, &controls, 0)?;
        self.submissions += 1;
        Ok(())
    }
}

fn session(options: FakeOptions, config: DecoderConfig) -> DecodeSession<FakeDevice> {
    DecodeSession::new(Decoder::with_device(config, FakeDevice::new(options)))
}

fn fake(session: &DecodeSession<FakeDevice>) -> Arc<FakeDevice> {
    session.decoder().device().unwrap()
}

fn decode(
    codec: &mut ToyCodec,
    session: &mut DecodeSession<FakeDevice>,
    frame_num: u32,
    header: &ToyHeader,
) -> v4l2_codecs::Result<DecodeFrame<FakeDevice>> {
    let mut frame = DecodeFrame::new(frame_num);
    codec.start_picture(session, &mut frame, header)?;
    for i in 0..header.slices {
        let slice = [0x26, 0x01, frame_num as u8, i as u8];
        codec.decode_slice(session, &mut frame, &slice)?;
    }
    codec.end_picture(session, &mut frame)?;
    Ok(frame)
}

/// Outputs `frame` and hands its picture straight back to the pool.
fn output(
    codec: &mut ToyCodec,
    session: &mut DecodeSession<FakeDevice>,
    frame: DecodeFrame<FakeDevice>,
) -> v4l2_codecs::Result<VideoInfo> {
    let picture: PictureBuffer = codec.output_picture(session, frame)?;
    Ok(picture.video_info().clone())
}

/// Decodes `count` frames, outputting each one once the next has been submitted.
fn decode_stream(
    codec: &mut ToyCodec,
    session: &mut DecodeSession<FakeDevice>,
    first: u32,
    count: u32,
    slices: usize,
) -> Vec<v4l2_codecs::Result<VideoInfo>> {
    let header = ToyHeader { slices };
    let mut in_flight = VecDeque::new();
    let mut outputs = Vec::new();
    for frame_num in first..first + count {
        in_flight.push_back(decode(codec, session, frame_num, &header).unwrap());
        if in_flight.len() > 1 {
            let frame = in_flight.pop_front().unwrap();
            outputs.push(output(codec, session, frame));
        }
    }
    while let Some(frame) = in_flight.pop_front() {
        outputs.push(output(codec, session, frame));
    }
    outputs
}

#[test]
fn frame_based_stream() {
    let mut session = session(FakeOptions::default(), DecoderConfig::default());
    let mut codec = ToyCodec::new(CodedFormat::VP8);
    codec.new_sequence(&mut session).unwrap();

    let outputs = decode_stream(&mut codec, &mut session, 1, 8, 1);
    assert_eq!(outputs.len(), 8);
    for info in outputs {
        let info = info.unwrap();
        assert_eq!(info.format, DecodedFormat::NV12);
        assert_eq!(info.width, 320);
    }
    assert_eq!(codec.submissions, 8);

    let fake = fake(&session);
    assert_eq!(fake.dequeued(Direction::Input), 8);
    assert_eq!(fake.dequeued(Direction::Output), 8);
    assert_eq!(session.decoder().pending_count(), 0);
    // Requests are recycled rather than allocated per frame.
    assert!(fake.allocated_requests() <= 3);
    assert_eq!(session.pool().unwrap().free_containers(), 4);
}

#[test]
fn slice_based_stream_holds_the_picture() {
    let mut session = session(FakeOptions::default(), DecoderConfig::default());
    let mut codec = ToyCodec::new(CodedFormat::Hevc);
    codec.new_sequence(&mut session).unwrap();
    let fake = fake(&session);
    assert!(fake.control(V4L2_CID_STATELESS_HEVC_SPS).is_some());
    assert!(session.decoder().supports_holding());

    let outputs = decode_stream(&mut codec, &mut session, 1, 4, 3);
    for picture in outputs {
        picture.unwrap();
    }
    assert_eq!(codec.submissions, 12);
    assert_eq!(fake.queued_pictures(), 4);
    assert_eq!(fake.dequeued(Direction::Input), 12);
    assert_eq!(fake.dequeued(Direction::Output), 4);
}

#[test]
fn sub_requests_need_hold_support() {
    let options = FakeOptions {
        supports_holding: false,
        ..Default::default()
    };
    let mut session = session(options, DecoderConfig::default());
    let mut codec = ToyCodec::new(CodedFormat::Hevc);
    codec.new_sequence(&mut session).unwrap();

    // Single slice frames never hold.
    let outputs = decode_stream(&mut codec, &mut session, 1, 2, 1);
    assert!(outputs.into_iter().all(|p| p.is_ok()));

    let err = decode(&mut codec, &mut session, 3, &ToyHeader { slices: 2 })
        .err()
        .unwrap();
    assert!(matches!(err, Error::HoldUnsupported));
    assert_eq!(err.class(), ErrorClass::Submission);
}

#[test]
fn failed_frame_is_local() {
    let mut session = session(FakeOptions::default(), DecoderConfig::default());
    let mut codec = ToyCodec::new(CodedFormat::VP8);
    codec.new_sequence(&mut session).unwrap();
    fake(&session).fail_frame(2);

    let outputs = decode_stream(&mut codec, &mut session, 1, 4, 1);
    let failed: Vec<u32> = outputs
        .iter()
        .zip(1..)
        .filter_map(|(p, n)| p.is_err().then_some(n))
        .collect();
    assert_eq!(failed, vec![2]);
    match &outputs[1] {
        Err(e) => assert_eq!(e.class(), ErrorClass::FrameLocal),
        Ok(_) => unreachable!(),
    }
}

#[test]
fn live_stream_waits_for_each_frame() {
    let config = DecoderConfig {
        live: true,
        ..Default::default()
    };
    let mut session = session(FakeOptions::default(), config);
    assert_eq!(session.decoder().render_delay(), 0);
    let mut codec = ToyCodec::new(CodedFormat::VP8);
    codec.new_sequence(&mut session).unwrap();
    assert_eq!(session.sink_allocator().unwrap().pool_size(), 2);

    let header = ToyHeader { slices: 1 };
    for frame_num in 1..=3 {
        let frame = decode(&mut codec, &mut session, frame_num, &header).unwrap();
        assert!(session.decoder().pending_count() <= 1);
        codec.output_picture(&mut session, frame).unwrap();
    }
}

#[test]
fn flush_drops_queued_work() {
    let options = FakeOptions {
        auto_complete: false,
        ..Default::default()
    };
    let mut session = session(options, DecoderConfig::default());
    let mut codec = ToyCodec::new(CodedFormat::VP8);
    codec.new_sequence(&mut session).unwrap();

    let frame = decode(&mut codec, &mut session, 1, &ToyHeader { slices: 1 }).unwrap();
    assert_eq!(session.decoder().pending_count(), 1);
    session.set_flushing(true);
    session.flush().unwrap();
    assert_eq!(session.decoder().pending_count(), 0);
    drop(frame);

    let fake = fake(&session);
    assert!(fake.is_streaming(Direction::Input));
    assert!(fake.is_streaming(Direction::Output));

    // Decoding resumes once the flush is over.
    let frame = decode(&mut codec, &mut session, 2, &ToyHeader { slices: 1 }).unwrap();
    fake.complete_all();
    codec.output_picture(&mut session, frame).unwrap();
}

#[test]
fn rejected_parameters_fail_submission() {
    let mut session = session(FakeOptions::default(), DecoderConfig::default());
    let mut codec = ToyCodec::new(CodedFormat::VP8);
    codec.new_sequence(&mut session).unwrap();
    fake(&session).reject_controls(true);

    let err = decode(&mut codec, &mut session, 1, &ToyHeader { slices: 1 })
        .err()
        .unwrap();
    assert!(matches!(err, Error::Control(_)));
    assert_eq!(session.decoder().pending_count(), 0);
}

#[test]
fn new_sequence_reallocates() {
    let mut session = session(FakeOptions::default(), DecoderConfig::default());
    let mut codec = ToyCodec::new(CodedFormat::VP8);
    codec.new_sequence(&mut session).unwrap();
    for picture in decode_stream(&mut codec, &mut session, 1, 2, 1) {
        picture.unwrap();
    }

    codec.width = 640;
    codec.height = 480;
    codec.min_pool_size = 4;
    codec.new_sequence(&mut session).unwrap();
    assert_eq!(session.video_info().unwrap().width, 640);
    assert_eq!(session.pool().unwrap().free_containers(), 6);

    let outputs = decode_stream(&mut codec, &mut session, 3, 3, 1);
    for info in outputs {
        assert_eq!(info.unwrap().height, 480);
    }
    session.close();
}
