// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! In-process stand-in for a stateless decoder driver.
//!
//! Buffers are backed by temporary files so they can be exported and mapped like real driver
//! memory. Completing a request consumes its bitstream buffer and, unless the capture buffer is
//! held, stamps the oldest queued picture buffer with the bitstream timestamp, as the kernel
//! memory-to-memory framework does.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::os::fd::OwnedFd;
use std::os::fd::RawFd;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use v4l2_sys::*;

use crate::config::DecoderConfig;
use crate::device::Capabilities;
use crate::device::Control;
use crate::device::ControlInfo;
use crate::device::ControlKind;
use crate::device::ControlReading;
use crate::device::ControlValue;
use crate::device::DecoderDevice;
use crate::device::DequeuedBuffer;
use crate::device::ExportedPlane;
use crate::device::KernelVersion;
use crate::device::MediaRequest;
use crate::device::QueuedBuffer;
use crate::device::ReservedBuffers;
use crate::error::Result;
use crate::format::DecodedFormat;
use crate::format::Direction;
use crate::format::Format;
use crate::format::Fourcc;
use crate::format::FrameSizeRange;
use crate::format::PlaneFormat;
use crate::sync::Condvar;
use crate::sync::Mutex;

const DEFAULT_SINK_SIZE: u32 = 64 * 1024;

/// Behaviour of a [`FakeDevice`].
#[derive(Debug, Clone)]
pub struct FakeOptions {
    pub supports_holding: bool,
    /// Complete requests as soon as they are queued. Otherwise tests complete them with
    /// [`FakeDevice::complete_next`] or [`FakeDevice::complete_all`].
    pub auto_complete: bool,
    /// Most buffers granted per queue.
    pub max_buffers: u32,
    /// Memory planes of decoded pictures. Two selects `NM12`.
    pub capture_planes: usize,
    pub max_size: (u32, u32),
    pub coded_formats: Vec<Fourcc>,
    pub decoded_formats: Vec<Fourcc>,
}

impl Default for FakeOptions {
    fn default() -> Self {
        FakeOptions {
            supports_holding: true,
            auto_complete: true,
            max_buffers: 32,
            capture_planes: 1,
            max_size: (4096, 4096),
            coded_formats: [
                V4L2_PIX_FMT_H264_SLICE,
                V4L2_PIX_FMT_HEVC_SLICE,
                V4L2_PIX_FMT_VP8_FRAME,
                V4L2_PIX_FMT_VP9_FRAME,
                V4L2_PIX_FMT_AV1_FRAME,
                V4L2_PIX_FMT_MPEG2_SLICE,
            ]
            .into_iter()
            .map(Fourcc)
            .collect(),
            decoded_formats: vec![Fourcc(V4L2_PIX_FMT_NV12), Fourcc(V4L2_PIX_FMT_YUV420)],
        }
    }
}

fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

/// Picture format the fake driver reports for `fourcc` at the given coded size.
fn capture_format(fourcc: Fourcc, width: u32, height: u32) -> Format {
    let w = width.next_multiple_of(16);
    let h = height.next_multiple_of(16);
    let planes = match DecodedFormat::from_fourcc(fourcc) {
        Some(DecodedFormat::NV12M) => vec![
            PlaneFormat {
                bytes_per_line: w,
                size_image: w * h,
            },
            PlaneFormat {
                bytes_per_line: w,
                size_image: w * h / 2,
            },
        ],
        Some(DecodedFormat::NV16) | Some(DecodedFormat::NV61) => vec![PlaneFormat {
            bytes_per_line: w,
            size_image: w * h * 2,
        }],
        Some(DecodedFormat::YUYV) => vec![PlaneFormat {
            bytes_per_line: w * 2,
            size_image: w * 2 * h,
        }],
        Some(DecodedFormat::P010) => vec![PlaneFormat {
            bytes_per_line: w * 2,
            size_image: w * 2 * h * 3 / 2,
        }],
        _ => vec![PlaneFormat {
            bytes_per_line: w,
            size_image: w * h * 3 / 2,
        }],
    };
    Format {
        fourcc,
        width,
        height,
        planes,
    }
}

#[derive(Debug, Clone, Copy)]
struct FakeBuffer {
    index: u32,
    timestamp_us: u64,
    flags: u32,
    bytes_used: u32,
    request: Option<u64>,
}

#[derive(Default)]
struct FakeQueue {
    format: Format,
    reserved: u32,
    reqbufs_calls: u32,
    queued: VecDeque<FakeBuffer>,
    done: VecDeque<DequeuedBuffer>,
    streaming: bool,
    dequeued: u32,
    queue_calls: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestStatus {
    Idle,
    Queued,
    Completed,
}

struct RequestState {
    id: u64,
    status: Mutex<RequestStatus>,
    cv: Condvar,
}

impl RequestState {
    fn set(&self, status: RequestStatus) {
        *self.status.lock() = status;
        self.cv.notify_all();
    }

    fn get(&self) -> RequestStatus {
        *self.status.lock()
    }
}

#[derive(Default)]
struct FakeState {
    input: FakeQueue,
    output: FakeQueue,
    controls: HashMap<u32, ControlReading>,
    next_request: u64,
    queued_requests: VecDeque<Arc<RequestState>>,
    allocated_requests: u32,
    dequeue_calls: u32,
    corrupt_timestamps: bool,
    failed_frames: Vec<u32>,
    reject_controls: bool,
}

impl FakeState {
    fn queue(&mut self, direction: Direction) -> &mut FakeQueue {
        match direction {
            Direction::Input => &mut self.input,
            Direction::Output => &mut self.output,
        }
    }

    /// Processes one queued request the way a memory-to-memory driver does.
    fn complete(&mut self, request: &RequestState) {
        let position = self
            .input
            .queued
            .iter()
            .position(|b| b.request == Some(request.id));
        if let Some(bitstream) = position.and_then(|p| self.input.queued.remove(p)) {
            self.input.done.push_back(DequeuedBuffer {
                index: bitstream.index,
                timestamp_us: bitstream.timestamp_us,
                flags: bitstream.flags,
                bytes_used: bitstream.bytes_used,
            });
            if bitstream.flags & V4L2_BUF_FLAG_M2M_HOLD_CAPTURE_BUF == 0 {
                if let Some(picture) = self.output.queued.pop_front() {
                    let frame = (bitstream.timestamp_us / 1000) as u32;
                    let mut flags = V4L2_BUF_FLAG_TIMESTAMP_COPY;
                    if self.failed_frames.contains(&frame) {
                        flags |= V4L2_BUF_FLAG_ERROR;
                    }
                    let timestamp_us = if self.corrupt_timestamps {
                        bitstream.timestamp_us + 1000
                    } else {
                        bitstream.timestamp_us
                    };
                    let bytes_used = self
                        .output
                        .format
                        .planes
                        .first()
                        .map_or(0, |p| p.size_image);
                    self.output.done.push_back(DequeuedBuffer {
                        index: picture.index,
                        timestamp_us,
                        flags,
                        bytes_used,
                    });
                }
            }
        }
        self.queued_requests.retain(|r| r.id != request.id);
        request.set(RequestStatus::Completed);
    }

    fn complete_next(&mut self) -> bool {
        match self.queued_requests.front().cloned() {
            Some(request) => {
                self.complete(&request);
                true
            }
            None => false,
        }
    }
}

struct FakeShared {
    options: FakeOptions,
    state: Mutex<FakeState>,
    destroyed_requests: AtomicU32,
}

/// A decoder device living entirely in memory.
pub struct FakeDevice {
    shared: Arc<FakeShared>,
    caps: Capabilities,
}

impl FakeDevice {
    pub fn new(mut options: FakeOptions) -> Self {
        if options.capture_planes > 1 {
            options.decoded_formats = vec![Fourcc(V4L2_PIX_FMT_NV12M)];
        }
        let coded = options
            .coded_formats
            .first()
            .copied()
            .unwrap_or(Fourcc(V4L2_PIX_FMT_H264_SLICE));
        let decoded = options
            .decoded_formats
            .first()
            .copied()
            .unwrap_or(Fourcc(V4L2_PIX_FMT_NV12));
        let state = FakeState {
            input: FakeQueue {
                format: Format {
                    fourcc: coded,
                    width: 320,
                    height: 240,
                    planes: vec![PlaneFormat {
                        bytes_per_line: 0,
                        size_image: DEFAULT_SINK_SIZE,
                    }],
                },
                ..Default::default()
            },
            output: FakeQueue {
                format: capture_format(decoded, 320, 240),
                ..Default::default()
            },
            ..Default::default()
        };
        FakeDevice {
            shared: Arc::new(FakeShared {
                options,
                state: Mutex::new(state),
                destroyed_requests: AtomicU32::new(0),
            }),
            caps: Capabilities {
                driver: "fake".to_string(),
                card: "fake stateless decoder".to_string(),
                bus_info: "platform:fake".to_string(),
                version: KernelVersion::from(0x0006_0800),
                device_caps: V4L2_CAP_VIDEO_M2M_MPLANE | V4L2_CAP_STREAMING,
                mplane: true,
            },
        }
    }

    fn options(&self) -> &FakeOptions {
        &self.shared.options
    }

    /// Completes the oldest queued request. Returns false if none was queued.
    pub fn complete_next(&self) -> bool {
        self.shared.state.lock().complete_next()
    }

    pub fn complete_all(&self) {
        let mut state = self.shared.state.lock();
        while state.complete_next() {}
    }

    /// Returns pictures stamped with the next frame number.
    pub fn corrupt_timestamps(&self, corrupt: bool) {
        self.shared.state.lock().corrupt_timestamps = corrupt;
    }

    /// Flags the picture of `frame_num` with `V4L2_BUF_FLAG_ERROR`.
    pub fn fail_frame(&self, frame_num: u32) {
        self.shared.state.lock().failed_frames.push(frame_num);
    }

    pub fn reject_controls(&self, reject: bool) {
        self.shared.state.lock().reject_controls = reject;
    }

    pub fn reserved(&self, direction: Direction) -> u32 {
        self.shared.state.lock().queue(direction).reserved
    }

    pub fn reqbufs_calls(&self, direction: Direction) -> u32 {
        self.shared.state.lock().queue(direction).reqbufs_calls
    }

    pub fn is_streaming(&self, direction: Direction) -> bool {
        self.shared.state.lock().queue(direction).streaming
    }

    /// Buffers successfully dequeued from `direction`.
    pub fn dequeued(&self, direction: Direction) -> u32 {
        self.shared.state.lock().queue(direction).dequeued
    }

    /// Dequeue attempts on either queue, successful or not.
    pub fn dequeue_calls(&self) -> u32 {
        self.shared.state.lock().dequeue_calls
    }

    /// Picture buffers queued so far.
    pub fn queued_pictures(&self) -> u32 {
        self.shared.state.lock().output.queue_calls
    }

    pub fn allocated_requests(&self) -> u32 {
        self.shared.state.lock().allocated_requests
    }

    pub fn destroyed_requests(&self) -> u32 {
        self.shared.destroyed_requests.load(Ordering::SeqCst)
    }

    /// Last value set for control `id`.
    pub fn control(&self, id: u32) -> Option<ControlReading> {
        self.shared.state.lock().controls.get(&id).cloned()
    }

    fn clamp_size(&self, width: u32, height: u32) -> (u32, u32) {
        let (max_w, max_h) = self.options().max_size;
        (width.clamp(16, max_w), height.clamp(16, max_h))
    }
}

pub struct FakeRequest {
    state: Arc<RequestState>,
    shared: Arc<FakeShared>,
    file: File,
}

impl MediaRequest for FakeRequest {
    fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    fn queue(&self) -> io::Result<()> {
        let mut state = self.shared.state.lock();
        if self.state.get() != RequestStatus::Idle {
            return Err(errno(libc::EBUSY));
        }
        if !state
            .input
            .queued
            .iter()
            .any(|b| b.request == Some(self.state.id))
        {
            return Err(errno(libc::ENOENT));
        }
        self.state.set(RequestStatus::Queued);
        state.queued_requests.push_back(self.state.clone());
        if self.shared.options.auto_complete {
            state.complete(&self.state);
        }
        Ok(())
    }

    fn reinit(&self) -> io::Result<()> {
        if self.state.get() == RequestStatus::Queued {
            return Err(errno(libc::EBUSY));
        }
        self.state.set(RequestStatus::Idle);
        Ok(())
    }

    fn wait(&self, timeout: Duration) -> io::Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut status = self.state.status.lock();
        loop {
            match *status {
                RequestStatus::Completed => return Ok(true),
                RequestStatus::Idle => return Err(errno(libc::ENOENT)),
                RequestStatus::Queued => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            status = self.state.cv.wait_timeout(status, deadline - now).0;
        }
    }
}

impl Drop for FakeRequest {
    fn drop(&mut self) {
        let id = self.state.id;
        self.shared
            .state
            .lock()
            .queued_requests
            .retain(|r| r.id != id);
        self.shared.destroyed_requests.fetch_add(1, Ordering::SeqCst);
    }
}

impl DecoderDevice for FakeDevice {
    type Request = FakeRequest;

    fn open(_config: &DecoderConfig) -> Result<Self> {
        Ok(FakeDevice::new(FakeOptions::default()))
    }

    fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    fn enum_format(&self, direction: Direction, index: u32) -> io::Result<Option<Fourcc>> {
        let formats = match direction {
            Direction::Input => &self.options().coded_formats,
            Direction::Output => &self.options().decoded_formats,
        };
        Ok(formats.get(index as usize).copied())
    }

    fn enum_frame_sizes(&self, fourcc: Fourcc, index: u32) -> io::Result<Option<FrameSizeRange>> {
        if index > 0 || !self.options().coded_formats.contains(&fourcc) {
            return Ok(None);
        }
        let (max_width, max_height) = self.options().max_size;
        Ok(Some(FrameSizeRange::Stepwise {
            min_width: 16,
            max_width,
            step_width: 16,
            min_height: 16,
            max_height,
            step_height: 16,
        }))
    }

    fn get_format(&self, direction: Direction) -> io::Result<Format> {
        Ok(self.shared.state.lock().queue(direction).format.clone())
    }

    fn set_format(&self, direction: Direction, format: &Format) -> io::Result<Format> {
        let mut state = self.shared.state.lock();
        if state.queue(direction).reserved > 0 {
            return Err(errno(libc::EBUSY));
        }
        match direction {
            Direction::Input => {
                let fourcc = if self.options().coded_formats.contains(&format.fourcc) {
                    format.fourcc
                } else {
                    state.input.format.fourcc
                };
                let (width, height) = self.clamp_size(format.width, format.height);
                let size_image = format
                    .planes
                    .first()
                    .map(|p| p.size_image)
                    .filter(|s| *s > 0)
                    .unwrap_or(DEFAULT_SINK_SIZE);
                state.input.format = Format {
                    fourcc,
                    width,
                    height,
                    planes: vec![PlaneFormat {
                        bytes_per_line: 0,
                        size_image,
                    }],
                };
                // The decoded size follows the coded size.
                let decoded = state.output.format.fourcc;
                state.output.format = capture_format(decoded, width, height);
                Ok(state.input.format.clone())
            }
            Direction::Output => {
                let fourcc = if self.options().decoded_formats.contains(&format.fourcc) {
                    format.fourcc
                } else {
                    state.output.format.fourcc
                };
                let (width, height) = (state.input.format.width, state.input.format.height);
                state.output.format = capture_format(fourcc, width, height);
                Ok(state.output.format.clone())
            }
        }
    }

    fn request_buffers(&self, direction: Direction, count: u32) -> io::Result<ReservedBuffers> {
        let max_buffers = self.options().max_buffers;
        let holding = self.options().supports_holding && direction == Direction::Input;
        let mut state = self.shared.state.lock();
        let queue = state.queue(direction);
        queue.reqbufs_calls += 1;
        if count > 0 && queue.reserved > 0 {
            return Err(errno(libc::EBUSY));
        }
        queue.reserved = count.min(max_buffers);
        if count == 0 {
            queue.queued.clear();
            queue.done.clear();
        }
        let mut capabilities = V4L2_BUF_CAP_SUPPORTS_MMAP | V4L2_BUF_CAP_SUPPORTS_REQUESTS;
        if holding {
            capabilities |= V4L2_BUF_CAP_SUPPORTS_M2M_HOLD_CAPTURE_BUF;
        }
        Ok(ReservedBuffers {
            count: queue.reserved,
            capabilities,
        })
    }

    fn export_buffer(&self, direction: Direction, index: u32) -> io::Result<Vec<ExportedPlane>> {
        let sizes: Vec<u32> = {
            let mut state = self.shared.state.lock();
            let queue = state.queue(direction);
            if index >= queue.reserved {
                return Err(errno(libc::EINVAL));
            }
            queue.format.planes.iter().map(|p| p.size_image).collect()
        };
        sizes
            .into_iter()
            .map(|size| {
                let file = tempfile::tempfile()?;
                file.set_len(size as u64)?;
                Ok(ExportedPlane {
                    fd: OwnedFd::from(file),
                    length: size as usize,
                    offset: 0,
                })
            })
            .collect()
    }

    fn queue_buffer(&self, buffer: QueuedBuffer<'_, Self::Request>) -> io::Result<()> {
        let mut state = self.shared.state.lock();
        let queue = state.queue(buffer.direction);
        if buffer.index >= queue.reserved || queue.queued.iter().any(|b| b.index == buffer.index)
        {
            return Err(errno(libc::EINVAL));
        }
        if let Some(request) = buffer.request {
            if request.state.get() != RequestStatus::Idle {
                return Err(errno(libc::EBUSY));
            }
        }
        queue.queue_calls += 1;
        queue.queued.push_back(FakeBuffer {
            index: buffer.index,
            timestamp_us: buffer.timestamp_us,
            flags: buffer.flags,
            bytes_used: buffer.bytes_used.first().copied().unwrap_or(0),
            request: buffer.request.map(|r| r.state.id),
        });
        Ok(())
    }

    fn dequeue_buffer(&self, direction: Direction) -> io::Result<DequeuedBuffer> {
        let mut state = self.shared.state.lock();
        state.dequeue_calls += 1;
        let queue = state.queue(direction);
        let buffer = queue.done.pop_front().ok_or_else(|| errno(libc::EAGAIN))?;
        queue.dequeued += 1;
        Ok(buffer)
    }

    fn stream_on(&self, direction: Direction) -> io::Result<()> {
        self.shared.state.lock().queue(direction).streaming = true;
        Ok(())
    }

    fn stream_off(&self, direction: Direction) -> io::Result<()> {
        let mut state = self.shared.state.lock();
        if direction == Direction::Input {
            // Requests still queued are cancelled, which completes them.
            for request in state.queued_requests.drain(..) {
                request.set(RequestStatus::Completed);
            }
        }
        let queue = state.queue(direction);
        queue.streaming = false;
        queue.queued.clear();
        queue.done.clear();
        Ok(())
    }

    fn set_controls(
        &self,
        _request: Option<&Self::Request>,
        controls: &[Control<'_>],
    ) -> io::Result<()> {
        let mut state = self.shared.state.lock();
        if state.reject_controls {
            return Err(errno(libc::EINVAL));
        }
        for control in controls {
            let value = match control.value {
                ControlValue::Int(v) => ControlReading::Int(v),
                ControlValue::Int64(v) => ControlReading::Int64(v),
                ControlValue::Compound(bytes) => ControlReading::Compound(bytes.to_vec()),
            };
            state.controls.insert(control.id, value);
        }
        Ok(())
    }

    fn get_controls(&self, queries: &[(u32, ControlKind)]) -> io::Result<Vec<ControlReading>> {
        let state = self.shared.state.lock();
        Ok(queries
            .iter()
            .map(|(id, kind)| {
                state.controls.get(id).cloned().unwrap_or(match kind {
                    ControlKind::Int => ControlReading::Int(0),
                    ControlKind::Int64 => ControlReading::Int64(0),
                    ControlKind::Compound(size) => ControlReading::Compound(vec![0; *size]),
                })
            })
            .collect())
    }

    fn query_control(&self, id: u32) -> io::Result<Option<ControlInfo>> {
        let elem_size = match id {
            V4L2_CID_STATELESS_H264_DECODE_MODE
            | V4L2_CID_STATELESS_H264_START_CODE
            | V4L2_CID_STATELESS_HEVC_DECODE_MODE
            | V4L2_CID_STATELESS_HEVC_START_CODE
            | V4L2_CID_STATELESS_HEVC_ENTRY_POINT_OFFSETS => 4,
            V4L2_CID_STATELESS_HEVC_SLICE_PARAMS => 280,
            V4L2_CID_STATELESS_HEVC_SPS => 40,
            V4L2_CID_STATELESS_HEVC_PPS => 64,
            V4L2_CID_STATELESS_H264_SPS => 1048,
            V4L2_CID_STATELESS_H264_PPS => 20,
            V4L2_CID_STATELESS_H264_DECODE_PARAMS => 560,
            V4L2_CID_STATELESS_AV1_SEQUENCE => 16,
            V4L2_CID_STATELESS_AV1_FRAME => 300,
            V4L2_CID_STATELESS_AV1_TILE_GROUP_ENTRY => 16,
            V4L2_CID_STATELESS_VP8_FRAME => 1232,
            V4L2_CID_STATELESS_VP9_FRAME => 168,
            _ => return Ok(None),
        };
        Ok(Some(ControlInfo {
            id,
            minimum: 0,
            maximum: 0,
            default_value: 0,
            elem_size,
            elems: 1,
        }))
    }

    fn alloc_request(&self) -> io::Result<Self::Request> {
        let file = tempfile::tempfile()?;
        let mut state = self.shared.state.lock();
        let id = state.next_request;
        state.next_request += 1;
        state.allocated_requests += 1;
        Ok(FakeRequest {
            state: Arc::new(RequestState {
                id,
                status: Mutex::new(RequestStatus::Idle),
                cv: Condvar::new(),
            }),
            shared: self.shared.clone(),
            file,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue_bitstream(device: &FakeDevice, request: &FakeRequest, index: u32, frame: u64) {
        device
            .queue_buffer(QueuedBuffer {
                direction: Direction::Input,
                index,
                bytes_used: &[16],
                timestamp_us: frame * 1000,
                flags: 0,
                request: Some(request),
            })
            .unwrap();
    }

    fn queue_picture(device: &FakeDevice, index: u32) {
        device
            .queue_buffer(QueuedBuffer {
                direction: Direction::Output,
                index,
                bytes_used: &[0],
                timestamp_us: 0,
                flags: 0,
                request: None,
            })
            .unwrap();
    }

    #[test]
    fn timestamp_is_copied_to_picture() {
        let device = FakeDevice::new(FakeOptions {
            auto_complete: false,
            ..Default::default()
        });
        device.request_buffers(Direction::Input, 2).unwrap();
        device.request_buffers(Direction::Output, 2).unwrap();
        let request = device.alloc_request().unwrap();
        queue_bitstream(&device, &request, 1, 42);
        queue_picture(&device, 0);
        request.queue().unwrap();
        assert!(!request.wait(Duration::from_millis(1)).unwrap());
        assert!(matches!(
            device.dequeue_buffer(Direction::Output),
            Err(e) if e.raw_os_error() == Some(libc::EAGAIN)
        ));

        assert!(device.complete_next());
        assert!(request.is_ready());
        let picture = device.dequeue_buffer(Direction::Output).unwrap();
        assert_eq!(picture.index, 0);
        assert_eq!(picture.timestamp_us, 42_000);
        assert_eq!(device.dequeue_buffer(Direction::Input).unwrap().index, 1);

        // Busy until re-initialized.
        assert!(request.queue().is_err());
        request.reinit().unwrap();
    }

    #[test]
    fn request_without_buffers_is_rejected() {
        let device = FakeDevice::new(FakeOptions::default());
        let request = device.alloc_request().unwrap();
        assert!(request.queue().is_err());
        drop(request);
        assert_eq!(device.destroyed_requests(), 1);
    }

    #[test]
    fn exported_planes_have_format_size() {
        let device = FakeDevice::new(FakeOptions {
            capture_planes: 2,
            ..Default::default()
        });
        device.request_buffers(Direction::Output, 1).unwrap();
        let planes = device.export_buffer(Direction::Output, 0).unwrap();
        assert_eq!(planes.len(), 2);
        assert_eq!(planes[0].length, 320 * 240);
        assert_eq!(planes[1].length, 320 * 240 / 2);
        assert!(device.export_buffer(Direction::Output, 1).is_err());
    }
}
