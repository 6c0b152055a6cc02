// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Request scheduler of a stateless decoder.
//!
//! The decoder owns the device, a free list of reusable media requests and the FIFO of requests
//! queued to the driver. Queueing more than `max(1, render_delay)` requests waits for the oldest
//! one, so the number of frames in flight stays bounded. Requests complete in submission order:
//! finishing a request also finishes every request queued before it.

use std::cmp::max;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use log::error;
use log::info;
use log::trace;
use log::warn;
use v4l2_sys::V4L2_BUF_FLAG_M2M_HOLD_CAPTURE_BUF;

use crate::allocator::CodecMemory;
use crate::config::DecoderConfig;
use crate::device::Capabilities;
use crate::device::Control;
use crate::device::ControlKind;
use crate::device::ControlReading;
use crate::device::DecoderDevice;
use crate::device::ExportedPlane;
use crate::device::KernelVersion;
use crate::device::MediaRequest;
use crate::device::QueuedBuffer;
use crate::error::Error;
use crate::error::Result;
use crate::format::sink_size_image;
use crate::format::DecodedFormat;
use crate::format::Direction;
use crate::format::Format;
use crate::format::Fourcc;
use crate::format::FrameSizeRange;
use crate::format::PlaneFormat;
use crate::format::VideoInfo;
use crate::pool::PictureBuffer;
use crate::request::Request;
use crate::request::RequestBinding;
use crate::request::RequestId;
use crate::sync::Mutex;

/// Frame numbers travel in the buffer timestamp, in microseconds.
pub(crate) fn frame_tag(frame_num: u32) -> u64 {
    frame_num as u64 * 1000
}

pub(crate) struct RequestSlot<R> {
    pub(crate) binding: Arc<RequestBinding<R>>,
    refs: u32,
    bitstream: Option<CodecMemory>,
    pub(crate) pending: bool,
    pub(crate) failed: bool,
    hold_pic_buf: bool,
    /// Device generation the kernel request was allocated on.
    generation: u64,
}

struct SchedulerState<R> {
    next_id: RequestId,
    slots: HashMap<RequestId, RequestSlot<R>>,
    /// Kernel requests ready for reuse.
    free: Vec<Arc<R>>,
    /// Queued requests, oldest first.
    pending: VecDeque<RequestId>,
    render_delay: u32,
    open: bool,
    /// Bumped on every open so requests of a closed device are never recycled.
    generation: u64,
}

impl<R> SchedulerState<R> {
    fn slot(&self, id: RequestId) -> Result<&RequestSlot<R>> {
        self.slots.get(&id).ok_or(Error::UnknownRequest(id))
    }

    fn slot_mut(&mut self, id: RequestId) -> Result<&mut RequestSlot<R>> {
        self.slots.get_mut(&id).ok_or(Error::UnknownRequest(id))
    }
}

/// Slots of freed requests. They are dropped after the scheduler lock is released.
type Released<R> = Vec<RequestSlot<R>>;

pub struct Decoder<D: DecoderDevice> {
    config: DecoderConfig,
    device: Mutex<Option<Arc<D>>>,
    state: Mutex<SchedulerState<D::Request>>,
    supports_holding: AtomicBool,
}

impl<D: DecoderDevice> Decoder<D> {
    /// Creates a closed decoder for the device pair named in `config`.
    pub fn new(config: DecoderConfig) -> Arc<Self> {
        let render_delay = config.render_delay();
        Arc::new(Decoder {
            config,
            device: Mutex::new(None),
            state: Mutex::new(SchedulerState {
                next_id: 0,
                slots: HashMap::new(),
                free: Vec::new(),
                pending: VecDeque::new(),
                render_delay,
                open: false,
                generation: 0,
            }),
            supports_holding: AtomicBool::new(false),
        })
    }

    /// Creates a decoder already opened on `device`.
    pub fn with_device(config: DecoderConfig, device: D) -> Arc<Self> {
        let decoder = Self::new(config);
        decoder.attach(device);
        decoder
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    fn attach(&self, device: D) {
        let caps = device.capabilities();
        info!(
            "opened {} ({}) on {}, API {}",
            caps.card, caps.driver, caps.bus_info, caps.version
        );
        *self.device.lock() = Some(Arc::new(device));
        let mut state = self.state.lock();
        state.open = true;
        state.generation += 1;
    }

    /// Opens the media and video nodes.
    pub fn open(&self) -> Result<()> {
        let device = D::open(&self.config)?;
        self.attach(device);
        Ok(())
    }

    /// Closes the device. Pending requests are cancelled and every media request is destroyed
    /// as soon as nothing refers to it anymore.
    pub fn close(&self) {
        let mut released = Vec::new();
        let mut state = self.state.lock();
        state.open = false;
        while let Some(id) = state.pending.pop_front() {
            if let Ok(slot) = state.slot_mut(id) {
                slot.pending = false;
                slot.bitstream.take();
            }
            unref_locked(&mut state, id, &mut released);
        }
        state.free.clear();
        drop(state);
        drop(released);
        *self.device.lock() = None;
        debug!("decoder closed");
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// Returns the device, or `DecoderClosed`.
    pub fn device(&self) -> Result<Arc<D>> {
        self.device.lock().clone().ok_or(Error::DecoderClosed)
    }

    pub fn capabilities(&self) -> Result<Capabilities> {
        Ok(self.device()?.capabilities().clone())
    }

    pub fn version(&self) -> Result<KernelVersion> {
        Ok(self.device()?.capabilities().version)
    }

    pub fn set_render_delay(&self, render_delay: u32) {
        self.state.lock().render_delay = render_delay;
    }

    pub fn render_delay(&self) -> u32 {
        self.state.lock().render_delay
    }

    /// Whether the driver can keep a picture buffer across several requests. Known once input
    /// buffers have been reserved.
    pub fn supports_holding(&self) -> bool {
        self.supports_holding.load(Ordering::Acquire)
    }

    pub fn request_timeout(&self) -> Duration {
        self.config.request_timeout()
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn free_request_count(&self) -> usize {
        self.state.lock().free.len()
    }

    pub fn streamon(&self, direction: Direction) -> Result<()> {
        self.device()?
            .stream_on(direction)
            .map_err(|source| Error::StreamOn { direction, source })
    }

    /// Stops streaming on `direction`. Stopping the output side also cancels every pending
    /// request, since the driver drops all queued buffers.
    pub fn streamoff(&self, direction: Direction) -> Result<()> {
        let device = self.device()?;
        if direction == Direction::Output {
            let mut released = Vec::new();
            let mut state = self.state.lock();
            while let Some(id) = state.pending.pop_front() {
                if let Ok(slot) = state.slot_mut(id) {
                    slot.bitstream.take();
                    slot.pending = false;
                }
                unref_locked(&mut state, id, &mut released);
            }
            drop(state);
            drop(released);
        }
        device
            .stream_off(direction)
            .map_err(|source| Error::StreamOff { direction, source })
    }

    /// Restarts both queues, dropping everything the driver holds.
    pub fn flush(&self) -> Result<()> {
        // Stream off failures don't matter as long as streaming restarts.
        for direction in [Direction::Input, Direction::Output] {
            if let Err(e) = self.streamoff(direction) {
                debug!("ignoring failure to stop during flush: {}", e);
            }
        }
        self.streamon(Direction::Input)?;
        self.streamon(Direction::Output)
    }

    fn enum_formats(&self, direction: Direction) -> Result<Vec<Fourcc>> {
        let device = self.device()?;
        let mut formats = Vec::new();
        for index in 0.. {
            match device
                .enum_format(direction, index)
                .map_err(Error::EnumFormat)?
            {
                Some(fourcc) => formats.push(fourcc),
                None => break,
            }
        }
        Ok(formats)
    }

    /// Coded formats accepted on the input queue.
    pub fn enum_sink_formats(&self) -> Result<Vec<Fourcc>> {
        self.enum_formats(Direction::Input)
    }

    /// Decoded formats offered for the current input format.
    pub fn enum_src_formats(&self) -> Result<Vec<Fourcc>> {
        self.enum_formats(Direction::Output)
    }

    pub fn enum_frame_sizes(&self, fourcc: Fourcc) -> Result<Vec<FrameSizeRange>> {
        let device = self.device()?;
        let mut sizes = Vec::new();
        for index in 0.. {
            match device
                .enum_frame_sizes(fourcc, index)
                .map_err(Error::EnumFormat)?
            {
                Some(size) => sizes.push(size),
                None => break,
            }
        }
        Ok(sizes)
    }

    /// Sets the coded format and size of the input queue.
    ///
    /// The driver may adjust the format. It is rejected if the pixel format changed or the size
    /// shrank.
    pub fn set_sink_format(
        &self,
        fourcc: Fourcc,
        width: u32,
        height: u32,
        bit_depth: u32,
    ) -> Result<Format> {
        let requested = Format {
            fourcc,
            width,
            height,
            planes: vec![PlaneFormat {
                bytes_per_line: 0,
                size_image: sink_size_image(width, height, bit_depth),
            }],
        };
        let got = self
            .device()?
            .set_format(Direction::Input, &requested)
            .map_err(Error::SetFormat)?;
        if got.fourcc != fourcc || got.width < width || got.height < height {
            warn!(
                "Failed to set sink format to {} {}x{}",
                fourcc, width, height
            );
            return Err(Error::FormatRejected(format!(
                "asked for {} {}x{}, got {} {}x{}",
                fourcc, width, height, got.fourcc, got.width, got.height
            )));
        }
        debug!(
            "sink format {} {}x{}, {} bytes per buffer",
            got.fourcc,
            got.width,
            got.height,
            got.planes.first().map(|p| p.size_image).unwrap_or(0)
        );
        Ok(got)
    }

    /// Picks the decoded format.
    ///
    /// The driver's current format is kept if it is one of `preferred` (any known format when
    /// `preferred` is empty). Otherwise the first enumerated format that is acceptable is set.
    pub fn select_src_format(&self, preferred: &[DecodedFormat]) -> Result<VideoInfo> {
        let device = self.device()?;
        let acceptable = |fourcc: Fourcc| {
            DecodedFormat::from_fourcc(fourcc)
                .filter(|f| preferred.is_empty() || preferred.contains(f))
                .is_some()
        };

        let current = device
            .get_format(Direction::Output)
            .map_err(Error::GetFormat)?;
        let format = if acceptable(current.fourcc) {
            current
        } else {
            let fourcc = self
                .enum_src_formats()?
                .into_iter()
                .find(|f| acceptable(*f))
                .ok_or(Error::UnsupportedFormat)?;
            let requested = Format {
                fourcc,
                width: current.width,
                height: current.height,
                planes: Vec::new(),
            };
            let got = device
                .set_format(Direction::Output, &requested)
                .map_err(Error::SetFormat)?;
            if got.fourcc != fourcc {
                return Err(Error::FormatRejected(format!(
                    "asked for decoded {}, got {}",
                    fourcc, got.fourcc
                )));
            }
            got
        };

        let info = VideoInfo::from_format(&format).ok_or(Error::UnsupportedFormat)?;
        debug!(
            "decoded format {} {}x{}",
            info.format, info.width, info.height
        );
        Ok(info)
    }

    /// Sets controls on `request`, or on the device when `request` is `None`.
    pub fn set_controls(
        &self,
        request: Option<&Request<D>>,
        controls: &[Control<'_>],
    ) -> Result<()> {
        let device = self.device()?;
        let kernel = request.map(|r| r.binding().kernel.as_ref());
        device.set_controls(kernel, controls).map_err(Error::Control)
    }

    pub fn get_controls(&self, queries: &[(u32, ControlKind)]) -> Result<Vec<ControlReading>> {
        self.device()?
            .get_controls(queries)
            .map_err(Error::Control)
    }

    /// Element size of control `id`, or `None` if the driver does not support it.
    pub fn query_control_size(&self, id: u32) -> Result<Option<u32>> {
        let info = self
            .device()?
            .query_control(id)
            .map_err(|source| Error::QueryControl { id, source })?;
        Ok(info.map(|i| i.elem_size))
    }

    /// Reserves `count` buffers on `direction` and returns how many the driver granted.
    pub fn request_buffers(&self, direction: Direction, count: u32) -> Result<u32> {
        let reserved = self
            .device()?
            .request_buffers(direction, count)
            .map_err(|source| Error::RequestBuffers { direction, source })?;
        if direction == Direction::Input {
            self.supports_holding
                .store(reserved.supports_holding(), Ordering::Release);
        }
        Ok(reserved.count)
    }

    pub fn export_buffer(&self, direction: Direction, index: u32) -> Result<Vec<ExportedPlane>> {
        self.device()?
            .export_buffer(direction, index)
            .map_err(|source| Error::BufferExport {
                direction,
                index,
                source,
            })
    }

    fn take_kernel_request(&self) -> Result<Arc<D::Request>> {
        if let Some(request) = self.state.lock().free.pop() {
            return Ok(request);
        }
        let request = self
            .device()?
            .alloc_request()
            .map_err(Error::RequestAlloc)?;
        debug!("allocated media request {}", request.raw_fd());
        Ok(Arc::new(request))
    }

    fn insert(
        self: &Arc<Self>,
        binding: RequestBinding<D::Request>,
        bitstream: CodecMemory,
    ) -> Request<D> {
        let binding = Arc::new(binding);
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        let generation = state.generation;
        state.slots.insert(
            id,
            RequestSlot {
                binding: binding.clone(),
                refs: 1,
                bitstream: Some(bitstream),
                pending: false,
                failed: false,
                hold_pic_buf: false,
                generation,
            },
        );
        Request::new(self.clone(), id, binding)
    }

    /// Takes a request to decode `frame_num` from `bitstream` into `picture`.
    pub fn alloc_request(
        self: &Arc<Self>,
        frame_num: u32,
        bitstream: CodecMemory,
        picture: PictureBuffer,
    ) -> Result<Request<D>> {
        let kernel = self.take_kernel_request()?;
        Ok(self.insert(
            RequestBinding {
                kernel,
                frame_num,
                picture,
                sub_request: false,
            },
            bitstream,
        ))
    }

    /// Takes a request continuing `prev`: it decodes more of the same frame into the same
    /// picture, for example the next slice.
    pub fn alloc_sub_request(
        self: &Arc<Self>,
        prev: &Request<D>,
        bitstream: CodecMemory,
    ) -> Result<Request<D>> {
        let kernel = self.take_kernel_request()?;
        let prev = prev.binding();
        Ok(self.insert(
            RequestBinding {
                kernel,
                frame_num: prev.frame_num,
                picture: prev.picture.clone(),
                sub_request: true,
            },
            bitstream,
        ))
    }

    pub(crate) fn queue_request(&self, id: RequestId, flags: u32) -> Result<()> {
        let device = self.device()?;
        let hold = flags & V4L2_BUF_FLAG_M2M_HOLD_CAPTURE_BUF != 0;
        if hold && !self.supports_holding() {
            error!("Driver does not support holding capture buffer.");
            return Err(Error::HoldUnsupported);
        }

        let mut state = self.state.lock();
        let slot = state.slot_mut(id)?;
        let binding = slot.binding.clone();
        let bitstream = slot.bitstream.as_ref().ok_or(Error::NoBitstream)?;
        let bitstream_index = bitstream.index();
        let bytes_used = [u32::try_from(bitstream.size()).unwrap_or(u32::MAX)];

        device
            .queue_buffer(QueuedBuffer {
                direction: Direction::Input,
                index: bitstream_index,
                bytes_used: &bytes_used,
                timestamp_us: frame_tag(binding.frame_num),
                flags,
                request: Some(binding.kernel.as_ref()),
            })
            .map_err(|source| {
                error!("Driver did not accept the bitstream data: {}", source);
                Error::QueueBuffer {
                    direction: Direction::Input,
                    index: bitstream_index,
                    source,
                }
            })?;

        if !binding.sub_request {
            let index = binding.picture.index();
            let planes = vec![0; binding.picture.num_memories()];
            device
                .queue_buffer(QueuedBuffer {
                    direction: Direction::Output,
                    index,
                    bytes_used: &planes,
                    timestamp_us: 0,
                    flags: 0,
                    request: None,
                })
                .map_err(|source| {
                    error!("Driver did not accept the picture buffer: {}", source);
                    Error::QueueBuffer {
                        direction: Direction::Output,
                        index,
                        source,
                    }
                })?;
        }

        let fd = binding.kernel.raw_fd();
        binding.kernel.queue().map_err(|source| {
            error!("Failed to queue request {}: {}", fd, source);
            Error::QueueRequest { fd, source }
        })?;

        slot.hold_pic_buf = hold;
        slot.pending = true;
        slot.refs += 1;
        state.pending.push_back(id);
        trace!("queued request {} for frame {}", fd, binding.frame_num);

        let limit = max(1, state.render_delay) as usize;
        if state.pending.len() > limit {
            let head = state.pending[0];
            drop(state);
            // The new request stays queued. Only the wait on the head failed.
            self.set_done(head).map_err(|e| {
                error!("Waiting for the oldest request failed: {}", e);
                e
            })?;
        }
        Ok(())
    }

    fn kernel_request(&self, id: RequestId) -> Result<Option<(Arc<D::Request>, RawFd)>> {
        let state = self.state.lock();
        let slot = state.slot(id)?;
        if !slot.pending {
            return Ok(None);
        }
        let kernel = slot.binding.kernel.clone();
        let fd = kernel.raw_fd();
        Ok(Some((kernel, fd)))
    }

    /// Waits for request `id` to complete, then retires it and every request queued before it.
    pub(crate) fn set_done(&self, id: RequestId) -> Result<()> {
        let Some((kernel, fd)) = self.kernel_request(id)? else {
            return Ok(());
        };

        match kernel.wait(self.request_timeout()) {
            Ok(true) => {}
            Ok(false) => {
                warn!("Request {} took too long.", fd);
                return Err(Error::RequestTimeout { fd });
            }
            Err(source) => {
                warn!("Request {} error: {}", fd, source);
                return Err(Error::RequestWait { fd, source });
            }
        }

        let device = self.device()?;
        let mut released = Vec::new();
        let mut state = self.state.lock();
        if !state.slot(id)?.pending {
            return Ok(());
        }
        loop {
            let Some(head) = state.pending.pop_front() else {
                error!("Request {} was not in the pending queue", fd);
                break;
            };
            self.retire(device.as_ref(), &mut state, head);
            unref_locked(&mut state, head, &mut released);
            if head == id {
                break;
            }
        }
        drop(state);
        drop(released);
        Ok(())
    }

    fn retire(&self, device: &D, state: &mut SchedulerState<D::Request>, id: RequestId) {
        let Ok(slot) = state.slot_mut(id) else {
            error!("pending request {} has no slot", id);
            return;
        };
        if let Err(e) = device.dequeue_buffer(Direction::Input) {
            warn!("failed to dequeue bitstream buffer: {}", e);
        }
        slot.bitstream.take();

        if !slot.hold_pic_buf {
            let frame_num = slot.binding.frame_num;
            match device.dequeue_buffer(Direction::Output) {
                Ok(buffer) => {
                    let returned = buffer.timestamp_us / 1000;
                    if buffer.timestamp_us != frame_tag(frame_num) {
                        warn!(
                            "Requested frame {}, but driver returned frame {}.",
                            frame_num, returned
                        );
                        slot.failed = true;
                    } else if buffer.has_error() {
                        warn!("Driver reported an error decoding frame {}", frame_num);
                        slot.failed = true;
                    }
                }
                Err(e) => {
                    warn!("failed to dequeue picture of frame {}: {}", frame_num, e);
                    slot.failed = true;
                }
            }
        }
        slot.pending = false;
    }

    pub(crate) fn ref_request(&self, id: RequestId) {
        if let Ok(slot) = self.state.lock().slot_mut(id) {
            slot.refs += 1;
        }
    }

    pub(crate) fn unref_request(&self, id: RequestId) {
        let mut released = Vec::new();
        let mut state = self.state.lock();
        unref_locked(&mut state, id, &mut released);
        drop(state);
        drop(released);
    }

    pub(crate) fn inspect<T>(
        &self,
        id: RequestId,
        f: impl FnOnce(&RequestSlot<D::Request>) -> T,
    ) -> Option<T> {
        self.state.lock().slots.get(&id).map(f)
    }
}

/// Drops one reference to request `id`. The last reference destroys the kernel request if it is
/// still pending or belongs to a closed device, and recycles it otherwise.
fn unref_locked<R: MediaRequest>(
    state: &mut SchedulerState<R>,
    id: RequestId,
    released: &mut Released<R>,
) {
    let Ok(slot) = state.slot_mut(id) else {
        error!("unref of unknown request {}", id);
        return;
    };
    if slot.refs == 0 {
        error!("request {} unreferenced too many times", id);
        return;
    }
    slot.refs -= 1;
    if slot.refs > 0 {
        return;
    }
    let Some(slot) = state.slots.remove(&id) else {
        return;
    };
    let kernel = &slot.binding.kernel;
    if slot.pending {
        debug!("Freeing pending request {}.", kernel.raw_fd());
        state.pending.retain(|p| *p != id);
    } else if state.open && slot.generation == state.generation {
        match kernel.reinit() {
            Ok(()) => state.free.push(kernel.clone()),
            Err(e) => warn!("Failed to reinit request {}: {}", kernel.raw_fd(), e),
        }
    }
    released.push(slot);
}

impl<D: DecoderDevice> Drop for Decoder<D> {
    fn drop(&mut self) {
        if self.is_open() {
            self.close();
        }
    }
}
