// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt;
use std::os::fd::RawFd;
use std::sync::Arc;

use crate::decoder::Decoder;
use crate::device::Control;
use crate::device::DecoderDevice;
use crate::device::MediaRequest;
use crate::error::Result;
use crate::pool::PictureBuffer;

pub type RequestId = u64;

/// What a request decodes, fixed when it is allocated.
pub(crate) struct RequestBinding<R> {
    pub(crate) kernel: Arc<R>,
    pub(crate) frame_num: u32,
    pub(crate) picture: PictureBuffer,
    pub(crate) sub_request: bool,
}

/// Reference to a decode request owned by a [`Decoder`].
///
/// Cloning takes another reference. When the last reference is dropped the media request is
/// re-initialized and kept for reuse, unless it is still pending or the decoder was closed, in
/// which case it is destroyed.
pub struct Request<D: DecoderDevice> {
    decoder: Arc<Decoder<D>>,
    id: RequestId,
    binding: Arc<RequestBinding<D::Request>>,
}

impl<D: DecoderDevice> Request<D> {
    pub(crate) fn new(
        decoder: Arc<Decoder<D>>,
        id: RequestId,
        binding: Arc<RequestBinding<D::Request>>,
    ) -> Self {
        Request {
            decoder,
            id,
            binding,
        }
    }

    pub(crate) fn binding(&self) -> &RequestBinding<D::Request> {
        &self.binding
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Descriptor of the underlying media request.
    pub fn raw_fd(&self) -> RawFd {
        self.binding.kernel.raw_fd()
    }

    pub fn frame_num(&self) -> u32 {
        self.binding.frame_num
    }

    pub fn is_sub_request(&self) -> bool {
        self.binding.sub_request
    }

    /// Sets per-frame controls on this request.
    pub fn set_controls(&self, controls: &[Control<'_>]) -> Result<()> {
        self.decoder.set_controls(Some(self), controls)
    }

    /// Queues the bitstream, the picture (unless this is a sub-request) and the request itself.
    ///
    /// `flags` are extra `V4L2_BUF_FLAG_*` flags for the bitstream buffer, typically
    /// `V4L2_BUF_FLAG_M2M_HOLD_CAPTURE_BUF` when more requests will decode into the same picture.
    pub fn queue(&self, flags: u32) -> Result<()> {
        self.decoder.queue_request(self.id, flags)
    }

    /// Waits for the request to complete. Does nothing if it is not pending.
    pub fn set_done(&self) -> Result<()> {
        self.decoder.set_done(self.id)
    }

    pub fn is_pending(&self) -> bool {
        self.decoder
            .inspect(self.id, |slot| slot.pending)
            .unwrap_or(false)
    }

    /// Whether the driver failed to decode the frame or returned the wrong one.
    pub fn failed(&self) -> bool {
        self.decoder
            .inspect(self.id, |slot| slot.failed)
            .unwrap_or(false)
    }

    /// New reference to the picture this request decodes into.
    pub fn dup_pic_buf(&self) -> PictureBuffer {
        self.binding.picture.clone()
    }
}

impl<D: DecoderDevice> Clone for Request<D> {
    fn clone(&self) -> Self {
        self.decoder.ref_request(self.id);
        Request {
            decoder: self.decoder.clone(),
            id: self.id,
            binding: self.binding.clone(),
        }
    }
}

impl<D: DecoderDevice> Drop for Request<D> {
    fn drop(&mut self) {
        self.decoder.unref_request(self.id);
    }
}

impl<D: DecoderDevice> fmt::Debug for Request<D> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("fd", &self.raw_fd())
            .field("frame_num", &self.frame_num())
            .field("sub_request", &self.is_sub_request())
            .finish()
    }
}
