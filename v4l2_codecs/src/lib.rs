// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Control plane of V4L2 stateless video decoders.
//!
//! [`Decoder`] wraps a memory-to-memory decoder device and schedules media requests,
//! [`CodecAllocator`] lends the kernel buffers of one queue, [`CodecPool`] recycles decoded
//! pictures and [`DecodeSession`] ties them together for codec implementations.

pub mod allocator;
pub mod config;
pub mod decoder;
pub mod device;
pub mod error;
#[cfg(any(test, feature = "fake-device"))]
pub mod fake;
pub mod format;
pub mod mmap;
pub mod pool;
pub mod request;
pub mod session;
mod sync;
pub mod v4l2;

pub use allocator::CodecAllocator;
pub use allocator::CodecMemory;
pub use config::DecoderConfig;
pub use decoder::Decoder;
pub use device::DecoderDevice;
pub use error::Error;
pub use error::ErrorClass;
pub use error::Result;
pub use format::CodedFormat;
pub use format::DecodedFormat;
pub use format::Direction;
pub use format::VideoInfo;
pub use pool::CodecPool;
pub use pool::PictureBuffer;
pub use request::Request;
pub use request::RequestId;
pub use session::DecodeFrame;
pub use session::DecodeSession;
pub use session::StatelessCodec;
pub use session::StreamParams;
pub use v4l2::V4l2Device;
