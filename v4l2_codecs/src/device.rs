// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This module defines the interface a stateless decoder device has to implement so the buffer
//! allocators and the request scheduler can drive it. The real implementation talks to a V4L2
//! memory-to-memory node and its media controller; tests use an in-process fake.

use std::fmt;
use std::io;
use std::os::fd::OwnedFd;
use std::os::fd::RawFd;
use std::time::Duration;

use zerocopy::Immutable;
use zerocopy::IntoBytes;

use crate::config::DecoderConfig;
use crate::error::Result;
use crate::format::Direction;
use crate::format::Format;
use crate::format::Fourcc;
use crate::format::FrameSizeRange;

/// Version of the kernel API the driver was built against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct KernelVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl From<u32> for KernelVersion {
    fn from(v: u32) -> Self {
        KernelVersion {
            major: v >> 16,
            minor: (v >> 8) & 0xff,
            patch: v & 0xff,
        }
    }
}

impl fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    pub driver: String,
    pub card: String,
    pub bus_info: String,
    pub version: KernelVersion,
    pub device_caps: u32,
    /// Whether the device uses the multi-planar API.
    pub mplane: bool,
}

/// Result of a buffer reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservedBuffers {
    /// Number of buffers the driver actually allocated.
    pub count: u32,
    /// `V4L2_BUF_CAP_*` flags of the queue.
    pub capabilities: u32,
}

impl ReservedBuffers {
    pub fn supports_holding(&self) -> bool {
        self.capabilities & v4l2_sys::V4L2_BUF_CAP_SUPPORTS_M2M_HOLD_CAPTURE_BUF != 0
    }
}

/// One plane of a reserved buffer, exported as a file descriptor.
#[derive(Debug)]
pub struct ExportedPlane {
    pub fd: OwnedFd,
    pub length: usize,
    /// Offset of the plane data inside the exported memory.
    pub offset: usize,
}

/// Description of a buffer handed to the driver.
pub struct QueuedBuffer<'a, R> {
    pub direction: Direction,
    pub index: u32,
    /// Payload size of each plane.
    pub bytes_used: &'a [u32],
    pub timestamp_us: u64,
    /// `V4L2_BUF_FLAG_*` flags.
    pub flags: u32,
    pub request: Option<&'a R>,
}

/// Description of a buffer returned by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DequeuedBuffer {
    pub index: u32,
    pub timestamp_us: u64,
    pub flags: u32,
    pub bytes_used: u32,
}

impl DequeuedBuffer {
    pub fn has_error(&self) -> bool {
        self.flags & v4l2_sys::V4L2_BUF_FLAG_ERROR != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlValue<'a> {
    Int(i32),
    Int64(i64),
    /// Payload of a compound control, typically one of the stateless codec parameter structs.
    Compound(&'a [u8]),
}

/// A control to be set on the device or on a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Control<'a> {
    pub id: u32,
    pub value: ControlValue<'a>,
}

impl<'a> Control<'a> {
    pub fn int(id: u32, value: i32) -> Self {
        Control {
            id,
            value: ControlValue::Int(value),
        }
    }

    pub fn compound<T: IntoBytes + Immutable + ?Sized>(id: u32, payload: &'a T) -> Self {
        Control {
            id,
            value: ControlValue::Compound(payload.as_bytes()),
        }
    }
}

/// What to read back for one control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    Int,
    Int64,
    /// Compound control of the given size in bytes.
    Compound(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlReading {
    Int(i32),
    Int64(i64),
    Compound(Vec<u8>),
}

/// Description of a control supported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlInfo {
    pub id: u32,
    pub minimum: i64,
    pub maximum: i64,
    pub default_value: i64,
    pub elem_size: u32,
    pub elems: u32,
}

/// A kernel media request: a set of buffers and controls that the driver processes atomically.
pub trait MediaRequest: Send + Sync + 'static {
    fn raw_fd(&self) -> RawFd;

    /// Submits the request to the driver.
    fn queue(&self) -> io::Result<()>;

    /// Returns a completed request to its initial state so it can be reused.
    fn reinit(&self) -> io::Result<()>;

    /// Waits up to `timeout` for the driver to complete the request. Returns `Ok(false)` on
    /// timeout.
    fn wait(&self, timeout: Duration) -> io::Result<bool>;

    /// Non blocking completion check.
    fn is_ready(&self) -> bool {
        self.wait(Duration::ZERO).unwrap_or(false)
    }
}

pub trait DecoderDevice: Send + Sync + Sized + 'static {
    type Request: MediaRequest;

    /// Opens the media and video nodes named in `config`.
    fn open(config: &DecoderConfig) -> Result<Self>;

    fn capabilities(&self) -> &Capabilities;

    /// Returns the `index`th format supported by `direction`, or `None` past the last one.
    fn enum_format(&self, direction: Direction, index: u32) -> io::Result<Option<Fourcc>>;

    /// Returns the `index`th frame size range of a coded format, or `None` past the last one.
    fn enum_frame_sizes(&self, fourcc: Fourcc, index: u32) -> io::Result<Option<FrameSizeRange>>;

    fn get_format(&self, direction: Direction) -> io::Result<Format>;

    /// Sets the format of `direction` and returns what the driver settled on.
    fn set_format(&self, direction: Direction, format: &Format) -> io::Result<Format>;

    /// Reserves `count` MMAP buffers. A count of zero releases the reservation.
    fn request_buffers(&self, direction: Direction, count: u32) -> io::Result<ReservedBuffers>;

    /// Exports every plane of the buffer at `index`.
    fn export_buffer(&self, direction: Direction, index: u32) -> io::Result<Vec<ExportedPlane>>;

    fn queue_buffer(&self, buffer: QueuedBuffer<'_, Self::Request>) -> io::Result<()>;

    fn dequeue_buffer(&self, direction: Direction) -> io::Result<DequeuedBuffer>;

    fn stream_on(&self, direction: Direction) -> io::Result<()>;

    fn stream_off(&self, direction: Direction) -> io::Result<()>;

    /// Sets controls on `request`, or on the device state when `request` is `None`.
    fn set_controls(
        &self,
        request: Option<&Self::Request>,
        controls: &[Control<'_>],
    ) -> io::Result<()>;

    fn get_controls(&self, queries: &[(u32, ControlKind)]) -> io::Result<Vec<ControlReading>>;

    /// Returns `None` if the control is not supported.
    fn query_control(&self, id: u32) -> io::Result<Option<ControlInfo>>;

    fn alloc_request(&self) -> io::Result<Self::Request>;
}

#[cfg(test)]
mod tests {
    use zerocopy::Immutable;
    use zerocopy::IntoBytes;

    use super::*;

    #[derive(IntoBytes, Immutable)]
    #[repr(C)]
    struct FrameParams {
        width: u16,
        height: u16,
        flags: u32,
    }

    #[test]
    fn compound_control_borrows_payload() {
        let params = FrameParams {
            width: 0x140,
            height: 0xf0,
            flags: 1,
        };
        let ctrl = Control::compound(v4l2_sys::V4L2_CID_STATELESS_VP8_FRAME, &params);
        match ctrl.value {
            ControlValue::Compound(bytes) => {
                assert_eq!(bytes.len(), 8);
                assert_eq!(&bytes[..2], &0x140u16.to_ne_bytes());
            }
            v => panic!("unexpected value {:?}", v),
        }
    }

    #[test]
    fn kernel_version() {
        let v = KernelVersion::from(0x0006_0801);
        assert_eq!(
            v,
            KernelVersion {
                major: 6,
                minor: 8,
                patch: 1
            }
        );
        assert_eq!(v.to_string(), "6.8.1");
        assert!(v >= KernelVersion::from(0x0005_1100));
    }

    #[test]
    fn hold_capability() {
        let reserved = ReservedBuffers {
            count: 4,
            capabilities: v4l2_sys::V4L2_BUF_CAP_SUPPORTS_M2M_HOLD_CAPTURE_BUF,
        };
        assert!(reserved.supports_holding());
        assert!(!ReservedBuffers {
            count: 4,
            capabilities: 0
        }
        .supports_holding());
    }
}
