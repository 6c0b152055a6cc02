// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Errors that can happen while driving a stateless decoder.

use std::io;
use std::os::fd::RawFd;
use std::path::PathBuf;

use remain::sorted;
use thiserror::Error;

use crate::format::Direction;
use crate::mmap;

/// How an error affects the decode stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Reservation, export or negotiation failed. The caller has to renegotiate.
    Construction,
    /// No buffer or container is available right now. Waiting may help.
    Capacity,
    /// The kernel rejected the current frame. Only that frame is lost.
    Submission,
    /// The driver reported a decode error for one frame.
    FrameLocal,
    /// The kernel pipeline is broken and the stream must be stopped.
    StreamFatal,
    /// A flush interrupted the operation.
    Cancelled,
}

#[sorted]
#[derive(Error, Debug)]
pub enum Error {
    #[error("only {granted} of {requested} {direction} buffers were granted")]
    AllocationFailed {
        direction: Direction,
        requested: u32,
        granted: u32,
    },
    #[error("not enough space left on the bitstream buffer")]
    BitstreamOverflow,
    #[error("failed to export {direction} buffer {index}: {source}")]
    BufferExport {
        direction: Direction,
        index: u32,
        source: io::Error,
    },
    #[error("failed to map buffer memory: {0}")]
    BufferMap(mmap::Error),
    #[error("failed to parse configuration: {0}")]
    ConfigParse(serde_json::Error),
    #[error("failed to read configuration {}: {source}", path.display())]
    ConfigRead { path: PathBuf, source: io::Error },
    #[error("failed to access controls: {0}")]
    Control(io::Error),
    #[error("decoder is not open")]
    DecoderClosed,
    #[error("allocator is detached from the device")]
    Detached,
    #[error("failed to open {}: {source}", path.display())]
    DeviceOpen { path: PathBuf, source: io::Error },
    #[error("failed to enumerate formats: {0}")]
    EnumFormat(io::Error),
    #[error("wait interrupted by a flush")]
    Flushing,
    #[error("driver rejected format: {0}")]
    FormatRejected(String),
    #[error("failed to decode frame {0}")]
    FrameFailed(u32),
    #[error("failed to get format: {0}")]
    GetFormat(io::Error),
    #[error("driver does not support holding capture buffers")]
    HoldUnsupported,
    #[error("no bitstream buffer is bound")]
    NoBitstream,
    #[error("no picture container left in the pool")]
    PoolExhausted,
    #[error("failed to query capabilities: {0}")]
    QueryCapabilities(io::Error),
    #[error("failed to query control {id:#x}: {source}")]
    QueryControl { id: u32, source: io::Error },
    #[error("failed to queue {direction} buffer {index}: {source}")]
    QueueBuffer {
        direction: Direction,
        index: u32,
        source: io::Error,
    },
    #[error("failed to queue request {fd}: {source}")]
    QueueRequest { fd: RawFd, source: io::Error },
    #[error("failed to allocate media request: {0}")]
    RequestAlloc(io::Error),
    #[error("failed to reserve {direction} buffers: {source}")]
    RequestBuffers {
        direction: Direction,
        source: io::Error,
    },
    #[error("request {fd} took too long")]
    RequestTimeout { fd: RawFd },
    #[error("failed waiting for request {fd}: {source}")]
    RequestWait { fd: RawFd, source: io::Error },
    #[error("failed to set format: {0}")]
    SetFormat(io::Error),
    #[error("failed to stop {direction} stream: {source}")]
    StreamOff {
        direction: Direction,
        source: io::Error,
    },
    #[error("failed to start {direction} stream: {source}")]
    StreamOn {
        direction: Direction,
        source: io::Error,
    },
    #[error("request {0} is not tracked by the decoder")]
    UnknownRequest(u64),
    #[error("device is not a stateless memory-to-memory decoder")]
    UnsupportedDevice,
    #[error("driver offers no supported decoded format")]
    UnsupportedFormat,
    #[error("timed out waiting for a free buffer")]
    WaitTimeout,
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        use Error::*;
        match self {
            AllocationFailed { .. }
            | BufferExport { .. }
            | BufferMap(_)
            | ConfigParse(_)
            | ConfigRead { .. }
            | DeviceOpen { .. }
            | EnumFormat(_)
            | FormatRejected(_)
            | GetFormat(_)
            | QueryCapabilities(_)
            | QueryControl { .. }
            | RequestAlloc(_)
            | RequestBuffers { .. }
            | SetFormat(_)
            | UnsupportedDevice
            | UnsupportedFormat => ErrorClass::Construction,
            PoolExhausted | WaitTimeout => ErrorClass::Capacity,
            BitstreamOverflow
            | Control(_)
            | HoldUnsupported
            | NoBitstream
            | QueueBuffer { .. }
            | QueueRequest { .. } => ErrorClass::Submission,
            FrameFailed(_) => ErrorClass::FrameLocal,
            DecoderClosed
            | Detached
            | RequestTimeout { .. }
            | RequestWait { .. }
            | StreamOff { .. }
            | StreamOn { .. }
            | UnknownRequest(_) => ErrorClass::StreamFatal,
            Flushing => ErrorClass::Cancelled,
        }
    }

    /// Whether the stream has to be stopped and renegotiated after this error.
    pub fn is_stream_fatal(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Construction | ErrorClass::StreamFatal
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
