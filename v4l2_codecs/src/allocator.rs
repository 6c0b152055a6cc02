// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Fixed-size set of kernel buffers for one direction of the decoder.
//!
//! All buffers are reserved with a single `VIDIOC_REQBUFS` call when the allocator is created,
//! then exported and mapped. Each buffer is lent out as one [`CodecMemory`] per plane. Dropping
//! the last plane of a buffer puts it back on the free queue and wakes any thread blocked in
//! [`CodecAllocator::wait_for_buffer`].

use std::collections::VecDeque;
use std::fmt;
use std::os::fd::AsRawFd;
use std::os::fd::OwnedFd;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;
use std::time::Instant;

use log::debug;
use log::error;
use log::warn;

use crate::decoder::Decoder;
use crate::device::DecoderDevice;
use crate::error::Error;
use crate::error::Result;
use crate::format::Direction;
use crate::mmap::MemoryMapping;
use crate::sync::Condvar;
use crate::sync::Mutex;

/// One exported and mapped plane of a kernel buffer.
struct CodecPlane {
    fd: OwnedFd,
    mapping: MemoryMapping,
    /// Offset of the payload inside `mapping`.
    offset: usize,
}

impl CodecPlane {
    fn capacity(&self) -> usize {
        self.mapping.size().saturating_sub(self.offset)
    }
}

struct CodecBuffer {
    index: u32,
    planes: Vec<Arc<CodecPlane>>,
    /// Plane handles currently lent out.
    outstanding: u32,
}

struct AllocatorState {
    buffers: Vec<CodecBuffer>,
    free: VecDeque<u32>,
    detached: bool,
    flushing: bool,
}

impl AllocatorState {
    fn outstanding_buffers(&self) -> usize {
        self.buffers.iter().filter(|b| b.outstanding > 0).count()
    }
}

/// Receives plane handles when they are dropped.
pub(crate) trait BufferOwner: Send + Sync {
    fn release(&self, index: u32);
}

struct AllocatorShared<D: DecoderDevice> {
    decoder: Arc<Decoder<D>>,
    direction: Direction,
    pool_size: u32,
    state: Mutex<AllocatorState>,
    buffer_cv: Condvar,
}

impl<D: DecoderDevice> AllocatorShared<D> {
    fn detach(&self) {
        let mut state = self.state.lock();
        if state.detached {
            return;
        }
        state.detached = true;
        drop(state);

        if let Err(e) = self.decoder.request_buffers(self.direction, 0) {
            warn!("failed to release {} buffers: {}", self.direction, e);
        }
        self.buffer_cv.notify_all();
        debug!("{} allocator detached", self.direction);
    }
}

impl<D: DecoderDevice> BufferOwner for AllocatorShared<D> {
    fn release(&self, index: u32) {
        let mut state = self.state.lock();
        let detached = state.detached;
        let Some(buffer) = state.buffers.iter_mut().find(|b| b.index == index) else {
            error!("released unknown {} buffer {}", self.direction, index);
            return;
        };
        if buffer.outstanding == 0 {
            error!("{} buffer {} released more than once", self.direction, index);
            return;
        }
        buffer.outstanding -= 1;
        if buffer.outstanding > 0 || detached {
            return;
        }
        state.free.push_back(index);
        drop(state);
        self.buffer_cv.notify_all();
    }
}

impl<D: DecoderDevice> Drop for AllocatorShared<D> {
    fn drop(&mut self) {
        let outstanding = self.state.lock().outstanding_buffers();
        if outstanding > 0 {
            error!(
                "{} allocator destroyed with {} buffers still in use",
                self.direction, outstanding
            );
        }
        self.detach();
    }
}

/// Handle on one plane of a kernel buffer lent by a [`CodecAllocator`].
///
/// The buffer goes back to its allocator once every plane handle of it has been dropped.
pub struct CodecMemory {
    owner: Weak<dyn BufferOwner>,
    index: u32,
    plane: Arc<CodecPlane>,
    size: usize,
}

impl CodecMemory {
    /// Index of the kernel buffer this plane belongs to.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Bytes of payload the plane can hold.
    pub fn capacity(&self) -> usize {
        self.plane.capacity()
    }

    /// Bytes of payload written so far.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn set_size(&mut self, size: usize) {
        self.size = size.min(self.capacity());
    }

    /// Appends `data` after the current payload.
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        if self.size + data.len() > self.capacity() {
            return Err(Error::BitstreamOverflow);
        }
        self.write_at(self.size, data)?;
        self.size += data.len();
        Ok(())
    }

    /// Writes `data` at `offset` in the payload without changing its size.
    pub fn write_at(&self, offset: usize, data: &[u8]) -> Result<()> {
        if offset + data.len() > self.capacity() {
            return Err(Error::BitstreamOverflow);
        }
        self.plane
            .mapping
            .write_slice(data, self.plane.offset + offset)
            .map_err(Error::BufferMap)?;
        Ok(())
    }

    /// Reads the payload at `offset` into `buf`, returning the number of bytes read.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize> {
        let available = self.capacity().saturating_sub(offset);
        let len = buf.len().min(available);
        self.plane
            .mapping
            .read_slice(&mut buf[..len], self.plane.offset + offset)
            .map_err(Error::BufferMap)
    }

    /// Exported descriptor of the plane, for sharing with other devices.
    pub fn raw_fd(&self) -> RawFd {
        self.plane.fd.as_raw_fd()
    }
}

impl fmt::Debug for CodecMemory {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CodecMemory")
            .field("index", &self.index)
            .field("size", &self.size)
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl Drop for CodecMemory {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.upgrade() {
            owner.release(self.index);
        }
    }
}

/// Owns the buffers reserved on one queue of a decoder.
pub struct CodecAllocator<D: DecoderDevice> {
    shared: Arc<AllocatorShared<D>>,
}

impl<D: DecoderDevice> Clone for CodecAllocator<D> {
    fn clone(&self) -> Self {
        CodecAllocator {
            shared: self.shared.clone(),
        }
    }
}

impl<D: DecoderDevice> CodecAllocator<D> {
    /// Reserves `num_buffers` buffers on `direction`, then exports and maps all of them.
    ///
    /// Fails with `AllocationFailed` if the driver grants fewer buffers than asked for. Anything
    /// reserved is released again on failure.
    pub fn new(decoder: &Arc<Decoder<D>>, direction: Direction, num_buffers: u32) -> Result<Self> {
        let granted = decoder.request_buffers(direction, num_buffers)?;
        if granted < num_buffers {
            release_reservation(decoder, direction);
            return Err(Error::AllocationFailed {
                direction,
                requested: num_buffers,
                granted,
            });
        }
        if granted > num_buffers {
            debug!(
                "driver granted {} {} buffers, using {}",
                granted, direction, num_buffers
            );
        }

        let mut buffers = Vec::with_capacity(num_buffers as usize);
        for index in 0..num_buffers {
            match export_and_map(decoder, direction, index) {
                Ok(planes) => buffers.push(CodecBuffer {
                    index,
                    planes,
                    outstanding: 0,
                }),
                Err(e) => {
                    drop(buffers);
                    release_reservation(decoder, direction);
                    return Err(e);
                }
            }
        }

        debug!("created {} {} buffers", num_buffers, direction);
        Ok(CodecAllocator {
            shared: Arc::new(AllocatorShared {
                decoder: decoder.clone(),
                direction,
                pool_size: num_buffers,
                state: Mutex::new(AllocatorState {
                    buffers,
                    free: (0..num_buffers).collect(),
                    detached: false,
                    flushing: false,
                }),
                buffer_cv: Condvar::new(),
            }),
        })
    }

    pub fn direction(&self) -> Direction {
        self.shared.direction
    }

    pub fn pool_size(&self) -> u32 {
        self.shared.pool_size
    }

    pub fn free_count(&self) -> usize {
        self.shared.state.lock().free.len()
    }

    /// Buffers with at least one plane lent out.
    pub fn outstanding_count(&self) -> usize {
        self.shared.state.lock().outstanding_buffers()
    }

    pub fn is_detached(&self) -> bool {
        self.shared.state.lock().detached
    }

    fn owner(&self) -> Weak<dyn BufferOwner> {
        let owner: Weak<AllocatorShared<D>> = Arc::downgrade(&self.shared);
        owner
    }

    fn lend(&self, buffer: &mut CodecBuffer, plane: usize) -> CodecMemory {
        buffer.outstanding += 1;
        CodecMemory {
            owner: self.owner(),
            index: buffer.index,
            plane: buffer.planes[plane].clone(),
            size: 0,
        }
    }

    /// Takes a free buffer without blocking. Only the first plane is lent, which is what
    /// bitstream buffers need. Returns `None` when no buffer is free or after `detach`.
    pub fn alloc(&self) -> Option<CodecMemory> {
        let mut state = self.shared.state.lock();
        if state.detached {
            return None;
        }
        let index = state.free.pop_front()?;
        let buffer = &mut state.buffers[index as usize];
        if buffer.planes.len() > 1 {
            warn!(
                "{} buffer {} has {} planes, only the first is lent",
                self.shared.direction,
                index,
                buffer.planes.len()
            );
        }
        Some(self.lend(buffer, 0))
    }

    /// Blocks until a buffer is free.
    ///
    /// Returns `Flushing` if flushing is set, even when a buffer is free, `Detached` once the
    /// allocator is detached and `WaitTimeout` if `timeout` elapses first.
    pub fn wait_for_buffer(&self, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.shared.state.lock();
        loop {
            if state.flushing {
                return Err(Error::Flushing);
            }
            if state.detached {
                return Err(Error::Detached);
            }
            if !state.free.is_empty() {
                return Ok(());
            }
            state = match deadline {
                None => self.shared.buffer_cv.wait(state),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::WaitTimeout);
                    }
                    self.shared.buffer_cv.wait_timeout(state, deadline - now).0
                }
            };
        }
    }

    /// Pops a free buffer and appends a handle for each of its planes to `memories`. Returns
    /// false if no buffer was available.
    pub fn prepare_buffer(&self, memories: &mut Vec<CodecMemory>) -> bool {
        let mut state = self.shared.state.lock();
        if state.detached {
            return false;
        }
        let Some(index) = state.free.pop_front() else {
            return false;
        };
        let buffer = &mut state.buffers[index as usize];
        for plane in 0..buffer.planes.len() {
            memories.push(self.lend(buffer, plane));
        }
        true
    }

    /// Releases the kernel reservation. Buffers released afterwards are discarded.
    pub fn detach(&self) {
        self.shared.detach();
    }

    /// While set, [`CodecAllocator::wait_for_buffer`] returns `Flushing` immediately.
    pub fn set_flushing(&self, flushing: bool) {
        let mut state = self.shared.state.lock();
        state.flushing = flushing;
        drop(state);
        if flushing {
            self.shared.buffer_cv.notify_all();
        }
    }
}

fn release_reservation<D: DecoderDevice>(decoder: &Decoder<D>, direction: Direction) {
    if let Err(e) = decoder.request_buffers(direction, 0) {
        warn!("failed to release {} buffers: {}", direction, e);
    }
}

fn export_and_map<D: DecoderDevice>(
    decoder: &Decoder<D>,
    direction: Direction,
    index: u32,
) -> Result<Vec<Arc<CodecPlane>>> {
    decoder
        .export_buffer(direction, index)?
        .into_iter()
        .map(|plane| {
            let mapping =
                MemoryMapping::from_fd_offset(&plane.fd, plane.length, 0).map_err(Error::BufferMap)?;
            Ok(Arc::new(CodecPlane {
                fd: plane.fd,
                mapping,
                offset: plane.offset,
            }))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::channel;
    use std::thread;

    use super::*;
    use crate::fake::FakeDevice;
    use crate::fake::FakeOptions;

    fn decoder() -> Arc<Decoder<FakeDevice>> {
        Decoder::with_device(Default::default(), FakeDevice::new(FakeOptions::default()))
    }

    #[test]
    fn capacity() {
        let decoder = decoder();
        let allocator = CodecAllocator::new(&decoder, Direction::Input, 2).unwrap();
        let a = allocator.alloc().unwrap();
        let b = allocator.alloc().unwrap();
        assert!(allocator.alloc().is_none());
        assert_ne!(a.index(), b.index());
        drop(a);
        assert!(allocator.alloc().is_some());
    }

    #[test]
    fn count_invariant() {
        let decoder = decoder();
        let allocator = CodecAllocator::new(&decoder, Direction::Output, 3).unwrap();
        let check = |a: &CodecAllocator<FakeDevice>| {
            assert_eq!(
                a.free_count() + a.outstanding_count(),
                a.pool_size() as usize
            );
        };
        check(&allocator);
        let mut held = Vec::new();
        assert!(allocator.prepare_buffer(&mut held));
        check(&allocator);
        let single = allocator.alloc().unwrap();
        check(&allocator);
        held.clear();
        check(&allocator);
        drop(single);
        check(&allocator);
        assert_eq!(allocator.free_count(), 3);
    }

    #[test]
    fn multi_plane_buffer_returns_after_last_plane() {
        let decoder = Decoder::with_device(
            Default::default(),
            FakeDevice::new(FakeOptions {
                capture_planes: 2,
                ..Default::default()
            }),
        );
        let allocator = CodecAllocator::new(&decoder, Direction::Output, 1).unwrap();
        let mut memories = Vec::new();
        assert!(allocator.prepare_buffer(&mut memories));
        assert_eq!(memories.len(), 2);
        let second = memories.pop().unwrap();
        drop(memories);
        assert_eq!(allocator.free_count(), 0);
        drop(second);
        assert_eq!(allocator.free_count(), 1);
    }

    #[test]
    fn short_grant_fails_and_releases() {
        let device = FakeDevice::new(FakeOptions {
            max_buffers: 2,
            ..Default::default()
        });
        let decoder = Decoder::with_device(Default::default(), device);
        match CodecAllocator::new(&decoder, Direction::Input, 4) {
            Err(Error::AllocationFailed {
                requested: 4,
                granted: 2,
                ..
            }) => {}
            r => panic!("unexpected result {:?}", r.map(|a| a.pool_size())),
        }
        let fake = decoder.device().unwrap();
        assert_eq!(fake.reserved(Direction::Input), 0);
    }

    #[test]
    fn memory_read_write() {
        let decoder = decoder();
        let allocator = CodecAllocator::new(&decoder, Direction::Input, 1).unwrap();
        let mut mem = allocator.alloc().unwrap();
        mem.append(&[0, 0, 1]).unwrap();
        mem.append(&[0x65, 0x88]).unwrap();
        assert_eq!(mem.size(), 5);
        let mut out = [0u8; 5];
        assert_eq!(mem.read_at(0, &mut out).unwrap(), 5);
        assert_eq!(out, [0, 0, 1, 0x65, 0x88]);

        let too_big = vec![0u8; mem.capacity()];
        assert!(matches!(mem.append(&too_big), Err(Error::BitstreamOverflow)));
        assert_eq!(mem.size(), 5);
    }

    #[test]
    fn detach_is_idempotent() {
        let decoder = decoder();
        let allocator = CodecAllocator::new(&decoder, Direction::Input, 2).unwrap();
        let held = allocator.alloc().unwrap();
        let fake = decoder.device().unwrap();
        let calls = fake.reqbufs_calls(Direction::Input);

        allocator.detach();
        allocator.detach();
        assert_eq!(fake.reqbufs_calls(Direction::Input), calls + 1);
        assert_eq!(fake.reserved(Direction::Input), 0);
        assert!(allocator.alloc().is_none());
        assert!(matches!(
            allocator.wait_for_buffer(None),
            Err(Error::Detached)
        ));

        // Released after detach: discarded, not requeued.
        drop(held);
        assert_eq!(allocator.free_count(), 1);
        assert!(allocator.alloc().is_none());
    }

    #[test]
    fn blocked_wait_wakes_on_release() {
        let decoder = decoder();
        let allocator = CodecAllocator::new(&decoder, Direction::Output, 4).unwrap();
        let mut held: Vec<CodecMemory> = (0..4).map(|_| allocator.alloc().unwrap()).collect();
        assert!(allocator.alloc().is_none());

        let (tx, rx) = channel();
        let waiter = allocator.clone();
        let handle = thread::spawn(move || {
            let index = waiter
                .wait_for_buffer(None)
                .map(|_| waiter.alloc().map(|m| m.index()));
            tx.send(index).unwrap();
        });
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        let released = held.remove(2);
        let index = released.index();
        drop(released);
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap(),
            Some(index)
        );
        handle.join().unwrap();
    }

    #[test]
    fn flushing_wakes_waiters() {
        let decoder = decoder();
        let allocator = CodecAllocator::new(&decoder, Direction::Output, 1).unwrap();
        let _held = allocator.alloc().unwrap();

        let (tx, rx) = channel();
        let waiter = allocator.clone();
        let handle = thread::spawn(move || {
            tx.send(waiter.wait_for_buffer(None)).unwrap();
        });
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        allocator.set_flushing(true);
        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            Err(Error::Flushing)
        ));
        handle.join().unwrap();

        allocator.set_flushing(false);
        assert!(matches!(
            allocator.wait_for_buffer(Some(Duration::from_millis(10))),
            Err(Error::WaitTimeout)
        ));
    }

    #[test]
    fn flushing_wins_over_free_buffer() {
        let decoder = decoder();
        let allocator = CodecAllocator::new(&decoder, Direction::Input, 1).unwrap();
        allocator.set_flushing(true);
        assert!(matches!(
            allocator.wait_for_buffer(None),
            Err(Error::Flushing)
        ));
        assert!(allocator.alloc().is_some());
    }
}
