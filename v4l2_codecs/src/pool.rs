// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Recycling of decoded picture containers.
//!
//! The pool never owns memory of its own: a container is filled from the picture allocator on
//! acquire and stripped again when the last [`PictureBuffer`] handle to it is dropped.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::Weak;

use log::trace;

use crate::allocator::CodecAllocator;
use crate::allocator::CodecMemory;
use crate::device::DecoderDevice;
use crate::error::Error;
use crate::error::Result;
use crate::format::VideoInfo;
use crate::sync::Mutex;

struct PictureContainer {
    id: usize,
    memories: Vec<CodecMemory>,
}

trait ContainerOwner: Send + Sync {
    fn release(&self, container: PictureContainer);
}

struct PoolShared<D: DecoderDevice> {
    allocator: CodecAllocator<D>,
    info: Arc<VideoInfo>,
    free: Mutex<VecDeque<PictureContainer>>,
}

impl<D: DecoderDevice> ContainerOwner for PoolShared<D> {
    fn release(&self, mut container: PictureContainer) {
        container.memories.clear();
        trace!("picture container {} back in the pool", container.id);
        self.free.lock().push_back(container);
    }
}

pub struct CodecPool<D: DecoderDevice> {
    shared: Arc<PoolShared<D>>,
}

impl<D: DecoderDevice> CodecPool<D> {
    /// Creates a pool with one empty container per buffer of `allocator`.
    pub fn new(allocator: &CodecAllocator<D>, info: VideoInfo) -> Self {
        let free = (0..allocator.pool_size() as usize)
            .map(|id| PictureContainer {
                id,
                memories: Vec::new(),
            })
            .collect();
        CodecPool {
            shared: Arc::new(PoolShared {
                allocator: allocator.clone(),
                info: Arc::new(info),
                free: Mutex::new(free),
            }),
        }
    }

    pub fn video_info(&self) -> &VideoInfo {
        &self.shared.info
    }

    pub fn allocator(&self) -> &CodecAllocator<D> {
        &self.shared.allocator
    }

    /// Containers currently waiting in the pool.
    pub fn free_containers(&self) -> usize {
        self.shared.free.lock().len()
    }

    /// Takes an empty container and fills it with a free picture buffer, waiting for one if the
    /// allocator is exhausted.
    ///
    /// Fails with `PoolExhausted` when no container is left, and with `Flushing` or `Detached` if
    /// the wait is interrupted.
    pub fn acquire(&self) -> Result<PictureBuffer> {
        let mut container = self
            .shared
            .free
            .lock()
            .pop_front()
            .ok_or(Error::PoolExhausted)?;

        let allocator = &self.shared.allocator;
        while !allocator.prepare_buffer(&mut container.memories) {
            if let Err(e) = allocator.wait_for_buffer(None) {
                self.shared.free.lock().push_front(container);
                return Err(e);
            }
        }

        let owner: Weak<PoolShared<D>> = Arc::downgrade(&self.shared);
        Ok(PictureBuffer {
            inner: Arc::new(PictureInner {
                container: Some(container),
                pool: owner,
                info: self.shared.info.clone(),
            }),
        })
    }
}

struct PictureInner {
    container: Option<PictureContainer>,
    pool: Weak<dyn ContainerOwner>,
    info: Arc<VideoInfo>,
}

impl Drop for PictureInner {
    fn drop(&mut self) {
        let Some(mut container) = self.container.take() else {
            return;
        };
        match self.pool.upgrade() {
            Some(pool) => pool.release(container),
            None => container.memories.clear(),
        }
    }
}

/// A decoded picture: one container holding every plane of a kernel picture buffer.
///
/// Cloning adds a reference. The memory returns to the allocator, and the container to its pool,
/// when the last clone is dropped.
#[derive(Clone)]
pub struct PictureBuffer {
    inner: Arc<PictureInner>,
}

impl PictureBuffer {
    fn memories(&self) -> &[CodecMemory] {
        self.inner
            .container
            .as_ref()
            .map(|c| c.memories.as_slice())
            .unwrap_or(&[])
    }

    /// Kernel index of the picture buffer.
    pub fn index(&self) -> u32 {
        self.memories().first().map(|m| m.index()).unwrap_or(0)
    }

    pub fn num_memories(&self) -> usize {
        self.memories().len()
    }

    pub fn memory(&self, i: usize) -> Option<&CodecMemory> {
        self.memories().get(i)
    }

    pub fn video_info(&self) -> &VideoInfo {
        &self.inner.info
    }

    pub fn container_id(&self) -> usize {
        self.inner.container.as_ref().map(|c| c.id).unwrap_or(0)
    }

    /// Whether both handles refer to the same picture.
    pub fn ptr_eq(&self, other: &PictureBuffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for PictureBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PictureBuffer")
            .field("index", &self.index())
            .field("container", &self.container_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::channel;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::decoder::Decoder;
    use crate::fake::FakeDevice;
    use crate::fake::FakeOptions;
    use crate::format::DecodedFormat;
    use crate::format::Direction;
    use crate::format::PlaneLayout;

    fn nv12_info() -> VideoInfo {
        VideoInfo {
            format: DecodedFormat::NV12,
            width: 64,
            height: 64,
            planes: vec![
                PlaneLayout {
                    memory_plane: 0,
                    offset: 0,
                    stride: 64,
                    size: 64 * 64,
                },
                PlaneLayout {
                    memory_plane: 0,
                    offset: 64 * 64,
                    stride: 64,
                    size: 64 * 32,
                },
            ],
        }
    }

    fn pool(size: u32) -> CodecPool<FakeDevice> {
        let decoder =
            Decoder::with_device(Default::default(), FakeDevice::new(FakeOptions::default()));
        let allocator = CodecAllocator::new(&decoder, Direction::Output, size).unwrap();
        CodecPool::new(&allocator, nv12_info())
    }

    #[test]
    fn release_strips_and_recycles() {
        let pool = pool(2);
        assert_eq!(pool.free_containers(), 2);
        let picture = pool.acquire().unwrap();
        assert_eq!(picture.num_memories(), 1);
        assert_eq!(pool.free_containers(), 1);
        assert_eq!(pool.allocator().free_count(), 1);

        let dup = picture.clone();
        drop(picture);
        assert_eq!(pool.free_containers(), 1);
        drop(dup);
        assert_eq!(pool.free_containers(), 2);
        assert_eq!(pool.allocator().free_count(), 2);
    }

    #[test]
    fn distinct_buffers() {
        let pool = pool(2);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_ne!(a.index(), b.index());
        assert_ne!(a.container_id(), b.container_id());
        assert!(!a.ptr_eq(&b));
        assert!(matches!(pool.acquire(), Err(Error::PoolExhausted)));
    }

    #[test]
    fn acquire_waits_for_memory() {
        let pool = pool(1);
        // Hold the only buffer through the allocator so the container is free but memory is not.
        let held = pool.allocator().alloc().unwrap();

        let (tx, rx) = channel();
        let waiter = CodecPool {
            shared: pool.shared.clone(),
        };
        let handle = thread::spawn(move || {
            tx.send(waiter.acquire().map(|p| p.index())).unwrap();
        });
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        let index = held.index();
        drop(held);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap(), index);
        handle.join().unwrap();
    }

    #[test]
    fn acquire_interrupted_by_flush() {
        let pool = pool(1);
        let _held = pool.allocator().alloc().unwrap();
        pool.allocator().set_flushing(true);
        assert!(matches!(pool.acquire(), Err(Error::Flushing)));
        assert_eq!(pool.free_containers(), 1);
    }
}
