// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Shared mappings of exported buffer planes.

use std::cmp::min;
use std::io;
use std::os::fd::AsRawFd;
use std::ptr::copy_nonoverlapping;
use std::ptr::null_mut;

use remain::sorted;
use thiserror::Error;

#[sorted]
#[derive(Error, Debug)]
pub enum Error {
    #[error("requested memory out of range")]
    InvalidAddress,
    #[error("mmap related system call failed: {0}")]
    SystemCallFailed(io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A read/write shared mapping of a file descriptor, unmapped on drop.
#[derive(Debug)]
pub struct MemoryMapping {
    addr: *mut u8,
    size: usize,
}

// SAFETY:
// The mapping is shared memory that is only accessed through copies bounded by `size`, so the
// pointer can be moved and used across threads.
unsafe impl Send for MemoryMapping {}
// SAFETY: See the comment on the `Send` implementation.
unsafe impl Sync for MemoryMapping {}

impl MemoryMapping {
    /// Maps `size` bytes of `fd` starting at `offset`.
    pub fn from_fd_offset<F: AsRawFd>(fd: &F, size: usize, offset: u64) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidAddress);
        }
        let offset = libc::off_t::try_from(offset).map_err(|_| Error::InvalidAddress)?;
        // SAFETY:
        // A fresh mapping is requested without a fixed address, so no existing memory is touched.
        // The return value is checked below.
        let addr = unsafe {
            libc::mmap(
                null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                offset,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(Error::SystemCallFailed(io::Error::last_os_error()));
        }
        Ok(MemoryMapping {
            addr: addr as *mut u8,
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Copies `buf` into the mapping at `offset`, returning how many bytes fit.
    pub fn write_slice(&self, buf: &[u8], offset: usize) -> Result<usize> {
        match self.size.checked_sub(offset) {
            Some(size_past_offset) => {
                let bytes_copied = min(size_past_offset, buf.len());
                // SAFETY:
                // The bytes_copied equation above ensures we don't copy bytes out of range of
                // either buf or this mapping. The buffers do not overlap because `buf` is a Rust
                // slice and the mapping is only reachable through this object.
                unsafe {
                    copy_nonoverlapping(buf.as_ptr(), self.addr.add(offset), bytes_copied);
                }
                Ok(bytes_copied)
            }
            None => Err(Error::InvalidAddress),
        }
    }

    /// Copies from the mapping at `offset` into `buf`, returning how many bytes were read.
    pub fn read_slice(&self, buf: &mut [u8], offset: usize) -> Result<usize> {
        match self.size.checked_sub(offset) {
            Some(size_past_offset) => {
                let bytes_copied = min(size_past_offset, buf.len());
                // SAFETY:
                // Same bounds reasoning as `write_slice`.
                unsafe {
                    copy_nonoverlapping(self.addr.add(offset), buf.as_mut_ptr(), bytes_copied);
                }
                Ok(bytes_copied)
            }
            None => Err(Error::InvalidAddress),
        }
    }
}

impl Drop for MemoryMapping {
    fn drop(&mut self) {
        // SAFETY:
        // This is safe because we mmap the area at addr ourselves, and nobody else is holding a
        // reference to it.
        unsafe {
            libc::munmap(self.addr as *mut libc::c_void, self.size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backing_file(size: u64) -> std::fs::File {
        let file = tempfile::tempfile().unwrap();
        file.set_len(size).unwrap();
        file
    }

    #[test]
    fn write_then_read() {
        let file = backing_file(4096);
        let m = MemoryMapping::from_fd_offset(&file, 4096, 0).unwrap();
        assert_eq!(m.write_slice(&[1, 2, 3, 4], 10).unwrap(), 4);
        let mut out = [0u8; 4];
        assert_eq!(m.read_slice(&mut out, 10).unwrap(), 4);
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn writes_are_shared_between_mappings() {
        let file = backing_file(4096);
        let a = MemoryMapping::from_fd_offset(&file, 4096, 0).unwrap();
        let b = MemoryMapping::from_fd_offset(&file, 4096, 0).unwrap();
        a.write_slice(b"frame", 0).unwrap();
        let mut out = [0u8; 5];
        b.read_slice(&mut out, 0).unwrap();
        assert_eq!(&out, b"frame");
    }

    #[test]
    fn bounds() {
        let file = backing_file(4096);
        let m = MemoryMapping::from_fd_offset(&file, 16, 0).unwrap();
        assert_eq!(m.write_slice(&[0xff; 32], 8).unwrap(), 8);
        assert!(matches!(m.write_slice(&[0], 17), Err(Error::InvalidAddress)));
        assert!(matches!(
            MemoryMapping::from_fd_offset(&file, 0, 0),
            Err(Error::InvalidAddress)
        ));
    }
}
