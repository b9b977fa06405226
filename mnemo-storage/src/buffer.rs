//! # Buffer Manager
//!
//! Fixed-capacity byte buffers handed out by a [`BufferManager`]. A buffer
//! is exclusively owned by whoever allocated it until it is released back.
//!
//! All writes go through [`Buffer::put_slice`], which checks capacity at the
//! buffer boundary instead of trusting the caller's offset arithmetic.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;

use mnemo_core::error::{Error, Result};

pub struct Buffer {
    data: BytesMut,
    capacity: usize,
}

impl Buffer {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.data.len()
    }

    pub fn put_slice(&mut self, src: &[u8]) -> Result<()> {
        if src.len() > self.remaining() {
            return Err(Error::BufferOverflow {
                requested: src.len(),
                available: self.remaining(),
            });
        }
        self.data.put_slice(src);
        Ok(())
    }

    /// Lends `len` bytes of spare capacity to `fill`, which returns how many
    /// of them it wrote. Used by codecs that write into a `&mut [u8]`.
    pub fn fill_with<F>(&mut self, len: usize, fill: F) -> Result<usize>
    where
        F: FnOnce(&mut [u8]) -> Result<usize>,
    {
        if len > self.remaining() {
            return Err(Error::BufferOverflow {
                requested: len,
                available: self.remaining(),
            });
        }
        let start = self.data.len();
        self.data.resize(start + len, 0);
        match fill(&mut self.data[start..]) {
            Ok(written) if written <= len => {
                self.data.truncate(start + written);
                Ok(written)
            }
            Ok(written) => {
                self.data.truncate(start);
                Err(Error::Internal {
                    message: format!("codec reported {} bytes written into {}", written, len),
                })
            }
            Err(e) => {
                self.data.truncate(start);
                Err(e)
            }
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Bounds-checked view into the written part of the buffer.
    pub fn slice(&self, range: Range<usize>) -> Result<&[u8]> {
        if range.start > range.end || range.end > self.data.len() {
            return Err(Error::BufferOverflow {
                requested: range.end,
                available: self.data.len(),
            });
        }
        Ok(&self.data[range])
    }

    /// Drops everything after `len`.
    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Copies the written bytes out, leaving the buffer untouched.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.data)
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.data.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

pub trait BufferManager: Send + Sync {
    fn allocate(&self, capacity: usize) -> Result<Buffer>;
    fn release(&self, buffer: Buffer);
}

/// Heap-backed manager that keeps released buffers for reuse.
///
/// Released buffers are pooled by capacity until the pool holds
/// `pool_limit` bytes; beyond that they are dropped.
pub struct HeapBufferManager {
    pool: Mutex<HashMap<usize, Vec<Buffer>>>,
    pooled_bytes: AtomicUsize,
    outstanding: AtomicUsize,
    pool_limit: usize,
}

impl HeapBufferManager {
    pub fn new(pool_limit: usize) -> Self {
        Self {
            pool: Mutex::new(HashMap::new()),
            pooled_bytes: AtomicUsize::new(0),
            outstanding: AtomicUsize::new(0),
            pool_limit,
        }
    }

    /// Bytes currently owned by callers.
    pub fn outstanding_bytes(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn pooled_buffers(&self) -> usize {
        self.pool.lock().values().map(Vec::len).sum()
    }
}

impl BufferManager for HeapBufferManager {
    fn allocate(&self, capacity: usize) -> Result<Buffer> {
        let pooled = self.pool.lock().get_mut(&capacity).and_then(Vec::pop);
        let buffer = match pooled {
            Some(mut buffer) => {
                self.pooled_bytes.fetch_sub(capacity, Ordering::AcqRel);
                buffer.clear();
                buffer
            }
            None => Buffer::with_capacity(capacity),
        };
        self.outstanding.fetch_add(capacity, Ordering::AcqRel);
        Ok(buffer)
    }

    fn release(&self, buffer: Buffer) {
        let capacity = buffer.capacity;
        self.outstanding.fetch_sub(capacity, Ordering::AcqRel);

        let mut pool = self.pool.lock();
        if self.pooled_bytes.load(Ordering::Acquire) + capacity <= self.pool_limit {
            self.pooled_bytes.fetch_add(capacity, Ordering::AcqRel);
            pool.entry(capacity).or_default().push(buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_slice_is_bounds_checked() {
        let manager = HeapBufferManager::new(0);
        let mut buffer = manager.allocate(4).unwrap();
        buffer.put_slice(b"abc").unwrap();
        assert_eq!(buffer.remaining(), 1);

        let err = buffer.put_slice(b"de").unwrap_err();
        assert!(matches!(
            err,
            Error::BufferOverflow {
                requested: 2,
                available: 1
            }
        ));
        assert_eq!(buffer.as_slice(), b"abc");
        assert_eq!(buffer.slice(1..3).unwrap(), b"bc");
        assert!(buffer.slice(2..5).is_err());
    }

    #[test]
    fn test_release_pools_and_tracks_outstanding() {
        let manager = HeapBufferManager::new(1024);
        let mut a = manager.allocate(128).unwrap();
        a.put_slice(b"data").unwrap();
        assert_eq!(manager.outstanding_bytes(), 128);

        manager.release(a);
        assert_eq!(manager.outstanding_bytes(), 0);
        assert_eq!(manager.pooled_buffers(), 1);

        let b = manager.allocate(128).unwrap();
        assert!(b.is_empty());
        assert_eq!(manager.pooled_buffers(), 0);
    }

    #[test]
    fn test_pool_limit_drops_excess_buffers() {
        let manager = HeapBufferManager::new(100);
        let a = manager.allocate(60).unwrap();
        let b = manager.allocate(60).unwrap();
        assert_eq!(manager.outstanding_bytes(), 120);

        manager.release(a);
        manager.release(b);
        assert_eq!(manager.outstanding_bytes(), 0);
        assert_eq!(manager.pooled_buffers(), 1);
    }
}
