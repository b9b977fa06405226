//! # Object Store
//!
//! Named byte blobs behind a narrow [`StorageAccess`] trait, plus the
//! [`ObjectStore`] adapter the WAL uses to read objects into managed
//! buffers.
//!
//! ```text
//! ┌──────────────┐     ┌─────────────────────┐     ┌────────────────┐
//! │  WalManager  │────>│     ObjectStore     │────>│ StorageAccess  │
//! └──────────────┘     │  (+ BufferManager)  │     │  FsStorage     │
//!                      └─────────────────────┘     │  MemoryStorage │
//!                                                  └────────────────┘
//! ```

mod fs;
mod memory;

pub use fs::FsStorage;
pub use memory::MemoryStorage;

use std::io::Read;
use std::sync::Arc;

use mnemo_core::error::{Error, Result};

use crate::buffer::{Buffer, BufferManager};

/// Readable object with a length known up front.
pub struct ObjectStream {
    pub len: u64,
    pub reader: Box<dyn Read + Send>,
}

/// The storage collaborator. Implementations must make `put` atomic: a
/// reader sees either the old or the new content of an object.
pub trait StorageAccess: Send + Sync {
    /// Names starting with `prefix`, in no particular order.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;
    fn get(&self, name: &str) -> Result<ObjectStream>;
    fn put(&self, name: &str, data: &[u8]) -> Result<()>;
    fn delete(&self, name: &str) -> Result<()>;
}

pub struct ObjectStore {
    storage: Arc<dyn StorageAccess>,
    buffers: Arc<dyn BufferManager>,
}

impl ObjectStore {
    pub fn new(storage: Arc<dyn StorageAccess>, buffers: Arc<dyn BufferManager>) -> Self {
        Self { storage, buffers }
    }

    pub fn buffers(&self) -> &Arc<dyn BufferManager> {
        &self.buffers
    }

    pub fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.storage.list(prefix)
    }

    pub fn put(&self, name: &str, data: &[u8]) -> Result<()> {
        self.storage.put(name, data)
    }

    pub fn delete(&self, name: &str) -> Result<()> {
        self.storage.delete(name)
    }

    /// Reads `name` into `buffer` (cleared first). Objects larger than the
    /// buffer capacity are rejected before any byte is read.
    pub fn get_into(&self, name: &str, buffer: &mut Buffer) -> Result<usize> {
        let ObjectStream { len, mut reader } = self.storage.get(name)?;
        let len = usize::try_from(len).map_err(|_| Error::ObjectStore {
            object: name.to_string(),
            message: format!("object length {} does not fit in memory", len),
        })?;
        if len > buffer.capacity() {
            return Err(Error::ObjectStore {
                object: name.to_string(),
                message: format!(
                    "object of {} bytes exceeds buffer capacity {}",
                    len,
                    buffer.capacity()
                ),
            });
        }

        buffer.clear();
        let read = buffer.fill_with(len, |dst| {
            reader.read_exact(dst).map_err(|e| Error::ObjectStore {
                object: name.to_string(),
                message: format!("short read: {}", e),
            })?;
            Ok(dst.len())
        })?;
        Ok(read)
    }

    /// Reads `name` into a freshly allocated buffer of `capacity` bytes.
    /// The caller owns the buffer and must release it.
    pub fn get(&self, name: &str, capacity: usize) -> Result<Buffer> {
        let mut buffer = self.buffers.allocate(capacity)?;
        match self.get_into(name, &mut buffer) {
            Ok(_) => Ok(buffer),
            Err(e) => {
                self.buffers.release(buffer);
                Err(e)
            }
        }
    }
}
