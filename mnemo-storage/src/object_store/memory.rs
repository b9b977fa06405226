//! In-process storage, used by tests and tools. Supports injecting `put`
//! failures to exercise the WAL retry path.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::RwLock;

use mnemo_core::error::{Error, Result};

use super::{ObjectStream, StorageAccess};

#[derive(Default)]
pub struct MemoryStorage {
    objects: RwLock<BTreeMap<String, Bytes>>,
    failing_puts: AtomicU32,
    puts: AtomicU64,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` calls to `put` fail with an object store error.
    pub fn fail_next_puts(&self, count: u32) {
        self.failing_puts.store(count, Ordering::SeqCst);
    }

    /// Successful `put` calls so far.
    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn object(&self, name: &str) -> Option<Bytes> {
        self.objects.read().get(name).cloned()
    }

    /// Overwrites an object without going through `put`, bypassing
    /// failure injection.
    pub fn insert_raw(&self, name: &str, data: impl Into<Bytes>) {
        self.objects.write().insert(name.to_string(), data.into());
    }
}

impl StorageAccess for MemoryStorage {
    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .objects
            .read()
            .range(prefix.to_string()..)
            .take_while(|(name, _)| name.starts_with(prefix))
            .map(|(name, _)| name.clone())
            .collect())
    }

    fn get(&self, name: &str) -> Result<ObjectStream> {
        let data = self.object(name).ok_or_else(|| Error::ObjectStore {
            object: name.to_string(),
            message: "not found".to_string(),
        })?;
        Ok(ObjectStream {
            len: data.len() as u64,
            reader: Box::new(Cursor::new(data)),
        })
    }

    fn put(&self, name: &str, data: &[u8]) -> Result<()> {
        let injected = self
            .failing_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::ObjectStore {
                object: name.to_string(),
                message: "injected failure".to_string(),
            });
        }

        self.objects
            .write()
            .insert(name.to_string(), Bytes::copy_from_slice(data));
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<()> {
        self.objects.write().remove(name);
        Ok(())
    }
}
