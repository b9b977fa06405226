//! # MnemoDB Storage Engine
//!
//! Versioned in-memory tables made durable by a write-ahead log kept in an
//! object store.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Write Path                             │
//! │                                                             │
//! │  update ──> schema merge ──> WalManager.append ──> MemTable │
//! │                                   │                         │
//! │                                   ▼                         │
//! │                          background worker                  │
//! │                          snappy + retry ──> ObjectStore     │
//! └─────────────────────────────────────────────────────────────┘
//!
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Read Path                              │
//! │                                                             │
//! │  query ──> MemoryTable (snapshot revision)                  │
//! │  scan  ──> TableScanIterator per table ──> k-way merge      │
//! └─────────────────────────────────────────────────────────────┘
//!
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Startup                                │
//! │                                                             │
//! │  ObjectStore ──> WalReplay ──> apply_wal_entry per table    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod buffer;
pub mod memtable;
pub mod object_store;
pub mod store;
pub mod wal;

pub use buffer::{Buffer, BufferManager, HeapBufferManager};
pub use memtable::{
    Checkpoint, CompareOp, Filter, MemoryTable, Operand, OrderBy, QueryRequest, RecordList,
    ScanRequest, ScanRow, TableScanIterator, Tombstone,
};
pub use object_store::{FsStorage, MemoryStorage, ObjectStore, ObjectStream, StorageAccess};
pub use store::{DataStore, EncodedRecord, MergeScanRequest, TableScan};
pub use wal::{WalEntry, WalManager, WalSink};
