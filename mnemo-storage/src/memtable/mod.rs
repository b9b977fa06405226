//! # MemoryTable - Versioned In-Memory Tables
//!
//! Each table keeps every version of every row in a concurrent skip list
//! ordered by key. A write batch is logged to the WAL and then applied as
//! one new revision; reads choose a revision and see exactly the state at
//! that point.
//!
//! ## Module Structure
//!
//! - `table.rs` - MemoryTable: update, delete, query, scan, checkpoints, replay
//! - `tombstone.rs` - Prefix and range deletion markers
//! - `checkpoint.rs` - User and virtual checkpoints
//! - `query.rs` - Filter trees, ordering, projection, RecordList
//! - `iterator.rs` - Lazy snapshot scans
//!
//! ## Row Versions
//!
//! ```text
//!   key        versions (revision: values)            tombstones
//!  ┌──────┐   ┌────────┬────────┬────────┐          ┌────────────────┐
//!  │ "a/1"│──>│ 1: {..}│ 4: {..}│        │          │ 3: prefix "a/" │
//!  ├──────┤   ├────────┼────────┼────────┤          │ 6: [b, c)      │
//!  │ "a/2"│──>│ 1: {..}│        │        │          └────────────────┘
//!  ├──────┤   ├────────┼────────┼────────┤
//!  │ "b"  │──>│ 2: {..}│ 5: del │        │
//!  └──────┘   └────────┴────────┴────────┘
//!
//!  read at revision 4:  "a/1" -> 4: {..}   "a/2" -> hidden (tombstone 3)
//!                       "b"   -> 2: {..}
//! ```
//!
//! A row version written at revision `v` is hidden at snapshot `s` when a
//! tombstone recorded at `t` matches its key with `v < t <= s`.

mod checkpoint;
mod iterator;
mod query;
mod table;
mod tombstone;

pub use checkpoint::{Checkpoint, CheckpointSet};
pub use iterator::{ScanRequest, ScanRow, TableScanIterator};
pub use query::{CompareOp, Filter, Operand, OrderBy, QueryRequest, RecordList};
pub use table::MemoryTable;
pub use tombstone::Tombstone;
