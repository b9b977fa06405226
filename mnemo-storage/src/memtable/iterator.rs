use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use mnemo_core::error::{Error, Result};
use mnemo_core::{ColumnType, TableSchema, Value};

use super::query::{Projection, RowView};
use super::table::MemoryTable;
use super::tombstone::Tombstone;

#[derive(Debug, Clone, PartialEq)]
pub struct ScanRequest {
    /// Output alias to column name. `None` returns every column.
    pub columns: Option<BTreeMap<String, String>>,
    pub start: Option<Value>,
    pub start_inclusive: bool,
    pub end: Option<Value>,
    pub end_inclusive: bool,
    pub keep_none: bool,
    /// Revision to read. `None` reads the current revision.
    pub revision: Option<u64>,
}

impl Default for ScanRequest {
    fn default() -> Self {
        Self {
            columns: None,
            start: None,
            start_inclusive: true,
            end: None,
            end_inclusive: true,
            keep_none: false,
            revision: None,
        }
    }
}

impl ScanRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn range(
        mut self,
        start: Option<Value>,
        start_inclusive: bool,
        end: Option<Value>,
        end_inclusive: bool,
    ) -> Self {
        self.start = start;
        self.start_inclusive = start_inclusive;
        self.end = end;
        self.end_inclusive = end_inclusive;
        self
    }

    pub fn columns<I, A, C>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = (A, C)>,
        A: Into<String>,
        C: Into<String>,
    {
        self.columns = Some(
            columns
                .into_iter()
                .map(|(a, c)| (a.into(), c.into()))
                .collect(),
        );
        self
    }

    pub fn keep_none(mut self, keep_none: bool) -> Self {
        self.keep_none = keep_none;
        self
    }

    pub fn at_revision(mut self, revision: u64) -> Self {
        self.revision = Some(revision);
        self
    }
}

/// One row produced by a scan: the key and the projected columns, by
/// output alias.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanRow {
    pub key: Value,
    pub values: BTreeMap<String, Value>,
}

/// Lazy forward scan over one table at a fixed revision.
///
/// Rows are looked up one at a time from the table's skip list, so writes
/// made after the scan started are never observed and the iterator never
/// holds a table lock between steps.
pub struct TableScanIterator {
    table: Arc<MemoryTable>,
    schema: Arc<TableSchema>,
    projection: Projection,
    tombstones: Vec<(u64, Tombstone)>,
    snapshot: u64,
    lower: Bound<Value>,
    position: Bound<Value>,
    end: Bound<Value>,
    keep_none: bool,
    last_key: Option<Value>,
}

impl TableScanIterator {
    pub(crate) fn new(
        table: Arc<MemoryTable>,
        schema: Arc<TableSchema>,
        tombstones: Vec<(u64, Tombstone)>,
        snapshot: u64,
        request: &ScanRequest,
    ) -> Result<Self> {
        let projection = Projection::new(&schema, request.columns.as_ref())?;
        let bound = |value: &Option<Value>, inclusive: bool| -> Result<Bound<Value>> {
            let value = match value {
                None | Some(Value::Null) => return Ok(Bound::Unbounded),
                Some(v) => v.clone(),
            };
            let value = match schema.key_type() {
                Some(key_type) => key_type.coerce_key(value).map_err(|e| Error::InvalidQuery {
                    message: format!("scan bound does not fit the key type: {}", e),
                })?,
                None => value,
            };
            Ok(if inclusive {
                Bound::Included(value)
            } else {
                Bound::Excluded(value)
            })
        };
        let lower = bound(&request.start, request.start_inclusive)?;
        let end = bound(&request.end, request.end_inclusive)?;

        Ok(Self {
            table,
            schema,
            projection,
            tombstones,
            snapshot,
            position: lower.clone(),
            lower,
            end,
            keep_none: request.keep_none,
            last_key: None,
        })
    }

    /// Revision the scan reads.
    pub fn revision(&self) -> u64 {
        self.snapshot
    }

    /// Output alias to column type for every projected column.
    pub fn column_types(&self) -> BTreeMap<String, ColumnType> {
        self.projection.column_types()
    }

    pub fn key_type(&self) -> Option<&ColumnType> {
        self.schema.key_type()
    }

    /// Key of the last row returned.
    pub fn last_key(&self) -> Option<&Value> {
        self.last_key.as_ref()
    }

    /// Restarts the scan at `key`. Positions before the requested start
    /// are clamped to it.
    pub fn seek(&mut self, key: Value, inclusive: bool) {
        let target = if inclusive {
            Bound::Included(key)
        } else {
            Bound::Excluded(key)
        };
        self.position = if starts_before(&target, &self.lower) {
            self.lower.clone()
        } else {
            target
        };
    }

    fn exhausted(&self) -> bool {
        let (start, start_incl) = match &self.position {
            Bound::Unbounded => return false,
            Bound::Included(v) => (v, true),
            Bound::Excluded(v) => (v, false),
        };
        let (end, end_incl) = match &self.end {
            Bound::Unbounded => return false,
            Bound::Included(v) => (v, true),
            Bound::Excluded(v) => (v, false),
        };
        match start.cmp(end) {
            Ordering::Greater => true,
            Ordering::Equal => !(start_incl && end_incl),
            Ordering::Less => false,
        }
    }
}

/// Whether lower bound `a` admits keys that `b` excludes.
fn starts_before(a: &Bound<Value>, b: &Bound<Value>) -> bool {
    match (a, b) {
        (_, Bound::Unbounded) => false,
        (Bound::Unbounded, _) => true,
        (Bound::Included(x), Bound::Included(y)) | (Bound::Excluded(x), Bound::Excluded(y)) => x < y,
        (Bound::Included(x), Bound::Excluded(y)) => x <= y,
        (Bound::Excluded(x), Bound::Included(y)) => x < y,
    }
}

impl Iterator for TableScanIterator {
    type Item = Result<ScanRow>;

    fn next(&mut self) -> Option<Result<ScanRow>> {
        loop {
            if self.exhausted() {
                return None;
            }
            let (key, values) = {
                let entry = self
                    .table
                    .rows()
                    .range((self.position.clone(), self.end.clone()))
                    .next()?;
                let key = entry.key().clone();
                let values = MemoryTable::visible(
                    &key,
                    &entry.value().read(),
                    self.snapshot,
                    &self.tombstones,
                );
                (key, values)
            };
            self.position = Bound::Excluded(key.clone());

            let Some(values) = values else {
                continue;
            };
            let view = RowView::new(&key, &self.schema, &values);
            let projected = match self.projection.project(&view, self.keep_none) {
                Ok(projected) => projected,
                Err(e) => return Some(Err(e)),
            };
            self.last_key = Some(key.clone());
            return Some(Ok(ScanRow {
                key,
                values: projected,
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_before() {
        let inc = |v: i64| Bound::Included(Value::Int64(v));
        let exc = |v: i64| Bound::Excluded(Value::Int64(v));
        assert!(starts_before(&inc(1), &inc(2)));
        assert!(starts_before(&inc(2), &exc(2)));
        assert!(!starts_before(&exc(2), &inc(2)));
        assert!(!starts_before(&inc(5), &Bound::Unbounded));
        assert!(starts_before(&Bound::Unbounded, &inc(0)));
    }
}
