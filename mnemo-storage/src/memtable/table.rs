use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_skiplist::SkipMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use mnemo_core::error::{Error, Result};
use mnemo_core::metrics::Metrics;
use mnemo_core::utils::now_ms;
use mnemo_core::{ColumnType, Record, TableSchema, TableSchemaDesc, Value};

use crate::wal::{WalEntry, WalEntryType, WalRecord, WalSink};

use super::checkpoint::{Checkpoint, CheckpointSet};
use super::iterator::{ScanRequest, TableScanIterator};
use super::query::{Projection, QueryRequest, RecordList, RowView};
use super::tombstone::Tombstone;

/// One version of a row. `None` values mark a deleted row.
#[derive(Debug, Clone)]
pub(crate) struct RowVersion {
    pub revision: u64,
    pub values: Option<Arc<BTreeMap<String, Value>>>,
}

/// A versioned, in-memory table.
///
/// Every applied batch produces a new revision. Readers pick a revision
/// up front and only look at row versions and tombstones at or below it,
/// so a batch becomes visible all at once when its revision is published.
pub struct MemoryTable {
    name: String,
    rows: SkipMap<Value, RwLock<Vec<RowVersion>>>,
    schema: RwLock<Arc<TableSchema>>,
    tombstones: RwLock<Vec<(u64, Tombstone)>>,
    checkpoints: RwLock<CheckpointSet>,
    /// Latest revision whose changes are fully applied.
    revision: AtomicU64,
    /// Serializes writers so WAL order matches apply order.
    write_lock: Mutex<()>,
    wal: Option<Arc<dyn WalSink>>,
    metrics: Metrics,
    created_ms: i64,
}

impl MemoryTable {
    /// Creates an empty table. Without a WAL sink changes are not logged.
    pub fn new(name: impl Into<String>, wal: Option<Arc<dyn WalSink>>, metrics: Metrics) -> Self {
        Self {
            name: name.into(),
            rows: SkipMap::new(),
            schema: RwLock::new(Arc::new(TableSchema::new())),
            tombstones: RwLock::new(Vec::new()),
            checkpoints: RwLock::new(CheckpointSet::new()),
            revision: AtomicU64::new(0),
            write_lock: Mutex::new(()),
            wal,
            metrics,
            created_ms: now_ms(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    pub fn schema(&self) -> Arc<TableSchema> {
        Arc::clone(&self.schema.read())
    }

    pub(crate) fn rows(&self) -> &SkipMap<Value, RwLock<Vec<RowVersion>>> {
        &self.rows
    }

    /// Applies a batch of records as one revision.
    ///
    /// The batch is validated in full (schema merge, key presence, value
    /// types) before anything is logged or applied; on error the table is
    /// unchanged.
    pub fn update(&self, schema: Option<&TableSchemaDesc>, records: Vec<Record>) -> Result<u64> {
        let result = self.update_inner(schema, records);
        if result.is_err() {
            self.metrics.record_update_error();
        }
        result
    }

    fn update_inner(&self, desc: Option<&TableSchemaDesc>, records: Vec<Record>) -> Result<u64> {
        let _guard = self.write_lock.lock();

        let current = self.schema();
        let mut schema = (*current).clone();
        let mut changed = BTreeMap::new();
        if let Some(desc) = desc {
            for column in schema.merge(desc)? {
                changed.insert(column.name.clone(), column);
            }
        }
        let key_column = schema
            .key_column()
            .ok_or_else(|| Error::SchemaValidation {
                message: format!(
                    "table {} has no key column; declare one with the first update",
                    self.name
                ),
            })?
            .to_string();

        for record in &records {
            for name in record.values.keys() {
                if schema.column(name).map_or(false, |c| c.column_type.is_virtual()) {
                    return Err(Error::TypeMismatch {
                        message: format!("virtual column {} cannot be written", name),
                    });
                }
            }
        }
        for column in schema.merge(&TableSchemaDesc::infer(key_column.as_str(), &records))? {
            changed.insert(column.name.clone(), column);
        }

        let mut rows = Vec::with_capacity(records.len());
        let mut wal_records = Vec::with_capacity(records.len());
        for record in records {
            let (key, values, wal_record) = prepare_record(&schema, &key_column, record)?;
            rows.push((key, values));
            wal_records.push(wal_record);
        }

        if rows.is_empty() && changed.is_empty() {
            return Ok(self.revision());
        }

        let revision = self.revision() + 1;
        let changed: Vec<_> = changed.into_values().collect();
        let wal_schema = if changed.is_empty() {
            None
        } else {
            Some(schema.to_wal(&changed)?)
        };
        if let Some(wal) = &self.wal {
            wal.append(WalEntry::update(&self.name, revision, wal_schema, wal_records))?;
        }

        let count = rows.len() as u64;
        for (key, values) in rows {
            self.push_version(key, revision, values);
        }
        if !changed.is_empty() {
            debug!(table = %self.name, columns = changed.len(), revision, "Schema changed");
            *self.schema.write() = Arc::new(schema);
        }
        self.revision.store(revision, Ordering::Release);
        self.metrics.record_update(count);
        Ok(revision)
    }

    /// Logically deletes every key the tombstone matches.
    pub fn delete_range(&self, tombstone: Tombstone) -> Result<u64> {
        let result = self.delete_range_inner(tombstone);
        if result.is_err() {
            self.metrics.record_update_error();
        }
        result
    }

    fn delete_range_inner(&self, tombstone: Tombstone) -> Result<u64> {
        let _guard = self.write_lock.lock();

        let schema = self.schema();
        let key_type = schema.key_type().ok_or_else(|| Error::SchemaValidation {
            message: format!("table {} has no key column", self.name),
        })?;
        let tombstone = tombstone.normalize(key_type)?;

        let revision = self.revision() + 1;
        if let Some(wal) = &self.wal {
            wal.append(WalEntry::tombstone(&self.name, revision, tombstone.to_wal(key_type)?))?;
        }

        self.tombstones.write().push((revision, tombstone));
        self.revision.store(revision, Ordering::Release);
        self.metrics.record_update(0);
        Ok(revision)
    }

    /// Rows visible at the requested revision, filtered, sorted and paged.
    pub fn query(&self, request: &QueryRequest) -> Result<RecordList> {
        let result = self.query_inner(request);
        match &result {
            Ok(_) => self.metrics.record_query(),
            Err(_) => self.metrics.record_query_error(),
        }
        result
    }

    fn query_inner(&self, request: &QueryRequest) -> Result<RecordList> {
        let snapshot = self.snapshot(request.revision)?;
        let schema = self.schema();
        request.check(&schema)?;
        let projection = Projection::new(&schema, request.columns.as_ref())?;
        let tombstones = self.tombstones_at(snapshot);

        let visible: Vec<(Value, Arc<BTreeMap<String, Value>>)> = self
            .rows
            .iter()
            .filter_map(|entry| {
                let values = Self::visible(entry.key(), &entry.value().read(), snapshot, &tombstones)?;
                Some((entry.key().clone(), values))
            })
            .collect();

        let mut views: Vec<RowView<'_>> = Vec::new();
        for (key, values) in &visible {
            let view = RowView::new(key, &schema, values);
            let keep = match &request.filter {
                Some(filter) => filter.evaluate(&view)?,
                None => true,
            };
            if keep {
                views.push(view);
            }
        }
        request.sort(&mut views)?;

        let page = views
            .iter()
            .skip(request.start)
            .take(request.limit.unwrap_or(usize::MAX));

        let mut records = Vec::new();
        let mut last_key = None;
        for view in page {
            let projected = projection.project(view, request.keep_none)?;
            records.push(projection.encode(&projected, request.raw_result)?);
            last_key = Some(view.key);
        }
        let last_key = match (last_key, schema.key_type()) {
            (Some(key), Some(key_type)) => Some(key_type.encode(key, request.raw_result)?),
            _ => None,
        };

        Ok(RecordList {
            column_types: projection.column_types(),
            records,
            last_key,
        })
    }

    /// Starts a lazy scan over a snapshot of the table.
    pub fn scan(self: &Arc<Self>, request: &ScanRequest) -> Result<TableScanIterator> {
        let snapshot = self.snapshot(request.revision)?;
        let schema = self.schema();
        let tombstones = self.tombstones_at(snapshot);
        let iter = TableScanIterator::new(Arc::clone(self), schema, tombstones, snapshot, request)?;
        self.metrics.record_scan();
        Ok(iter)
    }

    /// Records a user checkpoint at the current revision.
    pub fn create_checkpoint(&self, user_data: Option<String>) -> Result<Checkpoint> {
        let _guard = self.write_lock.lock();

        let revision = self.revision();
        self.checkpoints.read().check_create(revision)?;
        let checkpoint = Checkpoint {
            revision,
            timestamp_ms: now_ms(),
            row_count: self.count_rows(revision),
            user_data,
            is_virtual: false,
        };
        if let Some(wal) = &self.wal {
            wal.append(WalEntry::checkpoint(
                &self.name,
                revision,
                WalEntryType::CreateCheckpoint,
                checkpoint.to_wal(),
            ))?;
        }
        self.checkpoints.write().insert(checkpoint.clone())?;

        info!(
            table = %self.name,
            revision,
            row_count = checkpoint.row_count,
            "Checkpoint created"
        );
        Ok(checkpoint)
    }

    /// User checkpoints framed by virtual checkpoints at revision 0 and at
    /// the current revision.
    pub fn checkpoints(&self) -> Vec<Checkpoint> {
        let revision = self.revision();
        let oldest = Checkpoint {
            revision: 0,
            timestamp_ms: self.created_ms,
            row_count: 0,
            user_data: None,
            is_virtual: true,
        };
        let current = Checkpoint {
            revision,
            timestamp_ms: now_ms(),
            row_count: self.count_rows(revision),
            user_data: None,
            is_virtual: true,
        };
        self.checkpoints.read().list(oldest, current)
    }

    pub fn delete_checkpoint(&self, revision: u64) -> Result<()> {
        let _guard = self.write_lock.lock();

        let wal_checkpoint = self.checkpoints.read().check_delete(revision)?.to_wal();
        if let Some(wal) = &self.wal {
            wal.append(WalEntry::checkpoint(
                &self.name,
                self.revision(),
                WalEntryType::DeleteCheckpoint,
                wal_checkpoint,
            ))?;
        }
        self.checkpoints.write().remove(revision)?;
        info!(table = %self.name, revision, "Checkpoint deleted");
        Ok(())
    }

    /// Replays one logged entry. Nothing is written back to the WAL.
    pub fn apply_wal_entry(&self, entry: &WalEntry) -> Result<()> {
        let _guard = self.write_lock.lock();

        match entry.entry_type {
            WalEntryType::Update => {
                let mut schema = (*self.schema()).clone();
                if let Some(delta) = &entry.table_schema {
                    schema.apply_wal(delta)?;
                }
                let key_column = schema
                    .key_column()
                    .ok_or_else(|| self.corrupt("update before any schema"))?
                    .to_string();

                let mut rows = Vec::with_capacity(entry.records.len());
                for record in &entry.records {
                    let mut values = BTreeMap::new();
                    for column in &record.columns {
                        let declared = schema.column_by_index(column.index).ok_or_else(|| {
                            self.corrupt(format!("record refers to unknown column {}", column.index))
                        })?;
                        let value = declared.column_type.from_wal(column)?;
                        if !value.is_null() {
                            values.insert(declared.name.clone(), value);
                        }
                    }
                    let key = values
                        .get(&key_column)
                        .cloned()
                        .ok_or_else(|| self.corrupt("record without key"))?;
                    let values = (!record.deleted).then(|| Arc::new(values));
                    rows.push((key, values));
                }

                for (key, values) in rows {
                    self.push_version(key, entry.revision, values);
                }
                *self.schema.write() = Arc::new(schema);
            }
            WalEntryType::Tombstone => {
                let schema = self.schema();
                let key_type = schema
                    .key_type()
                    .ok_or_else(|| self.corrupt("tombstone before any schema"))?;
                let tombstone = entry
                    .tombstone
                    .as_ref()
                    .ok_or_else(|| self.corrupt("tombstone entry without tombstone"))?;
                let tombstone = Tombstone::from_wal(tombstone, key_type)?;
                self.tombstones.write().push((entry.revision, tombstone));
            }
            WalEntryType::CreateCheckpoint | WalEntryType::DeleteCheckpoint => {
                let checkpoint = entry
                    .checkpoint
                    .as_ref()
                    .ok_or_else(|| self.corrupt("checkpoint entry without checkpoint"))?;
                let mut checkpoints = self.checkpoints.write();
                if entry.entry_type == WalEntryType::CreateCheckpoint {
                    checkpoints.insert(Checkpoint::from_wal(checkpoint))?;
                } else {
                    checkpoints.remove(checkpoint.revision)?;
                }
            }
        }

        self.revision.fetch_max(entry.revision, Ordering::AcqRel);
        Ok(())
    }

    /// Number of rows visible at `revision` (current when `None`).
    pub fn row_count(&self, revision: Option<u64>) -> Result<u64> {
        let snapshot = self.snapshot(revision)?;
        Ok(self.count_rows(snapshot))
    }

    fn count_rows(&self, snapshot: u64) -> u64 {
        let tombstones = self.tombstones_at(snapshot);
        self.rows
            .iter()
            .filter(|entry| {
                Self::visible(entry.key(), &entry.value().read(), snapshot, &tombstones).is_some()
            })
            .count() as u64
    }

    fn snapshot(&self, requested: Option<u64>) -> Result<u64> {
        let current = self.revision();
        match requested {
            None => Ok(current),
            Some(revision) if revision <= current => Ok(revision),
            Some(revision) => Err(Error::InvalidQuery {
                message: format!(
                    "revision {} of table {} is in the future (current {})",
                    revision, self.name, current
                ),
            }),
        }
    }

    fn tombstones_at(&self, snapshot: u64) -> Vec<(u64, Tombstone)> {
        self.tombstones
            .read()
            .iter()
            .filter(|(revision, _)| *revision <= snapshot)
            .cloned()
            .collect()
    }

    fn push_version(&self, key: Value, revision: u64, values: Option<Arc<BTreeMap<String, Value>>>) {
        let version = RowVersion { revision, values };
        let entry = self.rows.get_or_insert_with(key, || RwLock::new(Vec::new()));
        entry.value().write().push(version);
    }

    /// Values of the newest version at or below `snapshot`, unless the row
    /// was deleted or a later tombstone covers it.
    pub(crate) fn visible(
        key: &Value,
        versions: &[RowVersion],
        snapshot: u64,
        tombstones: &[(u64, Tombstone)],
    ) -> Option<Arc<BTreeMap<String, Value>>> {
        let version = versions.iter().rev().find(|v| v.revision <= snapshot)?;
        let values = version.values.as_ref()?;
        let hidden = tombstones
            .iter()
            .any(|(revision, t)| *revision > version.revision && *revision <= snapshot && t.matches(key));
        (!hidden).then(|| Arc::clone(values))
    }

    fn corrupt(&self, details: impl Into<String>) -> Error {
        Error::Corruption {
            object: format!("wal entry for table {}", self.name),
            details: details.into(),
        }
    }
}

/// Checks and converts one record: key, stored values and WAL form.
fn prepare_record(
    schema: &TableSchema,
    key_column: &str,
    record: Record,
) -> Result<(Value, Option<Arc<BTreeMap<String, Value>>>, WalRecord)> {
    let key_schema = schema.column(key_column).ok_or_else(|| Error::ColumnNotFound {
        column: key_column.to_string(),
    })?;
    let key = match record.values.get(key_column) {
        Some(v) if !v.is_null() => key_schema.column_type.coerce_key(v.clone())?,
        _ => {
            return Err(Error::SchemaValidation {
                message: format!("record has no value for key column {}", key_column),
            })
        }
    };

    if record.deleted {
        let wal_record = WalRecord {
            deleted: true,
            columns: vec![key_schema.column_type.to_wal(key_schema.index, &key)?],
        };
        return Ok((key, None, wal_record));
    }

    let mut values = BTreeMap::new();
    let mut columns = Vec::with_capacity(record.values.len());
    for (name, value) in record.values {
        let column = schema
            .column(&name)
            .ok_or_else(|| Error::ColumnNotFound { column: name.clone() })?;
        let value = coerce_column(&column.column_type, &name, value)?;
        if value.is_null() {
            continue;
        }
        columns.push(column.column_type.to_wal(column.index, &value)?);
        values.insert(name, value);
    }
    columns.sort_by_key(|c| c.index);

    Ok((
        key,
        Some(Arc::new(values)),
        WalRecord {
            deleted: false,
            columns,
        },
    ))
}

fn coerce_column(column_type: &ColumnType, name: &str, value: Value) -> Result<Value> {
    column_type.coerce(value).map_err(|e| match e {
        Error::TypeMismatch { message } => Error::TypeMismatch {
            message: format!("column {}: {}", name, message),
        },
        other => other,
    })
}
