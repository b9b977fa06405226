//! # DataStore
//!
//! Entry point of the engine: a registry of [`MemoryTable`]s sharing one
//! WAL, plus the merge-scan that reads several tables as one key-ordered
//! stream.
//!
//! ## Merge-Scan
//!
//! ```text
//!   table A   k1{x:1} ─────────── k3{x:3}
//!   table B   ─────── k2{y:2} ─── k3{y:30}
//!                │        │          │
//!                ▼        ▼          ▼
//!   output    k1{x:1}  k2{y:2}   k3{x:3, y:30}     last_key = k3
//! ```
//!
//! Every table contributes a [`TableScanIterator`]. Each step takes the
//! smallest current key, merges the rows of every iterator positioned on
//! it, and advances those iterators.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value as Json;
use tracing::{debug, info};

use mnemo_core::config::Config;
use mnemo_core::error::{Error, Result};
use mnemo_core::metrics::{Metrics, Timer};
use mnemo_core::{ColumnType, Record, TableSchema, TableSchemaDesc, Value};

use crate::buffer::{BufferManager, HeapBufferManager};
use crate::memtable::{
    Checkpoint, MemoryTable, QueryRequest, RecordList, ScanRequest, ScanRow, TableScanIterator,
    Tombstone,
};
use crate::object_store::{ObjectStore, StorageAccess};
use crate::wal::{SegmentInfo, WalManager, WalSink};

/// A record in wire form: column name to hex (or base64) encoding.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EncodedRecord {
    pub values: BTreeMap<String, Json>,
    pub deleted: bool,
}

/// One table taking part in a merge-scan.
#[derive(Debug, Clone, PartialEq)]
pub struct TableScan {
    pub table_name: String,
    /// Output alias to column name. `None` returns every column.
    pub columns: Option<BTreeMap<String, String>>,
    /// Emit this table's null columns.
    pub keep_none: bool,
}

impl TableScan {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            columns: None,
            keep_none: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeScanRequest {
    pub tables: Vec<TableScan>,
    pub start: Option<Value>,
    pub start_inclusive: bool,
    pub end: Option<Value>,
    pub end_inclusive: bool,
    pub limit: Option<usize>,
    /// Keep null columns in merged rows. When false they are stripped
    /// whatever the per-table setting.
    pub keep_none: bool,
    pub raw_result: bool,
}

impl Default for MergeScanRequest {
    fn default() -> Self {
        Self {
            tables: Vec::new(),
            start: None,
            start_inclusive: true,
            end: None,
            end_inclusive: true,
            limit: None,
            keep_none: false,
            raw_result: false,
        }
    }
}

struct Cursor {
    iter: TableScanIterator,
    current: ScanRow,
    key_type: ColumnType,
    column_types: BTreeMap<String, ColumnType>,
}

pub struct DataStore {
    config: Config,
    tables: DashMap<String, Arc<MemoryTable>>,
    store: Arc<ObjectStore>,
    wal: Arc<WalManager>,
    metrics: Metrics,
}

impl DataStore {
    /// Opens the store and rebuilds every table from the WAL. Any replay
    /// error aborts the open.
    pub async fn open(config: Config, storage: Arc<dyn StorageAccess>) -> Result<Self> {
        config.validate()?;

        let buffers: Arc<dyn BufferManager> =
            Arc::new(HeapBufferManager::new(config.storage.buffer_pool_bytes));
        let store = Arc::new(ObjectStore::new(storage, buffers));
        let metrics = Metrics::new();
        let wal = Arc::new(
            WalManager::open(config.wal.clone(), Arc::clone(&store), metrics.clone()).await?,
        );

        let data_store = Self {
            config,
            tables: DashMap::new(),
            store,
            wal,
            metrics,
        };
        if let Err(e) = data_store.replay() {
            data_store.wal.terminate().await?;
            return Err(e);
        }
        Ok(data_store)
    }

    fn replay(&self) -> Result<()> {
        let timer = Timer::start("wal_replay");
        let mut entries = 0u64;
        for entry in self.wal.read_all()? {
            let entry = entry?;
            self.get_or_create(&entry.table_name)
                .apply_wal_entry(&entry)?;
            entries += 1;
        }
        self.metrics.record_replay(entries);
        let elapsed = timer.stop();
        info!(
            entries,
            tables = self.tables.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "WAL replay complete"
        );
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    fn get_or_create(&self, name: &str) -> Arc<MemoryTable> {
        if let Some(table) = self.tables.get(name) {
            return Arc::clone(table.value());
        }
        let entry = self.tables.entry(name.to_string()).or_insert_with(|| {
            info!(table = %name, "Creating table");
            let wal: Arc<dyn WalSink> = self.wal.clone();
            Arc::new(MemoryTable::new(name, Some(wal), self.metrics.clone()))
        });
        Arc::clone(entry.value())
    }

    pub fn table(&self, name: &str) -> Result<Arc<MemoryTable>> {
        self.tables
            .get(name)
            .map(|t| Arc::clone(t.value()))
            .ok_or_else(|| Error::TableNotFound {
                table: name.to_string(),
            })
    }

    /// Table names starting with `prefix`, sorted.
    pub fn list_tables(&self, prefix: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .tables
            .iter()
            .filter(|t| t.key().starts_with(prefix))
            .map(|t| t.key().clone())
            .collect();
        names.sort();
        names
    }

    pub fn table_schema(&self, name: &str) -> Result<Arc<TableSchema>> {
        Ok(self.table(name)?.schema())
    }

    /// Applies a batch to a table, creating the table on first use.
    pub fn update(
        &self,
        table_name: &str,
        schema: Option<&TableSchemaDesc>,
        records: Vec<Record>,
    ) -> Result<u64> {
        validate_table_name(table_name)?;
        let table = self.get_or_create(table_name);
        let result = table.update(schema, records);
        drop(table);

        if result.is_err() {
            // A table whose first update failed never existed.
            self.tables.remove_if(table_name, |_, t| {
                Arc::strong_count(t) == 1 && t.revision() == 0 && t.schema().is_empty()
            });
        }
        result
    }

    /// Like [`update`](Self::update), with values in wire form. Values are
    /// decoded with the table schema merged with `schema`.
    pub fn update_encoded(
        &self,
        table_name: &str,
        schema: Option<&TableSchemaDesc>,
        records: Vec<EncodedRecord>,
    ) -> Result<u64> {
        let mut merged = match self.tables.get(table_name) {
            Some(t) => (*t.value().schema()).clone(),
            None => TableSchema::new(),
        };
        if let Some(desc) = schema {
            merged.merge(desc)?;
        }

        let records = records
            .into_iter()
            .map(|encoded| {
                let mut record = Record::new();
                record.deleted = encoded.deleted;
                for (name, wire) in encoded.values {
                    let column = merged
                        .column(&name)
                        .ok_or_else(|| Error::ColumnNotFound { column: name.clone() })?;
                    let value = column.column_type.decode(&wire)?;
                    record.values.insert(name, value);
                }
                Ok(record)
            })
            .collect::<Result<Vec<_>>>()?;

        self.update(table_name, schema, records)
    }

    pub fn delete_range(&self, table_name: &str, tombstone: Tombstone) -> Result<u64> {
        self.table(table_name)?.delete_range(tombstone)
    }

    pub fn query(&self, table_name: &str, request: &QueryRequest) -> Result<RecordList> {
        self.table(table_name)?.query(request)
    }

    /// Scans several tables as one key-ordered stream. Rows sharing a key
    /// are merged into one record.
    pub fn scan(&self, request: &MergeScanRequest) -> Result<RecordList> {
        let timer = Timer::start("merge_scan");
        let mut cursors = Vec::with_capacity(request.tables.len());
        let mut column_types = BTreeMap::new();
        let mut key_type: Option<ColumnType> = None;

        for table_scan in &request.tables {
            let table = self.table(&table_scan.table_name)?;
            let scan_request = ScanRequest {
                columns: table_scan.columns.clone(),
                start: request.start.clone(),
                start_inclusive: request.start_inclusive,
                end: request.end.clone(),
                end_inclusive: request.end_inclusive,
                keep_none: table_scan.keep_none,
                revision: None,
            };
            let mut iter = table.scan(&scan_request)?;
            let types = iter.column_types();
            column_types.extend(types.clone());

            let Some(table_key) = iter.key_type().cloned() else {
                continue;
            };
            match &key_type {
                Some(k) if !k.is_comparable_with(&table_key) => {
                    return Err(Error::InvalidQuery {
                        message: format!(
                            "key type {} of table {} is not comparable with {}",
                            table_key, table_scan.table_name, k
                        ),
                    })
                }
                Some(_) => {}
                None => key_type = Some(table_key.clone()),
            }

            if let Some(current) = iter.next().transpose()? {
                cursors.push(Cursor {
                    iter,
                    current,
                    key_type: table_key,
                    column_types: types,
                });
            }
        }

        let limit = request.limit.unwrap_or(usize::MAX);
        let mut records = Vec::new();
        let mut last_key = None;

        while !cursors.is_empty() && records.len() < limit {
            let Some(min) = cursors.iter().map(|c| &c.current.key).min().cloned() else {
                break;
            };

            let mut merged = BTreeMap::new();
            let mut key_json = None;
            let mut i = 0;
            while i < cursors.len() {
                if cursors[i].current.key != min {
                    i += 1;
                    continue;
                }
                let cursor = &mut cursors[i];
                for (alias, value) in &cursor.current.values {
                    let column_type = cursor.column_types.get(alias).ok_or_else(|| Error::Internal {
                        message: format!("projected column {} has no type", alias),
                    })?;
                    merged.insert(alias.clone(), column_type.encode(value, request.raw_result)?);
                }
                if key_json.is_none() {
                    key_json = Some(cursor.key_type.encode(&min, request.raw_result)?);
                }
                match cursor.iter.next().transpose()? {
                    Some(row) => {
                        cursor.current = row;
                        i += 1;
                    }
                    None => {
                        cursors.remove(i);
                    }
                }
            }

            if !request.keep_none {
                merged.retain(|_, v| !v.is_null());
            }
            records.push(merged);
            last_key = key_json;
        }

        debug!(
            tables = request.tables.len(),
            rows = records.len(),
            "Merge-scan complete"
        );
        timer.stop();
        Ok(RecordList {
            column_types,
            records,
            last_key,
        })
    }

    pub fn create_checkpoint(&self, table_name: &str, user_data: Option<String>) -> Result<Checkpoint> {
        self.table(table_name)?.create_checkpoint(user_data)
    }

    pub fn list_checkpoints(&self, table_name: &str) -> Result<Vec<Checkpoint>> {
        Ok(self.table(table_name)?.checkpoints())
    }

    pub fn delete_checkpoint(&self, table_name: &str, revision: u64) -> Result<()> {
        self.table(table_name)?.delete_checkpoint(revision)
    }

    /// Describes the stored WAL segments.
    pub fn segments(&self) -> Result<Vec<SegmentInfo>> {
        WalManager::inspect(&self.store, &self.config.wal)
    }

    /// Waits until everything logged so far is durable.
    pub async fn flush(&self) -> Result<()> {
        self.wal.flush().await
    }

    /// Flushes the WAL and stops its worker. Later writes fail with
    /// [`Error::WalTerminated`].
    pub async fn terminate(&self) -> Result<()> {
        self.wal.terminate().await
    }
}

/// Table names follow the column name rules, plus `.`.
fn validate_table_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '/' | '-' | '.'));
    if !valid {
        return Err(Error::InvalidName {
            name: name.to_string(),
            reason: "table names must match [A-Za-z0-9_/.-]+".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_names() {
        validate_table_name("models/v1.2-final").unwrap();
        assert!(validate_table_name("").is_err());
        assert!(validate_table_name("has space").is_err());
    }
}
