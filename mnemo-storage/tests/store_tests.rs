//! # DataStore Integration Tests
//!
//! End-to-end behavior of the facade:
//! - Table creation, schema inference and validation failures
//! - Tombstones and checkpoints
//! - Query paging and the multi-table merge-scan
//! - Crash recovery through WAL replay

use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;

use mnemo_core::config::Config;
use mnemo_core::error::Error;
use mnemo_core::{ColumnType, Record, TableSchemaDesc, Value};
use mnemo_storage::{
    CompareOp, DataStore, EncodedRecord, Filter, FsStorage, MemoryStorage, MergeScanRequest,
    OrderBy, QueryRequest, StorageAccess, TableScan, Tombstone,
};

fn test_config() -> Config {
    let mut config = Config::default();
    config.wal.max_segment_size = 64 * 1024;
    config.wal.flush_threshold = 16 * 1024;
    config.wal.idle_wait_ms = 5;
    config.wal.initial_backoff_ms = 1;
    config.wal.max_backoff_ms = 4;
    config.storage.buffer_pool_bytes = 1 << 20;
    config
}

fn keyed(key_type: ColumnType) -> TableSchemaDesc {
    TableSchemaDesc::new("key").column("key", key_type)
}

async fn open(storage: Arc<dyn StorageAccess>) -> DataStore {
    DataStore::open(test_config(), storage).await.unwrap()
}

#[tokio::test]
async fn test_merge_scan_across_tables() {
    let store = open(Arc::new(MemoryStorage::new())).await;
    let schema_a = keyed(ColumnType::STRING).column("x", ColumnType::INT32);
    let schema_b = keyed(ColumnType::STRING).column("y", ColumnType::INT32);

    store
        .update(
            "A",
            Some(&schema_a),
            vec![
                Record::new().with("key", "k1").with("x", 1),
                Record::new().with("key", "k3").with("x", 3),
            ],
        )
        .unwrap();
    store
        .update(
            "B",
            Some(&schema_b),
            vec![
                Record::new().with("key", "k2").with("y", 2),
                Record::new().with("key", "k3").with("y", 30),
            ],
        )
        .unwrap();

    let mut table_a = TableScan::new("A");
    table_a.columns = Some([("x".to_string(), "x".to_string())].into_iter().collect());
    let mut table_b = TableScan::new("B");
    table_b.columns = Some([("y".to_string(), "y".to_string())].into_iter().collect());

    let result = store
        .scan(&MergeScanRequest {
            tables: vec![table_a, table_b],
            raw_result: true,
            ..MergeScanRequest::default()
        })
        .unwrap();

    let rows: Vec<_> = result.records.iter().map(|r| json!(r)).collect();
    assert_eq!(
        rows,
        vec![
            json!({"x": "1"}),
            json!({"y": "2"}),
            json!({"x": "3", "y": "30"}),
        ]
    );
    assert_eq!(result.last_key, Some(json!("k3")));
    assert_eq!(result.column_types["x"], ColumnType::INT32);
    assert_eq!(result.column_types["y"], ColumnType::INT32);

    // Hex encodings when raw_result is off
    let hex = store
        .scan(&MergeScanRequest {
            tables: vec![TableScan::new("A")],
            limit: Some(1),
            ..MergeScanRequest::default()
        })
        .unwrap();
    assert_eq!(hex.records.len(), 1);
    assert_eq!(hex.records[0]["x"], json!("00000001"));
    assert_eq!(hex.last_key, Some(json!("k1")));

    store.terminate().await.unwrap();
}

#[tokio::test]
async fn test_merge_scan_keep_none_and_bounds() {
    let store = open(Arc::new(MemoryStorage::new())).await;
    let schema = keyed(ColumnType::INT64)
        .column("a", ColumnType::STRING)
        .column("b", ColumnType::STRING);
    store
        .update(
            "t",
            Some(&schema),
            (0..10i64)
                .map(|k| Record::new().with("key", k).with("a", format!("a{}", k)))
                .collect(),
        )
        .unwrap();

    let mut table = TableScan::new("t");
    table.keep_none = true;
    let request = MergeScanRequest {
        tables: vec![table],
        start: Some(Value::Int64(3)),
        start_inclusive: false,
        end: Some(Value::Int64(6)),
        end_inclusive: true,
        keep_none: true,
        raw_result: true,
        ..MergeScanRequest::default()
    };
    let result = store.scan(&request).unwrap();
    let keys: Vec<_> = result.records.iter().map(|r| r["key"].clone()).collect();
    assert_eq!(keys, vec![json!("4"), json!("5"), json!("6")]);
    assert_eq!(result.records[0]["b"], serde_json::Value::Null);

    let stripped = store
        .scan(&MergeScanRequest {
            keep_none: false,
            ..request
        })
        .unwrap();
    assert!(stripped.records.iter().all(|r| !r.contains_key("b")));

    store.terminate().await.unwrap();
}

#[tokio::test]
async fn test_merge_scan_rejects_incomparable_keys() {
    let store = open(Arc::new(MemoryStorage::new())).await;
    store
        .update("s", Some(&keyed(ColumnType::STRING)), vec![Record::new().with("key", "a")])
        .unwrap();
    store
        .update("i", Some(&keyed(ColumnType::INT64)), vec![Record::new().with("key", 1i64)])
        .unwrap();

    let err = store
        .scan(&MergeScanRequest {
            tables: vec![TableScan::new("s"), TableScan::new("i")],
            ..MergeScanRequest::default()
        })
        .unwrap_err();
    assert!(matches!(err, Error::InvalidQuery { .. }));
    store.terminate().await.unwrap();
}

#[tokio::test]
async fn test_query_paging() {
    let store = open(Arc::new(MemoryStorage::new())).await;
    let schema = keyed(ColumnType::STRING).column("rank", ColumnType::INT32);
    let records = (0..5)
        .map(|i| Record::new().with("key", format!("r{}", i)).with("rank", 10 - i))
        .collect();
    store.update("ranked", Some(&schema), records).unwrap();

    let result = store
        .query(
            "ranked",
            &QueryRequest::new()
                .order_by(OrderBy::asc("rank"))
                .start(1)
                .limit(2)
                .raw_result(true),
        )
        .unwrap();
    let keys: Vec<_> = result.records.iter().map(|r| r["key"].clone()).collect();
    assert_eq!(keys, vec![json!("r3"), json!("r2")]);
    assert_eq!(result.last_key, Some(json!("r2")));

    let filtered = store
        .query(
            "ranked",
            &QueryRequest::new()
                .columns([("k", "key")])
                .filter(Filter::column("rank", CompareOp::Le, 7))
                .raw_result(true),
        )
        .unwrap();
    assert_eq!(filtered.records, vec![
        [("k".to_string(), json!("r3"))].into_iter().collect(),
        [("k".to_string(), json!("r4"))].into_iter().collect(),
    ]);

    store.terminate().await.unwrap();
}

#[tokio::test]
async fn test_unknown_tables_and_failed_first_update() {
    let store = open(Arc::new(MemoryStorage::new())).await;

    assert!(matches!(
        store.query("missing", &QueryRequest::new()),
        Err(Error::TableNotFound { .. })
    ));
    assert!(matches!(
        store.delete_range("missing", Tombstone::all()),
        Err(Error::TableNotFound { .. })
    ));

    // No key column declared: the table must not be left behind
    let err = store
        .update("orphan", None, vec![Record::new().with("key", "a")])
        .unwrap_err();
    assert!(err.is_validation());
    assert!(store.list_tables("").is_empty());

    assert!(matches!(
        store.update("bad name", Some(&keyed(ColumnType::STRING)), vec![]),
        Err(Error::InvalidName { .. })
    ));

    store.terminate().await.unwrap();
}

#[tokio::test]
async fn test_schema_inference_and_conflicts() {
    let store = open(Arc::new(MemoryStorage::new())).await;
    let schema = keyed(ColumnType::STRING).column("notes", ColumnType::Unknown);
    store
        .update("m", Some(&schema), vec![Record::new().with("key", "a")])
        .unwrap();
    assert!(store.table_schema("m").unwrap().column("notes").unwrap().column_type.is_unknown());

    store
        .update("m", None, vec![Record::new().with("key", "b").with("notes", "fine-tuned")])
        .unwrap();
    assert_eq!(
        store.table_schema("m").unwrap().column("notes").unwrap().column_type,
        ColumnType::STRING
    );

    let err = store
        .update("m", None, vec![Record::new().with("key", "c").with("notes", 5i64)])
        .unwrap_err();
    assert!(matches!(err, Error::TypeMismatch { .. }));
    assert_eq!(store.table("m").unwrap().row_count(None).unwrap(), 2);

    store.terminate().await.unwrap();
}

#[tokio::test]
async fn test_virtual_columns_follow_objects_only() {
    let store = open(Arc::new(MemoryStorage::new())).await;
    let schema = keyed(ColumnType::STRING)
        .column("items", ColumnType::list(ColumnType::INT32))
        .column("meta", ColumnType::object("Meta", [("owner", ColumnType::STRING)]));
    let record = || {
        Record::new()
            .with("key", "a")
            .with("items", Value::List(vec![Value::Int32(7)]))
            .with("meta", Value::object("Meta", [("owner", Value::from("ada"))]))
    };

    let through_list = schema.clone().column(
        "first",
        ColumnType::virtual_column("first", "items.0", ColumnType::INT32),
    );
    let err = store.update("assets", Some(&through_list), vec![record()]).unwrap_err();
    assert!(matches!(err, Error::SchemaValidation { .. }));
    assert!(store.list_tables("").is_empty());

    let missing = schema.clone().column(
        "first",
        ColumnType::virtual_column("first", "nothing.0", ColumnType::INT32),
    );
    assert!(store.update("assets", Some(&missing), vec![record()]).is_err());

    let owner = schema.column(
        "owner",
        ColumnType::virtual_column("owner", "meta.owner", ColumnType::STRING),
    );
    store.update("assets", Some(&owner), vec![record()]).unwrap();
    let result = store
        .query(
            "assets",
            &QueryRequest::new()
                .columns([("who", "owner")])
                .filter(Filter::column("owner", CompareOp::Eq, "ada"))
                .raw_result(true),
        )
        .unwrap();
    assert_eq!(result.records, vec![[("who".to_string(), json!("ada"))].into_iter().collect()]);

    store.terminate().await.unwrap();
}

// INT32 and FLOAT32 columns accept each other's values. The stored value
// keeps its own variant, which makes the hex wire form of such a cell
// carry the other type's bits.
#[tokio::test]
async fn test_int32_float32_cross_writes() {
    let storage = Arc::new(MemoryStorage::new());
    let schema = keyed(ColumnType::STRING).column("score", ColumnType::INT32);
    {
        let store = open(storage.clone()).await;
        store
            .update(
                "scores",
                Some(&schema),
                vec![
                    Record::new().with("key", "a").with("score", 2),
                    Record::new().with("key", "b").with("score", 1.5f32),
                ],
            )
            .unwrap();
        let err = store
            .update("scores", None, vec![Record::new().with("key", "c").with("score", 1i64)])
            .unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { .. }));
        store.terminate().await.unwrap();
    }

    let store = open(storage).await;
    let result = store
        .query(
            "scores",
            &QueryRequest::new()
                .filter(Filter::column("score", CompareOp::Lt, 2))
                .raw_result(true),
        )
        .unwrap();
    assert_eq!(result.records.len(), 1);
    assert_eq!(result.records[0]["score"], json!("1.5"));
    assert_eq!(
        store.table_schema("scores").unwrap().column("score").unwrap().column_type,
        ColumnType::INT32
    );

    store.terminate().await.unwrap();
}

#[tokio::test]
async fn test_update_encoded_decodes_with_schema() {
    let store = open(Arc::new(MemoryStorage::new())).await;
    let schema = keyed(ColumnType::INT32).column("weight", ColumnType::FLOAT64);

    let record = EncodedRecord {
        values: [
            ("key".to_string(), json!("0000002a")),
            ("weight".to_string(), json!(format!("{:016x}", 0.5f64.to_bits()))),
        ]
        .into_iter()
        .collect(),
        deleted: false,
    };
    store.update_encoded("w", Some(&schema), vec![record]).unwrap();

    let result = store
        .query("w", &QueryRequest::new().raw_result(true))
        .unwrap();
    assert_eq!(result.records[0]["key"], json!("42"));
    assert_eq!(result.records[0]["weight"], json!("0.5"));

    let malformed = EncodedRecord {
        values: [("key".to_string(), json!("zz"))].into_iter().collect(),
        deleted: false,
    };
    let err = store.update_encoded("w", None, vec![malformed]).unwrap_err();
    match err {
        Error::InvalidValue { value, type_name, .. } => {
            assert!(value.contains("zz"));
            assert_eq!(type_name, "INT32");
        }
        other => panic!("unexpected error {:?}", other),
    }

    store.terminate().await.unwrap();
}

#[tokio::test]
async fn test_tombstones_through_the_facade() {
    let store = open(Arc::new(MemoryStorage::new())).await;
    store
        .update(
            "paths",
            Some(&keyed(ColumnType::STRING)),
            ["a/b", "a/c", "b/a"].iter().map(|k| Record::new().with("key", *k)).collect(),
        )
        .unwrap();
    store.delete_range("paths", Tombstone::prefix("a/")).unwrap();

    let result = store
        .query("paths", &QueryRequest::new().raw_result(true))
        .unwrap();
    assert_eq!(result.records.len(), 1);
    assert_eq!(result.records[0]["key"], json!("b/a"));

    store
        .update("nums", Some(&keyed(ColumnType::INT64)), (0..12i64).map(|k| Record::new().with("key", k)).collect())
        .unwrap();
    store
        .delete_range(
            "nums",
            Tombstone::range(Some(Value::Int64(5)), Some(Value::Int64(10)), true, false),
        )
        .unwrap();
    let keys: Vec<_> = store
        .query("nums", &QueryRequest::new().raw_result(true))
        .unwrap()
        .records
        .into_iter()
        .map(|r| r["key"].clone())
        .collect();
    assert_eq!(
        keys,
        ["0", "1", "2", "3", "4", "10", "11"].iter().map(|k| json!(k)).collect::<Vec<_>>()
    );

    store.terminate().await.unwrap();
}

#[tokio::test]
async fn test_checkpoints_through_the_facade() {
    let store = open(Arc::new(MemoryStorage::new())).await;
    store
        .update("c", Some(&keyed(ColumnType::STRING)), vec![Record::new().with("key", "a")])
        .unwrap();
    let checkpoint = store.create_checkpoint("c", Some("release".to_string())).unwrap();
    assert!(matches!(
        store.create_checkpoint("c", None),
        Err(Error::Checkpoint { .. })
    ));

    let list = store.list_checkpoints("c").unwrap();
    assert_eq!(list.len(), 3);
    assert_eq!(list[1], checkpoint);

    store.delete_checkpoint("c", checkpoint.revision).unwrap();
    assert_eq!(store.list_checkpoints("c").unwrap().len(), 2);
    store.terminate().await.unwrap();
}

#[tokio::test]
async fn test_crash_recovery_replays_everything() {
    let temp_dir = TempDir::new().unwrap();
    let expected = {
        let store = open(Arc::new(FsStorage::open(temp_dir.path()).unwrap())).await;
        let schema = keyed(ColumnType::STRING).column("size", ColumnType::INT64);
        for batch in 0..5i64 {
            let records = (0..20i64)
                .map(|i| {
                    Record::new()
                        .with("key", format!("m{:03}", batch * 20 + i))
                        .with("size", i)
                })
                .collect();
            store.update("models", Some(&schema), records).unwrap();
        }
        store.delete_range("models", Tombstone::prefix("m00")).unwrap();
        store.create_checkpoint("models", Some("before-tags".to_string())).unwrap();
        store
            .update("models", None, vec![Record::new().with("key", "m050").with("tag", "best")])
            .unwrap();
        store
            .update("other", Some(&keyed(ColumnType::INT32)), vec![Record::new().with("key", 1)])
            .unwrap();

        let snapshot = store.query("models", &QueryRequest::new()).unwrap();
        store.terminate().await.unwrap();
        snapshot
    };

    let store = open(Arc::new(FsStorage::open(temp_dir.path()).unwrap())).await;
    assert_eq!(store.list_tables(""), vec!["models".to_string(), "other".to_string()]);
    assert_eq!(store.list_tables("mod"), vec!["models".to_string()]);
    assert_eq!(store.query("models", &QueryRequest::new()).unwrap(), expected);
    assert_eq!(store.list_checkpoints("models").unwrap().len(), 3);
    assert_eq!(store.table("models").unwrap().revision(), 7);
    assert!(store.metrics().snapshot().replayed_entries >= 9);

    // The recovered store keeps logging
    store
        .update("models", None, vec![Record::new().with("key", "m999").with("size", 1i64)])
        .unwrap();
    store.terminate().await.unwrap();

    let store = open(Arc::new(FsStorage::open(temp_dir.path()).unwrap())).await;
    assert_eq!(store.table("models").unwrap().row_count(None).unwrap(), 91);
    assert!(!store.segments().unwrap().is_empty());
    store.terminate().await.unwrap();
}

#[tokio::test]
async fn test_corrupt_log_prevents_open() {
    let storage = Arc::new(MemoryStorage::new());
    storage.insert_raw("wal.log.0", &b"not a wal segment"[..]);

    let result = DataStore::open(test_config(), storage).await;
    assert!(matches!(result, Err(Error::Corruption { .. })));
}
