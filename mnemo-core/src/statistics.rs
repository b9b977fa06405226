//! Schema inference from observed values.
//!
//! When a writer omits the schema, each column's type is inferred from the
//! values in the batch: the most frequent non-null kind wins, and ties go
//! to the kind declared first in [`TypeKind`].

use std::collections::BTreeMap;

use crate::column_type::{ColumnType, ScalarKind};
use crate::schema::{ColumnSchema, ColumnSchemaDesc, TableSchemaDesc};
use crate::value::{Record, TypeKind, Value};

#[derive(Debug, Clone, Default)]
pub struct ColumnStatistics {
    counts: BTreeMap<TypeKind, u64>,
    elements: Option<Box<ColumnStatistics>>,
    map_keys: Option<Box<ColumnStatistics>>,
    map_values: Option<Box<ColumnStatistics>>,
    attributes: BTreeMap<String, ColumnStatistics>,
    type_tag: Option<String>,
}

impl ColumnStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, value: &Value) {
        *self.counts.entry(value.kind()).or_insert(0) += 1;

        match value {
            Value::List(items) => {
                let elements = self.elements.get_or_insert_with(Default::default);
                for item in items {
                    elements.update(item);
                }
            }
            Value::Map(entries) => {
                let keys = self.map_keys.get_or_insert_with(Default::default);
                for key in entries.keys() {
                    keys.update(key);
                }
                let values = self.map_values.get_or_insert_with(Default::default);
                for value in entries.values() {
                    values.update(value);
                }
            }
            Value::Object {
                type_tag,
                attributes,
            } => {
                if self.type_tag.is_none() {
                    self.type_tag = Some(type_tag.clone());
                }
                for (name, value) in attributes {
                    self.attributes.entry(name.clone()).or_default().update(value);
                }
            }
            _ => {}
        }
    }

    pub fn count(&self, kind: TypeKind) -> u64 {
        self.counts.get(&kind).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    /// Most frequent non-null kind, `Unknown` if only nulls were seen.
    pub fn dominant_kind(&self) -> TypeKind {
        let mut best = (TypeKind::Unknown, 0);
        // BTreeMap iterates in declaration order, so strict > keeps the
        // earliest kind on ties.
        for (&kind, &count) in &self.counts {
            if kind != TypeKind::Unknown && count > best.1 {
                best = (kind, count);
            }
        }
        best.0
    }

    pub fn infer_type(&self) -> ColumnType {
        fn nested(stats: &Option<Box<ColumnStatistics>>) -> ColumnType {
            stats.as_ref().map_or(ColumnType::Unknown, |s| s.infer_type())
        }

        let kind = self.dominant_kind();
        if let Some(scalar) = ScalarKind::from_type_kind(kind) {
            return ColumnType::Scalar(scalar);
        }
        match kind {
            TypeKind::List => ColumnType::List(Box::new(nested(&self.elements))),
            TypeKind::Map => ColumnType::Map(
                Box::new(nested(&self.map_keys)),
                Box::new(nested(&self.map_values)),
            ),
            TypeKind::Object => ColumnType::Object {
                type_tag: self.type_tag.clone().unwrap_or_default(),
                attributes: self
                    .attributes
                    .iter()
                    .map(|(name, stats)| (name.clone(), stats.infer_type()))
                    .collect(),
            },
            _ => ColumnType::Unknown,
        }
    }

    pub fn create_schema(&self, name: impl Into<String>, index: u32) -> ColumnSchema {
        ColumnSchema {
            name: name.into(),
            index,
            column_type: self.infer_type(),
        }
    }
}

impl TableSchemaDesc {
    /// Builds a partial schema describing every column present in
    /// `records`.
    pub fn infer(key_column: impl Into<String>, records: &[Record]) -> TableSchemaDesc {
        let mut stats: BTreeMap<&str, ColumnStatistics> = BTreeMap::new();
        for record in records {
            for (name, value) in &record.values {
                stats.entry(name.as_str()).or_default().update(value);
            }
        }

        TableSchemaDesc {
            key_column: Some(key_column.into()),
            columns: stats
                .into_iter()
                .map(|(name, s)| ColumnSchemaDesc::new(name, s.infer_type()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_majority_kind_wins() {
        let mut stats = ColumnStatistics::new();
        for v in [Value::Int64(1), Value::Int64(2), Value::from("x"), Value::Null, Value::Null, Value::Null] {
            stats.update(&v);
        }
        assert_eq!(stats.count(TypeKind::Unknown), 3);
        assert_eq!(stats.total(), 6);
        assert_eq!(stats.infer_type(), ColumnType::INT64);
    }

    #[test]
    fn test_ties_break_by_declaration_order() {
        let mut stats = ColumnStatistics::new();
        stats.update(&Value::from("x"));
        stats.update(&Value::Int32(1));
        assert_eq!(stats.infer_type(), ColumnType::INT32);
    }

    #[test]
    fn test_only_nulls_is_unknown() {
        let mut stats = ColumnStatistics::new();
        stats.update(&Value::Null);
        let schema = stats.create_schema("c", 7);
        assert_eq!(schema.index, 7);
        assert_eq!(schema.column_type, ColumnType::Unknown);
    }

    #[test]
    fn test_nested_inference() {
        let mut stats = ColumnStatistics::new();
        stats.update(&Value::object(
            "pkg.Box",
            [
                ("w", Value::Float32(1.0)),
                ("labels", Value::List(vec![Value::from("cat")])),
                ("extra", Value::map([(Value::from("k"), Value::Bool(true))])),
            ],
        ));
        stats.update(&Value::object("pkg.Box", [("h", Value::Null)]));

        assert_eq!(
            stats.infer_type(),
            ColumnType::object(
                "pkg.Box",
                [
                    ("extra", ColumnType::map(ColumnType::STRING, ColumnType::BOOL)),
                    ("h", ColumnType::Unknown),
                    ("labels", ColumnType::list(ColumnType::STRING)),
                    ("w", ColumnType::FLOAT32),
                ]
            )
        );
    }

    #[test]
    fn test_infer_table_schema() {
        let records = vec![
            Record::new().with("id", "a").with("n", 1i64),
            Record::new().with("id", "b").with("n", Value::Null).with("ok", true),
        ];
        let desc = TableSchemaDesc::infer("id", &records);
        assert_eq!(desc.key_column.as_deref(), Some("id"));
        assert_eq!(
            desc.columns,
            vec![
                ColumnSchemaDesc::new("id", ColumnType::STRING),
                ColumnSchemaDesc::new("n", ColumnType::INT64),
                ColumnSchemaDesc::new("ok", ColumnType::BOOL),
            ]
        );
    }
}
