//! Point-in-time queries over one table.
//!
//! A query selects the rows visible at one revision, keeps those matching
//! the filter tree, sorts them (key order unless `order_by` says
//! otherwise), then pages with `start`/`limit`.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde_json::{json, Value as Json};

use mnemo_core::error::{Error, Result};
use mnemo_core::{ColumnStatistics, ColumnType, TableSchema, Value};

static NULL: Value = Value::Null;

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Column(String),
    Constant(Value),
}

impl Operand {
    pub fn column(name: impl Into<String>) -> Self {
        Operand::Column(name.into())
    }

    pub fn constant(value: impl Into<Value>) -> Self {
        Operand::Constant(value.into())
    }

    fn column_type(&self, schema: &TableSchema) -> Result<ColumnType> {
        match self {
            Operand::Column(name) => schema
                .column(name)
                .map(|c| c.column_type.clone())
                .ok_or_else(|| Error::ColumnNotFound {
                    column: name.clone(),
                }),
            Operand::Constant(value) => {
                let mut stats = ColumnStatistics::new();
                stats.update(value);
                Ok(stats.infer_type())
            }
        }
    }

    fn value<'a>(&'a self, row: &RowView<'a>) -> Result<&'a Value> {
        match self {
            Operand::Column(name) => Ok(row.get(name)?.unwrap_or(&NULL)),
            Operand::Constant(value) => Ok(value),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    fn holds(self, ordering: Ordering) -> bool {
        match self {
            CompareOp::Eq => ordering == Ordering::Equal,
            CompareOp::Ne => ordering != Ordering::Equal,
            CompareOp::Lt => ordering == Ordering::Less,
            CompareOp::Le => ordering != Ordering::Greater,
            CompareOp::Gt => ordering == Ordering::Greater,
            CompareOp::Ge => ordering != Ordering::Less,
        }
    }
}

/// Predicate tree evaluated per row.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Compare {
        op: CompareOp,
        left: Operand,
        right: Operand,
    },
}

impl Filter {
    pub fn compare(op: CompareOp, left: Operand, right: Operand) -> Self {
        Filter::Compare { op, left, right }
    }

    /// `column <op> constant`.
    pub fn column(name: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        Filter::compare(op, Operand::column(name), Operand::constant(value))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(filter: Filter) -> Self {
        Filter::Not(Box::new(filter))
    }

    /// Rejects unknown columns and comparisons between incompatible types.
    pub(crate) fn check(&self, schema: &TableSchema) -> Result<()> {
        match self {
            Filter::And(filters) | Filter::Or(filters) => {
                filters.iter().try_for_each(|f| f.check(schema))
            }
            Filter::Not(filter) => filter.check(schema),
            Filter::Compare { left, right, .. } => {
                let lt = left.column_type(schema)?;
                let rt = right.column_type(schema)?;
                if !lt.is_comparable_with(&rt) {
                    return Err(Error::InvalidQuery {
                        message: format!("cannot compare {} with {}", lt, rt),
                    });
                }
                Ok(())
            }
        }
    }

    pub(crate) fn evaluate(&self, row: &RowView<'_>) -> Result<bool> {
        match self {
            Filter::And(filters) => {
                for f in filters {
                    if !f.evaluate(row)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Filter::Or(filters) => {
                for f in filters {
                    if f.evaluate(row)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Filter::Not(filter) => Ok(!filter.evaluate(row)?),
            Filter::Compare { op, left, right } => {
                let (a, b) = (left.value(row)?, right.value(row)?);
                let holds = match (a.is_null(), b.is_null()) {
                    (false, false) => op.holds(a.cmp_by_value(b)),
                    // null only equals null
                    (an, bn) => match op {
                        CompareOp::Eq => an && bn,
                        CompareOp::Ne => !(an && bn),
                        _ => false,
                    },
                };
                Ok(holds)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub column: String,
    pub descending: bool,
}

impl OrderBy {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: false,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryRequest {
    /// Output alias to column name. `None` returns every column.
    pub columns: Option<BTreeMap<String, String>>,
    pub filter: Option<Filter>,
    pub order_by: Vec<OrderBy>,
    pub start: usize,
    pub limit: Option<usize>,
    /// Emit null columns instead of dropping them.
    pub keep_none: bool,
    /// Human-readable encodings instead of hex.
    pub raw_result: bool,
    /// Revision to read. `None` reads the current revision.
    pub revision: Option<u64>,
}

impl QueryRequest {
    pub fn new() -> Self {
        Self::default()
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

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }

    pub fn start(mut self, start: usize) -> Self {
        self.start = start;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn keep_none(mut self, keep_none: bool) -> Self {
        self.keep_none = keep_none;
        self
    }

    pub fn raw_result(mut self, raw: bool) -> Self {
        self.raw_result = raw;
        self
    }

    pub fn at_revision(mut self, revision: u64) -> Self {
        self.revision = Some(revision);
        self
    }

    pub(crate) fn check(&self, schema: &TableSchema) -> Result<()> {
        if let Some(filter) = &self.filter {
            filter.check(schema)?;
        }
        for order in &self.order_by {
            if schema.column(&order.column).is_none() {
                return Err(Error::ColumnNotFound {
                    column: order.column.clone(),
                });
            }
        }
        Ok(())
    }

    /// Orders rows by `order_by`. The sort is stable, so rows that tie on
    /// every sort column keep key order.
    pub(crate) fn sort<'a>(&self, rows: &mut Vec<RowView<'a>>) -> Result<()> {
        if self.order_by.is_empty() {
            return Ok(());
        }
        let mut keyed = rows
            .drain(..)
            .map(|row| {
                let keys = self
                    .order_by
                    .iter()
                    .map(|order| Ok(row.get(&order.column)?.unwrap_or(&NULL)))
                    .collect::<Result<Vec<&'a Value>>>()?;
                Ok((keys, row))
            })
            .collect::<Result<Vec<_>>>()?;
        keyed.sort_by(|(a, _), (b, _)| {
            for (order, (av, bv)) in self.order_by.iter().zip(a.iter().zip(b)) {
                let ordering = av.cmp_by_value(bv);
                let ordering = if order.descending {
                    ordering.reverse()
                } else {
                    ordering
                };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        });
        rows.extend(keyed.into_iter().map(|(_, row)| row));
        Ok(())
    }
}

/// Wire-encoded result of a query or scan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordList {
    pub column_types: BTreeMap<String, ColumnType>,
    /// Output alias to wire encoding, one map per row.
    pub records: Vec<BTreeMap<String, Json>>,
    /// Wire encoding of the last emitted row's key.
    pub last_key: Option<Json>,
}

impl RecordList {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn to_json(&self) -> Json {
        let column_types: serde_json::Map<String, Json> = self
            .column_types
            .iter()
            .map(|(alias, t)| (alias.clone(), Json::String(t.to_string())))
            .collect();
        json!({
            "column_types": column_types,
            "records": self.records,
            "last_key": self.last_key,
        })
    }
}

/// Read access to one stored row, resolving virtual columns.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RowView<'a> {
    pub key: &'a Value,
    schema: &'a TableSchema,
    values: &'a BTreeMap<String, Value>,
}

impl<'a> RowView<'a> {
    pub(crate) fn new(
        key: &'a Value,
        schema: &'a TableSchema,
        values: &'a BTreeMap<String, Value>,
    ) -> Self {
        Self {
            key,
            schema,
            values,
        }
    }

    /// Value of a stored or virtual column. A virtual column's path that
    /// meets a list, map or scalar is an error.
    pub(crate) fn get(&self, column: &str) -> Result<Option<&'a Value>> {
        match self.schema.column(column).map(|c| &c.column_type) {
            Some(ColumnType::Virtual { source_path, .. }) => {
                let mut segments = source_path.split('.');
                match segments.next().and_then(|head| self.values.get(head)) {
                    Some(value) => value.resolve_path(segments),
                    None => Ok(None),
                }
            }
            _ => Ok(self.values.get(column)),
        }
    }
}

/// Output columns of a query or scan: alias, source column and the type
/// used to encode it.
#[derive(Debug, Clone)]
pub(crate) struct Projection {
    columns: Vec<(String, String, ColumnType)>,
}

impl Projection {
    pub(crate) fn new(
        schema: &TableSchema,
        aliases: Option<&BTreeMap<String, String>>,
    ) -> Result<Self> {
        let types = schema.column_type_mapping(aliases)?;
        let columns = types
            .into_iter()
            .map(|(alias, column_type)| {
                let column = aliases
                    .and_then(|a| a.get(&alias))
                    .cloned()
                    .unwrap_or_else(|| alias.clone());
                let output = match column_type {
                    ColumnType::Virtual { underlying, .. } => *underlying,
                    other => other,
                };
                (alias, column, output)
            })
            .collect();
        Ok(Self { columns })
    }

    pub(crate) fn column_types(&self) -> BTreeMap<String, ColumnType> {
        self.columns
            .iter()
            .map(|(alias, _, t)| (alias.clone(), t.clone()))
            .collect()
    }

    /// Alias to value for one row. Null and absent columns are dropped
    /// unless `keep_none` is set.
    pub(crate) fn project(
        &self,
        row: &RowView<'_>,
        keep_none: bool,
    ) -> Result<BTreeMap<String, Value>> {
        let mut out = BTreeMap::new();
        for (alias, column, _) in &self.columns {
            match row.get(column)? {
                Some(v) if !v.is_null() => {
                    out.insert(alias.clone(), v.clone());
                }
                _ if keep_none => {
                    out.insert(alias.clone(), Value::Null);
                }
                _ => {}
            }
        }
        Ok(out)
    }

    pub(crate) fn encode(
        &self,
        values: &BTreeMap<String, Value>,
        raw: bool,
    ) -> Result<BTreeMap<String, Json>> {
        let mut out = BTreeMap::new();
        for (alias, _, column_type) in &self.columns {
            if let Some(value) = values.get(alias) {
                out.insert(alias.clone(), column_type.encode(value, raw)?);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mnemo_core::TableSchemaDesc;

    fn schema() -> TableSchema {
        let mut schema = TableSchema::new();
        schema
            .merge(
                &TableSchemaDesc::new("id")
                    .column("id", ColumnType::STRING)
                    .column("score", ColumnType::INT32)
                    .column("label", ColumnType::STRING)
                    .column(
                        "meta",
                        ColumnType::object("Meta", [("author", ColumnType::STRING)]),
                    )
                    .column(
                        "author",
                        ColumnType::virtual_column("author", "meta.author", ColumnType::STRING),
                    ),
            )
            .unwrap();
        schema
    }

    fn row(score: Option<i32>) -> BTreeMap<String, Value> {
        let mut values = BTreeMap::new();
        values.insert("id".to_string(), Value::from("r"));
        values.insert("score".to_string(), Value::from(score));
        values.insert(
            "meta".to_string(),
            Value::object("Meta", [("author", Value::from("ada"))]),
        );
        values
    }

    #[test]
    fn test_null_comparisons() {
        let schema = schema();
        let values = row(None);
        let key = Value::from("r");
        let view = RowView::new(&key, &schema, &values);

        assert!(!Filter::column("score", CompareOp::Lt, 5).evaluate(&view).unwrap());
        assert!(!Filter::column("score", CompareOp::Ge, 5).evaluate(&view).unwrap());
        assert!(Filter::column("score", CompareOp::Ne, 5).evaluate(&view).unwrap());
        assert!(Filter::column("score", CompareOp::Eq, Value::Null).evaluate(&view).unwrap());
        assert!(!Filter::column("score", CompareOp::Ne, Value::Null).evaluate(&view).unwrap());
    }

    #[test]
    fn test_boolean_tree() {
        let schema = schema();
        let values = row(Some(7));
        let key = Value::from("r");
        let view = RowView::new(&key, &schema, &values);

        let in_range = Filter::And(vec![
            Filter::column("score", CompareOp::Ge, 5),
            Filter::column("score", CompareOp::Lt, 10),
        ]);
        assert!(in_range.evaluate(&view).unwrap());
        assert!(!Filter::not(in_range.clone()).evaluate(&view).unwrap());
        assert!(Filter::Or(vec![
            Filter::column("score", CompareOp::Eq, 1),
            Filter::column("author", CompareOp::Eq, "ada"),
        ])
        .evaluate(&view)
        .unwrap());
    }

    #[test]
    fn test_incompatible_comparison_is_rejected() {
        let schema = schema();
        let err = Filter::column("score", CompareOp::Eq, "seven")
            .check(&schema)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidQuery { .. }));

        let err = Filter::column("missing", CompareOp::Eq, 1).check(&schema).unwrap_err();
        assert!(matches!(err, Error::ColumnNotFound { .. }));

        // INT32 and FLOAT32 stay comparable
        Filter::column("score", CompareOp::Gt, 1.5f32).check(&schema).unwrap();
    }

    #[test]
    fn test_projection_resolves_virtual_columns() {
        let schema = schema();
        let values = row(None);
        let key = Value::from("r");
        let view = RowView::new(&key, &schema, &values);

        let aliases: BTreeMap<String, String> = [("who", "author"), ("s", "score")]
            .into_iter()
            .map(|(a, c)| (a.to_string(), c.to_string()))
            .collect();
        let projection = Projection::new(&schema, Some(&aliases)).unwrap();
        assert_eq!(projection.column_types()["who"], ColumnType::STRING);

        let projected = projection.project(&view, false).unwrap();
        assert_eq!(projected.len(), 1);
        assert_eq!(projected["who"], Value::from("ada"));

        let with_nulls = projection.project(&view, true).unwrap();
        assert_eq!(with_nulls["s"], Value::Null);
        let encoded = projection.encode(&with_nulls, true).unwrap();
        assert_eq!(encoded["s"], Json::Null);
        assert_eq!(encoded["who"], json!("ada"));
    }

    #[test]
    fn test_virtual_path_over_non_object_fails() {
        let schema = schema();
        let key = Value::from("r");

        let mut values = row(Some(1));
        values.insert("meta".to_string(), Value::Null);
        let view = RowView::new(&key, &schema, &values);
        assert_eq!(view.get("author").unwrap(), None);

        values.insert("meta".to_string(), Value::List(vec![Value::from("ada")]));
        let view = RowView::new(&key, &schema, &values);
        assert!(matches!(view.get("author"), Err(Error::InvalidQuery { .. })));
        assert!(Filter::column("author", CompareOp::Eq, "ada").evaluate(&view).is_err());

        let projection = Projection::new(&schema, None).unwrap();
        assert!(projection.project(&view, false).is_err());

        let mut views = vec![view, view];
        assert!(QueryRequest::new()
            .order_by(OrderBy::asc("author"))
            .sort(&mut views)
            .is_err());
    }

    #[test]
    fn test_sort_is_stable_and_directional() {
        let schema = schema();
        let keys: Vec<Value> = (0..4).map(|i| Value::from(format!("k{}", i))).collect();
        let rows: Vec<BTreeMap<String, Value>> = [3, 1, 3, 2].into_iter().map(|s| row(Some(s))).collect();
        let mut views: Vec<RowView<'_>> = keys
            .iter()
            .zip(&rows)
            .map(|(k, v)| RowView::new(k, &schema, v))
            .collect();

        QueryRequest::new().order_by(OrderBy::desc("score")).sort(&mut views).unwrap();
        let order: Vec<&Value> = views.iter().map(|v| v.key).collect();
        assert_eq!(order, vec![&keys[0], &keys[2], &keys[3], &keys[1]]);
    }
}
