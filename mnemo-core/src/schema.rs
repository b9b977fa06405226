//! Table schemas and their incremental merge.
//!
//! A table starts without a schema. Every update may carry a partial
//! [`TableSchemaDesc`]; merging it either extends the schema (new columns
//! get a fresh ordinal, `UNKNOWN` columns become concrete) or fails without
//! touching the existing schema.

use std::collections::BTreeMap;

use crate::column_type::ColumnType;
use crate::error::{Error, Result};
use crate::serialization::{WalColumnSchema, WalTableSchema};

/// A registered column. `index` is assigned on first appearance and never
/// reused for another name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSchema {
    pub name: String,
    pub index: u32,
    pub column_type: ColumnType,
}

/// A column as declared (or inferred) by a writer, before it has an index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSchemaDesc {
    pub name: String,
    pub column_type: ColumnType,
}

impl ColumnSchemaDesc {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// Incoming partial schema.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableSchemaDesc {
    pub key_column: Option<String>,
    pub columns: Vec<ColumnSchemaDesc>,
}

impl TableSchemaDesc {
    pub fn new(key_column: impl Into<String>) -> Self {
        Self {
            key_column: Some(key_column.into()),
            columns: Vec::new(),
        }
    }

    pub fn column(mut self, name: impl Into<String>, column_type: ColumnType) -> Self {
        self.columns.push(ColumnSchemaDesc::new(name, column_type));
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableSchema {
    key_column: Option<String>,
    columns: BTreeMap<String, ColumnSchema>,
    by_index: BTreeMap<u32, String>,
    next_index: u32,
}

impl TableSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key_column(&self) -> Option<&str> {
        self.key_column.as_deref()
    }

    pub fn key_type(&self) -> Option<&ColumnType> {
        self.key_column
            .as_ref()
            .and_then(|k| self.columns.get(k))
            .map(|c| &c.column_type)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.get(name)
    }

    pub fn column_by_index(&self, index: u32) -> Option<&ColumnSchema> {
        self.by_index.get(&index).and_then(|name| self.columns.get(name))
    }

    pub fn columns(&self) -> impl Iterator<Item = &ColumnSchema> {
        self.columns.values()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Merges a partial schema and returns the columns that changed.
    ///
    /// On error the schema is left exactly as it was. Merging the same
    /// description twice returns an empty list the second time.
    pub fn merge(&mut self, desc: &TableSchemaDesc) -> Result<Vec<ColumnSchema>> {
        let mut next = self.clone();
        let changed = next.merge_in_place(desc)?;
        *self = next;
        Ok(changed)
    }

    fn merge_in_place(&mut self, desc: &TableSchemaDesc) -> Result<Vec<ColumnSchema>> {
        match (&self.key_column, &desc.key_column) {
            (Some(existing), Some(incoming)) if existing != incoming => {
                return Err(Error::schema(format!(
                    "key column cannot change from {} to {}",
                    existing, incoming
                )))
            }
            (None, Some(incoming)) => {
                validate_column_name(incoming)?;
                self.key_column = Some(incoming.clone());
            }
            _ => {}
        }

        let mut changed = Vec::new();
        for column in &desc.columns {
            validate_column_name(&column.name)?;
            column.column_type.validate()?;

            match self.columns.get_mut(&column.name) {
                Some(existing) => {
                    let merged = existing
                        .column_type
                        .merge(&column.column_type)
                        .map_err(|e| match e {
                            Error::TypeMismatch { message } => Error::TypeMismatch {
                                message: format!("column {}: {}", column.name, message),
                            },
                            other => other,
                        })?;
                    if merged != existing.column_type {
                        existing.column_type = merged;
                        changed.push(existing.clone());
                    }
                }
                None => {
                    let schema = ColumnSchema {
                        name: column.name.clone(),
                        index: self.next_index,
                        column_type: column.column_type.clone(),
                    };
                    self.next_index += 1;
                    self.by_index.insert(schema.index, schema.name.clone());
                    self.columns.insert(schema.name.clone(), schema.clone());
                    changed.push(schema);
                }
            }
        }

        self.validate_key()?;
        self.validate_virtual_columns()?;
        Ok(changed)
    }

    fn validate_virtual_columns(&self) -> Result<()> {
        for column in self.columns.values() {
            let ColumnType::Virtual {
                source_path,
                underlying,
                ..
            } = &column.column_type
            else {
                continue;
            };
            let source = self.resolve_source(source_path).map_err(|e| {
                Error::schema(format!("virtual column {}: {}", column.name, e))
            })?;
            if !source.is_comparable_with(underlying) {
                return Err(Error::schema(format!(
                    "virtual column {} declares {} but {} resolves to {}",
                    column.name, underlying, source_path, source
                )));
            }
        }
        Ok(())
    }

    /// Type found at a dotted source path: a stored column followed by
    /// object attributes.
    pub fn resolve_source(&self, source_path: &str) -> Result<ColumnType> {
        let mut segments = source_path.split('.');
        let head = segments.next().unwrap_or_default();
        let column = self.columns.get(head).ok_or_else(|| Error::ColumnNotFound {
            column: head.to_string(),
        })?;
        if column.column_type.is_virtual() {
            return Err(Error::schema(format!(
                "path {} starts at virtual column {}",
                source_path, head
            )));
        }
        column.column_type.resolve_path(segments)
    }

    fn validate_key(&self) -> Result<()> {
        let key = self
            .key_column
            .as_ref()
            .ok_or_else(|| Error::schema("table has no key column"))?;
        let column = self.columns.get(key).ok_or_else(|| {
            Error::schema(format!("key column {} is not declared", key))
        })?;
        match &column.column_type {
            ColumnType::Unknown => Err(Error::schema(format!(
                "key column {} must have a concrete type",
                key
            ))),
            ColumnType::Virtual { .. } => Err(Error::schema(format!(
                "key column {} cannot be virtual",
                key
            ))),
            _ => Ok(()),
        }
    }

    /// Output alias to column type. `None` maps every stored column under
    /// its own name.
    pub fn column_type_mapping(
        &self,
        aliases: Option<&BTreeMap<String, String>>,
    ) -> Result<BTreeMap<String, ColumnType>> {
        match aliases {
            None => Ok(self
                .columns
                .values()
                .map(|c| (c.name.clone(), c.column_type.clone()))
                .collect()),
            Some(aliases) => aliases
                .iter()
                .map(|(alias, name)| {
                    self.columns
                        .get(name)
                        .map(|c| (alias.clone(), c.column_type.clone()))
                        .ok_or_else(|| Error::ColumnNotFound {
                            column: name.clone(),
                        })
                })
                .collect(),
        }
    }

    /// WAL form of the given columns (usually the output of [`merge`]).
    ///
    /// [`merge`]: TableSchema::merge
    pub fn to_wal(&self, columns: &[ColumnSchema]) -> Result<WalTableSchema> {
        let key_column = self
            .key_column
            .clone()
            .ok_or_else(|| Error::schema("table has no key column"))?;
        Ok(WalTableSchema {
            key_column,
            columns: columns
                .iter()
                .map(|c| WalColumnSchema {
                    name: c.name.clone(),
                    index: c.index,
                    column_type: c.column_type.clone(),
                })
                .collect(),
        })
    }

    /// WAL form of the whole schema.
    pub fn to_wal_full(&self) -> Result<WalTableSchema> {
        let columns: Vec<ColumnSchema> = self.columns.values().cloned().collect();
        self.to_wal(&columns)
    }

    /// Replay path: applies a schema delta read back from the WAL, keeping
    /// the recorded ordinals.
    pub fn apply_wal(&mut self, schema: &WalTableSchema) -> Result<()> {
        let mut next = self.clone();
        match &next.key_column {
            Some(existing) if *existing != schema.key_column => {
                return Err(Error::Corruption {
                    object: "wal entry".to_string(),
                    details: format!(
                        "key column changed from {} to {}",
                        existing, schema.key_column
                    ),
                })
            }
            _ => next.key_column = Some(schema.key_column.clone()),
        }

        for column in &schema.columns {
            if let Some(owner) = next.by_index.get(&column.index) {
                if *owner != column.name {
                    return Err(Error::Corruption {
                        object: "wal entry".to_string(),
                        details: format!(
                            "column index {} reassigned from {} to {}",
                            column.index, owner, column.name
                        ),
                    });
                }
            }
            next.by_index.insert(column.index, column.name.clone());
            next.columns.insert(
                column.name.clone(),
                ColumnSchema {
                    name: column.name.clone(),
                    index: column.index,
                    column_type: column.column_type.clone(),
                },
            );
            next.next_index = next.next_index.max(column.index + 1);
        }

        *self = next;
        Ok(())
    }
}

/// Column names match `[A-Za-z0-9_/\-]+`. `.` is reserved as the path
/// separator of virtual columns.
pub fn validate_column_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '/' | '-'));
    if !valid {
        return Err(Error::InvalidName {
            name: name.to_string(),
            reason: "column names must match [A-Za-z0-9_/-]+".to_string(),
        });
    }
    Ok(())
}
