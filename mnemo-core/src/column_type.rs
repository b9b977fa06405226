//! # Column Types
//!
//! The declared type of a column (or of a nested position inside one) and
//! the two codecs every type provides:
//!
//! - the **wire** codec (`encode`/`decode`): a type-erased JSON tree used by
//!   the query surface. Scalars become fixed-width hex strings so the
//!   representation is stable and bit-exact; `raw` encoding produces
//!   human-readable strings instead.
//! - the **WAL** codec (`to_wal`/`from_wal`): typed binary columns, which
//!   avoid the hex overhead on the write path.
//!
//! | type    | wire (non-raw)                | raw              | WAL     |
//! |---------|-------------------------------|------------------|---------|
//! | BOOL    | `"1"` / `"0"`                 | `"true"`         | bool    |
//! | INT8    | 2 hex digits, two's complement| decimal          | int     |
//! | INT16   | 4 hex digits                  | decimal          | int     |
//! | INT32   | 8 hex digits                  | decimal          | int     |
//! | INT64   | 16 hex digits                 | decimal          | int     |
//! | FLOAT32 | 8 hex digits of IEEE-754 bits | decimal          | float   |
//! | FLOAT64 | 16 hex digits                 | decimal          | double  |
//! | STRING  | itself                        | itself           | string  |
//! | BYTES   | base64                        | base64           | bytes   |
//! | LIST    | array                         | array            | list    |
//! | MAP     | array of `{key, value}`       | same             | map     |
//! | OBJECT  | object                        | object           | object  |

use std::collections::BTreeMap;
use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use serde_json::Value as Json;

use crate::error::{Error, Result};
use crate::serialization::{WalColumn, WalData};
use crate::value::{TypeKind, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ScalarKind {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    String,
    Bytes,
}

impl ScalarKind {
    pub fn type_kind(self) -> TypeKind {
        match self {
            ScalarKind::Bool => TypeKind::Bool,
            ScalarKind::Int8 => TypeKind::Int8,
            ScalarKind::Int16 => TypeKind::Int16,
            ScalarKind::Int32 => TypeKind::Int32,
            ScalarKind::Int64 => TypeKind::Int64,
            ScalarKind::Float32 => TypeKind::Float32,
            ScalarKind::Float64 => TypeKind::Float64,
            ScalarKind::String => TypeKind::String,
            ScalarKind::Bytes => TypeKind::Bytes,
        }
    }

    pub fn from_type_kind(kind: TypeKind) -> Option<Self> {
        match kind {
            TypeKind::Bool => Some(ScalarKind::Bool),
            TypeKind::Int8 => Some(ScalarKind::Int8),
            TypeKind::Int16 => Some(ScalarKind::Int16),
            TypeKind::Int32 => Some(ScalarKind::Int32),
            TypeKind::Int64 => Some(ScalarKind::Int64),
            TypeKind::Float32 => Some(ScalarKind::Float32),
            TypeKind::Float64 => Some(ScalarKind::Float64),
            TypeKind::String => Some(ScalarKind::String),
            TypeKind::Bytes => Some(ScalarKind::Bytes),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        self.type_kind().name()
    }

    /// Number of hex digits in the non-raw wire form of fixed-width kinds.
    fn hex_width(self) -> Option<usize> {
        match self {
            ScalarKind::Int8 => Some(2),
            ScalarKind::Int16 => Some(4),
            ScalarKind::Int32 | ScalarKind::Float32 => Some(8),
            ScalarKind::Int64 | ScalarKind::Float64 => Some(16),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnType {
    /// All values seen so far are null.
    Unknown,
    Scalar(ScalarKind),
    List(Box<ColumnType>),
    Map(Box<ColumnType>, Box<ColumnType>),
    Object {
        type_tag: String,
        attributes: BTreeMap<String, ColumnType>,
    },
    /// A presentation-only column resolved by path lookup into a sibling
    /// object column. Never stored.
    Virtual {
        alias: String,
        source_path: String,
        underlying: Box<ColumnType>,
    },
}

impl ColumnType {
    pub const BOOL: ColumnType = ColumnType::Scalar(ScalarKind::Bool);
    pub const INT8: ColumnType = ColumnType::Scalar(ScalarKind::Int8);
    pub const INT16: ColumnType = ColumnType::Scalar(ScalarKind::Int16);
    pub const INT32: ColumnType = ColumnType::Scalar(ScalarKind::Int32);
    pub const INT64: ColumnType = ColumnType::Scalar(ScalarKind::Int64);
    pub const FLOAT32: ColumnType = ColumnType::Scalar(ScalarKind::Float32);
    pub const FLOAT64: ColumnType = ColumnType::Scalar(ScalarKind::Float64);
    pub const STRING: ColumnType = ColumnType::Scalar(ScalarKind::String);
    pub const BYTES: ColumnType = ColumnType::Scalar(ScalarKind::Bytes);

    pub fn list(element: ColumnType) -> Self {
        ColumnType::List(Box::new(element))
    }

    pub fn map(key: ColumnType, value: ColumnType) -> Self {
        ColumnType::Map(Box::new(key), Box::new(value))
    }

    pub fn object<I, K>(type_tag: impl Into<String>, attributes: I) -> Self
    where
        I: IntoIterator<Item = (K, ColumnType)>,
        K: Into<String>,
    {
        ColumnType::Object {
            type_tag: type_tag.into(),
            attributes: attributes.into_iter().map(|(k, t)| (k.into(), t)).collect(),
        }
    }

    pub fn virtual_column(
        alias: impl Into<String>,
        source_path: impl Into<String>,
        underlying: ColumnType,
    ) -> Self {
        ColumnType::Virtual {
            alias: alias.into(),
            source_path: source_path.into(),
            underlying: Box::new(underlying),
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, ColumnType::Unknown)
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self, ColumnType::Virtual { .. })
    }

    pub fn kind(&self) -> TypeKind {
        match self {
            ColumnType::Unknown => TypeKind::Unknown,
            ColumnType::Scalar(kind) => kind.type_kind(),
            ColumnType::List(_) => TypeKind::List,
            ColumnType::Map(_, _) => TypeKind::Map,
            ColumnType::Object { .. } => TypeKind::Object,
            ColumnType::Virtual { underlying, .. } => underlying.kind(),
        }
    }

    /// Symmetric compatibility predicate.
    ///
    /// INT32 and FLOAT32 are deliberately cross-comparable even though their
    /// bit patterns are unrelated; existing data depends on it.
    pub fn is_comparable_with(&self, other: &ColumnType) -> bool {
        use ColumnType::*;
        match (self, other) {
            (Virtual { underlying, .. }, _) => underlying.is_comparable_with(other),
            (_, Virtual { underlying, .. }) => self.is_comparable_with(underlying),
            (Unknown, _) | (_, Unknown) => true,
            (Scalar(a), Scalar(b)) => {
                a == b
                    || matches!(
                        (a, b),
                        (ScalarKind::Int32, ScalarKind::Float32)
                            | (ScalarKind::Float32, ScalarKind::Int32)
                    )
            }
            (List(a), List(b)) => a.is_comparable_with(b),
            (Map(ak, av), Map(bk, bv)) => ak.is_comparable_with(bk) && av.is_comparable_with(bv),
            (
                Object {
                    type_tag: ta,
                    attributes: aa,
                },
                Object {
                    type_tag: tb,
                    attributes: ab,
                },
            ) => {
                ta == tb
                    && aa.iter().all(|(name, t)| match ab.get(name) {
                        Some(other) => t.is_comparable_with(other),
                        None => true,
                    })
            }
            _ => false,
        }
    }

    /// Combines a declared type with an incoming one.
    ///
    /// `Unknown` on either side yields the other side; composite types merge
    /// recursively; a concrete type never changes into a different concrete
    /// type. An incoming type comparable with the existing one (INT32 vs
    /// FLOAT32) keeps the existing type.
    pub fn merge(&self, incoming: &ColumnType) -> Result<ColumnType> {
        use ColumnType::*;
        let merged = match (self, incoming) {
            (Unknown, other) => other.clone(),
            (existing, Unknown) => existing.clone(),
            (Scalar(a), Scalar(_)) if self.is_comparable_with(incoming) => Scalar(*a),
            (List(a), List(b)) => List(Box::new(a.merge(b)?)),
            (Map(ak, av), Map(bk, bv)) => Map(Box::new(ak.merge(bk)?), Box::new(av.merge(bv)?)),
            (
                Object {
                    type_tag: ta,
                    attributes: aa,
                },
                Object {
                    type_tag: tb,
                    attributes: ab,
                },
            ) if ta == tb => {
                let mut attributes = aa.clone();
                for (name, t) in ab {
                    let merged = match aa.get(name) {
                        Some(existing) => existing.merge(t)?,
                        None => t.clone(),
                    };
                    attributes.insert(name.clone(), merged);
                }
                Object {
                    type_tag: ta.clone(),
                    attributes,
                }
            }
            (a @ Virtual { .. }, b @ Virtual { .. }) if a == b => a.clone(),
            _ => {
                return Err(Error::TypeMismatch {
                    message: format!("cannot change type {} to {}", self, incoming),
                })
            }
        };
        Ok(merged)
    }

    /// Checks names and shape: object attribute names must match
    /// `[A-Za-z0-9_]+` and virtual columns need a source path.
    pub fn validate(&self) -> Result<()> {
        match self {
            ColumnType::Unknown | ColumnType::Scalar(_) => Ok(()),
            ColumnType::List(element) => element.validate(),
            ColumnType::Map(key, value) => {
                key.validate()?;
                value.validate()
            }
            ColumnType::Object {
                type_tag,
                attributes,
            } => {
                if type_tag.is_empty() {
                    return Err(Error::schema("object type tag must not be empty"));
                }
                for (name, t) in attributes {
                    validate_attribute_name(name)?;
                    t.validate()?;
                }
                Ok(())
            }
            ColumnType::Virtual {
                source_path,
                underlying,
                ..
            } => {
                if source_path.split('.').any(str::is_empty) {
                    return Err(Error::InvalidName {
                        name: source_path.clone(),
                        reason: "virtual column source path has an empty segment".to_string(),
                    });
                }
                if underlying.is_virtual() {
                    return Err(Error::schema("virtual column cannot refer to a virtual type"));
                }
                underlying.validate()
            }
        }
    }

    /// Whether a runtime value can be stored in a column of this type
    /// without conversion.
    pub fn matches(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (ColumnType::Unknown, _) | (ColumnType::Virtual { .. }, _) => false,
            (ColumnType::Scalar(kind), v) => kind.type_kind() == v.kind(),
            (ColumnType::List(element), Value::List(items)) => items.iter().all(|v| element.matches(v)),
            (ColumnType::Map(kt, vt), Value::Map(entries)) => {
                entries.iter().all(|(k, v)| kt.matches(k) && vt.matches(v))
            }
            (
                ColumnType::Object {
                    type_tag,
                    attributes,
                },
                Value::Object {
                    type_tag: vt,
                    attributes: va,
                },
            ) => {
                type_tag == vt
                    && va
                        .iter()
                        .all(|(name, v)| attributes.get(name).map_or(false, |t| t.matches(v)))
            }
            _ => false,
        }
    }

    /// Checks a runtime value against this type and returns the value to
    /// store. An INT32 column accepts FLOAT32 values and vice versa; the
    /// value keeps its own variant so nothing is rounded on the way in.
    pub fn coerce(&self, value: Value) -> Result<Value> {
        match (self, value) {
            (_, Value::Null) => Ok(Value::Null),
            (ColumnType::Scalar(ScalarKind::Float32), v @ Value::Int32(_))
            | (ColumnType::Scalar(ScalarKind::Int32), v @ Value::Float32(_)) => Ok(v),
            (ColumnType::List(element), Value::List(items)) => Ok(Value::List(
                items
                    .into_iter()
                    .map(|v| element.coerce(v))
                    .collect::<Result<_>>()?,
            )),
            (ColumnType::Map(kt, vt), Value::Map(entries)) => Ok(Value::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| Ok((kt.coerce(k)?, vt.coerce(v)?)))
                    .collect::<Result<_>>()?,
            )),
            (
                ColumnType::Object {
                    type_tag,
                    attributes,
                },
                Value::Object {
                    type_tag: vt,
                    attributes: va,
                },
            ) if *type_tag == vt => {
                let mut coerced = BTreeMap::new();
                for (name, v) in va {
                    let t = attributes.get(&name).ok_or_else(|| Error::TypeMismatch {
                        message: format!("attribute {} is not declared by {}", name, self),
                    })?;
                    coerced.insert(name, t.coerce(v)?);
                }
                Ok(Value::Object {
                    type_tag: vt,
                    attributes: coerced,
                })
            }
            (t, v) if t.matches(&v) => Ok(v),
            (t, v) => Err(Error::TypeMismatch {
                message: format!("value {} of type {} does not fit column type {}", v, v.kind(), t),
            }),
        }
    }

    /// Like [`ColumnType::coerce`], but row keys need one canonical
    /// variant: an INT32/FLOAT32 cross value is converted when exact and
    /// rejected otherwise.
    pub fn coerce_key(&self, value: Value) -> Result<Value> {
        match (self, value) {
            (ColumnType::Scalar(ScalarKind::Float32), Value::Int32(v)) => {
                let f = v as f32;
                if f as i64 == v as i64 {
                    Ok(Value::Float32(f))
                } else {
                    Err(Error::invalid_value(v.to_string(), "FLOAT32", "integer key is not exactly representable"))
                }
            }
            (ColumnType::Scalar(ScalarKind::Int32), Value::Float32(v)) => {
                if v.fract() == 0.0 && v >= i32::MIN as f32 && v < i32::MAX as f32 {
                    Ok(Value::Int32(v as i32))
                } else {
                    Err(Error::invalid_value(v.to_string(), "INT32", "float key is not an exact integer"))
                }
            }
            (_, value) => self.coerce(value),
        }
    }

    /// Encodes a value into its wire form.
    pub fn encode(&self, value: &Value, raw: bool) -> Result<Json> {
        if value.is_null() {
            return Ok(Json::Null);
        }
        match self {
            ColumnType::Unknown => Err(self.mismatch(value)),
            ColumnType::Virtual { alias, .. } => Err(Error::schema(format!(
                "virtual column {} cannot be encoded",
                alias
            ))),
            ColumnType::Scalar(kind) => encode_scalar(*kind, value, raw)
                .map(Json::String)
                .ok_or_else(|| self.mismatch(value)),
            ColumnType::List(element) => match value {
                Value::List(items) => Ok(Json::Array(
                    items
                        .iter()
                        .map(|v| element.encode(v, raw))
                        .collect::<Result<_>>()?,
                )),
                _ => Err(self.mismatch(value)),
            },
            ColumnType::Map(kt, vt) => match value {
                Value::Map(entries) => {
                    let mut out = Vec::with_capacity(entries.len());
                    for (k, v) in entries {
                        let mut entry = serde_json::Map::new();
                        entry.insert("key".to_string(), kt.encode(k, raw)?);
                        entry.insert("value".to_string(), vt.encode(v, raw)?);
                        out.push(Json::Object(entry));
                    }
                    Ok(Json::Array(out))
                }
                _ => Err(self.mismatch(value)),
            },
            ColumnType::Object { attributes, .. } => match value {
                Value::Object { attributes: va, .. } => {
                    let mut out = serde_json::Map::new();
                    for (name, v) in va {
                        let t = attributes.get(name).ok_or_else(|| self.mismatch(value))?;
                        out.insert(name.clone(), t.encode(v, raw)?);
                    }
                    Ok(Json::Object(out))
                }
                _ => Err(self.mismatch(value)),
            },
        }
    }

    /// Decodes a non-raw wire form. Malformed input yields
    /// [`Error::InvalidValue`] naming the offending value and type.
    pub fn decode(&self, wire: &Json) -> Result<Value> {
        if wire.is_null() {
            return Ok(Value::Null);
        }
        match self {
            ColumnType::Unknown => Err(Error::invalid_value(
                wire.to_string(),
                self.to_string(),
                "column of unknown type only accepts null",
            )),
            ColumnType::Virtual { alias, .. } => Err(Error::schema(format!(
                "virtual column {} cannot be decoded",
                alias
            ))),
            ColumnType::Scalar(kind) => match wire {
                Json::String(s) => decode_scalar(*kind, s),
                other => Err(Error::invalid_value(
                    other.to_string(),
                    kind.name(),
                    "expected a string",
                )),
            },
            ColumnType::List(element) => match wire {
                Json::Array(items) => Ok(Value::List(
                    items
                        .iter()
                        .map(|v| element.decode(v))
                        .collect::<Result<_>>()?,
                )),
                other => Err(Error::invalid_value(other.to_string(), self.to_string(), "expected an array")),
            },
            ColumnType::Map(kt, vt) => match wire {
                Json::Array(items) => {
                    let mut entries = BTreeMap::new();
                    for item in items {
                        let (k, v) = match item {
                            Json::Object(fields) => (fields.get("key"), fields.get("value")),
                            _ => (None, None),
                        };
                        let (Some(k), Some(v)) = (k, v) else {
                            return Err(Error::invalid_value(
                                item.to_string(),
                                self.to_string(),
                                "map entries must be objects with key and value",
                            ));
                        };
                        entries.insert(kt.decode(k)?, vt.decode(v)?);
                    }
                    Ok(Value::Map(entries))
                }
                other => Err(Error::invalid_value(other.to_string(), self.to_string(), "expected an array")),
            },
            ColumnType::Object {
                type_tag,
                attributes,
            } => match wire {
                Json::Object(fields) => {
                    let mut decoded = BTreeMap::new();
                    for (name, v) in fields {
                        let t = attributes.get(name).ok_or_else(|| {
                            Error::invalid_value(
                                wire.to_string(),
                                self.to_string(),
                                format!("undeclared attribute {}", name),
                            )
                        })?;
                        decoded.insert(name.clone(), t.decode(v)?);
                    }
                    Ok(Value::Object {
                        type_tag: type_tag.clone(),
                        attributes: decoded,
                    })
                }
                other => Err(Error::invalid_value(other.to_string(), self.to_string(), "expected an object")),
            },
        }
    }

    /// Typed binary form of a value for the WAL.
    pub fn to_wal(&self, index: u32, value: &Value) -> Result<WalColumn> {
        if value.is_null() {
            return Ok(WalColumn::null(index));
        }
        let data = match (self, value) {
            (ColumnType::Virtual { alias, .. }, _) => {
                return Err(Error::schema(format!(
                    "virtual column {} cannot be written to the WAL",
                    alias
                )))
            }
            (ColumnType::Scalar(ScalarKind::Bool), Value::Bool(v)) => WalData::Bool(*v),
            (ColumnType::Scalar(ScalarKind::Int8), Value::Int8(v)) => WalData::Int(*v as i64),
            (ColumnType::Scalar(ScalarKind::Int16), Value::Int16(v)) => WalData::Int(*v as i64),
            (ColumnType::Scalar(ScalarKind::Int32), Value::Int32(v)) => WalData::Int(*v as i64),
            (ColumnType::Scalar(ScalarKind::Int64), Value::Int64(v)) => WalData::Int(*v),
            (ColumnType::Scalar(ScalarKind::Float32), Value::Float32(v)) => WalData::Float(*v),
            (ColumnType::Scalar(ScalarKind::Int32), Value::Float32(v)) => WalData::Float(*v),
            (ColumnType::Scalar(ScalarKind::Float32), Value::Int32(v)) => WalData::Int(*v as i64),
            (ColumnType::Scalar(ScalarKind::Float64), Value::Float64(v)) => WalData::Double(*v),
            (ColumnType::Scalar(ScalarKind::String), Value::String(v)) => WalData::String(v.clone()),
            (ColumnType::Scalar(ScalarKind::Bytes), Value::Bytes(v)) => WalData::Bytes(v.clone()),
            (ColumnType::List(element), Value::List(items)) => WalData::List(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, v)| element.to_wal(i as u32, v))
                    .collect::<Result<_>>()?,
            ),
            (ColumnType::Map(kt, vt), Value::Map(entries)) => WalData::Map(
                entries
                    .iter()
                    .map(|(k, v)| Ok((kt.to_wal(0, k)?, vt.to_wal(0, v)?)))
                    .collect::<Result<_>>()?,
            ),
            (ColumnType::Object { attributes, .. }, Value::Object { attributes: va, .. }) => {
                let mut attrs = Vec::with_capacity(va.len());
                for (name, v) in va {
                    let t = attributes.get(name).ok_or_else(|| self.mismatch(value))?;
                    attrs.push((name.clone(), t.to_wal(0, v)?));
                }
                WalData::Object(attrs)
            }
            _ => return Err(self.mismatch(value)),
        };
        Ok(WalColumn::new(index, data))
    }

    /// Inverse of [`ColumnType::to_wal`]. A payload that does not fit the
    /// declared type means the log disagrees with its own schema.
    pub fn from_wal(&self, column: &WalColumn) -> Result<Value> {
        let Some(data) = &column.data else {
            return Ok(Value::Null);
        };
        let value = match (self, data) {
            (ColumnType::Scalar(ScalarKind::Bool), WalData::Bool(v)) => Value::Bool(*v),
            (ColumnType::Scalar(ScalarKind::Int8), WalData::Int(v)) => {
                Value::Int8(i8::try_from(*v).map_err(|_| self.wal_mismatch(data))?)
            }
            (ColumnType::Scalar(ScalarKind::Int16), WalData::Int(v)) => {
                Value::Int16(i16::try_from(*v).map_err(|_| self.wal_mismatch(data))?)
            }
            (ColumnType::Scalar(ScalarKind::Int32), WalData::Int(v)) => {
                Value::Int32(i32::try_from(*v).map_err(|_| self.wal_mismatch(data))?)
            }
            (ColumnType::Scalar(ScalarKind::Int64), WalData::Int(v)) => Value::Int64(*v),
            (ColumnType::Scalar(ScalarKind::Float32), WalData::Float(v)) => Value::Float32(*v),
            (ColumnType::Scalar(ScalarKind::Int32), WalData::Float(v)) => Value::Float32(*v),
            (ColumnType::Scalar(ScalarKind::Float32), WalData::Int(v)) => {
                Value::Int32(i32::try_from(*v).map_err(|_| self.wal_mismatch(data))?)
            }
            (ColumnType::Scalar(ScalarKind::Float64), WalData::Double(v)) => Value::Float64(*v),
            (ColumnType::Scalar(ScalarKind::String), WalData::String(v)) => Value::String(v.clone()),
            (ColumnType::Scalar(ScalarKind::Bytes), WalData::Bytes(v)) => Value::Bytes(v.clone()),
            (ColumnType::List(element), WalData::List(items)) => Value::List(
                items
                    .iter()
                    .map(|c| element.from_wal(c))
                    .collect::<Result<_>>()?,
            ),
            (ColumnType::Map(kt, vt), WalData::Map(entries)) => Value::Map(
                entries
                    .iter()
                    .map(|(k, v)| Ok((kt.from_wal(k)?, vt.from_wal(v)?)))
                    .collect::<Result<_>>()?,
            ),
            (
                ColumnType::Object {
                    type_tag,
                    attributes,
                },
                WalData::Object(attrs),
            ) => {
                let mut decoded = BTreeMap::new();
                for (name, c) in attrs {
                    let t = attributes.get(name).ok_or_else(|| self.wal_mismatch(data))?;
                    decoded.insert(name.clone(), t.from_wal(c)?);
                }
                Value::Object {
                    type_tag: type_tag.clone(),
                    attributes: decoded,
                }
            }
            _ => return Err(self.wal_mismatch(data)),
        };
        Ok(value)
    }

    /// Type of the value found by following `path` (dotted attribute names)
    /// into this type. Lists and maps along the path are unsupported.
    pub fn resolve_path<'a, I>(&self, mut path: I) -> Result<ColumnType>
    where
        I: Iterator<Item = &'a str>,
    {
        let Some(segment) = path.next() else {
            return Ok(self.clone());
        };
        match self {
            ColumnType::Object { attributes, .. } => attributes
                .get(segment)
                .ok_or_else(|| Error::ColumnNotFound {
                    column: segment.to_string(),
                })?
                .resolve_path(path),
            ColumnType::Unknown => Ok(ColumnType::Unknown),
            other => Err(Error::schema(format!(
                "path segment {} cannot be resolved inside {}; only objects may be traversed",
                segment, other
            ))),
        }
    }

    fn mismatch(&self, value: &Value) -> Error {
        Error::TypeMismatch {
            message: format!("value {} of type {} does not fit column type {}", value, value.kind(), self),
        }
    }

    fn wal_mismatch(&self, data: &WalData) -> Error {
        Error::WriteAheadLog {
            message: format!("WAL {} payload does not fit declared type {}", data.tag_name(), self),
            source: None,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Unknown => f.write_str("UNKNOWN"),
            ColumnType::Scalar(kind) => f.write_str(kind.name()),
            ColumnType::List(element) => write!(f, "LIST<{}>", element),
            ColumnType::Map(k, v) => write!(f, "MAP<{},{}>", k, v),
            ColumnType::Object {
                type_tag,
                attributes,
            } => {
                write!(f, "OBJECT<{}>{{", type_tag)?;
                for (i, (name, t)) in attributes.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}:{}", name, t)?;
                }
                f.write_str("}")
            }
            ColumnType::Virtual {
                source_path,
                underlying,
                ..
            } => write!(f, "VIRTUAL<{}:{}>", source_path, underlying),
        }
    }
}

/// Object attribute names are restricted to `[A-Za-z0-9_]+`.
pub fn validate_attribute_name(name: &str) -> Result<()> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(Error::InvalidName {
            name: name.to_string(),
            reason: "attribute names must match [A-Za-z0-9_]+".to_string(),
        });
    }
    Ok(())
}

fn encode_scalar(kind: ScalarKind, value: &Value, raw: bool) -> Option<String> {
    let encoded = match (kind, value) {
        (ScalarKind::Bool, Value::Bool(v)) => match (raw, v) {
            (true, v) => v.to_string(),
            (false, true) => "1".to_string(),
            (false, false) => "0".to_string(),
        },
        (ScalarKind::Int8, Value::Int8(v)) if raw => v.to_string(),
        (ScalarKind::Int8, Value::Int8(v)) => format!("{:02x}", *v as u8),
        (ScalarKind::Int16, Value::Int16(v)) if raw => v.to_string(),
        (ScalarKind::Int16, Value::Int16(v)) => format!("{:04x}", *v as u16),
        (ScalarKind::Int32, Value::Int32(v)) if raw => v.to_string(),
        (ScalarKind::Int32, Value::Int32(v)) => format!("{:08x}", *v as u32),
        (ScalarKind::Int64, Value::Int64(v)) if raw => v.to_string(),
        (ScalarKind::Int64, Value::Int64(v)) => format!("{:016x}", *v as u64),
        // INT32/FLOAT32 cross values are written in their own form
        (ScalarKind::Int32, Value::Float32(_)) => return encode_scalar(ScalarKind::Float32, value, raw),
        (ScalarKind::Float32, Value::Int32(_)) => return encode_scalar(ScalarKind::Int32, value, raw),
        (ScalarKind::Float32, Value::Float32(v)) if raw => v.to_string(),
        (ScalarKind::Float32, Value::Float32(v)) => format!("{:08x}", v.to_bits()),
        (ScalarKind::Float64, Value::Float64(v)) if raw => v.to_string(),
        (ScalarKind::Float64, Value::Float64(v)) => format!("{:016x}", v.to_bits()),
        (ScalarKind::String, Value::String(v)) => v.clone(),
        (ScalarKind::Bytes, Value::Bytes(v)) => BASE64.encode(v),
        _ => return None,
    };
    Some(encoded)
}

fn parse_hex(kind: ScalarKind, s: &str) -> Result<u64> {
    let width = kind.hex_width().unwrap_or(16);
    if s.is_empty() || s.len() > width || !s.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::invalid_value(
            s,
            kind.name(),
            format!("expected 1 to {} hex digits", width),
        ));
    }
    u64::from_str_radix(s, 16).map_err(|e| Error::invalid_value(s, kind.name(), e.to_string()))
}

fn decode_scalar(kind: ScalarKind, s: &str) -> Result<Value> {
    let value = match kind {
        ScalarKind::Bool => match s {
            "1" => Value::Bool(true),
            "0" => Value::Bool(false),
            _ => return Err(Error::invalid_value(s, kind.name(), "expected \"1\" or \"0\"")),
        },
        ScalarKind::Int8 => Value::Int8(parse_hex(kind, s)? as u8 as i8),
        ScalarKind::Int16 => Value::Int16(parse_hex(kind, s)? as u16 as i16),
        ScalarKind::Int32 => Value::Int32(parse_hex(kind, s)? as u32 as i32),
        ScalarKind::Int64 => Value::Int64(parse_hex(kind, s)? as i64),
        ScalarKind::Float32 => Value::Float32(f32::from_bits(parse_hex(kind, s)? as u32)),
        ScalarKind::Float64 => Value::Float64(f64::from_bits(parse_hex(kind, s)?)),
        ScalarKind::String => Value::String(s.to_string()),
        ScalarKind::Bytes => Value::Bytes(Bytes::from(
            BASE64
                .decode(s)
                .map_err(|e| Error::invalid_value(s, kind.name(), e.to_string()))?,
        )),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn all_scalars() -> Vec<(ColumnType, Value)> {
        vec![
            (ColumnType::BOOL, Value::Bool(true)),
            (ColumnType::BOOL, Value::Bool(false)),
            (ColumnType::INT8, Value::Int8(-1)),
            (ColumnType::INT16, Value::Int16(i16::MIN)),
            (ColumnType::INT32, Value::Int32(123_456)),
            (ColumnType::INT64, Value::Int64(-9_876_543_210)),
            (ColumnType::FLOAT32, Value::Float32(-1.5)),
            (ColumnType::FLOAT64, Value::Float64(std::f64::consts::PI)),
            (ColumnType::STRING, Value::from("héllo")),
            (ColumnType::BYTES, Value::Bytes(Bytes::from_static(b"\x00\x01\xff"))),
        ]
    }

    #[test]
    fn test_scalar_hex_encoding() {
        assert_eq!(ColumnType::INT8.encode(&Value::Int8(-1), false).unwrap(), json!("ff"));
        assert_eq!(ColumnType::INT16.encode(&Value::Int16(1), false).unwrap(), json!("0001"));
        assert_eq!(ColumnType::INT32.encode(&Value::Int32(-2), false).unwrap(), json!("fffffffe"));
        assert_eq!(
            ColumnType::INT64.encode(&Value::Int64(255), false).unwrap(),
            json!("00000000000000ff")
        );
        assert_eq!(ColumnType::FLOAT32.encode(&Value::Float32(1.0), false).unwrap(), json!("3f800000"));
        assert_eq!(ColumnType::BOOL.encode(&Value::Bool(true), false).unwrap(), json!("1"));
        assert_eq!(
            ColumnType::BYTES.encode(&Value::Bytes(Bytes::from_static(b"hi")), false).unwrap(),
            json!("aGk=")
        );
    }

    #[test]
    fn test_raw_encoding() {
        assert_eq!(ColumnType::INT32.encode(&Value::Int32(-2), true).unwrap(), json!("-2"));
        assert_eq!(ColumnType::BOOL.encode(&Value::Bool(false), true).unwrap(), json!("false"));
        assert_eq!(ColumnType::FLOAT64.encode(&Value::Float64(0.25), true).unwrap(), json!("0.25"));
    }

    #[test]
    fn test_scalar_roundtrips() {
        for (t, v) in all_scalars() {
            let wire = t.encode(&v, false).unwrap();
            assert_eq!(t.decode(&wire).unwrap(), v, "wire roundtrip for {}", t);

            let column = t.to_wal(4, &v).unwrap();
            assert_eq!(column.index, 4);
            assert_eq!(t.from_wal(&column).unwrap(), v, "wal roundtrip for {}", t);
        }
    }

    #[test]
    fn test_decode_accepts_short_and_uppercase_hex() {
        assert_eq!(ColumnType::INT32.decode(&json!("A")).unwrap(), Value::Int32(10));
        assert_eq!(ColumnType::INT8.decode(&json!("FF")).unwrap(), Value::Int8(-1));
    }

    #[test]
    fn test_decode_errors_are_typed() {
        let err = ColumnType::INT32.decode(&json!("xyz")).unwrap_err();
        match err {
            Error::InvalidValue { value, type_name, .. } => {
                assert_eq!(value, "xyz");
                assert_eq!(type_name, "INT32");
            }
            other => panic!("unexpected error {:?}", other),
        }

        // Too wide for the declared type
        assert!(matches!(
            ColumnType::INT8.decode(&json!("100")),
            Err(Error::InvalidValue { .. })
        ));
        assert!(matches!(
            ColumnType::BOOL.decode(&json!("true")),
            Err(Error::InvalidValue { .. })
        ));
        assert!(matches!(
            ColumnType::STRING.decode(&json!(5)),
            Err(Error::InvalidValue { .. })
        ));
        assert!(matches!(
            ColumnType::BYTES.decode(&json!("!!!")),
            Err(Error::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_composite_roundtrip() {
        let t = ColumnType::object(
            "pkg.Sample",
            [
                ("tags", ColumnType::list(ColumnType::STRING)),
                ("scores", ColumnType::map(ColumnType::STRING, ColumnType::FLOAT64)),
                ("id", ColumnType::INT64),
            ],
        );
        let v = Value::object(
            "pkg.Sample",
            [
                ("tags", Value::List(vec![Value::from("a"), Value::Null])),
                (
                    "scores",
                    Value::map([(Value::from("acc"), Value::Float64(0.9))]),
                ),
                ("id", Value::Int64(7)),
            ],
        );

        let wire = t.encode(&v, false).unwrap();
        assert_eq!(wire["scores"][0]["key"], json!("acc"));
        assert_eq!(t.decode(&wire).unwrap(), v);
        assert_eq!(t.from_wal(&t.to_wal(0, &v).unwrap()).unwrap(), v);
    }

    #[test]
    fn test_object_rejects_undeclared_attribute() {
        let t = ColumnType::object("T", [("a", ColumnType::INT32)]);
        let err = t.decode(&json!({"b": "01"})).unwrap_err();
        assert!(matches!(err, Error::InvalidValue { .. }));
    }

    #[test]
    fn test_virtual_cannot_be_encoded_or_logged() {
        let t = ColumnType::virtual_column("w", "box.w", ColumnType::FLOAT32);
        assert!(t.encode(&Value::Float32(1.0), false).is_err());
        assert!(t.decode(&json!("3f800000")).is_err());
        assert!(t.to_wal(0, &Value::Float32(1.0)).is_err());
    }

    #[test]
    fn test_comparability_rules() {
        assert!(ColumnType::Unknown.is_comparable_with(&ColumnType::BYTES));
        assert!(ColumnType::INT32.is_comparable_with(&ColumnType::INT32));
        assert!(!ColumnType::INT32.is_comparable_with(&ColumnType::INT64));
        assert!(!ColumnType::STRING.is_comparable_with(&ColumnType::BYTES));
        assert!(ColumnType::list(ColumnType::Unknown).is_comparable_with(&ColumnType::list(ColumnType::INT8)));
        assert!(!ColumnType::list(ColumnType::INT8).is_comparable_with(&ColumnType::INT8));
        let v = ColumnType::virtual_column("x", "o.x", ColumnType::STRING);
        assert!(v.is_comparable_with(&ColumnType::STRING));
        assert!(ColumnType::STRING.is_comparable_with(&v));
    }

    // INT32 and FLOAT32 are cross-comparable for compatibility with stored
    // data. This is a known precision hazard: the two bit patterns differ,
    // so a cross value is only safe while it keeps its own variant.
    #[test]
    fn test_int32_float32_cross_comparable_quirk() {
        assert!(ColumnType::INT32.is_comparable_with(&ColumnType::FLOAT32));
        assert!(ColumnType::FLOAT32.is_comparable_with(&ColumnType::INT32));
        assert!(!ColumnType::INT64.is_comparable_with(&ColumnType::FLOAT64));

        assert_eq!(ColumnType::INT32.merge(&ColumnType::FLOAT32).unwrap(), ColumnType::INT32);
    }

    #[test]
    fn test_int32_float32_cross_writes_are_lossless() {
        assert_eq!(ColumnType::INT32.coerce(Value::Float32(1.5)).unwrap(), Value::Float32(1.5));
        // above 2^24: converting to f32 would round to 16_777_216
        let big = Value::Int32(16_777_217);
        assert_eq!(ColumnType::FLOAT32.coerce(big.clone()).unwrap(), big);
        assert!(ColumnType::INT64.coerce(Value::Float32(1.0)).is_err());

        let wal = ColumnType::INT32.to_wal(3, &Value::Float32(1.5)).unwrap();
        assert_eq!(ColumnType::INT32.from_wal(&wal).unwrap(), Value::Float32(1.5));
        let wal = ColumnType::FLOAT32.to_wal(3, &big).unwrap();
        assert_eq!(ColumnType::FLOAT32.from_wal(&wal).unwrap(), big);

        assert_eq!(ColumnType::INT32.encode(&Value::Float32(1.5), true).unwrap(), "1.5");
        assert_eq!(ColumnType::FLOAT32.encode(&big, true).unwrap(), "16777217");

        // The hex form carries the value's own bits; decoding it as the
        // declared type reinterprets them.
        let hex = ColumnType::INT32.encode(&Value::Float32(1.5), false).unwrap();
        assert_eq!(hex, "3fc00000");
        assert_eq!(ColumnType::INT32.decode(&hex).unwrap(), Value::Int32(0x3fc0_0000));
    }

    #[test]
    fn test_cross_keys_are_canonical() {
        assert_eq!(ColumnType::INT32.coerce_key(Value::Float32(4.0)).unwrap(), Value::Int32(4));
        assert_eq!(ColumnType::FLOAT32.coerce_key(Value::Int32(4)).unwrap(), Value::Float32(4.0));
        assert!(matches!(
            ColumnType::INT32.coerce_key(Value::Float32(1.5)),
            Err(Error::InvalidValue { .. })
        ));
        assert!(ColumnType::FLOAT32.coerce_key(Value::Int32(16_777_217)).is_err());
        assert_eq!(ColumnType::STRING.coerce_key(Value::from("k")).unwrap(), Value::from("k"));
    }

    #[test]
    fn test_merge_unknown_resolution() {
        assert_eq!(ColumnType::Unknown.merge(&ColumnType::STRING).unwrap(), ColumnType::STRING);
        assert_eq!(ColumnType::STRING.merge(&ColumnType::Unknown).unwrap(), ColumnType::STRING);
        assert!(matches!(
            ColumnType::STRING.merge(&ColumnType::INT64),
            Err(Error::TypeMismatch { .. })
        ));

        let a = ColumnType::object("T", [("x", ColumnType::Unknown)]);
        let b = ColumnType::object("T", [("x", ColumnType::INT8), ("y", ColumnType::BOOL)]);
        assert_eq!(
            a.merge(&b).unwrap(),
            ColumnType::object("T", [("x", ColumnType::INT8), ("y", ColumnType::BOOL)])
        );
        assert!(a.merge(&ColumnType::object("U", Vec::<(String, ColumnType)>::new())).is_err());
    }

    #[test]
    fn test_attribute_name_validation() {
        assert!(validate_attribute_name("a_1").is_ok());
        assert!(validate_attribute_name("a-b").is_err());
        assert!(validate_attribute_name("").is_err());
        let t = ColumnType::object("T", [("bad name", ColumnType::INT8)]);
        assert!(matches!(t.validate(), Err(Error::InvalidName { .. })));
    }

    #[test]
    fn test_resolve_path() {
        let t = ColumnType::object(
            "T",
            [
                ("inner", ColumnType::object("U", [("w", ColumnType::FLOAT32)])),
                ("items", ColumnType::list(ColumnType::INT32)),
            ],
        );
        assert_eq!(t.resolve_path("inner.w".split('.')).unwrap(), ColumnType::FLOAT32);
        assert!(t.resolve_path("items.0".split('.')).is_err());
        assert!(matches!(
            t.resolve_path("missing".split('.')),
            Err(Error::ColumnNotFound { .. })
        ));
    }

    #[test]
    fn test_from_wal_rejects_out_of_range() {
        let column = WalColumn::new(0, WalData::Int(1000));
        assert!(ColumnType::INT8.from_wal(&column).is_err());
        assert!(ColumnType::STRING.from_wal(&column).is_err());
    }
}
