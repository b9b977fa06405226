//! # Polymorphic Values
//!
//! A [`Value`] is one cell of a table: a scalar, a nested list/map/object,
//! or null. Values are immutable once built and carry a total order so they
//! can serve as row keys.
//!
//! ## Ordering
//!
//! ```text
//! Null < Bool < { numbers, ordered numerically } < String < Bytes < List < Map < Object
//! ```
//!
//! Numbers of different widths compare by numeric value; when two numbers
//! are numerically equal but of different kinds the narrower kind sorts
//! first, so `Ord` stays consistent with `Eq`.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;

use crate::error::{Error, Result};

/// Runtime category of a value. Declaration order is significant: it is
/// the rank used for cross-kind ordering and the tie-break used by schema
/// inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TypeKind {
    Unknown,
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    String,
    Bytes,
    List,
    Map,
    Object,
}

impl TypeKind {
    pub fn name(self) -> &'static str {
        match self {
            TypeKind::Unknown => "UNKNOWN",
            TypeKind::Bool => "BOOL",
            TypeKind::Int8 => "INT8",
            TypeKind::Int16 => "INT16",
            TypeKind::Int32 => "INT32",
            TypeKind::Int64 => "INT64",
            TypeKind::Float32 => "FLOAT32",
            TypeKind::Float64 => "FLOAT64",
            TypeKind::String => "STRING",
            TypeKind::Bytes => "BYTES",
            TypeKind::List => "LIST",
            TypeKind::Map => "MAP",
            TypeKind::Object => "OBJECT",
        }
    }
}

impl fmt::Display for TypeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    String(String),
    Bytes(Bytes),
    List(Vec<Value>),
    Map(BTreeMap<Value, Value>),
    Object {
        type_tag: String,
        attributes: BTreeMap<String, Value>,
    },
}

enum Numeric {
    Int(i64),
    Float(f64),
}

impl Value {
    pub fn kind(&self) -> TypeKind {
        match self {
            Value::Null => TypeKind::Unknown,
            Value::Bool(_) => TypeKind::Bool,
            Value::Int8(_) => TypeKind::Int8,
            Value::Int16(_) => TypeKind::Int16,
            Value::Int32(_) => TypeKind::Int32,
            Value::Int64(_) => TypeKind::Int64,
            Value::Float32(_) => TypeKind::Float32,
            Value::Float64(_) => TypeKind::Float64,
            Value::String(_) => TypeKind::String,
            Value::Bytes(_) => TypeKind::Bytes,
            Value::List(_) => TypeKind::List,
            Value::Map(_) => TypeKind::Map,
            Value::Object { .. } => TypeKind::Object,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self.numeric()? {
            Numeric::Int(v) => Some(v),
            Numeric::Float(_) => None,
        }
    }

    /// Builds an object value.
    pub fn object<I, K>(type_tag: impl Into<String>, attributes: I) -> Value
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Value::Object {
            type_tag: type_tag.into(),
            attributes: attributes.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    /// Builds a map value.
    pub fn map<I>(entries: I) -> Value
    where
        I: IntoIterator<Item = (Value, Value)>,
    {
        Value::Map(entries.into_iter().collect())
    }

    /// Rough in-memory footprint, used for WAL sizing estimates and stats.
    pub fn estimated_size(&self) -> usize {
        let base = std::mem::size_of::<Value>();
        match self {
            Value::String(s) => base + s.len(),
            Value::Bytes(b) => base + b.len(),
            Value::List(items) => base + items.iter().map(Value::estimated_size).sum::<usize>(),
            Value::Map(entries) => {
                base + entries
                    .iter()
                    .map(|(k, v)| k.estimated_size() + v.estimated_size())
                    .sum::<usize>()
            }
            Value::Object {
                type_tag,
                attributes,
            } => {
                base + type_tag.len()
                    + attributes
                        .iter()
                        .map(|(k, v)| k.len() + v.estimated_size())
                        .sum::<usize>()
            }
            _ => base,
        }
    }

    fn numeric(&self) -> Option<Numeric> {
        match *self {
            Value::Int8(v) => Some(Numeric::Int(v as i64)),
            Value::Int16(v) => Some(Numeric::Int(v as i64)),
            Value::Int32(v) => Some(Numeric::Int(v as i64)),
            Value::Int64(v) => Some(Numeric::Int(v)),
            Value::Float32(v) => Some(Numeric::Float(v as f64)),
            Value::Float64(v) => Some(Numeric::Float(v)),
            _ => None,
        }
    }

    /// Follows object attributes named by `path`. Null or a missing
    /// attribute along the way yields `None`; lists, maps and scalars
    /// cannot be traversed.
    pub fn resolve_path<'a, 'p, I>(&'a self, path: I) -> Result<Option<&'a Value>>
    where
        I: IntoIterator<Item = &'p str>,
    {
        let mut current = self;
        for segment in path {
            current = match current {
                Value::Null => return Ok(None),
                Value::Object { attributes, .. } => match attributes.get(segment) {
                    Some(v) => v,
                    None => return Ok(None),
                },
                other => {
                    return Err(Error::InvalidQuery {
                        message: format!(
                            "path segment {} cannot be resolved inside a {} value",
                            segment,
                            other.kind()
                        ),
                    })
                }
            };
        }
        Ok(Some(current))
    }

    /// Ordering used by query filters: numbers compare by value whatever
    /// their width, everything else as [`Ord`].
    pub fn cmp_by_value(&self, other: &Value) -> Ordering {
        match (self.numeric(), other.numeric()) {
            (Some(a), Some(b)) => cmp_numeric(&a, &b),
            _ => self.cmp(other),
        }
    }
}

fn cmp_numeric(a: &Numeric, b: &Numeric) -> Ordering {
    match (a, b) {
        (Numeric::Int(a), Numeric::Int(b)) => a.cmp(b),
        (Numeric::Float(a), Numeric::Float(b)) => a.total_cmp(b),
        (Numeric::Int(a), Numeric::Float(b)) => (*a as f64).total_cmp(b),
        (Numeric::Float(a), Numeric::Int(b)) => a.total_cmp(&(*b as f64)),
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        if let (Some(a), Some(b)) = (self.numeric(), other.numeric()) {
            return cmp_numeric(&a, &b).then_with(|| self.kind().cmp(&other.kind()));
        }

        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            (Value::List(a), Value::List(b)) => a.cmp(b),
            (Value::Map(a), Value::Map(b)) => a.cmp(b),
            (
                Value::Object {
                    type_tag: ta,
                    attributes: aa,
                },
                Value::Object {
                    type_tag: tb,
                    attributes: ab,
                },
            ) => ta.cmp(tb).then_with(|| aa.cmp(ab)),
            _ => self.kind().cmp(&other.kind()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Int8(v) => write!(f, "{}", v),
            Value::Int16(v) => write!(f, "{}", v),
            Value::Int32(v) => write!(f, "{}", v),
            Value::Int64(v) => write!(f, "{}", v),
            Value::Float32(v) => write!(f, "{}", v),
            Value::Float64(v) => write!(f, "{}", v),
            Value::String(v) => write!(f, "{:?}", v),
            Value::Bytes(v) => write!(f, "<{} bytes>", v.len()),
            Value::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
            Value::Map(entries) => {
                f.write_str("{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                f.write_str("}")
            }
            Value::Object {
                type_tag,
                attributes,
            } => {
                write!(f, "{}(", type_tag)?;
                for (i, (k, v)) in attributes.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}={}", k, v)?;
                }
                f.write_str(")")
            }
        }
    }
}

macro_rules! impl_from {
    ($($t:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$t> for Value {
                fn from(v: $t) -> Self {
                    Value::$variant(v)
                }
            }
        )*
    };
}

impl_from! {
    bool => Bool,
    i8 => Int8,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    f32 => Float32,
    f64 => Float64,
    String => String,
    Bytes => Bytes,
    Vec<Value> => List,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// One row as submitted by a writer: column name to value, or a deletion
/// marker for the row's key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    pub values: BTreeMap<String, Value>,
    pub deleted: bool,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// A deletion marker for the row at `key`.
    pub fn tombstone(key_column: &str, key: impl Into<Value>) -> Self {
        let mut values = BTreeMap::new();
        values.insert(key_column.to_string(), key.into());
        Self {
            values,
            deleted: true,
        }
    }

    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(column.into(), value.into());
        self
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Record {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            deleted: false,
        }
    }
}
