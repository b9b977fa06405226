//! Binary building blocks of the WAL format.
//!
//! Everything here is little-endian and length-prefixed:
//!
//! ```text
//! string      := u32 len | utf8 bytes
//! WalColumn   := u32 index | u8 null_flag | [WalData]        (data omitted when null)
//! WalData     := u8 tag | payload
//!     1 bool    u8
//!     2 int     i64
//!     3 float   f32
//!     4 double  f64
//!     5 string  string
//!     6 bytes   u32 len | bytes
//!     7 list    u32 n | WalColumn*n
//!     8 map     u32 n | (WalColumn WalColumn)*n
//!     9 object  u32 n | (string WalColumn)*n
//! ColumnType  := u8 tag | payload   (see `write_column_type`)
//! ```

use std::collections::BTreeMap;
use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;

use crate::column_type::{ColumnType, ScalarKind};
use crate::error::{Error, Result};

/// Nested columns and types deeper than this are treated as corruption.
pub const MAX_NESTING_DEPTH: usize = 64;

/// Typed binary form of one cell.
#[derive(Debug, Clone, PartialEq)]
pub struct WalColumn {
    pub index: u32,
    /// `None` is the null flag.
    pub data: Option<WalData>,
}

impl WalColumn {
    pub fn null(index: u32) -> Self {
        Self { index, data: None }
    }

    pub fn new(index: u32, data: WalData) -> Self {
        Self {
            index,
            data: Some(data),
        }
    }

    pub fn is_null(&self) -> bool {
        self.data.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WalData {
    Bool(bool),
    Int(i64),
    Float(f32),
    Double(f64),
    String(String),
    Bytes(Bytes),
    List(Vec<WalColumn>),
    Map(Vec<(WalColumn, WalColumn)>),
    Object(Vec<(String, WalColumn)>),
}

impl WalData {
    pub fn tag_name(&self) -> &'static str {
        match self {
            WalData::Bool(_) => "bool",
            WalData::Int(_) => "int",
            WalData::Float(_) => "float",
            WalData::Double(_) => "double",
            WalData::String(_) => "string",
            WalData::Bytes(_) => "bytes",
            WalData::List(_) => "list",
            WalData::Map(_) => "map",
            WalData::Object(_) => "object",
        }
    }
}

/// Column entry of a schema as persisted in the WAL.
#[derive(Debug, Clone, PartialEq)]
pub struct WalColumnSchema {
    pub name: String,
    pub index: u32,
    pub column_type: ColumnType,
}

/// Schema (or the changed part of it) as persisted in the WAL.
#[derive(Debug, Clone, PartialEq)]
pub struct WalTableSchema {
    pub key_column: String,
    pub columns: Vec<WalColumnSchema>,
}

fn corrupt(details: impl Into<String>) -> Error {
    Error::Corruption {
        object: "wal entry".to_string(),
        details: details.into(),
    }
}

fn io_corrupt(e: std::io::Error) -> Error {
    corrupt(format!("truncated or unreadable field: {}", e))
}

pub fn write_str(w: &mut impl Write, s: &str) -> Result<()> {
    w.write_u32::<LittleEndian>(s.len() as u32)?;
    w.write_all(s.as_bytes())?;
    Ok(())
}

pub fn read_str(r: &mut impl Read) -> Result<String> {
    let bytes = read_bytes(r)?;
    String::from_utf8(bytes).map_err(|e| corrupt(format!("invalid utf-8 string: {}", e)))
}

pub fn write_bytes(w: &mut impl Write, b: &[u8]) -> Result<()> {
    w.write_u32::<LittleEndian>(b.len() as u32)?;
    w.write_all(b)?;
    Ok(())
}

pub fn read_bytes(r: &mut impl Read) -> Result<Vec<u8>> {
    let len = r.read_u32::<LittleEndian>().map_err(io_corrupt)? as usize;
    let mut buf = Vec::new();
    r.by_ref().take(len as u64).read_to_end(&mut buf)?;
    if buf.len() != len {
        return Err(corrupt(format!(
            "length prefix {} exceeds remaining {} bytes",
            len,
            buf.len()
        )));
    }
    Ok(buf)
}

fn read_count(r: &mut impl Read) -> Result<usize> {
    Ok(r.read_u32::<LittleEndian>().map_err(io_corrupt)? as usize)
}

pub fn write_wal_column(w: &mut impl Write, column: &WalColumn) -> Result<()> {
    w.write_u32::<LittleEndian>(column.index)?;
    match &column.data {
        None => w.write_u8(1)?,
        Some(data) => {
            w.write_u8(0)?;
            write_wal_data(w, data)?;
        }
    }
    Ok(())
}

fn write_wal_data(w: &mut impl Write, data: &WalData) -> Result<()> {
    match data {
        WalData::Bool(v) => {
            w.write_u8(1)?;
            w.write_u8(*v as u8)?;
        }
        WalData::Int(v) => {
            w.write_u8(2)?;
            w.write_i64::<LittleEndian>(*v)?;
        }
        WalData::Float(v) => {
            w.write_u8(3)?;
            w.write_f32::<LittleEndian>(*v)?;
        }
        WalData::Double(v) => {
            w.write_u8(4)?;
            w.write_f64::<LittleEndian>(*v)?;
        }
        WalData::String(v) => {
            w.write_u8(5)?;
            write_str(w, v)?;
        }
        WalData::Bytes(v) => {
            w.write_u8(6)?;
            write_bytes(w, v)?;
        }
        WalData::List(items) => {
            w.write_u8(7)?;
            w.write_u32::<LittleEndian>(items.len() as u32)?;
            for item in items {
                write_wal_column(w, item)?;
            }
        }
        WalData::Map(entries) => {
            w.write_u8(8)?;
            w.write_u32::<LittleEndian>(entries.len() as u32)?;
            for (k, v) in entries {
                write_wal_column(w, k)?;
                write_wal_column(w, v)?;
            }
        }
        WalData::Object(attrs) => {
            w.write_u8(9)?;
            w.write_u32::<LittleEndian>(attrs.len() as u32)?;
            for (name, v) in attrs {
                write_str(w, name)?;
                write_wal_column(w, v)?;
            }
        }
    }
    Ok(())
}

pub fn read_wal_column(r: &mut impl Read) -> Result<WalColumn> {
    read_wal_column_at(r, 0)
}

fn read_wal_column_at(r: &mut impl Read, depth: usize) -> Result<WalColumn> {
    if depth > MAX_NESTING_DEPTH {
        return Err(corrupt("column nesting too deep"));
    }
    let index = r.read_u32::<LittleEndian>().map_err(io_corrupt)?;
    let null_flag = r.read_u8().map_err(io_corrupt)?;
    let data = match null_flag {
        1 => None,
        0 => Some(read_wal_data(r, depth)?),
        other => return Err(corrupt(format!("invalid null flag {}", other))),
    };
    Ok(WalColumn { index, data })
}

fn read_wal_data(r: &mut impl Read, depth: usize) -> Result<WalData> {
    let tag = r.read_u8().map_err(io_corrupt)?;
    let data = match tag {
        1 => WalData::Bool(r.read_u8().map_err(io_corrupt)? != 0),
        2 => WalData::Int(r.read_i64::<LittleEndian>().map_err(io_corrupt)?),
        3 => WalData::Float(r.read_f32::<LittleEndian>().map_err(io_corrupt)?),
        4 => WalData::Double(r.read_f64::<LittleEndian>().map_err(io_corrupt)?),
        5 => WalData::String(read_str(r)?),
        6 => WalData::Bytes(Bytes::from(read_bytes(r)?)),
        7 => {
            let n = read_count(r)?;
            let mut items = Vec::with_capacity(n.min(1024));
            for _ in 0..n {
                items.push(read_wal_column_at(r, depth + 1)?);
            }
            WalData::List(items)
        }
        8 => {
            let n = read_count(r)?;
            let mut entries = Vec::with_capacity(n.min(1024));
            for _ in 0..n {
                let k = read_wal_column_at(r, depth + 1)?;
                let v = read_wal_column_at(r, depth + 1)?;
                entries.push((k, v));
            }
            WalData::Map(entries)
        }
        9 => {
            let n = read_count(r)?;
            let mut attrs = Vec::with_capacity(n.min(1024));
            for _ in 0..n {
                let name = read_str(r)?;
                attrs.push((name, read_wal_column_at(r, depth + 1)?));
            }
            WalData::Object(attrs)
        }
        other => return Err(corrupt(format!("invalid column data tag {}", other))),
    };
    Ok(data)
}

fn scalar_tag(kind: ScalarKind) -> u8 {
    match kind {
        ScalarKind::Bool => 1,
        ScalarKind::Int8 => 2,
        ScalarKind::Int16 => 3,
        ScalarKind::Int32 => 4,
        ScalarKind::Int64 => 5,
        ScalarKind::Float32 => 6,
        ScalarKind::Float64 => 7,
        ScalarKind::String => 8,
        ScalarKind::Bytes => 9,
    }
}

pub fn write_column_type(w: &mut impl Write, column_type: &ColumnType) -> Result<()> {
    match column_type {
        ColumnType::Unknown => w.write_u8(0)?,
        ColumnType::Scalar(kind) => w.write_u8(scalar_tag(*kind))?,
        ColumnType::List(element) => {
            w.write_u8(10)?;
            write_column_type(w, element)?;
        }
        ColumnType::Map(key, value) => {
            w.write_u8(11)?;
            write_column_type(w, key)?;
            write_column_type(w, value)?;
        }
        ColumnType::Object {
            type_tag,
            attributes,
        } => {
            w.write_u8(12)?;
            write_str(w, type_tag)?;
            w.write_u32::<LittleEndian>(attributes.len() as u32)?;
            for (name, attr_type) in attributes {
                write_str(w, name)?;
                write_column_type(w, attr_type)?;
            }
        }
        ColumnType::Virtual {
            alias,
            source_path,
            underlying,
        } => {
            w.write_u8(13)?;
            write_str(w, alias)?;
            write_str(w, source_path)?;
            write_column_type(w, underlying)?;
        }
    }
    Ok(())
}

pub fn read_column_type(r: &mut impl Read) -> Result<ColumnType> {
    read_column_type_at(r, 0)
}

fn read_column_type_at(r: &mut impl Read, depth: usize) -> Result<ColumnType> {
    if depth > MAX_NESTING_DEPTH {
        return Err(corrupt("column type nesting too deep"));
    }
    let tag = r.read_u8().map_err(io_corrupt)?;
    let column_type = match tag {
        0 => ColumnType::Unknown,
        1 => ColumnType::BOOL,
        2 => ColumnType::INT8,
        3 => ColumnType::INT16,
        4 => ColumnType::INT32,
        5 => ColumnType::INT64,
        6 => ColumnType::FLOAT32,
        7 => ColumnType::FLOAT64,
        8 => ColumnType::STRING,
        9 => ColumnType::BYTES,
        10 => ColumnType::List(Box::new(read_column_type_at(r, depth + 1)?)),
        11 => {
            let key = read_column_type_at(r, depth + 1)?;
            let value = read_column_type_at(r, depth + 1)?;
            ColumnType::Map(Box::new(key), Box::new(value))
        }
        12 => {
            let type_tag = read_str(r)?;
            let n = read_count(r)?;
            let mut attributes = BTreeMap::new();
            for _ in 0..n {
                let name = read_str(r)?;
                attributes.insert(name, read_column_type_at(r, depth + 1)?);
            }
            ColumnType::Object {
                type_tag,
                attributes,
            }
        }
        13 => {
            let alias = read_str(r)?;
            let source_path = read_str(r)?;
            let underlying = read_column_type_at(r, depth + 1)?;
            ColumnType::Virtual {
                alias,
                source_path,
                underlying: Box::new(underlying),
            }
        }
        other => return Err(corrupt(format!("invalid column type tag {}", other))),
    };
    Ok(column_type)
}

pub fn write_table_schema(w: &mut impl Write, schema: &WalTableSchema) -> Result<()> {
    write_str(w, &schema.key_column)?;
    w.write_u32::<LittleEndian>(schema.columns.len() as u32)?;
    for column in &schema.columns {
        write_str(w, &column.name)?;
        w.write_u32::<LittleEndian>(column.index)?;
        write_column_type(w, &column.column_type)?;
    }
    Ok(())
}

pub fn read_table_schema(r: &mut impl Read) -> Result<WalTableSchema> {
    let key_column = read_str(r)?;
    let n = read_count(r)?;
    let mut columns = Vec::with_capacity(n.min(1024));
    for _ in 0..n {
        let name = read_str(r)?;
        let index = r.read_u32::<LittleEndian>().map_err(io_corrupt)?;
        let column_type = read_column_type(r)?;
        columns.push(WalColumnSchema {
            name,
            index,
            column_type,
        });
    }
    Ok(WalTableSchema {
        key_column,
        columns,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_nested_column_roundtrip() {
        let column = WalColumn::new(
            3,
            WalData::Map(vec![(
                WalColumn::new(0, WalData::String("k".into())),
                WalColumn::new(
                    0,
                    WalData::List(vec![
                        WalColumn::new(0, WalData::Int(-7)),
                        WalColumn::null(1),
                    ]),
                ),
            )]),
        );

        let mut buf = Vec::new();
        write_wal_column(&mut buf, &column).unwrap();
        let decoded = read_wal_column(&mut Cursor::new(&buf[..])).unwrap();
        assert_eq!(decoded, column);
    }

    #[test]
    fn test_truncated_column_is_corruption() {
        let mut buf = Vec::new();
        write_wal_column(&mut buf, &WalColumn::new(1, WalData::String("hello".into()))).unwrap();
        buf.truncate(buf.len() - 2);

        let err = read_wal_column(&mut Cursor::new(&buf[..])).unwrap_err();
        assert!(matches!(err, Error::Corruption { .. }));
    }

    #[test]
    fn test_column_type_roundtrip() {
        let column_type = ColumnType::Object {
            type_tag: "pkg.Box".into(),
            attributes: [
                ("w".to_string(), ColumnType::FLOAT32),
                (
                    "tags".to_string(),
                    ColumnType::Map(Box::new(ColumnType::STRING), Box::new(ColumnType::List(Box::new(ColumnType::INT64)))),
                ),
            ]
            .into_iter()
            .collect(),
        };

        let mut buf = Vec::new();
        write_column_type(&mut buf, &column_type).unwrap();
        let decoded = read_column_type(&mut Cursor::new(&buf[..])).unwrap();
        assert_eq!(decoded, column_type);
    }

    #[test]
    fn test_invalid_type_tag() {
        let err = read_column_type(&mut Cursor::new(&[42u8][..])).unwrap_err();
        assert!(matches!(err, Error::Corruption { .. }));
    }
}
