//! Logical deletion markers.
//!
//! A tombstone recorded at revision `r` hides every version of a matching
//! key written before `r`. Writes after `r` bring the key back.

use std::cmp::Ordering;

use mnemo_core::error::{Error, Result};
use mnemo_core::{ColumnType, ScalarKind, TypeKind, Value};

use crate::wal::WalTombstone;

#[derive(Debug, Clone, PartialEq)]
pub enum Tombstone {
    /// Keys starting with `key_prefix`. String keys match string prefixes
    /// and byte keys match byte prefixes.
    Prefix { key_prefix: Value },
    /// Keys between the bounds. A missing bound is unbounded on that side.
    Range {
        start: Option<Value>,
        end: Option<Value>,
        start_inclusive: bool,
        end_inclusive: bool,
    },
}

impl Tombstone {
    pub fn prefix(key_prefix: impl Into<Value>) -> Self {
        Tombstone::Prefix {
            key_prefix: key_prefix.into(),
        }
    }

    pub fn range(
        start: Option<Value>,
        end: Option<Value>,
        start_inclusive: bool,
        end_inclusive: bool,
    ) -> Self {
        Tombstone::Range {
            start,
            end,
            start_inclusive,
            end_inclusive,
        }
    }

    /// Deletes every key.
    pub fn all() -> Self {
        Tombstone::range(None, None, true, true)
    }

    pub fn is_unbounded(&self) -> bool {
        matches!(
            self,
            Tombstone::Range {
                start: None,
                end: None,
                ..
            }
        )
    }

    pub fn matches(&self, key: &Value) -> bool {
        match self {
            Tombstone::Prefix { key_prefix } => match (key, key_prefix) {
                (Value::String(k), Value::String(p)) => k.starts_with(p.as_str()),
                (Value::Bytes(k), Value::Bytes(p)) => k.starts_with(p),
                _ => false,
            },
            Tombstone::Range {
                start,
                end,
                start_inclusive,
                end_inclusive,
            } => {
                let after_start = match start {
                    None => true,
                    Some(s) if s.kind() != key.kind() => false,
                    Some(s) => match key.cmp(s) {
                        Ordering::Greater => true,
                        Ordering::Equal => *start_inclusive,
                        Ordering::Less => false,
                    },
                };
                let before_end = match end {
                    None => true,
                    Some(e) if e.kind() != key.kind() => false,
                    Some(e) => match key.cmp(e) {
                        Ordering::Less => true,
                        Ordering::Equal => *end_inclusive,
                        Ordering::Greater => false,
                    },
                };
                after_start && before_end
            }
        }
    }

    /// Converts bounds to the table's key type and rejects tombstones that
    /// could never match a key of that type.
    pub fn normalize(self, key_type: &ColumnType) -> Result<Self> {
        match self {
            Tombstone::Prefix { key_prefix } => {
                let prefix_kind = key_prefix.kind();
                let allowed = matches!(
                    (key_type, prefix_kind),
                    (ColumnType::Scalar(ScalarKind::String), TypeKind::String)
                        | (ColumnType::Scalar(ScalarKind::Bytes), TypeKind::Bytes)
                );
                if !allowed {
                    return Err(Error::InvalidQuery {
                        message: format!(
                            "prefix tombstone of type {} cannot apply to keys of type {}",
                            prefix_kind, key_type
                        ),
                    });
                }
                Ok(Tombstone::Prefix { key_prefix })
            }
            Tombstone::Range {
                start,
                end,
                start_inclusive,
                end_inclusive,
            } => {
                let coerce = |bound: Option<Value>| -> Result<Option<Value>> {
                    match bound {
                        None | Some(Value::Null) => Ok(None),
                        Some(v) => key_type.coerce_key(v).map(Some).map_err(|e| Error::InvalidQuery {
                            message: format!("tombstone bound does not fit the key type: {}", e),
                        }),
                    }
                };
                Ok(Tombstone::Range {
                    start: coerce(start)?,
                    end: coerce(end)?,
                    start_inclusive,
                    end_inclusive,
                })
            }
        }
    }

    pub fn to_wal(&self, key_type: &ColumnType) -> Result<WalTombstone> {
        match self {
            Tombstone::Prefix { key_prefix } => {
                Ok(WalTombstone::Prefix(key_type.to_wal(0, key_prefix)?))
            }
            Tombstone::Range {
                start,
                end,
                start_inclusive,
                end_inclusive,
            } => Ok(WalTombstone::Range {
                start: start.as_ref().map(|v| key_type.to_wal(0, v)).transpose()?,
                end: end.as_ref().map(|v| key_type.to_wal(0, v)).transpose()?,
                start_inclusive: *start_inclusive,
                end_inclusive: *end_inclusive,
            }),
        }
    }

    pub fn from_wal(tombstone: &WalTombstone, key_type: &ColumnType) -> Result<Self> {
        match tombstone {
            WalTombstone::Prefix(prefix) => Ok(Tombstone::Prefix {
                key_prefix: key_type.from_wal(prefix)?,
            }),
            WalTombstone::Range {
                start,
                end,
                start_inclusive,
                end_inclusive,
            } => Ok(Tombstone::Range {
                start: start.as_ref().map(|c| key_type.from_wal(c)).transpose()?,
                end: end.as_ref().map(|c| key_type.from_wal(c)).transpose()?,
                start_inclusive: *start_inclusive,
                end_inclusive: *end_inclusive,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_prefix_tombstone() {
        let t = Tombstone::prefix("a/");
        assert!(t.matches(&Value::from("a/b")));
        assert!(t.matches(&Value::from("a/")));
        assert!(!t.matches(&Value::from("b/a")));
        assert!(!t.matches(&Value::Int32(1)));

        let t = Tombstone::prefix(Bytes::from_static(b"\x01"));
        assert!(t.matches(&Value::Bytes(Bytes::from_static(b"\x01\x02"))));
        assert!(!t.matches(&Value::from("\u{1}")));
    }

    #[test]
    fn test_half_open_range() {
        let t = Tombstone::range(Some(Value::Int64(5)), Some(Value::Int64(10)), true, false);
        for k in 5..10 {
            assert!(t.matches(&Value::Int64(k)), "key {} should be deleted", k);
        }
        assert!(!t.matches(&Value::Int64(4)));
        assert!(!t.matches(&Value::Int64(10)));
        // Mismatched kinds never match
        assert!(!t.matches(&Value::Int32(7)));
        assert!(!t.matches(&Value::from("7")));
    }

    #[test]
    fn test_unbounded_range_deletes_everything() {
        let t = Tombstone::all();
        assert!(t.is_unbounded());
        assert!(t.matches(&Value::from("anything")));
        assert!(t.matches(&Value::Float64(-1.0)));

        let open_end = Tombstone::range(Some(Value::from("m")), None, false, false);
        assert!(!open_end.is_unbounded());
        assert!(open_end.matches(&Value::from("z")));
        assert!(!open_end.matches(&Value::from("m")));
    }

    #[test]
    fn test_normalize_against_key_type() {
        let t = Tombstone::range(Some(Value::Int32(1)), None, true, false)
            .normalize(&ColumnType::FLOAT32)
            .unwrap();
        assert!(t.matches(&Value::Float32(1.0)));

        assert!(Tombstone::prefix("a").normalize(&ColumnType::INT64).is_err());
        assert!(Tombstone::range(Some(Value::from("a")), None, true, true)
            .normalize(&ColumnType::INT64)
            .is_err());
    }

    #[test]
    fn test_wal_roundtrip() {
        let t = Tombstone::range(Some(Value::from("a")), Some(Value::from("c")), false, true);
        let wal = t.to_wal(&ColumnType::STRING).unwrap();
        assert_eq!(Tombstone::from_wal(&wal, &ColumnType::STRING).unwrap(), t);
    }
}
