//! WAL entries and their framed binary form.
//!
//! ```text
//! frame       := u32 body_len | u32 crc32(body) | body
//! body        := u8 entry_type | string table_name | u64 revision
//!                u32 piece | u8 final_piece
//!                u8 has_schema [WalTableSchema]
//!                u32 n_records  (u8 deleted | u32 n_columns | WalColumn*)*
//!                u8 has_tombstone [tombstone]
//!                u8 has_checkpoint [checkpoint]
//! tombstone   := u8 1 | WalColumn prefix
//!              | u8 2 | u8 flags | [WalColumn start] | [WalColumn end]
//! checkpoint  := u64 revision | i64 timestamp_ms | u64 row_count | u8 has_user_data [string]
//! ```

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};

use mnemo_core::error::{Error, Result};
use mnemo_core::serialization::{
    read_str, read_table_schema, read_wal_column, write_str, write_table_schema, write_wal_column,
    WalColumn, WalTableSchema,
};
use mnemo_core::utils::crc32_checksum;

/// Segment magic, followed by one compression flag byte.
pub const SEGMENT_MAGIC: &[u8; 3] = b"MNW";
pub const FLAG_RAW: u8 = 0;
pub const FLAG_SNAPPY: u8 = 1;
/// `u32 length | u32 crc32`
pub const FRAME_HEADER_SIZE: usize = 8;

const RANGE_HAS_START: u8 = 0b0001;
const RANGE_HAS_END: u8 = 0b0010;
const RANGE_START_INCLUSIVE: u8 = 0b0100;
const RANGE_END_INCLUSIVE: u8 = 0b1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WalEntryType {
    Update = 1,
    Tombstone = 2,
    CreateCheckpoint = 3,
    DeleteCheckpoint = 4,
}

impl TryFrom<u8> for WalEntryType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(WalEntryType::Update),
            2 => Ok(WalEntryType::Tombstone),
            3 => Ok(WalEntryType::CreateCheckpoint),
            4 => Ok(WalEntryType::DeleteCheckpoint),
            _ => Err(corrupt(format!("invalid entry type: {}", value))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WalRecord {
    pub deleted: bool,
    pub columns: Vec<WalColumn>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WalTombstone {
    Prefix(WalColumn),
    Range {
        start: Option<WalColumn>,
        end: Option<WalColumn>,
        start_inclusive: bool,
        end_inclusive: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct WalCheckpoint {
    pub revision: u64,
    pub timestamp_ms: i64,
    pub row_count: u64,
    pub user_data: Option<String>,
}

/// The durable unit of the log.
#[derive(Debug, Clone, PartialEq)]
pub struct WalEntry {
    pub entry_type: WalEntryType,
    pub table_name: String,
    /// Table revision produced by the entry. Pieces of a split entry share
    /// one revision.
    pub revision: u64,
    /// Position of this piece within a split entry; 0 when not split.
    pub piece: u32,
    /// Whether no further pieces of the entry follow.
    pub final_piece: bool,
    /// Schema delta to apply before the records.
    pub table_schema: Option<WalTableSchema>,
    pub records: Vec<WalRecord>,
    pub tombstone: Option<WalTombstone>,
    pub checkpoint: Option<WalCheckpoint>,
}

impl WalEntry {
    pub fn update(
        table_name: impl Into<String>,
        revision: u64,
        table_schema: Option<WalTableSchema>,
        records: Vec<WalRecord>,
    ) -> Self {
        Self {
            entry_type: WalEntryType::Update,
            table_name: table_name.into(),
            revision,
            piece: 0,
            final_piece: true,
            table_schema,
            records,
            tombstone: None,
            checkpoint: None,
        }
    }

    pub fn tombstone(table_name: impl Into<String>, revision: u64, tombstone: WalTombstone) -> Self {
        Self {
            entry_type: WalEntryType::Tombstone,
            table_name: table_name.into(),
            revision,
            piece: 0,
            final_piece: true,
            table_schema: None,
            records: Vec::new(),
            tombstone: Some(tombstone),
            checkpoint: None,
        }
    }

    pub fn checkpoint(
        table_name: impl Into<String>,
        revision: u64,
        entry_type: WalEntryType,
        checkpoint: WalCheckpoint,
    ) -> Self {
        Self {
            entry_type,
            table_name: table_name.into(),
            revision,
            piece: 0,
            final_piece: true,
            table_schema: None,
            records: Vec::new(),
            tombstone: None,
            checkpoint: Some(checkpoint),
        }
    }

    fn write_head(&self, out: &mut Vec<u8>) -> Result<()> {
        out.write_u8(self.entry_type as u8)?;
        write_str(out, &self.table_name)?;
        out.write_u64::<LittleEndian>(self.revision)?;
        out.write_u32::<LittleEndian>(self.piece)?;
        out.write_u8(self.final_piece as u8)?;
        match &self.table_schema {
            Some(schema) => {
                out.write_u8(1)?;
                write_table_schema(out, schema)?;
            }
            None => out.write_u8(0)?,
        }
        Ok(())
    }

    fn write_tail(&self, out: &mut Vec<u8>) -> Result<()> {
        match &self.tombstone {
            Some(tombstone) => {
                out.write_u8(1)?;
                write_tombstone(out, tombstone)?;
            }
            None => out.write_u8(0)?,
        }
        match &self.checkpoint {
            Some(checkpoint) => {
                out.write_u8(1)?;
                out.write_u64::<LittleEndian>(checkpoint.revision)?;
                out.write_i64::<LittleEndian>(checkpoint.timestamp_ms)?;
                out.write_u64::<LittleEndian>(checkpoint.row_count)?;
                match &checkpoint.user_data {
                    Some(data) => {
                        out.write_u8(1)?;
                        write_str(out, data)?;
                    }
                    None => out.write_u8(0)?,
                }
            }
            None => out.write_u8(0)?,
        }
        Ok(())
    }

    /// Serializes the entry body (without frame header).
    pub fn encode_body(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.write_head(&mut out)?;
        out.write_u32::<LittleEndian>(self.records.len() as u32)?;
        for record in &self.records {
            write_record(&mut out, record)?;
        }
        self.write_tail(&mut out)?;
        Ok(out)
    }

    /// Serializes the entry as a checksummed frame.
    pub fn encode_frame(&self) -> Result<Vec<u8>> {
        let body = self.encode_body()?;
        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + body.len());
        frame.write_u32::<LittleEndian>(body.len() as u32)?;
        frame.write_u32::<LittleEndian>(crc32_checksum(&body))?;
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    pub fn decode_body(mut body: &[u8]) -> Result<Self> {
        let r = &mut body;
        let entry_type = WalEntryType::try_from(r.read_u8().map_err(truncated)?)?;
        let table_name = read_str(r)?;
        let revision = r.read_u64::<LittleEndian>().map_err(truncated)?;
        let piece = r.read_u32::<LittleEndian>().map_err(truncated)?;
        let final_piece = match r.read_u8().map_err(truncated)? {
            0 => false,
            1 => true,
            flag => return Err(corrupt(format!("invalid final piece flag {}", flag))),
        };
        let table_schema = match r.read_u8().map_err(truncated)? {
            0 => None,
            1 => Some(read_table_schema(r)?),
            flag => return Err(corrupt(format!("invalid schema flag {}", flag))),
        };

        let count = r.read_u32::<LittleEndian>().map_err(truncated)?;
        let mut records = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            records.push(read_record(r)?);
        }

        let tombstone = match r.read_u8().map_err(truncated)? {
            0 => None,
            1 => Some(read_tombstone(r)?),
            flag => return Err(corrupt(format!("invalid tombstone flag {}", flag))),
        };
        let checkpoint = match r.read_u8().map_err(truncated)? {
            0 => None,
            1 => {
                let revision = r.read_u64::<LittleEndian>().map_err(truncated)?;
                let timestamp_ms = r.read_i64::<LittleEndian>().map_err(truncated)?;
                let row_count = r.read_u64::<LittleEndian>().map_err(truncated)?;
                let user_data = match r.read_u8().map_err(truncated)? {
                    0 => None,
                    _ => Some(read_str(r)?),
                };
                Some(WalCheckpoint {
                    revision,
                    timestamp_ms,
                    row_count,
                    user_data,
                })
            }
            flag => return Err(corrupt(format!("invalid checkpoint flag {}", flag))),
        };

        if !r.is_empty() {
            return Err(corrupt(format!("{} trailing bytes after entry", r.len())));
        }

        Ok(Self {
            entry_type,
            table_name,
            revision,
            piece,
            final_piece,
            table_schema,
            records,
            tombstone,
            checkpoint,
        })
    }

    /// Splits the entry at record boundaries so every piece's frame fits in
    /// `limit` bytes. Only the first piece carries the schema delta; pieces
    /// are numbered from 0 and only the last is marked final, so replay can
    /// tell a complete entry from one cut short by a crash.
    pub fn split(self, limit: usize) -> Result<Vec<WalEntry>> {
        let frame_len = FRAME_HEADER_SIZE + self.encode_body()?.len();
        if frame_len <= limit {
            return Ok(vec![self]);
        }
        if self.entry_type != WalEntryType::Update || self.records.is_empty() {
            return Err(Error::RecordTooLarge {
                size: frame_len,
                limit,
            });
        }

        let record_sizes = self
            .records
            .iter()
            .map(|record| {
                let mut scratch = Vec::new();
                write_record(&mut scratch, record).map(|_| scratch.len())
            })
            .collect::<Result<Vec<_>>>()?;

        let overhead = |with_schema: bool| -> Result<usize> {
            let mut scratch = Vec::new();
            let head = WalEntry {
                table_schema: if with_schema { self.table_schema.clone() } else { None },
                records: Vec::new(),
                ..self.clone()
            };
            head.write_head(&mut scratch)?;
            scratch.write_u32::<LittleEndian>(0)?;
            head.write_tail(&mut scratch)?;
            Ok(FRAME_HEADER_SIZE + scratch.len())
        };
        let first_overhead = overhead(true)?;
        let rest_overhead = overhead(false)?;

        if let Some(&size) = record_sizes.iter().find(|&&s| rest_overhead + s > limit) {
            return Err(Error::RecordTooLarge {
                size: rest_overhead + size,
                limit,
            });
        }
        if first_overhead > limit {
            return Err(Error::RecordTooLarge {
                size: first_overhead,
                limit,
            });
        }

        let WalEntry {
            table_name,
            revision,
            table_schema,
            records,
            ..
        } = self;

        let mut pieces = Vec::new();
        let mut current = WalEntry::update(table_name.clone(), revision, table_schema, Vec::new());
        let mut current_size = first_overhead;
        for (record, size) in records.into_iter().zip(record_sizes) {
            if current_size + size > limit {
                let next = WalEntry::update(table_name.clone(), revision, None, Vec::new());
                pieces.push(std::mem::replace(&mut current, next));
                current_size = rest_overhead;
            }
            current.records.push(record);
            current_size += size;
        }
        pieces.push(current);

        let last = pieces.len() - 1;
        for (i, piece) in pieces.iter_mut().enumerate() {
            piece.piece = i as u32;
            piece.final_piece = i == last;
        }
        for piece in &pieces {
            let size = FRAME_HEADER_SIZE + piece.encode_body()?.len();
            if size > limit {
                return Err(Error::Internal {
                    message: format!("split produced a {} byte entry over the {} byte limit", size, limit),
                });
            }
        }
        Ok(pieces)
    }
}

/// Reads one frame from the front of `input`, returning the entry and the
/// number of bytes consumed.
pub fn decode_frame(input: &[u8]) -> Result<(WalEntry, usize)> {
    if input.len() < FRAME_HEADER_SIZE {
        return Err(corrupt(format!("truncated frame header ({} bytes)", input.len())));
    }
    let len = LittleEndian::read_u32(&input[0..4]) as usize;
    let crc = LittleEndian::read_u32(&input[4..8]);
    let end = FRAME_HEADER_SIZE + len;
    if input.len() < end {
        return Err(corrupt(format!(
            "frame of {} bytes truncated to {}",
            len,
            input.len() - FRAME_HEADER_SIZE
        )));
    }
    let body = &input[FRAME_HEADER_SIZE..end];
    let actual = crc32_checksum(body);
    if actual != crc {
        return Err(corrupt(format!(
            "checksum mismatch: expected {:08x}, got {:08x}",
            crc, actual
        )));
    }
    Ok((WalEntry::decode_body(body)?, end))
}

fn write_record(out: &mut Vec<u8>, record: &WalRecord) -> Result<()> {
    out.write_u8(record.deleted as u8)?;
    out.write_u32::<LittleEndian>(record.columns.len() as u32)?;
    for column in &record.columns {
        write_wal_column(out, column)?;
    }
    Ok(())
}

fn read_record(r: &mut &[u8]) -> Result<WalRecord> {
    let deleted = r.read_u8().map_err(truncated)? != 0;
    let count = r.read_u32::<LittleEndian>().map_err(truncated)?;
    let mut columns = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        columns.push(read_wal_column(r)?);
    }
    Ok(WalRecord { deleted, columns })
}

fn write_tombstone(out: &mut Vec<u8>, tombstone: &WalTombstone) -> Result<()> {
    match tombstone {
        WalTombstone::Prefix(prefix) => {
            out.write_u8(1)?;
            write_wal_column(out, prefix)?;
        }
        WalTombstone::Range {
            start,
            end,
            start_inclusive,
            end_inclusive,
        } => {
            let mut flags = 0;
            if start.is_some() {
                flags |= RANGE_HAS_START;
            }
            if end.is_some() {
                flags |= RANGE_HAS_END;
            }
            if *start_inclusive {
                flags |= RANGE_START_INCLUSIVE;
            }
            if *end_inclusive {
                flags |= RANGE_END_INCLUSIVE;
            }
            out.write_u8(2)?;
            out.write_u8(flags)?;
            for bound in [start, end].into_iter().flatten() {
                write_wal_column(out, bound)?;
            }
        }
    }
    Ok(())
}

fn read_tombstone(r: &mut &[u8]) -> Result<WalTombstone> {
    match r.read_u8().map_err(truncated)? {
        1 => Ok(WalTombstone::Prefix(read_wal_column(r)?)),
        2 => {
            let flags = r.read_u8().map_err(truncated)?;
            let start = if flags & RANGE_HAS_START != 0 {
                Some(read_wal_column(r)?)
            } else {
                None
            };
            let end = if flags & RANGE_HAS_END != 0 {
                Some(read_wal_column(r)?)
            } else {
                None
            };
            Ok(WalTombstone::Range {
                start,
                end,
                start_inclusive: flags & RANGE_START_INCLUSIVE != 0,
                end_inclusive: flags & RANGE_END_INCLUSIVE != 0,
            })
        }
        kind => Err(corrupt(format!("invalid tombstone kind {}", kind))),
    }
}

fn corrupt(details: impl Into<String>) -> Error {
    Error::Corruption {
        object: "wal entry".to_string(),
        details: details.into(),
    }
}

fn truncated(e: std::io::Error) -> Error {
    corrupt(format!("truncated entry: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mnemo_core::serialization::{WalColumnSchema, WalData};
    use mnemo_core::ColumnType;

    fn record(i: i64, payload: usize) -> WalRecord {
        WalRecord {
            deleted: false,
            columns: vec![
                WalColumn::new(0, WalData::Int(i)),
                WalColumn::new(1, WalData::String("x".repeat(payload))),
            ],
        }
    }

    fn schema() -> WalTableSchema {
        WalTableSchema {
            key_column: "id".to_string(),
            columns: vec![
                WalColumnSchema {
                    name: "id".to_string(),
                    index: 0,
                    column_type: ColumnType::INT64,
                },
                WalColumnSchema {
                    name: "body".to_string(),
                    index: 1,
                    column_type: ColumnType::STRING,
                },
            ],
        }
    }

    #[test]
    fn test_frame_roundtrip() {
        let entries = vec![
            WalEntry::update("t", 1, Some(schema()), vec![record(1, 3), record(2, 0)]),
            WalEntry::tombstone(
                "t",
                2,
                WalTombstone::Range {
                    start: Some(WalColumn::new(0, WalData::Int(5))),
                    end: None,
                    start_inclusive: true,
                    end_inclusive: false,
                },
            ),
            WalEntry::tombstone("t", 3, WalTombstone::Prefix(WalColumn::new(0, WalData::String("a/".into())))),
            WalEntry::checkpoint(
                "t",
                3,
                WalEntryType::CreateCheckpoint,
                WalCheckpoint {
                    revision: 3,
                    timestamp_ms: 1_700_000_000_000,
                    row_count: 2,
                    user_data: Some("nightly".to_string()),
                },
            ),
        ];

        for entry in entries {
            let frame = entry.encode_frame().unwrap();
            let (decoded, used) = decode_frame(&frame).unwrap();
            assert_eq!(used, frame.len());
            assert_eq!(decoded, entry);
        }
    }

    #[test]
    fn test_corrupted_frame_is_detected() {
        let mut frame = WalEntry::update("t", 1, None, vec![record(1, 8)])
            .encode_frame()
            .unwrap();
        let last = frame.len() - 3;
        frame[last] ^= 0xff;
        assert!(matches!(decode_frame(&frame), Err(Error::Corruption { .. })));

        let frame = WalEntry::update("t", 1, None, vec![record(1, 8)])
            .encode_frame()
            .unwrap();
        assert!(matches!(
            decode_frame(&frame[..frame.len() - 1]),
            Err(Error::Corruption { .. })
        ));
    }

    #[test]
    fn test_small_entry_is_not_split() {
        let entry = WalEntry::update("t", 1, Some(schema()), vec![record(1, 10)]);
        let pieces = entry.clone().split(1024).unwrap();
        assert_eq!(pieces, vec![entry]);
    }

    #[test]
    fn test_split_preserves_record_order() {
        let records: Vec<_> = (0..20).map(|i| record(i, 100)).collect();
        let entry = WalEntry::update("t", 7, Some(schema()), records.clone());
        let limit = 600;

        let pieces = entry.split(limit).unwrap();
        assert!(pieces.len() >= 2);
        assert!(pieces[0].table_schema.is_some());
        for piece in &pieces {
            assert!(piece.encode_frame().unwrap().len() <= limit);
        }
        for piece in &pieces[1..] {
            assert!(piece.table_schema.is_none());
        }
        assert!(pieces.iter().all(|p| p.revision == 7));
        let numbering: Vec<(u32, bool)> = pieces.iter().map(|p| (p.piece, p.final_piece)).collect();
        let last = pieces.len() - 1;
        for (i, (piece, final_piece)) in numbering.into_iter().enumerate() {
            assert_eq!(piece as usize, i);
            assert_eq!(final_piece, i == last);
        }
        let (decoded, _) = decode_frame(&pieces[1].encode_frame().unwrap()).unwrap();
        assert_eq!(decoded, pieces[1]);

        let rejoined: Vec<_> = pieces.into_iter().flat_map(|p| p.records).collect();
        assert_eq!(rejoined, records);
    }

    #[test]
    fn test_single_oversized_record_is_rejected() {
        let entry = WalEntry::update("t", 1, None, vec![record(1, 10), record(2, 5000)]);
        assert!(matches!(entry.split(1000), Err(Error::RecordTooLarge { .. })));
    }
}
