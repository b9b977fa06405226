//! Segment naming and the segment container format.
//!
//! ```text
//! segment := "MNW" | u8 flag | payload      flag 0 = raw, 1 = snappy
//! payload := frame*                         (see types.rs)
//! ```

use tracing::warn;

use mnemo_core::config::{WalConfig, WAL_HEADER_SIZE};
use mnemo_core::error::{Error, Result};

use crate::buffer::Buffer;
use crate::object_store::ObjectStore;

use super::types::{decode_frame, FLAG_RAW, FLAG_SNAPPY, SEGMENT_MAGIC};

pub fn segment_name(prefix: &str, index: u64) -> String {
    format!("{}{}", prefix, index)
}

/// Existing segments as `(index, name)`, numerically sorted.
pub fn list_segments(store: &ObjectStore, prefix: &str) -> Result<Vec<(u64, String)>> {
    let mut segments = Vec::new();
    for name in store.list(prefix)? {
        let Some(suffix) = name.strip_prefix(prefix) else {
            continue;
        };
        let index = suffix.parse::<u64>().map_err(|_| Error::Corruption {
            object: name.clone(),
            details: format!("segment suffix {:?} is not a valid index", suffix),
        })?;
        segments.push((index, name));
    }
    segments.sort_unstable_by_key(|(index, _)| *index);
    Ok(segments)
}

/// Largest object a segment can occupy in the store.
pub fn max_stored_segment_size(config: &WalConfig) -> usize {
    WAL_HEADER_SIZE + snap::raw::max_compress_len(config.max_segment_size).max(config.max_segment_size)
}

/// Writes header and payload into `out`. Falls back to a raw segment if
/// compression fails. Returns whether the segment ended up compressed.
pub fn encode_segment(payload: &[u8], compress: bool, out: &mut Buffer) -> Result<bool> {
    out.clear();
    if compress {
        out.put_slice(SEGMENT_MAGIC)?;
        out.put_slice(&[FLAG_SNAPPY])?;
        let bound = snap::raw::max_compress_len(payload.len());
        let compressed = out.fill_with(bound, |dst| {
            snap::raw::Encoder::new()
                .compress(payload, dst)
                .map_err(|e| Error::Compression {
                    message: format!("snappy compression failed: {}", e),
                })
        });
        match compressed {
            Ok(_) => return Ok(true),
            Err(e) => {
                warn!(error = %e, "Segment compression failed, storing raw");
                out.clear();
            }
        }
    }
    out.put_slice(SEGMENT_MAGIC)?;
    out.put_slice(&[FLAG_RAW])?;
    out.put_slice(payload)?;
    Ok(false)
}

/// Validates the header of a stored segment and writes the raw payload
/// into `out`. Returns whether the segment was compressed.
pub fn decode_segment(name: &str, stored: &[u8], out: &mut Buffer) -> Result<bool> {
    let corrupt = |details: String| Error::Corruption {
        object: name.to_string(),
        details,
    };

    if stored.len() < WAL_HEADER_SIZE {
        return Err(corrupt(format!("segment of {} bytes has no header", stored.len())));
    }
    if &stored[..3] != SEGMENT_MAGIC {
        return Err(corrupt("bad segment magic".to_string()));
    }

    let body = &stored[WAL_HEADER_SIZE..];
    out.clear();
    match stored[3] {
        FLAG_RAW => {
            out.put_slice(body)
                .map_err(|e| corrupt(format!("payload does not fit replay buffer: {}", e)))?;
            Ok(false)
        }
        FLAG_SNAPPY => {
            let len = snap::raw::decompress_len(body)
                .map_err(|e| corrupt(format!("bad snappy header: {}", e)))?;
            out.fill_with(len, |dst| {
                snap::raw::Decoder::new()
                    .decompress(body, dst)
                    .map_err(|e| corrupt(format!("snappy decompression failed: {}", e)))
            })
            .map_err(|e| match e {
                Error::BufferOverflow { .. } => {
                    corrupt(format!("decompressed size {} exceeds replay buffer", len))
                }
                other => other,
            })?;
            Ok(true)
        }
        flag => Err(corrupt(format!("unknown compression flag {}", flag))),
    }
}

/// Summary of one stored segment, for tooling.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SegmentInfo {
    pub name: String,
    pub index: u64,
    pub stored_bytes: usize,
    pub payload_bytes: usize,
    pub compressed: bool,
    pub entries: usize,
}

/// Decodes every frame of a payload to count entries; fails on the first
/// corrupt frame.
pub fn count_frames(payload: &[u8]) -> Result<usize> {
    let mut offset = 0;
    let mut count = 0;
    while offset < payload.len() {
        let (_, used) = decode_frame(&payload[offset..])?;
        offset += used;
        count += 1;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferManager, HeapBufferManager};
    use crate::object_store::MemoryStorage;
    use std::sync::Arc;

    #[test]
    fn test_segment_roundtrip_both_flags() {
        let manager = HeapBufferManager::new(0);
        let payload = b"abcabcabcabcabcabcabcabc".repeat(10);

        for compress in [true, false] {
            let mut stored = manager.allocate(4096).unwrap();
            let compressed = encode_segment(&payload, compress, &mut stored).unwrap();
            assert_eq!(compressed, compress);
            assert_eq!(&stored.as_slice()[..3], SEGMENT_MAGIC);

            let mut out = manager.allocate(4096).unwrap();
            assert_eq!(decode_segment("s", stored.as_slice(), &mut out).unwrap(), compress);
            assert_eq!(out.as_slice(), payload.as_slice());
        }
    }

    #[test]
    fn test_bad_segments_are_corruption() {
        let manager = HeapBufferManager::new(0);
        let mut out = manager.allocate(64).unwrap();
        for stored in [&b"MN"[..], b"XXX\x00", b"MNW\x07", b"MNW\x01\xff\xff\xff"] {
            assert!(matches!(
                decode_segment("s", stored, &mut out),
                Err(Error::Corruption { .. })
            ));
        }
    }

    #[test]
    fn test_list_segments_sorts_numerically() {
        let storage = Arc::new(MemoryStorage::new());
        let store = ObjectStore::new(storage, Arc::new(HeapBufferManager::new(0)));
        for name in ["wal.log.10", "wal.log.2", "wal.log.0"] {
            store.put(name, b"").unwrap();
        }
        let indices: Vec<u64> = list_segments(&store, "wal.log.")
            .unwrap()
            .into_iter()
            .map(|(i, _)| i)
            .collect();
        assert_eq!(indices, vec![0, 2, 10]);

        store.put("wal.log.x", b"").unwrap();
        assert!(list_segments(&store, "wal.log.").is_err());
    }
}
