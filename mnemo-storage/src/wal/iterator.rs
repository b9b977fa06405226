use std::sync::Arc;

use tracing::{debug, warn};

use mnemo_core::error::{Error, Result};

use crate::buffer::Buffer;
use crate::object_store::ObjectStore;

use super::file::decode_segment;
use super::types::{decode_frame, WalEntry};

/// Lazy iterator over every entry of a list of segments, in order.
///
/// The pieces of a split entry come back joined into one entry. A split
/// entry with a missing piece (its tail never written, or its head in a
/// lost segment) is skipped whole.
///
/// Owns two buffers (stored segment and decoded payload) that are reused
/// for every segment and handed back to the buffer manager on drop. The
/// first error ends iteration.
pub struct WalReplay {
    store: Arc<ObjectStore>,
    segments: std::vec::IntoIter<(u64, String)>,
    stored: Option<Buffer>,
    payload: Option<Buffer>,
    current: String,
    offset: usize,
    loaded: bool,
    failed: bool,
}

impl WalReplay {
    pub(crate) fn new(
        store: Arc<ObjectStore>,
        segments: Vec<(u64, String)>,
        stored: Buffer,
        payload: Buffer,
    ) -> Self {
        Self {
            store,
            segments: segments.into_iter(),
            stored: Some(stored),
            payload: Some(payload),
            current: String::new(),
            offset: 0,
            loaded: false,
            failed: false,
        }
    }

    /// Loads the next segment. Returns false when none are left.
    fn load_next(&mut self) -> Result<bool> {
        let Some((index, name)) = self.segments.next() else {
            return Ok(false);
        };
        let (Some(stored), Some(payload)) = (self.stored.as_mut(), self.payload.as_mut()) else {
            return Ok(false);
        };

        self.store.get_into(&name, stored)?;
        let compressed = decode_segment(&name, stored.as_slice(), payload)?;
        debug!(
            segment = %name,
            index,
            compressed,
            payload_bytes = payload.len(),
            "Replaying WAL segment"
        );
        self.current = name;
        self.offset = 0;
        self.loaded = true;
        Ok(true)
    }

    fn next_entry(&mut self) -> Result<Option<WalEntry>> {
        loop {
            if self.loaded {
                if let Some(payload) = &self.payload {
                    if self.offset < payload.len() {
                        let (entry, used) = decode_frame(&payload.as_slice()[self.offset..])
                            .map_err(|e| match e {
                                Error::Corruption { details, .. } => {
                                    Error::Corruption {
                                        object: format!("{} at offset {}", self.current, self.offset),
                                        details,
                                    }
                                }
                                other => other,
                            })?;
                        self.offset += used;
                        return Ok(Some(entry));
                    }
                }
                self.loaded = false;
            }
            if !self.load_next()? {
                return Ok(None);
            }
        }
    }

    fn next_complete(&mut self) -> Result<Option<WalEntry>> {
        let mut group: Option<WalEntry> = None;
        loop {
            let Some(entry) = self.next_entry()? else {
                if let Some(partial) = group {
                    skip_incomplete(&partial);
                }
                return Ok(None);
            };

            let continues = match &group {
                Some(g) => {
                    g.piece.checked_add(1) == Some(entry.piece)
                        && entry.revision == g.revision
                        && entry.table_name == g.table_name
                }
                None => entry.piece == 0,
            };
            if !continues {
                if let Some(partial) = group.take() {
                    skip_incomplete(&partial);
                }
                if entry.piece != 0 {
                    skip_incomplete(&entry);
                    continue;
                }
            }

            let complete = entry.final_piece;
            let mut joined = match group.take() {
                Some(mut g) => {
                    g.piece = entry.piece;
                    g.records.extend(entry.records);
                    g
                }
                None => entry,
            };
            if complete {
                joined.piece = 0;
                joined.final_piece = true;
                return Ok(Some(joined));
            }
            group = Some(joined);
        }
    }
}

fn skip_incomplete(entry: &WalEntry) {
    warn!(
        target: "mnemo::data_loss",
        table = %entry.table_name,
        revision = entry.revision,
        records = entry.records.len(),
        "Skipping split WAL entry with missing pieces"
    );
}

impl Iterator for WalReplay {
    type Item = Result<WalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.next_complete() {
            Ok(entry) => entry.map(Ok),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

impl Drop for WalReplay {
    fn drop(&mut self) {
        let buffers = self.store.buffers();
        if let Some(buffer) = self.stored.take() {
            buffers.release(buffer);
        }
        if let Some(buffer) = self.payload.take() {
            buffers.release(buffer);
        }
    }
}
