//! Write-Ahead Log (WAL): background batching, compression and durable
//! segment writes.
//!
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Write Path                              │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  Table 1 ──┐  append()                                          │
//! │  Table 2 ──┼──► split ──► Channel ──► Worker ──► Segment put    │
//! │  Table 3 ──┘              (FIFO)     (batch,     (retry with    │
//! │                                       snappy)     backoff)      │
//! └─────────────────────────────────────────────────────────────────┘
//!
//! Segment Layout
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Header (4 bytes): "MNW" + compression flag                 │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Payload (raw or snappy)                                    │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │ Frame: length (4) | CRC32 (4) | entry body          │    │
//! │  ├─────────────────────────────────────────────────────┤    │
//! │  │ Frame 2...N                                         │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!
//! The worker keeps the current segment's uncompressed payload in memory
//! and rewrites the whole segment object on every flush, so a segment in
//! the store is always a valid prefix of the log. A segment is sealed once
//! it reaches the flush threshold or cannot hold the next frame; writing
//! then continues at the next index.
//!
//! The rewrite costs write volume: a segment flushed after every small
//! batch is written O(n²) bytes in total before it seals, bounded by
//! `flush_threshold` (and `max_segment_size`). Keep the threshold small
//! when batches are small and frequent. In exchange every stored object
//! is self-contained and replay never stitches partial objects together.
//!
//! Segment puts run on tokio's blocking pool. A flush that cannot be
//! written keeps the segment pending, and the next flush retries it; the
//! entries are declared lost (`mnemo::data_loss`) only if the segment is
//! sealed or the worker exits while it is still unwritten.
//!
//! Entries too large for one segment are split; pieces may land in
//! different segments, and replay drops a split entry unless every piece
//! survived.

mod file;
mod iterator;
mod types;

pub use file::{count_frames, decode_segment, list_segments, segment_name, SegmentInfo};
pub use iterator::WalReplay;
pub use types::{
    decode_frame, WalCheckpoint, WalEntry, WalEntryType, WalRecord, WalTombstone,
    FRAME_HEADER_SIZE, SEGMENT_MAGIC,
};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use mnemo_core::config::WalConfig;
use mnemo_core::error::{Error, Result};
use mnemo_core::metrics::Metrics;
use mnemo_core::utils::{format_bytes, Backoff};

use crate::buffer::Buffer;
use crate::object_store::ObjectStore;

use file::{encode_segment, max_stored_segment_size};

/// Destination of WAL entries. Tables log through this seam so they can
/// be exercised without a background worker.
pub trait WalSink: Send + Sync {
    fn append(&self, entry: WalEntry) -> Result<()>;
}

enum Command {
    Append(Vec<u8>),
    Flush(oneshot::Sender<()>),
}

pub struct WalManager {
    config: WalConfig,
    store: Arc<ObjectStore>,
    metrics: Metrics,
    sender: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    terminated: AtomicBool,
    /// Segments with a lower index existed before this manager started.
    first_segment: u64,
}

impl WalManager {
    /// Opens the log and starts the background worker. New segments start
    /// after the highest existing index.
    pub async fn open(config: WalConfig, store: Arc<ObjectStore>, metrics: Metrics) -> Result<Self> {
        config.validate()?;

        let existing = list_segments(&store, &config.segment_prefix)?;
        let first_segment = match existing.last() {
            Some((index, _)) => index.checked_add(1).ok_or_else(|| Error::Internal {
                message: "WAL segment index space exhausted".to_string(),
            })?,
            None => 0,
        };

        let output = store.buffers().allocate(config.max_segment_size)?;
        let compressed = match store.buffers().allocate(max_stored_segment_size(&config)) {
            Ok(buffer) => buffer,
            Err(e) => {
                store.buffers().release(output);
                return Err(e);
            }
        };

        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = WalWorker {
            config: config.clone(),
            store: Arc::clone(&store),
            metrics: metrics.clone(),
            output: Some(output),
            compressed: Some(compressed),
            segment_index: first_segment,
            dirty: false,
        };
        let handle = tokio::spawn(worker.run(receiver));

        info!(
            prefix = %config.segment_prefix,
            existing_segments = existing.len(),
            next_segment = first_segment,
            compression = config.compression,
            "WAL opened"
        );

        Ok(Self {
            config,
            store,
            metrics,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(handle)),
            terminated: AtomicBool::new(false),
            first_segment,
        })
    }

    pub fn config(&self) -> &WalConfig {
        &self.config
    }

    /// Queues an entry. Oversized entries are split at record boundaries
    /// first; either every piece is queued or none is.
    pub fn append(&self, entry: WalEntry) -> Result<()> {
        if self.terminated.load(Ordering::Acquire) {
            return Err(Error::WalTerminated);
        }

        let frames = entry
            .split(self.config.max_entry_size())?
            .iter()
            .map(WalEntry::encode_frame)
            .collect::<Result<Vec<_>>>()?;

        let sender = self.sender.lock();
        let sender = sender.as_ref().ok_or(Error::WalTerminated)?;
        for frame in frames {
            let len = frame.len() as u64;
            sender
                .send(Command::Append(frame))
                .map_err(|_| Error::WalTerminated)?;
            self.metrics.record_wal_append(len);
        }
        Ok(())
    }

    /// Resolves once every entry appended before the call has been
    /// written, or its write attempts for this flush are exhausted.
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        {
            let sender = self.sender.lock();
            let sender = sender.as_ref().ok_or(Error::WalTerminated)?;
            sender
                .send(Command::Flush(tx))
                .map_err(|_| Error::WalTerminated)?;
        }
        rx.await.map_err(|_| Error::WriteAheadLog {
            message: "WAL worker stopped before completing flush".to_string(),
            source: None,
        })
    }

    /// Stops accepting entries, drains and writes everything queued, and
    /// waits for the worker to exit. Safe to call more than once.
    pub async fn terminate(&self) -> Result<()> {
        self.terminated.store(true, Ordering::Release);
        drop(self.sender.lock().take());

        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            handle.await.map_err(|e| Error::WriteAheadLog {
                message: "WAL worker panicked".to_string(),
                source: Some(Box::new(e)),
            })?;
            info!("WAL terminated");
        }
        Ok(())
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Lazily replays every segment that existed when the log was opened.
    pub fn read_all(&self) -> Result<WalReplay> {
        let segments: Vec<_> = list_segments(&self.store, &self.config.segment_prefix)?
            .into_iter()
            .filter(|(index, _)| *index < self.first_segment)
            .collect();

        let stored = self.store.buffers().allocate(max_stored_segment_size(&self.config))?;
        let payload = match self.store.buffers().allocate(self.config.max_segment_size) {
            Ok(buffer) => buffer,
            Err(e) => {
                self.store.buffers().release(stored);
                return Err(e);
            }
        };

        info!(segments = segments.len(), "Replaying WAL");
        Ok(WalReplay::new(Arc::clone(&self.store), segments, stored, payload))
    }

    /// Describes every stored segment without replaying it into tables.
    pub fn inspect(store: &ObjectStore, config: &WalConfig) -> Result<Vec<SegmentInfo>> {
        let mut stored = store.buffers().allocate(max_stored_segment_size(config))?;
        let mut payload = match store.buffers().allocate(config.max_segment_size) {
            Ok(buffer) => buffer,
            Err(e) => {
                store.buffers().release(stored);
                return Err(e);
            }
        };

        let result = list_segments(store, &config.segment_prefix).and_then(|segments| {
            segments
                .into_iter()
                .map(|(index, name)| -> Result<SegmentInfo> {
                    store.get_into(&name, &mut stored)?;
                    let compressed = decode_segment(&name, stored.as_slice(), &mut payload)?;
                    Ok(SegmentInfo {
                        index,
                        stored_bytes: stored.len(),
                        payload_bytes: payload.len(),
                        compressed,
                        entries: count_frames(payload.as_slice())?,
                        name,
                    })
                })
                .collect()
        });

        store.buffers().release(stored);
        store.buffers().release(payload);
        result
    }
}

impl WalSink for WalManager {
    fn append(&self, entry: WalEntry) -> Result<()> {
        WalManager::append(self, entry)
    }
}

impl Drop for WalManager {
    fn drop(&mut self) {
        if !self.terminated.load(Ordering::Acquire) {
            warn!("WAL manager dropped without terminate(); queued entries are flushed in the background");
        }
    }
}

struct WalWorker {
    config: WalConfig,
    store: Arc<ObjectStore>,
    metrics: Metrics,
    output: Option<Buffer>,
    compressed: Option<Buffer>,
    segment_index: u64,
    /// Output holds frames not yet written to the store.
    dirty: bool,
}

impl WalWorker {
    async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<Command>) {
        let idle = self.config.idle_wait();
        loop {
            let command = match tokio::time::timeout(idle, receiver.recv()).await {
                Ok(Some(command)) => command,
                Ok(None) => break,
                Err(_) => {
                    if self.dirty {
                        self.flush().await;
                    }
                    continue;
                }
            };

            let mut pending = Some(command);
            while let Some(command) = pending.take() {
                self.handle(command).await;
                pending = receiver.try_recv().ok();
            }
            if self.dirty {
                self.flush().await;
            }
        }

        if self.dirty {
            self.flush().await;
        }
        self.discard_unwritten();
        let buffers = self.store.buffers();
        if let Some(buffer) = self.output.take() {
            buffers.release(buffer);
        }
        if let Some(buffer) = self.compressed.take() {
            buffers.release(buffer);
        }
        debug!("WAL worker exited");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Append(frame) => {
                let Some(output) = self.output.as_ref() else {
                    return;
                };
                if frame.len() > output.remaining() {
                    if self.dirty {
                        self.flush().await;
                    }
                    self.roll_over();
                }
                let appended = match self.output.as_mut() {
                    Some(output) => output.put_slice(&frame),
                    None => return,
                };
                match appended {
                    Ok(()) => self.dirty = true,
                    // split() bounds every frame by the segment capacity
                    Err(e) => {
                        error!(
                            target: "mnemo::data_loss",
                            error = %e,
                            frame_bytes = frame.len(),
                            "WAL frame does not fit an empty segment, entry dropped"
                        );
                        self.metrics.record_data_loss();
                    }
                }
                let threshold_reached = self
                    .output
                    .as_ref()
                    .map_or(false, |o| o.len() >= self.config.flush_threshold);
                // an unwritten segment stays open so later flushes retry it
                if threshold_reached && self.flush().await {
                    self.roll_over();
                }
            }
            Command::Flush(done) => {
                if self.dirty {
                    self.flush().await;
                }
                let _ = done.send(());
            }
        }
    }

    fn roll_over(&mut self) {
        if self.output.as_ref().map_or(true, |o| o.is_empty()) {
            return;
        }
        self.discard_unwritten();
        if let Some(output) = self.output.as_mut() {
            output.clear();
        }
        self.segment_index = self.segment_index.saturating_add(1);
        debug!(segment = self.segment_index, "WAL segment rolled over");
    }

    /// Gives up on the current segment's unwritten frames.
    fn discard_unwritten(&mut self) {
        if !self.dirty {
            return;
        }
        let payload = self.output.as_ref().map_or(0, |o| o.len());
        error!(
            target: "mnemo::data_loss",
            segment = %segment_name(&self.config.segment_prefix, self.segment_index),
            payload = %format_bytes(payload as u64),
            "WAL segment was never written; its latest entries are lost"
        );
        self.metrics.record_data_loss();
        self.dirty = false;
    }

    /// Writes the current segment, retrying with backoff. Returns whether
    /// the store now holds everything buffered; otherwise the segment
    /// stays dirty for the next flush.
    async fn flush(&mut self) -> bool {
        if self.output.is_none() {
            return false;
        }
        let (Some(output), Some(mut stored)) = (self.output.as_ref(), self.compressed.take()) else {
            return false;
        };
        let name = segment_name(&self.config.segment_prefix, self.segment_index);
        let payload_len = output.len();

        let is_compressed = match encode_segment(output.as_slice(), self.config.compression, &mut stored) {
            Ok(flag) => flag,
            Err(e) => {
                warn!(segment = %name, error = %e, "Failed to encode WAL segment");
                self.compressed = Some(stored);
                return false;
            }
        };

        let mut backoff = Backoff::new(
            std::time::Duration::from_millis(self.config.initial_backoff_ms),
            std::time::Duration::from_millis(self.config.max_backoff_ms),
            self.config.max_attempts,
        );
        let written = loop {
            let (returned, result) = match self.put_segment(&name, stored).await {
                Ok(pair) => pair,
                Err(e) => {
                    error!(segment = %name, error = %e, "WAL segment write task failed");
                    self.compressed = self
                        .store
                        .buffers()
                        .allocate(max_stored_segment_size(&self.config))
                        .ok();
                    return false;
                }
            };
            stored = returned;
            match result {
                Ok(()) => {
                    debug!(
                        segment = %name,
                        payload = %format_bytes(payload_len as u64),
                        stored = %format_bytes(stored.len() as u64),
                        compressed = is_compressed,
                        "WAL segment written"
                    );
                    self.metrics.record_segment_write(stored.len() as u64);
                    break true;
                }
                Err(e) => match backoff.next_delay() {
                    Some(delay) => {
                        warn!(
                            segment = %name,
                            attempt = backoff.attempts(),
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "WAL segment write failed, retrying"
                        );
                        self.metrics.record_write_retry();
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        warn!(
                            segment = %name,
                            attempts = backoff.attempts(),
                            error = %e,
                            "WAL segment write attempts exhausted; keeping it for the next flush"
                        );
                        break false;
                    }
                },
            }
        };
        self.compressed = Some(stored);
        if written {
            self.dirty = false;
        }
        written
    }

    /// Puts a segment from the blocking pool. The buffer is handed back
    /// with the store's result.
    async fn put_segment(&self, name: &str, stored: Buffer) -> Result<(Buffer, Result<()>)> {
        let store = Arc::clone(&self.store);
        let name = name.to_string();
        tokio::task::spawn_blocking(move || {
            let result = store.put(&name, stored.as_slice());
            (stored, result)
        })
        .await
        .map_err(|e| Error::WriteAheadLog {
            message: "segment write task failed".to_string(),
            source: Some(Box::new(e)),
        })
    }
}
