//! # Common Utilities
//!
//! Utility functions and helpers used throughout MnemoDB.

use std::time::Duration;

use chrono::Utc;
use rand::Rng;

/// Milliseconds since the unix epoch.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Renders a byte count for log lines, e.g. `1.50 KiB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["KiB", "MiB", "GiB", "TiB", "PiB"];

    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut size = bytes as f64 / 1024.0;
    let mut unit = 0;
    while size >= 1024.0 && unit + 1 < UNITS.len() {
        size /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", size, UNITS[unit])
}

/// CRC32 checksum of a byte slice.
#[inline]
pub fn crc32_checksum(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Exponential backoff with full jitter.
///
/// Each call to [`Backoff::next_delay`] doubles the ceiling (capped at
/// `max`) and returns a random delay in `[ceiling / 2, ceiling]`.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
    attempts: u32,
    max_attempts: u32,
}

impl Backoff {
    /// `max_attempts == 0` means the caller may retry forever.
    pub fn new(initial: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            current: initial,
            max,
            attempts: 0,
            max_attempts,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Returns `None` once the attempt budget is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempts += 1;
        if self.max_attempts != 0 && self.attempts >= self.max_attempts {
            return None;
        }

        let ceiling = self.current.min(self.max);
        self.current = (self.current * 2).min(self.max);

        let ceiling_ms = ceiling.as_millis().max(1) as u64;
        let jittered = rand::thread_rng().gen_range(ceiling_ms / 2..=ceiling_ms);
        Some(Duration::from_millis(jittered))
    }
}
