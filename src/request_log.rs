//! Bounded in-memory log of completed tunnel requests.
//!
//! A fixed-capacity FIFO: appending at capacity evicts the oldest entry.
//! Reads are newest-first. Nothing is persisted; a restart starts empty.

use std::collections::{HashMap, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::RwLock;

/// Default entry capacity.
pub const LOG_CAPACITY: usize = 200;

/// Bytes of request body captured as a UTF-8 preview per entry.
const BODY_PREVIEW_BYTES: usize = 4 * 1024;

/// Snapshot of one completed request.
#[derive(Debug, Clone, Serialize)]
pub struct RequestLogEntry {
    pub request_id: String,
    /// Unix timestamp in milliseconds when the entry was recorded.
    pub timestamp_ms: u64,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applied_mock_rule: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applied_chaos_rule: Option<String>,
    /// Resolved forward target; absent when a mock or chaos rule answered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_url: Option<String>,
    pub request_headers: HashMap<String, String>,
    /// Lossy UTF-8 preview of the first 4 KiB of the request body.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_preview: Option<String>,
    pub request_content_length: u64,
    pub response_headers: HashMap<String, String>,
}

/// Current Unix time in milliseconds.
pub fn now_ms() -> u64 {
    #[allow(clippy::cast_possible_truncation)]
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// Build the UTF-8 body preview for a log entry.
pub fn body_preview(body: &[u8]) -> Option<String> {
    if body.is_empty() {
        return None;
    }
    let end = body.len().min(BODY_PREVIEW_BYTES);
    Some(String::from_utf8_lossy(&body[..end]).into_owned())
}

/// Fixed-capacity FIFO of [`RequestLogEntry`] items.
pub struct RequestLog {
    entries: RwLock<VecDeque<RequestLogEntry>>,
    capacity: usize,
}

impl RequestLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Append an entry, evicting the oldest if the log is full.
    pub async fn push(&self, entry: RequestLogEntry) {
        let mut entries = self.entries.write().await;
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Up to `limit` entries, newest first.
    pub async fn recent(&self, limit: usize) -> Vec<RequestLogEntry> {
        let entries = self.entries.read().await;
        entries.iter().rev().take(limit).cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Remove all entries.
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

impl Default for RequestLog {
    fn default() -> Self {
        Self::new(LOG_CAPACITY)
    }
}
