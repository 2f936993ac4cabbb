//! Per-instance traffic counters
//!
//! Connection tasks add to the pending counters when a relay finishes; the
//! traffic collector drains them with atomic swaps, so a write racing with a
//! drain lands either in this snapshot or the next one.

use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use super::hooks::StatsCollector;

/// Drained counter values
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficSnapshot {
    pub upload: u64,
    pub download: u64,
    pub requests: u64,
}

impl TrafficSnapshot {
    pub fn is_empty(&self) -> bool {
        self.upload == 0 && self.download == 0 && self.requests == 0
    }
}

/// Counters owned by one server instance
#[derive(Debug, Default)]
pub struct InstanceStats {
    upload_bytes: AtomicU64,
    download_bytes: AtomicU64,
    request_count: AtomicU64,
    /// Unix millis of the last accepted connection, 0 = never
    last_active_ms: AtomicI64,
}

impl InstanceStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the instance active now
    pub fn touch(&self) {
        self.last_active_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_active_at(&self) -> Option<DateTime<Utc>> {
        match self.last_active_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Utc.timestamp_millis_opt(ms).single(),
        }
    }

    /// Seed the activity timestamp, e.g. from storage
    pub fn set_last_active_at(&self, at: Option<DateTime<Utc>>) {
        self.last_active_ms
            .store(at.map(|t| t.timestamp_millis()).unwrap_or(0), Ordering::Relaxed);
    }

    /// Current values without resetting
    pub fn peek(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            upload: self.upload_bytes.load(Ordering::Relaxed),
            download: self.download_bytes.load(Ordering::Relaxed),
            requests: self.request_count.load(Ordering::Relaxed),
        }
    }

    /// Swap every counter to zero and return what was there
    pub fn take(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            upload: self.upload_bytes.swap(0, Ordering::AcqRel),
            download: self.download_bytes.swap(0, Ordering::AcqRel),
            requests: self.request_count.swap(0, Ordering::AcqRel),
        }
    }

    /// Put a drained snapshot back, used when persisting it failed
    pub fn restore(&self, snapshot: TrafficSnapshot) {
        self.upload_bytes
            .fetch_add(snapshot.upload, Ordering::AcqRel);
        self.download_bytes
            .fetch_add(snapshot.download, Ordering::AcqRel);
        self.request_count
            .fetch_add(snapshot.requests, Ordering::AcqRel);
    }
}

impl StatsCollector for InstanceStats {
    fn record_request(&self) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    fn record_upload(&self, bytes: u64) {
        self.upload_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    fn record_download(&self, bytes: u64) {
        self.download_bytes.fetch_add(bytes, Ordering::Relaxed);
    }
}
