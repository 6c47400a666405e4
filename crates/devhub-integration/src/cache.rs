//! TTL cache for device reads.
//!
//! Entries are expired lazily: a read past an entry's ttl is a miss and
//! deletes the entry. Writes compact the map, dropping every expired entry,
//! once it grows past the compaction threshold. There is no background sweep.

use devhub_core::{DeviceDiscovery, DeviceInfo, DeviceStatusUpdate};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_COMPACTION_THRESHOLD: usize = 1000;

/// Cached value kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum CachePayload {
    Status(DeviceStatusUpdate),
    Info(DeviceInfo),
    Capabilities(Vec<String>),
    Discovery(Vec<DeviceDiscovery>),
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    written_at: Instant,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    /// Expired strictly after `ttl` has elapsed.
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.written_at) > self.ttl
    }
}

pub struct TtlCache<V> {
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
    compaction_threshold: usize,
}

impl<V: Clone> TtlCache<V> {
    pub fn new() -> Self {
        Self::with_compaction_threshold(DEFAULT_COMPACTION_THRESHOLD)
    }

    pub fn with_compaction_threshold(compaction_threshold: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            compaction_threshold,
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock();
        let expired = entries.get(key)?.is_expired(Instant::now());
        if expired {
            entries.remove(key);
            return None;
        }
        entries.get(key).map(|e| e.value.clone())
    }

    pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        entries.insert(
            key.into(),
            CacheEntry {
                value,
                written_at: now,
                ttl,
            },
        );
        if entries.len() > self.compaction_threshold {
            let before = entries.len();
            entries.retain(|_, e| !e.is_expired(now));
            tracing::debug!(
                before,
                after = entries.len(),
                "compacted device cache"
            );
        }
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries.lock().remove(key).is_some()
    }

    /// Drop every entry whose key has `device_id` as one of its
    /// colon-separated segments. Returns how many were removed.
    pub fn invalidate_device(&self, device_id: &str) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|key, _| !key.split(':').any(|segment| segment == device_id));
        before - entries.len()
    }

    /// Drop every entry whose key starts with `prefix`.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl<V: Clone> Default for TtlCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

pub fn status_key(device_id: &str) -> String {
    format!("status:{}", device_id)
}

pub fn info_key(device_id: &str) -> String {
    format!("info:{}", device_id)
}

pub fn capabilities_key(device_id: &str) -> String {
    format!("capabilities:{}", device_id)
}

pub fn discovery_key(protocol: Option<&str>, device_type: Option<&str>) -> String {
    format!(
        "discovery:{}:{}",
        protocol.unwrap_or("*"),
        device_type.unwrap_or("*")
    )
}
