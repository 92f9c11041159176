//! In-memory cache tier
//!
//! LRU by access order, per-entry TTL, bounded by both entry count and total
//! byte size. Values are opaque serialized bytes; size accounting is their
//! byte length plus the key.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: usize,
}

struct MemEntry {
    value: Arc<Vec<u8>>,
    size: usize,
    expires_at: Instant,
    seq: u64,
}

struct Inner {
    entries: HashMap<String, MemEntry>,
    /// Access sequence -> key; the lowest sequence is the LRU candidate.
    order: BTreeMap<u64, String>,
    next_seq: u64,
    total_bytes: usize,
}

pub struct MemoryCache {
    inner: Mutex<Inner>,
    max_entries: usize,
    max_bytes: usize,
    default_ttl: Duration,
}

impl MemoryCache {
    pub fn new(max_entries: usize, max_bytes: usize, default_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: BTreeMap::new(),
                next_seq: 0,
                total_bytes: 0,
            }),
            max_entries,
            max_bytes,
            default_ttl,
        }
    }

    /// Fetch a live entry and promote it to most-recently-used.
    pub fn get(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        let mut inner = self.inner.lock().unwrap();
        let expired = match inner.entries.get(key) {
            Some(entry) => entry.expires_at <= Instant::now(),
            None => return None,
        };
        if expired {
            Self::remove_locked(&mut inner, key);
            return None;
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        let entry = inner.entries.get_mut(key).unwrap();
        let old_seq = entry.seq;
        entry.seq = seq;
        let value = Arc::clone(&entry.value);
        inner.order.remove(&old_seq);
        inner.order.insert(seq, key.to_string());
        Some(value)
    }

    pub fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let size = key.len() + value.len();
        let mut inner = self.inner.lock().unwrap();

        Self::remove_locked(&mut inner, key);

        while inner.entries.len() >= self.max_entries
            || (inner.total_bytes + size > self.max_bytes && !inner.entries.is_empty())
        {
            let lru_key = match inner.order.values().next() {
                Some(k) => k.clone(),
                None => break,
            };
            Self::remove_locked(&mut inner, &lru_key);
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.order.insert(seq, key.to_string());
        inner.total_bytes += size;
        inner.entries.insert(
            key.to_string(),
            MemEntry {
                value: Arc::new(value),
                size,
                expires_at: Instant::now() + ttl,
                seq,
            },
        );
    }

    pub fn delete(&self, key: &str) {
        let mut inner = self.inner.lock().unwrap();
        Self::remove_locked(&mut inner, key);
    }

    /// Remove every key matched by `pattern`. Callers anchor the pattern so
    /// that `sender:abc` cannot match `sender:abcd`.
    pub fn delete_pattern(&self, pattern: &Regex) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let matches: Vec<String> = inner
            .entries
            .keys()
            .filter(|k| pattern.is_match(k))
            .cloned()
            .collect();
        for key in &matches {
            Self::remove_locked(&mut inner, key);
        }
        matches.len()
    }

    /// Drop all expired entries.
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            Self::remove_locked(&mut inner, key);
        }
        expired.len()
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap();
        CacheStats {
            entries: inner.entries.len(),
            bytes: inner.total_bytes,
        }
    }

    fn remove_locked(inner: &mut Inner, key: &str) {
        if let Some(entry) = inner.entries.remove(key) {
            inner.order.remove(&entry.seq);
            inner.total_bytes -= entry.size;
        }
    }
}
