//! Two-tier cache manager
//!
//! Memory tier for listings, statuses and metadata; persistent tier for
//! message bodies (immutable once a UID is assigned, so they keep a 7-day
//! TTL). Keys are colon-separated for prefix locality; every invalidation
//! pattern is anchored so `sender:abc` can never take `sender:abcd` with it.

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

use super::memory::{CacheStats, MemoryCache};
use super::persistent::PersistentCache;

/// TTLs per cached kind.
pub mod ttl {
    use std::time::Duration;

    pub const API_KEY: Duration = Duration::from_millis(600_000);
    pub const SENDER: Duration = Duration::from_millis(600_000);
    pub const FOLDERS: Duration = Duration::from_millis(300_000);
    pub const FOLDER_STATUS: Duration = Duration::from_millis(120_000);
    pub const MESSAGES: Duration = Duration::from_millis(120_000);
    pub const MESSAGE_BODY: Duration = Duration::from_millis(604_800_000);
}

/// Cache key constructors.
pub mod keys {
    pub const SENDERS_ALL: &str = "senders:all";

    pub fn sender(email: &str) -> String {
        format!("sender:{}", email.to_lowercase())
    }

    pub fn folders(sender_id: &str) -> String {
        format!("folders:{}", sender_id)
    }

    pub fn status(sender_id: &str, folder: &str) -> String {
        format!("status:{}:{}", sender_id, folder)
    }

    pub fn messages(sender_id: &str, folder: &str, query: Option<&str>) -> String {
        match query {
            Some(q) => format!("messages:{}:{}|q:{}", sender_id, folder, q),
            None => format!("messages:{}:{}", sender_id, folder),
        }
    }

    pub fn message(sender_id: &str, folder: &str, uid: u32) -> String {
        format!("message:{}:{}:{}", sender_id, folder, uid)
    }

    pub fn body(sender_id: &str, folder: &str, uid: u32) -> String {
        format!("body:{}:{}:{}", sender_id, folder, uid)
    }
}

pub struct CacheManager {
    memory: MemoryCache,
    persistent: PersistentCache,
}

impl CacheManager {
    pub fn new(memory: MemoryCache, persistent: PersistentCache) -> Self {
        Self { memory, persistent }
    }

    // Memory tier, JSON-typed.

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = self.memory.get(key)?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!("Dropping undecodable cache entry {}: {}", key, e);
                self.memory.delete(key);
                None
            }
        }
    }

    pub fn put_json<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        match serde_json::to_vec(value) {
            Ok(bytes) => self.memory.set(key, bytes, Some(ttl)),
            Err(e) => tracing::warn!("Failed to serialize cache entry {}: {}", key, e),
        }
    }

    pub fn delete(&self, key: &str) {
        self.memory.delete(key);
    }

    // Persistent tier (bodies). Blocking SQLite work runs off the async
    // threads; the connection mutex is never held across an await.

    pub async fn get_body_blob(&self, key: &str) -> Option<Vec<u8>> {
        let key = key.to_string();
        let persistent = self.persistent_handle();
        tokio::task::spawn_blocking(move || persistent.get(&key))
            .await
            .ok()?
            .unwrap_or_else(|e| {
                tracing::warn!("Persistent cache read failed: {}", e);
                None
            })
    }

    pub async fn put_body_blob(&self, key: &str, value: Vec<u8>) {
        let key = key.to_string();
        let persistent = self.persistent_handle();
        let result = tokio::task::spawn_blocking(move || {
            persistent.set(&key, &value, ttl::MESSAGE_BODY)
        })
        .await;
        if let Ok(Err(e)) = result {
            tracing::warn!("Persistent cache write failed: {}", e);
        }
    }

    // Invalidation. Every mutating upstream call funnels through one of
    // these so a post-mutation read can never see a pre-mutation value.

    pub async fn invalidate_sender(&self, sender_id: &str) {
        let sid = regex::escape(sender_id);
        self.delete_memory_pattern(&format!("^folders:{}$", sid));
        self.delete_memory_pattern(&format!("^status:{}:.*$", sid));
        self.delete_memory_pattern(&format!("^messages:{}:.*$", sid));
        self.delete_memory_pattern(&format!("^message:{}:.*$", sid));
        self.delete_memory_pattern("^sender:.*$");
        self.memory.delete(keys::SENDERS_ALL);
        self.delete_persistent_like(format!("body:{}:%", sender_id)).await;
    }

    pub async fn invalidate_folder(&self, sender_id: &str, folder: &str) {
        let sid = regex::escape(sender_id);
        let name = regex::escape(folder);
        self.memory.delete(&keys::status(sender_id, folder));
        self.delete_memory_pattern(&format!("^messages:{}:{}(\\|q:.*)?$", sid, name));
        self.delete_memory_pattern(&format!("^message:{}:{}:.*$", sid, name));
        self.memory.delete(&keys::folders(sender_id));
        self.delete_persistent_like(format!("body:{}:{}:%", sender_id, folder))
            .await;
    }

    pub async fn invalidate_message(&self, sender_id: &str, folder: &str, uid: u32) {
        let sid = regex::escape(sender_id);
        let name = regex::escape(folder);
        self.memory.delete(&keys::message(sender_id, folder, uid));
        self.delete_memory_pattern(&format!("^messages:{}:{}(\\|q:.*)?$", sid, name));
        self.memory.delete(&keys::status(sender_id, folder));
        let key = keys::body(sender_id, folder, uid);
        let persistent = self.persistent_handle();
        let _ = tokio::task::spawn_blocking(move || persistent.delete(&key)).await;
    }

    /// Drop the cached sender directory (`sender:*` and `senders:all`).
    pub fn invalidate_senders(&self) {
        self.delete_memory_pattern("^sender:.*$");
        self.memory.delete(keys::SENDERS_ALL);
    }

    pub async fn prune(&self) {
        let dropped = self.memory.prune();
        let persistent = self.persistent_handle();
        let result = tokio::task::spawn_blocking(move || persistent.prune()).await;
        match result {
            Ok(Ok(rows)) if rows > 0 || dropped > 0 => {
                tracing::debug!("Cache prune: {} memory, {} persistent", dropped, rows);
            }
            Ok(Err(e)) => tracing::warn!("Persistent cache prune failed: {}", e),
            _ => {}
        }
    }

    pub fn memory_stats(&self) -> CacheStats {
        self.memory.stats()
    }

    /// Run `prune` on both tiers every five minutes.
    pub fn start_prune_task(manager: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(300));
            interval.tick().await;
            loop {
                interval.tick().await;
                manager.prune().await;
            }
        })
    }

    fn delete_memory_pattern(&self, pattern: &str) {
        match Regex::new(pattern) {
            Ok(re) => {
                self.memory.delete_pattern(&re);
            }
            Err(e) => tracing::warn!("Bad cache pattern {}: {}", pattern, e),
        }
    }

    async fn delete_persistent_like(&self, pattern: String) {
        let persistent = self.persistent_handle();
        let result = tokio::task::spawn_blocking(move || persistent.delete_like(&pattern)).await;
        if let Ok(Err(e)) = result {
            tracing::warn!("Persistent cache delete failed: {}", e);
        }
    }

    fn persistent_handle(&self) -> PersistentCache {
        self.persistent.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn manager() -> CacheManager {
        CacheManager::new(
            MemoryCache::new(1000, 1024 * 1024, Duration::from_secs(60)),
            PersistentCache::open_in_memory(1024 * 1024).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_invalidate_folder_is_scoped() {
        let m = manager();
        m.put_json(&keys::status("s1", "Inbox"), &1u32, ttl::FOLDER_STATUS);
        m.put_json(&keys::status("s1", "Sent"), &2u32, ttl::FOLDER_STATUS);
        m.put_json(&keys::message("s1", "Inbox", 5), &3u32, ttl::MESSAGES);
        m.put_json(
            &keys::messages("s1", "Inbox", Some("uids=1:10")),
            &4u32,
            ttl::MESSAGES,
        );

        m.invalidate_folder("s1", "Inbox").await;

        assert!(m.get_json::<u32>(&keys::status("s1", "Inbox")).is_none());
        assert!(m.get_json::<u32>(&keys::message("s1", "Inbox", 5)).is_none());
        assert!(m
            .get_json::<u32>(&keys::messages("s1", "Inbox", Some("uids=1:10")))
            .is_none());
        assert_eq!(m.get_json::<u32>(&keys::status("s1", "Sent")), Some(2));
    }

    #[tokio::test]
    async fn test_invalidate_sender_does_not_cross_ids() {
        let m = manager();
        m.put_json(&keys::folders("abc"), &1u32, ttl::FOLDERS);
        m.put_json(&keys::folders("abcd"), &2u32, ttl::FOLDERS);

        m.invalidate_sender("abc").await;

        assert!(m.get_json::<u32>(&keys::folders("abc")).is_none());
        assert_eq!(m.get_json::<u32>(&keys::folders("abcd")), Some(2));
    }

    #[tokio::test]
    async fn test_body_blob_roundtrip() {
        let m = manager();
        let key = keys::body("s1", "Inbox", 9);
        m.put_body_blob(&key, b"raw".to_vec()).await;
        assert_eq!(m.get_body_blob(&key).await.unwrap(), b"raw");
        m.invalidate_message("s1", "Inbox", 9).await;
        assert!(m.get_body_blob(&key).await.is_none());
    }
}
