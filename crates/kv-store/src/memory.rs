//! In-process TTL store
//!
//! Entries carry a deadline measured on the tokio clock, so tests can drive
//! expiry with `tokio::time::pause()` and `advance()`. Expired entries are
//! dropped on read of the same key, on every write, and by `purge_expired`.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::{KvStore, StoreFuture};

struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Volatile key-value store held in process memory.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of unexpired entries.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        entries.values().filter(|e| e.is_live(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop every expired entry. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now));
        before - entries.len()
    }
}

impl KvStore for MemoryStore {
    fn id(&self) -> &str {
        "memory"
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>> {
        Box::pin(async move {
            let now = Instant::now();
            let mut entries = self.entries.lock().await;
            match entries.get(key) {
                Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
                Some(_) => {
                    entries.remove(key);
                    debug!(key, "expired entry dropped on read");
                    Ok(None)
                }
                None => Ok(None),
            }
        })
    }

    fn put<'a>(&'a self, key: &'a str, value: String, ttl: Duration) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let now = Instant::now();
            let entry = Entry {
                value,
                expires_at: now + ttl,
            };
            let mut entries = self.entries.lock().await;
            entries.retain(|_, e| e.is_live(now));
            entries.insert(key.to_string(), entry);
            Ok(())
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.entries.lock().await.remove(key);
            Ok(())
        })
    }
}
