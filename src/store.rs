//! Transient result store
//!
//! The only channel between the process that rendered an artifact and the
//! process answering the HTTP request. Semantics follow a key/value service
//! with `SET key value EX ttl`, `GET` and `DEL`: `put` stores bytes that expire
//! if never collected, `take` is an atomic get-and-delete.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use log::debug;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::Result;

/// Keyed TTL blob store used for the artifact handoff
#[async_trait]
pub trait ResultStore: Send + Sync + 'static {
    /// Store `bytes` under `key`, expiring after `ttl` unless taken first
    async fn put(&self, key: &str, bytes: Bytes, ttl: Duration) -> Result<()>;

    /// Remove and return the bytes under `key`. A second `take` after a
    /// successful one returns `None`.
    async fn take(&self, key: &str) -> Result<Option<Bytes>>;
}

struct Entry {
    bytes: Bytes,
    expires_at: Instant,
}

/// In-memory store for single-process deployments
///
/// Expired entries are invisible to `take` immediately and are physically
/// removed by [`MemoryStore::sweep`], which [`MemoryStore::spawn_sweeper`]
/// runs periodically.
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, expired ones included until swept
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired entry; returns how many were removed
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    /// Run [`sweep`](Self::sweep) every `interval` until the store is dropped
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store: Weak<MemoryStore> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else { break };
                let removed = store.sweep();
                if removed > 0 {
                    debug!("Swept {} expired snapshot(s)", removed);
                }
            }
        })
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn put(&self, key: &str, bytes: Bytes, ttl: Duration) -> Result<()> {
        let entry = Entry {
            bytes,
            expires_at: Instant::now() + ttl,
        };
        self.entries.insert(key.to_string(), entry);
        Ok(())
    }

    async fn take(&self, key: &str) -> Result<Option<Bytes>> {
        let taken = self.entries.remove(key);
        Ok(taken
            .filter(|(_, entry)| entry.expires_at > Instant::now())
            .map(|(_, entry)| entry.bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn take_is_at_most_once() {
        let store = MemoryStore::new();
        store
            .put("snapshot:a.png", Bytes::from_static(b"png"), Duration::from_secs(30))
            .await
            .unwrap();

        assert_eq!(store.take("snapshot:a.png").await.unwrap(), Some(Bytes::from_static(b"png")));
        assert_eq!(store.take("snapshot:a.png").await.unwrap(), None);
        assert_eq!(store.take("snapshot:a.png").await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn missing_key_is_absent() {
        let store = MemoryStore::new();
        assert_eq!(store.take("snapshot:nope.png").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_absent_and_swept() {
        let store = MemoryStore::new();
        store
            .put("snapshot:old.pdf", Bytes::from_static(b"%PDF"), Duration::from_secs(30))
            .await
            .unwrap();
        store
            .put("snapshot:new.pdf", Bytes::from_static(b"%PDF"), Duration::from_secs(90))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(store.sweep(), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.take("snapshot:old.pdf").await.unwrap(), None);
        assert!(store.take("snapshot:new.pdf").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn take_ignores_unswept_expired_entry() {
        let store = MemoryStore::new();
        store
            .put("snapshot:x.gif", Bytes::from_static(b"GIF89a"), Duration::from_secs(1))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.take("snapshot:x.gif").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_runs_in_background() {
        let store = Arc::new(MemoryStore::new());
        let sweeper = store.spawn_sweeper(Duration::from_secs(5));
        store
            .put("snapshot:y.png", Bytes::from_static(b"png"), Duration::from_secs(1))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(store.is_empty());

        drop(store);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(sweeper.is_finished());
    }
}
