//! In-process [`KvBackend`] used by the test suite to drive deterministic
//! multi-node scenarios without a live etcd cluster (spec.md §8).
//!
//! TTL expiry and compare-and-swap semantics are implemented faithfully
//! enough to exercise the HA cycle; this is not a general-purpose KV
//! store and is never wired into the production binary.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

use crate::error::KvResult;

use super::KvBackend;

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if now >= at)
    }
}

/// Deterministic in-memory stand-in for an etcd cluster.
pub struct MemoryBackend {
    store: Mutex<HashMap<String, Entry>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            store: Mutex::new(HashMap::new()),
        }
    }

    async fn current_value(&self, path: &str) -> Option<String> {
        let now = Instant::now();
        let mut store = self.store.lock().await;
        let expired = store.get(path).is_some_and(|e| e.is_expired(now));
        if expired {
            store.remove(path);
            return None;
        }
        store.get(path).map(|e| e.value.clone())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn get(&self, path: &str) -> KvResult<Option<String>> {
        Ok(self.current_value(path).await)
    }

    async fn list_children(&self, prefix: &str) -> KvResult<Vec<(String, String)>> {
        let now = Instant::now();
        let mut store = self.store.lock().await;
        let expired: Vec<String> = store
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            store.remove(&key);
        }

        let mut out: Vec<(String, String)> = store
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| (k[prefix.len()..].to_string(), e.value.clone()))
            .collect();
        out.sort();
        Ok(out)
    }

    async fn put(&self, path: &str, value: &str, ttl: Option<u64>) -> KvResult<()> {
        let expires_at = ttl.map(|secs| Instant::now() + Duration::from_secs(secs));
        self.store.lock().await.insert(
            path.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, path: &str) -> KvResult<()> {
        self.store.lock().await.remove(path);
        Ok(())
    }

    async fn put_if_absent(&self, path: &str, value: &str, ttl: Option<u64>) -> KvResult<bool> {
        if self.current_value(path).await.is_some() {
            return Ok(false);
        }
        self.put(path, value, ttl).await?;
        Ok(true)
    }

    async fn put_if_value(
        &self,
        path: &str,
        value: &str,
        prev_value: &str,
        ttl: Option<u64>,
    ) -> KvResult<bool> {
        let current = self.current_value(path).await.unwrap_or_default();
        if current != prev_value {
            return Ok(false);
        }
        self.put(path, value, ttl).await?;
        Ok(true)
    }

    async fn delete_if_value(&self, path: &str, prev_value: &str) -> KvResult<bool> {
        let current = self.current_value(path).await.unwrap_or_default();
        if current != prev_value {
            return Ok(false);
        }
        self.delete(path).await?;
        Ok(true)
    }
}
