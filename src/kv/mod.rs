//! Lease-based membership and leader-lock primitives over a hierarchical
//! key-value store.
//!
//! The wire protocol of the store itself is out of scope for the core
//! (spec.md §1); everything here is expressed against the [`KvBackend`]
//! trait so the HA cycle and state handler never see a concrete client.

mod client;
mod etcd_backend;
mod memory_backend;

pub use client::KvClient;
pub use etcd_backend::EtcdBackend;
pub use memory_backend::MemoryBackend;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{KvError, KvResult};

/// A cluster member's advertised identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub hostname: String,
    pub address: String,
}

/// Bounded-attempt, fixed-delay retry policy for transport failures.
///
/// `NotFound`, `CompareFailed`, and `AlreadyExists` are never retried —
/// they are first-class outcomes, not transient failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub const fn once() -> Self {
        Self {
            max_attempts: 1,
            delay: Duration::from_secs(0),
        }
    }

    pub const fn attempts(max_attempts: u32, delay: Duration) -> Self {
        Self { max_attempts, delay }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::once()
    }
}

/// Runs `op` up to `policy.max_attempts` times, sleeping `policy.delay`
/// between attempts, but only for [`KvError::Transport`] failures.
pub(crate) async fn with_retry<T, F, Fut>(policy: RetryPolicy, mut op: F) -> KvResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = KvResult<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(KvError::Transport(msg)) if attempt < policy.max_attempts => {
                tracing::debug!(attempt, max = policy.max_attempts, %msg, "kv transport error, retrying");
                tokio::time::sleep(policy.delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Abstraction over the wire protocol of the coordination store. All
/// paths passed to backend methods are already fully qualified (scope
/// applied by [`KvClient`]).
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Reads a single key's value.
    async fn get(&self, path: &str) -> KvResult<Option<String>>;

    /// Lists immediate children of `prefix` as (leaf-name, value) pairs.
    /// Returns an empty vector if `prefix` has no children.
    async fn list_children(&self, prefix: &str) -> KvResult<Vec<(String, String)>>;

    /// Unconditional write, optionally leased.
    async fn put(&self, path: &str, value: &str, ttl: Option<u64>) -> KvResult<()>;

    /// Unconditional delete. Deleting an absent key is not an error.
    async fn delete(&self, path: &str) -> KvResult<()>;

    /// Compare-and-swap create: succeeds only if `path` does not exist.
    async fn put_if_absent(&self, path: &str, value: &str, ttl: Option<u64>) -> KvResult<bool>;

    /// Compare-and-swap update: succeeds only if `path`'s current value
    /// equals `prev_value`.
    async fn put_if_value(
        &self,
        path: &str,
        value: &str,
        prev_value: &str,
        ttl: Option<u64>,
    ) -> KvResult<bool>;

    /// Compare-and-swap delete: succeeds only if `path`'s current value
    /// equals `prev_value`.
    async fn delete_if_value(&self, path: &str, prev_value: &str) -> KvResult<bool>;
}
