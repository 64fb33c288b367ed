//! The public KV coordination API consumed by the HA cycle and the
//! supervisor driver (spec.md §4.1).

use std::sync::Arc;
use std::time::Duration;

use crate::error::{KvError, KvResult};

use super::{with_retry, KvBackend, Member, RetryPolicy};

/// Leased membership and leader-lock client, scoped to one cluster.
pub struct KvClient {
    backend: Arc<dyn KvBackend>,
    scope: String,
    ttl: u64,
    retry: RetryPolicy,
}

impl KvClient {
    pub fn new(backend: Arc<dyn KvBackend>, scope: impl Into<String>, ttl: u64) -> Self {
        Self {
            backend,
            scope: scope.into(),
            ttl,
            retry: RetryPolicy::attempts(1, Duration::from_secs(2)),
        }
    }

    /// Overrides the default retry policy used for single-attempt calls
    /// (the two named multi-attempt call sites in `update_leader` use
    /// their own fixed budgets regardless of this setting).
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn path(&self, suffix: &str) -> String {
        format!("/service/{}{}", self.scope, suffix)
    }

    /// Writes `/members/<name> = address` with the configured TTL.
    pub async fn touch_member(&self, name: &str, address: &str) -> KvResult<()> {
        let path = self.path(&format!("/members/{name}"));
        with_retry(self.retry, || {
            let path = path.clone();
            async move { self.backend.put(&path, address, Some(self.ttl)).await }
        })
        .await
    }

    /// Unconditional delete of `/members/<name>`.
    pub async fn delete_member(&self, name: &str) -> KvResult<()> {
        let path = self.path(&format!("/members/{name}"));
        with_retry(self.retry, || {
            let path = path.clone();
            async move { self.backend.delete(&path).await }
        })
        .await
    }

    /// Enumerates children of `/members/`; empty when the directory is
    /// absent.
    pub async fn members(&self) -> KvResult<Vec<Member>> {
        let prefix = self.path("/members/");
        let children = with_retry(self.retry, || {
            let prefix = prefix.clone();
            async move { self.backend.list_children(&prefix).await }
        })
        .await?;

        Ok(children
            .into_iter()
            .map(|(hostname, address)| Member { hostname, address })
            .collect())
    }

    /// Reads `/leader`, then `/members/<hostname>`; `None` if either is
    /// absent.
    pub async fn current_leader(&self) -> KvResult<Option<Member>> {
        let leader_path = self.path("/leader");
        let hostname = match self.get(&leader_path).await? {
            Some(h) => h,
            None => return Ok(None),
        };

        let member_path = self.path(&format!("/members/{hostname}"));
        let address = match self.get(&member_path).await? {
            Some(a) => a,
            None => return Ok(None),
        };

        Ok(Some(Member { hostname, address }))
    }

    /// Unconditional write of `/leader = name`, used immediately after
    /// winning initialisation.
    pub async fn take_leader(&self, name: &str) -> KvResult<()> {
        let path = self.path("/leader");
        with_retry(self.retry, || {
            let path = path.clone();
            async move { self.backend.put(&path, name, Some(self.ttl)).await }
        })
        .await
    }

    /// CAS-create `/leader = name`; `true` on success, `false` if held.
    pub async fn attempt_to_acquire_leader(&self, name: &str) -> KvResult<bool> {
        let path = self.path("/leader");
        with_retry(self.retry, || {
            let path = path.clone();
            async move { self.backend.put_if_absent(&path, name, Some(self.ttl)).await }
        })
        .await
    }

    /// Refreshes `/leader = name` (up to 10 attempts, conditioned on the
    /// prior value equalling `name`), then writes `/optime/leader` (up to
    /// 2 attempts). Returns `false` if the refresh fails — the signal that
    /// the caller has lost the lock.
    pub async fn update_leader(&self, name: &str, progress: i64) -> bool {
        let leader_path = self.path("/leader");
        let refresh_policy = RetryPolicy::attempts(10, Duration::from_secs(2));

        let refreshed = with_retry(refresh_policy, || {
            let path = leader_path.clone();
            async move {
                self.backend
                    .put_if_value(&path, name, name, Some(self.ttl))
                    .await
            }
        })
        .await;

        let refreshed = match refreshed {
            Ok(true) => true,
            Ok(false) => {
                tracing::warn!(%name, "lost leader lock: prior value no longer matches");
                false
            }
            Err(e) => {
                tracing::error!(error = %e, "error refreshing leader lock on kv store");
                false
            }
        };

        if !refreshed {
            return false;
        }

        let optime_path = self.path("/optime/leader");
        let optime_policy = RetryPolicy::attempts(2, Duration::from_secs(2));
        let value = progress.to_string();

        if let Err(e) = with_retry(optime_policy, || {
            let path = optime_path.clone();
            let value = value.clone();
            async move { self.backend.put(&path, &value, None).await }
        })
        .await
        {
            tracing::error!(error = %e, "error updating leader optime on kv store");
            // Lock refresh itself succeeded; optime lag doesn't revoke
            // leadership, but is worth surfacing loudly.
        }

        true
    }

    /// Reads `/optime/leader`; `None` if absent.
    pub async fn last_leader_operation(&self) -> KvResult<Option<i64>> {
        let path = self.path("/optime/leader");
        match self.get(&path).await? {
            Some(v) => v
                .parse::<i64>()
                .map(Some)
                .map_err(|e| KvError::Transport(format!("malformed optime value: {e}"))),
            None => Ok(None),
        }
    }

    /// `true` iff `/leader` is absent.
    pub async fn leader_unlocked(&self) -> KvResult<bool> {
        Ok(self.get(&self.path("/leader")).await?.is_none())
    }

    /// `true` iff `/leader` reads exactly `name`.
    pub async fn am_i_leader(&self, name: &str) -> KvResult<bool> {
        Ok(self.get(&self.path("/leader")).await? == Some(name.to_string()))
    }

    /// Deletes `/leader`, conditioned on the prior value equalling `name`.
    pub async fn abdicate(&self, name: &str) -> KvResult<()> {
        let path = self.path("/leader");

        // Observational logging of the key before/after deletion is
        // inherently racy against other nodes; kept for parity with the
        // original implementation's intent, not as a correctness check.
        let before = self.get(&path).await.ok().flatten();
        tracing::info!(holder = ?before, "abdicating leadership");

        let _ = with_retry(self.retry, || {
            let path = path.clone();
            let name = name.to_string();
            async move { self.backend.delete_if_value(&path, &name).await }
        })
        .await?;

        let after = self.get(&path).await.ok().flatten();
        tracing::info!(holder = ?after, "abdication complete");

        Ok(())
    }

    /// Compare-and-swap create of an arbitrary path; `true` on success,
    /// `false` if it already exists. Used for the `/initialize` race.
    pub async fn race(&self, path: &str, value: &str) -> KvResult<bool> {
        let full = self.path(path);
        with_retry(self.retry, || {
            let full = full.clone();
            async move { self.backend.put_if_absent(&full, value, None).await }
        })
        .await
    }

    async fn get(&self, path: &str) -> KvResult<Option<String>> {
        with_retry(self.retry, || {
            let path = path.to_string();
            async move { self.backend.get(&path).await }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryBackend;
    use std::sync::Arc;

    fn client() -> KvClient {
        KvClient::new(Arc::new(MemoryBackend::new()), "testscope", 30)
    }

    #[tokio::test]
    async fn touch_and_list_members() {
        let kv = client();
        kv.touch_member("a", "postgres://a").await.unwrap();
        kv.touch_member("b", "postgres://b").await.unwrap();

        let mut members = kv.members().await.unwrap();
        members.sort_by(|x, y| x.hostname.cmp(&y.hostname));

        assert_eq!(members.len(), 2);
        assert_eq!(members[0].hostname, "a");
        assert_eq!(members[1].address, "postgres://b");
    }

    #[tokio::test]
    async fn members_empty_when_absent() {
        let kv = client();
        assert!(kv.members().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn race_is_exclusive() {
        let kv = client();
        assert!(kv.race("/initialize", "a").await.unwrap());
        assert!(!kv.race("/initialize", "b").await.unwrap());
    }

    #[tokio::test]
    async fn leader_acquire_and_am_i_leader() {
        let kv = client();
        assert!(kv.leader_unlocked().await.unwrap());
        assert!(kv.attempt_to_acquire_leader("a").await.unwrap());
        assert!(!kv.leader_unlocked().await.unwrap());
        assert!(kv.am_i_leader("a").await.unwrap());
        assert!(!kv.am_i_leader("b").await.unwrap());
        assert!(!kv.attempt_to_acquire_leader("b").await.unwrap());
    }

    #[tokio::test]
    async fn update_leader_refreshes_and_writes_optime() {
        let kv = client();
        kv.take_leader("a").await.unwrap();

        let ok = kv.update_leader("a", 42).await;
        assert!(ok);
        assert_eq!(kv.last_leader_operation().await.unwrap(), Some(42));
    }

    #[tokio::test]
    async fn update_leader_fails_when_lock_lost() {
        let kv = client();
        kv.take_leader("a").await.unwrap();

        // Someone else stole it.
        kv.abdicate("a").await.unwrap();
        kv.attempt_to_acquire_leader("b").await.unwrap();

        let ok = kv.update_leader("a", 1).await;
        assert!(!ok);
    }

    #[tokio::test]
    async fn abdicate_is_conditional_on_value() {
        let kv = client();
        kv.take_leader("a").await.unwrap();
        kv.abdicate("not-a").await.unwrap(); // no-op, wrong value
        assert!(kv.am_i_leader("a").await.unwrap());

        kv.abdicate("a").await.unwrap();
        assert!(kv.leader_unlocked().await.unwrap());
    }

    #[tokio::test]
    async fn current_leader_reads_through_members() {
        let kv = client();
        kv.touch_member("a", "postgres://a:5432").await.unwrap();
        kv.take_leader("a").await.unwrap();

        let leader = kv.current_leader().await.unwrap().unwrap();
        assert_eq!(leader.hostname, "a");
        assert_eq!(leader.address, "postgres://a:5432");
    }

    #[tokio::test]
    async fn current_leader_none_if_member_missing() {
        let kv = client();
        kv.take_leader("ghost").await.unwrap();
        assert!(kv.current_leader().await.unwrap().is_none());
    }
}
