//! The HA decision engine (spec.md §4.3).
//!
//! `run_cycle` is the only entry point: one reconciliation step per tick,
//! evaluated top-to-bottom, first matching rule wins. Every branch
//! swallows KV transport errors as "no decision this tick" — the next
//! tick retries.

use crate::db::DbHandler;
use crate::kv::KvClient;

/// Decision engine, generic over the daemon lifecycle handler so tests
/// can drive it against a scriptable fake instead of a real daemon.
pub struct HaCycle {
    kv: KvClient,
    db: Box<dyn DbHandler>,
}

impl HaCycle {
    pub fn new(kv: KvClient, db: Box<dyn DbHandler>) -> Self {
        Self { kv, db }
    }

    pub fn db(&mut self) -> &mut dyn DbHandler {
        self.db.as_mut()
    }

    pub fn kv(&self) -> &KvClient {
        &self.kv
    }

    /// Runs one reconciliation step and returns a short status string
    /// describing the decision taken.
    pub async fn run_cycle(&mut self) -> String {
        if !self.db.is_healthy().await {
            return "not healthy, waiting".to_string();
        }

        match self.kv.leader_unlocked().await {
            Ok(true) => return self.acquire_or_follow().await,
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(error = %e, "kv error checking leader lock, no decision this tick");
                return "kv error, waiting".to_string();
            }
        }

        let name = self.db.name().to_string();

        match self.kv.am_i_leader(&name).await {
            Ok(true) => self.hold_leadership(&name).await,
            Ok(false) => self.follow_current_holder().await,
            Err(e) => {
                tracing::warn!(error = %e, "kv error checking leader identity, no decision this tick");
                "kv error, waiting".to_string()
            }
        }
    }

    /// Rule 2: no leader currently locked. Race to acquire it if we're
    /// the healthiest candidate; otherwise follow whoever shows up, or
    /// nobody yet.
    async fn acquire_or_follow(&mut self) -> String {
        let name = self.db.name().to_string();

        if self.db.is_healthiest_node(&self.kv).await {
            match self.kv.attempt_to_acquire_leader(&name).await {
                Ok(true) => {
                    if let Err(e) = self.db.promote().await {
                        tracing::error!(error = %e, "promote after acquiring leader failed");
                    }
                    return "acquired leader".to_string();
                }
                Ok(false) => {
                    tracing::debug!("lost the race to acquire leader");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "kv error acquiring leader, no decision this tick");
                    return "kv error, waiting".to_string();
                }
            }
        }

        match self.kv.current_leader().await {
            Ok(Some(leader)) => {
                if let Err(e) = self.db.follow_the_leader(&leader).await {
                    tracing::error!(error = %e, "failed to follow newly-seen leader");
                }
            }
            Ok(None) => {
                if let Err(e) = self.db.follow_no_leader().await {
                    tracing::error!(error = %e, "failed to enter no-leader standby mode");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "kv error reading current leader, no decision this tick");
                return "kv error, waiting".to_string();
            }
        }

        "no leader, following".to_string()
    }

    /// Rule 3: we hold the lock. Refresh it; demote on loss, promote if
    /// somehow not yet read-write, otherwise stay put.
    async fn hold_leadership(&mut self, name: &str) -> String {
        let progress = self.db.last_operation().await;
        let refreshed = self.kv.update_leader(name, progress).await;

        if !refreshed {
            match self.kv.current_leader().await.ok().flatten() {
                Some(leader) => {
                    if let Err(e) = self.db.demote(&leader).await {
                        tracing::error!(error = %e, "demote after losing leader lock failed");
                    }
                }
                None => {
                    if let Err(e) = self.db.follow_no_leader().await {
                        tracing::error!(error = %e, "follow-no-leader after losing lock failed");
                    }
                }
            }
            return "demoted".to_string();
        }

        if !self.db.is_leader().await {
            if let Err(e) = self.db.promote().await {
                tracing::error!(error = %e, "promote while holding leader lock failed");
            }
        }

        "is leader".to_string()
    }

    /// Rule 4: someone else holds the lock. Follow them; if the lock
    /// disappeared between the `am_i_leader` check and now, fall through
    /// to the same acquire-or-follow logic as rule 2.
    async fn follow_current_holder(&mut self) -> String {
        match self.kv.current_leader().await {
            Ok(Some(leader)) => {
                let hostname = leader.hostname.clone();
                if let Err(e) = self.db.follow_the_leader(&leader).await {
                    tracing::error!(error = %e, "failed to follow current leader");
                }
                format!("following {hostname}")
            }
            Ok(None) => self.acquire_or_follow().await,
            Err(e) => {
                tracing::warn!(error = %e, "kv error reading current leader, no decision this tick");
                "kv error, waiting".to_string()
            }
        }
    }
}
