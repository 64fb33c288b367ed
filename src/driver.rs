//! Startup sequencing, the periodic tick, and shutdown (spec.md §4.4).

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use crate::config::Config;
use crate::db::PostgresHandler;
use crate::error::SupervisorError;
use crate::ha::HaCycle;
use crate::kv::{EtcdBackend, KvClient};

/// Seconds to wait between `touch_member` attempts while etcd is
/// unreachable at startup.
const MEMBER_TOUCH_RETRY: Duration = Duration::from_secs(5);

/// Grace period given to the initialisation winner before a losing node
/// starts polling for a leader to sync from.
const INITIALIZATION_RACE_GRACE: Duration = Duration::from_secs(20);

/// Delay between `current_leader()` polls while waiting to sync.
const SYNC_POLL_INTERVAL: Duration = Duration::from_secs(5);

pub struct SupervisorDriver {
    config: Config,
    cycle: HaCycle,
}

impl SupervisorDriver {
    /// Connects to etcd and constructs the driver; does not touch the
    /// local data directory or daemon yet.
    pub async fn connect(config: Config) -> Result<Self, SupervisorError> {
        let backend = EtcdBackend::connect(&config.etcd.host)
            .await
            .map_err(SupervisorError::Kv)?;
        let kv = KvClient::new(Arc::new(backend), config.etcd.scope.clone(), config.etcd.ttl);
        let db = Box::new(PostgresHandler::new(config.postgresql.clone()));

        Ok(Self {
            config,
            cycle: HaCycle::new(kv, db),
        })
    }

    fn name(&self) -> String {
        self.config.postgresql.name.clone()
    }

    /// Runs the startup sequence described in spec.md §4.4, then the main
    /// loop, until SIGTERM. Returns only once shutdown is complete.
    ///
    /// Entered under a span carrying `scope` and `name` for the rest of
    /// the process's life, so every log line from the KV client, state
    /// handler, and HA cycle underneath it is attributable to a
    /// cluster/node pair without threading those fields through every
    /// call site.
    #[tracing::instrument(
        name = "supervisor",
        skip_all,
        fields(scope = %self.config.etcd.scope, name = %self.config.postgresql.name),
    )]
    pub async fn run(mut self) -> Result<(), SupervisorError> {
        self.wait_for_member_registration().await;

        if self.cycle.db().data_directory_empty() {
            self.bootstrap().await?;
        } else {
            tracing::info!("existing data directory, starting as standby until next cycle");
            self.cycle
                .db()
                .follow_no_leader()
                .await
                .map_err(SupervisorError::State)?;
            if !self.cycle.db().start(false).await.map_err(SupervisorError::State)? {
                return Err(SupervisorError::State(crate::error::StateError::DaemonFatal(
                    "daemon failed to start against existing data directory".to_string(),
                )));
            }
        }

        self.main_loop().await;
        Ok(())
    }

    /// Step 1: wait, with a bounded backoff, until `touch_member`
    /// succeeds.
    async fn wait_for_member_registration(&mut self) {
        let name = self.name();
        let address = self.cycle.db().advertised_connection_string().to_string();

        loop {
            match self.cycle.kv().touch_member(&name, &address).await {
                Ok(()) => return,
                Err(e) => {
                    tracing::info!(error = %e, "waiting on kv store to register membership");
                    sleep(MEMBER_TOUCH_RETRY).await;
                }
            }
        }
    }

    /// Step 2: empty data directory — race to initialise, or sync from
    /// whoever wins.
    async fn bootstrap(&mut self) -> Result<(), SupervisorError> {
        let name = self.name();

        if self
            .cycle
            .kv()
            .race("/initialize", &name)
            .await
            .map_err(SupervisorError::Kv)?
        {
            tracing::info!("won initialisation race");
            self.cycle
                .db()
                .initialize()
                .await
                .map_err(SupervisorError::State)?;
            self.cycle
                .kv()
                .take_leader(&name)
                .await
                .map_err(SupervisorError::Kv)?;

            if !self
                .cycle
                .db()
                .start(true)
                .await
                .map_err(SupervisorError::State)?
            {
                return Err(SupervisorError::State(crate::error::StateError::DaemonFatal(
                    "daemon failed to start after initialize".to_string(),
                )));
            }
            return Ok(());
        }

        tracing::info!("lost initialisation race, will sync from the winner");
        sleep(INITIALIZATION_RACE_GRACE).await;

        loop {
            let leader = match self.cycle.kv().current_leader().await {
                Ok(Some(leader)) => leader,
                Ok(None) => {
                    sleep(SYNC_POLL_INTERVAL).await;
                    continue;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "kv error while waiting for a leader to sync from");
                    sleep(SYNC_POLL_INTERVAL).await;
                    continue;
                }
            };

            match self.cycle.db().sync_from_leader(&leader).await {
                Ok(true) => {
                    self.cycle
                        .db()
                        .write_recovery_conf(&leader)
                        .map_err(SupervisorError::State)?;
                    let started = self
                        .cycle
                        .db()
                        .start(false)
                        .await
                        .map_err(SupervisorError::State)?;
                    if !started {
                        return Err(SupervisorError::State(
                            crate::error::StateError::DaemonFatal(
                                "daemon failed to start after sync".to_string(),
                            ),
                        ));
                    }
                    return Ok(());
                }
                Ok(false) => {
                    sleep(SYNC_POLL_INTERVAL).await;
                }
                Err(e) => return Err(SupervisorError::State(e)),
            }
        }
    }

    /// Step 4.4 main loop: tick, maintain replication slots while leader,
    /// refresh membership, sleep. SIGTERM is handled by racing the sleep
    /// against the signal future.
    async fn main_loop(&mut self) {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler, continuing without one");
                return self.main_loop_no_signal().await;
            }
        };

        loop {
            self.tick().await;

            tokio::select! {
                _ = sigterm.recv() => {
                    self.shutdown().await;
                    return;
                }
                _ = sleep(Duration::from_secs(self.config.loop_wait)) => {}
            }
        }
    }

    async fn main_loop_no_signal(&mut self) {
        loop {
            self.tick().await;
            sleep(Duration::from_secs(self.config.loop_wait)).await;
        }
    }

    async fn tick(&mut self) {
        let status = self.cycle.run_cycle().await;
        tracing::info!(%status, "ha cycle tick complete");

        if self.cycle.db().is_leader().await {
            match self.cycle.kv().members().await {
                Ok(members) => {
                    for member in members {
                        if member.hostname == self.name() {
                            continue;
                        }
                        if let Err(e) = self.cycle.db().create_replication_slot(&member).await {
                            tracing::warn!(error = %e, peer = %member.hostname, "failed to create replication slot");
                        }
                    }
                }
                Err(e) => tracing::warn!(error = %e, "failed to list members for slot upkeep"),
            }
        }

        let name = self.name();
        let address = self.cycle.db().advertised_connection_string().to_string();
        if let Err(e) = self.cycle.kv().touch_member(&name, &address).await {
            tracing::warn!(error = %e, "failed to refresh membership lease");
        }
    }

    /// SIGTERM handling: abdicate if we hold the lock, remove our
    /// membership, stop the daemon. Every step is best-effort.
    async fn shutdown(&mut self) {
        tracing::info!("shutting down: received SIGTERM");
        let name = self.name();

        match self.cycle.kv().am_i_leader(&name).await {
            Ok(true) => {
                tracing::info!("shutting down: abdicating leadership");
                if let Err(e) = self.cycle.kv().abdicate(&name).await {
                    tracing::warn!(error = %e, "abdication failed during shutdown");
                }
            }
            Ok(false) => {}
            Err(e) => tracing::warn!(error = %e, "could not determine leadership during shutdown"),
        }

        tracing::info!("shutting down: removing membership");
        if let Err(e) = self.cycle.kv().delete_member(&name).await {
            tracing::warn!(error = %e, "member deletion failed during shutdown");
        }

        tracing::info!("shutting down: stopping daemon");
        if let Err(e) = self.cycle.db().stop().await {
            tracing::warn!(error = %e, "daemon stop failed during shutdown");
        }
    }
}
