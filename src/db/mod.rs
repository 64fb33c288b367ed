//! The database lifecycle/state handler (spec.md §4.2).
//!
//! Owns the local data directory, the daemon process, and the
//! replication configuration file. Nothing outside this module is
//! permitted to mutate any of the three while the supervisor runs
//! (spec.md §5).

mod admin;
mod replication_conf;

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::time::sleep;

use crate::config::PostgresqlConfig;
use crate::error::StateError;
use crate::kv::{KvClient, Member};

use admin::Admin;
use replication_conf::split_host_port;

/// Fixed readiness-poll interval (spec.md §5).
const READINESS_POLL_INTERVAL: Duration = Duration::from_secs(3);
/// Bounded readiness-poll attempts before `start` gives up.
const READINESS_MAX_ATTEMPTS: u32 = 20;

/// Lifecycle handle for the local daemon and its data directory.
pub struct PostgresHandler {
    config: PostgresqlConfig,
    process: Option<Child>,
}

impl PostgresHandler {
    pub fn new(config: PostgresqlConfig) -> Self {
        Self {
            config,
            process: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn advertised_connection_string(&self) -> &str {
        &self.config.connect
    }

    fn data_dir(&self) -> &std::path::Path {
        &self.config.data_dir
    }

    fn admin_connect_string(&self) -> String {
        self.config.connect.clone()
    }

    /// `true` if the data directory does not exist or has no entries.
    pub fn data_directory_empty(&self) -> bool {
        match std::fs::read_dir(self.data_dir()) {
            Ok(mut entries) => entries.next().is_none(),
            Err(_) => true,
        }
    }

    /// Creates a new cluster in the empty data directory, writes a
    /// read-write replication config, starts the daemon long enough to
    /// create the replication user and run post-init SQL, then stops it.
    /// Idempotent: safe to re-enter from the empty-directory state if a
    /// prior attempt failed partway through.
    pub async fn initialize(&mut self) -> Result<(), StateError> {
        std::fs::create_dir_all(self.data_dir())?;

        let status = Command::new("initdb")
            .arg("-D")
            .arg(self.data_dir())
            .args(&self.config.initdb_parameters)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .status()
            .await?;

        if !status.success() {
            return Err(StateError::DaemonFatal(format!(
                "initdb exited with {status}"
            )));
        }

        replication_conf::write_primary(self.data_dir())?;

        if !self.start(true).await? {
            return Err(StateError::DaemonFatal(
                "daemon did not become ready after initdb".to_string(),
            ));
        }

        let admin = Admin::connect(&self.admin_connect_string()).await?;
        admin
            .create_replication_user(
                &self.config.replication.username,
                &self.config.replication.password,
                &self.config.replication.network,
            )
            .await?;
        admin
            .run_post_initialization_commands(&self.config.post_init_commands)
            .await?;

        self.stop().await?;
        Ok(())
    }

    /// Takes a full base backup from `leader` and restores it locally,
    /// configures replication to follow `leader`, and starts streaming.
    /// Returns `false` on a recoverable failure (caller retries); a
    /// non-zero exit from the backup tool itself is fatal.
    pub async fn sync_from_leader(&mut self, leader: &Member) -> Result<bool, StateError> {
        std::fs::create_dir_all(self.data_dir())?;

        let (host, port) = split_host_port(&leader.address);

        let status = Command::new("pg_basebackup")
            .arg("-h")
            .arg(&host)
            .arg("-p")
            .arg(&port)
            .arg("-U")
            .arg(&self.config.replication.username)
            .arg("-D")
            .arg(self.data_dir())
            .arg("-X")
            .arg("stream")
            .env("PGPASSWORD", &self.config.replication.password)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .status()
            .await?;

        if !status.success() {
            tracing::warn!(%status, "pg_basebackup from leader failed, will retry");
            return Ok(false);
        }

        self.write_recovery_conf(leader)?;
        Ok(true)
    }

    /// Persists the follower-side replication parameters pointing at
    /// `leader.address`.
    pub fn write_recovery_conf(&self, leader: &Member) -> Result<(), StateError> {
        replication_conf::write_follower(
            self.data_dir(),
            &leader.address,
            &self.config.replication.username,
            &self.config.replication.password,
        )
    }

    /// Spawns the daemon and blocks until it is ready, or returns `false`
    /// if the process exits first.
    pub async fn start(&mut self, master: bool) -> Result<bool, StateError> {
        if self.is_running() {
            tracing::warn!("start called while daemon already running");
            return Ok(true);
        }

        let log_path = self.data_dir().join("governor.log");
        let log_file = std::fs::File::create(&log_path)?;

        let mut command = Command::new("postgres");
        command
            .arg("-D")
            .arg(self.data_dir())
            .arg("-h")
            .arg(host_of(&self.config.listen))
            .arg("-p")
            .arg(port_of(&self.config.listen));

        for (key, value) in &self.config.parameters {
            command.arg("-c").arg(format!("{key}={value}"));
        }

        let child = command
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file.try_clone()?))
            .stderr(Stdio::from(log_file))
            .spawn()?;

        self.process = Some(child);
        tracing::info!(master, "daemon starting");

        for attempt in 0..READINESS_MAX_ATTEMPTS {
            if !self.is_running() {
                tracing::error!("daemon exited before becoming ready");
                return Ok(false);
            }
            if self.is_ready().await {
                return Ok(true);
            }
            tracing::debug!(attempt, "daemon not ready yet, waiting");
            sleep(READINESS_POLL_INTERVAL).await;
        }

        tracing::error!("daemon did not become ready within the readiness budget");
        Ok(false)
    }

    /// Stops the daemon gracefully, waiting up to 30s before killing it.
    pub async fn stop(&mut self) -> Result<(), StateError> {
        let Some(mut child) = self.process.take() else {
            return Ok(());
        };

        Command::new("pg_ctl")
            .arg("stop")
            .arg("-D")
            .arg(self.data_dir())
            .arg("-m")
            .arg("fast")
            .status()
            .await
            .ok();

        match tokio::time::timeout(Duration::from_secs(30), child.wait()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(StateError::Io(e)),
            Err(_) => {
                child.kill().await.ok();
            }
        }
        Ok(())
    }

    pub async fn restart(&mut self) -> Result<bool, StateError> {
        let was_master = self.is_leader().await;
        self.stop().await?;
        self.start(was_master).await
    }

    pub fn is_running(&mut self) -> bool {
        match &mut self.process {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    pub async fn is_ready(&mut self) -> bool {
        if !self.is_running() {
            return false;
        }
        match Admin::connect(&self.admin_connect_string()).await {
            Ok(admin) => admin.ping().await,
            Err(_) => false,
        }
    }

    pub async fn is_healthy(&mut self) -> bool {
        self.is_running() && self.is_ready().await
    }

    /// `true` iff the daemon reports read-write mode.
    pub async fn is_leader(&mut self) -> bool {
        if !self.is_running() {
            return false;
        }
        match Admin::connect(&self.admin_connect_string()).await {
            Ok(admin) => !admin.is_in_recovery().await.unwrap_or(true),
            Err(_) => false,
        }
    }

    /// Stops replication, clears the upstream, rewrites read-write
    /// config, and restarts.
    pub async fn promote(&mut self) -> Result<bool, StateError> {
        tracing::info!("promoting to leader");
        replication_conf::write_primary(self.data_dir())?;
        self.stop().await?;
        self.start(true).await
    }

    /// Rewrites replication config as read-only, pointed at `leader`,
    /// and restarts.
    pub async fn demote(&mut self, leader: &Member) -> Result<(), StateError> {
        tracing::info!(leader = %leader.hostname, "demoting");
        self.write_recovery_conf(leader)?;
        self.stop().await?;
        self.start(false).await?;
        Ok(())
    }

    /// If currently leader or following a different upstream, stops
    /// replication, rewrites read-only config pointed at `leader`, and
    /// restarts streaming.
    pub async fn follow_the_leader(&mut self, leader: &Member) -> Result<bool, StateError> {
        let (target_host, target_port) = split_host_port(&leader.address);
        let already_following_this_leader = replication_conf::is_following(self.data_dir())
            && replication_conf::current_upstream(self.data_dir())
                == Some((target_host, target_port));

        if !self.is_leader().await && already_following_this_leader {
            return Ok(true);
        }

        self.write_recovery_conf(leader)?;
        self.stop().await?;
        self.start(false).await
    }

    /// Puts the daemon into read-only mode with no upstream — used at
    /// cold start when the leader is unknown.
    pub async fn follow_no_leader(&mut self) -> Result<bool, StateError> {
        replication_conf::write_no_leader(self.data_dir())?;
        if self.is_running() {
            self.stop().await?;
        }
        self.start(false).await
    }

    /// Idempotently creates a replication slot for `member`.
    pub async fn create_replication_slot(&mut self, member: &Member) -> Result<(), StateError> {
        let admin = Admin::connect(&self.admin_connect_string()).await?;
        let slot = admin::slot_name_for(&member.hostname);
        admin.create_replication_slot(&slot).await
    }

    /// Monotonic replication progress, comparable across roles: the
    /// current write position for a leader, or the maximum of the
    /// written-through and replay positions for a follower.
    pub async fn last_operation(&mut self) -> i64 {
        let Ok(admin) = Admin::connect(&self.admin_connect_string()).await else {
            return 0;
        };

        if admin.is_in_recovery().await.unwrap_or(true) {
            admin.replica_progress().await.unwrap_or(0)
        } else {
            admin.current_wal_position().await.unwrap_or(0)
        }
    }

    /// Failover candidacy: `false` if we're too far behind the leader's
    /// last recorded optime, or if any reachable peer strictly exceeds
    /// our progress.
    pub async fn is_healthiest_node(&mut self, kv: &KvClient) -> bool {
        let leader_optime = match kv.last_leader_operation().await {
            Ok(Some(optime)) => optime,
            // Nothing recorded yet: only happens during initial bootstrap
            // racing, where there is no incumbent to be behind.
            Ok(None) => return true,
            Err(e) => {
                tracing::warn!(error = %e, "could not read leader optime, assuming unhealthy");
                return false;
            }
        };

        let my_progress = self.last_operation().await;
        if leader_optime - my_progress > self.config.maximum_lag_on_failover {
            return false;
        }

        let members = match kv.members().await {
            Ok(members) => members,
            Err(e) => {
                tracing::warn!(error = %e, "could not list members, assuming healthiest");
                return true;
            }
        };

        for member in members {
            if member.hostname == self.config.name {
                continue;
            }

            match Admin::connect(&member.address).await {
                Ok(admin) => {
                    let peer_progress = if admin.is_in_recovery().await.unwrap_or(true) {
                        admin.replica_progress().await.unwrap_or(0)
                    } else {
                        admin.current_wal_position().await.unwrap_or(0)
                    };

                    if peer_progress > my_progress {
                        return false;
                    }
                }
                Err(_) => {
                    // Unreachable peer can't be shown to exceed us.
                    continue;
                }
            }
        }

        true
    }
}

/// Abstraction over the local daemon's lifecycle and role transitions
/// (spec.md §4.2), mirroring the [`crate::kv::KvBackend`] seam so the HA
/// cycle can be driven against a scriptable fake daemon in tests instead
/// of only against raw KV semantics.
#[async_trait]
pub trait DbHandler: Send + Sync {
    fn name(&self) -> &str;
    fn advertised_connection_string(&self) -> &str;
    fn data_directory_empty(&self) -> bool;
    fn write_recovery_conf(&self, leader: &Member) -> Result<(), StateError>;

    async fn initialize(&mut self) -> Result<(), StateError>;
    async fn sync_from_leader(&mut self, leader: &Member) -> Result<bool, StateError>;
    async fn start(&mut self, master: bool) -> Result<bool, StateError>;
    async fn stop(&mut self) -> Result<(), StateError>;
    async fn is_healthy(&mut self) -> bool;
    async fn is_leader(&mut self) -> bool;
    async fn last_operation(&mut self) -> i64;
    async fn promote(&mut self) -> Result<bool, StateError>;
    async fn demote(&mut self, leader: &Member) -> Result<(), StateError>;
    async fn follow_the_leader(&mut self, leader: &Member) -> Result<bool, StateError>;
    async fn follow_no_leader(&mut self) -> Result<bool, StateError>;
    async fn create_replication_slot(&mut self, member: &Member) -> Result<(), StateError>;
    async fn is_healthiest_node(&mut self, kv: &KvClient) -> bool;
}

#[async_trait]
impl DbHandler for PostgresHandler {
    fn name(&self) -> &str {
        PostgresHandler::name(self)
    }

    fn advertised_connection_string(&self) -> &str {
        PostgresHandler::advertised_connection_string(self)
    }

    fn data_directory_empty(&self) -> bool {
        PostgresHandler::data_directory_empty(self)
    }

    fn write_recovery_conf(&self, leader: &Member) -> Result<(), StateError> {
        PostgresHandler::write_recovery_conf(self, leader)
    }

    async fn initialize(&mut self) -> Result<(), StateError> {
        PostgresHandler::initialize(self).await
    }

    async fn sync_from_leader(&mut self, leader: &Member) -> Result<bool, StateError> {
        PostgresHandler::sync_from_leader(self, leader).await
    }

    async fn start(&mut self, master: bool) -> Result<bool, StateError> {
        PostgresHandler::start(self, master).await
    }

    async fn stop(&mut self) -> Result<(), StateError> {
        PostgresHandler::stop(self).await
    }

    async fn is_healthy(&mut self) -> bool {
        PostgresHandler::is_healthy(self).await
    }

    async fn is_leader(&mut self) -> bool {
        PostgresHandler::is_leader(self).await
    }

    async fn last_operation(&mut self) -> i64 {
        PostgresHandler::last_operation(self).await
    }

    async fn promote(&mut self) -> Result<bool, StateError> {
        PostgresHandler::promote(self).await
    }

    async fn demote(&mut self, leader: &Member) -> Result<(), StateError> {
        PostgresHandler::demote(self, leader).await
    }

    async fn follow_the_leader(&mut self, leader: &Member) -> Result<bool, StateError> {
        PostgresHandler::follow_the_leader(self, leader).await
    }

    async fn follow_no_leader(&mut self) -> Result<bool, StateError> {
        PostgresHandler::follow_no_leader(self).await
    }

    async fn create_replication_slot(&mut self, member: &Member) -> Result<(), StateError> {
        PostgresHandler::create_replication_slot(self, member).await
    }

    async fn is_healthiest_node(&mut self, kv: &KvClient) -> bool {
        PostgresHandler::is_healthiest_node(self, kv).await
    }
}

fn host_of(listen: &str) -> String {
    split_host_port(listen).0
}

fn port_of(listen: &str) -> String {
    split_host_port(listen).1
}
