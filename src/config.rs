//! Configuration loading.
//!
//! The core treats configuration as opaque data handed to it at startup;
//! this module is the one place that turns a config file plus the
//! `GOVERNOR_*` environment overrides into the typed [`Config`] the rest
//! of the crate works with.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::SupervisorError;

/// Root configuration, mirroring spec.md §6 one-for-one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Seconds between HA cycle ticks.
    pub loop_wait: u64,

    pub etcd: EtcdConfig,

    pub postgresql: PostgresqlConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtcdConfig {
    /// Cluster namespace; all keys live under `/service/<scope>`.
    pub scope: String,

    /// `host:port` of the KV store.
    pub host: String,

    /// Lease TTL, in seconds.
    pub ttl: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresqlConfig {
    /// This node's unique hostname within the scope.
    pub name: String,

    /// `host:port` the daemon binds to.
    pub listen: String,

    /// Connection string advertised to other members.
    pub connect: String,

    /// Path to the data directory.
    pub data_dir: PathBuf,

    pub replication: ReplicationConfig,

    /// Daemon tunables, passed through verbatim as `-c key=value`.
    #[serde(default)]
    pub parameters: HashMap<String, String>,

    /// Recognised but not currently consumed by the daemon lifecycle: the
    /// original implementation accepts `GOVERNOR_POSTGRESQL_READ_ONLY_PORT`
    /// (spec.md §6) but only ever stores it alongside the rest of the
    /// config, never feeding it into the daemon's own option string —
    /// `read_only_port` is not a recognised daemon parameter. Kept as its
    /// own field so an override can't leak into `parameters` and be
    /// handed to the daemon verbatim.
    #[serde(default)]
    pub read_only_port: Option<String>,

    /// Flags passed to `initdb`.
    #[serde(default)]
    pub initdb_parameters: Vec<String>,

    /// SQL statements run once against a freshly-initialised cluster,
    /// after the replication user is created and before the daemon is
    /// stopped again (spec.md §4.2's "runs post-initialisation SQL").
    #[serde(default)]
    pub post_init_commands: Vec<String>,

    /// Maximum progress deficit (daemon-native units) that disqualifies a
    /// follower from promotion.
    pub maximum_lag_on_failover: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    pub username: String,
    pub password: String,
    /// CIDR network allowed to use the replication user.
    pub network: String,
}

impl Config {
    /// Loads configuration from `path` (a TOML file) and applies the
    /// `GOVERNOR_*` environment overrides named in spec.md §6.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SupervisorError> {
        let path = path.as_ref();
        let builder = config::Config::builder().add_source(
            config::File::from(path)
                .required(true)
                .format(config::FileFormat::Toml),
        );

        let raw = builder
            .build()
            .map_err(|e| SupervisorError::Config(format!("loading {}: {e}", path.display())))?;

        let mut cfg: Config = raw
            .try_deserialize()
            .map_err(|e| SupervisorError::Config(format!("parsing {}: {e}", path.display())))?;

        cfg.apply_env_overrides();
        Ok(cfg)
    }

    /// Applies the exact environment variable overrides from spec.md §6.
    /// Each, when set, replaces the corresponding config path; anything
    /// not set is left as loaded from the file.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("GOVERNOR_ETCD_HOST") {
            self.etcd.host = v;
        }
        if let Ok(v) = std::env::var("GOVERNOR_POSTGRESQL_NAME") {
            self.postgresql.name = v;
        }
        if let Ok(v) = std::env::var("GOVERNOR_POSTGRESQL_CONNECT") {
            self.postgresql.connect = v;
        }
        if let Ok(v) = std::env::var("GOVERNOR_POSTGRESQL_LISTEN") {
            self.postgresql.listen = v;
        }
        if let Ok(v) = std::env::var("GOVERNOR_POSTGRESQL_READ_ONLY_PORT") {
            self.postgresql.read_only_port = Some(v);
        }
        if let Ok(v) = std::env::var("GOVERNOR_POSTGRESQL_DATA_DIR") {
            self.postgresql.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("GOVERNOR_POSTGRESQL_REPLICATION_NETWORK") {
            self.postgresql.replication.network = v;
        }
    }
}
