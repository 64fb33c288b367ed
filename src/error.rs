//! Error types for the supervisor core.

use thiserror::Error;

/// Errors surfaced by the KV coordination client.
#[derive(Error, Debug)]
pub enum KvError {
    /// The requested key (or one of its ancestors) does not exist.
    #[error("key not found: {0}")]
    NotFound(String),

    /// A compare-and-swap precondition did not hold; the lock was stolen
    /// or ownership was lost between read and write.
    #[error("compare failed on {0}")]
    CompareFailed(String),

    /// A compare-and-create precondition failed because the key already
    /// exists (a race was lost).
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Exhausted the configured retry budget against the backend.
    #[error("transport error after retries: {0}")]
    Transport(String),
}

/// Errors surfaced by the database lifecycle/state handler.
#[derive(Error, Debug)]
pub enum StateError {
    /// Initialisation or sync subprocess returned non-zero. The data
    /// directory may be partially populated; the process must not
    /// continue, since doing so risks silent data corruption.
    #[error("daemon fatal error: {0}")]
    DaemonFatal(String),

    /// The daemon is down but the data directory is intact; the next
    /// tick may restart it or wait.
    #[error("daemon transient error: {0}")]
    DaemonTransient(String),

    /// An admin SQL round trip against the daemon failed.
    #[error("sql error: {0}")]
    Sql(#[from] sqlx::Error),

    /// Filesystem or subprocess I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level error type for the supervisor binary.
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error(transparent)]
    Kv(#[from] KvError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type KvResult<T> = std::result::Result<T, KvError>;
pub type StateResult<T> = std::result::Result<T, StateError>;
pub type Result<T> = std::result::Result<T, SupervisorError>;
