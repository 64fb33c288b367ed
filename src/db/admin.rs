//! Administrative SQL surface against the local (or a peer's) daemon.
//!
//! Used only for the handful of control-plane queries the state handler
//! needs — replication mode, WAL position, slot bookkeeping, the
//! replication user. Application data traffic is out of scope.

use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use crate::error::StateError;

/// A pooled connection to one daemon's admin surface.
pub struct Admin {
    pool: PgPool,
}

impl Admin {
    /// Connects to `connect_string` (a `postgres://` URI).
    pub async fn connect(connect_string: &str) -> Result<Self, StateError> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(connect_string)
            .await?;
        Ok(Self { pool })
    }

    /// `true` iff the daemon is currently read-only (a replica).
    pub async fn is_in_recovery(&self) -> Result<bool, StateError> {
        let row = sqlx::query("SELECT pg_is_in_recovery() AS recovering")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<bool, _>("recovering")?)
    }

    /// Current write-ahead-log insert position as a flat integer offset,
    /// valid when called against a primary.
    pub async fn current_wal_position(&self) -> Result<i64, StateError> {
        let row = sqlx::query(
            "SELECT pg_wal_lsn_diff(pg_current_wal_lsn(), '0/0')::bigint AS pos",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<i64, _>("pos")?)
    }

    /// The greater of the written-through and replay positions, valid
    /// when called against a replica.
    pub async fn replica_progress(&self) -> Result<i64, StateError> {
        let row = sqlx::query(
            "SELECT GREATEST(
                 pg_wal_lsn_diff(pg_last_wal_receive_lsn(), '0/0'),
                 pg_wal_lsn_diff(pg_last_wal_replay_lsn(), '0/0')
             )::bigint AS pos",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<i64, _>("pos")?)
    }

    /// Creates the replication role with grants scoped to `network`, if
    /// it does not already exist.
    pub async fn create_replication_user(
        &self,
        username: &str,
        password: &str,
        network: &str,
    ) -> Result<(), StateError> {
        let exists: bool = sqlx::query(
            "SELECT EXISTS (SELECT 1 FROM pg_roles WHERE rolname = $1) AS exists",
        )
        .bind(username)
        .fetch_one(&self.pool)
        .await?
        .try_get("exists")?;

        if exists {
            return Ok(());
        }

        let create = format!(
            "CREATE ROLE {username} WITH REPLICATION LOGIN PASSWORD '{password}'",
        );
        sqlx::query(&create).execute(&self.pool).await?;

        tracing::info!(username, network, "created replication role");
        Ok(())
    }

    /// Runs the operator-supplied post-initialisation SQL, in order.
    pub async fn run_post_initialization_commands(
        &self,
        commands: &[String],
    ) -> Result<(), StateError> {
        for command in commands {
            sqlx::query(command).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Idempotently creates a physical replication slot for `member`.
    /// The existence check and creation happen inside one statement so
    /// two supervisors racing to create the same slot never both
    /// succeed in creating a duplicate.
    pub async fn create_replication_slot(&self, slot_name: &str) -> Result<(), StateError> {
        sqlx::query(
            "SELECT pg_create_physical_replication_slot($1)
             WHERE NOT EXISTS (
                 SELECT 1 FROM pg_replication_slots WHERE slot_name = $1
             )",
        )
        .bind(slot_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// A simple liveness probe used by readiness polling.
    pub async fn ping(&self) -> bool {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok()
    }
}

/// Slugifies a hostname into a valid replication slot name (lowercase,
/// alphanumeric and underscore only, as Postgres requires).
pub fn slot_name_for(hostname: &str) -> String {
    hostname
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_names_are_sanitized() {
        assert_eq!(slot_name_for("node-1.internal"), "node_1_internal");
        assert_eq!(slot_name_for("NodeA"), "nodea");
    }
}
