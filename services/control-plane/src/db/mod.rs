//! Database layer for the control plane.
//!
//! This module provides:
//! - Connection pool management
//! - The node store (overlap queries, row-locked mutations)
//! - The per-node append-only log
//! - The transactional signal outbox
//!
//! The database layer uses SQLx with Postgres. The store is the only
//! shared state in the system; its transaction boundaries are the only
//! cross-handler ordering guarantee.

mod error;
mod log;
mod nodes;
mod outbox;

pub use error::{is_unique_violation, DbError};
pub use log::{normalize_log_entry, NodeLogStore};
pub use nodes::{HostnameMatch, NewNode, NodeStore, SearchFilter};
pub use outbox::{ClaimedSignal, Outbox};

use std::path::{Path, PathBuf};
use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

/// Connection and migration settings for the Postgres pool.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Database connection URL.
    pub url: String,

    /// Pool size ceiling.
    pub max_connections: u32,

    /// Idle connections kept warm.
    pub min_connections: u32,

    /// How long a handler may wait for a free connection.
    pub acquire_timeout: Duration,

    /// Where the SQL migrations live. Mandrel ships a single service, so
    /// there is exactly one migrations directory; override it only when
    /// the binary runs outside the source tree.
    pub migrations_dir: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/mandrel".to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            migrations_dir: PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations"),
        }
    }
}

impl DbConfig {
    /// Load settings from `DATABASE_URL`, `DB_MAX_CONNECTIONS`,
    /// `DB_MIN_CONNECTIONS`, and `MANDREL_MIGRATIONS_DIR`.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.url = url;
        }
        if let Some(n) = env_u32("DB_MAX_CONNECTIONS") {
            config.max_connections = n;
        }
        if let Some(n) = env_u32("DB_MIN_CONNECTIONS") {
            config.min_connections = n;
        }
        if let Ok(dir) = std::env::var("MANDREL_MIGRATIONS_DIR") {
            config.migrations_dir = PathBuf::from(dir);
        }

        config
    }
}

fn env_u32(name: &str) -> Option<u32> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

/// Handle on the connection pool.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Open the pool.
    pub async fn connect(config: &DbConfig) -> Result<Self, DbError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.url)
            .await
            .map_err(DbError::Connect)?;

        info!(
            max_connections = config.max_connections,
            "Postgres pool ready"
        );
        Ok(Self { pool })
    }

    /// Get a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Round-trip a trivial query, for readiness probes.
    pub async fn ping(&self) -> Result<(), DbError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(())
    }

    /// Apply pending migrations from the configured directory. Gated
    /// behind dev mode; deployments apply migrations as a release step
    /// before the service starts.
    pub async fn run_migrations(&self, dir: &Path) -> Result<(), DbError> {
        let migrator = sqlx::migrate::Migrator::new(dir)
            .await
            .map_err(DbError::Migration)?;
        migrator.run(&self.pool).await.map_err(DbError::Migration)?;
        info!(migrations_dir = %dir.display(), "Migrations applied");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_config_defaults() {
        let config = DbConfig::default();
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.min_connections, 1);
        assert!(config.migrations_dir.ends_with("migrations"));
    }
}
