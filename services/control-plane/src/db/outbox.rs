//! Transactional outbox for background signals.
//!
//! `publish` is only ever called with the connection of the transaction
//! that performed the triggering mutation; a signal therefore becomes
//! visible to the worker exactly when the mutation commits. Delivery is
//! at-least-once and unordered. Claiming uses `FOR UPDATE SKIP LOCKED`
//! so multiple workers never double-deliver a live row.

use mandrel_events::{NodeSignal, SignalKind};
use mandrel_id::NodeId;
use serde_json::Value;
use sqlx::postgres::{PgConnection, PgPool, PgRow};
use sqlx::Row;

use super::DbError;

/// A signal claimed for delivery. The claim bumps `attempts` and pushes
/// `available_at` forward; a crashed worker's claim simply re-expires.
#[derive(Debug, Clone)]
pub struct ClaimedSignal {
    pub id: i64,
    pub node_id: NodeId,
    pub kind: SignalKind,
    pub attempts: i32,
}

impl<'r> sqlx::FromRow<'r, PgRow> for ClaimedSignal {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let node_id: String = row.try_get("node_id")?;
        let node_id = NodeId::parse(&node_id).map_err(|e| sqlx::Error::ColumnDecode {
            index: "node_id".into(),
            source: Box::new(e),
        })?;

        let payload: Value = row.try_get("payload")?;
        let kind: SignalKind =
            serde_json::from_value(payload).map_err(|e| sqlx::Error::ColumnDecode {
                index: "payload".into(),
                source: Box::new(e),
            })?;

        Ok(Self {
            id: row.try_get("id")?,
            node_id,
            kind,
            attempts: row.try_get("attempts")?,
        })
    }
}

/// Outbox handle.
#[derive(Clone)]
pub struct Outbox {
    pool: PgPool,
}

impl Outbox {
    /// Create a new outbox handle.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Enqueue a signal inside the caller's transaction.
    pub async fn publish(
        &self,
        conn: &mut PgConnection,
        signal: &NodeSignal,
    ) -> Result<(), DbError> {
        let payload = serde_json::to_value(&signal.kind)?;

        sqlx::query(
            r#"
            INSERT INTO node_signals (node_id, kind, payload, request_id, published_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(signal.node_id.to_string())
        .bind(signal.kind.name())
        .bind(&payload)
        .bind(signal.request_id.to_string())
        .bind(signal.published_at)
        .execute(conn)
        .await
        .map_err(DbError::Query)?;

        Ok(())
    }

    /// Claim up to `limit` due signals for delivery. Each claim is
    /// invisible to other workers for `retry_delay_secs`.
    pub async fn claim(
        &self,
        limit: i64,
        retry_delay_secs: f64,
    ) -> Result<Vec<ClaimedSignal>, DbError> {
        let rows = sqlx::query_as::<_, ClaimedSignal>(
            r#"
            WITH due AS (
                SELECT id FROM node_signals
                WHERE available_at <= now()
                ORDER BY id
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE node_signals s
            SET attempts = s.attempts + 1,
                available_at = now() + make_interval(secs => $2)
            FROM due
            WHERE s.id = due.id
            RETURNING s.id, s.node_id, s.payload, s.attempts
            "#,
        )
        .bind(limit)
        .bind(retry_delay_secs)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)?;

        Ok(rows)
    }

    /// Remove a delivered (or permanently failed) signal.
    pub async fn complete(&self, id: i64) -> Result<(), DbError> {
        sqlx::query("DELETE FROM node_signals WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(())
    }

    /// Number of queued signals, for tests and diagnostics.
    pub async fn depth(&self) -> Result<i64, DbError> {
        let row = sqlx::query("SELECT count(*) AS n FROM node_signals")
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(row.get("n"))
    }
}
