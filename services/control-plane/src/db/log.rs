//! Per-node append-only event log.
//!
//! Entries are JSON objects with recognised keys (`severity`, `msg`,
//! `error`, `action`, `event`) plus anything else the caller wants to
//! record. Every entry is round-tripped through a JSON encode/decode
//! before persistence so that reloaded entries are byte-for-byte
//! equivalent to freshly inserted ones.

use chrono::{DateTime, SecondsFormat, Utc};
use mandrel_id::NodeId;
use serde_json::{json, Value};
use sqlx::postgres::{PgConnection, PgPool};
use sqlx::Row;
use tracing::info;

use super::DbError;

/// Normalize a log entry: wrap non-objects, default `severity` to `info`,
/// and round-trip through JSON text.
pub fn normalize_log_entry(entry: Value) -> Result<Value, DbError> {
    let mut map = match entry {
        Value::Object(map) => map,
        other => {
            let mut map = serde_json::Map::new();
            map.insert("msg".to_string(), other);
            map
        }
    };

    if !map.contains_key("severity") {
        map.insert("severity".to_string(), json!("info"));
    }

    let text = serde_json::to_string(&Value::Object(map))?;
    Ok(serde_json::from_str(&text)?)
}

/// Node log persistence handle.
#[derive(Clone)]
pub struct NodeLogStore {
    pool: PgPool,
}

impl NodeLogStore {
    /// Create a new node log store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append an entry, at the supplied timestamp or the store default.
    ///
    /// The entry is also written to the service log, tagged with the
    /// node's name.
    pub async fn append(
        &self,
        conn: &mut PgConnection,
        node_id: NodeId,
        node_name: &str,
        entry: Value,
        at: Option<DateTime<Utc>>,
    ) -> Result<(), DbError> {
        let entry = normalize_log_entry(entry)?;
        info!(node = node_name, entry = %entry, "node event");

        sqlx::query(
            r#"
            INSERT INTO node_log_entries (node_id, entry, created_at)
            VALUES ($1, $2, COALESCE($3, now()))
            "#,
        )
        .bind(node_id.to_string())
        .bind(&entry)
        .bind(at)
        .execute(conn)
        .await
        .map_err(DbError::Query)?;

        Ok(())
    }

    /// Every entry for a node, ascending by timestamp, each merged with
    /// an ISO-8601 `timestamp` field.
    pub async fn entries(&self, node_id: NodeId) -> Result<Vec<Value>, DbError> {
        let rows = sqlx::query(
            r#"
            SELECT entry, created_at
            FROM node_log_entries
            WHERE node_id = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(node_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let mut entry: Value = row.get("entry");
                let at: DateTime<Utc> = row.get("created_at");
                if let Some(map) = entry.as_object_mut() {
                    map.insert(
                        "timestamp".to_string(),
                        json!(at.to_rfc3339_opts(SecondsFormat::Secs, true)),
                    );
                }
                entry
            })
            .collect())
    }

    /// Reassign every entry from one node to another, preserving
    /// timestamps. Used by the fact/firmware merge.
    pub async fn move_entries(
        &self,
        conn: &mut PgConnection,
        from: NodeId,
        to: NodeId,
    ) -> Result<u64, DbError> {
        let result = sqlx::query("UPDATE node_log_entries SET node_id = $2 WHERE node_id = $1")
            .bind(from.to_string())
            .bind(to.to_string())
            .execute(conn)
            .await
            .map_err(DbError::Query)?;

        Ok(result.rows_affected())
    }
}
