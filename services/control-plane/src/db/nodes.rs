//! Node store: persistence and overlap queries over fingerprints.
//!
//! All identity decisions flow through `overlap`, which locks the rows it
//! returns (`FOR UPDATE`) so that concurrent checkins for the same node
//! serialize pessimistically. The `node_hw_entries` side table carries one
//! row per firmware-sourced match entry; its primary key is the unique
//! constraint that makes racing size-0 lookups safe.

use chrono::{DateTime, Utc};
use mandrel_events::PowerState;
use mandrel_id::{NodeId, PolicyId};
use regex::Regex;
use serde_json::Value;
use sqlx::postgres::{PgConnection, PgPool, PgRow};
use sqlx::Row;
use tracing::debug;

use crate::config::MatchConfig;
use crate::hwinfo::{self, JsonMap};
use crate::node::Node;

use super::DbError;

/// Input for creating a node.
#[derive(Debug, Clone, Default)]
pub struct NewNode {
    /// Explicit name; the store's sequence default applies when absent.
    pub name: Option<String>,
    pub hw_info: Vec<String>,
    pub dhcp_mac: Option<String>,
    /// Pre-seal for `protect_new_nodes`.
    pub installed: Option<String>,
    pub installed_at: Option<DateTime<Utc>>,
}

/// Node persistence handle.
#[derive(Clone)]
pub struct NodeStore {
    pool: PgPool,
    matching: MatchConfig,
}

impl NodeStore {
    /// Create a new node store.
    pub fn new(pool: PgPool, matching: MatchConfig) -> Self {
        Self { pool, matching }
    }

    /// Every node whose fingerprint shares at least one entry with
    /// `hw_match`, locked for the duration of the transaction.
    pub async fn overlap(
        &self,
        conn: &mut PgConnection,
        hw_match: &[String],
    ) -> Result<Vec<Node>, DbError> {
        let rows = sqlx::query_as::<_, Node>(
            r#"
            SELECT * FROM nodes
            WHERE hw_info && $1
            ORDER BY id
            FOR UPDATE
            "#,
        )
        .bind(hw_match)
        .fetch_all(conn)
        .await
        .map_err(DbError::Query)?;

        Ok(rows)
    }

    /// Persist a new node; the server assigns `name` unless one is given.
    pub async fn create(&self, conn: &mut PgConnection, new: NewNode) -> Result<Node, DbError> {
        let id = NodeId::new();
        let node = sqlx::query_as::<_, Node>(
            r#"
            INSERT INTO nodes (id, name, hw_info, dhcp_mac, installed, installed_at)
            VALUES ($1, COALESCE($2, 'node' || nextval('node_name_seq')), $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(id.to_string())
        .bind(&new.name)
        .bind(&new.hw_info)
        .bind(&new.dhcp_mac)
        .bind(&new.installed)
        .bind(new.installed_at)
        .fetch_one(&mut *conn)
        .await
        .map_err(DbError::Query)?;

        self.replace_hw_entries(conn, &node).await?;
        Ok(node)
    }

    /// Write back a mutated node. The caller validates before saving.
    pub async fn save(&self, conn: &mut PgConnection, node: &Node) -> Result<(), DbError> {
        sqlx::query(
            r#"
            UPDATE nodes SET
                hw_info = $2,
                dhcp_mac = $3,
                facts = $4,
                metadata = $5,
                tags = $6,
                policy_id = $7,
                installed = $8,
                installed_at = $9,
                hostname = $10,
                root_password = $11,
                boot_count = $12,
                last_checkin = $13,
                desired_power_state = $14,
                last_known_power_state = $15,
                last_power_state_update_at = $16,
                ipmi_hostname = $17,
                ipmi_username = $18,
                ipmi_password = $19,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(node.id.to_string())
        .bind(&node.hw_info)
        .bind(&node.dhcp_mac)
        .bind(Value::Object(node.facts.clone()))
        .bind(Value::Object(node.metadata.clone()))
        .bind(&node.tags)
        .bind(node.policy_id.map(|id| id.to_string()))
        .bind(&node.installed)
        .bind(node.installed_at)
        .bind(&node.hostname)
        .bind(&node.root_password)
        .bind(node.boot_count)
        .bind(node.last_checkin)
        .bind(power_to_db(node.desired_power_state))
        .bind(power_to_db(node.last_known_power_state))
        .bind(node.last_power_state_update_at)
        .bind(&node.ipmi_hostname)
        .bind(&node.ipmi_username)
        .bind(&node.ipmi_password)
        .execute(&mut *conn)
        .await
        .map_err(DbError::Query)?;

        self.replace_hw_entries(conn, node).await?;
        Ok(())
    }

    /// Delete a node. Log entries and queued signals cascade.
    pub async fn destroy(&self, conn: &mut PgConnection, id: NodeId) -> Result<(), DbError> {
        sqlx::query("DELETE FROM nodes WHERE id = $1")
            .bind(id.to_string())
            .execute(conn)
            .await
            .map_err(DbError::Query)?;
        Ok(())
    }

    /// Fetch a node by id.
    pub async fn get(&self, id: NodeId) -> Result<Option<Node>, DbError> {
        sqlx::query_as::<_, Node>("SELECT * FROM nodes WHERE id = $1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::Query)
    }

    /// Fetch a node by id with a row lock, serializing concurrent
    /// mutations of the same node.
    pub async fn get_for_update(
        &self,
        conn: &mut PgConnection,
        id: NodeId,
    ) -> Result<Option<Node>, DbError> {
        sqlx::query_as::<_, Node>("SELECT * FROM nodes WHERE id = $1 FOR UPDATE")
            .bind(id.to_string())
            .fetch_optional(conn)
            .await
            .map_err(DbError::Query)
    }

    /// All nodes, by name.
    pub async fn list(&self) -> Result<Vec<Node>, DbError> {
        sqlx::query_as::<_, Node>("SELECT * FROM nodes ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::Query)
    }

    /// Nodes that have management credentials, for the power monitor.
    pub async fn list_managed(&self) -> Result<Vec<Node>, DbError> {
        sqlx::query_as::<_, Node>(
            "SELECT * FROM nodes WHERE ipmi_hostname IS NOT NULL ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)
    }

    /// Search nodes by hostname pattern and fingerprint entries, ANDed.
    pub async fn search(&self, filter: &SearchFilter) -> Result<Vec<Node>, DbError> {
        let entries: Vec<String> = filter
            .hw
            .iter()
            .map(|(key, value)| {
                let key = key.trim().to_lowercase();
                let value = if key == "mac" {
                    hwinfo::normalize_mac(value)
                } else {
                    value.trim().to_lowercase()
                };
                format!("{key}={value}")
            })
            .collect();

        let rows = match filter.hostname.as_deref().map(HostnameMatch::compile) {
            None => {
                sqlx::query_as::<_, Node>(
                    "SELECT * FROM nodes WHERE hw_info @> $1 ORDER BY name",
                )
                .bind(&entries)
                .fetch_all(&self.pool)
                .await
            }
            Some(HostnameMatch::Regex(pattern)) => {
                sqlx::query_as::<_, Node>(
                    r#"
                    SELECT * FROM nodes
                    WHERE coalesce(hostname, '') ~* $1 AND hw_info @> $2
                    ORDER BY name
                    "#,
                )
                .bind(pattern)
                .bind(&entries)
                .fetch_all(&self.pool)
                .await
            }
            Some(HostnameMatch::Literal(needle)) => {
                sqlx::query_as::<_, Node>(
                    r#"
                    SELECT * FROM nodes
                    WHERE strpos(lower(coalesce(hostname, '')), lower($1)) > 0
                      AND hw_info @> $2
                    ORDER BY name
                    "#,
                )
                .bind(needle)
                .bind(&entries)
                .fetch_all(&self.pool)
                .await
            }
        };

        rows.map_err(DbError::Query)
    }

    /// Rewrite the uniqueness side table from the node's current
    /// fingerprint. Idempotent; runs on every create and save.
    async fn replace_hw_entries(
        &self,
        conn: &mut PgConnection,
        node: &Node,
    ) -> Result<(), DbError> {
        let unique = hwinfo::unique_match_entries(&node.hw_info, &self.matching);

        sqlx::query("DELETE FROM node_hw_entries WHERE node_id = $1")
            .bind(node.id.to_string())
            .execute(&mut *conn)
            .await
            .map_err(DbError::Query)?;

        if !unique.is_empty() {
            sqlx::query(
                "INSERT INTO node_hw_entries (entry, node_id) SELECT unnest($1::text[]), $2",
            )
            .bind(&unique)
            .bind(node.id.to_string())
            .execute(conn)
            .await
            .map_err(DbError::Query)?;
        }

        Ok(())
    }
}

/// Search input: hostname pattern plus fingerprint `(key, value)` filters.
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    pub hostname: Option<String>,
    pub hw: Vec<(String, String)>,
}

/// How a hostname search pattern will be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostnameMatch {
    /// The pattern compiled; match as a case-insensitive regex.
    Regex(String),
    /// The pattern did not compile; match as a literal substring.
    Literal(String),
}

impl HostnameMatch {
    /// Compile a caller-supplied pattern, downgrading to a literal
    /// substring when it is not a valid regex. The downgrade is traced so
    /// operators can see why a pattern behaved unexpectedly.
    pub fn compile(pattern: &str) -> Self {
        match Regex::new(pattern) {
            Ok(_) => HostnameMatch::Regex(pattern.to_string()),
            Err(e) => {
                debug!(
                    pattern,
                    error = %e,
                    "hostname pattern is not a valid regex, matching literal substring"
                );
                HostnameMatch::Literal(pattern.to_string())
            }
        }
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for Node {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let id: String = row.try_get("id")?;
        let id = NodeId::parse(&id).map_err(|e| sqlx::Error::ColumnDecode {
            index: "id".into(),
            source: Box::new(e),
        })?;

        let policy_id: Option<String> = row.try_get("policy_id")?;
        let policy_id = policy_id
            .map(|s| PolicyId::parse(&s))
            .transpose()
            .map_err(|e| sqlx::Error::ColumnDecode {
                index: "policy_id".into(),
                source: Box::new(e),
            })?;

        Ok(Self {
            id,
            name: row.try_get("name")?,
            hw_info: row.try_get("hw_info")?,
            dhcp_mac: row.try_get("dhcp_mac")?,
            facts: json_map(row.try_get("facts")?),
            metadata: json_map(row.try_get("metadata")?),
            tags: row.try_get("tags")?,
            policy_id,
            installed: row.try_get("installed")?,
            installed_at: row.try_get("installed_at")?,
            hostname: row.try_get("hostname")?,
            root_password: row.try_get("root_password")?,
            boot_count: row.try_get("boot_count")?,
            last_checkin: row.try_get("last_checkin")?,
            desired_power_state: power_from_db(row.try_get("desired_power_state")?),
            last_known_power_state: power_from_db(row.try_get("last_known_power_state")?),
            last_power_state_update_at: row.try_get("last_power_state_update_at")?,
            ipmi_hostname: row.try_get("ipmi_hostname")?,
            ipmi_username: row.try_get("ipmi_username")?,
            ipmi_password: row.try_get("ipmi_password")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

fn json_map(value: Value) -> JsonMap {
    match value {
        Value::Object(map) => map,
        _ => JsonMap::new(),
    }
}

fn power_to_db(state: PowerState) -> Option<&'static str> {
    match state {
        PowerState::On => Some("on"),
        PowerState::Off => Some("off"),
        PowerState::Unknown => None,
    }
}

fn power_from_db(value: Option<String>) -> PowerState {
    match value.as_deref() {
        Some("on") => PowerState::On,
        Some("off") => PowerState::Off,
        _ => PowerState::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hostname_match_valid_regex() {
        assert_eq!(
            HostnameMatch::compile("^host-.*\\.lab$"),
            HostnameMatch::Regex("^host-.*\\.lab$".to_string())
        );
    }

    #[test]
    fn test_hostname_match_downgrades_bad_regex() {
        assert_eq!(
            HostnameMatch::compile("host-[3"),
            HostnameMatch::Literal("host-[3".to_string())
        );
    }

    #[test]
    fn test_power_state_db_roundtrip() {
        for state in [PowerState::On, PowerState::Off, PowerState::Unknown] {
            let db = power_to_db(state).map(str::to_string);
            assert_eq!(power_from_db(db), state);
        }
    }
}
