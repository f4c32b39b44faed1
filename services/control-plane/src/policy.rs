//! Policy catalogue seam.
//!
//! A policy is a selector (a set of tag names) plus installer
//! configuration. The catalogue picks the first enabled policy, in rank
//! order, whose selector is a subset of the node's tag set.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mandrel_id::PolicyId;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;

use crate::db::DbError;
use crate::hwinfo::JsonMap;
use crate::node::Node;

/// A provisioning policy.
#[derive(Debug, Clone)]
pub struct Policy {
    pub id: PolicyId,
    pub name: String,
    pub rank: i32,
    pub enabled: bool,
    /// Hostname template; `${id}` is replaced with the node's id at bind.
    pub hostname_pattern: String,
    pub root_password: Option<String>,
    /// Tag names that must all be present on a node for the policy to
    /// apply.
    pub tags: Vec<String>,
    /// Metadata merged onto the node at bind, without overwriting.
    pub node_metadata: Option<JsonMap>,
    pub created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for Policy {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let id: String = row.try_get("id")?;
        let id = PolicyId::parse(&id).map_err(|e| sqlx::Error::ColumnDecode {
            index: "id".into(),
            source: Box::new(e),
        })?;
        let node_metadata: Option<Value> = row.try_get("node_metadata")?;
        Ok(Self {
            id,
            name: row.try_get("name")?,
            rank: row.try_get("rank")?,
            enabled: row.try_get("enabled")?,
            hostname_pattern: row.try_get("hostname_pattern")?,
            root_password: row.try_get("root_password")?,
            tags: row.try_get("tags")?,
            node_metadata: node_metadata.and_then(|v| v.as_object().cloned()),
            created_at: row.try_get("created_at")?,
        })
    }
}

impl Policy {
    /// True when every selector tag is present on the node.
    pub fn applies_to(&self, node: &Node) -> bool {
        self.tags.iter().all(|t| node.tags.contains(t))
    }
}

/// The policy catalogue collaborator.
#[async_trait]
pub trait PolicyCatalogue: Send + Sync {
    /// Pick the first applicable policy for a node, or none.
    async fn pick(&self, node: &Node) -> Result<Option<Policy>, DbError>;

    /// Fetch a policy by id, for log labelling.
    async fn get(&self, id: PolicyId) -> Result<Option<Policy>, DbError>;
}

/// Table-backed catalogue.
#[derive(Clone)]
pub struct PgPolicyCatalogue {
    pool: PgPool,
}

impl PgPolicyCatalogue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a policy definition. Used by seeding and tests; policy
    /// authoring is otherwise an administrative concern.
    pub async fn create(&self, new: NewPolicy) -> Result<Policy, DbError> {
        let id = PolicyId::new();
        sqlx::query_as::<_, Policy>(
            r#"
            INSERT INTO policies (id, name, rank, hostname_pattern, root_password, tags, node_metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(id.to_string())
        .bind(&new.name)
        .bind(new.rank)
        .bind(&new.hostname_pattern)
        .bind(&new.root_password)
        .bind(&new.tags)
        .bind(new.node_metadata.map(Value::Object))
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::Query)
    }
}

/// Input for creating a policy.
#[derive(Debug, Clone, Default)]
pub struct NewPolicy {
    pub name: String,
    pub rank: i32,
    pub hostname_pattern: String,
    pub root_password: Option<String>,
    pub tags: Vec<String>,
    pub node_metadata: Option<JsonMap>,
}

#[async_trait]
impl PolicyCatalogue for PgPolicyCatalogue {
    async fn pick(&self, node: &Node) -> Result<Option<Policy>, DbError> {
        // Installed nodes are never re-provisioned; this is also the
        // mechanism behind protect_new_nodes.
        if node.is_installed() {
            return Ok(None);
        }

        let policies = sqlx::query_as::<_, Policy>(
            "SELECT * FROM policies WHERE enabled ORDER BY rank, id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)?;

        Ok(policies.into_iter().find(|p| p.applies_to(node)))
    }

    async fn get(&self, id: PolicyId) -> Result<Option<Policy>, DbError> {
        sqlx::query_as::<_, Policy>("SELECT * FROM policies WHERE id = $1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::Query)
    }
}
