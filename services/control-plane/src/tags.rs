//! Tag evaluation seam.
//!
//! A tag is a named predicate over a node's facts and metadata. The rule
//! language itself lives behind the [`TagMatcher`] trait; the in-tree
//! implementation evaluates simple equality matchers stored with each tag,
//! which is enough for fleet partitioning. Richer expression engines plug
//! in at the same seam.

use std::collections::BTreeSet;

use async_trait::async_trait;
use mandrel_id::TagId;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use thiserror::Error;

use crate::db::DbError;
use crate::hwinfo::JsonMap;
use crate::node::Node;

/// A tag expression failed to evaluate. Captured by the checkin
/// processor, logged against the node, then re-raised.
#[derive(Debug, Error)]
#[error("evaluating tag '{tag}' failed: {message}")]
pub struct RuleEvaluationError {
    pub tag: String,
    pub message: String,
}

/// A stored tag definition.
#[derive(Debug, Clone)]
pub struct Tag {
    pub id: TagId,
    pub name: String,
    /// Fact/metadata name → expected value. A tag matches a node when
    /// every matcher is satisfied.
    pub matchers: JsonMap,
}

impl<'r> sqlx::FromRow<'r, PgRow> for Tag {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let id: String = row.try_get("id")?;
        let id = TagId::parse(&id).map_err(|e| sqlx::Error::ColumnDecode {
            index: "id".into(),
            source: Box::new(e),
        })?;
        let matchers: Value = row.try_get("matchers")?;
        Ok(Self {
            id,
            name: row.try_get("name")?,
            matchers: matchers.as_object().cloned().unwrap_or_default(),
        })
    }
}

/// The tag matcher collaborator: evaluates all tag expressions against a
/// node and returns the names of the tags that apply.
#[async_trait]
pub trait TagMatcher: Send + Sync {
    async fn matching_tags(&self, node: &Node) -> Result<BTreeSet<String>, RuleEvaluationError>;
}

/// Equality-matcher implementation over the `tags` table.
///
/// Reads committed tag definitions; tag definitions are reference data
/// and are not part of any node transaction.
#[derive(Clone)]
pub struct FactTagMatcher {
    pool: PgPool,
}

impl FactTagMatcher {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a tag definition. Used by seeding and tests; tag authoring
    /// is otherwise an administrative concern.
    pub async fn create(&self, name: &str, matchers: JsonMap) -> Result<Tag, DbError> {
        let id = TagId::new();
        sqlx::query_as::<_, Tag>(
            r#"
            INSERT INTO tags (id, name, matchers)
            VALUES ($1, $2, $3)
            RETURNING *
            "#,
        )
        .bind(id.to_string())
        .bind(name)
        .bind(Value::Object(matchers))
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::Query)
    }

    async fn load_tags(&self) -> Result<Vec<Tag>, sqlx::Error> {
        sqlx::query_as::<_, Tag>("SELECT * FROM tags ORDER BY name")
            .fetch_all(&self.pool)
            .await
    }
}

#[async_trait]
impl TagMatcher for FactTagMatcher {
    async fn matching_tags(&self, node: &Node) -> Result<BTreeSet<String>, RuleEvaluationError> {
        let tags = self
            .load_tags()
            .await
            .map_err(|e| RuleEvaluationError {
                tag: "*".to_string(),
                message: format!("loading tag definitions failed: {e}"),
            })?;

        let mut matched = BTreeSet::new();
        for tag in tags {
            if tag_applies(&tag, node)? {
                matched.insert(tag.name);
            }
        }
        Ok(matched)
    }
}

/// A tag applies when every matcher equals the node's fact (or, failing
/// that, metadata) value. A matcher naming neither is simply unsatisfied;
/// a malformed matcher value is an evaluation error.
fn tag_applies(tag: &Tag, node: &Node) -> Result<bool, RuleEvaluationError> {
    for (name, expected) in &tag.matchers {
        if expected.is_object() || expected.is_array() {
            return Err(RuleEvaluationError {
                tag: tag.name.clone(),
                message: format!("matcher '{name}' must be a scalar, got {expected}"),
            });
        }
        let actual = node.facts.get(name).or_else(|| node.metadata.get(name));
        if actual != Some(expected) {
            return Ok(false);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mandrel_events::PowerState;
    use mandrel_id::NodeId;
    use serde_json::json;

    fn node_with_facts(facts: Value) -> Node {
        Node {
            id: NodeId::new(),
            name: "node1".into(),
            hw_info: Vec::new(),
            dhcp_mac: None,
            facts: facts.as_object().cloned().unwrap_or_default(),
            metadata: JsonMap::new(),
            tags: Vec::new(),
            policy_id: None,
            installed: None,
            installed_at: None,
            hostname: None,
            root_password: None,
            boot_count: 0,
            last_checkin: None,
            desired_power_state: PowerState::Unknown,
            last_known_power_state: PowerState::Unknown,
            last_power_state_update_at: None,
            ipmi_hostname: None,
            ipmi_username: None,
            ipmi_password: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn tag(name: &str, matchers: Value) -> Tag {
        Tag {
            id: TagId::new(),
            name: name.into(),
            matchers: matchers.as_object().cloned().unwrap_or_default(),
        }
    }

    #[test]
    fn test_tag_matches_on_fact_equality() {
        let node = node_with_facts(json!({"role": "compute"}));
        assert!(tag_applies(&tag("compute", json!({"role": "compute"})), &node).unwrap());
        assert!(!tag_applies(&tag("storage", json!({"role": "storage"})), &node).unwrap());
    }

    #[test]
    fn test_tag_falls_back_to_metadata() {
        let mut node = node_with_facts(json!({}));
        node.metadata
            .insert("rack".to_string(), json!("r12"));
        assert!(tag_applies(&tag("rack12", json!({"rack": "r12"})), &node).unwrap());
    }

    #[test]
    fn test_empty_matchers_apply_to_everything() {
        let node = node_with_facts(json!({}));
        assert!(tag_applies(&tag("all", json!({})), &node).unwrap());
    }

    #[test]
    fn test_non_scalar_matcher_is_an_evaluation_error() {
        let node = node_with_facts(json!({}));
        let err = tag_applies(&tag("bad", json!({"role": {"nested": 1}})), &node).unwrap_err();
        assert_eq!(err.tag, "bad");
    }
}
