//! Administrative node mutations: stage completion, metadata edits, and
//! desired power state.

use std::sync::Arc;

use chrono::Utc;
use mandrel_events::{NodeSignal, PowerState, SignalKind};
use mandrel_id::{NodeId, RequestId};
use serde::Deserialize;
use serde_json::json;
use tracing::instrument;

use crate::db::{Database, DbError, NodeLogStore, NodeStore, Outbox};
use crate::error::CoreError;
use crate::hwinfo::JsonMap;
use crate::node::Node;
use crate::policy::PolicyCatalogue;

/// A metadata edit. Applied as: clear, then remove, then update.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetadataPatch {
    #[serde(default)]
    pub update: Option<JsonMap>,

    #[serde(default)]
    pub remove: Option<Vec<String>>,

    /// Wipe all metadata first.
    #[serde(default)]
    pub clear: bool,

    /// Keep existing keys; only absent keys admit the update.
    #[serde(default)]
    pub no_replace: bool,
}

/// Apply a metadata patch. Existing entries are preserved under
/// `no_replace` regardless of their stored value.
pub fn apply_metadata_patch(metadata: &mut JsonMap, patch: &MetadataPatch) {
    if patch.clear {
        metadata.clear();
    }
    if let Some(remove) = &patch.remove {
        for key in remove {
            metadata.remove(key);
        }
    }
    if let Some(update) = &patch.update {
        for (key, value) in update {
            if patch.no_replace && metadata.contains_key(key) {
                continue;
            }
            metadata.insert(key.clone(), value.clone());
        }
    }
}

/// Lifecycle mutations, each one transaction.
#[derive(Clone)]
pub struct NodeLifecycle {
    db: Database,
    store: NodeStore,
    log: NodeLogStore,
    outbox: Outbox,
    catalogue: Arc<dyn PolicyCatalogue>,
}

impl NodeLifecycle {
    pub fn new(
        db: Database,
        store: NodeStore,
        log: NodeLogStore,
        outbox: Outbox,
        catalogue: Arc<dyn PolicyCatalogue>,
    ) -> Self {
        Self {
            db,
            store,
            log,
            outbox,
            catalogue,
        }
    }

    /// Record completion of an installer stage.
    ///
    /// `boot_count` is incremented first; a `finished` stage then seals
    /// the node as installed under its policy's name. The order matters:
    /// the sealed state and the final count land in the same save.
    #[instrument(skip(self), fields(node_id = %node_id))]
    pub async fn stage_done(&self, node_id: NodeId, stage: &str) -> Result<Node, CoreError> {
        let mut tx = self.db.pool().begin().await.map_err(DbError::Query)?;
        let mut node = self
            .store
            .get_for_update(&mut tx, node_id)
            .await?
            .ok_or(CoreError::NotFound(node_id))?;

        node.boot_count += 1;

        if stage == "finished" {
            if let Some(policy_id) = node.policy_id {
                let policy_name = self
                    .catalogue
                    .get(policy_id)
                    .await?
                    .map(|p| p.name)
                    .unwrap_or_else(|| "true".to_string());
                node.installed = Some(policy_name);
                node.installed_at = Some(Utc::now());
            }
        }

        self.log
            .append(
                &mut tx,
                node.id,
                &node.name,
                json!({"event": "stage_done", "stage": stage}),
                None,
            )
            .await?;

        node.validate()?;
        self.store.save(&mut tx, &node).await?;
        tx.commit().await.map_err(DbError::Query)?;
        Ok(node)
    }

    /// Edit a node's metadata. Emits an `eval_tags` signal in the same
    /// transaction when anything changed; tag expressions may reference
    /// metadata, so the tag set must be recomputed after commit.
    #[instrument(skip(self, patch), fields(node_id = %node_id))]
    pub async fn modify_metadata(
        &self,
        node_id: NodeId,
        patch: &MetadataPatch,
    ) -> Result<Node, CoreError> {
        let mut tx = self.db.pool().begin().await.map_err(DbError::Query)?;
        let mut node = self
            .store
            .get_for_update(&mut tx, node_id)
            .await?
            .ok_or(CoreError::NotFound(node_id))?;

        let before = node.metadata.clone();
        apply_metadata_patch(&mut node.metadata, patch);

        if node.metadata != before {
            node.validate()?;
            self.store.save(&mut tx, &node).await?;
            self.outbox
                .publish(
                    &mut tx,
                    &NodeSignal::new(node.id, SignalKind::EvalTags, RequestId::new()),
                )
                .await?;
        }

        tx.commit().await.map_err(DbError::Query)?;
        Ok(node)
    }

    /// Set the state the power reconciler should converge toward.
    pub async fn set_desired_power(
        &self,
        node_id: NodeId,
        desired: PowerState,
    ) -> Result<Node, CoreError> {
        let mut tx = self.db.pool().begin().await.map_err(DbError::Query)?;
        let mut node = self
            .store
            .get_for_update(&mut tx, node_id)
            .await?
            .ok_or(CoreError::NotFound(node_id))?;

        node.desired_power_state = desired;
        node.validate()?;
        self.store.save(&mut tx, &node).await?;
        tx.commit().await.map_err(DbError::Query)?;
        Ok(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(v: serde_json::Value) -> JsonMap {
        v.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_no_replace_preserves_existing_keys() {
        let mut metadata = map(json!({"k": "v0"}));
        apply_metadata_patch(
            &mut metadata,
            &MetadataPatch {
                update: Some(map(json!({"k": "v1"}))),
                no_replace: true,
                ..Default::default()
            },
        );
        assert_eq!(metadata["k"], "v0");
    }

    #[test]
    fn test_update_overwrites_without_no_replace() {
        let mut metadata = map(json!({"k": "v0"}));
        apply_metadata_patch(
            &mut metadata,
            &MetadataPatch {
                update: Some(map(json!({"k": "v1"}))),
                ..Default::default()
            },
        );
        assert_eq!(metadata["k"], "v1");
    }

    #[test]
    fn test_clear_empties_metadata() {
        let mut metadata = map(json!({"k": "v0", "j": 1}));
        apply_metadata_patch(
            &mut metadata,
            &MetadataPatch {
                clear: true,
                ..Default::default()
            },
        );
        assert!(metadata.is_empty());
    }

    #[test]
    fn test_remove_drops_named_keys() {
        let mut metadata = map(json!({"k": "v0", "j": 1}));
        apply_metadata_patch(
            &mut metadata,
            &MetadataPatch {
                remove: Some(vec!["j".into()]),
                ..Default::default()
            },
        );
        assert_eq!(metadata, map(json!({"k": "v0"})));
    }

    #[test]
    fn test_no_replace_preserves_stored_empty_string() {
        let mut metadata = map(json!({"k": ""}));
        apply_metadata_patch(
            &mut metadata,
            &MetadataPatch {
                update: Some(map(json!({"k": "v1"}))),
                no_replace: true,
                ..Default::default()
            },
        );
        assert_eq!(metadata["k"], "");
    }
}
