//! Checkin processing.
//!
//! A checkin is the periodic fact report from the in-band agent of an
//! already-resolved node: filter the facts, refresh the fact-sourced part
//! of the fingerprint, try to bind a policy, and tell the agent what to
//! do next.

use std::sync::Arc;

use chrono::Utc;
use mandrel_events::CheckinAction;
use mandrel_id::NodeId;
use serde::Serialize;
use serde_json::json;
use tracing::instrument;

use crate::config::{FactPattern, MatchConfig};
use crate::db::{Database, DbError, NodeLogStore, NodeStore};
use crate::error::CoreError;
use crate::hwinfo::{self, JsonMap};
use crate::policy::PolicyCatalogue;

use super::PolicyBinder;

/// What the agent should do next.
#[derive(Debug, Clone, Serialize)]
pub struct CheckinResponse {
    pub action: CheckinAction,
}

/// Applies fact updates and attempts policy binding.
#[derive(Clone)]
pub struct CheckinProcessor {
    db: Database,
    store: NodeStore,
    log: NodeLogStore,
    binder: PolicyBinder,
    catalogue: Arc<dyn PolicyCatalogue>,
    matching: MatchConfig,
    blacklist: Vec<FactPattern>,
}

impl CheckinProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Database,
        store: NodeStore,
        log: NodeLogStore,
        binder: PolicyBinder,
        catalogue: Arc<dyn PolicyCatalogue>,
        matching: MatchConfig,
        blacklist: Vec<FactPattern>,
    ) -> Self {
        Self {
            db,
            store,
            log,
            binder,
            catalogue,
            matching,
            blacklist,
        }
    }

    /// Process one checkin for a resolved node.
    ///
    /// Tag evaluation failures are logged against the node (which is
    /// still saved, so the fact update is not lost) and then re-raised.
    #[instrument(skip(self, facts), fields(node_id = %node_id))]
    pub async fn checkin(
        &self,
        node_id: NodeId,
        facts: &JsonMap,
    ) -> Result<CheckinResponse, CoreError> {
        let mut tx = self.db.pool().begin().await.map_err(DbError::Query)?;
        let mut node = self
            .store
            .get_for_update(&mut tx, node_id)
            .await?
            .ok_or(CoreError::NotFound(node_id))?;

        let filtered = filter_facts(facts, &self.blacklist);
        if filtered != node.facts {
            node.facts = filtered;
        }

        let refreshed = hwinfo::refresh_fact_entries(&node.hw_info, &node.facts, &self.matching);
        if refreshed != node.hw_info {
            node.hw_info = refreshed;
        }

        node.last_checkin = Some(Utc::now());

        let mut bound_name: Option<String> = None;
        if node.policy_id.is_none() {
            match self.binder.match_and_bind(&mut node).await {
                Ok(policy) => bound_name = policy.map(|p| p.name),
                Err(e @ CoreError::RuleEvaluation(_)) => {
                    self.log
                        .append(
                            &mut tx,
                            node.id,
                            &node.name,
                            json!({"severity": "error", "msg": e.to_string()}),
                            None,
                        )
                        .await?;
                    node.validate()?;
                    self.store.save(&mut tx, &node).await?;
                    tx.commit().await.map_err(DbError::Query)?;
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }

        let action = match node.policy_id {
            Some(policy_id) => {
                let policy_name = match bound_name {
                    Some(name) => name,
                    None => self
                        .catalogue
                        .get(policy_id)
                        .await?
                        .map(|p| p.name)
                        .unwrap_or_default(),
                };
                self.log
                    .append(
                        &mut tx,
                        node.id,
                        &node.name,
                        json!({"action": "reboot", "policy": policy_name}),
                        None,
                    )
                    .await?;
                CheckinAction::Reboot
            }
            None => CheckinAction::None,
        };

        node.validate()?;
        self.store.save(&mut tx, &node).await?;
        tx.commit().await.map_err(DbError::Query)?;

        Ok(CheckinResponse { action })
    }

    /// Deliver a queued `eval_tags` signal: re-evaluate tags, and bind if
    /// the node is still unbound. Nodes deleted since the signal was
    /// queued are a no-op.
    pub async fn eval_tags(&self, node_id: NodeId) -> Result<(), CoreError> {
        let mut tx = self.db.pool().begin().await.map_err(DbError::Query)?;
        let Some(mut node) = self.store.get_for_update(&mut tx, node_id).await? else {
            return Ok(());
        };

        if node.policy_id.is_some() {
            self.binder.eval_tags(&mut node).await?;
        } else {
            self.binder.match_and_bind(&mut node).await?;
        }

        node.validate()?;
        self.store.save(&mut tx, &node).await?;
        tx.commit().await.map_err(DbError::Query)?;
        Ok(())
    }
}

/// Drop facts whose name matches any blacklist pattern.
pub fn filter_facts(facts: &JsonMap, blacklist: &[FactPattern]) -> JsonMap {
    facts
        .iter()
        .filter(|(name, _)| !blacklist.iter().any(|p| p.matches(name)))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}
