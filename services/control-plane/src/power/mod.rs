//! Power state reconciliation.
//!
//! The control plane never toggles power inline with an observation: the
//! reconciler records what it saw, and when observed and desired state
//! disagree it queues a power signal for the background worker. Only the
//! thin wrappers (`reboot`, `on`, `off`) drive the channel synchronously.

mod ipmitool;

pub use ipmitool::IpmitoolChannel;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use mandrel_events::{NodeSignal, PowerState, SignalKind};
use mandrel_id::{NodeId, RequestId};
use serde_json::json;
use thiserror::Error;
use tracing::instrument;

use crate::db::{Database, DbError, NodeLogStore, NodeStore, Outbox};
use crate::error::CoreError;
use crate::node::Node;

/// Management-channel failures. `Report` is the channel answering with an
/// error of its own; `Transport` is not reaching the channel at all.
#[derive(Debug, Error)]
pub enum ManagementError {
    #[error("management channel error for {node}: {message}")]
    Report { node: String, message: String },

    #[error("management transport failed for {node}: {source}")]
    Transport {
        node: String,
        #[source]
        source: std::io::Error,
    },

    #[error("node {0} has no management credentials")]
    NoCredentials(String),
}

/// The remote management (IPMI) collaborator.
#[async_trait]
pub trait ManagementChannel: Send + Sync {
    /// Is the chassis powered on?
    async fn is_on(&self, node: &Node) -> Result<bool, ManagementError>;

    /// Set chassis power.
    async fn power(&self, node: &Node, on: bool) -> Result<(), ManagementError>;

    /// Power-cycle the chassis.
    async fn reset(&self, node: &Node) -> Result<(), ManagementError>;
}

/// Reads current power state, compares to desired, queues corrective
/// action.
#[derive(Clone)]
pub struct PowerReconciler {
    db: Database,
    store: NodeStore,
    log: NodeLogStore,
    outbox: Outbox,
    channel: Arc<dyn ManagementChannel>,
}

impl PowerReconciler {
    pub fn new(
        db: Database,
        store: NodeStore,
        log: NodeLogStore,
        outbox: Outbox,
        channel: Arc<dyn ManagementChannel>,
    ) -> Self {
        Self {
            db,
            store,
            log,
            outbox,
            channel,
        }
    }

    /// Observe the node's power state and record it.
    ///
    /// On success the observed state is persisted; if it is known and
    /// differs from the desired state, a power signal naming the desired
    /// state is queued in the same transaction. On a channel failure the
    /// state is recorded as unknown and the error re-raised — the failed
    /// observation is persisted either way.
    #[instrument(skip(self))]
    pub async fn update_power_state(&self, node_id: NodeId) -> Result<PowerState, CoreError> {
        // Query the channel before taking the row lock; no lock is held
        // across the management round-trip.
        let node = self
            .store
            .get(node_id)
            .await?
            .ok_or(CoreError::NotFound(node_id))?;
        let observed = self.channel.is_on(&node).await;

        let mut tx = self.db.pool().begin().await.map_err(DbError::Query)?;
        let mut node = self
            .store
            .get_for_update(&mut tx, node_id)
            .await?
            .ok_or(CoreError::NotFound(node_id))?;
        node.last_power_state_update_at = Some(Utc::now());

        match observed {
            Ok(on) => {
                node.last_known_power_state = if on { PowerState::On } else { PowerState::Off };

                if node.desired_power_state.is_known()
                    && node.last_known_power_state != node.desired_power_state
                {
                    let signal = NodeSignal::new(
                        node.id,
                        SignalKind::Power {
                            desired: node.desired_power_state,
                        },
                        RequestId::new(),
                    );
                    self.outbox.publish(&mut tx, &signal).await?;
                }

                node.validate()?;
                self.store.save(&mut tx, &node).await?;
                tx.commit().await.map_err(DbError::Query)?;
                Ok(node.last_known_power_state)
            }
            Err(e) => {
                node.last_known_power_state = PowerState::Unknown;
                node.validate()?;
                self.store.save(&mut tx, &node).await?;
                tx.commit().await.map_err(DbError::Query)?;
                Err(e.into())
            }
        }
    }

    /// Drive the chassis toward the given state. Called by the signal
    /// worker when delivering a queued power signal.
    pub async fn apply_power(&self, node_id: NodeId, desired: PowerState) -> Result<(), CoreError> {
        let node = self.store.get(node_id).await?.ok_or(CoreError::NotFound(node_id))?;
        match desired {
            PowerState::On => self.channel.power(&node, true).await?,
            PowerState::Off => self.channel.power(&node, false).await?,
            PowerState::Unknown => {}
        }
        Ok(())
    }

    /// Power-cycle the node and record the action in its log.
    pub async fn reboot(&self, node_id: NodeId) -> Result<(), CoreError> {
        let node = self.store.get(node_id).await?.ok_or(CoreError::NotFound(node_id))?;
        self.channel.reset(&node).await?;

        let mut tx = self.db.pool().begin().await.map_err(DbError::Query)?;
        self.log
            .append(&mut tx, node.id, &node.name, json!({"event": "reboot"}), None)
            .await?;
        tx.commit().await.map_err(DbError::Query)?;
        Ok(())
    }

    /// Power the node on.
    pub async fn on(&self, node_id: NodeId) -> Result<(), CoreError> {
        self.apply_power(node_id, PowerState::On).await
    }

    /// Power the node off.
    pub async fn off(&self, node_id: NodeId) -> Result<(), CoreError> {
        self.apply_power(node_id, PowerState::Off).await
    }
}
