//! Identity resolution: one descriptor in, exactly one node out.
//!
//! A machine that fails to identify at firmware boot is first registered
//! with bare firmware info, then again under a distinct identity when its
//! operating agent reports facts. The size-2 merge below heals that
//! split; everything else here exists to make sure two machines are never
//! conflated and one machine is never duplicated.

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, instrument};

use crate::config::MatchConfig;
use crate::db::{Database, DbError, NewNode, NodeLogStore, NodeStore};
use crate::error::CoreError;
use crate::hwinfo::{self, HwDescriptor, JsonMap};
use crate::node::Node;

/// A lookup carries exactly one of an agent fact report or a firmware
/// descriptor.
#[derive(Debug, Clone)]
pub enum LookupRequest {
    Facts(JsonMap),
    Boot(HwDescriptor),
}

impl LookupRequest {
    /// Build a request from optional parts, rejecting none-or-both.
    pub fn from_parts(
        facts: Option<JsonMap>,
        hw_info: Option<HwDescriptor>,
    ) -> Result<Self, CoreError> {
        match (facts, hw_info) {
            (Some(facts), None) if !facts.is_empty() => Ok(LookupRequest::Facts(facts)),
            (None, Some(descriptor)) => Ok(LookupRequest::Boot(descriptor)),
            (Some(_), Some(_)) => Err(CoreError::InvalidArgument(
                "supply either facts or hw_info, not both".into(),
            )),
            _ => Err(CoreError::InvalidArgument(
                "either facts or hw_info must be supplied".into(),
            )),
        }
    }
}

/// Maps descriptors to nodes.
#[derive(Clone)]
pub struct IdentityResolver {
    db: Database,
    store: NodeStore,
    log: NodeLogStore,
    matching: MatchConfig,
    protect_new_nodes: bool,
}

impl IdentityResolver {
    pub fn new(
        db: Database,
        store: NodeStore,
        log: NodeLogStore,
        matching: MatchConfig,
        protect_new_nodes: bool,
    ) -> Self {
        Self {
            db,
            store,
            log,
            matching,
            protect_new_nodes,
        }
    }

    /// Resolve a descriptor to a node. The boolean is true when the node
    /// was created by this call.
    ///
    /// A racing lookup can lose a creation race on the match-entry unique
    /// key; the loser retries once and then takes the update path against
    /// the winner's row.
    #[instrument(skip_all)]
    pub async fn lookup(&self, request: &LookupRequest) -> Result<(Node, bool), CoreError> {
        match self.lookup_once(request).await {
            Err(e) if e.is_unique_violation() => {
                debug!("lookup lost a registration race, retrying");
                self.lookup_once(request).await
            }
            other => other,
        }
    }

    async fn lookup_once(&self, request: &LookupRequest) -> Result<(Node, bool), CoreError> {
        let (descriptor, boot_path) = match request {
            LookupRequest::Facts(facts) => {
                (hwinfo::descriptor_from_facts(facts, &self.matching), false)
            }
            LookupRequest::Boot(descriptor) => (descriptor.clone(), true),
        };

        let hw_info = hwinfo::canonicalize(&descriptor);
        let dhcp_mac = descriptor.dhcp_mac.as_deref().map(hwinfo::normalize_mac);

        let hw_match = hwinfo::hw_match(&hw_info, &self.matching);
        if hw_match.is_empty() {
            return Err(CoreError::InvalidArgument(format!(
                "none of the supplied keys [{}] are usable for node matching",
                hwinfo::bare_keys(&hw_info).join(", ")
            )));
        }

        let mut tx = self.db.pool().begin().await.map_err(DbError::Query)?;
        let matches = self.store.overlap(&mut tx, &hw_match).await?;

        match matches.len() {
            0 => {
                let (installed, installed_at) = if self.protect_new_nodes {
                    (Some("true".to_string()), Some(Utc::now()))
                } else {
                    (None, None)
                };
                let node = self
                    .store
                    .create(
                        &mut tx,
                        NewNode {
                            name: None,
                            hw_info,
                            dhcp_mac,
                            installed,
                            installed_at,
                        },
                    )
                    .await?;
                tx.commit().await.map_err(DbError::Query)?;
                info!(node = %node.name, protected = self.protect_new_nodes, "registered new node");
                Ok((node, true))
            }
            1 => {
                let mut node = matches.into_iter().next().ok_or_else(|| {
                    CoreError::Validation("overlap returned an empty match".into())
                })?;
                if update_in_place(&mut node, &hw_info, dhcp_mac.as_deref()) {
                    node.validate()?;
                    self.store.save(&mut tx, &node).await?;
                }
                tx.commit().await.map_err(DbError::Query)?;
                Ok((node, false))
            }
            2 => {
                let (mut with_facts, without): (Vec<Node>, Vec<Node>) = matches
                    .into_iter()
                    .partition(|n| hwinfo::has_fact_entries(&n.hw_info));

                if with_facts.len() == 1 && without.len() == 1 {
                    let mut real = with_facts.remove(0);
                    let fake = &without[0];

                    real.hw_info = hw_info;
                    if let Some(mac) = dhcp_mac {
                        real.dhcp_mac = Some(mac);
                    }

                    let moved = self.log.move_entries(&mut tx, fake.id, real.id).await?;
                    self.store.destroy(&mut tx, fake.id).await?;
                    real.validate()?;
                    self.store.save(&mut tx, &real).await?;
                    tx.commit().await.map_err(DbError::Query)?;

                    info!(
                        node = %real.name,
                        absorbed = %fake.name,
                        log_entries_moved = moved,
                        "merged firmware-only registration into fact-bearing node"
                    );
                    Ok((real, false))
                } else {
                    let nodes: Vec<Node> =
                        with_facts.into_iter().chain(without).collect();
                    self.duplicate(tx, hw_info, nodes, boot_path).await
                }
            }
            _ => self.duplicate(tx, hw_info, matches, boot_path).await,
        }
    }

    /// Identity is ambiguous. In the boot path every candidate gets a
    /// `duplicate_node` log entry before the error surfaces.
    async fn duplicate(
        &self,
        mut tx: sqlx::Transaction<'_, sqlx::Postgres>,
        hw_info: Vec<String>,
        nodes: Vec<Node>,
        boot_path: bool,
    ) -> Result<(Node, bool), CoreError> {
        if boot_path {
            for node in &nodes {
                self.log
                    .append(
                        &mut tx,
                        node.id,
                        &node.name,
                        json!({
                            "severity": "error",
                            "event": "boot",
                            "error": "duplicate_node",
                            "hw_info": hw_info,
                        }),
                        None,
                    )
                    .await?;
            }
            tx.commit().await.map_err(DbError::Query)?;
        } else {
            tx.rollback().await.map_err(DbError::Query)?;
        }

        Err(CoreError::DuplicateNode {
            hw_info,
            nodes: nodes.into_iter().map(|n| (n.id, n.name)).collect(),
        })
    }
}

/// Apply a matching descriptor to its single matched node. Returns true
/// when anything changed.
///
/// The firmware part of the fingerprint is authoritative from either
/// path; stored fact entries are preserved when the incoming descriptor
/// carries none (a firmware boot must not erase fact identity).
fn update_in_place(node: &mut Node, incoming: &[String], dhcp_mac: Option<&str>) -> bool {
    let mut changed = false;

    if let Some(mac) = dhcp_mac {
        if node.dhcp_mac.as_deref() != Some(mac) {
            node.dhcp_mac = Some(mac.to_string());
            changed = true;
        }
    }

    let incoming_firmware: Vec<&String> = non_fact_entries(incoming);
    let stored_firmware: Vec<&String> = non_fact_entries(&node.hw_info);

    if incoming_firmware != stored_firmware {
        if hwinfo::has_fact_entries(incoming) {
            node.hw_info = incoming.to_vec();
        } else {
            let mut merged: Vec<String> = incoming.to_vec();
            merged.extend(
                node.hw_info
                    .iter()
                    .filter(|e| e.starts_with(hwinfo::FACT_PREFIX))
                    .cloned(),
            );
            merged.sort();
            merged.dedup();
            node.hw_info = merged;
        }
        changed = true;
    }

    changed
}

fn non_fact_entries(entries: &[String]) -> Vec<&String> {
    entries
        .iter()
        .filter(|e| !e.starts_with(hwinfo::FACT_PREFIX))
        .collect()
}
