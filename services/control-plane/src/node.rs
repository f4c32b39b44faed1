//! The node entity.
//!
//! A node is a physical machine known to the control plane. It is created
//! by identity resolution when a descriptor matches nothing, destroyed
//! only by the fact/firmware merge or an explicit administrative delete,
//! and mutated exclusively through the identity and lifecycle services.

use chrono::{DateTime, Utc};
use mandrel_events::PowerState;
use mandrel_id::{NodeId, PolicyId};

use crate::error::CoreError;
use crate::hwinfo::JsonMap;

/// A node row, fully materialized. The API layer maps nodes to
/// credential-free response types; this struct never serializes.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,

    /// Server-assigned human label (`node1`, `node2`, ...). Immutable.
    pub name: String,

    /// Canonical hardware fingerprint, sorted `key=value` entries.
    pub hw_info: Vec<String>,

    /// Lowercase hyphen-form MAC seen at DHCP time, if any.
    pub dhcp_mac: Option<String>,

    /// Latest fact snapshot from the agent, post-blacklist.
    pub facts: JsonMap,

    /// Administrative annotations.
    pub metadata: JsonMap,

    /// Names of the tags that currently match this node.
    pub tags: Vec<String>,

    pub policy_id: Option<PolicyId>,

    /// Name of the policy under which installation finished, or a marker
    /// for operator-protected nodes. None means not installed.
    pub installed: Option<String>,
    pub installed_at: Option<DateTime<Utc>>,

    pub hostname: Option<String>,
    pub root_password: Option<String>,

    /// Incremented at stage completion; reset to 1 by binding.
    pub boot_count: i32,

    pub last_checkin: Option<DateTime<Utc>>,

    pub desired_power_state: PowerState,
    pub last_known_power_state: PowerState,
    pub last_power_state_update_at: Option<DateTime<Utc>>,

    pub ipmi_hostname: Option<String>,
    pub ipmi_username: Option<String>,
    pub ipmi_password: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Node {
    /// Check entity invariants. Pure: never mutates, never normalizes.
    /// Anything that needs normalization happens upstream in the
    /// canonicalizer.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.name.trim().is_empty() {
            return Err(CoreError::Validation("node name must not be empty".into()));
        }

        let mut seen = std::collections::BTreeSet::new();
        for entry in &self.hw_info {
            let Some((key, value)) = entry.split_once('=') else {
                return Err(CoreError::Validation(format!(
                    "hw_info entry '{entry}' is missing '='"
                )));
            };
            if key.is_empty() || value.is_empty() {
                return Err(CoreError::Validation(format!(
                    "hw_info entry '{entry}' has an empty key or value"
                )));
            }
            if *entry != entry.to_lowercase() {
                return Err(CoreError::Validation(format!(
                    "hw_info entry '{entry}' is not lowercase"
                )));
            }
            if !seen.insert(entry) {
                return Err(CoreError::Validation(format!(
                    "hw_info contains duplicate entry '{entry}'"
                )));
            }
        }

        if self.installed.is_some() != self.installed_at.is_some() {
            return Err(CoreError::Validation(
                "installed and installed_at must be set together".into(),
            ));
        }

        if (self.ipmi_username.is_some() || self.ipmi_password.is_some())
            && self.ipmi_hostname.is_none()
        {
            return Err(CoreError::Validation(
                "IPMI credentials require an IPMI hostname".into(),
            ));
        }

        Ok(())
    }

    /// True once installation has completed (or the node is protected).
    pub fn is_installed(&self) -> bool {
        self.installed.is_some()
    }
}
