//! Tag evaluation and policy binding.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::OnceLock;

use chrono::Utc;
use regex::{NoExpand, Regex};
use tracing::info;

use crate::error::CoreError;
use crate::hwinfo::JsonMap;
use crate::node::Node;
use crate::policy::{Policy, PolicyCatalogue};
use crate::tags::TagMatcher;

fn id_var() -> &'static Regex {
    static ID_VAR: OnceLock<Regex> = OnceLock::new();
    ID_VAR.get_or_init(|| Regex::new(r"\$\{\s*id\s*\}").unwrap())
}

/// Applies a matched policy to a node.
#[derive(Clone)]
pub struct PolicyBinder {
    matcher: Arc<dyn TagMatcher>,
    catalogue: Arc<dyn PolicyCatalogue>,
}

impl PolicyBinder {
    pub fn new(matcher: Arc<dyn TagMatcher>, catalogue: Arc<dyn PolicyCatalogue>) -> Self {
        Self { matcher, catalogue }
    }

    /// Re-evaluate all tag expressions and apply the result to the node's
    /// tag set by symmetric difference. Mutates in memory only.
    pub async fn eval_tags(&self, node: &mut Node) -> Result<(), CoreError> {
        let matched = self.matcher.matching_tags(node).await?;
        let current: BTreeSet<String> = node.tags.iter().cloned().collect();
        let changed: Vec<String> = current.symmetric_difference(&matched).cloned().collect();
        if !changed.is_empty() {
            node.tags = matched.into_iter().collect();
        }
        Ok(())
    }

    /// Evaluate tags, then ask the catalogue for the first applicable
    /// policy and bind it. Returns the policy bound by this call, if any.
    pub async fn match_and_bind(&self, node: &mut Node) -> Result<Option<Policy>, CoreError> {
        self.eval_tags(node).await?;

        let Some(policy) = self.catalogue.pick(node).await? else {
            return Ok(None);
        };
        bind(node, &policy);
        info!(node = %node.name, policy = %policy.name, "bound node to policy");
        Ok(Some(policy))
    }
}

/// Apply a policy to a node: reference, credentials, hostname, metadata,
/// and a reset of the install state.
pub fn bind(node: &mut Node, policy: &Policy) {
    node.policy_id = Some(policy.id);
    node.boot_count = 1;
    node.installed = None;
    node.installed_at = None;
    node.root_password = policy.root_password.clone();
    node.hostname = Some(render_hostname(&policy.hostname_pattern, node));
    if let Some(extra) = &policy.node_metadata {
        merge_no_replace(&mut node.metadata, extra);
    }
    node.updated_at = Utc::now();
}

/// Substitute `${id}` (whitespace inside the braces allowed) with the
/// node's id.
pub fn render_hostname(pattern: &str, node: &Node) -> String {
    let id = node.id.to_string();
    id_var().replace_all(pattern, NoExpand(&id)).into_owned()
}

/// Merge `src` into `dest` without overwriting existing keys. Existing
/// entries are preserved regardless of their value.
pub fn merge_no_replace(dest: &mut JsonMap, src: &JsonMap) {
    for (key, value) in src {
        if !dest.contains_key(key) {
            dest.insert(key.clone(), value.clone());
        }
    }
}
