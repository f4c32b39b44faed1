//! Configuration for the control plane.
//!
//! Everything is environment-driven. The identity-matching keys are
//! validated at startup: a typo in `MANDREL_MATCH_NODES_ON` would silently
//! change which machines are considered the same machine, so bad values
//! refuse to boot instead.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use regex::Regex;

use crate::hwinfo::HW_INFO_KEYS;

/// Control plane configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to listen on for HTTP connections.
    pub listen_addr: SocketAddr,

    /// Identity-matching configuration.
    pub matching: MatchConfig,

    /// Fact names matching any of these patterns are dropped at checkin.
    pub facts_blacklist: Vec<FactPattern>,

    /// Pre-mark newly created nodes installed so they cannot be bound
    /// until an operator intervenes.
    pub protect_new_nodes: bool,

    /// How often the signal worker drains the outbox.
    pub signal_interval: Duration,

    /// How often the power monitor refreshes observed power state.
    pub power_interval: Duration,

    /// Whether we're in development mode (runs migrations at boot).
    pub dev_mode: bool,
}

/// Which hardware keys and facts participate in identity matching.
#[derive(Debug, Clone)]
pub struct MatchConfig {
    /// Non-empty subset of [`HW_INFO_KEYS`] used for overlap queries.
    pub match_nodes_on: Vec<String>,

    /// Facts whose name matches any of these become `fact_*` fingerprint
    /// entries.
    pub match_nodes_on_facts: Vec<Regex>,
}

impl MatchConfig {
    /// Returns true if a fact name should contribute a fingerprint entry.
    pub fn matches_fact(&self, name: &str) -> bool {
        self.match_nodes_on_facts.iter().any(|re| re.is_match(name))
    }
}

/// A blacklist pattern over fact names: `/re/` form or a literal name.
#[derive(Debug, Clone)]
pub enum FactPattern {
    Regex(Regex),
    Literal(String),
}

impl FactPattern {
    /// Parse one blacklist item. `/re/` compiles to a regex; anything else
    /// (including a regex that fails to compile) matches literally.
    pub fn parse(raw: &str) -> Self {
        if raw.len() >= 2 && raw.starts_with('/') && raw.ends_with('/') {
            let body = &raw[1..raw.len() - 1];
            match Regex::new(body) {
                Ok(re) => return FactPattern::Regex(re),
                Err(e) => {
                    tracing::warn!(
                        pattern = raw,
                        error = %e,
                        "blacklist pattern failed to compile, matching literally"
                    );
                }
            }
        }
        FactPattern::Literal(raw.to_string())
    }

    /// Returns true if the fact name is blacklisted by this pattern.
    pub fn matches(&self, name: &str) -> bool {
        match self {
            FactPattern::Regex(re) => re.is_match(name),
            FactPattern::Literal(lit) => name == lit,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("MANDREL_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8150".to_string())
            .parse()
            .context("invalid MANDREL_LISTEN_ADDR")?;

        let match_nodes_on = csv_var("MANDREL_MATCH_NODES_ON")
            .unwrap_or_else(|| vec!["mac".into(), "uuid".into(), "serial".into()]);
        if match_nodes_on.is_empty() {
            bail!("MANDREL_MATCH_NODES_ON must name at least one hardware key");
        }
        for key in &match_nodes_on {
            if !HW_INFO_KEYS.contains(&key.as_str()) {
                bail!(
                    "MANDREL_MATCH_NODES_ON key '{key}' is not a hardware key (expected one of {})",
                    HW_INFO_KEYS.join(", ")
                );
            }
        }

        let match_nodes_on_facts = csv_var("MANDREL_MATCH_NODES_ON_FACTS")
            .unwrap_or_default()
            .iter()
            .map(|p| Regex::new(p).with_context(|| format!("invalid fact pattern '{p}'")))
            .collect::<Result<Vec<_>>>()?;

        let facts_blacklist = csv_var("MANDREL_FACTS_BLACKLIST")
            .unwrap_or_default()
            .iter()
            .map(|p| FactPattern::parse(p))
            .collect();

        let protect_new_nodes = bool_var("MANDREL_PROTECT_NEW_NODES");
        let dev_mode = bool_var("MANDREL_DEV");

        let signal_interval = secs_var("MANDREL_SIGNAL_INTERVAL_SECS", 1);
        let power_interval = secs_var("MANDREL_POWER_INTERVAL_SECS", 300);

        Ok(Self {
            listen_addr,
            matching: MatchConfig {
                match_nodes_on,
                match_nodes_on_facts,
            },
            facts_blacklist,
            protect_new_nodes,
            signal_interval,
            power_interval,
            dev_mode,
        })
    }
}

fn csv_var(name: &str) -> Option<Vec<String>> {
    std::env::var(name).ok().map(|v| {
        v.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
}

fn bool_var(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}

fn secs_var(name: &str, default: u64) -> Duration {
    Duration::from_secs(
        std::env::var(name)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(default),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fact_pattern_regex_form() {
        let p = FactPattern::parse("/^uptime/");
        assert!(p.matches("uptime_seconds"));
        assert!(!p.matches("kernel"));
    }

    #[test]
    fn test_fact_pattern_literal() {
        let p = FactPattern::parse("uptime");
        assert!(p.matches("uptime"));
        assert!(!p.matches("uptime_seconds"));
    }

    #[test]
    fn test_fact_pattern_bad_regex_falls_back_to_literal() {
        let p = FactPattern::parse("/[unclosed/");
        assert!(matches!(p, FactPattern::Literal(_)));
        assert!(p.matches("/[unclosed/"));
    }

    #[test]
    fn test_match_config_fact_selection() {
        let cfg = MatchConfig {
            match_nodes_on: vec!["mac".into()],
            match_nodes_on_facts: vec![Regex::new("serial_number").unwrap()],
        };
        assert!(cfg.matches_fact("serial_number"));
        assert!(!cfg.matches_fact("kernel"));
    }
}
