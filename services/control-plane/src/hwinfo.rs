//! Hardware fingerprint canonicalization.
//!
//! A node's identity is a sorted sequence of `key=value` strings distilled
//! from whatever the firmware or the in-band agent reported. The procedure
//! here must be deterministic and order-independent: the same machine has
//! to produce the same fingerprint at every boot, whether its NICs
//! enumerate as `net0,net1` or `net1,net0` and whether the report came
//! from the boot microkernel or from facts. Changing this procedure is a
//! breaking change that may require a data migration.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::config::MatchConfig;

/// A JSON object, as used for facts and metadata throughout.
pub type JsonMap = serde_json::Map<String, Value>;

/// The closed set of legal non-fact hardware keys.
///
/// Anything else in a descriptor is dropped unless it carries the
/// [`FACT_PREFIX`].
pub const HW_INFO_KEYS: &[&str] = &["asset", "mac", "serial", "uuid"];

/// Prefix for fact-derived fingerprint entries. Always accepted.
pub const FACT_PREFIX: &str = "fact_";

fn net_key() -> &'static Regex {
    static NET_KEY: OnceLock<Regex> = OnceLock::new();
    NET_KEY.get_or_init(|| Regex::new("^net[0-9]+$").unwrap())
}

// =============================================================================
// Descriptor
// =============================================================================

/// A raw hardware descriptor, as sent by the boot microkernel.
///
/// `mac` accepts a scalar or a list; every other scalar lands in `other`
/// (including `netN` aliases and unknown keys, which canonicalization
/// rewrites or drops).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HwDescriptor {
    #[serde(default, deserialize_with = "string_or_list")]
    pub mac: Vec<String>,

    #[serde(default)]
    pub facts: JsonMap,

    #[serde(default)]
    pub dhcp_mac: Option<String>,

    #[serde(flatten)]
    pub other: JsonMap,
}

fn string_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match value {
        Value::Null => Ok(Vec::new()),
        Value::String(s) => Ok(vec![s]),
        Value::Array(items) => Ok(items.iter().map(scalar_string).collect()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or list of strings, got {other}"
        ))),
    }
}

/// Build a descriptor from an agent fact report.
///
/// Well-known facts map onto hardware keys (`macaddress*` → `mac`,
/// `uuid` → `uuid`, `serialnumber` → `serial`, `assettag` → `asset`);
/// facts selected by `match_nodes_on_facts` become `fact_*` entries; and
/// `dhcp_mac` is taken from the `macaddress` fact.
pub fn descriptor_from_facts(facts: &JsonMap, matching: &MatchConfig) -> HwDescriptor {
    let mut mac = Vec::new();
    if let Some(m) = facts.get("macaddress").and_then(Value::as_str) {
        mac.push(m.to_string());
    }
    for (name, value) in facts {
        if name.starts_with("macaddress_") {
            if let Some(m) = value.as_str() {
                mac.push(m.to_string());
            }
        }
    }

    let mut other = JsonMap::new();
    for (fact, key) in [
        ("uuid", "uuid"),
        ("serialnumber", "serial"),
        ("assettag", "asset"),
    ] {
        if let Some(v) = facts.get(fact) {
            other.insert(key.to_string(), v.clone());
        }
    }

    let selected: JsonMap = facts
        .iter()
        .filter(|(name, _)| matching.matches_fact(name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();

    let dhcp_mac = facts
        .get("macaddress")
        .and_then(Value::as_str)
        .map(normalize_mac);

    HwDescriptor {
        mac,
        facts: selected,
        dhcp_mac,
        other,
    }
}

/// Lowercase hyphen-form of a MAC address.
pub fn normalize_mac(mac: &str) -> String {
    mac.trim().to_lowercase().replace(':', "-")
}

// =============================================================================
// Canonicalization
// =============================================================================

/// Produce the canonical fingerprint for a descriptor.
pub fn canonicalize(descriptor: &HwDescriptor) -> Vec<String> {
    let mut pairs: Vec<(String, String)> = Vec::new();

    for (name, value) in &descriptor.facts {
        pairs.push((format!("{FACT_PREFIX}{name}"), scalar_string(value)));
    }
    for mac in &descriptor.mac {
        pairs.push(("mac".to_string(), mac.clone()));
    }
    for (key, value) in &descriptor.other {
        pairs.push((key.clone(), scalar_string(value)));
    }

    canonical_entries(pairs)
}

/// Canonicalize a flat list of key/value pairs.
///
/// `netN` keys collapse to `mac`, keys and values are lowercased, values
/// trimmed, MAC colons become hyphens, empty values and unknown keys are
/// dropped, and the result is sorted by `(key, value)` with duplicates
/// removed.
pub fn canonical_entries(pairs: Vec<(String, String)>) -> Vec<String> {
    let mut entries: Vec<(String, String)> = Vec::with_capacity(pairs.len());

    for (raw_key, raw_value) in pairs {
        let mut key = raw_key.trim().to_lowercase();
        if net_key().is_match(&key) {
            key = "mac".to_string();
        }
        let mut value = raw_value.trim().to_lowercase();
        if key == "mac" {
            value = value.replace(':', "-");
        }
        if value.is_empty() {
            continue;
        }
        if !key.starts_with(FACT_PREFIX) && !HW_INFO_KEYS.contains(&key.as_str()) {
            continue;
        }
        entries.push((key, value));
    }

    entries.sort();
    entries.dedup();
    entries
        .into_iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect()
}

/// Split stored entries back into key/value pairs. Entries without a `=`
/// are skipped; validation rejects them before they can be stored.
pub fn entry_pairs(entries: &[String]) -> Vec<(String, String)> {
    entries
        .iter()
        .filter_map(|e| e.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Replace the fact-sourced portion of a stored fingerprint.
///
/// All existing `fact_*` entries are dropped; facts selected by
/// `match_nodes_on_facts` are spliced back in; the whole set is
/// re-canonicalized.
pub fn refresh_fact_entries(
    stored: &[String],
    facts: &JsonMap,
    matching: &MatchConfig,
) -> Vec<String> {
    let mut pairs: Vec<(String, String)> = entry_pairs(stored)
        .into_iter()
        .filter(|(key, _)| !key.starts_with(FACT_PREFIX))
        .collect();

    for (name, value) in facts {
        if matching.matches_fact(name) {
            pairs.push((format!("{FACT_PREFIX}{name}"), scalar_string(value)));
        }
    }

    canonical_entries(pairs)
}

// =============================================================================
// Match selection
// =============================================================================

/// The subset of a fingerprint eligible for identity matching: entries
/// whose bare key is configured in `match_nodes_on`, plus every `fact_*`
/// entry.
pub fn hw_match(hw_info: &[String], matching: &MatchConfig) -> Vec<String> {
    hw_info
        .iter()
        .filter(|entry| {
            let key = entry.split('=').next().unwrap_or(entry);
            key.starts_with(FACT_PREFIX) || matching.match_nodes_on.iter().any(|k| k == key)
        })
        .cloned()
        .collect()
}

/// The firmware-sourced match entries, i.e. [`hw_match`] minus `fact_*`.
/// These back the store's uniqueness guarantee.
pub fn unique_match_entries(hw_info: &[String], matching: &MatchConfig) -> Vec<String> {
    hw_match(hw_info, matching)
        .into_iter()
        .filter(|entry| !entry.starts_with(FACT_PREFIX))
        .collect()
}

/// Returns true if any entry is fact-sourced.
pub fn has_fact_entries(hw_info: &[String]) -> bool {
    hw_info.iter().any(|entry| entry.starts_with(FACT_PREFIX))
}

/// The distinct bare keys of a fingerprint, for error messages.
pub fn bare_keys(hw_info: &[String]) -> Vec<String> {
    let mut keys: Vec<String> = hw_info
        .iter()
        .map(|entry| entry.split('=').next().unwrap_or(entry).to_string())
        .collect();
    keys.sort();
    keys.dedup();
    keys
}

fn scalar_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn matching(facts: &[&str]) -> MatchConfig {
        MatchConfig {
            match_nodes_on: vec!["mac".into(), "uuid".into(), "serial".into()],
            match_nodes_on_facts: facts.iter().map(|p| Regex::new(p).unwrap()).collect(),
        }
    }

    fn descriptor(json: Value) -> HwDescriptor {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_net_keys_collapse_to_mac() {
        let hw = canonicalize(&descriptor(json!({
            "net0": "AA:BB:CC:DD:EE:03",
            "net1": "AA:BB:CC:DD:EE:04",
        })));
        assert_eq!(hw, vec!["mac=aa-bb-cc-dd-ee-03", "mac=aa-bb-cc-dd-ee-04"]);
    }

    #[test]
    fn test_net_and_mac_forms_agree() {
        let from_net0 = canonicalize(&descriptor(json!({"net0": "AA:BB:CC:00:11:22"})));
        let from_net1 = canonicalize(&descriptor(json!({"net1": "AA:BB:CC:00:11:22"})));
        let from_mac = canonicalize(&descriptor(json!({"mac": "AA:BB:CC:00:11:22"})));
        assert_eq!(from_net0, vec!["mac=aa-bb-cc-00-11-22"]);
        assert_eq!(from_net0, from_net1);
        assert_eq!(from_net0, from_mac);
    }

    #[test]
    fn test_mac_list_order_independent() {
        let a = canonicalize(&descriptor(json!({"mac": ["AA:00", "BB:11"]})));
        let b = canonicalize(&descriptor(json!({"mac": ["BB:11", "AA:00"]})));
        assert_eq!(a, b);
    }

    #[test]
    fn test_facts_become_prefixed_entries() {
        let hw = canonicalize(&descriptor(json!({
            "mac": "AA:BB:CC:DD:EE:01",
            "facts": {"Serial_Number": "S9"},
        })));
        assert_eq!(hw, vec!["fact_serial_number=s9", "mac=aa-bb-cc-dd-ee-01"]);
    }

    #[test]
    fn test_unknown_keys_and_empty_values_dropped() {
        let hw = canonicalize(&descriptor(json!({
            "uuid": "U-1",
            "vendor": "acme",
            "serial": "  ",
        })));
        assert_eq!(hw, vec!["uuid=u-1"]);
    }

    #[test]
    fn test_duplicate_entries_collapse() {
        let hw = canonicalize(&descriptor(json!({
            "mac": ["AA:00:11:22:33:44", "aa-00-11-22-33-44"],
        })));
        assert_eq!(hw, vec!["mac=aa-00-11-22-33-44"]);
    }

    #[test]
    fn test_canonical_form_idempotent() {
        let first = canonicalize(&descriptor(json!({
            "net0": "AA:BB:CC:DD:EE:05",
            "uuid": "U-7",
            "facts": {"rack": "R12"},
        })));
        let again = canonical_entries(entry_pairs(&first));
        assert_eq!(first, again);
    }

    #[test]
    fn test_order_independence_over_permutations() {
        let pairs = vec![
            ("uuid".to_string(), "U-1".to_string()),
            ("net0".to_string(), "AA:01".to_string()),
            ("serial".to_string(), "S1".to_string()),
        ];
        let baseline = canonical_entries(pairs.clone());
        // All 6 orderings of three entries.
        for i in 0..3 {
            for j in 0..3 {
                if i == j {
                    continue;
                }
                let k = 3 - i - j;
                let permuted = vec![pairs[i].clone(), pairs[j].clone(), pairs[k].clone()];
                assert_eq!(canonical_entries(permuted), baseline);
            }
        }
    }

    #[test]
    fn test_descriptor_from_facts_maps_wellknown_keys() {
        let facts: JsonMap = serde_json::from_value(json!({
            "macaddress": "AA:BB:CC:DD:EE:01",
            "uuid": "u-1",
            "serial_number": "S9",
        }))
        .unwrap();
        let cfg = matching(&["serial_number"]);
        let desc = descriptor_from_facts(&facts, &cfg);
        let hw = canonicalize(&desc);
        assert_eq!(
            hw,
            vec!["fact_serial_number=s9", "mac=aa-bb-cc-dd-ee-01", "uuid=u-1"]
        );
        assert_eq!(desc.dhcp_mac.as_deref(), Some("aa-bb-cc-dd-ee-01"));
    }

    #[test]
    fn test_refresh_fact_entries_replaces_only_facts() {
        let stored = vec![
            "fact_old=1".to_string(),
            "mac=aa-bb".to_string(),
            "uuid=u-1".to_string(),
        ];
        let facts: JsonMap =
            serde_json::from_value(json!({"rack": "R1", "kernel": "6.1"})).unwrap();
        let cfg = matching(&["^rack$"]);
        let refreshed = refresh_fact_entries(&stored, &facts, &cfg);
        assert_eq!(refreshed, vec!["fact_rack=r1", "mac=aa-bb", "uuid=u-1"]);
    }

    #[test]
    fn test_hw_match_selects_configured_and_fact_keys() {
        let cfg = matching(&[]);
        let hw = vec![
            "asset=a-1".to_string(),
            "fact_rack=r1".to_string(),
            "mac=aa-bb".to_string(),
        ];
        // asset is a legal key but not configured for matching here
        assert_eq!(hw_match(&hw, &cfg), vec!["fact_rack=r1", "mac=aa-bb"]);
        assert_eq!(unique_match_entries(&hw, &cfg), vec!["mac=aa-bb"]);
    }

    #[test]
    fn test_numeric_fact_values_stringified() {
        let hw = canonicalize(&descriptor(json!({
            "facts": {"slot": 7, "virtual": false},
        })));
        assert_eq!(hw, vec!["fact_slot=7", "fact_virtual=false"]);
    }
}
