//! Domain enums shared across the control plane.
//!
//! Each signal kind has a stable string form used in the queue table and
//! in log entries; the constants module is the single source of those
//! strings.

use serde::{Deserialize, Serialize};

// =============================================================================
// Signal Kind Constants
// =============================================================================

/// All signal kind names as constants.
pub mod signal_kinds {
    /// Re-evaluate tag expressions against a node (metadata changed).
    pub const EVAL_TAGS: &str = "node.eval_tags";

    /// Drive a node's power toward the named desired state.
    pub const POWER: &str = "node.power";
}

// =============================================================================
// Power
// =============================================================================

/// Observed or desired power state of a node.
///
/// `Unknown` is a real state, not an error: it is recorded whenever the
/// management channel could not be consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    On,
    Off,
    #[default]
    Unknown,
}

impl PowerState {
    /// Returns true if the state was actually observed.
    pub fn is_known(&self) -> bool {
        !matches!(self, PowerState::Unknown)
    }
}

impl std::fmt::Display for PowerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowerState::On => write!(f, "on"),
            PowerState::Off => write!(f, "off"),
            PowerState::Unknown => write!(f, "unknown"),
        }
    }
}

impl std::str::FromStr for PowerState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "on" => Ok(PowerState::On),
            "off" => Ok(PowerState::Off),
            "unknown" => Ok(PowerState::Unknown),
            other => Err(format!("unknown power state '{other}'")),
        }
    }
}

// =============================================================================
// Checkin
// =============================================================================

/// Directive returned to the agent at the end of a checkin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckinAction {
    /// Reboot into the bound policy's installer.
    Reboot,
    /// Keep doing what you are doing.
    None,
}

impl std::fmt::Display for CheckinAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckinAction::Reboot => write!(f, "reboot"),
            CheckinAction::None => write!(f, "none"),
        }
    }
}

// =============================================================================
// Signals
// =============================================================================

/// The kind of a background signal, with its payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignalKind {
    /// Re-run tag evaluation and policy binding for the node.
    EvalTags,
    /// Toggle the node toward the given power state.
    Power { desired: PowerState },
}

impl SignalKind {
    /// Stable string name for the queue table.
    pub fn name(&self) -> &'static str {
        match self {
            SignalKind::EvalTags => signal_kinds::EVAL_TAGS,
            SignalKind::Power { .. } => signal_kinds::POWER,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_state_roundtrip() {
        for state in [PowerState::On, PowerState::Off, PowerState::Unknown] {
            let parsed: PowerState = state.to_string().parse().unwrap();
            assert_eq!(state, parsed);
        }
    }

    #[test]
    fn test_signal_kind_names() {
        assert_eq!(SignalKind::EvalTags.name(), signal_kinds::EVAL_TAGS);
        assert_eq!(
            SignalKind::Power {
                desired: PowerState::On
            }
            .name(),
            signal_kinds::POWER
        );
    }

    #[test]
    fn test_signal_kind_serde_tags_payload() {
        let kind = SignalKind::Power {
            desired: PowerState::Off,
        };
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["kind"], "power");
        assert_eq!(json["desired"], "off");
    }
}
