//! Typed ID definitions for control-plane resources.
//!
//! Each ID type has a unique prefix that identifies the resource type.
//! IDs are ULID-based for sortability and uniqueness.

use crate::define_id;

// =============================================================================
// Inventory
// =============================================================================

define_id!(NodeId, "node");

// =============================================================================
// Provisioning
// =============================================================================

define_id!(PolicyId, "pol");
define_id!(TagId, "tag");

// =============================================================================
// Requests
// =============================================================================

define_id!(RequestId, "req");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let id = NodeId::new();
        let parsed = NodeId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_rejects_wrong_prefix() {
        let id = PolicyId::new();
        let err = NodeId::parse(&id.to_string()).unwrap_err();
        assert!(err.is_prefix_error());
    }

    #[test]
    fn test_rejects_missing_separator() {
        assert_eq!(
            NodeId::parse("node01HV4Z2WQX").unwrap_err(),
            crate::IdError::MissingSeparator
        );
    }

    #[test]
    fn test_serde_roundtrip() {
        let id = TagId::new();
        let json = serde_json::to_string(&id).unwrap();
        let back: TagId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }
}
