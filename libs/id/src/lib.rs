//! # mandrel-id
//!
//! Typed identifiers for mandrel resources.
//!
//! Every id is a resource prefix plus a ULID, e.g.
//! `node_01HV4Z2WQXKJNM8GPQY6VBKC3D` or `pol_01HV4Z3MXNKPQR9HSTZ7WCLD4E`.
//! The prefix makes an id self-describing in logs and URLs and lets the
//! type system refuse a policy id where a node id belongs; the ULID part
//! keeps ids unique, opaque to operators, and sortable by creation time.
//! Node *names* are a separate, human-facing concern assigned by the
//! store.
//!
//! All types round-trip: `parse(to_string(id)) == id`, and serde uses the
//! same canonical string form.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
