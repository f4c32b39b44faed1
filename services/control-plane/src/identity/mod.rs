//! Identity resolution and node lifecycle services.
//!
//! - [`resolver`] maps an incoming descriptor to exactly one node,
//!   creating, merging, or rejecting as needed.
//! - [`checkin`] applies fact updates and drives policy binding.
//! - [`binder`] evaluates tags and applies a matched policy.
//! - [`lifecycle`] covers the administrative mutations: stage completion,
//!   metadata edits, desired power state.

pub mod binder;
pub mod checkin;
pub mod lifecycle;
pub mod resolver;

pub use binder::PolicyBinder;
pub use checkin::{CheckinProcessor, CheckinResponse};
pub use lifecycle::{MetadataPatch, NodeLifecycle};
pub use resolver::{IdentityResolver, LookupRequest};
