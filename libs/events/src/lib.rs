//! # mandrel-events
//!
//! Shared domain enums and the background-signal vocabulary used between
//! the control plane's request handlers and its queue workers.
//!
//! Signals are the only cross-component messages in the system: a request
//! handler publishes a [`NodeSignal`] inside its store transaction, and a
//! background worker delivers it after commit. Delivery is at-least-once
//! and unordered; receivers must tolerate replays.

mod envelope;
mod types;

pub use envelope::NodeSignal;
pub use types::{signal_kinds, CheckinAction, PowerState, SignalKind};
