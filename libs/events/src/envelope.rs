//! Signal envelope - the common wrapper for queued node signals.

use chrono::{DateTime, Utc};
use mandrel_id::{NodeId, RequestId};
use serde::{Deserialize, Serialize};

use crate::SignalKind;

/// A signal addressed to a node, as published to the background queue.
///
/// The recipient is named by node id and signal kind, never by a method
/// name; the worker decides how a kind is delivered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSignal {
    /// The node the signal is about.
    pub node_id: NodeId,

    /// What should happen.
    pub kind: SignalKind,

    /// The request that caused the signal, for tracing.
    pub request_id: RequestId,

    /// When the signal was published.
    pub published_at: DateTime<Utc>,
}

impl NodeSignal {
    /// Create a signal stamped with the current time.
    pub fn new(node_id: NodeId, kind: SignalKind, request_id: RequestId) -> Self {
        Self {
            node_id,
            kind,
            request_id,
            published_at: Utc::now(),
        }
    }
}
