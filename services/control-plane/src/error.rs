//! Core error types.
//!
//! Validation and argument errors surface to the caller verbatim; store
//! unique-constraint violations during lookup are retried once before
//! surfacing. Messages never include credentials.

use mandrel_id::NodeId;
use thiserror::Error;

use crate::db::DbError;
use crate::power::ManagementError;
use crate::tags::RuleEvaluationError;

/// Errors produced by the identity, lifecycle, and power services.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The caller supplied neither facts nor hw_info, or nothing eligible
    /// for matching.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Node attributes violate an entity invariant.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A descriptor matched more than one reconcilable node.
    #[error("hw_info [{}] matches {} nodes", hw_info.join(", "), nodes.len())]
    DuplicateNode {
        hw_info: Vec<String>,
        /// `(id, name)` of every matched node.
        nodes: Vec<(NodeId, String)>,
    },

    /// A tag expression failed to evaluate.
    #[error(transparent)]
    RuleEvaluation(#[from] RuleEvaluationError),

    /// The management channel reported or suffered a failure.
    #[error(transparent)]
    Management(#[from] ManagementError),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error("node not found: {0}")]
    NotFound(NodeId),
}

impl From<sqlx::Error> for CoreError {
    fn from(e: sqlx::Error) -> Self {
        CoreError::Db(DbError::Query(e))
    }
}

impl CoreError {
    /// True if the underlying failure was a store unique-key violation,
    /// the signal to retry a racing lookup.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            CoreError::Db(DbError::Query(e)) => crate::db::is_unique_violation(e),
            _ => false,
        }
    }
}
