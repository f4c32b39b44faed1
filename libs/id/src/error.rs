//! ID parsing failures.

use thiserror::Error;

/// Why an id string failed to parse.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The input was empty.
    #[error("empty id")]
    Empty,

    /// The prefix named a different resource type.
    #[error("expected a '{expected}' id, got prefix '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    /// No `_` between prefix and ULID.
    #[error("id is missing the '_' between prefix and ULID")]
    MissingSeparator,

    /// The part after the prefix is not a ULID.
    #[error("bad ULID portion: {0}")]
    InvalidUlid(String),
}

impl IdError {
    /// True when the id belonged to a different resource type.
    pub fn is_prefix_error(&self) -> bool {
        matches!(self, IdError::InvalidPrefix { .. })
    }
}
