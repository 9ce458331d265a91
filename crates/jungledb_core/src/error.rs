//! Error types for the JungleDB engine.

use jungledb_codec::Value;
use thiserror::Error;

/// Result type for engine operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in JungleDB engine operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Codec failure while encoding or decoding a record.
    #[error("codec error: {0}")]
    Codec(#[from] jungledb_codec::CodecError),

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },

    /// A put would map one secondary key to two primary keys in a
    /// unique index.
    #[error("uniqueness violation on index '{index}': secondary key {secondary:?} already maps to '{existing}'")]
    UniquenessViolation {
        /// Name of the violated index.
        index: String,
        /// The secondary key that collided.
        secondary: Value,
        /// The primary key already holding the secondary key.
        existing: String,
    },

    /// A query referenced an index that does not exist.
    #[error("unknown index: {name}")]
    UnknownIndex {
        /// The index name that failed to resolve.
        name: String,
    },

    /// Wrapped failure from a persistent backend adapter.
    #[error("backend error: {message}")]
    Backend {
        /// Description of the backend failure.
        message: String,
        /// Whether the failed batch may be retried.
        retryable: bool,
    },

    /// Structural operation attempted in the wrong lifecycle phase, or
    /// declared structure missing without a version bump.
    #[error("schema error: {message}")]
    Schema {
        /// Description of the schema problem.
        message: String,
    },
}

impl CoreError {
    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates a uniqueness violation error.
    pub fn uniqueness_violation(
        index: impl Into<String>,
        secondary: Value,
        existing: impl Into<String>,
    ) -> Self {
        Self::UniquenessViolation {
            index: index.into(),
            secondary,
            existing: existing.into(),
        }
    }

    /// Creates an unknown index error.
    pub fn unknown_index(name: impl Into<String>) -> Self {
        Self::UnknownIndex { name: name.into() }
    }

    /// Creates a backend error.
    pub fn backend(message: impl Into<String>, retryable: bool) -> Self {
        Self::Backend {
            message: message.into(),
            retryable,
        }
    }

    /// Creates a schema error.
    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
        }
    }
}
