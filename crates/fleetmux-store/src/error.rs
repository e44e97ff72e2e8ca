//! Store error types.
//!
//! The error set is deliberately small: callers dispatch on the category, so
//! every variant is a stable part of the store contract. Transient errors are
//! the only retryable kind.

/// Errors that can occur during catalog store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No document matched the key or query.
    #[error("document not found in '{collection}'")]
    NotFound { collection: String },

    /// An insert collided with an existing key.
    #[error("document already exists in '{collection}': {key}")]
    AlreadyExists { collection: String, key: String },

    /// The backend failed in a way that a retry may fix (lost connection,
    /// serialization conflict, pool exhaustion). The pooled session that
    /// produced it is discarded, so the next call dials fresh.
    #[error("transient store error: {reason}")]
    Transient { reason: String },

    /// A document could not be serialized or deserialized.
    #[error("bad document in '{collection}': {reason}")]
    BadDocument { collection: String, reason: String },

    /// A query or update referenced an invalid field path or predicate.
    #[error("bad query: {reason}")]
    BadQuery { reason: String },
}

impl StoreError {
    /// Shorthand for [`StoreError::NotFound`].
    #[must_use]
    pub fn not_found(collection: &str) -> Self {
        Self::NotFound {
            collection: collection.to_owned(),
        }
    }

    /// Shorthand for [`StoreError::AlreadyExists`].
    #[must_use]
    pub fn already_exists(collection: &str, key: &str) -> Self {
        Self::AlreadyExists {
            collection: collection.to_owned(),
            key: key.to_owned(),
        }
    }

    /// True if the operation may succeed on retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}
