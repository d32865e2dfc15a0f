//! Error types for the metric store.

use pulse_types::ValidationError;

/// Errors that can occur during metric store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The draft failed payload schema validation.
    #[error("invalid metric: {0}")]
    Validation(#[from] ValidationError),

    /// A database operation failed.
    #[error("store database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// No pooled connection could be obtained.
    #[error("store connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// JSON serialization or deserialization failed.
    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored row could not be decoded into a record.
    #[error("corrupt metric record {id}: {reason}")]
    Corrupt { id: i64, reason: String },

    /// The store is not accepting requests.
    #[error("metric store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Returns `true` if the caller sent bad input, as opposed to the store failing.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}
