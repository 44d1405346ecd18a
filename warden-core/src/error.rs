//! Error types for warden operations

use thiserror::Error;

/// Errors surfaced by the storage substrate.
///
/// The engine never retries or translates these; the caller decides
/// retry and fallback policy.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubstrateError {
    #[error("substrate unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("substrate request timed out: {reason}")]
    Timeout { reason: String },

    #[error("script evaluation failed: {reason}")]
    Script { reason: String },

    #[error("key {key} holds the wrong value kind for this operation")]
    WrongType { key: String },
}

/// Top-level error for cache facade operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WardenError {
    #[error(transparent)]
    Substrate(#[from] SubstrateError),

    #[error("payload serialization failed: {reason}")]
    Serialize { reason: String },

    #[error("payload deserialization failed for {key}: {reason}")]
    Deserialize { key: String, reason: String },

    #[error(
        "collection {collection} already declares context filter {existing:?}, refusing {requested:?}"
    )]
    FilterConflict {
        collection: String,
        existing: String,
        requested: String,
    },
}

/// Result type alias for substrate operations.
pub type SubstrateResult<T> = Result<T, SubstrateError>;

/// Result type alias for facade operations.
pub type WardenResult<T> = Result<T, WardenError>;
