//! Error types for the statehub core

/// Errors raised by event handlers while processing a delivery.
///
/// These never escape [`EventBus::emit`](crate::EventBus::emit); the bus logs
/// them and moves on to the next handler.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    /// Handler execution failed
    #[error("Handler execution failed: {0}")]
    HandlerExecution(String),

    /// Payload could not be decoded into the handler's event type
    #[error("Event deserialization failed: {0}")]
    Deserialization(String),

    /// Event could not be encoded for delivery
    #[error("Event serialization failed: {0}")]
    Serialization(String),
}

/// Errors raised by a middleware step. Middleware is fail-open, so these are
/// logged and the step is treated as the identity transform.
#[derive(Debug, thiserror::Error)]
pub enum MiddlewareError {
    /// The middleware rejected or could not process its input
    #[error("Middleware '{id}' failed: {reason}")]
    Failed { id: String, reason: String },
}

/// Errors from a session storage port.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Storage backend cannot be reached
    #[error("Session storage unavailable: {0}")]
    Unavailable(String),

    /// Storage backend refused the write
    #[error("Session storage quota exceeded for key '{key}'")]
    QuotaExceeded { key: String },
}

/// Errors surfaced by slice and synchroniser operations.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// State or patch could not be (de)serialised
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A patch was not a JSON object, or the state is not object-shaped
    #[error("Invalid patch: {0}")]
    InvalidPatch(String),

    /// Storage failure that was not swallowed
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Broadcasting the change failed
    #[error("Event error: {0}")]
    Event(#[from] EventError),

    /// `resolve_conflict` was called with an id that is not pending
    #[error("Unknown conflict: {0}")]
    UnknownConflict(String),

    /// Entity lookup failed during normalisation
    #[error("Entity '{0}' not found")]
    EntityNotFound(String),

    /// An item handed to the normaliser has no usable id
    #[error("Missing id field '{0}'")]
    MissingId(String),
}

/// Errors from [`StateCompressor::decompress`](crate::perf::StateCompressor::decompress).
#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    /// Payload was produced by a different algorithm than the decompressor's
    #[error("Algorithm mismatch: payload is {payload}, decompressor is {expected}")]
    AlgorithmMismatch { payload: String, expected: String },

    /// Payload bytes or structure are corrupt
    #[error("Malformed payload: {0}")]
    Malformed(String),

    /// Diff payload decompressed without the value it was diffed against
    #[error("Diff payload requires the previous value")]
    MissingBase,

    /// Diff payload decompressed against a different previous value
    #[error("Diff base checksum mismatch: expected {expected}, got {actual}")]
    BaseMismatch { expected: String, actual: String },

    /// Underlying JSON (de)serialisation failure
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors from a lazy page source.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LoadError {
    /// The page source reported a failure
    #[error("Page {page} failed to load: {reason}")]
    Fetch { page: usize, reason: String },
}

/// Errors from writing a debug export.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("Failed to write debug export: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize debug export: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for CompressionError {
    fn from(err: serde_json::Error) -> Self {
        CompressionError::Serialization(err.to_string())
    }
}
