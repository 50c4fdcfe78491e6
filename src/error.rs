//! Error types for lightning-runtime

use thiserror::Error;

/// Errors that can occur in the runtime
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Invalid or unknown configuration value. Fatal at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Document, topic, or dead-letter record missing
    #[error("Not found: {0}")]
    NotFound(String),

    /// Optimistic concurrency violation (etag mismatch)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Provider call rejected by an open circuit breaker
    #[error("Circuit breaker is open: {0}")]
    CircuitOpen(String),

    /// Event handler failed; consumed by the bus retry/DLQ path
    #[error("Handler error: {0}")]
    Handler(String),

    /// One or more plan validators failed with error severity
    #[error("Plan validation failed:\n{0}")]
    PlanValidation(crate::plan::ValidationReport),

    /// External planner failed to produce a valid plan
    #[error("Planner error: {0}")]
    Planner(String),

    /// Provider-specific backend failure
    #[error("Provider error: {0}")]
    Provider(String),

    /// Storage backend failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Operation exceeded its deadline
    #[error("Operation timed out: {0}")]
    Timeout(String),
}

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;
