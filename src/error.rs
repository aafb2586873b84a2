//! Error types for the generation core
//!
//! Configuration and capability errors are fatal and surface through
//! [`Error`]. Transient generation failures never leave the orchestrator;
//! they are described by [`GenerationError`] and retried.

use thiserror::Error;

/// Result alias for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Fatal errors raised by the weight model, similarity engine and orchestrator
#[derive(Debug, Error)]
pub enum Error {
    /// Evolution strategy name not recognised
    #[error("unknown evolution strategy: {0}")]
    UnknownStrategy(String),

    /// More distinct intents requested than can be drawn
    #[error("cannot sample {requested} distinct intents from {available} available")]
    MixTooLarge { requested: usize, available: usize },

    /// Caller referenced an intent that is not active
    #[error("intent {0} is not an active intent")]
    UnknownIntent(u32),

    /// Any other invalid setting
    #[error("invalid configuration: {0}")]
    Config(String),

    /// No embedding capability was configured
    #[error("embedding capability unavailable")]
    EmbeddingUnavailable,

    /// Vector dimension disagrees with the pool it is compared against
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// The embedding capability itself failed
    #[error("embedding failed: {0}")]
    Embedding(#[source] anyhow::Error),
}

/// Failure reported by a generation capability
#[derive(Debug, Error)]
pub enum GenerationError {
    /// The capability as a whole could not produce output (e.g. every provider failed)
    #[error("generation capability failed: {0}")]
    Runtime(String),

    /// Provider signalled rate limiting
    #[error("rate limited by {provider}")]
    RateLimited { provider: String },

    /// Request-level failure: transport, HTTP status, unexpected body
    #[error("request failed: {0}")]
    Request(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let e = Error::MixTooLarge { requested: 30, available: 26 };
        assert_eq!(e.to_string(), "cannot sample 30 distinct intents from 26 available");

        let e = GenerationError::RateLimited { provider: "groq".into() };
        assert!(e.to_string().contains("groq"));
    }
}
