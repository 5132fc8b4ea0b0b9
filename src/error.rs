//! Error taxonomy shared by every pipeline stage.

use thiserror::Error;

use crate::session::SessionStatus;

/// Failures surfaced by the chunk/embed/store/retrieve/generate pipeline.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RagError {
    /// Malformed caller input, rejected before any external call.
    #[error("{0}")]
    Validation(String),

    /// Referenced session, tender, or document does not exist.
    #[error("{0}")]
    NotFound(String),

    /// Session exists but has not reached READY.
    #[error("Session not ready (status {status})")]
    NotReady {
        /// Status observed when the request arrived.
        status: SessionStatus,
    },

    /// Embedding request failed upstream.
    #[error("embedding provider error{}: {message}", fmt_status(.status))]
    EmbeddingProvider {
        /// Upstream HTTP status, when one was received.
        status: Option<u16>,
        /// Upstream or transport message.
        message: String,
    },

    /// Embedding vector length differs from the configured dimension.
    #[error("expected {expected} embedding dimensions, got {actual}")]
    EmbeddingDimension {
        /// Configured dimension.
        expected: usize,
        /// Length actually returned.
        actual: usize,
    },

    /// Generation request failed upstream.
    #[error("LLM provider error{}: {message}", fmt_status(.status))]
    LlmProvider {
        /// Upstream HTTP status, when one was received.
        status: Option<u16>,
        /// Upstream or transport message.
        message: String,
    },

    /// Structured LLM output did not match the expected schema.
    #[error("LLM returned malformed {kind} response: {message}")]
    LlmResponseFormat {
        /// Analysis type whose schema was violated.
        kind: &'static str,
        /// Parser diagnostic.
        message: String,
    },

    /// Document produced no usable text or chunks.
    #[error("{0}")]
    Ingestion(String),

    /// Attempted to move a session out of a terminal state.
    #[error("session status cannot move from {from} to {to}")]
    InvalidTransition {
        /// Current status.
        from: SessionStatus,
        /// Requested status.
        to: SessionStatus,
    },

    /// Persistence or search failure.
    #[error("store error: {0}")]
    Store(String),
}

/// Convenience alias used across the crate.
pub type RagResult<T> = Result<T, RagError>;

impl RagError {
    /// Builds a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Builds a not-found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Stable machine-readable category, used for API error bodies.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::NotFound(_) => "not_found",
            Self::NotReady { .. } => "session_not_ready",
            Self::EmbeddingProvider { .. } => "embedding_provider_error",
            Self::EmbeddingDimension { .. } => "embedding_dimension_error",
            Self::LlmProvider { .. } => "llm_provider_error",
            Self::LlmResponseFormat { .. } => "llm_response_format_error",
            Self::Ingestion(_) => "ingestion_error",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Store(_) => "store_error",
        }
    }
}

impl From<tokio_postgres::Error> for RagError {
    fn from(err: tokio_postgres::Error) -> Self {
        Self::Store(err.to_string())
    }
}

fn fmt_status(status: &Option<u16>) -> String {
    status.map(|code| format!(" ({code})")).unwrap_or_default()
}
