//! Error classification for capability calls.
//!
//! Collaborators (the LLM and vector-store capability implementations)
//! classify every failure as either transient or fatal. The worker pool's
//! retry policy depends entirely on this classification: transient failures
//! are retried up to the configured attempt limit, fatal failures fail the
//! item immediately without consuming further attempts.

use thiserror::Error;

/// A failed capability call, classified by the collaborator.
#[derive(Debug, Clone, Error)]
pub enum CallError {
    /// Transient failure (network, timeout, rate limit). Safe to retry.
    #[error("transient call failure: {0}")]
    Transient(String),

    /// Fatal failure (malformed input, unrecoverable response). Not retried.
    #[error("fatal call failure: {0}")]
    Fatal(String),
}

impl CallError {
    /// Creates a transient (retryable) call error.
    pub fn transient(message: impl Into<String>) -> Self {
        CallError::Transient(message.into())
    }

    /// Creates a fatal (non-retryable) call error.
    pub fn fatal(message: impl Into<String>) -> Self {
        CallError::Fatal(message.into())
    }

    /// Returns whether the pool may retry the call.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CallError::Transient(_))
    }
}
