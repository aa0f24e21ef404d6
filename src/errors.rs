//! Error taxonomy for the orchestrator
//!
//! Every failure a caller can observe is one of these variants. Transient
//! classes (timeouts, server errors, quota hits with a spare credential) are
//! retried internally and only surface as `Exhausted` once the retry budget
//! is gone.

/// Errors surfaced by generation requests and administrative operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GenerationError {
    #[error("request timed out after {0}ms")]
    Timeout(u64),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("access denied: {0}")]
    AuthDenied(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("upstream server error: {0}")]
    ServerError(String),

    #[error("generation failed after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl GenerationError {
    /// Terminal rejection used when the retry budget (or a hard daily cap)
    /// has been consumed.
    pub fn exhausted(attempts: u32, last_error: impl Into<String>) -> Self {
        Self::Exhausted {
            attempts,
            last_error: last_error.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}
