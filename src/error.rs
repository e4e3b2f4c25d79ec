//! Error taxonomy for the research engine.
//!
//! Callers match on [`ResearchError`]; backend failures that have no
//! caller-visible meaning are carried as [`ResearchError::Storage`].

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResearchError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("task {task_id} is not completed (stage: {stage})")]
    NotReady { task_id: String, stage: String },

    #[error("provider '{provider}' failed transiently: {message}")]
    TransientProvider { provider: String, message: String },

    #[error("no provider available for {0}")]
    AllProvidersUnavailable(String),

    #[error("subagent {agent_id} failed: {message}")]
    SubagentFailure { agent_id: String, message: String },

    #[error("quorum not met: {succeeded} of {dispatched} subagents succeeded, {required} required; {detail}")]
    QuorumNotMet {
        succeeded: usize,
        dispatched: usize,
        required: usize,
        detail: String,
    },

    #[error("context retrieval unavailable: {0}")]
    RetrievalUnavailable(String),

    #[error("cancellation requested")]
    CancellationRequested,

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

pub type Result<T, E = ResearchError> = std::result::Result<T, E>;

/// Failure reported by a single provider adapter.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// Retrying may succeed (network error, 429, 5xx).
    #[error("transient: {0}")]
    Transient(String),

    #[error("permanent: {0}")]
    Permanent(String),

    /// The adapter does not offer this operation.
    #[error("operation not supported")]
    Unsupported,

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Transient(_) | ProviderError::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(ProviderError::Transient("503".into()).is_retryable());
        assert!(ProviderError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!ProviderError::Permanent("401".into()).is_retryable());
        assert!(!ProviderError::Unsupported.is_retryable());
    }

    #[test]
    fn storage_wraps_anyhow() {
        let err: ResearchError = anyhow::anyhow!("disk full").into();
        assert!(matches!(err, ResearchError::Storage(_)));
        assert_eq!(err.to_string(), "disk full");
    }
}
