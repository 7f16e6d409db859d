use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by LLM provider adapters.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Context length exceeded: {0}")]
    ContextLengthExceeded(String),

    #[error("Rate limit exceeded: {details}")]
    RateLimitExceeded {
        details: String,
        retry_delay: Option<Duration>,
    },

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
}

impl ProviderError {
    /// Transient errors are eligible for backoff-and-retry; authentication
    /// failures and context overflows are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimitExceeded { .. }
                | Self::ServerError(_)
                | Self::NetworkError(_)
                | Self::Timeout(_)
        )
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::RateLimitExceeded { .. })
    }
}

fn is_network_error(err: &reqwest::Error) -> bool {
    err.is_connect() || err.is_timeout() || (err.status().is_none() && err.is_request())
}

impl From<reqwest::Error> for ProviderError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            return ProviderError::Timeout(Duration::from_secs(0));
        }
        if is_network_error(&error) {
            return ProviderError::NetworkError(error.to_string());
        }
        let mut details = vec![];
        if let Some(status) = error.status() {
            details.push(format!("status: {}", status));
        }
        let msg = if details.is_empty() {
            error.to_string()
        } else {
            format!("{} ({})", error, details.join(", "))
        };
        ProviderError::RequestFailed(msg)
    }
}

/// Closed error taxonomy for the consensus runtime.
#[derive(Error, Debug)]
pub enum MagiError {
    #[error("Input rejected: forbidden patterns {rules:?}")]
    InputRejected { rules: Vec<String> },

    #[error("Input too long: {length} chars exceeds limit of {max_length}")]
    InputTooLong { length: usize, max_length: usize },

    #[error("Guardrails blocked input ({provider}): {reason}")]
    GuardrailsBlocked { provider: String, reason: String },

    #[error("Guardrails provider {provider} timed out after {timeout_secs}s")]
    GuardrailsTimeout { provider: String, timeout_secs: u64 },

    #[error("Schema validation retries exceeded for {persona}: {errors:?}")]
    SchemaRetryExceeded {
        persona: String,
        errors: Vec<String>,
    },

    #[error("Quorum loss: {excluded:?} (alive {alive} < quorum {quorum})")]
    QuorumLost {
        alive: usize,
        quorum: usize,
        excluded: Vec<String>,
    },

    #[error("Concurrency permit not acquired within {0:?}")]
    ConcurrencyLimit(Duration),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Streaming emit timed out after {0:?}")]
    StreamingTimeout(Duration),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, MagiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ProviderError::NetworkError("reset".into()).is_transient());
        assert!(ProviderError::RateLimitExceeded {
            details: "429".into(),
            retry_delay: None
        }
        .is_transient());
        assert!(!ProviderError::Authentication("bad key".into()).is_transient());
        assert!(!ProviderError::ContextLengthExceeded("too long".into()).is_transient());
    }

    #[test]
    fn test_rate_limit_detection() {
        let err = ProviderError::RateLimitExceeded {
            details: "slow down".into(),
            retry_delay: Some(Duration::from_secs(5)),
        };
        assert!(err.is_rate_limit());
        assert!(!ProviderError::ServerError("500".into()).is_rate_limit());
    }
}
