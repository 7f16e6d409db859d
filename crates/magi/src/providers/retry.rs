//! Jittered retry wrapper around a provider adapter.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use super::base::{ChatRequest, ChatResponse, Provider};
use crate::concurrency::ConcurrencyController;
use crate::config::ResolvedLlmConfig;
use crate::error::ProviderError;

/// Backoff parameters: full jitter over an exponential curve,
/// `wait = rand(0, min(cap, base * 2^attempt))`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub rate_limit_cap: Duration,
    pub rate_limit_max_retries: u32,
    pub default_cap: Duration,
    pub default_max_retries: u32,
    pub min_rate_limit_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            rate_limit_cap: Duration::from_secs(60),
            rate_limit_max_retries: 6,
            default_cap: Duration::from_secs(10),
            default_max_retries: 3,
            min_rate_limit_delay: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    fn max_retries_for(&self, error: &ProviderError) -> u32 {
        if error.is_rate_limit() {
            self.rate_limit_max_retries
        } else {
            self.default_max_retries
        }
    }

    fn backoff_for(&self, error: &ProviderError, attempt: u32) -> Duration {
        let cap = if error.is_rate_limit() {
            self.rate_limit_cap
        } else {
            self.default_cap
        };
        let exponential = self.base_delay.saturating_mul(2u32.saturating_pow(attempt));
        let ceiling = cap.min(exponential);
        let wait = Duration::from_secs_f64(
            rand::thread_rng().gen_range(0.0..=ceiling.as_secs_f64().max(f64::EPSILON)),
        );
        if error.is_rate_limit() {
            wait.max(self.min_rate_limit_delay)
        } else {
            wait
        }
    }
}

/// The chat completion client handed to agents: one resolved provider plus
/// the retry policy and the shared concurrency controller for rate-limit
/// accounting.
pub struct LLMClient {
    provider: Arc<dyn Provider>,
    policy: RetryPolicy,
    max_tokens: u32,
    temperature: f64,
    controller: Arc<ConcurrencyController>,
}

impl LLMClient {
    pub fn new(
        provider: Arc<dyn Provider>,
        resolved: &ResolvedLlmConfig,
        max_tokens: u32,
        controller: Arc<ConcurrencyController>,
    ) -> Self {
        // The resolved retry_count governs transient-error attempts; the
        // upper bound lives in Config::validate, not here. Rate limits keep
        // their own fixed attempt budget.
        let policy = RetryPolicy {
            default_max_retries: resolved.retry_count.max(1),
            ..Default::default()
        };
        Self {
            provider,
            policy,
            max_tokens,
            temperature: resolved.temperature,
            controller,
        }
    }

    #[cfg(test)]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn model(&self) -> &str {
        self.provider.model()
    }

    /// Build a request with this client's resolved sampling settings.
    pub fn request(&self, system_prompt: String, user_prompt: String) -> ChatRequest {
        ChatRequest {
            system_prompt,
            user_prompt,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        }
    }

    /// Send with full-jitter retry. Authentication failures are returned
    /// immediately; rate limits are recorded on the shared controller and
    /// honor a server-provided retry delay when present.
    pub async fn send(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let mut attempt: u32 = 0;
        loop {
            match self.provider.complete(request).await {
                Ok(response) => return Ok(response),
                Err(error) => {
                    if let ProviderError::Authentication(_) = error {
                        return Err(error);
                    }
                    if error.is_rate_limit() {
                        self.controller.note_rate_limit();
                    }
                    if !error.is_transient() {
                        return Err(error);
                    }

                    let max_retries = self.policy.max_retries_for(&error);
                    if attempt + 1 >= max_retries {
                        warn!(
                            provider = self.provider.name(),
                            attempts = attempt + 1,
                            error = %error,
                            "llm.retries_exhausted"
                        );
                        return Err(error);
                    }

                    let wait = match &error {
                        ProviderError::RateLimitExceeded {
                            retry_delay: Some(delay),
                            ..
                        } => (*delay).min(self.policy.rate_limit_cap),
                        _ => self.policy.backoff_for(&error, attempt),
                    };
                    debug!(
                        provider = self.provider.name(),
                        attempt = attempt + 1,
                        backoff_ms = wait.as_millis() as u64,
                        error = %error,
                        "llm.retrying"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyProvider {
        calls: AtomicU32,
        fail_first: u32,
        error: ProviderError,
    }

    #[async_trait]
    impl Provider for FlakyProvider {
        fn name(&self) -> &str {
            "flaky"
        }

        fn model(&self) -> &str {
            "flaky-model"
        }

        async fn complete(
            &self,
            _request: &ChatRequest,
        ) -> Result<ChatResponse, ProviderError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(self.error.clone())
            } else {
                Ok(ChatResponse {
                    content: "ok".to_string(),
                    usage: super::super::base::Usage::default(),
                    model: "flaky-model".to_string(),
                })
            }
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(1),
            rate_limit_cap: Duration::from_millis(5),
            default_cap: Duration::from_millis(5),
            min_rate_limit_delay: Duration::from_millis(1),
            ..Default::default()
        }
    }

    fn client(provider: Arc<FlakyProvider>) -> LLMClient {
        let resolved = ResolvedLlmConfig {
            provider: "test".into(),
            model: "flaky-model".into(),
            api_key: "key".into(),
            timeout: Duration::from_secs(1),
            retry_count: 3,
            temperature: 0.7,
        };
        LLMClient::new(
            provider,
            &resolved,
            1024,
            Arc::new(ConcurrencyController::default()),
        )
        .with_policy(fast_policy())
    }

    #[tokio::test]
    async fn test_transient_error_retried_to_success() {
        let provider = Arc::new(FlakyProvider {
            calls: AtomicU32::new(0),
            fail_first: 2,
            error: ProviderError::ServerError("503".into()),
        });
        let client = client(Arc::clone(&provider));
        let request = client.request("sys".into(), "user".into());
        let response = client.send(&request).await.unwrap();
        assert_eq!(response.content, "ok");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_auth_error_not_retried() {
        let provider = Arc::new(FlakyProvider {
            calls: AtomicU32::new(0),
            fail_first: 10,
            error: ProviderError::Authentication("bad key".into()),
        });
        let client = client(Arc::clone(&provider));
        let request = client.request("sys".into(), "user".into());
        let result = client.send(&request).await;
        assert!(matches!(result, Err(ProviderError::Authentication(_))));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_gets_more_attempts_and_is_recorded() {
        let provider = Arc::new(FlakyProvider {
            calls: AtomicU32::new(0),
            fail_first: 5,
            error: ProviderError::RateLimitExceeded {
                details: "429".into(),
                retry_delay: None,
            },
        });
        let controller = Arc::new(ConcurrencyController::default());
        let resolved = ResolvedLlmConfig {
            provider: "test".into(),
            model: "flaky-model".into(),
            api_key: "key".into(),
            timeout: Duration::from_secs(1),
            retry_count: 3,
            temperature: 0.7,
        };
        let client = LLMClient::new(
            Arc::clone(&provider) as Arc<dyn Provider>,
            &resolved,
            1024,
            Arc::clone(&controller),
        )
        .with_policy(fast_policy());

        let request = client.request("sys".into(), "user".into());
        let response = client.send(&request).await.unwrap();
        assert_eq!(response.content, "ok");
        // 5 failures then success: rate-limit budget is 6 attempts.
        assert_eq!(provider.calls.load(Ordering::SeqCst), 6);
        assert_eq!(controller.metrics().total_rate_limits, 5);
    }

    /// A configured retry_count above three must take effect; the paused
    /// clock lets the full-length backoff sleeps elapse instantly.
    #[tokio::test(start_paused = true)]
    async fn test_configured_retry_count_honored_above_three() {
        let provider = Arc::new(FlakyProvider {
            calls: AtomicU32::new(0),
            fail_first: 5,
            error: ProviderError::ServerError("503".into()),
        });
        let resolved = ResolvedLlmConfig {
            provider: "test".into(),
            model: "flaky-model".into(),
            api_key: "key".into(),
            timeout: Duration::from_secs(1),
            retry_count: 6,
            temperature: 0.7,
        };
        let client = LLMClient::new(
            Arc::clone(&provider) as Arc<dyn Provider>,
            &resolved,
            1024,
            Arc::new(ConcurrencyController::default()),
        );

        let request = client.request("sys".into(), "user".into());
        let response = client.send(&request).await.unwrap();
        assert_eq!(response.content, "ok");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_default_retries_exhausted() {
        let provider = Arc::new(FlakyProvider {
            calls: AtomicU32::new(0),
            fail_first: 10,
            error: ProviderError::NetworkError("reset".into()),
        });
        let client = client(Arc::clone(&provider));
        let request = client.request("sys".into(), "user".into());
        let result = client.send(&request).await;
        assert!(matches!(result, Err(ProviderError::NetworkError(_))));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_backoff_within_cap() {
        let policy = RetryPolicy::default();
        let error = ProviderError::ServerError("500".into());
        for attempt in 0..10 {
            let wait = policy.backoff_for(&error, attempt);
            assert!(wait <= policy.default_cap);
        }
        let rate_limited = ProviderError::RateLimitExceeded {
            details: "429".into(),
            retry_delay: None,
        };
        for attempt in 0..10 {
            let wait = policy.backoff_for(&rate_limited, attempt);
            assert!(wait <= policy.rate_limit_cap);
            assert!(wait >= policy.min_rate_limit_delay);
        }
    }
}
