//! Provider abstraction: the chat completion primitive.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProviderError;

/// A single chat completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub system_prompt: String,
    pub user_prompt: String,
    pub max_tokens: u32,
    pub temperature: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: String,
    pub usage: Usage,
    pub model: String,
}

/// A provider adapter wraps one vendor HTTP API behind the chat completion
/// primitive. Retry behavior lives in [`super::LLMClient`], not here.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    fn model(&self) -> &str;

    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError>;
}

/// Shared status-code mapping for HTTP providers.
pub(crate) fn map_http_error(
    status: StatusCode,
    payload: Option<&Value>,
    retry_after: Option<Duration>,
) -> ProviderError {
    let detail = payload
        .and_then(|p| {
            p.pointer("/error/message")
                .or_else(|| p.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| format!("status {}", status));

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ProviderError::Authentication(detail)
        }
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimitExceeded {
            details: detail,
            retry_delay: retry_after,
        },
        StatusCode::BAD_REQUEST => {
            let lowered = detail.to_lowercase();
            if lowered.contains("too long")
                || lowered.contains("too many")
                || lowered.contains("context length")
            {
                ProviderError::ContextLengthExceeded(detail)
            } else {
                ProviderError::RequestFailed(detail)
            }
        }
        s if s.is_server_error() => ProviderError::ServerError(detail),
        _ => ProviderError::RequestFailed(detail),
    }
}

/// Parse a `retry-after` header value in seconds.
pub(crate) fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}
