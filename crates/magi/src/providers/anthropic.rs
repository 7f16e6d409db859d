//! Anthropic messages API adapter.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};

use super::base::{map_http_error, parse_retry_after, ChatRequest, ChatResponse, Provider, Usage};
use crate::config::ResolvedLlmConfig;
use crate::error::{MagiError, ProviderError, Result};

const PROVIDER_NAME: &str = "anthropic";
const DEFAULT_HOST: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    client: reqwest::Client,
    host: String,
    api_key: String,
    model: String,
}

impl AnthropicProvider {
    pub fn new(config: &ResolvedLlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| MagiError::Config(format!("http client: {}", e)))?;
        let host =
            std::env::var("MAGI_ANTHROPIC_HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string());
        Ok(Self {
            client,
            host,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        })
    }

    fn payload(&self, request: &ChatRequest) -> Value {
        json!({
            "model": self.model,
            "max_tokens": request.max_tokens,
            "system": request.system_prompt,
            "temperature": request.temperature,
            "messages": [
                { "role": "user", "content": request.user_prompt }
            ]
        })
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &ChatRequest) -> std::result::Result<ChatResponse, ProviderError> {
        let response = self
            .client
            .post(format!("{}/v1/messages", self.host))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&self.payload(request))
            .send()
            .await?;

        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let body: Value = response.json().await.unwrap_or(Value::Null);

        if status != StatusCode::OK {
            return Err(map_http_error(status, Some(&body), retry_after));
        }

        let content = body
            .pointer("/content/0/text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let usage = Usage {
            input_tokens: body
                .pointer("/usage/input_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            output_tokens: body
                .pointer("/usage/output_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
        };
        let model = body
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or(&self.model)
            .to_string();

        Ok(ChatResponse {
            content,
            usage,
            model,
        })
    }
}
