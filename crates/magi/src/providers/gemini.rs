//! Google Gemini generateContent adapter.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};

use super::base::{map_http_error, parse_retry_after, ChatRequest, ChatResponse, Provider, Usage};
use crate::config::ResolvedLlmConfig;
use crate::error::{MagiError, ProviderError, Result};

const PROVIDER_NAME: &str = "gemini";
const DEFAULT_HOST: &str = "https://generativelanguage.googleapis.com";

pub struct GeminiProvider {
    client: reqwest::Client,
    host: String,
    api_key: String,
    model: String,
}

impl GeminiProvider {
    pub fn new(config: &ResolvedLlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| MagiError::Config(format!("http client: {}", e)))?;
        let host = std::env::var("MAGI_GEMINI_HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string());
        Ok(Self {
            client,
            host,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl Provider for GeminiProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &ChatRequest) -> std::result::Result<ChatResponse, ProviderError> {
        let payload = json!({
            "system_instruction": {
                "parts": [{ "text": request.system_prompt }]
            },
            "contents": [{
                "role": "user",
                "parts": [{ "text": request.user_prompt }]
            }],
            "generationConfig": {
                "maxOutputTokens": request.max_tokens,
                "temperature": request.temperature
            }
        });

        let response = self
            .client
            .post(format!(
                "{}/v1beta/models/{}:generateContent",
                self.host, self.model
            ))
            .query(&[("key", self.api_key.as_str())])
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let body: Value = response.json().await.unwrap_or(Value::Null);

        if status != StatusCode::OK {
            return Err(map_http_error(status, Some(&body), retry_after));
        }

        let content = body
            .pointer("/candidates/0/content/parts/0/text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let usage = Usage {
            input_tokens: body
                .pointer("/usageMetadata/promptTokenCount")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            output_tokens: body
                .pointer("/usageMetadata/candidatesTokenCount")
                .and_then(Value::as_u64)
                .unwrap_or(0),
        };

        Ok(ChatResponse {
            content,
            usage,
            model: self.model.clone(),
        })
    }
}
