pub mod anthropic;
pub mod base;
pub mod gemini;
pub mod openai;
pub mod retry;

use std::sync::Arc;

pub use base::{ChatRequest, ChatResponse, Provider, Usage};
pub use retry::{LLMClient, RetryPolicy};

use crate::config::ResolvedLlmConfig;
use crate::error::{MagiError, Result};

/// Build a provider adapter for a resolved per-persona configuration.
pub fn create(config: &ResolvedLlmConfig) -> Result<Arc<dyn Provider>> {
    match config.provider.to_lowercase().as_str() {
        "anthropic" => Ok(Arc::new(anthropic::AnthropicProvider::new(config)?)),
        "openai" => Ok(Arc::new(openai::OpenAiProvider::new(config)?)),
        "gemini" => Ok(Arc::new(gemini::GeminiProvider::new(config)?)),
        other => Err(MagiError::Config(format!(
            "unsupported provider '{}'",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn resolved(provider: &str) -> ResolvedLlmConfig {
        ResolvedLlmConfig {
            provider: provider.to_string(),
            model: "test-model".to_string(),
            api_key: "test-key".to_string(),
            timeout: Duration::from_secs(5),
            retry_count: 1,
            temperature: 0.7,
        }
    }

    #[test]
    fn test_factory_known_providers() {
        for provider in ["anthropic", "openai", "gemini", "Anthropic"] {
            assert!(create(&resolved(provider)).is_ok(), "{}", provider);
        }
    }

    #[test]
    fn test_factory_unknown_provider() {
        assert!(matches!(
            create(&resolved("watsonx")),
            Err(MagiError::Config(_))
        ));
    }
}
