//! Runtime configuration with per-persona LLM overrides.
//!
//! Defaults follow the documented configuration surface; every field can be
//! set through a `MAGI_*` environment variable. Persona overrides are a
//! deep-merge of an optional record onto the global defaults - fields are
//! enumerated, no dynamic key injection.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MagiError, Result};
use crate::models::{PersonaType, VotingThreshold};

pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
pub const DEFAULT_PROVIDER: &str = "anthropic";
pub const MAX_RETRY_COUNT: u32 = 10;

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_provider() -> String {
    DEFAULT_PROVIDER.to_string()
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_retry_count() -> u32 {
    3
}

fn default_temperature() -> f64 {
    0.7
}

fn default_debate_rounds() -> u32 {
    1
}

fn default_voting_threshold() -> VotingThreshold {
    VotingThreshold::Majority
}

fn default_quorum_threshold() -> usize {
    2
}

fn default_token_budget() -> usize {
    8192
}

fn default_llm_concurrency_limit() -> usize {
    5
}

fn default_schema_retry_count() -> u32 {
    3
}

fn default_streaming_queue_size() -> usize {
    100
}

fn default_streaming_emit_timeout_secs() -> f64 {
    2.0
}

fn default_guardrails_timeout_secs() -> f64 {
    3.0
}

fn default_template_ttl_secs() -> u64 {
    300
}

fn default_max_output_tokens() -> u32 {
    4096
}

/// Queue overflow handling for the streaming emitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    #[default]
    Drop,
    Backpressure,
}

/// What to do when a guardrails provider times out or errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum FailPolicy {
    #[default]
    FailClosed,
    FailOpen,
}

/// Per-persona override of the LLM settings. Unset fields inherit globals.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersonaLlmConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersonaConfig {
    /// Extra instruction for this persona's system prompt. Appended to the
    /// base instruction unless `persona_full_override` is granted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction: Option<String>,
    #[serde(default)]
    pub llm: PersonaLlmConfig,
}

/// Fully-resolved LLM settings for one persona.
#[derive(Clone, PartialEq)]
pub struct ResolvedLlmConfig {
    pub provider: String,
    pub model: String,
    pub api_key: String,
    pub timeout: Duration,
    pub retry_count: u32,
    pub temperature: f64,
}

impl std::fmt::Debug for ResolvedLlmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedLlmConfig")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("api_key", &mask_secret(&self.api_key))
            .field("timeout", &self.timeout)
            .field("retry_count", &self.retry_count)
            .field("temperature", &self.temperature)
            .finish()
    }
}

/// Mask a credential for logs: keep a short prefix/suffix only.
pub fn mask_secret(secret: &str) -> String {
    if secret.len() > 12 {
        format!("{}...{}", &secret[..8], &secret[secret.len() - 4..])
    } else if secret.is_empty() {
        String::new()
    } else {
        "***".to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,

    #[serde(default = "default_debate_rounds")]
    pub debate_rounds: u32,
    #[serde(default = "default_voting_threshold")]
    pub voting_threshold: VotingThreshold,
    #[serde(default = "default_quorum_threshold")]
    pub quorum_threshold: usize,
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,
    #[serde(default = "default_schema_retry_count")]
    pub schema_retry_count: u32,

    #[serde(default = "default_llm_concurrency_limit")]
    pub llm_concurrency_limit: usize,

    #[serde(default = "default_streaming_queue_size")]
    pub streaming_queue_size: usize,
    #[serde(default)]
    pub streaming_overflow_policy: OverflowPolicy,
    #[serde(default = "default_streaming_emit_timeout_secs")]
    pub streaming_emit_timeout_secs: f64,

    #[serde(default)]
    pub guardrails_enabled: bool,
    #[serde(default = "default_guardrails_timeout_secs")]
    pub guardrails_timeout_secs: f64,
    #[serde(default)]
    pub guardrails_on_timeout: FailPolicy,
    #[serde(default)]
    pub guardrails_on_error: FailPolicy,

    #[serde(default = "default_template_ttl_secs")]
    pub template_ttl_secs: u64,

    /// Grants `FULL_OVERRIDE`: persona instructions replace the base
    /// prompt instead of appending to it.
    #[serde(default)]
    pub persona_full_override: bool,

    #[serde(default)]
    pub personas: HashMap<String, PersonaConfig>,
}

impl Default for Config {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).expect("defaults are valid")
    }
}

impl Config {
    /// Build the configuration from `MAGI_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("MAGI_API_KEY") {
            config.api_key = v;
        }
        if let Ok(v) = std::env::var("MAGI_PROVIDER") {
            config.provider = v;
        }
        if let Ok(v) = std::env::var("MAGI_MODEL") {
            config.model = v;
        }
        if let Ok(v) = std::env::var("MAGI_TIMEOUT_SECS") {
            config.timeout_secs = parse_env("MAGI_TIMEOUT_SECS", &v)?;
        }
        if let Ok(v) = std::env::var("MAGI_RETRY_COUNT") {
            config.retry_count = parse_env("MAGI_RETRY_COUNT", &v)?;
        }
        if let Ok(v) = std::env::var("MAGI_DEBATE_ROUNDS") {
            config.debate_rounds = parse_env("MAGI_DEBATE_ROUNDS", &v)?;
        }
        if let Ok(v) = std::env::var("MAGI_VOTING_THRESHOLD") {
            config.voting_threshold = v.parse().map_err(MagiError::Config)?;
        }
        if let Ok(v) = std::env::var("MAGI_QUORUM_THRESHOLD") {
            config.quorum_threshold = parse_env("MAGI_QUORUM_THRESHOLD", &v)?;
        }
        if let Ok(v) = std::env::var("MAGI_TOKEN_BUDGET") {
            config.token_budget = parse_env("MAGI_TOKEN_BUDGET", &v)?;
        }
        if let Ok(v) = std::env::var("MAGI_LLM_CONCURRENCY_LIMIT") {
            config.llm_concurrency_limit = parse_env("MAGI_LLM_CONCURRENCY_LIMIT", &v)?;
        }
        if let Ok(v) = std::env::var("MAGI_STREAMING_QUEUE_SIZE") {
            config.streaming_queue_size = parse_env("MAGI_STREAMING_QUEUE_SIZE", &v)?;
        }
        if let Ok(v) = std::env::var("MAGI_STREAMING_OVERFLOW_POLICY") {
            config.streaming_overflow_policy = match v.to_lowercase().as_str() {
                "drop" => OverflowPolicy::Drop,
                "backpressure" => OverflowPolicy::Backpressure,
                other => {
                    return Err(MagiError::Config(format!(
                        "invalid overflow policy '{}'",
                        other
                    )))
                }
            };
        }
        if let Ok(v) = std::env::var("MAGI_GUARDRAILS_ENABLED") {
            config.guardrails_enabled = matches!(v.to_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Ok(v) = std::env::var("MAGI_PERSONA_FULL_OVERRIDE") {
            config.persona_full_override =
                matches!(v.to_lowercase().as_str(), "1" | "true" | "yes");
        }
        for persona in PersonaType::ALL {
            let key = format!(
                "MAGI_PERSONAS_{}_INSTRUCTION",
                persona.config_key().to_uppercase()
            );
            if let Ok(v) = std::env::var(&key) {
                config
                    .personas
                    .entry(persona.config_key().to_string())
                    .or_default()
                    .instruction = Some(v);
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Configured per-persona prompt instructions, keyed by lowercase
    /// persona name, ready for `PersonaManager::apply_overrides`.
    pub fn persona_overrides(&self) -> HashMap<String, String> {
        self.personas
            .iter()
            .filter_map(|(key, persona)| {
                persona
                    .instruction
                    .as_ref()
                    .map(|instruction| (key.clone(), instruction.clone()))
            })
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.temperature) {
            return Err(MagiError::Config(format!(
                "temperature {} outside [0, 1]",
                self.temperature
            )));
        }
        if self.quorum_threshold == 0 || self.quorum_threshold > PersonaType::ALL.len() {
            return Err(MagiError::Config(format!(
                "quorum_threshold {} outside 1..={}",
                self.quorum_threshold,
                PersonaType::ALL.len()
            )));
        }
        if self.retry_count > MAX_RETRY_COUNT {
            return Err(MagiError::Config(format!(
                "retry_count {} outside 0..={}",
                self.retry_count, MAX_RETRY_COUNT
            )));
        }
        if self.debate_rounds == 0 {
            return Err(MagiError::Config("debate_rounds must be >= 1".into()));
        }
        if self.token_budget == 0 {
            return Err(MagiError::Config("token_budget must be >= 1".into()));
        }
        for (key, persona) in &self.personas {
            if PersonaType::from_config_key(key).is_none() {
                return Err(MagiError::Config(format!("unknown persona key '{}'", key)));
            }
            if let Some(t) = persona.llm.temperature {
                if !(0.0..=1.0).contains(&t) {
                    return Err(MagiError::Config(format!(
                        "personas.{}.llm.temperature {} outside [0, 1]",
                        key, t
                    )));
                }
            }
            if let Some(r) = persona.llm.retry_count {
                if r > MAX_RETRY_COUNT {
                    return Err(MagiError::Config(format!(
                        "personas.{}.llm.retry_count {} outside 0..={}",
                        key, r, MAX_RETRY_COUNT
                    )));
                }
            }
        }
        Ok(())
    }

    /// Resolve the effective LLM settings for a persona: the optional
    /// per-persona override merged field-by-field onto the globals.
    pub fn resolve_llm(&self, persona: PersonaType) -> ResolvedLlmConfig {
        let override_cfg = self
            .personas
            .get(persona.config_key())
            .map(|p| &p.llm)
            .cloned()
            .unwrap_or_default();

        ResolvedLlmConfig {
            provider: override_cfg.provider.unwrap_or_else(|| self.provider.clone()),
            model: override_cfg.model.unwrap_or_else(|| self.model.clone()),
            api_key: override_cfg.api_key.unwrap_or_else(|| self.api_key.clone()),
            timeout: Duration::from_secs(override_cfg.timeout_secs.unwrap_or(self.timeout_secs)),
            retry_count: override_cfg.retry_count.unwrap_or(self.retry_count),
            temperature: override_cfg.temperature.unwrap_or(self.temperature),
        }
    }

    pub fn streaming_emit_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.streaming_emit_timeout_secs)
    }

    pub fn guardrails_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.guardrails_timeout_secs)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| MagiError::Config(format!("invalid value '{}' for {}", value, key)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_surface() {
        let config = Config::default();
        assert_eq!(config.debate_rounds, 1);
        assert_eq!(config.voting_threshold, VotingThreshold::Majority);
        assert_eq!(config.quorum_threshold, 2);
        assert_eq!(config.token_budget, 8192);
        assert_eq!(config.llm_concurrency_limit, 5);
        assert_eq!(config.streaming_queue_size, 100);
        assert_eq!(config.streaming_overflow_policy, OverflowPolicy::Drop);
        assert_eq!(config.guardrails_on_timeout, FailPolicy::FailClosed);
        assert_eq!(config.timeout_secs, 60);
        assert_eq!(config.template_ttl_secs, 300);
    }

    #[test]
    fn test_persona_resolution_inherits_globals() {
        let config = Config {
            api_key: "sk-global".into(),
            model: "model-a".into(),
            ..Default::default()
        };
        let resolved = config.resolve_llm(PersonaType::Melchior);
        assert_eq!(resolved.model, "model-a");
        assert_eq!(resolved.api_key, "sk-global");
        assert_eq!(resolved.retry_count, 3);
    }

    #[test]
    fn test_persona_resolution_merges_overrides() {
        let mut config = Config {
            api_key: "sk-global".into(),
            model: "model-a".into(),
            ..Default::default()
        };
        config.personas.insert(
            "casper".into(),
            PersonaConfig {
                instruction: None,
                llm: PersonaLlmConfig {
                    model: Some("model-b".into()),
                    temperature: Some(0.2),
                    ..Default::default()
                },
            },
        );

        let casper = config.resolve_llm(PersonaType::Casper);
        assert_eq!(casper.model, "model-b");
        assert_eq!(casper.temperature, 0.2);
        // Non-overridden fields fall back to globals.
        assert_eq!(casper.api_key, "sk-global");

        let melchior = config.resolve_llm(PersonaType::Melchior);
        assert_eq!(melchior.model, "model-a");
    }

    #[test]
    fn test_validate_rejects_bad_temperature() {
        let config = Config {
            temperature: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_persona_key() {
        let mut config = Config::default();
        config
            .personas
            .insert("ramiel".into(), PersonaConfig::default());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_excessive_retry_count() {
        let config = Config {
            retry_count: MAX_RETRY_COUNT + 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.personas.insert(
            "melchior".into(),
            PersonaConfig {
                llm: PersonaLlmConfig {
                    retry_count: Some(MAX_RETRY_COUNT + 1),
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_persona_overrides_collects_instructions() {
        let mut config = Config::default();
        config.personas.insert(
            "balthasar".into(),
            PersonaConfig {
                instruction: Some("Weigh regulatory exposure.".into()),
                ..Default::default()
            },
        );
        // An LLM-only override contributes no instruction.
        config.personas.insert(
            "casper".into(),
            PersonaConfig {
                llm: PersonaLlmConfig {
                    model: Some("model-b".into()),
                    ..Default::default()
                },
                ..Default::default()
            },
        );

        let overrides = config.persona_overrides();
        assert_eq!(overrides.len(), 1);
        assert_eq!(
            overrides.get("balthasar").map(String::as_str),
            Some("Weigh regulatory exposure.")
        );
    }

    #[test]
    fn test_mask_secret() {
        assert_eq!(mask_secret("sk-ant-api03-abcdef1234"), "sk-ant-a...1234");
        assert_eq!(mask_secret("short"), "***");
        assert_eq!(mask_secret(""), "");
    }

    #[test]
    fn test_resolved_debug_masks_api_key() {
        let config = Config {
            api_key: "sk-ant-api03-abcdef1234".into(),
            ..Default::default()
        };
        let debug = format!("{:?}", config.resolve_llm(PersonaType::Balthasar));
        assert!(!debug.contains("abcdef1234") || debug.contains("..."));
        assert!(debug.contains("sk-ant-a"));
    }
}
