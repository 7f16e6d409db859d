//! Pluggable semantic guard chain evaluated before the security filter.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::config::FailPolicy;
use crate::error::{MagiError, Result};

/// Decision returned by a single guardrails provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum GuardDecision {
    Allow,
    Sanitize {
        prompt: String,
        reason: String,
    },
    Deny {
        reason: String,
        matched_rules: Vec<String>,
    },
}

/// A semantic check with a name and an enablement flag. Providers run
/// sequentially; the first deny short-circuits the chain.
#[async_trait]
pub trait GuardrailsProvider: Send + Sync {
    fn name(&self) -> &str;

    fn enabled(&self) -> bool {
        true
    }

    async fn evaluate(&self, prompt: &str) -> anyhow::Result<GuardDecision>;
}

/// Outcome of running the full chain.
#[derive(Debug, Clone)]
pub struct GuardrailsOutcome {
    /// Prompt to continue with (sanitized if a provider rewrote it).
    pub prompt: String,
    /// True when a provider failed but the fail-open policy let the prompt
    /// through; the engine emits a CRITICAL audit log for these.
    pub fail_open_applied: bool,
    pub provider: Option<String>,
    pub reason: Option<String>,
}

/// Ordered provider chain with per-provider timeout and configurable
/// fail-open/fail-closed policy.
pub struct GuardrailsAdapter {
    providers: Vec<Box<dyn GuardrailsProvider>>,
    timeout: Duration,
    on_timeout: FailPolicy,
    on_error: FailPolicy,
    enabled: bool,
}

impl GuardrailsAdapter {
    pub fn new(timeout: Duration, on_timeout: FailPolicy, on_error: FailPolicy) -> Self {
        Self {
            providers: Vec::new(),
            timeout,
            on_timeout,
            on_error,
            enabled: true,
        }
    }

    pub fn disabled() -> Self {
        Self {
            providers: Vec::new(),
            timeout: Duration::from_secs(3),
            on_timeout: FailPolicy::FailClosed,
            on_error: FailPolicy::FailClosed,
            enabled: false,
        }
    }

    pub fn with_provider(mut self, provider: Box<dyn GuardrailsProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn with_default_providers(self) -> Self {
        self.with_provider(Box::new(HeuristicGuardrailsProvider::new()))
    }

    /// Run every enabled provider against the prompt.
    pub async fn check(&self, prompt: &str) -> Result<GuardrailsOutcome> {
        let mut current = prompt.to_string();
        let mut fail_open_applied = false;
        let mut fail_open_provider = None;
        let mut fail_open_reason = None;

        if !self.enabled {
            return Ok(GuardrailsOutcome {
                prompt: current,
                fail_open_applied: false,
                provider: None,
                reason: None,
            });
        }

        for provider in &self.providers {
            if !provider.enabled() {
                continue;
            }
            let name = provider.name().to_string();

            let decision =
                match tokio::time::timeout(self.timeout, provider.evaluate(&current)).await {
                    Ok(Ok(decision)) => decision,
                    Ok(Err(err)) => {
                        warn!(provider = %name, error = %err, "guardrails.provider_error");
                        match self.on_error {
                            FailPolicy::FailClosed => {
                                return Err(MagiError::GuardrailsBlocked {
                                    provider: name,
                                    reason: format!("provider error: {}", err),
                                });
                            }
                            FailPolicy::FailOpen => {
                                error!(provider = %name, "guardrails.fail_open");
                                fail_open_applied = true;
                                fail_open_provider = Some(name);
                                fail_open_reason = Some(err.to_string());
                                continue;
                            }
                        }
                    }
                    Err(_) => {
                        warn!(
                            provider = %name,
                            timeout_secs = self.timeout.as_secs_f64(),
                            "guardrails.timeout"
                        );
                        match self.on_timeout {
                            FailPolicy::FailClosed => {
                                return Err(MagiError::GuardrailsTimeout {
                                    provider: name,
                                    timeout_secs: self.timeout.as_secs(),
                                });
                            }
                            FailPolicy::FailOpen => {
                                error!(provider = %name, "guardrails.fail_open");
                                fail_open_applied = true;
                                fail_open_provider = Some(name);
                                fail_open_reason = Some("timeout".to_string());
                                continue;
                            }
                        }
                    }
                };

            match decision {
                GuardDecision::Allow => {}
                GuardDecision::Sanitize { prompt, reason } => {
                    warn!(provider = %name, reason = %reason, "guardrails.sanitized");
                    current = prompt;
                }
                GuardDecision::Deny {
                    reason,
                    matched_rules,
                } => {
                    warn!(
                        provider = %name,
                        reason = %reason,
                        rules = ?matched_rules,
                        "guardrails.blocked"
                    );
                    return Err(MagiError::GuardrailsBlocked {
                        provider: name,
                        reason,
                    });
                }
            }
        }

        Ok(GuardrailsOutcome {
            prompt: current,
            fail_open_applied,
            provider: fail_open_provider,
            reason: fail_open_reason,
        })
    }
}

static JAILBREAK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(ignore\s+all\s+previous|system\s*prompt|jailbreak|do\s+anything\s+now)")
        .unwrap()
});
static BASE64_OBFUSCATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:SU5HT1JF|PD9|LS0tLS1CRUdJTi)[A-Za-z0-9+/]{8,}={0,2}\b").unwrap()
});
static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").unwrap()
});

/// Built-in heuristic provider: jailbreak keywords, base64 obfuscation and
/// e-mail PII masking.
pub struct HeuristicGuardrailsProvider;

impl HeuristicGuardrailsProvider {
    pub fn new() -> Self {
        Self
    }
}

impl Default for HeuristicGuardrailsProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GuardrailsProvider for HeuristicGuardrailsProvider {
    fn name(&self) -> &str {
        "heuristic"
    }

    async fn evaluate(&self, prompt: &str) -> anyhow::Result<GuardDecision> {
        let trimmed = prompt.trim();

        if BASE64_OBFUSCATION.is_match(trimmed) {
            return Ok(GuardDecision::Deny {
                reason: "base64_obfuscation".to_string(),
                matched_rules: vec!["base64_obfuscation".to_string()],
            });
        }
        if JAILBREAK.is_match(trimmed) {
            return Ok(GuardDecision::Deny {
                reason: "prompt_injection".to_string(),
                matched_rules: vec!["jailbreak_keyword".to_string()],
            });
        }

        let sanitized = EMAIL.replace_all(trimmed, "[EMAIL_REDACTED]");
        if sanitized != trimmed {
            return Ok(GuardDecision::Sanitize {
                prompt: sanitized.into_owned(),
                reason: "pii_sanitized".to_string(),
            });
        }

        Ok(GuardDecision::Allow)
    }
}
