//! JSON-schema validation of structured vote payloads.

use once_cell::sync::Lazy;
use serde_json::{json, Value};

use crate::models::{Vote, VotePayload};

static VOTE_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "type": "object",
        "required": ["vote", "reason"],
        "properties": {
            "vote": { "type": "string", "minLength": 1 },
            "reason": { "type": "string", "minLength": 1 },
            "conditions": {
                "type": "array",
                "items": { "type": "string", "minLength": 1 }
            },
            "confidence": { "type": "number", "minimum": 0.0, "maximum": 1.0 },
            "score": { "type": "number", "minimum": 0.0, "maximum": 1.0 }
        },
        "additionalProperties": true
    })
});

#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    pub ok: bool,
    pub errors: Vec<String>,
}

/// Validates vote payloads against the vote JSON schema plus semantic
/// checks. The retry loop is owned by the caller; this type only reports.
pub struct SchemaValidator {
    vote_validator: jsonschema::Validator,
}

impl SchemaValidator {
    pub fn new() -> Self {
        let vote_validator =
            jsonschema::validator_for(&VOTE_SCHEMA).expect("vote schema is valid");
        Self { vote_validator }
    }

    /// Validate a raw payload. On success returns the typed [`VotePayload`].
    pub fn validate_vote_payload(
        &self,
        payload: &Value,
    ) -> Result<VotePayload, ValidationOutcome> {
        let mut errors: Vec<String> = Vec::new();

        if !payload.is_object() {
            return Err(ValidationOutcome {
                ok: false,
                errors: vec!["payload must be a JSON object".to_string()],
            });
        }

        let normalized = normalize_payload(payload);

        for error in self.vote_validator.iter_errors(&normalized) {
            errors.push(format!("${}: {}", error.instance_path, error));
        }

        let vote = normalized
            .get("vote")
            .and_then(Value::as_str)
            .and_then(Vote::parse);
        if vote.is_none() {
            errors.push("vote must be one of APPROVE | DENY | CONDITIONAL".to_string());
        }

        let reason = normalized.get("reason").and_then(Value::as_str);
        if reason.map(str::trim).filter(|r| !r.is_empty()).is_none() {
            errors.push("reason must be a non-empty string".to_string());
        }

        let mut conditions: Option<Vec<String>> = None;
        if let Some(raw) = normalized.get("conditions") {
            match raw.as_array() {
                Some(items)
                    if items
                        .iter()
                        .all(|i| i.as_str().is_some_and(|s| !s.trim().is_empty())) =>
                {
                    conditions = Some(
                        items
                            .iter()
                            .filter_map(|i| i.as_str().map(str::to_string))
                            .collect(),
                    );
                }
                _ => {
                    errors.push(
                        "conditions must be a list of non-empty strings".to_string(),
                    );
                }
            }
        }

        if !errors.is_empty() {
            return Err(ValidationOutcome { ok: false, errors });
        }

        Ok(VotePayload {
            vote: vote.expect("checked above"),
            reason: reason.expect("checked above").trim().to_string(),
            conditions,
        })
    }
}

impl Default for SchemaValidator {
    fn default() -> Self {
        Self::new()
    }
}

/// Trim vote and reason before validation so harmless whitespace from the
/// model does not count as a schema failure.
fn normalize_payload(payload: &Value) -> Value {
    let mut normalized = payload.clone();
    if let Some(obj) = normalized.as_object_mut() {
        if let Some(vote) = obj.get("vote").and_then(Value::as_str) {
            let trimmed = vote.trim().to_string();
            obj.insert("vote".to_string(), Value::String(trimmed));
        }
        if let Some(reason) = obj.get("reason").and_then(Value::as_str) {
            let trimmed = reason.trim().to_string();
            obj.insert("reason".to_string(), Value::String(trimmed));
        }
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_payload() {
        let validator = SchemaValidator::new();
        let payload = json!({
            "vote": "APPROVE",
            "reason": "sound and feasible"
        });
        let result = validator.validate_vote_payload(&payload).unwrap();
        assert_eq!(result.vote, Vote::Approve);
        assert_eq!(result.reason, "sound and feasible");
        assert!(result.conditions.is_none());
    }

    #[test]
    fn test_vote_case_and_whitespace_normalized() {
        let validator = SchemaValidator::new();
        let payload = json!({
            "vote": " conditional ",
            "reason": "  needs review  ",
            "conditions": ["add tests"]
        });
        let result = validator.validate_vote_payload(&payload).unwrap();
        assert_eq!(result.vote, Vote::Conditional);
        assert_eq!(result.reason, "needs review");
        assert_eq!(result.conditions.unwrap(), vec!["add tests"]);
    }

    #[test]
    fn test_missing_reason_rejected() {
        let validator = SchemaValidator::new();
        let payload = json!({ "vote": "APPROVE" });
        let outcome = validator.validate_vote_payload(&payload).unwrap_err();
        assert!(outcome.errors.iter().any(|e| e.contains("reason")));
    }

    #[test]
    fn test_unknown_vote_rejected() {
        let validator = SchemaValidator::new();
        let payload = json!({ "vote": "ABSTAIN", "reason": "undecided" });
        let outcome = validator.validate_vote_payload(&payload).unwrap_err();
        assert!(outcome
            .errors
            .iter()
            .any(|e| e.contains("APPROVE | DENY | CONDITIONAL")));
    }

    #[test]
    fn test_bad_conditions_rejected() {
        let validator = SchemaValidator::new();
        let payload = json!({
            "vote": "CONDITIONAL",
            "reason": "with caveats",
            "conditions": ["ok", ""]
        });
        let outcome = validator.validate_vote_payload(&payload).unwrap_err();
        assert!(outcome.errors.iter().any(|e| e.contains("conditions")));
    }

    #[test]
    fn test_non_object_rejected() {
        let validator = SchemaValidator::new();
        let outcome = validator
            .validate_vote_payload(&json!("just a string"))
            .unwrap_err();
        assert!(!outcome.ok);
    }

    #[test]
    fn test_extra_fields_tolerated() {
        let validator = SchemaValidator::new();
        let payload = json!({
            "vote": "DENY",
            "reason": "too risky",
            "confidence": 0.9
        });
        assert!(validator.validate_vote_payload(&payload).is_ok());
    }
}
