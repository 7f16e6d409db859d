pub mod filter;
pub mod guardrails;

pub use filter::{DetectionResult, SanitizedText, SecurityFilter};
pub use guardrails::{
    GuardDecision, GuardrailsAdapter, GuardrailsOutcome, GuardrailsProvider,
    HeuristicGuardrailsProvider,
};
