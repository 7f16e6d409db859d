//! MAGI - a three-agent deliberative consensus engine over heterogeneous
//! LLM providers.
//!
//! Three fixed personas (MELCHIOR-1, BALTHASAR-2, CASPER-3) analyze a prompt
//! independently, debate each other's positions, and cast structured ballots
//! yielding APPROVE, DENY or CONDITIONAL. The crate provides the deliberation
//! runtime: the phased state machine, per-persona client resolution,
//! concurrency control, token budgeting, schema-validated voting with quorum
//! fail-safe, and a streaming event pipeline for observers.

pub mod agent;
pub mod concurrency;
pub mod config;
pub mod consensus;
pub mod context;
pub mod error;
pub mod events;
pub mod models;
pub mod personas;
pub mod providers;
pub mod quorum;
pub mod schema;
pub mod security;
pub mod streaming;
pub mod templates;

pub use agent::Agent;
pub use concurrency::{ConcurrencyController, ConcurrencyMetrics};
pub use config::{Config, PersonaLlmConfig, ResolvedLlmConfig};
pub use consensus::ConsensusEngine;
pub use context::TokenBudgetManager;
pub use error::{MagiError, ProviderError, Result};
pub use events::{Envelope, ErrorCode, Event, EventPriority, LogLevel};
pub use models::{
    ConsensusPhase, ConsensusResult, Decision, PersonaType, UnitState, Vote, VotePayload,
    VotingThreshold,
};
pub use personas::{Persona, PersonaManager};
pub use quorum::QuorumManager;
pub use schema::SchemaValidator;
pub use security::{GuardrailsAdapter, SecurityFilter};
pub use streaming::StreamingEmitter;
pub use templates::TemplateLoader;
