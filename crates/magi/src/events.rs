//! Typed events streamed to observers.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{ConsensusPhase, UnitState};

pub const EVENT_SCHEMA_VERSION: &str = "1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    MagiCoreError,
    Timeout,
    Cancelled,
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Critical,
}

/// Delivery priority. Critical events must reach every active subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventPriority {
    Normal,
    Critical,
}

/// One recorded ballot inside a `final` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalVote {
    pub vote: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<String>>,
}

/// The authoritative event union. Consumers match exhaustively on `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Event {
    Phase {
        phase: ConsensusPhase,
    },
    Progress {
        pct: u8,
    },
    Unit {
        unit: String,
        state: UnitState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        score: Option<f64>,
    },
    Log {
        level: LogLevel,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        unit: Option<String>,
        lines: Vec<String>,
    },
    Final {
        decision: String,
        votes: BTreeMap<String, FinalVote>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
}

impl Event {
    /// Events whose loss is impermissible: terminal phases, the final
    /// result, and terminal errors.
    pub fn priority(&self) -> EventPriority {
        match self {
            Event::Final { .. } | Event::Error { .. } => EventPriority::Critical,
            Event::Phase { phase } if phase.is_terminal() => EventPriority::Critical,
            _ => EventPriority::Normal,
        }
    }
}

/// Wire envelope: every message carries the schema version, session id and
/// an ISO-8601 timestamp alongside the event fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub schema_version: String,
    pub session_id: String,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub event: Event,
}

impl Envelope {
    pub fn new(session_id: impl Into<String>, event: Event) -> Self {
        Self {
            schema_version: EVENT_SCHEMA_VERSION.to_string(),
            session_id: session_id.into(),
            ts: Utc::now(),
            event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_discriminant() {
        let event = Event::Phase {
            phase: ConsensusPhase::Thinking,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "phase");
        assert_eq!(json["phase"], "THINKING");
    }

    #[test]
    fn test_envelope_common_fields() {
        let envelope = Envelope::new("sess-1", Event::Progress { pct: 42 });
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["schema_version"], "1.0");
        assert_eq!(json["session_id"], "sess-1");
        assert_eq!(json["type"], "progress");
        assert_eq!(json["pct"], 42);
        assert!(json["ts"].is_string());
    }

    #[test]
    fn test_critical_priority() {
        let final_event = Event::Final {
            decision: "APPROVE".into(),
            votes: BTreeMap::new(),
            summary: None,
        };
        assert_eq!(final_event.priority(), EventPriority::Critical);

        let resolved = Event::Phase {
            phase: ConsensusPhase::Resolved,
        };
        assert_eq!(resolved.priority(), EventPriority::Critical);

        let thinking = Event::Phase {
            phase: ConsensusPhase::Thinking,
        };
        assert_eq!(thinking.priority(), EventPriority::Normal);

        let error = Event::Error {
            code: ErrorCode::Timeout,
            message: "deadline".into(),
        };
        assert_eq!(error.priority(), EventPriority::Critical);
    }

    #[test]
    fn test_error_code_wire_format() {
        let event = Event::Error {
            code: ErrorCode::MagiCoreError,
            message: "quorum loss: [CASPER-3]".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["code"], "MAGI_CORE_ERROR");
    }
}
