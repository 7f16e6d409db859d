//! Data model shared across the consensus runtime.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single agent's ballot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Vote {
    Approve,
    Deny,
    Conditional,
}

impl Vote {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_uppercase().as_str() {
            "APPROVE" => Some(Self::Approve),
            "DENY" => Some(Self::Deny),
            "CONDITIONAL" => Some(Self::Conditional),
            _ => None,
        }
    }
}

impl std::fmt::Display for Vote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Approve => write!(f, "APPROVE"),
            Self::Deny => write!(f, "DENY"),
            Self::Conditional => write!(f, "CONDITIONAL"),
        }
    }
}

/// Final verdict of a deliberation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Approve,
    Deny,
    Conditional,
}

impl Decision {
    /// Process exit code contract: APPROVE=0, DENY=1, CONDITIONAL=2.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Approve => 0,
            Self::Deny => 1,
            Self::Conditional => 2,
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Approve => write!(f, "APPROVE"),
            Self::Deny => write!(f, "DENY"),
            Self::Conditional => write!(f, "CONDITIONAL"),
        }
    }
}

/// The three fixed reasoning units.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum PersonaType {
    Melchior,
    Balthasar,
    Casper,
}

impl PersonaType {
    pub const ALL: [PersonaType; 3] = [Self::Melchior, Self::Balthasar, Self::Casper];

    /// Canonical display name used in unit events and logs.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Melchior => "MELCHIOR-1",
            Self::Balthasar => "BALTHASAR-2",
            Self::Casper => "CASPER-3",
        }
    }

    /// Lowercase key used for configuration lookup.
    pub fn config_key(&self) -> &'static str {
        match self {
            Self::Melchior => "melchior",
            Self::Balthasar => "balthasar",
            Self::Casper => "casper",
        }
    }

    pub fn from_config_key(key: &str) -> Option<Self> {
        match key.to_lowercase().as_str() {
            "melchior" => Some(Self::Melchior),
            "balthasar" => Some(Self::Balthasar),
            "casper" => Some(Self::Casper),
            _ => None,
        }
    }
}

impl std::fmt::Display for PersonaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Deliberation state machine phases. Advances monotonically along
/// Thinking -> Debate -> Voting -> Resolved; Cancelled and Error are terminal
/// and may replace any non-terminal phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsensusPhase {
    Queued,
    Thinking,
    Debate,
    Voting,
    Resolved,
    Cancelled,
    Error,
}

impl ConsensusPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved | Self::Cancelled | Self::Error)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Thinking => 1,
            Self::Debate => 2,
            Self::Voting => 3,
            Self::Resolved => 4,
            Self::Cancelled | Self::Error => 5,
        }
    }

    /// Whether the transition `self -> next` respects the canonical order.
    pub fn can_transition_to(&self, next: ConsensusPhase) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next.is_terminal() {
            return true;
        }
        next.rank() > self.rank()
    }
}

impl std::fmt::Display for ConsensusPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "QUEUED",
            Self::Thinking => "THINKING",
            Self::Debate => "DEBATE",
            Self::Voting => "VOTING",
            Self::Resolved => "RESOLVED",
            Self::Cancelled => "CANCELLED",
            Self::Error => "ERROR",
        };
        write!(f, "{}", s)
    }
}

/// Per-persona unit state shown to observers. Once `Voted`, a unit never
/// transitions again within the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnitState {
    Idle,
    Thinking,
    Debating,
    Voting,
    Voted,
}

impl UnitState {
    fn rank(&self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Thinking => 1,
            Self::Debating => 2,
            Self::Voting => 3,
            Self::Voted => 4,
        }
    }

    /// Unit states never regress.
    pub fn can_transition_to(&self, next: UnitState) -> bool {
        *self != Self::Voted && next.rank() > self.rank()
    }
}

/// Output of one persona's independent Thinking pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinkingOutput {
    pub persona: PersonaType,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Output of one persona's Debate turn for a given round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebateOutput {
    pub persona: PersonaType,
    pub round: u32,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// All outputs for one Debate round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebateRound {
    pub round: u32,
    pub outputs: BTreeMap<PersonaType, DebateOutput>,
    pub timestamp: DateTime<Utc>,
}

/// A validated ballot payload as produced by an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VotePayload {
    pub vote: Vote,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<String>>,
}

/// A ballot attributed to its persona.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteOutput {
    pub persona: PersonaType,
    #[serde(flatten)]
    pub payload: VotePayload,
}

/// Decision rule applied to the tally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VotingThreshold {
    Majority,
    Unanimous,
}

impl std::str::FromStr for VotingThreshold {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "majority" => Ok(Self::Majority),
            "unanimous" => Ok(Self::Unanimous),
            other => Err(format!(
                "invalid voting threshold '{}': must be 'majority' or 'unanimous'",
                other
            )),
        }
    }
}

/// Counts per outcome for the Voting phase.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct VotingTally {
    pub approve: usize,
    pub deny: usize,
    pub conditional: usize,
}

impl VotingTally {
    pub fn from_votes<'a, I: IntoIterator<Item = &'a Vote>>(votes: I) -> Self {
        let mut tally = Self::default();
        for vote in votes {
            match vote {
                Vote::Approve => tally.approve += 1,
                Vote::Deny => tally.deny += 1,
                Vote::Conditional => tally.conditional += 1,
            }
        }
        tally
    }

    pub fn total(&self) -> usize {
        self.approve + self.deny + self.conditional
    }

    /// Apply the configured decision rule.
    ///
    /// Unanimous: APPROVE iff every ballot is APPROVE; DENY iff at least one
    /// DENY; otherwise CONDITIONAL. Majority: strict majority of ballots for
    /// APPROVE or DENY; otherwise CONDITIONAL.
    pub fn decision(&self, threshold: VotingThreshold) -> Decision {
        let total = self.total();
        match threshold {
            VotingThreshold::Unanimous => {
                if total > 0 && self.approve == total {
                    Decision::Approve
                } else if self.deny >= 1 {
                    Decision::Deny
                } else {
                    Decision::Conditional
                }
            }
            VotingThreshold::Majority => {
                if total == 0 {
                    return Decision::Conditional;
                }
                let needed = total / 2 + 1;
                if self.approve >= needed {
                    Decision::Approve
                } else if self.deny >= needed {
                    Decision::Deny
                } else {
                    Decision::Conditional
                }
            }
        }
    }
}

/// Snapshot of quorum accounting after a phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuorumState {
    pub alive: usize,
    pub quorum: usize,
    pub retries_left: u32,
    pub partial_results: bool,
    pub excluded: Vec<String>,
}

/// One context-reduction record emitted by the token budget manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReductionLogEntry {
    pub phase: ConsensusPhase,
    pub size_before: usize,
    pub size_after: usize,
    pub retain_ratio: f64,
    pub summary_applied: bool,
    pub strategy: ReductionStrategy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReductionStrategy {
    PrioritySelectionOnly,
    WithSummary,
}

/// Full result of a deliberation, including per-phase artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub thinking_results: BTreeMap<PersonaType, ThinkingOutput>,
    pub debate_results: Vec<DebateRound>,
    pub voting_results: BTreeMap<PersonaType, VoteOutput>,
    pub decision: Decision,
    pub exit_code: i32,
    pub all_conditions: Vec<String>,
    pub excluded: Vec<String>,
    pub partial_results: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}
