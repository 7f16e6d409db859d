//! Quorum accounting across deliberation phases.

use std::collections::BTreeSet;

use crate::models::QuorumState;

/// Tracks per-persona success and exclusion. The engine consults
/// [`QuorumManager::can_continue`] after each phase and fails safe when the
/// alive count drops below the quorum floor.
pub struct QuorumManager {
    total_agents: usize,
    quorum: usize,
    retries_left: u32,
    excluded: BTreeSet<String>,
    successes: BTreeSet<String>,
}

impl QuorumManager {
    pub fn new(total_agents: usize, quorum: usize, max_retries: u32) -> Self {
        Self {
            total_agents,
            quorum: quorum.min(total_agents),
            retries_left: max_retries,
            excluded: BTreeSet::new(),
            successes: BTreeSet::new(),
        }
    }

    pub fn note_success(&mut self, persona: &str) {
        self.successes.insert(persona.to_string());
    }

    /// Permanently exclude a persona from the remainder of the session.
    pub fn exclude(&mut self, persona: &str) {
        self.excluded.insert(persona.to_string());
    }

    pub fn decrement_retry(&mut self) {
        self.retries_left = self.retries_left.saturating_sub(1);
    }

    pub fn alive(&self) -> usize {
        self.total_agents - self.excluded.len()
    }

    pub fn can_continue(&self) -> bool {
        self.alive() >= self.quorum
    }

    pub fn excluded(&self) -> Vec<String> {
        self.excluded.iter().cloned().collect()
    }

    pub fn state(&self) -> QuorumState {
        let partial = !self.successes.is_empty() && self.successes.len() < self.total_agents;
        QuorumState {
            alive: self.alive(),
            quorum: self.quorum,
            retries_left: self.retries_left,
            partial_results: partial,
            excluded: self.excluded(),
        }
    }
}
