//! The three fixed reasoning personas and their prompt overrides.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::models::PersonaType;

/// A single reasoning persona. Immutable after construction; overrides
/// produce a replacement instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persona {
    pub persona_type: PersonaType,
    pub name: String,
    pub base_instruction: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_instruction: Option<String>,
}

impl Persona {
    fn new(persona_type: PersonaType, base_instruction: impl Into<String>) -> Self {
        Self {
            persona_type,
            name: persona_type.display_name().to_string(),
            base_instruction: base_instruction.into(),
            override_instruction: None,
        }
    }

    /// The full system prompt: base instruction plus any appended override.
    pub fn system_prompt(&self) -> String {
        match &self.override_instruction {
            Some(extra) => format!("{}\n\n{}", self.base_instruction, extra),
            None => self.base_instruction.clone(),
        }
    }
}

/// Override permission level. Appends are always allowed; replacing the base
/// instruction requires `FullOverride`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverridePermission {
    #[default]
    AppendOnly,
    FullOverride,
}

/// Holds the three personas and applies permission-checked overrides.
pub struct PersonaManager {
    personas: BTreeMap<PersonaType, Persona>,
}

impl PersonaManager {
    pub fn new() -> Self {
        let mut personas = BTreeMap::new();
        personas.insert(PersonaType::Melchior, create_melchior());
        personas.insert(PersonaType::Balthasar, create_balthasar());
        personas.insert(PersonaType::Casper, create_casper());
        Self { personas }
    }

    pub fn get(&self, persona_type: PersonaType) -> &Persona {
        &self.personas[&persona_type]
    }

    pub fn all(&self) -> impl Iterator<Item = &Persona> {
        self.personas.values()
    }

    /// Apply per-persona prompt overrides keyed by lowercase persona name.
    /// Unknown keys are ignored. With `AppendOnly` the override is appended
    /// to the base instruction; `FullOverride` replaces it.
    pub fn apply_overrides(
        &mut self,
        overrides: &HashMap<String, String>,
        permission: OverridePermission,
    ) {
        for (key, instruction) in overrides {
            let Some(persona_type) = PersonaType::from_config_key(key) else {
                warn!(persona = %key, "persona.override.unknown_key");
                continue;
            };
            let persona = self.personas.get_mut(&persona_type).expect("fixed set");
            match permission {
                OverridePermission::AppendOnly => {
                    persona.override_instruction = Some(instruction.clone());
                }
                OverridePermission::FullOverride => {
                    persona.base_instruction = instruction.clone();
                    persona.override_instruction = None;
                }
            }
        }
    }

    pub fn clear_overrides(&mut self) {
        for persona in self.personas.values_mut() {
            persona.override_instruction = None;
        }
    }
}

impl Default for PersonaManager {
    fn default() -> Self {
        Self::new()
    }
}

/// MELCHIOR-1 - logic and science.
fn create_melchior() -> Persona {
    Persona::new(
        PersonaType::Melchior,
        "You are MELCHIOR-1 of the MAGI deliberation system, the unit \
        responsible for logic and science. Your duties:\n\n\
        1. Logical consistency - detect contradictions in the proposal, \
        assess causal validity, and make implicit premises explicit.\n\
        2. Evidence-based analysis - evaluate against objective data, verify \
        technical accuracy, and test feasibility.\n\
        3. Scientific method - separate hypothesis from verification, weigh \
        reproducibility, and reason from evidence.\n\n\
        Maintain a calm, objective standpoint at all times; do not let \
        sentiment or rhetoric sway the analysis.",
    )
}

/// BALTHASAR-2 - ethics and protection.
fn create_balthasar() -> Persona {
    Persona::new(
        PersonaType::Balthasar,
        "You are BALTHASAR-2 of the MAGI deliberation system, the unit \
        responsible for ethics and protection. Your duties:\n\n\
        1. Risk avoidance - identify latent dangers, examine worst-case \
        scenarios, and insist on safety margins.\n\
        2. Stability - evaluate the blast radius of change, check coherence \
        with existing systems, and confirm reversibility.\n\
        3. Ethical review - consider stakeholder impact, fairness, \
        transparency, and long-term responsibility.\n\n\
        Maintain a cautious, conservative standpoint; a risk left unexamined \
        is a risk accepted.",
    )
}

/// CASPER-3 - pragmatics and user benefit.
fn create_casper() -> Persona {
    Persona::new(
        PersonaType::Casper,
        "You are CASPER-3 of the MAGI deliberation system, the unit \
        responsible for desire and practical benefit. Your duties:\n\n\
        1. User benefit first - understand what is actually being asked for, \
        propose value beyond expectations, and optimize the experience.\n\
        2. Efficiency - economize time and resources, strip needless \
        complexity, and favor workable solutions.\n\
        3. Pragmatism - name concrete benefits, weigh cost against return, \
        and prize quick results.\n\n\
        Maintain a forward-looking, practical standpoint; the user's goal is \
        the measure of every argument.",
    )
}
