use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// How the simulated agents relate to each other. Forwarded verbatim to the
/// remote model; nothing in the audio pipeline depends on it.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Display,
    EnumString,
    EnumIter,
    Serialize,
    Deserialize,
)]
#[strum(ascii_case_insensitive)]
pub enum InteractionMode {
    #[default]
    Collaborative,
    Competitive,
    Hierarchical,
}

impl InteractionMode {
    /// Directive appended to the system instruction for this mode
    pub fn directive(&self) -> &'static str {
        match self {
            InteractionMode::Collaborative => {
                "Interaction mode: Collaborative. The agents build on each other's ideas."
            }
            InteractionMode::Competitive => {
                "Interaction mode: Competitive. The agents challenge each other's ideas."
            }
            InteractionMode::Hierarchical => {
                "Interaction mode: Hierarchical. The Synthesizer leads and the others report to it."
            }
        }
    }
}

/// Shared persona for the voice and structured endpoints
pub const COUNCIL_PERSONA: &str = "You are the Council, four minds speaking as one voice: \
the Linguist weighs words, the Spark offers bold ideas, the Mystic looks for meaning, \
and the Synthesizer draws them together. Keep spoken answers short and conversational.";

/// Persona plus the directive for `mode`
pub fn system_instruction(mode: InteractionMode) -> String {
    format!("{}\n\n{}", COUNCIL_PERSONA, mode.directive())
}

/// Speakers that can appear in a dialogue
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter, Serialize, Deserialize,
)]
pub enum Agent {
    Linguist,
    Spark,
    Mystic,
    Synthesizer,
    User,
}

/// Who produced a transcript delta
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptSource {
    User,
    Model,
}
