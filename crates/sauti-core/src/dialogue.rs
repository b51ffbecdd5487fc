//! Per-session dialogue history and state.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Session control-flow states. `Interrupted` is transient and never
/// observable at rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DialogueState {
    Idle,
    Listening,
    Transcribing,
    Generating,
    Speaking,
    Interrupted,
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// Textual or multimodal turn content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnPayload {
    Text(String),
    /// A user turn that carried an image alongside its text query.
    Multimodal { text: String, image_format: String },
}

impl TurnPayload {
    pub fn text(&self) -> &str {
        match self {
            TurnPayload::Text(t) => t,
            TurnPayload::Multimodal { text, .. } => text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub role: Role,
    pub payload: TurnPayload,
}

impl Turn {
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            payload: TurnPayload::Text(text.into()),
        }
    }
}

/// Ordered dialogue turns, bounded by a maximum count. The system prompt
/// occupies turn 0 and is never evicted; the oldest non-system turn goes
/// first.
#[derive(Debug, Clone)]
pub struct DialogueHistory {
    turns: VecDeque<Turn>,
    max_turns: usize,
}

impl DialogueHistory {
    pub fn new(system_prompt: impl Into<String>, max_turns: usize) -> Self {
        let mut turns = VecDeque::with_capacity(max_turns.max(2));
        turns.push_back(Turn::text(Role::System, system_prompt));
        Self {
            turns,
            max_turns: max_turns.max(2),
        }
    }

    pub fn push(&mut self, turn: Turn) {
        self.turns.push_back(turn);
        while self.turns.len() > self.max_turns {
            // Index 0 is the pinned system turn.
            let _ = self.turns.remove(1);
        }
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn turns(&self) -> impl Iterator<Item = &Turn> {
        self.turns.iter()
    }

    /// Snapshot for a provider call: `(role, text)` pairs in order.
    pub fn snapshot(&self) -> Vec<(Role, String)> {
        self.turns
            .iter()
            .map(|t| (t.role, t.payload.text().to_string()))
            .collect()
    }
}
