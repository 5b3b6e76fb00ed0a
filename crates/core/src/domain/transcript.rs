use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::DomainError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    Agent,
    Lead,
}

/// Rubric signal detected in a single lead turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    ExpressedInterest,
    Objection,
    AvailabilityMentioned,
    ExplicitAgreement,
    ExplicitDecline,
    Unclear,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExpressedInterest => "expressed_interest",
            Self::Objection => "objection",
            Self::AvailabilityMentioned => "availability_mentioned",
            Self::ExplicitAgreement => "explicit_agreement",
            Self::ExplicitDecline => "explicit_decline",
            Self::Unclear => "unclear",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub speaker: Speaker,
    pub text: String,
    pub at: DateTime<Utc>,
    pub intents: Vec<Intent>,
}

/// Append-only record of a call's dialogue.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transcript {
    turns: Vec<Turn>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a turn. Turns must arrive in non-decreasing timestamp order.
    pub fn append(&mut self, turn: Turn) -> Result<(), DomainError> {
        if let Some(last) = self.turns.last() {
            if turn.at < last.at {
                return Err(DomainError::OutOfOrderTurn { last: last.at, attempted: turn.at });
            }
        }
        self.turns.push(turn);
        Ok(())
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn lead_turns(&self) -> impl Iterator<Item = &Turn> {
        self.turns.iter().filter(|turn| turn.speaker == Speaker::Lead)
    }

    /// The trailing `limit` turns, oldest first.
    pub fn recent(&self, limit: usize) -> &[Turn] {
        let start = self.turns.len().saturating_sub(limit);
        &self.turns[start..]
    }
}
