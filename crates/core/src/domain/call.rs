use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::lead::LeadId;
use crate::domain::qualification::{MeetingSlot, QualificationResult};
use crate::domain::transcript::Transcript;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallAttemptId(pub String);

impl CallAttemptId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for CallAttemptId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Queued,
    Dialing,
    Connected,
    Conversing,
    Qualified,
    Disqualified,
    NoAnswer,
    Voicemail,
    Failed,
    Scheduled,
}

impl CallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Dialing => "dialing",
            Self::Connected => "connected",
            Self::Conversing => "conversing",
            Self::Qualified => "qualified",
            Self::Disqualified => "disqualified",
            Self::NoAnswer => "no_answer",
            Self::Voicemail => "voicemail",
            Self::Failed => "failed",
            Self::Scheduled => "scheduled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "queued" => Some(Self::Queued),
            "dialing" => Some(Self::Dialing),
            "connected" => Some(Self::Connected),
            "conversing" => Some(Self::Conversing),
            "qualified" => Some(Self::Qualified),
            "disqualified" => Some(Self::Disqualified),
            "no_answer" => Some(Self::NoAnswer),
            "voicemail" => Some(Self::Voicemail),
            "failed" => Some(Self::Failed),
            "scheduled" => Some(Self::Scheduled),
            _ => None,
        }
    }

    /// States that end the call itself. `Scheduled` is reached only from
    /// `Qualified` and is terminal as well.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Queued | Self::Dialing | Self::Connected | Self::Conversing)
    }

    /// The five call outcomes a conversation can end in.
    pub fn is_outcome(&self) -> bool {
        matches!(
            self,
            Self::Qualified | Self::Disqualified | Self::NoAnswer | Self::Voicemail | Self::Failed
        )
    }

    /// Terminal states that accept no further event at all.
    pub fn is_final(&self) -> bool {
        self.is_terminal() && *self != Self::Qualified
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Consumes an attempt; the lead may be retried under the ceiling.
    Retryable,
    /// Infrastructure trouble before the call was placed. No attempt consumed.
    Transient,
    /// Busy, invalid number or carrier rejection. The lead is exhausted.
    Rejected,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retryable => "retryable",
            Self::Transient => "transient",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "retryable" => Some(Self::Retryable),
            "transient" => Some(Self::Transient),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallFailure {
    pub kind: FailureKind,
    pub reason: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallAttempt {
    pub id: CallAttemptId,
    pub lead_id: LeadId,
    pub state: CallState,
    /// 0 for the first attempt, n for the n-th retry.
    pub retry_count: u32,
    pub provider_call_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub dial_started_at: Option<DateTime<Utc>>,
    pub connected_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub failure: Option<CallFailure>,
    pub transcript: Option<Transcript>,
    pub qualification: Option<QualificationResult>,
    pub meeting: Option<MeetingSlot>,
    pub schedule_retries: u32,
    pub state_version: u32,
}

impl CallAttempt {
    pub fn new(lead_id: LeadId, retry_count: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: CallAttemptId::generate(),
            lead_id,
            state: CallState::Queued,
            retry_count,
            provider_call_id: None,
            created_at: now,
            dial_started_at: None,
            connected_at: None,
            ended_at: None,
            last_heartbeat_at: now,
            failure: None,
            transcript: None,
            qualification: None,
            meeting: None,
            schedule_retries: 0,
            state_version: 1,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }

    pub fn duration_seconds(&self) -> Option<i64> {
        match (self.connected_at, self.ended_at) {
            (Some(start), Some(end)) => Some((end - start).num_seconds().max(0)),
            _ => None,
        }
    }
}
