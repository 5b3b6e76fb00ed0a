//! Interfaces to the systems the dialer calls into.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::call::CallAttemptId;
use crate::domain::lead::{LeadId, PhoneNumber, RawLead};
use crate::domain::qualification::MeetingSlot;
use crate::flows::CallEvent;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CollaboratorError {
    /// Timeouts, rate limits, 5xx. Safe to retry.
    #[error("transient collaborator failure: {0}")]
    Transient(String),
    /// The collaborator refused the request. Retrying will not help.
    #[error("collaborator rejected request: {0}")]
    Rejected(String),
}

impl CollaboratorError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

#[async_trait]
pub trait LeadSource: Send + Sync {
    async fn fetch_new_leads(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<RawLead>, CollaboratorError>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceCallRequest {
    pub attempt_id: CallAttemptId,
    pub lead_id: LeadId,
    pub to: PhoneNumber,
    /// Where the provider fetches call instructions once answered.
    pub callback_url: String,
    pub status_callback_url: String,
    pub ring_timeout_secs: u64,
}

#[async_trait]
pub trait TelephonyProvider: Send + Sync {
    /// Returns the provider's call id.
    async fn place_call(&self, request: PlaceCallRequest) -> Result<String, CollaboratorError>;

    async fn hang_up(&self, provider_call_id: &str) -> Result<(), CollaboratorError>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeetingRequest {
    pub lead_id: LeadId,
    pub attempt_id: CallAttemptId,
    pub lead_name: String,
    pub phone: PhoneNumber,
    pub email: Option<String>,
    pub availability: Option<String>,
    pub requested_at: DateTime<Utc>,
}

#[async_trait]
pub trait SchedulingService: Send + Sync {
    async fn propose_slot(&self, request: MeetingRequest)
        -> Result<MeetingSlot, CollaboratorError>;
}

/// Call status values reported by the telephony provider's status callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TelephonyStatus {
    Queued,
    Initiated,
    Ringing,
    InProgress,
    Completed,
    Busy,
    Failed,
    NoAnswer,
    Canceled,
}

impl TelephonyStatus {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "queued" => Some(Self::Queued),
            "initiated" => Some(Self::Initiated),
            "ringing" => Some(Self::Ringing),
            "in-progress" | "answered" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "busy" => Some(Self::Busy),
            "failed" => Some(Self::Failed),
            "no-answer" => Some(Self::NoAnswer),
            "canceled" | "cancelled" => Some(Self::Canceled),
            _ => None,
        }
    }

    /// Maps a status callback to the call event it triggers, if any.
    /// `answered_by` carries the provider's answering machine detection.
    pub fn to_event(self, answered_by: Option<&str>) -> Option<CallEvent> {
        match self {
            Self::Queued | Self::Initiated | Self::Ringing => None,
            Self::InProgress => {
                let machine = answered_by
                    .map(|value| value.trim().to_ascii_lowercase().starts_with("machine"))
                    .unwrap_or(false);
                Some(if machine { CallEvent::MachineDetected } else { CallEvent::Answered })
            }
            Self::Completed | Self::Canceled => Some(CallEvent::HungUp),
            Self::Busy => Some(CallEvent::TelephonyRejected { reason: "busy".to_owned() }),
            Self::Failed => Some(CallEvent::TelephonyRejected { reason: "failed".to_owned() }),
            Self::NoAnswer => Some(CallEvent::NoAnswerReported),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::TelephonyStatus;
    use crate::flows::CallEvent;

    #[test]
    fn provider_statuses_map_to_call_events() {
        assert_eq!(TelephonyStatus::parse("ringing").and_then(|s| s.to_event(None)), None);
        assert_eq!(
            TelephonyStatus::parse("in-progress").and_then(|s| s.to_event(Some("human"))),
            Some(CallEvent::Answered)
        );
        assert_eq!(
            TelephonyStatus::parse("answered").and_then(|s| s.to_event(Some("machine_start"))),
            Some(CallEvent::MachineDetected)
        );
        assert_eq!(
            TelephonyStatus::parse("no_answer").and_then(|s| s.to_event(None)),
            Some(CallEvent::NoAnswerReported)
        );
        assert!(matches!(
            TelephonyStatus::parse("busy").and_then(|s| s.to_event(None)),
            Some(CallEvent::TelephonyRejected { .. })
        ));
        assert_eq!(TelephonyStatus::parse("exploded"), None);
    }
}
