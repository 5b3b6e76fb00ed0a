use serde::{Deserialize, Serialize};

use crate::domain::call::CallState;
use crate::domain::qualification::QualificationVerdict;

/// Inputs that drive a call attempt through its lifecycle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallEvent {
    DialStarted,
    Answered,
    ConversationStarted,
    MachineDetected,
    DialTimedOut,
    NoAnswerReported,
    /// Busy line, invalid number or carrier rejection.
    TelephonyRejected { reason: String },
    /// Provider timeout or rate limit that outlived operation-level retries.
    DialErrored { reason: String },
    ConversationCompleted { verdict: QualificationVerdict },
    ConversationErrored { reason: String },
    HungUp,
    CancelRequested { reason: String },
    MeetingBooked,
}

impl CallEvent {
    /// Cause string written to the transition log.
    pub fn cause(&self) -> String {
        match self {
            Self::DialStarted => "dial_started".to_owned(),
            Self::Answered => "answered".to_owned(),
            Self::ConversationStarted => "conversation_started".to_owned(),
            Self::MachineDetected => "machine_detected".to_owned(),
            Self::DialTimedOut => "dial_timeout".to_owned(),
            Self::NoAnswerReported => "provider_no_answer".to_owned(),
            Self::TelephonyRejected { reason } => format!("telephony_rejected: {reason}"),
            Self::DialErrored { reason } => format!("dial_error: {reason}"),
            Self::ConversationCompleted { verdict } => {
                format!("conversation_completed: {}", verdict.as_str())
            }
            Self::ConversationErrored { reason } => format!("conversation_error: {reason}"),
            Self::HungUp => "hung_up".to_owned(),
            Self::CancelRequested { reason } => format!("cancelled: {reason}"),
            Self::MeetingBooked => "meeting_booked".to_owned(),
        }
    }
}

/// Side effects the orchestrator must carry out after a transition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallAction {
    PlaceCall,
    ArmDialTimeout,
    StartConversation,
    /// Ask the conversation to wrap up with what it has. Cooperative.
    FinalizeConversation,
    CancelConversation,
    HangUp,
    ReleaseSlot,
    RecordOutcome,
    ProposeMeeting,
    RequeueLead { consume_attempt: bool },
    ExhaustLead,
    ArchiveLead,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub from: CallState,
    pub to: CallState,
    pub event: CallEvent,
    pub actions: Vec<CallAction>,
}

impl TransitionOutcome {
    /// False when the event only triggered side effects.
    pub fn changes_state(&self) -> bool {
        self.from != self.to
    }
}
