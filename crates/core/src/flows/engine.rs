use thiserror::Error;

use crate::domain::call::CallState;
use crate::domain::qualification::QualificationVerdict;
use crate::flows::states::{CallAction, CallEvent, TransitionOutcome};

/// Pure transition function for a single call attempt.
#[derive(Clone, Debug, Default)]
pub struct CallFlowEngine;

impl CallFlowEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn initial_state(&self) -> CallState {
        CallState::Queued
    }

    pub fn apply(
        &self,
        current: &CallState,
        event: &CallEvent,
    ) -> Result<TransitionOutcome, CallTransitionError> {
        transition_call(current, event)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CallTransitionError {
    #[error("call attempt is already final in {state:?}")]
    AlreadyFinal { state: CallState },
    #[error("invalid transition from {state:?} using event {event:?}")]
    InvalidTransition { state: CallState, event: CallEvent },
}

fn transition_call(
    current: &CallState,
    event: &CallEvent,
) -> Result<TransitionOutcome, CallTransitionError> {
    use CallAction::{
        ArchiveLead, ArmDialTimeout, CancelConversation, ExhaustLead, FinalizeConversation,
        HangUp, PlaceCall, ProposeMeeting, RecordOutcome, ReleaseSlot, RequeueLead,
        StartConversation,
    };
    use CallEvent::{
        Answered, CancelRequested, ConversationCompleted, ConversationErrored,
        ConversationStarted, DialErrored, DialStarted, DialTimedOut, HungUp as LeadHungUp,
        MachineDetected, MeetingBooked, NoAnswerReported, TelephonyRejected,
    };
    use CallState::{
        Connected, Conversing, Dialing, Disqualified, Failed, NoAnswer, Qualified, Queued,
        Scheduled, Voicemail,
    };

    if current.is_final() {
        return Err(CallTransitionError::AlreadyFinal { state: *current });
    }

    let retry =
        |consume_attempt: bool| vec![ReleaseSlot, RecordOutcome, RequeueLead { consume_attempt }];
    let hang_up_and_retry = |consume_attempt: bool| {
        vec![HangUp, ReleaseSlot, RecordOutcome, RequeueLead { consume_attempt }]
    };

    let (to, actions) = match (current, event) {
        (Queued, DialStarted) => (Dialing, vec![PlaceCall, ArmDialTimeout]),
        (Queued, CancelRequested { .. }) => {
            (Failed, vec![RecordOutcome, RequeueLead { consume_attempt: false }])
        }

        (Dialing, Answered) => (Connected, Vec::new()),
        (Dialing, DialTimedOut) | (Dialing, NoAnswerReported) => {
            (NoAnswer, hang_up_and_retry(true))
        }
        (Dialing, MachineDetected) | (Connected, MachineDetected) => {
            (Voicemail, hang_up_and_retry(true))
        }
        (Dialing, TelephonyRejected { .. }) => {
            (Failed, vec![ReleaseSlot, RecordOutcome, ExhaustLead])
        }
        (Dialing, DialErrored { .. }) => (Failed, retry(false)),
        (Dialing, LeadHungUp) | (Connected, LeadHungUp) => (Failed, retry(true)),
        (Dialing, CancelRequested { .. }) | (Connected, CancelRequested { .. }) => {
            (Failed, hang_up_and_retry(false))
        }

        (Connected, ConversationStarted) => (Conversing, vec![StartConversation]),

        (Conversing, ConversationCompleted { verdict }) => match verdict {
            QualificationVerdict::Qualified => {
                (Qualified, vec![ReleaseSlot, RecordOutcome, ArchiveLead, ProposeMeeting])
            }
            QualificationVerdict::Disqualified => {
                (Disqualified, vec![ReleaseSlot, RecordOutcome, ArchiveLead])
            }
            QualificationVerdict::Inconclusive => (Failed, retry(true)),
        },
        (Conversing, ConversationErrored { .. }) => (Failed, hang_up_and_retry(true)),
        (Conversing, LeadHungUp) => (Conversing, vec![FinalizeConversation]),
        (Conversing, CancelRequested { .. }) => (Conversing, vec![CancelConversation]),

        (Qualified, MeetingBooked) => (Scheduled, vec![RecordOutcome]),

        _ => {
            return Err(CallTransitionError::InvalidTransition {
                state: *current,
                event: event.clone(),
            });
        }
    };

    Ok(TransitionOutcome { from: *current, to, event: event.clone(), actions })
}
