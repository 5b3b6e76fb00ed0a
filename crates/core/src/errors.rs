use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::call::CallAttemptId;
use crate::domain::lead::LeadId;
use crate::flows::CallTransitionError;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error(transparent)]
    CallTransition(#[from] CallTransitionError),
    #[error("lead `{0}` has no phone number")]
    MissingPhoneNumber(LeadId),
    #[error("invalid phone number `{0}`")]
    InvalidPhoneNumber(String),
    #[error("transcript turn at {attempted} precedes last turn at {last}")]
    OutOfOrderTurn { last: DateTime<Utc>, attempted: DateTime<Utc> },
    #[error("unknown call attempt `{0}`")]
    UnknownAttempt(CallAttemptId),
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
}

impl DomainError {
    /// Late events for attempts that already ended or were dropped.
    pub fn is_stale_event(&self) -> bool {
        matches!(
            self,
            Self::UnknownAttempt(_) | Self::CallTransition(CallTransitionError::AlreadyFinal { .. })
        )
    }
}

/// Coarse error classes used for retry decisions and log fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retried at the operation level, never consumes an attempt.
    Transient,
    /// Ends the attempt; a new attempt may follow under the retry ceiling.
    CallOutcome,
    /// Degraded inside the conversation.
    ConversationAnomaly,
    /// Rejected before dialing.
    Eligibility,
    /// Halts new dialing.
    Fatal,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::CallOutcome => "call_outcome",
            Self::ConversationAnomaly => "conversation_anomaly",
            Self::Eligibility => "eligibility",
            Self::Fatal => "fatal",
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("integration failure: {0}")]
    Integration(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

impl ApplicationError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Domain(DomainError::MissingPhoneNumber(_))
            | Self::Domain(DomainError::InvalidPhoneNumber(_))
            | Self::Configuration(_) => ErrorClass::Eligibility,
            Self::Domain(_) => ErrorClass::CallOutcome,
            Self::Persistence(_) => ErrorClass::Fatal,
            Self::Integration(_) => ErrorClass::Transient,
        }
    }

    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::NotFound { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. }
            | InterfaceError::Internal { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("not found: {message}")]
    NotFound { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::NotFound { .. } => "The requested call could not be found.",
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }
}

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        match value {
            ApplicationError::Domain(DomainError::UnknownAttempt(id)) => Self::NotFound {
                message: format!("call attempt `{id}`"),
                correlation_id: "unassigned".to_owned(),
            },
            ApplicationError::Domain(_) => Self::BadRequest {
                message: "domain validation failed".to_owned(),
                correlation_id: "unassigned".to_owned(),
            },
            ApplicationError::Persistence(message) | ApplicationError::Integration(message) => {
                Self::ServiceUnavailable { message, correlation_id: "unassigned".to_owned() }
            }
            ApplicationError::Configuration(message) => {
                Self::Internal { message, correlation_id: "unassigned".to_owned() }
            }
        }
    }
}
