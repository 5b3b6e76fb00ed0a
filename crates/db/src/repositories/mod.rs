use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use setter_core::audit::TransitionRecord;
use setter_core::domain::call::{CallAttempt, CallAttemptId, CallState};
use setter_core::domain::lead::LeadId;

pub mod call_record;
pub mod dead_letter;
pub mod memory;
pub mod transition_log;

mod codec;

pub use call_record::SqlCallRecordRepository;
pub use dead_letter::SqlDeadLetterRepository;
pub use memory::{
    InMemoryCallRecordRepository, InMemoryDeadLetterRepository, InMemoryTransitionLogRepository,
};
pub use transition_log::SqlTransitionLogRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("attempt `{attempt_id}` is still {state:?} and cannot be recorded")]
    NotTerminal { attempt_id: CallAttemptId, state: CallState },
    #[error("transition {sequence} for attempt `{attempt_id}` was already logged")]
    DuplicateTransition { attempt_id: CallAttemptId, sequence: u32 },
}

/// What happened when a terminal attempt was handed to the call record store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordWrite {
    /// First time this attempt was recorded.
    Stored,
    /// A `Qualified` record became `Scheduled`.
    Upgraded,
    /// Already recorded in this or a later state. Nothing changed.
    Duplicate,
}

/// Terminal call attempt as stored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallRecord {
    pub attempt: CallAttempt,
    pub recorded_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome that could not be persisted after every retry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeadLetter {
    pub attempt_id: CallAttemptId,
    pub lead_id: LeadId,
    pub state: CallState,
    /// The full attempt, so it can be replayed by hand.
    pub payload_json: String,
    pub last_error: String,
    pub attempts: u32,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(
        attempt: &CallAttempt,
        last_error: impl Into<String>,
        attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<Self, RepositoryError> {
        Ok(Self {
            attempt_id: attempt.id.clone(),
            lead_id: attempt.lead_id.clone(),
            state: attempt.state,
            payload_json: serde_json::to_string(attempt)?,
            last_error: last_error.into(),
            attempts,
            dead_lettered_at: now,
        })
    }
}

/// Append-only transition log.
#[async_trait]
pub trait TransitionLogRepository: Send + Sync {
    async fn append(&self, record: &TransitionRecord) -> Result<(), RepositoryError>;

    /// One attempt's history in sequence order.
    async fn list_for_attempt(
        &self,
        attempt_id: &CallAttemptId,
    ) -> Result<Vec<TransitionRecord>, RepositoryError>;

    async fn list_for_lead(&self, lead_id: &LeadId)
        -> Result<Vec<TransitionRecord>, RepositoryError>;
}

/// Terminal call records, keyed by attempt id.
#[async_trait]
pub trait CallRecordRepository: Send + Sync {
    /// Insert-if-absent. The only change ever applied to an existing record
    /// is `Qualified` to `Scheduled`.
    async fn record(
        &self,
        attempt: &CallAttempt,
        now: DateTime<Utc>,
    ) -> Result<RecordWrite, RepositoryError>;

    async fn find(&self, attempt_id: &CallAttemptId)
        -> Result<Option<CallRecord>, RepositoryError>;

    async fn list_for_lead(&self, lead_id: &LeadId) -> Result<Vec<CallRecord>, RepositoryError>;
}

#[async_trait]
pub trait DeadLetterRepository: Send + Sync {
    async fn push(&self, letter: &DeadLetter) -> Result<(), RepositoryError>;

    /// Most recent first.
    async fn list_recent(&self, limit: u32) -> Result<Vec<DeadLetter>, RepositoryError>;
}

/// Whether an incoming record for an already stored attempt may replace it.
pub(crate) fn is_upgrade(stored: CallState, incoming: CallState) -> bool {
    stored == CallState::Qualified && incoming == CallState::Scheduled
}
