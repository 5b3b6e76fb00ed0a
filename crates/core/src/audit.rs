use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::call::{CallAttemptId, CallState};
use crate::domain::lead::LeadId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransitionId(pub String);

/// One immutable entry of the call transition log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub id: TransitionId,
    pub lead_id: LeadId,
    pub attempt_id: CallAttemptId,
    /// `None` only for the entry that creates the attempt.
    pub from_state: Option<CallState>,
    pub to_state: CallState,
    pub cause: String,
    /// Strictly increasing per attempt, starting at 1.
    pub sequence: u32,
    pub metadata: BTreeMap<String, String>,
    pub occurred_at: DateTime<Utc>,
}

impl TransitionRecord {
    pub fn new(
        lead_id: LeadId,
        attempt_id: CallAttemptId,
        from_state: Option<CallState>,
        to_state: CallState,
        cause: impl Into<String>,
        sequence: u32,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TransitionId(Uuid::new_v4().to_string()),
            lead_id,
            attempt_id,
            from_state,
            to_state,
            cause: cause.into(),
            sequence,
            metadata: BTreeMap::new(),
            occurred_at,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum HistoryViolation {
    #[error("attempt has no transitions")]
    Empty,
    #[error("history must start with creation into Queued")]
    BadStart,
    #[error("entry {sequence} does not continue from the previous state")]
    Discontinuous { sequence: u32 },
    #[error("entry {sequence} is out of order")]
    OutOfOrder { sequence: u32 },
    #[error("history enters {count} outcome states")]
    OutcomeCount { count: usize },
    #[error("scheduled must directly follow qualified")]
    ScheduledWithoutQualified,
}

/// Checks one attempt's history: starts at `Queued`, is ordered and
/// contiguous, and enters exactly one outcome state (plus an optional
/// `Scheduled` after `Qualified`). Histories of in-flight attempts with no
/// outcome yet are accepted when `require_outcome` is false.
pub fn verify_history(
    records: &[TransitionRecord],
    require_outcome: bool,
) -> Result<(), HistoryViolation> {
    let first = records.first().ok_or(HistoryViolation::Empty)?;
    if first.from_state.is_some() || first.to_state != CallState::Queued {
        return Err(HistoryViolation::BadStart);
    }

    for pair in records.windows(2) {
        let (previous, next) = (&pair[0], &pair[1]);
        if next.sequence <= previous.sequence || next.occurred_at < previous.occurred_at {
            return Err(HistoryViolation::OutOfOrder { sequence: next.sequence });
        }
        if next.from_state != Some(previous.to_state) {
            return Err(HistoryViolation::Discontinuous { sequence: next.sequence });
        }
        if next.to_state == CallState::Scheduled && previous.to_state != CallState::Qualified {
            return Err(HistoryViolation::ScheduledWithoutQualified);
        }
    }

    let outcomes = records.iter().filter(|record| record.to_state.is_outcome()).count();
    if outcomes > 1 || (require_outcome && outcomes == 0) {
        return Err(HistoryViolation::OutcomeCount { count: outcomes });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use crate::audit::{verify_history, HistoryViolation, TransitionRecord};
    use crate::domain::call::{CallAttemptId, CallState};
    use crate::domain::lead::LeadId;

    fn history(states: &[CallState]) -> Vec<TransitionRecord> {
        let start = Utc::now();
        let mut previous = None;
        states
            .iter()
            .enumerate()
            .map(|(index, state)| {
                let record = TransitionRecord::new(
                    LeadId("lead-1".to_owned()),
                    CallAttemptId("attempt-1".to_owned()),
                    previous,
                    *state,
                    "test",
                    index as u32 + 1,
                    start + Duration::seconds(index as i64),
                );
                previous = Some(*state);
                record
            })
            .collect()
    }

    #[test]
    fn complete_history_is_accepted() {
        let records = history(&[
            CallState::Queued,
            CallState::Dialing,
            CallState::Connected,
            CallState::Conversing,
            CallState::Qualified,
            CallState::Scheduled,
        ]);
        assert_eq!(verify_history(&records, true), Ok(()));
    }

    #[test]
    fn two_outcomes_are_rejected() {
        let records = history(&[
            CallState::Queued,
            CallState::Dialing,
            CallState::NoAnswer,
            CallState::Failed,
        ]);
        assert_eq!(
            verify_history(&records, true),
            Err(HistoryViolation::OutcomeCount { count: 2 })
        );
    }

    #[test]
    fn in_flight_history_needs_no_outcome_unless_required() {
        let records = history(&[CallState::Queued, CallState::Dialing]);
        assert_eq!(verify_history(&records, false), Ok(()));
        assert!(verify_history(&records, true).is_err());
        assert_eq!(verify_history(&[], false), Err(HistoryViolation::Empty));
    }
}
