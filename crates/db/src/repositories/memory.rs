//! In-memory repositories with the same semantics as the SQL ones.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use setter_core::audit::TransitionRecord;
use setter_core::domain::call::{CallAttempt, CallAttemptId};
use setter_core::domain::lead::LeadId;

use super::{
    is_upgrade, CallRecord, CallRecordRepository, DeadLetter, DeadLetterRepository, RecordWrite,
    RepositoryError, TransitionLogRepository,
};

#[derive(Default)]
pub struct InMemoryTransitionLogRepository {
    records: RwLock<Vec<TransitionRecord>>,
}

#[async_trait::async_trait]
impl TransitionLogRepository for InMemoryTransitionLogRepository {
    async fn append(&self, record: &TransitionRecord) -> Result<(), RepositoryError> {
        let mut records = self.records.write().await;
        let duplicate = records.iter().any(|existing| {
            existing.attempt_id == record.attempt_id && existing.sequence == record.sequence
        });
        if duplicate {
            return Err(RepositoryError::DuplicateTransition {
                attempt_id: record.attempt_id.clone(),
                sequence: record.sequence,
            });
        }
        records.push(record.clone());
        Ok(())
    }

    async fn list_for_attempt(
        &self,
        attempt_id: &CallAttemptId,
    ) -> Result<Vec<TransitionRecord>, RepositoryError> {
        let records = self.records.read().await;
        let mut matching: Vec<TransitionRecord> =
            records.iter().filter(|record| &record.attempt_id == attempt_id).cloned().collect();
        matching.sort_by_key(|record| record.sequence);
        Ok(matching)
    }

    async fn list_for_lead(
        &self,
        lead_id: &LeadId,
    ) -> Result<Vec<TransitionRecord>, RepositoryError> {
        let records = self.records.read().await;
        let mut matching: Vec<TransitionRecord> =
            records.iter().filter(|record| &record.lead_id == lead_id).cloned().collect();
        matching.sort_by(|a, b| {
            a.occurred_at
                .cmp(&b.occurred_at)
                .then_with(|| a.attempt_id.cmp(&b.attempt_id))
                .then(a.sequence.cmp(&b.sequence))
        });
        Ok(matching)
    }
}

#[derive(Default)]
pub struct InMemoryCallRecordRepository {
    records: RwLock<HashMap<CallAttemptId, CallRecord>>,
}

#[async_trait::async_trait]
impl CallRecordRepository for InMemoryCallRecordRepository {
    async fn record(
        &self,
        attempt: &CallAttempt,
        now: DateTime<Utc>,
    ) -> Result<RecordWrite, RepositoryError> {
        if !attempt.state.is_terminal() {
            return Err(RepositoryError::NotTerminal {
                attempt_id: attempt.id.clone(),
                state: attempt.state,
            });
        }

        let mut records = self.records.write().await;
        match records.get_mut(&attempt.id) {
            None => {
                records.insert(
                    attempt.id.clone(),
                    CallRecord { attempt: attempt.clone(), recorded_at: now, updated_at: now },
                );
                Ok(RecordWrite::Stored)
            }
            Some(stored) if is_upgrade(stored.attempt.state, attempt.state) => {
                stored.attempt.state = attempt.state;
                stored.attempt.meeting = attempt.meeting.clone();
                stored.attempt.schedule_retries = attempt.schedule_retries;
                stored.attempt.state_version = attempt.state_version;
                stored.updated_at = now;
                Ok(RecordWrite::Upgraded)
            }
            Some(_) => Ok(RecordWrite::Duplicate),
        }
    }

    async fn find(
        &self,
        attempt_id: &CallAttemptId,
    ) -> Result<Option<CallRecord>, RepositoryError> {
        Ok(self.records.read().await.get(attempt_id).cloned())
    }

    async fn list_for_lead(&self, lead_id: &LeadId) -> Result<Vec<CallRecord>, RepositoryError> {
        let records = self.records.read().await;
        let mut matching: Vec<CallRecord> =
            records.values().filter(|record| &record.attempt.lead_id == lead_id).cloned().collect();
        matching.sort_by(|a, b| {
            a.attempt
                .created_at
                .cmp(&b.attempt.created_at)
                .then_with(|| a.attempt.id.cmp(&b.attempt.id))
        });
        Ok(matching)
    }
}

#[derive(Default)]
pub struct InMemoryDeadLetterRepository {
    letters: RwLock<Vec<DeadLetter>>,
}

#[async_trait::async_trait]
impl DeadLetterRepository for InMemoryDeadLetterRepository {
    async fn push(&self, letter: &DeadLetter) -> Result<(), RepositoryError> {
        self.letters.write().await.push(letter.clone());
        Ok(())
    }

    async fn list_recent(&self, limit: u32) -> Result<Vec<DeadLetter>, RepositoryError> {
        let letters = self.letters.read().await;
        Ok(letters.iter().rev().take(limit as usize).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use setter_core::audit::TransitionRecord;
    use setter_core::domain::call::{CallAttempt, CallState};
    use setter_core::domain::lead::LeadId;

    use crate::repositories::{
        CallRecordRepository, InMemoryCallRecordRepository, InMemoryTransitionLogRepository,
        RecordWrite, RepositoryError, TransitionLogRepository,
    };

    #[tokio::test]
    async fn in_memory_call_records_follow_insert_if_absent() {
        let repo = InMemoryCallRecordRepository::default();
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 15, 0, 0).single().expect("timestamp");
        let mut attempt = CallAttempt::new(LeadId("lead-1".to_string()), 0, now);
        attempt.state = CallState::Qualified;

        assert_eq!(repo.record(&attempt, now).await.expect("record"), RecordWrite::Stored);
        assert_eq!(repo.record(&attempt, now).await.expect("record"), RecordWrite::Duplicate);

        attempt.state = CallState::Scheduled;
        let later = now + Duration::minutes(1);
        assert_eq!(repo.record(&attempt, later).await.expect("record"), RecordWrite::Upgraded);

        let stored = repo.find(&attempt.id).await.expect("find").expect("exists");
        assert_eq!(stored.attempt.state, CallState::Scheduled);
        assert_eq!((stored.recorded_at, stored.updated_at), (now, later));
    }

    #[tokio::test]
    async fn in_memory_log_rejects_replayed_sequence() {
        let repo = InMemoryTransitionLogRepository::default();
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 15, 0, 0).single().expect("timestamp");
        let attempt = CallAttempt::new(LeadId("lead-1".to_string()), 0, now);
        let record = TransitionRecord::new(
            attempt.lead_id.clone(),
            attempt.id.clone(),
            None,
            CallState::Queued,
            "lead_eligible",
            1,
            now,
        );

        repo.append(&record).await.expect("append");
        assert!(matches!(
            repo.append(&record).await,
            Err(RepositoryError::DuplicateTransition { sequence: 1, .. })
        ));
        assert_eq!(repo.list_for_attempt(&attempt.id).await.expect("list"), vec![record]);
    }
}
