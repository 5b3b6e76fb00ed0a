use std::collections::BTreeMap;

use sqlx::{sqlite::SqliteRow, Row};

use setter_core::audit::{TransitionId, TransitionRecord};
use setter_core::domain::call::CallAttemptId;
use setter_core::domain::lead::LeadId;

use super::codec::{parse_state, parse_timestamp, parse_u32};
use super::{RepositoryError, TransitionLogRepository};
use crate::DbPool;

pub struct SqlTransitionLogRepository {
    pool: DbPool,
}

impl SqlTransitionLogRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl TransitionLogRepository for SqlTransitionLogRepository {
    async fn append(&self, record: &TransitionRecord) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "INSERT INTO transition_log (
                id,
                attempt_id,
                lead_id,
                sequence,
                from_state,
                to_state,
                cause,
                metadata_json,
                occurred_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id.0)
        .bind(&record.attempt_id.0)
        .bind(&record.lead_id.0)
        .bind(i64::from(record.sequence))
        .bind(record.from_state.map(|state| state.as_str()))
        .bind(record.to_state.as_str())
        .bind(&record.cause)
        .bind(serde_json::to_string(&record.metadata)?)
        .bind(record.occurred_at.to_rfc3339())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(error)) if error.is_unique_violation() => {
                Err(RepositoryError::DuplicateTransition {
                    attempt_id: record.attempt_id.clone(),
                    sequence: record.sequence,
                })
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn list_for_attempt(
        &self,
        attempt_id: &CallAttemptId,
    ) -> Result<Vec<TransitionRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                id,
                attempt_id,
                lead_id,
                sequence,
                from_state,
                to_state,
                cause,
                metadata_json,
                occurred_at
             FROM transition_log
             WHERE attempt_id = ?
             ORDER BY sequence ASC",
        )
        .bind(&attempt_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(transition_from_row).collect()
    }

    async fn list_for_lead(
        &self,
        lead_id: &LeadId,
    ) -> Result<Vec<TransitionRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                id,
                attempt_id,
                lead_id,
                sequence,
                from_state,
                to_state,
                cause,
                metadata_json,
                occurred_at
             FROM transition_log
             WHERE lead_id = ?
             ORDER BY occurred_at ASC, attempt_id ASC, sequence ASC",
        )
        .bind(&lead_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(transition_from_row).collect()
    }
}

fn transition_from_row(row: SqliteRow) -> Result<TransitionRecord, RepositoryError> {
    let from_state = row
        .try_get::<Option<String>, _>("from_state")?
        .map(|value| parse_state("from_state", &value))
        .transpose()?;
    let to_state = parse_state("to_state", &row.try_get::<String, _>("to_state")?)?;
    let metadata_json = row.try_get::<String, _>("metadata_json")?;
    let metadata: BTreeMap<String, String> = serde_json::from_str(&metadata_json)
        .map_err(|error| {
            RepositoryError::Decode(format!("invalid transition metadata ({error})"))
        })?;

    Ok(TransitionRecord {
        id: TransitionId(row.try_get("id")?),
        lead_id: LeadId(row.try_get("lead_id")?),
        attempt_id: CallAttemptId(row.try_get("attempt_id")?),
        from_state,
        to_state,
        cause: row.try_get("cause")?,
        sequence: parse_u32("sequence", row.try_get("sequence")?)?,
        metadata,
        occurred_at: parse_timestamp("occurred_at", row.try_get("occurred_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};

    use setter_core::audit::{verify_history, TransitionRecord};
    use setter_core::domain::call::{CallAttemptId, CallState};
    use setter_core::domain::lead::LeadId;

    use super::SqlTransitionLogRepository;
    use crate::migrations;
    use crate::repositories::{RepositoryError, TransitionLogRepository};
    use crate::{connect_with_settings, DbPool};

    fn parse_ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value).expect("timestamp").with_timezone(&Utc)
    }

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    fn history(attempt: &str) -> Vec<TransitionRecord> {
        let lead_id = LeadId("lead-1".to_string());
        let attempt_id = CallAttemptId(attempt.to_string());
        vec![
            TransitionRecord::new(
                lead_id.clone(),
                attempt_id.clone(),
                None,
                CallState::Queued,
                "lead_eligible",
                1,
                parse_ts("2026-03-02T15:00:00Z"),
            ),
            TransitionRecord::new(
                lead_id.clone(),
                attempt_id.clone(),
                Some(CallState::Queued),
                CallState::Dialing,
                "slot_acquired",
                2,
                parse_ts("2026-03-02T15:00:01Z"),
            )
            .with_metadata("slots_in_use", "1"),
            TransitionRecord::new(
                lead_id,
                attempt_id,
                Some(CallState::Dialing),
                CallState::NoAnswer,
                "dial_timeout",
                3,
                parse_ts("2026-03-02T15:00:31Z"),
            ),
        ]
    }

    #[tokio::test]
    async fn attempt_history_reads_back_in_sequence_order() {
        let pool = setup_pool().await;
        let repo = SqlTransitionLogRepository::new(pool.clone());
        let records = history("attempt-1");

        for record in records.iter().rev() {
            repo.append(record).await.expect("append transition");
        }

        let stored = repo
            .list_for_attempt(&CallAttemptId("attempt-1".to_string()))
            .await
            .expect("list transitions");
        assert_eq!(stored, records);
        verify_history(&stored, true).expect("complete history");

        let by_lead =
            repo.list_for_lead(&LeadId("lead-1".to_string())).await.expect("list by lead");
        assert_eq!(by_lead.len(), 3);

        pool.close().await;
    }

    #[tokio::test]
    async fn duplicate_sequence_is_rejected() {
        let pool = setup_pool().await;
        let repo = SqlTransitionLogRepository::new(pool.clone());
        let records = history("attempt-2");
        repo.append(&records[0]).await.expect("append transition");

        let mut replay = records[1].clone();
        replay.sequence = 1;
        let error = repo.append(&replay).await.expect_err("duplicate sequence");
        assert!(matches!(error, RepositoryError::DuplicateTransition { sequence: 1, .. }));

        pool.close().await;
    }
}
