use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use setter_core::domain::call::{CallAttempt, CallAttemptId, CallState};
use setter_core::domain::lead::LeadId;

use super::codec::{
    parse_optional_json, parse_optional_timestamp, parse_state, parse_timestamp, parse_u32,
};
use super::{CallRecord, CallRecordRepository, RecordWrite, RepositoryError};
use crate::DbPool;

const SELECT_COLUMNS: &str = "SELECT
        attempt_id,
        lead_id,
        state,
        retry_count,
        provider_call_id,
        failure_json,
        transcript_json,
        qualification_json,
        meeting_json,
        schedule_retries,
        state_version,
        created_at,
        dial_started_at,
        connected_at,
        ended_at,
        last_heartbeat_at,
        recorded_at,
        updated_at
     FROM call_record";

pub struct SqlCallRecordRepository {
    pool: DbPool,
}

impl SqlCallRecordRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn to_json<T: serde::Serialize>(value: &Option<T>) -> Result<Option<String>, RepositoryError> {
    value.as_ref().map(serde_json::to_string).transpose().map_err(RepositoryError::from)
}

#[async_trait::async_trait]
impl CallRecordRepository for SqlCallRecordRepository {
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

        let failure_json = to_json(&attempt.failure)?;
        let transcript_json = to_json(&attempt.transcript)?;
        let qualification_json = to_json(&attempt.qualification)?;
        let meeting_json = to_json(&attempt.meeting)?;

        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            "INSERT INTO call_record (
                attempt_id,
                lead_id,
                state,
                retry_count,
                provider_call_id,
                failure_json,
                transcript_json,
                qualification_json,
                meeting_json,
                schedule_retries,
                state_version,
                created_at,
                dial_started_at,
                connected_at,
                ended_at,
                last_heartbeat_at,
                recorded_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(attempt_id) DO NOTHING",
        )
        .bind(&attempt.id.0)
        .bind(&attempt.lead_id.0)
        .bind(attempt.state.as_str())
        .bind(i64::from(attempt.retry_count))
        .bind(attempt.provider_call_id.as_deref())
        .bind(failure_json)
        .bind(transcript_json)
        .bind(qualification_json)
        .bind(meeting_json.as_deref())
        .bind(i64::from(attempt.schedule_retries))
        .bind(i64::from(attempt.state_version))
        .bind(attempt.created_at.to_rfc3339())
        .bind(attempt.dial_started_at.map(|value| value.to_rfc3339()))
        .bind(attempt.connected_at.map(|value| value.to_rfc3339()))
        .bind(attempt.ended_at.map(|value| value.to_rfc3339()))
        .bind(attempt.last_heartbeat_at.to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let write = if inserted > 0 {
            RecordWrite::Stored
        } else if attempt.state == CallState::Scheduled {
            let upgraded = sqlx::query(
                "UPDATE call_record
                 SET state = ?,
                     meeting_json = ?,
                     schedule_retries = ?,
                     state_version = ?,
                     updated_at = ?
                 WHERE attempt_id = ? AND state = ?",
            )
            .bind(attempt.state.as_str())
            .bind(meeting_json.as_deref())
            .bind(i64::from(attempt.schedule_retries))
            .bind(i64::from(attempt.state_version))
            .bind(now.to_rfc3339())
            .bind(&attempt.id.0)
            .bind(CallState::Qualified.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if upgraded > 0 {
                RecordWrite::Upgraded
            } else {
                RecordWrite::Duplicate
            }
        } else {
            RecordWrite::Duplicate
        };

        tx.commit().await?;
        Ok(write)
    }

    async fn find(
        &self,
        attempt_id: &CallAttemptId,
    ) -> Result<Option<CallRecord>, RepositoryError> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE attempt_id = ?"))
            .bind(&attempt_id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(record_from_row).transpose()
    }

    async fn list_for_lead(&self, lead_id: &LeadId) -> Result<Vec<CallRecord>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE lead_id = ? ORDER BY created_at ASC, attempt_id ASC"
        ))
        .bind(&lead_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(record_from_row).collect()
    }
}

fn record_from_row(row: SqliteRow) -> Result<CallRecord, RepositoryError> {
    let attempt = CallAttempt {
        id: CallAttemptId(row.try_get("attempt_id")?),
        lead_id: LeadId(row.try_get("lead_id")?),
        state: parse_state("state", &row.try_get::<String, _>("state")?)?,
        retry_count: parse_u32("retry_count", row.try_get("retry_count")?)?,
        provider_call_id: row.try_get("provider_call_id")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        dial_started_at: parse_optional_timestamp(
            "dial_started_at",
            row.try_get("dial_started_at")?,
        )?,
        connected_at: parse_optional_timestamp("connected_at", row.try_get("connected_at")?)?,
        ended_at: parse_optional_timestamp("ended_at", row.try_get("ended_at")?)?,
        last_heartbeat_at: parse_timestamp("last_heartbeat_at", row.try_get("last_heartbeat_at")?)?,
        failure: parse_optional_json("failure_json", row.try_get("failure_json")?)?,
        transcript: parse_optional_json("transcript_json", row.try_get("transcript_json")?)?,
        qualification: parse_optional_json("qualification_json", row.try_get("qualification_json")?)?,
        meeting: parse_optional_json("meeting_json", row.try_get("meeting_json")?)?,
        schedule_retries: parse_u32("schedule_retries", row.try_get("schedule_retries")?)?,
        state_version: parse_u32("state_version", row.try_get("state_version")?)?,
    };

    Ok(CallRecord {
        attempt,
        recorded_at: parse_timestamp("recorded_at", row.try_get("recorded_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, Utc};

    use setter_core::domain::call::{CallAttempt, CallFailure, CallState, FailureKind};
    use setter_core::domain::lead::LeadId;
    use setter_core::domain::qualification::{
        MeetingSlot, QualificationResult, QualificationVerdict,
    };
    use setter_core::domain::transcript::{Intent, Speaker, Transcript, Turn};

    use super::SqlCallRecordRepository;
    use crate::migrations;
    use crate::repositories::{CallRecordRepository, RecordWrite, RepositoryError};
    use crate::{connect_with_settings, DbPool};

    fn parse_ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value).expect("timestamp").with_timezone(&Utc)
    }

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    fn qualified_attempt() -> CallAttempt {
        let started = parse_ts("2026-03-02T15:00:00Z");
        let mut transcript = Transcript::new();
        transcript
            .append(Turn {
                speaker: Speaker::Agent,
                text: "Hi Dana, this is Maayaa.".to_string(),
                at: started + Duration::seconds(5),
                intents: Vec::new(),
            })
            .expect("ordered");
        transcript
            .append(Turn {
                speaker: Speaker::Lead,
                text: "Yes, let's schedule it".to_string(),
                at: started + Duration::seconds(9),
                intents: vec![Intent::ExplicitAgreement],
            })
            .expect("ordered");

        let mut attempt = CallAttempt::new(LeadId("lead-1".to_string()), 0, started);
        attempt.state = CallState::Qualified;
        attempt.provider_call_id = Some("CA123".to_string());
        attempt.dial_started_at = Some(started);
        attempt.connected_at = Some(started + Duration::seconds(4));
        attempt.ended_at = Some(started + Duration::seconds(12));
        attempt.transcript = Some(transcript);
        attempt.qualification = Some(QualificationResult {
            verdict: QualificationVerdict::Qualified,
            availability: None,
            confidence: 90,
            score: 4,
            reason: "lead agreed to a follow-up".to_string(),
        });
        attempt.state_version = 6;
        attempt
    }

    #[tokio::test]
    async fn recording_twice_keeps_one_record() {
        let pool = setup_pool().await;
        let repo = SqlCallRecordRepository::new(pool.clone());
        let attempt = qualified_attempt();
        let now = parse_ts("2026-03-02T15:00:20Z");

        assert_eq!(repo.record(&attempt, now).await.expect("record"), RecordWrite::Stored);
        assert_eq!(repo.record(&attempt, now).await.expect("record again"), RecordWrite::Duplicate);

        let found = repo.find(&attempt.id).await.expect("find").expect("record exists");
        assert_eq!(found.attempt, attempt);
        assert_eq!(found.recorded_at, now);
        assert_eq!(repo.list_for_lead(&attempt.lead_id).await.expect("list").len(), 1);

        pool.close().await;
    }

    #[tokio::test]
    async fn scheduled_follow_up_upgrades_the_qualified_record() {
        let pool = setup_pool().await;
        let repo = SqlCallRecordRepository::new(pool.clone());
        let mut attempt = qualified_attempt();
        repo.record(&attempt, parse_ts("2026-03-02T15:00:20Z")).await.expect("record");

        attempt.state = CallState::Scheduled;
        attempt.state_version += 1;
        attempt.meeting = Some(MeetingSlot {
            starts_at: parse_ts("2026-03-03T15:00:00Z"),
            duration_minutes: 30,
            booking_reference: "bk-1".to_string(),
        });
        let later = parse_ts("2026-03-02T15:01:00Z");

        assert_eq!(repo.record(&attempt, later).await.expect("upgrade"), RecordWrite::Upgraded);
        assert_eq!(repo.record(&attempt, later).await.expect("replay"), RecordWrite::Duplicate);

        let found = repo.find(&attempt.id).await.expect("find").expect("record exists");
        assert_eq!(found.attempt.state, CallState::Scheduled);
        assert_eq!(found.attempt.meeting, attempt.meeting);
        assert_eq!(found.updated_at, later);
        assert!(found.attempt.transcript.is_some());

        pool.close().await;
    }

    #[tokio::test]
    async fn failed_record_cannot_be_rewritten() {
        let pool = setup_pool().await;
        let repo = SqlCallRecordRepository::new(pool.clone());
        let mut attempt = qualified_attempt();
        attempt.state = CallState::Failed;
        attempt.qualification = None;
        attempt.failure = Some(CallFailure {
            kind: FailureKind::Retryable,
            reason: "lead_hung_up".to_string(),
        });
        let now = parse_ts("2026-03-02T15:00:20Z");
        repo.record(&attempt, now).await.expect("record");

        let mut rewrite = attempt.clone();
        rewrite.state = CallState::Scheduled;
        assert_eq!(repo.record(&rewrite, now).await.expect("record"), RecordWrite::Duplicate);
        let found = repo.find(&attempt.id).await.expect("find").expect("exists");
        assert_eq!(found.attempt.state, CallState::Failed);
        assert_eq!(found.attempt.failure, attempt.failure);

        pool.close().await;
    }

    #[tokio::test]
    async fn live_attempts_are_refused() {
        let pool = setup_pool().await;
        let repo = SqlCallRecordRepository::new(pool.clone());
        let attempt =
            CallAttempt::new(LeadId("lead-2".to_string()), 0, parse_ts("2026-03-02T15:00:00Z"));

        let error = repo.record(&attempt, parse_ts("2026-03-02T15:00:01Z")).await.expect_err("live");
        assert!(matches!(error, RepositoryError::NotTerminal { state: CallState::Queued, .. }));
        assert!(repo.find(&attempt.id).await.expect("find").is_none());

        pool.close().await;
    }
}
