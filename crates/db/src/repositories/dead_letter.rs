use sqlx::{sqlite::SqliteRow, Row};

use setter_core::domain::call::CallAttemptId;
use setter_core::domain::lead::LeadId;

use super::codec::{parse_state, parse_timestamp, parse_u32};
use super::{DeadLetter, DeadLetterRepository, RepositoryError};
use crate::DbPool;

pub struct SqlDeadLetterRepository {
    pool: DbPool,
}

impl SqlDeadLetterRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl DeadLetterRepository for SqlDeadLetterRepository {
    async fn push(&self, letter: &DeadLetter) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO outcome_dead_letter (
                attempt_id,
                lead_id,
                state,
                payload_json,
                last_error,
                attempts,
                dead_lettered_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&letter.attempt_id.0)
        .bind(&letter.lead_id.0)
        .bind(letter.state.as_str())
        .bind(&letter.payload_json)
        .bind(&letter.last_error)
        .bind(i64::from(letter.attempts))
        .bind(letter.dead_lettered_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_recent(&self, limit: u32) -> Result<Vec<DeadLetter>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                attempt_id,
                lead_id,
                state,
                payload_json,
                last_error,
                attempts,
                dead_lettered_at
             FROM outcome_dead_letter
             ORDER BY id DESC
             LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(letter_from_row).collect()
    }
}

fn letter_from_row(row: SqliteRow) -> Result<DeadLetter, RepositoryError> {
    Ok(DeadLetter {
        attempt_id: CallAttemptId(row.try_get("attempt_id")?),
        lead_id: LeadId(row.try_get("lead_id")?),
        state: parse_state("state", &row.try_get::<String, _>("state")?)?,
        payload_json: row.try_get("payload_json")?,
        last_error: row.try_get("last_error")?,
        attempts: parse_u32("attempts", row.try_get("attempts")?)?,
        dead_lettered_at: parse_timestamp("dead_lettered_at", row.try_get("dead_lettered_at")?)?,
    })
}
