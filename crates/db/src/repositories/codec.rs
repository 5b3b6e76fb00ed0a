use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use setter_core::domain::call::CallState;

use super::RepositoryError;

pub(crate) fn parse_u32(column: &str, value: i64) -> Result<u32, RepositoryError> {
    u32::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!(
            "invalid value for `{column}` (expected non-negative u32): {value}"
        ))
    })
}

pub(crate) fn parse_timestamp(
    column: &str,
    value: String,
) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

pub(crate) fn parse_optional_timestamp(
    column: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    value.map(|timestamp| parse_timestamp(column, timestamp)).transpose()
}

pub(crate) fn parse_state(column: &str, value: &str) -> Result<CallState, RepositoryError> {
    CallState::parse(value)
        .ok_or_else(|| {
            RepositoryError::Decode(format!("unknown call state in `{column}`: `{value}`"))
        })
}

pub(crate) fn parse_optional_json<T: DeserializeOwned>(
    column: &str,
    value: Option<String>,
) -> Result<Option<T>, RepositoryError> {
    value
        .map(|json| {
            serde_json::from_str(&json).map_err(|error| {
                RepositoryError::Decode(format!("invalid json in `{column}` ({error})"))
            })
        })
        .transpose()
}
