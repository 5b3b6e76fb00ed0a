//! HTTP adapters for the collaborator ports.
//!
//! Every adapter classifies failures the same way: timeouts, connection
//! errors, 429 and 5xx are transient; any other non-success status is a
//! rejection.

pub mod crm;
pub mod llm;
pub mod scheduling;
pub mod telephony;

use std::time::Duration;

use reqwest::{Client, Response, StatusCode};
use setter_core::ports::CollaboratorError;

pub use crm::CrmLeadSource;
pub use llm::ChatCompletionClient;
pub use scheduling::{DisabledScheduling, HttpScheduling};
pub use telephony::TwilioTelephony;

const ERROR_BODY_LIMIT: usize = 200;

pub fn http_client(timeout_secs: u64) -> Result<Client, reqwest::Error> {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs.max(1)))
        .user_agent(concat!("setter/", env!("CARGO_PKG_VERSION")))
        .build()
}

pub(crate) fn classify_send_error(service: &str, error: reqwest::Error) -> CollaboratorError {
    if error.is_builder() {
        let reason = format!("{service} request could not be built: {error}");
        return CollaboratorError::Rejected(reason);
    }
    CollaboratorError::Transient(format!("{service} request failed: {error}"))
}

pub(crate) fn classify_status(service: &str, status: StatusCode, body: &str) -> CollaboratorError {
    let body: String = body.chars().take(ERROR_BODY_LIMIT).collect();
    let message = format!("{service} returned {status}: {body}");
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        CollaboratorError::Transient(message)
    } else {
        CollaboratorError::Rejected(message)
    }
}

/// Passes successful responses through and classifies the rest.
pub(crate) async fn expect_success(
    service: &str,
    response: Response,
) -> Result<Response, CollaboratorError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(service, status, &body))
}

pub(crate) async fn decode_json<T: serde::de::DeserializeOwned>(
    service: &str,
    response: Response,
) -> Result<T, CollaboratorError> {
    response.json::<T>().await.map_err(|error| {
        CollaboratorError::Rejected(format!("{service} response could not be decoded: {error}"))
    })
}

/// Joins a configured base url and a path without doubling slashes.
pub(crate) fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/'))
}
