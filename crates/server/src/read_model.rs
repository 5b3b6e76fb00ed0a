//! Read-only views over the dialer for operators.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use setter_core::audit::TransitionRecord;
use setter_core::domain::call::{CallAttemptId, CallState};
use setter_core::errors::{ApplicationError, DomainError, InterfaceError};
use setter_core::orchestrator::InFlightCall;
use setter_db::TransitionLogRepository;
use tracing::warn;
use uuid::Uuid;

use crate::dispatcher::DispatchHandle;

#[derive(Clone)]
pub struct ReadModelState {
    pub dispatch: DispatchHandle,
    pub transition_log: Arc<dyn TransitionLogRepository>,
}

pub fn router(state: ReadModelState) -> Router {
    Router::new()
        .route("/api/v1/calls/active", get(active_calls))
        .route("/api/v1/calls/{attempt_id}/transitions", get(transitions))
        .with_state(state)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ActiveCall {
    pub attempt_id: String,
    pub lead_id: String,
    pub state: CallState,
    pub retry_count: u32,
    pub provider_call_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub stale: bool,
}

impl From<InFlightCall> for ActiveCall {
    fn from(call: InFlightCall) -> Self {
        Self {
            attempt_id: call.attempt_id.0,
            lead_id: call.lead_id.0,
            state: call.state,
            retry_count: call.retry_count,
            provider_call_id: call.provider_call_id,
            created_at: call.created_at,
            last_heartbeat_at: call.last_heartbeat_at,
            stale: call.stale,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ActiveCallsResponse {
    pub calls: Vec<ActiveCall>,
    pub dialing_halted: Option<String>,
    pub tracked_leads: usize,
    pub slots_in_use: usize,
    pub taken_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TransitionsResponse {
    pub attempt_id: String,
    pub transitions: Vec<TransitionRecord>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    correlation_id: String,
}

struct ApiError(InterfaceError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, correlation_id) = match &self.0 {
            InterfaceError::BadRequest { correlation_id, .. } => {
                (StatusCode::BAD_REQUEST, correlation_id)
            }
            InterfaceError::NotFound { correlation_id, .. } => {
                (StatusCode::NOT_FOUND, correlation_id)
            }
            InterfaceError::ServiceUnavailable { correlation_id, .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, correlation_id)
            }
            InterfaceError::Internal { correlation_id, .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, correlation_id)
            }
        };
        let body =
            ErrorBody { error: self.0.user_message(), correlation_id: correlation_id.clone() };
        (status, Json(body)).into_response()
    }
}

fn api_error(error: ApplicationError) -> ApiError {
    let correlation_id = Uuid::new_v4().to_string();
    warn!(
        event_name = "api.request_failed",
        correlation_id = %correlation_id,
        error_class = error.class().as_str(),
        error = %error,
        "read model request failed"
    );
    ApiError(error.into_interface(correlation_id))
}

async fn active_calls(
    State(state): State<ReadModelState>,
) -> Result<Json<ActiveCallsResponse>, ApiError> {
    let snapshot = state.dispatch.snapshot().await.ok_or_else(|| {
        api_error(ApplicationError::Integration("dispatcher is not running".to_string()))
    })?;

    Ok(Json(ActiveCallsResponse {
        calls: snapshot.calls.into_iter().map(ActiveCall::from).collect(),
        dialing_halted: snapshot.dialing_halted,
        tracked_leads: snapshot.tracked_leads,
        slots_in_use: snapshot.slots_in_use,
        taken_at: snapshot.taken_at,
    }))
}

async fn transitions(
    State(state): State<ReadModelState>,
    Path(attempt_id): Path<String>,
) -> Result<Json<TransitionsResponse>, ApiError> {
    let attempt_id = CallAttemptId(attempt_id);
    let transitions = state
        .transition_log
        .list_for_attempt(&attempt_id)
        .await
        .map_err(|error| api_error(ApplicationError::Persistence(error.to_string())))?;
    if transitions.is_empty() {
        return Err(api_error(DomainError::UnknownAttempt(attempt_id).into()));
    }

    Ok(Json(TransitionsResponse { attempt_id: attempt_id.0, transitions }))
}
