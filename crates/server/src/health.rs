use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;
use setter_db::DbPool;

use crate::dispatcher::DispatchHandle;

#[derive(Clone)]
pub struct HealthState {
    pub db_pool: DbPool,
    pub dispatch: DispatchHandle,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: HealthCheck,
    pub database: HealthCheck,
    pub dialer: HealthCheck,
    pub checked_at: String,
}

pub fn router(state: HealthState) -> Router {
    Router::new().route("/health", get(health)).with_state(state)
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let database = database_check(&state.db_pool).await;
    let dialer = dialer_check(&state.dispatch).await;
    let ready = database.status == "ready" && dialer.status != "stopped";

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        service: HealthCheck {
            status: "ready",
            detail: "setter-server runtime initialized".to_string(),
        },
        database,
        dialer,
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn database_check(pool: &DbPool) -> HealthCheck {
    match setter_db::ping(pool).await {
        Ok(()) => HealthCheck { status: "ready", detail: "database query succeeded".to_string() },
        Err(error) => {
            HealthCheck { status: "degraded", detail: format!("database query failed: {error}") }
        }
    }
}

/// A halted dialer still serves live calls, so it only degrades the detail.
async fn dialer_check(dispatch: &DispatchHandle) -> HealthCheck {
    match dispatch.snapshot().await {
        Some(snapshot) => match snapshot.dialing_halted {
            Some(reason) => HealthCheck { status: "halted", detail: reason },
            None => HealthCheck {
                status: "ready",
                detail: format!("{} calls in flight", snapshot.slots_in_use),
            },
        },
        None => HealthCheck { status: "stopped", detail: "dispatcher is not running".to_string() },
    }
}
