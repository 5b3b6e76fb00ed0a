//! Telephony provider callbacks.
//!
//! `answer` is fetched when the lead picks up and returns the greeting,
//! `speech` carries each transcribed reply, `status` reports call progress.
//! Replies to `answer` and `speech` are TwiML.

use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::post,
    Form, Router,
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use setter_agent::{LeadInput, FALLBACK_UTTERANCE, GOODBYE};
use setter_core::domain::call::CallAttemptId;
use setter_core::flows::CallEvent;
use setter_core::ports::TelephonyStatus;
use tracing::{debug, warn};

use crate::dispatcher::{DispatchEvent, DispatchHandle};
use crate::session::{SessionRegistry, SessionRequest};
use crate::twiml;

pub const WEBHOOK_SECRET_HEADER: &str = "x-setter-webhook-secret";

/// Absolute callback urls handed to the provider when a call is placed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallbackUrls {
    base: String,
}

impl CallbackUrls {
    pub fn new(public_base_url: &str) -> Self {
        Self { base: public_base_url.trim_end_matches('/').to_string() }
    }

    pub fn answer(&self, attempt_id: &CallAttemptId) -> String {
        self.url("answer", attempt_id)
    }

    pub fn speech(&self, attempt_id: &CallAttemptId) -> String {
        self.url("speech", attempt_id)
    }

    pub fn status(&self, attempt_id: &CallAttemptId) -> String {
        self.url("status", attempt_id)
    }

    fn url(&self, hook: &str, attempt_id: &CallAttemptId) -> String {
        format!("{}/telephony/{hook}?attempt_id={attempt_id}", self.base)
    }
}

#[derive(Clone)]
pub struct WebhookState {
    pub dispatch: DispatchHandle,
    pub sessions: SessionRegistry,
    pub callbacks: CallbackUrls,
    pub webhook_secret: Option<SecretString>,
    /// How long a webhook waits for the agent's next line.
    pub reply_timeout: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WebhookError {
    pub error: String,
}

#[derive(Debug, Deserialize)]
pub struct AttemptQuery {
    pub attempt_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AnswerForm {
    pub call_sid: Option<String>,
    pub answered_by: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SpeechForm {
    pub speech_result: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatusForm {
    pub call_sid: Option<String>,
    pub call_status: String,
    pub answered_by: Option<String>,
}

pub fn router(state: WebhookState) -> Router {
    Router::new()
        .route("/telephony/answer", post(answer))
        .route("/telephony/speech", post(speech))
        .route("/telephony/status", post(status))
        .with_state(state)
}

fn webhook_guard(
    headers: &HeaderMap,
    state: &WebhookState,
) -> Result<(), (StatusCode, Json<WebhookError>)> {
    let Some(secret) = &state.webhook_secret else {
        return Ok(());
    };
    match headers.get(WEBHOOK_SECRET_HEADER).and_then(|value| value.to_str().ok()) {
        Some(value) if value == secret.expose_secret() => Ok(()),
        Some(_) => Err((
            StatusCode::UNAUTHORIZED,
            Json(WebhookError { error: "invalid webhook secret".to_string() }),
        )),
        None => Err((
            StatusCode::UNAUTHORIZED,
            Json(WebhookError { error: "missing webhook secret".to_string() }),
        )),
    }
}

fn twiml_response(body: String) -> Response {
    ([(header::CONTENT_TYPE, "text/xml")], body).into_response()
}

async fn answer(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    Query(query): Query<AttemptQuery>,
    Form(form): Form<AnswerForm>,
) -> Response {
    if let Err(rejection) = webhook_guard(&headers, &state) {
        return rejection.into_response();
    }
    let attempt_id = CallAttemptId(query.attempt_id);
    let event = TelephonyStatus::InProgress.to_event(form.answered_by.as_deref());
    let Some(event) = event else {
        return twiml_response(twiml::hang_up(GOODBYE));
    };
    let machine = event == CallEvent::MachineDetected;
    debug!(
        event_name = "telephony.answered",
        attempt_id = %attempt_id,
        provider_call_id = form.call_sid.as_deref().unwrap_or("unknown"),
        machine,
        "call answered"
    );

    match state.dispatch.telephony(attempt_id.clone(), event).await {
        Some(Ok(())) if !machine => {}
        Some(Ok(())) => return twiml_response(twiml::hang_up("")),
        Some(Err(error)) => {
            debug!(
                event_name = "telephony.answer_ignored",
                attempt_id = %attempt_id,
                error = %error,
                "answer does not match a live attempt"
            );
            return twiml_response(twiml::hang_up(GOODBYE));
        }
        None => return twiml_response(twiml::hang_up(GOODBYE)),
    }

    let greeting = tokio::time::timeout(
        state.reply_timeout,
        state.sessions.request(&attempt_id, SessionRequest::Greeting),
    )
    .await;
    match greeting {
        Ok(Some(response)) => {
            twiml_response(twiml::respond(&response, &state.callbacks.speech(&attempt_id)))
        }
        Ok(None) => twiml_response(twiml::hang_up(GOODBYE)),
        Err(_) => {
            warn!(
                event_name = "telephony.greeting_timeout",
                attempt_id = %attempt_id,
                "greeting was not ready in time"
            );
            twiml_response(twiml::listen(FALLBACK_UTTERANCE, &state.callbacks.speech(&attempt_id)))
        }
    }
}

async fn speech(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    Query(query): Query<AttemptQuery>,
    Form(form): Form<SpeechForm>,
) -> Response {
    if let Err(rejection) = webhook_guard(&headers, &state) {
        return rejection.into_response();
    }
    let attempt_id = CallAttemptId(query.attempt_id);
    let input = match form.speech_result.as_deref().map(str::trim) {
        Some(text) if !text.is_empty() => LeadInput::Text(text.to_string()),
        _ => LeadInput::Silence,
    };
    state.dispatch.send(DispatchEvent::Heartbeat { attempt_id: attempt_id.clone() }).await;

    let reply = tokio::time::timeout(
        state.reply_timeout,
        state.sessions.request(&attempt_id, |reply| SessionRequest::Utterance(input, reply)),
    )
    .await;
    let speech_url = state.callbacks.speech(&attempt_id);
    match reply {
        Ok(Some(response)) => twiml_response(twiml::respond(&response, &speech_url)),
        Ok(None) => {
            let farewell = state.sessions.take_farewell(&attempt_id);
            twiml_response(twiml::hang_up(farewell.as_deref().unwrap_or(GOODBYE)))
        }
        Err(_) => {
            warn!(
                event_name = "telephony.reply_timeout",
                attempt_id = %attempt_id,
                "agent reply was not ready in time"
            );
            twiml_response(twiml::listen(FALLBACK_UTTERANCE, &speech_url))
        }
    }
}

async fn status(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    Query(query): Query<AttemptQuery>,
    Form(form): Form<StatusForm>,
) -> Response {
    if let Err(rejection) = webhook_guard(&headers, &state) {
        return rejection.into_response();
    }
    let attempt_id = CallAttemptId(query.attempt_id);
    let Some(call_status) = TelephonyStatus::parse(&form.call_status) else {
        warn!(
            event_name = "telephony.unknown_status",
            attempt_id = %attempt_id,
            call_status = %form.call_status,
            "ignoring unknown call status"
        );
        return StatusCode::NO_CONTENT.into_response();
    };
    debug!(
        event_name = "telephony.status",
        attempt_id = %attempt_id,
        provider_call_id = form.call_sid.as_deref().unwrap_or("unknown"),
        call_status = ?call_status,
        "call status received"
    );

    let event = match call_status.to_event(form.answered_by.as_deref()) {
        Some(event) => DispatchEvent::Telephony { attempt_id, event, ack: None },
        None => DispatchEvent::Heartbeat { attempt_id },
    };
    if state.dispatch.send(event).await {
        StatusCode::NO_CONTENT.into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(WebhookError { error: "dialer is shutting down".to_string() }),
        )
            .into_response()
    }
}
