//! One task per answered call.
//!
//! The session owns the [`ConversationHandle`] and serialises the lead's
//! turns. Webhooks reach it through the [`SessionRegistry`]; the dispatcher
//! only starts it and asks it to stop. Every session ends by sending exactly
//! one [`DispatchEvent::ConversationFinished`]. A cancelled session leaves
//! its wind-down line behind for the next speech webhook to play.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Utc;
use setter_agent::{
    AgentResponse, ConversationEngine, ConversationHandle, EndReason, FinalizedConversation,
    LeadInput, TurnAction,
};
use setter_core::domain::call::CallAttemptId;
use setter_core::domain::lead::Lead;
use setter_core::domain::transcript::Speaker;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::dispatcher::{DispatchEvent, DispatchHandle};

const TURN_BUFFER: usize = 4;
/// Long enough to cover one more speech gather on the live call.
const FAREWELL_TTL: Duration = Duration::from_secs(120);

#[derive(Debug)]
pub enum SessionRequest {
    Greeting(oneshot::Sender<AgentResponse>),
    Utterance(LeadInput, oneshot::Sender<AgentResponse>),
    HungUp,
}

/// How a session ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionOutcome {
    Finalized(FinalizedConversation),
    /// The session stopped before the greeting was spoken.
    Abandoned { reason: String },
}

struct SessionControl {
    turns: mpsc::Sender<SessionRequest>,
    cancel: watch::Sender<Option<String>>,
}

/// Live sessions by attempt id.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<Mutex<HashMap<CallAttemptId, SessionControl>>>,
    farewells: Arc<Mutex<HashMap<CallAttemptId, (String, Instant)>>>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl SessionRegistry {
    fn lock(&self) -> MutexGuard<'_, HashMap<CallAttemptId, SessionControl>> {
        locked(&self.inner)
    }

    pub fn contains(&self, attempt_id: &CallAttemptId) -> bool {
        self.lock().contains_key(attempt_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn turns(&self, attempt_id: &CallAttemptId) -> Option<mpsc::Sender<SessionRequest>> {
        self.lock().get(attempt_id).map(|control| control.turns.clone())
    }

    fn remove(&self, attempt_id: &CallAttemptId) {
        self.lock().remove(attempt_id);
    }

    /// Sends one request and waits for the agent's reply. `None` when no
    /// session is live for the attempt or it stopped before answering.
    pub async fn request(
        &self,
        attempt_id: &CallAttemptId,
        build: impl FnOnce(oneshot::Sender<AgentResponse>) -> SessionRequest,
    ) -> Option<AgentResponse> {
        let turns = self.turns(attempt_id)?;
        let (reply, response) = oneshot::channel();
        turns.send(build(reply)).await.ok()?;
        response.await.ok()
    }

    /// The lead hung up. Returns false when no session is live. Never
    /// waits on a busy session.
    pub fn hung_up(&self, attempt_id: &CallAttemptId) -> bool {
        let Some(turns) = self.turns(attempt_id) else {
            return false;
        };
        match turns.try_send(SessionRequest::HungUp) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(request)) => {
                tokio::spawn(async move {
                    let _ = turns.send(request).await;
                });
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Cooperative cancel: the in-flight turn finishes first.
    pub fn cancel(&self, attempt_id: &CallAttemptId, reason: &str) -> bool {
        match self.lock().get(attempt_id) {
            Some(control) => control.cancel.send(Some(reason.to_string())).is_ok(),
            None => false,
        }
    }

    pub(crate) fn leave_farewell(&self, attempt_id: &CallAttemptId, text: String) {
        let now = Instant::now();
        let mut farewells = locked(&self.farewells);
        farewells.retain(|_, (_, left_at)| now.duration_since(*left_at) < FAREWELL_TTL);
        farewells.insert(attempt_id.clone(), (text, now));
    }

    /// The wind-down line of a cancelled session, handed out once.
    pub fn take_farewell(&self, attempt_id: &CallAttemptId) -> Option<String> {
        let (text, left_at) = locked(&self.farewells).remove(attempt_id)?;
        (left_at.elapsed() < FAREWELL_TTL).then_some(text)
    }
}

pub struct Session {
    attempt_id: CallAttemptId,
    lead: Lead,
    engine: Arc<ConversationEngine>,
    registry: SessionRegistry,
    handle: Option<ConversationHandle>,
}

impl Session {
    /// Registers the session and spawns its task.
    pub fn spawn(
        attempt_id: CallAttemptId,
        lead: Lead,
        engine: Arc<ConversationEngine>,
        registry: SessionRegistry,
        dispatch: DispatchHandle,
    ) {
        let (turns_tx, turns_rx) = mpsc::channel(TURN_BUFFER);
        let (cancel_tx, cancel_rx) = watch::channel(None);
        registry
            .lock()
            .insert(attempt_id.clone(), SessionControl { turns: turns_tx, cancel: cancel_tx });

        let session = Session {
            attempt_id: attempt_id.clone(),
            lead,
            engine,
            registry: registry.clone(),
            handle: None,
        };
        tokio::spawn(async move {
            let outcome = session.run(turns_rx, cancel_rx).await;
            registry.remove(&attempt_id);
            dispatch.send(DispatchEvent::ConversationFinished { attempt_id, outcome }).await;
        });
    }

    async fn run(
        mut self,
        mut turns: mpsc::Receiver<SessionRequest>,
        mut cancel: watch::Receiver<Option<String>>,
    ) -> SessionOutcome {
        info!(
            event_name = "session.started",
            attempt_id = %self.attempt_id,
            lead_id = %self.lead.id,
            "conversation session started"
        );
        loop {
            tokio::select! {
                biased;
                request = turns.recv() => match request {
                    Some(SessionRequest::Greeting(reply)) => {
                        let response = self.greeting().await;
                        let _ = reply.send(response);
                    }
                    Some(SessionRequest::Utterance(input, reply)) => {
                        let response = self.utterance(input).await;
                        let done = response.action == TurnAction::HangUp;
                        let _ = reply.send(response);
                        if done {
                            return self.finish(EndReason::LeadHungUp);
                        }
                    }
                    Some(SessionRequest::HungUp) => return self.finish(EndReason::LeadHungUp),
                    None => return self.finish(EndReason::Cancelled("session_closed".to_string())),
                },
                changed = cancel.changed() => {
                    let reason = match changed {
                        Ok(()) => cancel.borrow_and_update().clone(),
                        Err(_) => None,
                    };
                    let reason = reason.unwrap_or_else(|| "cancelled".to_string());
                    return self.cancel(&reason);
                }
            }
        }
    }

    async fn greeting(&mut self) -> AgentResponse {
        if let Some(handle) = &self.handle {
            // Answer webhook redelivered: repeat the last agent line.
            let last = handle
                .transcript()
                .turns()
                .iter()
                .rev()
                .find(|turn| turn.speaker == Speaker::Agent)
                .map(|turn| turn.text.clone())
                .unwrap_or_default();
            debug!(event_name = "session.greeting_repeated", attempt_id = %self.attempt_id);
            return AgentResponse { text: last, action: TurnAction::Listen };
        }
        let (handle, response) =
            self.engine.start_call(self.attempt_id.clone(), &self.lead, Utc::now()).await;
        self.handle = Some(handle);
        response
    }

    async fn utterance(&mut self, input: LeadInput) -> AgentResponse {
        if self.handle.is_none() {
            // Speech arrived before the greeting was fetched.
            self.greeting().await;
        }
        let engine = Arc::clone(&self.engine);
        match self.handle.as_mut() {
            Some(handle) => engine.on_lead_utterance(handle, input, Utc::now()).await,
            None => AgentResponse { text: String::new(), action: TurnAction::HangUp },
        }
    }

    fn cancel(mut self, reason: &str) -> SessionOutcome {
        if let Some(handle) = self.handle.as_mut() {
            let response = self.engine.cancel(handle, reason, Utc::now());
            if !response.text.is_empty() {
                self.registry.leave_farewell(&self.attempt_id, response.text);
            }
        }
        self.finish(EndReason::Cancelled(reason.to_string()))
    }

    fn finish(self, reason: EndReason) -> SessionOutcome {
        match self.handle {
            Some(handle) => SessionOutcome::Finalized(self.engine.finalize(handle, reason)),
            None => {
                warn!(
                    event_name = "session.abandoned",
                    attempt_id = %self.attempt_id,
                    reason = reason.as_str(),
                    "session ended before the greeting"
                );
                SessionOutcome::Abandoned { reason: reason.as_str().to_string() }
            }
        }
    }
}
