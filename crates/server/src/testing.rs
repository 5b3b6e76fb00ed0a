//! Fakes and a wired-up dispatcher for the server's tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use axum::Router;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use setter_agent::{ConversationEngine, ConversationSettings, LlmClient};
use setter_core::audit::TransitionRecord;
use setter_core::config::RecorderConfig;
use setter_core::domain::call::CallAttemptId;
use setter_core::domain::lead::{LeadId, RawLead};
use setter_core::domain::qualification::MeetingSlot;
use setter_core::orchestrator::{Orchestrator, OrchestratorConfig};
use setter_core::ports::{
    CollaboratorError, MeetingRequest, PlaceCallRequest, SchedulingService, TelephonyProvider,
};
use setter_db::repositories::{
    InMemoryCallRecordRepository, InMemoryDeadLetterRepository, InMemoryTransitionLogRepository,
};
use setter_db::{RepositoryError, TransitionLogRepository};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::dispatcher::{Collaborators, DispatchHandle, Dispatcher};
use crate::recorder::OutcomeRecorder;
use crate::webhooks::{self, CallbackUrls, WebhookState};

fn locked<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub fn raw_lead(id: &str, phone: &str) -> RawLead {
    RawLead {
        id: id.to_string(),
        first_name: Some("Dana".to_string()),
        last_name: Some("Reyes".to_string()),
        phone: Some(phone.to_string()),
        email: None,
        company: Some("Reyes Bakery".to_string()),
        created_at: Utc::now() - ChronoDuration::minutes(5),
    }
}

pub struct ScriptedLlm(Mutex<VecDeque<String>>);

impl ScriptedLlm {
    pub fn new(replies: &[&str]) -> Self {
        Self(Mutex::new(replies.iter().map(|reply| reply.to_string()).collect()))
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, _prompt: &str) -> Result<String> {
        locked(&self.0).pop_front().ok_or_else(|| anyhow!("script exhausted"))
    }
}

#[derive(Default)]
pub struct FakeTelephony {
    placed: Mutex<Vec<PlaceCallRequest>>,
    hung_up: Mutex<Vec<String>>,
    reject_with: Mutex<Option<String>>,
}

impl FakeTelephony {
    pub fn reject_calls(&self, reason: &str) {
        *locked(&self.reject_with) = Some(reason.to_string());
    }

    pub fn placed(&self) -> Vec<PlaceCallRequest> {
        locked(&self.placed).clone()
    }

    pub fn hung_up(&self) -> Vec<String> {
        locked(&self.hung_up).clone()
    }

    /// Waits for the dispatcher's spawned dial tasks to reach the provider.
    pub async fn wait_for_calls(&self, count: usize) -> Vec<PlaceCallRequest> {
        for _ in 0..200 {
            let placed = self.placed();
            if placed.len() >= count {
                return placed;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {count} placed calls, got {}", self.placed().len());
    }
}

#[async_trait]
impl TelephonyProvider for FakeTelephony {
    async fn place_call(&self, request: PlaceCallRequest) -> Result<String, CollaboratorError> {
        let mut placed = locked(&self.placed);
        placed.push(request);
        if let Some(reason) = locked(&self.reject_with).clone() {
            return Err(CollaboratorError::Rejected(reason));
        }
        Ok(format!("CA{}", placed.len()))
    }

    async fn hang_up(&self, provider_call_id: &str) -> Result<(), CollaboratorError> {
        locked(&self.hung_up).push(provider_call_id.to_string());
        Ok(())
    }
}

/// Books every request unless told to fail.
#[derive(Default)]
pub struct FakeScheduling {
    requests: Mutex<Vec<MeetingRequest>>,
    failures: Mutex<VecDeque<CollaboratorError>>,
}

impl FakeScheduling {
    pub fn fail_next(&self, error: CollaboratorError) {
        locked(&self.failures).push_back(error);
    }

    pub fn requests(&self) -> Vec<MeetingRequest> {
        locked(&self.requests).clone()
    }
}

#[async_trait]
impl SchedulingService for FakeScheduling {
    async fn propose_slot(
        &self,
        request: MeetingRequest,
    ) -> Result<MeetingSlot, CollaboratorError> {
        let starts_at = request.requested_at + ChronoDuration::days(1);
        let reference = format!("bk-{}", request.attempt_id);
        locked(&self.requests).push(request);
        if let Some(error) = locked(&self.failures).pop_front() {
            return Err(error);
        }
        Ok(MeetingSlot { starts_at, duration_minutes: 30, booking_reference: reference })
    }
}

/// Transition log that can be switched off to simulate a storage outage.
pub struct SwitchableTransitionLog {
    available: AtomicBool,
    inner: InMemoryTransitionLogRepository,
}

impl Default for SwitchableTransitionLog {
    fn default() -> Self {
        Self { available: AtomicBool::new(true), inner: InMemoryTransitionLogRepository::default() }
    }
}

impl SwitchableTransitionLog {
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }
}

#[async_trait]
impl TransitionLogRepository for SwitchableTransitionLog {
    async fn append(&self, record: &TransitionRecord) -> Result<(), RepositoryError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(RepositoryError::Decode("disk I/O error".to_string()));
        }
        self.inner.append(record).await
    }

    async fn list_for_attempt(
        &self,
        attempt_id: &CallAttemptId,
    ) -> Result<Vec<TransitionRecord>, RepositoryError> {
        self.inner.list_for_attempt(attempt_id).await
    }

    async fn list_for_lead(
        &self,
        lead_id: &LeadId,
    ) -> Result<Vec<TransitionRecord>, RepositoryError> {
        self.inner.list_for_lead(lead_id).await
    }
}

pub fn engine(replies: &[&str]) -> Arc<ConversationEngine> {
    let llm = Arc::new(ScriptedLlm::new(replies));
    match ConversationEngine::new(llm, ConversationSettings::default()) {
        Ok(engine) => Arc::new(engine),
        Err(error) => panic!("conversation templates must compile: {error}"),
    }
}

pub struct Harness {
    pub dispatcher: Dispatcher,
    pub telephony: Arc<FakeTelephony>,
    pub scheduling: Arc<FakeScheduling>,
    pub transition_log: Arc<SwitchableTransitionLog>,
    pub records: Arc<InMemoryCallRecordRepository>,
    pub recorder_worker: JoinHandle<()>,
}

/// A dispatcher running in the background, as the server runs it.
pub struct Running {
    pub dispatch: DispatchHandle,
    pub transition_log: Arc<SwitchableTransitionLog>,
    pub records: Arc<InMemoryCallRecordRepository>,
    _shutdown: watch::Sender<bool>,
}

impl Harness {
    pub fn new(replies: &[&str]) -> Self {
        Self::with_config(OrchestratorConfig::default(), replies)
    }

    pub fn with_config(config: OrchestratorConfig, replies: &[&str]) -> Self {
        let telephony = Arc::new(FakeTelephony::default());
        let scheduling = Arc::new(FakeScheduling::default());
        let transition_log = Arc::new(SwitchableTransitionLog::default());
        let records = Arc::new(InMemoryCallRecordRepository::default());
        let recorder = OutcomeRecorder::new(
            records.clone(),
            Arc::new(InMemoryDeadLetterRepository::default()),
            RecorderConfig { max_attempts: 3, retry_base_ms: 1, channel_capacity: 16 },
        );
        let (recorder, recorder_worker) = recorder.spawn();

        let dispatcher = Dispatcher::new(
            Orchestrator::new(config),
            Collaborators {
                telephony: telephony.clone(),
                scheduling: scheduling.clone(),
                engine: engine(replies),
            },
            transition_log.clone(),
            recorder,
            CallbackUrls::new("https://dialer.test"),
            64,
        );
        Self { dispatcher, telephony, scheduling, transition_log, records, recorder_worker }
    }

    /// Handles events produced by spawned tasks until `done` holds.
    pub async fn pump_until(&mut self, mut done: impl FnMut(&Dispatcher) -> bool) {
        for _ in 0..50 {
            if done(&self.dispatcher) {
                return;
            }
            let next = tokio::time::timeout(Duration::from_secs(2), self.dispatcher.next_event());
            match next.await {
                Ok(Some(event)) => self.dispatcher.handle_event(event, Utc::now()).await,
                _ => break,
            }
        }
        assert!(done(&self.dispatcher), "dispatcher never reached the expected state");
    }

    pub async fn tick_at(&mut self, now: DateTime<Utc>) {
        self.dispatcher.tick(now).await;
    }

    pub fn serve(self) -> (Router, Running) {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let state = WebhookState {
            dispatch: self.dispatcher.handle(),
            sessions: self.dispatcher.sessions(),
            callbacks: CallbackUrls::new("https://dialer.test"),
            webhook_secret: None,
            reply_timeout: Duration::from_secs(2),
        };
        let running = Running {
            dispatch: self.dispatcher.handle(),
            transition_log: self.transition_log,
            records: self.records,
            _shutdown: shutdown,
        };
        tokio::spawn(self.dispatcher.run(
            Duration::from_millis(20),
            shutdown_rx,
            Duration::from_secs(1),
        ));
        (webhooks::router(state), running)
    }
}
