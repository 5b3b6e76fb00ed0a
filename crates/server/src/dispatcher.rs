//! Dispatcher loop.
//!
//! The only owner of the [`Orchestrator`]. Telephony callbacks, session
//! results and collaborator replies all arrive on one serialized event
//! channel; the loop applies them, persists the resulting transitions and
//! turns the requested commands into spawned I/O. Nothing that talks to a
//! collaborator runs on this task.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use setter_agent::ConversationEngine;
use setter_core::audit::TransitionRecord;
use setter_core::domain::call::{CallAttemptId, CallState};
use setter_core::domain::lead::RawLead;
use setter_core::domain::qualification::MeetingSlot;
use setter_core::domain::transcript::Transcript;
use setter_core::errors::DomainError;
use setter_core::flows::{CallEvent, CallTransitionError};
use setter_core::orchestrator::{Command, InFlightCall, Orchestrator, Step};
use setter_core::ports::{
    CollaboratorError, PlaceCallRequest, SchedulingService, TelephonyProvider,
};
use setter_db::{RepositoryError, TransitionLogRepository};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::recorder::RecorderHandle;
use crate::session::{Session, SessionOutcome, SessionRegistry};
use crate::webhooks::CallbackUrls;

const DIAL_RETRIES: u32 = 2;
const DIAL_RETRY_BASE: StdDuration = StdDuration::from_millis(500);
const STORAGE_HALT_REASON: &str = "transition log unavailable";
const SHUTDOWN_HALT_REASON: &str = "shutting down";

#[derive(Debug)]
pub enum DispatchEvent {
    /// Provider callback. `ack` is answered once the event and its commands
    /// have been applied.
    Telephony {
        attempt_id: CallAttemptId,
        event: CallEvent,
        ack: Option<oneshot::Sender<Result<(), DomainError>>>,
    },
    CallPlaced { attempt_id: CallAttemptId, provider_call_id: String },
    Heartbeat { attempt_id: CallAttemptId },
    ConversationFinished { attempt_id: CallAttemptId, outcome: SessionOutcome },
    MeetingBooked { attempt_id: CallAttemptId, slot: MeetingSlot },
    MeetingFailed { attempt_id: CallAttemptId, error: CollaboratorError },
    LeadsFetched { leads: Vec<RawLead> },
    Snapshot { reply: oneshot::Sender<DialerSnapshot> },
}

/// Read model of the dialer at one instant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DialerSnapshot {
    pub calls: Vec<InFlightCall>,
    pub dialing_halted: Option<String>,
    pub tracked_leads: usize,
    pub slots_in_use: usize,
    pub taken_at: DateTime<Utc>,
}

/// Cloneable sending side of the event channel.
#[derive(Clone, Debug)]
pub struct DispatchHandle {
    tx: mpsc::Sender<DispatchEvent>,
}

impl DispatchHandle {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<DispatchEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// False once the dispatcher has stopped.
    pub async fn send(&self, event: DispatchEvent) -> bool {
        if self.tx.send(event).await.is_err() {
            warn!(event_name = "dispatch.closed", "dispatcher is no longer running");
            return false;
        }
        true
    }

    /// Applies a provider callback and waits until it has taken effect.
    pub async fn telephony(
        &self,
        attempt_id: CallAttemptId,
        event: CallEvent,
    ) -> Option<Result<(), DomainError>> {
        let (ack, applied) = oneshot::channel();
        let sent = self.send(DispatchEvent::Telephony { attempt_id, event, ack: Some(ack) }).await;
        if !sent {
            return None;
        }
        applied.await.ok()
    }

    pub async fn snapshot(&self) -> Option<DialerSnapshot> {
        let (reply, snapshot) = oneshot::channel();
        if !self.send(DispatchEvent::Snapshot { reply }).await {
            return None;
        }
        snapshot.await.ok()
    }
}

/// Outbound collaborators the dispatcher spawns calls to.
#[derive(Clone)]
pub struct Collaborators {
    pub telephony: Arc<dyn TelephonyProvider>,
    pub scheduling: Arc<dyn SchedulingService>,
    pub engine: Arc<ConversationEngine>,
}

pub struct Dispatcher {
    orchestrator: Orchestrator,
    collaborators: Collaborators,
    transition_log: Arc<dyn TransitionLogRepository>,
    recorder: RecorderHandle,
    sessions: SessionRegistry,
    callbacks: CallbackUrls,
    handle: DispatchHandle,
    events: mpsc::Receiver<DispatchEvent>,
    /// Transitions not yet in the log, oldest first.
    pending: VecDeque<TransitionRecord>,
    storage_halted: bool,
    shutting_down: bool,
}

impl Dispatcher {
    pub fn new(
        orchestrator: Orchestrator,
        collaborators: Collaborators,
        transition_log: Arc<dyn TransitionLogRepository>,
        recorder: RecorderHandle,
        callbacks: CallbackUrls,
        channel_capacity: usize,
    ) -> Self {
        let (handle, events) = DispatchHandle::channel(channel_capacity);
        Self {
            orchestrator,
            collaborators,
            transition_log,
            recorder,
            sessions: SessionRegistry::default(),
            callbacks,
            handle,
            events,
            pending: VecDeque::new(),
            storage_halted: false,
            shutting_down: false,
        }
    }

    pub fn handle(&self) -> DispatchHandle {
        self.handle.clone()
    }

    pub fn sessions(&self) -> SessionRegistry {
        self.sessions.clone()
    }

    #[cfg(test)]
    pub(crate) async fn next_event(&mut self) -> Option<DispatchEvent> {
        self.events.recv().await
    }

    /// Runs until shutdown is signalled and in-flight calls have ended, or
    /// `drain_for` has passed since the signal.
    pub async fn run(
        mut self,
        tick_every: StdDuration,
        mut shutdown: watch::Receiver<bool>,
        drain_for: StdDuration,
    ) {
        let mut ticker = tokio::time::interval(tick_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut drain_deadline: Option<Instant> = None;
        info!(event_name = "dispatch.started", "dispatcher started");

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick(Utc::now()).await,
                Some(event) = self.events.recv() => self.handle_event(event, Utc::now()).await,
                _ = shutdown.changed(), if drain_deadline.is_none() => {
                    self.begin_shutdown();
                    drain_deadline = Some(Instant::now() + drain_for);
                }
            }

            if let Some(deadline) = drain_deadline {
                let live = self.live_calls();
                if live == 0 || Instant::now() >= deadline {
                    if live > 0 {
                        warn!(
                            event_name = "dispatch.drain_timeout",
                            live_calls = live,
                            "stopping with calls still in flight"
                        );
                    }
                    break;
                }
            }
        }

        self.persist(Vec::new()).await;
        if !self.pending.is_empty() {
            error!(
                event_name = "dispatch.transitions_lost",
                buffered = self.pending.len(),
                "transition log entries could not be written before shutdown"
            );
        }
        info!(event_name = "dispatch.stopped", "dispatcher stopped");
    }

    fn begin_shutdown(&mut self) {
        self.shutting_down = true;
        self.orchestrator.halt_dialing(SHUTDOWN_HALT_REASON);
        info!(
            event_name = "dispatch.draining",
            live_calls = self.live_calls(),
            "no new calls will be placed"
        );
    }

    fn live_calls(&self) -> usize {
        self.orchestrator
            .attempts()
            .filter(|attempt| attempt.is_active() && attempt.state != CallState::Queued)
            .count()
    }

    pub async fn tick(&mut self, now: DateTime<Utc>) {
        let step = self.orchestrator.tick(now);
        self.process(step, now).await;
    }

    pub async fn handle_event(&mut self, event: DispatchEvent, now: DateTime<Utc>) {
        match event {
            DispatchEvent::Telephony { attempt_id, event, ack } => {
                let cause = event.cause();
                let applied = match self.orchestrator.apply(&attempt_id, event, now) {
                    Ok(step) => {
                        self.process(step, now).await;
                        Ok(())
                    }
                    Err(error) => {
                        log_ignored(&attempt_id, &cause, &error);
                        Err(error)
                    }
                };
                if let Some(ack) = ack {
                    let _ = ack.send(applied);
                }
            }
            DispatchEvent::CallPlaced { attempt_id, provider_call_id } => {
                if let Err(error) =
                    self.orchestrator.record_provider_call(&attempt_id, provider_call_id, now)
                {
                    log_ignored(&attempt_id, "call_placed", &error);
                }
            }
            DispatchEvent::Heartbeat { attempt_id } => {
                if let Err(error) = self.orchestrator.heartbeat(&attempt_id, now) {
                    log_ignored(&attempt_id, "heartbeat", &error);
                }
            }
            DispatchEvent::ConversationFinished { attempt_id, outcome } => {
                let result = match outcome {
                    SessionOutcome::Finalized(conversation) => {
                        self.orchestrator.complete_conversation(
                            &attempt_id,
                            conversation.transcript,
                            conversation.result,
                            now,
                        )
                    }
                    SessionOutcome::Abandoned { reason } => self.orchestrator.fail_conversation(
                        &attempt_id,
                        Transcript::new(),
                        reason,
                        now,
                    ),
                };
                self.settle(&attempt_id, "conversation_finished", result, now).await;
            }
            DispatchEvent::MeetingBooked { attempt_id, slot } => {
                let result = self.orchestrator.meeting_booked(&attempt_id, slot, now);
                self.settle(&attempt_id, "meeting_booked", result, now).await;
            }
            DispatchEvent::MeetingFailed { attempt_id, error } => {
                self.meeting_failed(attempt_id, error, now).await;
            }
            DispatchEvent::LeadsFetched { leads } => {
                let report = self.orchestrator.ingest(leads, now);
                for (lead_id, error) in &report.rejected {
                    warn!(
                        event_name = "leads.rejected",
                        lead_id = %lead_id,
                        error = %error,
                        "lead is not dialable"
                    );
                }
                info!(
                    event_name = "leads.ingested",
                    accepted = report.accepted.len(),
                    duplicates = report.duplicates.len(),
                    stale = report.stale.len(),
                    rejected = report.rejected.len(),
                    "lead batch ingested"
                );
            }
            DispatchEvent::Snapshot { reply } => {
                let _ = reply.send(DialerSnapshot {
                    calls: self.orchestrator.snapshot(now),
                    dialing_halted: self.orchestrator.dialing_halted().map(str::to_string),
                    tracked_leads: self.orchestrator.leads().len(),
                    slots_in_use: self.orchestrator.slots_in_use(),
                    taken_at: now,
                });
            }
        }
    }

    async fn settle(
        &mut self,
        attempt_id: &CallAttemptId,
        cause: &str,
        result: Result<Step, DomainError>,
        now: DateTime<Utc>,
    ) {
        match result {
            Ok(step) => self.process(step, now).await,
            Err(error) => log_ignored(attempt_id, cause, &error),
        }
    }

    async fn meeting_failed(
        &mut self,
        attempt_id: CallAttemptId,
        error: CollaboratorError,
        now: DateTime<Utc>,
    ) {
        if !error.is_transient() {
            self.orchestrator.meeting_abandoned(&attempt_id);
            warn!(
                event_name = "meeting.not_booked",
                attempt_id = %attempt_id,
                error = %error,
                "meeting left for manual booking"
            );
            return;
        }
        match self.orchestrator.meeting_failed(&attempt_id, now) {
            Ok(step) if step.is_empty() => warn!(
                event_name = "meeting.given_up",
                attempt_id = %attempt_id,
                error = %error,
                "meeting booking retries exhausted"
            ),
            Ok(step) => {
                debug!(
                    event_name = "meeting.retry",
                    attempt_id = %attempt_id,
                    error = %error,
                    "meeting booking will be retried"
                );
                self.process(step, now).await;
            }
            Err(error) => log_ignored(&attempt_id, "meeting_failed", &error),
        }
    }

    async fn process(&mut self, step: Step, now: DateTime<Utc>) {
        self.persist(step.transitions).await;
        for command in step.commands {
            self.execute(command, now);
        }
    }

    /// Appends to the transition log in order. A failed write halts new
    /// dialing and keeps the entry, and everything after it, buffered until
    /// a later write succeeds.
    async fn persist(&mut self, transitions: Vec<TransitionRecord>) {
        self.pending.extend(transitions);
        while let Some(record) = self.pending.front() {
            match self.transition_log.append(record).await {
                Ok(()) | Err(RepositoryError::DuplicateTransition { .. }) => {
                    self.pending.pop_front();
                }
                Err(error) => {
                    if !self.storage_halted {
                        self.storage_halted = true;
                        self.orchestrator.halt_dialing(STORAGE_HALT_REASON);
                        error!(
                            event_name = "dispatch.dialing_halted",
                            buffered = self.pending.len(),
                            error = %error,
                            "transition log write failed; new dialing halted"
                        );
                    }
                    return;
                }
            }
        }

        if self.storage_halted {
            self.storage_halted = false;
            if !self.shutting_down {
                self.orchestrator.resume_dialing();
            }
            info!(event_name = "dispatch.dialing_resumed", "transition log writable again");
        }
    }

    fn execute(&mut self, command: Command, now: DateTime<Utc>) {
        match command {
            Command::PlaceCall { attempt_id, lead } => {
                let ring_timeout_secs =
                    u64::try_from(self.orchestrator.config().dial_timeout.num_seconds())
                        .unwrap_or(1)
                        .max(1);
                let request = PlaceCallRequest {
                    callback_url: self.callbacks.answer(&attempt_id),
                    status_callback_url: self.callbacks.status(&attempt_id),
                    attempt_id,
                    lead_id: lead.id,
                    to: lead.phone,
                    ring_timeout_secs,
                };
                let telephony = Arc::clone(&self.collaborators.telephony);
                let dispatch = self.handle.clone();
                tokio::spawn(async move {
                    let attempt_id = request.attempt_id.clone();
                    let event = match place_with_retry(telephony.as_ref(), request).await {
                        Ok(provider_call_id) => {
                            DispatchEvent::CallPlaced { attempt_id, provider_call_id }
                        }
                        Err(CollaboratorError::Transient(reason)) => DispatchEvent::Telephony {
                            attempt_id,
                            event: CallEvent::DialErrored { reason },
                            ack: None,
                        },
                        Err(CollaboratorError::Rejected(reason)) => DispatchEvent::Telephony {
                            attempt_id,
                            event: CallEvent::TelephonyRejected { reason },
                            ack: None,
                        },
                    };
                    dispatch.send(event).await;
                });
            }
            Command::ArmDialTimeout { attempt_id, deadline } => {
                let dispatch = self.handle.clone();
                let wait = until(deadline, now);
                tokio::spawn(async move {
                    tokio::time::sleep(wait).await;
                    let event = CallEvent::DialTimedOut;
                    dispatch.send(DispatchEvent::Telephony { attempt_id, event, ack: None }).await;
                });
            }
            Command::StartConversation { attempt_id, lead, deadline } => {
                debug!(
                    event_name = "dispatch.conversation_starting",
                    attempt_id = %attempt_id,
                    deadline = %deadline,
                    "starting conversation session"
                );
                Session::spawn(
                    attempt_id,
                    lead,
                    Arc::clone(&self.collaborators.engine),
                    self.sessions.clone(),
                    self.handle.clone(),
                );
            }
            Command::FinalizeConversation { attempt_id } => {
                // A session that already ended has its result on the way.
                if !self.sessions.hung_up(&attempt_id) {
                    debug!(
                        event_name = "dispatch.session_finishing",
                        attempt_id = %attempt_id,
                        "no live session to finalize"
                    );
                }
            }
            Command::CancelConversation { attempt_id, reason } => {
                if !self.sessions.cancel(&attempt_id, &reason) {
                    debug!(
                        event_name = "dispatch.session_finishing",
                        attempt_id = %attempt_id,
                        reason = %reason,
                        "no live session to cancel"
                    );
                }
            }
            Command::HangUp { attempt_id, provider_call_id } => {
                let telephony = Arc::clone(&self.collaborators.telephony);
                tokio::spawn(async move {
                    if let Err(error) = telephony.hang_up(&provider_call_id).await {
                        warn!(
                            event_name = "telephony.hang_up_failed",
                            attempt_id = %attempt_id,
                            provider_call_id = %provider_call_id,
                            error = %error,
                            "provider did not end the call"
                        );
                    }
                });
            }
            Command::RecordOutcome { attempt } => self.recorder.submit(*attempt),
            Command::ProposeMeeting { attempt_id, request, not_before } => {
                let scheduling = Arc::clone(&self.collaborators.scheduling);
                let dispatch = self.handle.clone();
                let wait = until(not_before, now);
                tokio::spawn(async move {
                    tokio::time::sleep(wait).await;
                    let event = match scheduling.propose_slot(request).await {
                        Ok(slot) => DispatchEvent::MeetingBooked { attempt_id, slot },
                        Err(error) => DispatchEvent::MeetingFailed { attempt_id, error },
                    };
                    dispatch.send(event).await;
                });
            }
        }
    }
}

/// Transient dial failures are retried here before they reach the attempt.
async fn place_with_retry(
    telephony: &dyn TelephonyProvider,
    request: PlaceCallRequest,
) -> Result<String, CollaboratorError> {
    let mut retries = 0;
    loop {
        match telephony.place_call(request.clone()).await {
            Err(error) if error.is_transient() && retries < DIAL_RETRIES => {
                retries += 1;
                warn!(
                    event_name = "telephony.dial_retry",
                    attempt_id = %request.attempt_id,
                    retries,
                    error = %error,
                    "retrying dial request"
                );
                tokio::time::sleep(DIAL_RETRY_BASE * 2_u32.pow(retries - 1)).await;
            }
            result => return result,
        }
    }
}

fn until(deadline: DateTime<Utc>, now: DateTime<Utc>) -> StdDuration {
    (deadline - now).to_std().unwrap_or(StdDuration::ZERO)
}

/// Late and duplicate callbacks are expected; anything else is worth a warning.
fn log_ignored(attempt_id: &CallAttemptId, cause: &str, error: &DomainError) {
    let expected = error.is_stale_event()
        || matches!(
            error,
            DomainError::CallTransition(CallTransitionError::InvalidTransition { .. })
        );
    if expected {
        debug!(
            event_name = "dispatch.event_ignored",
            attempt_id = %attempt_id,
            cause,
            error = %error,
            "event does not apply to the attempt"
        );
    } else {
        warn!(
            event_name = "dispatch.event_rejected",
            attempt_id = %attempt_id,
            cause,
            error = %error,
            "event could not be applied"
        );
    }
}

#[cfg(test)]
mod tests;
