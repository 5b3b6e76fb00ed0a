//! Call orchestrator
//!
//! A single, explicitly owned scheduler context. It holds the lead queue,
//! every live call attempt and the concurrency slot pool, and is mutated only
//! by whoever drives it (one dispatcher loop in production, tests directly).
//!
//! Every mutation returns a [`Step`]: the transition log entries that must be
//! persisted and the side effects the driver must execute. Nothing in here
//! performs I/O or reads the clock, so every scenario can be replayed with
//! explicit timestamps.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Duration, Utc};

use crate::audit::TransitionRecord;
use crate::business_hours::BusinessHours;
use crate::domain::call::{CallAttempt, CallAttemptId, CallFailure, CallState, FailureKind};
use crate::domain::lead::{Lead, LeadId, RawLead};
use crate::domain::qualification::{MeetingSlot, QualificationResult};
use crate::domain::transcript::Transcript;
use crate::errors::DomainError;
use crate::flows::{CallAction, CallEvent, CallFlowEngine, CallTransitionError};
use crate::lead_queue::{IngestReport, LeadQueue, LeadQueuePolicy, RequeueDecision};
use crate::ports::MeetingRequest;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Size of the concurrency slot pool.
    pub max_concurrent_calls: usize,
    /// Upper bound on attempts waiting in `Queued` for a slot.
    pub max_queued_attempts: usize,
    pub dial_timeout: Duration,
    pub max_call_duration: Duration,
    /// Extra time a conversation gets to wind down before it is cancelled,
    /// and again before it is force-failed.
    pub wind_down_grace: Duration,
    pub stale_after: Duration,
    /// Cancel live calls once the business-hour window closes.
    pub cancel_outside_hours: bool,
    pub business_hours: BusinessHours,
    pub max_meeting_retries: u32,
    pub meeting_retry_base: Duration,
    /// How long finished attempts stay readable before they are dropped.
    pub finished_retention: Duration,
    pub queue: LeadQueuePolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 2,
            max_queued_attempts: 20,
            dial_timeout: Duration::seconds(30),
            max_call_duration: Duration::seconds(300),
            wind_down_grace: Duration::seconds(30),
            stale_after: Duration::seconds(60),
            cancel_outside_hours: false,
            business_hours: BusinessHours::always_open(),
            max_meeting_retries: 5,
            meeting_retry_base: Duration::seconds(60),
            finished_retention: Duration::hours(1),
            queue: LeadQueuePolicy::default(),
        }
    }
}

/// Side effect requested by the orchestrator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    PlaceCall { attempt_id: CallAttemptId, lead: Lead },
    ArmDialTimeout { attempt_id: CallAttemptId, deadline: DateTime<Utc> },
    StartConversation { attempt_id: CallAttemptId, lead: Lead, deadline: DateTime<Utc> },
    FinalizeConversation { attempt_id: CallAttemptId },
    CancelConversation { attempt_id: CallAttemptId, reason: String },
    HangUp { attempt_id: CallAttemptId, provider_call_id: String },
    RecordOutcome { attempt: Box<CallAttempt> },
    ProposeMeeting {
        attempt_id: CallAttemptId,
        request: MeetingRequest,
        not_before: DateTime<Utc>,
    },
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Step {
    pub transitions: Vec<TransitionRecord>,
    pub commands: Vec<Command>,
}

impl Step {
    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty() && self.commands.is_empty()
    }

    pub fn merge(&mut self, other: Step) {
        self.transitions.extend(other.transitions);
        self.commands.extend(other.commands);
    }
}

/// Read-model row for a call that has not ended yet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InFlightCall {
    pub attempt_id: CallAttemptId,
    pub lead_id: LeadId,
    pub state: CallState,
    pub retry_count: u32,
    pub provider_call_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub stale: bool,
}

#[derive(Clone, Debug, Default)]
struct SlotPool {
    capacity: usize,
    held: HashSet<CallAttemptId>,
}

impl SlotPool {
    fn available(&self) -> usize {
        self.capacity.saturating_sub(self.held.len())
    }

    fn acquire(&mut self, attempt_id: &CallAttemptId) -> bool {
        if self.held.contains(attempt_id) {
            return true;
        }
        if self.available() == 0 {
            return false;
        }
        self.held.insert(attempt_id.clone());
        true
    }

    fn release(&mut self, attempt_id: &CallAttemptId) {
        self.held.remove(attempt_id);
    }
}

#[derive(Clone, Debug)]
pub struct Orchestrator {
    config: OrchestratorConfig,
    engine: CallFlowEngine,
    leads: LeadQueue,
    attempts: HashMap<CallAttemptId, CallAttempt>,
    active_by_lead: HashMap<LeadId, CallAttemptId>,
    queued: VecDeque<CallAttemptId>,
    cancelling: HashSet<CallAttemptId>,
    /// Qualified attempts with a booking request still outstanding; kept
    /// past retention until the booking settles.
    booking: HashSet<CallAttemptId>,
    slots: SlotPool,
    dialing_halted: Option<String>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        let slots = SlotPool { capacity: config.max_concurrent_calls, held: HashSet::new() };
        Self {
            leads: LeadQueue::new(config.queue.clone()),
            config,
            engine: CallFlowEngine::new(),
            attempts: HashMap::new(),
            active_by_lead: HashMap::new(),
            queued: VecDeque::new(),
            cancelling: HashSet::new(),
            booking: HashSet::new(),
            slots,
            dialing_halted: None,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn leads(&self) -> &LeadQueue {
        &self.leads
    }

    pub fn lead(&self, id: &LeadId) -> Option<&Lead> {
        self.leads.get(id)
    }

    pub fn attempt(&self, id: &CallAttemptId) -> Option<&CallAttempt> {
        self.attempts.get(id)
    }

    pub fn attempts(&self) -> impl Iterator<Item = &CallAttempt> {
        self.attempts.values()
    }

    pub fn active_attempt_for(&self, lead_id: &LeadId) -> Option<&CallAttempt> {
        self.active_by_lead.get(lead_id).and_then(|id| self.attempts.get(id))
    }

    pub fn slots_in_use(&self) -> usize {
        self.slots.held.len()
    }

    pub fn ingest(&mut self, raw_leads: Vec<RawLead>, now: DateTime<Utc>) -> IngestReport {
        self.leads.ingest(raw_leads, now)
    }

    /// Stops new attempts from being dialed. In-flight calls are unaffected.
    pub fn halt_dialing(&mut self, reason: impl Into<String>) {
        self.dialing_halted = Some(reason.into());
    }

    pub fn resume_dialing(&mut self) {
        self.dialing_halted = None;
    }

    pub fn dialing_halted(&self) -> Option<&str> {
        self.dialing_halted.as_deref()
    }

    /// Scheduler tick: enforce deadlines, enqueue eligible leads and dial
    /// queued attempts while slots are free.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Step {
        let mut step = Step::default();
        self.prune(now);
        self.enforce_deadlines(now, &mut step);

        let window_open = self.config.business_hours.contains(now);
        if !window_open && self.config.cancel_outside_hours {
            let live: Vec<CallAttemptId> = self.active_by_lead.values().cloned().collect();
            for attempt_id in live {
                self.cancel_into(&attempt_id, "business_hours_closed", now, &mut step);
            }
        }

        if self.dialing_halted.is_some() || !window_open {
            return step;
        }

        self.enqueue_eligible(now, &mut step);
        self.promote_queued(now, &mut step);
        step
    }

    /// Applies an external event to one attempt.
    pub fn apply(
        &mut self,
        attempt_id: &CallAttemptId,
        event: CallEvent,
        now: DateTime<Utc>,
    ) -> Result<Step, DomainError> {
        let mut step = Step::default();
        let state = self.attempt_state(attempt_id)?;

        if state.is_terminal() && event != CallEvent::MeetingBooked {
            return Err(CallTransitionError::AlreadyFinal { state }.into());
        }
        if is_redundant(state, &event) {
            return Ok(step);
        }

        self.transition(attempt_id, event, now, &mut step)?;
        if self.attempt_state(attempt_id)? == CallState::Connected {
            self.transition(attempt_id, CallEvent::ConversationStarted, now, &mut step)?;
        }
        Ok(step)
    }

    /// Provider accepted the dial request.
    pub fn record_provider_call(
        &mut self,
        attempt_id: &CallAttemptId,
        provider_call_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        let attempt = self.attempt_mut(attempt_id)?;
        attempt.provider_call_id = Some(provider_call_id.into());
        attempt.last_heartbeat_at = now;
        Ok(())
    }

    pub fn heartbeat(
        &mut self,
        attempt_id: &CallAttemptId,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        let attempt = self.attempt_mut(attempt_id)?;
        if attempt.is_active() {
            attempt.last_heartbeat_at = now;
        }
        Ok(())
    }

    /// Conversation engine finalized with a result.
    pub fn complete_conversation(
        &mut self,
        attempt_id: &CallAttemptId,
        transcript: Transcript,
        result: QualificationResult,
        now: DateTime<Utc>,
    ) -> Result<Step, DomainError> {
        let verdict = result.verdict;
        {
            let attempt = self.attempt_mut(attempt_id)?;
            if attempt.state == CallState::Conversing {
                attempt.transcript = Some(transcript);
                attempt.qualification = Some(result);
            }
        }
        self.apply(attempt_id, CallEvent::ConversationCompleted { verdict }, now)
    }

    /// Conversation failed unrecoverably. The partial transcript is kept.
    pub fn fail_conversation(
        &mut self,
        attempt_id: &CallAttemptId,
        transcript: Transcript,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<Step, DomainError> {
        {
            let attempt = self.attempt_mut(attempt_id)?;
            if attempt.state == CallState::Conversing {
                attempt.transcript = Some(transcript);
            }
        }
        self.apply(attempt_id, CallEvent::ConversationErrored { reason: reason.into() }, now)
    }

    pub fn meeting_booked(
        &mut self,
        attempt_id: &CallAttemptId,
        slot: MeetingSlot,
        now: DateTime<Utc>,
    ) -> Result<Step, DomainError> {
        {
            let attempt = self.attempt_mut(attempt_id)?;
            if attempt.state == CallState::Qualified {
                attempt.meeting = Some(slot);
            }
        }
        let step = self.apply(attempt_id, CallEvent::MeetingBooked, now)?;
        self.booking.remove(attempt_id);
        Ok(step)
    }

    /// The scheduling service refused the booking outright; the attempt
    /// stays `Qualified` for manual follow-up.
    pub fn meeting_abandoned(&mut self, attempt_id: &CallAttemptId) {
        self.booking.remove(attempt_id);
    }

    /// Scheduling collaborator failed. The attempt stays `Qualified`; only
    /// the booking is retried, up to the configured limit. An empty step
    /// means the booking was given up.
    pub fn meeting_failed(
        &mut self,
        attempt_id: &CallAttemptId,
        now: DateTime<Utc>,
    ) -> Result<Step, DomainError> {
        let max_retries = self.config.max_meeting_retries;
        let base = self.config.meeting_retry_base;
        let attempt = self.attempt_mut(attempt_id)?;
        if attempt.state != CallState::Qualified {
            return Err(CallTransitionError::InvalidTransition {
                state: attempt.state,
                event: CallEvent::MeetingBooked,
            }
            .into());
        }

        attempt.schedule_retries += 1;
        let retries = attempt.schedule_retries;
        let mut step = Step::default();
        if retries > max_retries {
            self.booking.remove(attempt_id);
            return Ok(step);
        }

        let factor = 2_i32.saturating_pow(retries.saturating_sub(1).min(16));
        let not_before = now + base * factor;
        match self.meeting_request(attempt_id, now) {
            Some(request) => {
                self.booking.insert(attempt_id.clone());
                step.commands.push(Command::ProposeMeeting {
                    attempt_id: attempt_id.clone(),
                    request,
                    not_before,
                });
            }
            None => {
                self.booking.remove(attempt_id);
            }
        }
        Ok(step)
    }

    /// Cancels one attempt: queued and dialing attempts fail immediately,
    /// conversations are asked to wrap up.
    pub fn cancel(
        &mut self,
        attempt_id: &CallAttemptId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Step, DomainError> {
        self.attempt_state(attempt_id)?;
        let mut step = Step::default();
        self.cancel_into(attempt_id, reason, now, &mut step);
        Ok(step)
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> Vec<InFlightCall> {
        let mut calls: Vec<InFlightCall> = self
            .attempts
            .values()
            .filter(|attempt| attempt.is_active())
            .map(|attempt| InFlightCall {
                attempt_id: attempt.id.clone(),
                lead_id: attempt.lead_id.clone(),
                state: attempt.state,
                retry_count: attempt.retry_count,
                provider_call_id: attempt.provider_call_id.clone(),
                created_at: attempt.created_at,
                last_heartbeat_at: attempt.last_heartbeat_at,
                stale: now - attempt.last_heartbeat_at > self.config.stale_after,
            })
            .collect();
        calls.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.attempt_id.cmp(&b.attempt_id)));
        calls
    }

    fn enqueue_eligible(&mut self, now: DateTime<Utc>, step: &mut Step) {
        let room = self.config.max_queued_attempts.saturating_sub(self.queued.len());
        let eligible: Vec<LeadId> = self
            .leads
            .next_eligible(now, &self.config.business_hours)
            .into_iter()
            .map(|lead| lead.id.clone())
            .filter(|id| !self.active_by_lead.contains_key(id))
            .take(room)
            .collect();

        for lead_id in eligible {
            let retry_count = match self.leads.activate(&lead_id) {
                Ok(lead) => lead.attempt_count,
                Err(_) => continue,
            };
            let attempt = CallAttempt::new(lead_id.clone(), retry_count, now);
            let cause = if retry_count == 0 { "lead_eligible" } else { "retry_due" };
            step.transitions.push(
                TransitionRecord::new(
                    lead_id.clone(),
                    attempt.id.clone(),
                    None,
                    CallState::Queued,
                    cause,
                    attempt.state_version,
                    now,
                )
                .with_metadata("retry_count", retry_count.to_string()),
            );
            self.active_by_lead.insert(lead_id, attempt.id.clone());
            self.queued.push_back(attempt.id.clone());
            self.attempts.insert(attempt.id.clone(), attempt);
        }
    }

    fn promote_queued(&mut self, now: DateTime<Utc>, step: &mut Step) {
        while self.slots.available() > 0 {
            let Some(attempt_id) = self.queued.pop_front() else {
                break;
            };
            let Some(lead_id) = self.attempts.get(&attempt_id).map(|a| a.lead_id.clone()) else {
                continue;
            };

            let still_fresh = self
                .leads
                .get(&lead_id)
                .map(|lead| now - lead.created_at <= self.leads.policy().max_age)
                .unwrap_or(false);
            if !still_fresh {
                self.cancel_into(&attempt_id, "lead_expired", now, step);
                continue;
            }

            self.slots.acquire(&attempt_id);
            if self.transition(&attempt_id, CallEvent::DialStarted, now, step).is_err() {
                self.slots.release(&attempt_id);
            }
        }
    }

    fn enforce_deadlines(&mut self, now: DateTime<Utc>, step: &mut Step) {
        let grace = self.config.wind_down_grace;
        let max_duration = self.config.max_call_duration;
        let dial_timeout = self.config.dial_timeout;

        let mut timed_out = Vec::new();
        let mut overrunning = Vec::new();
        let mut unresponsive = Vec::new();
        for attempt in self.attempts.values() {
            match attempt.state {
                CallState::Dialing => {
                    if attempt.dial_started_at.is_some_and(|at| now - at >= dial_timeout) {
                        timed_out.push(attempt.id.clone());
                    }
                }
                CallState::Conversing => {
                    let Some(connected_at) = attempt.connected_at else { continue };
                    let elapsed = now - connected_at;
                    if elapsed >= max_duration + grace + grace {
                        unresponsive.push(attempt.id.clone());
                    } else if elapsed >= max_duration + grace {
                        overrunning.push(attempt.id.clone());
                    }
                }
                _ => {}
            }
        }

        for attempt_id in timed_out {
            let _ = self.transition(&attempt_id, CallEvent::DialTimedOut, now, step);
        }
        for attempt_id in overrunning {
            self.cancel_into(&attempt_id, "max_duration_exceeded", now, step);
        }
        for attempt_id in unresponsive {
            let transcript = self.attempts.get(&attempt_id).and_then(|a| a.transcript.clone());
            if let Ok(more) = self.fail_conversation(
                &attempt_id,
                transcript.unwrap_or_default(),
                "conversation_unresponsive",
                now,
            ) {
                step.merge(more);
            }
        }
    }

    fn cancel_into(
        &mut self,
        attempt_id: &CallAttemptId,
        reason: &str,
        now: DateTime<Utc>,
        step: &mut Step,
    ) {
        let Ok(state) = self.attempt_state(attempt_id) else { return };
        if state == CallState::Conversing && !self.cancelling.insert(attempt_id.clone()) {
            return;
        }
        let event = CallEvent::CancelRequested { reason: reason.to_owned() };
        let _ = self.transition(attempt_id, event, now, step);
    }

    fn transition(
        &mut self,
        attempt_id: &CallAttemptId,
        event: CallEvent,
        now: DateTime<Utc>,
        step: &mut Step,
    ) -> Result<(), DomainError> {
        let current = self.attempt_state(attempt_id)?;
        let outcome = self.engine.apply(&current, &event)?;

        let consume = outcome.actions.iter().find_map(|action| match action {
            CallAction::RequeueLead { consume_attempt } => Some(*consume_attempt),
            _ => None,
        });
        let exhausts = outcome.actions.contains(&CallAction::ExhaustLead);

        let (lead_id, provider_call_id, sequence) = {
            let attempt = self.attempt_mut(attempt_id)?;
            attempt.last_heartbeat_at = now;
            if outcome.changes_state() {
                attempt.state = outcome.to;
                attempt.state_version += 1;
                match outcome.to {
                    CallState::Dialing => attempt.dial_started_at = Some(now),
                    CallState::Connected => attempt.connected_at = Some(now),
                    CallState::Scheduled | CallState::Conversing => {}
                    _ if outcome.to.is_terminal() => attempt.ended_at = Some(now),
                    _ => {}
                }
                if outcome.to == CallState::Failed {
                    let kind = if exhausts {
                        FailureKind::Rejected
                    } else if consume == Some(false) {
                        FailureKind::Transient
                    } else {
                        FailureKind::Retryable
                    };
                    attempt.failure = Some(CallFailure { kind, reason: event.cause() });
                }
            }
            (attempt.lead_id.clone(), attempt.provider_call_id.clone(), attempt.state_version)
        };

        let mut record = TransitionRecord::new(
            lead_id.clone(),
            attempt_id.clone(),
            Some(outcome.from),
            outcome.to,
            event.cause(),
            sequence,
            now,
        );
        let mut record_outcome = false;

        for action in &outcome.actions {
            match action {
                CallAction::PlaceCall => {
                    self.leads.record_dial(&lead_id, now)?;
                    let lead = self.lead_snapshot(&lead_id)?;
                    record = record.with_metadata("phone", lead.phone.as_str());
                    step.commands.push(Command::PlaceCall { attempt_id: attempt_id.clone(), lead });
                }
                CallAction::ArmDialTimeout => step.commands.push(Command::ArmDialTimeout {
                    attempt_id: attempt_id.clone(),
                    deadline: now + self.config.dial_timeout,
                }),
                CallAction::StartConversation => {
                    let lead = self.lead_snapshot(&lead_id)?;
                    step.commands.push(Command::StartConversation {
                        attempt_id: attempt_id.clone(),
                        lead,
                        deadline: now + self.config.max_call_duration,
                    });
                }
                CallAction::FinalizeConversation => step
                    .commands
                    .push(Command::FinalizeConversation { attempt_id: attempt_id.clone() }),
                CallAction::CancelConversation => {
                    let reason = match &event {
                        CallEvent::CancelRequested { reason } => reason.clone(),
                        other => other.cause(),
                    };
                    step.commands.push(Command::CancelConversation {
                        attempt_id: attempt_id.clone(),
                        reason,
                    });
                }
                CallAction::HangUp => {
                    if let Some(provider_call_id) = provider_call_id.clone() {
                        step.commands.push(Command::HangUp {
                            attempt_id: attempt_id.clone(),
                            provider_call_id,
                        });
                    }
                }
                CallAction::ReleaseSlot => self.slots.release(attempt_id),
                CallAction::RecordOutcome => record_outcome = true,
                CallAction::ProposeMeeting => {
                    if let Some(request) = self.meeting_request(attempt_id, now) {
                        self.booking.insert(attempt_id.clone());
                        step.commands.push(Command::ProposeMeeting {
                            attempt_id: attempt_id.clone(),
                            request,
                            not_before: now,
                        });
                    }
                }
                CallAction::RequeueLead { consume_attempt } => {
                    self.settle(attempt_id, &lead_id);
                    match self.leads.requeue(&lead_id, *consume_attempt, now)? {
                        RequeueDecision::RetryAt(at) => {
                            record = record.with_metadata("next_attempt_at", at.to_rfc3339());
                        }
                        RequeueDecision::Exhausted => {
                            record = record.with_metadata("lead", "exhausted");
                        }
                    }
                }
                CallAction::ExhaustLead => {
                    self.settle(attempt_id, &lead_id);
                    self.leads.exhaust(&lead_id)?;
                    record = record.with_metadata("lead", "exhausted");
                }
                CallAction::ArchiveLead => {
                    self.settle(attempt_id, &lead_id);
                    self.leads.archive(&lead_id)?;
                }
            }
        }

        if outcome.changes_state() {
            step.transitions.push(record);
        }
        if record_outcome {
            if let Some(attempt) = self.attempts.get(attempt_id) {
                step.commands.push(Command::RecordOutcome { attempt: Box::new(attempt.clone()) });
            }
        }
        Ok(())
    }

    /// Detaches a finished attempt from its lead and from the wait queue.
    fn settle(&mut self, attempt_id: &CallAttemptId, lead_id: &LeadId) {
        if self.active_by_lead.get(lead_id) == Some(attempt_id) {
            self.active_by_lead.remove(lead_id);
        }
        self.queued.retain(|queued| queued != attempt_id);
        self.cancelling.remove(attempt_id);
        self.slots.release(attempt_id);
    }

    fn meeting_request(
        &self,
        attempt_id: &CallAttemptId,
        now: DateTime<Utc>,
    ) -> Option<MeetingRequest> {
        let attempt = self.attempts.get(attempt_id)?;
        let lead = self.leads.get(&attempt.lead_id)?;
        Some(MeetingRequest {
            lead_id: lead.id.clone(),
            attempt_id: attempt_id.clone(),
            lead_name: lead.name.clone(),
            phone: lead.phone.clone(),
            email: lead.email.clone(),
            availability: attempt
                .qualification
                .as_ref()
                .and_then(|result| result.availability.clone()),
            requested_at: now,
        })
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let horizon = now - self.config.finished_retention;
        let booking = &self.booking;
        self.attempts.retain(|attempt_id, attempt| {
            !attempt.state.is_terminal()
                || attempt.ended_at.map_or(true, |at| at >= horizon)
                || (attempt.state == CallState::Qualified && booking.contains(attempt_id))
        });
        let attempts = &self.attempts;
        self.booking.retain(|attempt_id| attempts.contains_key(attempt_id));
        self.leads.prune(now);
    }

    fn lead_snapshot(&self, lead_id: &LeadId) -> Result<Lead, DomainError> {
        self.leads
            .get(lead_id)
            .cloned()
            .ok_or_else(|| DomainError::InvariantViolation(format!("unknown lead `{lead_id}`")))
    }

    fn attempt_state(&self, attempt_id: &CallAttemptId) -> Result<CallState, DomainError> {
        self.attempts
            .get(attempt_id)
            .map(|attempt| attempt.state)
            .ok_or_else(|| DomainError::UnknownAttempt(attempt_id.clone()))
    }

    fn attempt_mut(&mut self, attempt_id: &CallAttemptId) -> Result<&mut CallAttempt, DomainError> {
        self.attempts
            .get_mut(attempt_id)
            .ok_or_else(|| DomainError::UnknownAttempt(attempt_id.clone()))
    }
}

/// Timers and duplicate provider callbacks race with the events that
/// already moved the attempt on.
fn is_redundant(state: CallState, event: &CallEvent) -> bool {
    match event {
        CallEvent::DialTimedOut => state != CallState::Dialing,
        CallEvent::Answered => matches!(state, CallState::Connected | CallState::Conversing),
        _ => false,
    }
}

#[cfg(test)]
mod proptests;
