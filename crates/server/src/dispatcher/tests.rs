use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use setter_agent::LeadInput;
use setter_core::audit::verify_history;
use setter_core::domain::call::{CallAttemptId, CallState};
use setter_core::domain::lead::{LeadId, LeadStatus};
use setter_core::flows::CallEvent;
use setter_core::ports::CollaboratorError;
use setter_db::{CallRecordRepository, TransitionLogRepository};

use super::{DispatchEvent, Dispatcher};
use crate::session::SessionRequest;
use crate::testing::{raw_lead, Harness};

const GREETING: &str = "Hi Dana, this is Sam calling about your enquiry. Got a minute?";

fn state_of(dispatcher: &Dispatcher, attempt_id: &CallAttemptId) -> Option<CallState> {
    dispatcher.orchestrator.attempt(attempt_id).map(|attempt| attempt.state)
}

async fn ingest(harness: &mut Harness, leads: &[(&str, &str)]) {
    let leads = leads.iter().map(|(id, phone)| raw_lead(id, phone)).collect();
    harness.dispatcher.handle_event(DispatchEvent::LeadsFetched { leads }, Utc::now()).await;
}

/// Dials one lead and waits until the provider call id is known.
async fn dial_one(harness: &mut Harness) -> CallAttemptId {
    ingest(harness, &[("lead-1", "+15552223333")]).await;
    harness.tick_at(Utc::now()).await;
    let placed = harness.telephony.wait_for_calls(1).await;
    let attempt_id = placed[0].attempt_id.clone();
    let watched = attempt_id.clone();
    harness
        .pump_until(|d| {
            d.orchestrator.attempt(&watched).is_some_and(|a| a.provider_call_id.is_some())
        })
        .await;
    attempt_id
}

/// Answers the call and lets the lead agree to a meeting.
async fn converse_to_agreement(harness: &mut Harness, attempt_id: &CallAttemptId) {
    let answered = DispatchEvent::Telephony {
        attempt_id: attempt_id.clone(),
        event: CallEvent::Answered,
        ack: None,
    };
    harness.dispatcher.handle_event(answered, Utc::now()).await;
    assert_eq!(state_of(&harness.dispatcher, attempt_id), Some(CallState::Conversing));

    let sessions = harness.dispatcher.sessions();
    let greeting = sessions.request(attempt_id, SessionRequest::Greeting).await.expect("live");
    assert_eq!(greeting.text, GREETING);
    sessions
        .request(attempt_id, |tx| {
            let said = LeadInput::Text("Sure, let's schedule something".to_string());
            SessionRequest::Utterance(said, tx)
        })
        .await
        .expect("live");
}

async fn wait_for_record(
    harness: &Harness,
    attempt_id: &CallAttemptId,
    state: CallState,
) -> setter_db::CallRecord {
    for _ in 0..200 {
        if let Ok(Some(record)) = harness.records.find(attempt_id).await {
            if record.attempt.state == state {
                return record;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no {state:?} record for {attempt_id}");
}

#[tokio::test]
async fn fills_every_slot_and_queues_the_rest() {
    let mut harness = Harness::new(&[]);
    ingest(
        &mut harness,
        &[("lead-a", "+15550000001"), ("lead-b", "+15550000002"), ("lead-c", "+15550000003")],
    )
    .await;

    harness.tick_at(Utc::now()).await;

    let states: Vec<CallState> =
        harness.dispatcher.orchestrator.attempts().map(|attempt| attempt.state).collect();
    assert_eq!(states.iter().filter(|s| **s == CallState::Dialing).count(), 2);
    assert_eq!(states.iter().filter(|s| **s == CallState::Queued).count(), 1);
    assert_eq!(harness.dispatcher.orchestrator.slots_in_use(), 2);
    assert_eq!(harness.telephony.wait_for_calls(2).await.len(), 2);
}

#[tokio::test]
async fn qualified_call_books_a_meeting_and_is_recorded_as_scheduled() {
    let mut harness = Harness::new(&[GREETING]);
    let attempt_id = dial_one(&mut harness).await;

    converse_to_agreement(&mut harness, &attempt_id).await;
    let watched = attempt_id.clone();
    harness.pump_until(|d| state_of(d, &watched) == Some(CallState::Scheduled)).await;

    let history = harness.transition_log.list_for_attempt(&attempt_id).await.expect("history");
    verify_history(&history, true).expect("valid history");
    let path: Vec<CallState> = history.iter().map(|record| record.to_state).collect();
    assert_eq!(
        path,
        vec![
            CallState::Queued,
            CallState::Dialing,
            CallState::Connected,
            CallState::Conversing,
            CallState::Qualified,
            CallState::Scheduled,
        ]
    );

    let record = wait_for_record(&harness, &attempt_id, CallState::Scheduled).await;
    assert!(record.attempt.meeting.is_some());
    assert_eq!(harness.scheduling.requests().len(), 1);

    let lead = harness.dispatcher.orchestrator.lead(&LeadId("lead-1".to_string()));
    assert_eq!(lead.map(|lead| lead.status.clone()), Some(LeadStatus::Archived));
}

#[tokio::test]
async fn storage_outage_halts_dialing_until_the_log_recovers() {
    let mut harness = Harness::new(&[]);
    harness.transition_log.set_available(false);
    ingest(&mut harness, &[("lead-1", "+15552223333")]).await;

    harness.tick_at(Utc::now()).await;
    assert_eq!(
        harness.dispatcher.orchestrator.dialing_halted(),
        Some("transition log unavailable")
    );
    let first_attempt = harness.telephony.wait_for_calls(1).await[0].attempt_id.clone();

    ingest(&mut harness, &[("lead-2", "+15552224444")]).await;
    harness.tick_at(Utc::now()).await;
    assert_eq!(harness.dispatcher.orchestrator.attempts().count(), 1);

    harness.transition_log.set_available(true);
    harness.tick_at(Utc::now()).await;
    assert_eq!(harness.dispatcher.orchestrator.dialing_halted(), None);
    assert!(harness.dispatcher.pending.is_empty());

    let history = harness.transition_log.list_for_attempt(&first_attempt).await.expect("log");
    verify_history(&history, false).expect("buffered entries flushed in order");
    assert_eq!(history.len(), 2);

    harness.tick_at(Utc::now()).await;
    assert_eq!(harness.dispatcher.orchestrator.attempts().count(), 2);
}

#[tokio::test]
async fn unanswered_dial_times_out_and_requeues_the_lead() {
    let mut harness = Harness::new(&[]);
    let attempt_id = dial_one(&mut harness).await;

    harness.tick_at(Utc::now() + ChronoDuration::seconds(31)).await;

    assert_eq!(state_of(&harness.dispatcher, &attempt_id), Some(CallState::NoAnswer));
    assert_eq!(harness.dispatcher.orchestrator.slots_in_use(), 0);
    let lead = harness
        .dispatcher
        .orchestrator
        .lead(&LeadId("lead-1".to_string()))
        .expect("lead is still tracked");
    assert_eq!(lead.status, LeadStatus::Pending);
    assert_eq!(lead.attempt_count, 1);

    wait_for_record(&harness, &attempt_id, CallState::NoAnswer).await;
    for _ in 0..200 {
        if !harness.telephony.hung_up().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(harness.telephony.hung_up(), vec!["CA1".to_string()]);
}

#[tokio::test]
async fn rejected_dial_exhausts_the_lead() {
    let mut harness = Harness::new(&[]);
    harness.telephony.reject_calls("invalid number");
    ingest(&mut harness, &[("lead-1", "+15552223333")]).await;
    harness.tick_at(Utc::now()).await;
    let attempt_id = harness.telephony.wait_for_calls(1).await[0].attempt_id.clone();

    let watched = attempt_id.clone();
    harness.pump_until(|d| state_of(d, &watched) == Some(CallState::Failed)).await;

    let lead = harness.dispatcher.orchestrator.lead(&LeadId("lead-1".to_string()));
    assert_eq!(lead.map(|lead| lead.status.clone()), Some(LeadStatus::Exhausted));

    harness.tick_at(Utc::now() + ChronoDuration::hours(2)).await;
    assert_eq!(harness.telephony.placed().len(), 1);
}

#[tokio::test]
async fn transient_booking_failure_keeps_the_attempt_qualified() {
    let mut harness = Harness::new(&[GREETING]);
    harness.scheduling.fail_next(CollaboratorError::Transient("calendar timeout".to_string()));
    let attempt_id = dial_one(&mut harness).await;

    converse_to_agreement(&mut harness, &attempt_id).await;
    let watched = attempt_id.clone();
    harness
        .pump_until(|d| {
            d.orchestrator.attempt(&watched).is_some_and(|attempt| attempt.schedule_retries == 1)
        })
        .await;

    assert_eq!(state_of(&harness.dispatcher, &attempt_id), Some(CallState::Qualified));
    wait_for_record(&harness, &attempt_id, CallState::Qualified).await;
}

#[tokio::test]
async fn late_callbacks_for_finished_attempts_are_ignored() {
    let mut harness = Harness::new(&[]);
    let attempt_id = dial_one(&mut harness).await;
    harness.tick_at(Utc::now() + ChronoDuration::seconds(31)).await;

    let (ack, applied) = tokio::sync::oneshot::channel();
    let late = DispatchEvent::Telephony {
        attempt_id: attempt_id.clone(),
        event: CallEvent::Answered,
        ack: Some(ack),
    };
    harness.dispatcher.handle_event(late, Utc::now()).await;

    let result = applied.await.expect("acknowledged");
    assert!(result.is_err());
    assert_eq!(state_of(&harness.dispatcher, &attempt_id), Some(CallState::NoAnswer));
}
