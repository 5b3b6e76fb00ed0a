//! Property-based tests for the orchestrator
//!
//! Random interleavings of lead arrival, scheduler ticks, telephony events
//! and conversation results must never break the per-lead invariants.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;

use super::{Orchestrator, OrchestratorConfig, Step};
use crate::audit::{verify_history, TransitionRecord};
use crate::domain::call::{CallAttemptId, CallState};
use crate::domain::lead::{LeadId, RawLead};
use crate::domain::qualification::{MeetingSlot, QualificationResult, QualificationVerdict};
use crate::domain::transcript::Transcript;
use crate::flows::CallEvent;

const LEADS: u8 = 5;
const SLOTS: usize = 2;
const CEILING: u32 = 3;

#[derive(Clone, Debug)]
enum Op {
    Ingest(u8),
    Tick(u32),
    Event(u8, CallEvent),
    Complete(u8, QualificationVerdict),
    FailConversation(u8),
    Booked(u8),
    MeetingFailed(u8),
    Cancel(u8),
    Halt,
    Resume,
}

fn arb_verdict() -> impl Strategy<Value = QualificationVerdict> {
    prop_oneof![
        Just(QualificationVerdict::Qualified),
        Just(QualificationVerdict::Disqualified),
        Just(QualificationVerdict::Inconclusive),
    ]
}

fn arb_event() -> impl Strategy<Value = CallEvent> {
    prop_oneof![
        Just(CallEvent::Answered),
        Just(CallEvent::MachineDetected),
        Just(CallEvent::DialTimedOut),
        Just(CallEvent::NoAnswerReported),
        Just(CallEvent::HungUp),
        Just(CallEvent::TelephonyRejected { reason: "busy".to_owned() }),
        Just(CallEvent::DialErrored { reason: "timeout".to_owned() }),
        Just(CallEvent::MeetingBooked),
    ]
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..LEADS).prop_map(Op::Ingest),
        4 => (1u32..1_200).prop_map(Op::Tick),
        6 => (any::<u8>(), arb_event()).prop_map(|(pick, event)| Op::Event(pick, event)),
        2 => (any::<u8>(), arb_verdict()).prop_map(|(pick, verdict)| Op::Complete(pick, verdict)),
        1 => any::<u8>().prop_map(Op::FailConversation),
        1 => any::<u8>().prop_map(Op::Booked),
        1 => any::<u8>().prop_map(Op::MeetingFailed),
        1 => any::<u8>().prop_map(Op::Cancel),
        1 => Just(Op::Halt),
        1 => Just(Op::Resume),
    ]
}

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).single().expect("timestamp")
}

fn raw(index: u8) -> RawLead {
    RawLead {
        id: format!("lead-{index}"),
        first_name: Some("Prop".to_owned()),
        last_name: None,
        phone: Some(format!("555010{index:04}")),
        email: None,
        company: None,
        created_at: start() - Duration::minutes(i64::from(index)),
    }
}

fn pick(orchestrator: &Orchestrator, index: u8) -> Option<CallAttemptId> {
    let mut ids: Vec<CallAttemptId> =
        orchestrator.attempts().map(|attempt| attempt.id.clone()).collect();
    if ids.is_empty() {
        return None;
    }
    ids.sort();
    Some(ids[usize::from(index) % ids.len()].clone())
}

fn apply(orchestrator: &mut Orchestrator, op: &Op, now: DateTime<Utc>) -> Step {
    let result = match op {
        Op::Ingest(index) => {
            orchestrator.ingest(vec![raw(*index)], now);
            Ok(Step::default())
        }
        Op::Tick(_) => Ok(orchestrator.tick(now)),
        Op::Event(index, event) => match pick(orchestrator, *index) {
            Some(id) => orchestrator.apply(&id, event.clone(), now),
            None => Ok(Step::default()),
        },
        Op::Complete(index, verdict) => match pick(orchestrator, *index) {
            Some(id) => orchestrator.complete_conversation(
                &id,
                Transcript::new(),
                QualificationResult {
                    verdict: *verdict,
                    availability: None,
                    confidence: 50,
                    score: 0,
                    reason: "generated".to_owned(),
                },
                now,
            ),
            None => Ok(Step::default()),
        },
        Op::FailConversation(index) => match pick(orchestrator, *index) {
            Some(id) => orchestrator.fail_conversation(&id, Transcript::new(), "generated", now),
            None => Ok(Step::default()),
        },
        Op::Booked(index) => match pick(orchestrator, *index) {
            Some(id) => orchestrator.meeting_booked(
                &id,
                MeetingSlot {
                    starts_at: now + Duration::days(1),
                    duration_minutes: 30,
                    booking_reference: "generated".to_owned(),
                },
                now,
            ),
            None => Ok(Step::default()),
        },
        Op::MeetingFailed(index) => match pick(orchestrator, *index) {
            Some(id) => orchestrator.meeting_failed(&id, now),
            None => Ok(Step::default()),
        },
        Op::Cancel(index) => match pick(orchestrator, *index) {
            Some(id) => orchestrator.cancel(&id, "operator", now),
            None => Ok(Step::default()),
        },
        Op::Halt => {
            orchestrator.halt_dialing("generated");
            Ok(Step::default())
        }
        Op::Resume => {
            orchestrator.resume_dialing();
            Ok(Step::default())
        }
    };
    // Rejected events are part of the input space; they must not mutate anything.
    result.unwrap_or_default()
}

fn check_invariants(
    orchestrator: &Orchestrator,
    log: &[TransitionRecord],
) -> Result<(), TestCaseError> {
    let mut active_per_lead: HashMap<LeadId, usize> = HashMap::new();
    for attempt in orchestrator.attempts().filter(|attempt| attempt.is_active()) {
        *active_per_lead.entry(attempt.lead_id.clone()).or_default() += 1;
    }
    for (lead_id, count) in &active_per_lead {
        prop_assert!(*count <= 1, "lead {lead_id} has {count} non-terminal attempts");
    }

    for index in 0..LEADS {
        if let Some(lead) = orchestrator.lead(&LeadId(format!("lead-{index}"))) {
            prop_assert!(lead.attempt_count <= CEILING, "lead {} over ceiling", lead.id);
        }
    }

    prop_assert!(orchestrator.slots_in_use() <= SLOTS);
    let dialing_or_live = orchestrator
        .attempts()
        .filter(|attempt| {
            matches!(
                attempt.state,
                CallState::Dialing | CallState::Connected | CallState::Conversing
            )
        })
        .count();
    prop_assert!(dialing_or_live <= SLOTS, "{dialing_or_live} calls hold {SLOTS} slots");

    let mut histories: BTreeMap<&CallAttemptId, Vec<TransitionRecord>> = BTreeMap::new();
    for record in log {
        histories.entry(&record.attempt_id).or_default().push(record.clone());
    }
    for (attempt_id, history) in histories {
        let verdict = verify_history(&history, false);
        prop_assert!(verdict.is_ok(), "attempt {attempt_id}: {verdict:?}");
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn random_interleavings_preserve_attempt_invariants(
        ops in proptest::collection::vec(arb_op(), 1..120)
    ) {
        let config = OrchestratorConfig {
            max_concurrent_calls: SLOTS,
            max_queued_attempts: 3,
            ..Default::default()
        };
        let mut orchestrator = Orchestrator::new(config);
        let mut log = Vec::new();
        let mut now = start();

        for op in &ops {
            if let Op::Tick(seconds) = op {
                now += Duration::seconds(i64::from(*seconds));
            }
            let step = apply(&mut orchestrator, op, now);
            log.extend(step.transitions);
            check_invariants(&orchestrator, &log)?;
        }
    }

    #[test]
    fn rejected_events_leave_state_untouched(
        event in arb_event(),
        verdict in arb_verdict(),
    ) {
        let mut orchestrator = Orchestrator::new(OrchestratorConfig::default());
        orchestrator.ingest(vec![raw(0)], start());
        orchestrator.tick(start());
        let id = pick(&orchestrator, 0).expect("attempt exists");
        orchestrator.apply(&id, CallEvent::Answered, start()).expect("answered");
        orchestrator
            .complete_conversation(
                &id,
                Transcript::new(),
                QualificationResult {
                    verdict,
                    availability: None,
                    confidence: 80,
                    score: 1,
                    reason: "generated".to_owned(),
                },
                start(),
            )
            .expect("completed");

        let before = orchestrator.attempt(&id).cloned();
        let result = orchestrator.apply(&id, event.clone(), start() + Duration::seconds(1));
        if result.is_err() {
            prop_assert_eq!(orchestrator.attempt(&id).cloned(), before);
        } else {
            prop_assert_eq!(event, CallEvent::MeetingBooked);
        }
    }
}
