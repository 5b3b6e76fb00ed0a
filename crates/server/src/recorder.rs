//! Outcome recorder.
//!
//! Terminal attempts are handed over with a non-blocking send. A background
//! worker persists them with bounded, exponentially spaced retries and
//! dead-letters whatever still fails. Every stored outcome, and the later
//! `Scheduled` upgrade, is broadcast once to subscribers.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use setter_core::config::RecorderConfig;
use setter_core::domain::call::{CallAttempt, CallAttemptId, CallState};
use setter_core::domain::lead::LeadId;
use setter_db::{CallRecordRepository, DeadLetter, DeadLetterRepository, RecordWrite};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const EVENT_BUFFER: usize = 128;
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Published once per stored terminal state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutcomeEvent {
    pub attempt_id: CallAttemptId,
    pub lead_id: LeadId,
    pub state: CallState,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordStatus {
    Written(RecordWrite),
    DeadLettered { last_error: String },
}

/// Sending side held by the dispatcher.
#[derive(Clone)]
pub struct RecorderHandle {
    tx: mpsc::Sender<CallAttempt>,
    events: broadcast::Sender<OutcomeEvent>,
}

impl RecorderHandle {
    /// Never waits. A full channel hands the attempt to a short-lived task.
    pub fn submit(&self, attempt: CallAttempt) {
        match self.tx.try_send(attempt) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(attempt)) => {
                warn!(
                    event_name = "outcome.backpressure",
                    attempt_id = %attempt.id,
                    "recorder queue is full"
                );
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let attempt_id = attempt.id.clone();
                    if tx.send(attempt).await.is_err() {
                        error!(
                            event_name = "outcome.lost",
                            attempt_id = %attempt_id,
                            "recorder stopped before the outcome was queued"
                        );
                    }
                });
            }
            Err(mpsc::error::TrySendError::Closed(attempt)) => {
                error!(
                    event_name = "outcome.lost",
                    attempt_id = %attempt.id,
                    "recorder is not running"
                );
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OutcomeEvent> {
        self.events.subscribe()
    }
}

pub struct OutcomeRecorder {
    records: Arc<dyn CallRecordRepository>,
    dead_letters: Arc<dyn DeadLetterRepository>,
    config: RecorderConfig,
    events: broadcast::Sender<OutcomeEvent>,
}

impl OutcomeRecorder {
    pub fn new(
        records: Arc<dyn CallRecordRepository>,
        dead_letters: Arc<dyn DeadLetterRepository>,
        config: RecorderConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self { records, dead_letters, config, events }
    }

    /// Starts the worker. It stops once every handle is dropped and the
    /// queue is drained.
    pub fn spawn(self) -> (RecorderHandle, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<CallAttempt>(self.config.channel_capacity.max(1));
        let handle = RecorderHandle { tx, events: self.events.clone() };
        let worker = tokio::spawn(async move {
            while let Some(attempt) = rx.recv().await {
                self.record(&attempt).await;
            }
            debug!(event_name = "outcome.recorder_stopped", "outcome recorder drained");
        });
        (handle, worker)
    }

    pub async fn record(&self, attempt: &CallAttempt) -> RecordStatus {
        let max_attempts = self.config.max_attempts.max(1);
        let mut tries = 0;
        loop {
            tries += 1;
            let now = Utc::now();
            match self.records.record(attempt, now).await {
                Ok(write) => {
                    self.announce(attempt, write, now);
                    return RecordStatus::Written(write);
                }
                Err(error) if tries < max_attempts => {
                    let delay = self.retry_delay(tries);
                    warn!(
                        event_name = "outcome.retry",
                        attempt_id = %attempt.id,
                        lead_id = %attempt.lead_id,
                        tries,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %error,
                        "outcome write failed"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => {
                    let last_error = error.to_string();
                    self.dead_letter(attempt, &last_error, tries, now).await;
                    return RecordStatus::DeadLettered { last_error };
                }
            }
        }
    }

    fn retry_delay(&self, tries: u32) -> Duration {
        let factor = 1_u64 << tries.saturating_sub(1).min(16);
        Duration::from_millis(self.config.retry_base_ms.saturating_mul(factor)).min(MAX_RETRY_DELAY)
    }

    fn announce(&self, attempt: &CallAttempt, write: RecordWrite, now: DateTime<Utc>) {
        if write == RecordWrite::Duplicate {
            debug!(
                event_name = "outcome.duplicate",
                attempt_id = %attempt.id,
                state = attempt.state.as_str(),
                "outcome already recorded"
            );
            return;
        }
        info!(
            event_name = "outcome.recorded",
            attempt_id = %attempt.id,
            lead_id = %attempt.lead_id,
            state = attempt.state.as_str(),
            upgraded = write == RecordWrite::Upgraded,
            "call outcome recorded"
        );
        // No subscribers is fine.
        let _ = self.events.send(OutcomeEvent {
            attempt_id: attempt.id.clone(),
            lead_id: attempt.lead_id.clone(),
            state: attempt.state,
            recorded_at: now,
        });
    }

    async fn dead_letter(
        &self,
        attempt: &CallAttempt,
        last_error: &str,
        tries: u32,
        now: DateTime<Utc>,
    ) {
        error!(
            event_name = "outcome.dead_lettered",
            attempt_id = %attempt.id,
            lead_id = %attempt.lead_id,
            state = attempt.state.as_str(),
            tries,
            error = %last_error,
            "call outcome could not be recorded"
        );
        let pushed = match DeadLetter::new(attempt, last_error, tries, now) {
            Ok(letter) => self.dead_letters.push(&letter).await,
            Err(error) => Err(error),
        };
        if let Err(error) = pushed {
            error!(
                event_name = "outcome.dead_letter_failed",
                attempt_id = %attempt.id,
                error = %error,
                "dead letter could not be stored"
            );
        }
    }
}
