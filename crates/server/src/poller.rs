//! Periodic lead intake from the CRM.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use setter_core::ports::LeadSource;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::dispatcher::{DispatchEvent, DispatchHandle};

pub struct LeadPoller {
    source: Arc<dyn LeadSource>,
    dispatch: DispatchHandle,
    every: StdDuration,
    max_age: Duration,
}

impl LeadPoller {
    pub fn new(
        source: Arc<dyn LeadSource>,
        dispatch: DispatchHandle,
        every: StdDuration,
        max_age: Duration,
    ) -> Self {
        Self { source, dispatch, every, max_age }
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Polls immediately, then on every interval, until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            event_name = "crm.poller_started",
            interval_secs = self.every.as_secs(),
            "lead polling started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.poll_once().await {
                        break;
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        info!(event_name = "crm.poller_stopped", "lead polling stopped");
    }

    /// False once the dispatcher is gone.
    pub async fn poll_once(&self) -> bool {
        let since = Utc::now() - self.max_age;
        match self.source.fetch_new_leads(since).await {
            Ok(leads) if leads.is_empty() => {
                debug!(event_name = "crm.poll_empty", "no new leads");
                true
            }
            Ok(leads) => {
                info!(event_name = "crm.leads_fetched", count = leads.len(), "fetched new leads");
                self.dispatch.send(DispatchEvent::LeadsFetched { leads }).await
            }
            Err(error) if error.is_transient() => {
                warn!(
                    event_name = "crm.poll_failed",
                    error = %error,
                    "lead fetch failed, retrying next interval"
                );
                true
            }
            Err(error) => {
                error!(
                    event_name = "crm.poll_rejected",
                    error = %error,
                    "lead source refused the request"
                );
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration as StdDuration;

    use async_trait::async_trait;
    use chrono::{DateTime, Duration, Utc};
    use setter_core::domain::lead::RawLead;
    use setter_core::ports::{CollaboratorError, LeadSource};
    use tokio::sync::watch;

    use super::LeadPoller;
    use crate::dispatcher::{DispatchEvent, DispatchHandle};
    use crate::testing::raw_lead;

    #[derive(Default)]
    struct QueuedSource {
        results: Mutex<Vec<Result<Vec<RawLead>, CollaboratorError>>>,
        since: Mutex<Vec<DateTime<Utc>>>,
    }

    #[async_trait]
    impl LeadSource for QueuedSource {
        async fn fetch_new_leads(
            &self,
            since: DateTime<Utc>,
        ) -> Result<Vec<RawLead>, CollaboratorError> {
            self.since.lock().expect("lock").push(since);
            let mut results = self.results.lock().expect("lock");
            if results.is_empty() {
                Ok(Vec::new())
            } else {
                results.remove(0)
            }
        }
    }

    #[tokio::test]
    async fn fetched_leads_are_forwarded_to_the_dispatcher() {
        let source = Arc::new(QueuedSource::default());
        source.results.lock().expect("lock").push(Ok(vec![raw_lead("lead-1", "+15552223333")]));
        let (dispatch, mut events) = DispatchHandle::channel(4);
        let poller = LeadPoller::new(
            source.clone(),
            dispatch,
            StdDuration::from_secs(60),
            Duration::hours(24),
        );

        assert!(poller.poll_once().await);

        match events.recv().await {
            Some(DispatchEvent::LeadsFetched { leads }) => assert_eq!(leads[0].id, "lead-1"),
            other => panic!("expected fetched leads, got {other:?}"),
        }
        let since = source.since.lock().expect("lock")[0];
        assert!(Utc::now() - since >= Duration::hours(24));
    }

    #[tokio::test]
    async fn failures_keep_polling_without_sending() {
        let source = Arc::new(QueuedSource::default());
        {
            let mut results = source.results.lock().expect("lock");
            results.push(Err(CollaboratorError::Transient("503".to_string())));
            results.push(Err(CollaboratorError::Rejected("401".to_string())));
        }
        let (dispatch, mut events) = DispatchHandle::channel(4);
        let poller =
            LeadPoller::new(source, dispatch, StdDuration::from_secs(60), Duration::hours(24));

        assert!(poller.poll_once().await);
        assert!(poller.poll_once().await);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn stops_on_shutdown() {
        let source = Arc::new(QueuedSource::default());
        let (dispatch, _events) = DispatchHandle::channel(4);
        let poller =
            LeadPoller::new(source, dispatch, StdDuration::from_secs(3600), Duration::hours(24));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = poller.spawn(shutdown_rx);

        shutdown.send(true).expect("poller is listening");

        tokio::time::timeout(StdDuration::from_secs(2), task)
            .await
            .expect("poller stops promptly")
            .expect("poller task completes");
    }
}
