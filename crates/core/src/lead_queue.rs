//! Lead intake and eligibility.
//!
//! The queue owns every ingested [`Lead`] and the scalar counters the
//! orchestrator mutates. Call attempts never live here; they reference
//! leads by id.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use crate::backoff::RetryBackoff;
use crate::business_hours::BusinessHours;
use crate::domain::lead::{Lead, LeadId, LeadStatus, RawLead};
use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeadQueuePolicy {
    /// Leads older than this are never dialed.
    pub max_age: Duration,
    /// Maximum number of consumed attempts per lead.
    pub retry_ceiling: u32,
    pub backoff: RetryBackoff,
}

impl Default for LeadQueuePolicy {
    fn default() -> Self {
        Self { max_age: Duration::hours(24), retry_ceiling: 3, backoff: RetryBackoff::default() }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub accepted: Vec<LeadId>,
    pub duplicates: Vec<LeadId>,
    pub stale: Vec<LeadId>,
    pub rejected: Vec<(String, DomainError)>,
}

impl IngestReport {
    pub fn accepted_count(&self) -> usize {
        self.accepted.len()
    }
}

/// What happened to a lead after an attempt ended without a final outcome.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequeueDecision {
    RetryAt(DateTime<Utc>),
    Exhausted,
}

#[derive(Clone, Debug, Default)]
pub struct LeadQueue {
    leads: HashMap<LeadId, Lead>,
    policy: LeadQueuePolicy,
}

impl LeadQueue {
    pub fn new(policy: LeadQueuePolicy) -> Self {
        Self { leads: HashMap::new(), policy }
    }

    pub fn policy(&self) -> &LeadQueuePolicy {
        &self.policy
    }

    pub fn ingest(&mut self, raw_leads: Vec<RawLead>, now: DateTime<Utc>) -> IngestReport {
        let mut report = IngestReport::default();

        for raw in raw_leads {
            let raw_id = raw.id.clone();
            let lead = match Lead::from_raw(raw, now) {
                Ok(lead) => lead,
                Err(error) => {
                    report.rejected.push((raw_id, error));
                    continue;
                }
            };

            if self.leads.contains_key(&lead.id) {
                report.duplicates.push(lead.id);
                continue;
            }
            if !self.within_age(&lead, now) {
                report.stale.push(lead.id);
                continue;
            }

            report.accepted.push(lead.id.clone());
            self.leads.insert(lead.id.clone(), lead);
        }

        report
    }

    /// Leads that may be dialed right now, oldest first.
    pub fn next_eligible(&self, now: DateTime<Utc>, hours: &BusinessHours) -> Vec<&Lead> {
        if !hours.contains(now) {
            return Vec::new();
        }

        let mut eligible: Vec<&Lead> =
            self.leads.values().filter(|lead| self.is_eligible(lead, now)).collect();
        eligible.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        eligible
    }

    pub fn is_eligible(&self, lead: &Lead, now: DateTime<Utc>) -> bool {
        lead.status == LeadStatus::Pending
            && self.within_age(lead, now)
            && lead.attempt_count < self.policy.retry_ceiling
            && lead.next_eligible_at.map_or(true, |at| at <= now)
    }

    pub fn get(&self, id: &LeadId) -> Option<&Lead> {
        self.leads.get(id)
    }

    pub fn len(&self) -> usize {
        self.leads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leads.is_empty()
    }

    /// Marks the lead as owning an active attempt.
    pub fn activate(&mut self, id: &LeadId) -> Result<&Lead, DomainError> {
        let lead = self.lead_mut(id)?;
        if lead.status != LeadStatus::Pending {
            return Err(DomainError::InvariantViolation(format!(
                "lead `{id}` cannot start an attempt while {}",
                lead.status.as_str()
            )));
        }
        lead.status = LeadStatus::Active;
        Ok(lead)
    }

    pub fn record_dial(&mut self, id: &LeadId, now: DateTime<Utc>) -> Result<(), DomainError> {
        self.lead_mut(id)?.last_attempt_at = Some(now);
        Ok(())
    }

    /// Returns an active lead to the queue after an unsuccessful attempt.
    pub fn requeue(
        &mut self,
        id: &LeadId,
        consume_attempt: bool,
        now: DateTime<Utc>,
    ) -> Result<RequeueDecision, DomainError> {
        let ceiling = self.policy.retry_ceiling;
        let backoff = self.policy.backoff;
        let lead = self.lead_mut(id)?;

        if consume_attempt {
            lead.attempt_count = (lead.attempt_count + 1).min(ceiling);
        }
        if lead.attempt_count >= ceiling {
            lead.status = LeadStatus::Exhausted;
            lead.next_eligible_at = None;
            return Ok(RequeueDecision::Exhausted);
        }

        let delay = backoff.delay_after(lead.attempt_count.max(1));
        let at = now + delay;
        lead.status = LeadStatus::Pending;
        lead.next_eligible_at = Some(at);
        Ok(RequeueDecision::RetryAt(at))
    }

    /// Non-retryable rejection: no further attempts.
    pub fn exhaust(&mut self, id: &LeadId) -> Result<(), DomainError> {
        let lead = self.lead_mut(id)?;
        lead.status = LeadStatus::Exhausted;
        lead.next_eligible_at = None;
        Ok(())
    }

    /// A final conversation outcome was reached.
    pub fn archive(&mut self, id: &LeadId) -> Result<(), DomainError> {
        let ceiling = self.policy.retry_ceiling;
        let lead = self.lead_mut(id)?;
        lead.attempt_count = (lead.attempt_count + 1).min(ceiling);
        lead.status = LeadStatus::Archived;
        lead.next_eligible_at = None;
        Ok(())
    }

    /// Drops settled leads that the lead source can no longer return.
    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let horizon = now - self.policy.max_age * 2;
        let before = self.leads.len();
        self.leads
            .retain(|_, lead| lead.status == LeadStatus::Active || lead.created_at >= horizon);
        before - self.leads.len()
    }

    fn within_age(&self, lead: &Lead, now: DateTime<Utc>) -> bool {
        now - lead.created_at <= self.policy.max_age
    }

    fn lead_mut(&mut self, id: &LeadId) -> Result<&mut Lead, DomainError> {
        self.leads
            .get_mut(id)
            .ok_or_else(|| DomainError::InvariantViolation(format!("unknown lead `{id}`")))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, TimeZone, Utc};

    use super::{LeadQueue, LeadQueuePolicy, RequeueDecision};
    use crate::business_hours::{parse_clock, BusinessHours};
    use crate::domain::lead::{LeadId, LeadStatus, RawLead};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, 15, 0, 0).single().expect("timestamp")
    }

    fn raw(id: &str, age: Duration) -> RawLead {
        RawLead {
            id: id.to_owned(),
            first_name: Some("Sam".to_owned()),
            last_name: None,
            phone: Some("5550100000".to_owned()),
            email: None,
            company: None,
            created_at: now() - age,
        }
    }

    fn open() -> BusinessHours {
        BusinessHours::always_open()
    }

    #[test]
    fn ingest_dedupes_and_rejects_missing_phone() {
        let mut queue = LeadQueue::new(LeadQueuePolicy::default());
        let mut no_phone = raw("lead-3", Duration::hours(1));
        no_phone.phone = None;

        let report = queue.ingest(
            vec![raw("lead-1", Duration::hours(1)), raw("lead-1", Duration::hours(1)), no_phone],
            now(),
        );

        assert_eq!(report.accepted_count(), 1);
        assert_eq!(report.duplicates, vec![LeadId("lead-1".to_owned())]);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(queue.len(), 1);

        let again = queue.ingest(vec![raw("lead-1", Duration::hours(1))], now());
        assert_eq!(again.accepted_count(), 0, "re-polled leads are skipped");
    }

    #[test]
    fn twenty_five_hour_old_lead_is_never_eligible() {
        let mut queue = LeadQueue::new(LeadQueuePolicy::default());
        let report = queue.ingest(vec![raw("old", Duration::hours(25))], now());
        assert_eq!(report.stale, vec![LeadId("old".to_owned())]);
        assert!(queue.next_eligible(now(), &open()).is_empty());

        // A lead that ages out while waiting is filtered as well.
        queue.ingest(vec![raw("fresh", Duration::hours(23))], now());
        assert_eq!(queue.next_eligible(now(), &open()).len(), 1);
        assert!(queue.next_eligible(now() + Duration::hours(2), &open()).is_empty());
    }

    #[test]
    fn eligible_leads_are_oldest_first() {
        let mut queue = LeadQueue::new(LeadQueuePolicy::default());
        queue.ingest(
            vec![
                raw("b", Duration::hours(1)),
                raw("a", Duration::hours(3)),
                raw("c", Duration::hours(2)),
            ],
            now(),
        );
        let order: Vec<_> =
            queue.next_eligible(now(), &open()).iter().map(|lead| lead.id.0.clone()).collect();
        assert_eq!(order, vec!["a", "c", "b"]);
    }

    #[test]
    fn outside_business_hours_nothing_is_eligible() {
        let mut queue = LeadQueue::new(LeadQueuePolicy::default());
        queue.ingest(vec![raw("a", Duration::hours(1))], now());
        let closed = BusinessHours {
            start: parse_clock("09:00").expect("start"),
            end: parse_clock("10:00").expect("end"),
            utc_offset_minutes: 0,
        };
        assert!(queue.next_eligible(now(), &closed).is_empty());
    }

    #[test]
    fn requeue_applies_backoff_then_exhausts_at_ceiling() {
        let mut queue = LeadQueue::new(LeadQueuePolicy::default());
        queue.ingest(vec![raw("a", Duration::hours(1))], now());
        let id = LeadId("a".to_owned());

        queue.activate(&id).expect("activate");
        let decision = queue.requeue(&id, true, now()).expect("requeue");
        assert_eq!(decision, RequeueDecision::RetryAt(now() + Duration::minutes(15)));
        assert!(queue.next_eligible(now() + Duration::minutes(14), &open()).is_empty());
        assert_eq!(queue.next_eligible(now() + Duration::minutes(15), &open()).len(), 1);

        queue.activate(&id).expect("activate");
        let decision = queue.requeue(&id, true, now()).expect("requeue");
        assert_eq!(decision, RequeueDecision::RetryAt(now() + Duration::minutes(30)));

        queue.activate(&id).expect("activate");
        assert_eq!(queue.requeue(&id, true, now()).expect("requeue"), RequeueDecision::Exhausted);

        let lead = queue.get(&id).expect("lead");
        assert_eq!(lead.attempt_count, 3);
        assert_eq!(lead.status, LeadStatus::Exhausted);
        assert!(queue.next_eligible(now() + Duration::days(1), &open()).is_empty());
    }

    #[test]
    fn transient_requeue_keeps_attempt_count() {
        let mut queue = LeadQueue::new(LeadQueuePolicy::default());
        queue.ingest(vec![raw("a", Duration::hours(1))], now());
        let id = LeadId("a".to_owned());
        queue.activate(&id).expect("activate");
        queue.requeue(&id, false, now()).expect("requeue");
        assert_eq!(queue.get(&id).map(|lead| lead.attempt_count), Some(0));
    }

    #[test]
    fn activating_an_active_lead_is_an_invariant_violation() {
        let mut queue = LeadQueue::new(LeadQueuePolicy::default());
        queue.ingest(vec![raw("a", Duration::hours(1))], now());
        let id = LeadId("a".to_owned());
        queue.activate(&id).expect("first activation");
        assert!(queue.activate(&id).is_err());
    }

    #[test]
    fn prune_keeps_active_and_recent_leads() {
        let mut queue = LeadQueue::new(LeadQueuePolicy::default());
        queue.ingest(vec![raw("a", Duration::hours(1)), raw("b", Duration::hours(2))], now());
        queue.archive(&LeadId("a".to_owned())).expect("archive");
        queue.activate(&LeadId("b".to_owned())).expect("activate");

        let removed = queue.prune(now() + Duration::hours(72));
        assert_eq!(removed, 1);
        assert!(queue.get(&LeadId("b".to_owned())).is_some());
    }
}
