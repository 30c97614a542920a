//! Enrollment state machine.
//!
//! ```text
//! active ──(step sent or failed, more steps)──▶ active
//! active ──(last step done, or replied)───────▶ completed
//! active ──(opt-out)──────────────────────────▶ unsubscribed
//! active ──(campaign stop, permanent failure)─▶ stopped
//! ```
//!
//! Every transition is keyed on the step it concludes, so applying the same
//! outcome twice is a no-op.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::campaign::{Campaign, StepCondition};
use crate::enrollment::{Enrollment, Recipient};
use crate::error::{OutreachError, Result};
use crate::sender::OptOut;
use crate::store::CampaignStore;
use crate::types::EnrollmentState;

/// How one step of one enrollment concluded.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Sent,
    /// Retries exhausted or ban signal: counted, then the sequence moves on.
    Failed { reason: String },
    /// The recipient cannot be reached at all; the sequence ends.
    Stopped { reason: String },
    /// A `no_reply` step found a reply; the sequence ends without sending.
    Replied,
}

pub struct DripSequencer {
    store: Arc<dyn CampaignStore>,
}

impl DripSequencer {
    pub fn new(store: Arc<dyn CampaignStore>) -> Self {
        Self { store }
    }

    /// Enroll `recipient`, scheduling the first step at `now + delay[0]`.
    pub fn enroll(
        &self,
        campaign_id: Uuid,
        recipient: Recipient,
        now: DateTime<Utc>,
    ) -> Result<Enrollment> {
        let campaign = self.store.get_campaign(campaign_id)?;
        if campaign.status.is_terminal() {
            return Err(OutreachError::InvalidTransition {
                from: campaign.status.to_string(),
                to: "enrolled".to_string(),
                reason: "campaign has ended".to_string(),
            });
        }
        let address = recipient.address.trim().to_string();
        if address.is_empty() {
            return Err(OutreachError::Configuration(
                "recipient address must not be empty".into(),
            ));
        }
        if self.store.is_opted_out(&address)? {
            return Err(OutreachError::OptedOut(address));
        }
        let recipient = Recipient {
            address,
            ..recipient
        };
        let missing = campaign.missing_for(&recipient);
        if !missing.is_empty() {
            return Err(OutreachError::Configuration(format!(
                "recipient {} is missing variable(s): {}",
                recipient.address,
                missing.join(", ")
            )));
        }

        let enrollment = Enrollment::new(&campaign, recipient, now);
        self.store.insert_enrollment(&enrollment)?;
        debug!(campaign = %campaign_id, to = %enrollment.address(), "enrolled");
        Ok(enrollment)
    }

    pub fn due_enrollments(
        &self,
        campaign_id: Uuid,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Enrollment>> {
        self.store.get_enrollments_due(campaign_id, now, limit)
    }

    /// True when the enrollment's current step must be skipped because the
    /// recipient already replied.
    pub fn should_skip(campaign: &Campaign, enrollment: &Enrollment) -> bool {
        campaign
            .steps
            .get(enrollment.current_step)
            .is_some_and(|s| s.condition == StepCondition::NoReply)
            && enrollment.replied_at.is_some()
    }

    /// Record how step `step` concluded and move the enrollment on. Returns
    /// `None` when the enrollment had already moved past that step.
    pub fn apply_outcome(
        &self,
        campaign: &Campaign,
        address: &str,
        step: usize,
        outcome: StepOutcome,
        now: DateTime<Utc>,
    ) -> Result<Option<Enrollment>> {
        let mut applied = false;
        let updated = self
            .store
            .update_enrollment(campaign.id, address, &mut |e| {
                applied = false;
                if e.state != EnrollmentState::Active || e.current_step != step {
                    return Ok(());
                }
                applied = true;
                e.updated_at = now;
                match &outcome {
                    StepOutcome::Sent => {
                        e.sent += 1;
                        e.last_error = None;
                    }
                    StepOutcome::Failed { reason } => {
                        e.failed += 1;
                        e.last_error = Some(reason.clone());
                    }
                    StepOutcome::Stopped { reason } => {
                        e.failed += 1;
                        e.last_error = Some(reason.clone());
                        e.state = EnrollmentState::Stopped;
                        e.next_fire_at = None;
                        return Ok(());
                    }
                    StepOutcome::Replied => {
                        e.state = EnrollmentState::Completed;
                        e.next_fire_at = None;
                        return Ok(());
                    }
                }
                let next = step + 1;
                if next >= campaign.steps.len() {
                    e.state = EnrollmentState::Completed;
                    e.next_fire_at = None;
                } else {
                    e.current_step = next;
                    e.next_fire_at = e.fire_time(campaign, next);
                }
                Ok(())
            })?;
        if applied && updated.state == EnrollmentState::Completed {
            debug!(campaign = %campaign.id, to = %address, "enrollment completed");
        }
        Ok(applied.then_some(updated))
    }

    /// Opt `address` out everywhere and end its active enrollments.
    pub fn unsubscribe(&self, address: &str, now: DateTime<Utc>) -> Result<u32> {
        let address = address.trim();
        self.store.add_opt_out(&OptOut {
            address: address.to_string(),
            at: now,
            reason: None,
        })?;
        let count = self.end_active(
            self.store.enrollments_for_recipient(address)?,
            EnrollmentState::Unsubscribed,
            now,
        )?;
        info!(to = %address, enrollments = count, "unsubscribed");
        Ok(count)
    }

    /// Note an inbound reply from `address` to `sender_id`. Returns the number
    /// of enrollments that saw it.
    pub fn record_reply(&self, sender_id: &str, address: &str, now: DateTime<Utc>) -> Result<u32> {
        self.store.mark_reply(sender_id, address)?;
        let mut count = 0;
        for e in self.store.enrollments_for_recipient(address)? {
            if e.state != EnrollmentState::Active || e.replied_at.is_some() {
                continue;
            }
            let campaign = self.store.get_campaign(e.campaign_id)?;
            if campaign.sender_id != sender_id {
                continue;
            }
            self.store
                .update_enrollment(e.campaign_id, address, &mut |e| {
                    e.replied_at.get_or_insert(now);
                    e.updated_at = now;
                    Ok(())
                })?;
            count += 1;
        }
        debug!(sender = %sender_id, from = %address, enrollments = count, "reply recorded");
        Ok(count)
    }

    pub fn stop_campaign_enrollments(&self, campaign_id: Uuid, now: DateTime<Utc>) -> Result<u32> {
        self.end_active(
            self.store.list_enrollments(campaign_id)?,
            EnrollmentState::Stopped,
            now,
        )
    }

    fn end_active(
        &self,
        enrollments: Vec<Enrollment>,
        state: EnrollmentState,
        now: DateTime<Utc>,
    ) -> Result<u32> {
        let mut count = 0;
        for e in enrollments
            .into_iter()
            .filter(|e| e.state == EnrollmentState::Active)
        {
            self.store
                .update_enrollment(e.campaign_id, e.address(), &mut |e| {
                    if e.state == EnrollmentState::Active {
                        e.state = state;
                        e.next_fire_at = None;
                        e.updated_at = now;
                    }
                    Ok(())
                })?;
            count += 1;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{drip_campaign, open_store};
    use chrono::Duration;

    fn setup(delays_h: &[u64]) -> (tempfile::TempDir, Arc<crate::store::CampaignDb>, DripSequencer, Campaign) {
        let (dir, store) = open_store();
        let campaign = drip_campaign(delays_h);
        store.insert_campaign(&campaign).unwrap();
        let drip = DripSequencer::new(store.clone());
        (dir, store, drip, campaign)
    }

    #[test]
    fn enroll_schedules_first_step() {
        let (_dir, _store, drip, c) = setup(&[2, 24]);
        let t0 = Utc::now();
        let e = drip
            .enroll(c.id, Recipient::new(" +15550001 ").with_var("name", "Ana"), t0)
            .unwrap();
        assert_eq!(e.address(), "+15550001");
        assert_eq!(e.next_fire_at, Some(t0 + Duration::hours(2)));
        assert!(drip.due_enrollments(c.id, t0, 10).unwrap().is_empty());
        assert_eq!(drip.due_enrollments(c.id, t0 + Duration::hours(2), 10).unwrap().len(), 1);
    }

    #[test]
    fn enroll_rejects_missing_variables_and_opt_outs() {
        let (_dir, _store, drip, c) = setup(&[0]);
        let err = drip.enroll(c.id, Recipient::new("+1"), Utc::now()).unwrap_err();
        assert!(matches!(err, OutreachError::Configuration(m) if m.contains("name")));

        drip.unsubscribe("+2", Utc::now()).unwrap();
        let err = drip
            .enroll(c.id, Recipient::new("+2").with_var("name", "Bo"), Utc::now())
            .unwrap_err();
        assert!(matches!(err, OutreachError::OptedOut(_)));
    }

    #[test]
    fn sequence_advances_then_completes() {
        let (_dir, _store, drip, c) = setup(&[0, 24, 48]);
        let t0 = Utc::now();
        drip.enroll(c.id, Recipient::new("+1").with_var("name", "A"), t0)
            .unwrap();

        let e = drip.apply_outcome(&c, "+1", 0, StepOutcome::Sent, t0).unwrap().unwrap();
        assert_eq!(e.current_step, 1);
        assert_eq!(e.next_fire_at, Some(t0 + Duration::hours(24)));

        let e = drip
            .apply_outcome(&c, "+1", 1, StepOutcome::Failed { reason: "timeout".into() }, t0)
            .unwrap()
            .unwrap();
        assert_eq!((e.sent, e.failed, e.current_step), (1, 1, 2));
        assert_eq!(e.next_fire_at, Some(t0 + Duration::hours(48)));

        let e = drip.apply_outcome(&c, "+1", 2, StepOutcome::Sent, t0).unwrap().unwrap();
        assert_eq!(e.state, EnrollmentState::Completed);
        assert_eq!(e.next_fire_at, None);
    }

    #[test]
    fn applying_an_outcome_twice_is_a_no_op() {
        let (_dir, store, drip, c) = setup(&[0, 24]);
        let t0 = Utc::now();
        drip.enroll(c.id, Recipient::new("+1").with_var("name", "A"), t0)
            .unwrap();
        assert!(drip.apply_outcome(&c, "+1", 0, StepOutcome::Sent, t0).unwrap().is_some());
        assert!(drip.apply_outcome(&c, "+1", 0, StepOutcome::Sent, t0).unwrap().is_none());
        let e = store.get_enrollment(c.id, "+1").unwrap().unwrap();
        assert_eq!((e.sent, e.current_step), (1, 1));

        drip.apply_outcome(&c, "+1", 1, StepOutcome::Sent, t0).unwrap();
        assert!(drip.apply_outcome(&c, "+1", 1, StepOutcome::Sent, t0).unwrap().is_none());
        let e = store.get_enrollment(c.id, "+1").unwrap().unwrap();
        assert_eq!((e.sent, e.state), (2, EnrollmentState::Completed));
    }

    #[test]
    fn permanent_failure_stops_enrollment() {
        let (_dir, _store, drip, c) = setup(&[0, 24]);
        drip.enroll(c.id, Recipient::new("+1").with_var("name", "A"), Utc::now())
            .unwrap();
        let e = drip
            .apply_outcome(
                &c,
                "+1",
                0,
                StepOutcome::Stopped {
                    reason: "invalid_recipient".into(),
                },
                Utc::now(),
            )
            .unwrap()
            .unwrap();
        assert_eq!(e.state, EnrollmentState::Stopped);
        assert_eq!(e.last_error.as_deref(), Some("invalid_recipient"));
    }

    #[test]
    fn unsubscribe_ends_active_enrollments() {
        let (_dir, store, drip, c) = setup(&[0, 24]);
        let other = drip_campaign(&[0]);
        store.insert_campaign(&other).unwrap();
        for id in [c.id, other.id] {
            drip.enroll(id, Recipient::new("+1").with_var("name", "A"), Utc::now())
                .unwrap();
        }
        assert_eq!(drip.unsubscribe("+1", Utc::now()).unwrap(), 2);
        let e = store.get_enrollment(c.id, "+1").unwrap().unwrap();
        assert_eq!(e.state, EnrollmentState::Unsubscribed);
        assert!(drip.due_enrollments(c.id, Utc::now() + Duration::days(9), 10).unwrap().is_empty());
    }

    #[test]
    fn reply_is_scoped_to_sender_and_skips_no_reply_steps() {
        let (dir, store) = open_store();
        let mut c = drip_campaign(&[0, 24]);
        c.steps[1].condition = StepCondition::NoReply;
        store.insert_campaign(&c).unwrap();
        let drip = DripSequencer::new(store.clone());
        drip.enroll(c.id, Recipient::new("+1").with_var("name", "A"), Utc::now())
            .unwrap();

        assert_eq!(drip.record_reply("someone-else", "+1", Utc::now()).unwrap(), 0);
        assert_eq!(drip.record_reply(&c.sender_id, "+1", Utc::now()).unwrap(), 1);

        let e = store.get_enrollment(c.id, "+1").unwrap().unwrap();
        // The first step is unconditional.
        assert!(!DripSequencer::should_skip(&c, &e));
        drip.apply_outcome(&c, "+1", 0, StepOutcome::Sent, Utc::now()).unwrap();
        let e = store.get_enrollment(c.id, "+1").unwrap().unwrap();
        assert!(DripSequencer::should_skip(&c, &e));
        drop(dir);
    }

    #[test]
    fn stop_campaign_enrollments_counts_only_active() {
        let (_dir, _store, drip, c) = setup(&[0]);
        for a in ["+1", "+2", "+3"] {
            drip.enroll(c.id, Recipient::new(a).with_var("name", "A"), Utc::now())
                .unwrap();
        }
        drip.apply_outcome(&c, "+1", 0, StepOutcome::Sent, Utc::now()).unwrap();
        assert_eq!(drip.stop_campaign_enrollments(c.id, Utc::now()).unwrap(), 2);
        assert_eq!(drip.stop_campaign_enrollments(c.id, Utc::now()).unwrap(), 0);
    }
}
