//! Operator-facing lifecycle commands and read-only reports.
//!
//! These only change `Campaign.status` (plus the enrollment cascade on stop);
//! the scheduler observes the new status on its next check.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::campaign::{Campaign, CampaignSpec};
use crate::config::Config;
use crate::drip::DripSequencer;
use crate::error::{OutreachError, Result};
use crate::risk::{RiskAssessment, RiskMonitor};
use crate::sender::Sender;
use crate::store::CampaignStore;
use crate::types::{CampaignKind, CampaignStatus, EnrollmentState};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnrollmentCounts {
    pub total: u32,
    pub active: u32,
    pub completed: u32,
    pub unsubscribed: u32,
    pub stopped: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignReport {
    pub id: Uuid,
    pub name: String,
    pub tenant: String,
    pub kind: CampaignKind,
    pub status: CampaignStatus,
    pub sender_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pause_reason: Option<String>,
    pub steps: usize,
    pub enrollments: EnrollmentCounts,
    pub sent: u32,
    pub failed: u32,
    /// Earliest pending fire time across active enrollments.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_fire_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub starts_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

/// Per-sender overrides accepted by [`Control::add_sender`].
#[derive(Debug, Clone, Default)]
pub struct SenderSpec {
    pub id: String,
    pub label: Option<String>,
    pub activated_at: Option<DateTime<Utc>>,
    pub hourly_cap: Option<u32>,
    pub daily_cap: Option<u32>,
    pub ramp: Option<Vec<u32>>,
}

pub struct Control {
    store: Arc<dyn CampaignStore>,
    drip: DripSequencer,
    risk: RiskMonitor,
}

impl Control {
    pub fn new(store: Arc<dyn CampaignStore>, config: &Config) -> Self {
        Self {
            drip: DripSequencer::new(store.clone()),
            risk: RiskMonitor::new(store.clone(), config.risk.clone()),
            store,
        }
    }

    pub fn drip(&self) -> &DripSequencer {
        &self.drip
    }

    // -----------------------------------------------------------------------
    // Senders
    // -----------------------------------------------------------------------

    pub fn add_sender(&self, spec: SenderSpec, now: DateTime<Utc>) -> Result<Sender> {
        if spec.ramp.as_ref().is_some_and(|r| r.is_empty()) {
            return Err(OutreachError::Configuration(
                "sender ramp override must have at least one entry".into(),
            ));
        }
        let mut sender = Sender::new(&spec.id, spec.activated_at.unwrap_or(now), now)?;
        sender.label = spec.label;
        sender.hourly_cap = spec.hourly_cap;
        sender.daily_cap = spec.daily_cap;
        sender.ramp = spec.ramp;
        self.store.insert_sender(&sender)?;
        info!(sender = %sender.id, "sender added");
        Ok(sender)
    }

    /// Fresh assessment of `sender_id` from its send log. Nothing is persisted.
    pub fn sender_risk(&self, sender_id: &str, now: DateTime<Utc>) -> Result<RiskAssessment> {
        self.risk.assess(sender_id, now)
    }

    // -----------------------------------------------------------------------
    // Campaign lifecycle
    // -----------------------------------------------------------------------

    pub fn create_campaign(&self, spec: CampaignSpec, now: DateTime<Utc>) -> Result<Campaign> {
        self.store.get_sender(&spec.sender)?;
        let campaign = Campaign::from_spec(spec, now)?;
        self.store.insert_campaign(&campaign)?;
        info!(campaign = %campaign.id, name = %campaign.name, kind = %campaign.kind, "campaign created");
        Ok(campaign)
    }

    /// `draft` → `scheduled` when the start time is still ahead, otherwise
    /// straight to `running`. A `scheduled` campaign starts immediately.
    pub fn start_campaign(&self, id: Uuid, now: DateTime<Utc>) -> Result<Campaign> {
        let c = self.store.update_campaign(id, &mut |c| {
            let to = match (c.status, c.starts_at) {
                (CampaignStatus::Draft, Some(at)) if at > now => CampaignStatus::Scheduled,
                _ => CampaignStatus::Running,
            };
            c.transition(to, None, now)
        })?;
        info!(campaign = %id, status = %c.status, "campaign started");
        Ok(c)
    }

    pub fn pause_campaign(&self, id: Uuid, reason: Option<String>, now: DateTime<Utc>) -> Result<Campaign> {
        let reason = reason.unwrap_or_else(|| "paused by operator".to_string());
        let c = self.store.update_campaign(id, &mut |c| {
            c.transition(CampaignStatus::Paused, Some(reason.clone()), now)
        })?;
        info!(campaign = %id, %reason, "campaign paused");
        Ok(c)
    }

    pub fn resume_campaign(&self, id: Uuid, now: DateTime<Utc>) -> Result<Campaign> {
        let c = self.store.update_campaign(id, &mut |c| {
            if c.status != CampaignStatus::Paused {
                return Err(OutreachError::InvalidTransition {
                    from: c.status.to_string(),
                    to: CampaignStatus::Running.to_string(),
                    reason: "only paused campaigns can be resumed".to_string(),
                });
            }
            c.transition(CampaignStatus::Running, None, now)
        })?;
        info!(campaign = %id, "campaign resumed");
        Ok(c)
    }

    /// Stop the campaign and every enrollment still active in it.
    pub fn stop_campaign(&self, id: Uuid, now: DateTime<Utc>) -> Result<Campaign> {
        let c = self.store.update_campaign(id, &mut |c| {
            c.transition(CampaignStatus::Stopped, None, now)
        })?;
        let stopped = self.drip.stop_campaign_enrollments(id, now)?;
        info!(campaign = %id, enrollments = stopped, "campaign stopped");
        Ok(c)
    }

    /// Pause every running campaign of `sender_id`. Returns the paused ids.
    pub fn pause_sender_campaigns(
        &self,
        sender_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>> {
        pause_sender_campaigns(self.store.as_ref(), sender_id, reason, now)
    }

    pub fn campaign_status(&self, id: Uuid) -> Result<CampaignReport> {
        let c = self.store.get_campaign(id)?;
        let enrollments = self.store.list_enrollments(id)?;
        let mut counts = EnrollmentCounts::default();
        let (mut sent, mut failed) = (0, 0);
        let mut next_fire_at: Option<DateTime<Utc>> = None;
        for e in &enrollments {
            counts.total += 1;
            match e.state {
                EnrollmentState::Active => counts.active += 1,
                EnrollmentState::Completed => counts.completed += 1,
                EnrollmentState::Unsubscribed => counts.unsubscribed += 1,
                EnrollmentState::Stopped => counts.stopped += 1,
            }
            sent += e.sent;
            failed += e.failed;
            if e.state == EnrollmentState::Active {
                if let Some(t) = e.next_fire_at {
                    next_fire_at = Some(next_fire_at.map_or(t, |n| n.min(t)));
                }
            }
        }
        Ok(CampaignReport {
            id: c.id,
            name: c.name,
            tenant: c.tenant,
            kind: c.kind,
            status: c.status,
            sender_id: c.sender_id,
            pause_reason: c.pause_reason,
            steps: c.steps.len(),
            enrollments: counts,
            sent,
            failed,
            next_fire_at,
            starts_at: c.starts_at,
            started_at: c.started_at,
            ended_at: c.ended_at,
        })
    }
}

pub(crate) fn pause_sender_campaigns(
    store: &dyn CampaignStore,
    sender_id: &str,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<Vec<Uuid>> {
    let mut paused = Vec::new();
    for c in store.list_campaigns()? {
        if c.sender_id != sender_id || c.status != CampaignStatus::Running {
            continue;
        }
        // Re-check inside the transaction; an operator may have acted since.
        let mut changed = false;
        store.update_campaign(c.id, &mut |c| {
            changed = c.status == CampaignStatus::Running;
            if changed {
                c.transition(CampaignStatus::Paused, Some(reason.to_string()), now)?;
            }
            Ok(())
        })?;
        if changed {
            warn!(campaign = %c.id, sender = %sender_id, %reason, "campaign auto-paused");
            paused.push(c.id);
        }
    }
    Ok(paused)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrollment::Recipient;
    use crate::testing::{add_sender, drip_spec, open_store};
    use chrono::Duration;

    fn control() -> (tempfile::TempDir, Control) {
        let (dir, store) = open_store();
        add_sender(&store, "line-1", Utc::now());
        (dir, Control::new(store, &Config::default()))
    }

    #[test]
    fn create_requires_known_sender() {
        let (_dir, ctl) = control();
        let mut spec = drip_spec(&[0]);
        spec.sender = "line-9".into();
        assert!(matches!(
            ctl.create_campaign(spec, Utc::now()),
            Err(OutreachError::SenderNotFound(_))
        ));
    }

    #[test]
    fn start_respects_future_start_time() {
        let (_dir, ctl) = control();
        let now = Utc::now();
        let mut spec = drip_spec(&[0]);
        spec.starts_at = Some(now + Duration::hours(2));
        let c = ctl.create_campaign(spec, now).unwrap();
        assert_eq!(ctl.start_campaign(c.id, now).unwrap().status, CampaignStatus::Scheduled);

        let c2 = ctl.create_campaign(drip_spec(&[0]), now).unwrap();
        let started = ctl.start_campaign(c2.id, now).unwrap();
        assert_eq!(started.status, CampaignStatus::Running);
        assert_eq!(started.started_at, Some(now));
    }

    #[test]
    fn pause_resume_stop() {
        let (_dir, ctl) = control();
        let now = Utc::now();
        let c = ctl.create_campaign(drip_spec(&[0, 24]), now).unwrap();
        assert!(ctl.resume_campaign(c.id, now).is_err());
        ctl.start_campaign(c.id, now).unwrap();
        ctl.drip()
            .enroll(c.id, Recipient::new("+1").with_var("name", "A"), now)
            .unwrap();

        let p = ctl.pause_campaign(c.id, None, now).unwrap();
        assert_eq!(p.pause_reason.as_deref(), Some("paused by operator"));
        assert_eq!(ctl.resume_campaign(c.id, now).unwrap().status, CampaignStatus::Running);

        ctl.stop_campaign(c.id, now).unwrap();
        let report = ctl.campaign_status(c.id).unwrap();
        assert_eq!(report.status, CampaignStatus::Stopped);
        assert_eq!(report.enrollments.stopped, 1);
        assert!(ctl.start_campaign(c.id, now).is_err());
    }

    #[test]
    fn auto_pause_only_touches_running_campaigns_of_sender() {
        let (_dir, ctl) = control();
        let now = Utc::now();
        let running = ctl.create_campaign(drip_spec(&[0]), now).unwrap();
        ctl.start_campaign(running.id, now).unwrap();
        let draft = ctl.create_campaign(drip_spec(&[0]), now).unwrap();

        let paused = ctl.pause_sender_campaigns("line-1", "risk critical", now).unwrap();
        assert_eq!(paused, vec![running.id]);
        let report = ctl.campaign_status(running.id).unwrap();
        assert_eq!(report.status, CampaignStatus::Paused);
        assert_eq!(report.pause_reason.as_deref(), Some("risk critical"));
        assert_eq!(ctl.campaign_status(draft.id).unwrap().status, CampaignStatus::Draft);
    }

    #[test]
    fn add_sender_applies_overrides() {
        let (_dir, ctl) = control();
        let s = ctl
            .add_sender(
                SenderSpec {
                    id: "line-2".into(),
                    daily_cap: Some(50),
                    ramp: Some(vec![10, 20]),
                    ..Default::default()
                },
                Utc::now(),
            )
            .unwrap();
        assert_eq!(s.daily_cap, Some(50));
        assert!(ctl
            .add_sender(
                SenderSpec {
                    id: "line-3".into(),
                    ramp: Some(vec![]),
                    ..Default::default()
                },
                Utc::now()
            )
            .is_err());
        assert_eq!(ctl.sender_risk("line-2", Utc::now()).unwrap().score, 0);
    }
}
