//! One campaign's share of a scheduler tick.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::budget::RateLimiter;
use crate::campaign::Campaign;
use crate::config::{JitterConfig, SchedulerConfig};
use crate::control::pause_sender_campaigns;
use crate::drip::{DripSequencer, StepOutcome};
use crate::enrollment::Enrollment;
use crate::error::Result;
use crate::message::{MessageKey, MessageRecord};
use crate::retry::{self, DispatchResult, RetryManager};
use crate::risk::RiskMonitor;
use crate::sender::{LogOutcome, SendLogEntry};
use crate::store::CampaignStore;
use crate::types::{CampaignStatus, EnrollmentState, RiskLevel};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub sent: u32,
    pub failed: u32,
    /// Steps concluded without a send (replied recipients, or outcomes
    /// recovered from an earlier run).
    pub skipped: u32,
    /// Fewer messages were granted than were due.
    pub throttled: bool,
    pub paused: bool,
    pub completed: bool,
    pub errors: u32,
}

/// What became of one enrollment in a batch.
struct Attempt {
    /// The transport was reached, so the budget grant is consumed.
    spent: bool,
    result: Result<DispatchResult>,
}

impl Attempt {
    fn unspent(result: Result<DispatchResult>) -> Self {
        Self {
            spent: false,
            result,
        }
    }
}

enum Prepared {
    Send(String),
    /// Settled without a send.
    Concluded(DispatchResult),
}

/// Everything a worker needs; cheap to clone into a task.
#[derive(Clone)]
pub struct Dispatcher {
    pub(crate) store: Arc<dyn CampaignStore>,
    pub(crate) limiter: Arc<RateLimiter>,
    pub(crate) risk: Arc<RiskMonitor>,
    pub(crate) retry: Arc<RetryManager>,
    pub(crate) drip: Arc<DripSequencer>,
    pub(crate) config: Arc<SchedulerConfig>,
}

impl Dispatcher {
    /// Send whatever is due for `campaign_id` at `now`, within budget.
    pub async fn run_campaign(&self, campaign_id: Uuid, now: DateTime<Utc>) -> Result<BatchReport> {
        let mut report = BatchReport::default();
        let campaign = self.store.get_campaign(campaign_id)?;
        if campaign.status != CampaignStatus::Running {
            return Ok(report);
        }
        if self.pause_if_critical(&campaign.sender_id, now).await? {
            report.paused = true;
            return Ok(report);
        }

        let limit = campaign.batch_size(self.config.batch_size) as usize;
        let mut to_send = Vec::new();
        for e in self.drip.due_enrollments(campaign_id, now, limit)? {
            if DripSequencer::should_skip(&campaign, &e) {
                self.drip
                    .apply_outcome(&campaign, e.address(), e.current_step, StepOutcome::Replied, now)?;
                report.skipped += 1;
                continue;
            }
            // Outcomes recorded by an earlier run settle without budget.
            let key = MessageKey::new(campaign_id, e.current_step, e.address());
            if let Some(done) = self.stored_outcome(&key)? {
                debug!(key = %key, "step already concluded; advancing without sending");
                self.advance(&campaign, &e, &done, now)?;
                report.skipped += 1;
                continue;
            }
            to_send.push(e);
        }

        if !to_send.is_empty() {
            let granted = self
                .limiter
                .reserve_at(&campaign.sender_id, to_send.len() as u32, now)
                .await?;
            if (granted as usize) < to_send.len() {
                report.throttled = true;
                debug!(
                    campaign = %campaign_id,
                    due = to_send.len(),
                    granted,
                    "budget limited this batch"
                );
            }
            let used = self
                .send_batch(&campaign, to_send, granted as usize, now, &mut report)
                .await;
            self.limiter
                .release(&campaign.sender_id, granted - used, now)
                .await?;
        }

        if !report.paused && (report.sent + report.failed) > 0 {
            report.paused = self.pause_if_critical(&campaign.sender_id, now).await?;
        }
        report.completed = self.complete_if_done(campaign_id, now)?;
        Ok(report)
    }

    /// Dispatch up to `granted` enrollments sequentially. Returns how many
    /// grants reached the transport.
    async fn send_batch(
        &self,
        campaign: &Campaign,
        enrollments: Vec<Enrollment>,
        granted: usize,
        now: DateTime<Utc>,
        report: &mut BatchReport,
    ) -> u32 {
        let jitter = campaign.jitter(self.config.jitter);
        let mut used = 0;
        for (i, e) in enrollments.into_iter().take(granted).enumerate() {
            if i > 0 {
                pause_between_messages(jitter).await;
            }
            // Pause and stop are observed between messages.
            match self.store.get_campaign(campaign.id) {
                Ok(c) if c.status == CampaignStatus::Running => {}
                Ok(c) => {
                    info!(campaign = %campaign.id, status = %c.status, "campaign left running; batch halted");
                    break;
                }
                Err(err) => {
                    warn!(campaign = %campaign.id, error = %err, "could not re-check campaign");
                    report.errors += 1;
                    break;
                }
            }

            let attempt = self.dispatch_one(campaign, &e, now).await;
            if attempt.spent {
                used += 1;
            }
            let result = match attempt.result {
                Ok(r) => r,
                Err(err) => {
                    warn!(
                        campaign = %campaign.id,
                        to = %e.address(),
                        spent = attempt.spent,
                        error = %err,
                        "dispatch failed"
                    );
                    report.errors += 1;
                    continue;
                }
            };
            if attempt.spent {
                if result.is_sent() {
                    report.sent += 1;
                } else {
                    report.failed += 1;
                }
            } else {
                report.skipped += 1;
            }

            if let DispatchResult::BanSignal { reason } = &result {
                if let Err(err) = self.on_ban(&campaign.sender_id, reason, now).await {
                    warn!(sender = %campaign.sender_id, error = %err, "could not record ban");
                    report.errors += 1;
                }
                report.paused = true;
                break;
            }
        }
        used
    }

    /// Send the enrollment's current step. `spent` is false only when the
    /// transport was never asked (a stored outcome was reused, the body failed
    /// to render, or the store failed beforehand).
    async fn dispatch_one(&self, campaign: &Campaign, e: &Enrollment, now: DateTime<Utc>) -> Attempt {
        let body = match self.prepare(campaign, e, now) {
            Ok(Prepared::Send(body)) => body,
            Ok(Prepared::Concluded(result)) => return Attempt::unspent(Ok(result)),
            Err(err) => return Attempt::unspent(Err(err)),
        };
        // Once delivery starts the grant stays used, even if bookkeeping fails.
        Attempt {
            spent: true,
            result: self.deliver(campaign, e, body, now).await,
        }
    }

    fn prepare(&self, campaign: &Campaign, e: &Enrollment, now: DateTime<Utc>) -> Result<Prepared> {
        let step = e.current_step;
        let key = MessageKey::new(campaign.id, step, e.address());

        if let Some(done) = self.stored_outcome(&key)? {
            debug!(key = %key, "step already concluded; advancing without sending");
            self.advance(campaign, e, &done, now)?;
            return Ok(Prepared::Concluded(done));
        }

        match campaign.render_step(step, &e.recipient) {
            Ok(body) => Ok(Prepared::Send(body)),
            Err(err) => {
                let reason = err.to_string();
                warn!(key = %key, %reason, "render failed; stopping enrollment");
                let result = DispatchResult::PermanentFailure { reason };
                self.advance(campaign, e, &result, now)?;
                Ok(Prepared::Concluded(result))
            }
        }
    }

    async fn deliver(
        &self,
        campaign: &Campaign,
        e: &Enrollment,
        body: String,
        now: DateTime<Utc>,
    ) -> Result<DispatchResult> {
        let key = MessageKey::new(campaign.id, e.current_step, e.address());
        let record = MessageRecord::new(key, &campaign.sender_id, body.clone(), now);
        let result = self.retry.send_with_retry(record).await?;
        let outcome = match &result {
            DispatchResult::Sent { .. } => LogOutcome::Sent,
            DispatchResult::BanSignal { .. } => LogOutcome::BanSignal,
            _ => LogOutcome::Failed,
        };
        self.store.append_send_log(&SendLogEntry::new(
            &campaign.sender_id,
            campaign.id,
            e.address(),
            &body,
            outcome,
            now,
        ))?;
        self.advance(campaign, e, &result, now)?;
        Ok(result)
    }

    /// Terminal outcome already recorded for `key`, if any.
    fn stored_outcome(&self, key: &MessageKey) -> Result<Option<DispatchResult>> {
        Ok(self
            .store
            .get_message(key)?
            .and_then(|m| retry::terminal_result(&m)))
    }

    fn advance(
        &self,
        campaign: &Campaign,
        e: &Enrollment,
        result: &DispatchResult,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let outcome = match result {
            DispatchResult::Sent { .. } => StepOutcome::Sent,
            DispatchResult::PermanentFailure { reason } => StepOutcome::Stopped {
                reason: reason.clone(),
            },
            DispatchResult::RetriesExhausted { last_error, .. } => StepOutcome::Failed {
                reason: last_error.clone(),
            },
            DispatchResult::BanSignal { reason } => StepOutcome::Failed {
                reason: reason.clone(),
            },
        };
        self.drip
            .apply_outcome(campaign, e.address(), e.current_step, outcome, now)?;
        Ok(())
    }

    async fn on_ban(&self, sender_id: &str, reason: &str, now: DateTime<Utc>) -> Result<()> {
        self.limiter.record_ban(sender_id, reason, now).await?;
        pause_sender_campaigns(
            self.store.as_ref(),
            sender_id,
            &format!("ban signal: {reason}"),
            now,
        )?;
        Ok(())
    }

    /// Reassess the sender and pause its campaigns when critical.
    async fn pause_if_critical(&self, sender_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let assessment = self.risk.assess(sender_id, now)?;
        let (score, level) = (assessment.score, assessment.level);
        self.limiter.record_risk(assessment).await?;
        if level < RiskLevel::Critical {
            return Ok(false);
        }
        let paused = pause_sender_campaigns(
            self.store.as_ref(),
            sender_id,
            &format!("risk critical (score {score})"),
            now,
        )?;
        warn!(sender = %sender_id, score, campaigns = paused.len(), "sender risk critical");
        Ok(true)
    }

    /// Mark the campaign completed once every enrollment has ended.
    fn complete_if_done(&self, campaign_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let enrollments = self.store.list_enrollments(campaign_id)?;
        if enrollments.is_empty() || enrollments.iter().any(|e| e.state == EnrollmentState::Active) {
            return Ok(false);
        }
        let mut completed = false;
        self.store.update_campaign(campaign_id, &mut |c| {
            completed = c.status == CampaignStatus::Running;
            if completed {
                c.transition(CampaignStatus::Completed, None, now)?;
            }
            Ok(())
        })?;
        if completed {
            info!(campaign = %campaign_id, "campaign completed");
        }
        Ok(completed)
    }
}

async fn pause_between_messages(jitter: JitterConfig) {
    let ms = if jitter.min_ms >= jitter.max_ms {
        jitter.min_ms
    } else {
        rand::thread_rng().gen_range(jitter.min_ms..=jitter.max_ms)
    };
    if ms > 0 {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}
