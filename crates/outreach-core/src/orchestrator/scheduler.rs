use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::budget::RateLimiter;
use crate::config::{Config, SchedulerConfig};
use crate::drip::DripSequencer;
use crate::error::Result;
use crate::retry::RetryManager;
use crate::risk::RiskMonitor;
use crate::store::CampaignStore;
use crate::transport::Transport;
use crate::types::CampaignStatus;

use super::dispatch::{BatchReport, Dispatcher};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TickReport {
    pub promoted: u32,
    pub campaigns: u32,
    pub sent: u32,
    pub failed: u32,
    pub skipped: u32,
    pub throttled: u32,
    pub paused: u32,
    pub completed: u32,
    pub errors: u32,
}

impl TickReport {
    fn absorb(&mut self, batch: &BatchReport) {
        self.sent += batch.sent;
        self.failed += batch.failed;
        self.skipped += batch.skipped;
        self.throttled += batch.throttled as u32;
        self.paused += batch.paused as u32;
        self.completed += batch.completed as u32;
        self.errors += batch.errors;
    }

    pub fn is_idle(&self) -> bool {
        self.promoted + self.sent + self.failed + self.skipped + self.paused + self.completed
            == 0
    }
}

/// Polls the store and drives every running campaign forward.
pub struct Scheduler {
    store: Arc<dyn CampaignStore>,
    dispatcher: Dispatcher,
    config: SchedulerConfig,
    log_retention: chrono::Duration,
}

impl Scheduler {
    pub fn new(store: Arc<dyn CampaignStore>, transport: Arc<dyn Transport>, config: &Config) -> Self {
        let dispatcher = Dispatcher {
            store: store.clone(),
            limiter: Arc::new(RateLimiter::new(
                store.clone(),
                config.limits,
                config.warmup.clone(),
            )),
            risk: Arc::new(RiskMonitor::new(store.clone(), config.risk.clone())),
            retry: Arc::new(RetryManager::new(
                store.clone(),
                transport,
                config.retry.clone(),
            )),
            drip: Arc::new(DripSequencer::new(store.clone())),
            config: Arc::new(config.scheduler.clone()),
        };
        Self {
            store,
            dispatcher,
            config: config.scheduler.clone(),
            log_retention: config.risk.log_retention(),
        }
    }

    /// Requeue messages a previous process left in flight.
    pub fn recover(&self) -> Result<u32> {
        let max_age = Duration::from_secs(self.config.recovery_max_age_secs);
        let n = self.store.startup_recovery(max_age)?;
        if n > 0 {
            info!(messages = n, "requeued interrupted messages");
        }
        Ok(n)
    }

    /// One scheduling pass: promote due campaigns, then run one batch per
    /// running campaign on a bounded worker pool.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let mut report = TickReport::default();
        let mut running: Vec<Uuid> = Vec::new();

        for c in self.store.get_due_campaigns(now)? {
            if c.status == CampaignStatus::Scheduled {
                match self.promote(c.id, now) {
                    Ok(true) => report.promoted += 1,
                    Ok(false) => continue,
                    Err(e) => {
                        warn!(campaign = %c.id, error = %e, "promotion failed");
                        report.errors += 1;
                        continue;
                    }
                }
            }
            running.push(c.id);
        }
        report.campaigns = running.len() as u32;

        let semaphore = Arc::new(Semaphore::new(self.config.max_workers.max(1)));
        let mut workers = JoinSet::new();
        for id in running {
            let sem = semaphore.clone();
            let dispatcher = self.dispatcher.clone();
            workers.spawn(async move {
                let Ok(_permit) = sem.acquire_owned().await else {
                    return (id, Ok(BatchReport::default()));
                };
                (id, dispatcher.run_campaign(id, now).await)
            });
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((_, Ok(batch))) => report.absorb(&batch),
                Ok((id, Err(e))) => {
                    warn!(campaign = %id, error = %e, "campaign batch failed");
                    report.errors += 1;
                }
                Err(e) => {
                    warn!(error = %e, "worker task failed");
                    report.errors += 1;
                }
            }
        }

        match self.store.prune_send_log(now - self.log_retention) {
            Ok(0) => {}
            Ok(n) => debug!(entries = n, "pruned send log"),
            Err(e) => {
                warn!(error = %e, "send log pruning failed");
                report.errors += 1;
            }
        }
        Ok(report)
    }

    fn promote(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let mut promoted = false;
        self.store.update_campaign(id, &mut |c| {
            promoted = c.status == CampaignStatus::Scheduled
                && c.starts_at.map_or(true, |t| t <= now);
            if promoted {
                c.transition(CampaignStatus::Running, None, now)?;
            }
            Ok(())
        })?;
        if promoted {
            info!(campaign = %id, "scheduled campaign started");
        }
        Ok(promoted)
    }

    /// Tick every poll interval until `shutdown` resolves. A tick in progress
    /// finishes before the loop exits.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> Result<()> {
        self.recover()?;
        let mut interval = tokio::time::interval(self.config.poll_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(
            poll_secs = self.config.poll_interval().as_secs(),
            workers = self.config.max_workers,
            "scheduler started"
        );
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("scheduler stopping");
                    return Ok(());
                }
                _ = interval.tick() => {
                    match self.tick(Utc::now()).await {
                        Ok(r) if r.is_idle() => debug!("tick: nothing to do"),
                        Ok(r) => info!(
                            promoted = r.promoted,
                            sent = r.sent,
                            failed = r.failed,
                            paused = r.paused,
                            completed = r.completed,
                            "tick"
                        ),
                        Err(e) => warn!(error = %e, "tick failed"),
                    }
                }
            }
        }
    }
}
