//! Per-sender budget actors.
//!
//! Each sender gets one task that owns every write to its [`Sender`] record.
//! Callers talk to it through an `mpsc` queue and wait on a `oneshot` reply,
//! so concurrent reservations for the same sender are serialized without a
//! global lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::config::{LimitsConfig, WarmupConfig};
use crate::error::{OutreachError, Result};
use crate::risk::RiskAssessment;
use crate::sender::Sender;
use crate::store::CampaignStore;

use super::warmup::WarmupManager;

const ACTOR_QUEUE: usize = 64;

enum Command {
    Reserve {
        requested: u32,
        now: DateTime<Utc>,
        reply: oneshot::Sender<Result<u32>>,
    },
    Release {
        count: u32,
        reserved_at: DateTime<Utc>,
        reply: oneshot::Sender<Result<()>>,
    },
    RecordRisk {
        assessment: RiskAssessment,
        reply: oneshot::Sender<Result<()>>,
    },
    RecordBan {
        reason: String,
        at: DateTime<Utc>,
        reply: oneshot::Sender<Result<()>>,
    },
}

struct Actor {
    sender_id: String,
    store: Arc<dyn CampaignStore>,
    limits: LimitsConfig,
    warmup: WarmupManager,
}

impl Actor {
    async fn run(self, mut rx: mpsc::Receiver<Command>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                Command::Reserve {
                    requested,
                    now,
                    reply,
                } => {
                    let _ = reply.send(self.reserve(requested, now));
                }
                Command::Release {
                    count,
                    reserved_at,
                    reply,
                } => {
                    let _ = reply.send(self.mutate(&mut |s| {
                        s.window.release(count, reserved_at);
                        Ok(())
                    }));
                }
                Command::RecordRisk { assessment, reply } => {
                    let _ = reply.send(self.mutate(&mut |s| {
                        s.risk = Some(assessment.clone());
                        Ok(())
                    }));
                }
                Command::RecordBan { reason, at, reply } => {
                    let _ = reply.send(self.mutate(&mut |s| {
                        s.last_ban_at = Some(at);
                        s.last_ban_reason = Some(reason.clone());
                        Ok(())
                    }));
                }
            }
        }
        debug!(sender = %self.sender_id, "budget actor stopped");
    }

    fn reserve(&self, requested: u32, now: DateTime<Utc>) -> Result<u32> {
        let mut granted = 0;
        self.store.update_sender(&self.sender_id, &mut |s| {
            let daily = self.warmup.effective_daily_cap(s, &self.limits, now);
            let hourly = s.hourly_cap(&self.limits);
            granted = s.window.grant(now, requested, hourly, daily);
            s.updated_at = now;
            Ok(())
        })?;
        debug!(sender = %self.sender_id, requested, granted, "budget reserved");
        Ok(granted)
    }

    fn mutate(&self, f: &mut dyn FnMut(&mut Sender) -> Result<()>) -> Result<()> {
        self.store.update_sender(&self.sender_id, f).map(|_| ())
    }
}

/// Hands out per-sender send budget: `min(hourly left, daily left, requested)`
/// where the daily cap is already intersected with the warmup ramp.
pub struct RateLimiter {
    store: Arc<dyn CampaignStore>,
    limits: LimitsConfig,
    warmup: WarmupManager,
    actors: Mutex<HashMap<String, mpsc::Sender<Command>>>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CampaignStore>, limits: LimitsConfig, warmup: WarmupConfig) -> Self {
        Self {
            store,
            limits,
            warmup: WarmupManager::new(warmup),
            actors: Mutex::new(HashMap::new()),
        }
    }

    pub fn warmup(&self) -> &WarmupManager {
        &self.warmup
    }

    pub async fn reserve(&self, sender_id: &str, count: u32) -> Result<u32> {
        self.reserve_at(sender_id, count, Utc::now()).await
    }

    /// Grant up to `count` sends at `now`. Running out of budget yields a
    /// smaller grant, possibly zero; only store failures are errors.
    pub async fn reserve_at(&self, sender_id: &str, count: u32, now: DateTime<Utc>) -> Result<u32> {
        if count == 0 {
            return Ok(0);
        }
        self.call(sender_id, |reply| Command::Reserve {
            requested: count,
            now,
            reply,
        })
        .await
    }

    pub async fn release(&self, sender_id: &str, count: u32, reserved_at: DateTime<Utc>) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        self.call(sender_id, |reply| Command::Release {
            count,
            reserved_at,
            reply,
        })
        .await
    }

    pub async fn record_risk(&self, assessment: RiskAssessment) -> Result<()> {
        let sender_id = assessment.sender_id.clone();
        self.call(&sender_id, |reply| Command::RecordRisk { assessment, reply })
            .await
    }

    pub async fn record_ban(&self, sender_id: &str, reason: &str, at: DateTime<Utc>) -> Result<()> {
        let reason = reason.to_string();
        self.call(sender_id, |reply| Command::RecordBan { reason, at, reply })
            .await
    }

    async fn call<T>(
        &self,
        sender_id: &str,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> Command,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        let handle = self.handle(sender_id)?;
        if handle.send(build(tx)).await.is_err() {
            self.forget(sender_id);
            return Err(OutreachError::BudgetActorClosed(sender_id.to_string()));
        }
        rx.await
            .map_err(|_| OutreachError::BudgetActorClosed(sender_id.to_string()))?
    }

    fn handle(&self, sender_id: &str) -> Result<mpsc::Sender<Command>> {
        let mut actors = self
            .actors
            .lock()
            .map_err(|_| OutreachError::BudgetActorClosed(sender_id.to_string()))?;
        if let Some(tx) = actors.get(sender_id) {
            if !tx.is_closed() {
                return Ok(tx.clone());
            }
        }
        // Surface unknown senders here rather than inside the actor.
        self.store.get_sender(sender_id)?;

        let (tx, rx) = mpsc::channel(ACTOR_QUEUE);
        let actor = Actor {
            sender_id: sender_id.to_string(),
            store: self.store.clone(),
            limits: self.limits,
            warmup: self.warmup.clone(),
        };
        tokio::spawn(actor.run(rx));
        actors.insert(sender_id.to_string(), tx.clone());
        Ok(tx)
    }

    fn forget(&self, sender_id: &str) {
        match self.actors.lock() {
            Ok(mut actors) => {
                actors.remove(sender_id);
            }
            Err(_) => warn!(sender = %sender_id, "budget actor registry poisoned"),
        }
    }
}
