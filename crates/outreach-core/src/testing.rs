//! Shared fixtures for unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tempfile::TempDir;
use uuid::Uuid;

use crate::campaign::{Campaign, CampaignSettings, CampaignSpec, StepCondition, StepSpec};
use crate::config::JitterConfig;
use crate::enrollment::Enrollment;
use crate::error::{OutreachError, Result};
use crate::message::{MessageKey, MessageRecord};
use crate::sender::{OptOut, SendLogEntry, Sender};
use crate::store::{CampaignDb, CampaignStore, Mutation};
use crate::template::Variables;
use crate::transport::{RawSendResult, SendRequest, Transport};
use crate::types::CampaignKind;

pub fn open_store() -> (TempDir, Arc<CampaignDb>) {
    let dir = TempDir::new().unwrap();
    let db = CampaignDb::open(&dir.path().join("test.db")).unwrap();
    (dir, Arc::new(db))
}

pub fn add_sender(store: &CampaignDb, id: &str, activated_at: DateTime<Utc>) -> Sender {
    let sender = Sender::new(id, activated_at, activated_at).unwrap();
    store.insert_sender(&sender).unwrap();
    sender
}

/// Drip spec on sender `line-1` with one `Hi {name}` step per delay (hours).
pub fn drip_spec(delays_h: &[u64]) -> CampaignSpec {
    CampaignSpec {
        name: "Onboarding".into(),
        tenant: "acme".into(),
        kind: CampaignKind::Drip,
        sender: "line-1".into(),
        starts_at: None,
        template: None,
        steps: delays_h
            .iter()
            .map(|h| StepSpec {
                ordinal: None,
                delay_secs: h * 3600,
                template: format!("Hi {{name}}, day {h}"),
                condition: StepCondition::Always,
            })
            .collect(),
        fields: vec![],
        defaults: Variables::new(),
        settings: CampaignSettings {
            jitter: Some(JitterConfig {
                min_ms: 0,
                max_ms: 0,
            }),
            batch_size: None,
        },
    }
}

pub fn drip_campaign(delays_h: &[u64]) -> Campaign {
    Campaign::from_spec(drip_spec(delays_h), Utc::now()).unwrap()
}

/// Transport that replays scripted results, then accepts everything.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<RawSendResult>>,
    seen: Mutex<Vec<SendRequest>>,
}

impl ScriptedTransport {
    pub fn new(script: Vec<RawSendResult>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<SendRequest> {
        self.seen.lock().unwrap().clone()
    }
}

impl Transport for ScriptedTransport {
    fn name(&self) -> &str {
        "scripted"
    }

    fn send(&self, request: SendRequest) -> BoxFuture<'_, RawSendResult> {
        self.seen.lock().unwrap().push(request);
        let next = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(RawSendResult::Accepted {
                provider_id: Some("scripted".into()),
            });
        Box::pin(async move { next })
    }
}

/// [`CampaignDb`] whose next `n` send log appends fail.
pub struct FlakyStore {
    inner: Arc<CampaignDb>,
    failing_appends: AtomicU32,
}

impl FlakyStore {
    pub fn new(inner: Arc<CampaignDb>, failing_appends: u32) -> Arc<Self> {
        Arc::new(Self {
            inner,
            failing_appends: AtomicU32::new(failing_appends),
        })
    }
}

impl CampaignStore for FlakyStore {
    fn insert_campaign(&self, campaign: &Campaign) -> Result<()> {
        self.inner.insert_campaign(campaign)
    }
    fn get_campaign(&self, id: Uuid) -> Result<Campaign> {
        self.inner.get_campaign(id)
    }
    fn list_campaigns(&self) -> Result<Vec<Campaign>> {
        self.inner.list_campaigns()
    }
    fn update_campaign(&self, id: Uuid, f: Mutation<'_, Campaign>) -> Result<Campaign> {
        self.inner.update_campaign(id, f)
    }
    fn get_due_campaigns(&self, now: DateTime<Utc>) -> Result<Vec<Campaign>> {
        self.inner.get_due_campaigns(now)
    }
    fn insert_enrollment(&self, enrollment: &Enrollment) -> Result<()> {
        self.inner.insert_enrollment(enrollment)
    }
    fn get_enrollment(&self, campaign_id: Uuid, address: &str) -> Result<Option<Enrollment>> {
        self.inner.get_enrollment(campaign_id, address)
    }
    fn list_enrollments(&self, campaign_id: Uuid) -> Result<Vec<Enrollment>> {
        self.inner.list_enrollments(campaign_id)
    }
    fn get_enrollments_due(
        &self,
        campaign_id: Uuid,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Enrollment>> {
        self.inner.get_enrollments_due(campaign_id, before, limit)
    }
    fn update_enrollment(
        &self,
        campaign_id: Uuid,
        address: &str,
        f: Mutation<'_, Enrollment>,
    ) -> Result<Enrollment> {
        self.inner.update_enrollment(campaign_id, address, f)
    }
    fn enrollments_for_recipient(&self, address: &str) -> Result<Vec<Enrollment>> {
        self.inner.enrollments_for_recipient(address)
    }
    fn record_message(&self, record: &MessageRecord) -> Result<()> {
        self.inner.record_message(record)
    }
    fn get_message(&self, key: &MessageKey) -> Result<Option<MessageRecord>> {
        self.inner.get_message(key)
    }
    fn list_messages(&self, campaign_id: Uuid) -> Result<Vec<MessageRecord>> {
        self.inner.list_messages(campaign_id)
    }
    fn insert_sender(&self, sender: &Sender) -> Result<()> {
        self.inner.insert_sender(sender)
    }
    fn get_sender(&self, id: &str) -> Result<Sender> {
        self.inner.get_sender(id)
    }
    fn list_senders(&self) -> Result<Vec<Sender>> {
        self.inner.list_senders()
    }
    fn update_sender(&self, id: &str, f: Mutation<'_, Sender>) -> Result<Sender> {
        self.inner.update_sender(id, f)
    }
    fn append_send_log(&self, entry: &SendLogEntry) -> Result<()> {
        let failing = self
            .failing_appends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(OutreachError::Store("send_log: disk full".into()));
        }
        self.inner.append_send_log(entry)
    }
    fn send_log_since(&self, sender_id: &str, since: DateTime<Utc>) -> Result<Vec<SendLogEntry>> {
        self.inner.send_log_since(sender_id, since)
    }
    fn mark_reply(&self, sender_id: &str, address: &str) -> Result<bool> {
        self.inner.mark_reply(sender_id, address)
    }
    fn prune_send_log(&self, before: DateTime<Utc>) -> Result<u32> {
        self.inner.prune_send_log(before)
    }
    fn add_opt_out(&self, opt_out: &OptOut) -> Result<()> {
        self.inner.add_opt_out(opt_out)
    }
    fn is_opted_out(&self, address: &str) -> Result<bool> {
        self.inner.is_opted_out(address)
    }
    fn startup_recovery(&self, max_age: Duration) -> Result<u32> {
        self.inner.startup_recovery(max_age)
    }
}
