//! redb-backed [`CampaignStore`].
//!
//! # Table design
//!
//! Every table maps raw byte keys to JSON-encoded values. Composite keys are
//! laid out so that a prefix scan returns the rows of one owner in order:
//!
//! ```text
//! campaigns    [ campaign uuid: 16 ]
//! enrollments  [ campaign uuid: 16 | address utf-8 ]
//! messages     [ campaign uuid: 16 | step: u32 BE | address utf-8 ]
//! senders      [ sender id utf-8 ]
//! send_log     [ sender id utf-8 | 0x00 | at_ms: u64 BE | entry uuid: 16 ]
//! opt_outs     [ address utf-8 ]
//! ```
//!
//! Sender ids never contain `0x00`, so the separator keeps one sender's log
//! from bleeding into another's and the big-endian timestamp makes a range
//! scan from `since` return entries oldest first.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

use crate::campaign::Campaign;
use crate::enrollment::Enrollment;
use crate::error::{OutreachError, Result};
use crate::message::{MessageKey, MessageRecord, MessageStatus};
use crate::paths;
use crate::sender::{LogOutcome, OptOut, SendLogEntry, Sender};
use crate::types::CampaignStatus;

use super::{CampaignStore, Mutation};

// ---------------------------------------------------------------------------
// Table definitions
// ---------------------------------------------------------------------------

type Table = TableDefinition<'static, &'static [u8], &'static [u8]>;

const CAMPAIGNS: Table = TableDefinition::new("campaigns");
const ENROLLMENTS: Table = TableDefinition::new("enrollments");
const MESSAGES: Table = TableDefinition::new("messages");
const SENDERS: Table = TableDefinition::new("senders");
const SEND_LOG: Table = TableDefinition::new("send_log");
const OPT_OUTS: Table = TableDefinition::new("opt_outs");

const ALL_TABLES: [Table; 6] = [CAMPAIGNS, ENROLLMENTS, MESSAGES, SENDERS, SEND_LOG, OPT_OUTS];

// ---------------------------------------------------------------------------
// Key helpers
// ---------------------------------------------------------------------------

fn enrollment_key(campaign_id: Uuid, address: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(16 + address.len());
    key.extend_from_slice(campaign_id.as_bytes());
    key.extend_from_slice(address.as_bytes());
    key
}

fn message_key(key: &MessageKey) -> Vec<u8> {
    let mut out = Vec::with_capacity(20 + key.recipient.len());
    out.extend_from_slice(key.campaign_id.as_bytes());
    out.extend_from_slice(&key.step.to_be_bytes());
    out.extend_from_slice(key.recipient.as_bytes());
    out
}

/// `[sender | 0x00 | at_ms]`; pass `None` for the bare sender prefix.
fn log_prefix(sender_id: &str, at: Option<DateTime<Utc>>) -> Vec<u8> {
    let mut key = Vec::with_capacity(sender_id.len() + 1 + 8 + 16);
    key.extend_from_slice(sender_id.as_bytes());
    key.push(0x00);
    if let Some(at) = at {
        let ms = at.timestamp_millis().max(0) as u64;
        key.extend_from_slice(&ms.to_be_bytes());
    }
    key
}

fn log_key(entry: &SendLogEntry) -> Vec<u8> {
    let mut key = log_prefix(&entry.sender_id, Some(entry.at));
    key.extend_from_slice(entry.id.as_bytes());
    key
}

/// Exclusive upper bound of everything logged for `sender_id`.
fn log_end(sender_id: &str) -> Vec<u8> {
    let mut key = sender_id.as_bytes().to_vec();
    key.push(0x01);
    key
}

/// Timestamp encoded in a send log key.
fn log_key_ms(key: &[u8]) -> Option<u64> {
    let sep = key.iter().position(|b| *b == 0x00)?;
    let raw = key.get(sep + 1..sep + 9)?;
    Some(u64::from_be_bytes(raw.try_into().ok()?))
}

fn db_err(e: impl std::fmt::Display) -> OutreachError {
    OutreachError::Store(e.to_string())
}

// ---------------------------------------------------------------------------
// CampaignDb
// ---------------------------------------------------------------------------

pub struct CampaignDb {
    db: Database,
}

impl CampaignDb {
    /// Open or create the database at `path`, creating every table.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path).map_err(db_err)?;
        let wt = db.begin_write().map_err(db_err)?;
        for table in ALL_TABLES {
            wt.open_table(table).map_err(db_err)?;
        }
        wt.commit().map_err(db_err)?;
        Ok(Self { db })
    }

    /// Open the project database under `root`.
    pub fn open_root(root: &Path) -> Result<Self> {
        if !paths::outreach_dir(root).is_dir() {
            return Err(OutreachError::NotInitialized);
        }
        Self::open(&paths::db_path(root))
    }

    fn get<T: DeserializeOwned>(&self, table: Table, key: &[u8]) -> Result<Option<T>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let t = rt.open_table(table).map_err(db_err)?;
        match t.get(key).map_err(db_err)? {
            Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
            None => Ok(None),
        }
    }

    fn put<T: Serialize>(&self, table: Table, key: &[u8], value: &T) -> Result<()> {
        let encoded = serde_json::to_vec(value)?;
        let wt = self.db.begin_write().map_err(db_err)?;
        {
            let mut t = wt.open_table(table).map_err(db_err)?;
            t.insert(key, encoded.as_slice()).map_err(db_err)?;
        }
        wt.commit().map_err(db_err)?;
        Ok(())
    }

    /// Insert only if `key` is absent; otherwise fail with `exists()`.
    fn put_new<T: Serialize>(
        &self,
        table: Table,
        key: &[u8],
        value: &T,
        exists: impl FnOnce() -> OutreachError,
    ) -> Result<()> {
        let encoded = serde_json::to_vec(value)?;
        let wt = self.db.begin_write().map_err(db_err)?;
        {
            let mut t = wt.open_table(table).map_err(db_err)?;
            if t.get(key).map_err(db_err)?.is_some() {
                return Err(exists());
            }
            t.insert(key, encoded.as_slice()).map_err(db_err)?;
        }
        wt.commit().map_err(db_err)?;
        Ok(())
    }

    /// Read-modify-write of one row inside a single write transaction.
    fn update<T: Serialize + DeserializeOwned>(
        &self,
        table: Table,
        key: &[u8],
        missing: impl FnOnce() -> OutreachError,
        f: Mutation<'_, T>,
    ) -> Result<T> {
        let wt = self.db.begin_write().map_err(db_err)?;
        let value = {
            let mut t = wt.open_table(table).map_err(db_err)?;
            let current = t.get(key).map_err(db_err)?.map(|g| g.value().to_vec());
            let Some(bytes) = current else {
                return Err(missing());
            };
            let mut value: T = serde_json::from_slice(&bytes)?;
            f(&mut value)?;
            let encoded = serde_json::to_vec(&value)?;
            t.insert(key, encoded.as_slice()).map_err(db_err)?;
            value
        };
        wt.commit().map_err(db_err)?;
        Ok(value)
    }

    /// Every row whose key starts with `prefix`, in key order.
    fn scan<T: DeserializeOwned>(&self, table: Table, prefix: &[u8]) -> Result<Vec<T>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let t = rt.open_table(table).map_err(db_err)?;
        let mut out = Vec::new();
        for entry in t.range(prefix..).map_err(db_err)? {
            let (k, v) = entry.map_err(db_err)?;
            if !k.value().starts_with(prefix) {
                break;
            }
            out.push(serde_json::from_slice(v.value())?);
        }
        Ok(out)
    }
}

impl CampaignStore for CampaignDb {
    // -----------------------------------------------------------------------
    // Campaigns
    // -----------------------------------------------------------------------

    fn insert_campaign(&self, campaign: &Campaign) -> Result<()> {
        self.put(CAMPAIGNS, campaign.id.as_bytes(), campaign)
    }

    fn get_campaign(&self, id: Uuid) -> Result<Campaign> {
        self.get(CAMPAIGNS, id.as_bytes())?
            .ok_or_else(|| OutreachError::CampaignNotFound(id.to_string()))
    }

    /// Newest first.
    fn list_campaigns(&self) -> Result<Vec<Campaign>> {
        let mut all: Vec<Campaign> = self.scan(CAMPAIGNS, &[])?;
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(all)
    }

    fn update_campaign(&self, id: Uuid, f: Mutation<'_, Campaign>) -> Result<Campaign> {
        self.update(
            CAMPAIGNS,
            id.as_bytes(),
            || OutreachError::CampaignNotFound(id.to_string()),
            f,
        )
    }

    fn get_due_campaigns(&self, now: DateTime<Utc>) -> Result<Vec<Campaign>> {
        let mut due: Vec<Campaign> = self
            .scan::<Campaign>(CAMPAIGNS, &[])?
            .into_iter()
            .filter(|c| match c.status {
                CampaignStatus::Running => true,
                CampaignStatus::Scheduled => c.starts_at.map_or(true, |t| t <= now),
                _ => false,
            })
            .collect();
        due.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(due)
    }

    // -----------------------------------------------------------------------
    // Enrollments
    // -----------------------------------------------------------------------

    fn insert_enrollment(&self, enrollment: &Enrollment) -> Result<()> {
        let key = enrollment_key(enrollment.campaign_id, enrollment.address());
        self.put_new(ENROLLMENTS, &key, enrollment, || {
            OutreachError::AlreadyEnrolled {
                campaign: enrollment.campaign_id.to_string(),
                recipient: enrollment.address().to_string(),
            }
        })
    }

    fn get_enrollment(&self, campaign_id: Uuid, address: &str) -> Result<Option<Enrollment>> {
        self.get(ENROLLMENTS, &enrollment_key(campaign_id, address))
    }

    fn list_enrollments(&self, campaign_id: Uuid) -> Result<Vec<Enrollment>> {
        self.scan(ENROLLMENTS, campaign_id.as_bytes())
    }

    fn get_enrollments_due(
        &self,
        campaign_id: Uuid,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Enrollment>> {
        let mut due: Vec<Enrollment> = self
            .list_enrollments(campaign_id)?
            .into_iter()
            .filter(|e| e.is_due(before))
            .collect();
        due.sort_by(|a, b| {
            a.next_fire_at
                .cmp(&b.next_fire_at)
                .then_with(|| a.enrolled_at.cmp(&b.enrolled_at))
        });
        due.truncate(limit);
        Ok(due)
    }

    fn update_enrollment(
        &self,
        campaign_id: Uuid,
        address: &str,
        f: Mutation<'_, Enrollment>,
    ) -> Result<Enrollment> {
        self.update(
            ENROLLMENTS,
            &enrollment_key(campaign_id, address),
            || OutreachError::EnrollmentNotFound {
                campaign: campaign_id.to_string(),
                recipient: address.to_string(),
            },
            f,
        )
    }

    fn enrollments_for_recipient(&self, address: &str) -> Result<Vec<Enrollment>> {
        Ok(self
            .scan::<Enrollment>(ENROLLMENTS, &[])?
            .into_iter()
            .filter(|e| e.address() == address)
            .collect())
    }

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    fn record_message(&self, record: &MessageRecord) -> Result<()> {
        self.put(MESSAGES, &message_key(&record.key), record)
    }

    fn get_message(&self, key: &MessageKey) -> Result<Option<MessageRecord>> {
        self.get(MESSAGES, &message_key(key))
    }

    fn list_messages(&self, campaign_id: Uuid) -> Result<Vec<MessageRecord>> {
        self.scan(MESSAGES, campaign_id.as_bytes())
    }

    // -----------------------------------------------------------------------
    // Senders
    // -----------------------------------------------------------------------

    fn insert_sender(&self, sender: &Sender) -> Result<()> {
        self.put_new(SENDERS, sender.id.as_bytes(), sender, || {
            OutreachError::SenderExists(sender.id.clone())
        })
    }

    fn get_sender(&self, id: &str) -> Result<Sender> {
        self.get(SENDERS, id.as_bytes())?
            .ok_or_else(|| OutreachError::SenderNotFound(id.to_string()))
    }

    fn list_senders(&self) -> Result<Vec<Sender>> {
        self.scan(SENDERS, &[])
    }

    fn update_sender(&self, id: &str, f: Mutation<'_, Sender>) -> Result<Sender> {
        self.update(
            SENDERS,
            id.as_bytes(),
            || OutreachError::SenderNotFound(id.to_string()),
            f,
        )
    }

    // -----------------------------------------------------------------------
    // Send log
    // -----------------------------------------------------------------------

    fn append_send_log(&self, entry: &SendLogEntry) -> Result<()> {
        self.put(SEND_LOG, &log_key(entry), entry)
    }

    fn send_log_since(&self, sender_id: &str, since: DateTime<Utc>) -> Result<Vec<SendLogEntry>> {
        let lower = log_prefix(sender_id, Some(since));
        let upper = log_end(sender_id);
        let rt = self.db.begin_read().map_err(db_err)?;
        let t = rt.open_table(SEND_LOG).map_err(db_err)?;
        let mut out = Vec::new();
        for entry in t
            .range(lower.as_slice()..upper.as_slice())
            .map_err(db_err)?
        {
            let (_, v) = entry.map_err(db_err)?;
            out.push(serde_json::from_slice(v.value())?);
        }
        Ok(out)
    }

    fn mark_reply(&self, sender_id: &str, address: &str) -> Result<bool> {
        let lower = log_prefix(sender_id, None);
        let upper = log_end(sender_id);
        let wt = self.db.begin_write().map_err(db_err)?;
        let marked = {
            let mut t = wt.open_table(SEND_LOG).map_err(db_err)?;
            let mut found: Option<(Vec<u8>, SendLogEntry)> = None;
            for entry in t
                .range(lower.as_slice()..upper.as_slice())
                .map_err(db_err)?
                .rev()
            {
                let (k, v) = entry.map_err(db_err)?;
                let log: SendLogEntry = serde_json::from_slice(v.value())?;
                if log.recipient == address && log.outcome == LogOutcome::Sent {
                    found = Some((k.value().to_vec(), log));
                    break;
                }
            }
            match found {
                Some((key, mut log)) if !log.replied => {
                    log.replied = true;
                    let encoded = serde_json::to_vec(&log)?;
                    t.insert(key.as_slice(), encoded.as_slice())
                        .map_err(db_err)?;
                    true
                }
                _ => false,
            }
        };
        wt.commit().map_err(db_err)?;
        Ok(marked)
    }

    fn prune_send_log(&self, before: DateTime<Utc>) -> Result<u32> {
        let cutoff = before.timestamp_millis().max(0) as u64;
        let wt = self.db.begin_write().map_err(db_err)?;
        let pruned = {
            let mut t = wt.open_table(SEND_LOG).map_err(db_err)?;
            let mut expired = Vec::new();
            for entry in t.iter().map_err(db_err)? {
                let (k, _) = entry.map_err(db_err)?;
                if log_key_ms(k.value()).is_some_and(|ms| ms < cutoff) {
                    expired.push(k.value().to_vec());
                }
            }
            for key in &expired {
                t.remove(key.as_slice()).map_err(db_err)?;
            }
            expired.len() as u32
        };
        wt.commit().map_err(db_err)?;
        Ok(pruned)
    }

    // -----------------------------------------------------------------------
    // Opt-outs
    // -----------------------------------------------------------------------

    fn add_opt_out(&self, opt_out: &OptOut) -> Result<()> {
        self.put(OPT_OUTS, opt_out.address.as_bytes(), opt_out)
    }

    fn is_opted_out(&self, address: &str) -> Result<bool> {
        Ok(self.get::<OptOut>(OPT_OUTS, address.as_bytes())?.is_some())
    }

    // -----------------------------------------------------------------------
    // Recovery
    // -----------------------------------------------------------------------

    fn startup_recovery(&self, max_age: Duration) -> Result<u32> {
        let cutoff = Utc::now() - chrono::Duration::from_std(max_age).map_err(db_err)?;
        let wt = self.db.begin_write().map_err(db_err)?;
        let count = {
            let mut t = wt.open_table(MESSAGES).map_err(db_err)?;
            let mut stale = Vec::new();
            for entry in t.iter().map_err(db_err)? {
                let (k, v) = entry.map_err(db_err)?;
                let record: MessageRecord = serde_json::from_slice(v.value())?;
                if record.status == MessageStatus::InFlight && record.updated_at < cutoff {
                    stale.push((k.value().to_vec(), record));
                }
            }
            for (key, mut record) in stale.iter().cloned() {
                record.status = MessageStatus::Pending {
                    last_error: Some("interrupted by restart".into()),
                };
                record.updated_at = Utc::now();
                let encoded = serde_json::to_vec(&record)?;
                t.insert(key.as_slice(), encoded.as_slice())
                    .map_err(db_err)?;
            }
            stale.len() as u32
        };
        wt.commit().map_err(db_err)?;
        Ok(count)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
