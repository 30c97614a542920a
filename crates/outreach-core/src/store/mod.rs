//! Persistence boundary for the engine.
//!
//! Everything the scheduler decides is derived from what this trait returns,
//! so a restarted process picks up exactly where the last one stopped.

pub mod db;

use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::campaign::Campaign;
use crate::enrollment::Enrollment;
use crate::error::Result;
use crate::message::{MessageKey, MessageRecord};
use crate::sender::{OptOut, SendLogEntry, Sender};

pub use db::CampaignDb;

/// In-place mutation applied inside a single write transaction. Returning an
/// error aborts the transaction.
pub type Mutation<'a, T> = &'a mut dyn FnMut(&mut T) -> Result<()>;

pub trait CampaignStore: Send + Sync {
    // Campaigns
    fn insert_campaign(&self, campaign: &Campaign) -> Result<()>;
    fn get_campaign(&self, id: Uuid) -> Result<Campaign>;
    fn list_campaigns(&self) -> Result<Vec<Campaign>>;
    fn update_campaign(&self, id: Uuid, f: Mutation<'_, Campaign>) -> Result<Campaign>;
    /// `scheduled` campaigns whose start time has passed, plus every
    /// `running` campaign.
    fn get_due_campaigns(&self, now: DateTime<Utc>) -> Result<Vec<Campaign>>;

    // Enrollments
    fn insert_enrollment(&self, enrollment: &Enrollment) -> Result<()>;
    fn get_enrollment(&self, campaign_id: Uuid, address: &str) -> Result<Option<Enrollment>>;
    fn list_enrollments(&self, campaign_id: Uuid) -> Result<Vec<Enrollment>>;
    /// Active enrollments with `next_fire_at <= before`, earliest first.
    fn get_enrollments_due(
        &self,
        campaign_id: Uuid,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Enrollment>>;
    fn update_enrollment(
        &self,
        campaign_id: Uuid,
        address: &str,
        f: Mutation<'_, Enrollment>,
    ) -> Result<Enrollment>;
    fn enrollments_for_recipient(&self, address: &str) -> Result<Vec<Enrollment>>;

    // Messages
    fn record_message(&self, record: &MessageRecord) -> Result<()>;
    fn get_message(&self, key: &MessageKey) -> Result<Option<MessageRecord>>;
    fn list_messages(&self, campaign_id: Uuid) -> Result<Vec<MessageRecord>>;

    // Senders
    fn insert_sender(&self, sender: &Sender) -> Result<()>;
    fn get_sender(&self, id: &str) -> Result<Sender>;
    fn list_senders(&self) -> Result<Vec<Sender>>;
    fn update_sender(&self, id: &str, f: Mutation<'_, Sender>) -> Result<Sender>;

    // Send log
    fn append_send_log(&self, entry: &SendLogEntry) -> Result<()>;
    fn send_log_since(&self, sender_id: &str, since: DateTime<Utc>) -> Result<Vec<SendLogEntry>>;
    /// Flag the latest sent message from `sender_id` to `address` as replied.
    fn mark_reply(&self, sender_id: &str, address: &str) -> Result<bool>;
    /// Drop log entries timestamped before `before`; returns how many.
    fn prune_send_log(&self, before: DateTime<Utc>) -> Result<u32>;

    // Opt-outs
    fn add_opt_out(&self, opt_out: &OptOut) -> Result<()>;
    fn is_opted_out(&self, address: &str) -> Result<bool>;

    /// Return `in_flight` messages older than `max_age` to `pending`. The
    /// interrupted attempt stays counted.
    fn startup_recovery(&self, max_age: Duration) -> Result<u32>;
}
