//! Persisted per-message dispatch records.
//!
//! One `MessageRecord` exists per idempotency key `(campaign, step, recipient)`.
//! Its attempt count is written before every send, so a restarted process
//! continues the retry budget instead of starting a fresh one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageKey {
    pub campaign_id: Uuid,
    pub step: u32,
    pub recipient: String,
}

impl MessageKey {
    pub fn new(campaign_id: Uuid, step: usize, recipient: impl Into<String>) -> Self {
        Self {
            campaign_id,
            step: step as u32,
            recipient: recipient.into(),
        }
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.campaign_id, self.step, self.recipient)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Transient failures until the attempt budget ran out.
    RetriesExhausted,
    /// The adapter rejected the recipient itself.
    Permanent,
    /// The adapter reported an account-level restriction.
    BanSignal,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::RetriesExhausted => "retries_exhausted",
            FailureKind::Permanent => "permanent",
            FailureKind::BanSignal => "ban_signal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageStatus {
    /// Not yet attempted, or waiting for the next retry.
    Pending {
        #[serde(default)]
        last_error: Option<String>,
    },
    /// An attempt was started; if the process dies here the outcome is unknown.
    InFlight,
    Sent {
        at: DateTime<Utc>,
        #[serde(default)]
        provider_id: Option<String>,
    },
    Failed { kind: FailureKind, reason: String },
}

impl MessageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Sent { .. } | MessageStatus::Failed { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub key: MessageKey,
    pub sender_id: String,
    pub body: String,
    /// Attempts started so far, including one that may be in flight.
    pub attempts: u32,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MessageRecord {
    pub fn new(
        key: MessageKey,
        sender_id: impl Into<String>,
        body: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            key,
            sender_id: sender_id.into(),
            body: body.into(),
            attempts: 0,
            status: MessageStatus::Pending { last_error: None },
            created_at: now,
            updated_at: now,
        }
    }

    /// Stable idempotency key handed to the transport.
    pub fn idempotency_key(&self) -> String {
        self.key.to_string()
    }
}
