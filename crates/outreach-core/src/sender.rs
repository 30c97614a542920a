use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::budget::BudgetWindow;
use crate::config::{LimitsConfig, WarmupConfig};
use crate::error::Result;
use crate::paths;
use crate::risk::RiskAssessment;

// ---------------------------------------------------------------------------
// Sender
// ---------------------------------------------------------------------------

/// A sending identity (one account/number on the channel) and its budget.
///
/// All mutations go through the sender's budget actor; see
/// [`crate::budget::RateLimiter`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sender {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Day 1 of the warmup ramp is the UTC date of this instant.
    pub activated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hourly_cap: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_cap: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ramp: Option<Vec<u32>>,
    #[serde(default)]
    pub window: BudgetWindow,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk: Option<RiskAssessment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_ban_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_ban_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Sender {
    pub fn new(id: &str, activated_at: DateTime<Utc>, now: DateTime<Utc>) -> Result<Self> {
        paths::validate_sender_id(id)?;
        Ok(Self {
            id: id.to_string(),
            label: None,
            activated_at,
            hourly_cap: None,
            daily_cap: None,
            ramp: None,
            window: BudgetWindow::default(),
            risk: None,
            last_ban_at: None,
            last_ban_reason: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn hourly_cap(&self, limits: &LimitsConfig) -> u32 {
        self.hourly_cap.unwrap_or(limits.hourly_cap)
    }

    pub fn daily_cap(&self, limits: &LimitsConfig) -> u32 {
        self.daily_cap.unwrap_or(limits.daily_cap)
    }

    pub fn ramp<'a>(&'a self, warmup: &'a WarmupConfig) -> &'a [u32] {
        self.ramp.as_deref().unwrap_or(&warmup.ramp)
    }
}

// ---------------------------------------------------------------------------
// Send log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogOutcome {
    Sent,
    Failed,
    BanSignal,
}

/// One finished dispatch, kept per sender for risk scoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendLogEntry {
    pub id: Uuid,
    pub sender_id: String,
    pub campaign_id: Uuid,
    pub recipient: String,
    pub body: String,
    pub outcome: LogOutcome,
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub replied: bool,
}

impl SendLogEntry {
    pub fn new(
        sender_id: &str,
        campaign_id: Uuid,
        recipient: &str,
        body: &str,
        outcome: LogOutcome,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender_id: sender_id.to_string(),
            campaign_id,
            recipient: recipient.to_string(),
            body: body.to_string(),
            outcome,
            at,
            replied: false,
        }
    }
}

// ---------------------------------------------------------------------------
// OptOut
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptOut {
    pub address: String,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}
