use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::campaign::Campaign;
use crate::template::Variables;
use crate::types::EnrollmentState;

/// Variables every recipient provides (possibly blank).
pub const BUILTIN_VARIABLES: &[&str] = &["address", "name", "first_name", "email"];

// ---------------------------------------------------------------------------
// Recipient
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipient {
    /// Channel address, e.g. an E.164 phone number.
    pub address: String,
    #[serde(default, alias = "vars")]
    pub variables: Variables,
}

impl Recipient {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            variables: Variables::new(),
        }
    }

    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    /// Rendering variables: the recipient's own map plus `address` and a
    /// `first_name` derived from `name` when not given explicitly.
    pub fn variables(&self) -> Variables {
        let mut vars = self.variables.clone();
        vars.insert("address".to_string(), self.address.clone());
        let needs_first = vars
            .get("first_name")
            .map(|v| v.trim().is_empty())
            .unwrap_or(true);
        if needs_first {
            let first = vars
                .get("name")
                .and_then(|n| n.split_whitespace().next())
                .map(str::to_string);
            if let Some(first) = first {
                vars.insert("first_name".to_string(), first);
            }
        }
        vars
    }
}

// ---------------------------------------------------------------------------
// Enrollment
// ---------------------------------------------------------------------------

/// Progress of one recipient through one campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Enrollment {
    pub campaign_id: Uuid,
    pub recipient: Recipient,
    pub state: EnrollmentState,
    /// Index into `Campaign::steps` of the next step to send.
    pub current_step: usize,
    /// `None` once the enrollment is terminal.
    pub next_fire_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sent: u32,
    #[serde(default)]
    pub failed: u32,
    pub enrolled_at: DateTime<Utc>,
    #[serde(default)]
    pub replied_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Enrollment {
    pub fn new(campaign: &Campaign, recipient: Recipient, now: DateTime<Utc>) -> Self {
        let mut e = Self {
            campaign_id: campaign.id,
            recipient,
            state: EnrollmentState::Active,
            current_step: 0,
            next_fire_at: None,
            sent: 0,
            failed: 0,
            enrolled_at: now,
            replied_at: None,
            last_error: None,
            updated_at: now,
        };
        e.next_fire_at = e.fire_time(campaign, 0);
        e
    }

    /// Fire time for step `index`: enrollment time plus that step's delay.
    pub fn fire_time(&self, campaign: &Campaign, index: usize) -> Option<DateTime<Utc>> {
        let step = campaign.steps.get(index)?;
        let delay = chrono::Duration::from_std(step.delay).ok()?;
        Some(self.enrolled_at + delay)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state == EnrollmentState::Active && self.next_fire_at.is_some_and(|t| t <= now)
    }

    pub fn address(&self) -> &str {
        &self.recipient.address
    }
}
