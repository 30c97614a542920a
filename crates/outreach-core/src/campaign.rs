//! Campaign definitions and lifecycle.
//!
//! A campaign is created from a [`CampaignSpec`] (the YAML a tenant submits).
//! Step ordering and template variables are checked here rather than at
//! dispatch time, so a stored campaign is always runnable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::time::Duration;
use uuid::Uuid;

use crate::config::JitterConfig;
use crate::enrollment::{Recipient, BUILTIN_VARIABLES};
use crate::error::{OutreachError, Result};
use crate::paths;
use crate::template::{Template, Variables};
use crate::types::{CampaignKind, CampaignStatus};

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// Extra gate evaluated just before a step fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepCondition {
    #[default]
    Always,
    /// Only send while the recipient has not replied since enrolling; a reply
    /// ends the sequence for that recipient.
    NoReply,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// 1-based, contiguous.
    pub ordinal: u32,
    /// Offset from enrollment time.
    #[serde(
        rename = "delay_secs",
        serialize_with = "serialize_duration",
        deserialize_with = "deserialize_duration"
    )]
    pub delay: Duration,
    pub template: String,
    #[serde(default)]
    pub condition: StepCondition,
}

// ---------------------------------------------------------------------------
// CampaignSettings
// ---------------------------------------------------------------------------

/// Per-campaign pacing overrides; unset fields use the scheduler config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CampaignSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter: Option<JitterConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u32>,
}

// ---------------------------------------------------------------------------
// CampaignSpec (input)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StepSpec {
    #[serde(default)]
    pub ordinal: Option<u32>,
    #[serde(default)]
    pub delay_secs: u64,
    pub template: String,
    #[serde(default)]
    pub condition: StepCondition,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CampaignSpec {
    pub name: String,
    pub tenant: String,
    pub kind: CampaignKind,
    pub sender: String,
    #[serde(default)]
    pub starts_at: Option<DateTime<Utc>>,
    /// Broadcast body.
    #[serde(default)]
    pub template: Option<String>,
    /// Drip sequence.
    #[serde(default)]
    pub steps: Vec<StepSpec>,
    /// Extra per-recipient variables the templates may reference.
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub defaults: Variables,
    #[serde(default)]
    pub settings: CampaignSettings,
}

// ---------------------------------------------------------------------------
// Campaign
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: Uuid,
    pub tenant: String,
    pub name: String,
    pub kind: CampaignKind,
    pub status: CampaignStatus,
    pub sender_id: String,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub defaults: Variables,
    #[serde(default)]
    pub settings: CampaignSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub starts_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Campaign {
    /// Validate `spec` and build a `Draft` campaign.
    pub fn from_spec(spec: CampaignSpec, now: DateTime<Utc>) -> Result<Self> {
        if spec.name.trim().is_empty() {
            return Err(config_err("campaign name must not be empty"));
        }
        if spec.tenant.trim().is_empty() {
            return Err(config_err("campaign tenant must not be empty"));
        }
        paths::validate_sender_id(&spec.sender)?;

        let steps = match spec.kind {
            CampaignKind::Broadcast => {
                if !spec.steps.is_empty() {
                    return Err(config_err("broadcast campaigns take a template, not steps"));
                }
                let template = spec
                    .template
                    .ok_or_else(|| config_err("broadcast campaigns require a template"))?;
                vec![Step {
                    ordinal: 1,
                    delay: Duration::ZERO,
                    template,
                    condition: StepCondition::Always,
                }]
            }
            CampaignKind::Drip => {
                if spec.template.is_some() {
                    return Err(config_err("drip campaigns take steps, not a template"));
                }
                if spec.steps.is_empty() {
                    return Err(config_err("drip campaigns require at least one step"));
                }
                build_steps(spec.steps)?
            }
        };

        if let Some(jitter) = spec.settings.jitter {
            if !jitter.is_valid() {
                return Err(config_err(format!(
                    "settings.jitter.min_ms ({}) is greater than max_ms ({})",
                    jitter.min_ms, jitter.max_ms
                )));
            }
        }
        if spec.settings.batch_size == Some(0) {
            return Err(config_err("settings.batch_size must be at least 1"));
        }

        let campaign = Self {
            id: Uuid::new_v4(),
            tenant: spec.tenant,
            name: spec.name,
            kind: spec.kind,
            status: CampaignStatus::Draft,
            sender_id: spec.sender,
            steps,
            fields: spec.fields,
            defaults: spec.defaults,
            settings: spec.settings,
            pause_reason: None,
            created_at: now,
            starts_at: spec.starts_at,
            started_at: None,
            ended_at: None,
            updated_at: now,
        };
        campaign.check_template_variables()?;
        Ok(campaign)
    }

    /// Every placeholder without an inline fallback must be a built-in
    /// variable, a declared field, or have a campaign default.
    fn check_template_variables(&self) -> Result<()> {
        let known: Variables = BUILTIN_VARIABLES
            .iter()
            .map(|s| s.to_string())
            .chain(self.fields.iter().cloned())
            .map(|k| (k, "x".to_string()))
            .collect();

        for step in &self.steps {
            let template = Template::parse(&step.template).map_err(|e| {
                config_err(format!("step {} template: {e}", step.ordinal))
            })?;
            let unknown = template.missing_variables(&known, &self.defaults);
            if !unknown.is_empty() {
                return Err(config_err(format!(
                    "step {} uses undeclared variable(s): {} (declare them in `fields` or give a default)",
                    step.ordinal,
                    unknown.join(", ")
                )));
            }
        }
        Ok(())
    }

    /// Variables a recipient must supply for every step to render.
    pub fn missing_for(&self, recipient: &Recipient) -> Vec<String> {
        let vars = recipient.variables();
        let mut missing = BTreeSet::new();
        for step in &self.steps {
            // Templates were validated at creation.
            if let Ok(t) = Template::parse(&step.template) {
                missing.extend(t.missing_variables(&vars, &self.defaults));
            }
        }
        missing.into_iter().collect()
    }

    pub fn render_step(&self, index: usize, recipient: &Recipient) -> Result<String> {
        let step = self.steps.get(index).ok_or_else(|| {
            config_err(format!("campaign {} has no step index {index}", self.id))
        })?;
        let template = Template::parse(&step.template)?;
        Ok(template.render(&recipient.variables(), &self.defaults)?)
    }

    pub fn jitter(&self, fallback: JitterConfig) -> JitterConfig {
        self.settings.jitter.unwrap_or(fallback)
    }

    pub fn batch_size(&self, fallback: u32) -> u32 {
        self.settings.batch_size.unwrap_or(fallback).max(1)
    }

    /// Apply a lifecycle transition, stamping the relevant timestamps.
    pub fn transition(
        &mut self,
        to: CampaignStatus,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(OutreachError::InvalidTransition {
                from: self.status.to_string(),
                to: to.to_string(),
                reason: "not an allowed campaign transition".to_string(),
            });
        }
        match to {
            CampaignStatus::Running => {
                self.started_at.get_or_insert(now);
                self.pause_reason = None;
            }
            CampaignStatus::Paused => self.pause_reason = reason,
            CampaignStatus::Completed | CampaignStatus::Stopped => {
                self.ended_at = Some(now);
                if reason.is_some() {
                    self.pause_reason = reason;
                }
            }
            CampaignStatus::Draft | CampaignStatus::Scheduled => {}
        }
        self.status = to;
        self.updated_at = now;
        Ok(())
    }
}

fn build_steps(specs: Vec<StepSpec>) -> Result<Vec<Step>> {
    let mut steps: Vec<Step> = Vec::with_capacity(specs.len());
    for (i, spec) in specs.into_iter().enumerate() {
        let expected = i as u32 + 1;
        if let Some(ordinal) = spec.ordinal {
            if ordinal != expected {
                return Err(config_err(format!(
                    "step ordinals must be contiguous from 1: expected {expected}, got {ordinal}"
                )));
            }
        }
        let delay = Duration::from_secs(spec.delay_secs);
        if let Some(prev) = steps.last() {
            if delay < prev.delay {
                return Err(config_err(format!(
                    "step {expected} delay ({}s) is earlier than step {} ({}s)",
                    delay.as_secs(),
                    prev.ordinal,
                    prev.delay.as_secs()
                )));
            }
        }
        steps.push(Step {
            ordinal: expected,
            delay,
            template: spec.template,
            condition: spec.condition,
        });
    }
    Ok(steps)
}

fn config_err(msg: impl Into<String>) -> OutreachError {
    OutreachError::Configuration(msg.into())
}

// ---------------------------------------------------------------------------
// Serde helpers for Duration (serialized as seconds: u64)
// ---------------------------------------------------------------------------

fn serialize_duration<S>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    s.serialize_u64(d.as_secs())
}

fn deserialize_duration<'de, D>(d: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Duration::from_secs(u64::deserialize(d)?))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::drip_spec;

    #[test]
    fn drip_steps_get_contiguous_ordinals() {
        let c = Campaign::from_spec(drip_spec(&[0, 24, 48]), Utc::now()).unwrap();
        let ordinals: Vec<u32> = c.steps.iter().map(|s| s.ordinal).collect();
        assert_eq!(ordinals, vec![1, 2, 3]);
        assert_eq!(c.steps[2].delay, Duration::from_secs(48 * 3600));
        assert_eq!(c.status, CampaignStatus::Draft);
    }

    #[test]
    fn decreasing_delays_are_rejected() {
        let err = Campaign::from_spec(drip_spec(&[0, 48, 24]), Utc::now()).unwrap_err();
        assert!(matches!(err, OutreachError::Configuration(m) if m.contains("earlier")));
    }

    #[test]
    fn explicit_ordinals_must_be_contiguous() {
        let mut spec = drip_spec(&[0, 24]);
        spec.steps[0].ordinal = Some(1);
        spec.steps[1].ordinal = Some(3);
        let err = Campaign::from_spec(spec, Utc::now()).unwrap_err();
        assert!(matches!(err, OutreachError::Configuration(m) if m.contains("contiguous")));
    }

    #[test]
    fn undeclared_variable_is_rejected_at_creation() {
        let mut spec = drip_spec(&[0]);
        spec.steps[0].template = "Use code {promo_code}".into();
        let err = Campaign::from_spec(spec.clone(), Utc::now()).unwrap_err();
        assert!(matches!(err, OutreachError::Configuration(m) if m.contains("promo_code")));

        spec.fields = vec!["promo_code".into()];
        assert!(Campaign::from_spec(spec, Utc::now()).is_ok());
    }

    #[test]
    fn broadcast_becomes_single_zero_delay_step() {
        let spec = CampaignSpec {
            kind: CampaignKind::Broadcast,
            template: Some("Sale today, {first_name|friend}!".into()),
            steps: vec![],
            ..drip_spec(&[])
        };
        let c = Campaign::from_spec(spec, Utc::now()).unwrap();
        assert_eq!(c.steps.len(), 1);
        assert_eq!(c.steps[0].delay, Duration::ZERO);
    }

    #[test]
    fn broadcast_without_template_is_rejected() {
        let spec = CampaignSpec {
            kind: CampaignKind::Broadcast,
            steps: vec![],
            ..drip_spec(&[])
        };
        assert!(Campaign::from_spec(spec, Utc::now()).is_err());
    }

    #[test]
    fn invalid_jitter_override_is_rejected() {
        let mut spec = drip_spec(&[0]);
        spec.settings.jitter = Some(JitterConfig {
            min_ms: 9,
            max_ms: 1,
        });
        assert!(Campaign::from_spec(spec, Utc::now()).is_err());
    }

    #[test]
    fn transitions_stamp_timestamps() {
        let now = Utc::now();
        let mut c = Campaign::from_spec(drip_spec(&[0]), now).unwrap();
        c.transition(CampaignStatus::Running, None, now).unwrap();
        assert_eq!(c.started_at, Some(now));

        c.transition(CampaignStatus::Paused, Some("risk critical".into()), now)
            .unwrap();
        assert_eq!(c.pause_reason.as_deref(), Some("risk critical"));

        c.transition(CampaignStatus::Running, None, now).unwrap();
        assert!(c.pause_reason.is_none());

        c.transition(CampaignStatus::Stopped, None, now).unwrap();
        assert_eq!(c.ended_at, Some(now));
        assert!(c.transition(CampaignStatus::Running, None, now).is_err());
    }

    #[test]
    fn step_serializes_delay_as_seconds() {
        let c = Campaign::from_spec(drip_spec(&[0, 24]), Utc::now()).unwrap();
        let json = serde_json::to_value(&c.steps[1]).unwrap();
        assert_eq!(json["delay_secs"], 86_400);
        let back: Step = serde_json::from_value(json).unwrap();
        assert_eq!(back, c.steps[1]);
    }

    #[test]
    fn missing_for_reports_recipient_gaps() {
        let mut spec = drip_spec(&[0]);
        spec.steps[0].template = "Hi {name}, see {city}".into();
        spec.fields = vec!["city".into()];
        let c = Campaign::from_spec(spec, Utc::now()).unwrap();
        let r = Recipient::new("+15550001").with_var("name", "Kai");
        assert_eq!(c.missing_for(&r), vec!["city".to_string()]);
    }
}
