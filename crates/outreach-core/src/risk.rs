//! Sender risk scoring.
//!
//! Three factors, each normalized to `[0, 1]`, are combined into a weighted
//! score out of 100:
//!
//! * **volume**: messages sent in the trailing volume window relative to a
//!   configured ceiling;
//! * **similarity**: mean pairwise Jaccard similarity of word-trigram
//!   shingles over the most recent bodies (personalized copies of one
//!   template score high, varied copy scores low);
//! * **non_response**: share of messages in the response window that drew no
//!   reply, only once a minimum sample exists. Sends inside the reply grace
//!   period are not counted yet.
//!
//! A ban signal inside the lookback window overrides the factors and pins
//! the score at 100.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{RiskConfig, RiskThresholds};
use crate::error::Result;
use crate::sender::{LogOutcome, SendLogEntry};
use crate::store::CampaignStore;
use crate::types::RiskLevel;

const SHINGLE_WIDTH: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskFactor {
    pub name: String,
    /// Normalized to `[0, 1]`.
    pub value: f64,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub sender_id: String,
    pub score: u32,
    pub level: RiskLevel,
    pub factors: Vec<RiskFactor>,
    #[serde(default)]
    pub banned: bool,
    pub assessed_at: DateTime<Utc>,
}

/// Raw measurements a score is computed from.
#[derive(Debug, Clone, Default)]
pub struct RiskInputs {
    pub sent_in_volume_window: u32,
    pub recent_bodies: Vec<String>,
    pub sent_in_response_window: u32,
    pub replies_in_response_window: u32,
    pub recent_ban: bool,
}

pub fn level_for(score: u32, thresholds: &RiskThresholds) -> RiskLevel {
    if score >= thresholds.critical {
        RiskLevel::Critical
    } else if score >= thresholds.high {
        RiskLevel::High
    } else if score >= thresholds.medium {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}

fn shingles(body: &str) -> HashSet<Vec<String>> {
    let words: Vec<String> = body
        .split_whitespace()
        .map(|w| {
            w.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|w| !w.is_empty())
        .collect();
    if words.len() < SHINGLE_WIDTH {
        return std::iter::once(words).filter(|w| !w.is_empty()).collect();
    }
    words.windows(SHINGLE_WIDTH).map(|w| w.to_vec()).collect()
}

fn jaccard(a: &HashSet<Vec<String>>, b: &HashSet<Vec<String>>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let inter = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    inter / union
}

/// Mean pairwise Jaccard similarity; zero with fewer than two bodies.
pub fn similarity(bodies: &[String]) -> f64 {
    if bodies.len() < 2 {
        return 0.0;
    }
    let sets: Vec<_> = bodies.iter().map(|b| shingles(b)).collect();
    let mut total = 0.0;
    let mut pairs = 0usize;
    for i in 0..sets.len() {
        for j in i + 1..sets.len() {
            total += jaccard(&sets[i], &sets[j]);
            pairs += 1;
        }
    }
    total / pairs as f64
}

/// Score and factors for `inputs`. Pure; higher inputs never lower the score.
pub fn assess_inputs(inputs: &RiskInputs, config: &RiskConfig) -> (u32, RiskLevel, Vec<RiskFactor>) {
    let w = config.weights;
    let volume = if config.volume_ceiling == 0 {
        1.0
    } else {
        (inputs.sent_in_volume_window as f64 / config.volume_ceiling as f64).min(1.0)
    };
    let non_response = if inputs.sent_in_response_window == 0
        || inputs.sent_in_response_window < config.min_response_sample
    {
        0.0
    } else {
        let replied = inputs
            .replies_in_response_window
            .min(inputs.sent_in_response_window) as f64;
        1.0 - replied / inputs.sent_in_response_window as f64
    };
    let factors = vec![
        RiskFactor {
            name: "volume".into(),
            value: volume,
            weight: w.volume,
        },
        RiskFactor {
            name: "similarity".into(),
            value: similarity(&inputs.recent_bodies).clamp(0.0, 1.0),
            weight: w.similarity,
        },
        RiskFactor {
            name: "non_response".into(),
            value: non_response,
            weight: w.non_response,
        },
    ];

    let score = if inputs.recent_ban {
        100
    } else {
        let raw: f64 = factors.iter().map(|f| f.value * f.weight).sum::<f64>() * 100.0;
        raw.round().clamp(0.0, 100.0) as u32
    };
    let level = if inputs.recent_ban {
        RiskLevel::Critical
    } else {
        level_for(score, &config.thresholds)
    };
    (score, level, factors)
}

pub struct RiskMonitor {
    store: Arc<dyn CampaignStore>,
    config: RiskConfig,
}

impl RiskMonitor {
    pub fn new(store: Arc<dyn CampaignStore>, config: RiskConfig) -> Self {
        Self { store, config }
    }

    /// Gather the sender's recent history and score it.
    pub fn assess(&self, sender_id: &str, now: DateTime<Utc>) -> Result<RiskAssessment> {
        let sender = self.store.get_sender(sender_id)?;
        let cfg = &self.config;

        let volume_since = now - Duration::minutes(cfg.volume_window_minutes.max(0));
        let response_since = now - Duration::hours(cfg.response_window_hours.max(0));
        let since = volume_since.min(response_since);
        let log = self.store.send_log_since(sender_id, since)?;
        let sent: Vec<&SendLogEntry> = log
            .iter()
            .filter(|e| e.outcome == LogOutcome::Sent && e.at <= now)
            .collect();

        let answerable_before = now - Duration::hours(cfg.reply_grace_hours.max(0));
        let in_response: Vec<&&SendLogEntry> = sent
            .iter()
            .filter(|e| e.at >= response_since && e.at <= answerable_before)
            .collect();
        let recent_bodies: Vec<String> = sent
            .iter()
            .rev()
            .take(cfg.similarity_sample)
            .map(|e| e.body.clone())
            .collect();

        let inputs = RiskInputs {
            sent_in_volume_window: sent.iter().filter(|e| e.at >= volume_since).count() as u32,
            recent_bodies,
            sent_in_response_window: in_response.len() as u32,
            replies_in_response_window: in_response.iter().filter(|e| e.replied).count() as u32,
            recent_ban: sender
                .last_ban_at
                .is_some_and(|t| now - t <= Duration::hours(cfg.ban_lookback_hours)),
        };
        let (score, level, factors) = assess_inputs(&inputs, cfg);
        Ok(RiskAssessment {
            sender_id: sender_id.to_string(),
            score,
            level,
            factors,
            banned: inputs.recent_ban,
            assessed_at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CampaignDb;
    use crate::testing::{add_sender, open_store};
    use uuid::Uuid;

    fn bodies(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn identical_bodies_are_fully_similar() {
        let b = bodies(&["hello there friend, big sale", "hello there friend, big sale"]);
        assert!((similarity(&b) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn unrelated_bodies_are_not_similar() {
        let b = bodies(&[
            "your parcel ships tomorrow morning",
            "dinner reservations confirmed for eight",
        ]);
        assert_eq!(similarity(&b), 0.0);
        assert_eq!(similarity(&b[..1]), 0.0);
    }

    #[test]
    fn levels_follow_thresholds() {
        let t = RiskThresholds::default();
        assert_eq!(level_for(0, &t), RiskLevel::Low);
        assert_eq!(level_for(39, &t), RiskLevel::Low);
        assert_eq!(level_for(40, &t), RiskLevel::Medium);
        assert_eq!(level_for(60, &t), RiskLevel::High);
        assert_eq!(level_for(80, &t), RiskLevel::Critical);
        assert_eq!(level_for(100, &t), RiskLevel::Critical);
    }

    #[test]
    fn score_is_monotonic_in_each_factor() {
        let cfg = RiskConfig::default();
        let base = RiskInputs {
            sent_in_volume_window: 10,
            recent_bodies: bodies(&["a b c d", "e f g h"]),
            sent_in_response_window: 40,
            replies_in_response_window: 20,
            recent_ban: false,
        };
        let (s0, _, _) = assess_inputs(&base, &cfg);

        let more_volume = RiskInputs {
            sent_in_volume_window: 50,
            ..base.clone()
        };
        let more_similar = RiskInputs {
            recent_bodies: bodies(&["a b c d", "a b c d"]),
            ..base.clone()
        };
        let fewer_replies = RiskInputs {
            replies_in_response_window: 2,
            ..base.clone()
        };
        for worse in [more_volume, more_similar, fewer_replies] {
            let (s1, _, _) = assess_inputs(&worse, &cfg);
            assert!(s1 >= s0, "{s1} < {s0}");
        }
    }

    #[test]
    fn response_factor_waits_for_minimum_sample() {
        let cfg = RiskConfig::default();
        let inputs = RiskInputs {
            sent_in_response_window: 5,
            replies_in_response_window: 0,
            ..Default::default()
        };
        let (_, _, factors) = assess_inputs(&inputs, &cfg);
        assert_eq!(factors[2].value, 0.0);
    }

    #[test]
    fn saturated_inputs_reach_critical() {
        let cfg = RiskConfig::default();
        let inputs = RiskInputs {
            sent_in_volume_window: 500,
            recent_bodies: bodies(&["same text here", "same text here", "same text here"]),
            sent_in_response_window: 100,
            replies_in_response_window: 0,
            recent_ban: false,
        };
        let (score, level, _) = assess_inputs(&inputs, &cfg);
        assert_eq!(score, 100);
        assert_eq!(level, RiskLevel::Critical);
    }

    #[test]
    fn ban_forces_critical() {
        let (score, level, _) = assess_inputs(
            &RiskInputs {
                recent_ban: true,
                ..Default::default()
            },
            &RiskConfig::default(),
        );
        assert_eq!((score, level), (100, RiskLevel::Critical));
    }

    fn log_sends(store: &CampaignDb, cid: Uuid, ats: impl Iterator<Item = DateTime<Utc>>) {
        for (i, at) in ats.enumerate() {
            store
                .append_send_log(&SendLogEntry::new(
                    "line-1",
                    cid,
                    &format!("+1{i:03}"),
                    "Hi there, the spring sale ends tonight",
                    LogOutcome::Sent,
                    at,
                ))
                .unwrap();
        }
    }

    #[test]
    fn monitor_reads_send_log_and_ban() {
        let (_dir, store) = open_store();
        let now = Utc::now();
        add_sender(&store, "line-1", now - Duration::days(20));
        let cid = Uuid::new_v4();
        log_sends(&store, cid, (0..30).map(|i| now - Duration::minutes(i)));
        log_sends(&store, cid, (0..30).map(|i| now - Duration::hours(30) - Duration::minutes(i)));
        let monitor = RiskMonitor::new(store.clone(), RiskConfig::default());
        let a = monitor.assess("line-1", now).unwrap();
        // 30/60 volume, identical bodies, 30 answerable sends and no replies.
        assert!((82..=83).contains(&a.score), "score {}", a.score);
        assert_eq!(a.level, RiskLevel::Critical);
        assert!(!a.banned);

        store
            .update_sender("line-1", &mut |s| {
                s.last_ban_at = Some(now - Duration::hours(30));
                Ok(())
            })
            .unwrap();
        assert!(!monitor.assess("line-1", now).unwrap().banned);
        store
            .update_sender("line-1", &mut |s| {
                s.last_ban_at = Some(now - Duration::hours(1));
                Ok(())
            })
            .unwrap();
        let banned = monitor.assess("line-1", now).unwrap();
        assert!(banned.banned);
        assert_eq!(banned.score, 100);
    }

    #[test]
    fn fresh_sends_wait_out_the_reply_grace() {
        let (_dir, store) = open_store();
        let now = Utc::now();
        add_sender(&store, "line-1", now - Duration::days(30));
        let cid = Uuid::new_v4();
        log_sends(&store, cid, (0..50).map(|i| now - Duration::seconds(i)));

        let monitor = RiskMonitor::new(store.clone(), RiskConfig::default());
        let a = monitor.assess("line-1", now).unwrap();
        assert_eq!(a.factors[2].value, 0.0);
        assert!(a.level < RiskLevel::Critical, "score {}", a.score);

        // The same sends count once the grace period has passed.
        let later = monitor.assess("line-1", now + Duration::hours(25)).unwrap();
        assert_eq!(later.factors[2].value, 1.0);

        let no_grace = RiskMonitor::new(
            store.clone(),
            RiskConfig {
                reply_grace_hours: 0,
                ..RiskConfig::default()
            },
        );
        assert_eq!(no_grace.assess("line-1", now).unwrap().factors[2].value, 1.0);
    }
}
