//! Bounded retry around a single message.
//!
//! The attempt counter lives on the persisted [`MessageRecord`] and is bumped
//! before the transport is called, so a crash mid-send still spends the
//! attempt and a restart never grants extra tries.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::Result;
use crate::message::{FailureKind, MessageRecord, MessageStatus};
use crate::store::CampaignStore;
use crate::transport::{RawSendResult, SendRequest, Transport};

/// Outcome of one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Sent { provider_id: Option<String> },
    TransientFailure { reason: String },
    PermanentFailure { reason: String },
    BanSignal { reason: String },
}

/// Final outcome of a message after all attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DispatchResult {
    Sent { provider_id: Option<String> },
    RetriesExhausted { last_error: String, attempts: u32 },
    PermanentFailure { reason: String },
    BanSignal { reason: String },
}

impl DispatchResult {
    pub fn is_sent(&self) -> bool {
        matches!(self, DispatchResult::Sent { .. })
    }

    /// Short reason for failed outcomes.
    pub fn error(&self) -> Option<&str> {
        match self {
            DispatchResult::Sent { .. } => None,
            DispatchResult::RetriesExhausted { last_error, .. } => Some(last_error.as_str()),
            DispatchResult::PermanentFailure { reason } | DispatchResult::BanSignal { reason } => {
                Some(reason.as_str())
            }
        }
    }
}

pub fn classify(raw: RawSendResult, config: &RetryConfig) -> AttemptOutcome {
    match raw {
        RawSendResult::Accepted { provider_id } => AttemptOutcome::Sent { provider_id },
        RawSendResult::Unreachable { detail } => AttemptOutcome::TransientFailure {
            reason: if detail.is_empty() {
                "unreachable".to_string()
            } else {
                detail
            },
        },
        RawSendResult::Rejected { code, detail } => {
            let reason = if detail.is_empty() {
                code.clone()
            } else {
                format!("{code}: {detail}")
            };
            if config.ban_codes.iter().any(|c| c == &code) {
                AttemptOutcome::BanSignal { reason }
            } else if config.permanent_codes.iter().any(|c| c == &code) {
                AttemptOutcome::PermanentFailure { reason }
            } else {
                AttemptOutcome::TransientFailure { reason }
            }
        }
    }
}

/// Wait before attempt `attempt` (1-based): nothing before the first,
/// `base × 2^(attempt-1)` before every later one.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    if attempt <= 1 {
        return Duration::ZERO;
    }
    let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
    base.saturating_mul(factor)
}

pub struct RetryManager {
    store: Arc<dyn CampaignStore>,
    transport: Arc<dyn Transport>,
    config: RetryConfig,
}

impl RetryManager {
    pub fn new(
        store: Arc<dyn CampaignStore>,
        transport: Arc<dyn Transport>,
        config: RetryConfig,
    ) -> Self {
        Self {
            store,
            transport,
            config,
        }
    }

    /// Drive `record` to a terminal status. A record that already reached one
    /// is returned as-is without touching the transport.
    pub async fn send_with_retry(&self, record: MessageRecord) -> Result<DispatchResult> {
        let mut record = match self.store.get_message(&record.key)? {
            Some(stored) => stored,
            None => record,
        };
        if let Some(done) = terminal_result(&record) {
            return Ok(done);
        }

        let base = Duration::from_millis(self.config.base_delay_ms);
        let mut last_error = match &record.status {
            MessageStatus::Pending {
                last_error: Some(e),
            } => e.clone(),
            _ => String::new(),
        };

        while record.attempts < self.config.max_attempts {
            let attempt = record.attempts + 1;
            let wait = backoff_delay(base, attempt);
            if !wait.is_zero() {
                debug!(key = %record.key, attempt, ?wait, "backing off");
                tokio::time::sleep(wait).await;
            }

            record.attempts = attempt;
            record.status = MessageStatus::InFlight;
            record.updated_at = Utc::now();
            self.store.record_message(&record)?;

            let raw = self
                .transport
                .send(SendRequest {
                    sender_id: record.sender_id.clone(),
                    recipient: record.key.recipient.clone(),
                    body: record.body.clone(),
                    idempotency_key: record.idempotency_key(),
                })
                .await;

            let result = match classify(raw, &self.config) {
                AttemptOutcome::Sent { provider_id } => {
                    record.status = MessageStatus::Sent {
                        at: Utc::now(),
                        provider_id: provider_id.clone(),
                    };
                    Some(DispatchResult::Sent { provider_id })
                }
                AttemptOutcome::PermanentFailure { reason } => {
                    warn!(key = %record.key, %reason, "permanent failure");
                    record.status = MessageStatus::Failed {
                        kind: FailureKind::Permanent,
                        reason: reason.clone(),
                    };
                    Some(DispatchResult::PermanentFailure { reason })
                }
                AttemptOutcome::BanSignal { reason } => {
                    warn!(key = %record.key, sender = %record.sender_id, %reason, "ban signal");
                    record.status = MessageStatus::Failed {
                        kind: FailureKind::BanSignal,
                        reason: reason.clone(),
                    };
                    Some(DispatchResult::BanSignal { reason })
                }
                AttemptOutcome::TransientFailure { reason } => {
                    debug!(key = %record.key, attempt, %reason, "transient failure");
                    record.status = MessageStatus::Pending {
                        last_error: Some(reason.clone()),
                    };
                    last_error = reason;
                    None
                }
            };
            record.updated_at = Utc::now();
            self.store.record_message(&record)?;
            if let Some(result) = result {
                return Ok(result);
            }
        }

        warn!(key = %record.key, attempts = record.attempts, %last_error, "retries exhausted");
        record.status = MessageStatus::Failed {
            kind: FailureKind::RetriesExhausted,
            reason: last_error.clone(),
        };
        record.updated_at = Utc::now();
        self.store.record_message(&record)?;
        Ok(DispatchResult::RetriesExhausted {
            last_error,
            attempts: record.attempts,
        })
    }
}

/// The result a terminal record stands for.
pub fn terminal_result(record: &MessageRecord) -> Option<DispatchResult> {
    match &record.status {
        MessageStatus::Sent { provider_id, .. } => Some(DispatchResult::Sent {
            provider_id: provider_id.clone(),
        }),
        MessageStatus::Failed { kind, reason } => Some(match kind {
            FailureKind::RetriesExhausted => DispatchResult::RetriesExhausted {
                last_error: reason.clone(),
                attempts: record.attempts,
            },
            FailureKind::Permanent => DispatchResult::PermanentFailure {
                reason: reason.clone(),
            },
            FailureKind::BanSignal => DispatchResult::BanSignal {
                reason: reason.clone(),
            },
        }),
        MessageStatus::Pending { .. } | MessageStatus::InFlight => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKey;
    use crate::testing::{open_store, ScriptedTransport};
    use uuid::Uuid;

    fn fast_config() -> RetryConfig {
        RetryConfig {
            base_delay_ms: 1,
            ..RetryConfig::default()
        }
    }

    fn record() -> MessageRecord {
        MessageRecord::new(
            MessageKey::new(Uuid::new_v4(), 0, "+15550001"),
            "line-1",
            "hello",
            Utc::now(),
        )
    }

    fn unreachable() -> RawSendResult {
        RawSendResult::Unreachable {
            detail: "timeout".into(),
        }
    }

    fn rejected(code: &str) -> RawSendResult {
        RawSendResult::Rejected {
            code: code.into(),
            detail: String::new(),
        }
    }

    #[test]
    fn classification() {
        let cfg = RetryConfig::default();
        assert!(matches!(
            classify(RawSendResult::Accepted { provider_id: None }, &cfg),
            AttemptOutcome::Sent { .. }
        ));
        assert!(matches!(
            classify(unreachable(), &cfg),
            AttemptOutcome::TransientFailure { .. }
        ));
        assert!(matches!(
            classify(rejected("invalid_recipient"), &cfg),
            AttemptOutcome::PermanentFailure { .. }
        ));
        assert!(matches!(
            classify(rejected("account_restricted"), &cfg),
            AttemptOutcome::BanSignal { .. }
        ));
        assert!(matches!(
            classify(rejected("rate_limited"), &cfg),
            AttemptOutcome::TransientFailure { .. }
        ));
    }

    #[test]
    fn backoff_doubles_and_never_decreases() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_delay(base, 1), Duration::ZERO);
        assert_eq!(backoff_delay(base, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(4));
        let mut prev = Duration::ZERO;
        for n in 1..40 {
            let d = backoff_delay(base, n);
            assert!(d >= prev, "attempt {n}");
            prev = d;
        }
    }

    #[tokio::test]
    async fn three_transient_failures_exhaust_without_fourth_attempt() {
        let (_dir, store) = open_store();
        let transport = ScriptedTransport::new(vec![
            unreachable(),
            unreachable(),
            unreachable(),
            RawSendResult::Accepted { provider_id: None },
        ]);
        let mgr = RetryManager::new(store.clone(), transport.clone(), fast_config());
        let rec = record();
        let result = mgr.send_with_retry(rec.clone()).await.unwrap();

        assert!(matches!(
            result,
            DispatchResult::RetriesExhausted { attempts: 3, .. }
        ));
        assert_eq!(transport.calls(), 3);
        let stored = store.get_message(&rec.key).unwrap().unwrap();
        assert_eq!(stored.attempts, 3);
        assert!(matches!(
            stored.status,
            MessageStatus::Failed {
                kind: FailureKind::RetriesExhausted,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn ban_on_first_attempt_is_not_retried() {
        let (_dir, store) = open_store();
        let transport = ScriptedTransport::new(vec![rejected("banned")]);
        let mgr = RetryManager::new(store.clone(), transport.clone(), fast_config());
        let result = mgr.send_with_retry(record()).await.unwrap();
        assert!(matches!(result, DispatchResult::BanSignal { .. }));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let (_dir, store) = open_store();
        let transport = ScriptedTransport::new(vec![rejected("invalid_recipient")]);
        let mgr = RetryManager::new(store.clone(), transport.clone(), fast_config());
        let result = mgr.send_with_retry(record()).await.unwrap();
        assert!(matches!(result, DispatchResult::PermanentFailure { .. }));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn transient_then_success() {
        let (_dir, store) = open_store();
        let transport = ScriptedTransport::new(vec![unreachable()]);
        let mgr = RetryManager::new(store.clone(), transport.clone(), fast_config());
        let rec = record();
        let result = mgr.send_with_retry(rec.clone()).await.unwrap();
        assert!(result.is_sent());
        assert_eq!(transport.calls(), 2);
        assert_eq!(store.get_message(&rec.key).unwrap().unwrap().attempts, 2);
        // Every attempt carries the same idempotency key.
        let keys: Vec<String> = transport
            .requests()
            .into_iter()
            .map(|r| r.idempotency_key)
            .collect();
        assert_eq!(keys[0], keys[1]);
    }

    #[tokio::test]
    async fn persisted_attempts_survive_restart() {
        let (_dir, store) = open_store();
        let mut rec = record();
        rec.attempts = 2;
        rec.status = MessageStatus::Pending {
            last_error: Some("timeout".into()),
        };
        store.record_message(&rec).unwrap();

        let transport = ScriptedTransport::new(vec![unreachable(), unreachable()]);
        let mgr = RetryManager::new(store.clone(), transport.clone(), fast_config());
        let fresh = MessageRecord::new(rec.key.clone(), "line-1", "hello", Utc::now());
        let result = mgr.send_with_retry(fresh).await.unwrap();
        assert!(matches!(
            result,
            DispatchResult::RetriesExhausted { attempts: 3, .. }
        ));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn terminal_record_is_not_resent() {
        let (_dir, store) = open_store();
        let mut rec = record();
        rec.attempts = 1;
        rec.status = MessageStatus::Sent {
            at: Utc::now(),
            provider_id: Some("p-1".into()),
        };
        store.record_message(&rec).unwrap();

        let transport = ScriptedTransport::new(vec![]);
        let mgr = RetryManager::new(store.clone(), transport.clone(), fast_config());
        let result = mgr.send_with_retry(rec).await.unwrap();
        assert_eq!(
            result,
            DispatchResult::Sent {
                provider_id: Some("p-1".into())
            }
        );
        assert_eq!(transport.calls(), 0);
    }
}
