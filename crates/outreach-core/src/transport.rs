//! Boundary to the messaging channel.
//!
//! Adapters only report what happened; deciding whether a result is
//! retryable belongs to [`crate::retry`].

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendRequest {
    pub sender_id: String,
    pub recipient: String,
    pub body: String,
    /// Same value on every retry of one message.
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RawSendResult {
    Accepted {
        #[serde(default)]
        provider_id: Option<String>,
    },
    /// The channel answered and refused; `code` drives classification.
    Rejected {
        code: String,
        #[serde(default)]
        detail: String,
    },
    /// No answer: network failure, timeout, adapter crash.
    Unreachable {
        #[serde(default)]
        detail: String,
    },
}

pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    fn send(&self, request: SendRequest) -> BoxFuture<'_, RawSendResult>;
}

/// Accepts every message without touching the network.
#[derive(Debug, Default, Clone)]
pub struct DryRunTransport;

impl Transport for DryRunTransport {
    fn name(&self) -> &str {
        "dry_run"
    }

    fn send(&self, request: SendRequest) -> BoxFuture<'_, RawSendResult> {
        Box::pin(async move {
            info!(
                sender = %request.sender_id,
                to = %request.recipient,
                key = %request.idempotency_key,
                "dry run: {}",
                request.body
            );
            RawSendResult::Accepted {
                provider_id: Some(format!("dry-{}", Uuid::new_v4())),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dry_run_accepts() {
        let t = DryRunTransport;
        let res = t
            .send(SendRequest {
                sender_id: "s".into(),
                recipient: "+1".into(),
                body: "hi".into(),
                idempotency_key: "k".into(),
            })
            .await;
        assert!(matches!(res, RawSendResult::Accepted { provider_id: Some(_) }));
    }

    #[test]
    fn result_wire_format() {
        let r: RawSendResult =
            serde_json::from_str(r#"{"status":"rejected","code":"banned"}"#).unwrap();
        assert_eq!(
            r,
            RawSendResult::Rejected {
                code: "banned".into(),
                detail: String::new()
            }
        );
    }
}
