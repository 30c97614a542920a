//! HTTP gateway adapter.
//!
//! Each message is POSTed as the JSON form of [`SendRequest`]. The gateway
//! answers with:
//!
//! - `2xx` and an optional `{"id": "..."}` body: accepted
//! - `4xx` and a `{"code": "...", "detail": "..."}` body: rejected
//! - `5xx`, a timeout or a connection error: unreachable
//!
//! The idempotency key also travels in the `Idempotency-Key` header so a
//! gateway can deduplicate retries without reading the body.

use std::time::Duration;

use futures::future::BoxFuture;
use outreach_core::transport::{RawSendResult, SendRequest, Transport};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::Result;

pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AcceptedBody {
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RejectedBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    detail: Option<String>,
}

impl HttpTransport {
    pub fn new(url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
            token,
        })
    }

    async fn post(&self, request: SendRequest) -> RawSendResult {
        let mut builder = self
            .client
            .post(&self.url)
            .header("Idempotency-Key", &request.idempotency_key)
            .json(&request);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }

        let resp = match builder.send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(url = %self.url, error = %e, "gateway unreachable");
                return RawSendResult::Unreachable {
                    detail: e.to_string(),
                };
            }
        };

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        debug!(status = status.as_u16(), key = %request.idempotency_key, "gateway answered");
        interpret(status, &text)
    }
}

/// Map a gateway response onto the adapter-neutral result.
fn interpret(status: StatusCode, body: &str) -> RawSendResult {
    if status.is_success() {
        let parsed: AcceptedBody = serde_json::from_str(body).unwrap_or_default();
        return RawSendResult::Accepted {
            provider_id: parsed.id,
        };
    }
    if status.is_client_error() {
        let parsed: RejectedBody = serde_json::from_str(body).unwrap_or_default();
        let code = parsed.code.unwrap_or_else(|| match status {
            StatusCode::TOO_MANY_REQUESTS => "rate_limited".to_string(),
            StatusCode::BAD_REQUEST => "bad_request".to_string(),
            s => format!("http_{}", s.as_u16()),
        });
        return RawSendResult::Rejected {
            code,
            detail: parsed.detail.unwrap_or_default(),
        };
    }
    RawSendResult::Unreachable {
        detail: format!("gateway returned {status}"),
    }
}

impl Transport for HttpTransport {
    fn name(&self) -> &str {
        "http"
    }

    fn send(&self, request: SendRequest) -> BoxFuture<'_, RawSendResult> {
        Box::pin(self.post(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn request() -> SendRequest {
        SendRequest {
            sender_id: "line-1".into(),
            recipient: "+15550001".into(),
            body: "Hi Ada".into(),
            idempotency_key: "c:0:+15550001".into(),
        }
    }

    #[tokio::test]
    async fn accepted_with_provider_id() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/send")
            .match_header("authorization", "Bearer secret")
            .match_header("idempotency-key", "c:0:+15550001")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "recipient": "+15550001",
                "body": "Hi Ada"
            })))
            .with_status(202)
            .with_body(r#"{"id":"msg-77"}"#)
            .create_async()
            .await;

        let t = HttpTransport::new(
            &format!("{}/send", server.url()),
            Some("secret".into()),
            Duration::from_secs(5),
        )
        .unwrap();
        let res = t.send(request()).await;

        mock.assert_async().await;
        assert_eq!(
            res,
            RawSendResult::Accepted {
                provider_id: Some("msg-77".into())
            }
        );
    }

    #[tokio::test]
    async fn client_error_carries_gateway_code() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/send")
            .with_status(403)
            .with_body(r#"{"code":"banned","detail":"account closed"}"#)
            .create_async()
            .await;

        let t = HttpTransport::new(&format!("{}/send", server.url()), None, Duration::from_secs(5))
            .unwrap();
        let res = t.send(request()).await;
        assert_eq!(
            res,
            RawSendResult::Rejected {
                code: "banned".into(),
                detail: "account closed".into()
            }
        );
    }

    #[tokio::test]
    async fn server_error_is_unreachable() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/send")
            .with_status(503)
            .create_async()
            .await;

        let t = HttpTransport::new(&format!("{}/send", server.url()), None, Duration::from_secs(5))
            .unwrap();
        assert!(matches!(
            t.send(request()).await,
            RawSendResult::Unreachable { .. }
        ));
    }

    #[tokio::test]
    async fn connection_refused_is_unreachable() {
        let t = HttpTransport::new("http://127.0.0.1:9/send", None, Duration::from_secs(2)).unwrap();
        assert!(matches!(
            t.send(request()).await,
            RawSendResult::Unreachable { .. }
        ));
    }

    #[test]
    fn bare_status_codes_get_names() {
        assert_eq!(
            interpret(StatusCode::TOO_MANY_REQUESTS, ""),
            RawSendResult::Rejected {
                code: "rate_limited".into(),
                detail: String::new()
            }
        );
        assert_eq!(
            interpret(StatusCode::NOT_FOUND, "not json"),
            RawSendResult::Rejected {
                code: "http_404".into(),
                detail: String::new()
            }
        );
        assert_eq!(
            interpret(StatusCode::OK, ""),
            RawSendResult::Accepted { provider_id: None }
        );
    }
}
