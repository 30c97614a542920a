//! Bridge adapter: a long-lived helper process that owns the real channel
//! session.
//!
//! Protocol: one JSON [`SendRequest`] per line on the bridge's stdin, one
//! JSON [`RawSendResult`] per line on its stdout, strictly in order. Stderr
//! is collected in the background and attached to crash reports.
//!
//! The process is spawned on the first send and respawned on the next send
//! after it dies.

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use outreach_core::transport::{RawSendResult, SendRequest, Transport};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{info, warn};

use crate::{Result, TransportError};

const REPLY_TIMEOUT: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// BridgeProcess
// ---------------------------------------------------------------------------

struct BridgeProcess {
    child: Child,
    stdin: ChildStdin,
    lines: Lines<BufReader<ChildStdout>>,
    stderr_buf: Arc<Mutex<String>>,
}

impl BridgeProcess {
    fn spawn(command: &str, args: &[String]) -> Result<Self> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Process("stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Process("stdout not captured".into()))?;

        let stderr_buf = Arc::new(Mutex::new(String::new()));
        if let Some(stderr) = child.stderr.take() {
            let buf = Arc::clone(&stderr_buf);
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    if let Ok(mut b) = buf.lock() {
                        if !b.is_empty() {
                            b.push('\n');
                        }
                        b.push_str(&line);
                    }
                }
            });
        }

        info!(command, pid = child.id(), "bridge started");
        Ok(Self {
            child,
            stdin,
            lines: BufReader::new(stdout).lines(),
            stderr_buf,
        })
    }

    async fn exchange(&mut self, request: &SendRequest) -> Result<RawSendResult> {
        let mut buf = serde_json::to_vec(request).map_err(|e| {
            TransportError::Process(format!("failed to serialize request: {e}"))
        })?;
        buf.push(b'\n');
        self.stdin.write_all(&buf).await?;
        self.stdin.flush().await?;

        loop {
            let next = tokio::time::timeout(REPLY_TIMEOUT, self.lines.next_line())
                .await
                .map_err(|_| TransportError::Process("bridge did not answer in time".into()))??;
            let Some(line) = next else {
                return Err(self.exit_error().await);
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            return serde_json::from_str(trimmed).map_err(|source| TransportError::Parse {
                line: trimmed.to_owned(),
                source,
            });
        }
    }

    /// Describe why stdout closed, including whatever stderr captured.
    async fn exit_error(&mut self) -> TransportError {
        let status = match self.child.wait().await {
            Ok(s) => s,
            Err(e) => return TransportError::Io(e),
        };
        let stderr = self
            .stderr_buf
            .lock()
            .ok()
            .map(|b| b.clone())
            .unwrap_or_default();
        let what = match status.code() {
            Some(code) => format!("bridge exited with code {code}"),
            None => "bridge terminated by signal".to_string(),
        };
        if stderr.is_empty() {
            TransportError::Process(what)
        } else {
            TransportError::Process(format!("{what}\nstderr: {stderr}"))
        }
    }
}

// ---------------------------------------------------------------------------
// BridgeTransport
// ---------------------------------------------------------------------------

pub struct BridgeTransport {
    command: String,
    args: Vec<String>,
    process: tokio::sync::Mutex<Option<BridgeProcess>>,
}

impl BridgeTransport {
    pub fn new(command: String, args: Vec<String>) -> Self {
        Self {
            command,
            args,
            process: tokio::sync::Mutex::new(None),
        }
    }

    async fn round_trip(&self, request: SendRequest) -> RawSendResult {
        let mut guard = self.process.lock().await;
        if guard.is_none() {
            match BridgeProcess::spawn(&self.command, &self.args) {
                Ok(p) => *guard = Some(p),
                Err(e) => {
                    warn!(command = %self.command, error = %e, "bridge failed to start");
                    return RawSendResult::Unreachable {
                        detail: e.to_string(),
                    };
                }
            }
        }
        let Some(process) = guard.as_mut() else {
            return RawSendResult::Unreachable {
                detail: "bridge not running".into(),
            };
        };

        match process.exchange(&request).await {
            Ok(result) => result,
            Err(e) => {
                // The pipe is out of step or dead; start fresh next time.
                warn!(key = %request.idempotency_key, error = %e, "bridge exchange failed");
                *guard = None;
                RawSendResult::Unreachable {
                    detail: e.to_string(),
                }
            }
        }
    }
}

impl Transport for BridgeTransport {
    fn name(&self) -> &str {
        "bridge"
    }

    fn send(&self, request: SendRequest) -> BoxFuture<'_, RawSendResult> {
        Box::pin(self.round_trip(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> BridgeTransport {
        BridgeTransport::new("sh".into(), vec!["-c".into(), script.into()])
    }

    fn request(n: u32) -> SendRequest {
        SendRequest {
            sender_id: "line-1".into(),
            recipient: format!("+1555000{n}"),
            body: "hello".into(),
            idempotency_key: format!("k{n}"),
        }
    }

    #[tokio::test]
    async fn one_process_serves_many_requests() {
        let t = sh(r#"n=0; while read line; do n=$((n+1)); echo "{\"status\":\"accepted\",\"provider_id\":\"b$n\"}"; done"#);
        for i in 1..=3 {
            let res = t.send(request(i)).await;
            assert_eq!(
                res,
                RawSendResult::Accepted {
                    provider_id: Some(format!("b{i}"))
                }
            );
        }
    }

    #[tokio::test]
    async fn rejection_is_passed_through() {
        let t = sh(r#"while read line; do echo '{"status":"rejected","code":"invalid_recipient"}'; done"#);
        assert_eq!(
            t.send(request(1)).await,
            RawSendResult::Rejected {
                code: "invalid_recipient".into(),
                detail: String::new()
            }
        );
    }

    #[tokio::test]
    async fn crash_reports_unreachable_then_respawns() {
        let dir = tempfile::TempDir::new().unwrap();
        let marker = dir.path().join("started");
        // First incarnation dies on its first request; the second answers.
        let script = format!(
            r#"if [ -e "{m}" ]; then while read line; do echo '{{"status":"accepted"}}'; done; else touch "{m}"; read line; echo boom >&2; exit 3; fi"#,
            m = marker.display()
        );
        let t = sh(&script);

        match t.send(request(1)).await {
            RawSendResult::Unreachable { detail } => assert!(detail.contains("code 3"), "{detail}"),
            other => panic!("expected unreachable, got {other:?}"),
        }
        assert_eq!(
            t.send(request(2)).await,
            RawSendResult::Accepted { provider_id: None }
        );
    }

    #[tokio::test]
    async fn garbage_line_is_unreachable() {
        let t = sh("while read line; do echo not-json; done");
        assert!(matches!(
            t.send(request(1)).await,
            RawSendResult::Unreachable { .. }
        ));
    }

    #[tokio::test]
    async fn missing_binary_is_unreachable() {
        let t = BridgeTransport::new("no-such-bridge-binary".into(), vec![]);
        assert!(matches!(
            t.send(request(1)).await,
            RawSendResult::Unreachable { .. }
        ));
    }
}
