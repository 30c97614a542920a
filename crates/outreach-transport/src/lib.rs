//! Channel adapters.
//!
//! Each adapter implements [`outreach_core::transport::Transport`] and only
//! reports what the channel said. Classification into retryable, permanent
//! and ban outcomes happens in the core retry manager.

pub mod bridge;
pub mod error;
pub mod http;

use std::sync::Arc;
use std::time::Duration;

use outreach_core::config::TransportConfig;
use outreach_core::transport::{DryRunTransport, Transport};

pub use bridge::BridgeTransport;
pub use error::{Result, TransportError};
pub use http::HttpTransport;

/// Build the adapter selected in `config.yaml`.
pub fn from_config(cfg: &TransportConfig) -> Result<Arc<dyn Transport>> {
    let transport: Arc<dyn Transport> = match cfg {
        TransportConfig::DryRun => Arc::new(DryRunTransport),
        TransportConfig::Http {
            url,
            token_env,
            timeout_secs,
        } => {
            let token = match token_env {
                Some(var) => Some(
                    std::env::var(var).map_err(|_| TransportError::MissingToken(var.clone()))?,
                ),
                None => None,
            };
            Arc::new(HttpTransport::new(
                url,
                token,
                Duration::from_secs(*timeout_secs),
            )?)
        }
        TransportConfig::Bridge { command, args } => {
            Arc::new(BridgeTransport::new(command.clone(), args.clone()))
        }
    };
    tracing::debug!(transport = transport.name(), "transport ready");
    Ok(transport)
}
