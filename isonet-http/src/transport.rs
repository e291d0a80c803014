//! HTTP transport provider

use async_trait::async_trait;
use isonet_core::{ReceiverReply, SignalTransport, TransportError};
use isonet_types::{DeliveryMode, HostAccess, SignalEnvelope};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::MODE_HEADER;

/// Delivers signals with `reqwest`
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    path: String,
}

impl HttpTransport {
    /// Create a transport posting under the given receiver path
    pub fn new(path: impl Into<String>) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|err| TransportError::Undeliverable(format!("HTTP client: {err}")))?;
        Ok(Self::with_client(client, path))
    }

    pub fn with_client(client: reqwest::Client, path: impl Into<String>) -> Self {
        Self {
            client,
            path: path.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, access: &HostAccess, subject: &str) -> Option<String> {
        let addr = access.socket_addr()?;
        let separator = if subject.starts_with('/') { "" } else { "/" };
        Some(format!("http://{}{}{}{}", addr, self.path, separator, subject))
    }
}

#[async_trait]
impl SignalTransport for HttpTransport {
    fn name(&self) -> &str {
        "http"
    }

    async fn deliver(
        &self,
        access: &HostAccess,
        mode: DeliveryMode,
        subject: &str,
        envelope: &SignalEnvelope,
    ) -> Result<Vec<Value>, TransportError> {
        let url = self
            .url(access, subject)
            .ok_or_else(|| TransportError::Undeliverable("no address for local access".to_string()))?;

        let response = self
            .client
            .post(&url)
            .header(MODE_HEADER, mode.as_str())
            .json(envelope)
            .send()
            .await
            .map_err(|err| {
                if err.is_builder() {
                    TransportError::Undeliverable(err.to_string())
                } else {
                    TransportError::Unreachable(access.to_string(), err.to_string())
                }
            })?;

        let status = response.status();
        debug!(%url, %status, %mode, "signal posted");

        match response.json::<ReceiverReply>().await {
            Ok(reply) if status.is_success() => reply.into_results(),
            Ok(reply) => Err(TransportError::Rejected {
                code: status.as_u16(),
                message: reply.message,
            }),
            Err(_) if !status.is_success() => Err(TransportError::Rejected {
                code: status.as_u16(),
                message: status.to_string(),
            }),
            Err(err) => Err(TransportError::Malformed(err.to_string())),
        }
    }
}
