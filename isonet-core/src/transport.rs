//! Delivery contracts consumed by the broadcaster
//!
//! A [`SignalTransport`] carries one signal to one remote access; a
//! [`LocalReceiver`] handles signals addressed to the current process.
//! [`LoopbackNetwork`] wires several receivers of the same process
//! together without sockets.

use async_trait::async_trait;
use dashmap::DashMap;
use isonet_types::{DeliveryMode, HostAccess, SignalEnvelope};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::error::TransportError;
use crate::receiver::SignalReceiver;

/// A transport provider
///
/// Implementations own the wire format. A failure only concerns the given
/// target: the broadcaster falls through to the next provider.
#[async_trait]
pub trait SignalTransport: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    async fn deliver(
        &self,
        access: &HostAccess,
        mode: DeliveryMode,
        subject: &str,
        envelope: &SignalEnvelope,
    ) -> Result<Vec<Value>, TransportError>;
}

/// In-process delivery for the local sentinel access
#[async_trait]
pub trait LocalReceiver: Send + Sync {
    /// Returns `None` when the signal was refused
    async fn deliver_local(
        &self,
        subject: &str,
        envelope: &SignalEnvelope,
        mode: DeliveryMode,
    ) -> Option<Vec<Value>>;
}

/// Receivers of one process, addressed by port
#[derive(Default)]
pub struct LoopbackNetwork {
    receivers: DashMap<u16, Arc<SignalReceiver>>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make a receiver reachable on the given port
    pub fn attach(&self, port: u16, receiver: Arc<SignalReceiver>) {
        self.receivers.insert(port, receiver);
    }

    pub fn detach(&self, port: u16) -> bool {
        self.receivers.remove(&port).is_some()
    }

    /// A transport whose signals appear to come from `source_host`
    pub fn transport(self: &Arc<Self>, source_host: impl Into<String>) -> LoopbackTransport {
        LoopbackTransport {
            network: self.clone(),
            source_host: source_host.into(),
        }
    }
}

/// Transport over a [`LoopbackNetwork`]
pub struct LoopbackTransport {
    network: Arc<LoopbackNetwork>,
    source_host: String,
}

#[async_trait]
impl SignalTransport for LoopbackTransport {
    fn name(&self) -> &str {
        "loopback"
    }

    async fn deliver(
        &self,
        access: &HostAccess,
        mode: DeliveryMode,
        subject: &str,
        envelope: &SignalEnvelope,
    ) -> Result<Vec<Value>, TransportError> {
        let receiver = self
            .network
            .receivers
            .get(&access.port)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                TransportError::Unreachable(access.to_string(), "no receiver on port".to_string())
            })?;

        let mut envelope = envelope.clone();
        envelope.sender_address = Some(self.source_host.clone());
        debug!(%access, subject, %mode, "loopback delivery");

        let reply = receiver.handle_received(subject, envelope, mode).await;
        reply.into_results()
    }
}
