//! CONFIRM exchange
//!
//! The isolate receiving a beacon sends a CONFIRM signal to the beacon's
//! source host and port, carrying its own identity. The beacon sender
//! registers it and answers with its own identity, which the first side
//! registers in turn.

use isonet_types::{IsolateUid, NodeUid, SignalEnvelope};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::directory::Directory;
use crate::receiver::SignalListener;
use crate::updater::DirectoryUpdater;

/// Subject of the confirmation signal
pub const SIGNAL_CONFIRM_BEAT: &str = "/isonet-discovery/confirm-beat";

/// Identity carried by a confirmation and by its answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmBeat {
    pub uid: IsolateUid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub node: NodeUid,
    pub groups: Vec<String>,
    /// Signal port of the isolate, when the receiving side can't infer it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl ConfirmBeat {
    /// Identity of the local isolate
    pub fn local(directory: &Directory) -> Self {
        let identity = directory.local_identity();
        let port = directory.local_port();
        Self {
            uid: identity.uid.clone(),
            name: Some(identity.name.clone()),
            node: identity.node.clone(),
            groups: identity.groups.clone(),
            port: (port != 0).then_some(port),
        }
    }

    /// Parse a received identity, all or nothing
    ///
    /// `uid`, `node` and `groups` are required and must be well formed.
    pub fn from_value(value: &Value) -> Option<Self> {
        let beat = ConfirmBeat::deserialize(value).ok()?;
        if beat.uid.as_str().trim().is_empty() || beat.node.as_str().trim().is_empty() {
            return None;
        }
        if beat.name.as_deref().is_some_and(|name| name.trim().is_empty()) {
            return None;
        }
        Some(beat)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(self.uid.as_str())
    }
}

/// Writes discovered peers into the directory
pub(crate) struct PeerRegistrar {
    pub(crate) directory: Arc<Directory>,
    pub(crate) updater: Option<Arc<DirectoryUpdater>>,
}

impl PeerRegistrar {
    /// Register a peer reachable on `host:port`
    ///
    /// Returns true if the peer was not known before. Nothing is written
    /// when the registration is refused.
    pub(crate) fn register_peer(&self, beat: &ConfirmBeat, host: &str, port: u16) -> bool {
        if beat.uid == *self.directory.local_uid() {
            debug!("ignoring our own confirmation");
            return false;
        }
        if host.is_empty() {
            warn!(uid = %beat.uid, "discovered peer without address");
            return false;
        }

        let registered = match self.directory.register_isolate(
            beat.uid.as_str(),
            beat.display_name(),
            beat.node.as_str(),
            port,
            &beat.groups,
        ) {
            Ok(registered) => registered,
            Err(err) => {
                warn!(uid = %beat.uid, host, port, %err, "discovered peer refused");
                return false;
            }
        };

        if let Err(err) = self.directory.set_node_address(beat.node.as_str(), host) {
            warn!(node = %beat.node, %err, "can't store node address");
        }

        if registered {
            info!(uid = %beat.uid, node = %beat.node, host, port, "peer discovered");
            if let Some(updater) = &self.updater {
                updater.introduce(&beat.uid);
            }
        }
        registered
    }
}

/// Answers CONFIRM signals with the local identity
pub(crate) struct ConfirmListener {
    pub(crate) registrar: Arc<PeerRegistrar>,
}

impl SignalListener for ConfirmListener {
    fn handle_signal(&self, _subject: &str, envelope: &SignalEnvelope) -> Option<Value> {
        if !envelope.content.is_null() {
            match ConfirmBeat::from_value(&envelope.content) {
                Some(beat) => match (beat.port, envelope.sender_address.as_deref()) {
                    (Some(port), Some(host)) => {
                        self.registrar.register_peer(&beat, host, port);
                    }
                    _ => debug!(uid = %beat.uid, "confirmation without reachable access"),
                },
                None => warn!(sender = %envelope.sender_uid, "malformed confirmation discarded"),
            }
        }

        Some(ConfirmBeat::local(&self.registrar.directory).to_value())
    }
}
