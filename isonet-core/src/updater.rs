//! Directory handshake between isolates
//!
//! An isolate announces itself with a `register` signal; the receiver
//! registers it and answers with `register/syn-ack`, which the announcer
//! acknowledges with `register/ack`. Each side validates the other when it
//! gets the second and third message respectively.
//!
//! ```text
//!   A                               B
//!   │── register {A} ─────────────▶ │  A registered, synchronizing
//!   │ ◀──────────────── syn-ack ─── │
//!   │  B validated                  │
//!   │── ack ──────────────────────▶ │  A validated
//! ```
//!
//! A starting isolate can also fetch the whole directory of a peer with
//! `dump`, then announce itself to everyone it learned about.

use isonet_types::{BaseGroup, IsolateUid, NodeUid, SignalEnvelope, SubscriptionId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::broadcaster::{Broadcaster, SendResult, Target};
use crate::config::UpdaterConfig;
use crate::directory::{Directory, DirectorySnapshot};
use crate::error::{CoreError, TransportError};
use crate::receiver::{SignalListener, SignalReceiver, DEFAULT_PRIORITY};

pub const SIGNAL_PREFIX: &str = "/isonet-directory";
pub const SIGNAL_DUMP: &str = "/isonet-directory/dump";
pub const SIGNAL_REGISTER: &str = "/isonet-directory/register";
pub const SIGNAL_REGISTER_SYNACK: &str = "/isonet-directory/register/syn-ack";
pub const SIGNAL_REGISTER_ACK: &str = "/isonet-directory/register/ack";
pub const SIGNAL_CONTACT: &str = "/isonet-directory/contact";
pub const SIGNAL_ISOLATE_LOST: &str = "/isonet/isolate/lost";

/// Pause between two dump requests
const DUMP_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Content of a `register` signal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub uid: IsolateUid,
    pub name: String,
    pub node: NodeUid,
    /// Host of the node, set when the registration is relayed
    #[serde(default)]
    pub address: Option<String>,
    pub port: u16,
    #[serde(default)]
    pub groups: Vec<String>,
    /// Receivers relay the registration to the isolates they know
    #[serde(default)]
    pub propagate: bool,
}

#[derive(Debug, Deserialize)]
struct Contact {
    port: u16,
}

/// Keeps the directory in sync with the other isolates
pub struct DirectoryUpdater {
    this: Weak<DirectoryUpdater>,
    directory: Arc<Directory>,
    broadcaster: Broadcaster,
    receiver: Arc<SignalReceiver>,
    dump_attempts: u32,
    /// Serializes the handling of directory signals
    lock: Mutex<()>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
}

impl DirectoryUpdater {
    pub fn new(
        config: &UpdaterConfig,
        directory: Arc<Directory>,
        broadcaster: Broadcaster,
        receiver: Arc<SignalReceiver>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            directory,
            broadcaster,
            receiver,
            dump_attempts: config.dump_attempts.max(1),
            lock: Mutex::new(()),
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    /// Start handling directory signals
    pub fn start(self: &Arc<Self>) {
        let mut subscriptions = self.subscriptions.lock();
        if !subscriptions.is_empty() {
            return;
        }
        let listener: Arc<dyn SignalListener> = self.clone();
        subscriptions.push(self.receiver.register_listener(
            format!("{SIGNAL_PREFIX}/**"),
            listener.clone(),
            DEFAULT_PRIORITY,
        ));
        subscriptions.push(self.receiver.register_listener(
            SIGNAL_ISOLATE_LOST,
            listener,
            DEFAULT_PRIORITY,
        ));
        info!("directory updater started");
    }

    pub fn stop(&self) {
        let subscriptions: Vec<SubscriptionId> = self.subscriptions.lock().drain(..).collect();
        if subscriptions.is_empty() {
            return;
        }
        for id in subscriptions {
            self.receiver.unregister_listener(id);
        }
        info!("directory updater stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.subscriptions.lock().is_empty()
    }

    /// Registration content describing the local isolate
    pub fn local_registration(&self, propagate: bool) -> Registration {
        let identity = self.directory.local_identity();
        Registration {
            uid: identity.uid.clone(),
            name: identity.name.clone(),
            node: identity.node.clone(),
            address: None,
            port: self.directory.local_port(),
            groups: identity.groups.clone(),
            propagate,
        }
    }

    fn registration_value(&self, propagate: bool) -> Value {
        serde_json::to_value(self.local_registration(propagate)).unwrap_or(Value::Null)
    }

    fn stored_others(&self) -> Target {
        Target::group(BaseGroup::Stored).excluding(self.directory.local_uid().clone())
    }

    /// Start the handshake with a newly known isolate
    pub fn introduce(&self, uid: &IsolateUid) {
        if !self.is_running() {
            return;
        }
        debug!(%uid, "introducing ourselves");
        self.broadcaster.fire(
            SIGNAL_REGISTER,
            self.registration_value(false),
            &Target::isolate(uid.as_str()),
        );
    }

    /// Announce the local isolate to every other known isolate
    ///
    /// Targets every stored isolate, validated or not: right after a dump
    /// merge none of them is validated yet.
    pub async fn send_registration_to_all(&self, propagate: bool) -> Option<SendResult> {
        let result = self
            .broadcaster
            .send(
                SIGNAL_REGISTER,
                self.registration_value(propagate),
                &self.stored_others(),
            )
            .await;
        match &result {
            Some(result) => debug!(reached = result.results.len(), failed = result.failed.len(), "registration sent"),
            None => debug!("no isolate to send our registration to"),
        }
        result
    }

    /// Fetch and merge the directory of the isolate listening on `host:port`
    ///
    /// The host of `ignored_node` in the dump is not stored. Returns the
    /// newly registered isolates.
    pub async fn grab_directory(
        &self,
        host: &str,
        port: u16,
        ignored_node: Option<NodeUid>,
    ) -> Result<Vec<IsolateUid>, CoreError> {
        let mut reply = None;
        for attempt in 1..=self.dump_attempts {
            match self
                .broadcaster
                .send_to(SIGNAL_DUMP, self.registration_value(false), host, port)
                .await
            {
                Ok(results) if !results.is_empty() => {
                    debug!(host, port, attempt, "directory grabbed");
                    reply = Some(results);
                    break;
                }
                Ok(_) => warn!(host, port, attempt, max = self.dump_attempts, "empty directory dump"),
                Err(err) => warn!(host, port, attempt, max = self.dump_attempts, %err, "directory dump failed"),
            }
            if attempt < self.dump_attempts {
                tokio::time::sleep(DUMP_RETRY_DELAY).await;
            }
        }

        let mut results = reply.ok_or_else(|| {
            TransportError::Exhausted(format!("directory dump from {host}:{port}"))
        })?;
        if results.len() > 1 {
            warn!(count = results.len(), "several dumps received, using the first one");
        }
        let snapshot: DirectorySnapshot = serde_json::from_value(results.swap_remove(0))
            .map_err(|err| TransportError::Malformed(format!("directory dump: {err}")))?;

        // The dumper's own node is reachable where we reached the dumper
        if let Some(origin) = &snapshot.origin {
            if origin != self.directory.local_node() && ignored_node.as_ref() != Some(origin) {
                self.directory.set_node_address(origin.as_str(), host)?;
            }
        }

        let ignored_nodes: Vec<NodeUid> = ignored_node.into_iter().collect();
        let registered = self.directory.store_dump(&snapshot, &ignored_nodes, &[]);
        info!(host, port, new = registered.len(), "directory merged");

        self.send_registration_to_all(true).await;
        Ok(registered)
    }

    fn handle_register(&self, envelope: &SignalEnvelope) -> bool {
        let mut registration: Registration = match envelope.content_as() {
            Ok(registration) => registration,
            Err(err) => {
                warn!(sender = %envelope.sender_uid, %err, "invalid registration");
                return false;
            }
        };
        let uid = registration.uid.clone();
        if uid == *self.directory.local_uid() {
            return false;
        }

        let address = if registration.node == envelope.sender_node {
            envelope.sender_address.clone()
        } else {
            registration
                .address
                .clone()
                .filter(|address| !address.is_empty())
                .or_else(|| envelope.sender_address.clone())
        };
        let Some(address) = address else {
            warn!(%uid, "registration without any address");
            return false;
        };

        let registered = match self.directory.register_isolate(
            uid.as_str(),
            &registration.name,
            registration.node.as_str(),
            registration.port,
            &registration.groups,
        ) {
            Ok(registered) => registered,
            Err(err) => {
                warn!(%uid, %err, "registration refused");
                return false;
            }
        };
        if let Err(err) = self.directory.set_node_address(registration.node.as_str(), &address) {
            warn!(node = %registration.node, %err, "can't store node address");
        }

        if envelope.sender_uid == uid {
            self.directory.synchronizing_isolate_presence(uid.as_str());
            self.broadcaster.fire(
                SIGNAL_REGISTER_SYNACK,
                Value::Null,
                &Target::isolate(uid.as_str()),
            );
        } else if registered {
            // Relayed: the isolate doesn't know us yet
            self.broadcaster.fire(
                SIGNAL_REGISTER,
                self.registration_value(false),
                &Target::isolate(uid.as_str()),
            );
        }

        if registration.propagate {
            registration.propagate = false;
            registration.address = Some(address);
            let content = serde_json::to_value(&registration).unwrap_or(Value::Null);
            self.broadcaster.fire(
                SIGNAL_REGISTER,
                content,
                &self.stored_others().excluding(uid.clone()),
            );
        }
        registered
    }

    fn validate(&self, uid: &IsolateUid) {
        if self.directory.validate_isolate_presence(uid.as_str())
            && !self.directory.notify_isolate_presence(uid.as_str())
        {
            debug!(%uid, "isolate lost before its presence was notified");
        }
    }

    fn handle_contact(&self, envelope: &SignalEnvelope) {
        let contact: Contact = match envelope.content_as() {
            Ok(contact) => contact,
            Err(err) => {
                warn!(sender = %envelope.sender_uid, %err, "invalid contact signal");
                return;
            }
        };
        let Some(address) = envelope.sender_address.clone() else {
            warn!(sender = %envelope.sender_uid, "contact signal without sender address");
            return;
        };
        if contact.port == 0 {
            warn!(sender = %envelope.sender_uid, "contact signal without port");
            return;
        }

        let node = envelope.sender_node.clone();
        if let Err(err) = self.directory.set_node_address(node.as_str(), &address) {
            warn!(%node, %err, "can't store node address");
            return;
        }

        let Some(updater) = self.this.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(err) = updater.grab_directory(&address, contact.port, Some(node)).await {
                warn!(%address, port = contact.port, %err, "can't grab contacted directory");
            }
        });
    }
}

impl SignalListener for DirectoryUpdater {
    fn handle_signal(&self, subject: &str, envelope: &SignalEnvelope) -> Option<Value> {
        let _guard = self.lock.lock();
        let sender = &envelope.sender_uid;

        match subject {
            SIGNAL_DUMP => {
                debug!(%sender, "directory dump requested");
                self.handle_register(envelope);
                serde_json::to_value(self.directory.dump()).ok()
            }
            SIGNAL_REGISTER => {
                self.handle_register(envelope);
                None
            }
            SIGNAL_REGISTER_SYNACK => {
                self.validate(sender);
                self.broadcaster.fire(
                    SIGNAL_REGISTER_ACK,
                    Value::Null,
                    &Target::isolate(sender.as_str()),
                );
                None
            }
            SIGNAL_REGISTER_ACK => {
                self.validate(sender);
                None
            }
            SIGNAL_CONTACT => {
                self.handle_contact(envelope);
                None
            }
            SIGNAL_ISOLATE_LOST => {
                match envelope.content.as_str() {
                    Some(lost) if !lost.is_empty() => {
                        if self.directory.unregister_isolate(lost) {
                            info!(uid = lost, reporter = %sender, "isolate lost");
                        }
                    }
                    _ => warn!(%sender, "lost signal without isolate"),
                }
                None
            }
            _ => {
                debug!(subject, "unhandled directory signal");
                None
            }
        }
    }
}
