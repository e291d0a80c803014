//! Local signal receiver
//!
//! Dispatches inbound signals to the listeners whose subject pattern
//! matches. Patterns use glob syntax (`/isonet-directory/*`).
//!
//! A listener registered under several matching patterns runs once, at
//! its best (lowest) priority. Listeners run outside the registry lock.

use async_trait::async_trait;
use isonet_types::{DeliveryMode, HostAccess, SignalEnvelope, SubscriptionId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::transport::LocalReceiver;

/// Priority given to listeners registered without one
pub const DEFAULT_PRIORITY: i32 = 100;

/// Handler for signals matching a pattern
pub trait SignalListener: Send + Sync {
    /// Handle a signal; `Some` values are returned to the sender
    fn handle_signal(&self, subject: &str, envelope: &SignalEnvelope) -> Option<Value>;
}

impl<F> SignalListener for F
where
    F: Fn(&str, &SignalEnvelope) -> Option<Value> + Send + Sync,
{
    fn handle_signal(&self, subject: &str, envelope: &SignalEnvelope) -> Option<Value> {
        self(subject, envelope)
    }
}

/// Answer of the receiver, also the HTTP reply body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiverReply {
    pub code: u16,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub results: Vec<Value>,
}

impl ReceiverReply {
    pub fn ok(message: impl Into<String>, results: Vec<Value>) -> Self {
        Self {
            code: 200,
            message: message.into(),
            results,
        }
    }

    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            results: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Results of a successful reply, or the rejection
    pub fn into_results(self) -> Result<Vec<Value>, TransportError> {
        if self.is_success() {
            Ok(self.results)
        } else {
            Err(TransportError::Rejected {
                code: self.code,
                message: self.message,
            })
        }
    }
}

struct Registration {
    id: SubscriptionId,
    pattern: String,
    priority: i32,
    listener: Arc<dyn SignalListener>,
}

/// Listener registry and dispatcher
pub struct SignalReceiver {
    registrations: RwLock<Vec<Registration>>,
    access: RwLock<HostAccess>,
}

impl Default for SignalReceiver {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalReceiver {
    pub fn new() -> Self {
        Self {
            registrations: RwLock::new(Vec::new()),
            access: RwLock::new(HostAccess::local()),
        }
    }

    /// Access the receiver is reachable on
    pub fn access_info(&self) -> HostAccess {
        self.access.read().clone()
    }

    pub fn set_access_info(&self, access: HostAccess) {
        debug!(%access, "receiver access set");
        *self.access.write() = access;
    }

    pub fn register_listener(
        &self,
        pattern: impl Into<String>,
        listener: Arc<dyn SignalListener>,
        priority: i32,
    ) -> SubscriptionId {
        let id = SubscriptionId::new();
        self.registrations.write().push(Registration {
            id,
            pattern: pattern.into(),
            priority,
            listener,
        });
        id
    }

    pub fn unregister_listener(&self, id: SubscriptionId) -> bool {
        let mut registrations = self.registrations.write();
        let before = registrations.len();
        registrations.retain(|registration| registration.id != id);
        registrations.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.registrations.read().len()
    }

    /// Listeners matching the subject, by ascending priority
    fn matching(&self, subject: &str) -> Vec<Arc<dyn SignalListener>> {
        let mut best: HashMap<*const (), (i32, usize, Arc<dyn SignalListener>)> = HashMap::new();
        {
            let registrations = self.registrations.read();
            for (order, registration) in registrations.iter().enumerate() {
                if !glob_match::glob_match(&registration.pattern, subject) {
                    continue;
                }
                let key = Arc::as_ptr(&registration.listener) as *const ();
                let candidate = (registration.priority, order, registration.listener.clone());
                match best.get(&key) {
                    Some((priority, _, _)) if *priority <= registration.priority => {}
                    _ => {
                        best.insert(key, candidate);
                    }
                }
            }
        }

        let mut selected: Vec<(i32, usize, Arc<dyn SignalListener>)> = best.into_values().collect();
        selected.sort_by_key(|(priority, order, _)| (*priority, *order));
        selected.into_iter().map(|(_, _, listener)| listener).collect()
    }

    /// Handle a received signal according to the delivery mode
    pub async fn handle_received(
        &self,
        subject: &str,
        envelope: SignalEnvelope,
        mode: DeliveryMode,
    ) -> ReceiverReply {
        let listeners = self.matching(subject);
        debug!(subject, %mode, listeners = listeners.len(), sender = %envelope.sender_uid, "signal received");

        match mode {
            DeliveryMode::Send => {
                let results = notify_listeners(&listeners, subject, &envelope);
                ReceiverReply::ok("", results)
            }
            DeliveryMode::Forget => {
                spawn_listeners(listeners, subject.to_string(), envelope);
                ReceiverReply::ok("Signal dispatch started", Vec::new())
            }
            DeliveryMode::Ack => {
                if listeners.is_empty() {
                    return ReceiverReply::error(404, "No listener found");
                }
                spawn_listeners(listeners, subject.to_string(), envelope);
                ReceiverReply::ok("At least one listener found", Vec::new())
            }
        }
    }
}

fn notify_listeners(
    listeners: &[Arc<dyn SignalListener>],
    subject: &str,
    envelope: &SignalEnvelope,
) -> Vec<Value> {
    let mut results = Vec::new();
    for listener in listeners {
        match catch_unwind(AssertUnwindSafe(|| listener.handle_signal(subject, envelope))) {
            Ok(Some(result)) => results.push(result),
            Ok(None) => {}
            Err(_) => warn!(subject, "signal listener panicked"),
        }
    }
    results
}

fn spawn_listeners(listeners: Vec<Arc<dyn SignalListener>>, subject: String, envelope: SignalEnvelope) {
    if listeners.is_empty() {
        return;
    }
    tokio::spawn(async move {
        notify_listeners(&listeners, &subject, &envelope);
    });
}

#[async_trait]
impl LocalReceiver for SignalReceiver {
    async fn deliver_local(
        &self,
        subject: &str,
        envelope: &SignalEnvelope,
        mode: DeliveryMode,
    ) -> Option<Vec<Value>> {
        let reply = self.handle_received(subject, envelope.clone(), mode).await;
        if reply.is_success() {
            Some(reply.results)
        } else {
            debug!(subject, code = reply.code, message = %reply.message, "local delivery refused");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use isonet_types::{IsolateUid, NodeUid};
    use parking_lot::Mutex;
    use serde_json::json;

    fn envelope(subject: &str) -> SignalEnvelope {
        SignalEnvelope::new(subject, IsolateUid::new("a"), "alpha", NodeUid::new("n1"), json!(1))
    }

    fn constant(value: Value) -> Arc<dyn SignalListener> {
        Arc::new(move |_subject: &str, _envelope: &SignalEnvelope| Some(value.clone()))
    }

    #[tokio::test]
    async fn test_send_runs_matching_listeners_by_priority() {
        let receiver = SignalReceiver::new();
        receiver.register_listener("/test/*", constant(json!("late")), 200);
        receiver.register_listener("/test/hello", constant(json!("early")), 10);
        receiver.register_listener("/other/*", constant(json!("never")), 0);

        let reply = receiver
            .handle_received("/test/hello", envelope("/test/hello"), DeliveryMode::Send)
            .await;
        assert_eq!(reply.code, 200);
        assert_eq!(reply.results, vec![json!("early"), json!("late")]);
    }

    #[tokio::test]
    async fn test_listener_runs_once_at_best_priority() {
        let receiver = SignalReceiver::new();
        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();
        let listener: Arc<dyn SignalListener> =
            Arc::new(move |_s: &str, _e: &SignalEnvelope| {
                *counter.lock() += 1;
                Some(json!("shared"))
            });

        receiver.register_listener("/a/*", listener.clone(), 50);
        receiver.register_listener("/a/b", listener, 1);
        receiver.register_listener("/a/*", constant(json!("middle")), 20);

        let reply = receiver.handle_received("/a/b", envelope("/a/b"), DeliveryMode::Send).await;
        assert_eq!(reply.results, vec![json!("shared"), json!("middle")]);
        assert_eq!(*calls.lock(), 1);
    }

    #[tokio::test]
    async fn test_send_without_listener_is_empty_success() {
        let receiver = SignalReceiver::new();
        let reply = receiver.handle_received("/none", envelope("/none"), DeliveryMode::Send).await;
        assert!(reply.is_success());
        assert!(reply.results.is_empty());
    }

    #[tokio::test]
    async fn test_ack_rejects_unmatched_subject() {
        let receiver = SignalReceiver::new();
        let reply = receiver.handle_received("/none", envelope("/none"), DeliveryMode::Ack).await;
        assert_eq!(reply.code, 404);
        assert!(matches!(
            reply.into_results(),
            Err(TransportError::Rejected { code: 404, .. })
        ));
    }

    #[tokio::test]
    async fn test_forget_runs_in_background() {
        let receiver = SignalReceiver::new();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = Mutex::new(Some(tx));
        receiver.register_listener(
            "/bg",
            Arc::new(move |_s: &str, e: &SignalEnvelope| {
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(e.content.clone());
                }
                Some(json!("ignored"))
            }),
            DEFAULT_PRIORITY,
        );

        let reply = receiver.handle_received("/bg", envelope("/bg"), DeliveryMode::Forget).await;
        assert!(reply.results.is_empty());
        assert_eq!(rx.await.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn test_panicking_listener_is_skipped() {
        let receiver = SignalReceiver::new();
        receiver.register_listener(
            "/p",
            Arc::new(|_s: &str, _e: &SignalEnvelope| -> Option<Value> { panic!("boom") }),
            1,
        );
        receiver.register_listener("/p", constant(json!(2)), 2);

        let results = receiver.deliver_local("/p", &envelope("/p"), DeliveryMode::Send).await;
        assert_eq!(results, Some(vec![json!(2)]));
    }

    #[tokio::test]
    async fn test_unregister_listener() {
        let receiver = SignalReceiver::new();
        let id = receiver.register_listener("/x", constant(json!(1)), 1);
        assert!(receiver.unregister_listener(id));
        assert!(!receiver.unregister_listener(id));
        assert_eq!(receiver.listener_count(), 0);
    }
}
