//! Presence notification for directory changes
//!
//! Listeners are told when an isolate becomes validated and when a
//! validated isolate leaves the directory.

use isonet_types::{IsolateUid, NodeUid, SubscriptionId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::warn;

/// Event emitted when the presence of an isolate changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    /// The isolate completed its handshake and can be addressed by groups
    Validated {
        uid: IsolateUid,
        node: NodeUid,
    },
    /// The isolate was unregistered
    Lost {
        uid: IsolateUid,
        node: NodeUid,
    },
}

impl PresenceEvent {
    pub fn uid(&self) -> &IsolateUid {
        match self {
            PresenceEvent::Validated { uid, .. } => uid,
            PresenceEvent::Lost { uid, .. } => uid,
        }
    }

    pub fn node(&self) -> &NodeUid {
        match self {
            PresenceEvent::Validated { node, .. } => node,
            PresenceEvent::Lost { node, .. } => node,
        }
    }

    pub fn is_validated(&self) -> bool {
        matches!(self, PresenceEvent::Validated { .. })
    }
}

/// Trait for handling presence events
///
/// Called outside of any directory lock, so implementations may query
/// the directory.
pub trait PresenceListener: Send + Sync {
    fn on_presence(&self, event: &PresenceEvent);
}

/// A presence listener that calls a closure
pub struct CallbackListener<F>
where
    F: Fn(&PresenceEvent) + Send + Sync,
{
    callback: F,
}

impl<F> CallbackListener<F>
where
    F: Fn(&PresenceEvent) + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F> PresenceListener for CallbackListener<F>
where
    F: Fn(&PresenceEvent) + Send + Sync,
{
    fn on_presence(&self, event: &PresenceEvent) {
        (self.callback)(event);
    }
}

/// Observer list owned by the directory
#[derive(Default)]
pub struct PresenceListeners {
    listeners: RwLock<HashMap<SubscriptionId, Arc<dyn PresenceListener>>>,
}

impl PresenceListeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: Arc<dyn PresenceListener>) -> SubscriptionId {
        let id = SubscriptionId::new();
        self.listeners.write().insert(id, listener);
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.listeners.write().remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Notify every listener; a panicking listener doesn't stop the others
    pub fn notify(&self, event: &PresenceEvent) {
        let listeners: Vec<Arc<dyn PresenceListener>> =
            self.listeners.read().values().cloned().collect();

        for listener in listeners {
            notify_one(listener.as_ref(), event);
        }
    }
}

pub(crate) fn notify_one(listener: &dyn PresenceListener, event: &PresenceEvent) {
    if catch_unwind(AssertUnwindSafe(|| listener.on_presence(event))).is_err() {
        warn!(uid = %event.uid(), "presence listener panicked");
    }
}
