//! Presence and topology registry
//!
//! The directory is the single owner of isolate and node records. It keeps,
//! for every known isolate, its node, its port, its group tags and its
//! presence state, plus the host address of every known node.
//!
//! Operations on different uids don't block each other: isolate records
//! live in a sharded map and every state transition on one uid runs under
//! that record's shard lock. Presence listeners are always called after the
//! lock is released.
//!
//! ```text
//! register ──▶ REGISTERED ──synchronizing──▶ SYNCHRONIZING ──validate──▶ VALIDATED
//!                   │                              │                        │
//!                   └──────────── unregister (record removed) ◀─────────────┘
//! ```

mod dump;
mod groups;
mod presence;

pub use dump::{DirectorySnapshot, DumpAccess};
pub use presence::{CallbackListener, PresenceEvent, PresenceListener, PresenceListeners};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use isonet_types::{HostAccess, IsolateUid, NodeUid, PresenceState, SubscriptionId};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::LocalIdentity;
use crate::error::{DirectoryError, DirectoryResult};

/// One registered isolate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolateRecord {
    pub uid: IsolateUid,
    pub name: String,
    pub node: NodeUid,
    pub port: u16,
    pub groups: BTreeSet<String>,
    pub state: PresenceState,
}

impl IsolateRecord {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.groups.contains(tag)
    }

    pub fn is_validated(&self) -> bool {
        self.state == PresenceState::Validated
    }
}

/// The isolate directory
///
/// Created once per process and shared by reference with the broadcaster
/// and the discovery agent.
pub struct Directory {
    local: LocalIdentity,
    /// Port of the local receiver, 0 until bound
    local_port: AtomicU16,
    isolates: DashMap<IsolateUid, IsolateRecord>,
    nodes_host: RwLock<HashMap<NodeUid, String>>,
    listeners: PresenceListeners,
}

impl Directory {
    /// Create a directory holding the local isolate, already validated
    pub fn new(local: LocalIdentity) -> Self {
        let record = IsolateRecord {
            uid: local.uid.clone(),
            name: local.name.clone(),
            node: local.node.clone(),
            port: 0,
            groups: normalize_groups(&local.groups),
            state: PresenceState::Validated,
        };

        let isolates = DashMap::new();
        isolates.insert(local.uid.clone(), record);

        let mut nodes_host = HashMap::new();
        nodes_host.insert(local.node.clone(), String::from("localhost"));

        Self {
            local,
            local_port: AtomicU16::new(0),
            isolates,
            nodes_host: RwLock::new(nodes_host),
            listeners: PresenceListeners::new(),
        }
    }

    pub fn local_uid(&self) -> &IsolateUid {
        &self.local.uid
    }

    pub fn local_name(&self) -> &str {
        &self.local.name
    }

    pub fn local_node(&self) -> &NodeUid {
        &self.local.node
    }

    pub fn local_identity(&self) -> &LocalIdentity {
        &self.local
    }

    /// Port the local receiver is reachable on, 0 until bound
    pub fn local_port(&self) -> u16 {
        self.local_port.load(Ordering::Acquire)
    }

    pub fn set_local_port(&self, port: u16) {
        self.local_port.store(port, Ordering::Release);
        if let Some(mut record) = self.isolates.get_mut(&self.local.uid) {
            record.port = port;
        }
    }

    /// Register an isolate, waiting for validation
    ///
    /// Returns false if the exact same access was already known.
    pub fn register_isolate(
        &self,
        uid: &str,
        name: &str,
        node: &str,
        port: u16,
        groups: &[String],
    ) -> DirectoryResult<bool> {
        self.register(uid, name, node, port, groups, false)
    }

    /// Register an isolate that doesn't need the validation handshake
    pub fn register_validated(
        &self,
        uid: &str,
        name: &str,
        node: &str,
        port: u16,
        groups: &[String],
    ) -> DirectoryResult<bool> {
        self.register(uid, name, node, port, groups, true)
    }

    fn register(
        &self,
        uid: &str,
        name: &str,
        node: &str,
        port: u16,
        groups: &[String],
        validated: bool,
    ) -> DirectoryResult<bool> {
        check_registration(uid, name, node, port)?;
        let uid = IsolateUid::new(uid);
        let node = NodeUid::new(node);

        if uid == self.local.uid {
            if node == self.local.node {
                return Ok(false);
            }
            return Err(DirectoryError::Conflict {
                uid,
                existing: self.local.node.clone(),
                requested: node,
            });
        }

        let mut event = None;
        let changed = match self.isolates.entry(uid.clone()) {
            Entry::Occupied(mut occupied) => {
                let record = occupied.get_mut();
                if record.node != node {
                    return Err(DirectoryError::Conflict {
                        uid,
                        existing: record.node.clone(),
                        requested: node,
                    });
                }

                let mut changed = false;
                if record.port != port {
                    debug!(%uid, old = record.port, new = port, "isolate port updated");
                    record.port = port;
                    changed = true;
                }
                let groups = normalize_groups(groups);
                if record.name != name || record.groups != groups {
                    debug!(%uid, name, ?groups, "isolate description updated");
                    record.name = name.to_string();
                    record.groups = groups;
                    changed = true;
                }
                if validated && !record.is_validated() {
                    record.state = PresenceState::Validated;
                    event = Some(presence_validated(record));
                    changed = true;
                }
                changed
            }
            Entry::Vacant(vacant) => {
                let record = IsolateRecord {
                    uid: uid.clone(),
                    name: name.to_string(),
                    node: node.clone(),
                    port,
                    groups: normalize_groups(groups),
                    state: if validated {
                        PresenceState::Validated
                    } else {
                        PresenceState::Registered
                    },
                };
                if validated {
                    event = Some(presence_validated(&record));
                }
                debug!(%uid, %node, port, validated, "isolate registered");
                vacant.insert(record);
                true
            }
        };

        if let Some(event) = event {
            self.listeners.notify(&event);
        }
        Ok(changed)
    }

    /// Remove an isolate from the directory
    ///
    /// Legal from any state. Returns true if a record was removed.
    pub fn unregister_isolate(&self, uid: &str) -> bool {
        if uid.is_empty() || uid == self.local.uid.as_str() {
            return false;
        }

        let Some((uid, record)) = self.isolates.remove(uid) else {
            return false;
        };

        info!(%uid, node = %record.node, "isolate unregistered");
        if record.is_validated() {
            self.listeners.notify(&PresenceEvent::Lost {
                uid,
                node: record.node,
            });
        }
        true
    }

    /// Mark that a handshake with the isolate is in progress
    ///
    /// Legal only from REGISTERED; a no-op returning true when already
    /// synchronizing, false for unknown or validated isolates.
    pub fn synchronizing_isolate_presence(&self, uid: &str) -> bool {
        let Some(mut record) = self.isolates.get_mut(uid) else {
            return false;
        };
        match record.state {
            PresenceState::Registered => {
                record.state = PresenceState::Synchronizing;
                true
            }
            PresenceState::Synchronizing => true,
            PresenceState::Validated => false,
        }
    }

    /// Mark the isolate as validated
    ///
    /// Accepted from SYNCHRONIZING and, for out-of-order handshakes, from
    /// REGISTERED. Must be followed by `notify_isolate_presence`.
    pub fn validate_isolate_presence(&self, uid: &str) -> bool {
        let Some(mut record) = self.isolates.get_mut(uid) else {
            return false;
        };
        match record.state {
            PresenceState::Registered | PresenceState::Synchronizing => {
                record.state = PresenceState::Validated;
                info!(uid = %record.uid, "isolate validated");
                true
            }
            PresenceState::Validated => false,
        }
    }

    /// Tell presence listeners that the isolate is validated
    ///
    /// Returns false if the isolate is no longer in the validated state,
    /// e.g. it was unregistered since the validation.
    pub fn notify_isolate_presence(&self, uid: &str) -> bool {
        let event = match self.isolates.get(uid) {
            Some(record) if record.is_validated() => presence_validated(&record),
            _ => return false,
        };
        self.listeners.notify(&event);
        true
    }

    /// Subscribe to presence events
    ///
    /// The listener is first told about every isolate validated so far.
    pub fn subscribe(&self, listener: Arc<dyn PresenceListener>) -> SubscriptionId {
        let id = self.listeners.subscribe(listener.clone());
        let current: Vec<PresenceEvent> = self
            .isolates
            .iter()
            .filter(|record| record.is_validated() && record.uid != self.local.uid)
            .map(|record| presence_validated(&record))
            .collect();
        for event in &current {
            presence::notify_one(listener.as_ref(), event);
        }
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.listeners.unsubscribe(id)
    }

    /// How to reach the isolate, if known
    ///
    /// The local isolate is reached through the local sentinel; a remote
    /// isolate whose node has no known host is unreachable.
    pub fn get_isolate_access(&self, uid: &str) -> Option<HostAccess> {
        if uid == self.local.uid.as_str() {
            return Some(HostAccess::local());
        }
        let (node, port) = {
            let record = self.isolates.get(uid)?;
            (record.node.clone(), record.port)
        };
        let host = self.nodes_host.read().get(&node)?.clone();
        Some(HostAccess::new(host, port))
    }

    pub fn get_isolate_record(&self, uid: &str) -> Option<IsolateRecord> {
        self.isolates.get(uid).map(|record| record.clone())
    }

    pub fn get_isolate_name(&self, uid: &str) -> Option<String> {
        self.isolates.get(uid).map(|record| record.name.clone())
    }

    pub fn get_isolate_node(&self, uid: &str) -> Option<NodeUid> {
        self.isolates.get(uid).map(|record| record.node.clone())
    }

    pub fn get_isolate_groups(&self, uid: &str) -> Option<BTreeSet<String>> {
        self.isolates.get(uid).map(|record| record.groups.clone())
    }

    pub fn get_presence_state(&self, uid: &str) -> Option<PresenceState> {
        self.isolates.get(uid).map(|record| record.state)
    }

    pub fn is_registered(&self, uid: &str) -> bool {
        self.isolates.contains_key(uid)
    }

    /// UIDs of the isolates bearing the given name
    pub fn get_name_uids(&self, name: &str) -> Vec<IsolateUid> {
        let mut uids: Vec<IsolateUid> = self
            .isolates
            .iter()
            .filter(|record| record.name == name)
            .map(|record| record.uid.clone())
            .collect();
        uids.sort();
        uids
    }

    pub fn get_isolates_on_node(&self, node: &str) -> Vec<IsolateUid> {
        let mut uids: Vec<IsolateUid> = self
            .isolates
            .iter()
            .filter(|record| record.node.as_str() == node)
            .map(|record| record.uid.clone())
            .collect();
        uids.sort();
        uids
    }

    /// Every node hosting an isolate or having a known host address
    pub fn get_all_nodes(&self) -> Vec<NodeUid> {
        let mut nodes: BTreeSet<NodeUid> =
            self.isolates.iter().map(|record| record.node.clone()).collect();
        nodes.extend(self.nodes_host.read().keys().cloned());
        nodes.into_iter().collect()
    }

    /// Known isolates whose name starts with the prefix
    ///
    /// Returns `None` when nothing matches, so callers can tell an empty
    /// directory from an empty answer.
    pub fn get_all_isolates(
        &self,
        prefix: Option<&str>,
        include_current: bool,
        only_validated: bool,
    ) -> Option<Vec<IsolateUid>> {
        let mut matching: Vec<IsolateUid> = self
            .isolates
            .iter()
            .filter(|record| include_current || record.uid != self.local.uid)
            .filter(|record| !only_validated || record.is_validated())
            .filter(|record| match prefix {
                Some(prefix) if !prefix.is_empty() => record.name.starts_with(prefix),
                _ => true,
            })
            .map(|record| record.uid.clone())
            .collect();

        if matching.is_empty() {
            return None;
        }
        matching.sort();
        Some(matching)
    }

    /// Set the host address of a node, returning the previous one
    pub fn set_node_address(&self, node: &str, host: &str) -> DirectoryResult<Option<String>> {
        if node.is_empty() {
            return Err(DirectoryError::InvalidArgument("empty node name".to_string()));
        }
        if host.is_empty() {
            return Err(DirectoryError::InvalidArgument(format!(
                "empty address for node {node}"
            )));
        }

        let previous = self
            .nodes_host
            .write()
            .insert(NodeUid::new(node), host.to_string());
        if previous.as_deref() != Some(host) {
            debug!(node, host, ?previous, "node address set");
        }
        Ok(previous)
    }

    pub fn get_node_address(&self, node: &str) -> Option<String> {
        self.nodes_host.read().get(node).cloned()
    }

    /// Number of records, the local isolate included
    pub fn len(&self) -> usize {
        self.isolates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.isolates.is_empty()
    }

    pub(crate) fn records(&self) -> Vec<IsolateRecord> {
        self.isolates.iter().map(|record| record.clone()).collect()
    }

    pub(crate) fn node_hosts(&self) -> HashMap<NodeUid, String> {
        self.nodes_host.read().clone()
    }
}

fn presence_validated(record: &IsolateRecord) -> PresenceEvent {
    PresenceEvent::Validated {
        uid: record.uid.clone(),
        node: record.node.clone(),
    }
}

fn check_registration(uid: &str, name: &str, node: &str, port: u16) -> DirectoryResult<()> {
    if uid.trim().is_empty() {
        return Err(DirectoryError::InvalidArgument(format!(
            "empty uid for isolate '{name}'"
        )));
    }
    if name.trim().is_empty() {
        return Err(DirectoryError::InvalidArgument(format!(
            "empty name for isolate {uid}"
        )));
    }
    if node.trim().is_empty() {
        return Err(DirectoryError::InvalidArgument(format!(
            "empty node for isolate {uid} ({name})"
        )));
    }
    if port == 0 {
        return Err(DirectoryError::InvalidArgument(format!(
            "invalid port 0 for isolate {uid} ({name})"
        )));
    }
    Ok(())
}

fn normalize_groups(groups: &[String]) -> BTreeSet<String> {
    groups
        .iter()
        .map(|group| group.trim().to_ascii_lowercase())
        .filter(|group| !group.is_empty())
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use isonet_types::BaseGroup;
    use parking_lot::Mutex;

    pub(crate) fn identity(uid: &str, node: &str) -> LocalIdentity {
        LocalIdentity {
            uid: IsolateUid::new(uid),
            name: format!("{uid}-name"),
            node: NodeUid::new(node),
            groups: Vec::new(),
        }
    }

    fn recorder(directory: &Directory) -> Arc<Mutex<Vec<PresenceEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        directory.subscribe(Arc::new(CallbackListener::new(move |e: &PresenceEvent| {
            sink.lock().push(e.clone());
        })));
        events
    }

    #[test]
    fn test_register_then_noop() {
        let directory = Directory::new(identity("self", "n1"));
        assert!(directory.register_isolate("a", "alpha", "n2", 9000, &[]).unwrap());
        assert!(!directory.register_isolate("a", "alpha", "n2", 9000, &[]).unwrap());
        assert_eq!(directory.get_presence_state("a"), Some(PresenceState::Registered));
    }

    #[test]
    fn test_register_rejects_malformed_arguments() {
        let directory = Directory::new(identity("self", "n1"));
        for (uid, name, node, port) in [
            ("", "alpha", "n2", 9000),
            ("a", " ", "n2", 9000),
            ("a", "alpha", "", 9000),
            ("a", "alpha", "n2", 0),
        ] {
            let err = directory.register_isolate(uid, name, node, port, &[]).unwrap_err();
            assert!(matches!(err, DirectoryError::InvalidArgument(_)));
            assert!(err.is_invalid_argument());
        }
        assert_eq!(directory.len(), 1);
    }

    #[test]
    fn test_register_on_other_node_conflicts() {
        let directory = Directory::new(identity("self", "n1"));
        directory.register_isolate("a", "alpha", "n2", 9000, &[]).unwrap();

        let err = directory.register_isolate("a", "alpha", "n3", 9000, &[]).unwrap_err();
        assert!(matches!(err, DirectoryError::Conflict { .. }));
        assert!(err.is_invalid_argument());
        assert_eq!(directory.get_isolate_node("a"), Some(NodeUid::new("n2")));

        let err = directory.register_isolate("self", "x", "n9", 9000, &[]).unwrap_err();
        assert!(matches!(err, DirectoryError::Conflict { .. }));
    }

    #[test]
    fn test_port_update_keeps_state() {
        let directory = Directory::new(identity("self", "n1"));
        directory.register_validated("a", "alpha", "n2", 9000, &[]).unwrap();
        assert!(directory.register_isolate("a", "alpha", "n2", 9001, &[]).unwrap());
        assert_eq!(directory.get_presence_state("a"), Some(PresenceState::Validated));
        assert_eq!(directory.get_isolate_record("a").unwrap().port, 9001);
    }

    #[test]
    fn test_reregistration_refreshes_tags() {
        let directory = Directory::new(identity("self", "n1"));
        directory.register_validated("a", "alpha", "n2", 9000, &[]).unwrap();
        assert!(directory.get_group_members(BaseGroup::Forkers).is_empty());

        let tags = vec!["forkers".to_string()];
        assert!(directory.register_isolate("a", "alpha2", "n2", 9000, &tags).unwrap());
        assert!(!directory.register_isolate("a", "alpha2", "n2", 9000, &tags).unwrap());

        assert_eq!(directory.get_isolate_name("a").as_deref(), Some("alpha2"));
        assert_eq!(directory.get_presence_state("a"), Some(PresenceState::Validated));
        assert_eq!(
            directory.get_group_members(BaseGroup::Forkers),
            vec![IsolateUid::new("a")]
        );
    }

    #[test]
    fn test_full_state_machine() {
        let directory = Directory::new(identity("self", "n1"));
        let events = recorder(&directory);

        directory.register_isolate("a", "alpha", "n2", 9000, &[]).unwrap();
        assert!(directory.synchronizing_isolate_presence("a"));
        assert!(directory.synchronizing_isolate_presence("a"));
        assert_eq!(directory.get_presence_state("a"), Some(PresenceState::Synchronizing));

        assert!(directory.validate_isolate_presence("a"));
        assert!(!directory.validate_isolate_presence("a"));
        assert!(!directory.synchronizing_isolate_presence("a"));
        assert!(directory.notify_isolate_presence("a"));

        assert!(directory.unregister_isolate("a"));
        assert!(!directory.unregister_isolate("a"));

        let events = events.lock();
        assert_eq!(events.len(), 2);
        assert!(events[0].is_validated());
        assert!(!events[1].is_validated());
    }

    #[test]
    fn test_validate_tolerates_skipped_synchronizing() {
        let directory = Directory::new(identity("self", "n1"));
        directory.register_isolate("a", "alpha", "n2", 9000, &[]).unwrap();
        assert!(directory.validate_isolate_presence("a"));
        assert_eq!(directory.get_presence_state("a"), Some(PresenceState::Validated));
    }

    #[test]
    fn test_notify_after_unregister_fails() {
        let directory = Directory::new(identity("self", "n1"));
        let events = recorder(&directory);

        directory.register_isolate("a", "alpha", "n2", 9000, &[]).unwrap();
        assert!(directory.validate_isolate_presence("a"));
        assert!(directory.unregister_isolate("a"));
        assert!(!directory.notify_isolate_presence("a"));
        assert!(!directory.validate_isolate_presence("a"));
        assert!(!directory.is_registered("a"));

        // Only the loss of a validated isolate is reported
        assert_eq!(events.lock().len(), 1);
    }

    #[test]
    fn test_unvalidated_loss_is_silent() {
        let directory = Directory::new(identity("self", "n1"));
        let events = recorder(&directory);
        directory.register_isolate("a", "alpha", "n2", 9000, &[]).unwrap();
        assert!(directory.unregister_isolate("a"));
        assert!(events.lock().is_empty());
    }

    #[test]
    fn test_access_needs_node_host() {
        let directory = Directory::new(identity("self", "n1"));
        directory.register_isolate("a", "alpha", "n2", 9000, &[]).unwrap();
        assert_eq!(directory.get_isolate_access("a"), None);

        assert_eq!(directory.set_node_address("n2", "10.0.0.2").unwrap(), None);
        assert_eq!(
            directory.get_isolate_access("a"),
            Some(HostAccess::new("10.0.0.2", 9000))
        );
        assert_eq!(directory.get_isolate_access("self"), Some(HostAccess::local()));
        assert_eq!(directory.get_isolate_access("ghost"), None);
    }

    #[test]
    fn test_node_address_last_write_wins() {
        let directory = Directory::new(identity("self", "n1"));
        directory.set_node_address("n2", "10.0.0.2").unwrap();
        let previous = directory.set_node_address("n2", "10.0.0.3").unwrap();
        assert_eq!(previous.as_deref(), Some("10.0.0.2"));
        assert_eq!(directory.get_node_address("n2").as_deref(), Some("10.0.0.3"));
        assert!(directory.set_node_address("n2", "").is_err());
        assert_eq!(directory.get_node_address("n2").as_deref(), Some("10.0.0.3"));
    }

    #[test]
    fn test_get_all_isolates_prefix_and_absence() {
        let directory = Directory::new(identity("self", "n1"));
        assert_eq!(directory.get_all_isolates(None, false, false), None);

        directory.register_isolate("a", "worker-1", "n2", 9000, &[]).unwrap();
        directory.register_validated("b", "worker-2", "n2", 9001, &[]).unwrap();
        directory.register_validated("c", "monitor", "n2", 9002, &[]).unwrap();

        let workers = directory.get_all_isolates(Some("worker"), false, false).unwrap();
        assert_eq!(workers, vec![IsolateUid::new("a"), IsolateUid::new("b")]);

        let validated = directory.get_all_isolates(Some("worker"), false, true).unwrap();
        assert_eq!(validated, vec![IsolateUid::new("b")]);

        assert_eq!(directory.get_all_isolates(Some("nobody"), true, false), None);
        assert_eq!(directory.get_all_isolates(None, true, false).unwrap().len(), 4);
    }

    #[test]
    fn test_subscribe_replays_validated_isolates() {
        let directory = Directory::new(identity("self", "n1"));
        directory.register_validated("a", "alpha", "n2", 9000, &[]).unwrap();
        directory.register_isolate("b", "beta", "n2", 9001, &[]).unwrap();

        let events = recorder(&directory);
        let events = events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].uid().as_str(), "a");
    }

    #[test]
    fn test_name_and_node_lookups() {
        let directory = Directory::new(identity("self", "n1"));
        directory.register_isolate("a", "worker", "n2", 9000, &[]).unwrap();
        directory.register_isolate("b", "worker", "n3", 9000, &[]).unwrap();

        assert_eq!(
            directory.get_name_uids("worker"),
            vec![IsolateUid::new("a"), IsolateUid::new("b")]
        );
        assert_eq!(directory.get_isolates_on_node("n3"), vec![IsolateUid::new("b")]);
        assert_eq!(
            directory.get_all_nodes(),
            vec![NodeUid::new("n1"), NodeUid::new("n2"), NodeUid::new("n3")]
        );
    }

    #[test]
    fn test_concurrent_unregister_and_validate() {
        use std::thread;

        for round in 0..50 {
            let directory = Arc::new(Directory::new(identity("self", "n1")));
            let uid = format!("iso-{round}");
            directory.register_isolate(&uid, "racer", "n2", 9000, &[]).unwrap();

            let validator = {
                let directory = directory.clone();
                let uid = uid.clone();
                thread::spawn(move || {
                    if directory.validate_isolate_presence(&uid) {
                        directory.notify_isolate_presence(&uid);
                    }
                })
            };
            let remover = {
                let directory = directory.clone();
                let uid = uid.clone();
                thread::spawn(move || directory.unregister_isolate(&uid))
            };

            validator.join().unwrap();
            assert!(remover.join().unwrap());
            assert!(!directory.is_registered(&uid));
            assert!(!directory.notify_isolate_presence(&uid));
        }
    }
}
