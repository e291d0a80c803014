//! Directory snapshots for bulk exchange between two processes

use isonet_types::{IsolateUid, NodeUid};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, warn};

use super::Directory;

/// Registration data of one isolate in a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpAccess {
    pub node: NodeUid,
    pub port: u16,
    /// Missing in older snapshots; defaults to the uid
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub groups: Vec<String>,
}

/// Serializable snapshot of a directory
///
/// The host of the dumping node is never exported: the dumper only knows
/// it as `localhost`. `origin` names that node so the reader can bind it
/// to the address it reached the dumper on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectorySnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<NodeUid>,
    #[serde(default)]
    pub accesses: BTreeMap<IsolateUid, DumpAccess>,
    #[serde(default)]
    pub names: BTreeMap<String, Vec<IsolateUid>>,
    #[serde(default)]
    pub nodes_host: BTreeMap<NodeUid, String>,
}

impl Directory {
    /// Snapshot the directory
    ///
    /// The local isolate is exported with the receiver port; it is left
    /// out while no receiver port is bound.
    pub fn dump(&self) -> DirectorySnapshot {
        let local_port = self.local_port();
        let mut snapshot = DirectorySnapshot {
            origin: Some(self.local_node().clone()),
            ..DirectorySnapshot::default()
        };

        for record in self.records() {
            if record.uid == *self.local_uid() && local_port == 0 {
                continue;
            }
            snapshot
                .names
                .entry(record.name.clone())
                .or_default()
                .push(record.uid.clone());
            snapshot.accesses.insert(
                record.uid.clone(),
                DumpAccess {
                    node: record.node,
                    port: record.port,
                    name: Some(record.name),
                    groups: record.groups.into_iter().collect(),
                },
            );
        }
        for uids in snapshot.names.values_mut() {
            uids.sort();
        }

        let mut hosts = self.node_hosts();
        hosts.remove(self.local_node());
        snapshot.nodes_host = hosts.into_iter().collect();
        snapshot
    }

    /// Merge a snapshot, returning the newly registered isolates
    ///
    /// Hosts of ignored nodes are never written, ignored uids are never
    /// registered. The local node and the local uid are always ignored.
    /// Invalid or conflicting entries are logged and skipped.
    pub fn store_dump(
        &self,
        snapshot: &DirectorySnapshot,
        ignored_nodes: &[NodeUid],
        ignored_uids: &[IsolateUid],
    ) -> Vec<IsolateUid> {
        let mut ignored_nodes: HashSet<&NodeUid> = ignored_nodes.iter().collect();
        ignored_nodes.insert(self.local_node());
        let mut ignored_uids: HashSet<&IsolateUid> = ignored_uids.iter().collect();
        ignored_uids.insert(self.local_uid());

        for (node, host) in &snapshot.nodes_host {
            if ignored_nodes.contains(node) {
                continue;
            }
            if let Err(err) = self.set_node_address(node.as_str(), host) {
                warn!(%node, %err, "skipping dumped node address");
            }
        }

        let mut registered = Vec::new();
        for (uid, access) in &snapshot.accesses {
            if ignored_uids.contains(uid) {
                continue;
            }
            let name = access.name.as_deref().unwrap_or(uid.as_str());
            match self.register_isolate(
                uid.as_str(),
                name,
                access.node.as_str(),
                access.port,
                &access.groups,
            ) {
                Ok(true) => registered.push(uid.clone()),
                Ok(false) => {}
                Err(err) => warn!(%uid, %err, "skipping dumped isolate"),
            }
        }

        debug!(count = registered.len(), "directory dump stored");
        registered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::tests::identity;
    use isonet_types::HostAccess;

    fn source() -> Directory {
        let directory = Directory::new(identity("origin", "n1"));
        directory.set_node_address("nodeN", "192.168.0.10").unwrap();
        directory.register_validated("A", "alpha", "nodeN", 8001, &[]).unwrap();
        directory
            .register_isolate("B", "beta", "nodeN", 8002, &["monitors".to_string()])
            .unwrap();
        directory
    }

    #[test]
    fn test_dump_round_trip() {
        let original = source();
        let snapshot = original.dump();

        // Local isolate has no receiver port yet
        assert!(!snapshot.accesses.contains_key(&IsolateUid::new("origin")));

        let fresh = Directory::new(identity("fresh", "n2"));
        let mut registered = fresh.store_dump(&snapshot, &[], &[]);
        registered.sort();
        assert_eq!(registered, vec![IsolateUid::new("A"), IsolateUid::new("B")]);

        for uid in ["A", "B"] {
            assert_eq!(fresh.get_isolate_access(uid), original.get_isolate_access(uid));
        }
        assert_eq!(fresh.get_isolate_name("B").as_deref(), Some("beta"));
        assert!(fresh.get_isolate_groups("B").unwrap().contains("monitors"));
    }

    #[test]
    fn test_store_dump_twice_registers_nothing_new() {
        let snapshot = source().dump();
        let fresh = Directory::new(identity("fresh", "n2"));
        assert_eq!(fresh.store_dump(&snapshot, &[], &[]).len(), 2);
        assert!(fresh.store_dump(&snapshot, &[], &[]).is_empty());
    }

    #[test]
    fn test_store_dump_ignore_lists() {
        let snapshot = source().dump();
        let fresh = Directory::new(identity("fresh", "n2"));
        fresh.set_node_address("nodeN", "10.9.9.9").unwrap();

        let registered = fresh.store_dump(
            &snapshot,
            &[NodeUid::new("nodeN")],
            &[IsolateUid::new("A")],
        );
        assert_eq!(registered, vec![IsolateUid::new("B")]);
        assert!(!fresh.is_registered("A"));
        assert_eq!(fresh.get_node_address("nodeN").as_deref(), Some("10.9.9.9"));
        assert_eq!(
            fresh.get_isolate_access("B"),
            Some(HostAccess::new("10.9.9.9", 8002))
        );
    }

    #[test]
    fn test_store_dump_skips_local_identity() {
        let original = source();
        original.set_local_port(7000);
        let snapshot = original.dump();
        assert_eq!(snapshot.accesses[&IsolateUid::new("origin")].port, 7000);

        // A process fed its own snapshot learns nothing
        assert!(original.store_dump(&snapshot, &[], &[]).is_empty());
        assert_eq!(original.get_node_address("n1").as_deref(), Some("localhost"));
    }

    #[test]
    fn test_snapshot_json_shape() {
        let snapshot = source().dump();
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["accesses"]["A"]["node"], "nodeN");
        assert_eq!(json["accesses"]["A"]["port"], 8001);
        assert_eq!(json["names"]["beta"][0], "B");
        assert_eq!(json["nodes_host"]["nodeN"], "192.168.0.10");
        assert_eq!(json["origin"], "n1");
        assert!(json["nodes_host"].get("n1").is_none());

        let parsed: DirectorySnapshot = serde_json::from_value(serde_json::json!({
            "accesses": {"X": {"node": "n5", "port": 9}},
            "nodes_host": {"n5": "h5"}
        }))
        .unwrap();
        assert_eq!(parsed.accesses[&IsolateUid::new("X")].name, None);
        assert_eq!(parsed.origin, None);
    }
}
