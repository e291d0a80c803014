//! Signal addressing

use isonet_types::{BaseGroup, HostAccess, IsolateUid};
use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::directory::Directory;

/// Who a signal is addressed to
///
/// Isolates, given by uid or by name, and base groups can be combined;
/// the excluded uids are removed last.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Target {
    isolates: Vec<String>,
    groups: Vec<BaseGroup>,
    excluded: HashSet<IsolateUid>,
}

impl Target {
    /// One isolate; a name stands for every isolate bearing it
    pub fn isolate(uid_or_name: impl Into<String>) -> Self {
        Self::default().and_isolate(uid_or_name)
    }

    pub fn isolates<I, S>(isolates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            isolates: isolates.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn group(group: BaseGroup) -> Self {
        Self::default().and_group(group)
    }

    pub fn groups(groups: &[BaseGroup]) -> Self {
        Self {
            groups: groups.to_vec(),
            ..Self::default()
        }
    }

    pub fn and_isolate(mut self, uid_or_name: impl Into<String>) -> Self {
        self.isolates.push(uid_or_name.into());
        self
    }

    pub fn and_group(mut self, group: BaseGroup) -> Self {
        self.groups.push(group);
        self
    }

    pub fn excluding(mut self, uid: impl Into<IsolateUid>) -> Self {
        self.excluded.insert(uid.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.isolates.is_empty() && self.groups.is_empty()
    }

    /// Resolve against the directory
    ///
    /// Unknown isolates and unreachable members are skipped. Accesses are
    /// keyed by uid, so a member of several groups is targeted once.
    pub fn resolve(&self, directory: &Directory) -> HashMap<IsolateUid, HostAccess> {
        let mut accesses = directory.get_groups_accesses(&self.groups);

        for isolate in &self.isolates {
            if let Some(access) = directory.get_isolate_access(isolate) {
                accesses.insert(IsolateUid::new(isolate.as_str()), access);
                continue;
            }

            let named = directory.get_name_uids(isolate);
            if named.is_empty() {
                debug!(isolate = %isolate, "unknown signal target");
            }
            for uid in named {
                if let Some(access) = directory.get_isolate_access(uid.as_str()) {
                    accesses.insert(uid, access);
                }
            }
        }

        accesses.retain(|uid, _| !self.excluded.contains(uid));
        accesses
    }
}

impl From<BaseGroup> for Target {
    fn from(group: BaseGroup) -> Self {
        Target::group(group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::tests::identity;

    fn directory() -> Directory {
        let directory = Directory::new(identity("self", "n1"));
        directory.set_node_address("n2", "10.0.0.2").unwrap();
        directory.register_validated("a", "worker", "n2", 9001, &[]).unwrap();
        directory.register_validated("b", "worker", "n2", 9002, &[]).unwrap();
        directory.register_isolate("c", "pending", "n2", 9003, &[]).unwrap();
        directory
    }

    #[test]
    fn test_name_resolves_to_every_bearer() {
        let accesses = Target::isolate("worker").resolve(&directory());
        assert_eq!(accesses.len(), 2);
        assert_eq!(accesses[&IsolateUid::new("b")], HostAccess::new("10.0.0.2", 9002));
    }

    #[test]
    fn test_explicit_isolate_ignores_presence_state() {
        let accesses = Target::isolate("c").resolve(&directory());
        assert_eq!(accesses.len(), 1);
    }

    #[test]
    fn test_groups_and_exclusion() {
        let target = Target::group(BaseGroup::All).and_isolate("c").excluding("a");
        let accesses = target.resolve(&directory());

        let mut uids: Vec<_> = accesses.keys().map(|uid| uid.as_str()).collect();
        uids.sort();
        assert_eq!(uids, vec!["b", "c", "self"]);
        assert!(accesses[&IsolateUid::new("self")].is_local());
    }

    #[test]
    fn test_unknown_target_resolves_to_nothing() {
        assert!(Target::isolate("ghost").resolve(&directory()).is_empty());
        assert!(Target::default().is_empty());
    }
}
