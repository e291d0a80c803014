//! Base group resolution
//!
//! Groups are computed on every read from the current records; nothing
//! about membership is stored or cached.

use isonet_types::{BaseGroup, HostAccess, IsolateUid, FORKERS_TAG};
use std::collections::HashMap;

use super::{Directory, IsolateRecord};

impl Directory {
    /// Whether a record belongs to the group, seen from the local isolate
    pub(crate) fn is_member(&self, group: BaseGroup, record: &IsolateRecord) -> bool {
        if group != BaseGroup::Stored && !record.is_validated() {
            return false;
        }
        let is_current = record.uid == *self.local_uid();

        match group {
            BaseGroup::All | BaseGroup::Stored => true,
            BaseGroup::Current => is_current,
            BaseGroup::Forkers | BaseGroup::Monitors => {
                group.tag().is_some_and(|tag| record.has_tag(tag))
            }
            BaseGroup::Isolates => !record.has_tag(FORKERS_TAG),
            BaseGroup::Neighbours => !is_current && record.node == *self.local_node(),
            BaseGroup::Others => !is_current,
        }
    }

    /// UIDs of the group members, sorted
    pub fn get_group_members(&self, group: BaseGroup) -> Vec<IsolateUid> {
        let mut members: Vec<IsolateUid> = self
            .isolates
            .iter()
            .filter(|record| self.is_member(group, record))
            .map(|record| record.uid.clone())
            .collect();
        members.sort();
        members
    }

    /// Accesses of the group members
    ///
    /// Members whose node has no known host are left out, as are all
    /// members when the group is empty; this never fails.
    pub fn get_group_accesses(&self, group: BaseGroup) -> HashMap<IsolateUid, HostAccess> {
        self.get_group_members(group)
            .into_iter()
            .filter_map(|uid| {
                let access = self.get_isolate_access(uid.as_str())?;
                Some((uid, access))
            })
            .collect()
    }

    /// Union of the accesses of several groups
    pub fn get_groups_accesses(&self, groups: &[BaseGroup]) -> HashMap<IsolateUid, HostAccess> {
        let mut accesses = HashMap::new();
        for group in groups {
            accesses.extend(self.get_group_accesses(*group));
        }
        accesses
    }
}
