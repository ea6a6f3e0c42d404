//! Snapshots produced by tree watchers and the messages they send to the
//! coordinator

use crate::error::DiscoveryError;
use crate::member::ServersetMember;
use serverset_core::TargetGroup;
use std::collections::{BTreeMap, BTreeSet};

/// The decoded state of one source's subtree at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubtreeSnapshot {
    /// Configured root path
    pub root: String,

    /// Whether the root currently exists in the store
    pub root_exists: bool,

    /// Live, successfully decoded members keyed by node path
    pub members: BTreeMap<String, ServersetMember>,

    /// Non-member paths currently known to exist, the root included
    pub containers: BTreeSet<String>,
}

impl SubtreeSnapshot {
    /// Snapshot of a root that does not exist.
    pub fn absent(root: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            root_exists: false,
            members: BTreeMap::new(),
            containers: BTreeSet::new(),
        }
    }

    /// Builds the full target group for this source, ordered by member path.
    pub fn target_group(&self) -> TargetGroup {
        TargetGroup::new(
            self.root.clone(),
            self.members
                .iter()
                .map(|(path, member)| member.labels(path))
                .collect(),
        )
    }

    /// Member paths present here but not in `previous`, and the reverse.
    pub fn member_changes(&self, previous: Option<&SubtreeSnapshot>) -> (usize, usize) {
        match previous {
            Some(previous) => (
                self.members
                    .keys()
                    .filter(|path| !previous.members.contains_key(*path))
                    .count(),
                previous
                    .members
                    .keys()
                    .filter(|path| !self.members.contains_key(*path))
                    .count(),
            ),
            None => (self.members.len(), 0),
        }
    }
}

/// Message from a tree watcher to the coordinator.
#[derive(Debug)]
pub enum SourceUpdate {
    /// The subtree changed; carries its complete new state
    Snapshot(SubtreeSnapshot),

    /// The watcher gave up on the store
    Fatal { root: String, error: DiscoveryError },
}
