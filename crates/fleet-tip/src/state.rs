//! Persisted state of a provisioning step.
//!
//! The step needs `CountPerGroup` rows. A row (slot) holds at most one
//! member per experiment group, so group A's Nth session is always paired
//! with group B's Nth session. The affinity spans every row: the step is
//! pinned to one partition while it holds members.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use fleet_affinity::{Anchor, LocalityKey};
use fleet_core::NodeAffinity;
use fleet_state::EntityKey;

/// Progress of one member's session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberStatus {
    /// Create request accepted; waiting for the change to finish.
    Requested,
    /// Session confirmed and recorded in the provisioned set.
    Committed,
}

/// One group's node within a row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub node_id: String,
    pub cluster_name: Option<String>,
    pub tip_session_id: String,
    pub change_id: String,
    pub status: MemberStatus,
}

impl Member {
    pub fn is_committed(&self) -> bool {
        self.status == MemberStatus::Committed
    }

    /// Provisioned-set keys of the node/session pair.
    pub fn entity_keys(&self) -> [EntityKey; 2] {
        [
            EntityKey::node(&self.node_id),
            EntityKey::tip_session(&self.tip_session_id),
        ]
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    /// Group name → member.
    #[serde(default)]
    pub members: BTreeMap<String, Member>,
}

impl Slot {
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Groups the row has no member for yet, in declaration order.
    pub fn missing_groups(&self, groups: &[String]) -> Vec<String> {
        groups
            .iter()
            .filter(|g| !self.members.contains_key(*g))
            .cloned()
            .collect()
    }

    pub fn is_complete(&self, groups: &[String]) -> bool {
        groups
            .iter()
            .all(|g| self.members.get(g).is_some_and(Member::is_committed))
    }

    pub fn insert(&mut self, group: &str, member: Member) {
        self.members.insert(group.to_string(), member);
    }

    pub fn remove(&mut self, group: &str) -> Option<Member> {
        self.members.remove(group)
    }

    /// Empty the row, returning what it held.
    pub fn clear(&mut self) -> Vec<Member> {
        std::mem::take(&mut self.members).into_values().collect()
    }
}

/// Provider state of a `TipProvisioning` step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TipProvisioningState {
    pub node_affinity: NodeAffinity,
    pub count_per_group: u32,
    /// Partition every row is drawn from (`SameCluster`/`SameRack`).
    #[serde(default)]
    pub partition: Option<LocalityKey>,
    /// Every node a create request was ever issued for. Never shrinks.
    #[serde(default)]
    pub nodes_attempted: BTreeSet<String>,
    #[serde(default)]
    pub slots: Vec<Slot>,
    /// Nodes whose `NodeState` has been applied.
    #[serde(default)]
    pub node_state_applied: BTreeSet<String>,
}

impl TipProvisioningState {
    pub fn new(node_affinity: NodeAffinity, count_per_group: u32) -> Self {
        Self {
            node_affinity,
            count_per_group,
            slots: vec![Slot::default(); count_per_group as usize],
            ..Default::default()
        }
    }

    pub fn members(&self) -> impl Iterator<Item = (&str, &Member)> {
        self.slots
            .iter()
            .flat_map(|s| s.members.iter().map(|(g, m)| (g.as_str(), m)))
    }

    pub fn committed(&self) -> impl Iterator<Item = &Member> {
        self.members().map(|(_, m)| m).filter(|m| m.is_committed())
    }

    pub fn is_complete(&self, groups: &[String]) -> bool {
        self.slots.iter().all(|s| s.is_complete(groups))
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Slot::is_empty)
    }

    pub fn has_pending(&self) -> bool {
        self.members().any(|(_, m)| !m.is_committed())
    }

    /// Rows still missing groups, with the groups they miss.
    pub fn shortfall(&self, groups: &[String]) -> Vec<(usize, Vec<String>)> {
        self.slots
            .iter()
            .enumerate()
            .map(|(row, slot)| (row, slot.missing_groups(groups)))
            .filter(|(_, missing)| !missing.is_empty())
            .collect()
    }

    /// Constraint every further pick must satisfy, given what the step
    /// already holds in any row.
    pub fn anchor(&self) -> Anchor {
        match self.node_affinity {
            NodeAffinity::SameCluster | NodeAffinity::SameRack => Anchor {
                partition: self.partition.clone(),
                used_clusters: BTreeSet::new(),
            },
            NodeAffinity::DifferentCluster => Anchor {
                partition: None,
                used_clusters: self
                    .members()
                    .filter_map(|(_, m)| m.cluster_name.clone())
                    .collect(),
            },
            NodeAffinity::Any => Anchor::default(),
        }
    }

    /// Empty every row and unpin the partition, returning what was held.
    pub fn clear(&mut self) -> Vec<Member> {
        self.partition = None;
        self.slots.iter_mut().flat_map(Slot::clear).collect()
    }
}
