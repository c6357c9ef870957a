//! Conversion from pool entities to selection candidates.

use std::collections::BTreeSet;

use fleet_core::NodeAffinity;
use fleet_state::EntitySet;

use crate::SelectionError;
use crate::selector::Candidate;

/// Extract the nodes still eligible for selection.
///
/// A node is eligible when it belongs to one of `groups`, is not
/// discarded, and has never been attempted in this step. The locality
/// fields the affinity needs are required: a node missing them is
/// malformed discovery data and fails the whole extraction.
pub fn usable_candidates(
    pool: &EntitySet,
    groups: &[String],
    attempted: &BTreeSet<String>,
    affinity: NodeAffinity,
) -> Result<Vec<Candidate>, SelectionError> {
    let mut candidates = Vec::new();
    for node in pool.nodes() {
        if node.discarded
            || attempted.contains(&node.id)
            || !groups.contains(&node.environment_group)
        {
            continue;
        }

        let (cluster_name, rack_location) = match affinity {
            NodeAffinity::Any => (
                node.cluster_name().ok().map(str::to_string),
                node.rack_location().ok().map(str::to_string),
            ),
            NodeAffinity::SameCluster | NodeAffinity::DifferentCluster => (
                Some(node.cluster_name()?.to_string()),
                node.rack_location().ok().map(str::to_string),
            ),
            NodeAffinity::SameRack => (
                Some(node.cluster_name()?.to_string()),
                Some(node.rack_location()?.to_string()),
            ),
        };

        candidates.push(Candidate {
            node_id: node.id.clone(),
            group: node.environment_group.clone(),
            cluster_name,
            rack_location,
        });
    }
    Ok(candidates)
}
