//! Row selection under a node affinity constraint.
//!
//! Candidates are considered in pool (discovery) order, groups in their
//! declaration order. The constraint spans every row of the step: for the
//! partitioned affinities the first partition able to supply all requested
//! rows wins, and partitions that cannot are skipped entirely.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use fleet_core::NodeAffinity;

/// Locality partition a node belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LocalityKey {
    Cluster(String),
    Rack { cluster: String, rack: String },
}

impl fmt::Display for LocalityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cluster(cluster) => f.write_str(cluster),
            Self::Rack { cluster, rack } => write!(f, "{cluster}/{rack}"),
        }
    }
}

/// A usable node for one experiment group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub node_id: String,
    pub group: String,
    pub cluster_name: Option<String>,
    pub rack_location: Option<String>,
}

impl Candidate {
    /// Locality key under the given affinity. `None` for [`NodeAffinity::Any`].
    pub fn locality(&self, affinity: NodeAffinity) -> Option<LocalityKey> {
        match affinity {
            NodeAffinity::Any => None,
            NodeAffinity::SameCluster | NodeAffinity::DifferentCluster => {
                self.cluster_name.clone().map(LocalityKey::Cluster)
            }
            NodeAffinity::SameRack => match (&self.cluster_name, &self.rack_location) {
                (Some(cluster), Some(rack)) => Some(LocalityKey::Rack {
                    cluster: cluster.clone(),
                    rack: rack.clone(),
                }),
                _ => None,
            },
        }
    }
}

/// One group's node within a row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pick {
    pub group: String,
    pub node_id: String,
}

/// One node per requested group, satisfying the affinity together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    /// The shared partition for `SameCluster`/`SameRack` rows.
    pub partition: Option<LocalityKey>,
    pub picks: Vec<Pick>,
}

impl Assignment {
    pub fn node_for(&self, group: &str) -> Option<&str> {
        self.picks
            .iter()
            .find(|p| p.group == group)
            .map(|p| p.node_id.as_str())
    }
}

/// What the step already holds, constraining every further pick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Anchor {
    /// Partition the step is pinned to (`SameCluster`/`SameRack`).
    pub partition: Option<LocalityKey>,
    /// Clusters already used by any row (`DifferentCluster`).
    pub used_clusters: BTreeSet<String>,
}

/// Select up to `count` full rows from the candidates.
///
/// All or nothing: an empty result means the candidates cannot supply
/// every row under the affinity.
pub fn select(
    candidates: &[Candidate],
    groups: &[String],
    count: usize,
    affinity: NodeAffinity,
) -> Vec<Assignment> {
    let rows = vec![groups.to_vec(); count];
    let selected = select_rows(candidates, &rows, affinity, &Anchor::default()).unwrap_or_default();

    debug!(
        affinity = %affinity,
        requested = count,
        selected = selected.len(),
        "affinity selection complete"
    );
    selected
}

/// Select nodes for the groups every row is still missing.
///
/// `rows[i]` lists the groups row `i` needs; the result holds one
/// assignment per entry, in order. The picks are valid relative to the
/// anchor and to each other: one partition shared by every row for the
/// partitioned affinities, pairwise distinct clusters across every row for
/// `DifferentCluster`. Returns `None` unless every row can be served.
pub fn select_rows(
    candidates: &[Candidate],
    rows: &[Vec<String>],
    affinity: NodeAffinity,
    anchor: &Anchor,
) -> Option<Vec<Assignment>> {
    let all: Vec<&Candidate> = candidates.iter().collect();
    match affinity {
        NodeAffinity::Any => fill_rows(&all, rows).map(|picks| assignments(picks, None)),

        NodeAffinity::SameCluster | NodeAffinity::SameRack => {
            if let Some(partition) = &anchor.partition {
                let within: Vec<&Candidate> = all
                    .iter()
                    .copied()
                    .filter(|c| c.locality(affinity).as_ref() == Some(partition))
                    .collect();
                return fill_rows(&within, rows).map(|picks| assignments(picks, Some(partition)));
            }

            for (partition, members) in partitions(&all, affinity) {
                if let Some(picks) = fill_rows(&members, rows) {
                    return Some(assignments(picks, Some(&partition)));
                }
                debug!(%partition, "partition cannot supply every row, skipped");
            }
            None
        }

        NodeAffinity::DifferentCluster => {
            let flat: Vec<String> = rows.iter().flatten().cloned().collect();
            let mut used = anchor.used_clusters.clone();
            let mut picks = Vec::with_capacity(flat.len());
            if !distinct_clusters(&all, &flat, &mut used, &mut picks) {
                return None;
            }
            let mut picks = picks.into_iter();
            let split = rows
                .iter()
                .map(|groups| picks.by_ref().take(groups.len()).collect())
                .collect();
            Some(assignments(split, None))
        }
    }
}

fn assignments(rows: Vec<Vec<Pick>>, partition: Option<&LocalityKey>) -> Vec<Assignment> {
    rows.into_iter()
        .map(|picks| Assignment {
            partition: partition.cloned(),
            picks,
        })
        .collect()
}

/// One node per group for every row, no node used twice.
fn fill_rows(candidates: &[&Candidate], rows: &[Vec<String>]) -> Option<Vec<Vec<Pick>>> {
    let mut remaining = candidates.to_vec();
    let mut out = Vec::with_capacity(rows.len());
    for groups in rows {
        let picks = first_per_group(&remaining, groups)?;
        remaining.retain(|c| !picks.iter().any(|p| p.node_id == c.node_id));
        out.push(picks);
    }
    Some(out)
}

/// Group candidates by locality key, keeping first-seen order of keys.
fn partitions<'a>(
    candidates: &[&'a Candidate],
    affinity: NodeAffinity,
) -> Vec<(LocalityKey, Vec<&'a Candidate>)> {
    let mut out: Vec<(LocalityKey, Vec<&'a Candidate>)> = Vec::new();
    for candidate in candidates {
        let Some(key) = candidate.locality(affinity) else {
            continue;
        };
        match out.iter_mut().find(|(k, _)| *k == key) {
            Some((_, members)) => members.push(candidate),
            None => out.push((key, vec![candidate])),
        }
    }
    out
}

fn first_per_group(candidates: &[&Candidate], groups: &[String]) -> Option<Vec<Pick>> {
    groups
        .iter()
        .map(|group| {
            candidates
                .iter()
                .find(|c| &c.group == group)
                .map(|c| Pick {
                    group: group.clone(),
                    node_id: c.node_id.clone(),
                })
        })
        .collect()
}

/// Depth-first assignment of groups to pairwise distinct clusters.
///
/// `groups` may repeat a group once per row; every entry still needs its
/// own cluster.
fn distinct_clusters(
    candidates: &[&Candidate],
    groups: &[String],
    used: &mut BTreeSet<String>,
    picks: &mut Vec<Pick>,
) -> bool {
    let Some((group, rest)) = groups.split_first() else {
        return true;
    };

    let mut tried: BTreeSet<&str> = BTreeSet::new();
    for candidate in candidates.iter().filter(|c| &c.group == group) {
        let Some(cluster) = candidate.cluster_name.as_deref() else {
            continue;
        };
        // Any node in a cluster is as good as another for the groups that follow.
        if used.contains(cluster) || !tried.insert(cluster) {
            continue;
        }

        used.insert(cluster.to_string());
        picks.push(Pick {
            group: group.clone(),
            node_id: candidate.node_id.clone(),
        });
        if distinct_clusters(candidates, rest, used, picks) {
            return true;
        }
        picks.pop();
        used.remove(cluster);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(id: &str, group: &str, cluster: &str, rack: &str) -> Candidate {
        Candidate {
            node_id: id.to_string(),
            group: group.to_string(),
            cluster_name: Some(cluster.to_string()),
            rack_location: Some(rack.to_string()),
        }
    }

    fn groups() -> Vec<String> {
        vec!["Group A".to_string(), "Group B".to_string()]
    }

    fn two_racks() -> Vec<Candidate> {
        vec![
            cand("node1", "Group A", "cluster01", "Rack01"),
            cand("node2", "Group B", "cluster01", "Rack01"),
            cand("node3", "Group A", "cluster01", "Rack01"),
            cand("node4", "Group B", "cluster01", "Rack01"),
            cand("node5", "Group A", "cluster01", "Rack02"),
            cand("node6", "Group B", "cluster01", "Rack02"),
        ]
    }

    #[test]
    fn same_rack_prefers_first_sufficient_partition() {
        let rows = select(&two_racks(), &groups(), 1, NodeAffinity::SameRack);

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].node_for("Group A"), Some("node1"));
        assert_eq!(rows[0].node_for("Group B"), Some("node2"));
        assert_eq!(
            rows[0].partition,
            Some(LocalityKey::Rack {
                cluster: "cluster01".to_string(),
                rack: "Rack01".to_string()
            })
        );
    }

    #[test]
    fn every_row_comes_from_one_partition() {
        let rows = select(&two_racks(), &groups(), 2, NodeAffinity::SameRack);

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].node_for("Group A"), Some("node3"));
        assert_eq!(rows[1].node_for("Group B"), Some("node4"));
        assert!(rows.iter().all(|r| r.partition == rows[0].partition));

        // Rack01 holds two rows and Rack02 one; three rows fit nowhere.
        assert!(select(&two_racks(), &groups(), 3, NodeAffinity::SameRack).is_empty());
    }

    #[test]
    fn first_partition_able_to_supply_every_row_wins() {
        let candidates = vec![
            cand("node1", "Group A", "cluster01", "Rack01"),
            cand("node2", "Group B", "cluster01", "Rack01"),
            cand("node3", "Group A", "cluster01", "Rack02"),
            cand("node4", "Group B", "cluster01", "Rack02"),
            cand("node5", "Group A", "cluster01", "Rack02"),
            cand("node6", "Group B", "cluster01", "Rack02"),
        ];
        let rows = select(&candidates, &groups(), 2, NodeAffinity::SameRack);

        assert_eq!(rows.len(), 2);
        assert_eq!(
            rows[0].partition,
            Some(LocalityKey::Rack {
                cluster: "cluster01".to_string(),
                rack: "Rack02".to_string()
            })
        );
        assert_eq!(rows[0].node_for("Group A"), Some("node3"));
        assert_eq!(rows[1].node_for("Group B"), Some("node6"));
    }

    #[test]
    fn partition_missing_a_group_is_skipped() {
        let candidates = vec![
            cand("node1", "Group A", "cluster01", "Rack01"),
            cand("node2", "Group A", "cluster01", "Rack01"),
            cand("node3", "Group A", "cluster02", "Rack01"),
            cand("node4", "Group B", "cluster02", "Rack01"),
        ];
        let rows = select(&candidates, &groups(), 1, NodeAffinity::SameCluster);

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].partition, Some(LocalityKey::Cluster("cluster02".to_string())));
        assert_eq!(rows[0].node_for("Group A"), Some("node3"));
    }

    #[test]
    fn same_cluster_spans_racks() {
        let candidates = vec![
            cand("node1", "Group A", "cluster01", "Rack01"),
            cand("node2", "Group B", "cluster01", "Rack02"),
        ];
        assert_eq!(select(&candidates, &groups(), 1, NodeAffinity::SameCluster).len(), 1);
        assert!(select(&candidates, &groups(), 1, NodeAffinity::SameRack).is_empty());
    }

    #[test]
    fn different_cluster_backtracks() {
        // Greedy would give Group A cluster01 and strand Group B.
        let candidates = vec![
            cand("node1", "Group A", "cluster01", "Rack01"),
            cand("node2", "Group A", "cluster02", "Rack01"),
            cand("node3", "Group B", "cluster01", "Rack01"),
        ];
        let rows = select(&candidates, &groups(), 1, NodeAffinity::DifferentCluster);

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].node_for("Group A"), Some("node2"));
        assert_eq!(rows[0].node_for("Group B"), Some("node3"));
    }

    #[test]
    fn different_cluster_impossible_in_single_cluster() {
        let candidates = vec![
            cand("node1", "Group A", "cluster01", "Rack01"),
            cand("node2", "Group B", "cluster01", "Rack02"),
        ];
        assert!(select(&candidates, &groups(), 1, NodeAffinity::DifferentCluster).is_empty());
    }

    #[test]
    fn any_ignores_locality() {
        let candidates = vec![
            Candidate {
                node_id: "node1".to_string(),
                group: "Group B".to_string(),
                cluster_name: None,
                rack_location: None,
            },
            cand("node2", "Group A", "cluster09", "Rack09"),
            cand("node3", "Group B", "cluster01", "Rack01"),
            cand("node4", "Group A", "cluster02", "Rack02"),
        ];
        let rows = select(&candidates, &groups(), 2, NodeAffinity::Any);

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].node_for("Group A"), Some("node2"));
        assert_eq!(rows[0].node_for("Group B"), Some("node1"));
        assert_eq!(rows[1].node_for("Group A"), Some("node4"));
        assert_eq!(rows[1].node_for("Group B"), Some("node3"));
    }

    #[test]
    fn different_cluster_spans_rows() {
        let candidates = vec![
            cand("node1", "Group A", "cluster01", "Rack01"),
            cand("node2", "Group B", "cluster02", "Rack01"),
            cand("node3", "Group A", "cluster01", "Rack02"),
            cand("node4", "Group B", "cluster02", "Rack02"),
        ];
        // Two clusters serve one row; a second row would reuse them.
        assert_eq!(select(&candidates, &groups(), 1, NodeAffinity::DifferentCluster).len(), 1);
        assert!(select(&candidates, &groups(), 2, NodeAffinity::DifferentCluster).is_empty());

        let mut four = candidates;
        four.push(cand("node5", "Group A", "cluster03", "Rack01"));
        four.push(cand("node6", "Group B", "cluster04", "Rack01"));
        let rows = select(&four, &groups(), 2, NodeAffinity::DifferentCluster);
        assert_eq!(rows.len(), 2);

        let clusters: BTreeSet<&str> = rows
            .iter()
            .flat_map(|r| &r.picks)
            .map(|p| {
                four.iter()
                    .find(|c| c.node_id == p.node_id)
                    .and_then(|c| c.cluster_name.as_deref())
                    .unwrap()
            })
            .collect();
        assert_eq!(clusters.len(), 4);
    }

    #[test]
    fn substitution_stays_in_anchor_partition() {
        // The step is pinned to Rack02; Group B needs a substitute there.
        let candidates = vec![
            cand("node2", "Group B", "cluster01", "Rack01"),
            cand("node6", "Group B", "cluster01", "Rack02"),
        ];
        let anchor = Anchor {
            partition: Some(LocalityKey::Rack {
                cluster: "cluster01".to_string(),
                rack: "Rack02".to_string(),
            }),
            used_clusters: BTreeSet::new(),
        };
        let missing = vec![vec!["Group B".to_string()]];
        let rows = select_rows(&candidates, &missing, NodeAffinity::SameRack, &anchor).unwrap();
        assert_eq!(rows[0].node_for("Group B"), Some("node6"));

        let only_rack01 = vec![candidates[0].clone()];
        assert!(select_rows(&only_rack01, &missing, NodeAffinity::SameRack, &anchor).is_none());
    }

    #[test]
    fn partial_rows_are_served_together() {
        // Row 0 lacks Group B, row 1 lacks both groups.
        let candidates = vec![
            cand("node1", "Group B", "cluster01", "Rack01"),
            cand("node2", "Group A", "cluster01", "Rack01"),
            cand("node3", "Group B", "cluster01", "Rack01"),
        ];
        let missing = vec![
            vec!["Group B".to_string()],
            groups(),
        ];
        let anchor = Anchor {
            partition: Some(LocalityKey::Cluster("cluster01".to_string())),
            used_clusters: BTreeSet::new(),
        };
        let rows = select_rows(&candidates, &missing, NodeAffinity::SameCluster, &anchor).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].node_for("Group B"), Some("node1"));
        assert_eq!(rows[1].node_for("Group A"), Some("node2"));
        assert_eq!(rows[1].node_for("Group B"), Some("node3"));

        assert!(select_rows(&candidates[..2], &missing, NodeAffinity::SameCluster, &anchor).is_none());
    }

    #[test]
    fn substitution_avoids_used_clusters() {
        let candidates = vec![
            cand("node3", "Group B", "cluster01", "Rack01"),
            cand("node4", "Group B", "cluster03", "Rack01"),
        ];
        let anchor = Anchor {
            partition: None,
            used_clusters: BTreeSet::from(["cluster01".to_string()]),
        };
        let rows = select_rows(
            &candidates,
            &[vec!["Group B".to_string()]],
            NodeAffinity::DifferentCluster,
            &anchor,
        )
        .unwrap();
        assert_eq!(rows[0].node_for("Group B"), Some("node4"));
    }

    #[test]
    fn empty_candidates_select_nothing() {
        assert!(select(&[], &groups(), 1, NodeAffinity::Any).is_empty());
        assert!(select(&two_racks(), &groups(), 0, NodeAffinity::SameRack).is_empty());
    }
}
