//! Shared types used across fleet crates.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Outcome of a single step invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    /// More polling is needed; re-invoke on the next scheduling tick.
    InProgress,
    /// Work remains but nothing external is pending; re-invoke immediately.
    InProgressContinue,
    /// Terminal. Entities are committed.
    Succeeded,
    /// Terminal. An error is attached to the result.
    Failed,
    /// Terminal. Only ever produced by the cancellation token.
    Cancelled,
}

impl ExecutionStatus {
    /// Whether the scheduler should stop invoking the step.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InProgress => "InProgress",
            Self::InProgressContinue => "InProgressContinue",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Cancelled => "Cancelled",
        };
        f.write_str(s)
    }
}

/// Locality constraint between the nodes chosen for different experiment groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum NodeAffinity {
    /// No constraint.
    #[default]
    Any,
    /// Every group's node in a row comes from the same cluster.
    SameCluster,
    /// Every group's node in a row comes from the same cluster and rack.
    SameRack,
    /// Every group's node in a row comes from a distinct cluster.
    DifferentCluster,
}

impl NodeAffinity {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Any => "Any",
            Self::SameCluster => "SameCluster",
            Self::SameRack => "SameRack",
            Self::DifferentCluster => "DifferentCluster",
        }
    }

    /// Whether a row must be drawn from a single locality partition.
    pub fn is_partitioned(&self) -> bool {
        matches!(self, Self::SameCluster | Self::SameRack)
    }
}

impl fmt::Display for NodeAffinity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for NodeAffinity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "any" => Ok(Self::Any),
            "samecluster" => Ok(Self::SameCluster),
            "samerack" => Ok(Self::SameRack),
            "differentcluster" => Ok(Self::DifferentCluster),
            other => Err(format!(
                "unknown node affinity '{other}' (expected Any, SameCluster, SameRack or DifferentCluster)"
            )),
        }
    }
}
