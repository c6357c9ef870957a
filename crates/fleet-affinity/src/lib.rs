//! Fleet node affinity selector.
//!
//! Decides which candidate node backs each experiment group. A *row* is
//! one node per group; the experiment needs `CountPerGroup` rows. The
//! affinity constraint applies across every row: one cluster or rack for
//! every node, pairwise distinct clusters, or nothing at all.
//!
//! The selector is pure. It never mutates the pool; the provisioning
//! orchestrator decides what gets discarded or marked attempted.
//!
//! # Components
//!
//! - **`selector`**: Row selection (initial assignment and substitution)
//! - **`convert`**: Candidate extraction from the entity pool

pub mod convert;
pub mod selector;

use thiserror::Error;

pub use convert::usable_candidates;
pub use selector::{Anchor, Assignment, Candidate, LocalityKey, Pick, select, select_rows};

/// Errors raised while preparing candidates.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectionError {
    #[error("malformed candidate: {0}")]
    Entity(#[from] fleet_state::EntityError),
}
