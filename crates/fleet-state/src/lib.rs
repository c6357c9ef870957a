//! fleet-state: environment entities and the experiment state store.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistence for the
//! three shared resources a provisioning step touches: the candidate
//! entity pool, the entities provisioned to the experiment, and the
//! per-step provider state.
//!
//! # Architecture
//!
//! All values are JSON-serialized into redb's `&[u8]` value columns.
//! Pools are keyed by experiment id; provider state is keyed by
//! `{experiment_id}/{state_key}` so one experiment's records can be
//! prefix-scanned together.
//!
//! Callers depend on the [`ExperimentStore`] trait. [`StateStore`] is the
//! redb implementation; it is `Clone + Send + Sync` (backed by
//! `Arc<Database>`).

pub mod entity;
pub mod error;
pub mod store;
pub mod tables;

pub use entity::*;
pub use error::{EntityError, StateError, StateResult};
pub use store::{ExperimentStore, StateExt, StateStore};
