//! redb table definitions for the experiment state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized).

use redb::TableDefinition;

/// Candidate entities keyed by `{experiment_id}`.
pub const ENTITY_POOL: TableDefinition<&str, &[u8]> = TableDefinition::new("entity_pool");

/// Committed entities keyed by `{experiment_id}`.
pub const ENTITIES_PROVISIONED: TableDefinition<&str, &[u8]> =
    TableDefinition::new("entities_provisioned");

/// Provider state keyed by `{experiment_id}/{state_key}`.
pub const PROVIDER_STATE: TableDefinition<&str, &[u8]> = TableDefinition::new("provider_state");
