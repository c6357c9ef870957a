//! StateStore: redb-backed persistence for experiment entities and provider state.
//!
//! Provides the [`ExperimentStore`] operations the provisioning engine
//! relies on. All values are JSON-serialized into redb's `&[u8]` value
//! columns. The store supports both on-disk and in-memory backends (the
//! latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::entity::{EntityKey, EntitySet, EnvironmentEntity};
use crate::error::{StateError, StateResult};
use crate::tables::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Storage collaborator for one experiment's shared resources.
///
/// Implementations are expected to serialize access per experiment and
/// step; the engine performs no locking of its own. Saves replace the
/// whole record named by the call.
pub trait ExperimentStore: Send + Sync {
    fn get_entity_pool(&self, experiment_id: &str) -> StateResult<EntitySet>;

    fn save_entity_pool(&self, experiment_id: &str, pool: &EntitySet) -> StateResult<()>;

    fn get_entities_provisioned(&self, experiment_id: &str) -> StateResult<EntitySet>;

    /// Replace the provisioned set.
    fn save_entities_provisioned(&self, experiment_id: &str, entities: &EntitySet)
    -> StateResult<()>;

    /// Add entities to the provisioned set, replacing any with the same identity.
    fn update_entities_provisioned(
        &self,
        experiment_id: &str,
        entities: &[EnvironmentEntity],
    ) -> StateResult<()> {
        let mut current = self.get_entities_provisioned(experiment_id)?;
        for entity in entities {
            current.upsert(entity.clone());
        }
        self.save_entities_provisioned(experiment_id, &current)
    }

    /// Remove entities from the provisioned set by identity. Returns how many were present.
    fn remove_entities_provisioned(
        &self,
        experiment_id: &str,
        keys: &[EntityKey],
    ) -> StateResult<usize> {
        let mut current = self.get_entities_provisioned(experiment_id)?;
        let removed = keys.iter().filter(|k| current.remove(k).is_some()).count();
        if removed > 0 {
            self.save_entities_provisioned(experiment_id, &current)?;
        }
        Ok(removed)
    }

    fn get_state(&self, experiment_id: &str, key: &str) -> StateResult<Option<Value>>;

    fn save_state(&self, experiment_id: &str, key: &str, state: &Value) -> StateResult<()>;

    fn delete_state(&self, experiment_id: &str, key: &str) -> StateResult<bool>;
}

/// Typed provider-state helpers over any [`ExperimentStore`].
pub trait StateExt {
    fn get_state_as<T: DeserializeOwned>(&self, experiment_id: &str, key: &str)
    -> StateResult<Option<T>>;

    fn save_state_as<T: Serialize>(&self, experiment_id: &str, key: &str, state: &T)
    -> StateResult<()>;
}

impl<S: ExperimentStore + ?Sized> StateExt for S {
    fn get_state_as<T: DeserializeOwned>(
        &self,
        experiment_id: &str,
        key: &str,
    ) -> StateResult<Option<T>> {
        match self.get_state(experiment_id, key)? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(map_err!(Deserialize)),
            None => Ok(None),
        }
    }

    fn save_state_as<T: Serialize>(
        &self,
        experiment_id: &str,
        key: &str,
        state: &T,
    ) -> StateResult<()> {
        let value = serde_json::to_value(state).map_err(map_err!(Serialize))?;
        self.save_state(experiment_id, key, &value)
    }
}

/// Thread-safe experiment store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(ENTITY_POOL).map_err(map_err!(Table))?;
        txn.open_table(ENTITIES_PROVISIONED).map_err(map_err!(Table))?;
        txn.open_table(PROVIDER_STATE).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn read_raw(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> StateResult<Option<Vec<u8>>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        Ok(table
            .get(key)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value().to_vec()))
    }

    fn write_raw(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
        value: &[u8],
    ) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            table.insert(key, value).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn remove_raw(&self, table: TableDefinition<&str, &[u8]>, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    fn read_set(&self, table: TableDefinition<&str, &[u8]>, key: &str) -> StateResult<EntitySet> {
        match self.read_raw(table, key)? {
            Some(bytes) => serde_json::from_slice(&bytes).map_err(map_err!(Deserialize)),
            None => Ok(EntitySet::new()),
        }
    }

    fn write_set(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
        set: &EntitySet,
    ) -> StateResult<()> {
        let value = serde_json::to_vec(set).map_err(map_err!(Serialize))?;
        self.write_raw(table, key, &value)
    }

    /// List provider-state keys recorded for an experiment.
    pub fn list_state_keys(&self, experiment_id: &str) -> StateResult<Vec<String>> {
        let prefix = format!("{experiment_id}/");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PROVIDER_STATE).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, _) = entry.map_err(map_err!(Read))?;
            if let Some(rest) = key.value().strip_prefix(&prefix) {
                results.push(rest.to_string());
            }
        }
        Ok(results)
    }
}

fn state_key(experiment_id: &str, key: &str) -> String {
    format!("{experiment_id}/{key}")
}

impl ExperimentStore for StateStore {
    fn get_entity_pool(&self, experiment_id: &str) -> StateResult<EntitySet> {
        self.read_set(ENTITY_POOL, experiment_id)
    }

    fn save_entity_pool(&self, experiment_id: &str, pool: &EntitySet) -> StateResult<()> {
        self.write_set(ENTITY_POOL, experiment_id, pool)?;
        debug!(experiment = %experiment_id, entities = pool.len(), "entity pool stored");
        Ok(())
    }

    fn get_entities_provisioned(&self, experiment_id: &str) -> StateResult<EntitySet> {
        self.read_set(ENTITIES_PROVISIONED, experiment_id)
    }

    fn save_entities_provisioned(
        &self,
        experiment_id: &str,
        entities: &EntitySet,
    ) -> StateResult<()> {
        self.write_set(ENTITIES_PROVISIONED, experiment_id, entities)?;
        debug!(
            experiment = %experiment_id,
            entities = entities.len(),
            "entities provisioned stored"
        );
        Ok(())
    }

    fn get_state(&self, experiment_id: &str, key: &str) -> StateResult<Option<Value>> {
        match self.read_raw(PROVIDER_STATE, &state_key(experiment_id, key))? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(map_err!(Deserialize)),
            None => Ok(None),
        }
    }

    fn save_state(&self, experiment_id: &str, key: &str, state: &Value) -> StateResult<()> {
        let value = serde_json::to_vec(state).map_err(map_err!(Serialize))?;
        self.write_raw(PROVIDER_STATE, &state_key(experiment_id, key), &value)
    }

    fn delete_state(&self, experiment_id: &str, key: &str) -> StateResult<bool> {
        self.remove_raw(PROVIDER_STATE, &state_key(experiment_id, key))
    }
}
