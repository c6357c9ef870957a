//! Environment entities: nodes, racks and TiP sessions.
//!
//! Discovery hands the engine loosely populated records. Each entity type
//! carries its own statically-typed field set; optional fields are
//! `Option`s so that a sparse record still loads, and the accessors on
//! [`EnvironmentEntity`] turn a missing required field into an
//! [`EntityError`] at the point of use.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EntityError;

/// Kind of environment entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityType {
    Node,
    Rack,
    TipSession,
}

impl EntityType {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Node => "Node",
            Self::Rack => "Rack",
            Self::TipSession => "TipSession",
        }
    }
}

/// Identity of an entity. Ids are only unique within their type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub entity_type: EntityType,
    pub id: String,
}

impl EntityKey {
    pub fn node(id: &str) -> Self {
        Self {
            entity_type: EntityType::Node,
            id: id.to_string(),
        }
    }

    pub fn tip_session(id: &str) -> Self {
        Self {
            entity_type: EntityType::TipSession,
            id: id.to_string(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type.label(), self.id)
    }
}

// ── Metadata ──────────────────────────────────────────────────────

/// Lifecycle of a TiP session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TipSessionStatus {
    Creating,
    Created,
    Failed,
}

/// Physical fleet node as reported by discovery.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeMetadata {
    pub cluster_name: Option<String>,
    pub rack_location: Option<String>,
    pub region: Option<String>,
    pub machine_pool_name: Option<String>,
    #[serde(default)]
    pub supported_vm_skus: Vec<String>,
    /// Set once a session has been requested against this node.
    pub tip_session_id: Option<String>,
    pub tip_session_status: Option<TipSessionStatus>,
    pub tip_session_request_change_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RackMetadata {
    pub cluster_name: Option<String>,
    pub rack_location: Option<String>,
    pub region: Option<String>,
}

/// An exclusive, time-bounded lease on one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TipSession {
    pub tip_session_id: String,
    pub cluster_name: String,
    pub region: String,
    pub node_id: String,
    pub group_name: String,
    #[serde(default)]
    pub change_id_list: Vec<String>,
    pub status: TipSessionStatus,
    pub created_time_utc: Option<DateTime<Utc>>,
    pub expiration_time_utc: Option<DateTime<Utc>>,
    pub deleted_time_utc: Option<DateTime<Utc>>,
    #[serde(default)]
    pub supported_vm_skus: Vec<String>,
    pub preferred_vm_sku: Option<String>,
}

/// Typed field set per entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity_type")]
pub enum EntityMetadata {
    Node(NodeMetadata),
    Rack(RackMetadata),
    TipSession(TipSession),
}

// ── Entity ────────────────────────────────────────────────────────

/// A single environment resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentEntity {
    pub id: String,
    pub environment_group: String,
    #[serde(default)]
    pub discarded: bool,
    pub metadata: EntityMetadata,
}

impl EnvironmentEntity {
    pub fn node(id: &str, group: &str, metadata: NodeMetadata) -> Self {
        Self {
            id: id.to_string(),
            environment_group: group.to_string(),
            discarded: false,
            metadata: EntityMetadata::Node(metadata),
        }
    }

    pub fn rack(id: &str, group: &str, metadata: RackMetadata) -> Self {
        Self {
            id: id.to_string(),
            environment_group: group.to_string(),
            discarded: false,
            metadata: EntityMetadata::Rack(metadata),
        }
    }

    pub fn tip_session(session: TipSession) -> Self {
        Self {
            id: session.tip_session_id.clone(),
            environment_group: session.group_name.clone(),
            discarded: false,
            metadata: EntityMetadata::TipSession(session),
        }
    }

    pub fn entity_type(&self) -> EntityType {
        match &self.metadata {
            EntityMetadata::Node(_) => EntityType::Node,
            EntityMetadata::Rack(_) => EntityType::Rack,
            EntityMetadata::TipSession(_) => EntityType::TipSession,
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey {
            entity_type: self.entity_type(),
            id: self.id.clone(),
        }
    }

    pub fn is_node(&self) -> bool {
        matches!(self.metadata, EntityMetadata::Node(_))
    }

    fn missing(&self, field: &'static str) -> EntityError {
        EntityError::MissingField {
            entity: self.key().to_string(),
            field,
        }
    }

    fn wrong_type(&self, expected: &'static str) -> EntityError {
        EntityError::WrongType {
            entity: self.key().to_string(),
            expected,
        }
    }

    fn required<'a>(&self, value: Option<&'a String>, field: &'static str) -> Result<&'a str, EntityError> {
        value
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| self.missing(field))
    }

    pub fn as_node(&self) -> Result<&NodeMetadata, EntityError> {
        match &self.metadata {
            EntityMetadata::Node(m) => Ok(m),
            _ => Err(self.wrong_type("Node")),
        }
    }

    pub fn as_node_mut(&mut self) -> Result<&mut NodeMetadata, EntityError> {
        match self.metadata {
            EntityMetadata::Node(ref mut m) => Ok(m),
            _ => Err(self.wrong_type("Node")),
        }
    }

    pub fn as_tip_session(&self) -> Result<&TipSession, EntityError> {
        match &self.metadata {
            EntityMetadata::TipSession(s) => Ok(s),
            _ => Err(self.wrong_type("TipSession")),
        }
    }

    pub fn cluster_name(&self) -> Result<&str, EntityError> {
        match &self.metadata {
            EntityMetadata::Node(m) => self.required(m.cluster_name.as_ref(), "ClusterName"),
            EntityMetadata::Rack(m) => self.required(m.cluster_name.as_ref(), "ClusterName"),
            EntityMetadata::TipSession(s) => self.required(Some(&s.cluster_name), "ClusterName"),
        }
    }

    pub fn rack_location(&self) -> Result<&str, EntityError> {
        match &self.metadata {
            EntityMetadata::Node(m) => self.required(m.rack_location.as_ref(), "RackLocation"),
            EntityMetadata::Rack(m) => self.required(m.rack_location.as_ref(), "RackLocation"),
            EntityMetadata::TipSession(_) => Err(self.wrong_type("Node or Rack")),
        }
    }

    pub fn region(&self) -> Result<&str, EntityError> {
        match &self.metadata {
            EntityMetadata::Node(m) => self.required(m.region.as_ref(), "Region"),
            EntityMetadata::Rack(m) => self.required(m.region.as_ref(), "Region"),
            EntityMetadata::TipSession(s) => self.required(Some(&s.region), "Region"),
        }
    }

    pub fn machine_pool_name(&self) -> Result<&str, EntityError> {
        let node = self.as_node()?;
        self.required(node.machine_pool_name.as_ref(), "MachinePoolName")
    }

    /// The node a session entity belongs to, or a node's own id.
    pub fn node_id(&self) -> Result<&str, EntityError> {
        match &self.metadata {
            EntityMetadata::Node(_) => Ok(self.id.as_str()),
            EntityMetadata::TipSession(s) => self.required(Some(&s.node_id), "NodeId"),
            EntityMetadata::Rack(_) => Err(self.wrong_type("Node or TipSession")),
        }
    }

    /// The session linked to a node, or a session's own id.
    pub fn tip_session_id(&self) -> Result<&str, EntityError> {
        match &self.metadata {
            EntityMetadata::Node(m) => self.required(m.tip_session_id.as_ref(), "TipSessionId"),
            EntityMetadata::TipSession(_) => Ok(self.id.as_str()),
            EntityMetadata::Rack(_) => Err(self.wrong_type("Node or TipSession")),
        }
    }

    pub fn supported_vm_skus(&self) -> &[String] {
        match &self.metadata {
            EntityMetadata::Node(m) => &m.supported_vm_skus,
            EntityMetadata::TipSession(s) => &s.supported_vm_skus,
            EntityMetadata::Rack(_) => &[],
        }
    }

    /// Record the session requested against this node.
    pub fn link_tip_session(
        &mut self,
        tip_session_id: &str,
        status: TipSessionStatus,
        change_id: Option<&str>,
    ) -> Result<(), EntityError> {
        let node = self.as_node_mut()?;
        node.tip_session_id = Some(tip_session_id.to_string());
        node.tip_session_status = Some(status);
        node.tip_session_request_change_id = change_id.map(str::to_string);
        Ok(())
    }
}

// ── Collections ───────────────────────────────────────────────────

/// An ordered collection of entities, unique by [`EntityKey`].
///
/// Used both for the candidate pool and for the provisioned set. Order is
/// the order entities were first added, which downstream selection treats
/// as the discovery order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntitySet {
    entities: Vec<EnvironmentEntity>,
}

impl EntitySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EnvironmentEntity> {
        self.entities.iter()
    }

    pub fn of_type(&self, entity_type: EntityType) -> impl Iterator<Item = &EnvironmentEntity> {
        self.entities
            .iter()
            .filter(move |e| e.entity_type() == entity_type)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &EnvironmentEntity> {
        self.of_type(EntityType::Node)
    }

    pub fn tip_sessions(&self) -> impl Iterator<Item = &EnvironmentEntity> {
        self.of_type(EntityType::TipSession)
    }

    pub fn get(&self, key: &EntityKey) -> Option<&EnvironmentEntity> {
        self.entities
            .iter()
            .find(|e| e.entity_type() == key.entity_type && e.id == key.id)
    }

    pub fn get_mut(&mut self, key: &EntityKey) -> Option<&mut EnvironmentEntity> {
        self.entities
            .iter_mut()
            .find(|e| e.entity_type() == key.entity_type && e.id == key.id)
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        self.get(key).is_some()
    }

    /// Insert or replace by identity. Replacement keeps the original position.
    pub fn upsert(&mut self, entity: EnvironmentEntity) {
        match self.get_mut(&entity.key()) {
            Some(existing) => *existing = entity,
            None => self.entities.push(entity),
        }
    }

    pub fn remove(&mut self, key: &EntityKey) -> Option<EnvironmentEntity> {
        let idx = self
            .entities
            .iter()
            .position(|e| e.entity_type() == key.entity_type && e.id == key.id)?;
        Some(self.entities.remove(idx))
    }

    /// Count entities of a type belonging to a group.
    pub fn count_in_group(&self, entity_type: EntityType, group: &str) -> usize {
        self.of_type(entity_type)
            .filter(|e| e.environment_group == group)
            .count()
    }

    /// Check that every session has exactly one node pointing back at it
    /// and every linked node has its session.
    pub fn verify_pairing(&self) -> Result<(), EntityError> {
        for session in self.tip_sessions() {
            let node_id = session.node_id()?;
            let node = self
                .get(&EntityKey::node(node_id))
                .ok_or_else(|| EntityError::Pairing(format!("{} has no node {node_id}", session.key())))?;
            let linked = node.tip_session_id()?;
            if linked != session.id {
                return Err(EntityError::Pairing(format!(
                    "{} points at {linked}, expected {}",
                    node.key(),
                    session.id
                )));
            }
        }
        for node in self.nodes() {
            let session_id = node.tip_session_id()?;
            if !self.contains(&EntityKey::tip_session(session_id)) {
                return Err(EntityError::Pairing(format!(
                    "{} has no session {session_id}",
                    node.key()
                )));
            }
        }
        Ok(())
    }
}

impl FromIterator<EnvironmentEntity> for EntitySet {
    fn from_iter<I: IntoIterator<Item = EnvironmentEntity>>(iter: I) -> Self {
        let mut set = EntitySet::new();
        for entity in iter {
            set.upsert(entity);
        }
        set
    }
}

impl IntoIterator for EntitySet {
    type Item = EnvironmentEntity;
    type IntoIter = std::vec::IntoIter<EnvironmentEntity>;

    fn into_iter(self) -> Self::IntoIter {
        self.entities.into_iter()
    }
}
