//! Remote fleet-test (TiP) service interface.
//!
//! The engine only consumes this trait. Session creation and deletion are
//! asynchronous on the remote side: each call returns a change handle
//! whose progress is polled on later invocations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use fleet_state::{EntityError, EnvironmentEntity};
use fleet_step::ProviderError;

/// Errors reported by the TiP service or the transport in front of it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TipError {
    #[error("{0}")]
    Request(String),

    #[error("TiP session '{0}' not found")]
    SessionNotFound(String),
}

impl From<TipError> for ProviderError {
    fn from(e: TipError) -> Self {
        ProviderError::RemoteRequest(e.to_string())
    }
}

/// Parameters for a new exclusive session on one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TipSessionRequest {
    pub node_id: String,
    pub group_name: String,
    pub cluster_name: String,
    pub region: String,
    pub machine_pool_name: String,
    pub supported_vm_skus: Vec<String>,
    pub feature_flag: Option<String>,
}

impl TipSessionRequest {
    /// Build a request from a pool node. Cluster, region and machine pool
    /// are required.
    pub fn for_node(node: &EnvironmentEntity, feature_flag: Option<&str>) -> Result<Self, EntityError> {
        let metadata = node.as_node()?;
        Ok(Self {
            node_id: node.id.clone(),
            group_name: node.environment_group.clone(),
            cluster_name: node.cluster_name()?.to_string(),
            region: node.region()?.to_string(),
            machine_pool_name: node.machine_pool_name()?.to_string(),
            supported_vm_skus: metadata.supported_vm_skus.clone(),
            feature_flag: feature_flag.map(str::to_string),
        })
    }
}

/// Handle on an asynchronous remote change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeHandle {
    pub tip_session_id: String,
    pub change_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeStatus {
    Pending,
    Running,
    Finished,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeDetails {
    pub status: ChangeStatus,
    /// Free-form result text reported by the service.
    pub result: Option<String>,
}

/// Session properties as reported by the service once it exists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDetails {
    pub tip_session_id: String,
    pub created_time_utc: Option<DateTime<Utc>>,
    pub expiration_time_utc: Option<DateTime<Utc>>,
    pub supported_vm_skus: Vec<String>,
}

/// The TiP service.
#[async_trait]
pub trait TipClient: Send + Sync {
    async fn create_session(&self, request: &TipSessionRequest) -> Result<ChangeHandle, TipError>;

    async fn get_session_change(
        &self,
        tip_session_id: &str,
        change_id: &str,
    ) -> Result<ChangeDetails, TipError>;

    async fn is_session_change_failed(
        &self,
        tip_session_id: &str,
        change_id: &str,
    ) -> Result<bool, TipError>;

    async fn delete_session(&self, tip_session_id: &str) -> Result<ChangeHandle, TipError>;

    async fn get_session(&self, tip_session_id: &str) -> Result<SessionDetails, TipError>;

    async fn set_node_state(
        &self,
        tip_session_id: &str,
        node_id: &str,
        state: &str,
    ) -> Result<(), TipError>;
}

/// First SKU the session offers that the node also supports.
pub fn preferred_vm_sku(session_skus: &[String], node_skus: &[String]) -> Option<String> {
    session_skus
        .iter()
        .find(|sku| node_skus.iter().any(|n| n.eq_ignore_ascii_case(sku)))
        .cloned()
}
