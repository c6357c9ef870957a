//! Shared fixtures: a scripted in-memory TiP service and a step harness.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio_util::sync::CancellationToken;

use fleet_core::ExperimentComponent;
use fleet_state::{EntitySet, EnvironmentEntity, ExperimentStore, NodeMetadata, StateStore};
use fleet_step::{ExecutionResult, ExperimentContext, StepExecutor, StepProvider};
use fleet_tip::{
    ChangeDetails, ChangeHandle, ChangeStatus, SessionDetails, TipClient, TipError,
    TipSessionRequest,
};

pub const EXPERIMENT: &str = "exp-1";
pub const STEP: &str = "step-1";

/// What the next poll of a node's change reports.
#[derive(Debug, Clone)]
pub enum Poll {
    Running,
    Succeed,
    Fail,
    Error(&'static str),
}

#[derive(Debug)]
struct FakeSession {
    node_id: String,
    change_id: String,
    failed: bool,
}

#[derive(Default)]
struct Inner {
    next_id: u32,
    sessions: BTreeMap<String, FakeSession>,
    plans: BTreeMap<String, VecDeque<Poll>>,
    rejected: BTreeSet<String>,
    requests: Vec<TipSessionRequest>,
    deleted: Vec<String>,
    node_states: Vec<(String, String, String)>,
}

/// In-memory TiP service. Polls succeed unless a node has a plan.
#[derive(Default)]
pub struct FakeTip {
    inner: Mutex<Inner>,
}

impl FakeTip {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Script the poll outcomes for sessions created on `node_id`.
    pub fn plan(&self, node_id: &str, polls: Vec<Poll>) {
        self.inner
            .lock()
            .unwrap()
            .plans
            .insert(node_id.to_string(), polls.into());
    }

    /// Reject create requests for `node_id`.
    pub fn reject(&self, node_id: &str) {
        self.inner.lock().unwrap().rejected.insert(node_id.to_string());
    }

    pub fn requested_nodes(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .requests
            .iter()
            .map(|r| r.node_id.clone())
            .collect()
    }

    pub fn requests(&self) -> Vec<TipSessionRequest> {
        self.inner.lock().unwrap().requests.clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.inner.lock().unwrap().deleted.clone()
    }

    pub fn node_states(&self) -> Vec<(String, String, String)> {
        self.inner.lock().unwrap().node_states.clone()
    }

    /// Session id created for a node, if any.
    pub fn session_for(&self, node_id: &str) -> Option<String> {
        self.inner
            .lock()
            .unwrap()
            .sessions
            .iter()
            .find(|(_, s)| s.node_id == node_id)
            .map(|(id, _)| id.clone())
    }
}

#[async_trait]
impl TipClient for FakeTip {
    async fn create_session(&self, request: &TipSessionRequest) -> Result<ChangeHandle, TipError> {
        let mut inner = self.inner.lock().unwrap();
        inner.requests.push(request.clone());
        if inner.rejected.contains(&request.node_id) {
            return Err(TipError::Request(format!(
                "node {} is not eligible for a TiP session",
                request.node_id
            )));
        }
        inner.next_id += 1;
        let handle = ChangeHandle {
            tip_session_id: format!("tip-{}", inner.next_id),
            change_id: format!("chg-{}", inner.next_id),
        };
        inner.sessions.insert(
            handle.tip_session_id.clone(),
            FakeSession {
                node_id: request.node_id.clone(),
                change_id: handle.change_id.clone(),
                failed: false,
            },
        );
        Ok(handle)
    }

    async fn get_session_change(&self, tip_session_id: &str, change_id: &str) -> Result<ChangeDetails, TipError> {
        let mut inner = self.inner.lock().unwrap();
        let node_id = match inner.sessions.get(tip_session_id) {
            Some(s) if s.change_id == change_id => s.node_id.clone(),
            _ => return Err(TipError::SessionNotFound(tip_session_id.to_string())),
        };
        let poll = inner
            .plans
            .get_mut(&node_id)
            .and_then(|p| p.pop_front())
            .unwrap_or(Poll::Succeed);

        let (status, failed) = match poll {
            Poll::Running => (ChangeStatus::Running, false),
            Poll::Succeed => (ChangeStatus::Finished, false),
            Poll::Fail => (ChangeStatus::Finished, true),
            Poll::Error(message) => return Err(TipError::Request(message.to_string())),
        };
        if let Some(session) = inner.sessions.get_mut(tip_session_id) {
            session.failed = failed;
        }
        Ok(ChangeDetails {
            status,
            result: failed.then(|| "allocation failed on node".to_string()),
        })
    }

    async fn is_session_change_failed(&self, tip_session_id: &str, _change_id: &str) -> Result<bool, TipError> {
        let inner = self.inner.lock().unwrap();
        inner
            .sessions
            .get(tip_session_id)
            .map(|s| s.failed)
            .ok_or_else(|| TipError::SessionNotFound(tip_session_id.to_string()))
    }

    async fn delete_session(&self, tip_session_id: &str) -> Result<ChangeHandle, TipError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.sessions.remove(tip_session_id).is_none() {
            return Err(TipError::SessionNotFound(tip_session_id.to_string()));
        }
        inner.deleted.push(tip_session_id.to_string());
        Ok(ChangeHandle {
            tip_session_id: tip_session_id.to_string(),
            change_id: format!("del-{tip_session_id}"),
        })
    }

    async fn get_session(&self, tip_session_id: &str) -> Result<SessionDetails, TipError> {
        let now = Utc::now();
        Ok(SessionDetails {
            tip_session_id: tip_session_id.to_string(),
            created_time_utc: Some(now),
            expiration_time_utc: Some(now + Duration::days(1)),
            supported_vm_skus: vec!["Standard_D2".to_string(), "Standard_E4".to_string()],
        })
    }

    async fn set_node_state(&self, tip_session_id: &str, node_id: &str, state: &str) -> Result<(), TipError> {
        self.inner.lock().unwrap().node_states.push((
            tip_session_id.to_string(),
            node_id.to_string(),
            state.to_string(),
        ));
        Ok(())
    }
}

pub fn groups() -> Vec<String> {
    vec!["Group A".to_string(), "Group B".to_string()]
}

pub fn node(id: &str, group: &str, cluster: &str, rack: &str) -> EnvironmentEntity {
    EnvironmentEntity::node(
        id,
        group,
        NodeMetadata {
            cluster_name: Some(cluster.to_string()),
            rack_location: Some(rack.to_string()),
            region: Some("eastus".to_string()),
            machine_pool_name: Some(format!("{cluster}-pool")),
            supported_vm_skus: vec!["Standard_E4".to_string(), "Standard_F8".to_string()],
            ..Default::default()
        },
    )
}

/// A store, a context and a fake service wired together.
pub struct Harness {
    pub store: StateStore,
    pub ctx: ExperimentContext,
    pub tip: Arc<FakeTip>,
}

impl Harness {
    pub fn new(groups: Vec<String>, pool: Vec<EnvironmentEntity>) -> Self {
        Self::with_store(StateStore::open_in_memory().unwrap(), groups, pool)
    }

    pub fn with_store(store: StateStore, groups: Vec<String>, pool: Vec<EnvironmentEntity>) -> Self {
        let pool: EntitySet = pool.into_iter().collect();
        if !pool.is_empty() {
            store.save_entity_pool(EXPERIMENT, &pool).unwrap();
        }
        let ctx = ExperimentContext::new(EXPERIMENT, STEP, groups, Arc::new(store.clone()));
        Self {
            store,
            ctx,
            tip: FakeTip::new(),
        }
    }

    pub fn pool(&self) -> EntitySet {
        self.store.get_entity_pool(EXPERIMENT).unwrap()
    }

    pub fn provisioned(&self) -> EntitySet {
        self.store.get_entities_provisioned(EXPERIMENT).unwrap()
    }

    pub fn discarded(&self) -> Vec<String> {
        self.pool()
            .nodes()
            .filter(|n| n.discarded)
            .map(|n| n.id.clone())
            .collect()
    }
}

/// Invoke until a terminal status or `limit` invocations.
pub async fn run_to_end<P: StepProvider>(
    executor: &StepExecutor<P>,
    ctx: &ExperimentContext,
    component: &ExperimentComponent,
    limit: usize,
) -> (ExecutionResult, usize) {
    let cancel = CancellationToken::new();
    let mut invocations = 0;
    loop {
        let result = executor.execute(ctx, component, &cancel).await;
        invocations += 1;
        if result.status.is_terminal() || invocations >= limit {
            return (result, invocations);
        }
    }
}
