//! Invocation context and result.

use std::fmt;
use std::sync::Arc;

use fleet_core::ExecutionStatus;
use fleet_state::ExperimentStore;

use crate::error::ProviderError;

/// What a step invocation knows about the experiment it runs in.
#[derive(Clone)]
pub struct ExperimentContext {
    pub experiment_id: String,
    pub step_id: String,
    /// Experiment group names in declaration order.
    pub groups: Vec<String>,
    pub store: Arc<dyn ExperimentStore>,
}

impl ExperimentContext {
    pub fn new(
        experiment_id: &str,
        step_id: &str,
        groups: Vec<String>,
        store: Arc<dyn ExperimentStore>,
    ) -> Self {
        Self {
            experiment_id: experiment_id.to_string(),
            step_id: step_id.to_string(),
            groups,
            store,
        }
    }

    /// Key the step's provider state is persisted under.
    pub fn state_key(&self) -> String {
        format!("state-{}", self.step_id)
    }
}

impl fmt::Debug for ExperimentContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExperimentContext")
            .field("experiment_id", &self.experiment_id)
            .field("step_id", &self.step_id)
            .field("groups", &self.groups)
            .finish_non_exhaustive()
    }
}

/// Outcome of one invocation. `Failed` always carries an error.
#[derive(Debug)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub error: Option<ProviderError>,
}

impl ExecutionResult {
    pub fn new(status: ExecutionStatus) -> Self {
        Self {
            status,
            error: None,
        }
    }

    pub fn failed(error: ProviderError) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            error: Some(error),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(ExecutionStatus::Cancelled)
    }
}
