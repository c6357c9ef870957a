//! TiP session teardown.
//!
//! Deletes the sessions recorded in the provisioned set one per
//! invocation, removing each node/session pair as it goes.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

use fleet_core::{ExecutionStatus, ExperimentComponent};
use fleet_state::EntityKey;
use fleet_step::{
    DiagnosticsContext, ExperimentContext, ProviderResult, RetryPolicy, StepProvider, StepState,
    ensure_not_cancelled,
};

use crate::client::{TipClient, TipError};

pub const STEP_TYPE: &str = "TipTeardown";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TipTeardownState {
    /// Sessions deleted so far, in order.
    #[serde(default)]
    pub deleted: Vec<String>,
}

pub struct TipTeardown {
    client: Arc<dyn TipClient>,
}

impl TipTeardown {
    pub fn new(client: Arc<dyn TipClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StepProvider for TipTeardown {
    type State = TipTeardownState;

    fn name(&self) -> &'static str {
        STEP_TYPE
    }

    fn validate(&self, _ctx: &ExperimentContext, _component: &ExperimentComponent) -> ProviderResult<()> {
        Ok(())
    }

    async fn execute_step(
        &self,
        ctx: &ExperimentContext,
        _component: &ExperimentComponent,
        state: &mut StepState<TipTeardownState>,
        _policy: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> ProviderResult<ExecutionStatus> {
        ensure_not_cancelled(cancel)?;
        let provisioned = ctx.store.get_entities_provisioned(&ctx.experiment_id)?;
        let Some(session) = provisioned.tip_sessions().next() else {
            info!(experiment = %ctx.experiment_id, deleted = state.provider.deleted.len(), "no TiP sessions left");
            return Ok(ExecutionStatus::Succeeded);
        };
        let session_id = session.id.clone();
        let node_id = session.node_id()?.to_string();

        match self.client.delete_session(&session_id).await {
            Ok(handle) => {
                info!(
                    experiment = %ctx.experiment_id,
                    session = %session_id,
                    node = %node_id,
                    change = %handle.change_id,
                    "TiP session delete requested"
                );
            }
            Err(TipError::SessionNotFound(_)) => {
                info!(session = %session_id, "TiP session already gone");
            }
            Err(e) => return Err(e.into()),
        }
        ensure_not_cancelled(cancel)?;

        ctx.store.remove_entities_provisioned(
            &ctx.experiment_id,
            &[EntityKey::tip_session(&session_id), EntityKey::node(&node_id)],
        )?;
        state.provider.deleted.push(session_id);

        let remaining = ctx
            .store
            .get_entities_provisioned(&ctx.experiment_id)?
            .tip_sessions()
            .count();
        if remaining == 0 {
            info!(experiment = %ctx.experiment_id, deleted = state.provider.deleted.len(), "TiP teardown complete");
            Ok(ExecutionStatus::Succeeded)
        } else {
            Ok(ExecutionStatus::InProgressContinue)
        }
    }

    fn diagnostics_context(&self, state: &TipTeardownState) -> DiagnosticsContext {
        DiagnosticsContext {
            issue_type: "TipSessionTeardownFailure".to_string(),
            node_ids: Vec::new(),
            tip_session_ids: state.deleted.clone(),
        }
    }
}
