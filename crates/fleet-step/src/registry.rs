//! Step type registry.
//!
//! Maps the `step_type` of an experiment component to the handler that
//! executes it.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use fleet_core::ExperimentComponent;

use crate::context::{ExecutionResult, ExperimentContext};
use crate::error::ProviderError;
use crate::executor::{StepExecutor, StepProvider};

/// Something that can run one invocation of a step type.
#[async_trait]
pub trait StepHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(
        &self,
        ctx: &ExperimentContext,
        component: &ExperimentComponent,
        cancel: &CancellationToken,
    ) -> ExecutionResult;
}

#[async_trait]
impl<P> StepHandler for StepExecutor<P>
where
    P: StepProvider + 'static,
{
    fn name(&self) -> &'static str {
        self.provider().name()
    }

    async fn execute(
        &self,
        ctx: &ExperimentContext,
        component: &ExperimentComponent,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        StepExecutor::execute(self, ctx, component, cancel).await
    }
}

#[derive(Default)]
pub struct StepRegistry {
    handlers: BTreeMap<&'static str, Box<dyn StepHandler>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its own name, replacing any previous one.
    pub fn register(&mut self, handler: Box<dyn StepHandler>) {
        self.handlers.insert(handler.name(), handler);
    }

    pub fn get(&self, step_type: &str) -> Option<&dyn StepHandler> {
        self.handlers.get(step_type).map(|h| h.as_ref())
    }

    pub fn step_types(&self) -> Vec<&'static str> {
        self.handlers.keys().copied().collect()
    }

    /// Dispatch on `component.step_type`. Unknown types fail validation.
    pub async fn execute(
        &self,
        ctx: &ExperimentContext,
        component: &ExperimentComponent,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        match self.get(&component.step_type) {
            Some(handler) => handler.execute(ctx, component, cancel).await,
            None => {
                warn!(step_type = %component.step_type, "no handler registered");
                ExecutionResult::failed(ProviderError::Schema(format!(
                    "unsupported step type '{}'",
                    component.step_type
                )))
            }
        }
    }
}
