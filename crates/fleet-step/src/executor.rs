//! Step executor: one resumable invocation of a provider.
//!
//! The executor owns everything that is the same for every provider:
//! parameter validation, loading and persisting the step state, the
//! wall-clock deadline, retry classification, cancellation and
//! diagnostics. A provider only advances its own state machine.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fleet_core::config::{DEFAULT_MAXIMUM_CONSECUTIVE_FAILURES, DEFAULT_STEP_TIMEOUT};
use fleet_core::{ExecutionStatus, ExperimentComponent, params};
use fleet_state::StateExt;

use crate::context::{ExecutionResult, ExperimentContext};
use crate::diagnostics::{self, DiagnosticsContext, DiagnosticsRequest, DiagnosticsSink};
use crate::error::{ProviderError, ProviderResult};
use crate::retry::{FailureBudget, FailureClass, RetryPolicy};

/// Budget key for failures of the step as a whole.
const STEP_RESOURCE: &str = "step";

/// Persisted state of one step: the shared envelope plus the provider's own state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepState<T> {
    pub started_at: DateTime<Utc>,
    /// Absolute deadline, fixed on the first invocation.
    pub step_timeout: DateTime<Utc>,
    /// Configured timeout the deadline was computed from.
    pub timeout: Duration,
    /// Retryable failures absorbed so far.
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub failures: FailureBudget,
    pub provider: T,
}

impl<T> StepState<T> {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.step_timeout
    }
}

impl<T: Serialize> StepState<T> {
    /// Persist the state mid-round, ahead of a remote call that must not repeat.
    pub fn checkpoint(&self, ctx: &ExperimentContext) -> ProviderResult<()> {
        ctx.store
            .save_state_as(&ctx.experiment_id, &ctx.state_key(), self)?;
        Ok(())
    }
}

/// A step implementation driven by [`StepExecutor`].
#[async_trait]
pub trait StepProvider: Send + Sync {
    type State: Serialize + DeserializeOwned + Default + Send + Sync;

    /// Provider name used in logs and diagnostics.
    fn name(&self) -> &'static str;

    /// Check the provider's own parameters. Must not touch any collaborator.
    fn validate(&self, ctx: &ExperimentContext, component: &ExperimentComponent) -> ProviderResult<()>;

    /// Provider state for the first invocation of a step.
    fn initial_state(
        &self,
        _ctx: &ExperimentContext,
        _component: &ExperimentComponent,
    ) -> ProviderResult<Self::State> {
        Ok(Self::State::default())
    }

    /// Advance the step by one round.
    async fn execute_step(
        &self,
        ctx: &ExperimentContext,
        component: &ExperimentComponent,
        state: &mut StepState<Self::State>,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> ProviderResult<ExecutionStatus>;

    /// Release whatever the step holds. Called when the deadline has passed.
    async fn cleanup(
        &self,
        _ctx: &ExperimentContext,
        _component: &ExperimentComponent,
        _state: &mut StepState<Self::State>,
    ) -> ProviderResult<()> {
        Ok(())
    }

    fn diagnostics_context(&self, _state: &Self::State) -> DiagnosticsContext {
        DiagnosticsContext {
            issue_type: format!("{}Failure", self.name()),
            ..Default::default()
        }
    }
}

/// Return `Cancelled` if the token has fired.
pub fn ensure_not_cancelled(cancel: &CancellationToken) -> ProviderResult<()> {
    if cancel.is_cancelled() {
        Err(ProviderError::Cancelled)
    } else {
        Ok(())
    }
}

/// Runs a provider under the resumable invocation contract.
pub struct StepExecutor<P> {
    provider: P,
    policy: Arc<RetryPolicy>,
    diagnostics: Option<Arc<dyn DiagnosticsSink>>,
    diagnostics_by_default: bool,
    default_timeout: Duration,
    maximum_consecutive_failures: u32,
}

impl<P: StepProvider> StepExecutor<P> {
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            policy: Arc::new(RetryPolicy::default()),
            diagnostics: None,
            diagnostics_by_default: false,
            default_timeout: DEFAULT_STEP_TIMEOUT,
            maximum_consecutive_failures: DEFAULT_MAXIMUM_CONSECUTIVE_FAILURES,
        }
    }

    pub fn with_policy(mut self, policy: Arc<RetryPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_diagnostics(mut self, sink: Arc<dyn DiagnosticsSink>, enabled_by_default: bool) -> Self {
        self.diagnostics = Some(sink);
        self.diagnostics_by_default = enabled_by_default;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_maximum_consecutive_failures(mut self, maximum: u32) -> Self {
        self.maximum_consecutive_failures = maximum;
        self
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Run one invocation.
    ///
    /// Safe to call any number of times: the only effects are the ones the
    /// persisted state records.
    pub async fn execute(
        &self,
        ctx: &ExperimentContext,
        component: &ExperimentComponent,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let provider = self.provider.name();
        if cancel.is_cancelled() {
            info!(experiment = %ctx.experiment_id, step = %ctx.step_id, provider, "step cancelled before start");
            return ExecutionResult::cancelled();
        }

        if let Err(e) = self
            .validate_common(component)
            .and_then(|_| self.provider.validate(ctx, component))
        {
            warn!(experiment = %ctx.experiment_id, step = %ctx.step_id, provider, error = %e, "invalid step parameters");
            return self.fail(ctx, component, None, e).await;
        }

        let mut state = match self.load_or_create(ctx, component) {
            Ok(state) => state,
            Err(e) => return self.fail(ctx, component, None, e).await,
        };

        if state.is_expired(Utc::now()) {
            warn!(
                experiment = %ctx.experiment_id,
                step = %ctx.step_id,
                provider,
                deadline = %state.step_timeout,
                "step timeout exceeded, cleaning up"
            );
            if let Err(e) = self.provider.cleanup(ctx, component, &mut state).await {
                warn!(experiment = %ctx.experiment_id, step = %ctx.step_id, error = %e, "cleanup after timeout failed");
            }
            let error = match state.checkpoint(ctx) {
                Ok(()) => ProviderError::Timeout {
                    deadline: state.step_timeout,
                },
                Err(e) => e,
            };
            return self.fail(ctx, component, Some(&state), error).await;
        }

        let outcome = self
            .provider
            .execute_step(ctx, component, &mut state, &self.policy, cancel)
            .await;

        if cancel.is_cancelled() || matches!(outcome, Err(ProviderError::Cancelled)) {
            info!(experiment = %ctx.experiment_id, step = %ctx.step_id, provider, "step cancelled");
            return ExecutionResult::cancelled();
        }

        let result = match outcome {
            Ok(status) => {
                state.failures.record_success(STEP_RESOURCE);
                ExecutionResult::new(status)
            }
            Err(e) => match self.policy.classify(&e) {
                FailureClass::Retryable => {
                    state.retry_count += 1;
                    match state.failures.record_failure(STEP_RESOURCE, &e) {
                        Ok(count) => {
                            warn!(
                                experiment = %ctx.experiment_id,
                                step = %ctx.step_id,
                                provider,
                                count,
                                error = %e,
                                "transient failure, will retry"
                            );
                            ExecutionResult::new(ExecutionStatus::InProgress)
                        }
                        Err(escalated) => ExecutionResult::failed(escalated),
                    }
                }
                FailureClass::Terminal => ExecutionResult::failed(e),
            },
        };

        let result = match state.checkpoint(ctx) {
            Ok(()) => result,
            Err(e) => ExecutionResult::failed(e),
        };

        match result.error {
            Some(error) => self.fail(ctx, component, Some(&state), error).await,
            None => {
                debug!(experiment = %ctx.experiment_id, step = %ctx.step_id, provider, status = %result.status, "step invocation complete");
                result
            }
        }
    }

    fn validate_common(&self, component: &ExperimentComponent) -> ProviderResult<()> {
        if component.contains(params::TIMEOUT) {
            component.get_duration(params::TIMEOUT)?;
        }
        if component.contains(params::MAXIMUM_CONSECUTIVE_FAILURES) {
            let maximum = component.get_u32(params::MAXIMUM_CONSECUTIVE_FAILURES)?;
            if maximum == 0 {
                return Err(ProviderError::Schema(format!(
                    "{} must be at least 1",
                    params::MAXIMUM_CONSECUTIVE_FAILURES
                )));
            }
        }
        component.get_bool_or(params::ENABLE_DIAGNOSTICS, false)?;
        Ok(())
    }

    fn load_or_create(
        &self,
        ctx: &ExperimentContext,
        component: &ExperimentComponent,
    ) -> ProviderResult<StepState<P::State>> {
        let key = ctx.state_key();
        if let Some(state) = ctx
            .store
            .get_state_as::<StepState<P::State>>(&ctx.experiment_id, &key)?
        {
            return Ok(state);
        }

        let timeout = if component.contains(params::TIMEOUT) {
            component.get_duration(params::TIMEOUT)?
        } else {
            self.default_timeout
        };
        let maximum = if component.contains(params::MAXIMUM_CONSECUTIVE_FAILURES) {
            component.get_u32(params::MAXIMUM_CONSECUTIVE_FAILURES)?
        } else {
            self.maximum_consecutive_failures
        };
        let delta = chrono::Duration::from_std(timeout)
            .map_err(|_| ProviderError::Schema(format!("timeout {timeout:?} is out of range")))?;

        let now = Utc::now();
        let state = StepState {
            started_at: now,
            step_timeout: now + delta,
            timeout,
            retry_count: 0,
            failures: FailureBudget::new(maximum),
            provider: self.provider.initial_state(ctx, component)?,
        };
        ctx.store
            .save_state_as(&ctx.experiment_id, &key, &state)?;

        info!(
            experiment = %ctx.experiment_id,
            step = %ctx.step_id,
            provider = self.provider.name(),
            deadline = %state.step_timeout,
            "step state created"
        );
        Ok(state)
    }

    async fn fail(
        &self,
        ctx: &ExperimentContext,
        component: &ExperimentComponent,
        state: Option<&StepState<P::State>>,
        error: ProviderError,
    ) -> ExecutionResult {
        warn!(
            experiment = %ctx.experiment_id,
            step = %ctx.step_id,
            provider = self.provider.name(),
            reason = ?error.reason(),
            error = %error,
            "step failed"
        );

        let enabled = component
            .get_bool_or(params::ENABLE_DIAGNOSTICS, self.diagnostics_by_default)
            .unwrap_or(self.diagnostics_by_default);
        if let (true, Some(sink)) = (enabled, self.diagnostics.as_deref()) {
            let now = Utc::now();
            let (begin, context) = match state {
                Some(s) => (s.started_at, self.provider.diagnostics_context(&s.provider)),
                None => (now, self.provider.diagnostics_context(&P::State::default())),
            };
            let request = DiagnosticsRequest::new(
                &ctx.experiment_id,
                &ctx.step_id,
                self.provider.name(),
                (begin, now),
                &context,
                &error.to_string(),
            );
            diagnostics::emit(sink, request).await;
        }

        ExecutionResult::failed(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use fleet_state::{ExperimentStore, StateStore};

    use crate::error::ErrorReason;

    #[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
    struct CountingState {
        rounds: u32,
    }

    /// Provider that plays back scripted outcomes.
    #[derive(Default)]
    struct ScriptedProvider {
        outcomes: Mutex<VecDeque<ProviderResult<ExecutionStatus>>>,
        cleanups: AtomicU32,
        cancel_during_step: bool,
    }

    impl ScriptedProvider {
        fn with(outcomes: Vec<ProviderResult<ExecutionStatus>>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into()),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl StepProvider for ScriptedProvider {
        type State = CountingState;

        fn name(&self) -> &'static str {
            "Scripted"
        }

        fn validate(&self, _ctx: &ExperimentContext, component: &ExperimentComponent) -> ProviderResult<()> {
            component.get_u32("Required")?;
            Ok(())
        }

        async fn execute_step(
            &self,
            _ctx: &ExperimentContext,
            _component: &ExperimentComponent,
            state: &mut StepState<CountingState>,
            _policy: &RetryPolicy,
            cancel: &CancellationToken,
        ) -> ProviderResult<ExecutionStatus> {
            state.provider.rounds += 1;
            if self.cancel_during_step {
                cancel.cancel();
            }
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(ExecutionStatus::InProgress))
        }

        async fn cleanup(
            &self,
            _ctx: &ExperimentContext,
            _component: &ExperimentComponent,
            _state: &mut StepState<CountingState>,
        ) -> ProviderResult<()> {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        requests: Mutex<Vec<DiagnosticsRequest>>,
        fail: bool,
    }

    #[async_trait]
    impl DiagnosticsSink for RecordingSink {
        async fn submit(&self, request: DiagnosticsRequest) -> anyhow::Result<()> {
            self.requests.lock().unwrap().push(request);
            if self.fail {
                anyhow::bail!("triage service unavailable");
            }
            Ok(())
        }
    }

    fn context(store: &StateStore) -> ExperimentContext {
        ExperimentContext::new(
            "exp-1",
            "step-1",
            vec!["Group A".to_string()],
            Arc::new(store.clone()),
        )
    }

    fn component() -> ExperimentComponent {
        ExperimentComponent::new("Scripted")
            .with_parameter("Required", 1)
            .with_parameter(params::TIMEOUT, "00:10:00")
    }

    fn load(store: &StateStore) -> Option<StepState<CountingState>> {
        store.get_state_as("exp-1", "state-step-1").unwrap()
    }

    #[tokio::test]
    async fn schema_failure_happens_before_state_exists() {
        let store = StateStore::open_in_memory().unwrap();
        let executor = StepExecutor::new(ScriptedProvider::default());

        let result = executor
            .execute(&context(&store), &ExperimentComponent::new("Scripted"), &CancellationToken::new())
            .await;

        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.error.unwrap().reason(), ErrorReason::SchemaInvalid);
        assert!(load(&store).is_none());
    }

    #[tokio::test]
    async fn malformed_timeout_is_a_schema_error() {
        let store = StateStore::open_in_memory().unwrap();
        let executor = StepExecutor::new(ScriptedProvider::default());
        let component = component().with_parameter(params::TIMEOUT, "later");

        let result = executor
            .execute(&context(&store), &component, &CancellationToken::new())
            .await;
        assert_eq!(result.error.unwrap().reason(), ErrorReason::SchemaInvalid);
    }

    #[tokio::test]
    async fn deadline_is_computed_once() {
        let store = StateStore::open_in_memory().unwrap();
        let executor = StepExecutor::new(ScriptedProvider::default());
        let ctx = context(&store);

        let first = executor.execute(&ctx, &component(), &CancellationToken::new()).await;
        assert_eq!(first.status, ExecutionStatus::InProgress);
        let state = load(&store).unwrap();
        assert_eq!(state.timeout, Duration::from_secs(600));
        assert_eq!(state.step_timeout - state.started_at, chrono::Duration::seconds(600));

        executor.execute(&ctx, &component(), &CancellationToken::new()).await;
        let again = load(&store).unwrap();
        assert_eq!(again.step_timeout, state.step_timeout);
        assert_eq!(again.provider.rounds, 2);
    }

    #[tokio::test]
    async fn expired_deadline_cleans_up_and_fails() {
        let store = StateStore::open_in_memory().unwrap();
        let ctx = context(&store);
        let past = Utc::now() - chrono::Duration::minutes(5);
        let state = StepState {
            started_at: past - chrono::Duration::minutes(10),
            step_timeout: past,
            timeout: Duration::from_secs(600),
            retry_count: 0,
            failures: FailureBudget::new(3),
            provider: CountingState::default(),
        };
        store.save_state_as("exp-1", "state-step-1", &state).unwrap();

        let executor = StepExecutor::new(ScriptedProvider::default());
        let result = executor.execute(&ctx, &component(), &CancellationToken::new()).await;

        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.error.unwrap().reason(), ErrorReason::StepTimeout);
        assert_eq!(executor.provider().cleanups.load(Ordering::SeqCst), 1);
        // No new round was attempted.
        assert_eq!(load(&store).unwrap().provider.rounds, 0);
    }

    #[tokio::test]
    async fn transient_failures_retry_then_escalate() {
        let store = StateStore::open_in_memory().unwrap();
        let ctx = context(&store);
        let transient = || Err(ProviderError::RemoteRequest("connection reset by peer".to_string()));
        let executor = StepExecutor::new(ScriptedProvider::with(vec![transient(), transient(), transient()]))
            .with_maximum_consecutive_failures(3);

        for expected_retries in 1..=2 {
            let result = executor.execute(&ctx, &component(), &CancellationToken::new()).await;
            assert_eq!(result.status, ExecutionStatus::InProgress);
            assert_eq!(load(&store).unwrap().retry_count, expected_retries);
        }

        let result = executor.execute(&ctx, &component(), &CancellationToken::new()).await;
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.error.unwrap().reason(), ErrorReason::ConsecutiveFailureLimit);
    }

    #[tokio::test]
    async fn success_resets_step_failure_streak() {
        let store = StateStore::open_in_memory().unwrap();
        let ctx = context(&store);
        let transient = || Err(ProviderError::RemoteRequest("503 Service Unavailable".to_string()));
        let executor = StepExecutor::new(ScriptedProvider::with(vec![
            transient(),
            Ok(ExecutionStatus::InProgress),
            transient(),
        ]))
        .with_maximum_consecutive_failures(2);

        for _ in 0..3 {
            let result = executor.execute(&ctx, &component(), &CancellationToken::new()).await;
            assert_eq!(result.status, ExecutionStatus::InProgress);
        }
        assert_eq!(load(&store).unwrap().retry_count, 2);
    }

    #[tokio::test]
    async fn terminal_failure_is_surfaced_verbatim() {
        let store = StateStore::open_in_memory().unwrap();
        let executor = StepExecutor::new(ScriptedProvider::with(vec![Err(
            ProviderError::ResourceExhaustion("no partition left".to_string()),
        )]));

        let result = executor
            .execute(&context(&store), &component(), &CancellationToken::new())
            .await;
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(
            result.error.unwrap().reason(),
            ErrorReason::ExpectedEnvironmentEntitiesNotFound
        );
        // State is persisted regardless of outcome.
        assert_eq!(load(&store).unwrap().provider.rounds, 1);
    }

    #[tokio::test]
    async fn cancellation_before_start_touches_nothing() {
        let store = StateStore::open_in_memory().unwrap();
        let executor = StepExecutor::new(ScriptedProvider::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = executor.execute(&context(&store), &component(), &cancel).await;
        assert_eq!(result.status, ExecutionStatus::Cancelled);
        assert!(result.error.is_none());
        assert!(load(&store).is_none());
    }

    #[tokio::test]
    async fn cancellation_during_step_skips_persisting_the_round() {
        let store = StateStore::open_in_memory().unwrap();
        let ctx = context(&store);
        let executor = StepExecutor::new(ScriptedProvider {
            cancel_during_step: true,
            ..Default::default()
        });

        let result = executor.execute(&ctx, &component(), &CancellationToken::new()).await;
        assert_eq!(result.status, ExecutionStatus::Cancelled);
        assert_eq!(executor.provider().cleanups.load(Ordering::SeqCst), 0);
        assert_eq!(load(&store).unwrap().provider.rounds, 0);
    }

    #[tokio::test]
    async fn diagnostics_emitted_on_failure_when_enabled() {
        let store = StateStore::open_in_memory().unwrap();
        let sink = Arc::new(RecordingSink {
            fail: true,
            ..Default::default()
        });
        let executor = StepExecutor::new(ScriptedProvider::with(vec![Err(
            ProviderError::RemoteRequest("session quota exceeded".to_string()),
        )]))
        .with_diagnostics(sink.clone(), false);
        let component = component().with_parameter(params::ENABLE_DIAGNOSTICS, true);

        let result = executor
            .execute(&context(&store), &component, &CancellationToken::new())
            .await;

        // A failing sink does not change the outcome.
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.error.unwrap().reason(), ErrorReason::RemoteRequestFailed);
        let requests = sink.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].experiment_id, "exp-1");
        assert_eq!(requests[0].issue_type, "ScriptedFailure");
        assert_eq!(requests[0].context["ProviderName"], "Scripted");
    }

    #[tokio::test]
    async fn diagnostics_not_emitted_when_disabled() {
        let store = StateStore::open_in_memory().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let executor = StepExecutor::new(ScriptedProvider::with(vec![Err(
            ProviderError::RemoteRequest("rejected".to_string()),
        )]))
        .with_diagnostics(sink.clone(), false);

        executor
            .execute(&context(&store), &component(), &CancellationToken::new())
            .await;
        assert!(sink.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn state_is_keyed_by_step() {
        let store = StateStore::open_in_memory().unwrap();
        let executor = StepExecutor::new(ScriptedProvider::default());
        executor
            .execute(&context(&store), &component(), &CancellationToken::new())
            .await;

        assert_eq!(store.list_state_keys("exp-1").unwrap(), vec!["state-step-1"]);
        assert!(store.get_state("exp-1", "state-step-2").unwrap().is_none());
    }
}
