//! TiP session provisioning orchestrator.
//!
//! Every invocation makes one pass over the step state:
//!
//! 1. **Confirm**: poll each requested session's change. A finished,
//!    successful change commits the node/session pair to the provisioned
//!    set. A failed change discards the node in the pool.
//! 2. **Fill**: ask the affinity selector for nodes covering every row's
//!    missing groups at once, valid relative to what the step already
//!    holds, and issue create requests. A node is recorded as attempted
//!    before its request goes out, so a resumed invocation never asks
//!    twice.
//! 3. **Complete**: once every row is committed, apply the node state
//!    (if any), verify pairing and report success.
//!
//! `SameCluster`/`SameRack` steps are pinned to one partition. When that
//! partition can no longer supply the missing groups, every row is torn
//! down and the step re-selects from another partition. When no partition
//! can supply them, the candidates are exhausted and the step fails.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fleet_affinity::{Pick, SelectionError, select_rows, usable_candidates};
use fleet_core::{ExecutionStatus, ExperimentComponent, NodeAffinity, params};
use fleet_state::{EntityKey, EntitySet, EnvironmentEntity, TipSession, TipSessionStatus};
use fleet_step::{
    DiagnosticsContext, ExperimentContext, FailureClass, ProviderError, ProviderResult,
    RetryPolicy, StepProvider, StepState, ensure_not_cancelled,
};

use crate::client::{
    ChangeStatus, SessionDetails, TipClient, TipError, TipSessionRequest, preferred_vm_sku,
};
use crate::state::{Member, MemberStatus, TipProvisioningState};

pub const STEP_TYPE: &str = "TipProvisioning";

/// Parameters read from the component on every invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Settings {
    affinity: NodeAffinity,
    count_per_group: u32,
    feature_flag: Option<String>,
    node_state: Option<String>,
}

impl Settings {
    fn from_component(component: &ExperimentComponent) -> ProviderResult<Self> {
        let affinity = if component.contains(params::NODE_AFFINITY) {
            component.get_affinity(params::NODE_AFFINITY)?
        } else {
            NodeAffinity::Any
        };
        let count_per_group = if component.contains(params::COUNT_PER_GROUP) {
            component.get_u32(params::COUNT_PER_GROUP)?
        } else {
            1
        };
        if count_per_group == 0 {
            return Err(ProviderError::Schema(format!(
                "{} must be at least 1",
                params::COUNT_PER_GROUP
            )));
        }
        Ok(Self {
            affinity,
            count_per_group,
            feature_flag: component.get_optional_string(params::FEATURE_FLAG)?,
            node_state: component.get_optional_string(params::NODE_STATE)?,
        })
    }
}

/// Inputs shared by every phase of one invocation.
struct Round<'a> {
    ctx: &'a ExperimentContext,
    settings: Settings,
    policy: &'a RetryPolicy,
    cancel: &'a CancellationToken,
}

/// The row a picked node is requested for.
struct Placement<'a> {
    row: usize,
    pick: &'a Pick,
}

/// Result of polling one requested session.
enum Confirmation {
    Pending,
    Created(SessionDetails),
    Failed(String),
}

/// Provisions `CountPerGroup` paired TiP sessions per experiment group.
pub struct TipProvisioning {
    client: Arc<dyn TipClient>,
}

impl TipProvisioning {
    pub fn new(client: Arc<dyn TipClient>) -> Self {
        Self { client }
    }

    async fn advance(
        &self,
        round: &Round<'_>,
        state: &mut StepState<TipProvisioningState>,
    ) -> ProviderResult<ExecutionStatus> {
        let ctx = round.ctx;
        ensure_not_cancelled(round.cancel)?;
        self.confirm_requested(round, state).await?;

        if self.fill_rows(round, state).await? {
            return Ok(ExecutionStatus::InProgressContinue);
        }
        if !state.provider.is_complete(&ctx.groups) {
            return Ok(ExecutionStatus::InProgress);
        }

        if let Some(node_state) = &round.settings.node_state {
            if !self.apply_node_state(round, state, node_state).await? {
                return Ok(ExecutionStatus::InProgress);
            }
        }

        let provisioned = ctx.store.get_entities_provisioned(&ctx.experiment_id)?;
        provisioned.verify_pairing()?;

        info!(
            experiment = %ctx.experiment_id,
            step = %ctx.step_id,
            sessions = state.provider.committed().count(),
            attempted = state.provider.nodes_attempted.len(),
            partition = ?state.provider.partition,
            "all TiP sessions committed"
        );
        Ok(ExecutionStatus::Succeeded)
    }

    // ── Confirm ───────────────────────────────────────────────────

    async fn confirm_requested(
        &self,
        round: &Round<'_>,
        state: &mut StepState<TipProvisioningState>,
    ) -> ProviderResult<()> {
        let ctx = round.ctx;
        for idx in 0..state.provider.slots.len() {
            let pending: Vec<(String, Member)> = state.provider.slots[idx]
                .members
                .iter()
                .filter(|(_, m)| m.status == MemberStatus::Requested)
                .map(|(g, m)| (g.clone(), m.clone()))
                .collect();

            for (group, member) in pending {
                ensure_not_cancelled(round.cancel)?;
                let outcome = self.confirm(&member).await;
                ensure_not_cancelled(round.cancel)?;

                match outcome {
                    Ok(Confirmation::Pending) => {
                        debug!(node = %member.node_id, session = %member.tip_session_id, "session change still running");
                    }
                    Ok(Confirmation::Created(details)) => {
                        self.commit(ctx, &group, &member, &details).await?;
                        state.failures.record_success(&member.node_id);
                        if let Some(m) = state.provider.slots[idx].members.get_mut(&group) {
                            m.status = MemberStatus::Committed;
                        }
                    }
                    Ok(Confirmation::Failed(reason)) => {
                        warn!(
                            experiment = %ctx.experiment_id,
                            node = %member.node_id,
                            session = %member.tip_session_id,
                            %reason,
                            "TiP session creation failed, discarding node"
                        );
                        discard_node(ctx, &member.node_id)?;
                        ctx.store
                            .remove_entities_provisioned(&ctx.experiment_id, &member.entity_keys())?;
                        state.provider.slots[idx].remove(&group);
                    }
                    Err(e) => {
                        let e = ProviderError::from(e);
                        if round.policy.classify(&e) == FailureClass::Terminal {
                            return Err(e);
                        }
                        state.retry_count += 1;
                        let count = state.failures.record_failure(&member.node_id, &e)?;
                        warn!(
                            node = %member.node_id,
                            session = %member.tip_session_id,
                            count,
                            error = %e,
                            "transient failure confirming session, will poll again"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    async fn confirm(&self, member: &Member) -> Result<Confirmation, TipError> {
        let change = self
            .client
            .get_session_change(&member.tip_session_id, &member.change_id)
            .await?;
        if change.status != ChangeStatus::Finished {
            return Ok(Confirmation::Pending);
        }
        if self
            .client
            .is_session_change_failed(&member.tip_session_id, &member.change_id)
            .await?
        {
            let reason = change.result.unwrap_or_else(|| "change reported failure".to_string());
            return Ok(Confirmation::Failed(reason));
        }
        let details = self.client.get_session(&member.tip_session_id).await?;
        Ok(Confirmation::Created(details))
    }

    /// Add the node/session pair to the provisioned set.
    async fn commit(
        &self,
        ctx: &ExperimentContext,
        group: &str,
        member: &Member,
        details: &SessionDetails,
    ) -> ProviderResult<()> {
        let pool = ctx.store.get_entity_pool(&ctx.experiment_id)?;
        let mut node = pool
            .get(&EntityKey::node(&member.node_id))
            .cloned()
            .ok_or_else(|| {
                ProviderError::ResourceExhaustion(format!(
                    "node {} is no longer in the entity pool",
                    member.node_id
                ))
            })?;
        node.link_tip_session(
            &member.tip_session_id,
            TipSessionStatus::Created,
            Some(&member.change_id),
        )?;

        let session = TipSession {
            tip_session_id: member.tip_session_id.clone(),
            cluster_name: node.cluster_name()?.to_string(),
            region: node.region()?.to_string(),
            node_id: member.node_id.clone(),
            group_name: group.to_string(),
            change_id_list: vec![member.change_id.clone()],
            status: TipSessionStatus::Created,
            created_time_utc: details.created_time_utc,
            expiration_time_utc: details.expiration_time_utc,
            deleted_time_utc: None,
            supported_vm_skus: details.supported_vm_skus.clone(),
            preferred_vm_sku: preferred_vm_sku(&details.supported_vm_skus, node.supported_vm_skus()),
        };

        ctx.store.update_entities_provisioned(
            &ctx.experiment_id,
            &[node, EnvironmentEntity::tip_session(session)],
        )?;
        info!(
            experiment = %ctx.experiment_id,
            group,
            node = %member.node_id,
            session = %member.tip_session_id,
            "TiP session committed"
        );
        Ok(())
    }

    // ── Fill ──────────────────────────────────────────────────────

    /// Request nodes for every row still missing groups. Returns whether
    /// the rows were torn down to switch partition.
    async fn fill_rows(
        &self,
        round: &Round<'_>,
        state: &mut StepState<TipProvisioningState>,
    ) -> ProviderResult<bool> {
        let ctx = round.ctx;
        let affinity = state.provider.node_affinity;
        let shortfall = state.provider.shortfall(&ctx.groups);
        if shortfall.is_empty() {
            return Ok(false);
        }
        // Nothing held, nothing to stay next to.
        if state.provider.is_empty() {
            state.provider.partition = None;
        }

        let mut pool = ctx.store.get_entity_pool(&ctx.experiment_id)?;
        let candidates = usable_candidates(
            &pool,
            &ctx.groups,
            &state.provider.nodes_attempted,
            affinity,
        )
        .map_err(|e| match e {
            SelectionError::Entity(e) => ProviderError::Entity(e),
        })?;

        let missing: Vec<Vec<String>> = shortfall.iter().map(|(_, groups)| groups.clone()).collect();
        let Some(assignments) = select_rows(&candidates, &missing, affinity, &state.provider.anchor()) else {
            if state.provider.has_pending() {
                debug!(
                    experiment = %ctx.experiment_id,
                    rows = shortfall.len(),
                    "missing groups cannot be served yet, waiting on pending requests"
                );
                return Ok(false);
            }
            if let Some(partition) = state.provider.partition.clone() {
                warn!(
                    experiment = %ctx.experiment_id,
                    %partition,
                    "partition can no longer supply the missing groups, releasing every row to switch"
                );
                self.release_all(ctx, &mut state.provider).await;
                return Ok(true);
            }
            return Err(ProviderError::ResourceExhaustion(format!(
                "no {affinity} candidates left for {} missing sessions (attempted {} nodes)",
                missing.iter().map(Vec::len).sum::<usize>(),
                state.provider.nodes_attempted.len()
            )));
        };

        for ((row, _), assignment) in shortfall.iter().zip(&assignments) {
            if assignment.partition.is_some() {
                state.provider.partition = assignment.partition.clone();
            }
            for pick in &assignment.picks {
                self.request(round, state, &mut pool, Placement { row: *row, pick })
                    .await?;
            }
        }
        Ok(false)
    }

    async fn request(
        &self,
        round: &Round<'_>,
        state: &mut StepState<TipProvisioningState>,
        pool: &mut EntitySet,
        placement: Placement<'_>,
    ) -> ProviderResult<()> {
        let ctx = round.ctx;
        let (group, node_id) = (placement.pick.group.as_str(), placement.pick.node_id.as_str());
        let node = pool.get(&EntityKey::node(node_id)).ok_or_else(|| {
            ProviderError::ResourceExhaustion(format!("node {node_id} is no longer in the entity pool"))
        })?;
        let request = TipSessionRequest::for_node(node, round.settings.feature_flag.as_deref())?;
        let cluster_name = node.cluster_name().ok().map(str::to_string);

        state.provider.nodes_attempted.insert(node_id.to_string());
        state.checkpoint(ctx)?;

        ensure_not_cancelled(round.cancel)?;
        // An issued request is recorded even when cancelled mid-call.
        match self.client.create_session(&request).await {
            Ok(handle) => {
                info!(
                    experiment = %ctx.experiment_id,
                    row = placement.row,
                    group,
                    node = node_id,
                    session = %handle.tip_session_id,
                    change = %handle.change_id,
                    "TiP session requested"
                );
                state.provider.slots[placement.row].insert(
                    group,
                    Member {
                        node_id: node_id.to_string(),
                        cluster_name,
                        tip_session_id: handle.tip_session_id,
                        change_id: handle.change_id,
                        status: MemberStatus::Requested,
                    },
                );
            }
            Err(e) => {
                let e = ProviderError::from(e);
                if round.policy.classify(&e) == FailureClass::Retryable {
                    state.retry_count += 1;
                    let count = state.failures.record_failure(group, &e)?;
                    warn!(group, node = node_id, count, error = %e, "transient failure requesting session");
                } else {
                    warn!(group, node = node_id, error = %e, "session request rejected, discarding node");
                    if let Some(entity) = pool.get_mut(&EntityKey::node(node_id)) {
                        entity.discarded = true;
                    }
                    ctx.store.save_entity_pool(&ctx.experiment_id, pool)?;
                }
            }
        }
        state.checkpoint(ctx)?;
        ensure_not_cancelled(round.cancel)
    }

    // ── Complete ──────────────────────────────────────────────────

    /// Apply the node state to every committed node. Returns whether all are done.
    async fn apply_node_state(
        &self,
        round: &Round<'_>,
        state: &mut StepState<TipProvisioningState>,
        node_state: &str,
    ) -> ProviderResult<bool> {
        let outstanding: Vec<Member> = state
            .provider
            .committed()
            .filter(|m| !state.provider.node_state_applied.contains(&m.node_id))
            .cloned()
            .collect();

        let mut done = true;
        for member in outstanding {
            ensure_not_cancelled(round.cancel)?;
            let result = self
                .client
                .set_node_state(&member.tip_session_id, &member.node_id, node_state)
                .await;
            ensure_not_cancelled(round.cancel)?;

            match result {
                Ok(()) => {
                    debug!(node = %member.node_id, node_state, "node state applied");
                    state.provider.node_state_applied.insert(member.node_id);
                }
                Err(e) => {
                    let e = ProviderError::from(e);
                    if round.policy.classify(&e) == FailureClass::Terminal {
                        return Err(e);
                    }
                    state.retry_count += 1;
                    state.failures.record_failure(&member.node_id, &e)?;
                    done = false;
                }
            }
        }
        Ok(done)
    }

    // ── Cleanup ───────────────────────────────────────────────────

    /// Delete the committed sessions among `members` and drop their pairs
    /// from the provisioned set. Best effort.
    async fn release(&self, ctx: &ExperimentContext, members: &[Member]) {
        let mut keys = Vec::new();
        for member in members.iter().filter(|m| m.is_committed()) {
            match self.client.delete_session(&member.tip_session_id).await {
                Ok(handle) => {
                    info!(
                        experiment = %ctx.experiment_id,
                        node = %member.node_id,
                        session = %member.tip_session_id,
                        change = %handle.change_id,
                        "TiP session delete requested"
                    );
                }
                Err(e) => {
                    warn!(
                        experiment = %ctx.experiment_id,
                        session = %member.tip_session_id,
                        error = %e,
                        "failed to delete TiP session"
                    );
                }
            }
            keys.extend(member.entity_keys());
        }

        if keys.is_empty() {
            return;
        }
        if let Err(e) = ctx
            .store
            .remove_entities_provisioned(&ctx.experiment_id, &keys)
        {
            warn!(experiment = %ctx.experiment_id, error = %e, "failed to remove released entities");
        }
    }

    async fn release_all(&self, ctx: &ExperimentContext, state: &mut TipProvisioningState) {
        let members = state.clear();
        self.release(ctx, &members).await;
    }
}

#[async_trait]
impl StepProvider for TipProvisioning {
    type State = TipProvisioningState;

    fn name(&self) -> &'static str {
        STEP_TYPE
    }

    fn validate(&self, ctx: &ExperimentContext, component: &ExperimentComponent) -> ProviderResult<()> {
        if ctx.groups.is_empty() {
            return Err(ProviderError::Schema(
                "experiment declares no groups to provision".to_string(),
            ));
        }
        Settings::from_component(component).map(|_| ())
    }

    fn initial_state(
        &self,
        _ctx: &ExperimentContext,
        component: &ExperimentComponent,
    ) -> ProviderResult<TipProvisioningState> {
        let settings = Settings::from_component(component)?;
        Ok(TipProvisioningState::new(settings.affinity, settings.count_per_group))
    }

    async fn execute_step(
        &self,
        ctx: &ExperimentContext,
        component: &ExperimentComponent,
        state: &mut StepState<TipProvisioningState>,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> ProviderResult<ExecutionStatus> {
        let round = Round {
            ctx,
            settings: Settings::from_component(component)?,
            policy,
            cancel,
        };
        match self.advance(&round, state).await {
            Err(e) if !matches!(e, ProviderError::Cancelled) && policy.classify(&e) == FailureClass::Terminal => {
                warn!(
                    experiment = %ctx.experiment_id,
                    step = %ctx.step_id,
                    error = %e,
                    "provisioning failed, releasing committed sessions"
                );
                self.release_all(ctx, &mut state.provider).await;
                Err(e)
            }
            other => other,
        }
    }

    async fn cleanup(
        &self,
        ctx: &ExperimentContext,
        _component: &ExperimentComponent,
        state: &mut StepState<TipProvisioningState>,
    ) -> ProviderResult<()> {
        self.release_all(ctx, &mut state.provider).await;
        Ok(())
    }

    fn diagnostics_context(&self, state: &TipProvisioningState) -> DiagnosticsContext {
        DiagnosticsContext {
            issue_type: "TipSessionProvisioningFailure".to_string(),
            node_ids: state.nodes_attempted.iter().cloned().collect(),
            tip_session_ids: state
                .members()
                .map(|(_, m)| m.tip_session_id.clone())
                .collect(),
        }
    }
}

/// Mark a pool node as discarded so it is never selected again.
fn discard_node(ctx: &ExperimentContext, node_id: &str) -> ProviderResult<()> {
    let mut pool = ctx.store.get_entity_pool(&ctx.experiment_id)?;
    if let Some(node) = pool.get_mut(&EntityKey::node(node_id)) {
        node.discarded = true;
        ctx.store.save_entity_pool(&ctx.experiment_id, &pool)?;
    }
    Ok(())
}
