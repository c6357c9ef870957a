//! fleet-tip: TiP session provisioning and teardown steps.
//!
//! Provides the two step providers that lease fleet nodes for an
//! experiment through the remote TiP service, plus the registry wiring
//! that exposes them by step type.
//!
//! # Components
//!
//! - **`client`**: The TiP service interface consumed by both steps
//! - **`state`**: Persisted rows, members and attempted nodes
//! - **`provisioning`**: `TipProvisioning` (confirm, fill, complete)
//! - **`teardown`**: `TipTeardown` (delete provisioned sessions one by one)

pub mod client;
pub mod provisioning;
pub mod state;
pub mod teardown;

use std::sync::Arc;

use anyhow::Context;
use fleet_core::FleetConfig;
use fleet_step::{DiagnosticsSink, RetryPolicy, StepExecutor, StepRegistry, StepProvider};

pub use client::{
    ChangeDetails, ChangeHandle, ChangeStatus, SessionDetails, TipClient, TipError,
    TipSessionRequest,
};
pub use provisioning::TipProvisioning;
pub use state::{Member, MemberStatus, Slot, TipProvisioningState};
pub use teardown::{TipTeardown, TipTeardownState};

/// Build the registry of TiP steps, configured from `config`.
pub fn tip_registry(
    client: Arc<dyn TipClient>,
    diagnostics: Arc<dyn DiagnosticsSink>,
    config: &FleetConfig,
) -> anyhow::Result<StepRegistry> {
    let policy = Arc::new(
        RetryPolicy::with_signatures(config.transient_signatures())
            .context("invalid transient failure signature in configuration")?,
    );

    let mut registry = StepRegistry::new();
    registry.register(Box::new(configure(
        TipProvisioning::new(client.clone()),
        &policy,
        &diagnostics,
        config,
    )));
    registry.register(Box::new(configure(
        TipTeardown::new(client),
        &policy,
        &diagnostics,
        config,
    )));
    Ok(registry)
}

fn configure<P: StepProvider>(
    provider: P,
    policy: &Arc<RetryPolicy>,
    diagnostics: &Arc<dyn DiagnosticsSink>,
    config: &FleetConfig,
) -> StepExecutor<P> {
    StepExecutor::new(provider)
        .with_policy(policy.clone())
        .with_diagnostics(diagnostics.clone(), config.diagnostics_enabled_by_default())
        .with_default_timeout(config.default_timeout())
        .with_maximum_consecutive_failures(config.maximum_consecutive_failures())
}
