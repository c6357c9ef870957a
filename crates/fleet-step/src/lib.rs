//! fleet-step: the resumable step execution contract.
//!
//! A step is invoked over and over by an outer scheduler until it reports
//! a terminal status. Nothing survives between invocations except what the
//! [`ExperimentStore`](fleet_state::ExperimentStore) holds, so every
//! invocation loads its state, advances it by at most one round, and
//! persists it again.
//!
//! # Architecture
//!
//! ```text
//! StepRegistry (step type → handler)
//!   └── StepExecutor<P: StepProvider>
//!       ├── parameter validation (before any remote call)
//!       ├── StepState<P::State> load / create (deadline fixed on first call)
//!       ├── deadline check → provider cleanup → Failed(Timeout)
//!       ├── P::execute_step
//!       ├── RetryPolicy (transient → InProgress, bounded by FailureBudget)
//!       └── DiagnosticsSink on Failed (fire-and-forget)
//! ```

pub mod context;
pub mod diagnostics;
pub mod error;
pub mod executor;
pub mod registry;
pub mod retry;

pub use context::{ExecutionResult, ExperimentContext};
pub use diagnostics::{DiagnosticsContext, DiagnosticsRequest, DiagnosticsSink, TracingDiagnosticsSink};
pub use error::{ErrorReason, ProviderError, ProviderResult};
pub use executor::{StepExecutor, StepProvider, StepState, ensure_not_cancelled};
pub use registry::{StepHandler, StepRegistry};
pub use retry::{FailureBudget, FailureClass, RetryPolicy};
