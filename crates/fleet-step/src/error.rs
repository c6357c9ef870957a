//! Provider error taxonomy.

use chrono::{DateTime, Utc};
use thiserror::Error;

use fleet_core::ParameterError;
use fleet_state::{EntityError, StateError};

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Everything a step invocation can fail with.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("schema validation failed: {0}")]
    Schema(String),

    #[error("expected environment entities not found: {0}")]
    ResourceExhaustion(String),

    #[error("remote request failed: {0}")]
    RemoteRequest(String),

    #[error("step timed out (deadline {deadline})")]
    Timeout { deadline: DateTime<Utc> },

    #[error("{resource} failed {count} consecutive times (maximum {maximum}): {last_error}")]
    ConsecutiveFailures {
        resource: String,
        count: u32,
        maximum: u32,
        last_error: String,
    },

    #[error("invalid entity data: {0}")]
    Entity(#[from] EntityError),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    /// Raised by the cancellation token. Never surfaces as an error on a result.
    #[error("cancelled")]
    Cancelled,
}

impl From<ParameterError> for ProviderError {
    fn from(e: ParameterError) -> Self {
        Self::Schema(e.to_string())
    }
}

/// Stable classification of a failure, for callers that branch on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorReason {
    SchemaInvalid,
    ExpectedEnvironmentEntitiesNotFound,
    RemoteRequestFailed,
    StepTimeout,
    ConsecutiveFailureLimit,
    EntityDataInvalid,
    StateStoreFailure,
    Cancelled,
}

impl ProviderError {
    pub fn reason(&self) -> ErrorReason {
        match self {
            Self::Schema(_) => ErrorReason::SchemaInvalid,
            Self::ResourceExhaustion(_) => ErrorReason::ExpectedEnvironmentEntitiesNotFound,
            Self::RemoteRequest(_) => ErrorReason::RemoteRequestFailed,
            Self::Timeout { .. } => ErrorReason::StepTimeout,
            Self::ConsecutiveFailures { .. } => ErrorReason::ConsecutiveFailureLimit,
            Self::Entity(_) => ErrorReason::EntityDataInvalid,
            Self::State(_) => ErrorReason::StateStoreFailure,
            Self::Cancelled => ErrorReason::Cancelled,
        }
    }
}
