//! Diagnostics requests for failed steps.
//!
//! When a component enables diagnostics and its step fails, a structured
//! record is handed to an auto-triage collaborator. Emission is
//! fire-and-forget: a sink error is logged and never changes the status
//! returned to the scheduler.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Correlation data a provider contributes to a diagnostics request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticsContext {
    /// Fixed issue-type code for the provider.
    pub issue_type: String,
    pub node_ids: Vec<String>,
    pub tip_session_ids: Vec<String>,
}

/// A request for automated triage of a failed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticsRequest {
    pub experiment_id: String,
    pub step_id: String,
    pub issue_type: String,
    pub time_range_begin: DateTime<Utc>,
    pub time_range_end: DateTime<Utc>,
    /// Correlated identifiers: `NodeId`, `TipSessionId`, `ProviderName`, `Reason`.
    pub context: BTreeMap<String, String>,
}

impl DiagnosticsRequest {
    pub fn new(
        experiment_id: &str,
        step_id: &str,
        provider_name: &str,
        window: (DateTime<Utc>, DateTime<Utc>),
        context: &DiagnosticsContext,
        reason: &str,
    ) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert("ProviderName".to_string(), provider_name.to_string());
        fields.insert("Reason".to_string(), reason.to_string());
        if !context.node_ids.is_empty() {
            fields.insert("NodeId".to_string(), context.node_ids.join(","));
        }
        if !context.tip_session_ids.is_empty() {
            fields.insert("TipSessionId".to_string(), context.tip_session_ids.join(","));
        }

        Self {
            experiment_id: experiment_id.to_string(),
            step_id: step_id.to_string(),
            issue_type: context.issue_type.clone(),
            time_range_begin: window.0,
            time_range_end: window.1,
            context: fields,
        }
    }
}

/// Auto-triage collaborator.
#[async_trait]
pub trait DiagnosticsSink: Send + Sync {
    async fn submit(&self, request: DiagnosticsRequest) -> anyhow::Result<()>;
}

/// Sink that records requests as structured log events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingDiagnosticsSink;

#[async_trait]
impl DiagnosticsSink for TracingDiagnosticsSink {
    async fn submit(&self, request: DiagnosticsRequest) -> anyhow::Result<()> {
        info!(
            experiment = %request.experiment_id,
            step = %request.step_id,
            issue_type = %request.issue_type,
            begin = %request.time_range_begin,
            end = %request.time_range_end,
            context = ?request.context,
            "diagnostics requested"
        );
        Ok(())
    }
}

/// Submit a request, logging and swallowing any sink failure.
pub(crate) async fn emit(sink: &dyn DiagnosticsSink, request: DiagnosticsRequest) {
    let experiment = request.experiment_id.clone();
    if let Err(e) = sink.submit(request).await {
        warn!(%experiment, error = %e, "diagnostics emission failed");
    }
}
