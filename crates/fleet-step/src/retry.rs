//! Failure classification and consecutive-failure budgets.
//!
//! Remote failures are matched against a maintained set of transient
//! infrastructure fault signatures. A match is retryable; anything else
//! is terminal. Retryable failures still count against a per-resource
//! budget and escalate once it is spent.

use std::collections::BTreeMap;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ProviderError;

/// Known transient fault signatures.
const TRANSIENT_SIGNATURES: &[&str] = &[
    r"(?i)\btimed? ?out\b",
    r"(?i)a task was cancell?ed",
    r"(?i)connection (was )?(reset|closed|refused|aborted)",
    r"(?i)an existing connection was forcibly closed",
    r"(?i)a connection attempt failed",
    r"(?i)\b(502|503|504)\b|bad gateway|service unavailable|gateway time-?out",
    r"(?i)\b429\b|too many requests|throttl",
    r"(?i)(failed to upload|upload failed for) chunk|chunk upload",
    r"(?i)remote name could not be resolved",
    r"(?i)name or service not known|temporary failure in name resolution",
];

/// How a failure should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Absorb, count, and try again on the next invocation.
    Retryable,
    /// Surface as `Failed`.
    Terminal,
}

/// Classifier for remote errors.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    signatures: Vec<Regex>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        let signatures = TRANSIENT_SIGNATURES
            .iter()
            .filter_map(|s| Regex::new(s).ok())
            .collect();
        Self { signatures }
    }
}

impl RetryPolicy {
    /// Built-in signatures plus `extra` patterns from configuration.
    pub fn with_signatures(extra: &[String]) -> Result<Self, regex::Error> {
        let mut policy = Self::default();
        for pattern in extra {
            policy.signatures.push(Regex::new(pattern)?);
        }
        Ok(policy)
    }

    pub fn is_transient(&self, message: &str) -> bool {
        self.signatures.iter().any(|re| re.is_match(message))
    }

    /// Only remote failures with a known transient signature are retryable.
    pub fn classify(&self, error: &ProviderError) -> FailureClass {
        match error {
            ProviderError::RemoteRequest(message) if self.is_transient(message) => {
                debug!(error = %message, "transient remote failure");
                FailureClass::Retryable
            }
            _ => FailureClass::Terminal,
        }
    }
}

/// Consecutive-failure counters per resource, persisted with provider state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureBudget {
    pub maximum_consecutive_failures: u32,
    #[serde(default)]
    pub consecutive_failures: BTreeMap<String, u32>,
}

impl FailureBudget {
    pub fn new(maximum_consecutive_failures: u32) -> Self {
        Self {
            maximum_consecutive_failures,
            consecutive_failures: BTreeMap::new(),
        }
    }

    /// Record a failure. Returns the escalation error once the budget is spent.
    pub fn record_failure(&mut self, resource: &str, error: &ProviderError) -> Result<u32, ProviderError> {
        let count = self
            .consecutive_failures
            .entry(resource.to_string())
            .or_insert(0);
        *count += 1;
        let count = *count;

        if count >= self.maximum_consecutive_failures {
            warn!(
                resource,
                count,
                maximum = self.maximum_consecutive_failures,
                "consecutive failure limit reached"
            );
            return Err(ProviderError::ConsecutiveFailures {
                resource: resource.to_string(),
                count,
                maximum: self.maximum_consecutive_failures,
                last_error: error.to_string(),
            });
        }
        debug!(resource, count, "consecutive failure recorded");
        Ok(count)
    }

    /// A success resets the resource's streak.
    pub fn record_success(&mut self, resource: &str) {
        self.consecutive_failures.remove(resource);
    }

    pub fn failures(&self, resource: &str) -> u32 {
        self.consecutive_failures.get(resource).copied().unwrap_or(0)
    }
}

impl Default for FailureBudget {
    fn default() -> Self {
        Self::new(fleet_core::config::DEFAULT_MAXIMUM_CONSECUTIVE_FAILURES)
    }
}
