//! Experiment component: the step definition and its parameters.
//!
//! Parameters arrive as a string-keyed JSON map. Accessors read them as
//! typed values and report a [`ParameterError`] for anything missing or
//! malformed; nothing is silently coerced.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::duration::parse_duration;
use crate::types::NodeAffinity;

/// Well-known parameter names.
pub mod params {
    pub const TIMEOUT: &str = "Timeout";
    pub const NODE_AFFINITY: &str = "NodeAffinity";
    pub const COUNT_PER_GROUP: &str = "CountPerGroup";
    pub const FEATURE_FLAG: &str = "FeatureFlag";
    pub const ENABLE_DIAGNOSTICS: &str = "EnableDiagnostics";
    pub const NODE_STATE: &str = "NodeState";
    pub const MAXIMUM_CONSECUTIVE_FAILURES: &str = "MaximumConsecutiveFailures";
}

/// A component parameter was missing or could not be read as the expected type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParameterError {
    #[error("required parameter '{0}' is missing")]
    Missing(String),

    #[error("parameter '{name}' has invalid value {value}: {reason}")]
    Invalid {
        name: String,
        value: String,
        reason: String,
    },
}

impl ParameterError {
    fn invalid(name: &str, value: &Value, reason: impl Into<String>) -> Self {
        Self::Invalid {
            name: name.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// One step of an experiment as handed to a provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExperimentComponent {
    /// Step-type identifier used to pick the handler.
    pub step_type: String,
    /// Optional display name.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
}

impl ExperimentComponent {
    pub fn new(step_type: &str) -> Self {
        Self {
            step_type: step_type.to_string(),
            name: None,
            parameters: BTreeMap::new(),
        }
    }

    /// Builder-style parameter insertion.
    pub fn with_parameter(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.to_string(), value.into());
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.parameters.get(name).is_some_and(|v| !v.is_null())
    }

    fn raw(&self, name: &str) -> Option<&Value> {
        self.parameters.get(name).filter(|v| !v.is_null())
    }

    fn required(&self, name: &str) -> Result<&Value, ParameterError> {
        self.raw(name)
            .ok_or_else(|| ParameterError::Missing(name.to_string()))
    }

    /// Read a string parameter. Numbers and booleans are rendered as text.
    pub fn get_string(&self, name: &str) -> Result<String, ParameterError> {
        let value = self.required(name)?;
        match value {
            Value::String(s) => Ok(s.clone()),
            Value::Number(n) => Ok(n.to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            other => Err(ParameterError::invalid(name, other, "expected a string")),
        }
    }

    pub fn get_optional_string(&self, name: &str) -> Result<Option<String>, ParameterError> {
        match self.raw(name) {
            Some(_) => self.get_string(name).map(Some),
            None => Ok(None),
        }
    }

    pub fn get_u32(&self, name: &str) -> Result<u32, ParameterError> {
        let value = self.required(name)?;
        let parsed = match value {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse::<u64>().ok(),
            _ => None,
        };
        parsed
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| ParameterError::invalid(name, value, "expected a non-negative integer"))
    }

    pub fn get_bool(&self, name: &str) -> Result<bool, ParameterError> {
        let value = self.required(name)?;
        match value {
            Value::Bool(b) => Ok(*b),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" => Ok(true),
                "false" => Ok(false),
                _ => Err(ParameterError::invalid(name, value, "expected true or false")),
            },
            other => Err(ParameterError::invalid(name, other, "expected a boolean")),
        }
    }

    /// Read a boolean flag, treating an absent parameter as `default`.
    pub fn get_bool_or(&self, name: &str, default: bool) -> Result<bool, ParameterError> {
        match self.raw(name) {
            Some(_) => self.get_bool(name),
            None => Ok(default),
        }
    }

    pub fn get_duration(&self, name: &str) -> Result<Duration, ParameterError> {
        let value = self.required(name)?;
        let parsed = match value {
            Value::String(s) => parse_duration(s),
            Value::Number(n) => n.as_u64().map(Duration::from_secs),
            _ => None,
        };
        parsed.ok_or_else(|| ParameterError::invalid(name, value, "expected a duration"))
    }

    pub fn get_affinity(&self, name: &str) -> Result<NodeAffinity, ParameterError> {
        let value = self.required(name)?;
        match value {
            Value::String(s) => s
                .parse::<NodeAffinity>()
                .map_err(|reason| ParameterError::invalid(name, value, reason)),
            other => Err(ParameterError::invalid(name, other, "expected an affinity name")),
        }
    }
}
