//! fleet.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::parse_duration;

/// Default consecutive-failure budget per resource.
pub const DEFAULT_MAXIMUM_CONSECUTIVE_FAILURES: u32 = 5;

/// Default step timeout when a component carries none.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(2 * 3600);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetConfig {
    pub store: Option<StoreConfig>,
    pub provisioning: Option<ProvisioningConfig>,
    pub retry: Option<RetryConfig>,
    pub diagnostics: Option<DiagnosticsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningConfig {
    pub default_timeout: Option<String>,
    pub maximum_consecutive_failures: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Extra regexes appended to the built-in transient fault signatures.
    #[serde(default)]
    pub transient_signatures: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticsConfig {
    pub enabled_by_default: Option<bool>,
}

impl FleetConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: FleetConfig = toml::from_str(content)?;
        if let Some(raw) = config
            .provisioning
            .as_ref()
            .and_then(|p| p.default_timeout.as_deref())
        {
            if parse_duration(raw).is_none() {
                anyhow::bail!("provisioning.default_timeout: invalid duration '{raw}'");
            }
        }
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn store_path(&self) -> Option<&Path> {
        self.store.as_ref().map(|s| s.path.as_path())
    }

    pub fn default_timeout(&self) -> Duration {
        self.provisioning
            .as_ref()
            .and_then(|p| p.default_timeout.as_deref())
            .and_then(parse_duration)
            .unwrap_or(DEFAULT_STEP_TIMEOUT)
    }

    pub fn maximum_consecutive_failures(&self) -> u32 {
        self.provisioning
            .as_ref()
            .and_then(|p| p.maximum_consecutive_failures)
            .unwrap_or(DEFAULT_MAXIMUM_CONSECUTIVE_FAILURES)
    }

    pub fn transient_signatures(&self) -> &[String] {
        self.retry
            .as_ref()
            .map(|r| r.transient_signatures.as_slice())
            .unwrap_or(&[])
    }

    pub fn diagnostics_enabled_by_default(&self) -> bool {
        self.diagnostics
            .as_ref()
            .and_then(|d| d.enabled_by_default)
            .unwrap_or(false)
    }
}
