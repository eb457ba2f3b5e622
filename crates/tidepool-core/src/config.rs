//! pool.toml configuration parser.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::target::TargetConfig;

/// Top-level `pool.toml` document.
///
/// ```toml
/// [pool]
/// pool_size = 5
/// idle_timeout = "300s"
///
/// [targets.sales]
/// host = "mssql.internal"
/// port = 1433
/// database = "sales"
/// user = "svc_reader"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TidepoolConfig {
    #[serde(default)]
    pub pool: PoolSection,
    #[serde(default)]
    pub targets: BTreeMap<String, TargetConfig>,
}

/// The `[pool]` table. Every field is optional; unset fields take the
/// pool manager's defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSection {
    pub pool_size: Option<usize>,
    pub max_overflow: Option<usize>,
    pub global_max_connections: Option<usize>,
    pub global_max_targets: Option<usize>,
    pub idle_timeout: Option<String>,
    pub reaper_interval: Option<String>,
    pub acquire_timeout_default: Option<String>,
    pub health_check_on_acquire: Option<bool>,
    pub drain_timeout: Option<String>,
}

impl TidepoolConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: TidepoolConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Look up a named target.
    pub fn target(&self, name: &str) -> ConfigResult<&TargetConfig> {
        self.targets
            .get(name)
            .ok_or_else(|| ConfigError::UnknownTarget(name.to_string()))
    }
}
