use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ENV_PREFIX: &str = "PERMAFROST";
pub const DEFAULT_FILE: &str = "permafrost";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load settings: {0}")]
    Settings(#[from] config::ConfigError),
    #[error("failed to parse registry: {0}")]
    Registry(#[from] ron::error::SpannedError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// RON file describing every PV, see [`crate::registry::StaticTypeRegistry`]
    pub registry_path: PathBuf,
    pub retrieval: RetrievalSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalSettings {
    /// Requests estimated above this may use the worker pool
    pub memory_cutoff_mb: u64,
    pub parallel_retrieval: bool,
    /// Requests slower than this log their stage timings
    pub slow_request_ms: u64,
    /// PV answered with synthetic samples, for health checks
    pub ping_pv: String,
    /// Type info cloned for PVs the registry no longer knows
    pub retired_pv_template: Option<String>,
    pub use_reduced_default: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            registry_path: PathBuf::from("registry.ron"),
            retrieval: RetrievalSettings::default(),
        }
    }
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            memory_cutoff_mb: 60,
            parallel_retrieval: false,
            slow_request_ms: 5000,
            ping_pv: "ArchApplPingPV".to_string(),
            retired_pv_template: None,
            use_reduced_default: "firstSample".to_string(),
        }
    }
}

impl RetrievalSettings {
    pub fn memory_cutoff_bytes(&self) -> u64 {
        self.memory_cutoff_mb.saturating_mul(1024 * 1024)
    }
}

impl Settings {
    /// `file` (any format `config` detects, ie. `permafrost.ron`), optional, under
    /// `PERMAFROST_*` env vars (`PERMAFROST_RETRIEVAL__PARALLEL_RETRIEVAL=true`)
    pub fn load(file: Option<&str>) -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(file.unwrap_or(DEFAULT_FILE)).required(file.is_some()))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}
