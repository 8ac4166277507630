use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{EtlError, Result};

pub const DEFAULT_CONFIG_PATH: &str = "etl.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EtlConfig {
    pub output_dir: PathBuf,
    pub history_dir: Option<PathBuf>,
    pub log_dir: PathBuf,
    pub credentials: HashMap<String, String>,
    pub pipelines: HashMap<String, PipelineOverrides>,
    pub http: HttpConfig,
    pub quality: QualityConfig,
}

/// Per-pipeline overrides read from `[pipelines.<name>]`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineOverrides {
    pub enabled: bool,
    pub params: HashMap<String, toml::Value>,
    pub rate_limit_per_minute: Option<u32>,
}

impl Default for PipelineOverrides {
    fn default() -> Self {
        Self {
            enabled: true,
            params: HashMap::new(),
            rate_limit_per_minute: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_seconds: u64,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
            max_retries: 3,
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
            user_agent: "etl-engine/0.1".to_string(),
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub fail_job_on_blocking_gate: bool,
    pub freshness_ceiling_days: f64,
    /// Gate names that block the job when below threshold. Empty by default:
    /// every gate is informational unless listed here.
    pub blocking_gates: Vec<String>,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            fail_job_on_blocking_gate: true,
            freshness_ceiling_days: 730.0,
            blocking_gates: Vec::new(),
        }
    }
}

impl Default for EtlConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./data/etl"),
            history_dir: None,
            log_dir: PathBuf::from("logs"),
            credentials: HashMap::new(),
            pipelines: HashMap::new(),
            http: HttpConfig::default(),
            quality: QualityConfig::default(),
        }
    }
}

impl EtlConfig {
    /// Load from a TOML file (missing file means defaults), then overlay the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenv::dotenv().ok();

        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
        let mut config = if path.exists() {
            let content = fs::read_to_string(path).map_err(|e| {
                EtlError::Config(format!("Failed to read config file '{}': {}", path.display(), e))
            })?;
            info!("Loaded configuration from {}", path.display());
            Self::from_toml_str(&content)?
        } else {
            debug!("No config file at {}, using defaults", path.display());
            Self::default()
        };

        config.apply_env(std::env::vars());
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: EtlConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Overlay credentials and directories from environment variables.
    ///
    /// `ETL_CREDENTIAL_<NAME>` and `<NAME>_API_KEY` both register a credential.
    pub fn apply_env<I>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            if let Some(name) = key.strip_prefix("ETL_CREDENTIAL_") {
                self.credentials.insert(name.to_string(), value);
            } else if let Some(name) = key.strip_suffix("_API_KEY") {
                self.credentials.entry(name.to_string()).or_insert(value);
            } else if key == "ETL_OUTPUT_DIR" {
                self.output_dir = PathBuf::from(value);
            } else if key == "ETL_HISTORY_DIR" {
                self.history_dir = Some(PathBuf::from(value));
            }
        }
    }

    pub fn history_dir(&self) -> PathBuf {
        self.history_dir
            .clone()
            .unwrap_or_else(|| self.output_dir.join("_jobs"))
    }

    pub fn credential(&self, name: &str) -> Option<&str> {
        self.credentials
            .get(name)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
    }

    pub fn has_credential(&self, name: &str) -> bool {
        self.credential(name).is_some()
    }

    pub fn pipeline_enabled(&self, pipeline: &str) -> bool {
        self.pipelines.get(pipeline).map_or(true, |p| p.enabled)
    }

    pub fn rate_limit_override(&self, pipeline: &str) -> Option<u32> {
        self.pipelines
            .get(pipeline)
            .and_then(|p| p.rate_limit_per_minute)
    }

    /// Parameter overrides for a pipeline converted to JSON values.
    pub fn param_overrides(&self, pipeline: &str) -> serde_json::Map<String, Value> {
        self.pipelines
            .get(pipeline)
            .map(|p| {
                p.params
                    .iter()
                    .filter_map(|(k, v)| serde_json::to_value(v).ok().map(|v| (k.clone(), v)))
                    .collect()
            })
            .unwrap_or_default()
    }
}
