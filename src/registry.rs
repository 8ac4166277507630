//! Pipeline registry: the catalog of runnable pipelines.
//!
//! Built once at start-up and shared read-only with the orchestrator and CLI.
//! Each entry maps a pipeline name to an extractor/transformer pair, its
//! default parameters and the credential it needs.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::EtlConfig;
use crate::constants::{
    default_rate_limit, BETTING_PIPELINE, COINGECKO_SOURCE, CRYPTO_PIPELINE, ESPN_SOURCE,
    GAMING_PIPELINE, MEDIA_PIPELINE, STEAMSPY_SOURCE, TMDB_CREDENTIAL, TMDB_SOURCE,
};
use crate::error::{EtlError, Result};
use crate::extract::sources::coingecko::CoinGeckoExtractor;
use crate::extract::sources::espn::EspnExtractor;
use crate::extract::sources::steamspy::SteamSpyExtractor;
use crate::extract::sources::tmdb::TmdbExtractor;
use crate::extract::{ExtractParams, Extractor};
use crate::transform::{schemas, StarTransformer, Transformer};

/// Builds the extractor and transformer for a pipeline not known at compile time.
pub trait PipelineFactory: Send + Sync {
    fn create_extractor(&self, config: &EtlConfig, rate_limit: u32) -> Result<Arc<dyn Extractor>>;

    fn create_transformer(&self) -> Arc<dyn Transformer>;
}

/// Closed set of built-in pipelines, plus an escape hatch for embedders.
#[derive(Clone)]
pub enum PipelineKind {
    Gaming,
    Crypto,
    Betting,
    Media,
    Custom(Arc<dyn PipelineFactory>),
}

impl fmt::Debug for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineKind::Gaming => f.write_str("Gaming"),
            PipelineKind::Crypto => f.write_str("Crypto"),
            PipelineKind::Betting => f.write_str("Betting"),
            PipelineKind::Media => f.write_str("Media"),
            PipelineKind::Custom(_) => f.write_str("Custom"),
        }
    }
}

impl PipelineKind {
    fn create_extractor(&self, config: &EtlConfig, rate_limit: u32) -> Result<Arc<dyn Extractor>> {
        Ok(match self {
            PipelineKind::Gaming => Arc::new(SteamSpyExtractor::new(config, rate_limit)?),
            PipelineKind::Crypto => Arc::new(CoinGeckoExtractor::new(config, rate_limit)?),
            PipelineKind::Betting => Arc::new(EspnExtractor::new(config, rate_limit)?),
            PipelineKind::Media => Arc::new(TmdbExtractor::new(config, rate_limit)?),
            PipelineKind::Custom(factory) => factory.create_extractor(config, rate_limit)?,
        })
    }

    fn create_transformer(&self) -> Arc<dyn Transformer> {
        match self {
            PipelineKind::Gaming => Arc::new(StarTransformer::new(schemas::gaming())),
            PipelineKind::Crypto => Arc::new(StarTransformer::new(schemas::crypto())),
            PipelineKind::Betting => Arc::new(StarTransformer::new(schemas::betting())),
            PipelineKind::Media => Arc::new(StarTransformer::new(schemas::media())),
            PipelineKind::Custom(factory) => factory.create_transformer(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Available,
    RequiresCredential,
    Disabled,
    Error,
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineStatus::Available => "available",
            PipelineStatus::RequiresCredential => "requires_credential",
            PipelineStatus::Disabled => "disabled",
            PipelineStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Registry entry as shown to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineInfo {
    pub name: String,
    pub vertical: String,
    pub description: String,
    pub data_sources: Vec<String>,
    /// Source name of the extractor.
    pub extractor: String,
    /// Schema name of the transformer.
    pub transformer: String,
    pub required_credential: Option<String>,
    pub default_params: Map<String, Value>,
    pub expected_tables: Vec<String>,
    /// Declared request budget (requests per minute).
    pub rate_limit: u32,
    pub status: PipelineStatus,
}

impl PipelineInfo {
    pub fn new(name: &str, vertical: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            vertical: vertical.to_string(),
            description: description.to_string(),
            data_sources: Vec::new(),
            extractor: String::new(),
            transformer: String::new(),
            required_credential: None,
            default_params: Map::new(),
            expected_tables: Vec::new(),
            rate_limit: 0,
            status: PipelineStatus::Available,
        }
    }

    pub fn source(mut self, source: &str) -> Self {
        self.data_sources.push(source.to_string());
        if self.extractor.is_empty() {
            self.extractor = source.to_string();
            self.rate_limit = default_rate_limit(source);
        }
        self
    }

    pub fn credential(mut self, name: &str) -> Self {
        self.required_credential = Some(name.to_string());
        self
    }

    pub fn param(mut self, key: &str, value: Value) -> Self {
        self.default_params.insert(key.to_string(), value);
        self
    }

    pub fn rate_limit(mut self, requests_per_min: u32) -> Self {
        self.rate_limit = requests_per_min;
        self
    }
}

struct RegistryEntry {
    info: PipelineInfo,
    kind: PipelineKind,
}

/// Catalog of pipelines keyed by name.
pub struct PipelineRegistry {
    config: Arc<EtlConfig>,
    entries: BTreeMap<String, RegistryEntry>,
}

impl PipelineRegistry {
    /// Registry with the built-in pipelines.
    pub fn new(config: Arc<EtlConfig>) -> Self {
        let mut registry = Self::empty(config);
        registry.register_pipeline(
            PipelineInfo::new(GAMING_PIPELINE, "gaming", "SteamSpy game catalogue with owners, reviews and playtime")
                .source(STEAMSPY_SOURCE)
                .param("limit", json!(100))
                .param("max_pages", json!(1))
                .param("tag_details", json!(10)),
            PipelineKind::Gaming,
        );
        registry.register_pipeline(
            PipelineInfo::new(CRYPTO_PIPELINE, "crypto", "CoinGecko market snapshot of the top coins")
                .source(COINGECKO_SOURCE)
                .param("limit", json!(100))
                .param("vs_currency", json!("usd"))
                .param("include_details", json!(false))
                .param("include_exchanges", json!(true))
                .param("exchanges_limit", json!(100)),
            PipelineKind::Crypto,
        );
        registry.register_pipeline(
            PipelineInfo::new(BETTING_PIPELINE, "betting", "ESPN teams and standings across major leagues")
                .source(ESPN_SOURCE)
                .param("leagues", json!(["nfl", "nba", "mlb", "nhl"]))
                .param("include_standings", json!(true)),
            PipelineKind::Betting,
        );
        registry.register_pipeline(
            PipelineInfo::new(MEDIA_PIPELINE, "media", "TMDb popular movies and TV shows")
                .source(TMDB_SOURCE)
                .credential(TMDB_CREDENTIAL)
                .param("movies_limit", json!(100))
                .param("tv_limit", json!(100)),
            PipelineKind::Media,
        );
        registry
    }

    pub fn empty(config: Arc<EtlConfig>) -> Self {
        Self {
            config,
            entries: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &Arc<EtlConfig> {
        &self.config
    }

    /// Add or replace a pipeline. Transformer name and expected tables are
    /// filled in from the transformer's schema when left empty.
    pub fn register_pipeline(&mut self, mut info: PipelineInfo, kind: PipelineKind) {
        let transformer = kind.create_transformer();
        if info.transformer.is_empty() {
            info.transformer = transformer.schema_name().to_string();
        }
        if info.expected_tables.is_empty() {
            info.expected_tables = transformer.schema().table_names();
        }
        if self.entries.contains_key(&info.name) {
            warn!("Replacing registered pipeline {}", info.name);
        }
        debug!("Registered pipeline {} ({:?})", info.name, kind);
        self.entries.insert(info.name.clone(), RegistryEntry { info, kind });
    }

    pub fn pipeline_names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// All pipelines with their current status.
    pub fn list_pipelines(&self) -> Vec<PipelineInfo> {
        self.entries
            .values()
            .map(|e| self.with_status(&e.info))
            .collect()
    }

    pub fn get_pipeline_info(&self, name: &str) -> Result<PipelineInfo> {
        self.entry(name).map(|e| self.with_status(&e.info))
    }

    /// Registry defaults overlaid with `[pipelines.<name>.params]` from config.
    pub fn get_default_params(&self, name: &str) -> Result<ExtractParams> {
        let entry = self.entry(name)?;
        Ok(ExtractParams(entry.info.default_params.clone()).merged(&self.config.param_overrides(name)))
    }

    pub fn check_pipeline_status(&self, name: &str) -> PipelineStatus {
        match self.entries.get(name) {
            None => PipelineStatus::Error,
            Some(e) => self.status_of(&e.info),
        }
    }

    /// Configuration errors that prevent the pipeline from running.
    pub fn ensure_runnable(&self, name: &str) -> Result<PipelineInfo> {
        let info = self.get_pipeline_info(name)?;
        match info.status {
            PipelineStatus::Available => Ok(info),
            PipelineStatus::Disabled => Err(EtlError::PipelineDisabled(name.to_string())),
            PipelineStatus::RequiresCredential => Err(EtlError::MissingCredential {
                pipeline: name.to_string(),
                credential: info.required_credential.unwrap_or_default(),
            }),
            PipelineStatus::Error => Err(EtlError::UnknownPipeline(name.to_string())),
        }
    }

    /// Fresh extractor instance, paced at the configured or declared budget.
    pub fn get_extractor(&self, name: &str) -> Result<Arc<dyn Extractor>> {
        self.ensure_runnable(name)?;
        let entry = self.entry(name)?;
        let rate_limit = self
            .config
            .rate_limit_override(name)
            .unwrap_or(entry.info.rate_limit);
        entry.kind.create_extractor(&self.config, rate_limit)
    }

    pub fn get_transformer(&self, name: &str) -> Result<Arc<dyn Transformer>> {
        Ok(self.entry(name)?.kind.create_transformer())
    }

    fn entry(&self, name: &str) -> Result<&RegistryEntry> {
        self.entries
            .get(name)
            .ok_or_else(|| EtlError::UnknownPipeline(name.to_string()))
    }

    fn status_of(&self, info: &PipelineInfo) -> PipelineStatus {
        if !self.config.pipeline_enabled(&info.name) {
            return PipelineStatus::Disabled;
        }
        match &info.required_credential {
            Some(cred) if !self.config.has_credential(cred) => PipelineStatus::RequiresCredential,
            _ => PipelineStatus::Available,
        }
    }

    fn with_status(&self, info: &PipelineInfo) -> PipelineInfo {
        let mut info = info.clone();
        info.status = self.status_of(&info);
        info
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineOverrides;

    fn registry_with(config: EtlConfig) -> PipelineRegistry {
        PipelineRegistry::new(Arc::new(config))
    }

    #[test]
    fn test_builtin_catalog() {
        let registry = registry_with(EtlConfig::default());
        assert_eq!(registry.pipeline_names(), vec!["betting", "crypto", "gaming", "media"]);

        let crypto = registry.get_pipeline_info("crypto").unwrap();
        assert_eq!(crypto.extractor, "COINGECKO");
        assert_eq!(crypto.transformer, "crypto");
        assert_eq!(crypto.rate_limit, 10);
        assert!(crypto.expected_tables.contains(&"coin_category_bridge".to_string()));
    }

    #[test]
    fn test_media_requires_tmdb_credential() {
        let registry = registry_with(EtlConfig::default());
        assert_eq!(registry.check_pipeline_status("media"), PipelineStatus::RequiresCredential);
        assert!(matches!(
            registry.get_extractor("media"),
            Err(EtlError::MissingCredential { .. })
        ));

        let mut config = EtlConfig::default();
        config.credentials.insert("TMDB".into(), "key".into());
        let registry = registry_with(config);
        assert_eq!(registry.check_pipeline_status("media"), PipelineStatus::Available);
        assert!(registry.get_extractor("media").is_ok());
    }

    #[test]
    fn test_unknown_and_disabled() {
        let mut config = EtlConfig::default();
        config.pipelines.insert(
            "gaming".into(),
            PipelineOverrides {
                enabled: false,
                ..Default::default()
            },
        );
        let registry = registry_with(config);
        assert_eq!(registry.check_pipeline_status("nope"), PipelineStatus::Error);
        assert!(matches!(registry.ensure_runnable("nope"), Err(EtlError::UnknownPipeline(_))));
        assert_eq!(registry.check_pipeline_status("gaming"), PipelineStatus::Disabled);
        assert!(matches!(registry.get_extractor("gaming"), Err(EtlError::PipelineDisabled(_))));
    }

    #[test]
    fn test_default_params_take_config_overrides() {
        let mut overrides = PipelineOverrides::default();
        overrides.params.insert("limit".into(), toml::Value::Integer(5));
        let mut config = EtlConfig::default();
        config.pipelines.insert("crypto".into(), overrides);
        let registry = registry_with(config);

        let params = registry.get_default_params("crypto").unwrap();
        assert_eq!(params.usize_or("limit", 0), 5);
        assert_eq!(params.str_or("vs_currency", ""), "usd");
        assert!(params.bool_or("include_exchanges", false));
    }

    #[test]
    fn test_builtin_schemas_cover_secondary_tables() {
        let registry = registry_with(EtlConfig::default());
        let tables = |name: &str| registry.get_pipeline_info(name).unwrap().expected_tables;
        assert!(tables("gaming").contains(&"game_tag_bridge".to_string()));
        assert!(tables("crypto").contains(&"fact_exchange_metrics".to_string()));
        assert!(tables("betting").contains(&"team_venue_bridge".to_string()));
        let gaming = registry.get_default_params("gaming").unwrap();
        assert_eq!(gaming.usize_or("tag_details", 0), 10);
    }
}
