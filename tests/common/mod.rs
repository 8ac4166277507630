#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use etl_engine::config::EtlConfig;
use etl_engine::error::Result;
use etl_engine::extract::{CancelSignal, ExtractParams, ExtractionResult, Extractor};
use etl_engine::registry::{PipelineFactory, PipelineInfo, PipelineKind, PipelineRegistry};
use etl_engine::table::Record;
use etl_engine::transform::schema::{DimensionDef, FactDef, SchemaDefinition};
use etl_engine::transform::{StarTransformer, Transformer};

pub fn shop_schema() -> SchemaDefinition {
    SchemaDefinition::new("shop", "fake")
        .dimension(DimensionDef::new("dim_item", "item_key", &["item_id"]).attributes(&["name"]))
        .dimension(DimensionDef::new("dim_tag", "tag_key", &["tag_name"]).exploded_from("tags"))
        .fact(
            FactDef::new("fact_item_prices", "One row per item per extraction")
                .references("dim_item", "item_key")
                .dated_by("extracted_at")
                .measures(&["price"]),
        )
        .bridge("item_tag_bridge", "dim_item", "dim_tag")
        .bound("fact_item_prices", "price", Some(0.0), None)
}

pub fn record(id: &str, price: Value, tags: &str) -> Record {
    json!({
        "item_id": id,
        "name": format!("Item {}", id),
        "price": price,
        "tags": tags,
        "extracted_at": Utc::now().to_rfc3339(),
    })
    .as_object()
    .cloned()
    .unwrap_or_default()
}

pub fn sample_records() -> Vec<Record> {
    vec![
        record("A", json!(10.0), "red,blue"),
        record("B", json!(12.5), "blue"),
        record("C", json!(3), ""),
    ]
}

#[derive(Clone, Default)]
pub enum Behaviour {
    #[default]
    Succeed,
    Fail(String),
    Panic,
    /// Sleep before answering; cancellation is left to the caller.
    Stall(Duration),
}

/// Counts how often the pipeline was touched.
#[derive(Default)]
pub struct Calls {
    pub extractors_built: AtomicUsize,
    pub extract_calls: AtomicUsize,
}

impl Calls {
    pub fn built(&self) -> usize {
        self.extractors_built.load(Ordering::SeqCst)
    }

    pub fn extracted(&self) -> usize {
        self.extract_calls.load(Ordering::SeqCst)
    }
}

struct FakeExtractor {
    records: Vec<Record>,
    behaviour: Behaviour,
    calls: Arc<Calls>,
}

#[async_trait]
impl Extractor for FakeExtractor {
    fn source_name(&self) -> &'static str {
        "FAKE"
    }

    fn rate_limit(&self) -> u32 {
        0
    }

    async fn extract(&self, _params: &ExtractParams, _cancel: &CancelSignal) -> ExtractionResult {
        self.calls.extract_calls.fetch_add(1, Ordering::SeqCst);
        let result = ExtractionResult::start("FAKE");
        match &self.behaviour {
            Behaviour::Succeed => result.succeed(self.records.clone(), 1),
            Behaviour::Fail(message) => result.fail(message.clone(), 1),
            Behaviour::Panic => panic!("fake extractor exploded"),
            Behaviour::Stall(delay) => {
                tokio::time::sleep(*delay).await;
                result.succeed(self.records.clone(), 1)
            }
        }
    }
}

pub struct FakeFactory {
    pub records: Vec<Record>,
    pub behaviour: Behaviour,
    pub calls: Arc<Calls>,
}

impl FakeFactory {
    pub fn new(records: Vec<Record>) -> Self {
        Self {
            records,
            behaviour: Behaviour::Succeed,
            calls: Arc::new(Calls::default()),
        }
    }

    pub fn behaving(mut self, behaviour: Behaviour) -> Self {
        self.behaviour = behaviour;
        self
    }
}

impl PipelineFactory for FakeFactory {
    fn create_extractor(&self, _config: &EtlConfig, _rate_limit: u32) -> Result<Arc<dyn Extractor>> {
        self.calls.extractors_built.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeExtractor {
            records: self.records.clone(),
            behaviour: self.behaviour.clone(),
            calls: Arc::clone(&self.calls),
        }))
    }

    fn create_transformer(&self) -> Arc<dyn Transformer> {
        Arc::new(StarTransformer::new(shop_schema()))
    }
}

/// Register `factory` under `name` and hand back its call counters.
pub fn register(registry: &mut PipelineRegistry, name: &str, factory: FakeFactory, credential: Option<&str>) -> Arc<Calls> {
    let calls = Arc::clone(&factory.calls);
    let mut info = PipelineInfo::new(name, "retail", "Fake shop prices").source("FAKE");
    if let Some(credential) = credential {
        info = info.credential(credential);
    }
    registry.register_pipeline(info, PipelineKind::Custom(Arc::new(factory)));
    calls
}

pub fn config_in(dir: &std::path::Path) -> EtlConfig {
    EtlConfig {
        output_dir: dir.join("out"),
        ..EtlConfig::default()
    }
}
