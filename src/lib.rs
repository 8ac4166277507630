pub mod config;
pub mod constants;
pub mod error;
pub mod logging;

// Leaf components: keys, tables, extract and transform contracts
pub mod extract;
pub mod keys;
pub mod table;
pub mod transform;

pub mod quality;
pub mod storage;

// Composition: catalog of pipelines and the job runner on top of it
pub mod orchestrator;
pub mod registry;

pub use config::EtlConfig;
pub use error::{EtlError, Result};
pub use extract::{CancelSignal, ExtractParams, ExtractionResult, Extractor};
pub use orchestrator::{JobResult, JobStatus, Orchestrator};
pub use quality::{GateSuite, QualityGate, QualityReport};
pub use registry::{PipelineFactory, PipelineInfo, PipelineKind, PipelineRegistry, PipelineStatus};
pub use transform::{RunContext, StarModel, StarTransformer, TransformationResult, Transformer};
