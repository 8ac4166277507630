use thiserror::Error;

use crate::orchestrator::job::JobStatus;

#[derive(Error, Debug)]
pub enum EtlError {
    #[error("Source {source_name} unavailable: {message}")]
    SourceUnavailable { source_name: String, message: String },

    #[error("Source {source_name} rejected credentials: {message}")]
    Authentication { source_name: String, message: String },

    #[error("Schema mismatch in {table}: {message}")]
    SchemaMismatch { table: String, message: String },

    #[error("Unknown pipeline: {0}")]
    UnknownPipeline(String),

    #[error("Pipeline '{pipeline}' requires credential: {credential}")]
    MissingCredential { pipeline: String, credential: String },

    #[error("Pipeline '{0}' is disabled")]
    PipelineDisabled(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Job {0} was cancelled")]
    Cancelled(String),

    #[error("{phase} phase failed: {message}")]
    Phase { phase: String, message: String },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EtlError {
    /// Configuration errors are raised before any network or disk work starts.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            EtlError::UnknownPipeline(_)
                | EtlError::MissingCredential { .. }
                | EtlError::PipelineDisabled(_)
                | EtlError::Config(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, EtlError>;
