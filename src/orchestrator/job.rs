use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{EtlError, Result};
use crate::extract::ExtractionResult;
use crate::quality::QualityReport;
use crate::transform::TransformationResult;

/// Job lifecycle. Status only moves forward; terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Extracting,
    Transforming,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Pending, Running) => true,
            (Running, Extracting) | (Running, Transforming) => true,
            (Extracting, Transforming) => true,
            (Transforming, Completed) => true,
            (from, Failed) | (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Extracting => "extracting",
            JobStatus::Transforming => "transforming",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Named steps of a job, used for durations and failure attribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Setup,
    Extract,
    Transform,
    Quality,
    Load,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Setup => "setup",
            Phase::Extract => "extract",
            Phase::Transform => "transform",
            Phase::Quality => "quality",
            Phase::Load => "load",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record of one pipeline run. Created at job start, updated in place and
/// persisted once it reaches a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: String,
    pub pipeline: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Seconds spent in each phase, keyed by phase name.
    pub phase_durations: BTreeMap<String, f64>,
    pub params: Map<String, Value>,
    pub records_extracted: usize,
    pub records_failed: usize,
    pub api_calls: u64,
    pub row_counts: BTreeMap<String, usize>,
    pub total_rows: usize,
    pub output_paths: BTreeMap<String, PathBuf>,
    pub quality_score: Option<f64>,
    /// Every gate, blocking or not, met its threshold.
    pub quality_passed: Option<bool>,
    /// Names of gates below threshold.
    #[serde(default)]
    pub failed_gates: Vec<String>,
    pub warnings: Vec<String>,
    pub error: Option<String>,
    pub failed_phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extraction: Option<ExtractionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transformation: Option<TransformationResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<QualityReport>,
}

impl JobResult {
    pub fn new(job_id: impl Into<String>, pipeline: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            pipeline: pipeline.into(),
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            phase_durations: BTreeMap::new(),
            params: Map::new(),
            records_extracted: 0,
            records_failed: 0,
            api_calls: 0,
            row_counts: BTreeMap::new(),
            total_rows: 0,
            output_paths: BTreeMap::new(),
            quality_score: None,
            quality_passed: None,
            failed_gates: Vec::new(),
            warnings: Vec::new(),
            error: None,
            failed_phase: None,
            extraction: None,
            transformation: None,
            quality: None,
        }
    }

    /// Move to `next`, refusing regressions and moves out of a terminal status.
    pub fn advance(&mut self, next: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(EtlError::InvalidTransition {
                job_id: self.job_id.clone(),
                from: self.status,
                to: next,
            });
        }
        if next == JobStatus::Running {
            self.started_at = Some(Utc::now());
        }
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        self.status = next;
        Ok(())
    }

    pub fn record_phase(&mut self, phase: Phase, elapsed: Duration) {
        self.phase_durations
            .insert(phase.as_str().to_string(), elapsed.as_secs_f64());
    }

    /// Terminal failure attributed to a phase. No-op once terminal.
    pub fn fail(&mut self, phase: Phase, message: impl Into<String>) {
        if self.status.is_terminal() {
            return;
        }
        self.failed_phase = Some(phase.as_str().to_string());
        self.error = Some(message.into());
        self.status = JobStatus::Failed;
        self.completed_at = Some(Utc::now());
    }

    pub fn cancel(&mut self, phase: Phase) {
        if self.status.is_terminal() {
            return;
        }
        self.failed_phase = Some(phase.as_str().to_string());
        self.error = Some(format!("cancelled during {} phase", phase));
        self.status = JobStatus::Cancelled;
        self.completed_at = Some(Utc::now());
    }

    pub fn duration_seconds(&self) -> Option<f64> {
        let start = self.started_at?;
        let end = self.completed_at?;
        Some((end - start).num_milliseconds() as f64 / 1000.0)
    }

    pub fn apply_extraction(&mut self, extraction: &ExtractionResult) {
        self.records_extracted = extraction.records_extracted;
        self.records_failed = extraction.records_failed;
        self.api_calls = extraction.api_calls;
        self.warnings.extend(extraction.warnings.iter().cloned());
        // raw records are not part of the persisted job
        let mut summary = extraction.clone();
        summary.records = Vec::new();
        self.extraction = Some(summary);
    }

    pub fn apply_transformation(&mut self, transformation: &TransformationResult) {
        self.row_counts = transformation.row_counts.clone();
        self.total_rows = transformation.total_rows;
        self.warnings.extend(transformation.warnings.iter().cloned());
        self.warnings
            .extend(transformation.integrity_warnings.iter().cloned());
        self.transformation = Some(transformation.clone());
    }

    pub fn apply_quality(&mut self, report: &QualityReport) {
        self.quality_score = Some(report.overall_score);
        self.quality_passed = Some(report.all_gates_passed);
        self.failed_gates = report
            .gates
            .iter()
            .filter(|g| !g.passed)
            .map(|g| g.name.clone())
            .collect();
        self.quality = Some(report.clone());
    }
}
