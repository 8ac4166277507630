//! Job orchestrator: runs a registered pipeline end to end.
//!
//! A job walks `pending → running → extracting → transforming` and ends
//! `completed`, `failed` or `cancelled`. Configuration problems fail the job
//! before any network or disk work. Panics and errors inside a phase become a
//! failed job; the orchestrator stays usable for the next one. A job can be
//! cancelled until its tables are about to be published; from then on
//! `cancel` reports false and the job completes.

pub mod history;
pub mod job;

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::EtlConfig;
use crate::error::Result;
use crate::extract::{cancel_pair, CancelHandle, CancelSignal, ExtractionResult};
use crate::quality::GateSuite;
use crate::registry::{PipelineRegistry, PipelineStatus};
use crate::storage::{StagedWrite, TableWriter};
use crate::transform::{RunContext, TransformOutput};

pub use history::JobHistory;
pub use job::{JobResult, JobStatus, Phase};

/// Aggregate view over the registry and job history.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OrchestratorSummary {
    pub registered_pipelines: usize,
    pub available_pipelines: usize,
    pub credential_gated_pipelines: usize,
    pub disabled_pipelines: usize,
    pub total_jobs: usize,
    pub completed_jobs: usize,
    pub failed_jobs: usize,
    pub cancelled_jobs: usize,
    pub active_jobs: usize,
    pub total_rows_processed: usize,
    pub total_records_extracted: usize,
    pub success_rate: f64,
}

/// Outcome of one phase task.
enum PhaseOutcome<T> {
    Done(T),
    Panicked(String),
    Cancelled,
}

async fn run_phase<T: Send + 'static>(
    mut task: tokio::task::JoinHandle<T>,
    cancel: &CancelSignal,
) -> PhaseOutcome<T> {
    tokio::select! {
        joined = &mut task => match joined {
            Ok(value) => PhaseOutcome::Done(value),
            Err(e) if e.is_cancelled() => PhaseOutcome::Cancelled,
            Err(e) => PhaseOutcome::Panicked(e.to_string()),
        },
        _ = cancel.cancelled() => {
            task.abort();
            PhaseOutcome::Cancelled
        }
    }
}

/// Cheap to clone; clones share the registry, history and job counter.
#[derive(Clone)]
pub struct Orchestrator {
    registry: Arc<PipelineRegistry>,
    config: Arc<EtlConfig>,
    writer: TableWriter,
    history: Arc<JobHistory>,
    counter: Arc<AtomicU64>,
    active: Arc<Mutex<HashMap<String, CancelHandle>>>,
}

impl Orchestrator {
    /// Orchestrator over `registry`, persisting history under the configured
    /// history directory.
    pub fn new(registry: Arc<PipelineRegistry>) -> Result<Self> {
        let config = Arc::clone(registry.config());
        let history = JobHistory::load(config.history_dir())?;
        Ok(Self::with_history(registry, history))
    }

    pub fn with_history(registry: Arc<PipelineRegistry>, history: JobHistory) -> Self {
        let config = Arc::clone(registry.config());
        Self {
            writer: TableWriter::new(config.output_dir.clone()),
            registry,
            config,
            history: Arc::new(history),
            counter: Arc::new(AtomicU64::new(0)),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn registry(&self) -> &PipelineRegistry {
        &self.registry
    }

    /// `ETL-<YYYYmmddHHMMSS>-<counter>-<uuid fragment>`.
    pub fn next_job_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let uuid = Uuid::new_v4().simple().to_string();
        format!("ETL-{}-{:04}-{}", Utc::now().format("%Y%m%d%H%M%S"), n, &uuid[..8])
    }

    /// Run one pipeline. Never returns an error: every outcome is a `JobResult`.
    pub async fn run_pipeline(&self, name: &str, params: Option<Map<String, Value>>) -> JobResult {
        let job_id = self.next_job_id();
        let span = info_span!("job", job_id = %job_id, pipeline = %name);
        self.execute(job_id, name.to_string(), params.unwrap_or_default())
            .instrument(span)
            .await
    }

    async fn execute(&self, job_id: String, name: String, caller_params: Map<String, Value>) -> JobResult {
        let started = Instant::now();
        let mut job = JobResult::new(&job_id, &name);
        info!("🚀 Starting pipeline {}", name);

        // configuration checks happen before any extractor exists
        let setup = Instant::now();
        let prepared = self.registry.ensure_runnable(&name).and_then(|_| {
            let params = self.registry.get_default_params(&name)?.merged(&caller_params);
            let extractor = self.registry.get_extractor(&name)?;
            let transformer = self.registry.get_transformer(&name)?;
            Ok((params, extractor, transformer))
        });
        job.record_phase(Phase::Setup, setup.elapsed());
        let (params, extractor, transformer) = match prepared {
            Ok(parts) => parts,
            Err(e) => {
                warn!("❌ Pipeline {} refused: {}", name, e);
                job.fail(Phase::Setup, e.to_string());
                return self.finish(job, started);
            }
        };
        job.params = params.0.clone();

        let (handle, cancel) = cancel_pair();
        self.active_jobs().insert(job_id.clone(), handle);
        self.track(&mut job, JobStatus::Running);

        // extract
        self.track(&mut job, JobStatus::Extracting);
        let phase = Instant::now();
        let task = {
            let extractor = Arc::clone(&extractor);
            let cancel = cancel.clone();
            tokio::spawn(async move { extractor.extract(&params, &cancel).await })
        };
        let outcome = run_phase(task, &cancel).await;
        job.record_phase(Phase::Extract, phase.elapsed());
        let mut extraction: ExtractionResult = match outcome {
            PhaseOutcome::Done(extraction) => extraction,
            PhaseOutcome::Cancelled => {
                job.cancel(Phase::Extract);
                return self.finish(job, started);
            }
            PhaseOutcome::Panicked(message) => {
                job.fail(Phase::Extract, format!("extractor panicked: {}", message));
                return self.finish(job, started);
            }
        };
        let records = std::mem::take(&mut extraction.records);
        job.apply_extraction(&extraction);
        if !extraction.success {
            let message = extraction
                .error
                .clone()
                .unwrap_or_else(|| "extraction failed".to_string());
            job.fail(Phase::Extract, message);
            return self.finish(job, started);
        }
        if cancel.is_cancelled() {
            job.cancel(Phase::Extract);
            return self.finish(job, started);
        }
        info!(
            "✅ Extracted {} records from {} ({} api calls)",
            extraction.records_extracted, extraction.source, extraction.api_calls
        );

        // transform
        self.track(&mut job, JobStatus::Transforming);
        let phase = Instant::now();
        let run = RunContext::new(job_id.clone(), Utc::now());
        let task = {
            let transformer = Arc::clone(&transformer);
            tokio::task::spawn_blocking(move || transformer.transform(&records, &run))
        };
        let outcome = run_phase(task, &cancel).await;
        job.record_phase(Phase::Transform, phase.elapsed());
        let TransformOutput { mut result, model } = match outcome {
            PhaseOutcome::Done(output) => output,
            PhaseOutcome::Cancelled => {
                job.cancel(Phase::Transform);
                return self.finish(job, started);
            }
            PhaseOutcome::Panicked(message) => {
                job.fail(Phase::Transform, format!("transformer panicked: {}", message));
                return self.finish(job, started);
            }
        };
        job.apply_transformation(&result);
        if !result.success {
            let message = result
                .error
                .clone()
                .unwrap_or_else(|| "transformation failed".to_string());
            job.fail(Phase::Transform, message);
            return self.finish(job, started);
        }

        // quality gates run on the in-memory model, before anything is written
        let phase = Instant::now();
        let report = GateSuite::for_schema(transformer.schema(), &self.config.quality).run(&model.tables);
        job.record_phase(Phase::Quality, phase.elapsed());
        job.apply_quality(&report);
        info!(
            "📊 Quality score {:.3} ({} of {} gates passed)",
            report.overall_score,
            report.gates.iter().filter(|g| g.passed).count(),
            report.gates.len()
        );
        if !report.passed && self.config.quality.fail_job_on_blocking_gate {
            job.fail(
                Phase::Quality,
                format!("blocking quality gates failed: {}", report.blocking_failures.join(", ")),
            );
            return self.finish(job, started);
        }

        // load: staging is local disk work and is awaited in full, so the
        // staging directory is always settled before the job returns
        let phase = Instant::now();
        let task = {
            let writer = self.writer.clone();
            let pipeline = name.clone();
            let job_id = job_id.clone();
            tokio::task::spawn_blocking(move || -> Result<StagedWrite> {
                let mut staged = writer.stage(&pipeline, &job_id)?;
                for table in model.tables.values() {
                    staged.write_table(table)?;
                }
                Ok(staged)
            })
        };
        let staged = match task.await {
            Ok(Ok(staged)) => staged,
            Ok(Err(e)) => {
                job.record_phase(Phase::Load, phase.elapsed());
                job.fail(Phase::Load, e.to_string());
                return self.finish(job, started);
            }
            Err(e) => {
                job.record_phase(Phase::Load, phase.elapsed());
                job.fail(Phase::Load, format!("writer panicked: {}", e));
                return self.finish(job, started);
            }
        };

        // commit point: once the job leaves the active set, cancel() no longer
        // reaches it, so a cancellation seen here is the last one possible
        self.active_jobs().remove(&job_id);
        if cancel.is_cancelled() {
            let _ = tokio::task::spawn_blocking(move || staged.discard()).await;
            job.record_phase(Phase::Load, phase.elapsed());
            job.cancel(Phase::Load);
            return self.finish(job, started);
        }
        let published = tokio::task::spawn_blocking(move || staged.publish()).await;
        job.record_phase(Phase::Load, phase.elapsed());
        match published {
            Ok(Ok(paths)) => {
                result.output_paths = paths.clone();
                job.output_paths = paths;
                job.transformation = Some(result);
            }
            Ok(Err(e)) => {
                job.fail(Phase::Load, e.to_string());
                return self.finish(job, started);
            }
            Err(e) => {
                job.fail(Phase::Load, format!("writer panicked: {}", e));
                return self.finish(job, started);
            }
        }

        self.track(&mut job, JobStatus::Completed);
        self.finish(job, started)
    }

    /// Advance the job and mirror it into history. A refused transition
    /// means the job already ended, which `finish` reports.
    fn track(&self, job: &mut JobResult, next: JobStatus) {
        match job.advance(next) {
            Ok(()) => {
                info!("Job {} is {}", job.job_id, job.status);
                self.history.upsert(job);
            }
            Err(e) => warn!("{}", e),
        }
    }

    fn finish(&self, job: JobResult, started: Instant) -> JobResult {
        self.active_jobs().remove(&job.job_id);
        if let Err(e) = self.history.record(&job) {
            error!("Failed to persist job {}: {}", job.job_id, e);
        }

        ::metrics::counter!(
            "etl_jobs_total",
            "pipeline" => job.pipeline.clone(),
            "status" => job.status.to_string()
        )
        .increment(1);
        ::metrics::histogram!("etl_job_duration_seconds", "pipeline" => job.pipeline.clone())
            .record(started.elapsed().as_secs_f64());
        for (phase, secs) in &job.phase_durations {
            ::metrics::histogram!("etl_phase_duration_seconds", "phase" => phase.clone()).record(*secs);
        }

        match job.status {
            JobStatus::Completed => info!(
                "✅ Job {} completed: {} records, {} rows in {:.2}s",
                job.job_id,
                job.records_extracted,
                job.total_rows,
                started.elapsed().as_secs_f64()
            ),
            JobStatus::Cancelled => warn!("🛑 Job {} cancelled", job.job_id),
            _ => error!(
                "❌ Job {} failed in {} phase: {}",
                job.job_id,
                job.failed_phase.as_deref().unwrap_or("unknown"),
                job.error.as_deref().unwrap_or("unknown error")
            ),
        }
        job
    }

    fn active_jobs(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancelHandle>> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Request cancellation of a running job. False when the job is unknown
    /// or already finished.
    pub fn cancel(&self, job_id: &str) -> bool {
        match self.active_jobs().get(job_id) {
            Some(handle) => {
                info!("Cancellation requested for job {}", job_id);
                handle.cancel();
                true
            }
            None => false,
        }
    }

    pub fn get_job(&self, job_id: &str) -> Option<JobResult> {
        self.history.get(job_id)
    }

    /// Jobs newest first.
    pub fn list_jobs(&self, limit: Option<usize>) -> Vec<JobResult> {
        self.history.list(limit)
    }

    fn selected(&self, names: Option<&[String]>, skip_credential_required: bool) -> Vec<String> {
        let names = names
            .map(<[String]>::to_vec)
            .unwrap_or_else(|| self.registry.pipeline_names());
        names
            .into_iter()
            .filter(|name| match self.registry.check_pipeline_status(name) {
                PipelineStatus::RequiresCredential if skip_credential_required => {
                    info!("⏭️ Skipping {}: credential not configured", name);
                    false
                }
                PipelineStatus::Disabled => {
                    info!("⏭️ Skipping {}: disabled", name);
                    false
                }
                _ => true,
            })
            .collect()
    }

    /// Run pipelines one after another, skipping unavailable ones.
    pub async fn run_all_pipelines(
        &self,
        names: Option<&[String]>,
        skip_credential_required: bool,
    ) -> Vec<JobResult> {
        let mut results = Vec::new();
        for name in self.selected(names, skip_credential_required) {
            results.push(self.run_pipeline(&name, None).await);
        }
        results
    }

    /// Like [`run_all_pipelines`](Self::run_all_pipelines) with at most
    /// `max_parallel` jobs in flight. Results keep the input order.
    pub async fn run_all_pipelines_concurrently(
        &self,
        names: Option<&[String]>,
        skip_credential_required: bool,
        max_parallel: usize,
    ) -> Vec<JobResult> {
        let semaphore = Arc::new(Semaphore::new(max_parallel.max(1)));
        let mut set = JoinSet::new();
        for (index, name) in self.selected(names, skip_credential_required).into_iter().enumerate() {
            let this = self.clone();
            let semaphore = Arc::clone(&semaphore);
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                (index, this.run_pipeline(&name, None).await)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(pair) => results.push(pair),
                Err(e) => error!("Pipeline task aborted: {}", e),
            }
        }
        results.sort_by_key(|(index, _)| *index);
        results.into_iter().map(|(_, job)| job).collect()
    }

    pub fn get_summary(&self) -> OrchestratorSummary {
        let pipelines = self.registry.list_pipelines();
        let jobs = self.history.list(None);
        let count = |status: JobStatus| jobs.iter().filter(|j| j.status == status).count();
        let completed = count(JobStatus::Completed);
        let finished = jobs.iter().filter(|j| j.status.is_terminal()).count();

        OrchestratorSummary {
            registered_pipelines: pipelines.len(),
            available_pipelines: pipelines
                .iter()
                .filter(|p| p.status == PipelineStatus::Available)
                .count(),
            credential_gated_pipelines: pipelines
                .iter()
                .filter(|p| p.status == PipelineStatus::RequiresCredential)
                .count(),
            disabled_pipelines: pipelines
                .iter()
                .filter(|p| p.status == PipelineStatus::Disabled)
                .count(),
            total_jobs: jobs.len(),
            completed_jobs: completed,
            failed_jobs: count(JobStatus::Failed),
            cancelled_jobs: count(JobStatus::Cancelled),
            active_jobs: jobs.len() - finished,
            total_rows_processed: jobs
                .iter()
                .filter(|j| j.status == JobStatus::Completed)
                .map(|j| j.total_rows)
                .sum(),
            total_records_extracted: jobs.iter().map(|j| j.records_extracted).sum(),
            success_rate: if finished == 0 {
                0.0
            } else {
                completed as f64 / finished as f64
            },
        }
    }
}
