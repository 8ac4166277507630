//! Job history: in-memory view of every job plus an on-disk store.
//!
//! Layout under the history directory:
//! - `<job_id>.json` holds the full terminal `JobResult`
//! - `index.ndjson` is an append-only log with one line per terminal job
//!
//! Writes are serialized behind a mutex so concurrent jobs never interleave
//! index lines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::job::{JobResult, JobStatus};
use crate::error::Result;

pub const INDEX_FILE: &str = "index.ndjson";

/// One line of `index.ndjson`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub job_id: String,
    pub pipeline: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub file: String,
}

pub struct JobHistory {
    dir: Option<PathBuf>,
    jobs: Mutex<BTreeMap<String, JobResult>>,
    writer: Mutex<()>,
}

fn guard<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl JobHistory {
    /// History kept only in memory.
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            jobs: Mutex::new(BTreeMap::new()),
            writer: Mutex::new(()),
        }
    }

    /// Open the store at `dir`, creating it if needed, and rehydrate every
    /// job listed in the index.
    pub fn load(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let mut jobs = BTreeMap::new();

        let index = dir.join(INDEX_FILE);
        if index.exists() {
            let reader = BufReader::new(fs::File::open(&index)?);
            for (n, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let entry: IndexEntry = match serde_json::from_str(&line) {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!("Skipping malformed history index line {}: {}", n + 1, e);
                        continue;
                    }
                };
                match read_job(&dir.join(&entry.file)) {
                    Ok(job) => {
                        jobs.insert(job.job_id.clone(), job);
                    }
                    Err(e) => warn!("History entry {} has no readable job file: {}", entry.job_id, e),
                }
            }
        }

        info!("📚 Loaded {} jobs from {}", jobs.len(), dir.display());
        Ok(Self {
            dir: Some(dir),
            jobs: Mutex::new(jobs),
            writer: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Track an in-flight job without persisting it.
    pub fn upsert(&self, job: &JobResult) {
        guard(&self.jobs).insert(job.job_id.clone(), job.clone());
    }

    /// Store a job. Terminal jobs are also written to disk.
    pub fn record(&self, job: &JobResult) -> Result<()> {
        self.upsert(job);
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        if !job.status.is_terminal() {
            return Ok(());
        }

        let _lock = guard(&self.writer);
        let file = format!("{}.json", job.job_id);
        let tmp = dir.join(format!(".{}.tmp", file));
        fs::write(&tmp, serde_json::to_vec_pretty(job)?)?;
        fs::rename(&tmp, dir.join(&file))?;

        let entry = IndexEntry {
            job_id: job.job_id.clone(),
            pipeline: job.pipeline.clone(),
            status: job.status,
            created_at: job.created_at,
            completed_at: job.completed_at,
            file,
        };
        let mut index = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(INDEX_FILE))?;
        writeln!(index, "{}", serde_json::to_string(&entry)?)?;
        debug!("Persisted job {} ({})", job.job_id, job.status);
        Ok(())
    }

    pub fn get(&self, job_id: &str) -> Option<JobResult> {
        guard(&self.jobs).get(job_id).cloned()
    }

    /// Jobs newest first, optionally capped.
    pub fn list(&self, limit: Option<usize>) -> Vec<JobResult> {
        let jobs = guard(&self.jobs);
        let mut out: Vec<JobResult> = jobs.values().cloned().collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.job_id.cmp(&a.job_id)));
        if let Some(limit) = limit {
            out.truncate(limit);
        }
        out
    }

    pub fn len(&self) -> usize {
        guard(&self.jobs).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn read_job(path: &Path) -> Result<JobResult> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::job::Phase;
    use tempfile::TempDir;

    fn finished(id: &str) -> JobResult {
        let mut job = JobResult::new(id, "crypto");
        job.advance(JobStatus::Running).unwrap();
        job.fail(Phase::Extract, "source down");
        job
    }

    #[test]
    fn test_terminal_jobs_survive_reload() {
        let dir = TempDir::new().unwrap();
        let history = JobHistory::load(dir.path()).unwrap();
        history.record(&finished("ETL-a")).unwrap();
        history.record(&finished("ETL-b")).unwrap();

        let running = JobResult::new("ETL-c", "crypto");
        history.record(&running).unwrap();
        assert_eq!(history.len(), 3);

        let reloaded = JobHistory::load(dir.path()).unwrap();
        assert_eq!(reloaded.len(), 2);
        let job = reloaded.get("ETL-a").unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("source down"));
        assert!(reloaded.get("ETL-c").is_none());
    }

    #[test]
    fn test_index_is_append_only() {
        let dir = TempDir::new().unwrap();
        let history = JobHistory::load(dir.path()).unwrap();
        history.record(&finished("ETL-a")).unwrap();
        history.record(&finished("ETL-b")).unwrap();
        let index = fs::read_to_string(dir.path().join(INDEX_FILE)).unwrap();
        assert_eq!(index.lines().count(), 2);
    }

    #[test]
    fn test_list_is_newest_first_and_limited() {
        let history = JobHistory::in_memory();
        history.record(&finished("ETL-1")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        history.record(&finished("ETL-2")).unwrap();
        let jobs = history.list(Some(1));
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_id, "ETL-2");
    }
}
