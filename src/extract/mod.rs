//! Extractor contract: rate-limited, retrying fetch of raw records from one source.

pub mod http_client;
pub mod paginate;
pub mod rate_limiter;
pub mod retry;
pub mod sources;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::watch;

use crate::table::Record;

pub use http_client::{JsonFetcher, SourceClient, SourceError};

/// Core trait that every data source must implement.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Stable source identifier (e.g. `COINGECKO`).
    fn source_name(&self) -> &'static str;

    /// Declared request budget in requests per minute.
    fn rate_limit(&self) -> u32;

    /// Fetch raw records. Failures are reported on the result, never raised.
    async fn extract(&self, params: &ExtractParams, cancel: &CancelSignal) -> ExtractionResult;
}

/// Caller parameters merged over registry defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExtractParams(pub Map<String, Value>);

impl ExtractParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    /// Overlay `other` on top of `self`; keys in `other` win.
    pub fn merged(mut self, other: &Map<String, Value>) -> Self {
        for (k, v) in other {
            self.0.insert(k.clone(), v.clone());
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn usize_or(&self, key: &str, default: usize) -> usize {
        match self.0.get(key) {
            Some(Value::Number(n)) => n.as_u64().map(|v| v as usize).unwrap_or(default),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(default),
            _ => default,
        }
    }

    pub fn str_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.0.get(key).and_then(Value::as_str).unwrap_or(default)
    }

    pub fn bool_or(&self, key: &str, default: bool) -> bool {
        match self.0.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => matches!(s.trim(), "true" | "1" | "yes"),
            _ => default,
        }
    }

    /// List parameter given as an array or as a comma-separated string.
    pub fn list_or(&self, key: &str, default: &[&str]) -> Vec<String> {
        match self.0.get(key) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            Some(Value::String(s)) => s
                .split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect(),
            _ => default.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Optional row budget shared by every extractor.
    pub fn row_budget(&self) -> Option<usize> {
        self.0
            .get("limit")
            .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
            .map(|v| v as usize)
    }
}

/// Outcome of one extraction phase. Immutable once returned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub success: bool,
    pub source: String,
    #[serde(skip)]
    pub records: Vec<Record>,
    pub records_extracted: usize,
    pub records_failed: usize,
    pub api_calls: u64,
    /// Total the source claims to hold, when it reports one.
    pub reported_total: Option<usize>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub warnings: Vec<String>,
    pub metadata: Map<String, Value>,
}

impl ExtractionResult {
    pub fn start(source: &str) -> Self {
        Self {
            success: false,
            source: source.to_string(),
            records: Vec::new(),
            records_extracted: 0,
            records_failed: 0,
            api_calls: 0,
            reported_total: None,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
            warnings: Vec::new(),
            metadata: Map::new(),
        }
    }

    pub fn add_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    pub fn succeed(mut self, records: Vec<Record>, api_calls: u64) -> Self {
        self.records_extracted = records.len();
        self.records = records;
        self.api_calls = api_calls;
        self.success = true;
        self.completed_at = Some(Utc::now());
        self
    }

    pub fn fail(mut self, error: impl Into<String>, api_calls: u64) -> Self {
        self.success = false;
        self.error = Some(error.into());
        self.api_calls = api_calls;
        self.completed_at = Some(Utc::now());
        self
    }

    /// True when the source reported more rows than were extracted.
    pub fn is_partial(&self) -> bool {
        self.records_failed > 0
            || self
                .reported_total
                .map_or(false, |total| self.records_extracted < total)
    }
}

/// Sender half of a job's cancellation signal.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Receiver half; cloned into every phase of a job.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested. Pends forever if the handle is dropped.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_params_merge_and_accessors() {
        let defaults = ExtractParams::new()
            .with("limit", 100)
            .with("vs_currency", "usd");
        let mut overrides = Map::new();
        overrides.insert("limit".into(), json!("25"));
        let params = defaults.merged(&overrides);
        assert_eq!(params.usize_or("limit", 0), 25);
        assert_eq!(params.row_budget(), Some(25));
        assert_eq!(params.str_or("vs_currency", "eur"), "usd");
        assert!(params.bool_or("include_details", true));
    }

    #[test]
    fn test_list_param_forms() {
        let p = ExtractParams::new().with("leagues", "nfl, nba");
        assert_eq!(p.list_or("leagues", &[]), vec!["nfl", "nba"]);
        let p = ExtractParams::new().with("leagues", json!(["mlb"]));
        assert_eq!(p.list_or("leagues", &[]), vec!["mlb"]);
        assert_eq!(ExtractParams::new().list_or("leagues", &["nhl"]), vec!["nhl"]);
    }

    #[test]
    fn test_partial_detection() {
        let mut r = ExtractionResult::start("X").succeed(vec![Record::new()], 1);
        assert!(!r.is_partial());
        r.reported_total = Some(10);
        assert!(r.is_partial());
    }

    #[tokio::test]
    async fn test_cancel_signal() {
        let (handle, signal) = cancel_pair();
        assert!(!signal.is_cancelled());
        handle.cancel();
        assert!(signal.is_cancelled());
        signal.cancelled().await;
        assert!(!CancelSignal::never().is_cancelled());
    }
}
