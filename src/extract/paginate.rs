use serde_json::Value;
use tracing::{debug, warn};

use super::http_client::{JsonFetcher, SourceError};
use super::CancelSignal;

/// Where the items of one page live in the response body.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultsShape {
    /// The body is the item array.
    Root,
    /// The item array sits under this key.
    Key(&'static str),
    /// The body is an object whose values are the items.
    ObjectValues,
}

/// Page/per_page pagination over a JSON endpoint.
#[derive(Debug, Clone)]
pub struct PageSpec {
    pub url: String,
    pub query: Vec<(String, String)>,
    pub page_param: &'static str,
    /// `None` when the source uses a fixed page size.
    pub per_page_param: Option<&'static str>,
    pub per_page: usize,
    pub first_page: u32,
    pub max_pages: Option<u32>,
    pub results: ResultsShape,
    /// Key holding the source's reported total, if it has one.
    pub total_key: Option<&'static str>,
}

#[derive(Debug, Default)]
pub struct PageOutcome {
    pub items: Vec<Value>,
    pub pages_fetched: u32,
    pub reported_total: Option<usize>,
    /// Error that stopped pagination early.
    pub error: Option<SourceError>,
}

impl PageOutcome {
    /// An error on the very first page means nothing usable was fetched.
    pub fn failed_outright(&self) -> bool {
        self.error.is_some() && self.pages_fetched == 0
    }
}

fn page_items(body: Value, shape: &ResultsShape) -> Result<Vec<Value>, SourceError> {
    match (shape, body) {
        (ResultsShape::Root, Value::Array(items)) => Ok(items),
        (ResultsShape::Key(key), Value::Object(mut map)) => match map.remove(*key) {
            Some(Value::Array(items)) => Ok(items),
            Some(Value::Null) | None => Ok(Vec::new()),
            Some(_) => Err(SourceError::Decode(format!("'{}' is not an array", key))),
        },
        (ResultsShape::ObjectValues, Value::Object(map)) => Ok(map.into_iter().map(|(_, v)| v).collect()),
        (_, other) => Err(SourceError::Decode(format!(
            "unexpected page body of type {}",
            json_type(&other)
        ))),
    }
}

fn json_type(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Walk pages until a short page, the page cap, the row budget or an error.
pub async fn paginate(
    fetcher: &dyn JsonFetcher,
    spec: &PageSpec,
    row_budget: Option<usize>,
    cancel: &CancelSignal,
) -> PageOutcome {
    let mut outcome = PageOutcome::default();
    let mut page = spec.first_page;

    loop {
        if let Some(max) = spec.max_pages {
            if outcome.pages_fetched >= max {
                break;
            }
        }
        if cancel.is_cancelled() {
            outcome.error = Some(SourceError::Cancelled);
            break;
        }

        let mut query = spec.query.clone();
        query.push((spec.page_param.to_string(), page.to_string()));
        if let Some(param) = spec.per_page_param {
            query.push((param.to_string(), spec.per_page.to_string()));
        }

        let body = match fetcher.get_json(&spec.url, &query, cancel).await {
            Ok(body) => body,
            Err(e) => {
                warn!("Pagination of {} stopped at page {}: {}", spec.url, page, e);
                outcome.error = Some(e);
                break;
            }
        };

        if outcome.reported_total.is_none() {
            if let Some(key) = spec.total_key {
                outcome.reported_total = body.get(key).and_then(Value::as_u64).map(|n| n as usize);
            }
        }

        let items = match page_items(body, &spec.results) {
            Ok(items) => items,
            Err(e) => {
                outcome.error = Some(e);
                break;
            }
        };
        outcome.pages_fetched += 1;
        let fetched = items.len();
        debug!("Page {} of {} returned {} items", page, spec.url, fetched);
        outcome.items.extend(items);

        if let Some(budget) = row_budget {
            if outcome.items.len() >= budget {
                outcome.items.truncate(budget);
                break;
            }
        }
        if fetched == 0 || fetched < spec.per_page {
            break;
        }
        page += 1;
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    /// Serves canned pages in order; runs out with a transient error.
    struct CannedPages {
        pages: Mutex<Vec<Result<Value, SourceError>>>,
        calls: AtomicU64,
    }

    impl CannedPages {
        fn new(mut pages: Vec<Result<Value, SourceError>>) -> Self {
            pages.reverse();
            Self {
                pages: Mutex::new(pages),
                calls: AtomicU64::new(0),
            }
        }
    }

    #[async_trait]
    impl JsonFetcher for CannedPages {
        async fn get_json(
            &self,
            _url: &str,
            _query: &[(String, String)],
            _cancel: &CancelSignal,
        ) -> Result<Value, SourceError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            self.pages
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(SourceError::Transient("exhausted".into())))
        }

        fn api_calls(&self) -> u64 {
            self.calls.load(Ordering::Relaxed)
        }
    }

    fn spec(per_page: usize) -> PageSpec {
        PageSpec {
            url: "http://source/items".into(),
            query: vec![],
            page_param: "page",
            per_page_param: Some("per_page"),
            per_page,
            first_page: 1,
            max_pages: Some(10),
            results: ResultsShape::Root,
            total_key: None,
        }
    }

    #[tokio::test]
    async fn test_stops_on_short_page() {
        let fetcher = CannedPages::new(vec![Ok(json!([1, 2])), Ok(json!([3]))]);
        let out = paginate(&fetcher, &spec(2), None, &CancelSignal::never()).await;
        assert_eq!(out.items.len(), 3);
        assert_eq!(out.pages_fetched, 2);
        assert!(out.error.is_none());
    }

    #[tokio::test]
    async fn test_row_budget_truncates() {
        let fetcher = CannedPages::new(vec![Ok(json!([1, 2])), Ok(json!([3, 4]))]);
        let out = paginate(&fetcher, &spec(2), Some(3), &CancelSignal::never()).await;
        assert_eq!(out.items, vec![json!(1), json!(2), json!(3)]);
        assert_eq!(fetcher.api_calls(), 2);
    }

    #[tokio::test]
    async fn test_mid_stream_error_keeps_earlier_pages() {
        let fetcher = CannedPages::new(vec![
            Ok(json!([1, 2])),
            Err(SourceError::Transient("HTTP 503".into())),
        ]);
        let out = paginate(&fetcher, &spec(2), None, &CancelSignal::never()).await;
        assert_eq!(out.items.len(), 2);
        assert!(out.error.is_some());
        assert!(!out.failed_outright());
    }

    #[tokio::test]
    async fn test_keyed_results_and_total() {
        let mut s = spec(2);
        s.results = ResultsShape::Key("results");
        s.total_key = Some("total_results");
        let fetcher = CannedPages::new(vec![Ok(json!({"results": [{"id": 1}], "total_results": 40}))]);
        let out = paginate(&fetcher, &s, None, &CancelSignal::never()).await;
        assert_eq!(out.items.len(), 1);
        assert_eq!(out.reported_total, Some(40));
    }

    #[tokio::test]
    async fn test_first_page_failure() {
        let fetcher = CannedPages::new(vec![Err(SourceError::Auth { status: 401 })]);
        let out = paginate(&fetcher, &spec(2), None, &CancelSignal::never()).await;
        assert!(out.failed_outright());
    }
}
