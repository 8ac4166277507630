pub mod coingecko;
pub mod espn;
pub mod steamspy;
pub mod tmdb;

pub use coingecko::CoinGeckoExtractor;
pub use espn::EspnExtractor;
pub use steamspy::SteamSpyExtractor;
pub use tmdb::TmdbExtractor;

use chrono::{SecondsFormat, Utc};
use serde_json::Value;

/// One timestamp shared by every record of an extraction run.
pub(crate) fn extraction_stamp() -> Value {
    Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true))
}

/// Scalar field or null. Nested values are not carried into flat records.
pub(crate) fn scalar(obj: &Value, key: &str) -> Value {
    match obj.get(key) {
        Some(Value::Array(_)) | Some(Value::Object(_)) | None => Value::Null,
        Some(v) => v.clone(),
    }
}

/// String field with blanks mapped to null.
pub(crate) fn text(obj: &Value, key: &str) -> Value {
    match obj.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Value::String(s.clone()),
        Some(Value::Number(n)) => Value::String(n.to_string()),
        _ => Value::Null,
    }
}

/// Comma-joined form of a list of scalars; empty lists become null.
pub(crate) fn join_list<'a, I>(items: I) -> Value
where
    I: IntoIterator<Item = &'a Value>,
{
    let parts: Vec<String> = items
        .into_iter()
        .filter_map(|v| match v {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        Value::Null
    } else {
        Value::String(parts.join(","))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Canned-response fetcher shared by the source tests.

    use async_trait::async_trait;
    use serde_json::Value;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    use crate::extract::{CancelSignal, JsonFetcher, SourceError};

    /// Routes by URL plus the `page` or `appid` query value; unknown routes
    /// return 404.
    #[derive(Default)]
    pub struct RoutedFetcher {
        routes: Mutex<HashMap<String, Result<Value, SourceError>>>,
        calls: AtomicU64,
    }

    impl RoutedFetcher {
        pub fn route(self, url: &str, page: Option<u32>, body: Result<Value, SourceError>) -> Self {
            self.routes.lock().unwrap().insert(route_key(url, page), body);
            self
        }

        pub fn route_app(self, url: &str, app_id: u64, body: Result<Value, SourceError>) -> Self {
            self.routes.lock().unwrap().insert(app_key(url, &app_id.to_string()), body);
            self
        }
    }

    fn route_key(url: &str, page: Option<u32>) -> String {
        match page {
            Some(p) => format!("{}#{}", url, p),
            None => url.to_string(),
        }
    }

    fn app_key(url: &str, app_id: &str) -> String {
        format!("{}?appid={}", url, app_id)
    }

    #[async_trait]
    impl JsonFetcher for RoutedFetcher {
        async fn get_json(
            &self,
            url: &str,
            query: &[(String, String)],
            _cancel: &CancelSignal,
        ) -> Result<Value, SourceError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            let page = query
                .iter()
                .find(|(k, _)| k == "page")
                .and_then(|(_, v)| v.parse().ok());
            let routes = self.routes.lock().unwrap();
            if let Some((_, app_id)) = query.iter().find(|(k, _)| k == "appid") {
                return routes
                    .get(&app_key(url, app_id))
                    .cloned()
                    .unwrap_or(Err(SourceError::Client { status: 404 }));
            }
            routes
                .get(&route_key(url, page))
                .or_else(|| routes.get(url))
                .cloned()
                .unwrap_or(Err(SourceError::Client { status: 404 }))
        }

        fn api_calls(&self) -> u64 {
            self.calls.load(Ordering::Relaxed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_join_list_skips_blanks() {
        let v = json!(["DeFi", " ", "Layer 1", 7]);
        assert_eq!(join_list(v.as_array().unwrap()), json!("DeFi,Layer 1,7"));
        assert_eq!(join_list(json!([]).as_array().unwrap()), Value::Null);
    }

    #[test]
    fn test_scalar_and_text() {
        let obj = json!({"a": 1, "b": "", "c": [1], "d": "x"});
        assert_eq!(scalar(&obj, "a"), json!(1));
        assert_eq!(scalar(&obj, "c"), Value::Null);
        assert_eq!(text(&obj, "b"), Value::Null);
        assert_eq!(text(&obj, "d"), json!("x"));
        assert_eq!(text(&obj, "a"), json!("1"));
    }
}
