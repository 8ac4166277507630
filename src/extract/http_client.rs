use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use super::rate_limiter::{Limits, RateLimiter};
use super::retry::RetryPolicy;
use super::CancelSignal;
use crate::config::HttpConfig;
use crate::error::EtlError;

/// Failure of a single source request after retries.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SourceError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("rate limited by source")]
    RateLimited { retry_after: Option<Duration> },

    #[error("authentication rejected (HTTP {status})")]
    Auth { status: u16 },

    #[error("request rejected (HTTP {status})")]
    Client { status: u16 },

    #[error("response could not be decoded: {0}")]
    Decode(String),

    #[error("request cancelled")]
    Cancelled,
}

impl SourceError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SourceError::Transient(_) | SourceError::RateLimited { .. }
        )
    }

    pub fn into_etl(self, source: &str) -> EtlError {
        match self {
            SourceError::Auth { .. } => EtlError::Authentication {
                source_name: source.to_string(),
                message: self.to_string(),
            },
            SourceError::Cancelled => EtlError::Cancelled(source.to_string()),
            other => EtlError::SourceUnavailable {
                source_name: source.to_string(),
                message: other.to_string(),
            },
        }
    }
}

/// Anything that can fetch one JSON document. Implemented by [`SourceClient`];
/// tests substitute canned responses.
#[async_trait]
pub trait JsonFetcher: Send + Sync {
    async fn get_json(
        &self,
        url: &str,
        query: &[(String, String)],
        cancel: &CancelSignal,
    ) -> Result<Value, SourceError>;

    /// Number of requests sent so far, retries included.
    fn api_calls(&self) -> u64;
}

/// Where an API key is attached to outgoing requests.
#[derive(Debug, Clone)]
pub enum ApiKeyPlacement {
    Query(&'static str),
    Header(&'static str),
    Bearer,
}

#[derive(Debug, Clone)]
struct ApiKey {
    value: String,
    placement: ApiKeyPlacement,
}

/// Rate-limited, retrying HTTP client scoped to one source.
#[derive(Debug)]
pub struct SourceClient {
    source: &'static str,
    client: Client,
    limiter: RateLimiter,
    retry: RetryPolicy,
    timeout: Duration,
    api_key: Option<ApiKey>,
    calls: AtomicU64,
}

impl SourceClient {
    pub fn new(source: &'static str, requests_per_min: u32, http: &HttpConfig) -> Result<Self, EtlError> {
        let client = Client::builder()
            .user_agent(http.user_agent.clone())
            .gzip(true)
            .build()?;
        Ok(Self {
            source,
            client,
            limiter: RateLimiter::new(Limits::per_minute(requests_per_min)),
            retry: RetryPolicy::from_config(http),
            timeout: http.timeout(),
            api_key: None,
            calls: AtomicU64::new(0),
        })
    }

    pub fn with_api_key(mut self, value: impl Into<String>, placement: ApiKeyPlacement) -> Self {
        self.api_key = Some(ApiKey {
            value: value.into(),
            placement,
        });
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn requests_per_min(&self) -> u32 {
        self.limiter.requests_per_min()
    }

    async fn send_once(&self, url: &str, query: &[(String, String)]) -> Result<Value, SourceError> {
        let mut request = self.client.get(url).query(query).timeout(self.timeout);
        if let Some(key) = &self.api_key {
            request = match key.placement {
                ApiKeyPlacement::Query(param) => request.query(&[(param, key.value.as_str())]),
                ApiKeyPlacement::Header(name) => request.header(name, key.value.as_str()),
                ApiKeyPlacement::Bearer => request.bearer_auth(&key.value),
            };
        }

        self.calls.fetch_add(1, Ordering::Relaxed);
        ::metrics::counter!("etl_source_requests_total", "source" => self.source).increment(1);

        let response = request
            .send()
            .await
            .map_err(|e| SourceError::Transient(e.to_string()))?;
        let status = response.status();

        if status.is_success() {
            return response
                .json::<Value>()
                .await
                .map_err(|e| SourceError::Decode(e.to_string()));
        }

        ::metrics::counter!(
            "etl_source_errors_total",
            "source" => self.source,
            "status" => status.as_u16().to_string()
        )
        .increment(1);

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            return Err(SourceError::RateLimited { retry_after });
        }
        Err(classify_status(status.as_u16(), &self.retry))
    }
}

fn classify_status(status: u16, retry: &RetryPolicy) -> SourceError {
    match status {
        401 | 403 => SourceError::Auth { status },
        s if retry.should_retry_status(s) => SourceError::Transient(format!("HTTP {}", s)),
        s => SourceError::Client { status: s },
    }
}

/// `Retry-After` in delta-seconds form. HTTP-date hints fall back to the backoff schedule.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

#[async_trait]
impl JsonFetcher for SourceClient {
    async fn get_json(
        &self,
        url: &str,
        query: &[(String, String)],
        cancel: &CancelSignal,
    ) -> Result<Value, SourceError> {
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(SourceError::Cancelled);
            }
            tokio::select! {
                _ = self.limiter.acquire() => {}
                _ = cancel.cancelled() => return Err(SourceError::Cancelled),
            }

            let outcome = tokio::select! {
                r = self.send_once(url, query) => r,
                _ = cancel.cancelled() => return Err(SourceError::Cancelled),
            };

            match outcome {
                Ok(value) => {
                    debug!("{} GET {} ok after {} attempt(s)", self.source, url, attempt + 1);
                    return Ok(value);
                }
                Err(e) if e.is_retryable() && attempt < self.retry.max_retries => {
                    let hint = match &e {
                        SourceError::RateLimited { retry_after } => *retry_after,
                        _ => None,
                    };
                    let delay = self.retry.delay_for(attempt, hint);
                    warn!(
                        "⏳ {} request to {} failed ({}), retry {}/{} in {:?}",
                        self.source,
                        url,
                        e,
                        attempt + 1,
                        self.retry.max_retries,
                        delay
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(SourceError::Cancelled),
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn api_calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let retry = RetryPolicy::default();
        assert_eq!(classify_status(401, &retry), SourceError::Auth { status: 401 });
        assert_eq!(classify_status(404, &retry), SourceError::Client { status: 404 });
        assert!(classify_status(503, &retry).is_retryable());
        assert!(!classify_status(400, &retry).is_retryable());
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after(" 7 "), Some(Duration::from_secs(7)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }

    #[test]
    fn test_auth_maps_to_authentication_error() {
        let err = SourceError::Auth { status: 401 }.into_etl("TMDB");
        assert!(matches!(err, EtlError::Authentication { .. }));
        let err = SourceError::Transient("boom".into()).into_etl("ESPN");
        assert!(matches!(err, EtlError::SourceUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_cancelled_before_send() {
        let (handle, signal) = super::super::cancel_pair();
        handle.cancel();
        let client = SourceClient::new("TEST", 0, &HttpConfig::default()).unwrap();
        let err = client
            .get_json("http://127.0.0.1:9/never", &[], &signal)
            .await
            .unwrap_err();
        assert_eq!(err, SourceError::Cancelled);
        assert_eq!(client.api_calls(), 0);
    }
}
