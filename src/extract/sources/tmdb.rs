use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use super::{extraction_stamp, join_list, scalar, text};
use crate::config::EtlConfig;
use crate::constants::{EXTRACTED_AT_COLUMN, MEDIA_PIPELINE, TMDB_CREDENTIAL, TMDB_SOURCE};
use crate::error::{EtlError, Result};
use crate::extract::http_client::ApiKeyPlacement;
use crate::extract::paginate::{paginate, PageSpec, ResultsShape};
use crate::extract::{
    CancelSignal, ExtractParams, ExtractionResult, Extractor, JsonFetcher, SourceClient, SourceError,
};
use crate::table::Record;

const BASE_URL: &str = "https://api.themoviedb.org/3";
const PAGE_SIZE: usize = 20;
const MAX_PAGES: u32 = 500;

#[derive(Debug, Clone, Copy, PartialEq)]
enum MediaType {
    Movie,
    Tv,
}

impl MediaType {
    fn as_str(self) -> &'static str {
        match self {
            MediaType::Movie => "movie",
            MediaType::Tv => "tv",
        }
    }
}

/// Popular movies and TV shows from TMDb. Requires the `TMDB` credential.
pub struct TmdbExtractor {
    fetcher: Arc<dyn JsonFetcher>,
    rate_limit: u32,
}

impl TmdbExtractor {
    pub fn new(config: &EtlConfig, rate_limit: u32) -> Result<Self> {
        let key = config
            .credential(TMDB_CREDENTIAL)
            .ok_or_else(|| EtlError::MissingCredential {
                pipeline: MEDIA_PIPELINE.to_string(),
                credential: TMDB_CREDENTIAL.to_string(),
            })?;
        let client = SourceClient::new(TMDB_SOURCE, rate_limit, &config.http)?
            .with_api_key(key, ApiKeyPlacement::Query("api_key"));
        Ok(Self::with_fetcher(Arc::new(client), rate_limit))
    }

    pub fn with_fetcher(fetcher: Arc<dyn JsonFetcher>, rate_limit: u32) -> Self {
        Self { fetcher, rate_limit }
    }

    async fn genre_names(
        &self,
        media: MediaType,
        cancel: &CancelSignal,
    ) -> std::result::Result<HashMap<i64, String>, SourceError> {
        let url = format!("{}/genre/{}/list", BASE_URL, media.as_str());
        let body = self
            .fetcher
            .get_json(&url, &[("language".into(), "en-US".into())], cancel)
            .await?;
        Ok(body
            .get("genres")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|g| {
                let id = g.get("id")?.as_i64()?;
                let name = g.get("name")?.as_str()?.to_string();
                Some((id, name))
            })
            .collect())
    }
}

fn parse_title(
    item: &Value,
    media: MediaType,
    genres: &HashMap<i64, String>,
    stamp: &Value,
) -> Option<Record> {
    let id = item.get("id").and_then(Value::as_i64)?;
    let (title_key, original_key, date_key) = match media {
        MediaType::Movie => ("title", "original_title", "release_date"),
        MediaType::Tv => ("name", "original_name", "first_air_date"),
    };
    let genre_ids: Vec<Value> = item
        .get("genre_ids")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let genre_names: Vec<Value> = genre_ids
        .iter()
        .filter_map(Value::as_i64)
        .filter_map(|g| genres.get(&g).map(|n| Value::String(n.clone())))
        .collect();

    let mut r = Record::new();
    r.insert("tmdb_id".into(), json!(id));
    r.insert("media_type".into(), json!(media.as_str()));
    r.insert("title".into(), text(item, title_key));
    r.insert("original_title".into(), text(item, original_key));
    r.insert("original_language".into(), text(item, "original_language"));
    r.insert("release_date".into(), text(item, date_key));
    r.insert("popularity".into(), scalar(item, "popularity"));
    r.insert("vote_average".into(), scalar(item, "vote_average"));
    r.insert("vote_count".into(), scalar(item, "vote_count"));
    r.insert("adult".into(), item.get("adult").cloned().unwrap_or(json!(false)));
    r.insert("genre_ids".into(), join_list(&genre_ids));
    r.insert("genres".into(), join_list(&genre_names));
    r.insert(
        "origin_country".into(),
        item.get("origin_country")
            .and_then(Value::as_array)
            .map(|c| join_list(c))
            .unwrap_or(Value::Null),
    );
    r.insert(EXTRACTED_AT_COLUMN.into(), stamp.clone());
    Some(r)
}

#[async_trait]
impl Extractor for TmdbExtractor {
    fn source_name(&self) -> &'static str {
        TMDB_SOURCE
    }

    fn rate_limit(&self) -> u32 {
        self.rate_limit
    }

    async fn extract(&self, params: &ExtractParams, cancel: &CancelSignal) -> ExtractionResult {
        let mut result = ExtractionResult::start(self.source_name());
        let budgets = [
            (MediaType::Movie, params.usize_or("movies_limit", 100)),
            (MediaType::Tv, params.usize_or("tv_limit", 100)),
        ];
        info!("🎬 Starting TMDb extraction (movies={}, tv={})", budgets[0].1, budgets[1].1);

        let stamp = extraction_stamp();
        let mut records = Vec::new();
        let mut expected_total = 0usize;
        let mut kinds_ok = 0usize;
        let mut last_error: Option<SourceError> = None;

        for (media, limit) in budgets {
            if limit == 0 {
                continue;
            }
            let genres = match self.genre_names(media, cancel).await {
                Ok(g) => g,
                Err(SourceError::Cancelled) => {
                    return result.fail("Extraction cancelled", self.fetcher.api_calls());
                }
                Err(e @ SourceError::Auth { .. }) => {
                    return result.fail(
                        format!("TMDb rejected the API key: {}", e),
                        self.fetcher.api_calls(),
                    );
                }
                Err(e) => {
                    warn!("Genre list for {} unavailable: {}", media.as_str(), e);
                    result.add_warning(format!("{} genres: {}", media.as_str(), e));
                    HashMap::new()
                }
            };

            let spec = PageSpec {
                url: format!("{}/{}/popular", BASE_URL, media.as_str()),
                query: vec![("language".into(), "en-US".into())],
                page_param: "page",
                per_page_param: None,
                per_page: PAGE_SIZE,
                first_page: 1,
                max_pages: Some(MAX_PAGES),
                results: ResultsShape::Key("results"),
                total_key: Some("total_results"),
            };
            let outcome = paginate(self.fetcher.as_ref(), &spec, Some(limit), cancel).await;
            match &outcome.error {
                Some(SourceError::Cancelled) => {
                    return result.fail("Extraction cancelled", self.fetcher.api_calls());
                }
                Some(e @ SourceError::Auth { .. }) => {
                    return result.fail(
                        format!("TMDb rejected the API key: {}", e),
                        self.fetcher.api_calls(),
                    );
                }
                Some(e) if outcome.failed_outright() => {
                    result.add_warning(format!("{} popular: {}", media.as_str(), e));
                    last_error = Some(e.clone());
                    continue;
                }
                Some(e) => {
                    result.add_warning(format!(
                        "{} popular stopped after {} page(s): {}",
                        media.as_str(),
                        outcome.pages_fetched,
                        e
                    ));
                }
                None => {}
            }

            kinds_ok += 1;
            expected_total += outcome.reported_total.map_or(limit, |t| t.min(limit));
            for item in &outcome.items {
                match parse_title(item, media, &genres, &stamp) {
                    Some(r) => records.push(r),
                    None => result.records_failed += 1,
                }
            }
        }

        if kinds_ok == 0 {
            let reason = last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "nothing requested".to_string());
            return result.fail(format!("TMDb extraction failed: {}", reason), self.fetcher.api_calls());
        }

        result.reported_total = Some(expected_total);
        let api_calls = self.fetcher.api_calls();
        let result = result.succeed(records, api_calls);
        info!("✅ TMDb extraction complete: {} titles", result.records_extracted);
        result
    }
}
