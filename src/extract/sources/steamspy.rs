use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

use super::{extraction_stamp, scalar, text};
use crate::config::EtlConfig;
use crate::constants::{EXTRACTED_AT_COLUMN, STEAMSPY_SOURCE};
use crate::error::Result;
use crate::extract::paginate::{paginate, PageSpec, ResultsShape};
use crate::extract::{
    CancelSignal, ExtractParams, ExtractionResult, Extractor, JsonFetcher, SourceClient, SourceError,
};
use crate::table::{as_f64, Record};

const BASE_URL: &str = "https://steamspy.com/api.php";
const PAGE_SIZE: usize = 1000;
const MAX_TAGS: usize = 20;

/// Catalogue of the most-owned games from SteamSpy's bulk endpoint.
pub struct SteamSpyExtractor {
    fetcher: Arc<dyn JsonFetcher>,
    rate_limit: u32,
}

impl SteamSpyExtractor {
    pub fn new(config: &EtlConfig, rate_limit: u32) -> Result<Self> {
        let client = SourceClient::new(STEAMSPY_SOURCE, rate_limit, &config.http)?;
        Ok(Self::with_fetcher(Arc::new(client), rate_limit))
    }

    pub fn with_fetcher(fetcher: Arc<dyn JsonFetcher>, rate_limit: u32) -> Self {
        Self { fetcher, rate_limit }
    }
}

/// `"1,000,000 .. 2,000,000"` → (min, max).
fn parse_owners(raw: &str) -> Option<(u64, u64)> {
    let (lo, hi) = raw.split_once("..")?;
    let parse = |s: &str| s.trim().replace(',', "").parse::<u64>().ok();
    Some((parse(lo)?, parse(hi)?))
}

/// Top tags by vote count, ties broken by name, as a comma-joined list.
fn parse_tags(tags: Option<&Value>) -> Value {
    let Some(Value::Object(map)) = tags else {
        return Value::Null;
    };
    let mut ranked: Vec<(&String, u64)> = map
        .iter()
        .map(|(name, votes)| (name, votes.as_u64().unwrap_or(0)))
        .filter(|(name, _)| !name.trim().is_empty())
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
    if ranked.is_empty() {
        return Value::Null;
    }
    let names: Vec<&str> = ranked.iter().take(MAX_TAGS).map(|(n, _)| n.trim()).collect();
    Value::String(names.join(","))
}

fn parse_game(game: &Value, stamp: &Value) -> Option<Record> {
    let app_id = game.get("appid").and_then(|v| {
        v.as_u64()
            .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
    })?;

    let mut r = Record::new();
    r.insert("app_id".into(), json!(app_id));
    r.insert("name".into(), text(game, "name"));
    r.insert("developer".into(), text(game, "developer"));
    r.insert("publisher".into(), text(game, "publisher"));
    r.insert("genre".into(), text(game, "genre"));
    r.insert("tags".into(), parse_tags(game.get("tags")));

    let owners = game
        .get("owners")
        .and_then(Value::as_str)
        .and_then(parse_owners);
    match owners {
        Some((lo, hi)) => {
            r.insert("owners_min".into(), json!(lo));
            r.insert("owners_max".into(), json!(hi));
            r.insert("owners_estimate".into(), json!((lo + hi) / 2));
        }
        None => {
            for col in ["owners_min", "owners_max", "owners_estimate"] {
                r.insert(col.into(), Value::Null);
            }
        }
    }

    let positive = game.get("positive").and_then(as_f64);
    let negative = game.get("negative").and_then(as_f64);
    r.insert("positive_reviews".into(), scalar(game, "positive"));
    r.insert("negative_reviews".into(), scalar(game, "negative"));
    let review_score = match (positive, negative) {
        (Some(p), Some(n)) if p + n > 0.0 => json!(((p / (p + n)) * 10_000.0).round() / 100.0),
        _ => Value::Null,
    };
    r.insert("review_score".into(), review_score);

    r.insert("ccu".into(), scalar(game, "ccu"));
    r.insert("average_playtime_forever".into(), scalar(game, "average_forever"));
    r.insert("median_playtime_forever".into(), scalar(game, "median_forever"));
    // price arrives in cents, usually as a string
    let price = game
        .get("price")
        .and_then(as_f64)
        .map(|cents| json!(cents / 100.0))
        .unwrap_or(Value::Null);
    r.insert("price_usd".into(), price);
    r.insert(EXTRACTED_AT_COLUMN.into(), stamp.clone());
    Some(r)
}

#[async_trait]
impl Extractor for SteamSpyExtractor {
    fn source_name(&self) -> &'static str {
        STEAMSPY_SOURCE
    }

    fn rate_limit(&self) -> u32 {
        self.rate_limit
    }

    async fn extract(&self, params: &ExtractParams, cancel: &CancelSignal) -> ExtractionResult {
        let mut result = ExtractionResult::start(self.source_name());
        let limit = params.usize_or("limit", 100);
        let max_pages = params.usize_or("max_pages", 1) as u32;
        let tag_details = params.usize_or("tag_details", 0);
        info!(
            "🎮 Starting SteamSpy extraction (limit={}, pages={}, tag_details={})",
            limit, max_pages, tag_details
        );

        let spec = PageSpec {
            url: BASE_URL.to_string(),
            query: vec![("request".into(), "all".into())],
            page_param: "page",
            per_page_param: None,
            per_page: PAGE_SIZE,
            first_page: 0,
            max_pages: Some(max_pages.max(1)),
            results: ResultsShape::ObjectValues,
            total_key: None,
        };
        // ranking happens after parsing, so no row budget is applied while paging
        let outcome = paginate(self.fetcher.as_ref(), &spec, None, cancel).await;
        if outcome.failed_outright() || outcome.error == Some(SourceError::Cancelled) {
            let err = outcome.error.unwrap_or(SourceError::Cancelled);
            return result.fail(
                format!("Failed to fetch SteamSpy catalogue: {}", err),
                self.fetcher.api_calls(),
            );
        }
        if let Some(e) = &outcome.error {
            result.add_warning(format!("SteamSpy paging stopped early: {}", e));
        }

        let stamp = extraction_stamp();
        let mut games = Vec::with_capacity(outcome.items.len());
        for item in &outcome.items {
            match parse_game(item, &stamp) {
                Some(g) => games.push(g),
                None => result.records_failed += 1,
            }
        }

        let owners = |r: &Record| r.get("owners_estimate").and_then(Value::as_u64).unwrap_or(0);
        let app_id = |r: &Record| r.get("app_id").and_then(Value::as_u64).unwrap_or(0);
        games.sort_by(|a, b| owners(b).cmp(&owners(a)).then(app_id(a).cmp(&app_id(b))));
        let catalogue_size = games.len();
        games.truncate(limit);

        // the bulk endpoint carries no tags; per-game details do
        let mut tagged = 0usize;
        for game in games.iter_mut().take(tag_details) {
            let id = game.get("app_id").and_then(Value::as_u64).unwrap_or(0);
            let query = vec![
                ("request".to_string(), "appdetails".to_string()),
                ("appid".to_string(), id.to_string()),
            ];
            match self.fetcher.get_json(BASE_URL, &query, cancel).await {
                Ok(details) => {
                    game.insert("tags".into(), parse_tags(details.get("tags")));
                    tagged += 1;
                }
                Err(SourceError::Cancelled) => {
                    return result.fail(
                        "SteamSpy extraction cancelled while fetching tags".to_string(),
                        self.fetcher.api_calls(),
                    );
                }
                Err(e) => {
                    warn!("⚠️ SteamSpy details failed for app {}: {}", id, e);
                    result.add_warning(format!("Tags unavailable for app {}: {}", id, e));
                }
            }
        }

        result.metadata.insert("games_tagged".into(), json!(tagged));
        result.metadata.insert("catalogue_size".into(), json!(catalogue_size));
        result.metadata.insert("pages_fetched".into(), json!(outcome.pages_fetched));
        let api_calls = self.fetcher.api_calls();
        let result = result.succeed(games, api_calls);
        info!("✅ SteamSpy extraction complete: {} games", result.records_extracted);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::sources::testing::RoutedFetcher;

    #[test]
    fn test_parse_owners() {
        assert_eq!(parse_owners("1,000,000 .. 2,000,000"), Some((1_000_000, 2_000_000)));
        assert_eq!(parse_owners("garbage"), None);
    }

    #[tokio::test]
    async fn test_ranks_by_owner_estimate() {
        let body = json!({
            "10": {"appid": 10, "name": "Counter-Strike", "owners": "10,000,000 .. 20,000,000", "positive": 90, "negative": 10, "price": "999"},
            "20": {"appid": 20, "name": "Team Fortress", "owners": "20,000,000 .. 50,000,000", "positive": 0, "negative": 0},
            "30": {"appid": 30, "name": "Day of Defeat", "owners": "0 .. 20,000"}
        });
        let fetcher = RoutedFetcher::default().route(BASE_URL, Some(0), Ok(body));
        let extractor = SteamSpyExtractor::with_fetcher(Arc::new(fetcher), 4);
        let result = extractor
            .extract(&ExtractParams::new().with("limit", 2), &CancelSignal::never())
            .await;

        assert!(result.success);
        assert_eq!(result.records_extracted, 2);
        assert_eq!(result.records[0]["app_id"], json!(20));
        assert_eq!(result.records[1]["review_score"], json!(90.0));
        assert_eq!(result.records[1]["price_usd"], json!(9.99));
        assert_eq!(result.records[0]["review_score"], Value::Null);
        assert_eq!(result.metadata["catalogue_size"], json!(3));
        assert_eq!(result.records[0]["tags"], Value::Null);
    }

    #[test]
    fn test_tags_ranked_by_votes_and_capped() {
        let mut tags = serde_json::Map::new();
        for i in 0..25u64 {
            tags.insert(format!("tag{:02}", i), json!(i));
        }
        tags.insert("Action".into(), json!(24));
        let joined = parse_tags(Some(&Value::Object(tags)));
        let names: Vec<&str> = joined.as_str().unwrap().split(',').collect();
        assert_eq!(names.len(), 20);
        assert_eq!(&names[..3], &["Action", "tag24", "tag23"]);
        assert_eq!(parse_tags(Some(&json!([]))), Value::Null);
        assert_eq!(parse_tags(Some(&json!({}))), Value::Null);
    }

    #[tokio::test]
    async fn test_tag_details_enrich_top_games() {
        let body = json!({
            "10": {"appid": 10, "name": "Counter-Strike", "owners": "10,000,000 .. 20,000,000"},
            "20": {"appid": 20, "name": "Team Fortress", "owners": "20,000,000 .. 50,000,000"},
            "30": {"appid": 30, "name": "Day of Defeat", "owners": "0 .. 20,000"}
        });
        let fetcher = RoutedFetcher::default()
            .route(BASE_URL, Some(0), Ok(body))
            .route_app(BASE_URL, 20, Ok(json!({"appid": 20, "tags": {"FPS": 500, "Free to Play": 900}})))
            .route_app(BASE_URL, 10, Err(SourceError::Transient("HTTP 503".into())));
        let extractor = SteamSpyExtractor::with_fetcher(Arc::new(fetcher), 4);
        let params = ExtractParams::new().with("limit", 3).with("tag_details", 2);
        let result = extractor.extract(&params, &CancelSignal::never()).await;

        assert!(result.success);
        assert_eq!(result.records_extracted, 3);
        assert_eq!(result.records[0]["tags"], json!("Free to Play,FPS"));
        assert_eq!(result.records[1]["tags"], Value::Null);
        assert_eq!(result.records[2]["tags"], Value::Null);
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.metadata["games_tagged"], json!(1));
        // one catalogue page plus two detail lookups
        assert_eq!(result.api_calls, 3);
    }
}
