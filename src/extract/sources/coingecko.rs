use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

use super::{extraction_stamp, join_list, scalar, text};
use crate::config::EtlConfig;
use crate::constants::{COINGECKO_SOURCE, EXTRACTED_AT_COLUMN};
use crate::error::Result;
use crate::extract::paginate::{paginate, PageSpec, ResultsShape};
use crate::extract::{
    CancelSignal, ExtractParams, ExtractionResult, Extractor, JsonFetcher, SourceClient, SourceError,
};
use crate::table::Record;

const BASE_URL: &str = "https://api.coingecko.com/api/v3";
const MAX_PER_PAGE: usize = 250;

/// Market snapshot of the top coins by market cap, optionally followed by
/// the top exchanges by trust score.
pub struct CoinGeckoExtractor {
    fetcher: Arc<dyn JsonFetcher>,
    base_url: String,
    rate_limit: u32,
}

impl CoinGeckoExtractor {
    pub fn new(config: &EtlConfig, rate_limit: u32) -> Result<Self> {
        let client = SourceClient::new(COINGECKO_SOURCE, rate_limit, &config.http)?;
        Ok(Self::with_fetcher(Arc::new(client), rate_limit))
    }

    pub fn with_fetcher(fetcher: Arc<dyn JsonFetcher>, rate_limit: u32) -> Self {
        Self {
            fetcher,
            base_url: BASE_URL.to_string(),
            rate_limit,
        }
    }

    fn parse_market(coin: &Value, stamp: &Value) -> Option<Record> {
        let id = text(coin, "id");
        if id.is_null() {
            return None;
        }
        let symbol = match text(coin, "symbol") {
            Value::String(s) => Value::String(s.to_uppercase()),
            other => other,
        };
        let mut r = Record::new();
        r.insert("coin_id".into(), id);
        r.insert("symbol".into(), symbol);
        r.insert("name".into(), text(coin, "name"));
        r.insert("image_url".into(), text(coin, "image"));
        for (out, src) in [
            ("market_cap_rank", "market_cap_rank"),
            ("current_price", "current_price"),
            ("market_cap", "market_cap"),
            ("fully_diluted_valuation", "fully_diluted_valuation"),
            ("total_volume", "total_volume"),
            ("circulating_supply", "circulating_supply"),
            ("total_supply", "total_supply"),
            ("max_supply", "max_supply"),
            ("price_change_24h", "price_change_24h"),
            ("price_change_pct_24h", "price_change_percentage_24h"),
            ("price_change_pct_7d", "price_change_percentage_7d_in_currency"),
            ("ath", "ath"),
            ("ath_change_pct", "ath_change_percentage"),
            ("atl", "atl"),
            ("atl_change_pct", "atl_change_percentage"),
            ("last_updated", "last_updated"),
        ] {
            r.insert(out.into(), scalar(coin, src));
        }
        // markets payload carries no categories; detail enrichment fills them in
        r.insert(
            "categories".into(),
            coin.get("categories")
                .and_then(Value::as_array)
                .map(|c| join_list(c))
                .unwrap_or(Value::Null),
        );
        r.insert(EXTRACTED_AT_COLUMN.into(), stamp.clone());
        Some(r)
    }

    fn parse_exchange(exchange: &Value, stamp: &Value) -> Option<Record> {
        let id = text(exchange, "id");
        if id.is_null() {
            return None;
        }
        let mut r = Record::new();
        r.insert("exchange_id".into(), id);
        r.insert("exchange_name".into(), text(exchange, "name"));
        r.insert("year_established".into(), scalar(exchange, "year_established"));
        r.insert("country".into(), text(exchange, "country"));
        r.insert("url".into(), text(exchange, "url"));
        r.insert("exchange_image_url".into(), text(exchange, "image"));
        r.insert("has_trading_incentive".into(), scalar(exchange, "has_trading_incentive"));
        for col in [
            "trust_score",
            "trust_score_rank",
            "trade_volume_24h_btc",
            "trade_volume_24h_btc_normalized",
        ] {
            r.insert(col.into(), scalar(exchange, col));
        }
        r.insert(EXTRACTED_AT_COLUMN.into(), stamp.clone());
        Some(r)
    }

    fn apply_details(record: &mut Record, details: &Value) {
        if let Some(categories) = details.get("categories").and_then(Value::as_array) {
            record.insert("categories".into(), join_list(categories));
        }
        record.insert("genesis_date".into(), text(details, "genesis_date"));
        let description = details
            .get("description")
            .and_then(|d| d.get("en"))
            .and_then(Value::as_str)
            .map(|s| s.chars().take(1000).collect::<String>())
            .filter(|s| !s.trim().is_empty());
        record.insert("description".into(), json!(description));
    }
}

#[async_trait]
impl Extractor for CoinGeckoExtractor {
    fn source_name(&self) -> &'static str {
        COINGECKO_SOURCE
    }

    fn rate_limit(&self) -> u32 {
        self.rate_limit
    }

    async fn extract(&self, params: &ExtractParams, cancel: &CancelSignal) -> ExtractionResult {
        let mut result = ExtractionResult::start(self.source_name());
        let limit = params.usize_or("limit", 100);
        let vs_currency = params.str_or("vs_currency", "usd").to_string();
        let include_details = params.bool_or("include_details", false);
        let include_exchanges = params.bool_or("include_exchanges", false);
        info!(
            "🪙 Starting CoinGecko extraction (limit={}, details={}, exchanges={})",
            limit, include_details, include_exchanges
        );

        let spec = PageSpec {
            url: format!("{}/coins/markets", self.base_url),
            query: vec![
                ("vs_currency".into(), vs_currency.clone()),
                ("order".into(), "market_cap_desc".into()),
                ("sparkline".into(), "false".into()),
                ("price_change_percentage".into(), "24h,7d".into()),
            ],
            page_param: "page",
            per_page_param: Some("per_page"),
            per_page: limit.clamp(1, MAX_PER_PAGE),
            first_page: 1,
            max_pages: Some(params.usize_or("max_pages", 40) as u32),
            results: ResultsShape::Root,
            total_key: None,
        };
        let outcome = paginate(self.fetcher.as_ref(), &spec, Some(limit), cancel).await;

        if outcome.failed_outright() || outcome.error == Some(SourceError::Cancelled) {
            let err = outcome.error.unwrap_or(SourceError::Cancelled);
            return result.fail(
                format!("Failed to fetch market data: {}", err),
                self.fetcher.api_calls(),
            );
        }
        if let Some(e) = &outcome.error {
            result.add_warning(format!(
                "Market pagination stopped after {} page(s): {}",
                outcome.pages_fetched, e
            ));
        }

        let stamp = extraction_stamp();
        let mut records = Vec::with_capacity(outcome.items.len());
        for coin in &outcome.items {
            match Self::parse_market(coin, &stamp) {
                Some(r) => records.push(r),
                None => result.records_failed += 1,
            }
        }

        if include_details {
            for record in records.iter_mut() {
                let Some(id) = record.get("coin_id").and_then(Value::as_str).map(str::to_string) else {
                    continue;
                };
                let url = format!("{}/coins/{}", self.base_url, id);
                let query = [
                    ("localization".to_string(), "false".to_string()),
                    ("tickers".to_string(), "false".to_string()),
                    ("market_data".to_string(), "false".to_string()),
                ];
                match self.fetcher.get_json(&url, &query, cancel).await {
                    Ok(details) => Self::apply_details(record, &details),
                    Err(SourceError::Cancelled) => {
                        return result.fail("Extraction cancelled", self.fetcher.api_calls());
                    }
                    Err(e) => {
                        warn!("Detail fetch for {} failed: {}", id, e);
                        result.add_warning(format!("details for {}: {}", id, e));
                    }
                }
            }
        }

        let mut exchanges = 0usize;
        if include_exchanges {
            let per_page = params.usize_or("exchanges_limit", 100).clamp(1, MAX_PER_PAGE);
            let url = format!("{}/exchanges", self.base_url);
            let query = [
                ("per_page".to_string(), per_page.to_string()),
                ("page".to_string(), "1".to_string()),
            ];
            match self.fetcher.get_json(&url, &query, cancel).await {
                Ok(Value::Array(items)) => {
                    for item in items.iter().take(per_page) {
                        match Self::parse_exchange(item, &stamp) {
                            Some(r) => {
                                records.push(r);
                                exchanges += 1;
                            }
                            None => result.records_failed += 1,
                        }
                    }
                }
                Ok(_) => result.add_warning("exchanges: unexpected response shape".to_string()),
                Err(SourceError::Cancelled) => {
                    return result.fail("Extraction cancelled", self.fetcher.api_calls());
                }
                Err(e) => {
                    warn!("Exchange fetch failed: {}", e);
                    result.add_warning(format!("exchanges: {}", e));
                }
            }
        }

        result.metadata.insert("vs_currency".into(), json!(vs_currency));
        result.metadata.insert("exchanges_extracted".into(), json!(exchanges));
        result.metadata.insert("include_details".into(), json!(include_details));
        result.metadata.insert("pages_fetched".into(), json!(outcome.pages_fetched));
        let api_calls = self.fetcher.api_calls();
        let result = result.succeed(records, api_calls);
        info!("✅ CoinGecko extraction complete: {} coins", result.records_extracted);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::sources::testing::RoutedFetcher;

    fn markets_url() -> String {
        format!("{}/coins/markets", BASE_URL)
    }

    #[tokio::test]
    async fn test_extracts_and_flattens_markets() {
        let fetcher = RoutedFetcher::default()
            .route(
                &markets_url(),
                Some(1),
                Ok(json!([
                    {"id": "bitcoin", "symbol": "btc", "name": "Bitcoin", "current_price": 50000.0, "market_cap_rank": 1},
                    {"id": "ethereum", "symbol": "eth", "name": "Ethereum", "current_price": 3000.0, "market_cap_rank": 2},
                    {"symbol": "bad"}
                ])),
            )
            .route(
                &format!("{}/coins/bitcoin", BASE_URL),
                None,
                Ok(json!({"categories": ["Layer 1", "PoW"], "genesis_date": "2009-01-03"})),
            );
        let extractor = CoinGeckoExtractor::with_fetcher(Arc::new(fetcher), 10);
        let params = ExtractParams::new().with("limit", 5).with("include_details", true);
        let result = extractor.extract(&params, &CancelSignal::never()).await;

        assert!(result.success);
        assert_eq!(result.records_extracted, 2);
        assert_eq!(result.records_failed, 1);
        assert_eq!(result.records[0]["symbol"], json!("BTC"));
        assert_eq!(result.records[0]["categories"], json!("Layer 1,PoW"));
        assert!(result.records[0].contains_key(EXTRACTED_AT_COLUMN));
        // ethereum details route is missing, so it is a warning only
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.api_calls, 3);
    }

    #[tokio::test]
    async fn test_exchanges_join_the_coin_stream() {
        let fetcher = RoutedFetcher::default()
            .route(
                &markets_url(),
                Some(1),
                Ok(json!([{"id": "bitcoin", "symbol": "btc", "name": "Bitcoin", "current_price": 50000.0}])),
            )
            .route(
                &format!("{}/exchanges", BASE_URL),
                Some(1),
                Ok(json!([
                    {"id": "binance", "name": "Binance", "country": "Cayman Islands", "year_established": 2017,
                     "trust_score": 10, "trust_score_rank": 1, "trade_volume_24h_btc": 250000.5,
                     "trade_volume_24h_btc_normalized": 120000.0, "has_trading_incentive": false},
                    {"name": "nameless"}
                ])),
            );
        let extractor = CoinGeckoExtractor::with_fetcher(Arc::new(fetcher), 10);
        let params = ExtractParams::new().with("limit", 5).with("include_exchanges", true);
        let result = extractor.extract(&params, &CancelSignal::never()).await;

        assert!(result.success);
        assert_eq!(result.records_extracted, 2);
        assert_eq!(result.records_failed, 1);
        let binance = &result.records[1];
        assert!(!binance.contains_key("coin_id"));
        assert!(!result.records[0].contains_key("exchange_id"));
        assert_eq!(binance["exchange_id"], json!("binance"));
        assert_eq!(binance["exchange_name"], json!("Binance"));
        assert_eq!(binance["trust_score"], json!(10));
        assert_eq!(binance["trade_volume_24h_btc"], json!(250000.5));
        assert_eq!(result.metadata["exchanges_extracted"], json!(1));
        assert_eq!(result.api_calls, 2);
    }

    #[tokio::test]
    async fn test_exchange_failure_is_a_warning() {
        let fetcher = RoutedFetcher::default().route(
            &markets_url(),
            Some(1),
            Ok(json!([{"id": "bitcoin", "symbol": "btc"}])),
        );
        let extractor = CoinGeckoExtractor::with_fetcher(Arc::new(fetcher), 10);
        let params = ExtractParams::new().with("include_exchanges", true);
        let result = extractor.extract(&params, &CancelSignal::never()).await;

        assert!(result.success);
        assert_eq!(result.records_extracted, 1);
        assert!(result.warnings.iter().any(|w| w.starts_with("exchanges:")));
    }

    #[tokio::test]
    async fn test_first_page_failure_fails_extraction() {
        let fetcher = RoutedFetcher::default().route(
            &markets_url(),
            Some(1),
            Err(SourceError::Transient("HTTP 503".into())),
        );
        let extractor = CoinGeckoExtractor::with_fetcher(Arc::new(fetcher), 10);
        let result = extractor
            .extract(&ExtractParams::new(), &CancelSignal::never())
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("market data"));
    }
}
