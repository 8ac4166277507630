use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use super::{extraction_stamp, scalar, text};
use crate::config::EtlConfig;
use crate::constants::{ESPN_SOURCE, EXTRACTED_AT_COLUMN};
use crate::error::Result;
use crate::extract::{
    CancelSignal, ExtractParams, ExtractionResult, Extractor, JsonFetcher, SourceClient, SourceError,
};
use crate::table::Record;

const SITE_URL: &str = "https://site.api.espn.com/apis/site/v2/sports";
const STANDINGS_URL: &str = "https://site.api.espn.com/apis/v2/sports";

pub const DEFAULT_LEAGUES: [&str; 4] = ["nfl", "nba", "mlb", "nhl"];

#[derive(Debug, Clone, Copy)]
struct League {
    sport: &'static str,
    path: &'static str,
    name: &'static str,
}

fn league(code: &str) -> Option<League> {
    let (sport, path, name) = match code {
        "nfl" => ("football", "nfl", "NFL"),
        "nba" => ("basketball", "nba", "NBA"),
        "mlb" => ("baseball", "mlb", "MLB"),
        "nhl" => ("hockey", "nhl", "NHL"),
        "ncaaf" => ("football", "college-football", "NCAA Football"),
        "ncaab" => ("basketball", "mens-college-basketball", "NCAA Basketball"),
        "mls" => ("soccer", "usa.1", "MLS"),
        "epl" => ("soccer", "eng.1", "Premier League"),
        _ => return None,
    };
    Some(League { sport, path, name })
}

/// Teams and current standings for each requested league.
pub struct EspnExtractor {
    fetcher: Arc<dyn JsonFetcher>,
    rate_limit: u32,
}

impl EspnExtractor {
    pub fn new(config: &EtlConfig, rate_limit: u32) -> Result<Self> {
        let client = SourceClient::new(ESPN_SOURCE, rate_limit, &config.http)?;
        Ok(Self::with_fetcher(Arc::new(client), rate_limit))
    }

    pub fn with_fetcher(fetcher: Arc<dyn JsonFetcher>, rate_limit: u32) -> Self {
        Self { fetcher, rate_limit }
    }

    async fn fetch_teams(
        &self,
        league: League,
        cancel: &CancelSignal,
    ) -> std::result::Result<Vec<Value>, SourceError> {
        let url = format!("{}/{}/{}/teams", SITE_URL, league.sport, league.path);
        let body = self
            .fetcher
            .get_json(&url, &[("limit".to_string(), "100".to_string())], cancel)
            .await?;
        let teams = body
            .pointer("/sports/0/leagues/0/teams")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(teams
            .into_iter()
            .map(|t| t.get("team").cloned().unwrap_or(t))
            .collect())
    }

    async fn fetch_standings(
        &self,
        league: League,
        cancel: &CancelSignal,
    ) -> std::result::Result<HashMap<String, Record>, SourceError> {
        let url = format!("{}/{}/{}/standings", STANDINGS_URL, league.sport, league.path);
        let body = self.fetcher.get_json(&url, &[], cancel).await?;
        let mut by_team = HashMap::new();
        let groups = body
            .get("children")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for group in &groups {
            let division = text(group, "name");
            let entries = group
                .pointer("/standings/entries")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for entry in &entries {
                if let Some((team_id, mut stats)) = parse_standings_entry(entry) {
                    stats.insert("division".into(), division.clone());
                    by_team.insert(team_id, stats);
                }
            }
        }
        Ok(by_team)
    }
}

fn parse_team(team: &Value, code: &str, league: League, stamp: &Value) -> Option<Record> {
    let team_id = text(team, "id");
    if team_id.is_null() {
        return None;
    }
    let mut r = Record::new();
    r.insert("team_id".into(), team_id);
    r.insert("league_code".into(), json!(code));
    r.insert("league_name".into(), json!(league.name));
    r.insert("sport".into(), json!(league.sport));
    r.insert("abbreviation".into(), text(team, "abbreviation"));
    r.insert("display_name".into(), text(team, "displayName"));
    r.insert("short_name".into(), text(team, "shortDisplayName"));
    r.insert("nickname".into(), text(team, "nickname"));
    r.insert("location".into(), text(team, "location"));
    r.insert("color_primary".into(), text(team, "color"));
    r.insert("is_active".into(), team.get("isActive").cloned().unwrap_or(json!(true)));
    r.insert(
        "logo_url".into(),
        team.pointer("/logos/0/href").cloned().unwrap_or(Value::Null),
    );
    insert_venue(&mut r, team.get("venue"));
    r.insert(EXTRACTED_AT_COLUMN.into(), stamp.clone());
    Some(r)
}

/// Home venue columns; all null when the team carries no venue.
fn insert_venue(r: &mut Record, venue: Option<&Value>) {
    let venue = venue.filter(|v| v.is_object()).cloned().unwrap_or(Value::Null);
    r.insert("venue_id".into(), text(&venue, "id"));
    r.insert("venue_name".into(), text(&venue, "fullName"));
    let address = venue.get("address").cloned().unwrap_or(Value::Null);
    r.insert("venue_city".into(), text(&address, "city"));
    r.insert("venue_state".into(), text(&address, "state"));
    r.insert("venue_capacity".into(), scalar(&venue, "capacity"));
    r.insert("venue_indoor".into(), scalar(&venue, "indoor"));
}

fn parse_standings_entry(entry: &Value) -> Option<(String, Record)> {
    let team_id = entry.pointer("/team/id").and_then(|v| match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })?;
    let mut stats = Record::new();
    for stat in entry
        .get("stats")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let name = stat
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_lowercase();
        let column = match name.as_str() {
            "wins" => "wins",
            "losses" => "losses",
            "ties" => "ties",
            "winpercent" | "winningpercent" => "win_pct",
            "pointsfor" | "runsfor" => "points_for",
            "pointsagainst" | "runsagainst" => "points_against",
            "playoffseed" => "playoff_seed",
            "gamesback" => "games_back",
            "streak" => {
                stats.insert("streak".into(), text(stat, "displayValue"));
                continue;
            }
            _ => continue,
        };
        stats.insert(column.into(), scalar(stat, "value"));
    }
    Some((team_id, stats))
}

#[async_trait]
impl Extractor for EspnExtractor {
    fn source_name(&self) -> &'static str {
        ESPN_SOURCE
    }

    fn rate_limit(&self) -> u32 {
        self.rate_limit
    }

    async fn extract(&self, params: &ExtractParams, cancel: &CancelSignal) -> ExtractionResult {
        let mut result = ExtractionResult::start(self.source_name());
        let leagues = params.list_or("leagues", &DEFAULT_LEAGUES);
        let include_standings = params.bool_or("include_standings", true);
        info!("🏈 Starting ESPN extraction for leagues {:?}", leagues);

        let stamp = extraction_stamp();
        let mut records = Vec::new();
        let mut leagues_ok = 0usize;
        let mut last_error = None;

        for code in &leagues {
            let Some(info) = league(code) else {
                result.add_warning(format!("Unknown league: {}", code));
                continue;
            };

            let teams = match self.fetch_teams(info, cancel).await {
                Ok(t) => t,
                Err(SourceError::Cancelled) => {
                    return result.fail("Extraction cancelled", self.fetcher.api_calls());
                }
                Err(e) => {
                    warn!("Teams for {} failed: {}", code, e);
                    result.add_warning(format!("{} teams: {}", code, e));
                    last_error = Some(e);
                    continue;
                }
            };

            let standings = if include_standings {
                match self.fetch_standings(info, cancel).await {
                    Ok(s) => s,
                    Err(SourceError::Cancelled) => {
                        return result.fail("Extraction cancelled", self.fetcher.api_calls());
                    }
                    Err(e) => {
                        result.add_warning(format!("{} standings: {}", code, e));
                        HashMap::new()
                    }
                }
            } else {
                HashMap::new()
            };

            leagues_ok += 1;
            for team in &teams {
                let Some(mut record) = parse_team(team, code, info, &stamp) else {
                    result.records_failed += 1;
                    continue;
                };
                let id = record
                    .get("team_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                if let Some(stats) = standings.get(&id) {
                    record.extend(stats.clone());
                }
                records.push(record);
            }
        }

        if leagues_ok == 0 {
            let reason = last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no known leagues requested".to_string());
            return result.fail(
                format!("No league could be extracted: {}", reason),
                self.fetcher.api_calls(),
            );
        }

        result.metadata.insert("leagues".into(), json!(leagues));
        result.metadata.insert("leagues_extracted".into(), json!(leagues_ok));
        let api_calls = self.fetcher.api_calls();
        let result = result.succeed(records, api_calls);
        info!("✅ ESPN extraction complete: {} teams", result.records_extracted);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::sources::testing::RoutedFetcher;

    fn teams_body() -> Value {
        json!({"sports": [{"leagues": [{"teams": [
            {"team": {"id": "1", "displayName": "Boston Celtics", "abbreviation": "BOS", "venue": {
                "id": "1824", "fullName": "TD Garden", "capacity": 19156, "indoor": true,
                "address": {"city": "Boston", "state": "MA"}
            }}},
            {"team": {"id": "2", "displayName": "Brooklyn Nets", "abbreviation": "BKN"}}
        ]}]}]})
    }

    fn standings_body() -> Value {
        json!({"children": [{"name": "Eastern Conference", "standings": {"entries": [
            {"team": {"id": "1"}, "stats": [
                {"name": "wins", "value": 50.0},
                {"name": "losses", "value": 20.0},
                {"name": "winPercent", "value": 0.714},
                {"name": "streak", "value": 3.0, "displayValue": "W3"}
            ]}
        ]}}]})
    }

    #[tokio::test]
    async fn test_merges_standings_into_teams() {
        let fetcher = RoutedFetcher::default()
            .route(&format!("{}/basketball/nba/teams", SITE_URL), None, Ok(teams_body()))
            .route(&format!("{}/basketball/nba/standings", STANDINGS_URL), None, Ok(standings_body()));
        let extractor = EspnExtractor::with_fetcher(Arc::new(fetcher), 60);
        let params = ExtractParams::new().with("leagues", json!(["nba", "cricket"]));
        let result = extractor.extract(&params, &CancelSignal::never()).await;

        assert!(result.success);
        assert_eq!(result.records_extracted, 2);
        let celtics = &result.records[0];
        assert_eq!(celtics["wins"], json!(50.0));
        assert_eq!(celtics["win_pct"], json!(0.714));
        assert_eq!(celtics["streak"], json!("W3"));
        assert_eq!(celtics["division"], json!("Eastern Conference"));
        assert!(result.records[1].get("wins").is_none());
        assert_eq!(celtics["venue_id"], json!("1824"));
        assert_eq!(celtics["venue_name"], json!("TD Garden"));
        assert_eq!(celtics["venue_city"], json!("Boston"));
        assert_eq!(celtics["venue_capacity"], json!(19156));
        assert_eq!(celtics["venue_indoor"], json!(true));
        assert_eq!(result.records[1]["venue_id"], Value::Null);
        assert!(result.warnings.iter().any(|w| w.contains("cricket")));
    }

    #[tokio::test]
    async fn test_all_leagues_failing_fails_extraction() {
        let extractor = EspnExtractor::with_fetcher(Arc::new(RoutedFetcher::default()), 60);
        let result = extractor
            .extract(&ExtractParams::new().with("leagues", "nfl"), &CancelSignal::never())
            .await;
        assert!(!result.success);
        assert!(result.error.is_some());
    }
}
