//! Star schemas for the built-in pipelines.

use super::schema::{DimensionDef, FactDef, SchemaDefinition};
use crate::constants::EXTRACTED_AT_COLUMN;

/// SteamSpy catalogue: one fact row per game per extraction date, with the
/// game/tag many-to-many.
pub fn gaming() -> SchemaDefinition {
    SchemaDefinition::new("gaming", "steamspy")
        .dimension(
            DimensionDef::new("dim_game", "game_key", &["app_id"])
                .attributes(&["name", "developer", "publisher", "genre"]),
        )
        .dimension(DimensionDef::new("dim_tag", "tag_key", &["tag_name"]).exploded_from("tags"))
        .fact(
            FactDef::new("fact_game_metrics", "One row per game per extraction date")
                .references("dim_game", "game_key")
                .dated_by(EXTRACTED_AT_COLUMN)
                .measures(&[
                    "owners_min",
                    "owners_max",
                    "owners_estimate",
                    "ccu",
                    "positive_reviews",
                    "negative_reviews",
                    "review_score",
                    "average_playtime_forever",
                    "median_playtime_forever",
                    "price_usd",
                ]),
        )
        .bridge("game_tag_bridge", "dim_game", "dim_tag")
        .bound("fact_game_metrics", "review_score", Some(0.0), Some(100.0))
        .bound("fact_game_metrics", "price_usd", Some(0.0), None)
        .bound("fact_game_metrics", "ccu", Some(0.0), None)
        .bound("fact_game_metrics", "owners_estimate", Some(0.0), None)
}

/// CoinGecko markets with the coin/category many-to-many, plus exchanges.
///
/// Coin and exchange records share one stream; each table is scoped to the
/// id column of its own record kind.
pub fn crypto() -> SchemaDefinition {
    SchemaDefinition::new("crypto", "coingecko")
        .dimension(
            DimensionDef::new("dim_coin", "coin_key", &["coin_id"])
                .attributes(&["symbol", "name", "image_url", "genesis_date", "description"])
                .scoped_to("coin_id"),
        )
        .dimension(
            DimensionDef::new("dim_category", "category_key", &["category_name"])
                .exploded_from("categories"),
        )
        .dimension(
            DimensionDef::new("dim_exchange", "exchange_key", &["exchange_id"])
                .attributes(&[
                    "exchange_name",
                    "year_established",
                    "country",
                    "url",
                    "has_trading_incentive",
                ])
                .scoped_to("exchange_id"),
        )
        .fact(
            FactDef::new("fact_coin_metrics", "One row per coin per extraction date")
                .references("dim_coin", "coin_key")
                .dated_by(EXTRACTED_AT_COLUMN)
                .measures(&[
                    "current_price",
                    "market_cap",
                    "market_cap_rank",
                    "fully_diluted_valuation",
                    "total_volume",
                    "circulating_supply",
                    "total_supply",
                    "max_supply",
                    "price_change_24h",
                    "price_change_pct_24h",
                    "price_change_pct_7d",
                    "ath",
                    "ath_change_pct",
                    "atl",
                    "atl_change_pct",
                ])
                .scoped_to("coin_id"),
        )
        .fact(
            FactDef::new("fact_exchange_metrics", "One row per exchange per extraction date")
                .references("dim_exchange", "exchange_key")
                .dated_by(EXTRACTED_AT_COLUMN)
                .measures(&[
                    "trust_score",
                    "trust_score_rank",
                    "trade_volume_24h_btc",
                    "trade_volume_24h_btc_normalized",
                ])
                .scoped_to("exchange_id"),
        )
        .bridge("coin_category_bridge", "dim_coin", "dim_category")
        .bound("fact_coin_metrics", "current_price", Some(0.0), None)
        .bound("fact_coin_metrics", "market_cap", Some(0.0), None)
        .bound("fact_coin_metrics", "total_volume", Some(0.0), None)
        .bound("fact_coin_metrics", "market_cap_rank", Some(1.0), None)
        .bound("fact_exchange_metrics", "trust_score", Some(0.0), Some(10.0))
        .bound("fact_exchange_metrics", "trade_volume_24h_btc", Some(0.0), None)
}

/// ESPN teams with standings merged in, and each team's home venue.
pub fn betting() -> SchemaDefinition {
    SchemaDefinition::new("betting", "espn")
        .dimension(
            DimensionDef::new("dim_team", "team_key", &["league_code", "team_id"]).attributes(&[
                "display_name",
                "short_name",
                "abbreviation",
                "nickname",
                "location",
                "color_primary",
                "logo_url",
                "is_active",
            ]),
        )
        .dimension(
            DimensionDef::new("dim_league", "league_key", &["league_code"])
                .attributes(&["league_name", "sport"]),
        )
        .dimension(
            DimensionDef::new("dim_venue", "venue_key", &["venue_id"])
                .attributes(&[
                    "venue_name",
                    "venue_city",
                    "venue_state",
                    "venue_capacity",
                    "venue_indoor",
                ])
                .scoped_to("venue_id"),
        )
        .fact(
            FactDef::new("fact_team_standings", "One row per team per extraction date")
                .references("dim_team", "team_key")
                .references("dim_league", "league_key")
                .dated_by(EXTRACTED_AT_COLUMN)
                .measures(&[
                    "wins",
                    "losses",
                    "ties",
                    "win_pct",
                    "points_for",
                    "points_against",
                    "games_back",
                    "playoff_seed",
                ])
                .degenerate(&["division", "streak"]),
        )
        .bridge("team_venue_bridge", "dim_team", "dim_venue")
        .bound("fact_team_standings", "wins", Some(0.0), None)
        .bound("fact_team_standings", "losses", Some(0.0), None)
        .bound("fact_team_standings", "win_pct", Some(0.0), Some(1.0))
}

/// TMDb popular titles with genres and original language.
pub fn media() -> SchemaDefinition {
    SchemaDefinition::new("media", "tmdb")
        .dimension(
            DimensionDef::new("dim_title", "title_key", &["media_type", "tmdb_id"]).attributes(&[
                "title",
                "original_title",
                "release_date",
                "adult",
                "origin_country",
            ]),
        )
        .dimension(DimensionDef::new("dim_genre", "genre_key", &["genre_name"]).exploded_from("genres"))
        .dimension(DimensionDef::new("dim_language", "language_key", &["original_language"]))
        .fact(
            FactDef::new("fact_title_metrics", "One row per title per extraction date")
                .references("dim_title", "title_key")
                .references("dim_language", "language_key")
                .dated_by(EXTRACTED_AT_COLUMN)
                .measures(&["popularity", "vote_average", "vote_count"]),
        )
        .bridge("title_genre_bridge", "dim_title", "dim_genre")
        .bound("fact_title_metrics", "vote_average", Some(0.0), Some(10.0))
        .bound("fact_title_metrics", "vote_count", Some(0.0), None)
        .bound("fact_title_metrics", "popularity", Some(0.0), None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_schemas_are_valid() {
        for schema in [gaming(), crypto(), betting(), media()] {
            assert!(schema.validate().is_empty(), "{}: {:?}", schema.name, schema.validate());
        }
    }

    #[test]
    fn test_expected_tables() {
        assert_eq!(
            gaming().table_names(),
            vec!["dim_game", "dim_tag", "dim_date", "fact_game_metrics", "game_tag_bridge"]
        );
        assert_eq!(
            crypto().table_names(),
            vec![
                "dim_coin",
                "dim_category",
                "dim_exchange",
                "dim_date",
                "fact_coin_metrics",
                "fact_exchange_metrics",
                "coin_category_bridge"
            ]
        );
        assert_eq!(
            betting().table_names(),
            vec![
                "dim_team",
                "dim_league",
                "dim_venue",
                "dim_date",
                "fact_team_standings",
                "team_venue_bridge"
            ]
        );
        assert_eq!(
            media().table_names(),
            vec![
                "dim_title",
                "dim_genre",
                "dim_language",
                "dim_date",
                "fact_title_metrics",
                "title_genre_bridge"
            ]
        );
    }
}
