/// Pipeline name constants to ensure consistency across the codebase.
/// These are the names used by the CLI, the registry and the job history.
pub const GAMING_PIPELINE: &str = "gaming";
pub const CRYPTO_PIPELINE: &str = "crypto";
pub const BETTING_PIPELINE: &str = "betting";
pub const MEDIA_PIPELINE: &str = "media";

// Source identifiers reported by extractors
pub const STEAMSPY_SOURCE: &str = "STEAMSPY";
pub const COINGECKO_SOURCE: &str = "COINGECKO";
pub const ESPN_SOURCE: &str = "ESPN";
pub const TMDB_SOURCE: &str = "TMDB";

// Credential names looked up in configuration
pub const TMDB_CREDENTIAL: &str = "TMDB";

/// Requests per minute each public source tolerates.
pub fn default_rate_limit(source: &str) -> u32 {
    match source {
        STEAMSPY_SOURCE => 4,
        COINGECKO_SOURCE => 10,
        ESPN_SOURCE => 60,
        TMDB_SOURCE => 10,
        _ => 30,
    }
}

// Well-known quality gate names
pub const GATE_SCHEMA_DRIFT: &str = "schema_drift";
pub const GATE_FRESHNESS: &str = "freshness";
pub const GATE_COMPLETENESS: &str = "completeness";
pub const GATE_DUPLICATES: &str = "duplicates";
pub const GATE_VALUE_SANITY: &str = "value_sanity";
pub const GATE_REFERENTIAL_INTEGRITY: &str = "referential_integrity";
pub const GATE_RESTATEMENT: &str = "restatement";
pub const GATE_COVERAGE: &str = "coverage";

// Columns stamped onto every generated table
pub const LOADED_AT_COLUMN: &str = "_loaded_at";
pub const SOURCE_COLUMN: &str = "_source";
pub const EXTRACTION_ID_COLUMN: &str = "extraction_id";
pub const EXTRACTED_AT_COLUMN: &str = "extracted_at";
pub const DATE_DIMENSION: &str = "dim_date";
pub const DATE_KEY_COLUMN: &str = "date_key";
