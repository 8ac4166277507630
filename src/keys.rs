//! Deterministic surrogate keys for dimensional modeling.
//!
//! Natural-key components are normalized, joined with a unit separator and
//! hashed with SHA-256. The first 16 hex characters form the key, so the same
//! natural key always maps to the same dimension row across runs.

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Timelike, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

use crate::table::Record;

pub const KEY_WIDTH: usize = 16;
const MIN_HASH_CHARS: usize = 8;
const NULL_SENTINEL: &str = "__NULL__";
const SEPARATOR: char = '\u{1f}';

static KEY_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9a-f]{16}$").expect("static key pattern"));

/// Opaque fixed-width dimension key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SurrogateKey(String);

impl SurrogateKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SurrogateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<SurrogateKey> for Value {
    fn from(key: SurrogateKey) -> Self {
        Value::String(key.0)
    }
}

/// One component of a natural key before normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyComponent {
    Null,
    Date(NaiveDate),
    DateTime(DateTime<Utc>),
    Text(String),
}

impl KeyComponent {
    fn normalized(&self) -> String {
        match self {
            KeyComponent::Null => NULL_SENTINEL.to_string(),
            KeyComponent::Date(d) => d.format("%Y-%m-%d").to_string(),
            KeyComponent::DateTime(dt) => dt.to_rfc3339(),
            KeyComponent::Text(s) => s.trim().to_lowercase(),
        }
    }
}

impl From<&str> for KeyComponent {
    fn from(s: &str) -> Self {
        KeyComponent::Text(s.to_string())
    }
}

impl From<String> for KeyComponent {
    fn from(s: String) -> Self {
        KeyComponent::Text(s)
    }
}

impl From<i64> for KeyComponent {
    fn from(n: i64) -> Self {
        KeyComponent::Text(n.to_string())
    }
}

impl From<NaiveDate> for KeyComponent {
    fn from(d: NaiveDate) -> Self {
        KeyComponent::Date(d)
    }
}

impl From<DateTime<Utc>> for KeyComponent {
    fn from(dt: DateTime<Utc>) -> Self {
        KeyComponent::DateTime(dt)
    }
}

impl<T: Into<KeyComponent>> From<Option<T>> for KeyComponent {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(KeyComponent::Null)
    }
}

impl From<&Value> for KeyComponent {
    fn from(v: &Value) -> Self {
        match v {
            Value::Null => KeyComponent::Null,
            Value::String(s) => KeyComponent::Text(s.clone()),
            Value::Number(n) => KeyComponent::Text(n.to_string()),
            Value::Bool(b) => KeyComponent::Text(b.to_string()),
            other => KeyComponent::Text(other.to_string()),
        }
    }
}

/// Generate a surrogate key from one or more natural-key components.
pub fn generate_key<I, C>(components: I) -> SurrogateKey
where
    I: IntoIterator<Item = C>,
    C: Into<KeyComponent>,
{
    let mut canonical = String::new();
    for (i, component) in components.into_iter().enumerate() {
        if i > 0 {
            canonical.push(SEPARATOR);
        }
        canonical.push_str(&component.into().normalized());
    }

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let digest = hex::encode(hasher.finalize());
    SurrogateKey(digest[..KEY_WIDTH].to_string())
}

/// Key built from the named columns of a flat record. Missing columns count as null.
pub fn generate_row_key(record: &Record, columns: &[String]) -> SurrogateKey {
    generate_key(
        columns
            .iter()
            .map(|c| KeyComponent::from(record.get(c).unwrap_or(&Value::Null))),
    )
}

/// Prefixed key that still fits the fixed key width.
///
/// Prefixes longer than `KEY_WIDTH - MIN_HASH_CHARS` characters are cut so the
/// hash part never shrinks below `MIN_HASH_CHARS`.
pub fn generate_prefixed_key<I, C>(prefix: &str, components: I) -> String
where
    I: IntoIterator<Item = C>,
    C: Into<KeyComponent>,
{
    let base = generate_key(components);
    let prefix: String = prefix.chars().take(KEY_WIDTH - MIN_HASH_CHARS).collect();
    let keep = KEY_WIDTH - prefix.chars().count();
    format!("{}{}", prefix, &base.0[..keep])
}

/// Integer date key in `YYYYMMDD` form, `None` outside years 1..=9999.
pub fn generate_date_key(date: NaiveDate) -> Option<u32> {
    let year = u32::try_from(date.year()).ok().filter(|y| (1..=9999).contains(y))?;
    Some(year * 10_000 + date.month() * 100 + date.day())
}

/// Integer time-of-day key in `HHMMSS` form.
pub fn generate_time_key(dt: &NaiveDateTime) -> u32 {
    dt.hour() * 10_000 + dt.minute() * 100 + dt.second()
}

/// Inverse of [`generate_date_key`].
pub fn date_from_key(key: i64) -> Option<NaiveDate> {
    if !(10_000_101..=99_991_231).contains(&key) {
        return None;
    }
    let year = (key / 10_000) as i32;
    let month = ((key / 100) % 100) as u32;
    let day = (key % 100) as u32;
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Checks length and charset of a surrogate key.
pub fn validate_key(key: &str) -> bool {
    KEY_PATTERN.is_match(key)
}

/// Best-effort date extraction from a raw cell.
///
/// Accepts `YYYY-MM-DD` prefixes, RFC 3339 timestamps, `YYYYMMDD` integers and
/// epoch seconds.
pub fn parse_observed_date(value: &Value) -> Option<NaiveDate> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc).date_naive());
            }
            if s.len() >= 10 && s.is_char_boundary(10) {
                if let Ok(d) = NaiveDate::parse_from_str(&s[..10], "%Y-%m-%d") {
                    return Some(d);
                }
            }
            if s.len() == 8 {
                if let Ok(n) = s.parse::<i64>() {
                    return date_from_key(n);
                }
            }
            None
        }
        Value::Number(n) => {
            let n = n.as_i64()?;
            date_from_key(n).or_else(|| DateTime::from_timestamp(n, 0).map(|dt| dt.date_naive()))
        }
        _ => None,
    }
}
