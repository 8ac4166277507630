use chrono::{NaiveDate, Utc};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};

use super::{GateCheck, GateSpec, QualityGate};
use crate::keys::{date_from_key, parse_observed_date};
use crate::table::{as_f64, TableSet};
use crate::transform::schema::Relation;
use crate::transform::star::orphan_stats;

/// Shorthand for a gate whose score is final.
fn verdict(spec: &GateSpec, score: f64, details: Map<String, Value>, issues: Vec<String>) -> QualityGate {
    let score = if score.is_finite() { score.clamp(0.0, 1.0) } else { 0.0 };
    QualityGate {
        name: spec.name.clone(),
        passed: score >= spec.threshold,
        score,
        threshold: spec.threshold,
        blocking: spec.blocking,
        details,
        issues,
    }
}

pub(super) fn evaluate(tables: &TableSet, spec: &GateSpec) -> QualityGate {
    match &spec.check {
        GateCheck::SchemaShape {
            expected_columns,
            key_columns,
            max_key_null_rate,
        } => schema_shape(tables, spec, expected_columns, key_columns, *max_key_null_rate),
        GateCheck::Freshness {
            table,
            date_column,
            ceiling_days,
            as_of,
        } => freshness(tables, spec, table, date_column, *ceiling_days, *as_of),
        GateCheck::Completeness { columns } => completeness(tables, spec, columns),
        GateCheck::Duplicates { tables: targets } => duplicates(tables, spec, targets),
        GateCheck::ValueSanity { bounds, outlier_columns } => value_sanity(tables, spec, bounds, outlier_columns),
        GateCheck::ReferentialIntegrity { relations } => referential_integrity(tables, spec, relations),
        GateCheck::Restatement {
            table,
            group_columns,
            measures,
        } => restatement(tables, spec, table, group_columns, measures),
        GateCheck::Coverage {
            table,
            entity_column,
            required,
        } => coverage(tables, spec, table, entity_column, required),
    }
}

fn schema_shape(
    tables: &TableSet,
    spec: &GateSpec,
    expected: &[(String, Vec<String>)],
    key_columns: &[(String, String)],
    max_key_null_rate: f64,
) -> QualityGate {
    let mut issues = Vec::new();
    for (table, columns) in expected {
        match tables.get(table) {
            None => issues.push(format!("table {} is missing", table)),
            Some(t) => {
                for col in columns.iter().filter(|c| !t.has_column(c)) {
                    issues.push(format!("{}.{} is missing", table, col));
                }
            }
        }
    }
    for (table, col) in key_columns {
        if let Some(t) = tables.get(table).filter(|t| t.has_column(col)) {
            let rate = t.null_rate(col);
            if rate > max_key_null_rate {
                issues.push(format!("{}.{} is {:.1}% null", table, col, rate * 100.0));
            }
        }
    }
    let mut details = Map::new();
    details.insert("issue_count".into(), json!(issues.len()));
    let score = 1.0 - 0.1 * issues.len() as f64;
    verdict(spec, score, details, issues)
}

fn cell_date(value: &Value) -> Option<NaiveDate> {
    match value {
        Value::Number(n) => n.as_i64().and_then(date_from_key).or_else(|| parse_observed_date(value)),
        other => parse_observed_date(other),
    }
}

fn freshness(
    tables: &TableSet,
    spec: &GateSpec,
    table: &str,
    date_column: &str,
    ceiling_days: f64,
    as_of: Option<NaiveDate>,
) -> QualityGate {
    let latest = tables
        .get(table)
        .and_then(|t| t.column_values(date_column).filter_map(cell_date).max());
    let mut details = Map::new();
    let Some(latest) = latest else {
        details.insert("latest_date".into(), Value::Null);
        return verdict(
            spec,
            0.5,
            details,
            vec![format!("no usable dates in {}.{}", table, date_column)],
        );
    };

    let today = as_of.unwrap_or_else(|| Utc::now().date_naive());
    let staleness = (today - latest).num_days().max(0) as f64;
    let score = if ceiling_days > 0.0 { 1.0 - staleness / ceiling_days } else { 0.0 };
    details.insert("latest_date".into(), json!(latest.format("%Y-%m-%d").to_string()));
    details.insert("staleness_days".into(), json!(staleness));
    let mut issues = Vec::new();
    if staleness > 0.0 {
        issues.push(format!("latest observation is {} day(s) old", staleness));
    }
    verdict(spec, score, details, issues)
}

fn completeness(tables: &TableSet, spec: &GateSpec, columns: &[(String, String)]) -> QualityGate {
    let mut rates = Vec::new();
    let mut issues = Vec::new();
    let mut per_column = Map::new();
    for (table, col) in columns {
        let Some(t) = tables.get(table) else {
            issues.push(format!("table {} is missing", table));
            continue;
        };
        if t.is_empty() {
            continue;
        }
        let rate = if t.has_column(col) {
            t.null_rate(col)
        } else {
            issues.push(format!("{}.{} is missing", table, col));
            1.0
        };
        per_column.insert(format!("{}.{}", table, col), json!(rate));
        rates.push(rate);
    }

    let mut details = Map::new();
    if rates.is_empty() {
        issues.push("no rows to assess".to_string());
        details.insert("columns_assessed".into(), json!(0));
        return verdict(spec, 1.0, details, issues);
    }
    let mean = rates.iter().sum::<f64>() / rates.len() as f64;
    details.insert("columns_assessed".into(), json!(rates.len()));
    details.insert("mean_null_rate".into(), json!(mean));
    details.insert("null_rates".into(), Value::Object(per_column));
    verdict(spec, 1.0 - mean, details, issues)
}

fn content_hash(cells: &[&Value]) -> String {
    let mut hasher = Sha256::new();
    for cell in cells {
        hasher.update(cell.to_string().as_bytes());
        hasher.update([0x1f]);
    }
    hex::encode(hasher.finalize())
}

fn duplicates(tables: &TableSet, spec: &GateSpec, targets: &[(String, Vec<String>)]) -> QualityGate {
    let mut issues = Vec::new();
    let mut rows = 0usize;
    let mut dupes = 0usize;
    let mut missing_keys = false;

    for (table, key_columns) in targets {
        let Some(t) = tables.get(table) else {
            issues.push(format!("table {} is missing", table));
            missing_keys = true;
            continue;
        };
        let idx: Option<Vec<usize>> = key_columns.iter().map(|c| t.column_index(c)).collect();
        let Some(idx) = idx else {
            issues.push(format!("{} lacks its business-key columns", table));
            missing_keys = true;
            continue;
        };
        let mut seen = HashSet::new();
        let mut table_dupes = 0usize;
        for row in &t.rows {
            let cells: Vec<&Value> = idx.iter().map(|&i| &row[i]).collect();
            if !seen.insert(content_hash(&cells)) {
                table_dupes += 1;
            }
        }
        if table_dupes > 0 {
            issues.push(format!("{}: {} duplicate business key(s)", table, table_dupes));
        }
        rows += t.len();
        dupes += table_dupes;
    }

    let mut details = Map::new();
    if missing_keys && rows == 0 {
        return verdict(spec, 0.8, details, issues);
    }
    let rate = if rows == 0 { 0.0 } else { dupes as f64 / rows as f64 };
    details.insert("rows".into(), json!(rows));
    details.insert("duplicates".into(), json!(dupes));
    details.insert("duplicate_rate".into(), json!(rate));
    let score = if missing_keys { (1.0 - rate).min(0.8) } else { 1.0 - rate };
    verdict(spec, score, details, issues)
}

/// Numeric bound on one column.
#[derive(Debug, Clone, PartialEq)]
pub struct Bound {
    pub table: String,
    pub column: String,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

const VALUE_PENALTY: f64 = 0.15;
const OUTLIER_Z: f64 = 5.0;
const OUTLIER_MIN_SAMPLES: usize = 100;
const OUTLIER_MAX_SHARE: f64 = 0.01;

fn value_sanity(
    tables: &TableSet,
    spec: &GateSpec,
    bounds: &[Bound],
    outlier_columns: &[(String, String)],
) -> QualityGate {
    let mut issues = Vec::new();
    let mut details = Map::new();

    for b in bounds {
        let Some(t) = tables.get(&b.table) else { continue };
        let values: Vec<f64> = t.column_values(&b.column).filter_map(as_f64).collect();
        let below = b.min.map_or(0, |min| values.iter().filter(|v| **v < min).count());
        let above = b.max.map_or(0, |max| values.iter().filter(|v| **v > max).count());
        if below > 0 {
            issues.push(format!("{}.{}: {} value(s) below {}", b.table, b.column, below, b.min.unwrap_or_default()));
        }
        if above > 0 {
            issues.push(format!("{}.{}: {} value(s) above {}", b.table, b.column, above, b.max.unwrap_or_default()));
        }
    }

    let mut outliers_total = 0usize;
    for (table, column) in outlier_columns {
        let Some(t) = tables.get(table) else { continue };
        let values: Vec<f64> = t.column_values(column).filter_map(as_f64).collect();
        if values.len() <= OUTLIER_MIN_SAMPLES {
            continue;
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let std = (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
        if std == 0.0 {
            continue;
        }
        let count = values.iter().filter(|v| ((**v - mean) / std).abs() > OUTLIER_Z).count();
        outliers_total += count;
        if count as f64 / n > OUTLIER_MAX_SHARE {
            issues.push(format!("{}.{}: {} outlier(s) beyond |z|>{}", table, column, count, OUTLIER_Z));
        }
    }

    details.insert("violations".into(), json!(issues.len()));
    details.insert("outliers".into(), json!(outliers_total));
    let score = 1.0 - VALUE_PENALTY * issues.len() as f64;
    verdict(spec, score, details, issues)
}

fn referential_integrity(tables: &TableSet, spec: &GateSpec, relations: &[Relation]) -> QualityGate {
    let mut details = Map::new();
    if relations.is_empty() {
        return verdict(spec, 0.8, details, vec!["no relationships declared".into()]);
    }
    let mut scores = Vec::new();
    let mut issues = Vec::new();
    for rel in relations {
        match orphan_stats(tables, rel) {
            Some(stats) => {
                let name = format!("{}.{}", rel.table, rel.column);
                if stats.orphans > 0 {
                    issues.push(format!(
                        "{}: {} of {} references missing from {}",
                        name, stats.orphans, stats.checked, rel.dimension
                    ));
                }
                details.insert(name, json!(stats.orphan_rate()));
                scores.push(1.0 - stats.orphan_rate());
            }
            None => {
                issues.push(format!("{}.{} cannot be checked against {}", rel.table, rel.column, rel.dimension));
                scores.push(0.0);
            }
        }
    }
    let score = scores.iter().sum::<f64>() / scores.len() as f64;
    verdict(spec, score, details, issues)
}

fn restatement(
    tables: &TableSet,
    spec: &GateSpec,
    table: &str,
    group_columns: &[String],
    measures: &[String],
) -> QualityGate {
    let mut details = Map::new();
    let Some(t) = tables.get(table) else {
        return verdict(spec, 1.0, details, vec![format!("table {} is missing", table)]);
    };
    let group_idx: Vec<usize> = group_columns.iter().filter_map(|c| t.column_index(c)).collect();
    let measure_idx: Vec<usize> = measures.iter().filter_map(|c| t.column_index(c)).collect();

    let mut groups: HashMap<String, HashSet<String>> = HashMap::new();
    for row in &t.rows {
        let key: Vec<&Value> = group_idx.iter().map(|&i| &row[i]).collect();
        let vals: Vec<&Value> = measure_idx.iter().map(|&i| &row[i]).collect();
        groups
            .entry(content_hash(&key))
            .or_default()
            .insert(content_hash(&vals));
    }
    let restated = groups.values().filter(|v| v.len() > 1).count();
    let rate = if groups.is_empty() { 0.0 } else { restated as f64 / groups.len() as f64 };
    details.insert("groups".into(), json!(groups.len()));
    details.insert("restated_groups".into(), json!(restated));
    let mut issues = Vec::new();
    if restated > 0 {
        issues.push(format!("{} key group(s) carry differing measure values", restated));
    }
    verdict(spec, 1.0 - rate.min(0.5), details, issues)
}

fn coverage(
    tables: &TableSet,
    spec: &GateSpec,
    table: &str,
    entity_column: &str,
    required: &[String],
) -> QualityGate {
    let mut details = Map::new();
    let Some(t) = tables.get(table) else {
        return verdict(spec, 0.0, details, vec![format!("table {} is missing", table)]);
    };
    // entity → required columns seen with a value
    let mut seen: HashMap<String, HashSet<usize>> = HashMap::new();
    let entity_idx = t.column_index(entity_column);
    let req_idx: Vec<Option<usize>> = required.iter().map(|c| t.column_index(c)).collect();
    for row in &t.rows {
        let Some(entity) = entity_idx.and_then(|i| row.get(i)).filter(|v| !v.is_null()) else {
            continue;
        };
        let entry = seen.entry(entity.to_string()).or_default();
        for (n, idx) in req_idx.iter().enumerate() {
            if idx.and_then(|i| row.get(i)).map_or(false, |v| !v.is_null()) {
                entry.insert(n);
            }
        }
    }
    if seen.is_empty() || required.is_empty() {
        return verdict(spec, 1.0, details, vec!["no entities to assess".into()]);
    }
    let possible = (seen.len() * required.len()) as f64;
    let covered: usize = seen.values().map(HashSet::len).sum();
    let share = covered as f64 / possible;
    details.insert("entities".into(), json!(seen.len()));
    details.insert("coverage".into(), json!(share));
    let mut issues = Vec::new();
    for (n, col) in required.iter().enumerate() {
        let missing = seen.values().filter(|s| !s.contains(&n)).count();
        if missing > 0 {
            issues.push(format!("{} of {} entities never report {}", missing, seen.len(), col));
        }
    }
    verdict(spec, share, details, issues)
}
