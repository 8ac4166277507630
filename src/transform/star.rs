use chrono::NaiveDate;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, info, warn};

use super::date_dim::build_date_dimension;
use super::schema::{DimensionDef, Relation, SchemaDefinition};
use super::{RunContext, StarModel, TransformOutput, TransformationResult};
use crate::constants::{
    DATE_DIMENSION, DATE_KEY_COLUMN, EXTRACTION_ID_COLUMN, LOADED_AT_COLUMN, SOURCE_COLUMN,
};
use crate::keys::{generate_date_key, generate_key, parse_observed_date, KeyComponent, SurrogateKey};
use crate::table::{coerce_numeric, Record, Table, TableKind, TableSet};

const MULTI_VALUE_DELIMITER: char = ',';

/// Comparable form of a key cell: strings as-is, numbers in decimal.
fn key_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn present(value: Option<&Value>) -> Option<&Value> {
    match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.trim().is_empty() => None,
        Some(v) => Some(v),
    }
}

fn in_scope(scope: Option<&str>, record: &Record) -> bool {
    scope.map_or(true, |column| present(record.get(column)).is_some())
}

/// Surrogate key of a record's natural key, `None` if any component is missing.
fn natural_key(dim: &DimensionDef, record: &Record) -> Option<SurrogateKey> {
    let mut components = Vec::with_capacity(dim.natural_key.len());
    for col in &dim.natural_key {
        components.push(KeyComponent::from(present(record.get(*col))?));
    }
    Some(generate_key(components))
}

fn split_values(record: &Record, column: &str) -> Vec<String> {
    match present(record.get(column)) {
        Some(Value::String(s)) => s
            .split(MULTI_VALUE_DELIMITER)
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| key_text(v).map(|s| s.trim().to_string()))
            .filter(|s| !s.is_empty())
            .collect(),
        Some(other) => key_text(other).into_iter().collect(),
        None => Vec::new(),
    }
}

fn apply_mappings(record: &Record, mappings: &[(&'static str, &'static str)]) -> Record {
    let mut out = record.clone();
    for (from, to) in mappings {
        if let Some(v) = out.remove(*from) {
            out.insert(to.to_string(), v);
        }
    }
    out
}

struct DimensionBuild {
    table: Table,
    keys: HashSet<String>,
    excluded: usize,
}

fn build_dimension(dim: &DimensionDef, records: &[Record], source: &str, run: &RunContext) -> DimensionBuild {
    let mut columns = dim.output_columns();
    columns.push(LOADED_AT_COLUMN.to_string());
    columns.push(SOURCE_COLUMN.to_string());
    let mut table = Table::new(dim.name, TableKind::Dimension, columns);
    let mut keys = HashSet::new();
    let mut excluded = 0;

    for record in records.iter().filter(|r| in_scope(dim.scope, r)) {
        let Some(key) = natural_key(dim, record) else {
            excluded += 1;
            continue;
        };
        // first record seen for a natural key supplies the attributes
        if !keys.insert(key.as_str().to_string()) {
            continue;
        }
        let mut row = record.clone();
        row.insert(dim.key_column.to_string(), key.into());
        row.insert(LOADED_AT_COLUMN.to_string(), json!(run.loaded_at));
        row.insert(SOURCE_COLUMN.to_string(), json!(source));
        table.push_record(&row);
    }
    DimensionBuild { table, keys, excluded }
}

fn build_multi_dimension(dim: &DimensionDef, records: &[Record], source: &str, run: &RunContext) -> DimensionBuild {
    let mut columns = dim.output_columns();
    columns.push(LOADED_AT_COLUMN.to_string());
    columns.push(SOURCE_COLUMN.to_string());
    let mut table = Table::new(dim.name, TableKind::Dimension, columns);
    let mut keys = HashSet::new();
    let source_column = dim.multi_value_source.unwrap_or_default();
    let value_column = dim.natural_key[0];

    for record in records.iter().filter(|r| in_scope(dim.scope, r)) {
        for value in split_values(record, source_column) {
            let key = generate_key([value.as_str()]);
            if !keys.insert(key.as_str().to_string()) {
                continue;
            }
            let mut row = Record::new();
            row.insert(dim.key_column.to_string(), key.into());
            row.insert(value_column.to_string(), json!(value));
            row.insert(LOADED_AT_COLUMN.to_string(), json!(run.loaded_at));
            row.insert(SOURCE_COLUMN.to_string(), json!(source));
            table.push_record(&row);
        }
    }
    DimensionBuild { table, keys, excluded: 0 }
}

/// Columns the schema reads that no raw record carries.
fn missing_columns(schema: &SchemaDefinition, records: &[Record]) -> Vec<String> {
    if records.is_empty() {
        return Vec::new();
    }
    // a scope column nobody carries means the table is simply not fed this run
    let fed = |scope: Option<&str>| scope.map_or(true, |c| records.iter().any(|r| r.contains_key(c)));
    let mut expected: Vec<(&str, &str)> = Vec::new();
    for dim in schema.dimensions.iter().filter(|d| fed(d.scope)) {
        match dim.multi_value_source {
            Some(src) => expected.push((dim.name, src)),
            None => expected.extend(dim.natural_key.iter().map(|c| (dim.name, *c))),
        }
    }
    for fact in schema.facts.iter().filter(|f| fed(f.scope)) {
        expected.extend(fact.measures.iter().map(|c| (fact.name, *c)));
        expected.extend(fact.date_source.iter().map(|c| (fact.name, *c)));
    }
    let mut seen = HashSet::new();
    expected
        .into_iter()
        .filter(|(_, col)| seen.insert(*col))
        .filter(|(_, col)| !records.iter().any(|r| r.contains_key(*col)))
        .map(|(table, col)| format!("column '{}' used by {} is absent from every raw record", col, table))
        .collect()
}

/// Build every declared table from raw records.
pub fn build_star(schema: &SchemaDefinition, raw: &[Record], run: &RunContext) -> TransformOutput {
    let mut result = TransformationResult {
        schema_name: schema.name.to_string(),
        ..Default::default()
    };
    let mut model = StarModel::default();

    let problems = schema.validate();
    if !problems.is_empty() {
        result.error = Some(format!("Invalid schema {}: {}", schema.name, problems.join("; ")));
        return TransformOutput { result, model };
    }

    let records: Vec<Record> = raw
        .iter()
        .map(|r| apply_mappings(r, &schema.column_mappings))
        .collect();
    for missing in missing_columns(schema, &records) {
        warn!("Schema mismatch in {}: {}", schema.name, missing);
        result.warnings.push(missing);
    }

    // dimensions are complete before any fact or bridge row references them
    let mut key_sets: HashMap<String, HashSet<String>> = HashMap::new();
    for dim in &schema.dimensions {
        let build = if dim.is_multi_valued() {
            build_multi_dimension(dim, &records, schema.source, run)
        } else {
            build_dimension(dim, &records, schema.source, run)
        };
        if build.excluded > 0 {
            result.warnings.push(format!(
                "{} record(s) lack the natural key of {} and were excluded from it",
                build.excluded, dim.name
            ));
        }
        debug!("Built {} with {} rows", dim.name, build.table.len());
        key_sets.insert(dim.name.to_string(), build.keys);
        model.insert(build.table);
    }

    if schema.has_date_dimension() {
        let dates: BTreeSet<NaiveDate> = schema
            .facts
            .iter()
            .filter_map(|f| f.date_source.map(|col| (f.scope, col)))
            .flat_map(|(scope, col)| {
                records
                    .iter()
                    .filter(move |r| in_scope(scope, r))
                    .filter_map(move |r| r.get(col).and_then(parse_observed_date))
            })
            .filter(|d| generate_date_key(*d).is_some())
            .collect();
        key_sets.insert(
            DATE_DIMENSION.to_string(),
            dates.iter().filter_map(|d| generate_date_key(*d)).map(|k| k.to_string()).collect(),
        );
        model.insert(build_date_dimension(&dates, &run.loaded_at));
    }

    for fact in &schema.facts {
        let mut columns: Vec<String> = fact.foreign_keys.iter().map(|fk| fk.column.to_string()).collect();
        if fact.date_source.is_some() {
            columns.push(DATE_KEY_COLUMN.to_string());
        }
        columns.extend(fact.measures.iter().map(|m| m.to_string()));
        columns.extend(fact.degenerate.iter().map(|d| d.to_string()));
        columns.push(EXTRACTION_ID_COLUMN.to_string());
        columns.push(LOADED_AT_COLUMN.to_string());
        let mut table = Table::new(fact.name, TableKind::Fact, columns);
        let mut unresolved: HashMap<&str, usize> = HashMap::new();

        for record in records.iter().filter(|r| in_scope(fact.scope, r)) {
            let mut row = Vec::with_capacity(table.columns.len());
            for fk in &fact.foreign_keys {
                let cell = schema
                    .dimension_def(fk.dimension)
                    .and_then(|dim| natural_key(dim, record))
                    .and_then(|key| {
                        let known = key_sets
                            .get(fk.dimension)
                            .map_or(false, |set| set.contains(key.as_str()));
                        if !known {
                            *unresolved.entry(fk.column).or_default() += 1;
                        }
                        known.then(|| Value::from(key))
                    })
                    .unwrap_or(Value::Null);
                row.push(cell);
            }
            if let Some(src) = fact.date_source {
                row.push(
                    record
                        .get(src)
                        .and_then(parse_observed_date)
                        .and_then(generate_date_key)
                        .map(|k| json!(k))
                        .unwrap_or(Value::Null),
                );
            }
            for m in &fact.measures {
                row.push(record.get(*m).map(coerce_numeric).unwrap_or(Value::Null));
            }
            for d in &fact.degenerate {
                row.push(record.get(*d).cloned().unwrap_or(Value::Null));
            }
            row.push(json!(run.extraction_id));
            row.push(json!(run.loaded_at));
            table.rows.push(row);
        }

        for (column, count) in unresolved {
            result.integrity_warnings.push(format!(
                "{}.{}: {} key(s) did not resolve and were left null",
                fact.name, column, count
            ));
        }
        model.insert(table);
    }

    for bridge in &schema.bridges {
        let (Some(left), Some(right)) = (schema.dimension_def(bridge.left), schema.dimension_def(bridge.right))
        else {
            continue;
        };
        let columns = vec![
            left.key_column.to_string(),
            right.key_column.to_string(),
            LOADED_AT_COLUMN.to_string(),
        ];
        let mut table = Table::new(bridge.name, TableKind::Bridge, columns);
        let mut pairs = HashSet::new();

        for record in records.iter().filter(|r| in_scope(left.scope, r)) {
            let Some(left_key) = natural_key(left, record) else {
                continue;
            };
            let right_keys: Vec<SurrogateKey> = match right.multi_value_source {
                Some(source) => split_values(record, source)
                    .iter()
                    .map(|value| generate_key([value.as_str()]))
                    .collect(),
                None if in_scope(right.scope, record) => natural_key(right, record).into_iter().collect(),
                None => Vec::new(),
            };
            for right_key in right_keys {
                if pairs.insert((left_key.clone(), right_key.clone())) {
                    table.rows.push(vec![
                        Value::from(left_key.clone()),
                        Value::from(right_key),
                        json!(run.loaded_at),
                    ]);
                }
            }
        }
        model.insert(table);
    }

    result
        .integrity_warnings
        .extend(check_referential_integrity(&model.tables, &schema.relations()));

    result.row_counts = model.get_row_counts();
    result.total_rows = model.total_rows();
    result.tables_created = schema.table_names();
    result.success = true;
    info!(
        "🔄 Transformed {} records into {} tables ({} rows) for {}",
        records.len(),
        result.tables_created.len(),
        result.total_rows,
        schema.name
    );
    TransformOutput { result, model }
}

/// Orphan statistics of one FK relationship.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct OrphanStats {
    /// Non-null references examined.
    pub checked: usize,
    pub orphans: usize,
}

impl OrphanStats {
    pub fn orphan_rate(&self) -> f64 {
        if self.checked == 0 {
            0.0
        } else {
            self.orphans as f64 / self.checked as f64
        }
    }
}

/// `None` when either side of the relationship is missing from `tables`.
pub fn orphan_stats(tables: &TableSet, relation: &Relation) -> Option<OrphanStats> {
    let child = tables.get(&relation.table)?;
    let parent = tables.get(&relation.dimension)?;
    if !child.has_column(&relation.column) {
        return None;
    }
    let known: HashSet<String> = parent
        .column_values(&relation.dimension_key)
        .filter_map(key_text)
        .collect();
    let mut stats = OrphanStats::default();
    for value in child.column_values(&relation.column) {
        if let Some(k) = key_text(value) {
            stats.checked += 1;
            if !known.contains(&k) {
                stats.orphans += 1;
            }
        }
    }
    Some(stats)
}

/// Warnings for every relationship with dangling non-null references.
pub fn check_referential_integrity(tables: &TableSet, relations: &[Relation]) -> Vec<String> {
    relations
        .iter()
        .filter_map(|rel| {
            let stats = orphan_stats(tables, rel)?;
            (stats.orphans > 0).then(|| {
                format!(
                    "{}.{}: {} of {} references missing from {}",
                    rel.table, rel.column, stats.orphans, stats.checked, rel.dimension
                )
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::schema::{DimensionDef, FactDef};
    use serde_json::json;

    fn schema() -> SchemaDefinition {
        SchemaDefinition::new("items", "test")
            .rename("id", "item_id")
            .dimension(DimensionDef::new("dim_item", "item_key", &["item_id"]).attributes(&["name"]))
            .dimension(DimensionDef::new("dim_tag", "tag_key", &["tag_name"]).exploded_from("tags"))
            .fact(
                FactDef::new("fact_item", "one row per item per day")
                    .references("dim_item", "item_key")
                    .dated_by("observed_at")
                    .measures(&["price"]),
            )
            .bridge("item_tag_bridge", "dim_item", "dim_tag")
    }

    fn rec(v: Value) -> Record {
        v.as_object().unwrap().clone()
    }

    fn run() -> RunContext {
        RunContext {
            extraction_id: "20260101000000".into(),
            loaded_at: "2026-01-01T00:00:00Z".into(),
        }
    }

    #[test]
    fn test_three_distinct_records() {
        let raw = vec![
            rec(json!({"id": "A", "name": "a", "price": 1, "observed_at": "2026-01-01", "tags": "x,y"})),
            rec(json!({"id": "B", "name": "b", "price": 2, "observed_at": "2026-01-01", "tags": "y"})),
            rec(json!({"id": "C", "name": "c", "price": 3, "observed_at": "2026-01-02", "tags": ""})),
        ];
        let out = build_star(&schema(), &raw, &run());
        assert!(out.result.success);
        assert_eq!(out.result.row_counts["dim_item"], 3);
        assert_eq!(out.result.row_counts["fact_item"], 3);
        assert_eq!(out.result.row_counts["dim_tag"], 2);
        assert_eq!(out.result.row_counts["item_tag_bridge"], 3);
        assert_eq!(out.result.row_counts["dim_date"], 2);
        assert!(out.result.integrity_warnings.is_empty());
    }

    #[test]
    fn test_missing_natural_key_keeps_fact_row_with_null_fk() {
        let raw = vec![
            rec(json!({"id": "A", "price": "n/a", "observed_at": "2026-01-01"})),
            rec(json!({"name": "orphan", "price": 5, "observed_at": "2026-01-01"})),
        ];
        let out = build_star(&schema(), &raw, &run());
        let dim = out.model.table("dim_item").unwrap();
        let fact = out.model.table("fact_item").unwrap();
        assert_eq!(dim.len(), 1);
        assert_eq!(fact.len(), 2);
        assert_eq!(fact.null_count("item_key"), 1);
        assert_eq!(fact.rows[0][2], Value::Null);
        assert!(out.result.warnings.iter().any(|w| w.contains("dim_item")));
    }

    #[test]
    fn test_empty_input_produces_every_table() {
        let out = build_star(&schema(), &[], &run());
        assert!(out.result.success);
        assert_eq!(out.model.tables.len(), 5);
        assert!(out.model.tables.values().all(|t| t.is_empty()));
    }

    #[test]
    fn test_orphan_detection() {
        let out = build_star(&schema(), &[rec(json!({"id": "A", "observed_at": "2026-01-01"}))], &run());
        let mut tables = out.model.tables.clone();
        tables
            .get_mut("fact_item")
            .unwrap()
            .rows
            .push(vec![json!("ffffffffffffffff"), json!(20260101), Value::Null, json!("x"), json!("y")]);
        let warnings = check_referential_integrity(&tables, &schema().relations());
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("1 of 2"));
    }

    #[test]
    fn test_column_mapping_applies_before_keys() {
        let out = build_star(&schema(), &[rec(json!({"id": "A"}))], &run());
        let dim = out.model.table("dim_item").unwrap();
        assert_eq!(dim.column_values("item_id").next(), Some(&json!("A")));
    }

    #[test]
    fn test_scoped_tables_and_single_valued_bridge() {
        let schema = SchemaDefinition::new("mixed", "test")
            .dimension(
                DimensionDef::new("dim_item", "item_key", &["item_id"])
                    .attributes(&["name"])
                    .scoped_to("item_id"),
            )
            .dimension(
                DimensionDef::new("dim_shop", "shop_key", &["shop_id"])
                    .attributes(&["shop_name"])
                    .scoped_to("shop_id"),
            )
            .fact(
                FactDef::new("fact_item", "one row per item")
                    .references("dim_item", "item_key")
                    .measures(&["price"])
                    .scoped_to("item_id"),
            )
            .fact(
                FactDef::new("fact_shop", "one row per shop")
                    .references("dim_shop", "shop_key")
                    .measures(&["rating"])
                    .scoped_to("shop_id"),
            )
            .bridge("item_shop_bridge", "dim_item", "dim_shop");
        let raw = vec![
            rec(json!({"item_id": "A", "name": "a", "price": 1, "shop_id": "S1"})),
            rec(json!({"item_id": "B", "name": "b", "price": 2, "shop_id": "S1"})),
            rec(json!({"item_id": "C", "name": "c", "price": 3, "shop_id": ""})),
            rec(json!({"shop_id": "S2", "shop_name": "second", "rating": 4.5})),
        ];
        let out = build_star(&schema, &raw, &run());
        assert!(out.result.success);
        assert_eq!(out.result.row_counts["dim_item"], 3);
        assert_eq!(out.result.row_counts["fact_item"], 3);
        assert_eq!(out.result.row_counts["dim_shop"], 2);
        assert_eq!(out.result.row_counts["fact_shop"], 3);
        assert_eq!(out.result.row_counts["item_shop_bridge"], 2);
        // out-of-scope records are not reported as missing a natural key
        assert!(out.result.warnings.is_empty(), "{:?}", out.result.warnings);
        assert!(out.result.integrity_warnings.is_empty());
    }

    #[test]
    fn test_unfed_scope_builds_empty_table_without_warnings() {
        let schema = schema().dimension(
            DimensionDef::new("dim_shop", "shop_key", &["shop_id"]).scoped_to("shop_id"),
        );
        let out = build_star(&schema, &[rec(json!({"id": "A", "price": 1, "observed_at": "2026-01-01", "tags": "x"}))], &run());
        assert_eq!(out.result.row_counts["dim_shop"], 0);
        assert!(out.result.warnings.is_empty(), "{:?}", out.result.warnings);
    }
}
