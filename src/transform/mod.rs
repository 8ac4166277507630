//! Transformer contract: raw records in, star schema tables out.

pub mod date_dim;
pub mod schema;
pub mod schemas;
pub mod star;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::table::{Record, Table, TableKind, TableSet};
pub use schema::{DimensionDef, FactDef, SchemaDefinition};

/// Core trait that every target schema must implement.
pub trait Transformer: Send + Sync {
    fn schema_name(&self) -> &str;

    fn schema(&self) -> &SchemaDefinition;

    fn dimension_definitions(&self) -> &[DimensionDef] {
        &self.schema().dimensions
    }

    fn fact_definitions(&self) -> &[FactDef] {
        &self.schema().facts
    }

    fn transform(&self, raw: &[Record], run: &RunContext) -> TransformOutput;
}

/// Run-scoped values stamped onto generated rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    pub extraction_id: String,
    pub loaded_at: String,
}

impl RunContext {
    pub fn new(extraction_id: impl Into<String>, loaded_at: DateTime<Utc>) -> Self {
        Self {
            extraction_id: extraction_id.into(),
            loaded_at: loaded_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }

    /// Context whose extraction id is the current UTC second.
    pub fn now() -> Self {
        let now = Utc::now();
        Self::new(now.format("%Y%m%d%H%M%S").to_string(), now)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransformationResult {
    pub success: bool,
    pub schema_name: String,
    pub tables_created: Vec<String>,
    pub row_counts: BTreeMap<String, usize>,
    pub total_rows: usize,
    /// Filled in once the tables are written.
    pub output_paths: BTreeMap<String, PathBuf>,
    pub integrity_warnings: Vec<String>,
    pub warnings: Vec<String>,
    pub error: Option<String>,
}

/// In-memory star schema produced by one transformer run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StarModel {
    pub tables: TableSet,
}

impl StarModel {
    pub fn insert(&mut self, table: Table) {
        self.tables.insert(table.name.clone(), table);
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    pub fn get_all_tables(&self) -> &TableSet {
        &self.tables
    }

    pub fn get_row_counts(&self) -> BTreeMap<String, usize> {
        self.tables.iter().map(|(n, t)| (n.clone(), t.len())).collect()
    }

    pub fn tables_of_kind(&self, kind: TableKind) -> impl Iterator<Item = &Table> {
        self.tables.values().filter(move |t| t.kind == kind)
    }

    pub fn total_rows(&self) -> usize {
        self.tables.values().map(Table::len).sum()
    }

    /// Tables with run-scoped columns removed, for cross-run comparison.
    pub fn without_run_columns(&self) -> StarModel {
        use crate::constants::{EXTRACTION_ID_COLUMN, LOADED_AT_COLUMN};
        StarModel {
            tables: self
                .tables
                .iter()
                .map(|(n, t)| (n.clone(), t.without_columns(&[EXTRACTION_ID_COLUMN, LOADED_AT_COLUMN])))
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransformOutput {
    pub result: TransformationResult,
    pub model: StarModel,
}

/// Transformer driven entirely by a declared schema.
#[derive(Debug, Clone)]
pub struct StarTransformer {
    schema: SchemaDefinition,
}

impl StarTransformer {
    pub fn new(schema: SchemaDefinition) -> Self {
        Self { schema }
    }
}

impl Transformer for StarTransformer {
    fn schema_name(&self) -> &str {
        self.schema.name
    }

    fn schema(&self) -> &SchemaDefinition {
        &self.schema
    }

    fn transform(&self, raw: &[Record], run: &RunContext) -> TransformOutput {
        star::build_star(&self.schema, raw, run)
    }
}
