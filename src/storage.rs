//! Table persistence: one NDJSON file per table plus a metadata sidecar.
//!
//! A job writes into a hidden staging directory next to its final location
//! and publishes by renaming it. A staged write that is dropped without being
//! published removes its staging directory, so aborted jobs leave nothing
//! readable behind.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{EtlError, Result};
use crate::table::{as_f64, Table, TableKind};

pub const TABLE_EXTENSION: &str = "ndjson";
pub const METADATA_SUFFIX: &str = ".meta.json";

/// Per-column profile stored in the sidecar.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnStats {
    pub null_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mean: Option<f64>,
    /// Distinct non-null values, for text columns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unique_count: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMetadata {
    pub table_name: String,
    pub kind: TableKind,
    pub created_at: DateTime<Utc>,
    pub row_count: usize,
    pub column_count: usize,
    pub columns: Vec<String>,
    pub column_stats: BTreeMap<String, ColumnStats>,
    pub checksum: String,
    pub file_path: PathBuf,
}

impl TableMetadata {
    pub fn describe(table: &Table, file_path: PathBuf) -> Self {
        let column_stats = table
            .columns
            .iter()
            .map(|c| (c.clone(), column_stats(table, c)))
            .collect();
        Self {
            table_name: table.name.clone(),
            kind: table.kind,
            created_at: Utc::now(),
            row_count: table.len(),
            column_count: table.columns.len(),
            columns: table.columns.clone(),
            column_stats,
            checksum: structural_checksum(table),
            file_path,
        }
    }
}

fn column_stats(table: &Table, column: &str) -> ColumnStats {
    let mut stats = ColumnStats::default();
    let mut numbers = Vec::new();
    let mut texts = HashSet::new();
    for value in table.column_values(column) {
        match value {
            Value::Null => stats.null_count += 1,
            Value::String(s) => {
                texts.insert(s.as_str());
            }
            other => {
                if let Some(n) = as_f64(other) {
                    numbers.push(n);
                }
            }
        }
    }
    if !numbers.is_empty() && texts.is_empty() {
        stats.min = numbers.iter().copied().reduce(f64::min);
        stats.max = numbers.iter().copied().reduce(f64::max);
        stats.mean = Some(numbers.iter().sum::<f64>() / numbers.len() as f64);
    } else if !texts.is_empty() {
        stats.unique_count = Some(texts.len());
    }
    stats
}

/// SHA-256 over the table shape plus its first and last rows.
///
/// Cheap drift signal: it changes when columns, row count or the edges of
/// the data change, without hashing every row.
pub fn structural_checksum(table: &Table) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}x{}", table.len(), table.columns.len()).as_bytes());
    hasher.update(table.columns.join(",").as_bytes());
    for row in [table.rows.first(), table.rows.last()].into_iter().flatten() {
        hasher.update(Value::Array(row.clone()).to_string().as_bytes());
    }
    hex::encode(hasher.finalize())
}

pub fn table_file_name(table: &str) -> String {
    format!("{}.{}", table, TABLE_EXTENSION)
}

pub fn metadata_path(table_path: &Path) -> PathBuf {
    let mut name = table_path.as_os_str().to_os_string();
    name.push(METADATA_SUFFIX);
    PathBuf::from(name)
}

fn write_ndjson(table: &Table, path: &Path) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    for record in table.records() {
        serde_json::to_writer(&mut out, &record)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}

/// Writes table sets under `<output_dir>/<pipeline>/<job_id>/`.
#[derive(Debug, Clone)]
pub struct TableWriter {
    output_dir: PathBuf,
}

impl TableWriter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Final directory for one job's tables.
    pub fn job_dir(&self, pipeline: &str, job_id: &str) -> PathBuf {
        self.output_dir.join(pipeline).join(job_id)
    }

    pub fn stage(&self, pipeline: &str, job_id: &str) -> Result<StagedWrite> {
        let parent = self.output_dir.join(pipeline);
        let staging = parent.join(format!(".{}.staging", job_id));
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging)?;
        debug!("Staging tables for {} in {}", job_id, staging.display());
        Ok(StagedWrite {
            staging,
            target: self.job_dir(pipeline, job_id),
            written: BTreeMap::new(),
            published: false,
        })
    }
}

/// Tables written to a staging directory but not yet visible.
#[derive(Debug)]
pub struct StagedWrite {
    staging: PathBuf,
    target: PathBuf,
    written: BTreeMap<String, PathBuf>,
    published: bool,
}

impl StagedWrite {
    pub fn write_table(&mut self, table: &Table) -> Result<TableMetadata> {
        let file_name = table_file_name(&table.name);
        let staged_path = self.staging.join(&file_name);
        let final_path = self.target.join(&file_name);

        write_ndjson(table, &staged_path)?;
        let metadata = TableMetadata::describe(table, final_path.clone());
        fs::write(metadata_path(&staged_path), serde_json::to_vec_pretty(&metadata)?)?;

        debug!("Wrote {} rows to {}", table.len(), staged_path.display());
        self.written.insert(table.name.clone(), final_path);
        Ok(metadata)
    }

    pub fn written(&self) -> &BTreeMap<String, PathBuf> {
        &self.written
    }

    /// Move the staged tables into place and return their final paths.
    pub fn publish(mut self) -> Result<BTreeMap<String, PathBuf>> {
        if self.target.exists() {
            return Err(EtlError::Config(format!(
                "output directory {} already exists",
                self.target.display()
            )));
        }
        fs::rename(&self.staging, &self.target)?;
        self.published = true;
        info!("✅ Published {} tables to {}", self.written.len(), self.target.display());
        Ok(std::mem::take(&mut self.written))
    }

    /// Drop everything staged so far.
    pub fn discard(self) {
        // removal happens in Drop
    }
}

impl Drop for StagedWrite {
    fn drop(&mut self) {
        if self.published || !self.staging.exists() {
            return;
        }
        match fs::remove_dir_all(&self.staging) {
            Ok(()) => debug!("Discarded staging directory {}", self.staging.display()),
            Err(e) => warn!("Failed to remove staging directory {}: {}", self.staging.display(), e),
        }
    }
}

pub fn read_metadata(table_path: &Path) -> Result<TableMetadata> {
    let content = fs::read_to_string(metadata_path(table_path))?;
    Ok(serde_json::from_str(&content)?)
}

/// Load a table back from NDJSON. Column order and kind come from the
/// sidecar when present.
pub fn read_table(table_path: &Path) -> Result<Table> {
    let metadata = read_metadata(table_path).ok();
    let reader = BufReader::new(File::open(table_path)?);
    let mut records = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: crate::table::Record = serde_json::from_str(&line)?;
        records.push(record);
    }

    let (name, kind, columns) = match metadata {
        Some(m) => (m.table_name, m.kind, m.columns),
        None => {
            let name = table_path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            let kind = if name.starts_with("fact_") {
                TableKind::Fact
            } else if name.ends_with("_bridge") {
                TableKind::Bridge
            } else {
                TableKind::Dimension
            };
            let mut columns: Vec<String> = Vec::new();
            for record in &records {
                for key in record.keys() {
                    if !columns.contains(key) {
                        columns.push(key.clone());
                    }
                }
            }
            (name, kind, columns)
        }
    };

    let mut table = Table::new(name, kind, columns);
    for record in &records {
        table.push_record(record);
    }
    Ok(table)
}

/// Recompute the structural checksum of a stored table and compare it with
/// the sidecar.
pub fn verify_checksum(table_path: &Path) -> Result<bool> {
    let metadata = read_metadata(table_path)?;
    let table = read_table(table_path)?;
    Ok(structural_checksum(&table) == metadata.checksum)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn sample() -> Table {
        let mut t = Table::new(
            "fact_sample",
            TableKind::Fact,
            vec!["item_key".into(), "price".into(), "label".into()],
        );
        t.rows.push(vec![json!("k1"), json!(1.5), json!("a")]);
        t.rows.push(vec![json!("k2"), Value::Null, json!("b")]);
        t.rows.push(vec![json!("k3"), json!(4.5), json!("a")]);
        t
    }

    #[test]
    fn test_publish_then_read_back() {
        let dir = TempDir::new().unwrap();
        let writer = TableWriter::new(dir.path());
        let mut staged = writer.stage("demo", "ETL-1").unwrap();
        let meta = staged.write_table(&sample()).unwrap();
        assert_eq!(meta.row_count, 3);
        assert_eq!(meta.column_stats["price"].null_count, 1);
        assert_eq!(meta.column_stats["price"].min, Some(1.5));
        assert_eq!(meta.column_stats["price"].mean, Some(3.0));
        assert_eq!(meta.column_stats["label"].unique_count, Some(2));

        let paths = staged.publish().unwrap();
        let path = &paths["fact_sample"];
        assert!(path.starts_with(writer.job_dir("demo", "ETL-1")));
        assert!(!dir.path().join("demo/.ETL-1.staging").exists());

        let table = read_table(path).unwrap();
        assert_eq!(table, sample());
        assert!(verify_checksum(path).unwrap());
    }

    #[test]
    fn test_dropped_stage_leaves_nothing() {
        let dir = TempDir::new().unwrap();
        let writer = TableWriter::new(dir.path());
        let mut staged = writer.stage("demo", "ETL-2").unwrap();
        staged.write_table(&sample()).unwrap();
        staged.discard();

        assert!(!dir.path().join("demo/.ETL-2.staging").exists());
        assert!(!writer.job_dir("demo", "ETL-2").exists());
    }

    #[test]
    fn test_checksum_detects_edge_changes() {
        let a = sample();
        let mut b = sample();
        b.rows[2][1] = json!(9.0);
        assert_ne!(structural_checksum(&a), structural_checksum(&b));

        let mut c = sample();
        c.rows[1][2] = json!("z");
        assert_eq!(structural_checksum(&a), structural_checksum(&c));
    }

    #[test]
    fn test_metadata_path_appends_suffix() {
        assert_eq!(
            metadata_path(Path::new("/x/dim_coin.ndjson")),
            PathBuf::from("/x/dim_coin.ndjson.meta.json")
        );
    }
}
