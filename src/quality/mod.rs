//! Quality gate engine.
//!
//! Gates are stateless checks over a snapshot of tables. Each produces a score
//! in `[0, 1]`, passes when the score meets its threshold, and may be marked
//! blocking. A [`QualityReport`] aggregates a suite of gates with a fixed
//! per-gate-name weight table.

mod checks;

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::{info, warn};

pub use checks::Bound;

use crate::config::QualityConfig;
use crate::constants::{
    DATE_KEY_COLUMN, GATE_COMPLETENESS, GATE_COVERAGE, GATE_DUPLICATES, GATE_FRESHNESS,
    GATE_REFERENTIAL_INTEGRITY, GATE_RESTATEMENT, GATE_SCHEMA_DRIFT, GATE_VALUE_SANITY,
    LOADED_AT_COLUMN, SOURCE_COLUMN,
};
use crate::table::TableSet;
use crate::transform::schema::{Relation, SchemaDefinition};

/// Weight given to gate names missing from [`GATE_WEIGHTS`].
pub const DEFAULT_GATE_WEIGHT: f64 = 0.1;

/// Per-gate weights used for the overall score. They need not sum to 1.
pub static GATE_WEIGHTS: Lazy<HashMap<&'static str, f64>> = Lazy::new(|| {
    HashMap::from([
        (GATE_SCHEMA_DRIFT, 0.15),
        (GATE_FRESHNESS, 0.15),
        (GATE_COMPLETENESS, 0.20),
        (GATE_DUPLICATES, 0.15),
        (GATE_VALUE_SANITY, 0.20),
        (GATE_REFERENTIAL_INTEGRITY, 0.15),
        (GATE_RESTATEMENT, 0.15),
        (GATE_COVERAGE, 0.25),
        ("unit_consistency", 0.20),
        ("period_logic", 0.20),
        ("outliers", 0.20),
    ])
});

pub fn gate_weight(name: &str) -> f64 {
    GATE_WEIGHTS.get(name).copied().unwrap_or(DEFAULT_GATE_WEIGHT)
}

/// Outcome of one gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityGate {
    pub name: String,
    pub passed: bool,
    pub score: f64,
    pub threshold: f64,
    pub blocking: bool,
    pub details: Map<String, Value>,
    pub issues: Vec<String>,
}

/// What a gate inspects.
#[derive(Debug, Clone, PartialEq)]
pub enum GateCheck {
    /// Missing expected columns and key columns above a null-rate ceiling.
    SchemaShape {
        expected_columns: Vec<(String, Vec<String>)>,
        key_columns: Vec<(String, String)>,
        max_key_null_rate: f64,
    },
    /// Linear decay of the newest date towards a staleness ceiling.
    Freshness {
        table: String,
        date_column: String,
        ceiling_days: f64,
        /// Reference day; today when `None`.
        as_of: Option<NaiveDate>,
    },
    Completeness {
        columns: Vec<(String, String)>,
    },
    /// Content hash over business-key columns, per table.
    Duplicates {
        tables: Vec<(String, Vec<String>)>,
    },
    ValueSanity {
        bounds: Vec<Bound>,
        outlier_columns: Vec<(String, String)>,
    },
    ReferentialIntegrity {
        relations: Vec<Relation>,
    },
    /// Same group key reported with different measure values.
    Restatement {
        table: String,
        group_columns: Vec<String>,
        measures: Vec<String>,
    },
    /// Share of required columns each entity reports at least once.
    Coverage {
        table: String,
        entity_column: String,
        required: Vec<String>,
    },
}

impl GateCheck {
    fn default_name(&self) -> &'static str {
        match self {
            GateCheck::SchemaShape { .. } => GATE_SCHEMA_DRIFT,
            GateCheck::Freshness { .. } => GATE_FRESHNESS,
            GateCheck::Completeness { .. } => GATE_COMPLETENESS,
            GateCheck::Duplicates { .. } => GATE_DUPLICATES,
            GateCheck::ValueSanity { .. } => GATE_VALUE_SANITY,
            GateCheck::ReferentialIntegrity { .. } => GATE_REFERENTIAL_INTEGRITY,
            GateCheck::Restatement { .. } => GATE_RESTATEMENT,
            GateCheck::Coverage { .. } => GATE_COVERAGE,
        }
    }

    fn default_threshold(&self) -> f64 {
        match self {
            GateCheck::SchemaShape { .. } => 0.95,
            GateCheck::Freshness { .. } => 0.8,
            GateCheck::Completeness { .. } => 0.9,
            GateCheck::Duplicates { .. } => 0.95,
            GateCheck::ValueSanity { .. } => 0.85,
            GateCheck::ReferentialIntegrity { .. } => 0.95,
            // informational: the score never drops below 0.5
            GateCheck::Restatement { .. } => 0.5,
            GateCheck::Coverage { .. } => 0.8,
        }
    }
}

/// A gate to run: check, name, threshold and whether failure blocks the job.
#[derive(Debug, Clone, PartialEq)]
pub struct GateSpec {
    pub name: String,
    pub check: GateCheck,
    pub threshold: f64,
    pub blocking: bool,
}

impl GateSpec {
    /// Default name and threshold for the check; non-blocking.
    pub fn new(check: GateCheck) -> Self {
        Self {
            name: check.default_name().to_string(),
            threshold: check.default_threshold(),
            check,
            blocking: false,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }
}

/// Run one gate over a table snapshot.
pub fn run_gate(tables: &TableSet, spec: &GateSpec) -> QualityGate {
    let gate = checks::evaluate(tables, spec);
    ::metrics::histogram!("etl_quality_gate_score", "gate" => gate.name.clone()).record(gate.score);
    gate
}

/// Weighted mean of gate scores. Zero when there are no gates.
pub fn overall_score(gates: &[QualityGate]) -> f64 {
    let (weighted, total) = gates.iter().fold((0.0, 0.0), |(ws, w), g| {
        let weight = gate_weight(&g.name);
        (ws + weight * g.score, w + weight)
    });
    if total > 0.0 {
        weighted / total
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub gates: Vec<QualityGate>,
    pub overall_score: f64,
    /// Every blocking gate met its threshold.
    pub passed: bool,
    /// Every gate met its threshold, blocking or not.
    pub all_gates_passed: bool,
    pub blocking_failures: Vec<String>,
}

impl QualityReport {
    pub fn from_gates(gates: Vec<QualityGate>) -> Self {
        let blocking_failures: Vec<String> = gates
            .iter()
            .filter(|g| g.blocking && !g.passed)
            .map(|g| g.name.clone())
            .collect();
        Self {
            overall_score: overall_score(&gates),
            passed: blocking_failures.is_empty(),
            all_gates_passed: gates.iter().all(|g| g.passed),
            blocking_failures,
            gates,
        }
    }

    pub fn gate(&self, name: &str) -> Option<&QualityGate> {
        self.gates.iter().find(|g| g.name == name)
    }
}

/// Ordered set of gates run against one pipeline's output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GateSuite {
    pub gates: Vec<GateSpec>,
}

impl GateSuite {
    pub fn new(gates: Vec<GateSpec>) -> Self {
        Self { gates }
    }

    pub fn with_gate(mut self, gate: GateSpec) -> Self {
        self.gates.push(gate);
        self
    }

    pub fn run(&self, tables: &TableSet) -> QualityReport {
        let gates: Vec<QualityGate> = self.gates.iter().map(|spec| run_gate(tables, spec)).collect();
        for gate in &gates {
            if gate.passed {
                info!("✅ Gate {} passed ({:.3} >= {:.2})", gate.name, gate.score, gate.threshold);
            } else {
                warn!(
                    "⚠️ Gate {} failed ({:.3} < {:.2}){}: {:?}",
                    gate.name,
                    gate.score,
                    gate.threshold,
                    if gate.blocking { " [blocking]" } else { "" },
                    gate.issues
                );
            }
        }
        QualityReport::from_gates(gates)
    }

    /// Default suite for a star schema.
    ///
    /// Every gate is informational; a gate blocks only when its name is listed
    /// in `quality.blocking_gates`.
    pub fn for_schema(schema: &SchemaDefinition, quality: &QualityConfig) -> Self {
        let mut expected = Vec::new();
        let mut key_columns = Vec::new();
        let mut completeness = Vec::new();

        for dim in &schema.dimensions {
            let mut cols = dim.output_columns();
            cols.push(LOADED_AT_COLUMN.to_string());
            cols.push(SOURCE_COLUMN.to_string());
            expected.push((dim.name.to_string(), cols));
            key_columns.push((dim.name.to_string(), dim.key_column.to_string()));
            for nk in &dim.natural_key {
                completeness.push((dim.name.to_string(), nk.to_string()));
            }
        }

        let mut duplicate_targets = Vec::new();
        let mut outlier_columns = Vec::new();
        for fact in &schema.facts {
            expected.push((fact.name.to_string(), fact.business_key_columns()));
            for fk in &fact.foreign_keys {
                key_columns.push((fact.name.to_string(), fk.column.to_string()));
                completeness.push((fact.name.to_string(), fk.column.to_string()));
            }
            if fact.date_source.is_some() {
                completeness.push((fact.name.to_string(), DATE_KEY_COLUMN.to_string()));
            }
            duplicate_targets.push((fact.name.to_string(), fact.business_key_columns()));
            outlier_columns.extend(fact.measures.iter().map(|m| (fact.name.to_string(), m.to_string())));
        }

        let bounds = schema
            .measure_bounds
            .iter()
            .map(|b| Bound {
                table: b.table.to_string(),
                column: b.column.to_string(),
                min: b.min,
                max: b.max,
            })
            .collect();

        let mut suite = GateSuite::default()
            .with_gate(GateSpec::new(GateCheck::SchemaShape {
                expected_columns: expected,
                key_columns,
                max_key_null_rate: 0.05,
            }))
            .with_gate(GateSpec::new(GateCheck::Completeness { columns: completeness }))
            .with_gate(GateSpec::new(GateCheck::Duplicates { tables: duplicate_targets }));

        if let Some(fact) = schema.facts.iter().find(|f| f.date_source.is_some()) {
            suite = suite.with_gate(GateSpec::new(GateCheck::Freshness {
                table: fact.name.to_string(),
                date_column: DATE_KEY_COLUMN.to_string(),
                ceiling_days: quality.freshness_ceiling_days,
                as_of: None,
            }));
        }

        suite = suite
            .with_gate(GateSpec::new(GateCheck::ValueSanity { bounds, outlier_columns }))
            .with_gate(GateSpec::new(GateCheck::ReferentialIntegrity {
                relations: schema.relations(),
            }));

        for fact in &schema.facts {
            let mut group: Vec<String> = fact.foreign_keys.iter().map(|fk| fk.column.to_string()).collect();
            if fact.date_source.is_some() {
                group.push(DATE_KEY_COLUMN.to_string());
            }
            if group.is_empty() || fact.measures.is_empty() {
                continue;
            }
            let spec = GateSpec::new(GateCheck::Restatement {
                table: fact.name.to_string(),
                group_columns: group,
                measures: fact.measures.iter().map(|m| m.to_string()).collect(),
            });
            // one restatement gate per fact; the first keeps the weighted name
            let spec = if suite.gates.iter().any(|g| g.name == GATE_RESTATEMENT) {
                spec.named(format!("{}:{}", GATE_RESTATEMENT, fact.name))
            } else {
                spec
            };
            suite = suite.with_gate(spec);
        }

        for gate in &mut suite.gates {
            gate.blocking = quality.blocking_gates.iter().any(|name| *name == gate.name);
        }
        suite
    }
}
