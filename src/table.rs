use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Flat key→scalar mapping as produced by extractors.
pub type Record = Map<String, Value>;

/// Role of a table within a star schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableKind {
    Dimension,
    Fact,
    Bridge,
}

impl fmt::Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TableKind::Dimension => "dimension",
            TableKind::Fact => "fact",
            TableKind::Bridge => "bridge",
        };
        f.write_str(s)
    }
}

/// In-memory table with an explicit column list. Every row holds one cell per column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    pub kind: TableKind,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn new(name: impl Into<String>, kind: TableKind, columns: Vec<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            columns,
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.column_index(column).is_some()
    }

    /// Appends a row built from a record; columns absent from the record become null.
    pub fn push_record(&mut self, record: &Record) {
        let row = self
            .columns
            .iter()
            .map(|c| record.get(c).cloned().unwrap_or(Value::Null))
            .collect();
        self.rows.push(row);
    }

    /// Iterates the values of one column. Yields nothing when the column is missing.
    pub fn column_values<'a>(&'a self, column: &str) -> impl Iterator<Item = &'a Value> + 'a {
        let idx = self.column_index(column);
        self.rows
            .iter()
            .filter_map(move |row| idx.and_then(|i| row.get(i)))
    }

    pub fn null_count(&self, column: &str) -> usize {
        self.column_values(column).filter(|v| v.is_null()).count()
    }

    /// Null rate of a column; an empty table has no nulls.
    pub fn null_rate(&self, column: &str) -> f64 {
        if self.rows.is_empty() {
            return 0.0;
        }
        self.null_count(column) as f64 / self.rows.len() as f64
    }

    pub fn row_as_record(&self, index: usize) -> Option<Record> {
        let row = self.rows.get(index)?;
        Some(
            self.columns
                .iter()
                .cloned()
                .zip(row.iter().cloned())
                .collect(),
        )
    }

    pub fn records(&self) -> impl Iterator<Item = Record> + '_ {
        (0..self.rows.len()).filter_map(move |i| self.row_as_record(i))
    }

    /// Copy of the table without the named columns. Used to compare runs
    /// while ignoring run-scoped fields.
    pub fn without_columns(&self, drop: &[&str]) -> Table {
        let keep: Vec<usize> = self
            .columns
            .iter()
            .enumerate()
            .filter(|(_, c)| !drop.contains(&c.as_str()))
            .map(|(i, _)| i)
            .collect();
        Table {
            name: self.name.clone(),
            kind: self.kind,
            columns: keep.iter().map(|&i| self.columns[i].clone()).collect(),
            rows: self
                .rows
                .iter()
                .map(|row| keep.iter().map(|&i| row[i].clone()).collect())
                .collect(),
        }
    }
}

/// Named set of tables produced by one transformer run.
pub type TableSet = BTreeMap<String, Table>;

/// Parse a measure cell into a number. Unparsable values become null.
pub fn coerce_numeric(value: &Value) -> Value {
    match value {
        Value::Number(_) => value.clone(),
        Value::Bool(b) => Value::from(u8::from(*b)),
        Value::String(s) => {
            let s = s.trim().replace(',', "");
            if let Ok(i) = s.parse::<i64>() {
                return Value::from(i);
            }
            s.parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .unwrap_or(Value::Null)
        }
        _ => Value::Null,
    }
}

pub fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|f| f.is_finite()),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

/// Textual form of a scalar, `None` for null or blank strings.
pub fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Table {
        let mut t = Table::new(
            "dim_coin",
            TableKind::Dimension,
            vec!["coin_key".into(), "name".into()],
        );
        let mut r = Record::new();
        r.insert("coin_key".into(), json!("k1"));
        t.push_record(&r);
        r.insert("name".into(), json!("Bitcoin"));
        t.push_record(&r);
        t
    }

    #[test]
    fn test_push_record_fills_missing_with_null() {
        let t = sample();
        assert_eq!(t.len(), 2);
        assert_eq!(t.null_count("name"), 1);
        assert!((t.null_rate("name") - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_null_rate_of_empty_table_is_zero() {
        let t = Table::new("x", TableKind::Fact, vec!["a".into()]);
        assert_eq!(t.null_rate("a"), 0.0);
    }

    #[test]
    fn test_coerce_numeric() {
        assert_eq!(coerce_numeric(&json!("42")), json!(42));
        assert_eq!(coerce_numeric(&json!("1,250.5")), json!(1250.5));
        assert_eq!(coerce_numeric(&json!("n/a")), Value::Null);
        assert_eq!(coerce_numeric(&Value::Null), Value::Null);
        assert_eq!(coerce_numeric(&json!(3.5)), json!(3.5));
    }

    #[test]
    fn test_without_columns() {
        let t = sample().without_columns(&["name"]);
        assert_eq!(t.columns, vec!["coin_key".to_string()]);
        assert_eq!(t.rows[1], vec![json!("k1")]);
    }
}
