use serde::Serialize;

use crate::constants::{DATE_DIMENSION, DATE_KEY_COLUMN};

/// Dimension table declaration.
#[derive(Debug, Clone, Serialize)]
pub struct DimensionDef {
    pub name: &'static str,
    /// Surrogate key column, e.g. `coin_key`.
    pub key_column: &'static str,
    pub natural_key: Vec<&'static str>,
    pub attributes: Vec<&'static str>,
    /// Raw column holding a comma-delimited list. Each distinct element becomes
    /// one row whose single natural-key column holds the element.
    pub multi_value_source: Option<&'static str>,
    /// Only records with a non-blank value here feed the table.
    pub scope: Option<&'static str>,
}

impl DimensionDef {
    pub fn new(name: &'static str, key_column: &'static str, natural_key: &[&'static str]) -> Self {
        Self {
            name,
            key_column,
            natural_key: natural_key.to_vec(),
            attributes: Vec::new(),
            multi_value_source: None,
            scope: None,
        }
    }

    pub fn attributes(mut self, attributes: &[&'static str]) -> Self {
        self.attributes = attributes.to_vec();
        self
    }

    pub fn exploded_from(mut self, source_column: &'static str) -> Self {
        self.multi_value_source = Some(source_column);
        self
    }

    pub fn scoped_to(mut self, column: &'static str) -> Self {
        self.scope = Some(column);
        self
    }

    pub fn is_multi_valued(&self) -> bool {
        self.multi_value_source.is_some()
    }

    /// Output column order: key, natural key, remaining attributes.
    pub fn output_columns(&self) -> Vec<String> {
        let mut cols = vec![self.key_column.to_string()];
        for c in self.natural_key.iter().chain(self.attributes.iter()) {
            if !cols.iter().any(|existing| existing == c) {
                cols.push(c.to_string());
            }
        }
        cols
    }
}

/// Foreign key from a fact to a single-valued dimension.
#[derive(Debug, Clone, Serialize)]
pub struct ForeignKeyDef {
    pub dimension: &'static str,
    pub column: &'static str,
}

/// Fact table declaration.
#[derive(Debug, Clone, Serialize)]
pub struct FactDef {
    pub name: &'static str,
    pub grain: &'static str,
    pub foreign_keys: Vec<ForeignKeyDef>,
    /// Raw column the date key is derived from.
    pub date_source: Option<&'static str>,
    pub measures: Vec<&'static str>,
    pub degenerate: Vec<&'static str>,
    /// Only records with a non-blank value here produce fact rows.
    pub scope: Option<&'static str>,
}

impl FactDef {
    pub fn new(name: &'static str, grain: &'static str) -> Self {
        Self {
            name,
            grain,
            foreign_keys: Vec::new(),
            date_source: None,
            measures: Vec::new(),
            degenerate: Vec::new(),
            scope: None,
        }
    }

    pub fn references(mut self, dimension: &'static str, column: &'static str) -> Self {
        self.foreign_keys.push(ForeignKeyDef { dimension, column });
        self
    }

    pub fn dated_by(mut self, source_column: &'static str) -> Self {
        self.date_source = Some(source_column);
        self
    }

    pub fn measures(mut self, measures: &[&'static str]) -> Self {
        self.measures = measures.to_vec();
        self
    }

    pub fn degenerate(mut self, columns: &[&'static str]) -> Self {
        self.degenerate = columns.to_vec();
        self
    }

    pub fn scoped_to(mut self, column: &'static str) -> Self {
        self.scope = Some(column);
        self
    }

    /// Columns identifying one measurement: FKs, date key, measures and
    /// degenerate dimensions. Run-scoped stamps are excluded.
    pub fn business_key_columns(&self) -> Vec<String> {
        let mut cols: Vec<String> = self.foreign_keys.iter().map(|fk| fk.column.to_string()).collect();
        if self.date_source.is_some() {
            cols.push(DATE_KEY_COLUMN.to_string());
        }
        cols.extend(self.measures.iter().map(|m| m.to_string()));
        cols.extend(self.degenerate.iter().map(|d| d.to_string()));
        cols
    }
}

/// Many-to-many link from a single-valued dimension to another dimension.
///
/// A multi-valued right side yields one pair per list element; a
/// single-valued right side yields one pair per record carrying both keys.
#[derive(Debug, Clone, Serialize)]
pub struct BridgeDef {
    pub name: &'static str,
    pub left: &'static str,
    pub right: &'static str,
}

/// Inclusive bounds a measure is expected to respect.
#[derive(Debug, Clone, Serialize)]
pub struct MeasureBound {
    pub table: &'static str,
    pub column: &'static str,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

/// One FK column of a fact or bridge table and the dimension it points at.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Relation {
    pub table: String,
    pub column: String,
    pub dimension: String,
    pub dimension_key: String,
}

/// Complete star schema for one pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct SchemaDefinition {
    pub name: &'static str,
    /// Value written to `_source` on dimension rows.
    pub source: &'static str,
    /// Raw column renames applied before anything else.
    pub column_mappings: Vec<(&'static str, &'static str)>,
    pub dimensions: Vec<DimensionDef>,
    pub facts: Vec<FactDef>,
    pub bridges: Vec<BridgeDef>,
    pub measure_bounds: Vec<MeasureBound>,
}

impl SchemaDefinition {
    pub fn new(name: &'static str, source: &'static str) -> Self {
        Self {
            name,
            source,
            column_mappings: Vec::new(),
            dimensions: Vec::new(),
            facts: Vec::new(),
            bridges: Vec::new(),
            measure_bounds: Vec::new(),
        }
    }

    pub fn rename(mut self, from: &'static str, to: &'static str) -> Self {
        self.column_mappings.push((from, to));
        self
    }

    pub fn dimension(mut self, dim: DimensionDef) -> Self {
        self.dimensions.push(dim);
        self
    }

    pub fn fact(mut self, fact: FactDef) -> Self {
        self.facts.push(fact);
        self
    }

    pub fn bridge(mut self, name: &'static str, left: &'static str, right: &'static str) -> Self {
        self.bridges.push(BridgeDef { name, left, right });
        self
    }

    pub fn bound(
        mut self,
        table: &'static str,
        column: &'static str,
        min: Option<f64>,
        max: Option<f64>,
    ) -> Self {
        self.measure_bounds.push(MeasureBound { table, column, min, max });
        self
    }

    pub fn dimension_def(&self, name: &str) -> Option<&DimensionDef> {
        self.dimensions.iter().find(|d| d.name == name)
    }

    pub fn has_date_dimension(&self) -> bool {
        self.facts.iter().any(|f| f.date_source.is_some())
    }

    /// Every table the schema produces, dimensions first.
    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.dimensions.iter().map(|d| d.name.to_string()).collect();
        if self.has_date_dimension() {
            names.push(DATE_DIMENSION.to_string());
        }
        names.extend(self.facts.iter().map(|f| f.name.to_string()));
        names.extend(self.bridges.iter().map(|b| b.name.to_string()));
        names
    }

    /// All FK relationships, used for integrity checks.
    pub fn relations(&self) -> Vec<Relation> {
        let mut out = Vec::new();
        for fact in &self.facts {
            for fk in &fact.foreign_keys {
                if let Some(dim) = self.dimension_def(fk.dimension) {
                    out.push(Relation {
                        table: fact.name.to_string(),
                        column: fk.column.to_string(),
                        dimension: dim.name.to_string(),
                        dimension_key: dim.key_column.to_string(),
                    });
                }
            }
            if fact.date_source.is_some() {
                out.push(Relation {
                    table: fact.name.to_string(),
                    column: DATE_KEY_COLUMN.to_string(),
                    dimension: DATE_DIMENSION.to_string(),
                    dimension_key: DATE_KEY_COLUMN.to_string(),
                });
            }
        }
        for bridge in &self.bridges {
            for side in [bridge.left, bridge.right] {
                if let Some(dim) = self.dimension_def(side) {
                    out.push(Relation {
                        table: bridge.name.to_string(),
                        column: dim.key_column.to_string(),
                        dimension: dim.name.to_string(),
                        dimension_key: dim.key_column.to_string(),
                    });
                }
            }
        }
        out
    }

    /// Structural problems that would make the schema unbuildable.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        for fact in &self.facts {
            for fk in &fact.foreign_keys {
                match self.dimension_def(fk.dimension) {
                    None => problems.push(format!(
                        "{}.{} references unknown dimension {}",
                        fact.name, fk.column, fk.dimension
                    )),
                    Some(d) if d.is_multi_valued() => problems.push(format!(
                        "{}.{} cannot reference multi-valued dimension {}",
                        fact.name, fk.column, d.name
                    )),
                    Some(_) => {}
                }
            }
        }
        for bridge in &self.bridges {
            match (self.dimension_def(bridge.left), self.dimension_def(bridge.right)) {
                (Some(l), Some(r)) if !l.is_multi_valued() && l.name != r.name => {}
                _ => problems.push(format!(
                    "bridge {} needs a single-valued left dimension and a distinct right dimension",
                    bridge.name
                )),
            }
        }
        for dim in &self.dimensions {
            if dim.natural_key.is_empty() {
                problems.push(format!("dimension {} has no natural key", dim.name));
            }
            if dim.is_multi_valued() && dim.natural_key.len() != 1 {
                problems.push(format!(
                    "multi-valued dimension {} needs exactly one natural-key column",
                    dim.name
                ));
            }
        }
        problems
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SchemaDefinition {
        SchemaDefinition::new("sample", "test")
            .dimension(DimensionDef::new("dim_item", "item_key", &["item_id"]).attributes(&["name", "item_id"]))
            .dimension(DimensionDef::new("dim_tag", "tag_key", &["tag_name"]).exploded_from("tags"))
            .fact(
                FactDef::new("fact_item", "one row per item")
                    .references("dim_item", "item_key")
                    .dated_by("observed_at")
                    .measures(&["price"]),
            )
            .bridge("item_tag_bridge", "dim_item", "dim_tag")
    }

    #[test]
    fn test_table_names_and_relations() {
        let schema = sample();
        assert!(schema.validate().is_empty());
        assert_eq!(
            schema.table_names(),
            vec!["dim_item", "dim_tag", "dim_date", "fact_item", "item_tag_bridge"]
        );
        let rels = schema.relations();
        assert_eq!(rels.len(), 4);
        assert_eq!(rels[1].dimension, "dim_date");
    }

    #[test]
    fn test_output_columns_dedupe_natural_key() {
        let schema = sample();
        assert_eq!(
            schema.dimensions[0].output_columns(),
            vec!["item_key", "item_id", "name"]
        );
    }

    #[test]
    fn test_business_key_excludes_run_stamps() {
        let schema = sample();
        assert_eq!(
            schema.facts[0].business_key_columns(),
            vec!["item_key", "date_key", "price"]
        );
    }

    #[test]
    fn test_bridge_between_single_valued_dimensions_is_valid() {
        let schema = sample()
            .dimension(DimensionDef::new("dim_shop", "shop_key", &["shop_id"]).scoped_to("shop_id"))
            .bridge("item_shop_bridge", "dim_item", "dim_shop");
        assert!(schema.validate().is_empty(), "{:?}", schema.validate());

        let bad = sample().bridge("tag_item_bridge", "dim_tag", "dim_item");
        assert_eq!(bad.validate().len(), 1);
        let self_bridge = sample().bridge("item_item_bridge", "dim_item", "dim_item");
        assert_eq!(self_bridge.validate().len(), 1);
    }

    #[test]
    fn test_validate_rejects_fact_on_multi_valued_dimension() {
        let schema = sample().fact(FactDef::new("bad", "x").references("dim_tag", "tag_key"));
        assert_eq!(schema.validate().len(), 1);
    }
}
