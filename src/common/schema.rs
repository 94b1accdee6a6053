use crate::common::value::{ColumnRef, Row, Value};
use crate::mappings::Coercion;

/// Column metadata as reported by the source engine.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceColumn {
    pub column_name: String,
    pub data_type: String,
    pub numeric_precision: Option<u32>,
    pub numeric_scale: Option<u32>,
    pub is_nullable: bool,
    pub default: Option<String>,
    pub is_primary_key: bool,
}

impl SourceColumn {
    pub fn new(column_name: &str, data_type: &str) -> Self {
        SourceColumn {
            column_name: column_name.to_string(),
            data_type: data_type.to_string(),
            numeric_precision: None,
            numeric_scale: None,
            is_nullable: true,
            default: None,
            is_primary_key: false,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.is_primary_key = true;
        self.is_nullable = false;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.is_nullable = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSpec {
    pub name: String,
    pub target_name: String,
    pub source_type: String,
    pub target_type: String,
    pub is_nullable: bool,
    pub default: Option<String>,
    pub coercion: Coercion,
}

/// Mapped description of one table. Never changes while a run is in progress.
#[derive(Debug, Clone, PartialEq)]
pub struct TableSpec {
    pub name: String,
    pub target_name: String,
    pub columns: Vec<ColumnSpec>,
    pub key_index: usize,
    pub dropped: Vec<String>,
}

impl TableSpec {
    pub fn key_column(&self) -> &ColumnSpec {
        &self.columns[self.key_index]
    }

    pub fn key_of<'a>(&self, row: &'a Row) -> &'a Value {
        &row[self.key_index]
    }

    /// Columns as the source decodes them.
    pub fn source_columns(&self) -> Vec<ColumnRef> {
        self.columns
            .iter()
            .map(|column| ColumnRef::new(&column.name, column.coercion.input_kind()))
            .collect()
    }

    /// Columns as the target hands them back.
    pub fn target_columns(&self) -> Vec<ColumnRef> {
        self.columns
            .iter()
            .map(|column| ColumnRef::new(&column.target_name, column.coercion.output_kind()))
            .collect()
    }

    pub fn target_column_names(&self) -> Vec<String> {
        self.columns
            .iter()
            .map(|column| column.target_name.clone())
            .collect()
    }

    /// Applies every column's coercion to a source row.
    pub fn coerce_row(&self, row: Row) -> Result<Row, String> {
        if row.len() != self.columns.len() {
            return Err(format!(
                "expected {} fields, got {}",
                self.columns.len(),
                row.len()
            ));
        }

        row.into_iter()
            .zip(&self.columns)
            .map(|(value, column)| {
                column
                    .coercion
                    .apply(value, column.is_nullable)
                    .map_err(|reason| format!("{}: {}", column.name, reason))
            })
            .collect()
    }
}
