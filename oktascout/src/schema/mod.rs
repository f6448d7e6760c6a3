//! Read-only view of the synced tenant snapshot: semantic table catalog plus
//! a bounded SQL executor.

mod executor;

pub use executor::{ColumnMeta, RowSet, SqlExecError, SqlExecutor};

use once_cell::sync::Lazy;
use serde::Deserialize;

/// One column: name, declared type, semantics for the model.
#[derive(Clone, Debug, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub sql_type: String,
    pub description: String,
}

/// One table of the snapshot.
#[derive(Clone, Debug, Deserialize)]
pub struct TableInfo {
    pub name: String,
    pub description: String,
    pub columns: Vec<ColumnInfo>,
}

#[derive(Deserialize)]
struct SchemaFile {
    tables: Vec<TableInfo>,
}

const EMBEDDED_SCHEMA: &str = include_str!("okta_schema.yaml");

static SCHEMA: Lazy<Vec<TableInfo>> = Lazy::new(|| {
    let file: SchemaFile =
        serde_yaml::from_str(EMBEDDED_SCHEMA).expect("embedded okta_schema.yaml is valid");
    file.tables
});

/// Read-only semantic catalog of snapshot tables.
#[derive(Clone, Copy, Debug, Default)]
pub struct SchemaView;

impl SchemaView {
    pub fn new() -> Self {
        Self
    }

    pub fn tables(&self) -> &'static [TableInfo] {
        &SCHEMA
    }

    /// Tables matching the given names (case-insensitive); empty filter
    /// returns everything.
    pub fn filtered(&self, names: &[String]) -> Vec<&'static TableInfo> {
        if names.is_empty() {
            return SCHEMA.iter().collect();
        }
        SCHEMA
            .iter()
            .filter(|t| names.iter().any(|n| n.eq_ignore_ascii_case(&t.name)))
            .collect()
    }

    /// Prompt block: one line per table plus indented columns.
    pub fn render(&self, tables: &[&TableInfo]) -> String {
        let mut out = String::new();
        for table in tables {
            out.push_str(&format!("{} — {}\n", table.name, table.description));
            for col in &table.columns {
                out.push_str(&format!(
                    "  {} {} — {}\n",
                    col.name, col.sql_type, col.description
                ));
            }
        }
        out
    }

    pub fn summary(&self) -> String {
        self.render(&self.filtered(&[]))
    }
}
