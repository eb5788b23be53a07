//! Result composer model: tables, syslog records, database rows.

use crate::parameter::ParamType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Rendering style of a result table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableStyle {
    /// Comma-separated values.
    Csv,
    /// Boxed table with separators.
    #[default]
    Pretty,
    /// Whitespace-aligned columns without borders.
    Aligned,
}

impl std::str::FromStr for TableStyle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "csv" => Ok(TableStyle::Csv),
            "pretty" => Ok(TableStyle::Pretty),
            "aligned" => Ok(TableStyle::Aligned),
            other => Err(format!("unknown table style '{other}'")),
        }
    }
}

/// A selected output column/key with optional printf-style formatting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    /// Row field name (parameter or pattern, possibly suffixed).
    pub key: String,
    /// printf-style format applied to the value (e.g. `%.2f`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    /// Column header override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl ColumnSpec {
    /// Column without formatting or title override.
    pub fn new(key: impl Into<String>) -> Self {
        ColumnSpec {
            key: key.into(),
            format: None,
            title: None,
        }
    }

    /// Header text for this column.
    pub fn header(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.key)
    }
}

/// Table result specification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableSpec {
    /// Rendering style.
    #[serde(default)]
    pub style: TableStyle,
    /// Multi-key typed sort (field names, prefix `-` for descending).
    #[serde(default)]
    pub sort: Vec<String>,
    /// Swap rows and columns.
    #[serde(default)]
    pub transpose: bool,
    /// Boolean expression on row fields; false rows are dropped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    /// Columns in output order.
    #[serde(default)]
    pub columns: Vec<ColumnSpec>,
}

/// Syslog result specification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyslogSpec {
    /// `host:port` target; port defaults to [`DEFAULT_SYSLOG_PORT`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Unix datagram socket path (mutually exclusive with `address`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<String>,
    /// Record template with `$key` placeholders.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    /// Fields included in the record.
    #[serde(default)]
    pub keys: Vec<ColumnSpec>,
    /// Multi-key typed sort.
    #[serde(default)]
    pub sort: Vec<String>,
    /// Boolean expression on row fields; false rows are dropped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

/// Default syslog port.
pub const DEFAULT_SYSLOG_PORT: u16 = 541;

/// Database result specification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseSpec {
    /// SQLite file path.
    pub file: String,
    /// Table name.
    pub table: String,
    /// Column keys, in schema order.
    #[serde(default)]
    pub keys: Vec<String>,
    /// Primary-key column subset enabling upsert.
    #[serde(default)]
    pub primekeys: Vec<String>,
    /// Boolean expression on row fields; false rows are dropped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

/// Back-end selection for a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultKind {
    /// Render a table.
    Table(TableSpec),
    /// Emit one syslog record per row.
    Syslog(SyslogSpec),
    /// Append/upsert rows into a SQLite table.
    Database(DatabaseSpec),
}

/// Analyzer output consumed by the result back-ends: one value map per row
/// plus the declared type of each field (driving typed sorts and database
/// column types).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowSet {
    /// Rows in workpackage order; each maps field name to rendered value.
    pub rows: Vec<BTreeMap<String, String>>,
    /// Declared type per field name.
    pub types: BTreeMap<String, ParamType>,
}

impl RowSet {
    /// Append another row set, merging type declarations.
    pub fn extend(&mut self, other: RowSet) {
        self.rows.extend(other.rows);
        for (key, ptype) in other.types {
            self.types.entry(key).or_insert(ptype);
        }
    }
}

/// A named result definition consuming analyzer rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultDef {
    /// Result name; table output is written to `result/<name>.dat`.
    pub name: String,
    /// Analyzers whose rows feed this result.
    #[serde(default, rename = "use")]
    pub uses: Vec<String>,
    /// Back-end specification.
    pub kind: ResultKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_style_parses_known_names() {
        assert_eq!("csv".parse::<TableStyle>().unwrap(), TableStyle::Csv);
        assert_eq!("pretty".parse::<TableStyle>().unwrap(), TableStyle::Pretty);
        assert_eq!(
            "aligned".parse::<TableStyle>().unwrap(),
            TableStyle::Aligned
        );
        assert!("fancy".parse::<TableStyle>().is_err());
    }

    #[test]
    fn column_header_prefers_title() {
        let plain = ColumnSpec::new("nodes");
        assert_eq!(plain.header(), "nodes");
        let titled = ColumnSpec {
            title: Some("Node count".to_string()),
            ..ColumnSpec::new("nodes")
        };
        assert_eq!(titled.header(), "Node count");
    }
}
