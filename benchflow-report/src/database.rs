//! SQLite result back-end.
//!
//! Rows are appended to (or upserted into) a table whose schema is created
//! on first use from the declared keys. Schema drift across runs is
//! rejected; with `primekeys` set, re-running with identical inputs leaves
//! the row count unchanged.

use crate::row::filter_rows;
use benchflow_core::{BenchError, DatabaseSpec, ParamType, Result, RowSet};
use rusqlite::Connection;
use tracing::debug;

/// Write a row set into the configured SQLite file. Returns the number of
/// rows written.
pub fn write_database(rowset: &RowSet, spec: &DatabaseSpec) -> Result<usize> {
    if spec.keys.is_empty() {
        return Err(BenchError::Config(format!(
            "database result table '{}' declares no keys",
            spec.table
        )));
    }
    for primekey in &spec.primekeys {
        if !spec.keys.contains(primekey) {
            return Err(BenchError::Config(format!(
                "primekey '{primekey}' is not among the declared keys"
            )));
        }
    }

    let rows = filter_rows(rowset.rows.clone(), spec.filter.as_deref())?;

    let connection = Connection::open(&spec.file)
        .map_err(|e| BenchError::Config(format!("opening database '{}': {e}", spec.file)))?;

    ensure_schema(&connection, spec, rowset)?;

    let placeholders: Vec<String> = (1..=spec.keys.len()).map(|i| format!("?{i}")).collect();
    let verb = if spec.primekeys.is_empty() {
        "INSERT"
    } else {
        "INSERT OR REPLACE"
    };
    let sql = format!(
        "{verb} INTO \"{}\" ({}) VALUES ({})",
        spec.table,
        spec.keys
            .iter()
            .map(|k| format!("\"{k}\""))
            .collect::<Vec<_>>()
            .join(", "),
        placeholders.join(", ")
    );
    let mut statement = connection
        .prepare(&sql)
        .map_err(|e| BenchError::Config(format!("preparing insert: {e}")))?;

    let mut written = 0;
    for row in &rows {
        let values: Vec<String> = spec
            .keys
            .iter()
            .map(|key| row.get(key).cloned().unwrap_or_default())
            .collect();
        statement
            .execute(rusqlite::params_from_iter(values.iter()))
            .map_err(|e| BenchError::Config(format!("inserting row: {e}")))?;
        written += 1;
    }
    debug!(table = %spec.table, rows = written, "database write complete");
    Ok(written)
}

/// Create the table on first use; afterwards verify the stored column list
/// matches the declared keys.
fn ensure_schema(connection: &Connection, spec: &DatabaseSpec, rowset: &RowSet) -> Result<()> {
    let existing: Option<Vec<String>> = table_columns(connection, &spec.table)?;
    match existing {
        Some(columns) => {
            if columns != spec.keys {
                return Err(BenchError::Config(format!(
                    "table '{}' already exists with columns [{}], configured keys are [{}]",
                    spec.table,
                    columns.join(", "),
                    spec.keys.join(", ")
                )));
            }
            Ok(())
        }
        None => {
            let columns: Vec<String> = spec
                .keys
                .iter()
                .map(|key| {
                    let sql_type = match rowset.types.get(key) {
                        Some(ParamType::Int) => "INTEGER",
                        Some(ParamType::Float) => "REAL",
                        _ => "TEXT",
                    };
                    format!("\"{key}\" {sql_type}")
                })
                .collect();
            let primary = if spec.primekeys.is_empty() {
                String::new()
            } else {
                format!(
                    ", PRIMARY KEY ({})",
                    spec.primekeys
                        .iter()
                        .map(|k| format!("\"{k}\""))
                        .collect::<Vec<_>>()
                        .join(", ")
                )
            };
            let sql = format!(
                "CREATE TABLE \"{}\" ({}{})",
                spec.table,
                columns.join(", "),
                primary
            );
            connection
                .execute(&sql, [])
                .map_err(|e| BenchError::Config(format!("creating table: {e}")))?;
            Ok(())
        }
    }
}

fn table_columns(connection: &Connection, table: &str) -> Result<Option<Vec<String>>> {
    let mut statement = connection
        .prepare("SELECT name FROM pragma_table_info(?1) ORDER BY cid")
        .map_err(|e| BenchError::Config(format!("querying schema: {e}")))?;
    let columns: Vec<String> = statement
        .query_map([table], |row| row.get::<_, String>(0))
        .map_err(|e| BenchError::Config(format!("querying schema: {e}")))?
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| BenchError::Config(format!("querying schema: {e}")))?;
    if columns.is_empty() {
        Ok(None)
    } else {
        Ok(Some(columns))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn rowset() -> RowSet {
        let mut rowset = RowSet::default();
        for (n, p) in [("1", "1"), ("2", "2"), ("4", "4")] {
            let mut row = BTreeMap::new();
            row.insert("number".to_string(), n.to_string());
            row.insert("number_pat".to_string(), p.to_string());
            rowset.rows.push(row);
        }
        rowset.types.insert("number".to_string(), ParamType::Int);
        rowset
            .types
            .insert("number_pat".to_string(), ParamType::Int);
        rowset
    }

    fn spec(file: &str) -> DatabaseSpec {
        DatabaseSpec {
            file: file.to_string(),
            table: "results".to_string(),
            keys: vec!["number".to_string(), "number_pat".to_string()],
            primekeys: vec!["number".to_string(), "number_pat".to_string()],
            filter: None,
        }
    }

    fn count_rows(file: &str) -> i64 {
        let connection = Connection::open(file).unwrap();
        connection
            .query_row("SELECT COUNT(*) FROM results", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn upsert_preserves_row_count_on_rerun() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("result_database.dat");
        let file = file.to_str().unwrap();

        let written = write_database(&rowset(), &spec(file)).unwrap();
        assert_eq!(written, 3);
        assert_eq!(count_rows(file), 3);

        write_database(&rowset(), &spec(file)).unwrap();
        assert_eq!(count_rows(file), 3, "upsert must not duplicate rows");
    }

    #[test]
    fn append_without_primekeys_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain.dat");
        let file = file.to_str().unwrap();
        let mut spec = spec(file);
        spec.primekeys.clear();

        write_database(&rowset(), &spec).unwrap();
        write_database(&rowset(), &spec).unwrap();
        assert_eq!(count_rows(file), 6);
    }

    #[test]
    fn schema_drift_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("drift.dat");
        let file = file.to_str().unwrap();
        write_database(&rowset(), &spec(file)).unwrap();

        let mut changed = spec(file);
        changed.keys.push("extra".to_string());
        changed.primekeys.clear();
        let err = write_database(&rowset(), &changed).unwrap_err();
        assert!(matches!(err, BenchError::Config(_)));
    }

    #[test]
    fn filter_applies_before_write() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("filtered.dat");
        let file = file.to_str().unwrap();
        let mut spec = spec(file);
        spec.filter = Some("$number > 1".to_string());
        let written = write_database(&rowset(), &spec).unwrap();
        assert_eq!(written, 2);
    }

    #[test]
    fn primekeys_must_be_keys() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("bad.dat");
        let mut spec = spec(file.to_str().unwrap());
        spec.primekeys = vec!["unknown".to_string()];
        assert!(write_database(&rowset(), &spec).is_err());
    }
}
