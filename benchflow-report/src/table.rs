//! Table rendering: csv, pretty, and aligned styles.

use crate::row::{filter_rows, format_value, sort_rows, Row};
use benchflow_core::{ColumnSpec, Result, RowSet, TableSpec, TableStyle};
use prettytable::{format, Cell, Row as PtRow, Table};

/// Render a row set as a table according to the spec. Returns the rendered
/// text (CSV included), ready for display or writing to the result file.
pub fn render_table(rowset: &RowSet, spec: &TableSpec) -> Result<String> {
    let rows = filter_rows(rowset.rows.clone(), spec.filter.as_deref())?;
    let mut rows = rows;
    sort_rows(&mut rows, &spec.sort, &rowset.types);

    let columns = effective_columns(&rows, spec);
    let mut grid: Vec<Vec<String>> = Vec::with_capacity(rows.len() + 1);
    grid.push(columns.iter().map(|c| c.header().to_string()).collect());
    for row in &rows {
        grid.push(render_row(row, &columns)?);
    }

    if spec.transpose {
        grid = transpose(grid);
    }

    match spec.style {
        TableStyle::Csv => Ok(render_csv(&grid)),
        TableStyle::Pretty => Ok(render_pretty(&grid, *format::consts::FORMAT_DEFAULT)),
        TableStyle::Aligned => Ok(render_pretty(&grid, *format::consts::FORMAT_CLEAN)),
    }
}

/// Explicit columns, or every field present in the rows.
fn effective_columns(rows: &[Row], spec: &TableSpec) -> Vec<ColumnSpec> {
    if !spec.columns.is_empty() {
        return spec.columns.clone();
    }
    let mut names: Vec<String> = Vec::new();
    for row in rows {
        for name in row.keys() {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
    }
    names.sort();
    names.into_iter().map(ColumnSpec::new).collect()
}

fn render_row(row: &Row, columns: &[ColumnSpec]) -> Result<Vec<String>> {
    columns
        .iter()
        .map(|column| match row.get(&column.key) {
            Some(value) => format_value(value, column.format.as_deref()),
            None => Ok(String::new()),
        })
        .collect()
}

fn transpose(grid: Vec<Vec<String>>) -> Vec<Vec<String>> {
    let width = grid.iter().map(Vec::len).max().unwrap_or(0);
    let mut out = vec![Vec::with_capacity(grid.len()); width];
    for row in &grid {
        for (column, slot) in out.iter_mut().enumerate() {
            slot.push(row.get(column).cloned().unwrap_or_default());
        }
    }
    out
}

fn render_csv(grid: &[Vec<String>]) -> String {
    let mut out = String::new();
    for row in grid {
        let line: Vec<String> = row.iter().map(|cell| csv_escape(cell)).collect();
        out.push_str(&line.join(","));
        out.push('\n');
    }
    out
}

fn csv_escape(cell: &str) -> String {
    if cell.contains([',', '"', '\n']) {
        format!("\"{}\"", cell.replace('"', "\"\""))
    } else {
        cell.to_string()
    }
}

fn render_pretty(grid: &[Vec<String>], table_format: format::TableFormat) -> String {
    let mut table = Table::new();
    table.set_format(table_format);
    let mut iter = grid.iter();
    if let Some(header) = iter.next() {
        table.set_titles(PtRow::new(header.iter().map(|c| Cell::new(c)).collect()));
    }
    for row in iter {
        table.add_row(PtRow::new(row.iter().map(|c| Cell::new(c)).collect()));
    }
    table.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use benchflow_core::ParamType;
    use std::collections::BTreeMap;

    fn rowset() -> RowSet {
        let mut rowset = RowSet::default();
        for (n, t) in [("1", "10"), ("4", "2"), ("2", "5")] {
            let mut row = BTreeMap::new();
            row.insert("number".to_string(), n.to_string());
            row.insert("time".to_string(), t.to_string());
            rowset.rows.push(row);
        }
        rowset.types.insert("number".to_string(), ParamType::Int);
        rowset.types.insert("time".to_string(), ParamType::Int);
        rowset
    }

    fn spec_with(style: TableStyle) -> TableSpec {
        TableSpec {
            style,
            columns: vec![ColumnSpec::new("number"), ColumnSpec::new("time")],
            ..Default::default()
        }
    }

    #[test]
    fn csv_output_is_stable() {
        let mut spec = spec_with(TableStyle::Csv);
        spec.sort = vec!["number".to_string()];
        let text = render_table(&rowset(), &spec).unwrap();
        assert_eq!(text, "number,time\n1,10\n2,5\n4,2\n");
        // Repeated rendering is byte-identical.
        assert_eq!(text, render_table(&rowset(), &spec).unwrap());
    }

    #[test]
    fn filter_applies_before_rendering() {
        let mut spec = spec_with(TableStyle::Csv);
        spec.filter = Some("$time >= 5".to_string());
        spec.sort = vec!["number".to_string()];
        let text = render_table(&rowset(), &spec).unwrap();
        assert_eq!(text.lines().count(), 3);
        assert!(!text.contains("4,2"));
    }

    #[test]
    fn transpose_swaps_axes() {
        let mut spec = spec_with(TableStyle::Csv);
        spec.sort = vec!["number".to_string()];
        spec.transpose = true;
        let text = render_table(&rowset(), &spec).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "number,1,2,4");
        assert_eq!(lines[1], "time,10,5,2");
    }

    #[test]
    fn column_format_and_title() {
        let mut spec = spec_with(TableStyle::Csv);
        spec.columns = vec![
            ColumnSpec {
                key: "number".to_string(),
                format: None,
                title: Some("N".to_string()),
            },
            ColumnSpec {
                key: "time".to_string(),
                format: Some("%.1f".to_string()),
                title: None,
            },
        ];
        spec.sort = vec!["number".to_string()];
        let text = render_table(&rowset(), &spec).unwrap();
        assert!(text.starts_with("N,time\n"));
        assert!(text.contains("1,10.0"));
    }

    #[test]
    fn csv_quotes_embedded_separators() {
        let mut rowset = RowSet::default();
        let mut row = BTreeMap::new();
        row.insert("msg".to_string(), "a,b".to_string());
        rowset.rows.push(row);
        let spec = TableSpec {
            style: TableStyle::Csv,
            ..Default::default()
        };
        let text = render_table(&rowset, &spec).unwrap();
        assert!(text.contains("\"a,b\""));
    }

    #[test]
    fn pretty_table_contains_all_cells() {
        let spec = spec_with(TableStyle::Pretty);
        let text = render_table(&rowset(), &spec).unwrap();
        for cell in ["number", "time", "1", "10", "4", "2"] {
            assert!(text.contains(cell), "missing {cell}");
        }
    }

    #[test]
    fn missing_columns_render_empty() {
        let mut spec = spec_with(TableStyle::Csv);
        spec.columns.push(ColumnSpec::new("absent"));
        let text = render_table(&rowset(), &spec).unwrap();
        assert!(text.lines().nth(1).unwrap().ends_with(','));
    }
}
