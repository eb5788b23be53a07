//! Row filtering, sorting, and value formatting shared by all back-ends.

use benchflow_core::{BenchError, ParamType, Result};
use benchflow_logic::{eval_condition, substitute_fixpoint};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// A single result row: field name → rendered value.
pub type Row = BTreeMap<String, String>;

/// Apply an optional boolean filter expression to the rows. Row fields are
/// substituted into the expression before evaluation; rows evaluating to
/// false are dropped.
pub fn filter_rows(rows: Vec<Row>, filter: Option<&str>) -> Result<Vec<Row>> {
    let Some(filter) = filter else {
        return Ok(rows);
    };
    let mut kept = Vec::with_capacity(rows.len());
    for row in rows {
        let expr = substitute_fixpoint(filter, &row)?;
        if eval_condition(&expr)? {
            kept.push(row);
        }
    }
    Ok(kept)
}

/// Multi-key typed sort. A key prefixed with `-` sorts descending. Values
/// of int/float typed fields compare numerically, everything else
/// lexically; missing fields sort first.
pub fn sort_rows(rows: &mut [Row], sort: &[String], types: &BTreeMap<String, ParamType>) {
    if sort.is_empty() {
        return;
    }
    rows.sort_by(|a, b| {
        for key in sort {
            let (field, descending) = match key.strip_prefix('-') {
                Some(stripped) => (stripped, true),
                None => (key.as_str(), false),
            };
            let ptype = types.get(field).copied().unwrap_or(ParamType::String);
            let ordering = compare_values(a.get(field), b.get(field), ptype);
            let ordering = if descending { ordering.reverse() } else { ordering };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

fn compare_values(a: Option<&String>, b: Option<&String>, ptype: ParamType) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => {
            if ptype.is_numeric() {
                match (a.trim().parse::<f64>(), b.trim().parse::<f64>()) {
                    (Ok(a), Ok(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
                    _ => a.cmp(b),
                }
            } else {
                a.cmp(b)
            }
        }
    }
}

/// Render a value through an optional printf-style format
/// (`%[width][.precision]{d,i,f,e,g,s}`; `%%` escapes).
pub fn format_value(value: &str, format: Option<&str>) -> Result<String> {
    let Some(format) = format else {
        return Ok(value.to_string());
    };
    let Some(percent) = format.find('%') else {
        return Ok(format.to_string());
    };
    let (prefix, spec) = format.split_at(percent);
    let spec = &spec[1..];
    if let Some(rest) = spec.strip_prefix('%') {
        return Ok(format!("{prefix}%{rest}"));
    }

    let conv_pos = spec
        .find(|c: char| c.is_ascii_alphabetic())
        .ok_or_else(|| BenchError::Config(format!("invalid format '{format}'")))?;
    let (modifiers, rest) = spec.split_at(conv_pos);
    let conversion = rest.chars().next().expect("alphabetic found");
    let suffix = &rest[1..];

    let (width, precision) = parse_modifiers(modifiers, format)?;
    let rendered = match conversion {
        'd' | 'i' => {
            let number = value.trim().parse::<f64>().map_err(|_| {
                BenchError::Config(format!("cannot format '{value}' as integer"))
            })? as i64;
            pad(&number.to_string(), width)
        }
        'f' => {
            let number = value.trim().parse::<f64>().map_err(|_| {
                BenchError::Config(format!("cannot format '{value}' as float"))
            })?;
            pad(&format!("{:.*}", precision.unwrap_or(6), number), width)
        }
        'e' => {
            let number = value.trim().parse::<f64>().map_err(|_| {
                BenchError::Config(format!("cannot format '{value}' as float"))
            })?;
            pad(&format!("{:.*e}", precision.unwrap_or(6), number), width)
        }
        'g' => {
            let number = value.trim().parse::<f64>().map_err(|_| {
                BenchError::Config(format!("cannot format '{value}' as float"))
            })?;
            pad(&format!("{number}"), width)
        }
        's' => pad(value, width),
        other => {
            return Err(BenchError::Config(format!(
                "unsupported format conversion '%{other}'"
            )));
        }
    };
    Ok(format!("{prefix}{rendered}{suffix}"))
}

fn parse_modifiers(modifiers: &str, format: &str) -> Result<(Option<usize>, Option<usize>)> {
    let mut width = None;
    let mut precision = None;
    let (width_part, precision_part) = match modifiers.split_once('.') {
        Some((w, p)) => (w, Some(p)),
        None => (modifiers, None),
    };
    if !width_part.is_empty() {
        width = Some(width_part.parse().map_err(|_| {
            BenchError::Config(format!("invalid width in format '{format}'"))
        })?);
    }
    if let Some(p) = precision_part {
        precision = Some(p.parse().map_err(|_| {
            BenchError::Config(format!("invalid precision in format '{format}'"))
        })?);
    }
    Ok((width, precision))
}

fn pad(text: &str, width: Option<usize>) -> String {
    match width {
        Some(width) if text.len() < width => format!("{text:>width$}"),
        _ => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, &str)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn filter_drops_non_matching_rows() {
        let rows = vec![
            row(&[("n", "1")]),
            row(&[("n", "2")]),
            row(&[("n", "4")]),
        ];
        let kept = filter_rows(rows, Some("$n > 1")).unwrap();
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn numeric_sort_is_not_lexical() {
        let mut rows = vec![
            row(&[("n", "10")]),
            row(&[("n", "2")]),
            row(&[("n", "1")]),
        ];
        let mut types = BTreeMap::new();
        types.insert("n".to_string(), ParamType::Int);
        sort_rows(&mut rows, &["n".to_string()], &types);
        let order: Vec<&str> = rows.iter().map(|r| r["n"].as_str()).collect();
        assert_eq!(order, vec!["1", "2", "10"]);
    }

    #[test]
    fn descending_sort_with_prefix() {
        let mut rows = vec![row(&[("n", "1")]), row(&[("n", "3")])];
        let mut types = BTreeMap::new();
        types.insert("n".to_string(), ParamType::Int);
        sort_rows(&mut rows, &["-n".to_string()], &types);
        assert_eq!(rows[0]["n"], "3");
    }

    #[test]
    fn multi_key_sort() {
        let mut rows = vec![
            row(&[("a", "x"), ("n", "2")]),
            row(&[("a", "x"), ("n", "1")]),
            row(&[("a", "w"), ("n", "9")]),
        ];
        let mut types = BTreeMap::new();
        types.insert("n".to_string(), ParamType::Int);
        sort_rows(&mut rows, &["a".to_string(), "n".to_string()], &types);
        assert_eq!(rows[0]["a"], "w");
        assert_eq!(rows[1]["n"], "1");
    }

    #[test]
    fn printf_formats() {
        assert_eq!(format_value("3.14159", Some("%.2f")).unwrap(), "3.14");
        assert_eq!(format_value("42", Some("%d")).unwrap(), "42");
        assert_eq!(format_value("42", Some("%5d")).unwrap(), "   42");
        assert_eq!(format_value("abc", Some("%s")).unwrap(), "abc");
        assert_eq!(format_value("7", Some("n=%d")).unwrap(), "n=7");
        assert_eq!(format_value("7", Some("%d ms")).unwrap(), "7 ms");
        assert!(format_value("abc", Some("%d")).is_err());
    }

    #[test]
    fn format_without_percent_is_literal() {
        assert_eq!(format_value("x", Some("fixed")).unwrap(), "fixed");
        assert_eq!(format_value("x", None).unwrap(), "x");
    }
}
