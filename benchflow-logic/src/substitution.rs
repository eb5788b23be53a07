//! Textual `$name` substitution.
//!
//! Parameter values, commands, file names, and pattern regexes may embed
//! `$name` or `${name}` references. Substitution replaces references to
//! *known* names only; unknown references pass through untouched so shell
//! and environment variables survive to execution. `$$` escapes a literal
//! dollar sign and is collapsed in a final pass.
//!
//! Chained indirection is resolved by bounded fixed-point iteration
//! ([`MAX_SUBSTITUTION_PASSES`] passes); values that still change after the
//! bound indicate a reference cycle and raise a resolution error instead of
//! substituting empty strings.

use benchflow_core::{BenchError, Result, MAX_SUBSTITUTION_PASSES};
use std::collections::BTreeMap;

/// Apply one substitution pass: every `$name` / `${name}` whose name is a
/// key of `values` is replaced. `$$` is left in place for [`finalize`].
pub fn substitute_once(text: &str, values: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(text.len());
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            let start = i;
            while i < bytes.len() && bytes[i] != b'$' {
                i += 1;
            }
            out.push_str(&text[start..i]);
            continue;
        }
        // Escaped dollar: keep verbatim, collapsed later.
        if i + 1 < bytes.len() && bytes[i + 1] == b'$' {
            out.push_str("$$");
            i += 2;
            continue;
        }
        let (name, end) = match read_reference(text, i) {
            Some(parsed) => parsed,
            None => {
                out.push('$');
                i += 1;
                continue;
            }
        };
        match values.get(name) {
            Some(value) => out.push_str(value),
            None => out.push_str(&text[i..end]),
        }
        i = end;
    }
    out
}

/// Parse a `$name` or `${name}` reference starting at `start` (which must
/// point at `$`). Returns the referenced name and the index past the
/// reference.
fn read_reference(text: &str, start: usize) -> Option<(&str, usize)> {
    let rest = &text[start + 1..];
    if let Some(stripped) = rest.strip_prefix('{') {
        let close = stripped.find('}')?;
        let name = &stripped[..close];
        if name.is_empty() || !is_name(name) {
            return None;
        }
        Some((name, start + 1 + 1 + close + 1))
    } else {
        let len = rest
            .char_indices()
            .take_while(|(idx, c)| {
                if *idx == 0 {
                    c.is_ascii_alphabetic() || *c == '_'
                } else {
                    c.is_ascii_alphanumeric() || *c == '_'
                }
            })
            .count();
        if len == 0 {
            return None;
        }
        Some((&rest[..len], start + 1 + len))
    }
}

fn is_name(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Collapse `$$` escapes into literal `$`. Call once, after the last
/// substitution pass over a text.
pub fn finalize(text: &str) -> String {
    text.replace("$$", "$")
}

/// Resolve a single text against fixed values: bounded fixed-point
/// substitution followed by escape collapapsing. References to names absent
/// from `values` survive untouched.
pub fn substitute_fixpoint(text: &str, values: &BTreeMap<String, String>) -> Result<String> {
    let mut current = text.to_string();
    for _ in 0..MAX_SUBSTITUTION_PASSES {
        let next = substitute_once(&current, values);
        if next == current {
            return Ok(finalize(&current));
        }
        current = next;
    }
    if substitute_once(&current, values) != current {
        return Err(BenchError::Resolution(format!(
            "value '{text}' still contains parameter references after {MAX_SUBSTITUTION_PASSES} \
             substitution passes (reference cycle?)"
        )));
    }
    Ok(finalize(&current))
}

/// Resolve an interdependent group of values in place: each pass
/// substitutes every entry against the current state of the whole group
/// plus `extra`. Returns an error when the group has not converged within
/// the pass bound.
pub fn resolve_group(
    values: &mut BTreeMap<String, String>,
    extra: &BTreeMap<String, String>,
) -> Result<()> {
    for _ in 0..MAX_SUBSTITUTION_PASSES {
        let mut lookup = values.clone();
        for (name, value) in extra {
            lookup.entry(name.clone()).or_insert_with(|| value.clone());
        }
        let mut changed = false;
        for value in values.values_mut() {
            let next = substitute_once(value, &lookup);
            if next != *value {
                *value = next;
                changed = true;
            }
        }
        if !changed {
            for value in values.values_mut() {
                *value = finalize(value);
            }
            return Ok(());
        }
    }
    let cyclic: Vec<&String> = values
        .iter()
        .filter(|(_, v)| {
            let mut lookup = values.clone();
            lookup.extend(extra.clone());
            substitute_once(v, &lookup) != **v
        })
        .map(|(k, _)| k)
        .collect();
    Err(BenchError::Resolution(format!(
        "parameter references did not resolve within {MAX_SUBSTITUTION_PASSES} passes \
         (cyclic definitions: {})",
        cyclic
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vals(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn plain_and_braced_references() {
        let values = vals(&[("nodes", "4")]);
        assert_eq!(substitute_once("run -n $nodes", &values), "run -n 4");
        assert_eq!(substitute_once("file_${nodes}.dat", &values), "file_4.dat");
    }

    #[test]
    fn unknown_references_survive() {
        let values = vals(&[("nodes", "4")]);
        assert_eq!(substitute_once("echo $HOME $nodes", &values), "echo $HOME 4");
    }

    #[test]
    fn escaped_dollar_collapses_once() {
        let values = vals(&[("x", "1")]);
        let result = substitute_fixpoint("cost: $$5 and $x", &values).unwrap();
        assert_eq!(result, "cost: $5 and 1");
    }

    #[test]
    fn chained_references_resolve() {
        let values = vals(&[("a", "$b"), ("b", "$c"), ("c", "leaf")]);
        assert_eq!(substitute_fixpoint("$a", &values).unwrap(), "leaf");
    }

    #[test]
    fn reference_cycle_is_an_error() {
        let values = vals(&[("a", "$b"), ("b", "$a")]);
        let err = substitute_fixpoint("$a", &values).unwrap_err();
        assert!(err.to_string().contains("passes"));
    }

    #[test]
    fn resolve_group_converges_with_extra_values() {
        let mut group = vals(&[("cmd", "run $mode on $host"), ("mode", "fast")]);
        let extra = vals(&[("host", "node01")]);
        resolve_group(&mut group, &extra).unwrap();
        assert_eq!(group["cmd"], "run fast on node01");
    }

    #[test]
    fn resolve_group_detects_cycles() {
        let mut group = vals(&[("a", "$b"), ("b", "$a")]);
        let err = resolve_group(&mut group, &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, BenchError::Resolution(_)));
    }

    #[test]
    fn dollar_before_non_name_is_literal() {
        let values = vals(&[("x", "1")]);
        assert_eq!(substitute_once("$ $1 $-", &values), "$ $1 $-");
    }
}
