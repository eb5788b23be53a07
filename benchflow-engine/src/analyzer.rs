//! Output analysis.
//!
//! An analyzer scans the files of a step's workpackages with compiled
//! patterns, collecting an ordered capture sequence per pattern. Derived
//! patterns (whose text references other patterns' values) are evaluated
//! afterwards in dependency order. Captures are persisted so results can be
//! re-rendered without re-scanning, and reduced into the suffixed
//! statistics when rows are built.

use crate::benchmark::Benchmark;
use crate::store::ANALYSE_FILENAME;
use crate::workpackage::{Workpackage, WpState};
use benchflow_core::{
    AnalyzerDef, BenchError, ParamMode, ParamType, PatternDef, Result, RowSet, RunContext,
    PATTERN_ALIASES,
};
use benchflow_logic::{evaluate_value, substitute_fixpoint, DependencyGraph};
use benchflow_stats::{reduce_captures, Statistic};
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Captures per pattern name for one workpackage.
pub type PatternCaptures = BTreeMap<String, Vec<String>>;

/// Persisted analysis state: analyzer → workpackage id → captures.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnalysisData(pub BTreeMap<String, BTreeMap<u32, PatternCaptures>>);

impl AnalysisData {
    /// Load persisted analysis data; a corrupt file is skipped with a
    /// warning and treated as empty.
    pub fn load(benchmark: &Benchmark) -> AnalysisData {
        let path = benchmark.bench_dir.join(ANALYSE_FILENAME);
        match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(data) => data,
                Err(e) => {
                    warn!("corrupt analysis data in {}: {e}; ignoring", path.display());
                    AnalysisData::default()
                }
            },
            Err(_) => AnalysisData::default(),
        }
    }

    /// Persist analysis data into the benchmark directory.
    pub fn persist(&self, benchmark: &Benchmark) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| BenchError::Analyzer(format!("serializing analysis data: {e}")))?;
        std::fs::write(benchmark.bench_dir.join(ANALYSE_FILENAME), json)
            .map_err(|e| BenchError::io("writing analysis data", e))
    }
}

/// Run all analyzers (or a single named one) over the benchmark, merging
/// into previously persisted data.
pub fn analyse(
    benchmark: &Benchmark,
    ctx: &RunContext,
    only: Option<&str>,
) -> Result<AnalysisData> {
    let mut data = AnalysisData::load(benchmark);
    for analyzer in benchmark.config.analyzers.values() {
        if let Some(only) = only {
            if analyzer.name != only {
                continue;
            }
        }
        let captures = analyse_one(benchmark, analyzer, ctx)?;
        data.0.insert(analyzer.name.clone(), captures);
        info!(analyzer = %analyzer.name, "analysis complete");
    }
    data.persist(benchmark)?;
    Ok(data)
}

fn analyse_one(
    benchmark: &Benchmark,
    analyzer: &AnalyzerDef,
    ctx: &RunContext,
) -> Result<BTreeMap<u32, PatternCaptures>> {
    let mut per_wp = BTreeMap::new();
    for block in &analyzer.analyses {
        let Some(wps) = benchmark.workpackages.get(&block.step) else {
            continue;
        };
        let Some(step) = benchmark.config.steps.get(&block.step) else {
            continue;
        };
        // Union of all patterns referenced by this block, for the derived
        // pass after scanning.
        let mut all_patterns: Vec<&PatternDef> = Vec::new();
        for set_name in analyzer
            .uses
            .iter()
            .chain(block.files.iter().flat_map(|f| f.uses.iter()))
        {
            if let Some(set) = benchmark.config.patternsets.get(set_name) {
                for pattern in &set.patterns {
                    if !all_patterns.iter().any(|p| p.name == pattern.name) {
                        all_patterns.push(pattern);
                    }
                }
            }
        }
        let (scanning, derived): (Vec<&PatternDef>, Vec<&PatternDef>) = all_patterns
            .iter()
            .copied()
            .partition(|p| !is_derived(p, &all_patterns));

        for wp in wps {
            if wp.state != WpState::Done {
                continue;
            }
            let values = benchmark.substitution_values(wp, step, 0);
            let entry: &mut PatternCaptures = per_wp.entry(wp.id).or_default();

            for file in &block.files {
                let file_patterns: Vec<&PatternDef> = scanning
                    .iter()
                    .copied()
                    .filter(|p| {
                        analyzer.uses.iter().chain(file.uses.iter()).any(|set_name| {
                            benchmark
                                .config
                                .patternsets
                                .get(set_name)
                                .map(|set| set.get(&p.name).is_some())
                                .unwrap_or(false)
                        })
                    })
                    .collect();

                let glob_text = substitute_fixpoint(&file.glob, &values)?;
                let work_dir = wp.work_dir(&benchmark.bench_dir);
                let pattern_path = work_dir.join(&glob_text);
                let matches =
                    glob::glob(&pattern_path.to_string_lossy()).map_err(|e| {
                        BenchError::Analyzer(format!("invalid file glob '{glob_text}': {e}"))
                    })?;

                for path in matches.flatten() {
                    let content = match std::fs::read_to_string(&path) {
                        Ok(content) => content,
                        Err(e) => {
                            warn!("cannot read {}: {e}; skipping", path.display());
                            continue;
                        }
                    };
                    for pattern in &file_patterns {
                        let captures = scan(pattern, &content, &values)?;
                        entry
                            .entry(pattern.name.clone())
                            .or_default()
                            .extend(captures);
                    }
                }
            }

            if !derived.is_empty() {
                if let Err(e) = evaluate_derived(&derived, &scanning, entry, &values, ctx) {
                    warn!(
                        wp = wp.id,
                        analyzer = %analyzer.name,
                        "derived pattern evaluation failed: {e}"
                    );
                }
            }
            debug!(wp = wp.id, patterns = entry.len(), "workpackage analysed");
        }
    }
    Ok(per_wp)
}

/// A pattern is derived when its text references another pattern of the
/// same analysis (bare or suffixed name).
fn is_derived(pattern: &PatternDef, all: &[&PatternDef]) -> bool {
    all.iter()
        .any(|other| other.name != pattern.name && references_pattern(&pattern.regex, &other.name))
}

fn references_pattern(text: &str, name: &str) -> bool {
    let mut search = text;
    while let Some(idx) = search.find('$') {
        let rest = &search[idx + 1..];
        let token = rest
            .strip_prefix('{')
            .map(|r| r.split('}').next().unwrap_or(""))
            .unwrap_or_else(|| {
                let end = rest
                    .find(|c: char| !c.is_ascii_alphanumeric() && c != '_')
                    .unwrap_or(rest.len());
                &rest[..end]
            });
        if token == name
            || Statistic::ALL.iter().any(|s| {
                token
                    .strip_prefix(name)
                    .and_then(|rest| rest.strip_prefix('_'))
                    .map(|suffix| suffix == s.suffix())
                    .unwrap_or(false)
            })
        {
            return true;
        }
        search = &search[idx + 1..];
    }
    false
}

/// Scan one file's content with a compiled pattern, yielding captures in
/// match order (group 1, or the whole match when the regex has no group).
fn scan(
    pattern: &PatternDef,
    content: &str,
    values: &BTreeMap<String, String>,
) -> Result<Vec<String>> {
    let mut lookup = values.clone();
    for (alias, regex) in PATTERN_ALIASES {
        lookup.insert((*alias).to_string(), (*regex).to_string());
    }
    let regex_text = substitute_fixpoint(&pattern.regex, &lookup)?;
    let regex = RegexBuilder::new(&regex_text)
        .dot_matches_new_line(pattern.dotall)
        .build()
        .map_err(|e| {
            BenchError::Analyzer(format!(
                "pattern '{}' regex '{regex_text}' does not compile: {e}",
                pattern.name
            ))
        })?;
    let mut captures = Vec::new();
    for found in regex.captures_iter(content) {
        let text = found
            .get(1)
            .or_else(|| found.get(0))
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();
        captures.push(text);
    }
    Ok(captures)
}

/// Evaluate derived patterns in dependency order against the statistics of
/// already-scanned patterns.
fn evaluate_derived(
    derived: &[&PatternDef],
    scanning: &[&PatternDef],
    captures: &mut PatternCaptures,
    values: &BTreeMap<String, String>,
    ctx: &RunContext,
) -> Result<()> {
    let mut graph = DependencyGraph::new();
    for pattern in derived {
        graph.add_node(pattern.name.clone());
        for other in derived {
            if other.name != pattern.name && references_pattern(&pattern.regex, &other.name) {
                graph.add_dependency(pattern.name.clone(), other.name.clone());
            }
        }
    }
    let order = graph
        .topological_order()
        .map_err(|e| BenchError::Analyzer(format!("derived patterns: {e}")))?;

    let mut lookup = values.clone();
    for pattern in scanning {
        extend_with_statistics(&mut lookup, pattern, captures);
    }

    for name in order {
        let Some(pattern) = derived.iter().find(|p| p.name == name) else {
            continue;
        };
        let text = substitute_fixpoint(&pattern.regex, &lookup)?;
        let value = if pattern.mode == ParamMode::Text {
            text
        } else {
            evaluate_value(pattern.mode, &text, &pattern.name, ctx)
                .map_err(|e| BenchError::Analyzer(e.to_string()))?
        };
        captures.insert(pattern.name.clone(), vec![value]);
        extend_with_statistics(&mut lookup, pattern, captures);
    }
    Ok(())
}

/// Add a pattern's bare and suffixed statistic values to a lookup map.
fn extend_with_statistics(
    lookup: &mut BTreeMap<String, String>,
    pattern: &PatternDef,
    captures: &PatternCaptures,
) {
    let empty = Vec::new();
    let sequence = captures.get(&pattern.name).unwrap_or(&empty);
    let reduction = reduce_captures(sequence, pattern.ptype.is_numeric());
    let integral = pattern.ptype == ParamType::Int;
    for statistic in Statistic::ALL {
        if let Some(value) = reduction.value(statistic, integral) {
            lookup.insert(
                format!("{}_{}", pattern.name, statistic.suffix()),
                value,
            );
        }
    }
    if let Some(first) = reduction.value(Statistic::First, integral) {
        lookup.insert(pattern.name.clone(), first);
    } else if let Some(default) = &pattern.default {
        lookup.insert(pattern.name.clone(), default.clone());
        lookup.insert(format!("{}_first", pattern.name), default.clone());
        lookup.insert(format!("{}_last", pattern.name), default.clone());
        lookup.insert(format!("{}_cnt", pattern.name), "0".to_string());
    }
}

/// Build result rows for one analyzer from persisted captures.
///
/// With `reduce` (the analyzer default), iteration siblings (same step,
/// same parameter point up to iteration) collapse into one row whose
/// statistics span all iterations' captures; otherwise each workpackage
/// yields its own row.
pub fn build_rows(benchmark: &Benchmark, data: &AnalysisData, analyzer: &AnalyzerDef) -> RowSet {
    let mut rowset = RowSet::default();
    let Some(per_wp) = data.0.get(&analyzer.name) else {
        return rowset;
    };

    let pattern_defs: BTreeMap<String, PatternDef> = analyzer
        .uses
        .iter()
        .chain(
            analyzer
                .analyses
                .iter()
                .flat_map(|block| block.files.iter().flat_map(|f| f.uses.iter())),
        )
        .filter_map(|set_name| benchmark.config.patternsets.get(set_name))
        .flat_map(|set| set.patterns.iter())
        .map(|p| (p.name.clone(), p.clone()))
        .collect();

    // Group analysed workpackages: by identity when not reducing, by
    // parameter point when reducing across iterations.
    let mut groups: BTreeMap<String, Vec<&Workpackage>> = BTreeMap::new();
    for (wp_id, _) in per_wp {
        let Some(wp) = benchmark.workpackage(*wp_id) else {
            continue;
        };
        let key = if analyzer.reduce {
            let point: Vec<String> = wp
                .point
                .iter()
                .map(|(name, p)| format!("{name}={}", p.value))
                .collect();
            format!("{}|{}", wp.step, point.join(","))
        } else {
            format!("wp{:06}", wp.id)
        };
        groups.entry(key).or_default().push(wp);
    }

    for wps in groups.values() {
        let mut wps = wps.clone();
        wps.sort_by_key(|wp| wp.iteration);
        let representative = wps[0];

        let mut row: BTreeMap<String, String> = BTreeMap::new();
        for (name, param) in &representative.point {
            row.insert(name.clone(), param.value.clone());
            rowset
                .types
                .entry(name.clone())
                .or_insert(param.def.ptype);
        }
        if !analyzer.reduce {
            row.insert(
                "jube_wp_iteration".to_string(),
                representative.iteration.to_string(),
            );
            rowset
                .types
                .entry("jube_wp_iteration".to_string())
                .or_insert(ParamType::Int);
        }

        for (name, pattern) in &pattern_defs {
            let mut merged: Vec<String> = Vec::new();
            for wp in &wps {
                if let Some(captures) = per_wp.get(&wp.id).and_then(|c| c.get(name)) {
                    merged.extend(captures.iter().cloned());
                }
            }
            let reduction = reduce_captures(&merged, pattern.ptype.is_numeric());
            let integral = pattern.ptype == ParamType::Int;

            if merged.is_empty() {
                if let Some(default) = &pattern.default {
                    row.insert(name.clone(), default.clone());
                    row.insert(format!("{name}_first"), default.clone());
                    row.insert(format!("{name}_last"), default.clone());
                }
                row.insert(format!("{name}_cnt"), "0".to_string());
            } else {
                for statistic in Statistic::ALL {
                    if let Some(value) = reduction.value(statistic, integral) {
                        row.insert(format!("{name}_{}", statistic.suffix()), value);
                    }
                }
                if let Some(first) = reduction.value(Statistic::First, integral) {
                    row.insert(name.clone(), first);
                }
            }

            rowset.types.entry(name.clone()).or_insert(pattern.ptype);
            for statistic in Statistic::ALL {
                let field_type = match statistic {
                    Statistic::Cnt => ParamType::Int,
                    Statistic::Avg | Statistic::Std => ParamType::Float,
                    _ => pattern.ptype,
                };
                rowset
                    .types
                    .entry(format!("{name}_{}", statistic.suffix()))
                    .or_insert(field_type);
            }
        }
        rowset.rows.push(row);
    }
    rowset
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values() -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    #[test]
    fn scan_collects_capture_sequence() {
        let pattern = PatternDef::new("time", r"time=$jube_pat_int").with_type(ParamType::Int);
        let captures = scan(&pattern, "time=1\ntime=3\ntime=5\n", &values()).unwrap();
        assert_eq!(captures, vec!["1", "3", "5"]);
    }

    #[test]
    fn scan_without_group_captures_whole_match() {
        let pattern = PatternDef::new("word", r"ok\d+");
        let captures = scan(&pattern, "ok1 ok2", &values()).unwrap();
        assert_eq!(captures, vec!["ok1", "ok2"]);
    }

    #[test]
    fn dotall_spans_lines() {
        let mut pattern = PatternDef::new("block", r"begin(.*)end");
        pattern.dotall = true;
        let captures = scan(&pattern, "begin\npayload\nend", &values()).unwrap();
        assert_eq!(captures, vec!["\npayload\n"]);

        let pattern = PatternDef::new("block", r"begin(.*)end");
        let captures = scan(&pattern, "begin\npayload\nend", &values()).unwrap();
        assert!(captures.is_empty());
    }

    #[test]
    fn parameter_references_resolve_inside_regex() {
        let pattern = PatternDef::new("hit", r"$prefix=$jube_pat_int").with_type(ParamType::Int);
        let mut vals = values();
        vals.insert("prefix".to_string(), "score".to_string());
        let captures = scan(&pattern, "score=42", &vals).unwrap();
        assert_eq!(captures, vec!["42"]);
    }

    #[test]
    fn invalid_regex_is_an_analyzer_error() {
        let pattern = PatternDef::new("broken", r"([unclosed");
        let err = scan(&pattern, "text", &values()).unwrap_err();
        assert!(matches!(err, BenchError::Analyzer(_)));
    }

    #[test]
    fn derived_patterns_evaluate_in_dependency_order() {
        let base = PatternDef::new("t", r"t=$jube_pat_int").with_type(ParamType::Int);
        let mut doubled = PatternDef::new("t2", "echo $(($t_max * 2))");
        doubled.mode = ParamMode::Shell;
        doubled.ptype = ParamType::Int;

        let all: Vec<&PatternDef> = vec![&base, &doubled];
        assert!(!is_derived(&base, &all));
        assert!(is_derived(&doubled, &all));

        let mut captures = PatternCaptures::new();
        captures.insert("t".to_string(), vec!["3".to_string(), "9".to_string()]);
        evaluate_derived(
            &[&doubled],
            &[&base],
            &mut captures,
            &values(),
            &RunContext::default(),
        )
        .unwrap();
        assert_eq!(captures["t2"], vec!["18".to_string()]);
    }

    #[test]
    fn circular_derivation_fails() {
        let mut a = PatternDef::new("a", "$b_first");
        a.mode = ParamMode::Shell;
        let mut b = PatternDef::new("b", "$a_first");
        b.mode = ParamMode::Shell;
        let mut captures = PatternCaptures::new();
        let err = evaluate_derived(
            &[&a, &b],
            &[],
            &mut captures,
            &values(),
            &RunContext::default(),
        )
        .unwrap_err();
        assert!(matches!(err, BenchError::Analyzer(_)));
    }

    #[test]
    fn references_pattern_matches_suffixed_names() {
        assert!(references_pattern("$t_max * 2", "t"));
        assert!(references_pattern("${t_avg}", "t"));
        assert!(references_pattern("$t + 1", "t"));
        assert!(!references_pattern("$total", "t"));
        assert!(!references_pattern("plain", "t"));
    }
}
