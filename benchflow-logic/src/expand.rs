//! Parameter-space expansion.
//!
//! Referenced parametersets are merged under the `duplicate` rules, template
//! parameters are expanded into the Cartesian product of their alternatives,
//! and each resulting point is resolved: textual `$name` substitution,
//! out-of-process evaluation of script/env/tag modes, and a final type
//! check. Points inherited from parent workpackages constrain the product
//! instead of multiplying it.

use crate::substitution::{resolve_group, substitute_fixpoint};
use benchflow_core::{
    point_values, BenchError, DuplicateMode, ParamMode, ParameterDef, ParameterSet,
    ResolvedParameter, Result, RunContext, SpacePoint,
};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::process::Command;
use tracing::debug;

/// Merge referenced parametersets in order under the duplicate rules.
///
/// The later definition's effective directive (parameter-level over
/// set-level) decides: `replace` takes the later definition, `concat`
/// appends the later alternatives to the earlier with the later separator
/// (the merged parameter keeps the later definition's mode), `error`
/// aborts, and without a directive the raw definitions must be identical.
pub fn merge_parametersets(sets: &[&ParameterSet]) -> Result<ParameterSet> {
    let mut merged = ParameterSet::new("<merged>");
    for set in sets {
        for def in &set.parameters {
            def.validate()?;
            let Some(existing) = merged.get(&def.name).cloned() else {
                merged.upsert(def.clone());
                continue;
            };
            match set.effective_duplicate(def) {
                DuplicateMode::Replace => merged.upsert(def.clone()),
                DuplicateMode::Concat => {
                    let mut combined = def.clone();
                    combined.raw = format!("{}{}{}", existing.raw, def.separator, def.raw);
                    merged.upsert(combined);
                }
                DuplicateMode::Error => {
                    return Err(BenchError::Config(format!(
                        "duplicate parameter '{}' while merging parameterset '{}'",
                        def.name, set.name
                    )));
                }
                DuplicateMode::None => {
                    if existing.raw != def.raw {
                        return Err(BenchError::Config(format!(
                            "parameter '{}' is defined differently in merged parametersets \
                             ('{}' vs '{}')",
                            def.name, existing.raw, def.raw
                        )));
                    }
                }
            }
        }
    }
    Ok(merged)
}

/// Engine-provided parameters are exempt from compatibility checks.
fn is_ambient(name: &str) -> bool {
    name.starts_with("jube_")
}

/// Expand a merged parameterset against an inherited point.
///
/// Names new to the point multiply the space by their template
/// alternatives; names already present are constrained to the inherited
/// value (re-evaluated when their `update_mode` asks for it) and must carry
/// the same raw definition. An incompatible redefinition drops the whole
/// combination, mirroring how dependent steps prune impossible parent
/// pairings.
pub fn build_points(merged: &ParameterSet, inherited: &SpacePoint) -> Result<Vec<SpacePoint>> {
    let mut base = inherited.clone();
    let mut expanding: Vec<(ParameterDef, Vec<String>)> = Vec::new();

    for def in &merged.parameters {
        match base.get_mut(&def.name) {
            Some(existing) if !is_ambient(&def.name) => {
                if existing.def.raw != def.raw {
                    debug!(
                        parameter = %def.name,
                        "incompatible redefinition, dropping combination"
                    );
                    return Ok(Vec::new());
                }
                if existing.def.update_mode.refresh_on_use() {
                    existing.reset_for_refresh();
                }
            }
            Some(_) => {}
            None => {
                expanding.push((def.clone(), def.alternatives()));
            }
        }
    }

    // Inherited parameters re-evaluate on step transitions regardless of
    // whether a set re-references them.
    for existing in base.values_mut() {
        if existing.def.update_mode.refresh_on_step() && !is_ambient(&existing.def.name) {
            existing.reset_for_refresh();
        }
    }

    let mut points = vec![base];
    for (def, alternatives) in &expanding {
        let mut next = Vec::with_capacity(points.len() * alternatives.len());
        for point in &points {
            for alternative in alternatives {
                let mut grown = point.clone();
                grown.insert(
                    def.name.clone(),
                    ResolvedParameter::selected(def.clone(), alternative.clone()),
                );
                next.push(grown);
            }
        }
        points = next;
    }

    // Early textual resolution among the point's own values; unknown
    // references (ambient variables not yet known) pass through.
    for point in &mut points {
        let mut values = point_values(point);
        resolve_group(&mut values, &BTreeMap::new())?;
        for (name, value) in values {
            if let Some(param) = point.get_mut(&name) {
                if !param.evaluated {
                    param.value = value;
                }
            }
        }
    }
    Ok(points)
}

/// Fully resolve a point: substitution against ambient variables, mode
/// evaluation, and type checking. Errors fail the owning workpackage.
pub fn finalize_point(
    point: &mut SpacePoint,
    ambient: &BTreeMap<String, String>,
    ctx: &RunContext,
) -> Result<()> {
    let mut values = point_values(point);
    resolve_group(&mut values, ambient)?;
    for (name, value) in &values {
        if let Some(param) = point.get_mut(name) {
            if !param.evaluated {
                param.value = value.clone();
            }
        }
    }

    // Evaluate script/env/tag parameters in rounds: a parameter whose text
    // still references another pending parameter waits for it.
    loop {
        let pending: Vec<String> = point
            .iter()
            .filter(|(_, p)| !p.evaluated && p.def.mode != ParamMode::Text)
            .map(|(name, _)| name.clone())
            .collect();
        if pending.is_empty() {
            break;
        }
        let mut progressed = false;
        for name in &pending {
            let text = point[name].value.clone();
            let blocked = pending
                .iter()
                .any(|other| other != name && references(&text, other));
            if blocked {
                continue;
            }
            let mode = point[name].def.mode;
            let evaluated = evaluate_value(mode, &text, name, ctx)?;
            let current = point_values(point);
            let resolved = substitute_fixpoint(&evaluated, &current)?;
            let param = point.get_mut(name).expect("pending parameter exists");
            param.value = resolved;
            param.evaluated = true;
            progressed = true;
        }
        if !progressed {
            return Err(BenchError::Resolution(format!(
                "circular script parameter references among: {}",
                pending.join(", ")
            )));
        }
    }

    for param in point.values_mut() {
        if !param.evaluated {
            param.evaluated = true;
        }
    }
    for (name, param) in point.iter() {
        param.def.ptype.check(name, &param.value)?;
    }
    Ok(())
}

/// Finalize many points, optionally in parallel (`procs > 1`).
pub fn finalize_points(
    points: &mut [SpacePoint],
    ambient: &BTreeMap<String, String>,
    ctx: &RunContext,
    procs: u32,
) -> Result<()> {
    if procs > 1 {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(procs as usize)
            .build()
            .map_err(|e| BenchError::Config(format!("worker pool: {e}")))?;
        pool.install(|| {
            points
                .par_iter_mut()
                .try_for_each(|point| finalize_point(point, ambient, ctx))
        })
    } else {
        points
            .iter_mut()
            .try_for_each(|point| finalize_point(point, ambient, ctx))
    }
}

/// Re-evaluate cycle-refreshed parameters for a new cycle.
pub fn refresh_for_cycle(
    point: &mut SpacePoint,
    ambient: &BTreeMap<String, String>,
    ctx: &RunContext,
) -> Result<()> {
    let mut any = false;
    for param in point.values_mut() {
        if param.def.update_mode.refresh_on_cycle() && !is_ambient(&param.def.name) {
            param.reset_for_refresh();
            any = true;
        }
    }
    if any {
        finalize_point(point, ambient, ctx)?;
    }
    Ok(())
}

/// Does `text` contain a `$name` / `${name}` reference to `name`?
fn references(text: &str, name: &str) -> bool {
    let mut search = text;
    while let Some(idx) = search.find('$') {
        let rest = &search[idx + 1..];
        let candidate = rest
            .strip_prefix('{')
            .map(|r| r.split('}').next().unwrap_or(""))
            .unwrap_or_else(|| {
                let end = rest
                    .find(|c: char| !c.is_ascii_alphanumeric() && c != '_')
                    .unwrap_or(rest.len());
                &rest[..end]
            });
        if candidate == name {
            return true;
        }
        search = &search[idx + 1..];
    }
    false
}

/// Evaluate a value under an evaluation mode: script modes spawn the
/// corresponding interpreter, `env` reads the named variable, `tag`
/// expands active tags. `name` labels error messages.
pub fn evaluate_value(mode: ParamMode, text: &str, name: &str, ctx: &RunContext) -> Result<String> {
    match mode {
        ParamMode::Text => Ok(text.to_string()),
        ParamMode::Env => Ok(std::env::var(text.trim()).unwrap_or_default()),
        ParamMode::Tag => {
            let tag = text.trim();
            if ctx.tags.contains(tag) {
                Ok(tag.to_string())
            } else {
                Ok(String::new())
            }
        }
        ParamMode::Shell | ParamMode::Python | ParamMode::Perl => {
            let mut command = match mode {
                ParamMode::Shell => {
                    let mut c = Command::new(&ctx.shell);
                    c.arg("-c").arg(text);
                    c
                }
                ParamMode::Python => {
                    let mut c = Command::new("python3");
                    c.arg("-c").arg(format!("print({text})"));
                    c
                }
                _ => {
                    let mut c = Command::new("perl");
                    c.arg("-e").arg(format!("print({text})"));
                    c
                }
            };
            let output = command.output().map_err(|e| {
                BenchError::Resolution(format!(
                    "parameter '{name}': failed to spawn {mode:?} interpreter: {e}"
                ))
            })?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(BenchError::Resolution(format!(
                    "parameter '{name}': {mode:?} evaluation of '{text}' failed: {}",
                    stderr.trim()
                )));
            }
            Ok(String::from_utf8_lossy(&output.stdout)
                .trim_end_matches('\n')
                .to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use benchflow_core::{ParamType, UpdateMode};

    fn set_with(defs: Vec<ParameterDef>) -> ParameterSet {
        let mut set = ParameterSet::new("s");
        for def in defs {
            set.upsert(def);
        }
        set
    }

    #[test]
    fn cartesian_product_of_templates() {
        let merged = set_with(vec![
            ParameterDef::new("n", "1,2,4"),
            ParameterDef::new("mode", "a,b"),
            ParameterDef::new("fixed", "x"),
        ]);
        let points = build_points(&merged, &SpacePoint::new()).unwrap();
        assert_eq!(points.len(), 6);
        for point in &points {
            assert_eq!(point["fixed"].value, "x");
        }
        let combos: Vec<(String, String)> = points
            .iter()
            .map(|p| (p["n"].value.clone(), p["mode"].value.clone()))
            .collect();
        assert!(combos.contains(&("4".to_string(), "b".to_string())));
    }

    #[test]
    fn inherited_values_constrain_instead_of_multiplying() {
        let merged = set_with(vec![ParameterDef::new("n", "1,2,4")]);
        let mut inherited = SpacePoint::new();
        inherited.insert(
            "n".to_string(),
            ResolvedParameter::selected(ParameterDef::new("n", "1,2,4"), "2"),
        );
        let points = build_points(&merged, &inherited).unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0]["n"].value, "2");
    }

    #[test]
    fn incompatible_redefinition_drops_combination() {
        let merged = set_with(vec![ParameterDef::new("n", "8,16")]);
        let mut inherited = SpacePoint::new();
        inherited.insert(
            "n".to_string(),
            ResolvedParameter::selected(ParameterDef::new("n", "1,2"), "1"),
        );
        let points = build_points(&merged, &inherited).unwrap();
        assert!(points.is_empty());
    }

    #[test]
    fn references_between_parameters_resolve() {
        let merged = set_with(vec![
            ParameterDef::new("base", "data"),
            ParameterDef::new("file", "$base.txt"),
        ]);
        let mut points = build_points(&merged, &SpacePoint::new()).unwrap();
        assert_eq!(points.len(), 1);
        finalize_point(&mut points[0], &BTreeMap::new(), &RunContext::default()).unwrap();
        assert_eq!(points[0]["file"].value, "data.txt");
    }

    #[test]
    fn merge_without_directive_requires_identical_raw() {
        let a = set_with(vec![ParameterDef::new("x", "1")]);
        let b = set_with(vec![ParameterDef::new("x", "2")]);
        assert!(merge_parametersets(&[&a, &b]).is_err());

        let identical = set_with(vec![ParameterDef::new("x", "1")]);
        let merged = merge_parametersets(&[&a, &identical]).unwrap();
        assert_eq!(merged.get("x").unwrap().raw, "1");
    }

    #[test]
    fn merge_replace_takes_later() {
        let a = set_with(vec![ParameterDef::new("x", "1")]);
        let mut b = set_with(vec![ParameterDef::new("x", "2")]);
        b.duplicate = DuplicateMode::Replace;
        let merged = merge_parametersets(&[&a, &b]).unwrap();
        assert_eq!(merged.get("x").unwrap().raw, "2");
    }

    #[test]
    fn merge_concat_appends_alternatives() {
        let a = set_with(vec![ParameterDef::new("x", "1,2")]);
        let mut b = set_with(vec![ParameterDef::new("x", "3")]);
        b.duplicate = DuplicateMode::Concat;
        let merged = merge_parametersets(&[&a, &b]).unwrap();
        assert_eq!(merged.get("x").unwrap().raw, "1,2,3");
        let points = build_points(&merged, &SpacePoint::new()).unwrap();
        assert_eq!(points.len(), 3);
    }

    #[test]
    fn merge_error_rejects_duplicates() {
        let a = set_with(vec![ParameterDef::new("x", "1")]);
        let mut dup = ParameterDef::new("x", "1");
        dup.duplicate = Some(DuplicateMode::Error);
        let b = set_with(vec![dup]);
        assert!(merge_parametersets(&[&a, &b]).is_err());
    }

    #[test]
    fn type_check_failure_is_resolution_error() {
        let merged = set_with(vec![
            ParameterDef::new("n", "notanumber").with_type(ParamType::Int)
        ]);
        let mut points = build_points(&merged, &SpacePoint::new()).unwrap();
        let err =
            finalize_point(&mut points[0], &BTreeMap::new(), &RunContext::default()).unwrap_err();
        assert!(matches!(err, BenchError::Resolution(_)));
    }

    #[test]
    fn shell_mode_evaluates_out_of_process() {
        let merged = set_with(vec![
            ParameterDef::new("host", "echo demo").with_mode(ParamMode::Shell)
        ]);
        let mut points = build_points(&merged, &SpacePoint::new()).unwrap();
        finalize_point(&mut points[0], &BTreeMap::new(), &RunContext::default()).unwrap();
        assert_eq!(points[0]["host"].value, "demo");
    }

    #[test]
    fn failing_script_fails_resolution() {
        let merged = set_with(vec![
            ParameterDef::new("bad", "exit 3").with_mode(ParamMode::Shell)
        ]);
        let mut points = build_points(&merged, &SpacePoint::new()).unwrap();
        let err =
            finalize_point(&mut points[0], &BTreeMap::new(), &RunContext::default()).unwrap_err();
        assert!(matches!(err, BenchError::Resolution(_)));
    }

    #[test]
    fn tag_mode_expands_active_tags_only() {
        let merged = set_with(vec![
            ParameterDef::new("t", "gpu").with_mode(ParamMode::Tag)
        ]);
        let mut points = build_points(&merged, &SpacePoint::new()).unwrap();
        let ctx = RunContext::default().with_tags(["gpu"]);
        finalize_point(&mut points[0], &BTreeMap::new(), &ctx).unwrap();
        assert_eq!(points[0]["t"].value, "gpu");

        let mut points = build_points(&merged, &SpacePoint::new()).unwrap();
        finalize_point(&mut points[0], &BTreeMap::new(), &RunContext::default()).unwrap();
        assert_eq!(points[0]["t"].value, "");
    }

    #[test]
    fn step_refresh_resets_inherited_parameters() {
        let mut def = ParameterDef::new("stamp", "date +%s").with_mode(ParamMode::Shell);
        def.update_mode = UpdateMode::Step;
        let mut inherited = SpacePoint::new();
        let mut resolved = ResolvedParameter::selected(def, "date +%s");
        resolved.value = "123".to_string();
        resolved.evaluated = true;
        inherited.insert("stamp".to_string(), resolved);

        let points = build_points(&ParameterSet::new("empty"), &inherited).unwrap();
        assert!(!points[0]["stamp"].evaluated);
        assert_eq!(points[0]["stamp"].value, "date +%s");
    }

    #[test]
    fn references_helper_matches_plain_and_braced() {
        assert!(references("a $foo b", "foo"));
        assert!(references("${foo}", "foo"));
        assert!(!references("$foobar", "foo"));
        assert!(!references("plain", "foo"));
    }
}
