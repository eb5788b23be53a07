//! Parameter and parameterset model.
//!
//! A parameter is a named, typed value. Its raw text may be a *template*
//! (separator-delimited list of alternatives, expanded into the parameter
//! space) and may reference other parameters with `$name` / `${name}`.
//! Evaluation modes cover literal text, out-of-process script snippets,
//! environment lookups, and tag expansion.

use crate::error::{BenchError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default template separator.
pub const DEFAULT_SEPARATOR: &str = ",";

/// Maximum number of `$name` substitution passes before a chain of
/// references is treated as cyclic.
pub const MAX_SUBSTITUTION_PASSES: usize = 5;

/// Declared type of a parameter value, checked after final resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    /// Unconstrained text (default).
    #[default]
    String,
    /// Must parse as `i64` once fully resolved.
    Int,
    /// Must parse as `f64` once fully resolved.
    Float,
}

impl ParamType {
    /// Verify that a fully resolved value parses as this type.
    pub fn check(&self, name: &str, value: &str) -> Result<()> {
        let ok = match self {
            ParamType::String => true,
            ParamType::Int => value.trim().parse::<i64>().is_ok(),
            ParamType::Float => value.trim().parse::<f64>().is_ok(),
        };
        if ok {
            Ok(())
        } else {
            Err(BenchError::Resolution(format!(
                "parameter '{name}' value '{value}' does not parse as {self:?}"
            )))
        }
    }

    /// Whether values of this type support numeric reduction.
    pub fn is_numeric(&self) -> bool {
        !matches!(self, ParamType::String)
    }
}

/// How a parameter's raw text is turned into its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamMode {
    /// Raw text is the value (after substitution).
    #[default]
    Text,
    /// Raw text is a shell program; the value is its trimmed stdout.
    Shell,
    /// Raw text is a python expression evaluated out of process.
    Python,
    /// Raw text is a perl expression evaluated out of process.
    Perl,
    /// Raw text names an environment variable to read.
    Env,
    /// Raw text names a tag; expands to the tag when active, else empty.
    Tag,
}

impl ParamMode {
    /// Script modes are delegated to an external interpreter.
    pub fn is_script(&self) -> bool {
        matches!(self, ParamMode::Shell | ParamMode::Python | ParamMode::Perl)
    }
}

/// Re-evaluation cadence of a parameter within a benchmark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateMode {
    /// Freeze the value at first resolution.
    #[default]
    Never,
    /// Re-evaluate whenever a set containing the parameter is referenced.
    Use,
    /// Re-evaluate at each step transition.
    Step,
    /// Re-evaluate at each cycle iteration.
    Cycle,
    /// Re-evaluate at every step and cycle.
    Always,
}

impl UpdateMode {
    /// Whether the parameter is re-evaluated when a new step inherits it.
    pub fn refresh_on_step(&self) -> bool {
        matches!(self, UpdateMode::Step | UpdateMode::Always)
    }

    /// Whether the parameter is re-evaluated on each cycle of a workpackage.
    pub fn refresh_on_cycle(&self) -> bool {
        matches!(self, UpdateMode::Cycle | UpdateMode::Always)
    }

    /// Whether a repeated set reference re-evaluates the parameter.
    pub fn refresh_on_use(&self) -> bool {
        matches!(self, UpdateMode::Use | UpdateMode::Always)
    }
}

/// Merge behavior when two definitions share a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicateMode {
    /// No directive: identical raw definitions merge, differing ones are a
    /// configuration error.
    #[default]
    None,
    /// The later definition wins.
    Replace,
    /// The later definition's alternatives are appended to the earlier's.
    Concat,
    /// Any duplicate name aborts.
    Error,
}

/// A single parameter definition as written in the configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    /// Parameter name; must be a valid identifier.
    pub name: String,
    /// Raw value text, possibly a template and possibly containing `$refs`.
    #[serde(default)]
    pub raw: String,
    /// Declared type.
    #[serde(default, rename = "type")]
    pub ptype: ParamType,
    /// Evaluation mode.
    #[serde(default)]
    pub mode: ParamMode,
    /// Template separator.
    #[serde(default = "default_separator")]
    pub separator: String,
    /// Export into the child process environment.
    #[serde(default)]
    pub export: bool,
    /// Re-evaluation cadence.
    #[serde(default)]
    pub update_mode: UpdateMode,
    /// Per-parameter duplicate directive; overrides the set-level directive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate: Option<DuplicateMode>,
}

fn default_separator() -> String {
    DEFAULT_SEPARATOR.to_string()
}

impl ParameterDef {
    /// New text-mode string parameter with default attributes.
    pub fn new(name: impl Into<String>, raw: impl Into<String>) -> Self {
        ParameterDef {
            name: name.into(),
            raw: raw.into(),
            ptype: ParamType::default(),
            mode: ParamMode::default(),
            separator: default_separator(),
            export: false,
            update_mode: UpdateMode::default(),
            duplicate: None,
        }
    }

    /// Set the declared type.
    pub fn with_type(mut self, ptype: ParamType) -> Self {
        self.ptype = ptype;
        self
    }

    /// Set the evaluation mode.
    pub fn with_mode(mut self, mode: ParamMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the export flag.
    pub fn with_export(mut self, export: bool) -> Self {
        self.export = export;
        self
    }

    /// Set the re-evaluation cadence.
    pub fn with_update_mode(mut self, update_mode: UpdateMode) -> Self {
        self.update_mode = update_mode;
        self
    }

    /// A template holds several alternatives separated by `separator`.
    /// Script, env, and tag modes always produce a single value.
    pub fn is_template(&self) -> bool {
        self.mode == ParamMode::Text && self.raw.contains(self.separator.as_str())
    }

    /// Split the raw text into template alternatives (a fixed parameter
    /// yields a single alternative).
    pub fn alternatives(&self) -> Vec<String> {
        if self.is_template() {
            self.raw
                .split(self.separator.as_str())
                .map(|s| s.to_string())
                .collect()
        } else {
            vec![self.raw.clone()]
        }
    }

    /// Validate the parameter name.
    pub fn validate(&self) -> Result<()> {
        if !is_valid_name(&self.name) {
            return Err(BenchError::Config(format!(
                "invalid parameter name '{}'",
                self.name
            )));
        }
        Ok(())
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`
pub fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// A named collection of parameter definitions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterSet {
    /// Set name, referenced from steps via `use`.
    pub name: String,
    /// Optional `file[:external_name]` preload source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_with: Option<String>,
    /// Set-level duplicate directive; parameter-level directives override it.
    #[serde(default)]
    pub duplicate: DuplicateMode,
    /// Parameter definitions in declaration order.
    #[serde(default)]
    pub parameters: Vec<ParameterDef>,
}

impl ParameterSet {
    /// New empty set.
    pub fn new(name: impl Into<String>) -> Self {
        ParameterSet {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Look up a definition by name.
    pub fn get(&self, name: &str) -> Option<&ParameterDef> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Add or replace a definition by name, preserving declaration order
    /// for new entries.
    pub fn upsert(&mut self, def: ParameterDef) {
        if let Some(existing) = self.parameters.iter_mut().find(|p| p.name == def.name) {
            *existing = def;
        } else {
            self.parameters.push(def);
        }
    }

    /// Overlay imported entries (from `init_with`) under local ones: local
    /// definitions win on name collision.
    pub fn overlay_imported(&mut self, imported: &ParameterSet) {
        let mut merged = imported.parameters.clone();
        for local in &self.parameters {
            if let Some(slot) = merged.iter_mut().find(|p| p.name == local.name) {
                *slot = local.clone();
            } else {
                merged.push(local.clone());
            }
        }
        self.parameters = merged;
    }

    /// Effective duplicate directive for one of this set's definitions.
    pub fn effective_duplicate(&self, def: &ParameterDef) -> DuplicateMode {
        def.duplicate.unwrap_or(self.duplicate)
    }
}

/// A parameter with its definition and fully or partially resolved value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedParameter {
    /// The definition this value was produced from; kept for re-evaluation
    /// under `update_mode` and for compatibility checks (`def.raw` is the
    /// full template text).
    pub def: ParameterDef,
    /// The template alternative this point selected (`def.raw` for fixed
    /// parameters); re-evaluation starts from this text.
    pub selected_raw: String,
    /// Current value text.
    pub value: String,
    /// Whether the evaluation mode (script/env/tag) has been applied to the
    /// current value.
    #[serde(default)]
    pub evaluated: bool,
}

impl ResolvedParameter {
    /// Resolved parameter produced from a chosen template alternative,
    /// pending substitution and mode evaluation.
    pub fn selected(def: ParameterDef, selected_raw: impl Into<String>) -> Self {
        let selected_raw = selected_raw.into();
        ResolvedParameter {
            def,
            value: selected_raw.clone(),
            selected_raw,
            evaluated: false,
        }
    }

    /// Resolved parameter holding a final literal value.
    pub fn literal(def: ParameterDef, value: impl Into<String>) -> Self {
        let value = value.into();
        ResolvedParameter {
            selected_raw: def.raw.clone(),
            def,
            value,
            evaluated: true,
        }
    }

    /// Ambient engine-provided parameter (`jube_*`), never re-evaluated.
    pub fn ambient(name: impl Into<String>, value: impl Into<String>) -> Self {
        let value = value.into();
        let mut def = ParameterDef::new(name, value.clone());
        def.update_mode = UpdateMode::Never;
        ResolvedParameter {
            selected_raw: value.clone(),
            def,
            value,
            evaluated: true,
        }
    }

    /// Reset to the selected raw text for re-evaluation under `update_mode`.
    pub fn reset_for_refresh(&mut self) {
        self.value = self.selected_raw.clone();
        self.evaluated = false;
    }
}

/// One point of the parameter space: name → resolved parameter, ordered for
/// deterministic persistence and display.
pub type SpacePoint = BTreeMap<String, ResolvedParameter>;

/// Flatten a point into a plain name → value map for substitution.
pub fn point_values(point: &SpacePoint) -> BTreeMap<String, String> {
    point
        .iter()
        .map(|(name, p)| (name.clone(), p.value.clone()))
        .collect()
}

/// Exported subset of a point, injected into child process environments.
pub fn export_values(point: &SpacePoint) -> BTreeMap<String, String> {
    point
        .iter()
        .filter(|(_, p)| p.def.export)
        .map(|(name, p)| (name.clone(), p.value.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_detection_uses_separator() {
        let p = ParameterDef::new("n", "1,2,4");
        assert!(p.is_template());
        assert_eq!(p.alternatives(), vec!["1", "2", "4"]);

        let fixed = ParameterDef::new("n", "42");
        assert!(!fixed.is_template());
        assert_eq!(fixed.alternatives(), vec!["42"]);
    }

    #[test]
    fn script_raw_with_commas_is_not_a_template() {
        let p = ParameterDef::new("host", "echo a,b").with_mode(ParamMode::Shell);
        assert!(!p.is_template());
    }

    #[test]
    fn type_check_rejects_non_numeric() {
        assert!(ParamType::Int.check("n", "12").is_ok());
        assert!(ParamType::Int.check("n", "x").is_err());
        assert!(ParamType::Float.check("f", "1.5e3").is_ok());
        assert!(ParamType::Float.check("f", "one").is_err());
        assert!(ParamType::String.check("s", "anything").is_ok());
    }

    #[test]
    fn name_validation() {
        assert!(is_valid_name("number"));
        assert!(is_valid_name("_x1"));
        assert!(!is_valid_name("1x"));
        assert!(!is_valid_name("a-b"));
        assert!(!is_valid_name(""));
    }

    #[test]
    fn overlay_imported_keeps_local_definitions() {
        let mut local = ParameterSet::new("s");
        local.upsert(ParameterDef::new("a", "local"));
        let mut imported = ParameterSet::new("ext");
        imported.upsert(ParameterDef::new("a", "imported"));
        imported.upsert(ParameterDef::new("b", "only_imported"));

        local.overlay_imported(&imported);
        assert_eq!(local.get("a").unwrap().raw, "local");
        assert_eq!(local.get("b").unwrap().raw, "only_imported");
    }

    #[test]
    fn parameter_level_duplicate_overrides_set_level() {
        let mut set = ParameterSet::new("s");
        set.duplicate = DuplicateMode::Replace;
        let mut def = ParameterDef::new("a", "1");
        def.duplicate = Some(DuplicateMode::Concat);
        assert_eq!(set.effective_duplicate(&def), DuplicateMode::Concat);
        let plain = ParameterDef::new("b", "2");
        assert_eq!(set.effective_duplicate(&plain), DuplicateMode::Replace);
    }

    #[test]
    fn export_values_filters_on_flag() {
        let mut point = SpacePoint::new();
        point.insert(
            "visible".to_string(),
            ResolvedParameter::literal(ParameterDef::new("visible", "1").with_export(true), "1"),
        );
        point.insert(
            "hidden".to_string(),
            ResolvedParameter::literal(ParameterDef::new("hidden", "2"), "2"),
        );
        let exported = export_values(&point);
        assert_eq!(exported.len(), 1);
        assert_eq!(exported.get("visible").map(String::as_str), Some("1"));
    }
}
