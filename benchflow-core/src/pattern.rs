//! Pattern and patternset model.
//!
//! A pattern is a named regex applied to step output files. The first
//! capture group (or the whole match when there is none) becomes the
//! captured value; sequences of captures are statistically reduced
//! downstream.

use crate::error::{BenchError, Result};
use crate::parameter::{is_valid_name, ParamMode, ParamType};
use serde::{Deserialize, Serialize};

/// A single pattern definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternDef {
    /// Pattern name; suffixed variants (`_min`, `_max`, ...) derive from it.
    pub name: String,
    /// Regex text for scanning patterns; for derived patterns (text that
    /// references other patterns' values) the expression to evaluate.
    #[serde(default)]
    pub regex: String,
    /// Declared type of the captured value.
    #[serde(default, rename = "type")]
    pub ptype: ParamType,
    /// Evaluation mode for derived patterns (`python`, `shell`, ...).
    #[serde(default)]
    pub mode: ParamMode,
    /// Value used when the pattern matches nothing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    /// Compile with `.` matching newlines.
    #[serde(default)]
    pub dotall: bool,
    /// Optional unit label carried into result tables.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl PatternDef {
    /// New string-typed scanning pattern.
    pub fn new(name: impl Into<String>, regex: impl Into<String>) -> Self {
        PatternDef {
            name: name.into(),
            regex: regex.into(),
            ptype: ParamType::default(),
            mode: ParamMode::default(),
            default: None,
            dotall: false,
            unit: None,
        }
    }

    /// Set the declared type.
    pub fn with_type(mut self, ptype: ParamType) -> Self {
        self.ptype = ptype;
        self
    }

    /// Set the no-match default.
    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default = Some(default.into());
        self
    }

    /// Validate the pattern name.
    pub fn validate(&self) -> Result<()> {
        if !is_valid_name(&self.name) {
            return Err(BenchError::Config(format!(
                "invalid pattern name '{}'",
                self.name
            )));
        }
        Ok(())
    }
}

/// A named collection of pattern definitions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternSet {
    /// Set name, referenced from analyzers.
    pub name: String,
    /// Optional `file[:external_name]` preload source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_with: Option<String>,
    /// Pattern definitions in declaration order.
    #[serde(default)]
    pub patterns: Vec<PatternDef>,
}

impl PatternSet {
    /// New empty set.
    pub fn new(name: impl Into<String>) -> Self {
        PatternSet {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Look up a definition by name.
    pub fn get(&self, name: &str) -> Option<&PatternDef> {
        self.patterns.iter().find(|p| p.name == name)
    }

    /// Overlay imported entries (from `init_with`) under local ones.
    pub fn overlay_imported(&mut self, imported: &PatternSet) {
        let mut merged = imported.patterns.clone();
        for local in &self.patterns {
            if let Some(slot) = merged.iter_mut().find(|p| p.name == local.name) {
                *slot = local.clone();
            } else {
                merged.push(local.clone());
            }
        }
        self.patterns = merged;
    }
}

/// Predefined regex aliases usable inside any pattern or `do` text.
///
/// The `n`-prefixed variants are non-capturing.
pub const PATTERN_ALIASES: &[(&str, &str)] = &[
    ("jube_pat_int", r"([+-]?\d+)"),
    ("jube_pat_nint", r"(?:[+-]?\d+)"),
    (
        "jube_pat_fp",
        r"([+-]?\d*\.?\d+(?:[eE][-+]?\d+)?)",
    ),
    (
        "jube_pat_nfp",
        r"(?:[+-]?\d*\.?\d+(?:[eE][-+]?\d+)?)",
    ),
    ("jube_pat_wrd", r"(\S+)"),
    ("jube_pat_nwrd", r"(?:\S+)"),
    ("jube_pat_bl", r"(?:\s+)"),
];

/// Look up a predefined alias by name.
pub fn pattern_alias(name: &str) -> Option<&'static str> {
    PATTERN_ALIASES
        .iter()
        .find(|(alias, _)| *alias == name)
        .map(|(_, regex)| *regex)
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    #[test]
    fn aliases_compile_and_capture() {
        for (name, regex) in PATTERN_ALIASES {
            let re = Regex::new(regex)
                .unwrap_or_else(|e| panic!("alias {name} failed to compile: {e}"));
            // Non-capturing aliases must not expose a group.
            let expects_group = !name.starts_with("jube_pat_n") && *name != "jube_pat_bl";
            assert_eq!(re.captures_len() > 1, expects_group, "alias {name}");
        }
    }

    #[test]
    fn int_alias_matches_signed_numbers() {
        let re = Regex::new(pattern_alias("jube_pat_int").unwrap()).unwrap();
        let caps = re.captures("value=-42").unwrap();
        assert_eq!(&caps[1], "-42");
    }

    #[test]
    fn fp_alias_matches_scientific_notation() {
        let re = Regex::new(pattern_alias("jube_pat_fp").unwrap()).unwrap();
        for sample in ["3.25", "-1e-3", ".5", "7"] {
            assert!(re.is_match(sample), "sample {sample}");
        }
    }

    #[test]
    fn overlay_imported_keeps_local_patterns() {
        let mut local = PatternSet::new("p");
        local.patterns.push(PatternDef::new("t", "local"));
        let mut imported = PatternSet::new("ext");
        imported.patterns.push(PatternDef::new("t", "imported"));
        imported.patterns.push(PatternDef::new("u", "extra"));
        local.overlay_imported(&imported);
        assert_eq!(local.get("t").unwrap().regex, "local");
        assert!(local.get("u").is_some());
    }
}
