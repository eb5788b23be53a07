//! Analyzer model: bindings of patternsets to step output files.

use serde::{Deserialize, Serialize};

/// A file selector inside an analyse block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyseFile {
    /// Glob expanded inside the workpackage sandbox.
    pub glob: String,
    /// Additional patternsets applied only to this file.
    #[serde(default, rename = "use")]
    pub uses: Vec<String>,
}

/// All file selectors for one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyseBlock {
    /// Target step name.
    pub step: String,
    /// Files to scan per workpackage of that step.
    #[serde(default)]
    pub files: Vec<AnalyseFile>,
}

/// A named analyzer: patternsets applied to selected step output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalyzerDef {
    /// Analyzer name, referenced from results.
    pub name: String,
    /// Patternsets applied to every file of every analyse block.
    #[serde(default, rename = "use")]
    pub uses: Vec<String>,
    /// Collapse iteration-indexed rows into one row with cross-iteration
    /// statistics.
    #[serde(default = "default_reduce")]
    pub reduce: bool,
    /// Analyse blocks per step.
    #[serde(default)]
    pub analyses: Vec<AnalyseBlock>,
}

fn default_reduce() -> bool {
    true
}

impl AnalyzerDef {
    /// New analyzer with no blocks and `reduce = true`.
    pub fn new(name: impl Into<String>) -> Self {
        AnalyzerDef {
            name: name.into(),
            reduce: true,
            ..Default::default()
        }
    }
}
