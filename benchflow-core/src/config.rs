//! Canonical benchmark configuration tree.
//!
//! Both configuration front-ends deserialize to this structure; the engine
//! and the persisted configuration snapshot use it directly.

use crate::analysis::AnalyzerDef;
use crate::error::{BenchError, Result};
use crate::fileset::{FileSet, SubstituteSet};
use crate::parameter::ParameterSet;
use crate::pattern::PatternSet;
use crate::result::ResultDef;
use crate::step::Step;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A fully resolved benchmark definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkConfig {
    /// Benchmark name.
    pub name: String,
    /// Output directory for benchmark runs.
    #[serde(default = "default_outpath")]
    pub outpath: String,
    /// Free-form comment, amendable via the `comment` subcommand.
    #[serde(default)]
    pub comment: String,
    /// Parametersets by name.
    #[serde(default)]
    pub parametersets: BTreeMap<String, ParameterSet>,
    /// Patternsets by name.
    #[serde(default)]
    pub patternsets: BTreeMap<String, PatternSet>,
    /// Filesets by name.
    #[serde(default)]
    pub filesets: BTreeMap<String, FileSet>,
    /// Substitutesets by name.
    #[serde(default)]
    pub substitutesets: BTreeMap<String, SubstituteSet>,
    /// Steps by name.
    #[serde(default)]
    pub steps: BTreeMap<String, Step>,
    /// Analyzers by name.
    #[serde(default)]
    pub analyzers: BTreeMap<String, AnalyzerDef>,
    /// Results in declaration order.
    #[serde(default)]
    pub results: Vec<ResultDef>,
}

fn default_outpath() -> String {
    "bench_run".to_string()
}

impl BenchmarkConfig {
    /// Structural consistency check: referenced sets, steps, patternsets,
    /// and analyzers must exist; steps must be individually valid.
    pub fn validate(&self) -> Result<()> {
        for step in self.steps.values() {
            step.validate()?;
            for dep in &step.depend {
                if !self.steps.contains_key(dep) {
                    return Err(BenchError::Config(format!(
                        "step '{}' depends on unknown step '{}'",
                        step.name, dep
                    )));
                }
            }
            for used in &step.uses {
                // A use may name a parameter, file, or substitute set;
                // references containing '$' are resolved per workpackage.
                if used.contains('$') {
                    continue;
                }
                let known = self.parametersets.contains_key(used)
                    || self.filesets.contains_key(used)
                    || self.substitutesets.contains_key(used);
                if !known {
                    return Err(BenchError::Config(format!(
                        "step '{}' uses unknown set '{}'",
                        step.name, used
                    )));
                }
            }
        }
        for analyzer in self.analyzers.values() {
            for used in &analyzer.uses {
                if !self.patternsets.contains_key(used) {
                    return Err(BenchError::Config(format!(
                        "analyzer '{}' uses unknown patternset '{}'",
                        analyzer.name, used
                    )));
                }
            }
            for block in &analyzer.analyses {
                if !self.steps.contains_key(&block.step) {
                    return Err(BenchError::Config(format!(
                        "analyzer '{}' targets unknown step '{}'",
                        analyzer.name, block.step
                    )));
                }
                for file in &block.files {
                    for used in &file.uses {
                        if !self.patternsets.contains_key(used) {
                            return Err(BenchError::Config(format!(
                                "analyzer '{}' file '{}' uses unknown patternset '{}'",
                                analyzer.name, file.glob, used
                            )));
                        }
                    }
                }
            }
        }
        for result in &self.results {
            for used in &result.uses {
                if !self.analyzers.contains_key(used) {
                    return Err(BenchError::Config(format!(
                        "result '{}' uses unknown analyzer '{}'",
                        result.name, used
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::Step;

    #[test]
    fn unknown_dependency_is_rejected() {
        let mut config = BenchmarkConfig {
            name: "b".to_string(),
            ..Default::default()
        };
        let mut step = Step::new("run");
        step.depend.push("compile".to_string());
        config.steps.insert("run".to_string(), step);
        assert!(config.validate().is_err());
    }

    #[test]
    fn substituted_use_names_are_deferred() {
        let mut config = BenchmarkConfig {
            name: "b".to_string(),
            ..Default::default()
        };
        let mut step = Step::new("run");
        step.uses.push("set_$variant".to_string());
        config.steps.insert("run".to_string(), step);
        assert!(config.validate().is_ok());
    }
}
