//! Step and operation model.
//!
//! A step is a template for workpackages: a sequence of shell operations
//! plus the sets it references. Dependencies between steps form the
//! benchmark's execution graph.

use crate::error::{BenchError, Result};
use crate::parameter::is_valid_name;
use serde::{Deserialize, Serialize};

/// A single `do` instruction executed in a shell.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Shell command text; parameter references are substituted before
    /// execution.
    pub command: String,
    /// Sentinel file whose appearance completes an asynchronous operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done_file: Option<String>,
    /// Sentinel file whose appearance fails an asynchronous operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_file: Option<String>,
    /// Sentinel file whose presence finishes the workpackage early.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub break_file: Option<String>,
    /// Stdout capture file name (default `stdout`, append mode).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    /// Stderr capture file name (default `stderr`, append mode).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    /// Boolean expression gating execution, evaluated per workpackage.
    #[serde(default = "default_active")]
    pub active: String,
    /// Execute once per step inside the shared folder.
    #[serde(default)]
    pub shared: bool,
    /// Operation-specific working directory, relative to the sandbox.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<String>,
}

fn default_active() -> String {
    "true".to_string()
}

impl Operation {
    /// New synchronous operation with default attributes.
    pub fn new(command: impl Into<String>) -> Self {
        Operation {
            command: command.into(),
            active: default_active(),
            ..Default::default()
        }
    }

    /// Whether the operation suspends on a sentinel file.
    pub fn is_async(&self) -> bool {
        self.done_file.is_some()
    }
}

/// A named execution step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Step name; workpackage directories embed it.
    pub name: String,
    /// Names of steps this step depends on.
    #[serde(default)]
    pub depend: Vec<String>,
    /// Sets referenced by this step (parameter, file, substitute sets).
    #[serde(default, rename = "use")]
    pub uses: Vec<String>,
    /// Operations in declaration order.
    #[serde(default)]
    pub operations: Vec<Operation>,
    /// Replicate each parameter-space point this many times.
    #[serde(default = "default_one")]
    pub iterations: u32,
    /// Repeat the operation block this many times per workpackage.
    #[serde(default = "default_one")]
    pub cycles: u32,
    /// Worker parallelism for this step's workpackages.
    #[serde(default = "default_one")]
    pub procs: u32,
    /// Cap on simultaneously pending asynchronous operations (0 = unlimited).
    #[serde(default)]
    pub max_async: u32,
    /// Alternative working directory, overriding the sandbox.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<String>,
    /// Shared folder link name; enables `shared` operations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared: Option<String>,
    /// Suffix appended to workpackage directory names (substituted).
    #[serde(default)]
    pub suffix: String,
    /// Boolean expression gating execution of this step's workpackages.
    #[serde(default = "default_active")]
    pub active: String,
    /// Propagate this step's process environment to dependent steps.
    #[serde(default)]
    pub export: bool,
    /// Debug artifact: replayable script of every executed command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub do_log_file: Option<String>,
}

fn default_one() -> u32 {
    1
}

impl Step {
    /// New step with default attributes and no operations.
    pub fn new(name: impl Into<String>) -> Self {
        Step {
            name: name.into(),
            depend: Vec::new(),
            uses: Vec::new(),
            operations: Vec::new(),
            iterations: 1,
            cycles: 1,
            procs: 1,
            max_async: 0,
            work_dir: None,
            shared: None,
            suffix: String::new(),
            active: default_active(),
            export: false,
            do_log_file: None,
        }
    }

    /// Append an operation.
    pub fn push_operation(&mut self, op: Operation) -> &mut Self {
        self.operations.push(op);
        self
    }

    /// Total number of operation slots across all cycles.
    pub fn total_operation_slots(&self) -> usize {
        self.operations.len() * self.cycles as usize
    }

    /// Shared folder directory name under the benchmark root.
    pub fn shared_dir_name(&self) -> Option<String> {
        self.shared
            .as_ref()
            .map(|shared| format!("{}_{}", self.name, shared))
    }

    /// Validate structural constraints.
    pub fn validate(&self) -> Result<()> {
        if !is_valid_name(&self.name) {
            return Err(BenchError::Config(format!(
                "invalid step name '{}'",
                self.name
            )));
        }
        if self.iterations == 0 {
            return Err(BenchError::Config(format!(
                "step '{}': iterations must be at least 1",
                self.name
            )));
        }
        if self.cycles == 0 {
            return Err(BenchError::Config(format!(
                "step '{}': cycles must be at least 1",
                self.name
            )));
        }
        for dep in &self.depend {
            if dep == &self.name {
                return Err(BenchError::Config(format!(
                    "step '{}' depends on itself",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_async_detection() {
        let sync = Operation::new("echo hi");
        assert!(!sync.is_async());

        let mut submit = Operation::new("sbatch job.sh");
        submit.done_file = Some("READY".to_string());
        assert!(submit.is_async());
    }

    #[test]
    fn operation_slots_fold_cycles() {
        let mut step = Step::new("compile");
        step.cycles = 3;
        step.push_operation(Operation::new("a"));
        step.push_operation(Operation::new("b"));
        assert_eq!(step.total_operation_slots(), 6);
    }

    #[test]
    fn shared_dir_name_joins_step_and_link() {
        let mut step = Step::new("run");
        step.shared = Some("shared".to_string());
        assert_eq!(step.shared_dir_name().as_deref(), Some("run_shared"));
    }

    #[test]
    fn self_dependency_is_rejected() {
        let mut step = Step::new("a");
        step.depend.push("a".to_string());
        assert!(step.validate().is_err());
    }

    #[test]
    fn zero_cycles_rejected() {
        let mut step = Step::new("a");
        step.cycles = 0;
        assert!(step.validate().is_err());
    }
}
