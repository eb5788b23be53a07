//! Workpackages: the scheduler's unit of work.
//!
//! A workpackage is one step × one parameter-space point × one iteration.
//! Its lifecycle is tracked both in memory and through presence-only marker
//! files inside its directory, so a restarted process reconstructs the same
//! state from disk.

use benchflow_core::{BenchError, Result, SpacePoint, Step};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Width of zero-padded benchmark and workpackage ids in directory names.
pub const ID_PAD_WIDTH: usize = 6;

/// Marker file indicating all operations completed without error.
pub const DONE_MARKER: &str = "done";

/// Zero-pad an id for use in directory names.
pub fn pad_id(id: u32) -> String {
    format!("{id:0width$}", width = ID_PAD_WIDTH)
}

/// Lifecycle state of a workpackage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WpState {
    /// Materialized, sandbox not yet prepared.
    Created,
    /// All parents done; eligible for execution.
    Ready,
    /// Currently executing an operation.
    Running,
    /// Suspended on a `done_file` sentinel.
    AwaitingSentinel,
    /// All operations completed.
    Done,
    /// A resolution, filesystem, execution, or async failure occurred.
    Error,
}

impl WpState {
    /// Terminal states are never re-entered by the scheduler.
    pub fn is_terminal(&self) -> bool {
        matches!(self, WpState::Done | WpState::Error)
    }
}

/// Cursor into a step's operation list, folded over cycles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    /// Current cycle index.
    pub cycle: u32,
    /// Next operation index within the cycle.
    pub op: usize,
}

impl Cursor {
    /// Flat operation slot: `cycle × ops_per_cycle + op`.
    pub fn slot(&self, ops_per_cycle: usize) -> usize {
        self.cycle as usize * ops_per_cycle + self.op
    }

    /// Advance past the current operation.
    pub fn advance(&mut self, ops_per_cycle: usize) {
        self.op += 1;
        if self.op >= ops_per_cycle {
            self.op = 0;
            self.cycle += 1;
        }
    }
}

/// One unit of work: a step instance over a resolved parameter point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workpackage {
    /// Unique id within the benchmark.
    pub id: u32,
    /// Owning step name.
    pub step: String,
    /// Iteration index (folds parent iterations in).
    pub iteration: u32,
    /// Parent workpackage ids, one per depend edge combination element.
    pub parents: Vec<u32>,
    /// Fully resolved parameter map.
    pub point: SpacePoint,
    /// Current state.
    pub state: WpState,
    /// Position of the next operation to run.
    pub cursor: Cursor,
    /// Process environment carried across this workpackage's operations.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Substituted directory suffix.
    #[serde(default)]
    pub suffix: String,
    /// Message attached when entering the Error state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Workpackage {
    /// Directory name: `<padid>_<step>[<suffix>]`.
    pub fn dir_name(&self) -> String {
        format!("{}_{}{}", pad_id(self.id), self.step, self.suffix)
    }

    /// Workpackage directory under the benchmark root.
    pub fn wp_dir(&self, bench_dir: &Path) -> PathBuf {
        bench_dir.join(self.dir_name())
    }

    /// User-visible sandbox inside the workpackage directory.
    pub fn work_dir(&self, bench_dir: &Path) -> PathBuf {
        self.wp_dir(bench_dir).join("work")
    }

    /// Path of the all-complete marker.
    pub fn done_marker(&self, bench_dir: &Path) -> PathBuf {
        self.wp_dir(bench_dir).join(DONE_MARKER)
    }

    /// Path of a per-operation marker for a flat slot index.
    pub fn op_marker(&self, bench_dir: &Path, slot: usize) -> PathBuf {
        self.wp_dir(bench_dir).join(format!("wp_done_{slot:02}"))
    }

    /// Whether the all-complete marker exists.
    pub fn is_done_on_disk(&self, bench_dir: &Path) -> bool {
        self.done_marker(bench_dir).exists()
    }

    /// Whether a flat operation slot is marked complete/launched.
    pub fn op_marked(&self, bench_dir: &Path, slot: usize) -> bool {
        self.op_marker(bench_dir, slot).exists()
    }

    /// Write a presence-only marker file.
    pub fn write_marker(&self, path: &Path) -> Result<()> {
        std::fs::write(path, b"").map_err(|e| {
            BenchError::io(format!("writing marker {}", path.display()), e)
        })
    }

    /// Record an error and transition to the Error state.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.last_error = Some(message.into());
        self.state = WpState::Error;
    }

    /// Reconstruct the in-memory state from on-disk markers.
    ///
    /// A `done` marker is terminal. A marked slot whose operation declares a
    /// `done_file` and whose successor is unmarked means the workpackage was
    /// suspended on that sentinel. Otherwise the cursor points at the first
    /// unmarked slot.
    pub fn reconstitute(&mut self, bench_dir: &Path, step: &Step) -> Result<()> {
        if self.state == WpState::Error {
            // Errors are persisted in the graph file and stay terminal.
            return Ok(());
        }
        if self.is_done_on_disk(bench_dir) {
            self.state = WpState::Done;
            return Ok(());
        }
        let ops_per_cycle = step.operations.len();
        if ops_per_cycle == 0 {
            self.state = WpState::Ready;
            self.cursor = Cursor::default();
            return Ok(());
        }
        let total = step.total_operation_slots();
        let mut cursor = Cursor::default();
        for slot in 0..total {
            if !self.op_marked(bench_dir, slot) {
                break;
            }
            cursor.advance(ops_per_cycle);
        }
        // A marked async operation whose successor has not started is still
        // waiting on its sentinel; re-probe instead of re-running.
        let mut waiting = false;
        if cursor.slot(ops_per_cycle) > 0 {
            let prev_slot = cursor.slot(ops_per_cycle) - 1;
            let prev_op = prev_slot % ops_per_cycle;
            if step.operations[prev_op].is_async() {
                waiting = true;
                cursor = Cursor {
                    cycle: (prev_slot / ops_per_cycle) as u32,
                    op: prev_op,
                };
            }
        }
        self.cursor = cursor;
        self.state = if waiting {
            WpState::AwaitingSentinel
        } else if self.wp_dir(bench_dir).exists() {
            WpState::Ready
        } else {
            WpState::Created
        };
        Ok(())
    }

    /// Persist the resolved parameter map and environment snapshot next to
    /// the sandbox.
    pub fn persist_snapshots(&self, bench_dir: &Path) -> Result<()> {
        let wp_dir = self.wp_dir(bench_dir);
        let params = serde_json::to_string_pretty(&self.point)
            .map_err(|e| BenchError::Config(format!("serializing parameters: {e}")))?;
        std::fs::write(wp_dir.join("parameters.json"), params)
            .map_err(|e| BenchError::io("writing parameters.json", e))?;
        let env = serde_json::to_string_pretty(&self.env)
            .map_err(|e| BenchError::Config(format!("serializing environment: {e}")))?;
        std::fs::write(wp_dir.join("environment.json"), env)
            .map_err(|e| BenchError::io("writing environment.json", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use benchflow_core::Operation;

    fn wp(id: u32, step: &str) -> Workpackage {
        Workpackage {
            id,
            step: step.to_string(),
            iteration: 0,
            parents: Vec::new(),
            point: SpacePoint::new(),
            state: WpState::Created,
            cursor: Cursor::default(),
            env: BTreeMap::new(),
            suffix: String::new(),
            last_error: None,
        }
    }

    #[test]
    fn dir_name_is_padded_and_suffixed() {
        let mut w = wp(7, "compile");
        assert_eq!(w.dir_name(), "000007_compile");
        w.suffix = "_gcc".to_string();
        assert_eq!(w.dir_name(), "000007_compile_gcc");
    }

    #[test]
    fn cursor_advances_across_cycles() {
        let mut cursor = Cursor::default();
        cursor.advance(2);
        assert_eq!(cursor, Cursor { cycle: 0, op: 1 });
        cursor.advance(2);
        assert_eq!(cursor, Cursor { cycle: 1, op: 0 });
        assert_eq!(cursor.slot(2), 2);
    }

    #[test]
    fn reconstitute_done_marker_wins() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = wp(0, "run");
        std::fs::create_dir_all(w.wp_dir(dir.path())).unwrap();
        std::fs::write(w.done_marker(dir.path()), b"").unwrap();

        let mut step = Step::new("run");
        step.push_operation(Operation::new("true"));
        w.reconstitute(dir.path(), &step).unwrap();
        assert_eq!(w.state, WpState::Done);
    }

    #[test]
    fn reconstitute_resumes_after_sync_marker() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = wp(0, "run");
        std::fs::create_dir_all(w.wp_dir(dir.path())).unwrap();
        std::fs::write(w.op_marker(dir.path(), 0), b"").unwrap();

        let mut step = Step::new("run");
        step.push_operation(Operation::new("first"));
        step.push_operation(Operation::new("second"));
        w.reconstitute(dir.path(), &step).unwrap();
        assert_eq!(w.state, WpState::Ready);
        assert_eq!(w.cursor, Cursor { cycle: 0, op: 1 });
    }

    #[test]
    fn reconstitute_detects_pending_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = wp(0, "submit");
        std::fs::create_dir_all(w.wp_dir(dir.path())).unwrap();
        std::fs::write(w.op_marker(dir.path(), 0), b"").unwrap();

        let mut step = Step::new("submit");
        let mut op = Operation::new("sbatch job.sh");
        op.done_file = Some("READY".to_string());
        step.push_operation(op);
        w.reconstitute(dir.path(), &step).unwrap();
        assert_eq!(w.state, WpState::AwaitingSentinel);
        assert_eq!(w.cursor, Cursor { cycle: 0, op: 0 });
    }

    #[test]
    fn reconstitute_unstarted_stays_created() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = wp(3, "run");
        let mut step = Step::new("run");
        step.push_operation(Operation::new("true"));
        w.reconstitute(dir.path(), &step).unwrap();
        assert_eq!(w.state, WpState::Created);
    }
}
