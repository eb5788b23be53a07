#![warn(missing_docs)]
//! benchflow engine - scheduler, store, and analyzer
//!
//! This crate materializes benchmarks into workpackages, executes them
//! through a cooperative scheduler with sentinel-file based asynchronous
//! completion, persists every state transition to disk for restart, and
//! analyses step output into statistically reduced result rows.

mod analyzer;
mod benchmark;
mod fileset;
mod scheduler;
mod shell;
mod store;
mod workpackage;

pub use analyzer::{analyse, build_rows, AnalysisData, PatternCaptures};
pub use benchmark::{Benchmark, StepStatus};
pub use fileset::{apply_fileset, apply_substituteset};
pub use scheduler::{run, RunReport};
pub use shell::{failure_message, run_command, ShellOutcome, ERROR_MSG_LINES};
pub use store::{
    bench_dir, list_benchmark_ids, load_snapshot, next_benchmark_id, read_timestamps,
    resolve_id_selector, write_snapshot, ConfigSnapshot, ANALYSE_FILENAME,
    CONFIGURATION_FILENAME, RESULT_DIRNAME, RUN_LOG_FILENAME, TIMESTAMPS_FILENAME,
    WORKPACKAGES_FILENAME,
};
pub use workpackage::{pad_id, Cursor, Workpackage, WpState, DONE_MARKER, ID_PAD_WIDTH};
