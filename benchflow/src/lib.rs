//! # benchflow
//!
//! A benchmarking workflow engine.
//!
//! A configuration document declares a parameter space, shell steps over
//! that space with inter-step dependencies, regex-based analysis of step
//! output, and result rendering. benchflow expands the space into
//! workpackages, executes them in sandboxed directories, tolerates
//! long-running asynchronous jobs through sentinel files, and supports
//! restart and incremental re-analysis.
//!
//! ## Quick start
//!
//! ```yaml
//! benchmark:
//!   name: demo
//!   parameterset:
//!     - name: numbers
//!       parameter:
//!         - { name: number, type: int, value: "1,2,4" }
//!   step:
//!     - name: echo
//!       use: [numbers]
//!       do: [ 'echo "Number: $number"' ]
//!   patternset:
//!     - name: pats
//!       pattern:
//!         - { name: number_pat, type: int, value: "Number: $jube_pat_int" }
//!   analyser:
//!     - name: scan
//!       use: [pats]
//!       analyse:
//!         - step: echo
//!           file: [stdout]
//!   result:
//!     - name: table
//!       use: [scan]
//!       table:
//!         column: [number, number_pat]
//! ```
//!
//! ```text
//! benchflow run demo.yaml
//! benchflow result bench_run --id last
//! ```

// Re-export the data model
pub use benchflow_core::{
    AnalyzerDef, BenchError, BenchmarkConfig, FileSet, Operation, ParamMode, ParamType,
    ParameterDef, ParameterSet, PatternDef, PatternSet, ResultDef, ResultKind, RowSet, RunContext,
    SpacePoint, Step, SubstituteSet, UpdateMode,
};

// Re-export the expansion and expression logic
pub use benchflow_logic::{
    build_points, eval_condition, eval_tag_expr, finalize_point, merge_parametersets,
    substitute_fixpoint, DependencyGraph,
};

// Re-export the engine
pub use benchflow_engine::{
    analyse, build_rows, AnalysisData, Benchmark, RunReport, Workpackage, WpState,
};

// Re-export statistics
pub use benchflow_stats::{reduce_captures, NumericReduction, Reduction, Statistic};

// Re-export result rendering
pub use benchflow_report::{emit_syslog, render_table, write_database};

/// Run the benchflow CLI.
///
/// Call this from a binary's `main()`:
/// ```ignore
/// fn main() {
///     benchflow::run().unwrap();
/// }
/// ```
pub use benchflow_cli::run;
