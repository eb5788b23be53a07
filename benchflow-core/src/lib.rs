#![warn(missing_docs)]
//! benchflow core - data model
//!
//! This crate defines the canonical in-memory representation of a benchmark:
//! parametersets, patternsets, filesets, substitutesets, steps with their
//! operations, analyzers, and result definitions, plus the process-scoped
//! run context and the error kinds shared across the workspace.

mod analysis;
mod config;
mod context;
mod error;
mod fileset;
mod parameter;
mod pattern;
mod result;
mod step;

pub use analysis::{AnalyseBlock, AnalyseFile, AnalyzerDef};
pub use config::BenchmarkConfig;
pub use context::{RunContext, DEFAULT_SHELL, ENGINE_VERSION};
pub use error::{BenchError, Result};
pub use fileset::{
    FileAction, FileEntry, FileSet, IoFile, OutMode, PathRef, SubRule, SubstituteSet,
};
pub use parameter::{
    export_values, is_valid_name, point_values, DuplicateMode, ParamMode, ParamType, ParameterDef,
    ParameterSet, ResolvedParameter, SpacePoint, UpdateMode, DEFAULT_SEPARATOR,
    MAX_SUBSTITUTION_PASSES,
};
pub use pattern::{pattern_alias, PatternDef, PatternSet, PATTERN_ALIASES};
pub use result::{
    ColumnSpec, DatabaseSpec, ResultDef, ResultKind, RowSet, SyslogSpec, TableSpec, TableStyle,
    DEFAULT_SYSLOG_PORT,
};
pub use step::{Operation, Step};
