//! Error kinds shared across the workspace.

use thiserror::Error;

/// Errors raised while loading, expanding, executing, or analysing a benchmark.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BenchError {
    /// Configuration is structurally invalid: schema violation, missing
    /// referenced set, or incompatible parameterset combination.
    #[error("configuration error: {0}")]
    Config(String),

    /// A parameter value could not be resolved: unresolved `$name` references
    /// after the substitution bound, a failed script evaluation, or a value
    /// that does not parse as its declared type.
    #[error("resolution error: {0}")]
    Resolution(String),

    /// A filesystem operation failed (missing source file, permission denied,
    /// broken parent link).
    #[error("filesystem error: {0}")]
    Filesystem(String),

    /// A shell command exited non-zero.
    #[error("execution error: {0}")]
    Execution(String),

    /// An asynchronous operation signalled failure through its error file.
    #[error("async operation failed: {0}")]
    AsyncFailure(String),

    /// The analyzer could not process a workpackage (circular pattern
    /// derivation, invalid pattern regex).
    #[error("analyzer error: {0}")]
    Analyzer(String),

    /// A persisted benchmark was written by a different engine version.
    #[error("version mismatch: benchmark was created by benchflow {found}, this is {running}")]
    VersionMismatch {
        /// Version recorded in the persisted configuration snapshot.
        found: String,
        /// Version of the running engine.
        running: String,
    },

    /// Wrapped I/O error with path context.
    #[error("{context}: {source}")]
    Io {
        /// Human-readable description of the failed operation.
        context: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl BenchError {
    /// Attach path context to an I/O error.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        BenchError::Io {
            context: context.into(),
            source,
        }
    }
}

/// Workspace-wide result alias.
pub type Result<T> = std::result::Result<T, BenchError>;
