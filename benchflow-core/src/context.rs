//! Process-scoped configuration.
//!
//! The engine consumes a small number of environment variables
//! (`JUBE_INCLUDE_PATH`, `JUBE_EXEC_SHELL`/`SHELL_OVERRIDE`,
//! `JUBE_GROUP_NAME`). They are read once and carried in an explicit
//! context struct instead of being re-read from the environment at use
//! sites.

use std::collections::BTreeSet;
use std::path::PathBuf;

/// Default shell used when neither override variable is set.
pub const DEFAULT_SHELL: &str = "/bin/sh";

/// Engine version persisted into configuration snapshots.
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Process-scoped settings shared by every benchmark in a run.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Shell used to execute `do` commands and `shell`-mode parameters.
    pub shell: String,
    /// Include search path, highest precedence first.
    pub include_path: Vec<PathBuf>,
    /// Group name applied to newly created benchmark directories.
    pub group_name: Option<String>,
    /// Active tags from `--tag`.
    pub tags: BTreeSet<String>,
    /// Escalate the first workpackage error to scheduler termination.
    pub exit_on_error: bool,
    /// Treat an engine version mismatch as an error instead of a warning.
    pub strict_version: bool,
}

impl RunContext {
    /// Build a context from the process environment.
    ///
    /// `SHELL_OVERRIDE` wins over `JUBE_EXEC_SHELL`; both fall back to
    /// [`DEFAULT_SHELL`]. `JUBE_INCLUDE_PATH` is a colon-separated list.
    pub fn from_env() -> Self {
        let shell = std::env::var("SHELL_OVERRIDE")
            .or_else(|_| std::env::var("JUBE_EXEC_SHELL"))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_SHELL.to_string());

        let include_path = std::env::var("JUBE_INCLUDE_PATH")
            .map(|raw| {
                raw.split(':')
                    .filter(|p| !p.is_empty())
                    .map(PathBuf::from)
                    .collect()
            })
            .unwrap_or_default();

        let group_name = std::env::var("JUBE_GROUP_NAME")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        RunContext {
            shell,
            include_path,
            group_name,
            tags: BTreeSet::new(),
            exit_on_error: false,
            strict_version: false,
        }
    }

    /// Add CLI tags to the active tag set.
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Prepend higher-precedence include directories (`--include-path`,
    /// then config-level `include-path` entries).
    pub fn prepend_include_paths<I>(&mut self, paths: I)
    where
        I: IntoIterator<Item = PathBuf>,
    {
        let mut combined: Vec<PathBuf> = paths.into_iter().collect();
        combined.append(&mut self.include_path);
        self.include_path = combined;
    }
}

impl Default for RunContext {
    fn default() -> Self {
        RunContext {
            shell: DEFAULT_SHELL.to_string(),
            include_path: Vec::new(),
            group_name: None,
            tags: BTreeSet::new(),
            exit_on_error: false,
            strict_version: false,
        }
    }
}
