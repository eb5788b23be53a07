//! Fileset and substituteset model.
//!
//! Filesets populate a workpackage sandbox with copies or links of
//! external files; substitutesets rewrite file contents by literal
//! string replacement after parameter resolution.

use serde::{Deserialize, Serialize};

/// How a fileset entry lands in the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileAction {
    /// Copy the source into the sandbox.
    Copy,
    /// Create a symlink to the source.
    Link,
    /// Run a shell command in the sandbox before substitution.
    Prepare,
}

/// Path base for fileset sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathRef {
    /// Relative to the configuration file's directory.
    #[default]
    External,
    /// Relative to the workpackage work directory.
    Internal,
}

/// One fileset entry: a copy, link, or prepare command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Entry kind.
    pub action: FileAction,
    /// Source path(s) for copy/link (may contain globs, separated by
    /// whitespace after substitution); command text for prepare.
    pub source: String,
    /// Rename target; only valid for a single non-glob source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Path base the source is resolved against.
    #[serde(default)]
    pub path_ref: PathRef,
    /// Boolean expression gating this entry.
    #[serde(default = "default_active")]
    pub active: String,
}

fn default_active() -> String {
    "true".to_string()
}

impl FileEntry {
    /// New entry with default attributes.
    pub fn new(action: FileAction, source: impl Into<String>) -> Self {
        FileEntry {
            action,
            source: source.into(),
            name: None,
            path_ref: PathRef::default(),
            active: default_active(),
        }
    }
}

/// A named collection of fileset entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileSet {
    /// Set name, referenced from steps via `use`.
    pub name: String,
    /// Optional `file[:external_name]` preload source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_with: Option<String>,
    /// Entries in declaration order.
    #[serde(default)]
    pub entries: Vec<FileEntry>,
}

impl FileSet {
    /// New empty set.
    pub fn new(name: impl Into<String>) -> Self {
        FileSet {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Overlay imported entries (from `init_with`) under local ones; entry
    /// identity is the source text.
    pub fn overlay_imported(&mut self, imported: &FileSet) {
        let mut merged = imported.entries.clone();
        for local in &self.entries {
            if let Some(slot) = merged.iter_mut().find(|e| e.source == local.source) {
                *slot = local.clone();
            } else {
                merged.push(local.clone());
            }
        }
        self.entries = merged;
    }
}

/// One in/out file pair processed by a substituteset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IoFile {
    /// Input file, relative to the work directory.
    pub input: String,
    /// Output file; may equal `input`.
    pub output: String,
    /// Truncate (`w`) or append (`a`) the output.
    #[serde(default)]
    pub out_mode: OutMode,
}

/// Output write mode for [`IoFile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutMode {
    /// Truncate the output file.
    #[default]
    W,
    /// Append to the output file.
    A,
}

/// One literal replacement rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubRule {
    /// Literal text to search for (after parameter resolution).
    pub source: String,
    /// Replacement text (after parameter resolution).
    #[serde(default)]
    pub dest: String,
}

/// A named collection of substitution rules applied to io file pairs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubstituteSet {
    /// Set name, referenced from steps via `use`.
    pub name: String,
    /// Optional `file[:external_name]` preload source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_with: Option<String>,
    /// Files to rewrite.
    #[serde(default)]
    pub iofiles: Vec<IoFile>,
    /// Replacement rules in application order.
    #[serde(default)]
    pub subs: Vec<SubRule>,
}

impl SubstituteSet {
    /// New empty set.
    pub fn new(name: impl Into<String>) -> Self {
        SubstituteSet {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Overlay imported entries under local ones. Io file identity is the
    /// output path; rule identity is the source text.
    pub fn overlay_imported(&mut self, imported: &SubstituteSet) {
        let mut iofiles = imported.iofiles.clone();
        for local in &self.iofiles {
            if let Some(slot) = iofiles.iter_mut().find(|f| f.output == local.output) {
                *slot = local.clone();
            } else {
                iofiles.push(local.clone());
            }
        }
        self.iofiles = iofiles;

        let mut subs = imported.subs.clone();
        for local in &self.subs {
            if let Some(slot) = subs.iter_mut().find(|s| s.source == local.source) {
                *slot = local.clone();
            } else {
                subs.push(local.clone());
            }
        }
        self.subs = subs;
    }
}
