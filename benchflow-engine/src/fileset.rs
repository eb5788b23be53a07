//! Fileset and substituteset execution.
//!
//! Filesets populate a workpackage sandbox before its first operation:
//! copies and links (glob-expanded, external or internal base), plus
//! `prepare` shell commands. Substitutesets then rewrite file contents by
//! literal replacement with fully resolved parameter values.

use crate::shell;
use benchflow_core::{
    BenchError, FileAction, FileSet, IoFile, OutMode, PathRef, Result, RunContext, SubstituteSet,
};
use benchflow_logic::{eval_condition, substitute_fixpoint};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Apply a fileset inside a sandbox.
///
/// `file_path_ref` anchors `external` sources (the configuration file's
/// directory); internal sources resolve against the sandbox itself.
pub fn apply_fileset(
    set: &FileSet,
    work_dir: &Path,
    file_path_ref: &Path,
    values: &BTreeMap<String, String>,
    env: &BTreeMap<String, String>,
    ctx: &RunContext,
) -> Result<()> {
    for entry in &set.entries {
        let active = substitute_fixpoint(&entry.active, values)?;
        if !eval_condition(&active)? {
            continue;
        }
        match entry.action {
            FileAction::Prepare => {
                let command = substitute_fixpoint(&entry.source, values)?;
                let stdout = work_dir.join("stdout");
                let stderr = work_dir.join("stderr");
                let outcome = shell::run_command(ctx, &command, work_dir, env, &stdout, &stderr)?;
                if outcome.exit_code != 0 {
                    return Err(BenchError::Execution(shell::failure_message(
                        &command,
                        work_dir,
                        &stderr,
                        outcome.exit_code,
                    )));
                }
            }
            FileAction::Copy | FileAction::Link => {
                let source = substitute_fixpoint(&entry.source, values)?;
                let rename = match &entry.name {
                    Some(name) => Some(substitute_fixpoint(name, values)?),
                    None => None,
                };
                let base = match entry.path_ref {
                    PathRef::External => file_path_ref,
                    PathRef::Internal => work_dir,
                };
                place_files(entry.action, &source, rename.as_deref(), base, work_dir)?;
            }
        }
    }
    Ok(())
}

/// Expand globs and place each matched file into the sandbox.
fn place_files(
    action: FileAction,
    sources: &str,
    rename: Option<&str>,
    base: &Path,
    work_dir: &Path,
) -> Result<()> {
    let mut matched: Vec<PathBuf> = Vec::new();
    let mut had_glob = false;
    for source in sources.split_whitespace() {
        let pattern = base.join(source);
        let pattern_text = pattern.to_string_lossy().into_owned();
        if source.contains(['*', '?', '[']) {
            had_glob = true;
            let paths = glob::glob(&pattern_text)
                .map_err(|e| BenchError::Config(format!("invalid glob '{source}': {e}")))?;
            let before = matched.len();
            for path in paths {
                let path =
                    path.map_err(|e| BenchError::Filesystem(format!("reading glob match: {e}")))?;
                matched.push(path);
            }
            if matched.len() == before {
                return Err(BenchError::Filesystem(format!(
                    "no files match '{source}' under {}",
                    base.display()
                )));
            }
        } else {
            if !pattern.exists() {
                return Err(BenchError::Filesystem(format!(
                    "source file '{}' not found",
                    pattern.display()
                )));
            }
            matched.push(pattern);
        }
    }

    if rename.is_some() && (had_glob || matched.len() > 1) {
        return Err(BenchError::Config(
            "'name' cannot rename multiple or glob-matched sources".to_string(),
        ));
    }

    for source in matched {
        let file_name = source
            .file_name()
            .ok_or_else(|| {
                BenchError::Filesystem(format!("source '{}' has no file name", source.display()))
            })?
            .to_os_string();
        let target = match rename {
            Some(name) => work_dir.join(name),
            None => work_dir.join(&file_name),
        };
        if target.exists() {
            continue;
        }
        match action {
            FileAction::Copy => {
                copy_recursive(&source, &target)?;
            }
            FileAction::Link => {
                let link_source = source
                    .canonicalize()
                    .unwrap_or_else(|_| source.clone());
                #[cfg(unix)]
                std::os::unix::fs::symlink(&link_source, &target).map_err(|e| {
                    BenchError::io(format!("linking {}", target.display()), e)
                })?;
                #[cfg(not(unix))]
                copy_recursive(&link_source, &target)?;
            }
            FileAction::Prepare => unreachable!("prepare handled by caller"),
        }
        debug!(action = ?action, source = %source.display(), target = %target.display(), "placed file");
    }
    Ok(())
}

/// Copy a file or directory tree.
fn copy_recursive(source: &Path, target: &Path) -> Result<()> {
    if source.is_dir() {
        std::fs::create_dir_all(target)
            .map_err(|e| BenchError::io(format!("creating {}", target.display()), e))?;
        let entries = std::fs::read_dir(source)
            .map_err(|e| BenchError::io(format!("reading {}", source.display()), e))?;
        for entry in entries {
            let entry = entry.map_err(|e| BenchError::io("reading directory entry", e))?;
            copy_recursive(&entry.path(), &target.join(entry.file_name()))?;
        }
    } else {
        std::fs::copy(source, target).map_err(|e| {
            BenchError::io(
                format!("copying {} to {}", source.display(), target.display()),
                e,
            )
        })?;
    }
    Ok(())
}

/// Apply a substituteset: for each io file pair, run every rule as a
/// literal replacement in order and write the result.
pub fn apply_substituteset(
    set: &SubstituteSet,
    work_dir: &Path,
    values: &BTreeMap<String, String>,
) -> Result<()> {
    for iofile in &set.iofiles {
        substitute_file(iofile, &set.subs, work_dir, values)?;
    }
    Ok(())
}

fn substitute_file(
    iofile: &IoFile,
    rules: &[benchflow_core::SubRule],
    work_dir: &Path,
    values: &BTreeMap<String, String>,
) -> Result<()> {
    let input = work_dir.join(substitute_fixpoint(&iofile.input, values)?);
    let output = work_dir.join(substitute_fixpoint(&iofile.output, values)?);

    let mut content = std::fs::read_to_string(&input)
        .map_err(|e| BenchError::io(format!("reading {}", input.display()), e))?;
    for rule in rules {
        let needle = substitute_fixpoint(&rule.source, values)?;
        if needle.is_empty() {
            continue;
        }
        let replacement = substitute_fixpoint(&rule.dest, values)?;
        content = content.replace(&needle, &replacement);
    }

    match iofile.out_mode {
        OutMode::W => std::fs::write(&output, content)
            .map_err(|e| BenchError::io(format!("writing {}", output.display()), e))?,
        OutMode::A => {
            use std::io::Write;
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&output)
                .map_err(|e| BenchError::io(format!("opening {}", output.display()), e))?;
            file.write_all(content.as_bytes())
                .map_err(|e| BenchError::io(format!("appending {}", output.display()), e))?;
        }
    }
    Ok(())
}
