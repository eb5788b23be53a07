//! Benchmark directory layout and persistence.
//!
//! A benchmark lives under `<outpath>/<padid>/` and is fully described by
//! the files written here: the configuration snapshot (including the engine
//! version and active tags), the workpackage graph, the analysis data, and
//! a start/change timestamp file. Reloading these files reconstructs the
//! scheduler state; filesystem mtimes are never consulted.

use crate::workpackage::{pad_id, Workpackage};
use benchflow_core::{BenchError, BenchmarkConfig, Result, RunContext, ENGINE_VERSION};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Configuration snapshot file name.
pub const CONFIGURATION_FILENAME: &str = "configuration.json";
/// Workpackage graph file name.
pub const WORKPACKAGES_FILENAME: &str = "workpackages.json";
/// Persisted analysis data file name.
pub const ANALYSE_FILENAME: &str = "analysis.json";
/// Start/change timestamp file name.
pub const TIMESTAMPS_FILENAME: &str = "timestamps";
/// Default result output directory name.
pub const RESULT_DIRNAME: &str = "result";
/// Run log file name.
pub const RUN_LOG_FILENAME: &str = "run.log";

/// Persisted configuration snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    /// Engine version that created the benchmark.
    pub version: String,
    /// Tags active when the benchmark was created.
    pub tags: BTreeSet<String>,
    /// Benchmark comment (amendable).
    #[serde(default)]
    pub comment: String,
    /// Directory of the original configuration file, for external filesets.
    pub file_path_ref: PathBuf,
    /// The canonical configuration tree.
    pub config: BenchmarkConfig,
}

/// Benchmark directory for an id.
pub fn bench_dir(outpath: &Path, id: u32) -> PathBuf {
    outpath.join(pad_id(id))
}

/// Ids of all benchmarks under an outpath, ascending.
pub fn list_benchmark_ids(outpath: &Path) -> Vec<u32> {
    let mut ids = Vec::new();
    let Ok(entries) = std::fs::read_dir(outpath) else {
        return ids;
    };
    for entry in entries.flatten() {
        if !entry.path().is_dir() {
            continue;
        }
        if let Some(id) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u32>().ok())
        {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    ids
}

/// Next free benchmark id under an outpath.
pub fn next_benchmark_id(outpath: &Path) -> u32 {
    list_benchmark_ids(outpath)
        .last()
        .map(|id| id + 1)
        .unwrap_or(0)
}

/// Resolve an id selector (`last`, `all`, a number, or a negative offset
/// from the end) against the benchmarks present under `outpath`.
pub fn resolve_id_selector(outpath: &Path, selector: &str) -> Result<Vec<u32>> {
    let ids = list_benchmark_ids(outpath);
    if ids.is_empty() {
        return Err(BenchError::Config(format!(
            "no benchmarks found under '{}'",
            outpath.display()
        )));
    }
    match selector {
        "last" => Ok(vec![*ids.last().expect("non-empty")]),
        "all" => Ok(ids),
        other => {
            let parsed: i64 = other.parse().map_err(|_| {
                BenchError::Config(format!("invalid benchmark id '{other}'"))
            })?;
            let id = if parsed < 0 {
                let offset = parsed
                    .checked_neg()
                    .and_then(|o| usize::try_from(o).ok())
                    .filter(|o| *o <= ids.len())
                    .ok_or_else(|| {
                        BenchError::Config(format!("benchmark id '{other}' out of range"))
                    })?;
                ids[ids.len() - offset]
            } else {
                let id = parsed as u32;
                if !ids.contains(&id) {
                    return Err(BenchError::Config(format!("no benchmark with id {id}")));
                }
                id
            };
            Ok(vec![id])
        }
    }
}

/// Create the benchmark directory, honoring `JUBE_GROUP_NAME` shared-group
/// ownership on the outpath and benchmark directory.
pub fn create_bench_dir(outpath: &Path, id: u32, ctx: &RunContext) -> Result<PathBuf> {
    if !outpath.is_dir() {
        std::fs::create_dir_all(outpath)
            .map_err(|e| BenchError::io(format!("creating {}", outpath.display()), e))?;
        apply_group(outpath, ctx);
    }
    let dir = bench_dir(outpath, id);
    if dir.exists() {
        return Err(BenchError::Config(format!(
            "benchmark directory '{}' already exists",
            dir.display()
        )));
    }
    std::fs::create_dir_all(&dir)
        .map_err(|e| BenchError::io(format!("creating {}", dir.display()), e))?;
    apply_group(&dir, ctx);
    Ok(dir)
}

/// Apply shared-group ownership and the setgid bit to a directory.
/// Failures only warn; the benchmark stays usable for the current user.
fn apply_group(path: &Path, ctx: &RunContext) {
    let Some(group) = &ctx.group_name else {
        return;
    };
    for (program, arg) in [("chgrp", group.as_str()), ("chmod", "g+ws")] {
        let status = std::process::Command::new(program)
            .arg(arg)
            .arg(path)
            .status();
        match status {
            Ok(status) if status.success() => {}
            Ok(status) => warn!(
                "{program} {arg} {} exited with {status}",
                path.display()
            ),
            Err(e) => warn!("{program} unavailable for {}: {e}", path.display()),
        }
    }
}

/// Write the configuration snapshot.
pub fn write_snapshot(dir: &Path, snapshot: &ConfigSnapshot) -> Result<()> {
    let json = serde_json::to_string_pretty(snapshot)
        .map_err(|e| BenchError::Config(format!("serializing configuration: {e}")))?;
    std::fs::write(dir.join(CONFIGURATION_FILENAME), json)
        .map_err(|e| BenchError::io("writing configuration snapshot", e))
}

/// Load the configuration snapshot, checking the recorded engine version.
/// A mismatch warns, or fails under `strict_version`.
pub fn load_snapshot(dir: &Path, ctx: &RunContext) -> Result<ConfigSnapshot> {
    let path = dir.join(CONFIGURATION_FILENAME);
    let raw = std::fs::read_to_string(&path)
        .map_err(|e| BenchError::io(format!("reading {}", path.display()), e))?;
    let snapshot: ConfigSnapshot = serde_json::from_str(&raw)
        .map_err(|e| BenchError::Config(format!("corrupt configuration snapshot: {e}")))?;
    if snapshot.version != ENGINE_VERSION {
        if ctx.strict_version {
            return Err(BenchError::VersionMismatch {
                found: snapshot.version,
                running: ENGINE_VERSION.to_string(),
            });
        }
        warn!(
            "benchmark was created by benchflow {} (running {})",
            snapshot.version, ENGINE_VERSION
        );
    }
    Ok(snapshot)
}

/// Write the workpackage graph.
pub fn write_workpackages(dir: &Path, workpackages: &[Workpackage]) -> Result<()> {
    let json = serde_json::to_string_pretty(workpackages)
        .map_err(|e| BenchError::Config(format!("serializing workpackages: {e}")))?;
    std::fs::write(dir.join(WORKPACKAGES_FILENAME), json)
        .map_err(|e| BenchError::io("writing workpackage graph", e))
}

/// Load the workpackage graph.
pub fn load_workpackages(dir: &Path) -> Result<Vec<Workpackage>> {
    let path = dir.join(WORKPACKAGES_FILENAME);
    let raw = std::fs::read_to_string(&path)
        .map_err(|e| BenchError::io(format!("reading {}", path.display()), e))?;
    serde_json::from_str(&raw)
        .map_err(|e| BenchError::Config(format!("corrupt workpackage graph: {e}")))
}

/// Record benchmark metadata times. `start` is written once; `change` is
/// refreshed on every call.
pub fn update_timestamps(dir: &Path) -> Result<()> {
    let path = dir.join(TIMESTAMPS_FILENAME);
    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    let mut stamps = read_timestamps(dir);
    stamps.entry("start".to_string()).or_insert_with(|| now.clone());
    stamps.insert("change".to_string(), now);
    let content: String = stamps
        .iter()
        .map(|(key, value)| format!("{key}: {value}\n"))
        .collect();
    std::fs::write(&path, content).map_err(|e| BenchError::io("writing timestamps", e))
}

/// Read the timestamp file (empty map when absent).
pub fn read_timestamps(dir: &Path) -> BTreeMap<String, String> {
    let mut stamps = BTreeMap::new();
    if let Ok(content) = std::fs::read_to_string(dir.join(TIMESTAMPS_FILENAME)) {
        for line in content.lines() {
            if let Some((key, value)) = line.split_once(':') {
                stamps.insert(key.trim().to_string(), value.trim().to_string());
            }
        }
    }
    stamps
}
