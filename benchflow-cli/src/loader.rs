//! YAML configuration front-end.
//!
//! Deserializes a user configuration document into the canonical tree.
//! Preprocessing happens on the untyped YAML value, in order: `include`
//! nodes are spliced in from external files, then any node carrying a
//! `tag` attribute is kept or dropped against the active tag set. Sets may
//! preload entries from other documents via `init_with`.
//!
//! Document shape (all sections optional unless noted):
//!
//! ```yaml
//! include-path: [../common]
//! selection:
//!   tag: [fast]
//! include:
//!   - from: fragments.yaml
//!     path: benchmark
//! benchmark:
//!   name: demo                 # required
//!   outpath: bench_run
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

use anyhow::{anyhow, bail, Context};
use benchflow_core::{
    AnalyseBlock, AnalyseFile, AnalyzerDef, BenchmarkConfig, ColumnSpec, DatabaseSpec,
    DuplicateMode, FileAction, FileEntry, FileSet, IoFile, Operation, OutMode, ParamMode,
    ParamType, ParameterDef, ParameterSet, PathRef, PatternDef, PatternSet, ResultDef, ResultKind,
    RunContext, Step, SubRule, SubstituteSet, SyslogSpec, TableSpec, TableStyle, UpdateMode,
};
use benchflow_logic::eval_tag_expr;
use serde::Deserialize;
use serde_yaml::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Maximum include nesting depth.
const MAX_INCLUDE_DEPTH: usize = 16;

/// A loaded configuration document.
#[derive(Debug)]
pub struct LoadedConfig {
    /// Canonical configuration tree.
    pub config: BenchmarkConfig,
    /// Directory of the configuration file (anchor for external filesets).
    pub file_dir: PathBuf,
    /// Tags declared in the document's `selection` block.
    pub selection_tags: BTreeSet<String>,
}

/// Load and preprocess a configuration file.
///
/// `ctx` carries the active tags and the include search path; tags from the
/// document's `selection` block are added to the active set before tag
/// filtering.
pub fn load_config(path: &Path, ctx: &RunContext) -> anyhow::Result<LoadedConfig> {
    let file_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading configuration file '{}'", path.display()))?;
    let mut value: Value =
        serde_yaml::from_str(&raw).with_context(|| format!("parsing '{}'", path.display()))?;

    // Document-level include path entries extend the search path below the
    // CLI-provided ones.
    let mut search_path: Vec<PathBuf> = ctx.include_path.clone();
    if let Some(paths) = extract_include_path(&value) {
        for entry in paths {
            search_path.push(file_dir.join(entry));
        }
    }
    search_path.push(PathBuf::from("."));
    search_path.push(file_dir.clone());

    let mut tags = ctx.tags.clone();
    tags.extend(extract_selection_tags(&value));

    resolve_includes(&mut value, &search_path, 0)?;
    let value = filter_tags(value, &tags)?
        .ok_or_else(|| anyhow!("the whole document was removed by tag filtering"))?;

    let document: RawDocument =
        serde_yaml::from_value(value).context("configuration document has an invalid shape")?;
    let raw_benchmark = document
        .benchmark
        .ok_or_else(|| anyhow!("configuration contains no 'benchmark' block"))?;

    let mut config = convert_benchmark(raw_benchmark)?;
    resolve_init_with(&mut config, &search_path, &tags)?;
    config
        .validate()
        .map_err(|e| anyhow!("invalid configuration: {e}"))?;
    debug!(name = %config.name, steps = config.steps.len(), "configuration loaded");

    Ok(LoadedConfig {
        config,
        file_dir,
        selection_tags: tags,
    })
}

fn extract_include_path(value: &Value) -> Option<Vec<String>> {
    let entry = value.get("include-path")?;
    match entry {
        Value::String(s) => Some(vec![s.clone()]),
        Value::Sequence(seq) => Some(
            seq.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
        ),
        _ => None,
    }
}

fn extract_selection_tags(value: &Value) -> BTreeSet<String> {
    let mut tags = BTreeSet::new();
    let Some(entry) = value.get("selection").and_then(|s| s.get("tag")) else {
        return tags;
    };
    match entry {
        Value::String(s) => {
            tags.extend(s.split(',').map(|t| t.trim().to_string()));
        }
        Value::Sequence(seq) => {
            tags.extend(seq.iter().filter_map(|v| v.as_str().map(str::to_string)));
        }
        _ => {}
    }
    tags
}

/// Splice `include` entries: each `{from, path?}` is replaced by the
/// referenced fragment, deep-merged into the containing mapping. Includes
/// nest up to [`MAX_INCLUDE_DEPTH`].
fn resolve_includes(
    value: &mut Value,
    search_path: &[PathBuf],
    depth: usize,
) -> anyhow::Result<()> {
    if depth > MAX_INCLUDE_DEPTH {
        bail!("includes nested deeper than {MAX_INCLUDE_DEPTH} levels");
    }
    match value {
        Value::Mapping(mapping) => {
            let includes = mapping.remove("include");
            if let Some(includes) = includes {
                let entries: Vec<RawInclude> = serde_yaml::from_value(includes)
                    .context("invalid 'include' entry (expected {from, path?})")?;
                for entry in entries {
                    let file = find_file(&entry.from, search_path)?;
                    let raw = std::fs::read_to_string(&file)
                        .with_context(|| format!("reading include '{}'", file.display()))?;
                    let mut fragment: Value = serde_yaml::from_str(&raw)
                        .with_context(|| format!("parsing include '{}'", file.display()))?;
                    if let Some(path) = &entry.path {
                        fragment = select_path(&fragment, path).with_context(|| {
                            format!("path '{path}' not found in '{}'", file.display())
                        })?;
                    }
                    resolve_includes(&mut fragment, search_path, depth + 1)?;
                    if let Value::Mapping(incoming) = fragment {
                        for (key, child) in incoming {
                            match mapping.get_mut(&key) {
                                Some(existing) => merge_value(existing, child),
                                None => {
                                    mapping.insert(key, child);
                                }
                            }
                        }
                    }
                }
            }
            for (_, child) in mapping.iter_mut() {
                resolve_includes(child, search_path, depth)?;
            }
        }
        Value::Sequence(children) => {
            for child in children {
                resolve_includes(child, search_path, depth)?;
            }
        }
        _ => {}
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct RawInclude {
    from: String,
    #[serde(default)]
    path: Option<String>,
}

/// Locate a file through the include search path.
fn find_file(name: &str, search_path: &[PathBuf]) -> anyhow::Result<PathBuf> {
    let direct = PathBuf::from(name);
    if direct.is_absolute() {
        if direct.exists() {
            return Ok(direct);
        }
        bail!("include file '{name}' not found");
    }
    for base in search_path {
        let candidate = base.join(name);
        if candidate.exists() {
            return Ok(candidate);
        }
    }
    bail!("include file '{name}' not found in the include path")
}

/// Select a dotted path (`benchmark.parameterset`) inside a fragment.
fn select_path(fragment: &Value, path: &str) -> Option<Value> {
    let mut current = fragment;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current.clone())
}

/// Deep merge: mappings merge key-wise, sequences append, scalars keep the
/// existing (including) document's value.
fn merge_value(target: &mut Value, incoming: Value) {
    match (target, incoming) {
        (Value::Mapping(target), Value::Mapping(incoming)) => {
            for (key, value) in incoming {
                match target.get_mut(&key) {
                    Some(existing) => merge_value(existing, value),
                    None => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (Value::Sequence(target), Value::Sequence(incoming)) => {
            target.extend(incoming);
        }
        (_target, _incoming) => {}
    }
}

/// Drop any node carrying a false `tag` expression; strip the attribute
/// from kept nodes. The `selection` block is exempt.
fn filter_tags(value: Value, tags: &BTreeSet<String>) -> anyhow::Result<Option<Value>> {
    match value {
        Value::Mapping(mapping) => {
            let mut out = serde_yaml::Mapping::new();
            for (key, child) in mapping {
                if key.as_str() == Some("tag") {
                    if let Some(expr) = child.as_str() {
                        if !eval_tag_expr(expr, tags).map_err(|e| anyhow!("{e}"))? {
                            return Ok(None);
                        }
                        continue;
                    }
                }
                if key.as_str() == Some("selection") {
                    out.insert(key, child);
                    continue;
                }
                if let Some(kept) = filter_tags(child, tags)? {
                    out.insert(key, kept);
                }
            }
            Ok(Some(Value::Mapping(out)))
        }
        Value::Sequence(children) => {
            let mut out = Vec::with_capacity(children.len());
            for child in children {
                if let Some(kept) = filter_tags(child, tags)? {
                    out.push(kept);
                }
            }
            Ok(Some(Value::Sequence(out)))
        }
        other => Ok(Some(other)),
    }
}

// ---------------------------------------------------------------------------
// Raw document shapes
// ---------------------------------------------------------------------------

/// String or list of strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(item) => vec![item],
            OneOrMany::Many(items) => items,
        }
    }
}

fn split_list(value: Option<OneOrMany<String>>) -> Vec<String> {
    value
        .map(OneOrMany::into_vec)
        .unwrap_or_default()
        .iter()
        .flat_map(|entry| entry.split(','))
        .map(|entry| entry.trim().to_string())
        .filter(|entry| !entry.is_empty())
        .collect()
}

#[derive(Debug, Deserialize)]
struct RawDocument {
    #[serde(default)]
    benchmark: Option<RawBenchmark>,
}

#[derive(Debug, Deserialize)]
struct RawBenchmark {
    name: String,
    #[serde(default)]
    outpath: Option<String>,
    #[serde(default)]
    comment: Option<String>,
    #[serde(default)]
    parameterset: Vec<RawParameterSet>,
    #[serde(default)]
    patternset: Vec<RawPatternSet>,
    #[serde(default)]
    fileset: Vec<RawFileSet>,
    #[serde(default)]
    substituteset: Vec<RawSubstituteSet>,
    #[serde(default)]
    step: Vec<RawStep>,
    #[serde(default, alias = "analyzer")]
    analyser: Vec<RawAnalyser>,
    #[serde(default)]
    result: Vec<RawResult>,
}

#[derive(Debug, Deserialize)]
struct RawParameterSet {
    name: String,
    #[serde(default)]
    init_with: Option<String>,
    #[serde(default)]
    duplicate: Option<DuplicateMode>,
    #[serde(default)]
    parameter: Vec<RawParameter>,
}

#[derive(Debug, Deserialize)]
struct RawParameter {
    name: String,
    #[serde(default)]
    value: Option<Value>,
    #[serde(default, rename = "type")]
    ptype: Option<ParamType>,
    #[serde(default)]
    mode: Option<ParamMode>,
    #[serde(default)]
    separator: Option<String>,
    #[serde(default)]
    export: Option<bool>,
    #[serde(default)]
    update_mode: Option<UpdateMode>,
    #[serde(default)]
    duplicate: Option<DuplicateMode>,
}

#[derive(Debug, Deserialize)]
struct RawPatternSet {
    name: String,
    #[serde(default)]
    init_with: Option<String>,
    #[serde(default)]
    pattern: Vec<RawPattern>,
}

#[derive(Debug, Deserialize)]
struct RawPattern {
    name: String,
    #[serde(default)]
    value: Option<Value>,
    #[serde(default, rename = "type")]
    ptype: Option<ParamType>,
    #[serde(default)]
    mode: Option<ParamMode>,
    #[serde(default)]
    default: Option<Value>,
    #[serde(default)]
    dotall: Option<bool>,
    #[serde(default)]
    unit: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawFileSet {
    name: String,
    #[serde(default)]
    init_with: Option<String>,
    #[serde(default)]
    copy: Vec<RawFileEntry>,
    #[serde(default)]
    link: Vec<RawFileEntry>,
    #[serde(default)]
    prepare: Vec<RawFileEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawFileEntry {
    Source(String),
    Full {
        source: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        rel_path: Option<PathRef>,
        #[serde(default)]
        active: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct RawSubstituteSet {
    name: String,
    #[serde(default)]
    init_with: Option<String>,
    #[serde(default)]
    iofile: Vec<RawIoFile>,
    #[serde(default)]
    sub: Vec<RawSub>,
}

#[derive(Debug, Deserialize)]
struct RawIoFile {
    #[serde(rename = "in")]
    input: String,
    out: String,
    #[serde(default)]
    out_mode: Option<OutMode>,
}

#[derive(Debug, Deserialize)]
struct RawSub {
    source: String,
    #[serde(default)]
    dest: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RawStep {
    name: String,
    #[serde(default)]
    depend: Option<OneOrMany<String>>,
    #[serde(default, rename = "use")]
    uses: Option<OneOrMany<String>>,
    #[serde(default, rename = "do")]
    operations: Vec<RawOperation>,
    #[serde(default)]
    iterations: Option<u32>,
    #[serde(default)]
    cycles: Option<u32>,
    #[serde(default)]
    procs: Option<u32>,
    #[serde(default)]
    max_async: Option<u32>,
    #[serde(default)]
    work_dir: Option<String>,
    #[serde(default)]
    shared: Option<String>,
    #[serde(default)]
    suffix: Option<String>,
    #[serde(default)]
    active: Option<String>,
    #[serde(default)]
    export: Option<bool>,
    #[serde(default)]
    do_log_file: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawOperation {
    Command(String),
    Full {
        cmd: String,
        #[serde(default)]
        done_file: Option<String>,
        #[serde(default)]
        error_file: Option<String>,
        #[serde(default)]
        break_file: Option<String>,
        #[serde(default)]
        stdout: Option<String>,
        #[serde(default)]
        stderr: Option<String>,
        #[serde(default)]
        active: Option<String>,
        #[serde(default)]
        shared: Option<bool>,
        #[serde(default)]
        work_dir: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct RawAnalyser {
    name: String,
    #[serde(default, rename = "use")]
    uses: Option<OneOrMany<String>>,
    #[serde(default)]
    reduce: Option<bool>,
    #[serde(default)]
    analyse: Vec<RawAnalyse>,
}

#[derive(Debug, Deserialize)]
struct RawAnalyse {
    step: String,
    #[serde(default)]
    file: Vec<RawAnalyseFile>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawAnalyseFile {
    Glob(String),
    Full {
        glob: String,
        #[serde(default, rename = "use")]
        uses: Option<OneOrMany<String>>,
    },
}

#[derive(Debug, Deserialize)]
struct RawResult {
    name: String,
    #[serde(default, rename = "use")]
    uses: Option<OneOrMany<String>>,
    #[serde(default)]
    table: Option<RawTable>,
    #[serde(default)]
    syslog: Option<RawSyslog>,
    #[serde(default)]
    database: Option<RawDatabase>,
}

#[derive(Debug, Deserialize)]
struct RawTable {
    #[serde(default)]
    style: Option<TableStyle>,
    #[serde(default)]
    sort: Option<OneOrMany<String>>,
    #[serde(default)]
    transpose: Option<bool>,
    #[serde(default)]
    filter: Option<String>,
    #[serde(default)]
    column: Vec<RawColumn>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawColumn {
    Key(String),
    Full {
        key: String,
        #[serde(default)]
        format: Option<String>,
        #[serde(default)]
        title: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct RawSyslog {
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    socket_path: Option<String>,
    #[serde(default)]
    format: Option<String>,
    #[serde(default)]
    key: Vec<RawColumn>,
    #[serde(default)]
    sort: Option<OneOrMany<String>>,
    #[serde(default)]
    filter: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawDatabase {
    file: String,
    name: String,
    #[serde(default)]
    key: Vec<String>,
    #[serde(default)]
    primekeys: Option<OneOrMany<String>>,
    #[serde(default)]
    filter: Option<String>,
}

// ---------------------------------------------------------------------------
// Raw → canonical conversion
// ---------------------------------------------------------------------------

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}

fn convert_benchmark(raw: RawBenchmark) -> anyhow::Result<BenchmarkConfig> {
    let mut config = BenchmarkConfig {
        name: raw.name,
        comment: raw.comment.unwrap_or_default(),
        ..Default::default()
    };
    if let Some(outpath) = raw.outpath {
        config.outpath = outpath;
    }

    for raw_set in raw.parameterset {
        let mut set = ParameterSet::new(raw_set.name.clone());
        set.init_with = raw_set.init_with;
        set.duplicate = raw_set.duplicate.unwrap_or_default();
        for raw_param in raw_set.parameter {
            let mut def = ParameterDef::new(
                raw_param.name,
                raw_param.value.as_ref().map(scalar_to_string).unwrap_or_default(),
            );
            if let Some(ptype) = raw_param.ptype {
                def.ptype = ptype;
            }
            if let Some(mode) = raw_param.mode {
                def.mode = mode;
            }
            if let Some(separator) = raw_param.separator {
                def.separator = separator;
            }
            def.export = raw_param.export.unwrap_or(false);
            def.update_mode = raw_param.update_mode.unwrap_or_default();
            def.duplicate = raw_param.duplicate;
            set.parameters.push(def);
        }
        config.parametersets.insert(raw_set.name, set);
    }

    for raw_set in raw.patternset {
        let mut set = PatternSet::new(raw_set.name.clone());
        set.init_with = raw_set.init_with;
        for raw_pattern in raw_set.pattern {
            let mut def = PatternDef::new(
                raw_pattern.name,
                raw_pattern
                    .value
                    .as_ref()
                    .map(scalar_to_string)
                    .unwrap_or_default(),
            );
            if let Some(ptype) = raw_pattern.ptype {
                def.ptype = ptype;
            }
            if let Some(mode) = raw_pattern.mode {
                def.mode = mode;
            }
            def.default = raw_pattern.default.as_ref().map(scalar_to_string);
            def.dotall = raw_pattern.dotall.unwrap_or(false);
            def.unit = raw_pattern.unit;
            set.patterns.push(def);
        }
        config.patternsets.insert(raw_set.name, set);
    }

    for raw_set in raw.fileset {
        let mut set = FileSet::new(raw_set.name.clone());
        set.init_with = raw_set.init_with;
        for (action, entries) in [
            (FileAction::Copy, raw_set.copy),
            (FileAction::Link, raw_set.link),
            (FileAction::Prepare, raw_set.prepare),
        ] {
            for raw_entry in entries {
                set.entries.push(convert_file_entry(action, raw_entry));
            }
        }
        config.filesets.insert(raw_set.name, set);
    }

    for raw_set in raw.substituteset {
        let mut set = SubstituteSet::new(raw_set.name.clone());
        set.init_with = raw_set.init_with;
        for raw_iofile in raw_set.iofile {
            set.iofiles.push(IoFile {
                input: raw_iofile.input,
                output: raw_iofile.out,
                out_mode: raw_iofile.out_mode.unwrap_or_default(),
            });
        }
        for raw_sub in raw_set.sub {
            set.subs.push(SubRule {
                source: raw_sub.source,
                dest: raw_sub.dest.as_ref().map(scalar_to_string).unwrap_or_default(),
            });
        }
        config.substitutesets.insert(raw_set.name, set);
    }

    for raw_step in raw.step {
        let mut step = Step::new(raw_step.name.clone());
        step.depend = split_list(raw_step.depend);
        step.uses = split_list(raw_step.uses);
        for raw_op in raw_step.operations {
            step.operations.push(convert_operation(raw_op));
        }
        if let Some(iterations) = raw_step.iterations {
            step.iterations = iterations;
        }
        if let Some(cycles) = raw_step.cycles {
            step.cycles = cycles;
        }
        if let Some(procs) = raw_step.procs {
            step.procs = procs;
        }
        if let Some(max_async) = raw_step.max_async {
            step.max_async = max_async;
        }
        step.work_dir = raw_step.work_dir;
        step.shared = raw_step.shared;
        step.suffix = raw_step.suffix.unwrap_or_default();
        if let Some(active) = raw_step.active {
            step.active = active;
        }
        step.export = raw_step.export.unwrap_or(false);
        step.do_log_file = raw_step.do_log_file;
        config.steps.insert(raw_step.name, step);
    }

    for raw_analyser in raw.analyser {
        let mut analyzer = AnalyzerDef::new(raw_analyser.name.clone());
        analyzer.uses = split_list(raw_analyser.uses);
        if let Some(reduce) = raw_analyser.reduce {
            analyzer.reduce = reduce;
        }
        for raw_block in raw_analyser.analyse {
            let mut block = AnalyseBlock {
                step: raw_block.step,
                files: Vec::new(),
            };
            for raw_file in raw_block.file {
                block.files.push(match raw_file {
                    RawAnalyseFile::Glob(glob) => AnalyseFile {
                        glob,
                        uses: Vec::new(),
                    },
                    RawAnalyseFile::Full { glob, uses } => AnalyseFile {
                        glob,
                        uses: split_list(uses),
                    },
                });
            }
            analyzer.analyses.push(block);
        }
        config.analyzers.insert(raw_analyser.name, analyzer);
    }

    for raw_result in raw.result {
        let kind = match (raw_result.table, raw_result.syslog, raw_result.database) {
            (Some(table), None, None) => ResultKind::Table(TableSpec {
                style: table.style.unwrap_or_default(),
                sort: split_list(table.sort),
                transpose: table.transpose.unwrap_or(false),
                filter: table.filter,
                columns: table.column.into_iter().map(convert_column).collect(),
            }),
            (None, Some(syslog), None) => ResultKind::Syslog(SyslogSpec {
                address: syslog.address,
                socket_path: syslog.socket_path,
                format: syslog.format,
                keys: syslog.key.into_iter().map(convert_column).collect(),
                sort: split_list(syslog.sort),
                filter: syslog.filter,
            }),
            (None, None, Some(database)) => ResultKind::Database(DatabaseSpec {
                file: database.file,
                table: database.name,
                keys: database.key,
                primekeys: split_list(database.primekeys),
                filter: database.filter,
            }),
            _ => bail!(
                "result '{}' must declare exactly one of table, syslog, database",
                raw_result.name
            ),
        };
        config.results.push(ResultDef {
            name: raw_result.name,
            uses: split_list(raw_result.uses),
            kind,
        });
    }

    Ok(config)
}

fn convert_file_entry(action: FileAction, raw: RawFileEntry) -> FileEntry {
    match raw {
        RawFileEntry::Source(source) => FileEntry::new(action, source),
        RawFileEntry::Full {
            source,
            name,
            rel_path,
            active,
        } => {
            let mut entry = FileEntry::new(action, source);
            entry.name = name;
            entry.path_ref = rel_path.unwrap_or_default();
            if let Some(active) = active {
                entry.active = active;
            }
            entry
        }
    }
}

fn convert_operation(raw: RawOperation) -> Operation {
    match raw {
        RawOperation::Command(command) => Operation::new(command),
        RawOperation::Full {
            cmd,
            done_file,
            error_file,
            break_file,
            stdout,
            stderr,
            active,
            shared,
            work_dir,
        } => {
            let mut op = Operation::new(cmd);
            op.done_file = done_file;
            op.error_file = error_file;
            op.break_file = break_file;
            op.stdout = stdout;
            op.stderr = stderr;
            if let Some(active) = active {
                op.active = active;
            }
            op.shared = shared.unwrap_or(false);
            op.work_dir = work_dir;
            op
        }
    }
}

fn convert_column(raw: RawColumn) -> ColumnSpec {
    match raw {
        RawColumn::Key(key) => ColumnSpec::new(key),
        RawColumn::Full { key, format, title } => ColumnSpec {
            key,
            format,
            title,
        },
    }
}

// ---------------------------------------------------------------------------
// init_with
// ---------------------------------------------------------------------------

/// Preload set entries from external documents. The `init_with` value is
/// `file[:external_name]`; local entries override imported ones.
fn resolve_init_with(
    config: &mut BenchmarkConfig,
    search_path: &[PathBuf],
    tags: &BTreeSet<String>,
) -> anyhow::Result<()> {
    let mut imports: BTreeMap<PathBuf, BenchmarkConfig> = BTreeMap::new();
    let load = |reference: &str| -> anyhow::Result<(PathBuf, String, String)> {
        let (file, external) = match reference.split_once(':') {
            Some((file, external)) => (file.to_string(), Some(external.to_string())),
            None => (reference.to_string(), None),
        };
        let path = find_file(&file, search_path)?;
        Ok((path, file, external.unwrap_or_default()))
    };

    macro_rules! import_sets {
        ($field:ident) => {
            let references: Vec<(String, String)> = config
                .$field
                .iter()
                .filter_map(|(name, set)| {
                    set.init_with.as_ref().map(|r| (name.clone(), r.clone()))
                })
                .collect();
            for (set_name, reference) in references {
                let (path, file, external) = load(&reference)?;
                if !imports.contains_key(&path) {
                    let mut import_ctx = RunContext::default();
                    import_ctx.tags = tags.clone();
                    import_ctx.include_path = search_path.to_vec();
                    let loaded = load_config(&path, &import_ctx)
                        .with_context(|| format!("loading init_with file '{file}'"))?;
                    imports.insert(path.clone(), loaded.config);
                }
                let imported_config = &imports[&path];
                let lookup = if external.is_empty() {
                    set_name.clone()
                } else {
                    external.clone()
                };
                let imported = imported_config.$field.get(&lookup).ok_or_else(|| {
                    anyhow!("init_with: no set '{lookup}' in '{file}'")
                })?;
                if let Some(set) = config.$field.get_mut(&set_name) {
                    set.overlay_imported(imported);
                    set.init_with = None;
                }
            }
        };
    }

    import_sets!(parametersets);
    import_sets!(patternsets);
    import_sets!(filesets);
    import_sets!(substitutesets);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn minimal_document_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            "bench.yaml",
            r#"
benchmark:
  name: demo
  parameterset:
    - name: numbers
      parameter:
        - { name: number, type: int, value: "1,2,4" }
  step:
    - name: echo
      use: [numbers]
      do: [ 'echo "Number: $number"' ]
"#,
        );
        let loaded = load_config(&path, &RunContext::default()).unwrap();
        assert_eq!(loaded.config.name, "demo");
        let set = &loaded.config.parametersets["numbers"];
        assert_eq!(set.parameters[0].raw, "1,2,4");
        assert_eq!(set.parameters[0].ptype, ParamType::Int);
        assert_eq!(loaded.config.steps["echo"].operations.len(), 1);
    }

    #[test]
    fn numeric_scalars_become_strings() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            "bench.yaml",
            r#"
benchmark:
  name: demo
  parameterset:
    - name: p
      parameter:
        - { name: n, type: int, value: 42 }
"#,
        );
        let loaded = load_config(&path, &RunContext::default()).unwrap();
        assert_eq!(loaded.config.parametersets["p"].parameters[0].raw, "42");
    }

    #[test]
    fn tag_filtering_drops_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            "bench.yaml",
            r#"
benchmark:
  name: demo
  parameterset:
    - name: p
      parameter:
        - { name: fast_only, value: "1", tag: fast }
        - { name: always, value: "2" }
        - { name: unless_fast, value: "3", tag: "!fast" }
  step:
    - name: s
      use: [p]
      do: [ "true" ]
"#,
        );
        let plain = load_config(&path, &RunContext::default()).unwrap();
        let names: Vec<&str> = plain.config.parametersets["p"]
            .parameters
            .iter()
            .map(|p| p.name.as_str())
            .collect();
        assert_eq!(names, vec!["always", "unless_fast"]);

        let ctx = RunContext::default().with_tags(["fast"]);
        let tagged = load_config(&path, &ctx).unwrap();
        let names: Vec<&str> = tagged.config.parametersets["p"]
            .parameters
            .iter()
            .map(|p| p.name.as_str())
            .collect();
        assert_eq!(names, vec!["fast_only", "always"]);
    }

    #[test]
    fn selection_tags_activate() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            "bench.yaml",
            r#"
selection:
  tag: [fast]
benchmark:
  name: demo
  parameterset:
    - name: p
      parameter:
        - { name: fast_only, value: "1", tag: fast }
  step:
    - name: s
      use: [p]
      do: [ "true" ]
"#,
        );
        let loaded = load_config(&path, &RunContext::default()).unwrap();
        assert_eq!(loaded.config.parametersets["p"].parameters.len(), 1);
        assert!(loaded.selection_tags.contains("fast"));
    }

    #[test]
    fn includes_splice_fragments() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            "common.yaml",
            r#"
sets:
  parameterset:
    - name: shared_params
      parameter:
        - { name: nodes, value: "1,2" }
"#,
        );
        let path = write_config(
            dir.path(),
            "bench.yaml",
            r#"
benchmark:
  name: demo
  include:
    - from: common.yaml
      path: sets
  step:
    - name: s
      use: [shared_params]
      do: [ "true" ]
"#,
        );
        let loaded = load_config(&path, &RunContext::default()).unwrap();
        assert!(loaded.config.parametersets.contains_key("shared_params"));
    }

    #[test]
    fn init_with_overlays_local_entries() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            "base.yaml",
            r#"
benchmark:
  name: base
  parameterset:
    - name: base_params
      parameter:
        - { name: nodes, value: "1" }
        - { name: tasks, value: "4" }
"#,
        );
        let path = write_config(
            dir.path(),
            "bench.yaml",
            r#"
benchmark:
  name: demo
  parameterset:
    - name: params
      init_with: "base.yaml:base_params"
      parameter:
        - { name: nodes, value: "8" }
  step:
    - name: s
      use: [params]
      do: [ "true" ]
"#,
        );
        let loaded = load_config(&path, &RunContext::default()).unwrap();
        let set = &loaded.config.parametersets["params"];
        assert_eq!(set.get("nodes").unwrap().raw, "8");
        assert_eq!(set.get("tasks").unwrap().raw, "4");
    }

    #[test]
    fn result_backends_convert() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            "bench.yaml",
            r#"
benchmark:
  name: demo
  step:
    - name: s
      do: [ "true" ]
  patternset:
    - name: pats
      pattern:
        - { name: p, type: int, value: "x=$jube_pat_int" }
  analyser:
    - name: a
      use: [pats]
      analyse:
        - step: s
          file: [stdout]
  result:
    - name: t
      use: [a]
      table:
        style: csv
        sort: p
        column: [ p, { key: p_avg, format: "%.2f" } ]
    - name: d
      use: [a]
      database:
        file: out.dat
        name: results
        key: [p]
        primekeys: p
"#,
        );
        let loaded = load_config(&path, &RunContext::default()).unwrap();
        assert_eq!(loaded.config.results.len(), 2);
        match &loaded.config.results[0].kind {
            ResultKind::Table(table) => {
                assert_eq!(table.style, TableStyle::Csv);
                assert_eq!(table.columns.len(), 2);
                assert_eq!(table.columns[1].format.as_deref(), Some("%.2f"));
            }
            other => panic!("expected table, got {other:?}"),
        }
        match &loaded.config.results[1].kind {
            ResultKind::Database(db) => {
                assert_eq!(db.table, "results");
                assert_eq!(db.primekeys, vec!["p"]);
            }
            other => panic!("expected database, got {other:?}"),
        }
    }

    #[test]
    fn missing_benchmark_block_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "empty.yaml", "selection:\n  tag: [x]\n");
        assert!(load_config(&path, &RunContext::default()).is_err());
    }
}
