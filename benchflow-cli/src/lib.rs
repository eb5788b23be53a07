#![warn(missing_docs)]
//! benchflow CLI
//!
//! Command-line driver: loads configuration documents through the YAML
//! front-end, creates and resumes benchmarks, and renders results.
//!
//! ```text
//! benchflow run bench.yaml --tag fast
//! benchflow continue bench_run --id last
//! benchflow analyse bench_run
//! benchflow result bench_run --id all -s csv
//! ```

mod loader;

pub use loader::{load_config, LoadedConfig};

use anyhow::{anyhow, bail, Context};
use benchflow_core::{
    ColumnSpec, ParamType, ResultDef, ResultKind, RowSet, RunContext, TableSpec, TableStyle,
};
use benchflow_engine::{
    analyse, bench_dir, build_rows, resolve_id_selector, run as run_scheduler, AnalysisData,
    Benchmark, RunReport, RESULT_DIRNAME, RUN_LOG_FILENAME,
};
use benchflow_report::{emit_syslog, render_table, write_database};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

/// benchflow CLI arguments.
#[derive(Parser, Debug)]
#[command(name = "benchflow")]
#[command(author, version, about = "benchflow - benchmarking workflow engine")]
pub struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand
    #[command(subcommand)]
    pub command: Commands,
}

/// CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create and run a new benchmark from a configuration file
    Run {
        /// Configuration file (YAML)
        file: PathBuf,
        /// Use a fixed benchmark id instead of the next free one
        #[arg(long)]
        id: Option<u32>,
        /// Override the configured output directory
        #[arg(long)]
        outpath: Option<PathBuf>,
        /// Activate tags (repeatable)
        #[arg(long)]
        tag: Vec<String>,
        /// Prepend include search directories (repeatable)
        #[arg(long)]
        include_path: Vec<PathBuf>,
        /// Stop the whole run on the first workpackage error
        #[arg(short = 'e', long = "exit")]
        exit_on_error: bool,
        /// Treat an engine version mismatch as an error
        #[arg(long)]
        strict: bool,
    },
    /// Resume incomplete benchmarks (probe sentinels, start ready work)
    Continue {
        /// Benchmark output directory
        #[arg(default_value = "bench_run")]
        dir: PathBuf,
        /// Benchmark id (number, negative offset, `last`, `all`)
        #[arg(long, default_value = "last")]
        id: String,
        /// Stop the whole run on the first workpackage error
        #[arg(short = 'e', long = "exit")]
        exit_on_error: bool,
        /// Treat an engine version mismatch as an error
        #[arg(long)]
        strict: bool,
    },
    /// Re-run the analyzers over existing step output
    Analyse {
        /// Benchmark output directory
        #[arg(default_value = "bench_run")]
        dir: PathBuf,
        /// Benchmark id (number, negative offset, `last`, `all`)
        #[arg(long, default_value = "last")]
        id: String,
        /// Run a single analyzer only
        #[arg(long)]
        only: Option<String>,
    },
    /// Render result tables / syslog records / database rows
    Result {
        /// Benchmark output directory
        #[arg(default_value = "bench_run")]
        dir: PathBuf,
        /// Benchmark id (number, negative offset, `last`, `all`)
        #[arg(long, default_value = "last")]
        id: String,
        /// Override the table style
        #[arg(short = 's', long)]
        style: Option<String>,
        /// Combine the last N benchmarks
        #[arg(short = 'n', long)]
        num: Option<usize>,
        /// Reverse the final row order
        #[arg(short = 'r', long)]
        reverse: bool,
        /// Render a single named result only
        #[arg(long)]
        only: Option<String>,
    },
    /// Show benchmark, step, or workpackage details
    Info {
        /// Benchmark output directory
        #[arg(default_value = "bench_run")]
        dir: PathBuf,
        /// Benchmark id (number, negative offset, `last`, `all`)
        #[arg(long, default_value = "last")]
        id: String,
        /// Show one step's workpackages
        #[arg(long)]
        step: Option<String>,
        /// Show the workpackage parameter table for the selected step
        #[arg(short = 'p', long)]
        parameters: bool,
        /// CSV parameter output with an optional separator
        #[arg(short = 'c', long)]
        csv: Option<Option<String>>,
    },
    /// Show the completion state of all benchmarks in a directory
    Status {
        /// Benchmark output directory
        #[arg(default_value = "bench_run")]
        dir: PathBuf,
    },
    /// Print a benchmark's run log
    Log {
        /// Benchmark output directory
        #[arg(default_value = "bench_run")]
        dir: PathBuf,
        /// Benchmark id (number, negative offset, `last`, `all`)
        #[arg(long, default_value = "last")]
        id: String,
    },
    /// Set or show the benchmark comment
    Comment {
        /// New comment text (prints the current comment when omitted)
        text: Option<String>,
        /// Benchmark output directory
        #[arg(long, default_value = "bench_run")]
        dir: PathBuf,
        /// Benchmark id (number, negative offset, `last`, `all`)
        #[arg(long, default_value = "last")]
        id: String,
        /// Append to the existing comment instead of replacing it
        #[arg(short = 'a', long)]
        append: bool,
    },
    /// Remove a benchmark (or a single workpackage)
    Remove {
        /// Benchmark output directory
        #[arg(default_value = "bench_run")]
        dir: PathBuf,
        /// Benchmark id (number, negative offset, `last`, `all`)
        #[arg(long, default_value = "last")]
        id: String,
        /// Remove only this workpackage id
        #[arg(long)]
        workpackage: Option<u32>,
        /// Do not ask for confirmation
        #[arg(short = 'f', long)]
        force: bool,
    },
}

/// Parse arguments and run; the main entry point for the binary.
pub fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    run_with_cli(cli)
}

/// Run with pre-parsed arguments.
pub fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let filter = if cli.verbose {
        "benchflow=debug"
    } else {
        "benchflow=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .ok();

    match cli.command {
        Commands::Run {
            file,
            id,
            outpath,
            tag,
            include_path,
            exit_on_error,
            strict,
        } => cmd_run(&file, id, outpath, tag, include_path, exit_on_error, strict),
        Commands::Continue {
            dir,
            id,
            exit_on_error,
            strict,
        } => cmd_continue(&dir, &id, exit_on_error, strict),
        Commands::Analyse { dir, id, only } => cmd_analyse(&dir, &id, only.as_deref()),
        Commands::Result {
            dir,
            id,
            style,
            num,
            reverse,
            only,
        } => cmd_result(&dir, &id, style.as_deref(), num, reverse, only.as_deref()),
        Commands::Info {
            dir,
            id,
            step,
            parameters,
            csv,
        } => cmd_info(&dir, &id, step.as_deref(), parameters, csv),
        Commands::Status { dir } => cmd_status(&dir),
        Commands::Log { dir, id } => cmd_log(&dir, &id),
        Commands::Comment {
            text,
            dir,
            id,
            append,
        } => cmd_comment(&dir, &id, text.as_deref(), append),
        Commands::Remove {
            dir,
            id,
            workpackage,
            force,
        } => cmd_remove(&dir, &id, workpackage, force),
    }
}

#[allow(clippy::too_many_arguments)]
fn cmd_run(
    file: &Path,
    id: Option<u32>,
    outpath: Option<PathBuf>,
    tags: Vec<String>,
    include_path: Vec<PathBuf>,
    exit_on_error: bool,
    strict: bool,
) -> anyhow::Result<()> {
    let mut ctx = RunContext::from_env().with_tags(tags);
    ctx.prepend_include_paths(include_path);
    ctx.exit_on_error = exit_on_error;
    ctx.strict_version = strict;

    let loaded = load_config(file, &ctx)?;
    ctx.tags.extend(loaded.selection_tags.clone());

    let outpath = outpath.unwrap_or_else(|| loaded.file_dir.join(&loaded.config.outpath));
    let mut benchmark =
        Benchmark::create(loaded.config, &outpath, id, &loaded.file_dir, &ctx)
            .map_err(|e| anyhow!("{e}"))?;
    benchmark
        .build_workpackages(&ctx)
        .map_err(|e| anyhow!("{e}"))?;

    let report = run_scheduler(&mut benchmark, &ctx).map_err(|e| anyhow!("{e}"))?;
    append_run_log(&benchmark, "run", &report)?;
    print_summary(&benchmark, &report);
    exit_code_from(&report)
}

fn cmd_continue(dir: &Path, id: &str, exit_on_error: bool, strict: bool) -> anyhow::Result<()> {
    let mut ctx = RunContext::from_env();
    ctx.exit_on_error = exit_on_error;
    ctx.strict_version = strict;

    let mut worst = RunReport::default();
    for bench_id in resolve_id_selector(dir, id).map_err(|e| anyhow!("{e}"))? {
        let mut benchmark =
            Benchmark::load(dir, bench_id, &ctx).map_err(|e| anyhow!("{e}"))?;
        // Tags recorded at creation stay active across restarts.
        ctx.tags = benchmark.tags.clone();
        let report = run_scheduler(&mut benchmark, &ctx).map_err(|e| anyhow!("{e}"))?;
        append_run_log(&benchmark, "continue", &report)?;
        print_summary(&benchmark, &report);
        worst.error += report.error;
        worst.pending += report.pending;
    }
    exit_code_from(&worst)
}

fn cmd_analyse(dir: &Path, id: &str, only: Option<&str>) -> anyhow::Result<()> {
    let ctx = RunContext::from_env();
    for bench_id in resolve_id_selector(dir, id).map_err(|e| anyhow!("{e}"))? {
        let benchmark = Benchmark::load(dir, bench_id, &ctx).map_err(|e| anyhow!("{e}"))?;
        let mut bench_ctx = ctx.clone();
        bench_ctx.tags = benchmark.tags.clone();
        analyse(&benchmark, &bench_ctx, only).map_err(|e| anyhow!("{e}"))?;
        benchmark.persist_workpackages().map_err(|e| anyhow!("{e}"))?;
        info!(id = bench_id, "analysis stored");
    }
    Ok(())
}

fn cmd_result(
    dir: &Path,
    id: &str,
    style: Option<&str>,
    num: Option<usize>,
    reverse: bool,
    only: Option<&str>,
) -> anyhow::Result<()> {
    let ctx = RunContext::from_env();
    let mut ids = resolve_id_selector(dir, id).map_err(|e| anyhow!("{e}"))?;
    if let Some(num) = num {
        let all = benchflow_engine::list_benchmark_ids(dir);
        ids = all.into_iter().rev().take(num).rev().collect();
    }

    let mut benchmarks = Vec::new();
    for bench_id in &ids {
        let benchmark = Benchmark::load(dir, *bench_id, &ctx).map_err(|e| anyhow!("{e}"))?;
        benchmarks.push(benchmark);
    }
    let Some(newest) = benchmarks.last() else {
        bail!("no benchmarks selected");
    };
    let multi = benchmarks.len() > 1;

    // The newest benchmark's result definitions drive the output, matching
    // how re-running `result` after a config update behaves.
    for result in &newest.config.results {
        if let Some(only) = only {
            if result.name != only {
                continue;
            }
        }
        let mut rowset = RowSet::default();
        for benchmark in &benchmarks {
            let mut bench_ctx = ctx.clone();
            bench_ctx.tags = benchmark.tags.clone();
            let mut data = AnalysisData::load(benchmark);
            let missing = result
                .uses
                .iter()
                .any(|analyzer| !data.0.contains_key(analyzer));
            if missing {
                data = analyse(benchmark, &bench_ctx, None).map_err(|e| anyhow!("{e}"))?;
            }
            for analyzer_name in &result.uses {
                let Some(analyzer) = benchmark.config.analyzers.get(analyzer_name) else {
                    continue;
                };
                let mut rows = build_rows(benchmark, &data, analyzer);
                if multi {
                    for row in &mut rows.rows {
                        row.insert("id".to_string(), benchmark.id.to_string());
                    }
                    rows.types.insert("id".to_string(), ParamType::Int);
                }
                rowset.extend(rows);
            }
        }
        if reverse {
            rowset.rows.reverse();
        }
        emit_result(newest, result, &rowset, style, multi)?;
    }
    Ok(())
}

/// Render one result definition and, for tables, persist it under
/// `result/<name>.dat`.
fn emit_result(
    benchmark: &Benchmark,
    result: &ResultDef,
    rowset: &RowSet,
    style: Option<&str>,
    multi: bool,
) -> anyhow::Result<()> {
    match &result.kind {
        ResultKind::Table(spec) => {
            let mut spec = spec.clone();
            if let Some(style) = style {
                spec.style = style
                    .parse::<TableStyle>()
                    .map_err(|e| anyhow!("{e}"))?;
            }
            if multi && !spec.columns.is_empty() {
                spec.columns.insert(0, ColumnSpec::new("id"));
            }
            let text = render_table(rowset, &spec).map_err(|e| anyhow!("{e}"))?;
            println!("{}:", result.name);
            print!("{text}");
            let result_dir = benchmark.bench_dir.join(RESULT_DIRNAME);
            std::fs::create_dir_all(&result_dir)
                .with_context(|| format!("creating {}", result_dir.display()))?;
            std::fs::write(result_dir.join(format!("{}.dat", result.name)), &text)
                .context("writing result file")?;
        }
        ResultKind::Syslog(spec) => {
            let sent =
                emit_syslog(rowset, spec, &result.name).map_err(|e| anyhow!("{e}"))?;
            info!(result = %result.name, records = sent, "syslog records sent");
        }
        ResultKind::Database(spec) => {
            let mut spec = spec.clone();
            // A relative database path lands next to the other result data.
            if !Path::new(&spec.file).is_absolute() {
                let result_dir = benchmark.bench_dir.join(RESULT_DIRNAME);
                std::fs::create_dir_all(&result_dir)
                    .with_context(|| format!("creating {}", result_dir.display()))?;
                spec.file = result_dir.join(&spec.file).display().to_string();
            }
            let written =
                write_database(rowset, &spec).map_err(|e| anyhow!("{e}"))?;
            info!(result = %result.name, rows = written, "database rows written");
        }
    }
    Ok(())
}

fn cmd_info(
    dir: &Path,
    id: &str,
    step: Option<&str>,
    parameters: bool,
    csv: Option<Option<String>>,
) -> anyhow::Result<()> {
    let ctx = RunContext::from_env();
    for bench_id in resolve_id_selector(dir, id).map_err(|e| anyhow!("{e}"))? {
        let benchmark = Benchmark::load(dir, bench_id, &ctx).map_err(|e| anyhow!("{e}"))?;
        println!("benchmark: {} (id {})", benchmark.config.name, benchmark.id);
        println!("      dir: {}", benchmark.bench_dir.display());
        if !benchmark.comment.is_empty() {
            println!("  comment: {}", benchmark.comment);
        }
        if !benchmark.tags.is_empty() {
            let tags: Vec<&str> = benchmark.tags.iter().map(String::as_str).collect();
            println!("     tags: {}", tags.join(", "));
        }

        match step {
            None => {
                let mut rowset = RowSet::default();
                for (name, status) in benchmark.status() {
                    let mut row = BTreeMap::new();
                    row.insert("step".to_string(), name);
                    row.insert("all".to_string(), status.all.to_string());
                    row.insert("open".to_string(), status.open.to_string());
                    row.insert("wait".to_string(), status.wait.to_string());
                    row.insert("error".to_string(), status.error.to_string());
                    row.insert("done".to_string(), status.done.to_string());
                    rowset.rows.push(row);
                }
                let spec = status_table_spec();
                print!("{}", render_table(&rowset, &spec).map_err(|e| anyhow!("{e}"))?);
            }
            Some(step) => {
                let wps = benchmark
                    .workpackages
                    .get(step)
                    .ok_or_else(|| anyhow!("no step '{step}' in benchmark {bench_id}"))?;
                if parameters || csv.is_some() {
                    let mut rowset = RowSet::default();
                    for wp in wps {
                        let mut row = BTreeMap::new();
                        row.insert("id".to_string(), wp.id.to_string());
                        for (name, param) in &wp.point {
                            row.insert(name.clone(), param.value.clone());
                            rowset.types.entry(name.clone()).or_insert(param.def.ptype);
                        }
                        rowset.rows.push(row);
                    }
                    rowset.types.insert("id".to_string(), ParamType::Int);
                    let mut spec = TableSpec {
                        sort: vec!["id".to_string()],
                        ..Default::default()
                    };
                    spec.style = if csv.is_some() {
                        TableStyle::Csv
                    } else {
                        TableStyle::Pretty
                    };
                    let mut text =
                        render_table(&rowset, &spec).map_err(|e| anyhow!("{e}"))?;
                    if let Some(Some(separator)) = &csv {
                        text = text.replace(',', separator);
                    }
                    print!("{text}");
                } else {
                    for wp in wps {
                        println!(
                            "{:>6}  iter {:>2}  {:?}  {}",
                            wp.id,
                            wp.iteration,
                            wp.state,
                            wp.wp_dir(&benchmark.bench_dir).display()
                        );
                    }
                }
            }
        }
    }
    Ok(())
}

fn cmd_status(dir: &Path) -> anyhow::Result<()> {
    let ctx = RunContext::from_env();
    let ids = benchflow_engine::list_benchmark_ids(dir);
    if ids.is_empty() {
        bail!("no benchmarks found under '{}'", dir.display());
    }
    let mut rowset = RowSet::default();
    for bench_id in ids {
        let benchmark = Benchmark::load(dir, bench_id, &ctx).map_err(|e| anyhow!("{e}"))?;
        let mut all = 0;
        let mut done = 0;
        let mut error = 0;
        for status in benchmark.status().values() {
            all += status.all;
            done += status.done;
            error += status.error;
        }
        let state = if error > 0 {
            "ERROR"
        } else if done == all {
            "FINISHED"
        } else {
            "RUNNING"
        };
        let mut row = BTreeMap::new();
        row.insert("id".to_string(), bench_id.to_string());
        row.insert("name".to_string(), benchmark.config.name.clone());
        row.insert("status".to_string(), state.to_string());
        rowset.rows.push(row);
    }
    rowset.types.insert("id".to_string(), ParamType::Int);
    let spec = TableSpec {
        sort: vec!["id".to_string()],
        columns: vec![
            ColumnSpec::new("id"),
            ColumnSpec::new("name"),
            ColumnSpec::new("status"),
        ],
        ..Default::default()
    };
    print!("{}", render_table(&rowset, &spec).map_err(|e| anyhow!("{e}"))?);
    Ok(())
}

fn cmd_log(dir: &Path, id: &str) -> anyhow::Result<()> {
    for bench_id in resolve_id_selector(dir, id).map_err(|e| anyhow!("{e}"))? {
        let log_path = bench_dir(dir, bench_id).join(RUN_LOG_FILENAME);
        match std::fs::read_to_string(&log_path) {
            Ok(content) => print!("{content}"),
            Err(_) => println!("no log recorded for benchmark {bench_id}"),
        }
    }
    Ok(())
}

fn cmd_comment(dir: &Path, id: &str, text: Option<&str>, append: bool) -> anyhow::Result<()> {
    let ctx = RunContext::from_env();
    for bench_id in resolve_id_selector(dir, id).map_err(|e| anyhow!("{e}"))? {
        let mut benchmark = Benchmark::load(dir, bench_id, &ctx).map_err(|e| anyhow!("{e}"))?;
        match text {
            None => println!("{}", benchmark.comment),
            Some(text) => {
                if append && !benchmark.comment.is_empty() {
                    benchmark.comment = format!("{}\n{text}", benchmark.comment);
                } else {
                    benchmark.comment = text.to_string();
                }
                let snapshot = benchmark.snapshot();
                benchflow_engine::write_snapshot(&benchmark.bench_dir, &snapshot)
                    .map_err(|e| anyhow!("{e}"))?;
            }
        }
    }
    Ok(())
}

fn cmd_remove(dir: &Path, id: &str, workpackage: Option<u32>, force: bool) -> anyhow::Result<()> {
    let ctx = RunContext::from_env();
    for bench_id in resolve_id_selector(dir, id).map_err(|e| anyhow!("{e}"))? {
        let target = bench_dir(dir, bench_id);
        if !force {
            bail!(
                "refusing to remove '{}' without --force",
                target.display()
            );
        }
        match workpackage {
            Some(wp_id) => {
                let mut benchmark =
                    Benchmark::load(dir, bench_id, &ctx).map_err(|e| anyhow!("{e}"))?;
                let Some(wp) = benchmark.workpackage(wp_id).cloned() else {
                    bail!("no workpackage {wp_id} in benchmark {bench_id}");
                };
                let wp_dir = wp.wp_dir(&benchmark.bench_dir);
                if wp_dir.exists() {
                    std::fs::remove_dir_all(&wp_dir)
                        .with_context(|| format!("removing {}", wp_dir.display()))?;
                }
                for wps in benchmark.workpackages.values_mut() {
                    wps.retain(|w| w.id != wp_id);
                }
                benchmark.persist_workpackages().map_err(|e| anyhow!("{e}"))?;
                info!(wp = wp_id, id = bench_id, "workpackage removed");
            }
            None => {
                std::fs::remove_dir_all(&target)
                    .with_context(|| format!("removing {}", target.display()))?;
                info!(id = bench_id, "benchmark removed");
            }
        }
    }
    Ok(())
}

fn status_table_spec() -> TableSpec {
    TableSpec {
        columns: ["step", "all", "open", "wait", "error", "done"]
            .into_iter()
            .map(ColumnSpec::new)
            .collect(),
        sort: vec!["step".to_string()],
        ..Default::default()
    }
}

/// Final per-step status plus the follow-up command hints.
fn print_summary(benchmark: &Benchmark, report: &RunReport) {
    let mut rowset = RowSet::default();
    for (name, status) in benchmark.status() {
        let mut row = BTreeMap::new();
        row.insert("step".to_string(), name);
        row.insert("all".to_string(), status.all.to_string());
        row.insert("open".to_string(), status.open.to_string());
        row.insert("wait".to_string(), status.wait.to_string());
        row.insert("error".to_string(), status.error.to_string());
        row.insert("done".to_string(), status.done.to_string());
        rowset.rows.push(row);
    }
    if let Ok(text) = render_table(&rowset, &status_table_spec()) {
        eprint!("{text}");
    }
    eprintln!(
        "benchmark {} id {} in {}",
        benchmark.config.name,
        benchmark.id,
        benchmark.bench_dir.display()
    );
    if report.pending > 0 || report.open > 0 {
        eprintln!(
            "continue with: benchflow continue {} --id {}",
            benchmark.outpath.display(),
            benchmark.id
        );
    }
    eprintln!(
        "results with:  benchflow result {} --id {}",
        benchmark.outpath.display(),
        benchmark.id
    );
}

/// Append a line to the persistent run log.
fn append_run_log(benchmark: &Benchmark, action: &str, report: &RunReport) -> anyhow::Result<()> {
    let path = benchmark.bench_dir.join(RUN_LOG_FILENAME);
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("opening {}", path.display()))?;
    writeln!(
        file,
        "{action}: done={} error={} pending={} open={}",
        report.done, report.error, report.pending, report.open
    )
    .context("writing run log")?;
    Ok(())
}

/// Non-zero exit on any workpackage error.
fn exit_code_from(report: &RunReport) -> anyhow::Result<()> {
    if report.error > 0 {
        bail!("{} workpackage(s) failed", report.error);
    }
    Ok(())
}
